use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use lagoon_client_core::cache::{ACTOR_DIRECTORY, describe_typing};
use lagoon_client_core::channel::ChannelAdapter;
use lagoon_client_core::config::Config;
use lagoon_client_core::guards::ConsistencyGuards;
use lagoon_client_core::protocol::{EVENT_ONLINE_COUNT, EVENT_RECORD_NEW, EVENT_TYPING};
use lagoon_client_core::reconcile::{ChatMessage, ChatRoom, RoomApi, StreamRecord};
use lagoon_client_core::telemetry::init_tracing;
use rand::Rng;
use serde_json::json;
use time::OffsetDateTime;
use tracing::{info, warn};
use transport_bus::LocalChannel;

#[derive(Parser, Debug)]
#[command(name = "lagoon", about = "Optimistic chat client core")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a scripted chat room against an in-memory server
    Simulate(SimulateArgs),
}

#[derive(Args, Debug)]
struct SimulateArgs {
    #[arg(long, default_value = "lobby")]
    room: String,

    #[arg(long, default_value = "alice")]
    actor: String,

    #[arg(long, short = 'n', default_value_t = 5)]
    messages: usize,

    #[arg(long, default_value_t = 40, help = "Fake server latency in milliseconds")]
    latency_ms: u64,

    #[arg(long, default_value_t = 0.2, help = "Probability that a send is rejected")]
    failure_rate: f64,

    #[arg(long, default_value_t = 2, help = "Drop the connection after this many sends")]
    drop_after: usize,
}

/// In-memory server: acknowledges sends after a delay and echoes them over the channel.
struct FakeServer {
    channel: Arc<LocalChannel>,
    actor_id: String,
    latency: Duration,
    failure_rate: f64,
    next_id: AtomicU64,
}

impl FakeServer {
    fn next_id(&self) -> String {
        format!("m{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait]
impl RoomApi<ChatMessage> for FakeServer {
    async fn send_record(
        &self,
        room_id: &str,
        _local_id: &str,
        payload: &ChatMessage,
    ) -> anyhow::Result<Option<StreamRecord<ChatMessage>>> {
        tokio::time::sleep(self.latency).await;
        let rejected = rand::thread_rng().gen_bool(self.failure_rate);
        if rejected {
            bail!("server rejected message");
        }
        let id = self.next_id();
        let now = OffsetDateTime::now_utc();
        // The echo usually beats the response.
        self.channel.deliver(
            EVENT_RECORD_NEW,
            json!({
                "id": id,
                "room_id": room_id,
                "actor_id": self.actor_id,
                "created_at_ms": now.unix_timestamp() * 1_000,
                "body": payload.body,
            }),
        );
        Ok(Some(StreamRecord::authoritative(
            id,
            self.actor_id.clone(),
            room_id,
            now,
            payload.clone(),
        )))
    }

    async fn delete_for_all(&self, _room_id: &str, _record_id: &str) -> anyhow::Result<()> {
        tokio::time::sleep(self.latency).await;
        Ok(())
    }

    async fn fetch_older(
        &self,
        room_id: &str,
        _before: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<StreamRecord<ChatMessage>>> {
        tokio::time::sleep(self.latency).await;
        Ok((0..limit.min(3))
            .map(|i| {
                StreamRecord::authoritative(
                    format!("h{i}"),
                    "bob",
                    room_id,
                    OffsetDateTime::UNIX_EPOCH,
                    ChatMessage::new(format!("history #{i}")),
                )
            })
            .collect())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env();
    init_tracing(&config.log_filter);

    match cli.command {
        Command::Simulate(args) => simulate(args, config).await,
    }
}

async fn simulate(args: SimulateArgs, config: Config) -> anyhow::Result<()> {
    if !(0.0..=1.0).contains(&args.failure_rate) {
        bail!("--failure-rate must be between 0 and 1");
    }
    ACTOR_DIRECTORY.insert("bob".into(), "Bob".into());
    ACTOR_DIRECTORY.insert(args.actor.clone(), "You".into());

    let channel = Arc::new(LocalChannel::new());
    let adapter = ChannelAdapter::new(channel.clone(), &config);
    let guards = ConsistencyGuards::from_config(&config);
    let server = Arc::new(FakeServer {
        channel: channel.clone(),
        actor_id: args.actor.clone(),
        latency: Duration::from_millis(args.latency_ms),
        failure_rate: args.failure_rate,
        next_id: AtomicU64::new(100),
    });
    let room = ChatRoom::open(
        args.room.clone(),
        args.actor.clone(),
        server,
        adapter,
        guards.clone(),
        &config,
    );

    channel.connect();
    room.request_online_list().context("requesting presence")?;
    channel.deliver(EVENT_ONLINE_COUNT, json!({"room_id": args.room, "count": 2}));
    let loaded = room.load_older().await.context("loading history")?;
    info!(loaded, "history loaded");

    channel.deliver(EVENT_TYPING, json!({"room_id": args.room, "actor_id": "bob"}));
    if let Some(line) = describe_typing(&room.typing().borrow()) {
        println!("{line}");
    }

    for i in 0..args.messages {
        if i == args.drop_after {
            channel.disconnect("simulated network drop");
            channel.connect();
        }
        let body = format!("message #{i}");
        room.composer_input(&body).ok();
        match room.send(ChatMessage::new(body)).await {
            Ok(outcome) => info!(applied = outcome.is_applied(), "message sent"),
            Err(err) => warn!(error = %err, "message rolled back"),
        }
    }

    if let Some(first) = room.transcript().records().iter().find_map(|r| r.id.clone()) {
        room.delete_for_all(&first).await.context("deleting first record")?;
    }

    let transcript = room.transcript();
    println!(
        "room {} ({} online, {} records)",
        transcript.collection_id(),
        *room.online_count().borrow(),
        transcript.len()
    );
    for record in transcript.records() {
        let id = record.id.as_deref().unwrap_or("(pending)");
        match record.payload() {
            Some(message) => println!("  {id:>10}  {:<6} {}", record.actor_id, message.body),
            None => println!("  {id:>10}  {:<6} <deleted>", record.actor_id),
        }
    }
    let violations = guards.violations();
    if !violations.is_empty() {
        warn!(count = violations.len(), "consistency violations recorded");
        for violation in violations {
            println!("  violation: {violation:?}");
        }
    }
    Ok(())
}
