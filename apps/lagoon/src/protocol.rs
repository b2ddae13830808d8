//! Event names and payload shapes exchanged over the push channel.

use serde::{Deserialize, Serialize};

// Inbound.
pub const EVENT_RECORD_NEW: &str = "message:new";
pub const EVENT_RECORD_REMOVED: &str = "message:deleted";
pub const EVENT_ONLINE_COUNT: &str = "room:online_count";
pub const EVENT_TYPING: &str = "room:typing";

// Outbound.
pub const EVENT_JOIN_ROOM: &str = "room:join";
pub const EVENT_SEND_RECORD: &str = "message:send";
pub const EVENT_TYPING_START: &str = "typing:start";
pub const EVENT_TYPING_STOP: &str = "typing:stop";
pub const EVENT_REQUEST_ONLINE: &str = "room:online_list";

/// Outbound event name -> payload fields the server requires.
pub const OUTBOUND_CONTRACT: &[(&str, &[&str])] = &[
    (EVENT_JOIN_ROOM, &["room_id"]),
    (EVENT_SEND_RECORD, &["room_id", "local_id", "body"]),
    (EVENT_TYPING_START, &["room_id", "actor_id"]),
    (EVENT_TYPING_STOP, &["room_id", "actor_id"]),
    (EVENT_REQUEST_ONLINE, &["room_id"]),
];

pub fn required_fields(event: &str) -> Option<&'static [&'static str]> {
    OUTBOUND_CONTRACT
        .iter()
        .find(|(name, _)| *name == event)
        .map(|(_, fields)| *fields)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRef {
    pub room_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendRecord<P> {
    pub room_id: String,
    pub local_id: String,
    #[serde(flatten)]
    pub payload: P,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushedRecord<P> {
    pub id: String,
    pub room_id: String,
    pub actor_id: String,
    pub created_at_ms: i64,
    #[serde(flatten)]
    pub payload: P,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRemoved {
    pub room_id: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineCount {
    pub room_id: String,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypingPhase {
    Start,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingSignal {
    pub room_id: String,
    pub actor_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<TypingPhase>,
}
