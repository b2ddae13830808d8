use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::Display;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use super::{Mutation, MutationId, MutationOutcome, MutationStatus, RollbackRegistry};
use crate::config::Config;
use crate::error::{MutationError, StepError};
use crate::store::{Store, WriteSource};

/// Restores the state an optimistic step changed.
pub type Rollback<S> = Box<dyn FnOnce(&mut S) + Send>;

type OptimisticFn<'a, S> =
    Box<dyn FnOnce(&mut S) -> anyhow::Result<Option<Rollback<S>>> + Send + 'a>;
type ReconcileFn<'a, S, R> = Box<dyn FnOnce(&mut S, &R) -> anyhow::Result<()> + Send + 'a>;
type ErrorHook<'a, E> = Box<dyn FnOnce(&MutationError<E>) + Send + 'a>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SeqState {
    Pending,
    Succeeded,
    Failed,
}

/// Per-key issuance record used for supersession.
#[derive(Debug, Default)]
struct KeyLedger {
    last_issued: u64,
    issued: BTreeMap<u64, SeqState>,
    /// Newest sequence whose result was recorded as a success.
    last_succeeded: u64,
    /// Failed-but-superseded mutations whose rollback waits for every newer one to fail.
    deferred: BTreeMap<u64, MutationId>,
}

impl KeyLedger {
    fn issue(&mut self) -> u64 {
        self.last_issued += 1;
        self.issued.insert(self.last_issued, SeqState::Pending);
        self.last_issued
    }

    /// A sequence is stale once any later sequence on the key is in flight or succeeded.
    /// Later sequences that failed were rolled back and do not count.
    fn is_superseded(&self, sequence: u64) -> bool {
        self.issued
            .range(sequence + 1..)
            .any(|(_, state)| *state != SeqState::Failed)
    }

    fn settle(&mut self, sequence: u64, state: SeqState) {
        self.issued.insert(sequence, state);
        if state == SeqState::Succeeded {
            self.last_succeeded = self.last_succeeded.max(sequence);
        }
        // Only sequences at or after the oldest pending one can still be consulted.
        let floor = self
            .issued
            .iter()
            .find(|(_, state)| **state == SeqState::Pending)
            .map(|(seq, _)| *seq);
        match floor {
            Some(floor) => self.issued = self.issued.split_off(&floor),
            None => self.issued.clear(),
        }
    }

    /// True when a newer success already replaced whatever `sequence` wrote.
    fn is_covered(&self, sequence: u64) -> bool {
        sequence < self.last_succeeded
    }

    /// Deferred rollbacks no longer covered by a newer write, newest first,
    /// plus the ones a success has made obsolete.
    fn take_ready(&mut self) -> (Vec<MutationId>, Vec<MutationId>) {
        let obsolete = self.take_older(self.last_succeeded);
        let ready: Vec<u64> = self
            .deferred
            .keys()
            .rev()
            .copied()
            .filter(|seq| !self.is_superseded(*seq))
            .collect();
        let ready = ready
            .into_iter()
            .filter_map(|seq| self.deferred.remove(&seq))
            .collect();
        (ready, obsolete)
    }

    /// Deferred rollbacks older than `sequence`, whose state a success has replaced.
    fn take_older(&mut self, sequence: u64) -> Vec<MutationId> {
        let newer = self.deferred.split_off(&sequence);
        std::mem::replace(&mut self.deferred, newer)
            .into_values()
            .collect()
    }
}

struct FailureSettlement {
    rolled_back: bool,
    parked: bool,
}

/// Runs optimistic mutations against one [`Store`].
pub struct MutationEngine<S> {
    store: Store<S>,
    rollbacks: RollbackRegistry,
    ledgers: Mutex<HashMap<String, KeyLedger>>,
    history: Mutex<VecDeque<Mutation>>,
    history_limit: usize,
}

impl<S> MutationEngine<S>
where
    S: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(store: Store<S>) -> Self {
        Self::with_config(store, &Config::default())
    }

    pub fn with_config(store: Store<S>, config: &Config) -> Self {
        Self {
            store,
            rollbacks: RollbackRegistry::new(),
            ledgers: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            history_limit: config.mutation_history.max(1),
        }
    }

    pub fn store(&self) -> &Store<S> {
        &self.store
    }

    pub fn rollbacks(&self) -> &RollbackRegistry {
        &self.rollbacks
    }

    /// Starts describing a write for `key`; nothing happens until [`MutationBuilder::run`].
    pub fn mutation<R, E>(&self, key: impl Into<String>) -> MutationBuilder<'_, S, R, E> {
        MutationBuilder {
            engine: self,
            key: key.into(),
            optimistic: None,
            reconcile: None,
            on_error: None,
        }
    }

    pub fn mutation_record(&self, id: MutationId) -> Option<Mutation> {
        self.history.lock().iter().find(|m| m.id == id).cloned()
    }

    /// Most recently issued mutation for `key` still in the history window.
    pub fn latest(&self, key: &str) -> Option<Mutation> {
        self.history
            .lock()
            .iter()
            .rev()
            .find(|m| m.key == key)
            .cloned()
    }

    pub fn history(&self) -> Vec<Mutation> {
        self.history.lock().iter().cloned().collect()
    }

    fn begin(&self, key: &str) -> (MutationId, u64) {
        let sequence = self.ledgers.lock().entry(key.to_string()).or_default().issue();
        let id = MutationId::new();
        let mut history = self.history.lock();
        if history.len() >= self.history_limit {
            history.pop_front();
        }
        history.push_back(Mutation {
            id,
            key: key.to_string(),
            sequence,
            status: MutationStatus::Pending,
            last_error: None,
            last_result: None,
            optimistic_error: None,
            superseded: false,
        });
        (id, sequence)
    }

    fn is_superseded(&self, key: &str, sequence: u64) -> bool {
        self.ledgers
            .lock()
            .get(key)
            .is_some_and(|ledger| ledger.is_superseded(sequence))
    }

    fn finish_success(&self, key: &str, sequence: u64) {
        let replaced = {
            let mut ledgers = self.ledgers.lock();
            let ledger = ledgers.entry(key.to_string()).or_default();
            ledger.settle(sequence, SeqState::Succeeded);
            ledger.take_older(sequence)
        };
        for id in replaced {
            self.rollbacks.discard(id);
            self.store.guards().settle(id);
        }
    }

    /// Settles a failed sequence and runs whatever rollbacks it unblocks, newest
    /// first. A superseded failure keeps its rollback parked until the newer
    /// writes on the key settle, unless a newer success already replaced its
    /// write, in which case the rollback is dropped.
    fn finish_failure(
        &self,
        key: &str,
        sequence: u64,
        id: MutationId,
        superseded: bool,
    ) -> FailureSettlement {
        let (parked, covered, ready, obsolete) = {
            let mut ledgers = self.ledgers.lock();
            let ledger = ledgers.entry(key.to_string()).or_default();
            let covered = superseded && ledger.is_covered(sequence);
            let parked = superseded && !covered && self.rollbacks.contains(id);
            if parked {
                ledger.deferred.insert(sequence, id);
            }
            ledger.settle(sequence, SeqState::Failed);
            let (ready, obsolete) = if superseded {
                (Vec::new(), Vec::new())
            } else {
                ledger.take_ready()
            };
            (parked, covered, ready, obsolete)
        };
        if covered {
            self.rollbacks.discard(id);
        }
        for stale in obsolete {
            self.rollbacks.discard(stale);
            self.store.guards().settle(stale);
        }
        let rolled_back = !superseded && self.rollbacks.invoke(id);
        for deferred in ready {
            self.rollbacks.invoke(deferred);
            self.store.guards().settle(deferred);
        }
        FailureSettlement {
            rolled_back,
            parked,
        }
    }

    fn update_record(&self, id: MutationId, f: impl FnOnce(&mut Mutation)) {
        if let Some(record) = self.history.lock().iter_mut().find(|m| m.id == id) {
            f(record);
        }
    }

    /// Runs a state step under the write lock. A failed or panicking step leaves
    /// the state exactly as it was before the step. The flag reports whether a
    /// successful step changed anything.
    ///
    /// Each step clones `S` once and compares it once, so a step costs O(size of
    /// `S`) on top of its own work. Keep engine-managed state small, or hold
    /// large collections behind cheap-to-clone handles.
    fn run_step<T>(
        &self,
        source: WriteSource,
        step: impl FnOnce(&mut S) -> anyhow::Result<T>,
    ) -> Result<(T, bool), StepError> {
        self.store.write(source, |state| {
            let before = state.clone();
            match catch_unwind(AssertUnwindSafe(|| step(state))) {
                Ok(Ok(value)) => {
                    let changed = *state != before;
                    Ok((value, changed))
                }
                Ok(Err(err)) => {
                    *state = before;
                    Err(StepError::Failed(err))
                }
                Err(payload) => {
                    *state = before;
                    Err(StepError::from_panic(payload))
                }
            }
        })
    }
}

pub struct MutationBuilder<'a, S, R, E> {
    engine: &'a MutationEngine<S>,
    key: String,
    optimistic: Option<OptimisticFn<'a, S>>,
    reconcile: Option<ReconcileFn<'a, S, R>>,
    on_error: Option<ErrorHook<'a, E>>,
}

impl<'a, S, R, E> MutationBuilder<'a, S, R, E>
where
    S: Clone + PartialEq + Send + Sync + 'static,
{
    /// Local change applied before the remote call. Return `Ok(Some(rollback))` to
    /// have it undone on failure, `Ok(None)` when there is nothing to undo.
    pub fn optimistic<F>(mut self, apply: F) -> Self
    where
        F: FnOnce(&mut S) -> anyhow::Result<Option<Rollback<S>>> + Send + 'a,
    {
        self.optimistic = Some(Box::new(apply));
        self
    }

    /// Folds the authoritative result into state after the remote call succeeds.
    pub fn reconcile<F>(mut self, reconcile: F) -> Self
    where
        F: FnOnce(&mut S, &R) -> anyhow::Result<()> + Send + 'a,
    {
        self.reconcile = Some(Box::new(reconcile));
        self
    }

    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&MutationError<E>) + Send + 'a,
    {
        self.on_error = Some(Box::new(hook));
        self
    }

    pub async fn run<Fut>(self, operation: Fut) -> Result<MutationOutcome<R>, MutationError<E>>
    where
        Fut: Future<Output = Result<R, E>>,
        R: Serialize,
        E: Display,
    {
        let MutationBuilder {
            engine,
            key,
            optimistic,
            reconcile,
            on_error,
        } = self;
        let guards = engine.store.guards().clone();
        let (id, sequence) = engine.begin(&key);
        guards.begin(id);
        debug!(
            target = "lagoon.mutation",
            mutation_id = %id,
            key = %key,
            sequence,
            "mutation pending"
        );

        let mut untracked_optimistic = false;
        if let Some(apply) = optimistic {
            match engine.run_step(WriteSource::Optimistic(id), apply) {
                Ok((Some(rollback), _)) => {
                    let store = engine.store.clone();
                    engine.rollbacks.register(id, move || {
                        store.write(WriteSource::Rollback(id), rollback);
                    });
                }
                Ok((None, changed)) => untracked_optimistic = changed,
                Err(err) => {
                    warn!(
                        target = "lagoon.mutation",
                        mutation_id = %id,
                        key = %key,
                        error = %err,
                        "optimistic step failed; continuing with remote call"
                    );
                    let message = err.to_string();
                    engine.update_record(id, |m| m.optimistic_error = Some(message));
                }
            }
        }

        let outcome = operation.await;
        let superseded = engine.is_superseded(&key, sequence);

        let (error, parked) = match outcome {
            Ok(value) if superseded => {
                engine.rollbacks.discard(id);
                engine.finish_success(&key, sequence);
                let snapshot = serde_json::to_value(&value).ok();
                engine.update_record(id, |m| {
                    m.status = MutationStatus::Success;
                    m.superseded = true;
                    m.last_result = snapshot;
                });
                guards.settle(id);
                debug!(
                    target = "lagoon.mutation",
                    mutation_id = %id,
                    key = %key,
                    sequence,
                    "discarding superseded result"
                );
                return Ok(MutationOutcome::Superseded(value));
            }
            Ok(value) => {
                guards.confirm(id);
                let reconciled = match reconcile {
                    Some(reconcile) => engine
                        .run_step(WriteSource::Reconcile(id), |state| reconcile(state, &value))
                        .map(|_| ()),
                    None => Ok(()),
                };
                match reconciled {
                    Ok(()) => {
                        engine.rollbacks.discard(id);
                        engine.finish_success(&key, sequence);
                        let snapshot = serde_json::to_value(&value).ok();
                        engine.update_record(id, |m| {
                            m.status = MutationStatus::Success;
                            m.last_result = snapshot;
                        });
                        guards.settle(id);
                        debug!(
                            target = "lagoon.mutation",
                            mutation_id = %id,
                            key = %key,
                            sequence,
                            "mutation applied"
                        );
                        return Ok(MutationOutcome::Applied(value));
                    }
                    Err(step) => {
                        warn!(
                            target = "lagoon.mutation",
                            mutation_id = %id,
                            key = %key,
                            error = %step,
                            "reconcile step failed; rolling back"
                        );
                        let settlement = engine.finish_failure(&key, sequence, id, false);
                        (
                            MutationError::Reconcile {
                                key: key.clone(),
                                source: step,
                            },
                            settlement.parked,
                        )
                    }
                }
            }
            Err(remote) => {
                let settlement = engine.finish_failure(&key, sequence, id, superseded);
                if settlement.parked {
                    debug!(
                        target = "lagoon.mutation",
                        mutation_id = %id,
                        key = %key,
                        sequence,
                        "superseded mutation failed; rollback parked behind newer writes"
                    );
                } else if superseded {
                    debug!(
                        target = "lagoon.mutation",
                        mutation_id = %id,
                        key = %key,
                        sequence,
                        "superseded mutation failed after a newer success; rollback dropped"
                    );
                } else if !settlement.rolled_back && untracked_optimistic {
                    guards.unreverted_optimistic(id, &key);
                }
                warn!(
                    target = "lagoon.mutation",
                    mutation_id = %id,
                    key = %key,
                    sequence,
                    error = %remote,
                    "remote operation failed"
                );
                (MutationError::Remote(remote), settlement.parked)
            }
        };

        let message = error.to_string();
        engine.update_record(id, |m| {
            m.status = MutationStatus::Error;
            m.superseded = superseded;
            m.last_error = Some(message);
        });
        if !parked {
            guards.settle(id);
        }
        if let Some(hook) = on_error {
            hook(&error);
        }
        Err(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guards::{ConsistencyGuards, Violation};
    use std::sync::Arc;
    use tokio::sync::oneshot;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    struct Post {
        liked: bool,
        likes: u32,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    struct LikeResponse {
        liked: bool,
        likes: u32,
    }

    fn engine(initial: Post) -> MutationEngine<Post> {
        MutationEngine::new(Store::new("post", initial, ConsistencyGuards::new(true)))
    }

    fn toggle_like() -> impl FnOnce(&mut Post) -> anyhow::Result<Option<Rollback<Post>>> + Send {
        |post: &mut Post| {
            let previous = post.clone();
            post.liked = !post.liked;
            if post.liked {
                post.likes += 1;
            } else {
                post.likes -= 1;
            }
            Ok(Some(Box::new(move |post: &mut Post| *post = previous) as Rollback<Post>))
        }
    }

    fn apply_response(post: &mut Post, response: &LikeResponse) -> anyhow::Result<()> {
        post.liked = response.liked;
        post.likes = response.likes;
        Ok(())
    }

    #[tokio::test]
    async fn success_reconciles_and_discards_rollback() {
        let engine = engine(Post { liked: false, likes: 10 });
        let outcome = engine
            .mutation::<LikeResponse, String>("likePost")
            .optimistic(toggle_like())
            .reconcile(apply_response)
            .run(async {
                Ok(LikeResponse {
                    liked: true,
                    likes: 12,
                })
            })
            .await
            .expect("mutation succeeds");

        assert!(outcome.is_applied());
        assert_eq!(engine.store().snapshot(), Post { liked: true, likes: 12 });
        assert!(engine.rollbacks().is_empty());
        let record = engine.latest("likePost").expect("record");
        assert_eq!(record.status, MutationStatus::Success);
        assert_eq!(record.last_result, Some(serde_json::json!({"liked": true, "likes": 12})));
        assert!(engine.store().guards().violations().is_empty());
    }

    #[tokio::test]
    async fn remote_failure_restores_previous_state() {
        let before = Post { liked: false, likes: 10 };
        let engine = engine(before.clone());
        let mut seen_error = None;

        let err = engine
            .mutation::<LikeResponse, String>("likePost")
            .optimistic(toggle_like())
            .reconcile(apply_response)
            .on_error(|err| seen_error = Some(err.to_string()))
            .run(async { Err("403 forbidden".to_string()) })
            .await
            .expect_err("mutation fails");

        assert_eq!(err.remote().map(String::as_str), Some("403 forbidden"));
        assert_eq!(engine.store().snapshot(), before);
        assert_eq!(
            seen_error.as_deref(),
            Some("remote operation failed: 403 forbidden")
        );
        let record = engine.latest("likePost").expect("record");
        assert_eq!(record.status, MutationStatus::Error);
        assert!(engine.rollbacks().is_empty());
    }

    #[tokio::test]
    async fn optimistic_state_is_visible_while_pending() {
        let engine = Arc::new(engine(Post { liked: false, likes: 0 }));
        let (tx, rx) = oneshot::channel::<Result<LikeResponse, String>>();
        let task = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .mutation("likePost")
                    .optimistic(toggle_like())
                    .reconcile(apply_response)
                    .run(async move { rx.await.expect("sender alive") })
                    .await
            })
        };
        while engine.rollbacks().is_empty() {
            tokio::task::yield_now().await;
        }

        assert_eq!(engine.store().snapshot(), Post { liked: true, likes: 1 });
        assert_eq!(
            engine.latest("likePost").map(|m| m.status),
            Some(MutationStatus::Pending)
        );

        tx.send(Ok(LikeResponse { liked: true, likes: 1 })).expect("send");
        task.await.expect("join").expect("mutation succeeds");
    }

    #[tokio::test]
    async fn optimistic_panic_does_not_abort_remote_call() {
        let before = Post { liked: false, likes: 3 };
        let engine = engine(before.clone());

        let outcome = engine
            .mutation::<LikeResponse, String>("likePost")
            .optimistic(|post: &mut Post| {
                post.likes = 999;
                panic!("bad optimistic update");
            })
            .reconcile(apply_response)
            .run(async { Ok(LikeResponse { liked: true, likes: 4 }) })
            .await
            .expect("remote call still runs");

        assert!(outcome.is_applied());
        assert_eq!(engine.store().snapshot(), Post { liked: true, likes: 4 });
        let record = engine.latest("likePost").expect("record");
        assert_eq!(
            record.optimistic_error.as_deref(),
            Some("panicked: bad optimistic update")
        );
    }

    #[tokio::test]
    async fn optimistic_error_is_rolled_back_before_remote_call() {
        let before = Post { liked: false, likes: 3 };
        let engine = engine(before.clone());

        let err = engine
            .mutation::<LikeResponse, String>("likePost")
            .optimistic(|post: &mut Post| {
                post.liked = true;
                Err(anyhow::anyhow!("half-applied"))
            })
            .run(async { Err("offline".to_string()) })
            .await
            .expect_err("remote fails");

        assert!(matches!(err, MutationError::Remote(_)));
        assert_eq!(engine.store().snapshot(), before);
    }

    #[tokio::test]
    async fn reconcile_failure_is_treated_as_failed_mutation() {
        let before = Post { liked: false, likes: 10 };
        let engine = engine(before.clone());

        let err = engine
            .mutation::<LikeResponse, String>("likePost")
            .optimistic(toggle_like())
            .reconcile(|post: &mut Post, _| {
                post.likes = 0;
                anyhow::bail!("response missing like count")
            })
            .run(async { Ok(LikeResponse { liked: true, likes: 11 }) })
            .await
            .expect_err("reconcile fails");

        assert!(matches!(err, MutationError::Reconcile { .. }));
        assert_eq!(engine.store().snapshot(), before);
        assert_eq!(
            engine.latest("likePost").map(|m| m.status),
            Some(MutationStatus::Error)
        );
    }

    #[tokio::test]
    async fn stale_result_does_not_overwrite_newer_one() {
        let engine = Arc::new(engine(Post { liked: false, likes: 10 }));
        let (first_tx, first_rx) = oneshot::channel::<Result<LikeResponse, String>>();
        let (second_tx, second_rx) = oneshot::channel::<Result<LikeResponse, String>>();

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .mutation("likePost")
                    .optimistic(toggle_like())
                    .reconcile(apply_response)
                    .run(async move { first_rx.await.expect("sender alive") })
                    .await
            })
        };
        while engine.latest("likePost").is_none() {
            tokio::task::yield_now().await;
        }
        let second = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .mutation("likePost")
                    .optimistic(toggle_like())
                    .reconcile(apply_response)
                    .run(async move { second_rx.await.expect("sender alive") })
                    .await
            })
        };
        while engine.latest("likePost").map(|m| m.sequence) != Some(2) {
            tokio::task::yield_now().await;
        }

        second_tx
            .send(Ok(LikeResponse { liked: false, likes: 10 }))
            .expect("send");
        let second = second.await.expect("join").expect("second succeeds");
        assert!(second.is_applied());

        first_tx
            .send(Ok(LikeResponse { liked: true, likes: 11 }))
            .expect("send");
        let first = first.await.expect("join").expect("first settles");
        assert_eq!(first, MutationOutcome::Superseded(LikeResponse { liked: true, likes: 11 }));

        assert_eq!(engine.store().snapshot(), Post { liked: false, likes: 10 });
        assert!(engine.rollbacks().is_empty());
    }

    #[tokio::test]
    async fn stale_failure_parks_rollback_until_newer_write_fails() {
        let engine = Arc::new(engine(Post { liked: false, likes: 10 }));
        let (first_tx, first_rx) = oneshot::channel::<Result<LikeResponse, String>>();
        let (second_tx, second_rx) = oneshot::channel::<Result<LikeResponse, String>>();

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .mutation("likePost")
                    .optimistic(toggle_like())
                    .reconcile(apply_response)
                    .run(async move { first_rx.await.expect("sender alive") })
                    .await
            })
        };
        while engine.latest("likePost").is_none() {
            tokio::task::yield_now().await;
        }
        let second = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .mutation("likePost")
                    .optimistic(toggle_like())
                    .reconcile(apply_response)
                    .run(async move { second_rx.await.expect("sender alive") })
                    .await
            })
        };
        while engine.latest("likePost").map(|m| m.sequence) != Some(2) {
            tokio::task::yield_now().await;
        }

        first_tx.send(Err("timeout".into())).expect("send");
        first.await.expect("join").expect_err("first fails");
        // Second toggle is still in flight: its optimistic unlike must survive.
        assert_eq!(engine.store().snapshot(), Post { liked: false, likes: 10 });
        assert_eq!(engine.rollbacks().len(), 2);

        second_tx.send(Err("timeout".into())).expect("send");
        second.await.expect("join").expect_err("second fails");
        // Both rollbacks ran, newest first.
        assert_eq!(engine.store().snapshot(), Post { liked: false, likes: 10 });
        assert!(engine.rollbacks().is_empty());
    }

    #[tokio::test]
    async fn parked_rollback_is_dropped_when_newer_write_succeeds() {
        let engine = Arc::new(engine(Post { liked: false, likes: 10 }));
        let (first_tx, first_rx) = oneshot::channel::<Result<LikeResponse, String>>();
        let (second_tx, second_rx) = oneshot::channel::<Result<LikeResponse, String>>();

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .mutation("likePost")
                    .optimistic(toggle_like())
                    .reconcile(apply_response)
                    .run(async move { first_rx.await.expect("sender alive") })
                    .await
            })
        };
        while engine.latest("likePost").is_none() {
            tokio::task::yield_now().await;
        }
        let second = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .mutation("likePost")
                    .optimistic(toggle_like())
                    .reconcile(apply_response)
                    .run(async move { second_rx.await.expect("sender alive") })
                    .await
            })
        };
        while engine.latest("likePost").map(|m| m.sequence) != Some(2) {
            tokio::task::yield_now().await;
        }

        first_tx.send(Err("timeout".into())).expect("send");
        first.await.expect("join").expect_err("first fails");
        second_tx
            .send(Ok(LikeResponse { liked: false, likes: 9 }))
            .expect("send");
        second.await.expect("join").expect("second succeeds");

        assert_eq!(engine.store().snapshot(), Post { liked: false, likes: 9 });
        assert!(engine.rollbacks().is_empty());
    }

    #[tokio::test]
    async fn stale_failure_after_newer_success_drops_its_rollback() {
        let engine = Arc::new(engine(Post { liked: false, likes: 10 }));
        let (first_tx, first_rx) = oneshot::channel::<Result<LikeResponse, String>>();
        let (second_tx, second_rx) = oneshot::channel::<Result<LikeResponse, String>>();

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .mutation("likePost")
                    .optimistic(toggle_like())
                    .reconcile(apply_response)
                    .run(async move { first_rx.await.expect("sender alive") })
                    .await
            })
        };
        while engine.latest("likePost").is_none() {
            tokio::task::yield_now().await;
        }
        let second = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .mutation("likePost")
                    .optimistic(toggle_like())
                    .reconcile(apply_response)
                    .run(async move { second_rx.await.expect("sender alive") })
                    .await
            })
        };
        while engine.latest("likePost").map(|m| m.sequence) != Some(2) {
            tokio::task::yield_now().await;
        }

        second_tx
            .send(Ok(LikeResponse { liked: false, likes: 9 }))
            .expect("send");
        second.await.expect("join").expect("second succeeds");
        first_tx.send(Err("timeout".into())).expect("send");
        first.await.expect("join").expect_err("first fails");

        let confirmed = Post { liked: false, likes: 9 };
        assert_eq!(engine.store().snapshot(), confirmed);
        assert!(engine.rollbacks().is_empty());

        // A later unrelated failure on the key only undoes its own toggle.
        engine
            .mutation::<LikeResponse, String>("likePost")
            .optimistic(toggle_like())
            .reconcile(apply_response)
            .run(async { Err("offline".to_string()) })
            .await
            .expect_err("third fails");

        assert_eq!(engine.store().snapshot(), confirmed);
        assert!(engine.rollbacks().is_empty());
        assert!(engine.store().guards().violations().is_empty());
    }

    #[tokio::test]
    async fn failure_after_newer_failure_still_rolls_back() {
        let before = Post { liked: false, likes: 10 };
        let engine = Arc::new(engine(before.clone()));
        let (first_tx, first_rx) = oneshot::channel::<Result<LikeResponse, String>>();

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .mutation("likePost")
                    .optimistic(toggle_like())
                    .reconcile(apply_response)
                    .run(async move { first_rx.await.expect("sender alive") })
                    .await
            })
        };
        while engine.latest("likePost").is_none() {
            tokio::task::yield_now().await;
        }

        engine
            .mutation::<LikeResponse, String>("likePost")
            .optimistic(toggle_like())
            .reconcile(apply_response)
            .run(async { Err("rate limited".to_string()) })
            .await
            .expect_err("second fails");
        assert_eq!(engine.store().snapshot(), Post { liked: true, likes: 11 });

        first_tx.send(Err("rate limited".into())).expect("send");
        first.await.expect("join").expect_err("first fails");
        assert_eq!(engine.store().snapshot(), before);
    }

    #[tokio::test]
    async fn untracked_optimistic_write_is_reported() {
        let engine = engine(Post { liked: false, likes: 1 });
        let guards = engine.store().guards().clone();
        if !guards.is_enabled() {
            return;
        }

        let _ = engine
            .mutation::<LikeResponse, String>("likePost")
            .optimistic(|post: &mut Post| {
                post.liked = true;
                Ok(None)
            })
            .run(async { Err("offline".to_string()) })
            .await;

        assert!(matches!(
            guards.violations().as_slice(),
            [Violation::UnrevertedOptimistic { key, .. }] if key == "likePost"
        ));
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let store = Store::new("post", Post { liked: false, likes: 0 }, ConsistencyGuards::disabled());
        let config = Config {
            mutation_history: 2,
            ..Config::default()
        };
        let engine = MutationEngine::with_config(store, &config);
        for _ in 0..3 {
            engine
                .mutation::<LikeResponse, String>("likePost")
                .run(async { Ok(LikeResponse { liked: false, likes: 0 }) })
                .await
                .expect("ok");
        }
        let history = engine.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].sequence, 2);
        assert_eq!(history[1].sequence, 3);
    }
}
