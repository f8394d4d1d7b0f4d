use std::collections::VecDeque;
use std::future::Future;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use tracker_core::{Action, ActionResponse, unix_millis_now};

use super::backoff::Backoff;
use super::store::LocalStore;

pub const PENDING_META_KEY: &str = "pendingActions";
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// An action accepted while offline and not yet confirmed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    /// The optimistic id handed to the caller; doubles as queue identity.
    pub id: String,
    pub action: Action,
    pub enqueued_at: i64,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl PendingOperation {
    pub fn new(id: impl Into<String>, action: Action) -> Self {
        Self {
            id: id.into(),
            action,
            enqueued_at: unix_millis_now(),
            attempts: 0,
            retry_at: None,
            last_error: None,
        }
    }

    fn is_due(&self, now_ms: i64) -> bool {
        self.retry_at.is_none_or(|at| at <= now_ms)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplayOutcome {
    /// The server accepted the action; the entry is done.
    Confirmed(ActionResponse),
    /// The server or transport rejected it.
    Failed { error: String, retryable: bool },
    /// Connectivity dropped before an answer arrived; the entry stays put.
    Interrupted,
}

impl From<ActionResponse> for ReplayOutcome {
    fn from(response: ActionResponse) -> Self {
        if response.ok {
            ReplayOutcome::Confirmed(response)
        } else {
            ReplayOutcome::Failed {
                error: response
                    .error
                    .unwrap_or_else(|| "server rejected replay".to_string()),
                retryable: true,
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    pub replayed: usize,
    pub requeued: usize,
    pub skipped: usize,
    pub abandoned: Vec<PendingOperation>,
    pub interrupted: bool,
}

/// Durable FIFO of offline actions. The full list is rewritten to the meta
/// table after every change.
pub struct PendingQueue {
    store: LocalStore,
    entries: Mutex<VecDeque<PendingOperation>>,
    drain_lock: Mutex<()>,
    backoff: Backoff,
    max_attempts: u32,
}

impl PendingQueue {
    /// Restores the persisted queue. An unreadable queue starts empty.
    pub async fn load(store: LocalStore) -> Self {
        let entries = match store.get_meta(PENDING_META_KEY).await {
            Ok(Some(value)) => match serde_json::from_value::<VecDeque<PendingOperation>>(value) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(error = %err, "pending queue: discarding unreadable persisted queue");
                    VecDeque::new()
                }
            },
            Ok(None) => VecDeque::new(),
            Err(err) => {
                warn!(error = %err, "pending queue: store unavailable, starting empty");
                VecDeque::new()
            }
        };
        if !entries.is_empty() {
            info!(pending = entries.len(), "pending queue: restored");
        }
        Self {
            store,
            entries: Mutex::new(entries),
            drain_lock: Mutex::new(()),
            backoff: Backoff::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Appends and persists before returning.
    pub async fn enqueue(&self, operation: PendingOperation) {
        let mut entries = self.entries.lock().await;
        debug!(id = %operation.id, verb = %operation.action.verb, "pending queue: enqueue");
        entries.push_back(operation);
        self.persist(&entries).await;
    }

    pub async fn size(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn snapshot(&self) -> Vec<PendingOperation> {
        self.entries.lock().await.iter().cloned().collect()
    }

    /// Epoch-millisecond instant at which the earliest entry becomes due.
    /// Entries without a backoff deadline are due immediately.
    pub async fn next_retry_at(&self) -> Option<i64> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|entry| entry.retry_at.unwrap_or(entry.enqueued_at))
            .min()
    }

    pub async fn drain<F, Fut>(&self, executor: F) -> DrainReport
    where
        F: FnMut(PendingOperation) -> Fut,
        Fut: Future<Output = ReplayOutcome>,
    {
        self.drain_while(executor, || true).await
    }

    /// Replays entries one at a time in queue order. Each entry present when
    /// the pass starts is visited at most once; a failed entry moves to the
    /// back. Stops early once `keep_going` returns false.
    pub async fn drain_while<F, Fut, K>(&self, mut executor: F, keep_going: K) -> DrainReport
    where
        F: FnMut(PendingOperation) -> Fut,
        Fut: Future<Output = ReplayOutcome>,
        K: Fn() -> bool,
    {
        let _drain = self.drain_lock.lock().await;
        let mut report = DrainReport::default();
        let ids: Vec<String> = self
            .entries
            .lock()
            .await
            .iter()
            .map(|entry| entry.id.clone())
            .collect();

        for id in ids {
            if !keep_going() {
                report.interrupted = true;
                break;
            }
            let Some(entry) = self.find(&id).await else {
                continue;
            };
            if !entry.is_due(unix_millis_now()) {
                report.skipped += 1;
                continue;
            }

            match executor(entry).await {
                ReplayOutcome::Confirmed(_) => {
                    let mut entries = self.entries.lock().await;
                    entries.retain(|entry| entry.id != id);
                    self.persist(&entries).await;
                    report.replayed += 1;
                }
                ReplayOutcome::Failed { error, retryable } => {
                    let mut entries = self.entries.lock().await;
                    let Some(position) = entries.iter().position(|entry| entry.id == id) else {
                        continue;
                    };
                    let Some(mut failed) = entries.remove(position) else {
                        continue;
                    };
                    failed.attempts = failed.attempts.saturating_add(1);
                    failed.last_error = Some(error);
                    if !retryable || failed.attempts >= self.max_attempts {
                        warn!(
                            id = %failed.id,
                            verb = %failed.action.verb,
                            attempts = failed.attempts,
                            error = failed.last_error.as_deref().unwrap_or_default(),
                            "pending queue: giving up on replay"
                        );
                        report.abandoned.push(failed);
                    } else {
                        failed.retry_at = Some(
                            self.backoff
                                .retry_at(failed.attempts - 1, unix_millis_now()),
                        );
                        debug!(
                            id = %failed.id,
                            attempts = failed.attempts,
                            "pending queue: replay failed, moved to back"
                        );
                        entries.push_back(failed);
                        report.requeued += 1;
                    }
                    self.persist(&entries).await;
                }
                ReplayOutcome::Interrupted => {
                    report.interrupted = true;
                    break;
                }
            }
        }

        report
    }

    async fn find(&self, id: &str) -> Option<PendingOperation> {
        self.entries
            .lock()
            .await
            .iter()
            .find(|entry| entry.id == id)
            .cloned()
    }

    async fn persist(&self, entries: &VecDeque<PendingOperation>) {
        let value = match serde_json::to_value(entries) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "pending queue: failed to serialize queue");
                return;
            }
        };
        if let Err(err) = self.store.put_meta(PENDING_META_KEY, &value).await {
            warn!(error = %err, pending = entries.len(), "pending queue: failed to persist");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::registry::{DEFAULT_RESOURCES, ResourceRegistry};
    use serde_json::json;
    use sqlx::SqlitePool;
    use std::sync::Arc;
    use std::time::Duration;
    use tracker_core::{Operation, Verb};

    async fn make_store() -> LocalStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let registry = Arc::new(ResourceRegistry::new(DEFAULT_RESOURCES).unwrap());
        let store = LocalStore::from_pool(pool, registry);
        store.init().await.unwrap();
        store
    }

    async fn make_queue(store: &LocalStore) -> PendingQueue {
        PendingQueue::load(store.clone())
            .await
            .with_backoff(Backoff::immediate())
    }

    fn op(id: &str) -> PendingOperation {
        PendingOperation::new(
            id,
            Action::new(Verb::resource("issue", Operation::Update))
                .with_resource_id("issue-1")
                .with_payload(json!({ "title": id })),
        )
    }

    fn confirmed(id: &str) -> ReplayOutcome {
        ReplayOutcome::Confirmed(tracker_core::ActionResponse::success(
            &Verb::resource("issue", Operation::Update),
            json!({ "id": id }),
        ))
    }

    fn failed() -> ReplayOutcome {
        ReplayOutcome::Failed {
            error: "boom".into(),
            retryable: true,
        }
    }

    async fn ids(queue: &PendingQueue) -> Vec<String> {
        queue.snapshot().await.into_iter().map(|e| e.id).collect()
    }

    #[tokio::test]
    async fn enqueue_persists_immediately() {
        let store = make_store().await;
        let queue = make_queue(&store).await;
        queue.enqueue(op("A")).await;
        queue.enqueue(op("B")).await;

        let reloaded = PendingQueue::load(store.clone()).await;
        assert_eq!(reloaded.size().await, 2);
        assert_eq!(ids(&reloaded).await, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn drain_replays_in_enqueue_order() {
        let store = make_store().await;
        let queue = make_queue(&store).await;
        for id in ["A", "B", "C"] {
            queue.enqueue(op(id)).await;
        }

        let mut seen = Vec::new();
        let report = queue
            .drain(|entry| {
                seen.push(entry.id.clone());
                let outcome = confirmed(&entry.id);
                async move { outcome }
            })
            .await;

        assert_eq!(seen, vec!["A", "B", "C"]);
        assert_eq!(report.replayed, 3);
        assert_eq!(queue.size().await, 0);
        assert_eq!(PendingQueue::load(store).await.size().await, 0);
    }

    #[tokio::test]
    async fn failed_entry_moves_to_the_back_and_is_visited_once() {
        let store = make_store().await;
        let queue = make_queue(&store).await;
        for id in ["A", "B", "C"] {
            queue.enqueue(op(id)).await;
        }

        let mut calls = 0;
        let report = queue
            .drain(|entry| {
                calls += 1;
                let outcome = if entry.id == "A" {
                    failed()
                } else {
                    confirmed(&entry.id)
                };
                async move { outcome }
            })
            .await;

        assert_eq!(calls, 3);
        assert_eq!(report.replayed, 2);
        assert_eq!(report.requeued, 1);
        let remaining = queue.snapshot().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "A");
        assert_eq!(remaining[0].attempts, 1);
        assert_eq!(remaining[0].last_error.as_deref(), Some("boom"));

        let report = queue
            .drain(|entry| {
                let outcome = confirmed(&entry.id);
                async move { outcome }
            })
            .await;
        assert_eq!(report.replayed, 1);
        assert_eq!(queue.size().await, 0);
    }

    #[tokio::test]
    async fn interrupted_drain_leaves_entries_in_place() {
        let store = make_store().await;
        let queue = make_queue(&store).await;
        for id in ["A", "B", "C"] {
            queue.enqueue(op(id)).await;
        }

        let mut calls = 0;
        let report = queue
            .drain(|_| {
                calls += 1;
                async { ReplayOutcome::Interrupted }
            })
            .await;

        assert_eq!(calls, 1);
        assert!(report.interrupted);
        assert_eq!(ids(&queue).await, vec!["A", "B", "C"]);
        assert!(queue.snapshot().await.iter().all(|e| e.attempts == 0));
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let store = make_store().await;
        let queue = make_queue(&store).await.with_max_attempts(2);
        queue.enqueue(op("A")).await;

        let first = queue.drain(|_| async { failed() }).await;
        assert!(first.abandoned.is_empty());
        let second = queue.drain(|_| async { failed() }).await;

        assert_eq!(second.abandoned.len(), 1);
        assert_eq!(second.abandoned[0].attempts, 2);
        assert_eq!(queue.size().await, 0);
        assert_eq!(PendingQueue::load(store).await.size().await, 0);
    }

    #[tokio::test]
    async fn non_retryable_failure_is_abandoned_at_once() {
        let store = make_store().await;
        let queue = make_queue(&store).await;
        queue.enqueue(op("A")).await;

        let report = queue
            .drain(|_| async {
                ReplayOutcome::Failed {
                    error: "422".into(),
                    retryable: false,
                }
            })
            .await;

        assert_eq!(report.abandoned.len(), 1);
        assert_eq!(queue.size().await, 0);
    }

    #[tokio::test]
    async fn backoff_defers_failed_entry_to_a_later_pass() {
        let store = make_store().await;
        let queue = PendingQueue::load(store.clone()).await.with_backoff(Backoff::new(
            Duration::from_secs(60),
            Duration::from_secs(60),
            false,
        ));
        queue.enqueue(op("A")).await;
        queue.drain(|_| async { failed() }).await;

        let mut calls = 0;
        let report = queue
            .drain(|entry| {
                calls += 1;
                let outcome = confirmed(&entry.id);
                async move { outcome }
            })
            .await;

        assert_eq!(calls, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(queue.size().await, 1);
    }

    #[tokio::test]
    async fn next_retry_at_tracks_the_earliest_deadline() {
        let store = make_store().await;
        let queue = PendingQueue::load(store.clone()).await.with_backoff(Backoff::new(
            Duration::from_secs(60),
            Duration::from_secs(60),
            false,
        ));
        assert_eq!(queue.next_retry_at().await, None);

        queue.enqueue(op("A")).await;
        let enqueued_at = queue.snapshot().await[0].enqueued_at;
        assert_eq!(queue.next_retry_at().await, Some(enqueued_at));

        let before = unix_millis_now();
        queue.drain(|_| async { failed() }).await;
        let deferred = queue.next_retry_at().await.unwrap();
        assert!(deferred >= before + 60_000);
    }

    #[tokio::test]
    async fn drain_while_stops_when_told() {
        let store = make_store().await;
        let queue = make_queue(&store).await;
        queue.enqueue(op("A")).await;

        let report = queue
            .drain_while(
                |entry| {
                    let outcome = confirmed(&entry.id);
                    async move { outcome }
                },
                || false,
            )
            .await;

        assert!(report.interrupted);
        assert_eq!(queue.size().await, 1);
    }

    #[tokio::test]
    async fn response_conversion_maps_ok_flag() {
        let verb = Verb::resource("team", Operation::Create);
        let ok = tracker_core::ActionResponse::success(&verb, json!({ "id": "t" }));
        assert!(matches!(ReplayOutcome::from(ok), ReplayOutcome::Confirmed(_)));

        let rejected = tracker_core::ActionResponse::failure(&verb, "taken");
        assert_eq!(
            ReplayOutcome::from(rejected),
            ReplayOutcome::Failed {
                error: "taken".into(),
                retryable: true
            }
        );
    }

    #[tokio::test]
    async fn unavailable_store_keeps_queue_in_memory() {
        let store = make_store().await;
        store.close().await;

        let queue = make_queue(&store).await;
        queue.enqueue(op("A")).await;

        assert_eq!(queue.size().await, 1);
    }
}
