use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracker_core::{Action, ActionClient, ActionResponse, ClientError, Operation, Verb};

use super::connectivity::ConnectivityMonitor;
use super::queue::{DrainReport, PendingOperation, PendingQueue, ReplayOutcome};
use super::registry::{RegistryError, ResourceDescriptor, ResourceMethods, ResourceRegistry};
use super::store::{LocalStore, RecordFilter, record_id};

const OPTIMISTIC_PREFIX: &str = "optimistic-";
const EVENT_CAPACITY: usize = 64;

/// Notifications for collaborators that hold references to queued work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A replayed create was confirmed and the server assigned `server_id`.
    Reconciled {
        optimistic_id: String,
        server_id: String,
        verb: String,
    },
    /// A queued action was dropped after failing replay for good.
    ReplayAbandoned {
        optimistic_id: String,
        verb: String,
        error: String,
    },
}

enum RoundTrip {
    Answered(ActionResponse),
    Failed(ClientError),
    ConnectivityLost(ClientError),
}

pub struct Dispatcher {
    client: ActionClient,
    registry: Arc<ResourceRegistry>,
    store: LocalStore,
    monitor: ConnectivityMonitor,
    queue: PendingQueue,
    events: broadcast::Sender<SyncEvent>,
}

impl Dispatcher {
    pub fn new(
        client: ActionClient,
        registry: Arc<ResourceRegistry>,
        store: LocalStore,
        monitor: ConnectivityMonitor,
        queue: PendingQueue,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            client,
            registry,
            store,
            monitor,
            queue,
            events,
        }
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.monitor
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn methods_for(&self, kind: &str) -> Result<ResourceMethods<'_>, RegistryError> {
        let descriptor = self.registry.lookup(kind)?;
        Ok(ResourceMethods::new(self, descriptor))
    }

    pub async fn pending_count(&self) -> usize {
        self.queue.size().await
    }

    /// Runs one action. Never fails out of band: every outcome, including
    /// usage errors, comes back as an [`ActionResponse`].
    pub async fn execute(&self, action: Action) -> ActionResponse {
        let (descriptor, operation) = match self.resolve(&action.verb) {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!(verb = %action.verb, error = %err, "rejected action");
                return ActionResponse::failure(&action.verb, err.to_string());
            }
        };

        if !self.monitor.is_online() {
            return self.execute_offline(descriptor, operation, action).await;
        }

        match self.round_trip(descriptor, operation, &action).await {
            RoundTrip::Answered(response) => response,
            RoundTrip::Failed(err) => {
                warn!(verb = %action.verb, error = %err, "action failed while online");
                ActionResponse::failure(&action.verb, err.to_string())
            }
            RoundTrip::ConnectivityLost(err) => {
                info!(verb = %action.verb, error = %err, "connectivity lost mid-call, queueing");
                self.execute_offline(descriptor, operation, action).await
            }
        }
    }

    /// Drains the pending queue through the online path. Stops as soon as the
    /// monitor reports offline.
    pub async fn replay_pending(&self) -> DrainReport {
        if !self.monitor.is_online() {
            return DrainReport {
                interrupted: true,
                ..DrainReport::default()
            };
        }

        let report = self
            .queue
            .drain_while(
                |entry| self.replay_one(entry),
                || self.monitor.is_online(),
            )
            .await;

        for abandoned in &report.abandoned {
            let _ = self.events.send(SyncEvent::ReplayAbandoned {
                optimistic_id: abandoned.id.clone(),
                verb: abandoned.action.verb.to_string(),
                error: abandoned.last_error.clone().unwrap_or_default(),
            });
        }
        if report.replayed > 0 || report.requeued > 0 || !report.abandoned.is_empty() {
            info!(
                replayed = report.replayed,
                requeued = report.requeued,
                abandoned = report.abandoned.len(),
                skipped = report.skipped,
                "pending queue drained"
            );
        }
        report
    }

    /// Drains the queue on every offline to online transition, and again
    /// whenever a deferred entry comes due while online.
    pub fn spawn_replay_on_reconnect(self: &Arc<Self>) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        let mut online = self.monitor.subscribe();
        tokio::spawn(async move {
            loop {
                let next_due = if dispatcher.monitor.is_online() {
                    dispatcher.queue.next_retry_at().await
                } else {
                    None
                };
                let wait = next_due
                    .map(|at| at.saturating_sub(tracker_core::unix_millis_now()).max(0))
                    .map(|ms| Duration::from_millis(ms as u64))
                    .unwrap_or_default();

                tokio::select! {
                    changed = online.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let is_online = *online.borrow_and_update();
                        if is_online {
                            dispatcher.replay_pending().await;
                        }
                    }
                    _ = tokio::time::sleep(wait), if next_due.is_some() => {
                        dispatcher.replay_pending().await;
                    }
                }
            }
        })
    }

    /// Cached records of `kind`; empty when the store is unavailable.
    pub async fn cached_records(&self, kind: &str, filter: Option<&RecordFilter>) -> Vec<Value> {
        match self.store.get_all(kind, filter).await {
            Ok(records) => records,
            Err(err) => {
                warn!(kind, error = %err, "local store read failed");
                Vec::new()
            }
        }
    }

    pub async fn cached_record(&self, kind: &str, id: &str) -> Option<Value> {
        match self.store.get_record(kind, id).await {
            Ok(record) => record,
            Err(err) => {
                warn!(kind, id, error = %err, "local store read failed");
                None
            }
        }
    }

    fn resolve(
        &self,
        verb: &Verb,
    ) -> Result<(&'static ResourceDescriptor, Operation), RegistryError> {
        match verb {
            Verb::Resource { kind, operation } => Ok((self.registry.lookup(kind)?, *operation)),
            Verb::Bootstrap => Err(RegistryError::UnknownResource("workspace".to_string())),
        }
    }

    async fn round_trip(
        &self,
        descriptor: &ResourceDescriptor,
        operation: Operation,
        action: &Action,
    ) -> RoundTrip {
        debug!(verb = %action.verb, "sending action");
        match self.client.execute(action).await {
            Ok(response) => {
                if response.ok {
                    self.cache_response(descriptor.kind, operation, action, &response)
                        .await;
                }
                RoundTrip::Answered(response)
            }
            Err(err) if self.monitor.is_online() => RoundTrip::Failed(err),
            Err(err) => RoundTrip::ConnectivityLost(err),
        }
    }

    async fn cache_response(
        &self,
        kind: &str,
        operation: Operation,
        action: &Action,
        response: &ActionResponse,
    ) {
        let skip_cache = action.options().skips_cache();
        let data = response.data.as_ref();
        match operation {
            Operation::Create | Operation::Update => {
                if let Some(record) = data.filter(|record| record_id(record).is_some()) {
                    self.cache_put(kind, record).await;
                }
            }
            Operation::Delete => {
                let id = action
                    .resource_id
                    .clone()
                    .or_else(|| data.and_then(record_id));
                if let Some(id) = id
                    && let Err(err) = self.store.delete_record(kind, &id).await
                {
                    warn!(kind, id = %id, error = %err, "local store evict failed");
                }
            }
            Operation::Get if !skip_cache => {
                if let Some(record) = data.filter(|record| record_id(record).is_some()) {
                    self.cache_put(kind, record).await;
                }
            }
            Operation::List if !skip_cache => {
                let records = data.and_then(Value::as_array).into_iter().flatten();
                for record in records.filter(|record| record_id(record).is_some()) {
                    self.cache_put(kind, record).await;
                }
            }
            Operation::Get | Operation::List => {}
        }
    }

    async fn cache_put(&self, kind: &str, record: &Value) {
        if let Err(err) = self.store.put_record(kind, record).await {
            warn!(kind, error = %err, "local store write failed");
        }
    }

    async fn execute_offline(
        &self,
        descriptor: &ResourceDescriptor,
        operation: Operation,
        action: Action,
    ) -> ActionResponse {
        let kind = descriptor.kind;
        match operation {
            Operation::Get => {
                let cached = match &action.resource_id {
                    Some(id) => self.cached_record(kind, id).await,
                    None => None,
                };
                match cached {
                    Some(record) => ActionResponse::success(&action.verb, record),
                    None => ActionResponse::failure(&action.verb, "offline and not cached"),
                }
            }
            Operation::List => {
                let filter = offline_list_filter(&action);
                let records = self.cached_records(kind, Some(&filter)).await;
                ActionResponse::success(&action.verb, Value::Array(records))
            }
            Operation::Create | Operation::Update | Operation::Delete => {
                if !action.options().allows_optimistic() {
                    return ActionResponse::failure(&action.verb, "offline");
                }
                let optimistic_id = new_optimistic_id();
                let data = optimistic_data(&optimistic_id, &action);
                let verb = action.verb.clone();
                self.queue
                    .enqueue(PendingOperation::new(optimistic_id.clone(), action))
                    .await;
                info!(verb = %verb, optimistic_id = %optimistic_id, "queued while offline");
                ActionResponse::optimistic(&verb, data, optimistic_id)
            }
        }
    }

    async fn replay_one(&self, entry: PendingOperation) -> ReplayOutcome {
        let (descriptor, operation) = match self.resolve(&entry.action.verb) {
            Ok(resolved) => resolved,
            Err(err) => {
                return ReplayOutcome::Failed {
                    error: err.to_string(),
                    retryable: false,
                };
            }
        };

        match self.round_trip(descriptor, operation, &entry.action).await {
            RoundTrip::Answered(response) => {
                if response.ok
                    && operation == Operation::Create
                    && let Some(server_id) = response.data.as_ref().and_then(record_id)
                {
                    debug!(optimistic_id = %entry.id, server_id = %server_id, "reconciled optimistic id");
                    let _ = self.events.send(SyncEvent::Reconciled {
                        optimistic_id: entry.id.clone(),
                        server_id,
                        verb: response.verb.clone(),
                    });
                }
                response.into()
            }
            RoundTrip::Failed(err) => ReplayOutcome::Failed {
                retryable: err.is_retryable(),
                error: err.to_string(),
            },
            RoundTrip::ConnectivityLost(_) => ReplayOutcome::Interrupted,
        }
    }
}

pub fn is_optimistic_id(id: &str) -> bool {
    id.starts_with(OPTIMISTIC_PREFIX)
}

fn new_optimistic_id() -> String {
    format!(
        "{OPTIMISTIC_PREFIX}{}-{:016x}",
        tracker_core::unix_millis_now(),
        rand::random::<u64>()
    )
}

/// `{ id: <optimistic id>, ...payload }`.
fn optimistic_data(optimistic_id: &str, action: &Action) -> Value {
    let mut data = Map::new();
    data.insert("id".to_string(), Value::String(optimistic_id.to_string()));
    if let Some(payload) = action.payload_object() {
        data.extend(payload.clone());
    }
    Value::Object(data)
}

fn offline_list_filter(action: &Action) -> RecordFilter {
    let mut filter = action.payload_object().cloned().unwrap_or_default();
    if let Some(parent_id) = &action.parent_id {
        filter.insert("parentId".to_string(), Value::String(parent_id.clone()));
    }
    filter
}

#[cfg(test)]
#[path = "dispatcher_tests.rs"]
mod tests;
