use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, warn};
use tracker_core::{Action, ActionClient, ActionOptions, ClientError, Verb, unix_millis_now};

use super::connectivity::ConnectivityMonitor;
use super::registry::ResourceRegistry;
use super::store::{LocalStore, StoreError, record_id};

pub const WATERMARK_META_KEY: &str = "bootstrap";

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("bootstrap requires connectivity")]
    Offline,
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("server rejected bootstrap: {0}")]
    Rejected(String),
    #[error("malformed snapshot: {0}")]
    Malformed(String),
}

/// Metadata about the last full cache rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncWatermark {
    pub last_bootstrap: i64,
    pub total_record_counts: BTreeMap<String, u64>,
    pub workspace_id: String,
}

impl SyncWatermark {
    pub fn age(&self, now_ms: i64) -> Duration {
        let elapsed = now_ms.saturating_sub(self.last_bootstrap).max(0);
        Duration::from_millis(elapsed as u64)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotMeta {
    #[serde(default)]
    total_records: Option<u64>,
    #[serde(default)]
    bootstrap_time: Option<Value>,
}

/// Parsed result of a `workspace.bootstrap` call.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub workspace: Option<Value>,
    /// Records keyed by resource kind; records without an id are dropped.
    pub records: BTreeMap<String, Vec<Value>>,
    pub total_records: Option<u64>,
    pub bootstrap_time: Option<Value>,
    /// False when the local rebuild failed and the cache was left as it was.
    pub stored: bool,
}

impl Snapshot {
    pub fn counts(&self) -> BTreeMap<String, u64> {
        self.records
            .iter()
            .map(|(kind, records)| (kind.clone(), records.len() as u64))
            .collect()
    }

    fn parse(data: Value, registry: &ResourceRegistry) -> Result<Self, BootstrapError> {
        let Value::Object(mut body) = data else {
            return Err(BootstrapError::Malformed("expected an object".to_string()));
        };

        let mut records = BTreeMap::new();
        for descriptor in registry.descriptors() {
            let collection = descriptor.collection();
            let items = match body.remove(&collection) {
                None | Some(Value::Null) => {
                    debug!(collection = %collection, "bootstrap: collection absent");
                    Vec::new()
                }
                Some(Value::Array(items)) => items,
                Some(_) => {
                    return Err(BootstrapError::Malformed(format!(
                        "{collection} is not an array"
                    )));
                }
            };
            let total = items.len();
            let kept: Vec<Value> = items
                .into_iter()
                .filter(|record| record_id(record).is_some())
                .collect();
            if kept.len() < total {
                warn!(
                    kind = descriptor.kind,
                    skipped = total - kept.len(),
                    "bootstrap: skipping records without an id"
                );
            }
            records.insert(descriptor.kind.to_string(), kept);
        }

        let meta = match body.remove("meta") {
            None | Some(Value::Null) => SnapshotMeta::default(),
            Some(meta) => serde_json::from_value(meta)
                .map_err(|err| BootstrapError::Malformed(format!("meta: {err}")))?,
        };

        Ok(Self {
            workspace: body.remove("workspace"),
            records,
            total_records: meta.total_records,
            bootstrap_time: meta.bootstrap_time,
            stored: false,
        })
    }
}

/// Full-snapshot cache hydration for one workspace.
pub struct BootstrapEngine {
    client: ActionClient,
    store: LocalStore,
    monitor: ConnectivityMonitor,
    workspace_id: String,
}

impl BootstrapEngine {
    pub fn new(
        client: ActionClient,
        store: LocalStore,
        monitor: ConnectivityMonitor,
        workspace_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            store,
            monitor,
            workspace_id: workspace_id.into(),
        }
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn action(&self) -> Action {
        let include = self
            .store
            .registry()
            .descriptors()
            .iter()
            .map(|descriptor| descriptor.collection())
            .collect();
        Action::new(Verb::Bootstrap)
            .with_payload(json!({ "workspaceId": self.workspace_id }))
            .with_options(ActionOptions {
                include: Some(include),
                ..ActionOptions::default()
            })
    }

    /// Fetches every record of every kind and rebuilds the cache from it.
    /// Any failure before the rebuild leaves the cache and watermark as they
    /// were.
    pub async fn bootstrap(&self) -> Result<Snapshot, BootstrapError> {
        if !self.monitor.is_online() {
            return Err(BootstrapError::Offline);
        }

        let response = self.client.execute(&self.action()).await?;
        if !response.ok {
            return Err(BootstrapError::Rejected(
                response
                    .error
                    .unwrap_or_else(|| "no error message".to_string()),
            ));
        }
        let data = response
            .data
            .ok_or_else(|| BootstrapError::Malformed("missing data".to_string()))?;
        let mut snapshot = Snapshot::parse(data, self.store.registry())?;

        let watermark = SyncWatermark {
            last_bootstrap: unix_millis_now(),
            total_record_counts: snapshot.counts(),
            workspace_id: self.workspace_id.clone(),
        };
        match self.rebuild(&snapshot, &watermark).await {
            Ok(()) => {
                snapshot.stored = true;
                info!(
                    workspace_id = %self.workspace_id,
                    records = watermark.total_record_counts.values().sum::<u64>(),
                    "bootstrap: cache rebuilt"
                );
            }
            Err(err) => {
                warn!(error = %err, "bootstrap: local rebuild failed, cache left unchanged");
            }
        }
        Ok(snapshot)
    }

    /// Current watermark, or `None` when absent or unreadable.
    pub async fn watermark(&self) -> Option<SyncWatermark> {
        let value = match self.store.get_meta(WATERMARK_META_KEY).await {
            Ok(value) => value?,
            Err(err) => {
                warn!(error = %err, "bootstrap: watermark unavailable");
                return None;
            }
        };
        match serde_json::from_value(value) {
            Ok(watermark) => Some(watermark),
            Err(err) => {
                warn!(error = %err, "bootstrap: ignoring unreadable watermark");
                None
            }
        }
    }

    pub async fn is_fresh(&self, max_age: Duration) -> bool {
        match self.watermark().await {
            Some(watermark) if watermark.workspace_id == self.workspace_id => {
                watermark.age(unix_millis_now()) <= max_age
            }
            _ => false,
        }
    }

    async fn rebuild(
        &self,
        snapshot: &Snapshot,
        watermark: &SyncWatermark,
    ) -> Result<(), StoreError> {
        let meta_value = serde_json::to_value(watermark)?;
        self.store
            .rebuild(&snapshot.records, WATERMARK_META_KEY, &meta_value)
            .await
    }
}
