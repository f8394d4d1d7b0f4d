use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use sqlx::sqlite::SqlitePoolOptions;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracker_core::ActionClient;

use crate::config::SessionConfig;
use crate::sync::bootstrap::{BootstrapEngine, BootstrapError, Snapshot, SyncWatermark};
use crate::sync::connectivity::{ConnectivityMonitor, TcpProbe};
use crate::sync::dispatcher::Dispatcher;
use crate::sync::queue::PendingQueue;
use crate::sync::registry::{DEFAULT_RESOURCES, ResourceRegistry};
use crate::sync::store::{LocalStore, StoreError};

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub workspace_id: String,
    pub endpoint: String,
    pub online: bool,
    pub pending: usize,
    pub fresh: bool,
    pub last_bootstrap_at: Option<String>,
    pub watermark: Option<SyncWatermark>,
}

/// Everything that lives for one workspace session: store, queue, monitor,
/// dispatcher and bootstrap engine, plus their background tasks.
pub struct Session {
    config: SessionConfig,
    dispatcher: Arc<Dispatcher>,
    bootstrap: BootstrapEngine,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    /// Opens the on-disk store, or an in-memory one when the file cannot be
    /// opened. The in-memory store lasts only as long as the session.
    pub async fn open(config: SessionConfig) -> anyhow::Result<Self> {
        let registry = Arc::new(ResourceRegistry::new(DEFAULT_RESOURCES)?);
        let store = match LocalStore::open(&config.db_path, Arc::clone(&registry)).await {
            Ok(store) => store,
            Err(err) => {
                warn!(
                    path = %config.db_path.display(),
                    error = %err,
                    "local store unavailable, falling back to memory"
                );
                fallback_memory_store(Arc::clone(&registry))
                    .await
                    .context("failed to open in-memory store")?
            }
        };
        Self::with_store(config, registry, store).await
    }

    /// Builds the session on an already initialized store.
    pub async fn with_store(
        config: SessionConfig,
        registry: Arc<ResourceRegistry>,
        store: LocalStore,
    ) -> anyhow::Result<Self> {
        let mut client =
            ActionClient::with_timeout(config.endpoint.as_str(), config.request_timeout)
                .context("failed to build action client")?;
        if let Some(token) = &config.token {
            client = client.with_token(token.clone());
        }

        let probe = TcpProbe::for_endpoint(&config.endpoint, PROBE_TIMEOUT)
            .filter(|_| config.enable_probe);
        // Without a probe the monitor starts online and transport failures decide.
        let monitor = match &probe {
            Some(probe) => ConnectivityMonitor::from_probe(probe).await,
            None => ConnectivityMonitor::new(true),
        };

        let queue = PendingQueue::load(store.clone())
            .await
            .with_max_attempts(config.replay_max_attempts);
        let dispatcher = Arc::new(Dispatcher::new(
            client.clone(),
            registry,
            store.clone(),
            monitor.clone(),
            queue,
        ));
        let bootstrap = BootstrapEngine::new(
            client,
            store,
            monitor.clone(),
            config.workspace_id.clone(),
        );

        let mut tasks = vec![dispatcher.spawn_replay_on_reconnect()];
        if let Some(probe) = probe {
            tasks.push(monitor.spawn_probe_loop(probe, config.probe_interval));
        }

        if monitor.is_online() && dispatcher.pending_count().await > 0 {
            dispatcher.replay_pending().await;
        }

        info!(
            workspace_id = %config.workspace_id,
            endpoint = %config.endpoint,
            online = monitor.is_online(),
            pending = dispatcher.pending_count().await,
            "session opened"
        );
        Ok(Self {
            config,
            dispatcher,
            bootstrap,
            tasks,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn bootstrap_engine(&self) -> &BootstrapEngine {
        &self.bootstrap
    }

    /// Bootstraps when the cache is older than the configured maximum age.
    /// Returns `None` when the cache was already fresh.
    pub async fn ensure_fresh(&self) -> Result<Option<Snapshot>, BootstrapError> {
        if self.bootstrap.is_fresh(self.config.bootstrap_max_age).await {
            return Ok(None);
        }
        self.bootstrap.bootstrap().await.map(Some)
    }

    pub async fn status(&self) -> SessionStatus {
        let watermark = self.bootstrap.watermark().await;
        SessionStatus {
            workspace_id: self.config.workspace_id.clone(),
            endpoint: self.config.endpoint.to_string(),
            online: self.dispatcher.monitor().is_online(),
            pending: self.dispatcher.pending_count().await,
            fresh: self.bootstrap.is_fresh(self.config.bootstrap_max_age).await,
            last_bootstrap_at: watermark
                .as_ref()
                .and_then(|watermark| format_millis(watermark.last_bootstrap)),
            watermark,
        }
    }

    pub async fn close(self) {
        for task in &self.tasks {
            task.abort();
        }
        self.dispatcher.store().close().await;
        info!(workspace_id = %self.config.workspace_id, "session closed");
    }
}

fn format_millis(epoch_ms: i64) -> Option<String> {
    let nanos = i128::from(epoch_ms) * 1_000_000;
    OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .ok()?
        .format(&Rfc3339)
        .ok()
}

/// Every pooled connection to `sqlite::memory:` would see its own database,
/// so the pool holds exactly one connection for the session's lifetime.
async fn fallback_memory_store(
    registry: Arc<ResourceRegistry>,
) -> Result<LocalStore, StoreError> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    let store = LocalStore::from_pool(pool, registry);
    store.init().await?;
    Ok(store)
}
