use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// Advisory online/offline state. Transport failures remain the
/// authoritative signal; this only decides which path an action takes first.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    state: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (state, _) = watch::channel(initially_online);
        Self {
            state: Arc::new(state),
        }
    }

    pub async fn from_probe(probe: &TcpProbe) -> Self {
        Self::new(probe.check().await)
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Records a platform signal. Returns true when it was a transition;
    /// subscribers are only woken for transitions.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if changed {
            if online {
                info!("connectivity: online");
            } else {
                warn!("connectivity: offline");
            }
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    pub fn spawn_probe_loop(&self, probe: TcpProbe, interval: Duration) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let online = probe.check().await;
                debug!(online, target = %probe.target(), "connectivity probe");
                monitor.set_online(online);
            }
        })
    }
}

/// Reachability check for hosts without a platform connectivity signal:
/// the endpoint counts as reachable when a TCP connection opens in time.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }

    pub fn for_endpoint(endpoint: &Url, timeout: Duration) -> Option<Self> {
        let host = endpoint.host_str()?;
        let port = endpoint.port_or_known_default()?;
        Some(Self::new(host, port, timeout))
    }

    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub async fn check(&self) -> bool {
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        matches!(tokio::time::timeout(self.timeout, connect).await, Ok(Ok(_)))
    }
}
