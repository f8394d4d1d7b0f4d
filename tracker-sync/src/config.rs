use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use url::Url;

use crate::sync::queue::DEFAULT_MAX_ATTEMPTS;

const DATA_DIR_NAME: &str = "issue-tracker";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_BOOTSTRAP_MAX_AGE_SECS: u64 = 300;
const DEFAULT_PROBE_INTERVAL_SECS: u64 = 10;

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub endpoint: Url,
    pub workspace_id: String,
    pub token: Option<String>,
    pub db_path: PathBuf,
    pub request_timeout: Duration,
    pub replay_max_attempts: u32,
    pub bootstrap_max_age: Duration,
    pub probe_interval: Duration,
    pub enable_probe: bool,
}

impl SessionConfig {
    pub fn new(endpoint: Url, workspace_id: impl Into<String>, db_path: PathBuf) -> Self {
        Self {
            endpoint,
            workspace_id: workspace_id.into(),
            token: None,
            db_path,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            replay_max_attempts: DEFAULT_MAX_ATTEMPTS,
            bootstrap_max_age: Duration::from_secs(DEFAULT_BOOTSTRAP_MAX_AGE_SECS),
            probe_interval: Duration::from_secs(DEFAULT_PROBE_INTERVAL_SECS),
            enable_probe: true,
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let endpoint = std::env::var("TRACKER_ENDPOINT").context("TRACKER_ENDPOINT is not set")?;
        let endpoint = Url::parse(&endpoint)
            .with_context(|| format!("TRACKER_ENDPOINT is not a valid URL: {endpoint}"))?;
        let workspace_id =
            std::env::var("TRACKER_WORKSPACE_ID").context("TRACKER_WORKSPACE_ID is not set")?;
        if !is_valid_workspace_id(&workspace_id) {
            bail!("TRACKER_WORKSPACE_ID contains unsupported characters: {workspace_id}");
        }
        let token = std::env::var("TRACKER_TOKEN")
            .ok()
            .filter(|token| !token.trim().is_empty());
        let db_path = match std::env::var("TRACKER_DB_PATH") {
            Ok(value) => {
                let home = dirs::home_dir().context("home directory is unavailable")?;
                expand_with_home(&value, &home)
            }
            Err(_) => default_db_path(&workspace_id),
        };

        Ok(Self {
            endpoint,
            token,
            db_path,
            request_timeout: Duration::from_millis(read_u64_env(
                "TRACKER_REQUEST_TIMEOUT_MS",
                DEFAULT_REQUEST_TIMEOUT_MS,
            )),
            replay_max_attempts: read_u64_env(
                "TRACKER_REPLAY_MAX_ATTEMPTS",
                u64::from(DEFAULT_MAX_ATTEMPTS),
            )
            .try_into()
            .unwrap_or(u32::MAX),
            bootstrap_max_age: Duration::from_secs(read_u64_env(
                "TRACKER_BOOTSTRAP_MAX_AGE_SECS",
                DEFAULT_BOOTSTRAP_MAX_AGE_SECS,
            )),
            probe_interval: Duration::from_secs(read_u64_env(
                "TRACKER_PROBE_INTERVAL_SECS",
                DEFAULT_PROBE_INTERVAL_SECS,
            )),
            enable_probe: read_bool_env("TRACKER_ENABLE_PROBE", true),
            workspace_id,
        })
    }
}

// The workspace id becomes a file name in the default database path.
fn is_valid_workspace_id(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && value != "."
        && value != ".."
}

fn default_db_path(workspace_id: &str) -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(DATA_DIR_NAME)
        .join(format!("{workspace_id}.db"))
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}
