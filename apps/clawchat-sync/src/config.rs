use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use directories::ProjectDirs;
use tracing::warn;

use crate::coordinator::DEFAULT_PENDING_POLL;
use crate::queue::QueueLimits;
use crate::socket::ReconnectPolicy;
use crate::store::DEFAULT_UNDO_WINDOW;
use crate::stream::{RetryPolicy, DEFAULT_IDLE_TIMEOUT};

pub const SERVER_URL_ENV: &str = "CLAWCHAT_SERVER_URL";
pub const TOKEN_ENV: &str = "CLAWCHAT_TOKEN";
pub const DATA_DIR_ENV: &str = "CLAWCHAT_DATA_DIR";
pub const STREAM_RETRIES_ENV: &str = "CLAWCHAT_STREAM_RETRIES";
pub const STREAM_IDLE_SECS_ENV: &str = "CLAWCHAT_STREAM_IDLE_SECS";
pub const QUEUE_CAPACITY_ENV: &str = "CLAWCHAT_QUEUE_CAPACITY";

/// Timing and capacity knobs of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncTuning {
    pub stream_retry: RetryPolicy,
    pub stream_idle_timeout: Duration,
    pub socket: ReconnectPolicy,
    pub queue: QueueLimits,
    pub pending_poll: Duration,
    pub undo_window: Duration,
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            stream_retry: RetryPolicy::default(),
            stream_idle_timeout: DEFAULT_IDLE_TIMEOUT,
            socket: ReconnectPolicy::default(),
            queue: QueueLimits::default(),
            pending_poll: DEFAULT_PENDING_POLL,
            undo_window: DEFAULT_UNDO_WINDOW,
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Server base URL. `None` runs every store in local-only mode.
    pub server_url: Option<String>,
    pub token: Option<String>,
    /// Where the offline queue and credentials are persisted.
    pub data_dir: PathBuf,
    pub tuning: SyncTuning,
}

impl ClientConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self {
            server_url: non_empty(SERVER_URL_ENV).map(|url| url.trim_end_matches('/').to_string()),
            token: non_empty(TOKEN_ENV),
            ..Self::default()
        };
        if let Some(dir) = non_empty(DATA_DIR_ENV) {
            config.data_dir = PathBuf::from(dir);
        }

        let tuning = &mut config.tuning;
        if let Some(retries) = parsed::<u32>(STREAM_RETRIES_ENV) {
            tuning.stream_retry.max_retries = retries;
        }
        if let Some(secs) = parsed::<u64>(STREAM_IDLE_SECS_ENV).filter(|secs| *secs > 0) {
            tuning.stream_idle_timeout = Duration::from_secs(secs);
        }
        if let Some(capacity) = parsed::<usize>(QUEUE_CAPACITY_ENV).filter(|cap| *cap > 0) {
            tuning.queue.capacity = capacity;
        }
        config
    }

    pub fn is_local_only(&self) -> bool {
        self.server_url.is_none()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            token: None,
            data_dir: default_data_dir(),
            tuning: SyncTuning::default(),
        }
    }
}

pub fn default_data_dir() -> PathBuf {
    ProjectDirs::from("app", "ClawChat", "clawchat-sync")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".clawchat"))
}

fn non_empty(var: &str) -> Option<String> {
    env::var(var).ok().filter(|value| !value.trim().is_empty())
}

fn parsed<T: FromStr>(var: &str) -> Option<T> {
    let raw = non_empty(var)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(target: "clawchat::sync", var, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}
