use std::path::PathBuf;
use std::time::Duration;

use crate::models::DEFAULT_CLIENT_TYPE;
use crate::utils::paths::{resolve_history_db, resolve_log_dir, resolve_root_dir};

/// Default staleness window. Assumes the poller refreshes live state roughly
/// every 10 seconds, so a record has to be absent for about three cycles
/// before it is flagged missing.
pub const DEFAULT_STALE_WINDOW_SECONDS: u64 = 30;
const MIN_STALE_WINDOW_SECONDS: u64 = 5;
const MAX_STALE_WINDOW_SECONDS: u64 = 3600;

const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub struct Settings {
    pub root_dir: PathBuf,
    pub history_db: PathBuf,
    pub log_dir: PathBuf,
    pub log_to_stderr: bool,
    pub stale_window: Duration,
    pub retention_days: u32,
    pub client_type: String,
    pub event_capacity: usize,
}

impl Settings {
    pub fn from_env() -> Self {
        let root_dir = resolve_root_dir();
        let stale_window_seconds = env_usize("MULEBRIDGE_STALE_WINDOW_SECONDS")
            .map(|value| value as u64)
            .unwrap_or(DEFAULT_STALE_WINDOW_SECONDS)
            .clamp(MIN_STALE_WINDOW_SECONDS, MAX_STALE_WINDOW_SECONDS);
        let retention_days = env_usize("MULEBRIDGE_RETENTION_DAYS")
            .map(|value| value.min(u32::MAX as usize) as u32)
            .unwrap_or(0);
        let client_type = std::env::var("MULEBRIDGE_CLIENT_TYPE")
            .ok()
            .map(|value| value.trim().to_ascii_lowercase())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_CLIENT_TYPE.to_string());
        let event_capacity = env_usize("MULEBRIDGE_EVENT_CAPACITY")
            .unwrap_or(DEFAULT_EVENT_CAPACITY)
            .clamp(16, 4096);

        Self {
            history_db: resolve_history_db(&root_dir),
            log_dir: resolve_log_dir(&root_dir),
            root_dir,
            log_to_stderr: env_truthy("MULEBRIDGE_LOG_STDERR"),
            stale_window: Duration::from_secs(stale_window_seconds),
            retention_days,
            client_type,
            event_capacity,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        let root_dir = PathBuf::from(".");
        Self {
            history_db: root_dir.join("data").join("history.db"),
            log_dir: root_dir.join("logs"),
            root_dir,
            log_to_stderr: false,
            stale_window: Duration::from_secs(DEFAULT_STALE_WINDOW_SECONDS),
            retention_days: 0,
            client_type: DEFAULT_CLIENT_TYPE.to_string(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

fn env_truthy(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
        })
        .unwrap_or(false)
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
}
