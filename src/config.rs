use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_UPDATE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_START_TIMEOUT_MS: u64 = 10_000;

/// Deadlines applied by the client to every operation that can block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    /// Bounds a `notify_received`/`rescan` call end to end: enqueueing plus application.
    pub request_timeout: Duration,
    /// Bounds a single `update` on the live worker.
    pub update_timeout: Duration,
    /// How long a replaced or stopped worker gets to wind down before it is abandoned.
    pub shutdown_timeout: Duration,
    /// How long `start` waits for the previous generation to finish.
    pub start_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            update_timeout: Duration::from_millis(DEFAULT_UPDATE_TIMEOUT_MS),
            shutdown_timeout: Duration::from_millis(DEFAULT_SHUTDOWN_TIMEOUT_MS),
            start_timeout: Duration::from_millis(DEFAULT_START_TIMEOUT_MS),
        }
    }
}

/// On-disk shape: milliseconds, every field optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawClientConfig {
    request_timeout_ms: Option<u64>,
    update_timeout_ms: Option<u64>,
    shutdown_timeout_ms: Option<u64>,
    start_timeout_ms: Option<u64>,
}

impl From<RawClientConfig> for ClientConfig {
    fn from(raw: RawClientConfig) -> Self {
        let ms = |v: Option<u64>, default: u64| Duration::from_millis(v.unwrap_or(default));
        Self {
            request_timeout: ms(raw.request_timeout_ms, DEFAULT_REQUEST_TIMEOUT_MS),
            update_timeout: ms(raw.update_timeout_ms, DEFAULT_UPDATE_TIMEOUT_MS),
            shutdown_timeout: ms(raw.shutdown_timeout_ms, DEFAULT_SHUTDOWN_TIMEOUT_MS),
            start_timeout: ms(raw.start_timeout_ms, DEFAULT_START_TIMEOUT_MS),
        }
    }
}

impl ClientConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        let raw: RawClientConfig = serde_json::from_str(s).context("invalid client config")?;
        Ok(raw.into())
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("reading client config {}", path.display()))?;
        Self::from_json_str(&s)
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_update_timeout(mut self, timeout: Duration) -> Self {
        self.update_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }
}
