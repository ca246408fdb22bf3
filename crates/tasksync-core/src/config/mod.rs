//! Runtime configuration for the sync core.
//!
//! `SyncSettings` is read from a JSON file (every field optional) and may be
//! overridden from the environment. Values are validated once at load time so
//! services can use them without re-checking.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util::{is_http_url, normalize_text_option};

/// Environment variable overriding `server_url`
pub const SERVER_URL_ENV: &str = "TASKSYNC_SERVER_URL";

const DEFAULT_POLL_INTERVAL_MS: u64 = 30_000;
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 4_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
const DEFAULT_BACKOFF_MAX_MS: u64 = 300_000;
const DEFAULT_OFFLINE_AFTER_FAILURES: u32 = 2;
const DEFAULT_CONFLICT_GRACE_MS: u64 = 1_500;
const DEFAULT_ACTIVITY_DEBOUNCE_MS: u64 = 500;

/// Tunables for connectivity, retries, conflicts and activity batching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SyncSettings {
    /// Base URL of the authoritative server; sync is disabled when absent
    pub server_url: Option<String>,
    pub poll_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Failed attempts after which a change is permanently failed
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Consecutive probe failures before `reconnecting` degrades to `offline`
    pub offline_after_failures: u32,
    /// How long resolved conflicts stay in the active set
    pub conflict_grace_ms: u64,
    pub activity_debounce_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            server_url: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            offline_after_failures: DEFAULT_OFFLINE_AFTER_FAILURES,
            conflict_grace_ms: DEFAULT_CONFLICT_GRACE_MS,
            activity_debounce_ms: DEFAULT_ACTIVITY_DEBOUNCE_MS,
        }
    }
}

impl SyncSettings {
    /// Load settings from a JSON file; a missing file yields defaults.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Self::default().normalized();
        }

        let raw = std::fs::read_to_string(path)?;
        let settings = serde_json::from_str::<Self>(&raw).map_err(|error| {
            Error::Config(format!(
                "failed to parse config at {}: {error}",
                path.display()
            ))
        })?;
        settings.normalized()
    }

    /// Apply environment overrides.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(url) = normalize_text_option(std::env::var(SERVER_URL_ENV).ok()) {
            self.server_url = Some(url);
        }
        self
    }

    /// Validate and normalize every field.
    pub fn normalized(mut self) -> Result<Self> {
        self.server_url = match normalize_text_option(self.server_url.take()) {
            Some(url) if is_http_url(&url) => Some(url.trim_end_matches('/').to_string()),
            Some(_) => {
                return Err(Error::Config(
                    "server_url must include http:// or https://".to_string(),
                ))
            }
            None => None,
        };

        for (name, value) in [
            ("poll_interval_ms", self.poll_interval_ms),
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("request_timeout_ms", self.request_timeout_ms),
            ("backoff_base_ms", self.backoff_base_ms),
            ("activity_debounce_ms", self.activity_debounce_ms),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(Error::Config(
                "backoff_max_ms must not be smaller than backoff_base_ms".to_string(),
            ));
        }
        if self.offline_after_failures == 0 {
            self.offline_after_failures = 1;
        }

        Ok(self)
    }

    pub const fn is_sync_configured(&self) -> bool {
        self.server_url.is_some()
    }

    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub const fn activity_debounce(&self) -> Duration {
        Duration::from_millis(self.activity_debounce_ms)
    }

    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay_ms: self.backoff_base_ms,
            max_delay_ms: self.backoff_max_ms,
        }
    }
}

/// Exponential backoff with a retry ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        SyncSettings::default().retry_policy()
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `retry_count` failures.
    ///
    /// The first failure waits `base_delay_ms`, each further failure doubles
    /// the delay, capped at `max_delay_ms`.
    pub fn delay_after(&self, retry_count: u32) -> u64 {
        let exponent = retry_count.saturating_sub(1).min(32);
        self.base_delay_ms
            .saturating_mul(1_u64 << exponent)
            .min(self.max_delay_ms)
    }

    /// Whether `retry_count` failures exhaust the retry budget.
    pub const fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }
}
