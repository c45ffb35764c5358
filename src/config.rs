//! Ralph configuration loaded from `ralph.toml`.
//!
//! Every key has a default, so a missing file or a partial one is fine.
//! `RALPH_STORE_PATH` takes precedence over the file's `store_path`.
//! Durations are range-checked on load; out-of-range values are rejected
//! rather than wrapped or saturated.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::DEFAULT_ASYNC_SERVICE_NAME;

pub const CONFIG_FILE: &str = "ralph.toml";
pub const STORE_PATH_ENV: &str = "RALPH_STORE_PATH";

pub const MAX_LEASE_TTL_SECS: u64 = 7 * 24 * 60 * 60;
pub const MAX_RESCHEDULE_DELAY_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Deserialize)]
pub struct RalphConfig {
    /// JSON file holding objects, transitions and jobs.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    /// Service whose jobs the worker picks up.
    #[serde(default = "default_async_service_name")]
    pub async_service_name: String,

    /// How often the worker looks for due jobs.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Delay before a rescheduled job is due again.
    #[serde(default = "default_reschedule_delay_ms")]
    pub reschedule_delay_ms: u64,

    /// How long a worker owns a job without renewing its lease.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,

    /// `tracing` filter directive, used when `RUST_LOG` is not set.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Lease owner name; defaults to `worker-<pid>`.
    #[serde(default)]
    pub worker_id: Option<String>,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("ralph-store.json")
}

fn default_async_service_name() -> String {
    DEFAULT_ASYNC_SERVICE_NAME.to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_reschedule_delay_ms() -> u64 {
    5000
}

fn default_lease_ttl_secs() -> u64 {
    300
}

fn default_log_filter() -> String {
    "ralph=info".to_string()
}

impl Default for RalphConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            async_service_name: default_async_service_name(),
            poll_interval_ms: default_poll_interval_ms(),
            reschedule_delay_ms: default_reschedule_delay_ms(),
            lease_ttl_secs: default_lease_ttl_secs(),
            log_filter: default_log_filter(),
            worker_id: None,
        }
    }
}

impl RalphConfig {
    /// Load `ralph.toml` from the current directory, then apply the environment.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(Path::new(CONFIG_FILE))?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load a config file, falling back to defaults when it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config = toml::from_str::<RalphConfig>(&contents)
            .with_context(|| format!("parsing {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("validating {}", path.display()))?;
        Ok(config)
    }

    /// Reject durations the worker cannot turn into lease expiries or due times.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_LEASE_TTL_SECS).contains(&self.lease_ttl_secs) {
            bail!(
                "lease_ttl_secs must be between 1 and {MAX_LEASE_TTL_SECS}, got {}",
                self.lease_ttl_secs
            );
        }
        if self.reschedule_delay_ms > MAX_RESCHEDULE_DELAY_MS {
            bail!(
                "reschedule_delay_ms must be at most {MAX_RESCHEDULE_DELAY_MS}, got {}",
                self.reschedule_delay_ms
            );
        }
        Ok(())
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup(STORE_PATH_ENV).filter(|p| !p.is_empty()) {
            self.store_path = PathBuf::from(path);
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Clamped to the range [`validate`](Self::validate) accepts.
    pub fn reschedule_delay(&self) -> chrono::Duration {
        let ms = self.reschedule_delay_ms.min(MAX_RESCHEDULE_DELAY_MS);
        i64::try_from(ms)
            .ok()
            .and_then(chrono::TimeDelta::try_milliseconds)
            .unwrap_or_else(chrono::TimeDelta::zero)
    }

    /// Clamped to the range [`validate`](Self::validate) accepts.
    pub fn lease_ttl(&self) -> chrono::Duration {
        let secs = self.lease_ttl_secs.clamp(1, MAX_LEASE_TTL_SECS);
        i64::try_from(secs)
            .ok()
            .and_then(chrono::TimeDelta::try_seconds)
            .unwrap_or_else(|| chrono::TimeDelta::seconds(1))
    }

    pub fn worker_id(&self) -> String {
        self.worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", std::process::id()))
    }
}
