use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_parse<T: std::str::FromStr>(profile: &str, key: &str) -> Option<T> {
    profiled_env_opt(profile, key).and_then(|v| v.parse().ok())
}

/// Scheduler configuration, typically parsed from TOML or the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Global cap on concurrently executing tasks. 0 = available parallelism.
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
    /// Cap on concurrently executing tasks issued by a single producer.
    #[serde(default = "default_max_threads_per_producer")]
    pub max_threads_per_producer: usize,
    /// Bound on tasks waiting in a keyed queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// How long a push-style submission waits for queue space.
    #[serde(default = "default_offer_timeout_ms")]
    pub offer_timeout_ms: u64,
    /// Thread name prefix for the execution pool.
    #[serde(default = "default_pool_name")]
    pub pool_name: String,
}

fn default_max_threads() -> usize { 0 }
fn default_max_threads_per_producer() -> usize { 5 }
fn default_queue_capacity() -> usize { 1000 }
fn default_offer_timeout_ms() -> u64 { 1000 }
fn default_pool_name() -> String { "fairshare".to_string() }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_threads: default_max_threads(),
            max_threads_per_producer: default_max_threads_per_producer(),
            queue_capacity: default_queue_capacity(),
            offer_timeout_ms: default_offer_timeout_ms(),
            pool_name: default_pool_name(),
        }
    }
}

impl SchedulerConfig {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `FAIRSHARE_PROFILE`. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let profile = env_opt("FAIRSHARE_PROFILE").unwrap_or_default().to_uppercase();
        let mut config = Self::default();
        config.apply_env_overrides(&profile);
        config.validate()?;
        Ok(config)
    }

    /// Parse config from a TOML string. Environment overrides apply on top.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(toml_str)?;
        let profile = env_opt("FAIRSHARE_PROFILE").unwrap_or_default().to_uppercase();
        config.apply_env_overrides(&profile);
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Apply environment variable overrides.
    ///
    /// - `FAIRSHARE_MAX_THREADS` -> `max_threads`
    /// - `FAIRSHARE_MAX_THREADS_PER_PRODUCER` -> `max_threads_per_producer`
    /// - `FAIRSHARE_QUEUE_CAPACITY` -> `queue_capacity`
    /// - `FAIRSHARE_OFFER_TIMEOUT_MS` -> `offer_timeout_ms`
    /// - `FAIRSHARE_POOL_NAME` -> `pool_name`
    pub(crate) fn apply_env_overrides(&mut self, p: &str) {
        if let Some(v) = profiled_env_parse(p, "FAIRSHARE_MAX_THREADS") {
            self.max_threads = v;
        }
        if let Some(v) = profiled_env_parse(p, "FAIRSHARE_MAX_THREADS_PER_PRODUCER") {
            self.max_threads_per_producer = v;
        }
        if let Some(v) = profiled_env_parse(p, "FAIRSHARE_QUEUE_CAPACITY") {
            self.queue_capacity = v;
        }
        if let Some(v) = profiled_env_parse(p, "FAIRSHARE_OFFER_TIMEOUT_MS") {
            self.offer_timeout_ms = v;
        }
        if let Some(v) = profiled_env_opt(p, "FAIRSHARE_POOL_NAME") {
            self.pool_name = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_threads_per_producer == 0 {
            return Err(ConfigError::Invalid(
                "max_threads_per_producer must be at least 1".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be at least 1".into()));
        }
        Ok(())
    }

    /// Resolve the global thread cap (0 means use available parallelism).
    pub fn resolved_max_threads(&self) -> usize {
        if self.max_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.max_threads
        }
    }

    pub fn offer_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.offer_timeout_ms)
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Scheduler config loaded:");
        tracing::info!("  max_threads:              {}", self.resolved_max_threads());
        tracing::info!("  max_threads_per_producer: {}", self.max_threads_per_producer);
        tracing::info!("  queue_capacity:           {}", self.queue_capacity);
        tracing::info!("  offer_timeout_ms:         {}", self.offer_timeout_ms);
        tracing::info!("  pool_name:                {}", self.pool_name);
    }
}
