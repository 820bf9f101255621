//! Pool configuration, read from the process environment.
//!
//! Every knob has a default so the pool runs with an empty environment. Values
//! that fail to parse fall back to the default and log a warning.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::error::PoolError;

/// Where the proxy pool gets its endpoints from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum ProxySourceConfig {
    /// No proxies, every context connects directly.
    None,
    /// Remote proxy hub speaking the JSON protocol.
    Hub(String),
    /// Local vendor rotation endpoint returning one proxy per line.
    Vendor(String),
    /// Fixed comma separated list, e.g. `user:pass@1.2.3.4:8080,5.6.7.8:3128`.
    Static(String),
}

/// Configuration for the whole privacy context subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of live (permanent + temporary) privacy contexts
    pub allowed_privacy_context_count: usize,
    /// Maximum open tabs (driver handles) per browser process
    pub max_open_tabs: usize,
    /// Root of the temporary context directory tree
    pub context_tmp_dir: PathBuf,
    /// Temporary profile directories older than this are reclaimed
    pub context_tmp_dir_expiry: Duration,
    /// Proxy source
    pub proxy_source: ProxySourceConfig,
    /// Bounded wait for a single proxy poll
    pub proxy_poll_timeout: Duration,
    /// Attempts made by `ProxyPool::take` before giving up
    pub proxy_max_retries: usize,
    /// Minimum interval between two loads from the same proxy source
    pub proxy_reload_interval: Duration,
    /// Per-task timeout for a single fetch
    pub fetch_task_timeout: Duration,
    /// Bounded wait for a privacy context when the pool is saturated
    pub context_acquire_timeout: Duration,
    /// Bounded wait for a driver when a browser is at its tab cap
    pub driver_acquire_timeout: Duration,
    /// Bounded wait for the cross-process directory lock
    pub file_lock_timeout: Duration,
    /// How long a closing context waits for in-flight runs to drain
    pub context_close_grace: Duration,
    /// Leak warnings before a temporary context counts as leaked
    pub privacy_max_warnings: u32,
    /// Contexts without activity for this long are retired by maintenance
    pub privacy_context_idle_timeout: Duration,
    /// Size of the sequential agent roster
    pub max_sequential_agents: usize,
    /// Launch browsers headless
    pub browser_headless: bool,
    /// Custom browser binary
    pub browser_path: Option<PathBuf>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            allowed_privacy_context_count: 2,
            max_open_tabs: 8,
            context_tmp_dir: std::env::temp_dir()
                .join("privacy-pool")
                .join("context")
                .join("tmp"),
            context_tmp_dir_expiry: Duration::from_secs(12 * 3600),
            proxy_source: ProxySourceConfig::None,
            proxy_poll_timeout: Duration::from_secs(10),
            proxy_max_retries: 10,
            proxy_reload_interval: Duration::from_secs(10),
            fetch_task_timeout: Duration::from_secs(60),
            context_acquire_timeout: Duration::from_secs(30),
            driver_acquire_timeout: Duration::from_secs(30),
            file_lock_timeout: Duration::from_secs(10),
            context_close_grace: Duration::from_secs(30),
            privacy_max_warnings: 8,
            privacy_context_idle_timeout: Duration::from_secs(30 * 60),
            max_sequential_agents: 10,
            browser_headless: true,
            browser_path: None,
        }
    }
}

impl PoolConfig {
    /// Build the configuration from environment variables, using defaults for
    /// anything missing or malformed. Call `dotenv().ok()` first to pick up a
    /// `.env` file.
    pub fn from_env() -> Self {
        let d = Self::default();

        let proxy_source = if let Some(url) = env_string("PROXY_HUB_URL") {
            ProxySourceConfig::Hub(url)
        } else if let Some(url) = env_string("PROXY_VENDOR_URL") {
            ProxySourceConfig::Vendor(url)
        } else if let Some(list) = env_string("PROXY_LIST") {
            ProxySourceConfig::Static(list)
        } else {
            ProxySourceConfig::None
        };

        Self {
            allowed_privacy_context_count: env_or(
                "PRIVACY_CONTEXT_NUMBER",
                d.allowed_privacy_context_count,
            ),
            max_open_tabs: env_or("BROWSER_MAX_OPEN_TABS", d.max_open_tabs),
            context_tmp_dir: env_string("CONTEXT_TMP_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.context_tmp_dir),
            context_tmp_dir_expiry: env_secs("CONTEXT_TMP_DIR_EXPIRY_SECS", d.context_tmp_dir_expiry),
            proxy_source,
            proxy_poll_timeout: env_millis("PROXY_POLL_TIMEOUT_MS", d.proxy_poll_timeout),
            proxy_max_retries: env_or("PROXY_MAX_RETRIES", d.proxy_max_retries),
            proxy_reload_interval: env_secs("PROXY_RELOAD_INTERVAL_SECS", d.proxy_reload_interval),
            fetch_task_timeout: env_secs("FETCH_TASK_TIMEOUT_SECS", d.fetch_task_timeout),
            context_acquire_timeout: env_secs(
                "CONTEXT_ACQUIRE_TIMEOUT_SECS",
                d.context_acquire_timeout,
            ),
            driver_acquire_timeout: env_secs("DRIVER_ACQUIRE_TIMEOUT_SECS", d.driver_acquire_timeout),
            file_lock_timeout: env_secs("FILE_LOCK_TIMEOUT_SECS", d.file_lock_timeout),
            context_close_grace: env_secs("CONTEXT_CLOSE_GRACE_SECS", d.context_close_grace),
            privacy_max_warnings: env_or("PRIVACY_MAX_WARNINGS", d.privacy_max_warnings),
            privacy_context_idle_timeout: env_secs(
                "PRIVACY_CONTEXT_IDLE_TIMEOUT_SECS",
                d.privacy_context_idle_timeout,
            ),
            max_sequential_agents: env_or("MAX_SEQUENTIAL_AGENTS", d.max_sequential_agents),
            browser_headless: env_or("BROWSER_HEADLESS", d.browser_headless),
            browser_path: env_string("BROWSER_PATH").map(PathBuf::from),
        }
    }

    /// Reject configurations that would make the pool unusable.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.allowed_privacy_context_count == 0 {
            return Err(PoolError::InvalidConfig(
                "PRIVACY_CONTEXT_NUMBER must be at least 1".into(),
            ));
        }
        if self.max_open_tabs == 0 {
            return Err(PoolError::InvalidConfig(
                "BROWSER_MAX_OPEN_TABS must be at least 1".into(),
            ));
        }
        if self.proxy_max_retries == 0 {
            return Err(PoolError::InvalidConfig(
                "PROXY_MAX_RETRIES must be at least 1".into(),
            ));
        }
        if self.max_sequential_agents == 0 {
            return Err(PoolError::InvalidConfig(
                "MAX_SEQUENTIAL_AGENTS must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env_string(key) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "Unparseable config value, using default");
            default
        }),
        None => default,
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_or(key, default.as_secs()))
}

fn env_millis(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_or(key, default.as_millis() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PoolConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.proxy_max_retries, 10);
        assert_eq!(config.context_tmp_dir_expiry, Duration::from_secs(43200));
    }

    #[test]
    fn test_zero_context_count_rejected() {
        let config = PoolConfig {
            allowed_privacy_context_count: 0,
            ..PoolConfig::default()
        };
        assert!(matches!(config.validate(), Err(PoolError::InvalidConfig(_))));
    }

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        std::env::set_var("PRIVACY_POOL_TEST_GARBAGE", "not-a-number");
        assert_eq!(env_or("PRIVACY_POOL_TEST_GARBAGE", 7usize), 7);
        std::env::set_var("PRIVACY_POOL_TEST_GARBAGE", " 12 ");
        assert_eq!(env_or("PRIVACY_POOL_TEST_GARBAGE", 7usize), 12);
        std::env::remove_var("PRIVACY_POOL_TEST_GARBAGE");
    }
}
