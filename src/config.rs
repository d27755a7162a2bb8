//! Engine configuration from environment variables
//!
//! ```text
//! BEACON_TICK_MS=1000
//! BEACON_MAX_WORKERS=32
//! BEACON_PER_TARGET_CONCURRENCY=4
//! BEACON_CONNECTOR_TIMEOUT_MS=30000
//! BEACON_POOL_MAX_CONNECTIONS=10
//! BEACON_POOL_ACQUIRE_TIMEOUT_MS=5000
//! BEACON_HISTORY_LIMIT=100
//! BEACON_DISPATCH_MAX_ATTEMPTS=5
//! BEACON_DISPATCH_BACKOFF_MS=500
//! BEACON_RULES_FILE=/etc/beacon/rules.json
//! BEACON_WEBHOOK_URLS=https://hooks.example.com/a,https://hooks.example.com/b
//! ```

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::alerts::dispatcher::{RetryPolicy, DEFAULT_QUEUE_CAPACITY};
use crate::alerts::scheduler::SchedulerConfig;
use crate::alerts::tracker::DEFAULT_HISTORY_LIMIT;
use crate::connector::PoolSettings;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub scheduler: SchedulerConfig,
    pub pool: PoolSettings,
    /// Upper bound on a single backend query; also capped below each rule's interval
    pub connector_timeout: Duration,
    pub history_limit: usize,
    pub retry: RetryPolicy,
    pub dispatch_queue_capacity: usize,
    /// JSON array of rules seeded at startup
    pub rules_file: Option<PathBuf>,
    pub webhook_urls: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            pool: PoolSettings::default(),
            connector_timeout: Duration::from_secs(30),
            history_limit: DEFAULT_HISTORY_LIMIT,
            retry: RetryPolicy::default(),
            dispatch_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            rules_file: None,
            webhook_urls: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Read configuration from `BEACON_*` variables. Unparseable values keep their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parse = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let millis = |key: &str, default: Duration| {
            parse(key).map(Duration::from_millis).unwrap_or(default)
        };

        let scheduler = SchedulerConfig {
            tick: millis("BEACON_TICK_MS", defaults.scheduler.tick),
            max_workers: parse_or(&lookup, "BEACON_MAX_WORKERS", defaults.scheduler.max_workers),
            per_target_concurrency: parse_or(
                &lookup,
                "BEACON_PER_TARGET_CONCURRENCY",
                defaults.scheduler.per_target_concurrency,
            ),
        };

        let pool = PoolSettings {
            max_connections: parse_or(
                &lookup,
                "BEACON_POOL_MAX_CONNECTIONS",
                defaults.pool.max_connections,
            ),
            acquire_timeout: millis("BEACON_POOL_ACQUIRE_TIMEOUT_MS", defaults.pool.acquire_timeout),
            ..defaults.pool
        };

        let retry = RetryPolicy {
            max_attempts: parse_or(
                &lookup,
                "BEACON_DISPATCH_MAX_ATTEMPTS",
                defaults.retry.max_attempts,
            ),
            initial_backoff: millis("BEACON_DISPATCH_BACKOFF_MS", defaults.retry.initial_backoff),
            ..defaults.retry
        };

        let webhook_urls = lookup("BEACON_WEBHOOK_URLS")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|u| !u.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            scheduler,
            pool,
            connector_timeout: millis("BEACON_CONNECTOR_TIMEOUT_MS", defaults.connector_timeout),
            history_limit: parse_or(&lookup, "BEACON_HISTORY_LIMIT", defaults.history_limit),
            retry,
            dispatch_queue_capacity: defaults.dispatch_queue_capacity,
            rules_file: lookup("BEACON_RULES_FILE")
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            webhook_urls,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.tick.is_zero() {
            return Err(ConfigError::Invalid("BEACON_TICK_MS must be greater than zero".into()));
        }
        if self.scheduler.max_workers == 0 || self.scheduler.per_target_concurrency == 0 {
            return Err(ConfigError::Invalid("worker limits must be greater than zero".into()));
        }
        if self.pool.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "BEACON_POOL_MAX_CONNECTIONS must be greater than zero".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "BEACON_DISPATCH_MAX_ATTEMPTS must be greater than zero".into(),
            ));
        }
        for url in &self.webhook_urls {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::InvalidWebhookUrl(url.clone()));
            }
        }
        Ok(())
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid webhook URL: {0}")]
    InvalidWebhookUrl(String),
}
