use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::{
    BrokerClient, BrokerRetry, MemoryBroker, QueueError, QueueResult, RetryPolicy,
};

const ENV_PREFIX: &str = "DOG_WORK_";

/// Pool, broker and retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkConfig {
    /// Redis URL; the in-memory broker is used when unset
    #[serde(default)]
    pub broker_url: Option<String>,

    /// Key prefix for every broker key
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Queues to claim from, highest priority first
    #[serde(default = "default_queues")]
    pub queues: Vec<String>,

    /// Job names that must have a registered handler
    #[serde(default)]
    pub jobs: Vec<String>,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    /// Upper bound on concurrently checked-out broker connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Fail a checkout after this long; waits indefinitely when unset
    #[serde(default)]
    pub checkout_timeout_ms: Option<u64>,

    /// Abort in-flight jobs this long after shutdown; unbounded when unset
    #[serde(default)]
    pub drain_timeout_secs: Option<u64>,

    #[serde(default = "default_broker_retry_attempts")]
    pub broker_retry_attempts: u32,
}

fn default_namespace() -> String {
    "dog-work".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_queues() -> Vec<String> {
    vec!["default".to_string()]
}

fn default_max_retries() -> u32 {
    25
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    3_600_000
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_visibility_timeout_secs() -> u64 {
    300
}

fn default_max_connections() -> usize {
    5
}

fn default_broker_retry_attempts() -> u32 {
    3
}

impl Default for WorkConfig {
    fn default() -> Self {
        Self {
            broker_url: None,
            namespace: default_namespace(),
            pool_size: default_pool_size(),
            queues: default_queues(),
            jobs: Vec::new(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            max_connections: default_max_connections(),
            checkout_timeout_ms: None,
            drain_timeout_secs: None,
            broker_retry_attempts: default_broker_retry_attempts(),
        }
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, key))
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> QueueResult<Option<T>> {
    match env_value(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| QueueError::config(format!("{}{} has an invalid value: {}", ENV_PREFIX, key, raw))),
        None => Ok(None),
    }
}

fn env_list(key: &str) -> Option<Vec<String>> {
    env_value(key).map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(String::from)
            .collect()
    })
}

impl WorkConfig {
    /// Defaults overlaid with `DOG_WORK_*` environment variables, validated
    pub fn from_env() -> QueueResult<Self> {
        let mut config = Self::default();

        if let Some(url) = env_value("BROKER_URL") {
            config.broker_url = Some(url);
        }
        if let Some(namespace) = env_value("NAMESPACE") {
            config.namespace = namespace;
        }
        if let Some(pool_size) = env_parse("POOL_SIZE")? {
            config.pool_size = pool_size;
        }
        if let Some(queues) = env_list("QUEUES") {
            config.queues = queues;
        }
        if let Some(jobs) = env_list("JOBS") {
            config.jobs = jobs;
        }
        if let Some(max_retries) = env_parse("MAX_RETRIES")? {
            config.max_retries = max_retries;
        }
        if let Some(base) = env_parse("BACKOFF_BASE_MS")? {
            config.backoff_base_ms = base;
        }
        if let Some(cap) = env_parse("BACKOFF_CAP_MS")? {
            config.backoff_cap_ms = cap;
        }
        if let Some(interval) = env_parse("POLL_INTERVAL_MS")? {
            config.poll_interval_ms = interval;
        }
        if let Some(timeout) = env_parse("VISIBILITY_TIMEOUT_SECS")? {
            config.visibility_timeout_secs = timeout;
        }
        if let Some(max) = env_parse("MAX_CONNECTIONS")? {
            config.max_connections = max;
        }
        if let Some(timeout) = env_parse("CHECKOUT_TIMEOUT_MS")? {
            config.checkout_timeout_ms = Some(timeout);
        }
        if let Some(timeout) = env_parse("DRAIN_TIMEOUT_SECS")? {
            config.drain_timeout_secs = Some(timeout);
        }
        if let Some(attempts) = env_parse("BROKER_RETRY_ATTEMPTS")? {
            config.broker_retry_attempts = attempts;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.pool_size == 0 {
            return Err(QueueError::config("pool_size must be at least 1"));
        }
        if self.queues.is_empty() {
            return Err(QueueError::config("at least one queue is required"));
        }
        if self.queues.iter().any(|queue| queue.trim().is_empty()) {
            return Err(QueueError::config("queue names must not be empty"));
        }
        if self.namespace.is_empty() {
            return Err(QueueError::config("namespace must not be empty"));
        }
        if self.max_connections == 0 {
            return Err(QueueError::config("max_connections must be at least 1"));
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            return Err(QueueError::config("backoff_cap_ms must not be below backoff_base_ms"));
        }
        if self.visibility_timeout_secs == 0 {
            return Err(QueueError::config("visibility_timeout_secs must be at least 1"));
        }
        if self.broker_retry_attempts == 0 {
            return Err(QueueError::config("broker_retry_attempts must be at least 1"));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_cap_ms),
        )
    }

    pub fn broker_retry(&self) -> BrokerRetry {
        BrokerRetry::default().with_max_attempts(self.broker_retry_attempts)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn checkout_timeout(&self) -> Option<Duration> {
        self.checkout_timeout_ms.map(Duration::from_millis)
    }

    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_secs.map(Duration::from_secs)
    }

    /// Client over the configured broker (Redis when `broker_url` is set)
    pub fn broker_client(&self) -> QueueResult<BrokerClient> {
        let broker: Arc<dyn crate::Broker> = match &self.broker_url {
            #[cfg(feature = "redis")]
            Some(url) => {
                let mut pool = crate::broker::redis::RedisPool::new(url, self.max_connections)?;
                if let Some(timeout) = self.checkout_timeout() {
                    pool = pool.with_checkout_timeout(timeout);
                }
                Arc::new(crate::broker::redis::RedisBroker::new(pool, self.namespace.clone()))
            }
            #[cfg(not(feature = "redis"))]
            Some(_) => {
                return Err(QueueError::config("broker_url is set but the `redis` feature is disabled"));
            }
            None => Arc::new(MemoryBroker::new()),
        };

        Ok(self.client_for(broker))
    }

    /// Client over a caller-provided broker with these settings
    pub fn client_for(&self, broker: Arc<dyn crate::Broker>) -> BrokerClient {
        BrokerClient::new(broker)
            .with_retry(self.broker_retry())
            .with_poll_interval(self.poll_interval())
            .with_visibility_timeout(self.visibility_timeout())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = WorkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.queues, vec!["default"]);
        assert!(config.drain_timeout().is_none());
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let config: WorkConfig = serde_json::from_str(r#"{"queues": ["email"], "max_retries": 2}"#).unwrap();

        assert_eq!(config.queues, vec!["email"]);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.pool_size, 10);
        assert_eq!(config.retry_policy().backoff(0), Duration::from_secs(1));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = WorkConfig::default();
        config.pool_size = 0;
        assert!(matches!(config.validate(), Err(QueueError::Config(_))));

        let mut config = WorkConfig::default();
        config.queues.clear();
        assert!(matches!(config.validate(), Err(QueueError::Config(_))));

        let mut config = WorkConfig::default();
        config.backoff_cap_ms = 10;
        assert!(matches!(config.validate(), Err(QueueError::Config(_))));
    }

    #[test]
    fn test_from_env_overrides() {
        // Only this test touches DOG_WORK_* variables
        std::env::set_var("DOG_WORK_QUEUES", "email, reports ,");
        std::env::set_var("DOG_WORK_POOL_SIZE", "4");
        std::env::set_var("DOG_WORK_DRAIN_TIMEOUT_SECS", "30");

        let config = WorkConfig::from_env().unwrap();
        assert_eq!(config.queues, vec!["email", "reports"]);
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.drain_timeout(), Some(Duration::from_secs(30)));

        std::env::set_var("DOG_WORK_POOL_SIZE", "many");
        assert!(matches!(WorkConfig::from_env(), Err(QueueError::Config(_))));

        std::env::remove_var("DOG_WORK_QUEUES");
        std::env::remove_var("DOG_WORK_POOL_SIZE");
        std::env::remove_var("DOG_WORK_DRAIN_TIMEOUT_SECS");
    }

    #[test]
    fn test_memory_client_without_url() {
        let config = WorkConfig::default();
        let client = config.broker_client().unwrap();

        assert_eq!(client.broker().name(), "memory");
        assert_eq!(client.poll_interval(), Duration::from_millis(500));
    }
}
