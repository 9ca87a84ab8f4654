//! Job queue configuration.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Configuration for the job queue system.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Redis connection configuration.
    #[serde(default)]
    pub redis: RedisConfig,

    /// Queue naming configuration.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Worker defaults.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Start a worker automatically when routers are merged.
    #[serde(default)]
    pub auto_start_worker: Option<AutoStartWorker>,
}

/// Redis connection configuration.
///
/// Defaults follow the environment contract: `REDIS_HOST`, `REDIS_PORT`,
/// `REDIS_PASSWORD`, `REDIS_DB`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis host.
    #[serde(default = "default_redis_host")]
    pub host: String,

    /// Redis port.
    #[serde(default = "default_redis_port")]
    pub port: u16,

    /// Redis password (empty for none).
    #[serde(default)]
    pub password: String,

    /// Redis logical database.
    #[serde(default)]
    pub db: u8,

    /// Key prefix for all broker keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            password: String::new(),
            db: 0,
            key_prefix: default_key_prefix(),
        }
    }
}

impl RedisConfig {
    /// Reads the connection settings from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            host: env::var("REDIS_HOST").unwrap_or_else(|_| default_redis_host()),
            port: env::var("REDIS_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or_else(default_redis_port),
            password: env::var("REDIS_PASSWORD").unwrap_or_default(),
            db: env::var("REDIS_DB")
                .ok()
                .and_then(|d| d.parse().ok())
                .unwrap_or(0),
            key_prefix: default_key_prefix(),
        }
    }

    /// Renders the connection URL.
    #[must_use]
    pub fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}/{}", self.host, self.port, self.db)
        } else {
            format!("redis://:{}@{}:{}/{}", self.password, self.host, self.port, self.db)
        }
    }
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_key_prefix() -> String {
    "igniter:jobs".to_string()
}

/// Queue naming configuration.
///
/// Queue names on the wire are `<global_prefix>__<queue_prefix>__<base>`,
/// with absent prefixes dropped together with their separator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Application-wide prefix.
    #[serde(default)]
    pub global_prefix: Option<String>,

    /// Queue-group prefix.
    #[serde(default)]
    pub queue_prefix: Option<String>,

    /// Base name used when a job definition names no queue.
    #[serde(default = "default_queue_name")]
    pub default_queue: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            global_prefix: None,
            queue_prefix: None,
            default_queue: default_queue_name(),
        }
    }
}

impl QueueConfig {
    /// Composes the wire-level queue name for a base name.
    #[must_use]
    pub fn full_name(&self, base: &str) -> String {
        let mut name = String::new();
        if let Some(global) = &self.global_prefix {
            name.push_str(global);
            name.push_str("__");
        }
        if let Some(queue) = &self.queue_prefix {
            name.push_str(queue);
            name.push_str("__");
        }
        name.push_str(base);
        name
    }
}

fn default_queue_name() -> String {
    "default".to_string()
}

/// Worker defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Concurrent handler invocations per worker.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Polling interval in milliseconds when the queue is empty.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Shutdown drain timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl WorkerConfig {
    /// Returns the poll interval as a `Duration`.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns the shutdown timeout as a `Duration`.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn default_concurrency() -> usize {
    1
}

fn default_poll_interval() -> u64 {
    100
}

fn default_shutdown_timeout() -> u64 {
    30
}

/// Auto-start worker configuration used at router merge time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoStartWorker {
    /// Concurrency for the auto-started worker.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Attach debug-level lifecycle hooks.
    #[serde(default)]
    pub debug: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_url() {
        let config = RedisConfig::default();
        assert_eq!(config.url(), "redis://localhost:6379/0");

        let config = RedisConfig {
            password: "secret".into(),
            db: 2,
            ..RedisConfig::default()
        };
        assert_eq!(config.url(), "redis://:secret@localhost:6379/2");
    }

    #[test]
    fn test_queue_full_name() {
        let config = QueueConfig::default();
        assert_eq!(config.full_name("default"), "default");

        let config = QueueConfig {
            global_prefix: Some("app".into()),
            queue_prefix: Some("jobs".into()),
            ..QueueConfig::default()
        };
        assert_eq!(config.full_name("emails"), "app__jobs__emails");

        let config = QueueConfig {
            global_prefix: Some("app".into()),
            ..QueueConfig::default()
        };
        assert_eq!(config.full_name("emails"), "app__emails");
    }
}
