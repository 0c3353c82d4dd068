//! Environment-driven engine configuration.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `DATABASE_URL` | unset: in-memory event store and read models |
//! | `REDIS_URL` | unset: in-memory bus |
//! | `CLINICFLOW_STREAM_KEY` | `clinicflow:events` |
//! | `CLINICFLOW_DLQ_KEY` | `clinicflow:events:dlq` |
//! | `CLINICFLOW_CONSUMER_GROUP` | `clinicflow.workers` |
//! | `CLINICFLOW_CONSUMER_NAME` | `worker-<pid>` |
//! | `CLINICFLOW_OUTBOX_INTERVAL_MS` | `1000` |
//! | `CLINICFLOW_OUTBOX_BATCH` | `100` |
//! | `CLINICFLOW_MAX_COMMAND_RETRIES` | `3` |

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::command_dispatcher::DEFAULT_MAX_RETRIES;
use crate::outbox::OutboxConfig;

pub const DEFAULT_STREAM_KEY: &str = "clinicflow:events";
pub const DEFAULT_DLQ_KEY: &str = "clinicflow:events:dlq";
pub const DEFAULT_CONSUMER_GROUP: &str = "clinicflow.workers";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a non-negative integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("{var} must be greater than zero")]
    Zero { var: &'static str },
}

/// Broker naming shared by every worker of one deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub stream_key: String,
    pub dlq_key: String,
    pub consumer_group: String,
    pub consumer_name: String,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub broker: BrokerSettings,
    pub outbox: OutboxConfig,
    pub max_command_retries: u32,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. `lookup` returns `None` for unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let or_default = |name: &str, default: &str| non_empty(name).unwrap_or_else(|| default.to_string());

        let interval_ms: u64 = parse_positive(&lookup, "CLINICFLOW_OUTBOX_INTERVAL_MS", 1000)?;
        let batch_size: u32 = parse_positive(&lookup, "CLINICFLOW_OUTBOX_BATCH", 100)?;
        let max_command_retries: u32 = parse_number(&lookup, "CLINICFLOW_MAX_COMMAND_RETRIES", DEFAULT_MAX_RETRIES)?;

        Ok(Self {
            database_url: non_empty("DATABASE_URL"),
            redis_url: non_empty("REDIS_URL"),
            broker: BrokerSettings {
                stream_key: or_default("CLINICFLOW_STREAM_KEY", DEFAULT_STREAM_KEY),
                dlq_key: or_default("CLINICFLOW_DLQ_KEY", DEFAULT_DLQ_KEY),
                consumer_group: or_default("CLINICFLOW_CONSUMER_GROUP", DEFAULT_CONSUMER_GROUP),
                consumer_name: non_empty("CLINICFLOW_CONSUMER_NAME")
                    .unwrap_or_else(|| format!("worker-{}", std::process::id())),
            },
            outbox: OutboxConfig {
                interval: Duration::from_millis(interval_ms),
                batch_size,
                ..OutboxConfig::default()
            },
            max_command_retries,
        })
    }

    #[cfg(feature = "redis")]
    pub fn redis_streams(&self, url: &str) -> crate::event_bus::RedisStreamsConfig {
        let mut config = crate::event_bus::RedisStreamsConfig::new(url, self.broker.consumer_name.clone());
        config.stream_key = self.broker.stream_key.clone();
        config.dlq_key = self.broker.dlq_key.clone();
        config.consumer_group = self.broker.consumer_group.clone();
        config
    }
}

fn parse_number<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(var).filter(|v| !v.trim().is_empty()) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { var, value }),
    }
}

fn parse_positive<T: FromStr + Default + PartialEq>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    let value = parse_number(lookup, var, default)?;
    if value == T::default() {
        return Err(ConfigError::Zero { var });
    }
    Ok(value)
}
