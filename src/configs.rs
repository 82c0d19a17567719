// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Configuration
//!
//! Typed configuration for broker connections, concurrency pools and
//! declarative consumer definitions. Values are read with the `config` crate
//! from an optional file and from `AMQP__`-prefixed environment variables,
//! e.g. `AMQP__CONCURRENT__LIMIT__CO=5` or `AMQP__RABBITMQ__DEFAULT__HOST=mq`.

use crate::errors::AmqpError;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::error;

/// Pool name used when a consumer or lookup does not name one
pub const DEFAULT_POOL: &str = "default";
/// Concurrency limit applied to pools without an explicit entry
pub const DEFAULT_CONCURRENT_LIMIT: usize = 10;

const ENV_PREFIX: &str = "AMQP";
const ENV_SEPARATOR: &str = "__";

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Configs {
    pub app: AppConfigs,
    /// Broker connection settings keyed by pool name
    pub rabbitmq: HashMap<String, RabbitMQConfigs>,
    pub concurrent: ConcurrentConfigs,
    pub consumers: Vec<ConsumerConfigs>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfigs {
    pub name: String,
}

impl Default for AppConfigs {
    fn default() -> Self {
        Self {
            name: "amqp-consumer".to_owned(),
        }
    }
}

/// Connection parameters of one broker pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub user: String,
    pub password: String,
    /// Heartbeat interval in seconds, 0 disables heartbeats
    pub heartbeat: u16,
    /// Maximum number of channels opened on one connection
    pub max_channels: u16,
    pub reconnect: ReconnectConfigs,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 5672,
            vhost: "/".to_owned(),
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            heartbeat: 60,
            max_channels: 64,
            reconnect: ReconnectConfigs::default(),
        }
    }
}

/// Backoff applied while (re)dialing the broker and restarting consumers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfigs {
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    /// 0 retries forever
    pub max_attempts: u32,
}

impl Default for ReconnectConfigs {
    fn default() -> Self {
        Self {
            initial_interval_ms: 500,
            max_interval_ms: 30_000,
            max_attempts: 0,
        }
    }
}

/// Per pool concurrency limits (`concurrent.limit.<pool>`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConcurrentConfigs {
    pub default_limit: usize,
    pub limit: HashMap<String, usize>,
}

impl Default for ConcurrentConfigs {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_CONCURRENT_LIMIT,
            limit: HashMap::default(),
        }
    }
}

impl ConcurrentConfigs {
    /// Limit for the given pool, 0 meaning unlimited.
    pub fn limit_for(&self, pool: &str) -> usize {
        self.limit.get(pool).copied().unwrap_or(self.default_limit)
    }
}

/// Declarative consumer definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfigs {
    pub name: String,
    pub queue: String,
    pub exchange: Option<String>,
    /// `direct`, `fanout`, `topic` or `headers`
    pub exchange_kind: String,
    pub routing_keys: Vec<String>,
    pub pool: String,
    pub prefetch: u16,
    pub enable: bool,
    pub declare: bool,
    pub durable: bool,
    pub dead_letter_exchange: Option<String>,
    pub max_redeliveries: u32,
    pub retry_delay_ms: Option<u32>,
    pub redelivery_header: Option<String>,
    pub restart_on_failure: bool,
}

impl Default for ConsumerConfigs {
    fn default() -> Self {
        Self {
            name: String::default(),
            queue: String::default(),
            exchange: None,
            exchange_kind: "direct".to_owned(),
            routing_keys: vec![],
            pool: DEFAULT_POOL.to_owned(),
            prefetch: 1,
            enable: true,
            declare: true,
            durable: true,
            dead_letter_exchange: None,
            max_redeliveries: 3,
            retry_delay_ms: None,
            redelivery_header: None,
            restart_on_failure: true,
        }
    }
}

impl Configs {
    /// Loads the configuration from an optional file and the environment.
    pub fn load(path: Option<&str>) -> Result<Configs, AmqpError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }

        let cfg = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).separator(ENV_SEPARATOR))
            .build()
            .map_err(|err| {
                error!(error = err.to_string(), "failure to read configuration");
                AmqpError::ConfigError(err.to_string())
            })?;

        Self::from_config(cfg)
    }

    /// Deserializes an already built `config::Config`.
    pub fn from_config(cfg: Config) -> Result<Configs, AmqpError> {
        cfg.try_deserialize::<Configs>().map_err(|err| {
            error!(error = err.to_string(), "failure to parse configuration");
            AmqpError::ConfigError(err.to_string())
        })
    }

    /// Connection settings for `pool`.
    pub fn rabbitmq(&self, pool: &str) -> Result<&RabbitMQConfigs, AmqpError> {
        self.rabbitmq
            .get(pool)
            .ok_or_else(|| AmqpError::ConfigError(format!("rabbitmq.{}", pool)))
    }
}
