// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Definitions
//!
//! A `ConsumerDefinition` names everything the engine needs to run one
//! logical consumer: the queue and its bindings, the pool selecting both the
//! broker connection and the concurrency limiter, the prefetch count, whether
//! it is enabled, and how failed messages are redelivered.
//!
//! Definitions are built explicitly or parsed from [`ConsumerConfigs`] and
//! are immutable once registered on a [`crate::consumer::Consumer`].

use crate::{
    configs::{ConsumerConfigs, DEFAULT_POOL},
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::QueueDefinition,
};

/// Delay exchange used by delayed consumers without an override
pub const DEFAULT_DELAY_EXCHANGE: &str = "delayed";
/// Header carrying the number of redeliveries done by the dispatcher
pub const DEFAULT_RETRY_COUNT_HEADER: &str = "x-retry-count";
pub const DEFAULT_MAX_REDELIVERIES: u32 = 3;
pub const DEFAULT_PREFETCH: u16 = 1;

/// Whether a consumer should run.
#[derive(Debug, Clone, Copy)]
pub enum Enable {
    Always(bool),
    /// Evaluated when the consumer engine starts
    When(fn() -> bool),
}

impl Enable {
    pub fn is_enabled(&self) -> bool {
        match self {
            Enable::Always(enabled) => *enabled,
            Enable::When(predicate) => predicate(),
        }
    }
}

impl Default for Enable {
    fn default() -> Self {
        Enable::Always(true)
    }
}

/// How handler failures are retried before giving up on a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedeliveryPolicy {
    /// Integer header read (and written on delayed republish) as retry count
    pub count_header: String,
    pub max_redeliveries: u32,
    /// Delay before a failed message is delivered again, delayed consumers only
    pub delay_ms: Option<u32>,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        RedeliveryPolicy {
            count_header: DEFAULT_RETRY_COUNT_HEADER.to_owned(),
            max_redeliveries: DEFAULT_MAX_REDELIVERIES,
            delay_ms: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerDefinition {
    pub(crate) name: String,
    pub(crate) queue: QueueDefinition,
    pub(crate) exchange: Option<ExchangeDefinition>,
    pub(crate) routing_keys: Vec<String>,
    pub(crate) pool: String,
    pub(crate) prefetch: u16,
    pub(crate) enable: Enable,
    pub(crate) declare: bool,
    pub(crate) delayed: bool,
    pub(crate) dead_letter_exchange: Option<String>,
    pub(crate) redelivery: RedeliveryPolicy,
    pub(crate) restart_on_failure: bool,
}

impl ConsumerDefinition {
    /// Consumer `name` reading from the queue `queue`.
    pub fn new(name: &str, queue: &str) -> ConsumerDefinition {
        ConsumerDefinition {
            name: name.to_owned(),
            queue: QueueDefinition::new(queue),
            exchange: None,
            routing_keys: vec![],
            pool: DEFAULT_POOL.to_owned(),
            prefetch: DEFAULT_PREFETCH,
            enable: Enable::default(),
            declare: true,
            delayed: false,
            dead_letter_exchange: None,
            redelivery: RedeliveryPolicy::default(),
            restart_on_failure: true,
        }
    }

    /// Parses a declarative definition.
    pub fn from_configs(cfg: &ConsumerConfigs) -> Result<ConsumerDefinition, AmqpError> {
        if cfg.name.is_empty() || cfg.queue.is_empty() {
            return Err(AmqpError::ConfigError(
                "consumer requires a name and a queue".to_owned(),
            ));
        }

        let mut queue = QueueDefinition::new(&cfg.queue);
        if cfg.durable {
            queue = queue.durable();
        }

        let mut def = ConsumerDefinition::new(&cfg.name, &cfg.queue)
            .queue(queue)
            .pool(&cfg.pool)
            .prefetch(cfg.prefetch)
            .enable(Enable::Always(cfg.enable))
            .declare(cfg.declare)
            .max_redeliveries(cfg.max_redeliveries)
            .restart_on_failure(cfg.restart_on_failure);

        if let Some(exchange) = &cfg.exchange {
            let mut exchange = ExchangeDefinition::new(exchange)
                .kind(ExchangeKind::try_from(cfg.exchange_kind.as_str())?);
            if cfg.durable {
                exchange = exchange.durable();
            }
            def = def.exchange(exchange);
        }

        for key in &cfg.routing_keys {
            def = def.routing_key(key);
        }

        if let Some(header) = &cfg.redelivery_header {
            def = def.retry_count_header(header);
        }

        if let Some(delay) = cfg.retry_delay_ms {
            def = def.retry_delay(delay);
        }

        if let Some(exchange) = &cfg.dead_letter_exchange {
            def = def.with_dead_letter_exchange(exchange);
        }

        Ok(def)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue_name(&self) -> &str {
        &self.queue.name
    }

    pub fn pool_name(&self) -> &str {
        &self.pool
    }

    pub fn prefetch_count(&self) -> u16 {
        self.prefetch
    }

    pub fn redelivery(&self) -> &RedeliveryPolicy {
        &self.redelivery
    }

    pub fn is_enabled(&self) -> bool {
        self.enable.is_enabled()
    }

    pub fn is_delayed(&self) -> bool {
        self.delayed
    }

    pub fn should_declare(&self) -> bool {
        self.declare
    }

    pub fn should_restart(&self) -> bool {
        self.restart_on_failure
    }

    /// Effective dead-letter exchange.
    ///
    /// The override wins; delayed consumers without one use
    /// [`DEFAULT_DELAY_EXCHANGE`].
    pub fn dead_letter_exchange(&self) -> Option<&str> {
        match (&self.dead_letter_exchange, self.delayed) {
            (Some(exchange), _) => Some(exchange),
            (None, true) => Some(DEFAULT_DELAY_EXCHANGE),
            (None, false) => None,
        }
    }

    /// Replaces the queue definition, e.g. to make it durable.
    pub fn queue(mut self, queue: QueueDefinition) -> Self {
        self.queue = queue;
        self
    }

    pub fn exchange(mut self, exchange: ExchangeDefinition) -> Self {
        self.exchange = Some(exchange);
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_keys.push(key.to_owned());
        self
    }

    pub fn pool(mut self, pool: &str) -> Self {
        self.pool = pool.to_owned();
        self
    }

    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn enable(mut self, enable: Enable) -> Self {
        self.enable = enable;
        self
    }

    /// Whether the engine declares the topology before consuming.
    pub fn declare(mut self, declare: bool) -> Self {
        self.declare = declare;
        self
    }

    /// Redeliver failed messages through a delay exchange.
    pub fn delayed(mut self) -> Self {
        self.delayed = true;
        self
    }

    /// Overrides the dead-letter exchange; for delayed consumers this is the
    /// delay exchange name.
    pub fn with_dead_letter_exchange(mut self, exchange: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self
    }

    /// Delay applied to failed messages; makes the consumer delayed.
    pub fn retry_delay(mut self, delay_ms: u32) -> Self {
        self.delayed = true;
        self.redelivery.delay_ms = Some(delay_ms);
        self
    }

    pub fn max_redeliveries(mut self, max: u32) -> Self {
        self.redelivery.max_redeliveries = max;
        self
    }

    pub fn retry_count_header(mut self, header: &str) -> Self {
        self.redelivery.count_header = header.to_owned();
        self
    }

    pub fn restart_on_failure(mut self, restart: bool) -> Self {
        self.restart_on_failure = restart;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disabled() -> bool {
        false
    }

    #[test]
    fn delay_exchange_override_is_per_consumer() {
        let delay = ConsumerDefinition::new("delay", "delay.queue")
            .delayed()
            .with_dead_letter_exchange("x-delayed");
        let delay2 = ConsumerDefinition::new("delay2", "delay2.queue").delayed();

        assert_eq!(delay.dead_letter_exchange(), Some("x-delayed"));
        assert_eq!(delay2.dead_letter_exchange(), Some("delayed"));
    }

    #[test]
    fn plain_consumer_has_no_dead_letter_exchange() {
        let def = ConsumerDefinition::new("plain", "plain");

        assert_eq!(def.dead_letter_exchange(), None);
        assert_eq!(def.pool_name(), DEFAULT_POOL);
        assert_eq!(def.prefetch_count(), 1);
        assert!(def.is_enabled());
    }

    #[test]
    fn enable_predicate_is_evaluated() {
        let def = ConsumerDefinition::new("off", "off").enable(Enable::When(disabled));

        assert!(!def.is_enabled());
    }

    #[test]
    fn retry_delay_makes_the_consumer_delayed() {
        let def = ConsumerDefinition::new("retry", "retry").retry_delay(5_000);

        assert!(def.is_delayed());
        assert_eq!(def.redelivery().delay_ms, Some(5_000));
        assert_eq!(def.dead_letter_exchange(), Some(DEFAULT_DELAY_EXCHANGE));
    }

    #[test]
    fn parses_declarative_configuration() {
        let cfg = ConsumerConfigs {
            name: "orders".to_owned(),
            queue: "orders.created".to_owned(),
            exchange: Some("orders".to_owned()),
            exchange_kind: "topic".to_owned(),
            routing_keys: vec!["order.*".to_owned()],
            pool: "co".to_owned(),
            prefetch: 20,
            retry_delay_ms: Some(1_000),
            dead_letter_exchange: Some("x-delayed".to_owned()),
            redelivery_header: Some("x-delivery-count".to_owned()),
            ..ConsumerConfigs::default()
        };

        let def = ConsumerDefinition::from_configs(&cfg).unwrap();

        assert_eq!(def.queue_name(), "orders.created");
        assert!(def.queue.durable);
        assert_eq!(def.exchange.as_ref().unwrap().kind, ExchangeKind::Topic);
        assert_eq!(def.routing_keys, vec!["order.*".to_owned()]);
        assert_eq!(def.pool_name(), "co");
        assert_eq!(def.prefetch_count(), 20);
        assert_eq!(def.dead_letter_exchange(), Some("x-delayed"));
        assert_eq!(def.redelivery().count_header, "x-delivery-count");
    }

    #[test]
    fn configuration_without_queue_is_rejected() {
        let cfg = ConsumerConfigs {
            name: "broken".to_owned(),
            ..ConsumerConfigs::default()
        };

        assert!(matches!(
            ConsumerDefinition::from_configs(&cfg),
            Err(AmqpError::ConfigError(_))
        ));
    }
}
