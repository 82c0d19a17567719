// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Exchanges a consumer may bind its queue to, including the delayed-message
//! exchange used to redeliver failed messages after a delay
//! (requires the `rabbitmq_delayed_message_exchange` plugin).

use crate::errors::AmqpError;
use lapin::types::{AMQPValue, LongString, ShortString};
use std::collections::BTreeMap;

/// Argument naming the routing behavior of a delayed exchange
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";
/// Broker side type of the delayed exchange
pub const AMQP_DELAYED_MESSAGE_EXCHANGE: &str = "x-delayed-message";

/// Represents the types of exchanges available in RabbitMQ.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    XMessageDelayed,
}

impl TryFrom<&str> for ExchangeKind {
    type Error = AmqpError;

    fn try_from(kind: &str) -> Result<Self, Self::Error> {
        match kind {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            "headers" => Ok(ExchangeKind::Headers),
            AMQP_DELAYED_MESSAGE_EXCHANGE => Ok(ExchangeKind::XMessageDelayed),
            other => Err(AmqpError::ConfigError(format!("exchange kind `{}`", other))),
        }
    }
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::XMessageDelayed => {
                lapin::ExchangeKind::Custom(AMQP_DELAYED_MESSAGE_EXCHANGE.to_owned())
            }
        }
    }
}

/// Definition of a RabbitMQ exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) delete: bool,
    pub(crate) durable: bool,
    pub(crate) passive: bool,
    pub(crate) internal: bool,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl ExchangeDefinition {
    /// Creates a non durable direct exchange named `name`.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            delete: false,
            durable: false,
            passive: false,
            internal: false,
            params: BTreeMap::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn fanout(mut self) -> Self {
        self.kind = ExchangeKind::Fanout;
        self
    }

    pub fn topic(mut self) -> Self {
        self.kind = ExchangeKind::Topic;
        self
    }

    /// Turns the exchange into a delayed exchange routing like `direct`.
    ///
    /// Messages published with an `x-delay` header (milliseconds) are held by
    /// the broker before being routed.
    pub fn direct_delayed(mut self) -> Self {
        self.kind = ExchangeKind::XMessageDelayed;
        self.params.insert(
            ShortString::from(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
            AMQPValue::LongString(LongString::from("direct")),
        );
        self
    }

    pub fn param(mut self, key: &str, value: AMQPValue) -> Self {
        self.params.insert(ShortString::from(key), value);
        self
    }

    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Only checks the exchange exists without creating it.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delayed_exchange_routes_as_direct() {
        let exchange = ExchangeDefinition::new("delayed").direct_delayed();

        assert_eq!(exchange.kind, ExchangeKind::XMessageDelayed);
        assert_eq!(
            exchange.params.get(&ShortString::from(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE)),
            Some(&AMQPValue::LongString(LongString::from("direct")))
        );
        assert!(matches!(
            lapin::ExchangeKind::from(&exchange.kind),
            lapin::ExchangeKind::Custom(kind) if kind == AMQP_DELAYED_MESSAGE_EXCHANGE
        ));
    }

    #[test]
    fn kinds_parse_from_configuration() {
        assert_eq!(ExchangeKind::try_from("topic"), Ok(ExchangeKind::Topic));
        assert!(ExchangeKind::try_from("nope").is_err());
    }
}
