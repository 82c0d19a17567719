// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivered Messages
//!
//! A broker delivery is turned into a [`ConsumerMessage`] handed to user
//! handlers, wrapped in an [`Envelope`] that keeps a back-reference to the
//! channel it arrived on. Settlement goes through the [`DeliveryChannel`]
//! seam so dispatch logic does not depend on a live broker.

use crate::{definition::RedeliveryPolicy, errors::AmqpError, handler::HandlerError};
use async_trait::async_trait;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions, BasicPublishOptions, BasicRejectOptions},
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::error;

/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";
/// Delivery counter maintained by quorum queues
pub const AMQP_HEADERS_DELIVERY_COUNT: &str = "x-delivery-count";

/// Message handed to a [`crate::handler::ConsumerHandler`].
#[derive(Debug, Clone, Default)]
pub struct ConsumerMessage {
    pub consumer: String,
    pub exchange: String,
    pub routing_key: String,
    pub msg_type: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub data: Vec<u8>,
    pub properties: BasicProperties,
}

impl ConsumerMessage {
    pub fn new(consumer: &str, data: &[u8]) -> ConsumerMessage {
        ConsumerMessage {
            consumer: consumer.to_owned(),
            data: data.to_vec(),
            ..ConsumerMessage::default()
        }
    }

    pub fn from_delivery(consumer: &str, delivery: Delivery) -> ConsumerMessage {
        let msg_type = match delivery.properties.kind() {
            Some(kind) => kind.to_string(),
            None => String::default(),
        };

        ConsumerMessage {
            consumer: consumer.to_owned(),
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            msg_type,
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            data: delivery.data,
            properties: delivery.properties,
        }
    }

    pub fn with_delivery_tag(mut self, tag: u64) -> Self {
        self.delivery_tag = tag;
        self
    }

    pub fn with_routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn with_headers(mut self, headers: FieldTable) -> Self {
        self.properties = self.properties.with_headers(headers);
        self
    }

    pub fn redelivered(mut self) -> Self {
        self.redelivered = true;
        self
    }

    pub fn headers(&self) -> FieldTable {
        self.properties.headers().clone().unwrap_or_default()
    }

    /// Deserializes the JSON payload.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_slice(&self.data).map_err(|err| HandlerError::Payload(err.to_string()))
    }

    /// Number of times this message was already redelivered.
    ///
    /// Highest value among the policy's counter header, the first `x-death`
    /// entry and the quorum queue delivery counter.
    pub fn retry_count(&self, policy: &RedeliveryPolicy) -> u32 {
        let Some(headers) = self.properties.headers() else {
            return 0;
        };
        let headers = headers.inner();

        let counter = headers
            .get(policy.count_header.as_str())
            .and_then(amqp_int);

        let x_death = headers
            .get(AMQP_HEADERS_X_DEATH)
            .and_then(|value| value.as_array())
            .and_then(|deaths| deaths.as_slice().first())
            .and_then(|death| death.as_field_table())
            .and_then(|death| death.inner().get(AMQP_HEADERS_COUNT))
            .and_then(amqp_int);

        let deliveries = headers
            .get(AMQP_HEADERS_DELIVERY_COUNT)
            .and_then(amqp_int);

        [counter, x_death, deliveries]
            .into_iter()
            .flatten()
            .max()
            .map(|count| count.clamp(0, u32::MAX as i64) as u32)
            .unwrap_or_default()
    }
}

fn amqp_int(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(v) => Some(*v as i64),
        AMQPValue::ShortShortUInt(v) => Some(*v as i64),
        AMQPValue::ShortInt(v) => Some(*v as i64),
        AMQPValue::ShortUInt(v) => Some(*v as i64),
        AMQPValue::LongInt(v) => Some(*v as i64),
        AMQPValue::LongUInt(v) => Some(*v as i64),
        AMQPValue::LongLongInt(v) => Some(*v),
        _ => None,
    }
}

/// Settlement and republish operations of the channel a message arrived on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;
}

#[async_trait]
impl DeliveryChannel for Channel {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error while ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.basic_nack(
            delivery_tag,
            BasicNackOptions {
                multiple: false,
                requeue,
            },
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "error while nack msg");
            AmqpError::NackMessageError
        })
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error while reject msg");
                AmqpError::RejectMessageError
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        match self
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }
}

/// A delivered message and the channel that has to settle it.
#[derive(Clone)]
pub struct Envelope {
    pub message: ConsumerMessage,
    pub channel: Arc<dyn DeliveryChannel>,
}

impl Envelope {
    pub fn new(message: ConsumerMessage, channel: Arc<dyn DeliveryChannel>) -> Envelope {
        Envelope { message, channel }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::{FieldArray, ShortString};
    use std::collections::BTreeMap;

    fn headers(entries: Vec<(&str, AMQPValue)>) -> FieldTable {
        let mut map = BTreeMap::new();
        for (key, value) in entries {
            map.insert(ShortString::from(key), value);
        }
        FieldTable::from(map)
    }

    fn x_death(count: i64) -> AMQPValue {
        AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::FieldTable(headers(
            vec![(AMQP_HEADERS_COUNT, AMQPValue::LongLongInt(count))],
        ))]))
    }

    #[test]
    fn message_without_headers_was_never_retried() {
        let msg = ConsumerMessage::new("orders", b"{}");

        assert_eq!(msg.retry_count(&RedeliveryPolicy::default()), 0);
    }

    #[test]
    fn retry_count_reads_x_death() {
        let msg = ConsumerMessage::new("orders", b"{}")
            .with_headers(headers(vec![(AMQP_HEADERS_X_DEATH, x_death(2))]));

        assert_eq!(msg.retry_count(&RedeliveryPolicy::default()), 2);
    }

    #[test]
    fn retry_count_takes_the_highest_counter() {
        let msg = ConsumerMessage::new("orders", b"{}").with_headers(headers(vec![
            (AMQP_HEADERS_X_DEATH, x_death(1)),
            ("x-retry-count", AMQPValue::LongInt(4)),
            (AMQP_HEADERS_DELIVERY_COUNT, AMQPValue::LongLongInt(3)),
        ]));

        assert_eq!(msg.retry_count(&RedeliveryPolicy::default()), 4);
    }

    #[test]
    fn retry_count_header_is_configurable() {
        let policy = RedeliveryPolicy {
            count_header: "x-attempts".to_owned(),
            ..RedeliveryPolicy::default()
        };
        let msg = ConsumerMessage::new("orders", b"{}")
            .with_headers(headers(vec![("x-attempts", AMQPValue::ShortUInt(6))]));

        assert_eq!(msg.retry_count(&policy), 6);
        assert_eq!(msg.retry_count(&RedeliveryPolicy::default()), 0);
    }

    #[test]
    fn payload_is_deserialized_from_json() {
        #[derive(serde::Deserialize)]
        struct Order {
            id: u32,
        }

        let msg = ConsumerMessage::new("orders", br#"{"id": 10}"#);
        assert_eq!(msg.json::<Order>().unwrap().id, 10);

        let broken = ConsumerMessage::new("orders", b"not json");
        assert!(matches!(
            broken.json::<Order>(),
            Err(HandlerError::Payload(_))
        ));
    }
}
