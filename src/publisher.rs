// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Producer
//!
//! Publishes JSON messages with typed headers and propagated trace context.
//! Messages carrying a delay are held by a delayed-message exchange for that
//! many milliseconds before being routed.

use crate::{errors::AmqpError, message::DeliveryChannel, otel};
use lapin::{
    types::{
        AMQPValue, FieldTable, LongInt, LongLongInt, LongString, LongUInt, ShortInt, ShortString,
    },
    BasicProperties,
};
use opentelemetry::Context;
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tracing::{debug, error};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Header read by the delayed-message exchange, in milliseconds
pub const AMQP_HEADERS_DELAY: &str = "x-delay";

/// Header values accepted by [`ProducerMessage`].
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValues {
    ShortString(String),
    LongString(String),
    Int(i16),
    LongInt(i32),
    LongLongInt(i64),
    Uint(u32),
}

impl From<HeaderValues> for AMQPValue {
    fn from(value: HeaderValues) -> Self {
        match value {
            HeaderValues::ShortString(v) => AMQPValue::ShortString(ShortString::from(v)),
            HeaderValues::LongString(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValues::Int(v) => AMQPValue::ShortInt(ShortInt::from(v)),
            HeaderValues::LongInt(v) => AMQPValue::LongInt(LongInt::from(v)),
            HeaderValues::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
            HeaderValues::Uint(v) => AMQPValue::LongUInt(LongUInt::from(v)),
        }
    }
}

/// Message to publish.
#[derive(Debug, Clone, Default)]
pub struct ProducerMessage {
    pub exchange: String,
    pub routing_key: String,
    pub msg_type: Option<String>,
    pub data: Vec<u8>,
    pub headers: HashMap<String, HeaderValues>,
    pub delay_ms: Option<u32>,
}

impl ProducerMessage {
    pub fn new(exchange: &str, routing_key: &str, data: &[u8]) -> ProducerMessage {
        ProducerMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            data: data.to_vec(),
            ..ProducerMessage::default()
        }
    }

    /// Message with `payload` serialized as JSON.
    pub fn json<T: Serialize>(
        exchange: &str,
        routing_key: &str,
        payload: &T,
    ) -> Result<ProducerMessage, AmqpError> {
        let data = serde_json::to_vec(payload).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize payload");
            AmqpError::PublishingError
        })?;

        Ok(ProducerMessage::new(exchange, routing_key, &data))
    }

    pub fn msg_type(mut self, kind: &str) -> Self {
        self.msg_type = Some(kind.to_owned());
        self
    }

    pub fn header(mut self, key: &str, value: HeaderValues) -> Self {
        self.headers.insert(key.to_owned(), value);
        self
    }

    /// Delivers the message after `delay_ms`; requires a delayed exchange.
    pub fn delay(mut self, delay_ms: u32) -> Self {
        self.delay_ms = Some(delay_ms);
        self
    }
}

/// Publishes messages on one channel.
pub struct AmqpProducer {
    channel: Arc<dyn DeliveryChannel>,
}

impl AmqpProducer {
    pub fn new(channel: Arc<dyn DeliveryChannel>) -> Arc<AmqpProducer> {
        Arc::new(AmqpProducer { channel })
    }

    /// Publishes `msg` with the trace context of `ctx` in its headers.
    ///
    /// # Parameters
    /// * `ctx` - OpenTelemetry context for tracing
    /// * `msg` - Exchange, routing key, payload and headers to send
    ///
    /// # Returns
    /// Ok(()) on success or `PublishingError` on failure
    pub async fn publish(&self, ctx: &Context, msg: &ProducerMessage) -> Result<(), AmqpError> {
        debug!(
            exchange = msg.exchange,
            routing_key = msg.routing_key,
            "publishing message"
        );

        self.channel
            .publish(
                &msg.exchange,
                &msg.routing_key,
                &msg.data,
                properties(ctx, msg),
            )
            .await
    }
}

/// Properties of an outgoing message: content type, type, a fresh message id
/// and headers (trace context, user headers and delay).
pub(crate) fn properties(ctx: &Context, msg: &ProducerMessage) -> BasicProperties {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();
    otel::inject(ctx, &mut btree);

    for (key, value) in &msg.headers {
        btree.insert(ShortString::from(key.clone()), value.clone().into());
    }

    if let Some(delay) = msg.delay_ms {
        btree.insert(
            ShortString::from(AMQP_HEADERS_DELAY),
            AMQPValue::LongInt(LongInt::try_from(delay).unwrap_or(LongInt::MAX)),
        );
    }

    BasicProperties::default()
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
        .with_type(ShortString::from(msg.msg_type.clone().unwrap_or_default()))
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_headers(FieldTable::from(btree))
}
