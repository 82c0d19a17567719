// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatch
//!
//! Runs the handler of one delivery and settles the delivery exactly once:
//!
//! 1. Opens a consumer span from the trace context in the headers
//! 2. Invokes the handler, turning panics into [`HandlerError::Panicked`]
//! 3. Maps a verdict to ack, nack or reject
//! 4. On failure, rejects once the redelivery budget is spent, otherwise
//!    republishes the message with its retry counter bumped, through the
//!    delay exchange for delayed consumers or straight back to the queue.
//!    A plain nack would leave the counter untouched on classic queues.

use crate::{
    definition::ConsumerDefinition,
    errors::AmqpError,
    handler::{ConsumerHandler, HandlerError, Verdict},
    message::{ConsumerMessage, DeliveryChannel, Envelope},
    otel,
    publisher::AMQP_HEADERS_DELAY,
};
use futures_util::FutureExt;
use lapin::{
    types::{AMQPValue, FieldTable, LongInt, LongLongInt, ShortString},
    BasicProperties,
};
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{borrow::Cow, panic::AssertUnwindSafe};
use tracing::{debug, error, warn};

/// Default exchange, routing by queue name
const DEFAULT_EXCHANGE: &str = "";

/// How a delivery ended up being settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Requeued,
    Dropped,
    Rejected,
    /// Republished to the queue with the retry counter bumped and acked
    Retried,
    /// Republished to the delay exchange and acked
    Delayed,
}

/// Handles one delivery of the consumer `def`.
pub async fn dispatch(
    def: &ConsumerDefinition,
    handler: &dyn ConsumerHandler,
    envelope: Envelope,
) -> Result<Settlement, AmqpError> {
    let Envelope { message, channel } = envelope;

    let tracer = global::tracer(otel::CONSUMER_TRACER);
    let (_ctx, mut span) = otel::new_span(&message.properties, &tracer, &def.name);

    debug!(
        consumer = def.name,
        delivery_tag = message.delivery_tag,
        "received: {} - exchange: {}",
        message.msg_type,
        message.exchange,
    );

    let result = match AssertUnwindSafe(handler.consume(&message))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(_) => Err(HandlerError::Panicked),
    };

    let settlement = match result {
        Ok(verdict) => {
            debug!(consumer = def.name, verdict = ?verdict, "message processed");
            settle(channel.as_ref(), message.delivery_tag, verdict).await
        }
        Err(err) => {
            error!(error = err.to_string(), consumer = def.name, "error while handling msg");
            span.record_error(&err);
            on_failure(def, channel.as_ref(), &message).await
        }
    };

    match &settlement {
        Ok(_) => span.set_status(Status::Ok),
        Err(err) => {
            span.record_error(err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });
        }
    }

    settlement
}

async fn on_failure(
    def: &ConsumerDefinition,
    channel: &dyn DeliveryChannel,
    message: &ConsumerMessage,
) -> Result<Settlement, AmqpError> {
    let policy = def.redelivery();
    let count = message.retry_count(policy);

    if count >= policy.max_redeliveries {
        error!(
            consumer = def.name,
            count = count,
            "too many attempts, rejecting message"
        );
        return settle(channel, message.delivery_tag, Verdict::Reject).await;
    }

    let (exchange, delay, settlement) = match (
        def.is_delayed(),
        policy.delay_ms,
        def.dead_letter_exchange(),
    ) {
        (true, Some(delay), Some(exchange)) => (exchange, Some(delay), Settlement::Delayed),
        _ => (DEFAULT_EXCHANGE, None, Settlement::Retried),
    };

    warn!(
        consumer = def.name,
        exchange = exchange,
        count = count,
        delay = ?delay,
        "republishing msg for a later retry"
    );

    let properties = retry_properties(&message.properties, &policy.count_header, count + 1, delay);
    match channel
        .publish(exchange, def.queue_name(), &message.data, properties)
        .await
    {
        Ok(()) => channel
            .ack(message.delivery_tag)
            .await
            .map(|_| settlement),
        Err(err) => {
            error!(error = err.to_string(), "failure to republish msg, requeuing");
            settle(channel, message.delivery_tag, Verdict::Requeue).await
        }
    }
}

async fn settle(
    channel: &dyn DeliveryChannel,
    delivery_tag: u64,
    verdict: Verdict,
) -> Result<Settlement, AmqpError> {
    match verdict {
        Verdict::Ack => channel.ack(delivery_tag).await.map(|_| Settlement::Acked),
        Verdict::Requeue => channel
            .nack(delivery_tag, true)
            .await
            .map(|_| Settlement::Requeued),
        Verdict::Drop => channel
            .nack(delivery_tag, false)
            .await
            .map(|_| Settlement::Dropped),
        Verdict::Reject => channel
            .reject(delivery_tag, false)
            .await
            .map(|_| Settlement::Rejected),
    }
}

/// Delivery properties with the retry counter bumped and, when given, the
/// delay set.
fn retry_properties(
    properties: &BasicProperties,
    count_header: &str,
    count: u32,
    delay_ms: Option<u32>,
) -> BasicProperties {
    let mut headers = properties.headers().clone().unwrap_or_default().inner().clone();

    headers.insert(
        ShortString::from(count_header),
        AMQPValue::LongLongInt(LongLongInt::from(count)),
    );
    match delay_ms {
        Some(delay) => {
            headers.insert(
                ShortString::from(AMQP_HEADERS_DELAY),
                AMQPValue::LongInt(LongInt::try_from(delay).unwrap_or(LongInt::MAX)),
            );
        }
        None => {
            headers.remove(AMQP_HEADERS_DELAY);
        }
    }

    properties.clone().with_headers(FieldTable::from(headers))
}
