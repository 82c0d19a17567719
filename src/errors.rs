// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Consumer
//!
//! `AmqpError` covers every infrastructure failure the crate can surface:
//! dialing the broker, opening channels, waiting on rendezvous slots,
//! declaring topology and settling deliveries. Failures raised by user
//! handlers are modeled separately by [`crate::handler::HandlerError`] and
//! never escape the dispatcher.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Invalid or missing configuration
    #[error("invalid configuration `{0}`")]
    ConfigError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// The wait slot or the channel behind it was closed
    #[error("channel closed")]
    ChannelClosedError,

    /// A value is already pending on the wait slot
    #[error("channel is full")]
    ChannelFullError,

    /// Too many channels open on a single connection
    #[error("channel capacity exceeded `{0}`")]
    CapacityExceededError(u16),

    /// A wait slot timed out before receiving a value
    #[error("timeout waiting for channel")]
    TimeoutError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// No consumer registered under the given name
    #[error("unknown consumer `{0}`")]
    UnknownConsumerError(String),

    /// A consumer with the same name is already registered
    #[error("consumer `{0}` already registered")]
    DuplicatedConsumerError(String),

    /// Error while consuming from a queue
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}
