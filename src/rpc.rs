// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Request/Response over AMQP
//!
//! [`RpcClient`] publishes a request carrying a numeric correlation id and a
//! `reply_to` queue, then blocks on the wait slot of that id until the reply
//! arrives, the timeout elapses or the connection dies.

use crate::{
    connection::AmqpConnection, errors::AmqpError, publisher::JSON_CONTENT_TYPE,
    wait::ChannelManager,
};
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions},
    types::{FieldTable, ShortString},
    BasicProperties, Channel,
};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RpcClient {
    connection: Arc<AmqpConnection>,
    channel: Arc<Channel>,
    reply_queue: String,
    timeout: Duration,
    listener: JoinHandle<()>,
}

impl RpcClient {
    /// Declares an exclusive reply queue on a fresh channel and starts routing
    /// its deliveries to the connection wait slots.
    pub async fn new(connection: Arc<AmqpConnection>) -> Result<RpcClient, AmqpError> {
        let channel = connection.channel().await?;

        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to declare reply queue");
                AmqpError::DeclareQueueError(String::from("reply queue"))
            })?;
        let reply_queue = queue.name().to_string();

        let mut stream = channel
            .basic_consume(
                &reply_queue,
                "",
                BasicConsumeOptions {
                    no_ack: true,
                    exclusive: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to consume reply queue");
                AmqpError::BindingConsumerError(reply_queue.clone())
            })?;

        let waiters = connection.waiters();
        let listener = tokio::spawn(async move {
            while let Some(delivery) = stream.next().await {
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(err) => {
                        error!(error = err.to_string(), "reply queue stream failed");
                        break;
                    }
                };

                let id = correlation_id(&delivery.properties);
                route_reply(&waiters, id, delivery);
            }
            debug!("reply listener stopped");
        });

        Ok(RpcClient {
            connection,
            channel,
            reply_queue,
            timeout: DEFAULT_RPC_TIMEOUT,
            listener,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// Publishes `payload` and waits for the matching reply.
    ///
    /// # Parameters
    /// * `exchange` - Exchange receiving the request
    /// * `routing_key` - Routing key of the request
    /// * `payload` - Request body
    ///
    /// # Returns
    /// The reply delivery, `TimeoutError` when none arrived in time, or
    /// `ChannelClosedError` when the connection is or becomes unusable
    pub async fn call(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<Delivery, AmqpError> {
        if !self.connection.is_connected() {
            warn!(pool = self.connection.pool(), "rpc call on a closed connection");
            return Err(AmqpError::ChannelClosedError);
        }

        let waiters = self.connection.waiters();
        let id = self.connection.next_correlation_id();

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_correlation_id(ShortString::from(id.to_string()))
            .with_reply_to(ShortString::from(self.reply_queue.clone()));

        let publish = async {
            self.channel
                .basic_publish(
                    exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    payload,
                    properties,
                )
                .await
                .map(|_| ())
                .map_err(|err| {
                    error!(error = err.to_string(), "failure to publish request");
                    AmqpError::PublishingError
                })
        };

        request(&waiters, id, self.timeout, publish).await
    }

    pub async fn close(&self) {
        self.listener.abort();
        self.connection.release_channel(&self.channel).await;
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// Registers the slot of `id`, sends the request and waits for its reply.
/// The slot is always removed before returning.
pub(crate) async fn request<T, F>(
    waiters: &ChannelManager<T>,
    id: u64,
    timeout: Duration,
    publish: F,
) -> Result<T, AmqpError>
where
    F: Future<Output = Result<(), AmqpError>>,
{
    if waiters.get(id, true).is_none() {
        return Err(AmqpError::ChannelClosedError);
    }

    if let Err(err) = publish.await {
        waiters.remove(id);
        return Err(err);
    }

    let reply = waiters.wait(id, Some(timeout)).await;
    waiters.remove(id);
    reply
}

/// Hands a reply to the caller waiting on its correlation id.
pub(crate) fn route_reply<T>(waiters: &ChannelManager<T>, id: Option<u64>, reply: T) {
    match id {
        Some(id) => {
            if let Err(err) = waiters.push(id, reply) {
                warn!(error = err.to_string(), id = id, "dropping reply");
            }
        }
        None => warn!("reply without a numeric correlation id"),
    }
}

/// Correlation id of a reply, when it is one of ours.
pub(crate) fn correlation_id(properties: &BasicProperties) -> Option<u64> {
    properties
        .correlation_id()
        .as_ref()
        .and_then(|id| id.as_str().parse().ok())
}
