// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers
//!
//! User logic receives a [`ConsumerMessage`] and answers with a [`Verdict`].
//! Handlers never settle messages themselves; the dispatcher maps the verdict
//! to exactly one ack, nack or reject.

use crate::message::ConsumerMessage;
use async_trait::async_trait;
use std::future::Future;
use thiserror::Error;

/// Outcome a handler asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Processed, remove from the queue
    Ack,
    /// Nack and put back in the queue
    Requeue,
    /// Nack without requeue
    Drop,
    /// Reject without requeue, dead-lettered when the queue has a DLX
    Reject,
}

/// Failure raised by user logic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("failure to parse payload `{0}`")]
    Payload(String),

    #[error("handler failure `{0}`")]
    Failure(String),

    #[error("handler panicked")]
    Panicked,
}

#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn consume(&self, msg: &ConsumerMessage) -> Result<Verdict, HandlerError>;
}

/// Adapts an async closure into a [`ConsumerHandler`].
pub struct HandlerFn<F>(pub F);

#[async_trait]
impl<F, Fut> ConsumerHandler for HandlerFn<F>
where
    F: Fn(ConsumerMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Verdict, HandlerError>> + Send + 'static,
{
    async fn consume(&self, msg: &ConsumerMessage) -> Result<Verdict, HandlerError> {
        (self.0)(msg.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closures_act_as_handlers() {
        let handler = HandlerFn(|msg: ConsumerMessage| async move {
            match msg.data.is_empty() {
                true => Err(HandlerError::Failure("empty".to_owned())),
                false => Ok(Verdict::Ack),
            }
        });

        assert_eq!(
            handler.consume(&ConsumerMessage::new("c", b"x")).await,
            Ok(Verdict::Ack)
        );
        assert!(handler.consume(&ConsumerMessage::new("c", b"")).await.is_err());
    }
}
