// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Topology
//!
//! Declares the exchanges, queues and bindings a consumer relies on before it
//! starts consuming. A topology is usually derived from a
//! [`ConsumerDefinition`] with [`AmqpTopology::for_consumer`]; it is installed
//! on the consumer's own channel while the consumer is `Declaring`.

use crate::{
    definition::ConsumerDefinition,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel,
};
use tracing::{debug, error};

/// Exchanges, queues and bindings installed together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AmqpTopology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl AmqpTopology {
    pub fn new() -> AmqpTopology {
        AmqpTopology::default()
    }

    /// Topology needed by `def`: its exchange with one binding per routing
    /// key, and either the delay exchange bound back to the queue (delayed
    /// consumers) or the queue's dead-letter argument (plain consumers with
    /// an override).
    ///
    /// A delayed consumer's queue never dead-letters into its own delay
    /// exchange, which would route rejected messages straight back to it.
    pub fn for_consumer(def: &ConsumerDefinition) -> AmqpTopology {
        let mut topology = AmqpTopology::new();
        let mut queue = def.queue.clone();

        if let Some(exchange) = &def.exchange {
            topology = topology.exchange(exchange.clone());

            let keys = if def.routing_keys.is_empty() {
                vec![String::default()]
            } else {
                def.routing_keys.clone()
            };
            for key in keys {
                topology = topology.queue_binding(
                    QueueBinding::new(&queue.name)
                        .exchange(&exchange.name)
                        .routing_key(&key),
                );
            }
        }

        match (def.dead_letter_exchange(), def.is_delayed()) {
            (Some(dlx), true) => {
                topology = topology
                    .exchange(ExchangeDefinition::new(dlx).durable().direct_delayed())
                    .queue_binding(
                        QueueBinding::new(&queue.name)
                            .exchange(dlx)
                            .routing_key(&queue.name),
                    );
            }
            (Some(dlx), false) => queue = queue.dead_letter_exchange(dlx),
            (None, _) => {}
        }

        topology.queue(queue)
    }

    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Installs the topology: exchanges first, then queues, then bindings.
    pub async fn install(&self, channel: &Channel) -> Result<(), AmqpError> {
        self.install_exchange(channel).await?;
        self.install_queue(channel).await?;
        self.binding_queues(channel).await
    }

    async fn install_exchange(&self, channel: &Channel) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);

            match channel
                .exchange_declare(
                    &exch.name,
                    lapin::ExchangeKind::from(&exch.kind),
                    ExchangeDeclareOptions {
                        passive: exch.passive,
                        durable: exch.durable,
                        auto_delete: exch.delete,
                        internal: exch.internal,
                        nowait: false,
                    },
                    FieldTable::from(exch.params.clone()),
                )
                .await
            {
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        name = exch.name,
                        "error to declare the exchange"
                    );
                    Err(AmqpError::DeclareExchangeError(exch.name.clone()))
                }
                _ => Ok(()),
            }?;

            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    async fn install_queue(&self, channel: &Channel) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name);

            match channel
                .queue_declare(
                    &def.name,
                    QueueDeclareOptions {
                        passive: def.passive,
                        durable: def.durable,
                        exclusive: def.exclusive,
                        auto_delete: def.delete,
                        nowait: false,
                    },
                    def.arguments(),
                )
                .await
            {
                Err(err) => {
                    error!(error = err.to_string(), name = def.name, "error to declare the queue");
                    Err(AmqpError::DeclareQueueError(def.name.clone()))
                }
                _ => {
                    debug!("queue: {} was created", def.name);
                    Ok(())
                }
            }?;
        }

        Ok(())
    }

    async fn binding_queues(&self, channel: &Channel) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );

            match channel
                .queue_bind(
                    &binding.queue_name,
                    &binding.exchange_name,
                    &binding.routing_key,
                    QueueBindOptions { nowait: false },
                    FieldTable::default(),
                )
                .await
            {
                Err(err) => {
                    error!(error = err.to_string(), "error to bind queue to exchange");

                    Err(AmqpError::BindingExchangeToQueueError(
                        binding.exchange_name.clone(),
                        binding.queue_name.clone(),
                    ))
                }
                _ => Ok(()),
            }?;
        }

        Ok(())
    }
}
