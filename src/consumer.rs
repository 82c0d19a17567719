// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Engine
//!
//! Runs every registered consumer on its own channel. Each delivery is
//! wrapped in an [`Envelope`] and submitted to the concurrency limiter of the
//! consumer pool, so handlers of the same pool never exceed the configured
//! limit. A consumer moves through
//! `Unregistered -> Declaring -> Consuming -> (Stopped | Failed)` and is
//! declared again on a fresh channel after a failure when restarts are on.

use crate::{
    concurrent::{Concurrent, ConcurrentPools},
    configs::{Configs, ReconnectConfigs},
    connection::{backoff_delay, AmqpConnectionManager},
    definition::ConsumerDefinition,
    dispatcher::dispatch,
    errors::AmqpError,
    handler::ConsumerHandler,
    message::{ConsumerMessage, DeliveryChannel, Envelope},
    topology::AmqpTopology,
};
use futures_util::{future::join_all, StreamExt};
use lapin::{
    options::{BasicCancelOptions, BasicConsumeOptions, BasicQosOptions},
    types::FieldTable,
    Channel,
};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerState {
    Unregistered,
    Declaring,
    Consuming,
    Stopped,
    Failed,
}

impl ConsumerState {
    pub fn can_transition_to(&self, next: ConsumerState) -> bool {
        use ConsumerState::*;

        matches!(
            (self, next),
            (Unregistered, Declaring)
                | (Declaring, Consuming)
                | (Declaring, Failed)
                | (Declaring, Stopped)
                | (Consuming, Stopped)
                | (Consuming, Failed)
                | (Failed, Declaring)
                | (Failed, Stopped)
        )
    }
}

struct Registration {
    def: Arc<ConsumerDefinition>,
    handler: Arc<dyn ConsumerHandler>,
    state: Arc<Mutex<ConsumerState>>,
}

/// Registry and supervisor of the consumers of a process.
pub struct Consumer {
    connections: Arc<AmqpConnectionManager>,
    pools: Arc<ConcurrentPools>,
    registry: Mutex<HashMap<String, Registration>>,
    shutdown: watch::Sender<bool>,
    drain_timeout: Duration,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Consumer {
    pub fn new(connections: Arc<AmqpConnectionManager>, pools: Arc<ConcurrentPools>) -> Consumer {
        let (shutdown, _) = watch::channel(false);

        Consumer {
            connections,
            pools,
            registry: Mutex::new(HashMap::default()),
            shutdown,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            handles: tokio::sync::Mutex::new(vec![]),
        }
    }

    /// Builds the connection manager and the pools out of `configs`.
    pub fn from_configs(configs: Configs) -> Consumer {
        let pools = Arc::new(ConcurrentPools::new(configs.concurrent.clone()));
        Consumer::new(Arc::new(AmqpConnectionManager::new(configs)), pools)
    }

    /// Time given to in-flight handlers to finish once a consumer stops.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Adds a consumer to the registry, in the `Unregistered` state.
    ///
    /// # Parameters
    /// * `def` - The consumer definition, immutable from now on
    /// * `handler` - User logic invoked for every delivery
    ///
    /// # Returns
    /// `DuplicatedConsumerError` when the name is already taken
    pub fn register(
        &self,
        def: ConsumerDefinition,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<(), AmqpError> {
        let mut registry = self.registry.lock();
        if registry.contains_key(def.name()) {
            error!(consumer = def.name(), "consumer already registered");
            return Err(AmqpError::DuplicatedConsumerError(def.name().to_owned()));
        }

        debug!(consumer = def.name(), queue = def.queue_name(), "consumer registered");
        registry.insert(
            def.name().to_owned(),
            Registration {
                def: Arc::new(def),
                handler,
                state: Arc::new(Mutex::new(ConsumerState::Unregistered)),
            },
        );

        Ok(())
    }

    /// Registers the consumer declared under `name` in the configuration.
    pub fn register_configured(
        &self,
        name: &str,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<(), AmqpError> {
        let Some(cfg) = self
            .connections
            .configs()
            .consumers
            .iter()
            .find(|cfg| cfg.name == name)
        else {
            return Err(AmqpError::UnknownConsumerError(name.to_owned()));
        };

        self.register(ConsumerDefinition::from_configs(cfg)?, handler)
    }

    /// Limiter shared by the consumers of `pool`.
    pub fn concurrent(&self, pool: &str) -> Arc<Concurrent> {
        self.pools.get(pool)
    }

    /// Current state of the consumer `name`, `UnknownConsumerError` if absent.
    pub fn state(&self, name: &str) -> Result<ConsumerState, AmqpError> {
        self.registry
            .lock()
            .get(name)
            .map(|registration| *registration.state.lock())
            .ok_or_else(|| AmqpError::UnknownConsumerError(name.to_owned()))
    }

    /// Spawns every enabled consumer not started yet.
    pub async fn start(&self) -> Result<(), AmqpError> {
        let workers: Vec<Worker> = {
            let registry = self.registry.lock();
            registry
                .values()
                .filter(|registration| {
                    if *registration.state.lock() != ConsumerState::Unregistered {
                        return false;
                    }
                    if !registration.def.is_enabled() {
                        info!(consumer = registration.def.name(), "consumer disabled");
                        return false;
                    }
                    true
                })
                .map(|registration| Worker {
                    def: registration.def.clone(),
                    handler: registration.handler.clone(),
                    state: registration.state.clone(),
                    connections: self.connections.clone(),
                    limiter: self.pools.get(registration.def.pool_name()),
                    shutdown: self.shutdown.subscribe(),
                    drain_timeout: self.drain_timeout,
                })
                .collect()
        };

        let mut handles = self.handles.lock().await;
        for worker in workers {
            worker.transition(ConsumerState::Declaring);
            handles.push(tokio::spawn(worker.run()));
        }

        Ok(())
    }

    /// Stops every consumer and waits for their in-flight handlers to drain.
    pub async fn shutdown(&self) {
        info!("stopping consumers");
        self.shutdown.send_replace(true);

        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for result in join_all(handles).await {
            if let Err(err) = result {
                error!(error = err.to_string(), "consumer task failure");
            }
        }
    }
}

struct Worker {
    def: Arc<ConsumerDefinition>,
    handler: Arc<dyn ConsumerHandler>,
    state: Arc<Mutex<ConsumerState>>,
    connections: Arc<AmqpConnectionManager>,
    limiter: Arc<Concurrent>,
    shutdown: watch::Receiver<bool>,
    drain_timeout: Duration,
}

impl Worker {
    fn transition(&self, next: ConsumerState) {
        let mut state = self.state.lock();
        if !state.can_transition_to(next) {
            warn!(
                consumer = self.def.name(),
                from = ?*state,
                to = ?next,
                "invalid consumer state transition"
            );
            return;
        }

        debug!(consumer = self.def.name(), from = ?*state, to = ?next, "consumer state");
        *state = next;
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn run(mut self) {
        let mut attempt = 0;

        loop {
            match self.consume().await {
                Ok(()) => {
                    info!(consumer = self.def.name(), "consumer stopped");
                    self.transition(ConsumerState::Stopped);
                    return;
                }
                Err(err) => {
                    error!(error = err.to_string(), consumer = self.def.name(), "consumer failed");
                    self.transition(ConsumerState::Failed);
                }
            }

            if !self.def.should_restart() || self.stopping() {
                self.transition(ConsumerState::Stopped);
                return;
            }

            attempt += 1;
            let delay = backoff_delay(&self.reconnect(), attempt);
            warn!(
                consumer = self.def.name(),
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                "restarting consumer"
            );

            tokio::select! {
                _ = self.shutdown.changed() => {
                    self.transition(ConsumerState::Stopped);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            self.transition(ConsumerState::Declaring);
        }
    }

    fn reconnect(&self) -> ReconnectConfigs {
        self.connections
            .configs()
            .rabbitmq(self.def.pool_name())
            .map(|cfg| cfg.reconnect.clone())
            .unwrap_or_default()
    }

    /// Consumes until shutdown (`Ok`) or until the channel fails (`Err`).
    async fn consume(&mut self) -> Result<(), AmqpError> {
        if self.stopping() {
            return Ok(());
        }

        // dialing retries until the broker is back, shutdown must not wait for it
        let connection = tokio::select! {
            _ = self.shutdown.changed() => return Ok(()),
            connection = self.connections.connection(self.def.pool_name()) => connection?,
        };
        let channel = connection.channel().await?;

        let result = self.consume_on(&channel).await;
        connection.release_channel(&channel).await;

        result
    }

    async fn consume_on(&mut self, channel: &Arc<Channel>) -> Result<(), AmqpError> {
        channel
            .basic_qos(self.def.prefetch_count(), BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to define the consumer QoS");
                AmqpError::QoSDeclarationError(self.def.name().to_owned())
            })?;

        if self.def.should_declare() {
            AmqpTopology::for_consumer(&self.def).install(channel).await?;
        }

        let tag = format!("{}-{}", self.def.name(), Uuid::new_v4());
        let mut stream = channel
            .basic_consume(
                self.def.queue_name(),
                &tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::BindingConsumerError(self.def.queue_name().to_owned())
            })?;

        self.transition(ConsumerState::Consuming);
        info!(
            consumer = self.def.name(),
            queue = self.def.queue_name(),
            pool = self.def.pool_name(),
            "consuming"
        );

        let settlement: Arc<dyn DeliveryChannel> = channel.clone();
        let mut in_flight: Vec<JoinHandle<()>> = vec![];

        let result = loop {
            if self.stopping() {
                break Ok(());
            }

            let delivery = tokio::select! {
                _ = self.shutdown.changed() => break Ok(()),
                next = stream.next() => next,
            };

            let delivery = match delivery {
                Some(Ok(delivery)) => delivery,
                Some(Err(err)) => {
                    error!(error = err.to_string(), "errors consume msg");
                    break Err(AmqpError::ConsumerError(err.to_string()));
                }
                None => break Err(AmqpError::ConsumerError(format!("{} stream closed", tag))),
            };

            let envelope = Envelope::new(
                ConsumerMessage::from_delivery(self.def.name(), delivery),
                settlement.clone(),
            );
            let def = self.def.clone();
            let handler = self.handler.clone();
            let task = async move {
                if let Err(err) = dispatch(&def, handler.as_ref(), envelope).await {
                    error!(error = err.to_string(), consumer = def.name(), "error consume msg");
                }
            };

            // an unsettled delivery is requeued by the broker once the channel closes
            let admitted = tokio::select! {
                _ = self.shutdown.changed() => break Ok(()),
                admitted = self.limiter.submit(task) => admitted,
            };

            match admitted {
                Ok(handle) => {
                    in_flight.retain(|handle| !handle.is_finished());
                    in_flight.push(handle);
                }
                Err(err) => break Err(err),
            }
        };

        if channel.status().connected() {
            if let Err(err) = channel
                .basic_cancel(&tag, BasicCancelOptions::default())
                .await
            {
                warn!(error = err.to_string(), consumer = self.def.name(), "failure to cancel consumer");
            }
        }

        drain(self.def.name(), in_flight, self.drain_timeout).await;

        result
    }
}

/// Waits up to `timeout` for the handlers still running and aborts the rest.
///
/// # Parameters
/// * `consumer` - Consumer name, for logging
/// * `in_flight` - Handles of the submitted handlers
/// * `timeout` - Drain budget
///
/// # Returns
/// The number of handlers aborted
async fn drain(consumer: &str, mut in_flight: Vec<JoinHandle<()>>, timeout: Duration) -> usize {
    in_flight.retain(|handle| !handle.is_finished());
    if in_flight.is_empty() {
        return 0;
    }

    debug!(consumer = consumer, in_flight = in_flight.len(), "draining handlers");
    let drained = tokio::time::timeout(timeout, join_all(in_flight.iter_mut())).await;
    if drained.is_ok() {
        return 0;
    }

    let pending: Vec<_> = in_flight.iter().filter(|h| !h.is_finished()).collect();
    warn!(consumer = consumer, pending = pending.len(), "drain timeout, aborting handlers");
    for handle in &pending {
        handle.abort();
    }

    pending.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        configs::{ConcurrentConfigs, ConsumerConfigs, RabbitMQConfigs},
        definition::Enable,
        handler::{HandlerError, HandlerFn, Verdict},
    };

    fn consumer(configs: Configs) -> Consumer {
        Consumer::from_configs(configs)
    }

    fn handler() -> Arc<dyn ConsumerHandler> {
        Arc::new(HandlerFn(|_: ConsumerMessage| async {
            Ok::<_, HandlerError>(Verdict::Ack)
        }))
    }

    async fn wait_for(consumer: &Consumer, name: &str, expected: ConsumerState) {
        let reached = tokio::time::timeout(Duration::from_secs(5), async {
            while consumer.state(name).unwrap() != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;

        assert!(reached.is_ok(), "{} never reached {:?}", name, expected);
    }

    #[test]
    fn state_transitions() {
        use ConsumerState::*;

        assert!(Unregistered.can_transition_to(Declaring));
        assert!(Declaring.can_transition_to(Consuming));
        assert!(Consuming.can_transition_to(Stopped));
        assert!(Consuming.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Declaring));
        assert!(Failed.can_transition_to(Stopped));

        assert!(!Unregistered.can_transition_to(Consuming));
        assert!(!Stopped.can_transition_to(Declaring));
        assert!(!Consuming.can_transition_to(Declaring));
        assert!(!Failed.can_transition_to(Consuming));
    }

    #[test]
    fn duplicated_names_are_rejected() {
        let consumer = consumer(Configs::default());

        assert!(consumer
            .register(ConsumerDefinition::new("orders", "orders"), handler())
            .is_ok());
        assert_eq!(
            consumer.register(ConsumerDefinition::new("orders", "other"), handler()),
            Err(AmqpError::DuplicatedConsumerError("orders".to_owned()))
        );
        assert_eq!(
            consumer.state("orders"),
            Ok(ConsumerState::Unregistered)
        );
        assert_eq!(
            consumer.state("missing"),
            Err(AmqpError::UnknownConsumerError("missing".to_owned()))
        );
    }

    #[test]
    fn pools_use_their_configured_limit() {
        let configs = Configs {
            concurrent: ConcurrentConfigs {
                default_limit: 10,
                limit: HashMap::from([("co".to_owned(), 5)]),
            },
            ..Configs::default()
        };
        let consumer = consumer(configs);

        assert_eq!(consumer.concurrent("default").limit(), 10);
        assert_eq!(consumer.concurrent("co").limit(), 5);
        assert!(Arc::ptr_eq(
            &consumer.concurrent("co"),
            &consumer.concurrent("co")
        ));
    }

    #[tokio::test]
    async fn disabled_consumers_are_not_started() {
        let consumer = consumer(Configs::default());
        consumer
            .register(
                ConsumerDefinition::new("audit", "audit").enable(Enable::Always(false)),
                handler(),
            )
            .unwrap();
        consumer
            .register(
                ConsumerDefinition::new("reports", "reports").enable(Enable::When(|| false)),
                handler(),
            )
            .unwrap();

        consumer.start().await.unwrap();

        assert_eq!(consumer.state("audit"), Ok(ConsumerState::Unregistered));
        assert_eq!(consumer.state("reports"), Ok(ConsumerState::Unregistered));
        consumer.shutdown().await;
    }

    #[tokio::test]
    async fn failing_consumer_without_restart_stops() {
        let consumer = consumer(Configs::default());
        consumer
            .register(
                ConsumerDefinition::new("orders", "orders")
                    .pool("unconfigured")
                    .restart_on_failure(false),
                handler(),
            )
            .unwrap();

        consumer.start().await.unwrap();

        wait_for(&consumer, "orders", ConsumerState::Stopped).await;
        consumer.shutdown().await;
    }

    #[tokio::test]
    async fn failed_consumer_stops_on_shutdown() {
        let consumer = consumer(Configs::default());
        consumer
            .register(
                ConsumerDefinition::new("orders", "orders").pool("unconfigured"),
                handler(),
            )
            .unwrap();

        consumer.start().await.unwrap();
        wait_for(&consumer, "orders", ConsumerState::Failed).await;

        consumer.shutdown().await;

        assert_eq!(consumer.state("orders"), Ok(ConsumerState::Stopped));
    }

    #[tokio::test]
    async fn shutdown_interrupts_a_dial_in_progress() {
        let configs = Configs {
            rabbitmq: HashMap::from([(
                "default".to_owned(),
                RabbitMQConfigs {
                    host: "127.0.0.1".to_owned(),
                    port: 1,
                    ..RabbitMQConfigs::default()
                },
            )]),
            ..Configs::default()
        };
        let consumer = consumer(configs);
        consumer
            .register(ConsumerDefinition::new("orders", "orders"), handler())
            .unwrap();

        consumer.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(consumer.state("orders"), Ok(ConsumerState::Declaring));

        let stopped = tokio::time::timeout(Duration::from_secs(5), consumer.shutdown()).await;

        assert!(stopped.is_ok());
        assert_eq!(consumer.state("orders"), Ok(ConsumerState::Stopped));
    }

    #[tokio::test]
    async fn drain_waits_for_running_handlers() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(());
        });

        let aborted = drain("orders", vec![handle], Duration::from_secs(5)).await;

        assert_eq!(aborted, 0);
        assert_eq!(rx.await, Ok(()));
    }

    #[tokio::test]
    async fn drain_aborts_handlers_past_the_timeout() {
        let (fast_tx, fast_rx) = tokio::sync::oneshot::channel();
        let (slow_tx, slow_rx) = tokio::sync::oneshot::channel::<()>();
        let fast = tokio::spawn(async move {
            let _ = fast_tx.send(());
        });
        let slow = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            let _ = slow_tx.send(());
        });

        let started = std::time::Instant::now();
        let aborted = drain("orders", vec![fast, slow], Duration::from_millis(50)).await;

        assert_eq!(aborted, 1);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(fast_rx.await, Ok(()));
        // the aborted handler is dropped without ever sending
        assert!(slow_rx.await.is_err());
    }

    #[test]
    fn configured_consumers_are_registered_by_name() {
        let configs = Configs {
            consumers: vec![ConsumerConfigs {
                name: "mails".to_owned(),
                queue: "mails".to_owned(),
                pool: "co".to_owned(),
                prefetch: 5,
                ..ConsumerConfigs::default()
            }],
            ..Configs::default()
        };
        let consumer = consumer(configs);

        assert!(consumer.register_configured("mails", handler()).is_ok());
        assert_eq!(consumer.state("mails"), Ok(ConsumerState::Unregistered));
        assert_eq!(
            consumer.register_configured("unknown", handler()),
            Err(AmqpError::UnknownConsumerError("unknown".to_owned()))
        );
    }
}
