// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! Owns one broker connection per pool. Connections are dialed lazily on
//! first use, cached, and redialed transparently once lapin reports them as
//! disconnected or they were invalidated. Every connection carries the
//! bookkeeping of its channels (bounded by `max_channels`) and a
//! [`ChannelManager`] whose pending waits are closed when the connection dies.

use crate::{
    configs::{Configs, RabbitMQConfigs, ReconnectConfigs},
    errors::AmqpError,
    wait::ChannelManager,
};
use lapin::{message::Delivery, types::LongString, Channel, Connection, ConnectionProperties};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// A broker connection together with the channels opened on it.
pub struct AmqpConnection {
    pool: String,
    inner: Connection,
    max_channels: u16,
    channels: Mutex<HashMap<u16, Arc<Channel>>>,
    waiters: Arc<ChannelManager<Delivery>>,
    invalidated: Arc<AtomicBool>,
    correlation_id: AtomicU64,
}

impl AmqpConnection {
    fn new(pool: &str, inner: Connection, max_channels: u16) -> AmqpConnection {
        let waiters = Arc::new(ChannelManager::new());
        let invalidated = Arc::new(AtomicBool::new(false));

        inner.on_error({
            let pool = pool.to_owned();
            let waiters = waiters.clone();
            let invalidated = invalidated.clone();
            move |err| {
                error!(error = err.to_string(), pool = pool, "amqp connection lost");
                invalidated.store(true, Ordering::SeqCst);
                waiters.close_all();
            }
        });

        AmqpConnection {
            pool: pool.to_owned(),
            inner,
            max_channels,
            channels: Mutex::new(HashMap::default()),
            waiters,
            invalidated,
            correlation_id: AtomicU64::new(1),
        }
    }

    /// Name of the pool this connection was dialed for.
    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// Whether the broker link is up and the connection was not invalidated.
    pub fn is_connected(&self) -> bool {
        !self.invalidated.load(Ordering::SeqCst) && self.inner.status().connected()
    }

    /// Opens a new channel, failing once `max_channels` are open.
    ///
    /// Channels closed in the meantime are forgotten first, so they do not
    /// count against the limit.
    ///
    /// # Returns
    /// The channel, `CapacityExceededError` at the limit or `ChannelError`
    /// when the broker refuses it
    pub async fn channel(&self) -> Result<Arc<Channel>, AmqpError> {
        let mut channels = self.channels.lock().await;
        channels.retain(|_, channel| channel.status().connected());
        check_capacity(channels.len(), self.max_channels)?;

        debug!(pool = self.pool, "creating amqp channel...");
        match self.inner.create_channel().await {
            Ok(channel) => {
                debug!(pool = self.pool, id = channel.id(), "channel created");
                let channel = Arc::new(channel);
                channels.insert(channel.id(), channel.clone());
                Ok(channel)
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }

    /// Closes `channel` and frees its slot.
    pub async fn release_channel(&self, channel: &Channel) {
        let mut channels = self.channels.lock().await;
        channels.remove(&channel.id());

        if channel.status().connected() {
            if let Err(err) = channel.close(200, "consumer stopped").await {
                warn!(error = err.to_string(), id = channel.id(), "failure to close channel");
            }
        }
    }

    /// Number of channels currently tracked.
    pub async fn open_channels(&self) -> usize {
        self.channels.lock().await.len()
    }

    /// Wait slots of request/response exchanges running on this connection.
    pub fn waiters(&self) -> Arc<ChannelManager<Delivery>> {
        self.waiters.clone()
    }

    /// Next request id, unique on this connection.
    pub fn next_correlation_id(&self) -> u64 {
        self.correlation_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Marks the connection unusable and fails every pending wait.
    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::SeqCst);
        self.waiters.close_all();
    }

    /// Invalidates the connection, forgets its channels and closes the link.
    pub async fn close(&self) {
        self.invalidate();
        self.channels.lock().await.clear();

        if self.inner.status().connected() {
            if let Err(err) = self.inner.close(200, "shutdown").await {
                warn!(error = err.to_string(), pool = self.pool, "failure to close connection");
            }
        }
    }
}

/// Connection of one pool; `None` until dialed.
type PoolSlot = Arc<Mutex<Option<Arc<AmqpConnection>>>>;

/// Lazily dialed, cached broker connections keyed by pool name.
///
/// Every pool has its own slot, so dialing an unreachable broker only blocks
/// callers of that pool.
pub struct AmqpConnectionManager {
    configs: Configs,
    connections: parking_lot::Mutex<HashMap<String, PoolSlot>>,
}

impl AmqpConnectionManager {
    pub fn new(configs: Configs) -> AmqpConnectionManager {
        AmqpConnectionManager {
            configs,
            connections: parking_lot::Mutex::new(HashMap::default()),
        }
    }

    pub fn configs(&self) -> &Configs {
        &self.configs
    }

    fn slot(&self, pool: &str) -> PoolSlot {
        self.connections
            .lock()
            .entry(pool.to_owned())
            .or_default()
            .clone()
    }

    /// Returns the cached connection of `pool`, dialing it when missing or dead.
    ///
    /// # Parameters
    /// * `pool` - Pool name, selecting `rabbitmq.<pool>` settings
    ///
    /// # Returns
    /// The live connection, `ConfigError` when the pool has no settings or
    /// `ConnectionError` once the configured dial attempts are exhausted
    pub async fn connection(&self, pool: &str) -> Result<Arc<AmqpConnection>, AmqpError> {
        let cfg = self.configs.rabbitmq(pool)?;

        let slot = self.slot(pool);
        let mut current = slot.lock().await;

        if let Some(conn) = current.as_ref() {
            if conn.is_connected() {
                return Ok(conn.clone());
            }

            warn!(pool = pool, "amqp connection invalidated, redialing");
            conn.invalidate();
            *current = None;
        }

        let conn = Arc::new(self.dial(pool, cfg).await?);
        *current = Some(conn.clone());

        Ok(conn)
    }

    /// Opens a channel on the connection of `pool`.
    pub async fn channel(&self, pool: &str) -> Result<Arc<Channel>, AmqpError> {
        self.connection(pool).await?.channel().await
    }

    /// Drops the cached connection of `pool`; the next lookup redials.
    /// A pool being dialed right now has nothing to invalidate and is skipped.
    pub async fn invalidate(&self, pool: &str) {
        let Some(slot) = self.connections.lock().get(pool).cloned() else {
            return;
        };

        let Ok(mut current) = slot.try_lock() else {
            debug!(pool = pool, "pool is dialing, nothing to invalidate");
            return;
        };
        if let Some(conn) = current.take() {
            conn.invalidate();
        }
    }

    /// Closes every established connection. Pools still dialing are skipped.
    pub async fn close(&self) {
        let slots: Vec<_> = self.connections.lock().drain().collect();

        for (pool, slot) in slots {
            let conn = match slot.try_lock() {
                Ok(mut current) => current.take(),
                Err(_) => {
                    debug!(pool = pool, "pool is dialing, skipping close");
                    None
                }
            };

            if let Some(conn) = conn {
                conn.close().await;
            }
        }
    }

    async fn dial(&self, pool: &str, cfg: &RabbitMQConfigs) -> Result<AmqpConnection, AmqpError> {
        let uri = amqp_uri(cfg);
        let mut attempt = 0;

        loop {
            debug!(pool = pool, host = cfg.host, "creating amqp connection...");
            let options = ConnectionProperties::default()
                .with_connection_name(LongString::from(self.configs.app.name.clone()));

            match Connection::connect(&uri, options).await {
                Ok(conn) => {
                    debug!(pool = pool, "amqp connected");
                    return Ok(AmqpConnection::new(pool, conn, cfg.max_channels));
                }
                Err(err) => {
                    attempt += 1;
                    error!(
                        error = err.to_string(),
                        pool = pool,
                        attempt = attempt,
                        "failure to connect"
                    );

                    if cfg.reconnect.max_attempts != 0 && attempt >= cfg.reconnect.max_attempts {
                        return Err(AmqpError::ConnectionError(err.to_string()));
                    }

                    tokio::time::sleep(backoff_delay(&cfg.reconnect, attempt)).await;
                }
            }
        }
    }
}

/// Builds the broker URI; the default vhost `/` is sent as `%2f`.
pub(crate) fn amqp_uri(cfg: &RabbitMQConfigs) -> String {
    let vhost = match cfg.vhost.as_str() {
        "" | "/" => "%2f",
        vhost => vhost.trim_start_matches('/'),
    };

    format!(
        "amqp://{}:{}@{}:{}/{}?heartbeat={}",
        cfg.user, cfg.password, cfg.host, cfg.port, vhost, cfg.heartbeat
    )
}

/// Exponential backoff for the given 1-based attempt, capped at `max_interval_ms`.
pub(crate) fn backoff_delay(cfg: &ReconnectConfigs, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let delay = cfg.initial_interval_ms.saturating_mul(1u64 << exp);

    Duration::from_millis(delay.min(cfg.max_interval_ms))
}

fn check_capacity(open: usize, max: u16) -> Result<(), AmqpError> {
    if open >= max as usize {
        error!(open = open, max = max, "channel capacity exceeded");
        return Err(AmqpError::CapacityExceededError(max));
    }

    Ok(())
}
