// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Wait Channels
//!
//! A synchronous call/response protocol on top of asynchronous broker
//! callbacks. A caller registers a [`WaitSlot`] under an id, publishes its
//! request and waits; the delivery callback pushes the reply into the slot
//! with the same id from another task.
//!
//! A slot holds at most one value. Once closed every waiter fails with
//! [`AmqpError::ChannelClosedError`] instead of blocking forever.

use crate::errors::AmqpError;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::Notify;
use tracing::debug;

/// Single value rendezvous between a producer and one waiter.
#[derive(Debug)]
pub struct WaitSlot<T> {
    state: Mutex<SlotState<T>>,
    notify: Notify,
}

#[derive(Debug)]
struct SlotState<T> {
    value: Option<T>,
    closed: bool,
}

impl<T> Default for WaitSlot<T> {
    fn default() -> Self {
        WaitSlot {
            state: Mutex::new(SlotState {
                value: None,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }
}

impl<T> WaitSlot<T> {
    pub fn new() -> WaitSlot<T> {
        WaitSlot::default()
    }

    /// Hands `value` to the waiter, or keeps it for the next one.
    ///
    /// # Parameters
    /// * `value` - The reply to deliver
    ///
    /// # Returns
    /// `ChannelFullError` when a value is already pending and
    /// `ChannelClosedError` once the slot was closed
    pub fn push(&self, value: T) -> Result<(), AmqpError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(AmqpError::ChannelClosedError);
            }
            if state.value.is_some() {
                return Err(AmqpError::ChannelFullError);
            }
            state.value = Some(value);
        }

        self.notify.notify_waiters();
        Ok(())
    }

    /// Waits until a value is pushed or the slot is closed.
    pub async fn pop(&self) -> Result<T, AmqpError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register interest before looking at the state so a push in
            // between is not missed
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(AmqpError::ChannelClosedError);
                }
                if let Some(value) = state.value.take() {
                    return Ok(value);
                }
            }

            notified.await;
        }
    }

    /// Closes the slot and wakes the waiter. A pending value is discarded.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// Registry of wait slots keyed by channel or correlation id.
///
/// Once [`ChannelManager::close_all`] ran the manager stays closed: no slot
/// can be created anymore, so every later wait fails right away.
#[derive(Debug)]
pub struct ChannelManager<T> {
    slots: Mutex<HashMap<u64, Arc<WaitSlot<T>>>>,
    closed: AtomicBool,
}

impl<T> Default for ChannelManager<T> {
    fn default() -> Self {
        ChannelManager {
            slots: Mutex::new(HashMap::default()),
            closed: AtomicBool::new(false),
        }
    }
}

impl<T> ChannelManager<T> {
    pub fn new() -> ChannelManager<T> {
        ChannelManager::default()
    }

    /// Returns the slot of `id`, creating it when `create` is set.
    ///
    /// # Parameters
    /// * `id` - Channel or correlation id
    /// * `create` - Whether a missing slot should be created
    ///
    /// # Returns
    /// The slot, or None when it does not exist or the manager is closed
    pub fn get(&self, id: u64, create: bool) -> Option<Arc<WaitSlot<T>>> {
        let mut slots = self.slots.lock();
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        if create {
            return Some(slots.entry(id).or_default().clone());
        }

        slots.get(&id).cloned()
    }

    /// Pushes into an existing slot.
    pub fn push(&self, id: u64, value: T) -> Result<(), AmqpError> {
        match self.get(id, false) {
            Some(slot) => slot.push(value),
            None => Err(AmqpError::ChannelClosedError),
        }
    }

    /// Waits for the value of `id`.
    ///
    /// Unknown ids fail right away. When `timeout` elapses the slot is
    /// removed so a late reply cannot be picked up by a later caller.
    pub async fn wait(&self, id: u64, timeout: Option<Duration>) -> Result<T, AmqpError> {
        let Some(slot) = self.get(id, false) else {
            debug!(id = id, "waiting on unknown channel");
            return Err(AmqpError::ChannelClosedError);
        };

        match timeout {
            None => slot.pop().await,
            Some(timeout) => match tokio::time::timeout(timeout, slot.pop()).await {
                Ok(result) => result,
                Err(_) => {
                    debug!(id = id, "wait channel timeout");
                    self.remove(id);
                    Err(AmqpError::TimeoutError)
                }
            },
        }
    }

    /// Closes and forgets the slot of `id`, waking its waiter.
    pub fn close(&self, id: u64) {
        if let Some(slot) = self.remove(id) {
            slot.close();
        }
    }

    /// Forgets the slot of `id` without closing it.
    pub fn remove(&self, id: u64) -> Option<Arc<WaitSlot<T>>> {
        self.slots.lock().remove(&id)
    }

    /// Closes every slot and the manager itself, used when the owning
    /// connection goes away.
    pub fn close_all(&self) {
        let slots: Vec<_> = {
            let mut slots = self.slots.lock();
            self.closed.store(true, Ordering::SeqCst);
            slots.drain().collect()
        };
        for (id, slot) in slots {
            debug!(id = id, "closing wait channel");
            slot.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pushed_value_is_returned_to_the_waiter() {
        let manager = ChannelManager::<String>::new();
        let slot = manager.get(1, true).unwrap();

        slot.push("reply-1".to_owned()).unwrap();

        assert_eq!(manager.wait(1, None).await.unwrap(), "reply-1");
    }

    #[tokio::test]
    async fn closed_slot_fails_instead_of_hanging() {
        let manager = ChannelManager::<String>::new();
        let slot = manager.get(1, true).unwrap();
        slot.push("reply".to_owned()).unwrap();
        assert_eq!(manager.wait(1, None).await.unwrap(), "reply");

        slot.close();

        assert_eq!(
            manager.wait(1, None).await,
            Err(AmqpError::ChannelClosedError)
        );
    }

    #[tokio::test]
    async fn close_wakes_a_blocked_waiter() {
        let manager = Arc::new(ChannelManager::<u32>::new());
        manager.get(7, true);

        let waiter = tokio::spawn({
            let manager = manager.clone();
            async move { manager.wait(7, None).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.close(7);

        assert_eq!(waiter.await.unwrap(), Err(AmqpError::ChannelClosedError));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn value_pushed_from_another_task_reaches_the_waiter() {
        let manager = Arc::new(ChannelManager::<u32>::new());
        manager.get(3, true);

        let pusher = tokio::spawn({
            let manager = manager.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                manager.push(3, 42)
            }
        });

        assert_eq!(manager.wait(3, Some(Duration::from_secs(1))).await, Ok(42));
        assert_eq!(pusher.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn unknown_id_fails_deterministically() {
        let manager = ChannelManager::<u32>::new();

        assert_eq!(
            manager.wait(99, None).await,
            Err(AmqpError::ChannelClosedError)
        );
        assert_eq!(manager.push(99, 1), Err(AmqpError::ChannelClosedError));
    }

    #[tokio::test]
    async fn timeout_clears_the_slot() {
        let manager = ChannelManager::<u32>::new();
        manager.get(5, true);

        let result = manager.wait(5, Some(Duration::from_millis(10))).await;

        assert_eq!(result, Err(AmqpError::TimeoutError));
        assert!(manager.get(5, false).is_none());
    }

    #[test]
    fn only_one_value_may_be_pending() {
        let slot = WaitSlot::new();

        slot.push(1).unwrap();

        assert_eq!(slot.push(2), Err(AmqpError::ChannelFullError));
    }

    #[test]
    fn push_after_close_is_rejected() {
        let slot = WaitSlot::new();
        slot.close();

        assert!(slot.is_closed());
        assert_eq!(slot.push(1), Err(AmqpError::ChannelClosedError));
    }

    #[tokio::test]
    async fn close_all_closes_every_slot() {
        let manager = ChannelManager::<u32>::new();
        let first = manager.get(1, true).unwrap();
        let second = manager.get(2, true).unwrap();

        manager.close_all();

        assert!(first.is_closed());
        assert!(second.is_closed());
        assert_eq!(manager.len(), 0);
    }

    #[tokio::test]
    async fn closed_manager_refuses_new_slots() {
        let manager = ChannelManager::<u32>::new();
        manager.close_all();

        assert!(manager.is_closed());
        assert!(manager.get(1, true).is_none());
        assert_eq!(
            manager.wait(1, Some(Duration::from_secs(5))).await,
            Err(AmqpError::ChannelClosedError)
        );
        assert_eq!(manager.push(1, 10), Err(AmqpError::ChannelClosedError));
    }
}
