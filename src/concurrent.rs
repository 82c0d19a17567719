// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Bounded Concurrency Pools
//!
//! `Concurrent` limits how many consumption tasks run at the same time for a
//! named pool. Admission is FIFO: tokio's semaphore queues waiters in arrival
//! order, so the task submitted first is started first once a slot frees.
//! `ConcurrentPools` lazily builds and caches one limiter per pool name.

use crate::{configs::ConcurrentConfigs, errors::AmqpError};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
};
use tracing::{debug, error};

/// Limit value meaning "no limit"
pub const UNLIMITED: usize = 0;

/// Concurrency limiter for a single pool.
#[derive(Debug)]
pub struct Concurrent {
    name: String,
    limit: usize,
    semaphore: Option<Arc<Semaphore>>,
    in_flight: Arc<AtomicUsize>,
}

/// Releases the pool slot when the task finishes, panics or is aborted.
struct SlotGuard {
    _permit: Option<OwnedSemaphorePermit>,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Concurrent {
    /// Creates the limiter of a pool.
    ///
    /// # Parameters
    /// * `name` - Pool name, used in logs
    /// * `limit` - Maximum number of tasks running at once, [`UNLIMITED`] for none
    pub fn new(name: &str, limit: usize) -> Concurrent {
        let semaphore = match limit {
            UNLIMITED => None,
            limit => Some(Arc::new(Semaphore::new(limit))),
        };

        Concurrent {
            name: name.to_owned(),
            limit,
            semaphore,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Name of the pool.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured capacity, [`UNLIMITED`] when the pool is unbounded.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of tasks currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Whether the next submission has to wait; never true when unlimited.
    pub fn is_full(&self) -> bool {
        match &self.semaphore {
            Some(sem) => sem.available_permits() == 0,
            None => false,
        }
    }

    /// Waits for a free slot and runs `task` on its own tokio task.
    ///
    /// The returned future resolves once the task was admitted, not when it
    /// completes; await the `JoinHandle` for completion.
    ///
    /// # Parameters
    /// * `task` - Future to run once a slot is free
    ///
    /// # Returns
    /// The handle of the spawned task, or an error if the pool was closed
    pub async fn submit<F>(&self, task: F) -> Result<JoinHandle<F::Output>, AmqpError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permit = match &self.semaphore {
            Some(sem) => Some(sem.clone().acquire_owned().await.map_err(|err| {
                error!(error = err.to_string(), pool = self.name, "pool semaphore closed");
                AmqpError::InternalError
            })?),
            None => None,
        };

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = SlotGuard {
            _permit: permit,
            in_flight: self.in_flight.clone(),
        };

        Ok(tokio::spawn(async move {
            let _guard = guard;
            task.await
        }))
    }
}

/// Process wide cache of limiters keyed by pool name.
#[derive(Debug, Default)]
pub struct ConcurrentPools {
    configs: ConcurrentConfigs,
    pools: Mutex<HashMap<String, Arc<Concurrent>>>,
}

impl ConcurrentPools {
    pub fn new(configs: ConcurrentConfigs) -> ConcurrentPools {
        ConcurrentPools {
            configs,
            pools: Mutex::new(HashMap::default()),
        }
    }

    /// Returns the limiter of `pool`, creating it on first use.
    pub fn get(&self, pool: &str) -> Arc<Concurrent> {
        let mut pools = self.pools.lock();
        pools
            .entry(pool.to_owned())
            .or_insert_with(|| {
                let limit = self.configs.limit_for(pool);
                debug!(pool = pool, limit = limit, "creating concurrent pool");
                Arc::new(Concurrent::new(pool, limit))
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize},
        time::Duration,
    };
    use tokio::sync::oneshot;

    fn pools() -> ConcurrentPools {
        let mut configs = ConcurrentConfigs::default();
        configs.limit.insert("co".to_owned(), 5);
        ConcurrentPools::new(configs)
    }

    #[test]
    fn limit_comes_from_pool_configuration() {
        let pools = pools();

        assert_eq!(pools.get("default").limit(), 10);
        assert_eq!(pools.get("co").limit(), 5);
        assert_eq!(pools.get("unknown").limit(), 10);
    }

    #[test]
    fn pools_are_cached_by_name() {
        let pools = pools();

        assert!(Arc::ptr_eq(&pools.get("co"), &pools.get("co")));
        assert!(!Arc::ptr_eq(&pools.get("co"), &pools.get("default")));
    }

    #[tokio::test]
    async fn second_task_waits_for_the_first_to_finish() {
        let concurrent = Arc::new(Concurrent::new("single", 1));
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let second_started = Arc::new(AtomicBool::new(false));

        let first = concurrent
            .submit(async move {
                let _ = release_rx.await;
            })
            .await
            .unwrap();

        let submitter = tokio::spawn({
            let concurrent = concurrent.clone();
            let started = second_started.clone();
            async move {
                concurrent
                    .submit(async move {
                        started.store(true, Ordering::SeqCst);
                    })
                    .await
                    .unwrap()
                    .await
                    .unwrap();
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second_started.load(Ordering::SeqCst));
        assert!(concurrent.is_full());

        release_tx.send(()).unwrap();
        first.await.unwrap();
        submitter.await.unwrap();

        assert!(second_started.load(Ordering::SeqCst));
        assert_eq!(concurrent.in_flight(), 0);
    }

    #[tokio::test]
    async fn never_runs_more_than_the_limit() {
        let concurrent = Arc::new(Concurrent::new("bounded", 3));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for _ in 0..4 {
            let running = running.clone();
            let peak = peak.clone();
            handles.push(
                concurrent
                    .submit(async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                    .unwrap(),
            );
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn queued_tasks_start_in_submission_order() {
        let concurrent = Arc::new(Concurrent::new("fifo", 1));
        let order = Arc::new(Mutex::new(vec![]));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let blocker = concurrent
            .submit(async move {
                let _ = release_rx.await;
            })
            .await
            .unwrap();

        let mut submitters = vec![];
        for i in 0..3 {
            let concurrent = concurrent.clone();
            let order = order.clone();
            submitters.push(tokio::spawn(async move {
                concurrent
                    .submit(async move { order.lock().push(i) })
                    .await
                    .unwrap()
                    .await
                    .unwrap();
            }));
            // let each submitter enqueue before the next one
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        release_tx.send(()).unwrap();
        blocker.await.unwrap();
        for submitter in submitters {
            submitter.await.unwrap();
        }

        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn panicking_task_releases_its_slot() {
        let concurrent = Concurrent::new("panics", 1);

        let handle = concurrent
            .submit(async { panic!("handler blew up") })
            .await
            .unwrap();
        assert!(handle.await.is_err());
        assert_eq!(concurrent.in_flight(), 0);

        let handle = concurrent.submit(async { 7 }).await.unwrap();
        assert_eq!(handle.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn unlimited_pool_never_blocks() {
        let concurrent = Concurrent::new("free", UNLIMITED);
        let (tx, rx) = oneshot::channel::<()>();

        let blocked = concurrent
            .submit(async move {
                let _ = rx.await;
            })
            .await
            .unwrap();
        let free = concurrent.submit(async { 1 }).await.unwrap();

        assert!(!concurrent.is_full());
        assert_eq!(free.await.unwrap(), 1);
        tx.send(()).unwrap();
        blocked.await.unwrap();
    }
}
