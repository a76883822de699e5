//! Bounded, queue-backed pool of [`Recyclable`] resources.
//!
//! The pool tracks three collections: idle `available` instances, checked-out
//! `locked` instances, and a FIFO queue of waiting acquirers. A released
//! instance is handed straight to the oldest waiter when one exists and only
//! goes back to `available` when nobody is waiting.
//!
//! All bookkeeping happens under a short synchronous lock that is never held
//! across an `.await`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

pub use opsflow_core::config::PoolConfig;

use super::resource::Recyclable;

/// Creates a new resource instance.
pub type Factory<T> = Arc<dyn Fn() -> anyhow::Result<T> + Send + Sync>;

type Waiter<T> = oneshot::Sender<Result<Arc<T>, PoolError>>;

/// Errors from the resource pool.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// Every slot is taken and the wait queue is full.
    #[error("Acquire queue is full ({limit} requests waiting)")]
    QueueOverflow { limit: usize },

    /// The pool is being (or has been) disposed.
    #[error("Resource pool is disposing")]
    Disposing,

    /// The released instance is not checked out from this pool.
    #[error("Resource is not part of this pool")]
    NotPartOfPool,

    /// `reset` was called on a pool that has not been disposed.
    #[error("Resource pool must be disposed before it can be reset")]
    NotDisposed,

    /// The factory failed to build a new instance.
    #[error("Failed to create pooled resource: {0}")]
    Factory(String),
}

/// Point-in-time pool statistics, computed on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total_objects: usize,
    pub locked_objects: usize,
    pub pool_size_limit: usize,
    pub queued_requests: usize,
    pub queue_size_limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Active,
    Disposing,
    Disposed,
}

struct PoolState<T> {
    available: VecDeque<Arc<T>>,
    locked: Vec<Arc<T>>,
    waiters: VecDeque<Waiter<T>>,
    factory: Option<Factory<T>>,
    phase: Phase,
}

impl<T> PoolState<T> {
    fn total(&self) -> usize {
        self.available.len() + self.locked.len()
    }

    fn create(&self) -> Result<Arc<T>, PoolError> {
        let factory = self.factory.as_ref().ok_or(PoolError::Disposing)?;
        factory()
            .map(Arc::new)
            .map_err(|e| PoolError::Factory(e.to_string()))
    }

    fn position_locked(&self, resource: &Arc<T>) -> Option<usize> {
        self.locked.iter().position(|r| Arc::ptr_eq(r, resource))
    }
}

/// Generic bounded resource pool.
pub struct ResourcePool<T: Recyclable> {
    config: PoolConfig,
    factory: Factory<T>,
    state: Mutex<PoolState<T>>,
}

impl<T: Recyclable> ResourcePool<T> {
    /// Create a pool and preallocate `config.preallocated_size` instances.
    pub fn new<F>(config: PoolConfig, factory: F) -> Result<Self, PoolError>
    where
        F: Fn() -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let factory: Factory<T> = Arc::new(factory);
        let mut state = PoolState {
            available: VecDeque::with_capacity(config.max_size),
            locked: Vec::with_capacity(config.max_size),
            waiters: VecDeque::new(),
            factory: Some(Arc::clone(&factory)),
            phase: Phase::Active,
        };
        for _ in 0..config.preallocated_size {
            let resource = state.create()?;
            state.available.push_back(resource);
        }

        info!(
            max_size = config.max_size,
            preallocated = config.preallocated_size,
            max_queue = config.max_queue_size,
            "Resource pool created"
        );

        Ok(Self {
            config,
            factory,
            state: Mutex::new(state),
        })
    }

    fn state(&self) -> MutexGuard<'_, PoolState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The normalised sizing this pool was built with.
    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Check out an instance.
    ///
    /// Returns immediately with an idle or freshly created instance while
    /// capacity allows, otherwise waits in the FIFO queue until a release
    /// hands one over.
    pub async fn acquire(&self) -> Result<Arc<T>, PoolError> {
        let rx = {
            let mut state = self.state();
            if state.phase != Phase::Active {
                return Err(PoolError::Disposing);
            }

            if let Some(resource) = state.available.pop_front() {
                state.locked.push(Arc::clone(&resource));
                return Ok(resource);
            }

            if state.total() < self.config.max_size {
                let resource = state.create()?;
                state.locked.push(Arc::clone(&resource));
                debug!(total = state.total(), "Created pooled resource on demand");
                return Ok(resource);
            }

            // Acquirers that gave up no longer hold a queue slot.
            state.waiters.retain(|w| !w.is_closed());
            if state.waiters.len() >= self.config.max_queue_size {
                warn!(
                    limit = self.config.max_queue_size,
                    "Resource pool queue overflow"
                );
                return Err(PoolError::QueueOverflow {
                    limit: self.config.max_queue_size,
                });
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            debug!(queued = state.waiters.len(), "Acquire request queued");
            rx
        };

        PendingAcquire {
            pool: self,
            rx,
            settled: false,
        }
        .wait()
        .await
    }

    /// Return an instance to the pool.
    ///
    /// The instance is reset first. A disposed instance is dropped from the
    /// pool; otherwise it goes to the oldest waiter, or back to `available`
    /// when the queue is empty.
    pub fn release(&self, resource: &Arc<T>) -> Result<(), PoolError> {
        resource.reset();

        let mut state = self.state();
        if state.phase != Phase::Active {
            return Err(PoolError::Disposing);
        }
        let pos = state
            .position_locked(resource)
            .ok_or(PoolError::NotPartOfPool)?;

        if resource.is_disposed() {
            state.locked.swap_remove(pos);
            debug!(total = state.total(), "Dropped disposed resource on release");
            Self::refill_for_waiter(&mut state);
            return Ok(());
        }

        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.send(Ok(Arc::clone(resource))).is_ok() {
                debug!("Released resource handed to queued request");
                return Ok(());
            }
        }

        state.locked.swap_remove(pos);
        state.available.push_back(Arc::clone(resource));
        Ok(())
    }

    /// A dropped resource freed a slot: build a replacement for the oldest
    /// live waiter so it does not wait for a release that may never come.
    fn refill_for_waiter(state: &mut PoolState<T>) {
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.is_closed() {
                continue;
            }
            match state.create() {
                Ok(fresh) => {
                    state.locked.push(Arc::clone(&fresh));
                    if let Err(Ok(unclaimed)) = waiter.send(Ok(fresh)) {
                        if let Some(pos) = state.position_locked(&unclaimed) {
                            state.locked.swap_remove(pos);
                        }
                        state.available.push_back(unclaimed);
                    }
                }
                Err(e) => {
                    let _ = waiter.send(Err(e));
                }
            }
            return;
        }
    }

    /// Dispose every instance and wait for all of them to finish.
    ///
    /// Acquire and release fail from the moment this is called. Individual
    /// disposal failures are logged, not returned.
    pub async fn dispose(&self) {
        let Some(resources) = self.begin_dispose() else {
            return;
        };
        self.finish_dispose(resources).await;
    }

    /// Start disposal and let it complete in the background.
    pub fn dispose_and_forget(self: &Arc<Self>) {
        let Some(resources) = self.begin_dispose() else {
            return;
        };
        let pool = Arc::clone(self);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    pool.finish_dispose(resources).await;
                });
            }
            Err(e) => {
                warn!(error = %e, "No async runtime for background pool disposal");
            }
        }
    }

    fn begin_dispose(&self) -> Option<Vec<Arc<T>>> {
        let (resources, waiters) = {
            let mut state = self.state();
            if state.phase != Phase::Active {
                debug!("Resource pool already disposing");
                return None;
            }
            state.phase = Phase::Disposing;
            state.factory = None;

            let mut resources: Vec<Arc<T>> = state.available.drain(..).collect();
            resources.append(&mut state.locked);
            (resources, std::mem::take(&mut state.waiters))
        };

        for waiter in waiters {
            let _ = waiter.send(Err(PoolError::Disposing));
        }
        Some(resources)
    }

    async fn finish_dispose(&self, resources: Vec<Arc<T>>) {
        info!(count = resources.len(), "Disposing resource pool");

        let results = join_all(resources.iter().map(|r| r.dispose())).await;
        let failures = results
            .into_iter()
            .filter_map(Result::err)
            .inspect(|e| warn!(error = %e, "Pooled resource failed to dispose"))
            .count();

        self.state().phase = Phase::Disposed;
        info!(failures, "Resource pool disposed");
    }

    /// Re-create `preallocated_size` fresh instances after a disposal.
    pub fn reset(&self) -> Result<(), PoolError> {
        let mut state = self.state();
        if state.phase != Phase::Disposed {
            return Err(PoolError::NotDisposed);
        }

        state.factory = Some(Arc::clone(&self.factory));
        let mut fresh = VecDeque::with_capacity(self.config.max_size);
        for _ in 0..self.config.preallocated_size {
            fresh.push_back(state.create()?);
        }
        state.available = fresh;
        state.locked.clear();
        state.phase = Phase::Active;

        info!(
            preallocated = self.config.preallocated_size,
            "Resource pool reset"
        );
        Ok(())
    }

    /// Current statistics.
    pub fn stats(&self) -> PoolStats {
        let state = self.state();
        PoolStats {
            total_objects: state.total(),
            locked_objects: state.locked.len(),
            pool_size_limit: self.config.max_size,
            queued_requests: state.waiters.iter().filter(|w| !w.is_closed()).count(),
            queue_size_limit: self.config.max_queue_size,
        }
    }
}

/// A queued acquire. If it is dropped after a release already handed it a
/// resource, the resource goes back to the pool instead of leaking.
struct PendingAcquire<'a, T: Recyclable> {
    pool: &'a ResourcePool<T>,
    rx: oneshot::Receiver<Result<Arc<T>, PoolError>>,
    settled: bool,
}

impl<T: Recyclable> PendingAcquire<'_, T> {
    async fn wait(mut self) -> Result<Arc<T>, PoolError> {
        let result = (&mut self.rx).await;
        self.settled = true;
        result.unwrap_or(Err(PoolError::Disposing))
    }
}

impl<T: Recyclable> Drop for PendingAcquire<'_, T> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.rx.close();
        if let Ok(Ok(resource)) = self.rx.try_recv()
            && let Err(e) = self.pool.release(&resource)
        {
            warn!(error = %e, "Failed to return resource from abandoned acquire");
        }
    }
}
