//! Bounded task submission with caller-runs backpressure
//!
//! Dispatch and batch work is spawned onto the tokio runtime, but only up to
//! `max_threads + queue_capacity` tasks at a time. Past that, [`WorkerPool::submit`]
//! hands the future back as a [`Task::CallerRuns`], which runs on whichever task
//! awaits it. Work is never dropped; a flooded pool slows its submitters down instead.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
};

use futures_util::{FutureExt, future::BoxFuture};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{runtime::Handle, sync::Semaphore, task::JoinHandle};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Runtime worker threads. Defaults to twice the available cores.
    #[serde(default)]
    pub core_threads: Option<usize>,

    /// Tasks allowed to run concurrently. Defaults to four times the available cores.
    #[serde(default)]
    pub max_threads: Option<usize>,

    /// Further tasks allowed to wait for a worker
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            core_threads: None,
            max_threads: None,
            queue_capacity: default_queue_capacity(),
        }
    }
}

const fn default_queue_capacity() -> usize {
    1000
}

impl PoolConfig {
    #[must_use]
    pub fn core_threads(&self) -> usize {
        self.core_threads.unwrap_or_else(|| num_cpus::get() * 2).max(1)
    }

    #[must_use]
    pub fn max_threads(&self) -> usize {
        self.max_threads
            .unwrap_or_else(|| num_cpus::get() * 4)
            .max(self.core_threads())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("Task panicked")]
    Panicked,

    #[error("Task was cancelled")]
    Cancelled,
}

/// Submits futures onto the runtime, bounded by an admission semaphore
#[derive(Debug, Clone)]
pub struct WorkerPool {
    admission: Arc<Semaphore>,
    capacity: usize,
    caller_runs: Arc<AtomicU64>,
}

impl WorkerPool {
    #[must_use]
    pub fn new(config: &PoolConfig) -> Self {
        let capacity = config.max_threads().saturating_add(config.queue_capacity);
        Self {
            admission: Arc::new(Semaphore::new(capacity)),
            capacity,
            caller_runs: Arc::default(),
        }
    }

    /// Submit `future`, spawning it if there is room
    pub fn submit<F>(&self, future: F) -> Task<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let handle = Handle::try_current();
        let permit = Arc::clone(&self.admission).try_acquire_owned();

        match (handle, permit) {
            (Ok(handle), Ok(permit)) => Task::Spawned(handle.spawn(async move {
                let _permit = permit;
                future.await
            })),
            _ => {
                self.caller_runs.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(capacity = self.capacity, "Worker pool saturated, caller runs task");
                Task::CallerRuns(future.boxed())
            }
        }
    }

    /// Tasks currently admitted
    pub fn active(&self) -> usize {
        self.capacity - self.admission.available_permits()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tasks that were run by their submitter
    pub fn caller_runs(&self) -> u64 {
        self.caller_runs.load(Ordering::Relaxed)
    }
}

/// A submitted unit of work
pub enum Task<T> {
    Spawned(JoinHandle<T>),
    CallerRuns(BoxFuture<'static, T>),
}

impl<T> Task<T> {
    #[must_use]
    pub const fn is_spawned(&self) -> bool {
        matches!(self, Self::Spawned(_))
    }

    /// Stop waiting for the task without cancelling it
    ///
    /// A spawned task keeps running on its own. Caller-runs work is moved onto
    /// the runtime so it completes even though nobody awaits it any more.
    pub fn detach(self)
    where
        T: Send + 'static,
    {
        match self {
            Self::Spawned(_) => {}
            Self::CallerRuns(future) => match Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(future);
                }
                Err(_) => tracing::warn!("No runtime to finish detached task, dropping it"),
            },
        }
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T, PoolError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.get_mut() {
            Self::Spawned(handle) => handle.poll_unpin(cx).map(|result| {
                result.map_err(|error| {
                    if error.is_panic() {
                        PoolError::Panicked
                    } else {
                        PoolError::Cancelled
                    }
                })
            }),
            Self::CallerRuns(future) => future.poll_unpin(cx).map(Ok),
        }
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spawned(_) => f.debug_tuple("Spawned").finish_non_exhaustive(),
            Self::CallerRuns(_) => f.write_str("CallerRuns"),
        }
    }
}
