//! Fixed-size worker pool draining a [`WorkQueue`].
//!
//! Each worker pulls one key at a time, runs the reconciler, and reports the
//! result back to the queue:
//!
//! - success: backoff history is forgotten
//! - retryable failure: key is requeued through the rate limiter
//! - permanent failure: key is logged and dropped
//! - panic: caught, logged, and treated as a permanent failure
//!
//! `done` is always called, so a key re-added while in flight runs once more
//! and a panicking reconciler never strands a key in `processing`.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::join_all;
use futures_util::FutureExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::queue::{QueueKey, WorkQueue};

/// Classifies a reconciliation error.
pub trait Retryable {
    /// True when requeueing with backoff can fix the failure.
    fn is_retryable(&self) -> bool;
}

/// Reconciles a single key.
#[async_trait]
pub trait Reconciler<K: QueueKey>: Send + Sync + 'static {
    type Error: std::error::Error + Retryable + Send + Sync + 'static;

    async fn reconcile(&self, key: &K) -> Result<(), Self::Error>;
}

/// Result of processing one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Reconciled successfully.
    Success,

    /// Failed with a retryable error; requeued with backoff.
    Requeued,

    /// Failed permanently; dropped.
    Dropped,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Requeued => "requeued",
            Self::Dropped => "dropped",
        }
    }
}

/// Receives per-item observations. Implementations must not fail the item.
pub trait WorkerObserver<K>: Send + Sync {
    /// Called once per processed key.
    fn observe(&self, key: &K, duration: Duration, outcome: Outcome);

    /// Called with the queue depth after each processed key.
    fn queue_depth(&self, _queue: &str, _depth: usize) {}
}

/// Observer that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl<K> WorkerObserver<K> for NoopObserver {
    fn observe(&self, _key: &K, _duration: Duration, _outcome: Outcome) {}
}

/// Worker pool bound to one queue.
pub struct WorkerPool<K: QueueKey, R: Reconciler<K>> {
    queue: Arc<WorkQueue<K>>,
    reconciler: Arc<R>,
    observer: Arc<dyn WorkerObserver<K>>,
}

impl<K: QueueKey, R: Reconciler<K>> WorkerPool<K, R> {
    /// Create a new worker pool.
    pub fn new(
        queue: Arc<WorkQueue<K>>,
        reconciler: Arc<R>,
        observer: Arc<dyn WorkerObserver<K>>,
    ) -> Self {
        Self {
            queue,
            reconciler,
            observer,
        }
    }

    /// Run `threadiness` workers until shutdown is signaled.
    ///
    /// On shutdown the queue stops handing out keys; workers finish their
    /// current key and exit. Returns once every worker has exited.
    pub async fn run(&self, threadiness: usize, mut shutdown: watch::Receiver<bool>) {
        let threadiness = threadiness.max(1);
        info!(queue = %self.queue.name(), threadiness, "Starting workers");

        let handles: Vec<_> = (0..threadiness)
            .map(|worker_id| {
                let queue = Arc::clone(&self.queue);
                let reconciler = Arc::clone(&self.reconciler);
                let observer = Arc::clone(&self.observer);
                tokio::spawn(async move {
                    while let Some(key) = queue.get().await {
                        process_item(&queue, reconciler.as_ref(), observer.as_ref(), key).await;
                    }
                    debug!(worker_id, "Worker exiting");
                })
            })
            .collect();

        info!(queue = %self.queue.name(), "Started workers");

        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        info!(queue = %self.queue.name(), "Shutting down workers");
        self.queue.shut_down();

        for result in join_all(handles).await {
            if let Err(e) = result {
                error!(queue = %self.queue.name(), error = %e, "Worker task failed");
            }
        }

        info!(queue = %self.queue.name(), "Workers stopped");
    }
}

/// Process a single key pulled from `queue`.
pub async fn process_item<K, R>(
    queue: &Arc<WorkQueue<K>>,
    reconciler: &R,
    observer: &dyn WorkerObserver<K>,
    key: K,
) -> Outcome
where
    K: QueueKey,
    R: Reconciler<K> + ?Sized,
{
    let started = Instant::now();

    let result = AssertUnwindSafe(reconciler.reconcile(&key))
        .catch_unwind()
        .await;

    let outcome = match result {
        Ok(Ok(())) => {
            queue.forget(&key);
            Outcome::Success
        }
        Ok(Err(e)) if e.is_retryable() => {
            warn!(
                queue = %queue.name(),
                key = %key,
                error = %e,
                requeues = queue.num_requeues(&key),
                "Reconciliation failed, requeueing with backoff"
            );
            queue.add_rate_limited(key.clone());
            Outcome::Requeued
        }
        Ok(Err(e)) => {
            error!(
                queue = %queue.name(),
                key = %key,
                error = %e,
                "Reconciliation failed permanently, dropping key"
            );
            queue.forget(&key);
            Outcome::Dropped
        }
        Err(panic) => {
            error!(
                queue = %queue.name(),
                key = %key,
                panic = panic_message(&*panic),
                "Reconciler panicked, dropping key"
            );
            queue.forget(&key);
            Outcome::Dropped
        }
    };

    queue.done(&key);

    let elapsed = started.elapsed();
    debug!(
        queue = %queue.name(),
        key = %key,
        outcome = outcome.as_str(),
        duration_ms = elapsed.as_millis() as u64,
        "Processed key"
    );
    observer.observe(&key, elapsed, outcome);
    observer.queue_depth(queue.name(), queue.len());

    outcome
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}
