//! Deduplicating, rate-limited work queue.
//!
//! Semantics:
//!
//! - A key is pending at most once (`dirty` set).
//! - A key handed to a worker is `processing` until [`WorkQueue::done`]. Adding
//!   it again in the meantime marks it dirty; `done` requeues it exactly once.
//! - After [`WorkQueue::shut_down`], `get` returns `None` to every caller and
//!   new adds are ignored.

use std::collections::{HashSet, VecDeque};
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::limiter::RateLimiter;

/// Bound for anything used as a queue key.
pub trait QueueKey: Clone + Eq + Hash + Debug + Display + Send + Sync + 'static {}

impl<T: Clone + Eq + Hash + Debug + Display + Send + Sync + 'static> QueueKey for T {}

struct QueueState<K> {
    /// Keys ready to be handed out, in arrival order.
    queue: VecDeque<K>,

    /// Keys that need processing (queued, or re-added while processing).
    dirty: HashSet<K>,

    /// Keys currently held by a worker.
    processing: HashSet<K>,

    shutting_down: bool,
}

/// Rate-limited work queue shared by producers and a worker pool.
pub struct WorkQueue<K: QueueKey> {
    name: String,
    state: Mutex<QueueState<K>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<K>>,
}

impl<K: QueueKey> WorkQueue<K> {
    /// Create a new queue using `limiter` for failure requeues.
    pub fn new(name: impl Into<String>, limiter: impl RateLimiter<K> + 'static) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            limiter: Box::new(limiter),
        }
    }

    /// Queue name for logging and metrics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mark a key as needing processing.
    pub fn add(&self, key: K) {
        {
            let mut state = self.state.lock();
            if state.shutting_down || state.dirty.contains(&key) {
                return;
            }
            state.dirty.insert(key.clone());
            if state.processing.contains(&key) {
                // Requeued by `done`
                return;
            }
            state.queue.push_back(key);
        }
        self.notify.notify_one();
    }

    /// Add a key once `delay` has elapsed.
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if self.is_shutting_down() {
            return;
        }

        debug!(queue = %self.name, key = %key, delay_ms = delay.as_millis() as u64, "Scheduling delayed add");
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Add a key after the limiter's delay for it. Counts as a failure.
    pub fn add_rate_limited(self: &Arc<Self>, key: K) {
        let delay = self.limiter.when(&key);
        self.add_after(key, delay);
    }

    /// Reset the key's backoff history (after a successful reconciliation).
    pub fn forget(&self, key: &K) {
        self.limiter.forget(key);
    }

    /// Number of rate-limited requeues since the key was last forgotten.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.limiter.num_requeues(key)
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking state so a concurrent add or shutdown is not missed.
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Mark a key as finished. Requeues it if it was re-added meanwhile.
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut state = self.state.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) && !state.shutting_down {
                state.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Number of keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a worker currently holds the key.
    pub fn is_processing(&self, key: &K) -> bool {
        self.state.lock().processing.contains(key)
    }

    /// Stop handing out keys and wake every waiting worker.
    pub fn shut_down(&self) {
        {
            let mut state = self.state.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
        }
        info!(queue = %self.name, "Work queue shutting down");
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }
}
