//! Reconciliation loop primitives.
//!
//! This library provides the machinery shared by level-triggered controllers:
//!
//! - **Rate limiters**: decide how long a failed key waits before retrying.
//! - **Work queue**: deduplicating queue of keys that need reconciliation.
//! - **Worker pool**: fixed number of workers draining a queue.
//!
//! # Invariants
//!
//! - A key is pending at most once, no matter how many events produced it
//! - A key is never processed by two workers of the same queue at once
//! - A key re-added while in flight is processed again afterwards
//! - Successful reconciliation resets the key's backoff

use std::time::Duration;

pub mod limiter;
pub mod queue;
pub mod worker;

pub use limiter::{
    default_controller_limiter, BackoffPolicy, BucketLimiter, ItemExponentialLimiter,
    MaxOfLimiter, RateLimiter,
};
pub use queue::{QueueKey, WorkQueue};
pub use worker::{
    process_item, NoopObserver, Outcome, Reconciler, Retryable, WorkerObserver, WorkerPool,
};

/// Default delay for the first retry of a key.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(5);

/// Default cap on a key's retry delay.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(1000);

/// Default overall requeue rate (tokens per second).
pub const DEFAULT_QUEUE_QPS: f64 = 10.0;

/// Default token bucket size.
pub const DEFAULT_QUEUE_BURST: u32 = 100;
