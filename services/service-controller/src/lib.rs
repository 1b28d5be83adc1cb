//! Rollouts service controller.
//!
//! Keeps Services consistent with the Rollouts that reference them. A Service
//! left pinned to a revision hash after its Rollout is gone has the stale
//! traffic selector removed; Services still claimed by a Rollout are left
//! alone and the claiming Rollouts are handed to the rollout pipeline.
//!
//! ## Architecture
//!
//! ```text
//! watch stream ──► EventTranslator ──► LocalCache + byService index
//!                        │                     ▲
//!                        ▼                     │ reads
//!                  service queue ──► WorkerPool ──► ServiceController
//!                                                      │        │
//!                                     rollout queue ◄──┘        ▼
//!                                                         StoreClient (patch)
//!                                                               │
//!                                           watch stream ◄──────┘
//! ```
//!
//! - **Cache**: single writer (the translator), many readers (workers)
//! - **Queues**: deduplicating, rate limited, see [`rollouts_reconcile`]
//! - **Controller**: level triggered; every sync recomputes from current state

pub mod cache;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod memory;
pub mod metrics;
pub mod model;
pub mod patch;
pub mod store;

pub use cache::{CacheError, CacheStore, LocalCache};
pub use config::Config;
pub use controller::{ControllerConfig, ServiceController, SyncAction};
pub use error::{ControllerError, ControllerResult};
pub use events::{EventTranslator, StoreEvent, WatchEvent};
pub use memory::InMemoryStore;
pub use metrics::ControllerMetrics;
pub use model::{Kind, Object, ObjectKey, ObjectRef, Rollout, Service};
pub use patch::{generate_remove_patch, JsonPatch, PatchOperation};
pub use store::{StoreClient, StoreError};
