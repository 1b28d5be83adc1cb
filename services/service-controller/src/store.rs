//! Object store client interface.
//!
//! The controller reads objects that may be outside its cache scope and writes
//! corrective patches through this trait. Production deployments back it with
//! the cluster API; [`crate::memory::InMemoryStore`] backs it in development
//! and tests.

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{Kind, Object, ObjectRef};
use crate::patch::JsonPatch;

/// Errors returned by a store client.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The object does not exist.
    #[error("{kind} {object} not found")]
    NotFound { kind: Kind, object: ObjectRef },

    /// A conditional write lost against a concurrent writer.
    #[error("conflict writing {kind} {object}: {reason}")]
    Conflict {
        kind: Kind,
        object: ObjectRef,
        reason: String,
    },

    /// A patch targets a field that is already absent.
    #[error("{kind} {object} has no field at {path}")]
    PathNotFound {
        kind: Kind,
        object: ObjectRef,
        path: String,
    },

    /// The patch was malformed or not applicable to the kind.
    #[error("invalid patch for {kind} {object}: {reason}")]
    InvalidPatch {
        kind: Kind,
        object: ObjectRef,
        reason: String,
    },

    /// Network failure, timeout, or server error.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True when retrying the same request can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Unavailable(_))
    }
}

/// Object store client.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Read an object directly from the store, bypassing any cache.
    async fn get(&self, kind: Kind, object: &ObjectRef) -> Result<Object, StoreError>;

    /// Apply a JSON patch. Returns the patched object.
    async fn patch(
        &self,
        kind: Kind,
        object: &ObjectRef,
        patch: &JsonPatch,
    ) -> Result<Object, StoreError>;
}
