//! Controller error types.

use rollouts_reconcile::Retryable;
use thiserror::Error;

use crate::cache::CacheError;
use crate::model::Kind;
use crate::store::StoreError;

/// Result type for controller operations.
pub type ControllerResult<T> = Result<T, ControllerError>;

/// Errors that can occur while reconciling a key.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Store read or write failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Cache or index query failed.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// A key or object of the wrong kind reached a kind-specific path.
    #[error("unsupported kind {kind} for {operation}")]
    UnsupportedKind {
        kind: Kind,
        operation: &'static str,
    },
}

impl Retryable for ControllerError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_retryable(),
            Self::Cache(_) => true,
            Self::UnsupportedKind { .. } => false,
        }
    }
}
