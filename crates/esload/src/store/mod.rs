//! Store seam
//!
//! The ingestor only talks to a [`BulkStore`]: a liveness probe and a bulk
//! write returning one [`ItemStatus`] per submitted action, in order.
//! [`elasticsearch::ElasticsearchStore`] is the production implementation.

pub mod elasticsearch;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::action::Action;

pub use elasticsearch::ElasticsearchStore;

/// Per-action result reported by a bulk write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemStatus {
    Accepted,
    Rejected {
        status: Option<u16>,
        reason: String,
        retryable: bool,
    },
}

impl ItemStatus {
    pub fn rejected(status: Option<u16>, reason: impl Into<String>, retryable: bool) -> Self {
        Self::Rejected {
            status,
            reason: reason.into(),
            retryable,
        }
    }
}

/// Request-level failures talking to the store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Could not reach the store at all
    #[error("store unreachable: {0}")]
    Unreachable(String),

    #[error("request timed out after {after:?}")]
    Timeout { after: Duration },

    /// Credentials were refused
    #[error("authentication rejected (HTTP {status})")]
    AuthRejected { status: u16 },

    /// The store answered but reported itself unhealthy
    #[error("store unhealthy (HTTP {status})")]
    Unhealthy { status: u16 },

    /// Non-success response to a write request
    #[error("request failed with HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The response could not be understood
    #[error("unexpected response: {0}")]
    Protocol(String),
}

impl StoreError {
    /// True when the store should be considered gone for the rest of the run
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            StoreError::Unreachable(_) | StoreError::Timeout { .. } | StoreError::AuthRejected { .. }
        )
    }
}

/// A remote store that accepts batched document writes
///
/// Implementations must be safe to share between concurrent batch writers.
#[async_trait]
pub trait BulkStore: Send + Sync + std::fmt::Debug {
    /// Liveness probe
    async fn ping(&self) -> Result<(), StoreError>;

    /// Write `actions` in one request
    ///
    /// On `Ok`, the returned vector has exactly one status per action, in the
    /// same order.
    async fn bulk(&self, actions: &[Action]) -> Result<Vec<ItemStatus>, StoreError>;

    /// Create `destination` if it does not exist; returns whether it was created
    async fn ensure_destination(&self, _destination: &str) -> Result<bool, StoreError> {
        Ok(false)
    }

    /// Human-readable address for logs
    fn endpoint(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_loss_classification() {
        assert!(StoreError::Unreachable("refused".into()).is_connection_loss());
        assert!(StoreError::Timeout {
            after: Duration::from_secs(5)
        }
        .is_connection_loss());
        assert!(StoreError::AuthRejected { status: 401 }.is_connection_loss());
        assert!(!StoreError::Status {
            status: 400,
            body: "bad".into()
        }
        .is_connection_loss());
        assert!(!StoreError::Protocol("truncated".into()).is_connection_loss());
    }
}
