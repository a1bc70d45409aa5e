//! Error taxonomy shared by the supervisor components.
//!
//! Kinds, not mechanics: callers match on the variant to decide between
//! retry-next-poll, surface-to-user and fail-closed.

use std::time::Duration;
use thiserror::Error;

/// Failures reported by the broker gateway.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// The exchange refused the order (validation, margin, trading status).
    /// Surfaced to the user, never retried.
    #[error("rejected by broker: {0}")]
    Rejected(String),

    /// Transport-level failure (network, 5xx). Retried on the next poll.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// The per-request deadline elapsed. Treated as transient.
    #[error("broker request timed out after {0:?}")]
    Timeout(Duration),
}

impl BrokerError {
    /// Transient errors resolve themselves; the next poll retries.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Unavailable(_) | BrokerError::Timeout(_))
    }
}

/// Failures of the durable store.
///
/// Safety-critical readers treat any `StoreError` as "bot is not active".
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt row {order_id}: {detail}")]
    Corrupt { order_id: String, detail: String },
}
