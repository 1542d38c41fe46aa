//! Error types for the timer system.

use thiserror::Error;

/// Errors from the timer store boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A row could not be decoded into a [`crate::Timer`].
    #[error("corrupt timer row: {0}")]
    Decode(String),

    /// The store is temporarily unreachable.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Store error. The dispatch loop treats these as transient and
    /// restarts; callers of the mutation surface see them directly.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Schedule request rejected before reaching the store.
    #[error("invalid schedule request: {0}")]
    InvalidRequest(String),
}
