//! Error taxonomy returned by the ledger core
//!
//! Every core operation surfaces one of these variants. The boundary maps
//! them onto its transport; the core never formats HTTP statuses.

use thiserror::Error;

use crate::core_types::Points;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// Malformed input: non-positive amount, self-transfer, bad token,
    /// state transition that the state machine forbids.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The referenced entity does not exist (or is soft-deleted).
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Caller lacks the role, is not the right actor, or is deactivated.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A debit would take the balance below zero. No transaction is
    /// appended; the row lock has been released by rollback.
    #[error("insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance { available: Points, requested: Points },

    /// Unique-constraint race that could not be folded into an early
    /// success: a previously failed idempotency key, a consumed QR code,
    /// a duplicate daily bonus.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Another execution holds the same idempotency key and has not
    /// finished. The caller should retry and observe the winner's result.
    #[error("operation already in progress")]
    InProgress,

    /// Transfer request or QR code past its expiry.
    #[error("{0} expired")]
    Expired(&'static str),

    /// Product stock cannot cover the requested quantity.
    #[error("out of stock")]
    OutOfStock,

    /// The caller's cancellation signal fired before commit.
    #[error("operation cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    /// Whether the error indicates corrupted or unreachable infrastructure
    /// rather than a rejected request.
    pub fn is_internal(&self) -> bool {
        matches!(self, LedgerError::Database(_) | LedgerError::Internal(_))
    }
}

/// True when a sqlx error is a unique-constraint violation. Idempotency,
/// QR code uniqueness, and daily-bonus dedup all ride on this.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_internal() {
        assert!(LedgerError::Internal("boom".into()).is_internal());
        assert!(!LedgerError::OutOfStock.is_internal());
        assert!(!LedgerError::InProgress.is_internal());
    }

    #[test]
    fn test_display_messages() {
        let e = LedgerError::InsufficientBalance {
            available: 100,
            requested: 300,
        };
        assert_eq!(
            e.to_string(),
            "insufficient balance: available 100, requested 300"
        );
        assert_eq!(LedgerError::NotFound("user").to_string(), "user not found");
        assert_eq!(LedgerError::Expired("qr code").to_string(), "qr code expired");
    }
}
