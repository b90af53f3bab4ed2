//! Idempotency key registry
//!
//! Maps client-supplied keys to the transaction they produced. At-most-once
//! execution rides on the primary-key constraint: concurrent inserts with
//! the same key deterministically produce one winner, and losers observe
//! the winner's row.

use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::core_types::{TransactionId, UserId};
use crate::db::Scope;
use crate::error::{LedgerError, is_unique_violation};

/// Keys are garbage-collected this long after creation.
pub const KEY_TTL_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Processing,
    Completed,
    Failed,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Processing => "processing",
            KeyStatus::Completed => "completed",
            KeyStatus::Failed => "failed",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(KeyStatus::Processing),
            "completed" => Some(KeyStatus::Completed),
            "failed" => Some(KeyStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdempotencyKey {
    pub key: String,
    pub user_id: UserId,
    pub transaction_id: Option<TransactionId>,
    pub status: KeyStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of claiming a key inside a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This execution owns the key.
    Inserted,
    /// Another execution holds or held the key; the caller must abandon
    /// the scope and re-observe the registry.
    Duplicate,
}

pub async fn find(pool: &PgPool, key: &str) -> Result<Option<IdempotencyKey>, LedgerError> {
    let row = sqlx::query(
        r#"
        SELECT key, user_id, transaction_id, status, created_at, expires_at
        FROM idempotency_keys
        WHERE key = $1
        "#,
    )
    .bind(key)
    .fetch_optional(pool)
    .await?;

    row.map(|r| row_to_key(&r)).transpose()
}

/// Claim the key for the current execution by inserting a `processing`
/// row inside the scope. A unique violation means somebody else got there
/// first; the violation poisons the scope, so the caller rolls back and
/// folds into the winner's result.
pub async fn insert_processing(
    scope: &mut Scope,
    key: &str,
    user_id: UserId,
) -> Result<ClaimOutcome, LedgerError> {
    let expires_at = Utc::now() + Duration::hours(KEY_TTL_HOURS);
    let result = sqlx::query(
        r#"
        INSERT INTO idempotency_keys (key, user_id, status, expires_at)
        VALUES ($1, $2, 'processing', $3)
        "#,
    )
    .bind(key)
    .bind(user_id)
    .bind(expires_at)
    .execute(&mut **scope)
    .await;

    match result {
        Ok(_) => Ok(ClaimOutcome::Inserted),
        Err(e) if is_unique_violation(&e) => Ok(ClaimOutcome::Duplicate),
        Err(e) => Err(LedgerError::Database(e)),
    }
}

/// Bind the produced transaction to the key and mark it completed, within
/// the same scope as the effect itself.
pub async fn mark_completed(
    scope: &mut Scope,
    key: &str,
    transaction_id: TransactionId,
) -> Result<(), LedgerError> {
    let result = sqlx::query(
        r#"
        UPDATE idempotency_keys
        SET status = 'completed', transaction_id = $2
        WHERE key = $1 AND status = 'processing'
        "#,
    )
    .bind(key)
    .bind(transaction_id)
    .execute(&mut **scope)
    .await?;

    if result.rows_affected() == 0 {
        return Err(LedgerError::Conflict(format!(
            "idempotency key {key} is not processing"
        )));
    }
    Ok(())
}

/// Record a failure after the scope has rolled back. The upsert only
/// downgrades a `processing` row owned by this execution; a concurrent
/// winner's row is left alone.
pub async fn mark_failed(pool: &PgPool, key: &str, user_id: UserId) -> Result<(), LedgerError> {
    let expires_at = Utc::now() + Duration::hours(KEY_TTL_HOURS);
    sqlx::query(
        r#"
        INSERT INTO idempotency_keys (key, user_id, status, expires_at)
        VALUES ($1, $2, 'failed', $3)
        ON CONFLICT (key) DO UPDATE
        SET status = 'failed'
        WHERE idempotency_keys.status = 'processing'
        "#,
    )
    .bind(key)
    .bind(user_id)
    .bind(expires_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Drop keys past their TTL. Returns how many were removed.
pub async fn purge_expired(pool: &PgPool) -> Result<u64, LedgerError> {
    let result = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at <= NOW()")
        .execute(pool)
        .await?;

    let purged = result.rows_affected();
    if purged > 0 {
        tracing::info!(purged, "Purged expired idempotency keys");
    }
    Ok(purged)
}

fn row_to_key(row: &PgRow) -> Result<IdempotencyKey, LedgerError> {
    let status_str: String = row.get("status");
    let status = KeyStatus::from_str_opt(&status_str).ok_or_else(|| {
        LedgerError::Internal(format!("invalid idempotency key status: {status_str}"))
    })?;

    Ok(IdempotencyKey {
        key: row.get("key"),
        user_id: row.get("user_id"),
        transaction_id: row.get("transaction_id"),
        status,
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for s in [KeyStatus::Processing, KeyStatus::Completed, KeyStatus::Failed] {
            assert_eq!(KeyStatus::from_str_opt(s.as_str()), Some(s));
        }
        assert_eq!(KeyStatus::from_str_opt("done"), None);
    }
}
