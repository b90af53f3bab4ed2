//! Transfer request persistence
//!
//! Status flips are atomic CAS updates guarded on `status = 'pending'`,
//! so two actors racing the same request produce exactly one transition.

use sqlx::{PgPool, Row, postgres::PgRow};

use super::types::{RequestStatus, TransferRequest};
use crate::core_types::{RequestId, TransactionId};
use crate::db::Scope;
use crate::error::{LedgerError, is_unique_violation};

const SELECT_COLUMNS: &str = "SELECT id, from_user, to_user, amount, message, status, \
     idempotency_key, expires_at, approved_at, rejected_at, cancelled_at, transaction_id, \
     created_at, updated_at FROM transfer_requests";

/// Insert a new pending request. Idempotent on the key: a resubmission
/// returns the original row, racing inserts fold into the winner.
pub async fn create(pool: &PgPool, request: &TransferRequest) -> Result<TransferRequest, LedgerError> {
    if let Some(existing) = get_by_key(pool, &request.idempotency_key).await? {
        tracing::info!(
            request_id = %existing.id,
            key = %request.idempotency_key,
            "Transfer request already exists for key - returning existing record"
        );
        return Ok(existing);
    }

    let result = sqlx::query(
        r#"
        INSERT INTO transfer_requests
            (id, from_user, to_user, amount, message, status, idempotency_key, expires_at)
        VALUES
            ($1, $2, $3, $4, $5, 'pending', $6, $7)
        "#,
    )
    .bind(request.id)
    .bind(request.from_user)
    .bind(request.to_user)
    .bind(request.amount)
    .bind(&request.message)
    .bind(&request.idempotency_key)
    .bind(request.expires_at)
    .execute(pool)
    .await;

    match result {
        Ok(_) => Ok(request.clone()),
        Err(e) if is_unique_violation(&e) => get_by_key(pool, &request.idempotency_key)
            .await?
            .ok_or(LedgerError::InProgress),
        Err(e) => Err(LedgerError::Database(e)),
    }
}

pub async fn get(pool: &PgPool, id: RequestId) -> Result<Option<TransferRequest>, LedgerError> {
    let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await?;

    row.map(|r| row_to_request(&r)).transpose()
}

pub async fn get_by_key(pool: &PgPool, key: &str) -> Result<Option<TransferRequest>, LedgerError> {
    let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE idempotency_key = $1"))
        .bind(key)
        .fetch_optional(pool)
        .await?;

    row.map(|r| row_to_request(&r)).transpose()
}

/// Pending requests addressed to the user. Rows past expiry are filtered
/// even when the sweeper has not promoted them yet.
pub async fn list_incoming(
    pool: &PgPool,
    user_id: crate::core_types::UserId,
    offset: i64,
    limit: i64,
) -> Result<Vec<TransferRequest>, LedgerError> {
    let rows = sqlx::query(&format!(
        "{SELECT_COLUMNS} WHERE to_user = $1 AND status = 'pending' AND expires_at > NOW() \
         ORDER BY created_at DESC OFFSET $2 LIMIT $3"
    ))
    .bind(user_id)
    .bind(offset)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_request).collect()
}

/// Pending requests the user has sent.
pub async fn list_outgoing(
    pool: &PgPool,
    user_id: crate::core_types::UserId,
    offset: i64,
    limit: i64,
) -> Result<Vec<TransferRequest>, LedgerError> {
    let rows = sqlx::query(&format!(
        "{SELECT_COLUMNS} WHERE from_user = $1 AND status = 'pending' AND expires_at > NOW() \
         ORDER BY created_at DESC OFFSET $2 LIMIT $3"
    ))
    .bind(user_id)
    .bind(offset)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_request).collect()
}

/// Atomic CAS transition out of `pending`. Returns false when another
/// actor already moved the request.
pub async fn transition(
    scope: &mut Scope,
    id: RequestId,
    to: RequestStatus,
) -> Result<bool, LedgerError> {
    if !RequestStatus::Pending.can_transition(to) {
        return Err(LedgerError::InvalidArgument(format!(
            "cannot transition a transfer request to {to}"
        )));
    }

    let stamp = match to {
        RequestStatus::Approved => ", approved_at = NOW()",
        RequestStatus::Rejected => ", rejected_at = NOW()",
        RequestStatus::Cancelled => ", cancelled_at = NOW()",
        _ => "",
    };

    let result = sqlx::query(&format!(
        "UPDATE transfer_requests SET status = $2, updated_at = NOW(){stamp} \
         WHERE id = $1 AND status = 'pending'"
    ))
    .bind(id)
    .bind(to.as_str())
    .execute(&mut **scope)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Store the transaction produced by approval, in the approval scope.
pub async fn set_transaction(
    scope: &mut Scope,
    id: RequestId,
    transaction_id: TransactionId,
) -> Result<(), LedgerError> {
    sqlx::query("UPDATE transfer_requests SET transaction_id = $2 WHERE id = $1")
        .bind(id)
        .bind(transaction_id)
        .execute(&mut **scope)
        .await?;
    Ok(())
}

/// Promote overdue pending rows to `expired` for listing cleanliness.
pub async fn sweep_expired(pool: &PgPool) -> Result<u64, LedgerError> {
    let result = sqlx::query(
        r#"
        UPDATE transfer_requests
        SET status = 'expired', updated_at = NOW()
        WHERE status = 'pending' AND expires_at <= NOW()
        "#,
    )
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

fn row_to_request(row: &PgRow) -> Result<TransferRequest, LedgerError> {
    let status_str: String = row.get("status");
    let status = RequestStatus::from_str_opt(&status_str).ok_or_else(|| {
        LedgerError::Internal(format!("invalid transfer request status: {status_str}"))
    })?;

    Ok(TransferRequest {
        id: row.get("id"),
        from_user: row.get("from_user"),
        to_user: row.get("to_user"),
        amount: row.get("amount"),
        message: row.get("message"),
        status,
        idempotency_key: row.get("idempotency_key"),
        expires_at: row.get("expires_at"),
        approved_at: row.get("approved_at"),
        rejected_at: row.get("rejected_at"),
        cancelled_at: row.get("cancelled_at"),
        transaction_id: row.get("transaction_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
