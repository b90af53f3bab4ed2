//! Transaction log
//!
//! Append-only record of every balance-moving event. Rows are created
//! `pending` and flipped exactly once to `completed` or `failed`; nothing
//! is ever deleted. Metadata is an open JSONB map so unknown keys written
//! by older deployments survive reads.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::core_types::{Points, TransactionId, UserId};
use crate::db::Scope;
use crate::error::LedgerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    Transfer,
    AdminGrant,
    AdminDeduct,
    SystemGrant,
    SystemExpire,
    Exchange,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Transfer => "transfer",
            TransactionType::AdminGrant => "admin_grant",
            TransactionType::AdminDeduct => "admin_deduct",
            TransactionType::SystemGrant => "system_grant",
            TransactionType::SystemExpire => "system_expire",
            TransactionType::Exchange => "exchange",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "transfer" => Some(TransactionType::Transfer),
            "admin_grant" => Some(TransactionType::AdminGrant),
            "admin_deduct" => Some(TransactionType::AdminDeduct),
            "system_grant" => Some(TransactionType::SystemGrant),
            "system_expire" => Some(TransactionType::SystemExpire),
            "exchange" => Some(TransactionType::Exchange),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Reversed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Reversed => "reversed",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TransactionStatus::Pending),
            "completed" => Some(TransactionStatus::Completed),
            "failed" => Some(TransactionStatus::Failed),
            "reversed" => Some(TransactionStatus::Reversed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

/// One immutable ledger entry.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: TransactionId,
    pub from_user: Option<UserId>,
    pub to_user: Option<UserId>,
    pub amount: Points,
    pub tx_type: TransactionType,
    pub status: TransactionStatus,
    pub idempotency_key: Option<String>,
    pub description: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields for a new pending entry.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub from_user: Option<UserId>,
    pub to_user: Option<UserId>,
    pub amount: Points,
    pub tx_type: TransactionType,
    pub idempotency_key: Option<String>,
    pub description: String,
    pub metadata: Option<serde_json::Value>,
}

/// Query filter for the admin listing.
#[derive(Debug, Clone, Default)]
pub struct TxFilter {
    pub tx_type: Option<TransactionType>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub sort_by: SortField,
    pub order: SortOrder,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortField {
    #[default]
    CreatedAt,
    Amount,
}

impl SortField {
    fn column(&self) -> &'static str {
        match self {
            SortField::CreatedAt => "created_at",
            SortField::Amount => "amount",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Append a new entry in `pending`.
pub async fn append(scope: &mut Scope, new_tx: &NewTransaction) -> Result<Transaction, LedgerError> {
    if new_tx.amount <= 0 {
        return Err(LedgerError::InvalidArgument(
            "transaction amount must be positive".to_string(),
        ));
    }
    if new_tx.from_user.is_none() && new_tx.to_user.is_none() {
        return Err(LedgerError::InvalidArgument(
            "transaction needs at least one party".to_string(),
        ));
    }

    let id = TransactionId::new_v4();
    let row = sqlx::query(
        r#"
        INSERT INTO transactions
            (id, from_user, to_user, amount, tx_type, status, idempotency_key, description, metadata)
        VALUES
            ($1, $2, $3, $4, $5, 'pending', $6, $7, $8)
        RETURNING created_at
        "#,
    )
    .bind(id)
    .bind(new_tx.from_user)
    .bind(new_tx.to_user)
    .bind(new_tx.amount)
    .bind(new_tx.tx_type.as_str())
    .bind(new_tx.idempotency_key.as_deref())
    .bind(&new_tx.description)
    .bind(new_tx.metadata.as_ref())
    .fetch_one(&mut **scope)
    .await?;

    Ok(Transaction {
        id,
        from_user: new_tx.from_user,
        to_user: new_tx.to_user,
        amount: new_tx.amount,
        tx_type: new_tx.tx_type,
        status: TransactionStatus::Pending,
        idempotency_key: new_tx.idempotency_key.clone(),
        description: new_tx.description.clone(),
        metadata: new_tx.metadata.clone(),
        created_at: row.get("created_at"),
        completed_at: None,
    })
}

/// Flip a pending entry to `completed` and stamp `completed_at`. The sole
/// mutator of the log.
pub async fn complete(
    scope: &mut Scope,
    id: TransactionId,
    at: DateTime<Utc>,
) -> Result<(), LedgerError> {
    let result = sqlx::query(
        r#"
        UPDATE transactions
        SET status = 'completed', completed_at = $2
        WHERE id = $1 AND status = 'pending'
        "#,
    )
    .bind(id)
    .bind(at)
    .execute(&mut **scope)
    .await?;

    if result.rows_affected() == 0 {
        return Err(LedgerError::Conflict(format!(
            "transaction {id} is not pending"
        )));
    }
    Ok(())
}

/// Flip a pending entry to `failed`.
pub async fn mark_failed(scope: &mut Scope, id: TransactionId) -> Result<(), LedgerError> {
    let result = sqlx::query(
        r#"
        UPDATE transactions
        SET status = 'failed', completed_at = NOW()
        WHERE id = $1 AND status = 'pending'
        "#,
    )
    .bind(id)
    .execute(&mut **scope)
    .await?;

    if result.rows_affected() == 0 {
        return Err(LedgerError::Conflict(format!(
            "transaction {id} is not pending"
        )));
    }
    Ok(())
}

pub async fn get(pool: &PgPool, id: TransactionId) -> Result<Option<Transaction>, LedgerError> {
    let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await?;

    row.map(|r| row_to_transaction(&r)).transpose()
}

pub async fn get_by_idempotency_key(
    pool: &PgPool,
    key: &str,
) -> Result<Option<Transaction>, LedgerError> {
    let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE idempotency_key = $1"))
        .bind(key)
        .fetch_optional(pool)
        .await?;

    row.map(|r| row_to_transaction(&r)).transpose()
}

/// Every entry touching the user, newest first.
pub async fn list_by_user(
    pool: &PgPool,
    user_id: UserId,
    offset: i64,
    limit: i64,
) -> Result<Vec<Transaction>, LedgerError> {
    let rows = sqlx::query(&format!(
        "{SELECT_COLUMNS} WHERE from_user = $1 OR to_user = $1 \
         ORDER BY created_at DESC OFFSET $2 LIMIT $3"
    ))
    .bind(user_id)
    .bind(offset)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_transaction).collect()
}

/// Filtered admin listing.
pub async fn list_all(
    pool: &PgPool,
    filter: &TxFilter,
    offset: i64,
    limit: i64,
) -> Result<Vec<Transaction>, LedgerError> {
    let mut builder: sqlx::QueryBuilder<sqlx::Postgres> = sqlx::QueryBuilder::new(SELECT_COLUMNS);
    builder.push(" WHERE TRUE");

    if let Some(tx_type) = filter.tx_type {
        builder.push(" AND tx_type = ").push_bind(tx_type.as_str());
    }
    if let Some(after) = filter.created_after {
        builder.push(" AND created_at >= ").push_bind(after);
    }
    if let Some(before) = filter.created_before {
        builder.push(" AND created_at < ").push_bind(before);
    }

    builder.push(" ORDER BY ");
    builder.push(filter.sort_by.column());
    builder.push(match filter.order {
        SortOrder::Asc => " ASC",
        SortOrder::Desc => " DESC",
    });
    builder.push(" OFFSET ").push_bind(offset);
    builder.push(" LIMIT ").push_bind(limit);

    let rows = builder.build().fetch_all(pool).await?;
    rows.iter().map(row_to_transaction).collect()
}

const SELECT_COLUMNS: &str = "SELECT id, from_user, to_user, amount, tx_type, status, \
     idempotency_key, description, metadata, created_at, completed_at FROM transactions";

fn row_to_transaction(row: &PgRow) -> Result<Transaction, LedgerError> {
    let type_str: String = row.get("tx_type");
    let tx_type = TransactionType::from_str_opt(&type_str)
        .ok_or_else(|| LedgerError::Internal(format!("invalid tx_type in row: {type_str}")))?;

    let status_str: String = row.get("status");
    let status = TransactionStatus::from_str_opt(&status_str)
        .ok_or_else(|| LedgerError::Internal(format!("invalid status in row: {status_str}")))?;

    Ok(Transaction {
        id: row.get("id"),
        from_user: row.get("from_user"),
        to_user: row.get("to_user"),
        amount: row.get("amount"),
        tx_type,
        status,
        idempotency_key: row.get("idempotency_key"),
        description: row.get("description"),
        metadata: row.get("metadata"),
        created_at: row.get("created_at"),
        completed_at: row.get("completed_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_roundtrip() {
        for t in [
            TransactionType::Transfer,
            TransactionType::AdminGrant,
            TransactionType::AdminDeduct,
            TransactionType::SystemGrant,
            TransactionType::SystemExpire,
            TransactionType::Exchange,
        ] {
            assert_eq!(TransactionType::from_str_opt(t.as_str()), Some(t));
        }
        assert_eq!(TransactionType::from_str_opt("refund"), None);
    }

    #[test]
    fn test_status_roundtrip_and_terminality() {
        for s in [
            TransactionStatus::Pending,
            TransactionStatus::Completed,
            TransactionStatus::Failed,
            TransactionStatus::Reversed,
        ] {
            assert_eq!(TransactionStatus::from_str_opt(s.as_str()), Some(s));
        }
        assert!(!TransactionStatus::Pending.is_terminal());
        assert!(TransactionStatus::Completed.is_terminal());
        assert!(TransactionStatus::Failed.is_terminal());
        assert!(TransactionStatus::Reversed.is_terminal());
    }

    #[test]
    fn test_default_filter_sorts_newest_first() {
        let filter = TxFilter::default();
        assert_eq!(filter.sort_by, SortField::CreatedAt);
        assert_eq!(filter.order, SortOrder::Desc);
    }
}
