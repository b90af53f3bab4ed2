//! Product exchange
//!
//! Spending points on catalog items: one scope debits the balance,
//! decrements stock, and records the exchange cross-linked to its
//! transaction. Cancellation is a compensating admin action because
//! exchanges are recorded `completed` at creation.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use tokio_util::sync::CancellationToken;

use crate::core_types::{Caller, ExchangeId, Points, ProductId, TransactionId, UserId};
use crate::db::Scope;
use crate::error::LedgerError;
use crate::ledger::engine::{ApplyOutcome, LedgerEngine, LedgerOp};
use crate::ledger::transactions::Transaction;

/// Stock value meaning "never runs out".
const UNLIMITED_STOCK: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeStatus {
    Pending,
    Completed,
    Cancelled,
    Delivered,
}

impl ExchangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeStatus::Pending => "pending",
            ExchangeStatus::Completed => "completed",
            ExchangeStatus::Cancelled => "cancelled",
            ExchangeStatus::Delivered => "delivered",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ExchangeStatus::Pending),
            "completed" => Some(ExchangeStatus::Completed),
            "cancelled" => Some(ExchangeStatus::Cancelled),
            "delivered" => Some(ExchangeStatus::Delivered),
            _ => None,
        }
    }
}

impl fmt::Display for ExchangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    pub price: Points,
    /// −1 means unlimited.
    pub stock: i32,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct ProductExchange {
    pub id: ExchangeId,
    pub user_id: UserId,
    pub product_id: ProductId,
    pub quantity: i32,
    pub points_used: Points,
    pub status: ExchangeStatus,
    pub transaction_id: Option<TransactionId>,
    pub notes: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Total cost with overflow detection.
fn compute_points_used(price: Points, quantity: i32) -> Result<Points, LedgerError> {
    if quantity < 1 {
        return Err(LedgerError::InvalidArgument(
            "quantity must be at least 1".to_string(),
        ));
    }
    price
        .checked_mul(quantity as Points)
        .filter(|total| *total > 0)
        .ok_or_else(|| LedgerError::InvalidArgument("exchange cost overflows".to_string()))
}

pub struct ExchangeService {
    engine: Arc<LedgerEngine>,
}

impl ExchangeService {
    pub fn new(engine: Arc<LedgerEngine>) -> Self {
        Self { engine }
    }

    fn pool(&self) -> &PgPool {
        self.engine.pool()
    }

    /// Spend points on a product. Atomic: debit, stock decrement, exchange
    /// record, transaction all commit together or not at all.
    pub async fn exchange(
        &self,
        caller: &Caller,
        product_id: ProductId,
        quantity: i32,
        idempotency_key: String,
        cancel: &CancellationToken,
    ) -> Result<(ProductExchange, Transaction), LedgerError> {
        let product = get_product(self.pool(), product_id)
            .await?
            .ok_or(LedgerError::NotFound("product"))?;
        if !product.is_active {
            return Err(LedgerError::NotFound("product"));
        }
        let points_used = compute_points_used(product.price, quantity)?;

        if let Some(tx) = self.engine.check_existing(&idempotency_key).await? {
            let exchange = get_by_transaction(self.pool(), tx.id)
                .await?
                .ok_or_else(|| {
                    LedgerError::Internal("exchange transaction has no exchange row".to_string())
                })?;
            return Ok((exchange, tx));
        }

        if cancel.is_cancelled() {
            return Err(LedgerError::Cancelled);
        }

        let exchange_id = ExchangeId::new_v4();
        let op = LedgerOp::exchange(
            caller.user_id,
            points_used,
            idempotency_key.clone(),
            format!("exchange {} x{}", product.name, quantity),
            Some(serde_json::json!({
                "exchange_id": exchange_id,
                "product_id": product.id,
            })),
        );

        let mut scope = self.pool().begin().await?;
        match self.engine.apply_in_scope(&mut scope, &op).await {
            Ok(ApplyOutcome::Applied(tx)) => {
                match self
                    .finish_exchange(&mut scope, exchange_id, caller.user_id, &product, quantity, points_used, tx.id)
                    .await
                {
                    Ok(exchange) => {
                        if cancel.is_cancelled() {
                            drop(scope);
                            self.engine.record_failure(&idempotency_key, caller.user_id).await;
                            return Err(LedgerError::Cancelled);
                        }
                        scope.commit().await?;
                        tracing::info!(
                            exchange = %exchange.id,
                            tx = %tx.id,
                            points_used,
                            "Exchange completed"
                        );
                        Ok((exchange, tx))
                    }
                    Err(e) => {
                        drop(scope);
                        self.engine.record_failure(&idempotency_key, caller.user_id).await;
                        Err(e)
                    }
                }
            }
            Ok(ApplyOutcome::DuplicateKey) => {
                drop(scope);
                let tx = self.engine.resolve_duplicate(&idempotency_key).await?;
                let exchange = get_by_transaction(self.pool(), tx.id)
                    .await?
                    .ok_or_else(|| {
                        LedgerError::Internal("exchange transaction has no exchange row".to_string())
                    })?;
                Ok((exchange, tx))
            }
            Err(e) => {
                drop(scope);
                self.engine.record_failure(&idempotency_key, caller.user_id).await;
                Err(e)
            }
        }
    }

    async fn finish_exchange(
        &self,
        scope: &mut Scope,
        exchange_id: ExchangeId,
        user_id: UserId,
        product: &Product,
        quantity: i32,
        points_used: Points,
        transaction_id: TransactionId,
    ) -> Result<ProductExchange, LedgerError> {
        let decremented = sqlx::query(
            r#"
            UPDATE products
            SET stock = CASE WHEN stock = $3 THEN stock ELSE stock - $2 END,
                updated_at = NOW()
            WHERE id = $1 AND (stock = $3 OR stock >= $2)
            "#,
        )
        .bind(product.id)
        .bind(quantity)
        .bind(UNLIMITED_STOCK)
        .execute(&mut **scope)
        .await?;
        if decremented.rows_affected() == 0 {
            return Err(LedgerError::OutOfStock);
        }

        let row = sqlx::query(
            r#"
            INSERT INTO product_exchanges
                (id, user_id, product_id, quantity, points_used, status, transaction_id, completed_at)
            VALUES
                ($1, $2, $3, $4, $5, 'completed', $6, NOW())
            RETURNING created_at, completed_at
            "#,
        )
        .bind(exchange_id)
        .bind(user_id)
        .bind(product.id)
        .bind(quantity)
        .bind(points_used)
        .bind(transaction_id)
        .fetch_one(&mut **scope)
        .await?;

        Ok(ProductExchange {
            id: exchange_id,
            user_id,
            product_id: product.id,
            quantity,
            points_used,
            status: ExchangeStatus::Completed,
            transaction_id: Some(transaction_id),
            notes: String::new(),
            created_at: row.get("created_at"),
            completed_at: row.get("completed_at"),
            delivered_at: None,
        })
    }

    /// Compensating cancellation: credit the points back, restock, and
    /// retire the exchange. Admin only; a delivered or already cancelled
    /// exchange cannot be cancelled.
    pub async fn cancel(
        &self,
        caller: &Caller,
        exchange_id: ExchangeId,
        cancel: &CancellationToken,
    ) -> Result<(ProductExchange, Transaction), LedgerError> {
        if !caller.is_admin() {
            return Err(LedgerError::Forbidden("admin role required".to_string()));
        }
        if cancel.is_cancelled() {
            return Err(LedgerError::Cancelled);
        }

        let key = format!("exchange-cancel:{exchange_id}");
        if let Some(tx) = self.engine.check_existing(&key).await? {
            let exchange = get(self.pool(), exchange_id)
                .await?
                .ok_or(LedgerError::NotFound("exchange"))?;
            return Ok((exchange, tx));
        }

        let mut scope = self.pool().begin().await?;
        let exchange = lock(&mut scope, exchange_id)
            .await?
            .ok_or(LedgerError::NotFound("exchange"))?;
        if exchange.status != ExchangeStatus::Completed {
            return Err(LedgerError::InvalidArgument(format!(
                "cannot cancel a {} exchange",
                exchange.status
            )));
        }

        let op = LedgerOp::admin_grant(
            caller.user_id,
            exchange.user_id,
            exchange.points_used,
            key.clone(),
            format!("refund for cancelled exchange {exchange_id}"),
            Some(serde_json::json!({
                "admin_id": caller.user_id,
                "exchange_id": exchange.id,
            })),
        );

        match self.engine.apply_in_scope(&mut scope, &op).await {
            Ok(ApplyOutcome::Applied(tx)) => {
                sqlx::query(
                    r#"
                    UPDATE products
                    SET stock = CASE WHEN stock = $3 THEN stock ELSE stock + $2 END,
                        updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(exchange.product_id)
                .bind(exchange.quantity)
                .bind(UNLIMITED_STOCK)
                .execute(&mut *scope)
                .await?;

                let retired = sqlx::query(
                    r#"
                    UPDATE product_exchanges
                    SET status = 'cancelled'
                    WHERE id = $1 AND status = 'completed'
                    "#,
                )
                .bind(exchange.id)
                .execute(&mut *scope)
                .await?;
                if retired.rows_affected() == 0 {
                    return Err(LedgerError::Conflict(
                        "exchange moved out of completed".to_string(),
                    ));
                }

                scope.commit().await?;
                let cancelled = get(self.pool(), exchange.id)
                    .await?
                    .ok_or(LedgerError::NotFound("exchange"))?;
                tracing::info!(exchange = %cancelled.id, tx = %tx.id, "Cancelled exchange");
                Ok((cancelled, tx))
            }
            Ok(ApplyOutcome::DuplicateKey) => {
                drop(scope);
                let tx = self.engine.resolve_duplicate(&key).await?;
                let exchange = get(self.pool(), exchange_id)
                    .await?
                    .ok_or(LedgerError::NotFound("exchange"))?;
                Ok((exchange, tx))
            }
            Err(e) => {
                drop(scope);
                self.engine.record_failure(&key, caller.user_id).await;
                Err(e)
            }
        }
    }

    /// completed -> delivered, stamping `delivered_at`.
    pub async fn mark_delivered(
        &self,
        caller: &Caller,
        exchange_id: ExchangeId,
    ) -> Result<ProductExchange, LedgerError> {
        if !caller.is_admin() {
            return Err(LedgerError::Forbidden("admin role required".to_string()));
        }

        let result = sqlx::query(
            r#"
            UPDATE product_exchanges
            SET status = 'delivered', delivered_at = NOW()
            WHERE id = $1 AND status = 'completed'
            "#,
        )
        .bind(exchange_id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            let existing = get(self.pool(), exchange_id)
                .await?
                .ok_or(LedgerError::NotFound("exchange"))?;
            return Err(LedgerError::InvalidArgument(format!(
                "cannot deliver a {} exchange",
                existing.status
            )));
        }

        get(self.pool(), exchange_id)
            .await?
            .ok_or(LedgerError::NotFound("exchange"))
    }

    pub async fn list_for_user(
        &self,
        caller: &Caller,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<ProductExchange>, LedgerError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE user_id = $1 ORDER BY created_at DESC OFFSET $2 LIMIT $3"
        ))
        .bind(caller.user_id)
        .bind(offset)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(row_to_exchange).collect()
    }
}

pub async fn get_product(pool: &PgPool, id: ProductId) -> Result<Option<Product>, LedgerError> {
    let row = sqlx::query("SELECT id, name, price, stock, is_active FROM products WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(row.map(|r| Product {
        id: r.get("id"),
        name: r.get("name"),
        price: r.get("price"),
        stock: r.get("stock"),
        is_active: r.get("is_active"),
    }))
}

const SELECT_COLUMNS: &str = "SELECT id, user_id, product_id, quantity, points_used, status, \
     transaction_id, notes, created_at, completed_at, delivered_at FROM product_exchanges";

pub async fn get(pool: &PgPool, id: ExchangeId) -> Result<Option<ProductExchange>, LedgerError> {
    let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await?;

    row.map(|r| row_to_exchange(&r)).transpose()
}

async fn get_by_transaction(
    pool: &PgPool,
    transaction_id: TransactionId,
) -> Result<Option<ProductExchange>, LedgerError> {
    let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE transaction_id = $1"))
        .bind(transaction_id)
        .fetch_optional(pool)
        .await?;

    row.map(|r| row_to_exchange(&r)).transpose()
}

async fn lock(scope: &mut Scope, id: ExchangeId) -> Result<Option<ProductExchange>, LedgerError> {
    let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = $1 FOR UPDATE"))
        .bind(id)
        .fetch_optional(&mut **scope)
        .await?;

    row.map(|r| row_to_exchange(&r)).transpose()
}

fn row_to_exchange(row: &PgRow) -> Result<ProductExchange, LedgerError> {
    let status_str: String = row.get("status");
    let status = ExchangeStatus::from_str_opt(&status_str)
        .ok_or_else(|| LedgerError::Internal(format!("invalid exchange status: {status_str}")))?;

    Ok(ProductExchange {
        id: row.get("id"),
        user_id: row.get("user_id"),
        product_id: row.get("product_id"),
        quantity: row.get("quantity"),
        points_used: row.get("points_used"),
        status,
        transaction_id: row.get("transaction_id"),
        notes: row.get("notes"),
        created_at: row.get("created_at"),
        completed_at: row.get("completed_at"),
        delivered_at: row.get("delivered_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_points_used() {
        assert_eq!(compute_points_used(100, 3).unwrap(), 300);
        assert_eq!(compute_points_used(1, 1).unwrap(), 1);
    }

    #[test]
    fn test_compute_points_used_rejects_bad_quantity() {
        assert!(matches!(
            compute_points_used(100, 0),
            Err(LedgerError::InvalidArgument(_))
        ));
        assert!(matches!(
            compute_points_used(100, -2),
            Err(LedgerError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_compute_points_used_detects_overflow() {
        assert!(matches!(
            compute_points_used(Points::MAX, 2),
            Err(LedgerError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_status_roundtrip() {
        for s in [
            ExchangeStatus::Pending,
            ExchangeStatus::Completed,
            ExchangeStatus::Cancelled,
            ExchangeStatus::Delivered,
        ] {
            assert_eq!(ExchangeStatus::from_str_opt(s.as_str()), Some(s));
        }
        assert_eq!(ExchangeStatus::from_str_opt("shipped"), None);
    }
}
