//! Balance store
//!
//! Row-locked balance arithmetic. Every write takes an exclusive lock on
//! the user row (`SELECT … FOR UPDATE`), checks non-negativity after the
//! arithmetic, and bumps the row version. Multi-user adjustments lock in
//! ascending user-id order so opposing concurrent transfers cannot form a
//! deadlock cycle.

use sqlx::Row;

use crate::core_types::{Points, UserId};
use crate::db::Scope;
use crate::error::LedgerError;

/// Which way the points move relative to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Credit,
    Debit,
}

/// One balance adjustment within a scope.
#[derive(Debug, Clone, Copy)]
pub struct BalanceUpdate {
    pub user_id: UserId,
    pub amount: Points,
    pub direction: Direction,
}

/// Lock one user row and apply a single adjustment. Returns the new
/// balance. The lock is held until the surrounding scope commits or rolls
/// back.
pub async fn lock_and_adjust(
    scope: &mut Scope,
    user_id: UserId,
    amount: Points,
    direction: Direction,
) -> Result<Points, LedgerError> {
    if amount <= 0 {
        return Err(LedgerError::InvalidArgument(
            "adjustment amount must be positive".to_string(),
        ));
    }

    let row = sqlx::query(
        r#"
        SELECT balance, is_active, deleted_at
        FROM users
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(user_id)
    .fetch_optional(&mut **scope)
    .await?
    .ok_or(LedgerError::NotFound("user"))?;

    let deleted: Option<chrono::DateTime<chrono::Utc>> = row.get("deleted_at");
    if deleted.is_some() {
        return Err(LedgerError::NotFound("user"));
    }
    if !row.get::<bool, _>("is_active") {
        return Err(LedgerError::Forbidden(format!(
            "user {user_id} is deactivated"
        )));
    }

    let balance: Points = row.get("balance");
    let new_balance = match direction {
        Direction::Credit => balance
            .checked_add(amount)
            .ok_or_else(|| LedgerError::Internal("balance overflow".to_string()))?,
        Direction::Debit => {
            if balance < amount {
                return Err(LedgerError::InsufficientBalance {
                    available: balance,
                    requested: amount,
                });
            }
            balance - amount
        }
    };

    // Guard against arithmetic surprises independently of the branch above.
    if new_balance < 0 {
        return Err(LedgerError::InsufficientBalance {
            available: balance,
            requested: amount,
        });
    }

    sqlx::query(
        r#"
        UPDATE users
        SET balance = $2, version = version + 1, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(user_id)
    .bind(new_balance)
    .execute(&mut **scope)
    .await?;

    tracing::debug!(user_id = %user_id, ?direction, amount, new_balance, "Adjusted balance");
    Ok(new_balance)
}

/// Apply several adjustments inside one scope, locking rows in ascending
/// user-id order (binary uuid compare).
pub async fn lock_and_adjust_many(
    scope: &mut Scope,
    updates: &[BalanceUpdate],
) -> Result<(), LedgerError> {
    for update in lock_order(updates) {
        lock_and_adjust(scope, update.user_id, update.amount, update.direction).await?;
    }
    Ok(())
}

/// The deterministic order in which rows are locked.
fn lock_order(updates: &[BalanceUpdate]) -> Vec<BalanceUpdate> {
    let mut sorted = updates.to_vec();
    sorted.sort_by_key(|u| u.user_id);
    sorted
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_lock_order_ascending() {
        let low = Uuid::from_u128(1);
        let high = Uuid::from_u128(u128::MAX);
        let updates = [
            BalanceUpdate {
                user_id: high,
                amount: 10,
                direction: Direction::Credit,
            },
            BalanceUpdate {
                user_id: low,
                amount: 10,
                direction: Direction::Debit,
            },
        ];

        let ordered = lock_order(&updates);
        assert_eq!(ordered[0].user_id, low);
        assert_eq!(ordered[1].user_id, high);

        // Opposite submission order locks identically.
        let reversed = [updates[1], updates[0]];
        let ordered_rev = lock_order(&reversed);
        assert_eq!(ordered_rev[0].user_id, low);
        assert_eq!(ordered_rev[1].user_id, high);
    }
}
