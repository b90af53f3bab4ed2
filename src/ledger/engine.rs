//! Ledger engine
//!
//! Orchestrates the atomic {claim key, append log, lock balances, mutate,
//! bind key} sequence that every balance movement goes through. Higher
//! flows (transfer requests, QR scans, exchanges, daily bonuses) either
//! call the public operations here or compose `apply_in_scope` into their
//! own scope.
//!
//! The protocol for an operation with key K:
//! 1. Outside any scope, look K up. Completed -> return its transaction
//!    without touching anything. Processing -> `InProgress`. Failed ->
//!    `Conflict`.
//! 2. Open a scope, claim K with a `processing` insert. A unique violation
//!    means a concurrent winner exists: roll back and re-observe step 1.
//! 3. Append the transaction in `pending`, lock and adjust balances in
//!    ascending user-id order, re-verify the caller where required.
//! 4. Flip the transaction to `completed`, bind K to it, commit.
//! 5. Any error: roll back, then downgrade K to `failed` outside the scope.

use std::sync::Arc;

use chrono::Utc;
use sqlx::{PgPool, Row};
use tokio_util::sync::CancellationToken;

use super::balances::{self, BalanceUpdate, Direction};
use super::friendship::FriendshipGate;
use super::idempotency::{self, ClaimOutcome, KeyStatus};
use super::transactions::{self, NewTransaction, Transaction, TransactionStatus, TransactionType};
use crate::core_types::{Caller, Points, UserId};
use crate::db::Scope;
use crate::error::LedgerError;

/// A balance-moving operation, fully resolved by the calling flow.
#[derive(Debug, Clone)]
pub struct LedgerOp {
    pub tx_type: TransactionType,
    pub from_user: Option<UserId>,
    pub to_user: Option<UserId>,
    pub amount: Points,
    pub idempotency_key: String,
    pub description: String,
    pub metadata: Option<serde_json::Value>,
    /// The user the key row is bound to (the submitting principal).
    key_owner: UserId,
    /// Admin operations re-verify this caller inside the scope, after
    /// locks are taken, so a concurrent demotion cannot race the grant.
    verify_admin: Option<UserId>,
}

impl LedgerOp {
    pub fn transfer(
        from: UserId,
        to: UserId,
        amount: Points,
        key: String,
        description: String,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self {
            tx_type: TransactionType::Transfer,
            from_user: Some(from),
            to_user: Some(to),
            amount,
            idempotency_key: key,
            description,
            metadata,
            key_owner: from,
            verify_admin: None,
        }
    }

    pub fn admin_grant(
        admin: UserId,
        target: UserId,
        amount: Points,
        key: String,
        description: String,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self {
            tx_type: TransactionType::AdminGrant,
            from_user: None,
            to_user: Some(target),
            amount,
            idempotency_key: key,
            description,
            metadata,
            key_owner: admin,
            verify_admin: Some(admin),
        }
    }

    pub fn admin_deduct(
        admin: UserId,
        target: UserId,
        amount: Points,
        key: String,
        description: String,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self {
            tx_type: TransactionType::AdminDeduct,
            from_user: Some(target),
            to_user: None,
            amount,
            idempotency_key: key,
            description,
            metadata,
            key_owner: admin,
            verify_admin: Some(admin),
        }
    }

    pub fn system_grant(
        target: UserId,
        amount: Points,
        key: String,
        description: String,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self {
            tx_type: TransactionType::SystemGrant,
            from_user: None,
            to_user: Some(target),
            amount,
            idempotency_key: key,
            description,
            metadata,
            key_owner: target,
            verify_admin: None,
        }
    }

    pub fn exchange(
        user: UserId,
        amount: Points,
        key: String,
        description: String,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self {
            tx_type: TransactionType::Exchange,
            from_user: Some(user),
            to_user: None,
            amount,
            idempotency_key: key,
            description,
            metadata,
            key_owner: user,
            verify_admin: None,
        }
    }

    pub fn key_owner(&self) -> UserId {
        self.key_owner
    }

    /// Balance effects of this operation. `lock_and_adjust_many` sorts
    /// them before locking.
    fn balance_updates(&self) -> Vec<BalanceUpdate> {
        let mut updates = Vec::with_capacity(2);
        if let Some(from) = self.from_user {
            updates.push(BalanceUpdate {
                user_id: from,
                amount: self.amount,
                direction: Direction::Debit,
            });
        }
        if let Some(to) = self.to_user {
            updates.push(BalanceUpdate {
                user_id: to,
                amount: self.amount,
                direction: Direction::Credit,
            });
        }
        updates
    }

    fn validate(&self) -> Result<(), LedgerError> {
        if self.amount <= 0 {
            return Err(LedgerError::InvalidArgument(
                "amount must be positive".to_string(),
            ));
        }
        if self.from_user.is_none() && self.to_user.is_none() {
            return Err(LedgerError::InvalidArgument(
                "operation needs at least one party".to_string(),
            ));
        }
        if self.idempotency_key.is_empty() {
            return Err(LedgerError::InvalidArgument(
                "idempotency key must not be empty".to_string(),
            ));
        }
        if let (Some(from), Some(to)) = (self.from_user, self.to_user)
            && from == to
        {
            return Err(LedgerError::InvalidArgument(
                "sender and recipient must differ".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of applying an operation within a caller-owned scope.
#[derive(Debug)]
pub enum ApplyOutcome {
    Applied(Transaction),
    /// Another execution holds the same key. The scope is poisoned; the
    /// caller must roll back and call [`LedgerEngine::resolve_duplicate`].
    DuplicateKey,
}

/// Arguments for a user-to-user transfer.
#[derive(Debug, Clone)]
pub struct TransferArgs {
    pub from: UserId,
    pub to: UserId,
    pub amount: Points,
    pub idempotency_key: String,
    pub description: String,
    pub metadata: Option<serde_json::Value>,
}

pub struct LedgerEngine {
    pool: PgPool,
    friendship: Arc<dyn FriendshipGate>,
}

impl LedgerEngine {
    pub fn new(pool: PgPool, friendship: Arc<dyn FriendshipGate>) -> Self {
        Self { pool, friendship }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// User-to-user transfer. The caller must be the sender and in an
    /// accepted relation with the recipient.
    pub async fn transfer(
        &self,
        caller: &Caller,
        args: TransferArgs,
        cancel: &CancellationToken,
    ) -> Result<Transaction, LedgerError> {
        if caller.user_id != args.from {
            return Err(LedgerError::Forbidden(
                "only the sender may submit a transfer".to_string(),
            ));
        }
        if args.from == args.to {
            return Err(LedgerError::InvalidArgument(
                "cannot transfer to yourself".to_string(),
            ));
        }
        if !self.friendship.are_friends(args.from, args.to).await? {
            return Err(LedgerError::Forbidden(
                "sender and recipient are not friends".to_string(),
            ));
        }

        let op = LedgerOp::transfer(
            args.from,
            args.to,
            args.amount,
            args.idempotency_key,
            args.description,
            args.metadata,
        );
        self.execute(op, cancel).await
    }

    /// Administrative credit to one user.
    pub async fn admin_grant(
        &self,
        caller: &Caller,
        target: UserId,
        amount: Points,
        key: String,
        description: String,
        cancel: &CancellationToken,
    ) -> Result<Transaction, LedgerError> {
        if !caller.is_admin() {
            return Err(LedgerError::Forbidden("admin role required".to_string()));
        }
        let metadata = serde_json::json!({ "admin_id": caller.user_id });
        let op = LedgerOp::admin_grant(caller.user_id, target, amount, key, description, Some(metadata));
        self.execute(op, cancel).await
    }

    /// Administrative debit from one user.
    pub async fn admin_deduct(
        &self,
        caller: &Caller,
        target: UserId,
        amount: Points,
        key: String,
        description: String,
        cancel: &CancellationToken,
    ) -> Result<Transaction, LedgerError> {
        if !caller.is_admin() {
            return Err(LedgerError::Forbidden("admin role required".to_string()));
        }
        let metadata = serde_json::json!({ "admin_id": caller.user_id });
        let op =
            LedgerOp::admin_deduct(caller.user_id, target, amount, key, description, Some(metadata));
        self.execute(op, cancel).await
    }

    /// Service-internal credit (daily bonus, lottery). No caller; the
    /// invoking subsystem derives a namespaced key.
    pub async fn system_grant(
        &self,
        target: UserId,
        amount: Points,
        key: String,
        description: String,
        metadata: Option<serde_json::Value>,
        cancel: &CancellationToken,
    ) -> Result<Transaction, LedgerError> {
        let op = LedgerOp::system_grant(target, amount, key, description, metadata);
        self.execute(op, cancel).await
    }

    /// Run the full protocol for one operation in its own scope.
    pub async fn execute(
        &self,
        op: LedgerOp,
        cancel: &CancellationToken,
    ) -> Result<Transaction, LedgerError> {
        op.validate()?;

        if let Some(existing) = self.check_existing(&op.idempotency_key).await? {
            tracing::debug!(key = %op.idempotency_key, tx = %existing.id, "Idempotent replay");
            return Ok(existing);
        }

        if cancel.is_cancelled() {
            return Err(LedgerError::Cancelled);
        }

        let mut scope = self.pool.begin().await?;
        match self.apply_in_scope(&mut scope, &op).await {
            Ok(ApplyOutcome::Applied(tx)) => {
                if cancel.is_cancelled() {
                    drop(scope);
                    self.record_failure(&op.idempotency_key, op.key_owner).await;
                    return Err(LedgerError::Cancelled);
                }
                scope.commit().await?;
                tracing::info!(
                    tx = %tx.id,
                    tx_type = tx.tx_type.as_str(),
                    amount = tx.amount,
                    key = %op.idempotency_key,
                    "Ledger operation committed"
                );
                Ok(tx)
            }
            Ok(ApplyOutcome::DuplicateKey) => {
                drop(scope);
                self.resolve_duplicate(&op.idempotency_key).await
            }
            Err(e) => {
                drop(scope);
                self.record_failure(&op.idempotency_key, op.key_owner).await;
                Err(e)
            }
        }
    }

    /// Consult the friendship gate, mapping a refusal to `Forbidden`.
    pub async fn ensure_friends(&self, a: UserId, b: UserId) -> Result<(), LedgerError> {
        if !self.friendship.are_friends(a, b).await? {
            return Err(LedgerError::Forbidden(
                "sender and recipient are not friends".to_string(),
            ));
        }
        Ok(())
    }

    /// Step 1 of the protocol: observe the registry without mutating.
    pub async fn check_existing(&self, key: &str) -> Result<Option<Transaction>, LedgerError> {
        let Some(entry) = idempotency::find(&self.pool, key).await? else {
            return Ok(None);
        };

        match entry.status {
            KeyStatus::Completed => {
                let tx_id = entry.transaction_id.ok_or_else(|| {
                    LedgerError::Internal(format!("completed key {key} has no transaction"))
                })?;
                let tx = transactions::get(&self.pool, tx_id).await?.ok_or_else(|| {
                    LedgerError::Internal(format!("key {key} references missing transaction"))
                })?;
                Ok(Some(tx))
            }
            KeyStatus::Processing => Err(LedgerError::InProgress),
            KeyStatus::Failed => Err(LedgerError::Conflict(format!(
                "operation with key {key} previously failed"
            ))),
        }
    }

    /// Steps 2-4 inside a caller-owned scope. Composed flows (transfer
    /// approval, QR scan, exchange) add their own writes to the same scope
    /// before committing.
    pub async fn apply_in_scope(
        &self,
        scope: &mut Scope,
        op: &LedgerOp,
    ) -> Result<ApplyOutcome, LedgerError> {
        op.validate()?;

        match idempotency::insert_processing(scope, &op.idempotency_key, op.key_owner).await? {
            ClaimOutcome::Inserted => {}
            ClaimOutcome::Duplicate => return Ok(ApplyOutcome::DuplicateKey),
        }

        let new_tx = NewTransaction {
            from_user: op.from_user,
            to_user: op.to_user,
            amount: op.amount,
            tx_type: op.tx_type,
            idempotency_key: Some(op.idempotency_key.clone()),
            description: op.description.clone(),
            metadata: op.metadata.clone(),
        };
        let mut tx = transactions::append(scope, &new_tx).await?;

        balances::lock_and_adjust_many(scope, &op.balance_updates()).await?;

        if let Some(admin_id) = op.verify_admin {
            self.verify_admin_in_scope(scope, admin_id).await?;
        }

        let completed_at = Utc::now();
        transactions::complete(scope, tx.id, completed_at).await?;
        idempotency::mark_completed(scope, &op.idempotency_key, tx.id).await?;

        tx.status = TransactionStatus::Completed;
        tx.completed_at = Some(completed_at);
        Ok(ApplyOutcome::Applied(tx))
    }

    /// Re-observe the registry after losing the key race. By the time the
    /// loser gets here the winner has usually committed; if it is still
    /// in flight the caller sees `InProgress` and retries.
    pub async fn resolve_duplicate(&self, key: &str) -> Result<Transaction, LedgerError> {
        match self.check_existing(key).await? {
            Some(tx) => Ok(tx),
            None => Err(LedgerError::InProgress),
        }
    }

    /// Downgrade the key after a rolled-back scope. Best effort; the key
    /// expires on its own if this write also fails.
    pub async fn record_failure(&self, key: &str, owner: UserId) {
        if let Err(e) = idempotency::mark_failed(&self.pool, key, owner).await {
            tracing::warn!(key = %key, error = %e, "Failed to record idempotency failure");
        }
    }

    /// Role and active status re-check within the scope, after locks.
    async fn verify_admin_in_scope(
        &self,
        scope: &mut Scope,
        user_id: UserId,
    ) -> Result<(), LedgerError> {
        let row = sqlx::query(
            "SELECT role, is_active FROM users WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(user_id)
        .fetch_optional(&mut **scope)
        .await?
        .ok_or(LedgerError::NotFound("admin user"))?;

        let role: String = row.get("role");
        if role != "admin" {
            return Err(LedgerError::Forbidden(
                "caller is no longer an admin".to_string(),
            ));
        }
        if !row.get::<bool, _>("is_active") {
            return Err(LedgerError::Forbidden("caller is deactivated".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_transfer_op_effects() {
        let from = Uuid::new_v4();
        let to = Uuid::new_v4();
        let op = LedgerOp::transfer(from, to, 300, "k1".into(), "".into(), None);

        let updates = op.balance_updates();
        assert_eq!(updates.len(), 2);
        assert!(updates
            .iter()
            .any(|u| u.user_id == from && u.direction == Direction::Debit && u.amount == 300));
        assert!(updates
            .iter()
            .any(|u| u.user_id == to && u.direction == Direction::Credit && u.amount == 300));
        assert_eq!(op.key_owner(), from);
        assert!(op.verify_admin.is_none());
    }

    #[test]
    fn test_admin_ops_bind_key_to_admin() {
        let admin = Uuid::new_v4();
        let target = Uuid::new_v4();

        let grant = LedgerOp::admin_grant(admin, target, 50, "g".into(), "".into(), None);
        assert_eq!(grant.key_owner(), admin);
        assert_eq!(grant.verify_admin, Some(admin));
        assert_eq!(grant.balance_updates().len(), 1);
        assert_eq!(grant.balance_updates()[0].direction, Direction::Credit);

        let deduct = LedgerOp::admin_deduct(admin, target, 50, "d".into(), "".into(), None);
        assert_eq!(deduct.balance_updates()[0].direction, Direction::Debit);
        assert_eq!(deduct.balance_updates()[0].user_id, target);
    }

    #[test]
    fn test_validate_rejects_bad_ops() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let zero = LedgerOp::transfer(a, b, 0, "k".into(), "".into(), None);
        assert!(matches!(
            zero.validate(),
            Err(LedgerError::InvalidArgument(_))
        ));

        let self_transfer = LedgerOp::transfer(a, a, 10, "k".into(), "".into(), None);
        assert!(matches!(
            self_transfer.validate(),
            Err(LedgerError::InvalidArgument(_))
        ));

        let no_key = LedgerOp::transfer(a, b, 10, String::new(), "".into(), None);
        assert!(matches!(
            no_key.validate(),
            Err(LedgerError::InvalidArgument(_))
        ));

        let ok = LedgerOp::transfer(a, b, 10, "k".into(), "".into(), None);
        assert!(ok.validate().is_ok());
    }
}
