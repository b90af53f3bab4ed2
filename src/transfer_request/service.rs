//! Transfer request workflow
//!
//! Creation, the recipient/sender transitions, and the background expiry
//! sweeper. Approval runs the ledger transfer inside the same scope as the
//! status flip, keyed by `transfer-request:<id>` so it can never collide
//! with a direct transfer submitted under the same client key.

use std::sync::Arc;

use chrono::{Duration, Utc};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use super::db;
use super::types::{RequestStatus, TransferRequest};
use crate::account::UserRepository;
use crate::core_types::{Caller, Points, RequestId, UserId};
use crate::error::LedgerError;
use crate::ledger::engine::{ApplyOutcome, LedgerEngine, LedgerOp};
use crate::ledger::transactions::Transaction;

/// Namespace tag for approval transfers.
fn approval_key(id: RequestId) -> String {
    format!("transfer-request:{id}")
}

#[derive(Debug, Clone)]
pub struct CreateRequestArgs {
    pub to: UserId,
    pub amount: Points,
    pub message: String,
    pub idempotency_key: String,
}

pub struct TransferRequestService {
    engine: Arc<LedgerEngine>,
    ttl: Duration,
}

impl TransferRequestService {
    pub fn new(engine: Arc<LedgerEngine>, ttl_hours: i64) -> Self {
        Self {
            engine,
            ttl: Duration::hours(ttl_hours),
        }
    }

    fn pool(&self) -> &PgPool {
        self.engine.pool()
    }

    /// Create a pending request from the caller to `args.to`. Resubmission
    /// with the same key returns the original request.
    pub async fn create(
        &self,
        caller: &Caller,
        args: CreateRequestArgs,
    ) -> Result<TransferRequest, LedgerError> {
        if args.amount <= 0 {
            return Err(LedgerError::InvalidArgument(
                "amount must be positive".to_string(),
            ));
        }
        if args.to == caller.user_id {
            return Err(LedgerError::InvalidArgument(
                "cannot request a transfer to yourself".to_string(),
            ));
        }
        if args.idempotency_key.is_empty() {
            return Err(LedgerError::InvalidArgument(
                "idempotency key must not be empty".to_string(),
            ));
        }

        let recipient = UserRepository::get_by_id(self.pool(), args.to)
            .await?
            .ok_or(LedgerError::NotFound("recipient"))?;
        if !recipient.is_live() {
            return Err(LedgerError::Forbidden(
                "recipient is deactivated".to_string(),
            ));
        }
        self.engine.ensure_friends(caller.user_id, args.to).await?;

        let now = Utc::now();
        let request = TransferRequest {
            id: RequestId::new_v4(),
            from_user: caller.user_id,
            to_user: args.to,
            amount: args.amount,
            message: args.message,
            status: RequestStatus::Pending,
            idempotency_key: args.idempotency_key,
            expires_at: now + self.ttl,
            approved_at: None,
            rejected_at: None,
            cancelled_at: None,
            transaction_id: None,
            created_at: now,
            updated_at: now,
        };

        let stored = db::create(self.pool(), &request).await?;
        if stored.from_user != caller.user_id {
            // The key belongs to a different sender's request.
            return Err(LedgerError::Conflict(
                "idempotency key already used by another request".to_string(),
            ));
        }

        tracing::info!(request = %stored, "Created transfer request");
        Ok(stored)
    }

    pub async fn get(&self, caller: &Caller, id: RequestId) -> Result<TransferRequest, LedgerError> {
        let request = db::get(self.pool(), id)
            .await?
            .ok_or(LedgerError::NotFound("transfer request"))?;
        if request.from_user != caller.user_id
            && request.to_user != caller.user_id
            && !caller.is_admin()
        {
            return Err(LedgerError::Forbidden(
                "not a party to this transfer request".to_string(),
            ));
        }
        Ok(request)
    }

    pub async fn list_incoming(
        &self,
        caller: &Caller,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<TransferRequest>, LedgerError> {
        db::list_incoming(self.pool(), caller.user_id, offset, limit).await
    }

    pub async fn list_outgoing(
        &self,
        caller: &Caller,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<TransferRequest>, LedgerError> {
        db::list_outgoing(self.pool(), caller.user_id, offset, limit).await
    }

    /// Recipient approves: one scope flips the status, moves the points,
    /// and records the produced transaction on the request.
    pub async fn approve(
        &self,
        caller: &Caller,
        id: RequestId,
        cancel: &CancellationToken,
    ) -> Result<(TransferRequest, Transaction), LedgerError> {
        let request = db::get(self.pool(), id)
            .await?
            .ok_or(LedgerError::NotFound("transfer request"))?;

        if request.to_user != caller.user_id {
            return Err(LedgerError::Forbidden(
                "only the recipient may approve".to_string(),
            ));
        }
        if request.status != RequestStatus::Pending {
            return Err(LedgerError::InvalidArgument(format!(
                "transfer request is {}, not pending",
                request.status
            )));
        }
        if request.is_expired(Utc::now()) {
            return Err(LedgerError::Expired("transfer request"));
        }
        if cancel.is_cancelled() {
            return Err(LedgerError::Cancelled);
        }

        let key = approval_key(request.id);
        let op = LedgerOp::transfer(
            request.from_user,
            request.to_user,
            request.amount,
            key.clone(),
            request.message.clone(),
            Some(serde_json::json!({ "transfer_request_id": request.id })),
        );

        let mut scope = self.pool().begin().await?;

        if !db::transition(&mut scope, request.id, RequestStatus::Approved).await? {
            return Err(LedgerError::InvalidArgument(
                "transfer request is no longer pending".to_string(),
            ));
        }

        match self.engine.apply_in_scope(&mut scope, &op).await {
            Ok(ApplyOutcome::Applied(tx)) => {
                db::set_transaction(&mut scope, request.id, tx.id).await?;
                if cancel.is_cancelled() {
                    drop(scope);
                    self.engine.record_failure(&key, request.from_user).await;
                    return Err(LedgerError::Cancelled);
                }
                scope.commit().await?;

                let approved = db::get(self.pool(), request.id)
                    .await?
                    .ok_or(LedgerError::NotFound("transfer request"))?;
                tracing::info!(request = %approved, tx = %tx.id, "Approved transfer request");
                Ok((approved, tx))
            }
            Ok(ApplyOutcome::DuplicateKey) => {
                drop(scope);
                // A concurrent approval won the key race; surface its result.
                let tx = self.engine.resolve_duplicate(&key).await?;
                let approved = db::get(self.pool(), request.id)
                    .await?
                    .ok_or(LedgerError::NotFound("transfer request"))?;
                Ok((approved, tx))
            }
            Err(e) => {
                drop(scope);
                self.engine.record_failure(&key, request.from_user).await;
                Err(e)
            }
        }
    }

    /// Recipient declines. No balance movement.
    pub async fn reject(&self, caller: &Caller, id: RequestId) -> Result<TransferRequest, LedgerError> {
        self.close(caller, id, RequestStatus::Rejected).await
    }

    /// Sender withdraws. No balance movement.
    pub async fn cancel(&self, caller: &Caller, id: RequestId) -> Result<TransferRequest, LedgerError> {
        self.close(caller, id, RequestStatus::Cancelled).await
    }

    async fn close(
        &self,
        caller: &Caller,
        id: RequestId,
        to: RequestStatus,
    ) -> Result<TransferRequest, LedgerError> {
        let request = db::get(self.pool(), id)
            .await?
            .ok_or(LedgerError::NotFound("transfer request"))?;

        let allowed_actor = match to {
            RequestStatus::Rejected => request.to_user,
            RequestStatus::Cancelled => request.from_user,
            _ => {
                return Err(LedgerError::InvalidArgument(format!(
                    "cannot close a transfer request as {to}"
                )));
            }
        };
        if caller.user_id != allowed_actor {
            return Err(LedgerError::Forbidden(format!(
                "wrong actor for {to} transition"
            )));
        }
        if request.status != RequestStatus::Pending {
            return Err(LedgerError::InvalidArgument(format!(
                "transfer request is {}, not pending",
                request.status
            )));
        }
        if request.is_expired(Utc::now()) {
            return Err(LedgerError::Expired("transfer request"));
        }

        let mut scope = self.pool().begin().await?;
        if !db::transition(&mut scope, request.id, to).await? {
            return Err(LedgerError::InvalidArgument(
                "transfer request is no longer pending".to_string(),
            ));
        }
        scope.commit().await?;

        let closed = db::get(self.pool(), request.id)
            .await?
            .ok_or(LedgerError::NotFound("transfer request"))?;
        tracing::info!(request = %closed, "Closed transfer request");
        Ok(closed)
    }
}

/// Periodically promote overdue pending rows to `expired`. Listings
/// filter on `expires_at` regardless, so this only keeps storage tidy.
pub async fn run_sweeper(pool: PgPool, interval: std::time::Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Transfer request sweeper stopping");
                break;
            }
            _ = ticker.tick() => {
                match db::sweep_expired(&pool).await {
                    Ok(0) => {}
                    Ok(count) => tracing::info!(count, "Promoted expired transfer requests"),
                    Err(e) => tracing::warn!(error = %e, "Expiry sweep failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_approval_key_is_namespaced() {
        let id = Uuid::new_v4();
        let key = approval_key(id);
        assert!(key.starts_with("transfer-request:"));
        assert!(key.ends_with(&id.to_string()));
    }
}
