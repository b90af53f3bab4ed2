//! Friendship capability gate
//!
//! Transfers require the parties to be in an accepted relation. The social
//! graph itself lives outside this crate; the engine only consults this
//! predicate.

use async_trait::async_trait;

use crate::core_types::UserId;
use crate::error::LedgerError;

#[async_trait]
pub trait FriendshipGate: Send + Sync {
    async fn are_friends(&self, a: UserId, b: UserId) -> Result<bool, LedgerError>;
}

/// Permits every pair. Deployments without a social graph run with this.
pub struct AllowAll;

#[async_trait]
impl FriendshipGate for AllowAll {
    async fn are_friends(&self, _a: UserId, _b: UserId) -> Result<bool, LedgerError> {
        Ok(true)
    }
}

/// Refuses every pair. Useful for exercising the gate seam in tests.
pub struct DenyAll;

#[async_trait]
impl FriendshipGate for DenyAll {
    async fn are_friends(&self, _a: UserId, _b: UserId) -> Result<bool, LedgerError> {
        Ok(false)
    }
}
