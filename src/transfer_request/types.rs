//! Transfer request types
//!
//! State machine for pending peer-to-peer transfer approvals. `pending`
//! is the only non-terminal state; each terminal state records who moved
//! the request there and when.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::core_types::{Points, RequestId, TransactionId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
    Expired,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Cancelled => "cancelled",
            RequestStatus::Expired => "expired",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RequestStatus::Pending),
            "approved" => Some(RequestStatus::Approved),
            "rejected" => Some(RequestStatus::Rejected),
            "cancelled" => Some(RequestStatus::Cancelled),
            "expired" => Some(RequestStatus::Expired),
            _ => None,
        }
    }

    /// Terminal states have no outgoing edges.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }

    /// Valid edges of the state machine.
    pub fn can_transition(&self, to: RequestStatus) -> bool {
        matches!(self, RequestStatus::Pending) && to.is_terminal()
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One peer-to-peer transfer request.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub id: RequestId,
    pub from_user: UserId,
    pub to_user: UserId,
    pub amount: Points,
    pub message: String,
    pub status: RequestStatus,
    pub idempotency_key: String,
    pub expires_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub transaction_id: Option<TransactionId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferRequest {
    /// A request past its expiry is treated as expired even while the
    /// stored status still says pending; the sweeper catches up later.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == RequestStatus::Pending && self.expires_at <= now
    }
}

impl fmt::Display for TransferRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TransferRequest[{}] {} -> {} amount={} status={}",
            self.id, self.from_user, self.to_user, self.amount, self.status
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_status_roundtrip() {
        for s in [
            RequestStatus::Pending,
            RequestStatus::Approved,
            RequestStatus::Rejected,
            RequestStatus::Cancelled,
            RequestStatus::Expired,
        ] {
            assert_eq!(RequestStatus::from_str_opt(s.as_str()), Some(s));
        }
        assert_eq!(RequestStatus::from_str_opt("open"), None);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let terminals = [
            RequestStatus::Approved,
            RequestStatus::Rejected,
            RequestStatus::Cancelled,
            RequestStatus::Expired,
        ];
        for from in terminals {
            assert!(from.is_terminal());
            for to in [RequestStatus::Pending, RequestStatus::Approved] {
                assert!(!from.can_transition(to));
            }
        }
        for to in terminals {
            assert!(RequestStatus::Pending.can_transition(to));
        }
        assert!(!RequestStatus::Pending.can_transition(RequestStatus::Pending));
    }

    #[test]
    fn test_is_expired() {
        let now = Utc::now();
        let mut request = TransferRequest {
            id: Uuid::new_v4(),
            from_user: Uuid::new_v4(),
            to_user: Uuid::new_v4(),
            amount: 100,
            message: String::new(),
            status: RequestStatus::Pending,
            idempotency_key: "k".to_string(),
            expires_at: now - chrono::Duration::minutes(1),
            approved_at: None,
            rejected_at: None,
            cancelled_at: None,
            transaction_id: None,
            created_at: now - chrono::Duration::hours(49),
            updated_at: now - chrono::Duration::hours(49),
        };
        assert!(request.is_expired(now));

        request.expires_at = now + chrono::Duration::hours(1);
        assert!(!request.is_expired(now));

        // A terminal request is never re-expired.
        request.expires_at = now - chrono::Duration::minutes(1);
        request.status = RequestStatus::Rejected;
        assert!(!request.is_expired(now));
    }
}
