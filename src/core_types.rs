//! Core types used throughout the system
//!
//! Fundamental identifiers and the caller identity carried by every
//! operation. Identifiers are opaque 128-bit UUIDs so nothing can be
//! inferred from ordering or density.

use std::fmt;

use uuid::Uuid;

/// User ID - primary key for user accounts.
pub type UserId = Uuid;

/// Transaction ID - identifies one immutable ledger entry.
pub type TransactionId = Uuid;

/// Transfer request ID.
pub type RequestId = Uuid;

/// QR code ID.
pub type QrId = Uuid;

/// Product exchange ID.
pub type ExchangeId = Uuid;

/// Daily bonus ID.
pub type BonusId = Uuid;

/// Lottery tier ID.
pub type TierId = Uuid;

/// Product ID.
pub type ProductId = Uuid;

/// Point amount. Balances are non-negative; transaction amounts are
/// strictly positive. Signed so debit arithmetic can detect underflow
/// before it happens.
pub type Points = i64;

/// User role stored on the account row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authenticated principal supplied by the boundary.
///
/// The core never parses requests or cookies; every operation receives
/// the caller explicitly. Role and active status are re-verified inside
/// the persistence scope for mutating admin operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: UserId,
    pub role: Role,
}

impl Caller {
    pub fn new(user_id: UserId, role: Role) -> Self {
        Self { user_id, role }
    }

    #[inline]
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_roundtrip() {
        assert_eq!(Role::from_str_opt("user"), Some(Role::User));
        assert_eq!(Role::from_str_opt("admin"), Some(Role::Admin));
        assert_eq!(Role::from_str_opt("root"), None);
        assert_eq!(Role::Admin.as_str(), "admin");
    }

    #[test]
    fn test_caller_is_admin() {
        let admin = Caller::new(Uuid::new_v4(), Role::Admin);
        let user = Caller::new(Uuid::new_v4(), Role::User);
        assert!(admin.is_admin());
        assert!(!user.is_admin());
    }
}
