//! Data models for account management

use chrono::{DateTime, Utc};

use crate::core_types::{Points, Role, UserId};

/// User account row.
///
/// `version` increments on every mutation, optimistic or pessimistic, so
/// profile CAS updates always observe balance movements that happened in
/// between.
#[derive(Debug, Clone)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    /// Opaque; hashing is the boundary's concern.
    pub password_hash: String,
    pub display_name: String,
    pub balance: Points,
    pub role: Role,
    pub version: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl User {
    /// Usable as a transfer party: active and not archived.
    pub fn is_live(&self) -> bool {
        self.is_active && self.deleted_at.is_none()
    }
}

/// Snapshot written to `archived_users` when an account is archived.
/// Rows are never updated afterwards; the password hash is deliberately
/// not carried over.
#[derive(Debug, Clone)]
pub struct ArchivedUser {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub display_name: String,
    pub balance: Points,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub archived_at: DateTime<Utc>,
}

impl ArchivedUser {
    /// Snapshot of a live row at archival time.
    pub fn snapshot(user: &User, archived_at: DateTime<Utc>) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            display_name: user.display_name.clone(),
            balance: user.balance,
            role: user.role,
            created_at: user.created_at,
            archived_at,
        }
    }
}

/// Fields for registration. The boundary validates formats and hashes the
/// password before this reaches the core.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub display_name: String,
    pub role: Role,
}

/// Mutable profile fields for the optimistic update path.
#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub role: Option<Role>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self.display_name.is_none() && self.email.is_none() && self.role.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sample_user() -> User {
        User {
            id: Uuid::new_v4(),
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            password_hash: "x".to_string(),
            display_name: "Alice".to_string(),
            balance: 0,
            role: Role::User,
            version: 1,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        }
    }

    #[test]
    fn test_is_live() {
        let mut user = sample_user();
        assert!(user.is_live());

        user.is_active = false;
        assert!(!user.is_live());

        user.is_active = true;
        user.deleted_at = Some(Utc::now());
        assert!(!user.is_live());
    }

    #[test]
    fn test_archived_snapshot_copies_the_row() {
        let user = sample_user();
        let archived_at = Utc::now();
        let archived = ArchivedUser::snapshot(&user, archived_at);

        assert_eq!(archived.id, user.id);
        assert_eq!(archived.username, user.username);
        assert_eq!(archived.email, user.email);
        assert_eq!(archived.display_name, user.display_name);
        assert_eq!(archived.balance, user.balance);
        assert_eq!(archived.role, user.role);
        assert_eq!(archived.created_at, user.created_at);
        assert_eq!(archived.archived_at, archived_at);
    }

    #[test]
    fn test_profile_update_is_empty() {
        assert!(ProfileUpdate::default().is_empty());
        let update = ProfileUpdate {
            display_name: Some("Bob".to_string()),
            ..Default::default()
        };
        assert!(!update.is_empty());
    }
}
