//! Repository layer for user rows
//!
//! All reads and the optimistic CAS profile update. Balance mutation is
//! deliberately absent here; only the ledger's row-locked path writes
//! `balance`.

use chrono::Utc;
use sqlx::{PgPool, Row, postgres::PgRow};

use super::models::{ArchivedUser, NewUser, ProfileUpdate, User};
use crate::core_types::{Role, UserId};
use crate::error::{LedgerError, is_unique_violation};

pub struct UserRepository;

impl UserRepository {
    /// Insert a new user with a zero balance.
    pub async fn create(pool: &PgPool, new_user: NewUser) -> Result<User, LedgerError> {
        let id = UserId::new_v4();
        let row = sqlx::query(
            r#"
            INSERT INTO users (id, username, email, password_hash, display_name, role)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, username, email, password_hash, display_name, balance, role,
                      version, is_active, created_at, updated_at, deleted_at
            "#,
        )
        .bind(id)
        .bind(&new_user.username)
        .bind(&new_user.email)
        .bind(&new_user.password_hash)
        .bind(&new_user.display_name)
        .bind(new_user.role.as_str())
        .fetch_one(pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                LedgerError::Conflict("username or email already registered".to_string())
            } else {
                LedgerError::Database(e)
            }
        })?;

        row_to_user(&row)
    }

    pub async fn get_by_id(pool: &PgPool, user_id: UserId) -> Result<Option<User>, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT id, username, email, password_hash, display_name, balance, role,
                   version, is_active, created_at, updated_at, deleted_at
            FROM users
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(user_id)
        .fetch_optional(pool)
        .await?;

        row.map(|r| row_to_user(&r)).transpose()
    }

    pub async fn get_by_username(
        pool: &PgPool,
        username: &str,
    ) -> Result<Option<User>, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT id, username, email, password_hash, display_name, balance, role,
                   version, is_active, created_at, updated_at, deleted_at
            FROM users
            WHERE username = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(username)
        .fetch_optional(pool)
        .await?;

        row.map(|r| row_to_user(&r)).transpose()
    }

    pub async fn get_by_email(pool: &PgPool, email: &str) -> Result<Option<User>, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT id, username, email, password_hash, display_name, balance, role,
                   version, is_active, created_at, updated_at, deleted_at
            FROM users
            WHERE email = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(email)
        .fetch_optional(pool)
        .await?;

        row.map(|r| row_to_user(&r)).transpose()
    }

    /// All live users whose display name matches exactly. The daily-bonus
    /// engine uses this to resolve external access records; more than one
    /// match means the record is ambiguous and must not be guessed at.
    pub async fn find_by_display_name(
        pool: &PgPool,
        display_name: &str,
    ) -> Result<Vec<User>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT id, username, email, password_hash, display_name, balance, role,
                   version, is_active, created_at, updated_at, deleted_at
            FROM users
            WHERE display_name = $1 AND is_active AND deleted_at IS NULL
            "#,
        )
        .bind(display_name)
        .fetch_all(pool)
        .await?;

        rows.iter().map(row_to_user).collect()
    }

    /// Optimistic CAS update of non-balance fields, matching on
    /// `(id, version)`. Returns whether the update applied; a false return
    /// means the row moved underneath the caller, who should re-read and
    /// retry with the fresh version.
    pub async fn update_profile(
        pool: &PgPool,
        user_id: UserId,
        expected_version: i32,
        update: &ProfileUpdate,
    ) -> Result<bool, LedgerError> {
        if update.is_empty() {
            return Err(LedgerError::InvalidArgument(
                "profile update contains no fields".to_string(),
            ));
        }

        let result = sqlx::query(
            r#"
            UPDATE users
            SET display_name = COALESCE($3, display_name),
                email = COALESCE($4, email),
                role = COALESCE($5, role),
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND version = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(user_id)
        .bind(expected_version)
        .bind(update.display_name.as_deref())
        .bind(update.email.as_deref())
        .bind(update.role.map(|r| r.as_str()))
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_active(
        pool: &PgPool,
        user_id: UserId,
        active: bool,
    ) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET is_active = $2, version = version + 1, updated_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(user_id)
        .bind(active)
        .execute(pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound("user"));
        }
        Ok(())
    }

    /// Archive an account: snapshot the row into `archived_users`, then
    /// soft-delete. One scope, so a concurrent balance movement either
    /// lands before the snapshot or is blocked by the row lock.
    pub async fn archive(pool: &PgPool, user_id: UserId) -> Result<ArchivedUser, LedgerError> {
        let mut scope = pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT id, username, email, password_hash, display_name, balance, role,
                   version, is_active, created_at, updated_at, deleted_at
            FROM users
            WHERE id = $1 AND deleted_at IS NULL
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut *scope)
        .await?
        .ok_or(LedgerError::NotFound("user"))?;
        let user = row_to_user(&row)?;

        let archived = ArchivedUser::snapshot(&user, Utc::now());
        sqlx::query(
            r#"
            INSERT INTO archived_users
                (id, username, email, display_name, balance, role, created_at, archived_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(archived.id)
        .bind(&archived.username)
        .bind(&archived.email)
        .bind(&archived.display_name)
        .bind(archived.balance)
        .bind(archived.role.as_str())
        .bind(archived.created_at)
        .bind(archived.archived_at)
        .execute(&mut *scope)
        .await?;

        sqlx::query(
            r#"
            UPDATE users
            SET deleted_at = NOW(), is_active = FALSE, version = version + 1, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .execute(&mut *scope)
        .await?;

        scope.commit().await?;
        tracing::info!(user_id = %user_id, "Archived user account");
        Ok(archived)
    }
}

fn row_to_user(row: &PgRow) -> Result<User, LedgerError> {
    let role_str: String = row.get("role");
    let role = Role::from_str_opt(&role_str)
        .ok_or_else(|| LedgerError::Internal(format!("invalid role in users row: {role_str}")))?;

    Ok(User {
        id: row.get("id"),
        username: row.get("username"),
        email: row.get("email"),
        password_hash: row.get("password_hash"),
        display_name: row.get("display_name"),
        balance: row.get("balance"),
        role,
        version: row.get("version"),
        is_active: row.get("is_active"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        deleted_at: row.get("deleted_at"),
    })
}
