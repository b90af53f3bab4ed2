//! Database connection management and startup schema
//!
//! Schema creation is idempotent `CREATE TABLE IF NOT EXISTS` executed at
//! boot; a dedicated migration runner is a deployment concern outside this
//! crate.

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};

/// The persistence scope threaded through ledger operations. Everything
/// written inside one scope commits or rolls back together; row locks are
/// held until the scope ends.
pub type Scope = sqlx::Transaction<'static, sqlx::Postgres>;

/// PostgreSQL database connection pool
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        tracing::info!("PostgreSQL connection pool established");
        Ok(Self { pool })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Create all tables and indexes if they do not exist yet.
    pub async fn init_schema(&self) -> Result<(), sqlx::Error> {
        for ddl in SCHEMA {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        tracing::info!("Schema initialized ({} statements)", SCHEMA.len());
        Ok(())
    }
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id UUID PRIMARY KEY,
        username TEXT NOT NULL UNIQUE,
        email TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        display_name TEXT NOT NULL,
        balance BIGINT NOT NULL DEFAULT 0 CHECK (balance >= 0),
        role TEXT NOT NULL DEFAULT 'user',
        version INT NOT NULL DEFAULT 1,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        deleted_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS archived_users (
        id UUID PRIMARY KEY,
        username TEXT NOT NULL,
        email TEXT NOT NULL,
        display_name TEXT NOT NULL,
        balance BIGINT NOT NULL,
        role TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        archived_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS transactions (
        id UUID PRIMARY KEY,
        from_user UUID REFERENCES users(id),
        to_user UUID REFERENCES users(id),
        amount BIGINT NOT NULL CHECK (amount > 0),
        tx_type TEXT NOT NULL,
        status TEXT NOT NULL,
        idempotency_key TEXT UNIQUE,
        description TEXT NOT NULL DEFAULT '',
        metadata JSONB,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        completed_at TIMESTAMPTZ,
        CHECK (from_user IS NOT NULL OR to_user IS NOT NULL)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_transactions_created_at ON transactions (created_at)",
    "CREATE INDEX IF NOT EXISTS idx_transactions_from_user ON transactions (from_user)",
    "CREATE INDEX IF NOT EXISTS idx_transactions_to_user ON transactions (to_user)",
    r#"
    CREATE TABLE IF NOT EXISTS idempotency_keys (
        key TEXT PRIMARY KEY,
        user_id UUID NOT NULL,
        transaction_id UUID,
        status TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        expires_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_idempotency_keys_expires_at ON idempotency_keys (expires_at)",
    r#"
    CREATE TABLE IF NOT EXISTS transfer_requests (
        id UUID PRIMARY KEY,
        from_user UUID NOT NULL REFERENCES users(id),
        to_user UUID NOT NULL REFERENCES users(id),
        amount BIGINT NOT NULL CHECK (amount > 0),
        message TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL,
        idempotency_key TEXT NOT NULL UNIQUE,
        expires_at TIMESTAMPTZ NOT NULL,
        approved_at TIMESTAMPTZ,
        rejected_at TIMESTAMPTZ,
        cancelled_at TIMESTAMPTZ,
        transaction_id UUID,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_transfer_requests_to_user ON transfer_requests (to_user)",
    r#"
    CREATE TABLE IF NOT EXISTS qr_codes (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL REFERENCES users(id),
        code TEXT NOT NULL UNIQUE,
        amount BIGINT CHECK (amount IS NULL OR amount > 0),
        qr_type TEXT NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL,
        used_at TIMESTAMPTZ,
        used_by UUID,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_qr_codes_expires_at ON qr_codes (expires_at)",
    r#"
    CREATE TABLE IF NOT EXISTS products (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        price BIGINT NOT NULL CHECK (price > 0),
        stock INT NOT NULL DEFAULT 0,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS product_exchanges (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL REFERENCES users(id),
        product_id UUID NOT NULL REFERENCES products(id),
        quantity INT NOT NULL CHECK (quantity > 0),
        points_used BIGINT NOT NULL CHECK (points_used > 0),
        status TEXT NOT NULL,
        transaction_id UUID,
        notes TEXT NOT NULL DEFAULT '',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        completed_at TIMESTAMPTZ,
        delivered_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS daily_bonuses (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL REFERENCES users(id),
        bonus_date DATE NOT NULL,
        bonus_points BIGINT NOT NULL,
        external_access_id TEXT NOT NULL DEFAULT '',
        external_user_name TEXT NOT NULL DEFAULT '',
        is_viewed BOOLEAN NOT NULL DEFAULT FALSE,
        is_drawn BOOLEAN NOT NULL DEFAULT FALSE,
        lottery_tier_id UUID,
        lottery_tier_name TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (user_id, bonus_date)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS bonus_lottery_tiers (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        points BIGINT NOT NULL CHECK (points >= 0),
        probability DECIMAL(5,2) NOT NULL CHECK (probability >= 0),
        display_order INT NOT NULL,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS akerun_poll_state (
        id SMALLINT PRIMARY KEY CHECK (id = 1),
        last_polled_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
];
