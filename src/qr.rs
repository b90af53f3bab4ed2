//! QR-mediated transfers
//!
//! Single-use, time-bounded tokens. A receive-type token pulls points from
//! the scanner to the owner; a send-type token pushes points from the
//! owner to the scanner. Consumption stamps `used_at`/`used_by` in the
//! same scope as the ledger transfer.
//!
//! Wire format: `"<type>:<code>"` or `"<type>:<code>:<amount>"`.

use std::fmt;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use sqlx::{PgPool, Row, postgres::PgRow};
use tokio_util::sync::CancellationToken;

use crate::core_types::{Caller, Points, QrId, UserId};
use crate::db::Scope;
use crate::error::{LedgerError, is_unique_violation};
use crate::ledger::engine::{ApplyOutcome, LedgerEngine, LedgerOp};
use crate::ledger::transactions::Transaction;

/// Random bytes per code before encoding.
const CODE_BYTES: usize = 24;
/// Attempts before giving up on a unique code.
const MAX_CODE_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QrType {
    /// Scanner pays the owner.
    Receive,
    /// Owner pays the scanner.
    Send,
}

impl QrType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QrType::Receive => "receive",
            QrType::Send => "send",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "receive" => Some(QrType::Receive),
            "send" => Some(QrType::Send),
            _ => None,
        }
    }
}

impl fmt::Display for QrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct QrCode {
    pub id: QrId,
    pub user_id: UserId,
    pub code: String,
    pub amount: Option<Points>,
    pub qr_type: QrType,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub used_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
}

impl QrCode {
    /// The wire token a client renders as a QR image.
    pub fn token(&self) -> String {
        encode_token(self.qr_type, &self.code, self.amount)
    }
}

/// Parsed wire token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedToken {
    pub qr_type: QrType,
    pub code: String,
    pub amount: Option<Points>,
}

pub fn encode_token(qr_type: QrType, code: &str, amount: Option<Points>) -> String {
    match amount {
        Some(amount) => format!("{}:{}:{}", qr_type.as_str(), code, amount),
        None => format!("{}:{}", qr_type.as_str(), code),
    }
}

pub fn parse_token(token: &str) -> Result<ParsedToken, LedgerError> {
    let malformed = || LedgerError::InvalidArgument(format!("malformed qr token: {token}"));

    let mut parts = token.split(':');
    let type_part = parts.next().ok_or_else(malformed)?;
    let code = parts.next().ok_or_else(malformed)?;
    let amount_part = parts.next();
    if parts.next().is_some() {
        return Err(malformed());
    }

    let qr_type = QrType::from_str_opt(type_part).ok_or_else(malformed)?;
    if code.is_empty() {
        return Err(malformed());
    }

    let amount = match amount_part {
        Some(raw) => {
            let amount: Points = raw.parse().map_err(|_| malformed())?;
            if amount <= 0 {
                return Err(malformed());
            }
            Some(amount)
        }
        None => None,
    };

    Ok(ParsedToken {
        qr_type,
        code: code.to_string(),
        amount,
    })
}

/// 24 uniformly random bytes from the OS generator, URL-safe encoded.
fn generate_code() -> String {
    let mut bytes = [0u8; CODE_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub struct QrService {
    engine: Arc<LedgerEngine>,
    ttl: Duration,
}

impl QrService {
    pub fn new(engine: Arc<LedgerEngine>, ttl_secs: i64) -> Self {
        Self {
            engine,
            ttl: Duration::seconds(ttl_secs),
        }
    }

    fn pool(&self) -> &PgPool {
        self.engine.pool()
    }

    /// Mint a single-use code owned by the caller. The code column is
    /// unique; a collision gets a fresh code and another attempt.
    pub async fn create(
        &self,
        caller: &Caller,
        qr_type: QrType,
        amount: Option<Points>,
    ) -> Result<QrCode, LedgerError> {
        if let Some(amount) = amount
            && amount <= 0
        {
            return Err(LedgerError::InvalidArgument(
                "qr amount must be positive".to_string(),
            ));
        }

        let expires_at = Utc::now() + self.ttl;
        for _ in 0..MAX_CODE_ATTEMPTS {
            let id = QrId::new_v4();
            let code = generate_code();
            let result = sqlx::query(
                r#"
                INSERT INTO qr_codes (id, user_id, code, amount, qr_type, expires_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING created_at
                "#,
            )
            .bind(id)
            .bind(caller.user_id)
            .bind(&code)
            .bind(amount)
            .bind(qr_type.as_str())
            .bind(expires_at)
            .fetch_one(self.pool())
            .await;

            match result {
                Ok(row) => {
                    tracing::info!(qr = %id, qr_type = %qr_type, "Created qr code");
                    return Ok(QrCode {
                        id,
                        user_id: caller.user_id,
                        code,
                        amount,
                        qr_type,
                        expires_at,
                        used_at: None,
                        used_by: None,
                        created_at: row.get("created_at"),
                    });
                }
                Err(e) if is_unique_violation(&e) => continue,
                Err(e) => return Err(LedgerError::Database(e)),
            }
        }

        Err(LedgerError::Internal(
            "could not mint a unique qr code".to_string(),
        ))
    }

    /// Consume a token: guards, amount resolution, ledger transfer, and
    /// the used-stamp all inside one scope.
    pub async fn scan(
        &self,
        caller: &Caller,
        token: &str,
        supplied_amount: Option<Points>,
        idempotency_key: String,
        cancel: &CancellationToken,
    ) -> Result<(Transaction, QrCode), LedgerError> {
        let parsed = parse_token(token)?;

        if let Some(tx) = self.engine.check_existing(&idempotency_key).await? {
            let qr = get_by_code(self.pool(), &parsed.code)
                .await?
                .ok_or(LedgerError::NotFound("qr code"))?;
            return Ok((tx, qr));
        }

        if cancel.is_cancelled() {
            return Err(LedgerError::Cancelled);
        }

        let mut scope = self.pool().begin().await?;
        let qr = lock_by_code(&mut scope, &parsed.code)
            .await?
            .ok_or(LedgerError::NotFound("qr code"))?;

        let now = Utc::now();
        if qr.expires_at <= now {
            return Err(LedgerError::Expired("qr code"));
        }
        if qr.used_at.is_some() {
            return Err(LedgerError::Conflict("qr code already used".to_string()));
        }
        if qr.user_id == caller.user_id {
            return Err(LedgerError::InvalidArgument(
                "cannot scan your own qr code".to_string(),
            ));
        }

        // The stored amount is authoritative; the token copy is display
        // only. Open-amount codes require the scanner to supply one.
        let amount = match qr.amount.or(supplied_amount) {
            Some(amount) if amount > 0 => amount,
            Some(_) => {
                return Err(LedgerError::InvalidArgument(
                    "amount must be positive".to_string(),
                ));
            }
            None => {
                return Err(LedgerError::InvalidArgument(
                    "this qr code requires an amount".to_string(),
                ));
            }
        };

        let (from, to) = match qr.qr_type {
            QrType::Receive => (caller.user_id, qr.user_id),
            QrType::Send => (qr.user_id, caller.user_id),
        };
        let op = LedgerOp::transfer(
            from,
            to,
            amount,
            idempotency_key.clone(),
            format!("qr {} transfer", qr.qr_type),
            Some(serde_json::json!({ "qr_code_id": qr.id })),
        );

        match self.engine.apply_in_scope(&mut scope, &op).await {
            Ok(ApplyOutcome::Applied(tx)) => {
                let stamped = sqlx::query(
                    r#"
                    UPDATE qr_codes
                    SET used_at = NOW(), used_by = $2
                    WHERE id = $1 AND used_at IS NULL
                    "#,
                )
                .bind(qr.id)
                .bind(caller.user_id)
                .execute(&mut *scope)
                .await?;
                if stamped.rows_affected() == 0 {
                    return Err(LedgerError::Conflict("qr code already used".to_string()));
                }

                if cancel.is_cancelled() {
                    drop(scope);
                    self.engine.record_failure(&idempotency_key, op.key_owner()).await;
                    return Err(LedgerError::Cancelled);
                }
                scope.commit().await?;

                let used = get_by_code(self.pool(), &parsed.code)
                    .await?
                    .ok_or(LedgerError::NotFound("qr code"))?;
                tracing::info!(qr = %used.id, tx = %tx.id, scanner = %caller.user_id, "Consumed qr code");
                Ok((tx, used))
            }
            Ok(ApplyOutcome::DuplicateKey) => {
                drop(scope);
                let tx = self.engine.resolve_duplicate(&idempotency_key).await?;
                let qr = get_by_code(self.pool(), &parsed.code)
                    .await?
                    .ok_or(LedgerError::NotFound("qr code"))?;
                Ok((tx, qr))
            }
            Err(e) => {
                drop(scope);
                self.engine.record_failure(&idempotency_key, op.key_owner()).await;
                Err(e)
            }
        }
    }
}

async fn get_by_code(pool: &PgPool, code: &str) -> Result<Option<QrCode>, LedgerError> {
    let row = sqlx::query(
        r#"
        SELECT id, user_id, code, amount, qr_type, expires_at, used_at, used_by, created_at
        FROM qr_codes
        WHERE code = $1
        "#,
    )
    .bind(code)
    .fetch_optional(pool)
    .await?;

    row.map(|r| row_to_qr(&r)).transpose()
}

async fn lock_by_code(scope: &mut Scope, code: &str) -> Result<Option<QrCode>, LedgerError> {
    let row = sqlx::query(
        r#"
        SELECT id, user_id, code, amount, qr_type, expires_at, used_at, used_by, created_at
        FROM qr_codes
        WHERE code = $1
        FOR UPDATE
        "#,
    )
    .bind(code)
    .fetch_optional(&mut **scope)
    .await?;

    row.map(|r| row_to_qr(&r)).transpose()
}

fn row_to_qr(row: &PgRow) -> Result<QrCode, LedgerError> {
    let type_str: String = row.get("qr_type");
    let qr_type = QrType::from_str_opt(&type_str)
        .ok_or_else(|| LedgerError::Internal(format!("invalid qr_type in row: {type_str}")))?;

    Ok(QrCode {
        id: row.get("id"),
        user_id: row.get("user_id"),
        code: row.get("code"),
        amount: row.get("amount"),
        qr_type,
        expires_at: row.get("expires_at"),
        used_at: row.get("used_at"),
        used_by: row.get("used_by"),
        created_at: row.get("created_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_receive_without_amount() {
        let parsed = parse_token("receive:abc123").unwrap();
        assert_eq!(parsed.qr_type, QrType::Receive);
        assert_eq!(parsed.code, "abc123");
        assert_eq!(parsed.amount, None);
    }

    #[test]
    fn test_parse_send_with_amount() {
        let parsed = parse_token("send:xyz:50").unwrap();
        assert_eq!(parsed.qr_type, QrType::Send);
        assert_eq!(parsed.code, "xyz");
        assert_eq!(parsed.amount, Some(50));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for token in [
            "",
            "receive",
            "push:abc",
            "receive:",
            "receive:abc:0",
            "receive:abc:-5",
            "receive:abc:ten",
            "receive:abc:10:extra",
        ] {
            assert!(
                matches!(parse_token(token), Err(LedgerError::InvalidArgument(_))),
                "token {token:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_token_roundtrip() {
        for (qr_type, amount) in [
            (QrType::Receive, None),
            (QrType::Receive, Some(50)),
            (QrType::Send, None),
            (QrType::Send, Some(1)),
        ] {
            let token = encode_token(qr_type, "c0de", amount);
            let parsed = parse_token(&token).unwrap();
            assert_eq!(parsed.qr_type, qr_type);
            assert_eq!(parsed.code, "c0de");
            assert_eq!(parsed.amount, amount);
        }
    }

    #[test]
    fn test_generated_codes_are_unique_and_urlsafe() {
        let a = generate_code();
        let b = generate_code();
        assert_ne!(a, b);
        // 24 bytes -> 32 base64 chars, no padding.
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
