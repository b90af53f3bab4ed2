//! Daily bonus engine
//!
//! Door-access events award a once-per-user-per-day bonus. Dedup rides on
//! the `(user_id, bonus_date)` unique constraint plus the derived
//! idempotency key, so re-feeding a batch is a no-op. The optional lottery
//! draw lives in [`lottery`].

pub mod lottery;

use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use tokio_util::sync::CancellationToken;

use crate::core_types::{BonusId, Caller, Points, TierId, UserId};
use crate::account::UserRepository;
use crate::error::LedgerError;
use crate::ledger::engine::{ApplyOutcome, LedgerEngine, LedgerOp};

/// One external access record handed over by the poller.
#[derive(Debug, Clone)]
pub struct AccessRecord {
    pub external_id: String,
    pub user_name: String,
    pub accessed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DailyBonus {
    pub id: BonusId,
    pub user_id: UserId,
    pub bonus_date: NaiveDate,
    pub bonus_points: Points,
    pub external_access_id: String,
    pub external_user_name: String,
    pub is_viewed: bool,
    pub is_drawn: bool,
    pub lottery_tier_id: Option<TierId>,
    pub lottery_tier_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// What happened to a processed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub awarded: usize,
    pub already_awarded: usize,
    pub unknown_user: usize,
    pub ambiguous_user: usize,
    pub failed: usize,
}

/// Truncate an access timestamp to the calendar date of the configured
/// timezone.
pub fn bonus_date_for(accessed_at: DateTime<Utc>, offset_hours: i32) -> NaiveDate {
    let offset = FixedOffset::east_opt(offset_hours * 3600)
        .unwrap_or_else(|| FixedOffset::east_opt(0).unwrap());
    accessed_at.with_timezone(&offset).date_naive()
}

fn bonus_key(user_id: UserId, bonus_date: NaiveDate) -> String {
    format!("daily-bonus:{user_id}:{bonus_date}")
}

pub struct DailyBonusEngine {
    engine: Arc<LedgerEngine>,
    base_points: Points,
    timezone_offset_hours: i32,
}

impl DailyBonusEngine {
    pub fn new(engine: Arc<LedgerEngine>, base_points: Points, timezone_offset_hours: i32) -> Self {
        Self {
            engine,
            base_points,
            timezone_offset_hours,
        }
    }

    fn pool(&self) -> &PgPool {
        self.engine.pool()
    }

    /// Process a batch of access records. One bad record is logged and
    /// skipped; the rest of the batch still lands.
    pub async fn process_batch(
        &self,
        records: &[AccessRecord],
        cancel: &CancellationToken,
    ) -> Result<BatchSummary, LedgerError> {
        let mut summary = BatchSummary::default();

        for record in records {
            if cancel.is_cancelled() {
                return Err(LedgerError::Cancelled);
            }
            match self.process_record(record, cancel).await {
                Ok(RecordOutcome::Awarded) => summary.awarded += 1,
                Ok(RecordOutcome::AlreadyAwarded) => summary.already_awarded += 1,
                Ok(RecordOutcome::UnknownUser) => summary.unknown_user += 1,
                Ok(RecordOutcome::AmbiguousUser) => summary.ambiguous_user += 1,
                Err(LedgerError::Cancelled) => return Err(LedgerError::Cancelled),
                Err(e) => {
                    summary.failed += 1;
                    tracing::error!(
                        external_id = %record.external_id,
                        user_name = %record.user_name,
                        error = %e,
                        "Failed to process access record"
                    );
                }
            }
        }

        if summary.awarded > 0 || summary.failed > 0 {
            tracing::info!(?summary, "Processed access batch");
        }
        Ok(summary)
    }

    async fn process_record(
        &self,
        record: &AccessRecord,
        cancel: &CancellationToken,
    ) -> Result<RecordOutcome, LedgerError> {
        let matches = UserRepository::find_by_display_name(self.pool(), &record.user_name).await?;
        let user = match matches.as_slice() {
            [] => {
                tracing::info!(user_name = %record.user_name, "Access record for unknown user - skipping");
                return Ok(RecordOutcome::UnknownUser);
            }
            [user] => user,
            _ => {
                tracing::warn!(
                    user_name = %record.user_name,
                    matches = matches.len(),
                    "Access record matches multiple users - refusing to guess"
                );
                return Ok(RecordOutcome::AmbiguousUser);
            }
        };

        let bonus_date = bonus_date_for(record.accessed_at, self.timezone_offset_hours);
        let key = bonus_key(user.id, bonus_date);

        let mut scope = self.pool().begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO daily_bonuses
                (id, user_id, bonus_date, bonus_points, external_access_id, external_user_name)
            VALUES
                ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id, bonus_date) DO NOTHING
            "#,
        )
        .bind(BonusId::new_v4())
        .bind(user.id)
        .bind(bonus_date)
        .bind(self.base_points)
        .bind(&record.external_id)
        .bind(&record.user_name)
        .execute(&mut *scope)
        .await?;

        if inserted.rows_affected() == 0 {
            return Ok(RecordOutcome::AlreadyAwarded);
        }

        let op = LedgerOp::system_grant(
            user.id,
            self.base_points,
            key.clone(),
            format!("daily bonus for {bonus_date}"),
            Some(serde_json::json!({ "bonus_date": bonus_date })),
        );
        match self.engine.apply_in_scope(&mut scope, &op).await {
            Ok(ApplyOutcome::Applied(tx)) => {
                scope.commit().await?;
                tracing::info!(
                    user_id = %user.id,
                    %bonus_date,
                    tx = %tx.id,
                    points = self.base_points,
                    "Awarded daily bonus"
                );
                Ok(RecordOutcome::Awarded)
            }
            Ok(ApplyOutcome::DuplicateKey) => {
                // The grant landed before but the bonus row did not: only
                // possible if a concurrent worker holds the same record.
                drop(scope);
                Ok(RecordOutcome::AlreadyAwarded)
            }
            Err(e) => {
                drop(scope);
                self.engine.record_failure(&key, user.id).await;
                Err(e)
            }
        }
    }

    pub async fn get(&self, caller: &Caller, id: BonusId) -> Result<DailyBonus, LedgerError> {
        let bonus = get_bonus(self.pool(), id)
            .await?
            .ok_or(LedgerError::NotFound("daily bonus"))?;
        if bonus.user_id != caller.user_id && !caller.is_admin() {
            return Err(LedgerError::Forbidden(
                "not the owner of this bonus".to_string(),
            ));
        }
        Ok(bonus)
    }

    pub async fn list_for_user(
        &self,
        caller: &Caller,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<DailyBonus>, LedgerError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE user_id = $1 ORDER BY bonus_date DESC OFFSET $2 LIMIT $3"
        ))
        .bind(caller.user_id)
        .bind(offset)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(row_to_bonus).collect()
    }

    /// Mark the bonus as seen by its owner.
    pub async fn mark_viewed(&self, caller: &Caller, id: BonusId) -> Result<(), LedgerError> {
        let result = sqlx::query(
            "UPDATE daily_bonuses SET is_viewed = TRUE WHERE id = $1 AND user_id = $2",
        )
        .bind(id)
        .bind(caller.user_id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound("daily bonus"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum RecordOutcome {
    Awarded,
    AlreadyAwarded,
    UnknownUser,
    AmbiguousUser,
}

const SELECT_COLUMNS: &str = "SELECT id, user_id, bonus_date, bonus_points, external_access_id, \
     external_user_name, is_viewed, is_drawn, lottery_tier_id, lottery_tier_name, created_at \
     FROM daily_bonuses";

pub(crate) async fn get_bonus(pool: &PgPool, id: BonusId) -> Result<Option<DailyBonus>, LedgerError> {
    let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await?;

    row.map(|r| row_to_bonus(&r)).transpose()
}

pub(crate) fn row_to_bonus(row: &PgRow) -> Result<DailyBonus, LedgerError> {
    Ok(DailyBonus {
        id: row.get("id"),
        user_id: row.get("user_id"),
        bonus_date: row.get("bonus_date"),
        bonus_points: row.get("bonus_points"),
        external_access_id: row.get("external_access_id"),
        external_user_name: row.get("external_user_name"),
        is_viewed: row.get("is_viewed"),
        is_drawn: row.get("is_drawn"),
        lottery_tier_id: row.get("lottery_tier_id"),
        lottery_tier_name: row.get("lottery_tier_name"),
        created_at: row.get("created_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    #[test]
    fn test_bonus_date_truncates_in_configured_timezone() {
        // 2026-03-01T16:00Z is already 2026-03-02 in JST (+9).
        let accessed = Utc.with_ymd_and_hms(2026, 3, 1, 16, 0, 0).unwrap();
        assert_eq!(
            bonus_date_for(accessed, 9),
            NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
        );
        assert_eq!(
            bonus_date_for(accessed, 0),
            NaiveDate::from_ymd_opt(2026, 3, 1).unwrap()
        );
    }

    #[test]
    fn test_bonus_key_is_namespaced_per_user_and_date() {
        let user = Uuid::new_v4();
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let key = bonus_key(user, date);
        assert_eq!(key, format!("daily-bonus:{user}:2026-03-02"));

        let other_date = NaiveDate::from_ymd_opt(2026, 3, 3).unwrap();
        assert_ne!(key, bonus_key(user, other_date));
    }
}
