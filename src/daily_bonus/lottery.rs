//! Bonus lottery
//!
//! Tier configuration and the once-per-bonus draw. Probabilities are
//! percentages with two decimals; whatever they leave short of 100 is the
//! no-win outcome. The draw and its grant share one scope, so a crash
//! cannot leave a drawn bonus without its points.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use sqlx::{PgPool, Row, postgres::PgRow};
use tokio_util::sync::CancellationToken;

use super::{DailyBonus, row_to_bonus};
use crate::core_types::{BonusId, Caller, Points, TierId};
use crate::error::LedgerError;
use crate::ledger::engine::{ApplyOutcome, LedgerEngine, LedgerOp};

/// Draws are uniform over [0, 100) percent in basis points.
pub const DRAW_SPACE_BP: u32 = 10_000;

#[derive(Debug, Clone)]
pub struct LotteryTier {
    pub id: TierId,
    pub name: String,
    pub points: Points,
    /// Percentage, two decimals (DECIMAL(5,2)).
    pub probability: Decimal,
    pub display_order: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Admin-supplied tier definition for wholesale replacement.
#[derive(Debug, Clone)]
pub struct TierSpec {
    pub name: String,
    pub points: Points,
    pub probability: Decimal,
    pub display_order: i32,
    pub is_active: bool,
}

/// Probability in basis points. Exact because the column is two-decimal.
fn probability_bp(probability: Decimal) -> u32 {
    (probability * Decimal::from(100)).to_u32().unwrap_or(0)
}

/// Walk tiers in display order accumulating probabilities; the first tier
/// whose cumulative bound exceeds `r_bp` wins. A draw past every tier is
/// the no-win outcome.
pub fn pick_tier(tiers: &[LotteryTier], r_bp: u32) -> Option<&LotteryTier> {
    let mut cumulative = 0u32;
    for tier in tiers {
        cumulative = cumulative.saturating_add(probability_bp(tier.probability));
        if r_bp < cumulative {
            return Some(tier);
        }
    }
    None
}

fn lottery_key(bonus_id: BonusId) -> String {
    format!("daily-lottery:{bonus_id}")
}

pub struct LotteryService {
    engine: Arc<LedgerEngine>,
    rng: Mutex<StdRng>,
}

impl LotteryService {
    pub fn new(engine: Arc<LedgerEngine>) -> Self {
        Self::with_rng(engine, StdRng::from_entropy())
    }

    /// Construct with a specific generator so draws are reproducible.
    pub fn with_rng(engine: Arc<LedgerEngine>, rng: StdRng) -> Self {
        Self {
            engine,
            rng: Mutex::new(rng),
        }
    }

    fn pool(&self) -> &PgPool {
        self.engine.pool()
    }

    /// Replace the tier table wholesale. Active probabilities must sum to
    /// at most 100; the remainder is the no-win outcome.
    pub async fn replace_tiers(
        &self,
        caller: &Caller,
        specs: Vec<TierSpec>,
    ) -> Result<Vec<LotteryTier>, LedgerError> {
        if !caller.is_admin() {
            return Err(LedgerError::Forbidden("admin role required".to_string()));
        }

        let mut total = Decimal::ZERO;
        for spec in &specs {
            if spec.probability < Decimal::ZERO {
                return Err(LedgerError::InvalidArgument(format!(
                    "tier {} has a negative probability",
                    spec.name
                )));
            }
            if spec.points < 0 {
                return Err(LedgerError::InvalidArgument(format!(
                    "tier {} has negative points",
                    spec.name
                )));
            }
            if spec.is_active {
                total += spec.probability;
            }
        }
        if total > Decimal::from(100) {
            return Err(LedgerError::InvalidArgument(format!(
                "active tier probabilities sum to {total}, above 100"
            )));
        }

        let mut scope = self.pool().begin().await?;
        sqlx::query("DELETE FROM bonus_lottery_tiers")
            .execute(&mut *scope)
            .await?;

        for spec in &specs {
            sqlx::query(
                r#"
                INSERT INTO bonus_lottery_tiers
                    (id, name, points, probability, display_order, is_active)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(TierId::new_v4())
            .bind(&spec.name)
            .bind(spec.points)
            .bind(spec.probability)
            .bind(spec.display_order)
            .bind(spec.is_active)
            .execute(&mut *scope)
            .await?;
        }
        scope.commit().await?;

        tracing::info!(tiers = specs.len(), "Replaced lottery tier configuration");
        self.list(false).await
    }

    /// Tiers in display order; `active_only` restricts to drawable ones.
    pub async fn list(&self, active_only: bool) -> Result<Vec<LotteryTier>, LedgerError> {
        let sql = if active_only {
            "SELECT id, name, points, probability, display_order, is_active, created_at, updated_at \
             FROM bonus_lottery_tiers WHERE is_active ORDER BY display_order"
        } else {
            "SELECT id, name, points, probability, display_order, is_active, created_at, updated_at \
             FROM bonus_lottery_tiers ORDER BY display_order"
        };
        let rows = sqlx::query(sql).fetch_all(self.pool()).await?;
        Ok(rows.iter().map(row_to_tier).collect())
    }

    /// Draw the lottery for one bonus. At most once per bonus; the winning
    /// tier tops the base grant up to its points in the same scope that
    /// marks the bonus drawn.
    pub async fn draw(
        &self,
        caller: &Caller,
        bonus_id: BonusId,
        cancel: &CancellationToken,
    ) -> Result<(DailyBonus, Option<LotteryTier>), LedgerError> {
        if cancel.is_cancelled() {
            return Err(LedgerError::Cancelled);
        }

        let mut scope = self.pool().begin().await?;
        let row = sqlx::query(
            r#"
            SELECT id, user_id, bonus_date, bonus_points, external_access_id,
                   external_user_name, is_viewed, is_drawn, lottery_tier_id,
                   lottery_tier_name, created_at
            FROM daily_bonuses
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(bonus_id)
        .fetch_optional(&mut *scope)
        .await?
        .ok_or(LedgerError::NotFound("daily bonus"))?;
        let bonus = row_to_bonus(&row)?;

        if bonus.user_id != caller.user_id {
            return Err(LedgerError::Forbidden(
                "not the owner of this bonus".to_string(),
            ));
        }
        if bonus.is_drawn {
            return Err(LedgerError::InvalidArgument(
                "lottery already drawn for this bonus".to_string(),
            ));
        }

        let tier_rows = sqlx::query(
            "SELECT id, name, points, probability, display_order, is_active, created_at, updated_at \
             FROM bonus_lottery_tiers WHERE is_active ORDER BY display_order",
        )
        .fetch_all(&mut *scope)
        .await?;
        let tiers: Vec<LotteryTier> = tier_rows.iter().map(row_to_tier).collect();

        let r_bp = {
            let mut rng = self.rng.lock().unwrap();
            rng.gen_range(0..DRAW_SPACE_BP)
        };
        let winner = pick_tier(&tiers, r_bp).cloned();

        let base = bonus.bonus_points;
        let delta = winner
            .as_ref()
            .map(|tier| (tier.points - base).max(0))
            .unwrap_or(0);
        let total = base + delta;

        if delta > 0 {
            let key = lottery_key(bonus.id);
            let op = LedgerOp::system_grant(
                bonus.user_id,
                delta,
                key.clone(),
                format!("lottery bonus for {}", bonus.bonus_date),
                Some(serde_json::json!({ "daily_bonus_id": bonus.id })),
            );
            match self.engine.apply_in_scope(&mut scope, &op).await {
                Ok(ApplyOutcome::Applied(_)) => {}
                Ok(ApplyOutcome::DuplicateKey) => {
                    drop(scope);
                    return Err(LedgerError::Conflict(
                        "lottery draw already in progress".to_string(),
                    ));
                }
                Err(e) => {
                    drop(scope);
                    self.engine.record_failure(&key, bonus.user_id).await;
                    return Err(e);
                }
            }
        }

        let updated = sqlx::query(
            r#"
            UPDATE daily_bonuses
            SET is_drawn = TRUE, lottery_tier_id = $2, lottery_tier_name = $3, bonus_points = $4
            WHERE id = $1 AND is_drawn = FALSE
            "#,
        )
        .bind(bonus.id)
        .bind(winner.as_ref().map(|t| t.id))
        .bind(winner.as_ref().map(|t| t.name.clone()))
        .bind(total)
        .execute(&mut *scope)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(LedgerError::Conflict(
                "bonus was drawn concurrently".to_string(),
            ));
        }

        if cancel.is_cancelled() {
            return Err(LedgerError::Cancelled);
        }
        scope.commit().await?;

        let drawn = super::get_bonus(self.pool(), bonus.id)
            .await?
            .ok_or(LedgerError::NotFound("daily bonus"))?;
        tracing::info!(
            bonus = %drawn.id,
            tier = winner.as_ref().map(|t| t.name.as_str()).unwrap_or("none"),
            total,
            "Lottery drawn"
        );
        Ok((drawn, winner))
    }
}

fn row_to_tier(row: &PgRow) -> LotteryTier {
    LotteryTier {
        id: row.get("id"),
        name: row.get("name"),
        points: row.get("points"),
        probability: row.get("probability"),
        display_order: row.get("display_order"),
        is_active: row.get("is_active"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use uuid::Uuid;

    fn tier(name: &str, points: Points, probability: &str, order: i32) -> LotteryTier {
        LotteryTier {
            id: Uuid::new_v4(),
            name: name.to_string(),
            points,
            probability: probability.parse().unwrap(),
            display_order: order,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_pick_tier_walks_cumulative_bounds() {
        let tiers = vec![
            tier("gold", 500, "10.00", 1),
            tier("silver", 300, "20.00", 2),
            tier("bronze", 150, "30.00", 3),
        ];

        // Bounds in basis points: gold [0,1000), silver [1000,3000),
        // bronze [3000,6000), none [6000,10000).
        assert_eq!(pick_tier(&tiers, 0).unwrap().name, "gold");
        assert_eq!(pick_tier(&tiers, 999).unwrap().name, "gold");
        assert_eq!(pick_tier(&tiers, 1000).unwrap().name, "silver");
        assert_eq!(pick_tier(&tiers, 2999).unwrap().name, "silver");
        assert_eq!(pick_tier(&tiers, 3000).unwrap().name, "bronze");
        assert_eq!(pick_tier(&tiers, 5999).unwrap().name, "bronze");
        assert!(pick_tier(&tiers, 6000).is_none());
        assert!(pick_tier(&tiers, 9999).is_none());
    }

    #[test]
    fn test_pick_tier_fractional_probability() {
        let tiers = vec![tier("rare", 1000, "0.25", 1)];
        assert!(pick_tier(&tiers, 0).is_some());
        assert!(pick_tier(&tiers, 24).is_some());
        assert!(pick_tier(&tiers, 25).is_none());
    }

    #[test]
    fn test_pick_tier_empty_config_never_wins() {
        assert!(pick_tier(&[], 0).is_none());
    }

    #[test]
    fn test_draw_frequencies_converge() {
        let tiers = vec![
            tier("gold", 500, "10.00", 1),
            tier("silver", 300, "20.00", 2),
            tier("bronze", 150, "30.00", 3),
        ];

        let mut rng = StdRng::seed_from_u64(0x1ed6e4);
        let draws = 100_000usize;
        let mut counts = [0usize; 4]; // gold, silver, bronze, none
        for _ in 0..draws {
            let r = rng.gen_range(0..DRAW_SPACE_BP);
            match pick_tier(&tiers, r) {
                Some(t) if t.name == "gold" => counts[0] += 1,
                Some(t) if t.name == "silver" => counts[1] += 1,
                Some(_) => counts[2] += 1,
                None => counts[3] += 1,
            }
        }

        let expected = [0.10, 0.20, 0.30, 0.40];
        for (count, expected) in counts.iter().zip(expected) {
            let observed = *count as f64 / draws as f64;
            assert!(
                (observed - expected).abs() < 0.01,
                "observed {observed}, expected {expected}"
            );
        }
    }
}
