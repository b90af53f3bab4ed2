//! Access-event poller
//!
//! Singleton background task. Each tick reads the wall-clock cursor from
//! `akerun_poll_state`, fetches everything between cursor and now, and
//! hands it to the daily-bonus engine. A cursor far behind wall-clock
//! switches the tick into recovery mode: consecutive one-hour windows,
//! each persisted before the next begins, so a crash or upstream failure
//! resumes exactly at the last completed boundary.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Row};
use tokio_util::sync::CancellationToken;

use super::PollerError;
use super::client::AccessEventSource;
use crate::config::PollerConfig;
use crate::daily_bonus::DailyBonusEngine;

/// Split `[cursor, now)` into consecutive windows of at most `window`
/// width. Each window's end is the next window's start: no duplication,
/// no gap.
pub fn split_windows(
    cursor: DateTime<Utc>,
    now: DateTime<Utc>,
    window: Duration,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let mut windows = Vec::new();
    if window <= Duration::zero() {
        return windows;
    }

    let mut start = cursor;
    while start < now {
        let end = (start + window).min(now);
        windows.push((start, end));
        start = end;
    }
    windows
}

pub struct AccessPoller {
    pool: PgPool,
    source: Arc<dyn AccessEventSource>,
    bonus: Arc<DailyBonusEngine>,
    config: PollerConfig,
}

impl AccessPoller {
    pub fn new(
        pool: PgPool,
        source: Arc<dyn AccessEventSource>,
        bonus: Arc<DailyBonusEngine>,
        config: PollerConfig,
    ) -> Self {
        Self {
            pool,
            source,
            bonus,
            config,
        }
    }

    /// The main poll loop. Runs until the token fires; an in-flight window
    /// is finished and persisted before exit.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            interval_secs = self.config.interval_secs,
            gap_threshold_secs = self.config.gap_threshold_secs,
            "Access poller starting"
        );

        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(self.config.interval_secs));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(&cancel).await {
                        tracing::error!(error = %e, "Poll tick failed - resuming from last persisted cursor");
                    }
                }
            }
        }

        tracing::info!("Access poller stopped");
    }

    /// One poll iteration.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<(), PollerError> {
        let now = Utc::now();
        let Some(cursor) = self.load_cursor().await? else {
            // First run: start tracking from now, no historical backfill.
            self.store_cursor(now).await?;
            tracing::info!(%now, "Initialized poll cursor");
            return Ok(());
        };

        if now <= cursor {
            return Ok(());
        }

        let lag = now - cursor;
        if lag <= Duration::seconds(self.config.gap_threshold_secs) {
            self.process_window(cursor, now).await?;
            return Ok(());
        }

        // Recovery mode: drain the backlog hour by hour. Cancellation is
        // only honored between windows; the current window always lands
        // with its cursor update.
        let windows = split_windows(cursor, now, Duration::seconds(self.config.window_secs));
        tracing::warn!(
            %cursor,
            lag_secs = lag.num_seconds(),
            windows = windows.len(),
            "Cursor is behind - entering recovery mode"
        );

        let count = windows.len();
        for (i, (start, end)) in windows.into_iter().enumerate() {
            self.process_window(start, end).await?;

            if cancel.is_cancelled() {
                tracing::info!(%end, "Recovery interrupted by shutdown - cursor persisted");
                return Ok(());
            }
            if i + 1 < count {
                tokio::time::sleep(std::time::Duration::from_millis(
                    self.config.inter_window_sleep_ms,
                ))
                .await;
            }
        }

        Ok(())
    }

    /// Fetch, hand off, persist. The cursor only advances after the whole
    /// window processed, so an upstream error repeats the window.
    async fn process_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(), PollerError> {
        let records = self.source.fetch_accesses(start, end).await?;

        if !records.is_empty() {
            // The window must land whole; shutdown is handled between
            // windows, so the batch runs with an inert token.
            let batch_cancel = CancellationToken::new();
            self.bonus.process_batch(&records, &batch_cancel).await?;
        }

        self.store_cursor(end).await?;
        tracing::debug!(%start, %end, records = records.len(), "Processed poll window");
        Ok(())
    }

    pub async fn load_cursor(&self) -> Result<Option<DateTime<Utc>>, PollerError> {
        let row = sqlx::query("SELECT last_polled_at FROM akerun_poll_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get("last_polled_at")))
    }

    pub async fn store_cursor(&self, at: DateTime<Utc>) -> Result<(), PollerError> {
        sqlx::query(
            r#"
            INSERT INTO akerun_poll_state (id, last_polled_at)
            VALUES (1, $1)
            ON CONFLICT (id) DO UPDATE
            SET last_polled_at = EXCLUDED.last_polled_at, updated_at = NOW()
            "#,
        )
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_split_windows_contiguous() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 2, 6, 0, 0).unwrap();
        let now = t0 + Duration::minutes(150);

        let windows = split_windows(t0, now, Duration::hours(1));
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0], (t0, t0 + Duration::hours(1)));
        assert_eq!(windows[1], (t0 + Duration::hours(1), t0 + Duration::hours(2)));
        assert_eq!(windows[2], (t0 + Duration::hours(2), now));

        // Each end is the next start.
        for pair in windows.windows(2) {
            assert_eq!(pair[0].1, pair[1].0);
        }
    }

    #[test]
    fn test_split_windows_single_partial() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 2, 6, 0, 0).unwrap();
        let now = t0 + Duration::minutes(5);

        let windows = split_windows(t0, now, Duration::hours(1));
        assert_eq!(windows, vec![(t0, now)]);
    }

    #[test]
    fn test_split_windows_exact_multiple() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 2, 6, 0, 0).unwrap();
        let now = t0 + Duration::hours(2);

        let windows = split_windows(t0, now, Duration::hours(1));
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[1].1, now);
    }

    #[test]
    fn test_split_windows_nothing_to_do() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 2, 6, 0, 0).unwrap();
        assert!(split_windows(t0, t0, Duration::hours(1)).is_empty());
        assert!(split_windows(t0, t0 - Duration::minutes(1), Duration::hours(1)).is_empty());
        assert!(split_windows(t0, t0 + Duration::hours(1), Duration::zero()).is_empty());
    }
}
