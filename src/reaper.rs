//! Stale-processing reaper.
//!
//! A worker that dies mid-event leaves its row in `processing` forever.
//! The reaper resets rows whose `processing_started_at` is older than the
//! stale threshold back to `pending`, counting the reset as a retry. Live
//! workers renew their claim while working (see [`crate::consumer`]), so
//! only abandoned rows age past it.

use anyhow::Result;
use sqlx::SqlitePool;
use std::time::Duration;
use tokio::sync::watch;

use crate::db::now_millis;

/// Reset processing rows older than `stale_after`. The claim token is
/// cleared, so a late ack from the presumed-dead worker is ignored.
///
/// A reset uses up one retry. Rows that already used all of theirs become
/// failed instead of pending, so an event that kills its worker every time
/// is eventually parked.
pub async fn reap_stale(pool: &SqlitePool, stale_after: Duration) -> Result<u64> {
    let now = now_millis();
    let cutoff = now - stale_after.as_millis() as i64;
    let statuses: Vec<String> = sqlx::query_scalar(
        r#"
        UPDATE connector_events_queue
        SET status = CASE WHEN retry_count < max_retries THEN 'pending' ELSE 'failed' END,
            processed_at = CASE WHEN retry_count < max_retries THEN NULL ELSE ? END,
            retry_count = retry_count + 1,
            error_message = 'processing lease expired',
            processing_started_at = NULL,
            claim_token = NULL
        WHERE status = 'processing' AND processing_started_at < ?
        RETURNING status
        "#,
    )
    .bind(now)
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    let reset = statuses.len() as u64;
    if reset > 0 {
        let parked = statuses.iter().filter(|s| s.as_str() == "failed").count();
        tracing::warn!(
            reset,
            parked,
            stale_after_secs = stale_after.as_secs(),
            "reset stale processing rows"
        );
    }
    Ok(reset)
}

/// Run [`reap_stale`] every `interval` until `shutdown` flips to true.
pub async fn run_reaper(
    pool: SqlitePool,
    interval: Duration,
    stale_after: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = reap_stale(&pool, stale_after).await {
                    tracing::error!(error = %e, "reaper pass failed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!("reaper stopped");
}
