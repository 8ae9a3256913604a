//! Two-phase garbage collection for content blobs.
//!
//! ```text
//!  mark:    unreferenced blob, orphaned_at NULL  →  orphaned_at = now
//!  unmark:  referenced blob,   orphaned_at set   →  orphaned_at = NULL
//!  sweep:   orphaned_at < now - grace AND still unreferenced  →  delete
//! ```
//!
//! A blob is referenced when a document points at it or an in-flight queue
//! row does (pending, processing, or failed with retries left). The sweep's
//! DELETE repeats the reference check in the same statement, so a reference
//! attached after marking always wins. The grace period covers the window
//! between `save()` and the enqueue of the event that references the blob.

use anyhow::Result;
use serde::Serialize;
use sqlx::Row;
use std::time::Duration;
use tokio::sync::watch;

use crate::config::GcConfig;
use crate::content::{ContentStore, BACKEND_INLINE};
use crate::db::now_millis;

/// SQL predicate: the blob aliased `b` has no live reference.
const UNREFERENCED: &str = r#"
    NOT EXISTS (SELECT 1 FROM documents d WHERE d.content_id = b.id)
    AND NOT EXISTS (
        SELECT 1 FROM connector_events_queue q
        WHERE q.content_id = b.id
          AND (q.status IN ('pending', 'processing')
               OR (q.status = 'failed' AND q.retry_count <= q.max_retries))
    )
"#;

#[derive(Debug, Clone)]
pub struct GcOptions {
    pub grace_period: Duration,
    pub batch_size: i64,
    pub dry_run: bool,
}

impl GcOptions {
    pub fn from_config(config: &GcConfig, dry_run: bool) -> Self {
        Self {
            grace_period: Duration::from_secs(config.grace_period_secs),
            batch_size: config.batch_size,
            dry_run,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct GcReport {
    pub orphans_marked: u64,
    pub orphans_unmarked: u64,
    pub blobs_deleted: u64,
    pub bytes_reclaimed: u64,
    pub errors: Vec<String>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct OrphanStats {
    pub total_blobs: i64,
    pub total_bytes: i64,
    /// Orphaned, still inside the grace period.
    pub pending_orphans: i64,
    /// Orphaned and past the grace period.
    pub expired_orphans: i64,
    pub orphaned_bytes: i64,
}

/// Phase one: mark unreferenced blobs, unmark re-referenced ones.
/// Returns (marked, unmarked).
pub async fn mark(store: &ContentStore) -> Result<(u64, u64)> {
    let now = now_millis();

    let marked = sqlx::query(&format!(
        "UPDATE content_blobs AS b SET orphaned_at = ?, updated_at = ? \
         WHERE b.orphaned_at IS NULL AND {}",
        UNREFERENCED
    ))
    .bind(now)
    .bind(now)
    .execute(store.pool())
    .await?
    .rows_affected();

    let unmarked = sqlx::query(&format!(
        "UPDATE content_blobs AS b SET orphaned_at = NULL, updated_at = ? \
         WHERE b.orphaned_at IS NOT NULL AND NOT ({})",
        UNREFERENCED
    ))
    .bind(now)
    .execute(store.pool())
    .await?
    .rows_affected();

    Ok((marked, unmarked))
}

/// Phase two: delete blobs orphaned for longer than the grace period and
/// still unreferenced.
pub async fn sweep(store: &ContentStore, opts: &GcOptions, report: &mut GcReport) -> Result<()> {
    let cutoff = now_millis() - opts.grace_period.as_millis() as i64;
    let mut after = String::new();

    loop {
        let candidates = sqlx::query(
            r#"
            SELECT id, size_bytes FROM content_blobs
            WHERE orphaned_at IS NOT NULL AND orphaned_at <= ? AND id > ?
            ORDER BY id
            LIMIT ?
            "#,
        )
        .bind(cutoff)
        .bind(&after)
        .bind(opts.batch_size)
        .fetch_all(store.pool())
        .await?;

        if candidates.is_empty() {
            break;
        }

        for row in &candidates {
            let id: String = row.try_get("id")?;
            let size: i64 = row.try_get("size_bytes")?;
            after = id.clone();

            if opts.dry_run {
                report.blobs_deleted += 1;
                report.bytes_reclaimed += size as u64;
                continue;
            }

            match delete_if_unreferenced(store, &id, cutoff).await {
                Ok(Some(bytes)) => {
                    report.blobs_deleted += 1;
                    report.bytes_reclaimed += bytes;
                }
                Ok(None) => {
                    tracing::debug!(content_id = %id, "orphan re-referenced before sweep");
                }
                Err(e) => {
                    tracing::warn!(content_id = %id, error = %e, "failed to delete orphaned blob");
                    report.errors.push(format!("{}: {}", id, e));
                }
            }
        }

        if (candidates.len() as i64) < opts.batch_size {
            break;
        }
    }

    Ok(())
}

/// Delete one blob if it is still an expired orphan. Returns the bytes
/// reclaimed, or `None` when the conditional delete matched nothing.
async fn delete_if_unreferenced(
    store: &ContentStore,
    id: &str,
    cutoff: i64,
) -> Result<Option<u64>> {
    let deleted = sqlx::query(&format!(
        "DELETE FROM content_blobs AS b \
         WHERE b.id = ? AND b.orphaned_at IS NOT NULL AND b.orphaned_at <= ? AND {} \
         RETURNING storage_backend, storage_key, size_bytes",
        UNREFERENCED
    ))
    .bind(id)
    .bind(cutoff)
    .fetch_optional(store.pool())
    .await?;

    let Some(row) = deleted else {
        return Ok(None);
    };

    let backend: String = row.try_get("storage_backend")?;
    let size: i64 = row.try_get("size_bytes")?;
    if backend != BACKEND_INLINE {
        let key: String = row.try_get("storage_key")?;
        // The row is gone, so nothing can reach this object any more.
        store.delete_external(&key).await?;
    }
    Ok(Some(size as u64))
}

/// One full cycle: mark, then sweep.
pub async fn run_gc(store: &ContentStore, opts: &GcOptions) -> Result<GcReport> {
    let mut report = GcReport::default();

    if opts.dry_run {
        report.orphans_marked = count_unmarked_orphans(store).await?;
    } else {
        let (marked, unmarked) = mark(store).await?;
        report.orphans_marked = marked;
        report.orphans_unmarked = unmarked;
    }

    sweep(store, opts, &mut report).await?;

    tracing::info!(
        marked = report.orphans_marked,
        unmarked = report.orphans_unmarked,
        deleted = report.blobs_deleted,
        bytes = report.bytes_reclaimed,
        errors = report.errors.len(),
        dry_run = opts.dry_run,
        "content gc cycle finished"
    );

    Ok(report)
}

/// Run [`run_gc`] every `interval` until `shutdown` flips to true.
pub async fn run_gc_loop(
    store: ContentStore,
    opts: GcOptions,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = run_gc(&store, &opts).await {
                    tracing::error!(error = %e, "content gc cycle failed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!("content gc stopped");
}

async fn count_unmarked_orphans(store: &ContentStore) -> Result<u64> {
    let n: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM content_blobs AS b WHERE b.orphaned_at IS NULL AND {}",
        UNREFERENCED
    ))
    .fetch_one(store.pool())
    .await?;
    Ok(n as u64)
}

pub async fn orphan_stats(store: &ContentStore, grace_period: Duration) -> Result<OrphanStats> {
    let cutoff = now_millis() - grace_period.as_millis() as i64;
    let row = sqlx::query(
        r#"
        SELECT
            COUNT(*) AS total_blobs,
            COALESCE(SUM(size_bytes), 0) AS total_bytes,
            COALESCE(SUM(CASE WHEN orphaned_at IS NOT NULL AND orphaned_at > ? THEN 1 ELSE 0 END), 0)
                AS pending_orphans,
            COALESCE(SUM(CASE WHEN orphaned_at IS NOT NULL AND orphaned_at <= ? THEN 1 ELSE 0 END), 0)
                AS expired_orphans,
            COALESCE(SUM(CASE WHEN orphaned_at IS NOT NULL THEN size_bytes ELSE 0 END), 0)
                AS orphaned_bytes
        FROM content_blobs
        "#,
    )
    .bind(cutoff)
    .bind(cutoff)
    .fetch_one(store.pool())
    .await?;

    Ok(OrphanStats {
        total_blobs: row.try_get("total_blobs")?,
        total_bytes: row.try_get("total_bytes")?,
        pending_orphans: row.try_get("pending_orphans")?,
        expired_orphans: row.try_get("expired_orphans")?,
        orphaned_bytes: row.try_get("orphaned_bytes")?,
    })
}
