//! Durable connector event queue.
//!
//! Rows move through:
//!
//! ```text
//! pending ──claim──▶ processing ──complete──▶ completed
//!    ▲                   │
//!    │                   └──fail──▶ failed ──(retries left)──┐
//!    └──────────────── retry_failed / reaper ◀───────────────┘
//! ```
//!
//! Every transition is one conditional `UPDATE`, so the database is the only
//! coordination between workers. A claim writes a fresh claim token; acks
//! and lease renewals must present it, which keeps a worker whose row was
//! reaped from overwriting a newer claim.
//!
//! Claims respect per-document order: a row is claimable only when no
//! earlier row for the same (source_id, external_document_id) is still
//! pending, processing or waiting for a retry.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use crate::db::now_millis;
use crate::error::IngestError;
use crate::models::{map_to_string, EventEnvelope, JsonMap, QueuedEvent};

#[derive(Clone)]
pub struct EventQueue {
    pool: SqlitePool,
    max_retries: i64,
}

/// Row counts by status.
#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    /// Failed rows with no automatic retries left.
    pub exhausted: i64,
}

impl QueueStats {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.completed + self.failed
    }
}

impl EventQueue {
    pub fn new(pool: SqlitePool, max_retries: i64) -> Self {
        Self { pool, max_retries }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Persist one event as a pending row and return its id.
    ///
    /// The content reference is checked in the same statement as the insert,
    /// so an event never lands in the queue pointing at a missing blob.
    pub async fn enqueue(&self, event: &EventEnvelope) -> Result<String, IngestError> {
        let id = Uuid::new_v4().to_string();
        let empty = JsonMap::new();

        let inserted = sqlx::query(
            r#"
            INSERT INTO connector_events_queue
                (id, sync_run_id, source_id, event_type, external_document_id, content_id,
                 title, metadata_json, permissions_json, attributes_json,
                 status, max_retries, created_at)
            SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?
            WHERE ? IS NULL OR EXISTS (SELECT 1 FROM content_blobs WHERE id = ?)
            "#,
        )
        .bind(&id)
        .bind(&event.sync_run_id)
        .bind(&event.source_id)
        .bind(event.event_type.as_str())
        .bind(&event.document_id)
        .bind(&event.content_id)
        .bind(&event.title)
        .bind(map_to_string(event.metadata.as_ref().unwrap_or(&empty)))
        .bind(map_to_string(event.permissions.as_ref().unwrap_or(&empty)))
        .bind(map_to_string(event.attributes.as_ref().unwrap_or(&empty)))
        .bind(self.max_retries)
        .bind(now_millis())
        .bind(&event.content_id)
        .bind(&event.content_id)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(IngestError::BadRequest(format!(
                "content {} does not exist",
                event.content_id.as_deref().unwrap_or_default()
            )));
        }

        tracing::debug!(
            event_id = %id,
            sync_run_id = %event.sync_run_id,
            document_id = %event.document_id,
            event_type = %event.event_type,
            "event enqueued"
        );
        Ok(id)
    }

    /// Atomically claim the oldest claimable pending row.
    pub async fn claim(&self) -> Result<Option<QueuedEvent>> {
        let token = Uuid::new_v4().to_string();
        let row = sqlx::query(
            r#"
            UPDATE connector_events_queue
            SET status = 'processing', processing_started_at = ?, claim_token = ?
            WHERE seq = (
                SELECT q.seq FROM connector_events_queue q
                WHERE q.status = 'pending'
                  AND NOT EXISTS (
                      SELECT 1 FROM connector_events_queue p
                      WHERE p.source_id = q.source_id
                        AND p.external_document_id = q.external_document_id
                        AND p.seq < q.seq
                        AND (p.status IN ('pending', 'processing')
                             OR (p.status = 'failed' AND p.retry_count <= p.max_retries))
                  )
                ORDER BY q.seq
                LIMIT 1
            )
            AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(now_millis())
        .bind(&token)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| QueuedEvent::from_row(&r)).transpose()
    }

    /// Refresh `processing_started_at` for a live claim. Returns false when
    /// the claim was lost (reaped and possibly re-claimed).
    pub async fn renew(&self, id: &str, token: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE connector_events_queue SET processing_started_at = ? \
             WHERE id = ? AND claim_token = ? AND status = 'processing'",
        )
        .bind(now_millis())
        .bind(id)
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn complete(&self, id: &str, token: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE connector_events_queue
            SET status = 'completed', processed_at = ?, claim_token = NULL,
                processing_started_at = NULL, error_message = NULL
            WHERE id = ? AND claim_token = ? AND status = 'processing'
            "#,
        )
        .bind(now_millis())
        .bind(id)
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn fail(&self, id: &str, token: &str, error: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE connector_events_queue
            SET status = 'failed', retry_count = retry_count + 1, error_message = ?,
                processed_at = ?, claim_token = NULL, processing_started_at = NULL
            WHERE id = ? AND claim_token = ? AND status = 'processing'
            "#,
        )
        .bind(error)
        .bind(now_millis())
        .bind(id)
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Move failed rows that still have retries left back to pending.
    pub async fn retry_failed(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE connector_events_queue SET status = 'pending', processed_at = NULL \
             WHERE status = 'failed' AND retry_count <= max_retries",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Delete completed rows processed before `before_millis`.
    pub async fn purge_completed(&self, before_millis: i64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM connector_events_queue WHERE status = 'completed' AND processed_at < ?",
        )
        .bind(before_millis)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn get(&self, id: &str) -> Result<Option<QueuedEvent>> {
        let row = sqlx::query("SELECT * FROM connector_events_queue WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| QueuedEvent::from_row(&r)).transpose()
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS n,
                   SUM(CASE WHEN retry_count > max_retries THEN 1 ELSE 0 END) AS exhausted
            FROM connector_events_queue
            GROUP BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            match status.as_str() {
                "pending" => stats.pending = n,
                "processing" => stats.processing = n,
                "completed" => stats.completed = n,
                "failed" => {
                    stats.failed = n;
                    stats.exhausted = row.try_get("exhausted")?;
                }
                _ => {}
            }
        }
        Ok(stats)
    }
}

/// Run [`EventQueue::retry_failed`] every `interval` until `shutdown` flips to true.
pub async fn run_retry_sweep(
    queue: EventQueue,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => match queue.retry_failed().await {
                Ok(0) => {}
                Ok(n) => tracing::info!(requeued = n, "failed events requeued for retry"),
                Err(e) => tracing::error!(error = %e, "retry sweep failed"),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!("retry sweep stopped");
}
