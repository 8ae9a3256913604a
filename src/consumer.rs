//! Event consumer pool.
//!
//! Workers claim rows from the [`EventQueue`] and materialize them into the
//! `documents` table. Application is idempotent because a document's
//! identity is (source_id, external_id), never the event id:
//!
//! - `created` / `updated` upsert the document and, when embeddings are
//!   enabled, queue it for embedding (at most one unbatched item per
//!   document and model).
//! - `deleted` removes the document, its embeddings and its pending
//!   embedding items. Deleting something already gone is a no-op.
//!
//! A failed application marks the row failed and the worker moves on.
//! While applying, the worker renews its claim so the reaper does not
//! mistake slow work for a crash.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::config::Config;
use crate::db::now_millis;
use crate::error::QueueError;
use crate::models::{map_to_string, EventType, QueuedEvent};
use crate::queue::EventQueue;

/// Which provider/model newly materialized documents are queued for.
#[derive(Debug, Clone)]
pub struct EmbeddingTarget {
    pub provider: String,
    pub model_name: String,
    pub dimensions: i64,
}

impl EmbeddingTarget {
    pub fn from_config(config: &Config) -> Option<Self> {
        let e = &config.embedding;
        if !e.is_enabled() {
            return None;
        }
        Some(Self {
            provider: e.provider.clone(),
            model_name: e.model.clone()?,
            dimensions: e.dims? as i64,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
    /// The claim was reaped while we worked; the ack was discarded.
    ClaimLost,
}

#[derive(Clone)]
pub struct Consumer {
    queue: EventQueue,
    embedding: Option<EmbeddingTarget>,
    lease_renew: Duration,
}

impl Consumer {
    pub fn new(queue: EventQueue, embedding: Option<EmbeddingTarget>, lease_renew: Duration) -> Self {
        Self {
            queue,
            embedding,
            lease_renew,
        }
    }

    pub fn from_config(pool: SqlitePool, config: &Config) -> Self {
        Self::new(
            EventQueue::new(pool, config.queue.max_retries),
            EmbeddingTarget::from_config(config),
            Duration::from_secs(config.queue.lease_renew_secs),
        )
    }

    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    /// Claim and apply one event. `Ok(None)` means nothing was claimable.
    pub async fn process_next(&self) -> Result<Option<(String, Outcome)>> {
        let Some(event) = self.queue.claim().await? else {
            return Ok(None);
        };
        let token = event.claim_token.clone().unwrap_or_default();

        let heartbeat = {
            let queue = self.queue.clone();
            let (id, token) = (event.id.clone(), token.clone());
            let every = self.lease_renew;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    match queue.renew(&id, &token).await {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::warn!(event_id = %id, "claim lost while processing");
                            break;
                        }
                        Err(e) => tracing::warn!(event_id = %id, error = %e, "claim renewal failed"),
                    }
                }
            })
        };
        let result = self.apply(&event).await;
        heartbeat.abort();

        let outcome = match result {
            Ok(()) => {
                if self.queue.complete(&event.id, &token).await? {
                    Outcome::Completed
                } else {
                    Outcome::ClaimLost
                }
            }
            Err(e) => {
                tracing::warn!(
                    event_id = %event.id,
                    sync_run_id = %event.sync_run_id,
                    document_id = %event.external_document_id,
                    retry_count = event.retry_count,
                    error = %e,
                    "event application failed"
                );
                if self.queue.fail(&event.id, &token, &e.to_string()).await? {
                    Outcome::Failed
                } else {
                    Outcome::ClaimLost
                }
            }
        };

        Ok(Some((event.id, outcome)))
    }

    /// Apply one event to the document store in a single transaction.
    ///
    /// Each branch opens with a write so the transaction takes SQLite's
    /// write lock up front instead of upgrading from a read snapshot.
    pub async fn apply(&self, event: &QueuedEvent) -> Result<(), QueueError> {
        let mut tx = self.queue.pool().begin().await?;
        let now = now_millis();

        match event.event_type {
            EventType::Created | EventType::Updated => {
                let row = sqlx::query(
                    r#"
                    INSERT INTO documents
                        (id, source_id, external_id, title, content_id, metadata_json,
                         permissions_json, attributes_json, last_sync_run_id, created_at, updated_at)
                    SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
                    WHERE ? IS NULL OR EXISTS (SELECT 1 FROM content_blobs WHERE id = ?)
                    ON CONFLICT(source_id, external_id) DO UPDATE SET
                        title = excluded.title,
                        content_id = excluded.content_id,
                        metadata_json = excluded.metadata_json,
                        permissions_json = excluded.permissions_json,
                        attributes_json = excluded.attributes_json,
                        last_sync_run_id = excluded.last_sync_run_id,
                        updated_at = excluded.updated_at
                    RETURNING id
                    "#,
                )
                .bind(Uuid::new_v4().to_string())
                .bind(&event.source_id)
                .bind(&event.external_document_id)
                .bind(&event.title)
                .bind(&event.content_id)
                .bind(map_to_string(&event.metadata))
                .bind(map_to_string(&event.permissions))
                .bind(map_to_string(&event.attributes))
                .bind(&event.sync_run_id)
                .bind(now)
                .bind(now)
                .bind(&event.content_id)
                .bind(&event.content_id)
                .fetch_optional(&mut *tx)
                .await?;

                let Some(row) = row else {
                    return Err(QueueError::Processing {
                        event_id: event.id.clone(),
                        message: format!(
                            "content {} no longer exists",
                            event.content_id.as_deref().unwrap_or_default()
                        ),
                    });
                };
                let document_id: String = row.try_get("id")?;

                if let (Some(target), Some(_)) = (&self.embedding, &event.content_id) {
                    sqlx::query(
                        r#"
                        INSERT INTO embedding_queue
                            (id, document_id, provider, model_name, dimensions, status, created_at)
                        SELECT ?, ?, ?, ?, ?, 'pending', ?
                        WHERE NOT EXISTS (
                            SELECT 1 FROM embedding_queue
                            WHERE document_id = ? AND model_name = ?
                              AND status = 'pending' AND batch_job_id IS NULL
                        )
                        "#,
                    )
                    .bind(Uuid::new_v4().to_string())
                    .bind(&document_id)
                    .bind(&target.provider)
                    .bind(&target.model_name)
                    .bind(target.dimensions)
                    .bind(now)
                    .bind(&document_id)
                    .bind(&target.model_name)
                    .execute(&mut *tx)
                    .await?;
                }
            }
            EventType::Deleted => {
                let owned = "SELECT id FROM documents WHERE source_id = ? AND external_id = ?";
                sqlx::query(&format!(
                    "DELETE FROM embeddings WHERE document_id IN ({})",
                    owned
                ))
                .bind(&event.source_id)
                .bind(&event.external_document_id)
                .execute(&mut *tx)
                .await?;
                sqlx::query(&format!(
                    "DELETE FROM embedding_queue \
                     WHERE status = 'pending' AND batch_job_id IS NULL AND document_id IN ({})",
                    owned
                ))
                .bind(&event.source_id)
                .bind(&event.external_document_id)
                .execute(&mut *tx)
                .await?;
                sqlx::query("DELETE FROM documents WHERE source_id = ? AND external_id = ?")
                    .bind(&event.source_id)
                    .bind(&event.external_document_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        tracing::debug!(
            event_id = %event.id,
            document_id = %event.external_document_id,
            event_type = %event.event_type,
            "event applied"
        );
        Ok(())
    }
}

/// Spawn `workers` consumer loops that poll until `shutdown` flips to true.
pub fn spawn_pool(
    consumer: Consumer,
    workers: usize,
    poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinSet<()> {
    let mut set = JoinSet::new();
    for worker in 0..workers {
        let consumer = consumer.clone();
        let mut shutdown = shutdown.clone();
        set.spawn(async move {
            tracing::debug!(worker, "consumer started");
            loop {
                if *shutdown.borrow() {
                    break;
                }
                match consumer.process_next().await {
                    Ok(Some(_)) => continue,
                    Ok(None) => {}
                    Err(e) => tracing::error!(worker, error = %e, "consumer error"),
                }
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!(worker, "consumer stopped");
        });
    }
    set
}

/// Process everything currently claimable with `workers` concurrent
/// consumers, then return the number of events handled.
pub async fn drain(consumer: &Consumer, workers: usize) -> Result<u64> {
    let mut set = JoinSet::new();
    for _ in 0..workers.max(1) {
        let consumer = consumer.clone();
        set.spawn(async move {
            let mut handled = 0u64;
            loop {
                match consumer.process_next().await? {
                    Some(_) => handled += 1,
                    None => {
                        // Another worker may still hold a row that blocks
                        // later events for the same document.
                        if consumer.queue().stats().await?.processing == 0 {
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
            Ok::<u64, anyhow::Error>(handled)
        });
    }

    let mut total = 0;
    while let Some(joined) = set.join_next().await {
        total += joined??;
    }
    Ok(total)
}
