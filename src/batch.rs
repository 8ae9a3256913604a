//! Embedding batch orchestrator.
//!
//! Turns queued embedding items into provider batch jobs and folds the
//! results back into the `embeddings` table.
//!
//! ```text
//! embedding_queue (pending, unbatched)
//!        │ accumulate: group by (provider, model, dims); size or age threshold
//!        ▼
//! job pending ─▶ preparing ─▶ submitted ─▶ processing ─▶ completed
//!                   │             │             │
//!                   └─────────────┴─────────────┴──▶ failed
//!                                 transient: items requeued
//!                                 permanent: items failed
//! ```
//!
//! Batch input and output are JSONL files in an object store, one record
//! per chunk keyed `"<document_id>:<chunk_index>"`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use object_store::{path::Path as ObjPath, ObjectStore, PutPayload};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use crate::chunk::chunk_text;
use crate::config::Config;
use crate::content::{memory_store, open_local_store, ContentStore, DynStore};
use crate::db::now_millis;
use crate::embedding::{create_provider, vec_to_blob, EmbeddingProvider};
use crate::error::EmbeddingError;
use crate::models::{BatchJobStatus, EmbeddingBatchJob};

// ═══════════════════════════════════════════════════════════════════════
// Provider interface
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchPoll {
    Processing,
    Completed,
    Failed { error: String, transient: bool },
}

/// A provider that accepts whole batch files.
#[async_trait]
pub trait BatchProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;

    /// Submit the JSONL at `input_path`; results go to `output_path`.
    /// Returns the provider's job id.
    async fn submit(&self, input_path: &str, output_path: &str) -> Result<String, EmbeddingError>;

    async fn poll(&self, external_job_id: &str) -> Result<BatchPoll, EmbeddingError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct InputRecord {
    record_id: String,
    text: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct OutputRecord {
    record_id: String,
    embedding: Vec<f32>,
}

/// Runs batch jobs itself by calling an [`EmbeddingProvider`] in slices
/// of `batch_size` texts. A job executes on its first poll.
pub struct InlineBatchProvider {
    provider: Arc<dyn EmbeddingProvider>,
    store: DynStore,
    batch_size: usize,
    jobs: Mutex<HashMap<String, (String, String)>>,
}

impl InlineBatchProvider {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, store: DynStore, batch_size: usize) -> Self {
        Self {
            provider,
            store,
            batch_size: batch_size.max(1),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    async fn execute(&self, input_path: &str, output_path: &str) -> Result<(), EmbeddingError> {
        let input = read_object(&self.store, input_path)
            .await
            .map_err(|e| EmbeddingError::Transient(e.to_string()))?;
        let records: Vec<InputRecord> = parse_jsonl(&input)
            .map_err(|e| EmbeddingError::Permanent(format!("bad batch input: {}", e)))?;

        let mut output = Vec::new();
        for slice in records.chunks(self.batch_size) {
            let texts: Vec<String> = slice.iter().map(|r| r.text.clone()).collect();
            let vectors = self.provider.embed(&texts).await?;
            for (record, embedding) in slice.iter().zip(vectors) {
                write_jsonl_line(
                    &mut output,
                    &OutputRecord {
                        record_id: record.record_id.clone(),
                        embedding,
                    },
                )
                .map_err(|e| EmbeddingError::Permanent(e.to_string()))?;
            }
        }

        write_object(&self.store, output_path, output)
            .await
            .map_err(|e| EmbeddingError::Transient(e.to_string()))
    }
}

#[async_trait]
impl BatchProvider for InlineBatchProvider {
    fn name(&self) -> &str {
        self.provider.name()
    }
    fn model_name(&self) -> &str {
        self.provider.model_name()
    }
    fn dims(&self) -> usize {
        self.provider.dims()
    }

    async fn submit(&self, input_path: &str, output_path: &str) -> Result<String, EmbeddingError> {
        let id = format!("inline-{}", Uuid::new_v4());
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), (input_path.to_string(), output_path.to_string()));
        Ok(id)
    }

    async fn poll(&self, external_job_id: &str) -> Result<BatchPoll, EmbeddingError> {
        let paths = self
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(external_job_id);
        let Some((input, output)) = paths else {
            // Submitted by an earlier process; its work died with it.
            return Ok(BatchPoll::Failed {
                error: format!("unknown batch job {}", external_job_id),
                transient: true,
            });
        };
        Ok(match self.execute(&input, &output).await {
            Ok(()) => BatchPoll::Completed,
            Err(e) => BatchPoll::Failed {
                transient: e.is_transient(),
                error: e.to_string(),
            },
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Orchestrator
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub min_batch_size: i64,
    pub max_batch_size: i64,
    pub accumulation_timeout: Duration,
    pub chunk_max_tokens: usize,
}

impl BatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            min_batch_size: config.batch.min_batch_size,
            max_batch_size: config.batch.max_batch_size,
            accumulation_timeout: Duration::from_secs(config.batch.accumulation_timeout_secs),
            chunk_max_tokens: config.embedding.chunk_max_tokens,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct TickReport {
    pub jobs_created: usize,
    pub jobs_submitted: usize,
    pub jobs_completed: usize,
    pub jobs_failed: usize,
}

pub struct BatchOrchestrator {
    pool: SqlitePool,
    content: ContentStore,
    store: DynStore,
    provider: Arc<dyn BatchProvider>,
    settings: BatchSettings,
}

impl BatchOrchestrator {
    pub fn new(
        pool: SqlitePool,
        content: ContentStore,
        store: DynStore,
        provider: Arc<dyn BatchProvider>,
        settings: BatchSettings,
    ) -> Self {
        Self {
            pool,
            content,
            store,
            provider,
            settings,
        }
    }

    /// `None` when embeddings are disabled.
    pub fn from_config(pool: SqlitePool, config: &Config) -> Result<Option<Self>> {
        if !config.embedding.is_enabled() {
            return Ok(None);
        }
        let store = match &config.batch.storage_path {
            Some(path) => open_local_store(path).context("Failed to open batch store")?,
            None => memory_store(),
        };
        let content = ContentStore::from_config(pool.clone(), &config.content)?;
        let embedder = create_provider(&config.embedding)?;
        let provider = Arc::new(InlineBatchProvider::new(
            embedder,
            store.clone(),
            config.embedding.batch_size,
        ));
        Ok(Some(Self::new(
            pool,
            content,
            store,
            provider,
            BatchSettings::from_config(config),
        )))
    }

    /// One pass: accumulate, submit pending jobs, then poll in-flight ones.
    pub async fn tick(&self) -> Result<TickReport> {
        let mut report = TickReport {
            jobs_created: self.accumulate().await?.len(),
            ..Default::default()
        };

        for job in self.jobs_in(&[BatchJobStatus::Pending]).await? {
            match self.prepare_and_submit(&job.id).await {
                Ok(true) => report.jobs_submitted += 1,
                Ok(false) => report.jobs_failed += 1,
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "batch submission failed");
                    report.jobs_failed += 1;
                }
            }
        }

        for job in self
            .jobs_in(&[BatchJobStatus::Submitted, BatchJobStatus::Processing])
            .await?
        {
            match self.monitor(&job).await {
                Ok(BatchJobStatus::Completed) => report.jobs_completed += 1,
                Ok(BatchJobStatus::Failed) => report.jobs_failed += 1,
                Ok(_) => {}
                Err(e) => tracing::error!(job_id = %job.id, error = %e, "batch monitor failed"),
            }
        }

        Ok(report)
    }

    /// Form jobs from unbatched items of this provider's (provider, model,
    /// dimensions) group. Returns the new job ids.
    pub async fn accumulate(&self) -> Result<Vec<String>> {
        let mut created = Vec::new();
        loop {
            let row = sqlx::query(
                r#"
                SELECT COUNT(*) AS n, MIN(created_at) AS oldest
                FROM embedding_queue
                WHERE status = 'pending' AND batch_job_id IS NULL
                  AND provider = ? AND model_name = ? AND dimensions = ?
                "#,
            )
            .bind(self.provider.name())
            .bind(self.provider.model_name())
            .bind(self.provider.dims() as i64)
            .fetch_one(&self.pool)
            .await?;
            let count: i64 = row.try_get("n")?;
            let oldest: Option<i64> = row.try_get("oldest")?;

            let aged = oldest.is_some_and(|t| {
                now_millis() - t >= self.settings.accumulation_timeout.as_millis() as i64
            });
            let ready = count >= self.settings.max_batch_size
                || (count >= self.settings.min_batch_size && aged);
            if count == 0 || !ready {
                break;
            }

            match self.create_job().await? {
                Some(id) => created.push(id),
                None => break,
            }
        }
        Ok(created)
    }

    async fn create_job(&self) -> Result<Option<String>> {
        let job_id = Uuid::new_v4().to_string();
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO embedding_batch_jobs (id, status, provider, model_name, dimensions, created_at) \
             VALUES (?, 'pending', ?, ?, ?, ?)",
        )
        .bind(&job_id)
        .bind(self.provider.name())
        .bind(self.provider.model_name())
        .bind(self.provider.dims() as i64)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let assigned = sqlx::query(
            r#"
            UPDATE embedding_queue SET status = 'batched', batch_job_id = ?
            WHERE id IN (
                SELECT id FROM embedding_queue
                WHERE status = 'pending' AND batch_job_id IS NULL
                  AND provider = ? AND model_name = ? AND dimensions = ?
                ORDER BY created_at, id
                LIMIT ?
            )
            AND status = 'pending' AND batch_job_id IS NULL
            "#,
        )
        .bind(&job_id)
        .bind(self.provider.name())
        .bind(self.provider.model_name())
        .bind(self.provider.dims() as i64)
        .bind(self.settings.max_batch_size)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if assigned == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        sqlx::query("UPDATE embedding_batch_jobs SET document_count = ? WHERE id = ?")
            .bind(assigned as i64)
            .bind(&job_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(job_id = %job_id, items = assigned, model = %self.provider.model_name(), "batch job created");
        Ok(Some(job_id))
    }

    /// Build the input file for a pending job and submit it. Returns false
    /// when the job failed instead.
    pub async fn prepare_and_submit(&self, job_id: &str) -> Result<bool> {
        if !self
            .transition(job_id, BatchJobStatus::Pending, BatchJobStatus::Preparing)
            .await?
        {
            bail!("batch job {} is not pending", job_id);
        }

        let items = sqlx::query(
            r#"
            SELECT q.id AS item_id, q.document_id, d.content_id
            FROM embedding_queue q
            LEFT JOIN documents d ON d.id = q.document_id
            WHERE q.batch_job_id = ?
            ORDER BY q.created_at, q.id
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        let mut input = Vec::new();
        let mut records = 0usize;
        let mut empty = 0usize;
        for row in &items {
            let item_id: String = row.try_get("item_id")?;
            let document_id: String = row.try_get("document_id")?;
            let content_id: Option<String> = row.try_get("content_id")?;

            let text = match content_id {
                Some(cid) => self.content.get_text(&cid).await.map_err(|e| e.to_string()),
                None => Err("document or content no longer exists".to_string()),
            };
            let text = match text {
                Ok(t) => t,
                Err(message) => {
                    self.fail_item(&item_id, &message).await?;
                    continue;
                }
            };

            let chunks = chunk_text(&document_id, &text, self.settings.chunk_max_tokens);
            if chunks.is_empty() {
                self.complete_empty_item(&item_id, &document_id).await?;
                empty += 1;
                continue;
            }
            for chunk in chunks {
                write_jsonl_line(
                    &mut input,
                    &InputRecord {
                        record_id: format!("{}:{}", chunk.document_id, chunk.chunk_index),
                        text: chunk.text,
                    },
                )?;
                records += 1;
            }
        }

        if records == 0 {
            let reason = if empty > 0 {
                "no embeddable content"
            } else {
                "every document in the job was skipped"
            };
            self.fail_job(job_id, reason, false).await?;
            return Ok(false);
        }

        let input_path = format!("batches/{}/input.jsonl", job_id);
        let output_path = format!("batches/{}/output.jsonl", job_id);
        write_object(&self.store, &input_path, input).await?;

        let external_id = match self.provider.submit(&input_path, &output_path).await {
            Ok(id) => id,
            Err(e) => {
                self.fail_job(job_id, &e.to_string(), e.is_transient()).await?;
                return Ok(false);
            }
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            UPDATE embedding_batch_jobs
            SET status = 'submitted', external_job_id = ?, input_storage_path = ?,
                output_storage_path = ?, submitted_at = ?
            WHERE id = ? AND status = 'preparing'
            "#,
        )
        .bind(&external_id)
        .bind(&input_path)
        .bind(&output_path)
        .bind(now_millis())
        .bind(job_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE embedding_queue SET status = 'processing' WHERE batch_job_id = ? AND status = 'batched'",
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::info!(job_id = %job_id, external_job_id = %external_id, records, "batch job submitted");
        Ok(true)
    }

    /// Poll one in-flight job and act on the answer. Returns the job's
    /// resulting status.
    pub async fn monitor(&self, job: &EmbeddingBatchJob) -> Result<BatchJobStatus> {
        let Some(external_id) = &job.external_job_id else {
            self.fail_job(&job.id, "submitted job has no external id", true)
                .await?;
            return Ok(BatchJobStatus::Failed);
        };

        let poll = match self.provider.poll(external_id).await {
            Ok(p) => p,
            Err(e) if e.is_transient() => {
                tracing::warn!(job_id = %job.id, error = %e, "batch poll failed, will retry");
                return Ok(job.status);
            }
            Err(e) => BatchPoll::Failed {
                error: e.to_string(),
                transient: false,
            },
        };

        match poll {
            BatchPoll::Processing => {
                if job.status == BatchJobStatus::Submitted {
                    self.transition(&job.id, BatchJobStatus::Submitted, BatchJobStatus::Processing)
                        .await?;
                }
                Ok(BatchJobStatus::Processing)
            }
            BatchPoll::Completed => {
                self.complete_job(job).await?;
                Ok(BatchJobStatus::Completed)
            }
            BatchPoll::Failed { error, transient } => {
                self.fail_job(&job.id, &error, transient).await?;
                Ok(BatchJobStatus::Failed)
            }
        }
    }

    /// Read the job's output and replace each document's embeddings.
    pub async fn complete_job(&self, job: &EmbeddingBatchJob) -> Result<()> {
        if !job.status.can_transition_to(BatchJobStatus::Completed) {
            bail!("batch job {} cannot complete from {}", job.id, job.status);
        }
        let (Some(input_path), Some(output_path)) = (&job.input_storage_path, &job.output_storage_path)
        else {
            bail!("batch job {} has no storage paths", job.id);
        };

        let texts: HashMap<String, String> =
            parse_jsonl::<InputRecord>(&read_object(&self.store, input_path).await?)?
                .into_iter()
                .map(|r| (r.record_id, r.text))
                .collect();
        let outputs: Vec<OutputRecord> = parse_jsonl(&read_object(&self.store, output_path).await?)?;

        // document_id -> chunk_index -> vector
        let mut by_doc: BTreeMap<String, BTreeMap<i64, Vec<f32>>> = BTreeMap::new();
        for record in outputs {
            let Some((doc, idx)) = split_record_id(&record.record_id) else {
                tracing::warn!(job_id = %job.id, record_id = %record.record_id, "malformed record id");
                continue;
            };
            by_doc.entry(doc).or_default().insert(idx, record.embedding);
        }
        let mut expected: HashMap<String, usize> = HashMap::new();
        for record_id in texts.keys() {
            if let Some((doc, _)) = split_record_id(record_id) {
                *expected.entry(doc).or_default() += 1;
            }
        }

        let now = now_millis();
        let mut tx = self.pool.begin().await?;
        let finished = sqlx::query(
            "UPDATE embedding_batch_jobs SET status = 'completed', completed_at = ? \
             WHERE id = ? AND status IN ('submitted', 'processing')",
        )
        .bind(now)
        .bind(&job.id)
        .execute(&mut *tx)
        .await?;
        if finished.rows_affected() == 0 {
            bail!("batch job {} changed state concurrently", job.id);
        }

        for (document_id, total) in &expected {
            let vectors = by_doc.remove(document_id).unwrap_or_default();
            if vectors.len() != *total {
                sqlx::query(
                    "UPDATE embedding_queue SET status = 'failed', error_message = ?, processed_at = ? \
                     WHERE batch_job_id = ? AND document_id = ?",
                )
                .bind(format!("{} of {} chunks embedded", vectors.len(), total))
                .bind(now)
                .bind(&job.id)
                .bind(document_id)
                .execute(&mut *tx)
                .await?;
                continue;
            }

            sqlx::query("DELETE FROM embeddings WHERE document_id = ? AND model_name = ?")
                .bind(document_id)
                .bind(&job.model_name)
                .execute(&mut *tx)
                .await?;
            for (chunk_index, vector) in &vectors {
                let text = texts
                    .get(&format!("{}:{}", document_id, chunk_index))
                    .cloned()
                    .unwrap_or_default();
                sqlx::query(
                    r#"
                    INSERT INTO embeddings
                        (id, document_id, chunk_index, chunk_text, vector, dimensions, model_name, created_at)
                    SELECT ?, ?, ?, ?, ?, ?, ?, ?
                    WHERE EXISTS (SELECT 1 FROM documents WHERE id = ?)
                    "#,
                )
                .bind(Uuid::new_v4().to_string())
                .bind(document_id)
                .bind(*chunk_index)
                .bind(text)
                .bind(vec_to_blob(vector))
                .bind(job.dimensions)
                .bind(&job.model_name)
                .bind(now)
                .bind(document_id)
                .execute(&mut *tx)
                .await?;
            }
            sqlx::query(
                "UPDATE embedding_queue SET status = 'completed', processed_at = ? \
                 WHERE batch_job_id = ? AND document_id = ? AND status = 'processing'",
            )
            .bind(now)
            .bind(&job.id)
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        tracing::info!(job_id = %job.id, documents = expected.len(), "batch job completed");
        Ok(())
    }

    /// Fail a job. Transient failures return its items to the queue;
    /// permanent ones fail them.
    pub async fn fail_job(&self, job_id: &str, error: &str, transient: bool) -> Result<()> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;
        let failed = sqlx::query(
            "UPDATE embedding_batch_jobs SET status = 'failed', error_message = ?, completed_at = ? \
             WHERE id = ? AND status NOT IN ('completed', 'failed')",
        )
        .bind(error)
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;
        if failed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(());
        }

        let items = if transient {
            sqlx::query(
                "UPDATE embedding_queue SET status = 'pending', batch_job_id = NULL \
                 WHERE batch_job_id = ? AND status IN ('batched', 'processing')",
            )
            .bind(job_id)
            .execute(&mut *tx)
            .await?
        } else {
            sqlx::query(
                "UPDATE embedding_queue SET status = 'failed', error_message = ?, processed_at = ? \
                 WHERE batch_job_id = ? AND status IN ('batched', 'processing')",
            )
            .bind(error)
            .bind(now)
            .bind(job_id)
            .execute(&mut *tx)
            .await?
        };
        tx.commit().await?;

        tracing::warn!(
            job_id = %job_id,
            transient,
            items = items.rows_affected(),
            error = %error,
            "batch job failed"
        );
        Ok(())
    }

    /// Fail jobs a previous process left mid-preparation, requeueing their items.
    pub async fn recover_stalled(&self) -> Result<usize> {
        let stalled = self.jobs_in(&[BatchJobStatus::Preparing]).await?;
        for job in &stalled {
            self.fail_job(&job.id, "interrupted during preparation", true)
                .await?;
        }
        Ok(stalled.len())
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<EmbeddingBatchJob>> {
        let row = sqlx::query("SELECT * FROM embedding_batch_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(EmbeddingBatchJob::from_row).transpose()
    }

    async fn jobs_in(&self, statuses: &[BatchJobStatus]) -> Result<Vec<EmbeddingBatchJob>> {
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT * FROM embedding_batch_jobs WHERE status IN ({}) ORDER BY created_at, id",
            placeholders
        );
        let mut query = sqlx::query(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        query
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(EmbeddingBatchJob::from_row)
            .collect()
    }

    /// Conditional status change guarded by the job state machine.
    async fn transition(
        &self,
        job_id: &str,
        from: BatchJobStatus,
        to: BatchJobStatus,
    ) -> Result<bool> {
        if !from.can_transition_to(to) {
            bail!("illegal batch job transition {} -> {}", from, to);
        }
        let result = sqlx::query("UPDATE embedding_batch_jobs SET status = ? WHERE id = ? AND status = ?")
            .bind(to.as_str())
            .bind(job_id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Resolve an item whose document has no text: it has no embeddings
    /// under this model, and nothing is sent to the provider.
    async fn complete_empty_item(&self, item_id: &str, document_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM embeddings WHERE document_id = ? AND model_name = ?")
            .bind(document_id)
            .bind(self.provider.model_name())
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE embedding_queue SET status = 'completed', processed_at = ? WHERE id = ?",
        )
        .bind(now_millis())
        .bind(item_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        tracing::debug!(item_id = %item_id, document_id = %document_id, "blank document, nothing to embed");
        Ok(())
    }

    async fn fail_item(&self, item_id: &str, message: &str) -> Result<()> {
        tracing::warn!(item_id = %item_id, error = %message, "embedding item skipped");
        sqlx::query(
            "UPDATE embedding_queue SET status = 'failed', error_message = ?, processed_at = ? WHERE id = ?",
        )
        .bind(message)
        .bind(now_millis())
        .bind(item_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Run [`BatchOrchestrator::tick`] every `interval` until `shutdown` flips to true.
pub async fn run_batch_loop(
    orchestrator: BatchOrchestrator,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    match orchestrator.recover_stalled().await {
        Ok(0) => {}
        Ok(n) => tracing::warn!(jobs = n, "requeued interrupted batch jobs"),
        Err(e) => tracing::error!(error = %e, "batch recovery failed"),
    }

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = orchestrator.tick().await {
                    tracing::error!(error = %e, "batch tick failed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!("batch orchestrator stopped");
}

fn split_record_id(record_id: &str) -> Option<(String, i64)> {
    let (doc, idx) = record_id.rsplit_once(':')?;
    Some((doc.to_string(), idx.parse().ok()?))
}

fn write_jsonl_line<T: Serialize>(buf: &mut Vec<u8>, record: &T) -> Result<()> {
    serde_json::to_writer(&mut *buf, record)?;
    buf.push(b'\n');
    Ok(())
}

fn parse_jsonl<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<Vec<T>> {
    let text = std::str::from_utf8(bytes)?;
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| Ok(serde_json::from_str(l)?))
        .collect()
}

async fn write_object(store: &DynStore, path: &str, bytes: Vec<u8>) -> Result<()> {
    store
        .put(&ObjPath::from(path), PutPayload::from(bytes))
        .await
        .with_context(|| format!("Failed to write {}", path))?;
    Ok(())
}

async fn read_object(store: &DynStore, path: &str) -> Result<Bytes> {
    let result = store
        .get(&ObjPath::from(path))
        .await
        .with_context(|| format!("Failed to read {}", path))?;
    Ok(result.bytes().await?)
}
