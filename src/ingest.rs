//! Ingestion API core.
//!
//! [`IngestionService`] owns the source registry, the sync-run lifecycle and
//! event acceptance. It is the in-process [`IngestionClient`]: connectors
//! hosted by this process talk to it directly, remote connectors reach the
//! same methods through the `/sdk/*` routes in [`crate::server`].
//!
//! # Sync lifecycle
//!
//! ```text
//! /sync ──▶ begin_run ──▶ running ──complete_run──▶ completed
//!   │           │            └──────fail_run──────▶ failed | cancelled
//!   │           └─ 409 while another run of the source is active
//!   └─ 404 for unknown sources
//! ```
//!
//! At most one run per source is active. The in-memory
//! [`ActiveSyncRegistry`] answers the common case; the partial unique index
//! on `sync_runs` catches races and runs owned by another process.
//!
//! Every emit, progress report and checkpoint bumps `last_activity_at`.
//! [`IngestionService::recover_stale_runs`] fails runs that have been silent
//! longer than a timeout, so a crashed process never blocks its sources for
//! good while a live run elsewhere is left alone.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::client::{CompleteRequest, FailRequest, IngestionClient, ProgressRequest, Receipt};
use crate::config::Config;
use crate::content::ContentStore;
use crate::db::now_millis;
use crate::error::{IngestError, SyncError};
use crate::models::{map_to_string, EventEnvelope, JsonMap, Source, SyncRun, SyncStatus};
use crate::queue::EventQueue;
use crate::schema::validate_config;
use crate::sync_context::{CancellationToken, SyncContext};
use crate::traits::{ActionResponse, ConnectorRegistry, Manifest};

// ═══════════════════════════════════════════════════════════════════════
// Active sync registry
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct ActiveSync {
    sync_run_id: String,
    token: CancellationToken,
}

/// Running syncs keyed by source id, bounded by `server.max_active_syncs`.
#[derive(Debug)]
pub struct ActiveSyncRegistry {
    capacity: usize,
    inner: Mutex<HashMap<String, ActiveSync>>,
}

impl ActiveSyncRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ActiveSync>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a run for `source_id` and hand out its cancellation token.
    pub fn try_insert(
        &self,
        source_id: &str,
        sync_run_id: &str,
    ) -> Result<CancellationToken, IngestError> {
        let mut active = self.lock();
        if let Some(existing) = active.get(source_id) {
            return Err(IngestError::Conflict(format!(
                "source {} already has an active sync {}",
                source_id, existing.sync_run_id
            )));
        }
        if active.values().any(|a| a.sync_run_id == sync_run_id) {
            return Err(IngestError::Conflict(format!(
                "sync run {} is already active",
                sync_run_id
            )));
        }
        if active.len() >= self.capacity {
            return Err(IngestError::Conflict(format!(
                "too many active syncs (limit {})",
                self.capacity
            )));
        }
        let token = CancellationToken::new();
        active.insert(
            source_id.to_string(),
            ActiveSync {
                sync_run_id: sync_run_id.to_string(),
                token: token.clone(),
            },
        );
        Ok(token)
    }

    /// Drop the entry for a run. Returns false if it was not registered.
    pub fn remove_run(&self, sync_run_id: &str) -> bool {
        let mut active = self.lock();
        let before = active.len();
        active.retain(|_, a| a.sync_run_id != sync_run_id);
        active.len() != before
    }

    /// Signal cancellation to a running sync.
    pub fn cancel(&self, sync_run_id: &str) -> bool {
        match self.lock().values().find(|a| a.sync_run_id == sync_run_id) {
            Some(a) => {
                a.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_cancelled(&self, sync_run_id: &str) -> bool {
        self.lock()
            .values()
            .any(|a| a.sync_run_id == sync_run_id && a.token.is_cancelled())
    }

    pub fn active_run(&self, source_id: &str) -> Option<String> {
        self.lock().get(source_id).map(|a| a.sync_run_id.clone())
    }

    pub fn run_ids(&self) -> Vec<String> {
        self.lock().values().map(|a| a.sync_run_id.clone()).collect()
    }

    /// True when no further run would be admitted.
    pub fn is_full(&self) -> bool {
        self.lock().len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Requests & responses
// ═══════════════════════════════════════════════════════════════════════

/// Body of `POST /action`. The connector is named directly or through a
/// registered source, whose credentials are used when none are given.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionRequest {
    pub action: String,
    #[serde(default)]
    pub params: JsonMap,
    #[serde(default)]
    pub credentials: JsonMap,
    #[serde(default)]
    pub connector_type: Option<String>,
    #[serde(default)]
    pub source_id: Option<String>,
}

/// Aggregate manifest of everything this service can sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceManifest {
    pub name: String,
    pub version: String,
    pub sync_modes: Vec<String>,
    pub actions: Vec<String>,
    pub connectors: Vec<Manifest>,
}

// ═══════════════════════════════════════════════════════════════════════
// Service
// ═══════════════════════════════════════════════════════════════════════

pub struct IngestionService {
    pool: SqlitePool,
    content: ContentStore,
    queue: EventQueue,
    connectors: Arc<ConnectorRegistry>,
    active: ActiveSyncRegistry,
    checkpoint_every: u64,
}

impl IngestionService {
    pub fn new(
        pool: SqlitePool,
        content: ContentStore,
        connectors: Arc<ConnectorRegistry>,
        max_retries: i64,
        max_active_syncs: usize,
        checkpoint_every: u64,
    ) -> Self {
        Self {
            queue: EventQueue::new(pool.clone(), max_retries),
            pool,
            content,
            connectors,
            active: ActiveSyncRegistry::new(max_active_syncs),
            checkpoint_every,
        }
    }

    pub fn from_config(
        pool: SqlitePool,
        config: &Config,
        connectors: Arc<ConnectorRegistry>,
    ) -> anyhow::Result<Self> {
        let content = ContentStore::from_config(pool.clone(), &config.content)
            .context("Failed to open content store")?;
        Ok(Self::new(
            pool,
            content,
            connectors,
            config.queue.max_retries,
            config.server.max_active_syncs,
            config.sync.checkpoint_every,
        ))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    pub fn connectors(&self) -> &ConnectorRegistry {
        &self.connectors
    }

    pub fn active(&self) -> &ActiveSyncRegistry {
        &self.active
    }

    // ── Sources ──────────────────────────────────────────────────────────

    /// Create or replace a source. Its config is validated against the
    /// connector's schema and stored with defaults filled in.
    pub async fn register_source(
        &self,
        id: &str,
        name: &str,
        connector_type: &str,
        config: JsonMap,
        credentials: JsonMap,
    ) -> Result<Source, IngestError> {
        let connector = self.connectors.find(connector_type).ok_or_else(|| {
            IngestError::BadRequest(format!("unknown connector type: {}", connector_type))
        })?;
        let config = validate_config(&connector.config_schema(), &config).map_err(|e| {
            IngestError::BadRequest(format!("invalid config for source {}: {}", id, e))
        })?;

        let now = now_millis();
        sqlx::query(
            r#"
            INSERT INTO sources (id, name, connector_type, config_json, credentials_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                connector_type = excluded.connector_type,
                config_json = excluded.config_json,
                credentials_json = excluded.credentials_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(connector_type)
        .bind(map_to_string(&config))
        .bind(map_to_string(&credentials))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        tracing::info!(source_id = %id, connector = %connector_type, "source registered");
        self.get_source(id)
            .await?
            .ok_or_else(|| IngestError::NotFound(format!("source {}", id)))
    }

    pub async fn get_source(&self, id: &str) -> Result<Option<Source>, IngestError> {
        let row = sqlx::query("SELECT * FROM sources WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(Source::from_row).transpose()?)
    }

    pub async fn list_sources(&self) -> Result<Vec<Source>, IngestError> {
        let rows = sqlx::query("SELECT * FROM sources ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(Source::from_row)
            .collect::<anyhow::Result<Vec<_>>>()?)
    }

    /// Register every `[sources.*]` entry of the config file.
    pub async fn sync_sources_from_config(&self, config: &Config) -> anyhow::Result<usize> {
        for (id, source) in &config.sources {
            let settings = object(&source.config)
                .with_context(|| format!("sources.{}.config must be a table", id))?;
            let credentials = object(&source.credentials)
                .with_context(|| format!("sources.{}.credentials must be a table", id))?;
            self.register_source(
                id,
                source.name.as_deref().unwrap_or(id),
                &source.connector,
                settings,
                credentials,
            )
            .await?;
            self.set_sync_interval(id, source.sync_interval_secs).await?;
        }
        Ok(config.sources.len())
    }

    /// Schedule a source every `interval_secs`, or unschedule it with `None`.
    pub async fn set_sync_interval(
        &self,
        source_id: &str,
        interval_secs: Option<u64>,
    ) -> Result<(), IngestError> {
        let updated = sqlx::query(
            "UPDATE sources SET sync_interval_secs = ?, updated_at = ? WHERE id = ?",
        )
        .bind(interval_secs.map(|s| s as i64))
        .bind(now_millis())
        .bind(source_id)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(IngestError::NotFound(format!("source {}", source_id)));
        }
        Ok(())
    }

    // ── Runs ─────────────────────────────────────────────────────────────

    /// Record a new running sync for `source_id`. Returns the source and
    /// the run's cancellation token.
    pub async fn begin_run(
        &self,
        sync_run_id: &str,
        source_id: &str,
    ) -> Result<(Source, CancellationToken), IngestError> {
        let source = self
            .get_source(source_id)
            .await?
            .ok_or_else(|| IngestError::NotFound(format!("source {}", source_id)))?;

        let token = self.active.try_insert(source_id, sync_run_id)?;

        let now = now_millis();
        let inserted = sqlx::query(
            "INSERT INTO sync_runs (id, source_id, status, started_at, last_activity_at) \
             VALUES (?, ?, 'running', ?, ?)",
        )
        .bind(sync_run_id)
        .bind(source_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        if let Err(e) = inserted {
            self.active.remove_run(sync_run_id);
            return Err(match e {
                sqlx::Error::Database(db) if db.is_unique_violation() => IngestError::Conflict(
                    format!("sync run {} conflicts with an existing run", sync_run_id),
                ),
                other => other.into(),
            });
        }

        tracing::info!(sync_run_id = %sync_run_id, source_id = %source_id, "sync started");
        Ok((source, token))
    }

    /// Accept a sync request and run the source's connector on its own task.
    ///
    /// The returned handle resolves after the run reached a terminal state.
    pub async fn start_sync(
        self: &Arc<Self>,
        sync_run_id: &str,
        source_id: &str,
    ) -> Result<JoinHandle<()>, IngestError> {
        let (source, token) = self.begin_run(sync_run_id, source_id).await?;

        let service = Arc::clone(self);
        let sync_run_id = sync_run_id.to_string();
        Ok(tokio::spawn(async move {
            let client: Arc<dyn IngestionClient> = service.clone();
            let mut ctx = SyncContext::new(sync_run_id.clone(), source.id.clone(), client, token)
                .with_checkpoint_every(service.checkpoint_every);

            let result = service.run_connector(source, &mut ctx).await;
            let result = match result {
                Ok(_) if ctx.is_cancelled() => Err(SyncError::Cancelled),
                other => other,
            };

            let terminal = match result {
                Ok(state) => {
                    tracing::info!(
                        sync_run_id = %sync_run_id,
                        scanned = ctx.documents_scanned(),
                        emitted = ctx.documents_emitted(),
                        skipped = ctx.documents_skipped(),
                        "sync completed"
                    );
                    ctx.complete(state).await
                }
                Err(e) => {
                    tracing::warn!(sync_run_id = %sync_run_id, error = %e, "sync ended with error");
                    ctx.fail(&e).await
                }
            };
            if let Err(e) = terminal {
                tracing::error!(sync_run_id = %sync_run_id, error = %e, "failed to record sync result");
            }
            service.active.remove_run(&sync_run_id);
        }))
    }

    async fn run_connector(
        &self,
        mut source: Source,
        ctx: &mut SyncContext,
    ) -> Result<Option<JsonMap>, SyncError> {
        let connector = self.connectors.find(&source.connector_type).ok_or_else(|| {
            SyncError::Configuration(format!("unknown connector type: {}", source.connector_type))
        })?;
        source.config = validate_config(&connector.config_schema(), &source.config)
            .map_err(|e| SyncError::Configuration(e.to_string()))?;
        let state = source.sync_state.clone();
        connector.sync(&source, state, ctx).await
    }

    /// Request cooperative cancellation. False if the run is not active.
    pub fn cancel_sync(&self, sync_run_id: &str) -> bool {
        let found = self.active.cancel(sync_run_id);
        if found {
            tracing::info!(sync_run_id = %sync_run_id, "cancellation requested");
        }
        found
    }

    pub async fn get_run(&self, sync_run_id: &str) -> Result<Option<SyncRun>, IngestError> {
        let row = sqlx::query("SELECT * FROM sync_runs WHERE id = ?")
            .bind(sync_run_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(SyncRun::from_row).transpose()?)
    }

    /// Fail running syncs with no activity for `timeout`, whichever process
    /// owns them. Returns the ids of the runs that timed out.
    pub async fn recover_stale_runs(&self, timeout: Duration) -> Result<Vec<String>, IngestError> {
        let now = now_millis();
        let cutoff = now - timeout.as_millis() as i64;
        let timed_out: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE sync_runs
            SET status = 'failed', error_message = ?, completed_at = ?
            WHERE status = 'running' AND COALESCE(last_activity_at, started_at) < ?
            RETURNING id
            "#,
        )
        .bind(format!("timed out: no activity for {}s", timeout.as_secs()))
        .bind(now)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        for id in &timed_out {
            tracing::warn!(sync_run_id = %id, "sync run timed out");
        }
        self.reconcile_active().await?;
        Ok(timed_out)
    }

    /// Drop registry entries whose run row is no longer running, cancelling
    /// the connector task still attached to it.
    pub async fn reconcile_active(&self) -> Result<usize, IngestError> {
        let mut dropped = 0;
        for id in self.active.run_ids() {
            let status: Option<String> =
                sqlx::query_scalar("SELECT status FROM sync_runs WHERE id = ?")
                    .bind(&id)
                    .fetch_optional(&self.pool)
                    .await?;
            // A missing row belongs to a begin_run still in flight.
            match status {
                Some(status) if status != SyncStatus::Running.as_str() => {
                    self.active.cancel(&id);
                    if self.active.remove_run(&id) {
                        dropped += 1;
                    }
                }
                _ => {}
            }
        }
        Ok(dropped)
    }

    /// Record activity on a running sync.
    async fn touch_run(&self, sync_run_id: &str) -> Result<(), IngestError> {
        sqlx::query("UPDATE sync_runs SET last_activity_at = ? WHERE id = ? AND status = 'running'")
            .bind(now_millis())
            .bind(sync_run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Fails with NotFound, Conflict or BadRequest unless `sync_run_id` is
    /// running (and belongs to `source_id` when given).
    async fn require_running(
        &self,
        sync_run_id: &str,
        source_id: Option<&str>,
    ) -> Result<(), IngestError> {
        let row = sqlx::query("SELECT source_id, status FROM sync_runs WHERE id = ?")
            .bind(sync_run_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| IngestError::NotFound(format!("sync run {}", sync_run_id)))?;

        let status: String = row.try_get("status")?;
        if status != SyncStatus::Running.as_str() {
            return Err(IngestError::Conflict(format!(
                "sync run {} is {}",
                sync_run_id, status
            )));
        }
        let owner: String = row.try_get("source_id")?;
        match source_id {
            Some(s) if s != owner => Err(IngestError::BadRequest(format!(
                "sync run {} belongs to source {}",
                sync_run_id, owner
            ))),
            _ => Ok(()),
        }
    }

    // ── Actions & manifest ───────────────────────────────────────────────

    pub async fn execute_action(&self, request: ActionRequest) -> Result<ActionResponse, IngestError> {
        let mut credentials = request.credentials;
        let connector_type = match (&request.connector_type, &request.source_id) {
            (Some(t), _) => t.clone(),
            (None, Some(source_id)) => {
                let source = self
                    .get_source(source_id)
                    .await?
                    .ok_or_else(|| IngestError::NotFound(format!("source {}", source_id)))?;
                if credentials.is_empty() {
                    credentials = source.credentials;
                }
                source.connector_type
            }
            (None, None) if self.connectors.len() == 1 => self.connectors.connectors()[0]
                .connector_type()
                .to_string(),
            (None, None) => {
                return Err(IngestError::BadRequest(
                    "connector_type or source_id is required".into(),
                ))
            }
        };

        let connector = self
            .connectors
            .find(&connector_type)
            .ok_or_else(|| IngestError::NotFound(format!("connector {}", connector_type)))?;
        tracing::debug!(connector = %connector_type, action = %request.action, "executing action");
        Ok(connector
            .execute_action(&request.action, request.params, credentials)
            .await)
    }

    pub fn manifest(&self) -> ServiceManifest {
        let connectors: Vec<Manifest> = self
            .connectors
            .connectors()
            .iter()
            .map(|c| c.manifest())
            .collect();
        let sync_modes: BTreeSet<String> = connectors
            .iter()
            .flat_map(|m| m.sync_modes.iter().cloned())
            .collect();
        let actions: BTreeSet<String> = connectors
            .iter()
            .flat_map(|m| m.actions.iter().cloned())
            .collect();
        ServiceManifest {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            sync_modes: sync_modes.into_iter().collect(),
            actions: actions.into_iter().collect(),
            connectors,
        }
    }

    fn receipt(&self, sync_run_id: &str, event_id: Option<String>) -> Receipt {
        Receipt {
            event_id,
            cancelled: self.active.is_cancelled(sync_run_id),
        }
    }

    /// Write the run's checkpoint and carry it over to its source.
    async fn persist_state(
        &self,
        tx: &mut sqlx::SqliteConnection,
        source_id: &str,
        state: &JsonMap,
    ) -> Result<(), IngestError> {
        sqlx::query("UPDATE sources SET sync_state = ?, updated_at = ? WHERE id = ?")
            .bind(map_to_string(state))
            .bind(now_millis())
            .bind(source_id)
            .execute(&mut *tx)
            .await?;
        Ok(())
    }

    /// Map a conditional run update that touched nothing to the right error.
    async fn terminal_miss(&self, sync_run_id: &str) -> IngestError {
        match self.require_running(sync_run_id, None).await {
            Err(e) => e,
            Ok(()) => IngestError::Conflict(format!("sync run {} changed concurrently", sync_run_id)),
        }
    }
}

#[async_trait::async_trait]
impl IngestionClient for IngestionService {
    async fn store_content(
        &self,
        sync_run_id: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String, IngestError> {
        self.require_running(sync_run_id, None).await?;
        let content_id = self.content.save(bytes, content_type).await?;
        self.touch_run(sync_run_id).await?;
        Ok(content_id)
    }

    async fn emit_event(&self, event: &EventEnvelope) -> Result<Receipt, IngestError> {
        self.require_running(&event.sync_run_id, Some(&event.source_id))
            .await?;
        let event_id = self.queue.enqueue(event).await?;
        self.touch_run(&event.sync_run_id).await?;
        Ok(self.receipt(&event.sync_run_id, Some(event_id)))
    }

    async fn report_progress(
        &self,
        sync_run_id: &str,
        progress: &ProgressRequest,
    ) -> Result<Receipt, IngestError> {
        let updated = sqlx::query(
            "UPDATE sync_runs SET documents_scanned = ?, documents_emitted = ?, last_activity_at = ? \
             WHERE id = ? AND status = 'running'",
        )
        .bind(progress.documents_scanned as i64)
        .bind(progress.documents_emitted as i64)
        .bind(now_millis())
        .bind(sync_run_id)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(self.terminal_miss(sync_run_id).await);
        }
        Ok(self.receipt(sync_run_id, None))
    }

    async fn save_state(&self, sync_run_id: &str, state: &JsonMap) -> Result<(), IngestError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "UPDATE sync_runs SET checkpoint_state = ?, last_activity_at = ? \
             WHERE id = ? AND status = 'running' RETURNING source_id",
        )
        .bind(map_to_string(state))
        .bind(now_millis())
        .bind(sync_run_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            drop(tx);
            return Err(self.terminal_miss(sync_run_id).await);
        };
        let source_id: String = row.try_get("source_id")?;
        self.persist_state(&mut tx, &source_id, state).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn complete_run(
        &self,
        sync_run_id: &str,
        request: &CompleteRequest,
    ) -> Result<(), IngestError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            UPDATE sync_runs
            SET status = 'completed', documents_scanned = ?, documents_emitted = ?,
                checkpoint_state = COALESCE(?, checkpoint_state), completed_at = ?
            WHERE id = ? AND status = 'running'
            RETURNING source_id
            "#,
        )
        .bind(request.documents_scanned as i64)
        .bind(request.documents_emitted as i64)
        .bind(request.final_state.as_ref().map(map_to_string))
        .bind(now_millis())
        .bind(sync_run_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            drop(tx);
            return Err(self.terminal_miss(sync_run_id).await);
        };
        let source_id: String = row.try_get("source_id")?;
        if let Some(state) = &request.final_state {
            self.persist_state(&mut tx, &source_id, state).await?;
        }
        tx.commit().await?;

        self.active.remove_run(sync_run_id);
        tracing::debug!(sync_run_id = %sync_run_id, source_id = %source_id, "run completed");
        Ok(())
    }

    async fn fail_run(&self, sync_run_id: &str, request: &FailRequest) -> Result<(), IngestError> {
        let status = if request.cancelled {
            SyncStatus::Cancelled
        } else {
            SyncStatus::Failed
        };
        let updated = sqlx::query(
            r#"
            UPDATE sync_runs
            SET status = ?, error_message = ?, documents_scanned = ?, documents_emitted = ?,
                completed_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(status.as_str())
        .bind(&request.error)
        .bind(request.documents_scanned as i64)
        .bind(request.documents_emitted as i64)
        .bind(now_millis())
        .bind(sync_run_id)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(self.terminal_miss(sync_run_id).await);
        }

        self.active.remove_run(sync_run_id);
        tracing::debug!(sync_run_id = %sync_run_id, status = %status, "run ended");
        Ok(())
    }
}

fn object(value: &Value) -> anyhow::Result<JsonMap> {
    match value {
        Value::Object(map) => Ok(map.clone()),
        Value::Null => Ok(JsonMap::new()),
        other => anyhow::bail!("expected a table, got {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::memory_store;
    use crate::models::DocumentDraft;
    use crate::traits::Connector;
    use async_trait::async_trait;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    /// Emits `count` documents, honouring cancellation between emits.
    struct Counter {
        count: usize,
    }

    #[async_trait]
    impl Connector for Counter {
        fn connector_type(&self) -> &str {
            "counter"
        }
        fn description(&self) -> &str {
            "emits numbered documents"
        }
        fn config_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "prefix": { "type": "string", "default": "doc" } },
                "additionalProperties": false
            })
        }
        async fn sync(
            &self,
            source: &Source,
            _state: Option<JsonMap>,
            ctx: &mut SyncContext,
        ) -> Result<Option<JsonMap>, SyncError> {
            let prefix = source.config["prefix"].as_str().unwrap_or("doc").to_string();
            for i in 0..self.count {
                if ctx.is_cancelled() {
                    return Err(SyncError::Cancelled);
                }
                ctx.emit(DocumentDraft::new(format!("{}-{}", prefix, i), format!("body {}", i)))
                    .await?;
            }
            let mut state = JsonMap::new();
            state.insert("seen".into(), json!(self.count));
            Ok(Some(state))
        }
    }

    async fn service(count: usize) -> Arc<IngestionService> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::apply(&pool).await.unwrap();
        let mut connectors = ConnectorRegistry::new();
        connectors.register(Arc::new(Counter { count }));
        let content = ContentStore::new(pool.clone(), Some(memory_store()), 1024, true);
        let service = IngestionService::new(pool, content, Arc::new(connectors), 3, 4, 2);
        service
            .register_source("s1", "Source one", "counter", JsonMap::new(), JsonMap::new())
            .await
            .unwrap();
        Arc::new(service)
    }

    async fn backdate(svc: &IngestionService, sync_run_id: &str) {
        sqlx::query("UPDATE sync_runs SET last_activity_at = 0 WHERE id = ?")
            .bind(sync_run_id)
            .execute(svc.pool())
            .await
            .unwrap();
    }

    async fn last_activity(svc: &IngestionService, sync_run_id: &str) -> i64 {
        let run = svc.get_run(sync_run_id).await.unwrap().unwrap();
        run.last_activity_at.unwrap()
    }

    #[tokio::test]
    async fn register_source_validates_and_fills_defaults() {
        let svc = service(0).await;
        let source = svc.get_source("s1").await.unwrap().unwrap();
        assert_eq!(source.config["prefix"], "doc");

        let mut bad = JsonMap::new();
        bad.insert("nope".into(), json!(1));
        let err = svc
            .register_source("s2", "two", "counter", bad, JsonMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::BadRequest(_)));

        let err = svc
            .register_source("s3", "three", "missing", JsonMap::new(), JsonMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::BadRequest(_)));
    }

    #[tokio::test]
    async fn sync_run_completes_and_saves_checkpoint() {
        let svc = service(3).await;
        let handle = svc.start_sync("run-1", "s1").await.unwrap();
        handle.await.unwrap();

        let run = svc.get_run("run-1").await.unwrap().unwrap();
        assert_eq!(run.status, SyncStatus::Completed);
        assert_eq!(run.documents_emitted, 3);
        assert_eq!(svc.queue().stats().await.unwrap().pending, 3);

        let source = svc.get_source("s1").await.unwrap().unwrap();
        assert_eq!(source.sync_state.unwrap()["seen"], 3);
        assert!(svc.active().is_empty());
    }

    #[tokio::test]
    async fn second_sync_for_same_source_conflicts() {
        let svc = service(0).await;
        svc.begin_run("run-1", "s1").await.unwrap();

        let err = svc.begin_run("run-2", "s1").await.unwrap_err();
        assert!(matches!(err, IngestError::Conflict(_)));

        let err = svc.begin_run("run-3", "ghost").await.unwrap_err();
        assert!(matches!(err, IngestError::NotFound(_)));
    }

    #[tokio::test]
    async fn leftover_running_row_blocks_until_it_times_out() {
        let svc = service(0).await;
        let recent = now_millis();
        sqlx::query(
            "INSERT INTO sync_runs (id, source_id, status, started_at, last_activity_at) \
             VALUES ('old', 's1', 'running', 0, ?)",
        )
        .bind(recent)
        .execute(svc.pool())
        .await
        .unwrap();

        let err = svc.begin_run("run-1", "s1").await.unwrap_err();
        assert!(matches!(err, IngestError::Conflict(_)));
        assert!(svc.active().is_empty(), "registry entry rolled back");

        // Recent activity keeps the row alive despite its old start time.
        let timeout = Duration::from_secs(60);
        assert!(svc.recover_stale_runs(timeout).await.unwrap().is_empty());

        backdate(&svc, "old").await;
        assert_eq!(svc.recover_stale_runs(timeout).await.unwrap(), vec!["old"]);
        let old = svc.get_run("old").await.unwrap().unwrap();
        assert_eq!(old.status, SyncStatus::Failed);
        assert!(old.error_message.unwrap().contains("timed out"));

        svc.begin_run("run-1", "s1").await.unwrap();
    }

    #[tokio::test]
    async fn emits_progress_and_checkpoints_record_activity() {
        let svc = service(0).await;
        svc.begin_run("run-1", "s1").await.unwrap();
        backdate(&svc, "run-1").await;
        svc.emit_event(&EventEnvelope {
            event_type: crate::models::EventType::Deleted,
            sync_run_id: "run-1".into(),
            source_id: "s1".into(),
            document_id: "d".into(),
            content_id: None,
            title: None,
            metadata: None,
            permissions: None,
            attributes: None,
        })
        .await
        .unwrap();
        assert!(last_activity(&svc, "run-1").await > 0);

        backdate(&svc, "run-1").await;
        svc.report_progress(
            "run-1",
            &ProgressRequest {
                documents_scanned: 1,
                documents_emitted: 1,
            },
        )
        .await
        .unwrap();
        assert!(last_activity(&svc, "run-1").await > 0);

        backdate(&svc, "run-1").await;
        svc.save_state("run-1", &JsonMap::new()).await.unwrap();
        assert!(last_activity(&svc, "run-1").await > 0);

        assert!(svc
            .recover_stale_runs(Duration::from_secs(60))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn timed_out_run_leaves_the_registry() {
        let svc = service(0).await;
        svc.begin_run("run-1", "s1").await.unwrap();
        backdate(&svc, "run-1").await;

        assert_eq!(
            svc.recover_stale_runs(Duration::from_secs(60)).await.unwrap(),
            vec!["run-1"]
        );
        assert!(svc.active().is_empty());
        svc.begin_run("run-2", "s1").await.unwrap();
    }

    #[tokio::test]
    async fn events_for_finished_or_foreign_runs_are_rejected() {
        let svc = service(0).await;
        svc.begin_run("run-1", "s1").await.unwrap();

        let event = EventEnvelope {
            event_type: crate::models::EventType::Deleted,
            sync_run_id: "run-1".into(),
            source_id: "other".into(),
            document_id: "d".into(),
            content_id: None,
            title: None,
            metadata: None,
            permissions: None,
            attributes: None,
        };
        assert!(matches!(
            svc.emit_event(&event).await.unwrap_err(),
            IngestError::BadRequest(_)
        ));

        svc.complete_run(
            "run-1",
            &CompleteRequest {
                documents_scanned: 0,
                documents_emitted: 0,
                final_state: None,
            },
        )
        .await
        .unwrap();

        let event = EventEnvelope {
            source_id: "s1".into(),
            ..event
        };
        assert!(matches!(
            svc.emit_event(&event).await.unwrap_err(),
            IngestError::Conflict(_)
        ));
        assert!(matches!(
            svc.fail_run(
                "run-1",
                &FailRequest {
                    error: "late".into(),
                    cancelled: false,
                    documents_scanned: 0,
                    documents_emitted: 0,
                }
            )
            .await
            .unwrap_err(),
            IngestError::Conflict(_)
        ));
    }

    #[tokio::test]
    async fn cancel_reaches_receipts_and_records_cancelled() {
        let svc = service(0).await;
        svc.begin_run("run-1", "s1").await.unwrap();
        assert!(!svc.cancel_sync("nope"));
        assert!(svc.cancel_sync("run-1"));

        let receipt = svc
            .report_progress(
                "run-1",
                &ProgressRequest {
                    documents_scanned: 1,
                    documents_emitted: 0,
                },
            )
            .await
            .unwrap();
        assert!(receipt.cancelled);

        svc.fail_run(
            "run-1",
            &FailRequest {
                error: "cancelled".into(),
                cancelled: true,
                documents_scanned: 1,
                documents_emitted: 0,
            },
        )
        .await
        .unwrap();
        let run = svc.get_run("run-1").await.unwrap().unwrap();
        assert_eq!(run.status, SyncStatus::Cancelled);
        assert!(svc.active().is_empty());
    }

    #[tokio::test]
    async fn manifest_and_action_dispatch() {
        let svc = service(0).await;
        let manifest = svc.manifest();
        assert_eq!(manifest.connectors.len(), 1);
        assert_eq!(manifest.sync_modes, vec!["full", "incremental"]);

        let resp = svc
            .execute_action(ActionRequest {
                action: "frobnicate".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(resp.status, crate::traits::ActionStatus::NotSupported);

        let err = svc
            .execute_action(ActionRequest {
                action: "x".into(),
                connector_type: Some("missing".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::NotFound(_)));
    }

    #[test]
    fn registry_is_bounded() {
        let reg = ActiveSyncRegistry::new(1);
        reg.try_insert("a", "r1").unwrap();
        assert!(reg.try_insert("b", "r2").is_err());
        assert_eq!(reg.active_run("a").as_deref(), Some("r1"));
        assert!(reg.remove_run("r1"));
        assert!(!reg.remove_run("r1"));
        reg.try_insert("b", "r2").unwrap();
        assert_eq!(reg.len(), 1);
        assert!(reg.is_full());
        assert_eq!(reg.run_ids(), vec!["r2"]);
    }
}
