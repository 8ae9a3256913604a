//! Scheduled syncs.
//!
//! A source with `sync_interval_secs` set is due once that long has passed
//! since its last run started. Every tick first fails silent runs (see
//! [`IngestionService::recover_stale_runs`]), then starts due sources until
//! the active-sync limit is reached. Sources that are mid-sync are skipped;
//! the next tick picks up whatever did not fit.

use anyhow::Result;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use crate::db::now_millis;
use crate::error::IngestError;
use crate::ingest::IngestionService;

/// Outcome of one scheduler pass.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Run ids started this pass.
    pub started: Vec<String>,
    /// Run ids failed for inactivity.
    pub timed_out: Vec<String>,
}

/// Scheduled sources with no running sync whose interval has elapsed.
pub async fn due_sources(pool: &SqlitePool, now: i64) -> Result<Vec<String>> {
    let due = sqlx::query_scalar(
        r#"
        SELECT s.id FROM sources s
        WHERE s.sync_interval_secs IS NOT NULL
          AND NOT EXISTS (
              SELECT 1 FROM sync_runs r WHERE r.source_id = s.id AND r.status = 'running'
          )
          AND COALESCE(
              (SELECT MAX(r.started_at) FROM sync_runs r WHERE r.source_id = s.id), 0
          ) + s.sync_interval_secs * 1000 <= ?
        ORDER BY s.id
        "#,
    )
    .bind(now)
    .fetch_all(pool)
    .await?;
    Ok(due)
}

pub async fn tick(service: &Arc<IngestionService>, stale_timeout: Duration) -> Result<TickReport> {
    let mut report = TickReport {
        timed_out: service.recover_stale_runs(stale_timeout).await?,
        ..Default::default()
    };

    for source_id in due_sources(service.pool(), now_millis()).await? {
        if let Some(run) = service.active().active_run(&source_id) {
            tracing::debug!(source_id = %source_id, sync_run_id = %run, "already syncing, skipping");
            continue;
        }
        if service.active().is_full() {
            tracing::debug!("active sync limit reached, deferring to next tick");
            break;
        }

        let sync_run_id = Uuid::new_v4().to_string();
        match service.start_sync(&sync_run_id, &source_id).await {
            Ok(_detached) => {
                tracing::info!(source_id = %source_id, sync_run_id = %sync_run_id, "scheduled sync started");
                report.started.push(sync_run_id);
            }
            Err(IngestError::Conflict(reason)) => {
                tracing::debug!(source_id = %source_id, %reason, "scheduled sync not started");
            }
            Err(e) => {
                tracing::warn!(source_id = %source_id, error = %e, "failed to start scheduled sync");
            }
        }
    }
    Ok(report)
}

/// Run [`tick`] every `interval` until `shutdown` flips to true.
pub async fn run_scheduler(
    service: Arc<IngestionService>,
    interval: Duration,
    stale_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match tick(&service, stale_timeout).await {
                    Ok(report) if !report.started.is_empty() || !report.timed_out.is_empty() => {
                        tracing::info!(
                            started = report.started.len(),
                            timed_out = report.timed_out.len(),
                            "scheduler pass"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "scheduler pass failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!("scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{memory_store, ContentStore};
    use crate::error::SyncError;
    use crate::models::{JsonMap, Source, SyncStatus};
    use crate::sync_context::SyncContext;
    use crate::traits::{Connector, ConnectorRegistry};
    use async_trait::async_trait;
    use sqlx::sqlite::SqlitePoolOptions;

    /// Holds its run open until cancelled.
    struct Parked;

    #[async_trait]
    impl Connector for Parked {
        fn connector_type(&self) -> &str {
            "parked"
        }
        fn description(&self) -> &str {
            "waits for cancellation"
        }
        async fn sync(
            &self,
            _source: &Source,
            _state: Option<JsonMap>,
            ctx: &mut SyncContext,
        ) -> Result<Option<JsonMap>, SyncError> {
            while !ctx.is_cancelled() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(SyncError::Cancelled)
        }
    }

    async fn service(max_active: usize, scheduled: &[(&str, Option<u64>)]) -> Arc<IngestionService> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::apply(&pool).await.unwrap();
        let mut connectors = ConnectorRegistry::new();
        connectors.register(Arc::new(Parked));
        let content = ContentStore::new(pool.clone(), Some(memory_store()), 1024, true);
        let svc = IngestionService::new(pool, content, Arc::new(connectors), 3, max_active, 10);
        for (id, interval) in scheduled {
            svc.register_source(id, id, "parked", JsonMap::new(), JsonMap::new())
                .await
                .unwrap();
            svc.set_sync_interval(id, *interval).await.unwrap();
        }
        Arc::new(svc)
    }

    async fn insert_run(svc: &IngestionService, id: &str, source_id: &str, started_at: i64) {
        sqlx::query(
            "INSERT INTO sync_runs (id, source_id, status, started_at, last_activity_at, completed_at) \
             VALUES (?, ?, 'completed', ?, ?, ?)",
        )
        .bind(id)
        .bind(source_id)
        .bind(started_at)
        .bind(started_at)
        .bind(started_at)
        .execute(svc.pool())
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn due_sources_follow_interval_since_last_start() {
        let sources = [
            ("fresh", Some(3600)),
            ("manual", None),
            ("old", Some(3600)),
            ("never", Some(60)),
        ];
        let svc = service(4, &sources).await;
        let now = now_millis();
        insert_run(&svc, "r-fresh", "fresh", now - 1_000).await;
        insert_run(&svc, "r-old", "old", now - 3_601_000).await;
        insert_run(&svc, "r-manual", "manual", 0).await;

        let due = due_sources(svc.pool(), now).await.unwrap();
        assert_eq!(due, vec!["never", "old"]);
    }

    #[tokio::test]
    async fn scheduled_source_is_not_started_twice() {
        let svc = service(4, &[("hourly", Some(3600)), ("manual", None)]).await;

        let first = tick(&svc, Duration::from_secs(60)).await.unwrap();
        assert_eq!(first.started.len(), 1);
        assert_eq!(svc.active().active_run("hourly"), Some(first.started[0].clone()));
        assert!(svc.active().active_run("manual").is_none());

        let second = tick(&svc, Duration::from_secs(60)).await.unwrap();
        assert!(second.started.is_empty());
        assert!(second.timed_out.is_empty());
    }

    #[tokio::test]
    async fn active_sync_limit_defers_remaining_sources() {
        let svc = service(1, &[("a", Some(60)), ("b", Some(60))]).await;

        let report = tick(&svc, Duration::from_secs(60)).await.unwrap();
        assert_eq!(report.started.len(), 1);
        assert!(svc.active().active_run("a").is_some());
        assert!(svc.active().active_run("b").is_none());
    }

    #[tokio::test]
    async fn silent_run_times_out_and_frees_its_source() {
        let svc = service(4, &[("hourly", Some(3600))]).await;
        let started = tick(&svc, Duration::from_secs(60)).await.unwrap().started;
        let run_id = started[0].clone();

        sqlx::query("UPDATE sync_runs SET last_activity_at = 0 WHERE id = ?")
            .bind(&run_id)
            .execute(svc.pool())
            .await
            .unwrap();

        let report = tick(&svc, Duration::from_secs(60)).await.unwrap();
        assert_eq!(report.timed_out, vec![run_id.clone()]);
        assert!(report.started.is_empty(), "interval counts from the timed-out start");
        assert!(svc.active().active_run("hourly").is_none());

        let run = svc.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, SyncStatus::Failed);
        assert!(run.error_message.unwrap().contains("timed out"));
    }
}
