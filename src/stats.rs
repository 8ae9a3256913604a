//! Corpus statistics for `ingest stats`.
//!
//! Gathers document counts per source, the latest sync run of each source,
//! embedding coverage, queue depth and content-store usage.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::time::Duration;

use crate::config::Config;
use crate::content::ContentStore;
use crate::db;
use crate::gc::{orphan_stats, OrphanStats};
use crate::queue::{EventQueue, QueueStats};

#[derive(Debug, Clone, Serialize)]
pub struct SourceStats {
    pub source_id: String,
    pub connector_type: String,
    pub documents: i64,
    pub embedded_documents: i64,
    pub last_run_status: Option<String>,
    pub last_run_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CorpusStats {
    pub documents: i64,
    pub embedded_documents: i64,
    pub embeddings: i64,
    pub embedding_items_pending: i64,
    pub batch_jobs_active: i64,
    pub queue: QueueStats,
    pub content: OrphanStats,
    pub sources: Vec<SourceStats>,
}

pub async fn collect(pool: &SqlitePool, config: &Config) -> Result<CorpusStats> {
    let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
        .fetch_one(pool)
        .await?;
    let embedded_documents: i64 =
        sqlx::query_scalar("SELECT COUNT(DISTINCT document_id) FROM embeddings")
            .fetch_one(pool)
            .await?;
    let embeddings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embeddings")
        .fetch_one(pool)
        .await?;
    let embedding_items_pending: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM embedding_queue WHERE status IN ('pending', 'batched', 'processing')",
    )
    .fetch_one(pool)
    .await?;
    let batch_jobs_active: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM embedding_batch_jobs WHERE status NOT IN ('completed', 'failed')",
    )
    .fetch_one(pool)
    .await?;

    let queue = EventQueue::new(pool.clone(), config.queue.max_retries)
        .stats()
        .await?;
    let store = ContentStore::new(pool.clone(), None, 0, false);
    let content = orphan_stats(&store, Duration::from_secs(config.gc.grace_period_secs)).await?;

    // Latest run per source.
    let rows = sqlx::query(
        r#"
        SELECT
            s.id AS source_id,
            s.connector_type,
            (SELECT COUNT(*) FROM documents d WHERE d.source_id = s.id) AS documents,
            (SELECT COUNT(DISTINCT e.document_id) FROM embeddings e
                JOIN documents d ON d.id = e.document_id
                WHERE d.source_id = s.id) AS embedded_documents,
            r.status AS last_run_status,
            r.started_at AS last_run_at
        FROM sources s
        LEFT JOIN sync_runs r ON r.id = (
            SELECT id FROM sync_runs WHERE source_id = s.id
            ORDER BY started_at DESC, id DESC LIMIT 1
        )
        ORDER BY s.id
        "#,
    )
    .fetch_all(pool)
    .await?;

    let sources = rows
        .iter()
        .map(|row| -> Result<SourceStats> {
            Ok(SourceStats {
                source_id: row.try_get("source_id")?,
                connector_type: row.try_get("connector_type")?,
                documents: row.try_get("documents")?,
                embedded_documents: row.try_get("embedded_documents")?,
                last_run_status: row.try_get("last_run_status")?,
                last_run_at: row.try_get("last_run_at")?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(CorpusStats {
        documents,
        embedded_documents,
        embeddings,
        embedding_items_pending,
        batch_jobs_active,
        queue,
        content,
        sources,
    })
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let stats = collect(&pool, config).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Ingest Harness — Corpus Stats");
    println!("=============================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Documents:   {}", stats.documents);
    println!(
        "  Embedded:    {} / {} ({}%)  [{} vectors]",
        stats.embedded_documents,
        stats.documents,
        if stats.documents > 0 {
            (stats.embedded_documents * 100) / stats.documents
        } else {
            0
        },
        stats.embeddings
    );
    println!(
        "  Embedding:   {} items queued, {} batch jobs active",
        stats.embedding_items_pending, stats.batch_jobs_active
    );
    println!(
        "  Queue:       {} pending, {} processing, {} failed ({} exhausted), {} completed",
        stats.queue.pending,
        stats.queue.processing,
        stats.queue.failed,
        stats.queue.exhausted,
        stats.queue.completed
    );
    println!(
        "  Content:     {} blobs, {} ({} orphaned)",
        stats.content.total_blobs,
        format_bytes(stats.content.total_bytes.max(0) as u64),
        format_bytes(stats.content.orphaned_bytes.max(0) as u64)
    );

    if !stats.sources.is_empty() {
        println!();
        println!("  By source:");
        println!(
            "  {:<24} {:<12} {:>6} {:>10}   {}",
            "SOURCE", "CONNECTOR", "DOCS", "EMBEDDED", "LAST SYNC"
        );
        println!("  {}", "-".repeat(76));

        for s in &stats.sources {
            let sync_display = match (&s.last_run_status, s.last_run_at) {
                (Some(status), Some(ts)) => format!("{} ({})", format_ts_relative(ts), status),
                _ => "never".to_string(),
            };
            println!(
                "  {:<24} {:<12} {:>6} {:>10}   {}",
                s.source_id, s.connector_type, s.documents, s.embedded_documents, sync_display
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix-millis timestamp relative to now ("3 hours ago").
fn format_ts_relative(ts_millis: i64) -> String {
    let delta = (db::now_millis() - ts_millis) / 1000;

    if delta < 0 {
        return format_ts_iso(ts_millis);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts_millis)
    }
}

fn format_ts_iso(ts_millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ts_millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts_millis.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    #[test]
    fn bytes_format_by_magnitude() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn recent_timestamps_are_relative() {
        let now = db::now_millis();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 2 * 3_600_000), "2 hours ago");
        assert_eq!(format_ts_relative(now - 60_000), "1 min ago");
    }

    #[tokio::test]
    async fn collect_reports_latest_run_per_source() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::apply(&pool).await.unwrap();

        sqlx::query(
            "INSERT INTO sources (id, name, connector_type, created_at, updated_at) \
             VALUES ('docs', 'docs', 'filesystem', 0, 0), ('empty', 'empty', 'filesystem', 0, 0)",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO sync_runs (id, source_id, status, started_at) \
             VALUES ('r1', 'docs', 'failed', 10), ('r2', 'docs', 'completed', 20)",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO documents (id, source_id, external_id, created_at, updated_at) \
             VALUES ('d1', 'docs', 'a.md', 0, 0), ('d2', 'docs', 'b.md', 0, 0)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let config: Config = toml::from_str(
            "[db]\npath = \"unused.sqlite\"\n[server]\nbind = \"127.0.0.1:0\"\n",
        ).unwrap();
        let stats = collect(&pool, &config).await.unwrap();
        assert_eq!(stats.documents, 2);
        assert_eq!(stats.embedded_documents, 0);
        assert_eq!(stats.sources.len(), 2);

        let docs = &stats.sources[0];
        assert_eq!(docs.documents, 2);
        assert_eq!(docs.last_run_status.as_deref(), Some("completed"));
        assert_eq!(docs.last_run_at, Some(20));
        assert!(stats.sources[1].last_run_status.is_none());
    }
}
