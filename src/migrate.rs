use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sources (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            connector_type TEXT NOT NULL,
            config_json TEXT NOT NULL DEFAULT '{}',
            credentials_json TEXT NOT NULL DEFAULT '{}',
            sync_state TEXT,
            sync_interval_secs INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_runs (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL,
            status TEXT NOT NULL
                CHECK (status IN ('running', 'completed', 'failed', 'cancelled')),
            documents_scanned INTEGER NOT NULL DEFAULT 0,
            documents_emitted INTEGER NOT NULL DEFAULT 0,
            checkpoint_state TEXT,
            error_message TEXT,
            started_at INTEGER NOT NULL,
            last_activity_at INTEGER,
            completed_at INTEGER,
            FOREIGN KEY (source_id) REFERENCES sources(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Columns added after the first release.
    add_column_if_missing(pool, "sources", "sync_interval_secs", "INTEGER").await?;
    add_column_if_missing(pool, "sync_runs", "last_activity_at", "INTEGER").await?;

    // At most one running sync per source survives restarts and races.
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_runs_one_running \
         ON sync_runs(source_id) WHERE status = 'running'",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS content_blobs (
            id TEXT PRIMARY KEY,
            content BLOB,
            storage_backend TEXT NOT NULL DEFAULT 'inline',
            storage_key TEXT,
            content_type TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            sha256_hash TEXT NOT NULL,
            orphaned_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            CHECK (
                (storage_backend = 'inline' AND content IS NOT NULL AND storage_key IS NULL)
                OR
                (storage_backend <> 'inline' AND content IS NULL AND storage_key IS NOT NULL)
            )
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS connector_events_queue (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            sync_run_id TEXT NOT NULL,
            source_id TEXT NOT NULL,
            event_type TEXT NOT NULL CHECK (event_type IN ('created', 'updated', 'deleted')),
            external_document_id TEXT NOT NULL,
            content_id TEXT,
            title TEXT,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            permissions_json TEXT NOT NULL DEFAULT '{}',
            attributes_json TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
            processing_started_at INTEGER,
            claim_token TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            error_message TEXT,
            created_at INTEGER NOT NULL,
            processed_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL,
            external_id TEXT NOT NULL,
            title TEXT,
            content_id TEXT,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            permissions_json TEXT NOT NULL DEFAULT '{}',
            attributes_json TEXT NOT NULL DEFAULT '{}',
            last_sync_run_id TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(source_id, external_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embedding_batch_jobs (
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL
                CHECK (status IN ('pending', 'preparing', 'submitted', 'processing', 'completed', 'failed')),
            provider TEXT NOT NULL,
            model_name TEXT NOT NULL,
            dimensions INTEGER NOT NULL,
            external_job_id TEXT,
            input_storage_path TEXT,
            output_storage_path TEXT,
            document_count INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            created_at INTEGER NOT NULL,
            submitted_at INTEGER,
            completed_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embedding_queue (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            provider TEXT NOT NULL,
            model_name TEXT NOT NULL,
            dimensions INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'batched', 'processing', 'completed', 'failed')),
            batch_job_id TEXT,
            error_message TEXT,
            created_at INTEGER NOT NULL,
            processed_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embeddings (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            chunk_text TEXT NOT NULL,
            vector BLOB NOT NULL,
            dimensions INTEGER NOT NULL,
            model_name TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(document_id, chunk_index, model_name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    let indexes = [
        // GC reference check against in-flight events
        "CREATE INDEX IF NOT EXISTS idx_events_content_id \
         ON connector_events_queue(content_id) WHERE content_id IS NOT NULL",
        // Stale reaper
        "CREATE INDEX IF NOT EXISTS idx_events_processing \
         ON connector_events_queue(processing_started_at) WHERE status = 'processing'",
        // Claims
        "CREATE INDEX IF NOT EXISTS idx_events_pending \
         ON connector_events_queue(seq) WHERE status = 'pending'",
        // Per-document ordering
        "CREATE INDEX IF NOT EXISTS idx_events_document \
         ON connector_events_queue(source_id, external_document_id, seq)",
        "CREATE INDEX IF NOT EXISTS idx_events_sync_run ON connector_events_queue(sync_run_id)",
        "CREATE INDEX IF NOT EXISTS idx_blobs_hash ON content_blobs(sha256_hash)",
        "CREATE INDEX IF NOT EXISTS idx_blobs_orphaned \
         ON content_blobs(orphaned_at) WHERE orphaned_at IS NOT NULL",
        "CREATE INDEX IF NOT EXISTS idx_documents_content_id \
         ON documents(content_id) WHERE content_id IS NOT NULL",
        "CREATE INDEX IF NOT EXISTS idx_embedding_queue_unbatched \
         ON embedding_queue(provider, model_name, dimensions, created_at) \
         WHERE status = 'pending' AND batch_job_id IS NULL",
        "CREATE INDEX IF NOT EXISTS idx_embedding_queue_job ON embedding_queue(batch_job_id)",
        "CREATE INDEX IF NOT EXISTS idx_batch_jobs_status ON embedding_batch_jobs(status)",
        "CREATE INDEX IF NOT EXISTS idx_embeddings_document ON embeddings(document_id)",
        // Stale sync sweep
        "CREATE INDEX IF NOT EXISTS idx_sync_runs_source ON sync_runs(source_id, started_at)",
    ];
    for ddl in indexes {
        sqlx::query(ddl).execute(pool).await?;
    }

    Ok(())
}

async fn add_column_if_missing(
    pool: &SqlitePool,
    table: &str,
    column: &str,
    definition: &str,
) -> Result<()> {
    let columns: Vec<String> =
        sqlx::query_scalar(&format!("SELECT name FROM pragma_table_info('{}')", table))
            .fetch_all(pool)
            .await?;
    if !columns.iter().any(|c| c == column) {
        sqlx::query(&format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            table, column, definition
        ))
        .execute(pool)
        .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    #[tokio::test]
    async fn apply_upgrades_tables_missing_later_columns() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query(
            "CREATE TABLE sync_runs (id TEXT PRIMARY KEY, source_id TEXT NOT NULL, \
             status TEXT NOT NULL, documents_scanned INTEGER NOT NULL DEFAULT 0, \
             documents_emitted INTEGER NOT NULL DEFAULT 0, checkpoint_state TEXT, \
             error_message TEXT, started_at INTEGER NOT NULL, completed_at INTEGER)",
        )
        .execute(&pool)
        .await
        .unwrap();

        apply(&pool).await.unwrap();
        apply(&pool).await.unwrap();

        let columns: Vec<String> =
            sqlx::query_scalar("SELECT name FROM pragma_table_info('sync_runs')")
                .fetch_all(&pool)
                .await
                .unwrap();
        assert!(columns.iter().any(|c| c == "last_activity_at"));
    }
}
