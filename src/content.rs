//! Content-addressable blob store.
//!
//! Document bodies are stored once, independent of the documents and events
//! that reference them. Small payloads live inline in the `content_blobs`
//! row; large ones go to an external [`ObjectStore`] and the row keeps only
//! the key. Either way the caller gets a UUID that never changes when a blob
//! moves between backends.
//!
//! With dedup enabled, saving bytes whose SHA-256 already exists returns the
//! existing id. A dedup hit clears any orphan mark so a concurrent sweep
//! cannot delete the blob out from under the new reference.
//!
//! Garbage collection lives in [`crate::gc`].

use bytes::Bytes;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::{path::Path as ObjPath, ObjectStore, PutPayload};
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::ContentConfig;
use crate::db::now_millis;
use crate::error::ContentError;
use crate::models::ContentMetadata;

pub type DynStore = Arc<dyn ObjectStore>;

pub const BACKEND_INLINE: &str = "inline";
pub const BACKEND_OBJECT_STORE: &str = "object_store";

#[derive(Clone)]
pub struct ContentStore {
    pool: SqlitePool,
    external: Option<DynStore>,
    inline_threshold: usize,
    dedup: bool,
}

impl ContentStore {
    pub fn new(
        pool: SqlitePool,
        external: Option<DynStore>,
        inline_threshold: usize,
        dedup: bool,
    ) -> Self {
        Self {
            pool,
            external,
            inline_threshold,
            dedup,
        }
    }

    /// Build the store from `[content]`, opening a local-filesystem object
    /// store when `object_store_path` is set.
    pub fn from_config(pool: SqlitePool, config: &ContentConfig) -> Result<Self, ContentError> {
        let external = match &config.object_store_path {
            Some(path) => Some(open_local_store(path)?),
            None => None,
        };
        Ok(Self::new(
            pool,
            external,
            config.inline_threshold_bytes,
            config.dedup,
        ))
    }

    /// Store `bytes` and return the blob id.
    pub async fn save(&self, bytes: &[u8], content_type: &str) -> Result<String, ContentError> {
        let hash = sha256_hex(bytes);

        if self.dedup {
            if let Some(existing) = self.find_by_hash(&hash).await? {
                let rescued = sqlx::query(
                    "UPDATE content_blobs SET orphaned_at = NULL, updated_at = ? WHERE id = ?",
                )
                .bind(now_millis())
                .bind(&existing)
                .execute(&self.pool)
                .await?;
                // Zero rows means a sweep removed it since the lookup.
                if rescued.rows_affected() == 1 {
                    tracing::debug!(content_id = %existing, "content dedup hit");
                    return Ok(existing);
                }
            }
        }

        let id = Uuid::new_v4().to_string();
        let now = now_millis();

        match self.backend_for(bytes.len()) {
            Some(store) => {
                let key = format!("content/{}/{}", &hash[..2], id);
                store
                    .put(
                        &ObjPath::from(key.as_str()),
                        PutPayload::from(Bytes::copy_from_slice(bytes)),
                    )
                    .await?;

                let inserted = sqlx::query(
                    r#"
                    INSERT INTO content_blobs
                        (id, content, storage_backend, storage_key, content_type,
                         size_bytes, sha256_hash, created_at, updated_at)
                    VALUES (?, NULL, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&id)
                .bind(BACKEND_OBJECT_STORE)
                .bind(&key)
                .bind(content_type)
                .bind(bytes.len() as i64)
                .bind(&hash)
                .bind(now)
                .bind(now)
                .execute(&self.pool)
                .await;

                if let Err(e) = inserted {
                    if let Err(cleanup) = store.delete(&ObjPath::from(key.as_str())).await {
                        tracing::warn!(key = %key, error = %cleanup, "failed to remove unreferenced object");
                    }
                    return Err(e.into());
                }
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO content_blobs
                        (id, content, storage_backend, storage_key, content_type,
                         size_bytes, sha256_hash, created_at, updated_at)
                    VALUES (?, ?, ?, NULL, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&id)
                .bind(bytes)
                .bind(BACKEND_INLINE)
                .bind(content_type)
                .bind(bytes.len() as i64)
                .bind(&hash)
                .bind(now)
                .bind(now)
                .execute(&self.pool)
                .await?;
            }
        }

        tracing::debug!(content_id = %id, size = bytes.len(), "content stored");
        Ok(id)
    }

    fn backend_for(&self, size: usize) -> Option<&DynStore> {
        match &self.external {
            Some(store) if size > self.inline_threshold => Some(store),
            _ => None,
        }
    }

    pub async fn find_by_hash(&self, hash: &str) -> Result<Option<String>, ContentError> {
        let id: Option<String> = sqlx::query_scalar(
            "SELECT id FROM content_blobs WHERE sha256_hash = ? ORDER BY created_at LIMIT 1",
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn exists(&self, id: &str) -> Result<bool, ContentError> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM content_blobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    pub async fn metadata(&self, id: &str) -> Result<ContentMetadata, ContentError> {
        let row = sqlx::query(
            r#"
            SELECT id, storage_backend, storage_key, content_type, size_bytes,
                   sha256_hash, orphaned_at, created_at
            FROM content_blobs WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ContentError::NotFound(id.to_string()))?;

        Ok(ContentMetadata::from_row(&row)?)
    }

    /// Fetch the payload, wherever it lives.
    pub async fn get(&self, id: &str) -> Result<Bytes, ContentError> {
        let row = sqlx::query(
            "SELECT content, storage_backend, storage_key FROM content_blobs WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ContentError::NotFound(id.to_string()))?;

        let backend: String = row.try_get("storage_backend")?;
        if backend == BACKEND_INLINE {
            let content: Vec<u8> = row.try_get("content")?;
            return Ok(Bytes::from(content));
        }

        let key: String = row.try_get("storage_key")?;
        let store = self.external.as_ref().ok_or_else(|| {
            ContentError::Rejected(format!(
                "blob {} lives in {} but no external store is configured",
                id, backend
            ))
        })?;
        let result = store.get(&ObjPath::from(key.as_str())).await?;
        Ok(result.bytes().await?)
    }

    pub async fn get_text(&self, id: &str) -> Result<String, ContentError> {
        let bytes = self.get(id).await?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ContentError::NotText(id.to_string()))
    }

    /// Delete a blob regardless of references. Returns false when it did
    /// not exist. The external payload goes after the row.
    pub async fn delete(&self, id: &str) -> Result<bool, ContentError> {
        let row = sqlx::query(
            "DELETE FROM content_blobs WHERE id = ? RETURNING storage_backend, storage_key",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(false);
        };

        let backend: String = row.try_get("storage_backend")?;
        if backend != BACKEND_INLINE {
            let key: String = row.try_get("storage_key")?;
            self.delete_external(&key).await?;
        }
        tracing::debug!(content_id = %id, "content deleted");
        Ok(true)
    }

    /// Remove an external payload. A missing object counts as removed.
    pub(crate) async fn delete_external(&self, key: &str) -> Result<(), ContentError> {
        let Some(store) = &self.external else {
            return Err(ContentError::Rejected(format!(
                "cannot delete {}: no external store is configured",
                key
            )));
        };
        match store.delete(&ObjPath::from(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Open (creating if needed) a local-filesystem object store rooted at `path`.
pub fn open_local_store(path: &std::path::Path) -> Result<DynStore, ContentError> {
    std::fs::create_dir_all(path).map_err(|e| object_store::Error::Generic {
        store: "LocalFileSystem",
        source: e.into(),
    })?;
    let store = LocalFileSystem::new_with_prefix(path)?;
    Ok(Arc::new(store))
}

pub fn memory_store() -> DynStore {
    Arc::new(InMemory::new())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::apply(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn small_payload_stays_inline() {
        let pool = memory_pool().await;
        let store = ContentStore::new(pool, Some(memory_store()), 16, true);

        let id = store.save(b"tiny", "text/plain").await.unwrap();
        let meta = store.metadata(&id).await.unwrap();
        assert_eq!(meta.storage_backend, BACKEND_INLINE);
        assert!(meta.storage_key.is_none());
        assert_eq!(store.get_text(&id).await.unwrap(), "tiny");
    }

    #[tokio::test]
    async fn large_payload_goes_external() {
        let pool = memory_pool().await;
        let store = ContentStore::new(pool, Some(memory_store()), 16, true);

        let body = "x".repeat(100);
        let id = store.save(body.as_bytes(), "text/plain").await.unwrap();
        let meta = store.metadata(&id).await.unwrap();
        assert_eq!(meta.storage_backend, BACKEND_OBJECT_STORE);
        assert!(meta.storage_key.as_deref().unwrap().ends_with(&id));
        assert_eq!(meta.size_bytes, 100);
        assert_eq!(store.get_text(&id).await.unwrap(), body);
    }

    #[tokio::test]
    async fn without_external_store_everything_is_inline() {
        let pool = memory_pool().await;
        let store = ContentStore::new(pool, None, 4, true);

        let id = store.save(b"longer than four", "text/plain").await.unwrap();
        assert_eq!(store.metadata(&id).await.unwrap().storage_backend, BACKEND_INLINE);
    }

    #[tokio::test]
    async fn dedup_returns_existing_id_and_clears_orphan_mark() {
        let pool = memory_pool().await;
        let store = ContentStore::new(pool.clone(), None, 1024, true);

        let first = store.save(b"same bytes", "text/plain").await.unwrap();
        sqlx::query("UPDATE content_blobs SET orphaned_at = 1 WHERE id = ?")
            .bind(&first)
            .execute(&pool)
            .await
            .unwrap();

        let second = store.save(b"same bytes", "text/plain").await.unwrap();
        assert_eq!(first, second);
        assert!(store.metadata(&first).await.unwrap().orphaned_at.is_none());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM content_blobs")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn dedup_disabled_stores_twice() {
        let pool = memory_pool().await;
        let store = ContentStore::new(pool, None, 1024, false);

        let a = store.save(b"dup", "text/plain").await.unwrap();
        let b = store.save(b"dup", "text/plain").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let pool = memory_pool().await;
        let store = ContentStore::new(pool, None, 1024, true);
        assert!(matches!(
            store.get("nope").await,
            Err(ContentError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_removes_row_and_external_object() {
        let pool = memory_pool().await;
        let external = memory_store();
        let store = ContentStore::new(pool, Some(external.clone()), 4, true);

        let id = store.save(b"a payload over four bytes", "text/plain").await.unwrap();
        let key = store.metadata(&id).await.unwrap().storage_key.unwrap();

        assert!(store.delete(&id).await.unwrap());
        assert!(!store.exists(&id).await.unwrap());
        assert!(external.head(&ObjPath::from(key.as_str())).await.is_err());
        assert!(!store.delete(&id).await.unwrap());
    }

    #[test]
    fn sha256_hex_is_lowercase_64_chars() {
        let h = sha256_hex(b"abc");
        assert_eq!(h.len(), 64);
        assert!(h.starts_with("ba7816bf"));
    }
}
