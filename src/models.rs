//! Core data models.
//!
//! Status enums are stored as lowercase TEXT; every enum here has an
//! `as_str`/`FromStr` pair used at the SQL boundary.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::fmt;
use std::str::FromStr;

/// Open key-value map for metadata, permissions, attributes and checkpoints.
pub type JsonMap = serde_json::Map<String, Value>;

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(anyhow!("invalid {}: {}", stringify!($name), other)),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

text_enum!(SyncStatus {
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl SyncStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SyncStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Created,
    Updated,
    Deleted,
}

text_enum!(EventType {
    Created => "created",
    Updated => "updated",
    Deleted => "deleted",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

text_enum!(EventStatus {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

/// Lifecycle of an embedding batch job.
///
/// ```text
/// pending → preparing → submitted → processing → completed
///     └─────────┴───────────┴────────────┴──────→ failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchJobStatus {
    Pending,
    Preparing,
    Submitted,
    Processing,
    Completed,
    Failed,
}

text_enum!(BatchJobStatus {
    Pending => "pending",
    Preparing => "preparing",
    Submitted => "submitted",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

impl BatchJobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchJobStatus::Completed | BatchJobStatus::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    /// A provider may report completion without an intermediate
    /// processing state, so submitted → completed is allowed.
    pub fn can_transition_to(&self, next: BatchJobStatus) -> bool {
        use BatchJobStatus::*;
        match (self, next) {
            (Pending, Preparing) => true,
            (Preparing, Submitted) => true,
            (Submitted, Processing) | (Submitted, Completed) => true,
            (Processing, Completed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingItemStatus {
    Pending,
    Batched,
    Processing,
    Completed,
    Failed,
}

text_enum!(EmbeddingItemStatus {
    Pending => "pending",
    Batched => "batched",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

/// A registered source a connector syncs from.
#[derive(Debug, Clone, Serialize)]
pub struct Source {
    pub id: String,
    pub name: String,
    pub connector_type: String,
    pub config: JsonMap,
    #[serde(skip_serializing)]
    pub credentials: JsonMap,
    pub sync_state: Option<JsonMap>,
    /// Scheduled sync period. `None` syncs only on request.
    pub sync_interval_secs: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Source {
    pub fn from_row(row: &SqliteRow) -> Result<Self> {
        let sync_state: Option<String> = row.try_get("sync_state")?;
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            connector_type: row.try_get("connector_type")?,
            config: parse_map(&row.try_get::<String, _>("config_json")?)?,
            credentials: parse_map(&row.try_get::<String, _>("credentials_json")?)?,
            sync_state: sync_state.as_deref().map(parse_map).transpose()?,
            sync_interval_secs: row.try_get("sync_interval_secs")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// One execution of a connector for one source.
#[derive(Debug, Clone, Serialize)]
pub struct SyncRun {
    pub id: String,
    pub source_id: String,
    pub status: SyncStatus,
    pub documents_scanned: i64,
    pub documents_emitted: i64,
    pub checkpoint_state: Option<JsonMap>,
    pub error_message: Option<String>,
    pub started_at: i64,
    /// Last emit, progress report or checkpoint of a running sync.
    pub last_activity_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl SyncRun {
    pub fn from_row(row: &SqliteRow) -> Result<Self> {
        let checkpoint: Option<String> = row.try_get("checkpoint_state")?;
        Ok(Self {
            id: row.try_get("id")?,
            source_id: row.try_get("source_id")?,
            status: row.try_get::<String, _>("status")?.parse()?,
            documents_scanned: row.try_get("documents_scanned")?,
            documents_emitted: row.try_get("documents_emitted")?,
            checkpoint_state: checkpoint.as_deref().map(parse_map).transpose()?,
            error_message: row.try_get("error_message")?,
            started_at: row.try_get("started_at")?,
            last_activity_at: row.try_get("last_activity_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

/// A document as produced by connector code, before its body is stored.
#[derive(Debug, Clone, Default)]
pub struct DocumentDraft {
    pub external_id: String,
    pub title: Option<String>,
    pub body: Vec<u8>,
    pub content_type: String,
    pub metadata: JsonMap,
    pub permissions: JsonMap,
    pub attributes: JsonMap,
}

impl DocumentDraft {
    pub fn new(external_id: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            external_id: external_id.into(),
            body: body.into(),
            content_type: "text/plain".to_string(),
            ..Default::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Event sent from a sync context to the ingestion API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub sync_run_id: String,
    pub source_id: String,
    /// External document id, unique per source.
    pub document_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<JsonMap>,
}

/// A row of `connector_events_queue`.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedEvent {
    pub seq: i64,
    pub id: String,
    pub sync_run_id: String,
    pub source_id: String,
    pub event_type: EventType,
    pub external_document_id: String,
    pub content_id: Option<String>,
    pub title: Option<String>,
    pub metadata: JsonMap,
    pub permissions: JsonMap,
    pub attributes: JsonMap,
    pub status: EventStatus,
    pub processing_started_at: Option<i64>,
    pub claim_token: Option<String>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub processed_at: Option<i64>,
}

impl QueuedEvent {
    pub fn from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            seq: row.try_get("seq")?,
            id: row.try_get("id")?,
            sync_run_id: row.try_get("sync_run_id")?,
            source_id: row.try_get("source_id")?,
            event_type: row.try_get::<String, _>("event_type")?.parse()?,
            external_document_id: row.try_get("external_document_id")?,
            content_id: row.try_get("content_id")?,
            title: row.try_get("title")?,
            metadata: parse_map(&row.try_get::<String, _>("metadata_json")?)?,
            permissions: parse_map(&row.try_get::<String, _>("permissions_json")?)?,
            attributes: parse_map(&row.try_get::<String, _>("attributes_json")?)?,
            status: row.try_get::<String, _>("status")?.parse()?,
            processing_started_at: row.try_get("processing_started_at")?,
            claim_token: row.try_get("claim_token")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            processed_at: row.try_get("processed_at")?,
        })
    }
}

/// Materialized document, keyed by (source_id, external_id).
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub source_id: String,
    pub external_id: String,
    pub title: Option<String>,
    pub content_id: Option<String>,
    pub metadata: JsonMap,
    pub permissions: JsonMap,
    pub attributes: JsonMap,
    pub last_sync_run_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Document {
    pub fn from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            source_id: row.try_get("source_id")?,
            external_id: row.try_get("external_id")?,
            title: row.try_get("title")?,
            content_id: row.try_get("content_id")?,
            metadata: parse_map(&row.try_get::<String, _>("metadata_json")?)?,
            permissions: parse_map(&row.try_get::<String, _>("permissions_json")?)?,
            attributes: parse_map(&row.try_get::<String, _>("attributes_json")?)?,
            last_sync_run_id: row.try_get("last_sync_run_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Blob metadata without the payload.
#[derive(Debug, Clone, Serialize)]
pub struct ContentMetadata {
    pub id: String,
    pub storage_backend: String,
    pub storage_key: Option<String>,
    pub content_type: String,
    pub size_bytes: i64,
    pub sha256_hash: String,
    pub orphaned_at: Option<i64>,
    pub created_at: i64,
}

impl ContentMetadata {
    pub fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            storage_backend: row.try_get("storage_backend")?,
            storage_key: row.try_get("storage_key")?,
            content_type: row.try_get("content_type")?,
            size_bytes: row.try_get("size_bytes")?,
            sha256_hash: row.try_get("sha256_hash")?,
            orphaned_at: row.try_get("orphaned_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingQueueItem {
    pub id: String,
    pub document_id: String,
    pub provider: String,
    pub model_name: String,
    pub dimensions: i64,
    pub status: EmbeddingItemStatus,
    pub batch_job_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: i64,
}

impl EmbeddingQueueItem {
    pub fn from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            document_id: row.try_get("document_id")?,
            provider: row.try_get("provider")?,
            model_name: row.try_get("model_name")?,
            dimensions: row.try_get("dimensions")?,
            status: row.try_get::<String, _>("status")?.parse()?,
            batch_job_id: row.try_get("batch_job_id")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingBatchJob {
    pub id: String,
    pub status: BatchJobStatus,
    pub provider: String,
    pub model_name: String,
    pub dimensions: i64,
    pub external_job_id: Option<String>,
    pub input_storage_path: Option<String>,
    pub output_storage_path: Option<String>,
    pub document_count: i64,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub submitted_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl EmbeddingBatchJob {
    pub fn from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            status: row.try_get::<String, _>("status")?.parse()?,
            provider: row.try_get("provider")?,
            model_name: row.try_get("model_name")?,
            dimensions: row.try_get("dimensions")?,
            external_job_id: row.try_get("external_job_id")?,
            input_storage_path: row.try_get("input_storage_path")?,
            output_storage_path: row.try_get("output_storage_path")?,
            document_count: row.try_get("document_count")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            submitted_at: row.try_get("submitted_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

/// A chunk of a document's text, the unit an embedding is computed for.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
}

pub fn parse_map(s: &str) -> Result<JsonMap> {
    match serde_json::from_str::<Value>(s)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(JsonMap::new()),
        other => Err(anyhow!("expected JSON object, got {}", other)),
    }
}

pub fn map_to_string(map: &JsonMap) -> String {
    Value::Object(map.clone()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_state_machine_allows_forward_path() {
        use BatchJobStatus::*;
        let path = [Pending, Preparing, Submitted, Processing, Completed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?}", pair);
        }
    }

    #[test]
    fn batch_state_machine_rejects_skips_and_restarts() {
        use BatchJobStatus::*;
        assert!(!Pending.can_transition_to(Submitted));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Pending));
        assert!(Preparing.can_transition_to(Failed));
    }

    #[test]
    fn envelope_uses_type_field() {
        let json = serde_json::json!({
            "type": "deleted",
            "sync_run_id": "r1",
            "source_id": "s1",
            "document_id": "f1"
        });
        let env: EventEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(env.event_type, EventType::Deleted);
        assert!(env.content_id.is_none());
        let back = serde_json::to_value(&env).unwrap();
        assert_eq!(back["type"], "deleted");
        assert!(back.get("content_id").is_none());
    }

    #[test]
    fn status_text_round_trips() {
        assert_eq!("processing".parse::<EventStatus>().unwrap(), EventStatus::Processing);
        assert!("bogus".parse::<SyncStatus>().is_err());
    }
}
