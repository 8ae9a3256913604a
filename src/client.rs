//! The ingestion API as seen from a sync context.
//!
//! [`IngestionClient`] is implemented twice: by the in-process
//! [`IngestionService`](crate::ingest::IngestionService) for connectors
//! hosted by the server, and by [`HttpIngestionClient`] for connectors
//! running in another process. Both speak the same request types, which
//! are also the JSON bodies of the `/sdk/*` routes.

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ContentError, IngestError};
use crate::models::{EventEnvelope, JsonMap};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeginRunRequest {
    pub sync_run_id: String,
    pub source_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeginRunResponse {
    pub sync_run_id: String,
    /// Checkpoint left by the previous run of this source.
    pub state: Option<JsonMap>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreContentRequest {
    pub sync_run_id: String,
    pub content_type: String,
    /// Body bytes, standard base64.
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreContentResponse {
    pub content_id: String,
}

/// Server acknowledgement of an emitted event or progress report. Carries
/// the run's cancellation flag back to remote connectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRequest {
    pub documents_scanned: u64,
    pub documents_emitted: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRequest {
    pub state: JsonMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub documents_scanned: u64,
    pub documents_emitted: u64,
    #[serde(default)]
    pub final_state: Option<JsonMap>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailRequest {
    pub error: String,
    /// Record the run as cancelled rather than failed.
    #[serde(default)]
    pub cancelled: bool,
    pub documents_scanned: u64,
    pub documents_emitted: u64,
}

#[async_trait]
pub trait IngestionClient: Send + Sync {
    async fn store_content(
        &self,
        sync_run_id: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String, IngestError>;

    async fn emit_event(&self, event: &EventEnvelope) -> Result<Receipt, IngestError>;

    async fn report_progress(
        &self,
        sync_run_id: &str,
        progress: &ProgressRequest,
    ) -> Result<Receipt, IngestError>;

    async fn save_state(&self, sync_run_id: &str, state: &JsonMap) -> Result<(), IngestError>;

    async fn complete_run(
        &self,
        sync_run_id: &str,
        request: &CompleteRequest,
    ) -> Result<(), IngestError>;

    async fn fail_run(&self, sync_run_id: &str, request: &FailRequest) -> Result<(), IngestError>;
}

// ============ HTTP client ============

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Talks to a remote ingestion API over HTTP/JSON.
#[derive(Clone)]
pub struct HttpIngestionClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpIngestionClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, IngestError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Register a run started by a remote runtime. Returns the source's
    /// last checkpoint.
    pub async fn begin_run(
        &self,
        sync_run_id: &str,
        source_id: &str,
    ) -> Result<BeginRunResponse, IngestError> {
        self.post(
            "/sdk/runs",
            &BeginRunRequest {
                sync_run_id: sync_run_id.to_string(),
                source_id: source_id.to_string(),
            },
        )
        .await
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R, IngestError>
    where
        B: Serialize + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.post(&url).json(body).send().await?;
        let status = resp.status();

        if status.is_success() {
            return Ok(resp.json::<R>().await?);
        }

        let text = resp.text().await.unwrap_or_default();
        let (code, message) = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => (body.error.code, body.error.message),
            Err(_) => (String::new(), text),
        };

        Err(match (status.as_u16(), code.as_str()) {
            (_, "content_storage") => IngestError::ContentStorage(ContentError::Rejected(message)),
            (404, _) => IngestError::NotFound(message),
            (409, _) => IngestError::Conflict(message),
            (400, _) => IngestError::BadRequest(message),
            _ => IngestError::Transport(format!("{} {}: {}", status, path, message)),
        })
    }
}

#[async_trait]
impl IngestionClient for HttpIngestionClient {
    async fn store_content(
        &self,
        sync_run_id: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String, IngestError> {
        let resp: StoreContentResponse = self
            .post(
                "/sdk/content",
                &StoreContentRequest {
                    sync_run_id: sync_run_id.to_string(),
                    content_type: content_type.to_string(),
                    content: base64::engine::general_purpose::STANDARD.encode(bytes),
                },
            )
            .await?;
        Ok(resp.content_id)
    }

    async fn emit_event(&self, event: &EventEnvelope) -> Result<Receipt, IngestError> {
        self.post("/sdk/events", event).await
    }

    async fn report_progress(
        &self,
        sync_run_id: &str,
        progress: &ProgressRequest,
    ) -> Result<Receipt, IngestError> {
        self.post(&format!("/sdk/runs/{}/progress", sync_run_id), progress)
            .await
    }

    async fn save_state(&self, sync_run_id: &str, state: &JsonMap) -> Result<(), IngestError> {
        let _: serde_json::Value = self
            .post(
                &format!("/sdk/runs/{}/state", sync_run_id),
                &StateRequest {
                    state: state.clone(),
                },
            )
            .await?;
        Ok(())
    }

    async fn complete_run(
        &self,
        sync_run_id: &str,
        request: &CompleteRequest,
    ) -> Result<(), IngestError> {
        let _: serde_json::Value = self
            .post(&format!("/sdk/runs/{}/complete", sync_run_id), request)
            .await?;
        Ok(())
    }

    async fn fail_run(&self, sync_run_id: &str, request: &FailRequest) -> Result<(), IngestError> {
        let _: serde_json::Value = self
            .post(&format!("/sdk/runs/{}/fail", sync_run_id), request)
            .await?;
        Ok(())
    }
}
