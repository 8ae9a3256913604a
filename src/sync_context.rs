//! Per-run handle given to connector code.
//!
//! A [`SyncContext`] mediates between one connector run and the ingestion
//! API. Its emit methods take `&mut self`, so a connector cannot issue the
//! next emit before the previous one was accepted; events of one run reach
//! the queue in emission order. The terminal methods take `self`, so a run
//! ends exactly once.
//!
//! Body bytes are stored before the event that references them is sent.
//! When storing one body fails, the document is skipped and the
//! per-document error callback is told; the run goes on. Any other failure
//! to reach the ingestion API is returned as a fatal [`SyncError`].

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::client::{CompleteRequest, FailRequest, IngestionClient, ProgressRequest, Receipt};
use crate::error::{ContentError, IngestError, SyncError};
use crate::models::{DocumentDraft, EventEnvelope, EventType, JsonMap};

/// Cooperative cancellation flag shared by the active-sync registry and
/// the context. Setting it never interrupts work in flight.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Called with the external id of a document whose body could not be stored.
pub type ContentErrorCallback = Arc<dyn Fn(&str, &ContentError) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmitOutcome {
    Emitted { content_id: String, event_id: String },
    /// The body could not be stored; no event was sent.
    Skipped,
}

pub struct SyncContext {
    sync_run_id: String,
    source_id: String,
    client: Arc<dyn IngestionClient>,
    cancel: CancellationToken,
    checkpoint_every: u64,
    on_content_error: Option<ContentErrorCallback>,
    documents_scanned: u64,
    documents_emitted: u64,
    documents_skipped: u64,
}

impl SyncContext {
    pub fn new(
        sync_run_id: impl Into<String>,
        source_id: impl Into<String>,
        client: Arc<dyn IngestionClient>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sync_run_id: sync_run_id.into(),
            source_id: source_id.into(),
            client,
            cancel,
            checkpoint_every: 50,
            on_content_error: None,
            documents_scanned: 0,
            documents_emitted: 0,
            documents_skipped: 0,
        }
    }

    pub fn with_checkpoint_every(mut self, every: u64) -> Self {
        self.checkpoint_every = every.max(1);
        self
    }

    pub fn on_content_error(mut self, callback: ContentErrorCallback) -> Self {
        self.on_content_error = Some(callback);
        self
    }

    pub fn sync_run_id(&self) -> &str {
        &self.sync_run_id
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn documents_scanned(&self) -> u64 {
        self.documents_scanned
    }

    pub fn documents_emitted(&self) -> u64 {
        self.documents_emitted
    }

    pub fn documents_skipped(&self) -> u64 {
        self.documents_skipped
    }

    /// Non-blocking read of the cancellation flag.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Emit a new document.
    pub async fn emit(&mut self, document: DocumentDraft) -> Result<EmitOutcome, SyncError> {
        self.emit_with(EventType::Created, document).await
    }

    /// Emit a changed document.
    pub async fn emit_updated(&mut self, document: DocumentDraft) -> Result<EmitOutcome, SyncError> {
        self.emit_with(EventType::Updated, document).await
    }

    async fn emit_with(
        &mut self,
        event_type: EventType,
        document: DocumentDraft,
    ) -> Result<EmitOutcome, SyncError> {
        self.documents_scanned += 1;

        let content_id = match self
            .client
            .store_content(&self.sync_run_id, &document.body, &document.content_type)
            .await
        {
            Ok(id) => id,
            Err(IngestError::ContentStorage(e)) => {
                self.documents_skipped += 1;
                tracing::warn!(
                    sync_run_id = %self.sync_run_id,
                    document_id = %document.external_id,
                    error = %e,
                    "document skipped: content storage failed"
                );
                if let Some(callback) = &self.on_content_error {
                    callback(&document.external_id, &e);
                }
                return Ok(EmitOutcome::Skipped);
            }
            Err(e) => return Err(e.into()),
        };

        let envelope = EventEnvelope {
            event_type,
            sync_run_id: self.sync_run_id.clone(),
            source_id: self.source_id.clone(),
            document_id: document.external_id,
            content_id: Some(content_id.clone()),
            title: document.title,
            metadata: non_empty(document.metadata),
            permissions: non_empty(document.permissions),
            attributes: non_empty(document.attributes),
        };
        let receipt = self.client.emit_event(&envelope).await?;
        self.observe(&receipt);
        self.documents_emitted += 1;

        Ok(EmitOutcome::Emitted {
            content_id,
            event_id: receipt.event_id.unwrap_or_default(),
        })
    }

    /// Emit a deletion. No content is involved.
    pub async fn emit_deleted(&mut self, external_id: &str) -> Result<(), SyncError> {
        let envelope = EventEnvelope {
            event_type: EventType::Deleted,
            sync_run_id: self.sync_run_id.clone(),
            source_id: self.source_id.clone(),
            document_id: external_id.to_string(),
            content_id: None,
            title: None,
            metadata: None,
            permissions: None,
            attributes: None,
        };
        let receipt = self.client.emit_event(&envelope).await?;
        self.observe(&receipt);
        Ok(())
    }

    /// Count an item that was looked at but not emitted.
    pub async fn increment_scanned(&mut self) -> Result<(), SyncError> {
        self.documents_scanned += 1;
        let receipt = self
            .client
            .report_progress(
                &self.sync_run_id,
                &ProgressRequest {
                    documents_scanned: self.documents_scanned,
                    documents_emitted: self.documents_emitted,
                },
            )
            .await?;
        self.observe(&receipt);
        Ok(())
    }

    /// Persist an opaque checkpoint for the next incremental run.
    pub async fn save_state(&mut self, checkpoint: &JsonMap) -> Result<(), SyncError> {
        self.client.save_state(&self.sync_run_id, checkpoint).await?;
        tracing::debug!(
            sync_run_id = %self.sync_run_id,
            emitted = self.documents_emitted,
            "checkpoint saved"
        );
        Ok(())
    }

    /// True right after every `checkpoint_every`-th emitted document.
    pub fn checkpoint_due(&self) -> bool {
        self.documents_emitted > 0 && self.documents_emitted % self.checkpoint_every == 0
    }

    /// Finish the run successfully.
    pub async fn complete(self, final_state: Option<JsonMap>) -> Result<(), SyncError> {
        self.client
            .complete_run(
                &self.sync_run_id,
                &CompleteRequest {
                    documents_scanned: self.documents_scanned,
                    documents_emitted: self.documents_emitted,
                    final_state,
                },
            )
            .await?;
        Ok(())
    }

    /// Finish the run with an error. [`SyncError::Cancelled`] records the
    /// run as cancelled.
    pub async fn fail(self, error: &SyncError) -> Result<(), SyncError> {
        self.client
            .fail_run(
                &self.sync_run_id,
                &FailRequest {
                    error: error.to_string(),
                    cancelled: matches!(error, SyncError::Cancelled),
                    documents_scanned: self.documents_scanned,
                    documents_emitted: self.documents_emitted,
                },
            )
            .await?;
        Ok(())
    }

    fn observe(&self, receipt: &Receipt) {
        if receipt.cancelled && !self.cancel.is_cancelled() {
            tracing::info!(sync_run_id = %self.sync_run_id, "cancellation requested by server");
            self.cancel.cancel();
        }
    }
}

fn non_empty(map: JsonMap) -> Option<JsonMap> {
    if map.is_empty() {
        None
    } else {
        Some(map)
    }
}

/// Read a string field from a checkpoint map.
pub fn state_str<'a>(state: &'a JsonMap, key: &str) -> Option<&'a str> {
    state.get(key).and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records calls; fails content storage for bodies equal to "bad" and
    /// every call once `down` is set.
    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<EventEnvelope>>,
        terminal: Mutex<Vec<String>>,
        down: AtomicBool,
        cancel_after: Option<usize>,
    }

    impl Recorder {
        fn check(&self) -> Result<(), IngestError> {
            if self.down.load(Ordering::SeqCst) {
                Err(IngestError::Transport("connection refused".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl IngestionClient for Recorder {
        async fn store_content(&self, _: &str, bytes: &[u8], _: &str) -> Result<String, IngestError> {
            self.check()?;
            if bytes == b"bad" {
                return Err(ContentError::Rejected("disk full".into()).into());
            }
            Ok(format!("c-{}", bytes.len()))
        }

        async fn emit_event(&self, event: &EventEnvelope) -> Result<Receipt, IngestError> {
            self.check()?;
            let mut events = self.events.lock().unwrap();
            events.push(event.clone());
            Ok(Receipt {
                event_id: Some(format!("e-{}", events.len())),
                cancelled: self.cancel_after.is_some_and(|n| events.len() >= n),
            })
        }

        async fn report_progress(&self, _: &str, _: &ProgressRequest) -> Result<Receipt, IngestError> {
            self.check()?;
            Ok(Receipt {
                event_id: None,
                cancelled: false,
            })
        }

        async fn save_state(&self, _: &str, _: &JsonMap) -> Result<(), IngestError> {
            self.check()
        }

        async fn complete_run(&self, _: &str, r: &CompleteRequest) -> Result<(), IngestError> {
            self.terminal
                .lock()
                .unwrap()
                .push(format!("complete:{}:{}", r.documents_scanned, r.documents_emitted));
            Ok(())
        }

        async fn fail_run(&self, _: &str, r: &FailRequest) -> Result<(), IngestError> {
            self.terminal
                .lock()
                .unwrap()
                .push(format!("fail:{}:{}", r.error, r.cancelled));
            Ok(())
        }
    }

    fn ctx(client: Arc<Recorder>) -> SyncContext {
        SyncContext::new("run-1", "src", client, CancellationToken::new()).with_checkpoint_every(2)
    }

    #[tokio::test]
    async fn emit_stores_content_then_sends_event() {
        let rec = Arc::new(Recorder::default());
        let mut c = ctx(rec.clone());

        let out = c
            .emit(DocumentDraft::new("a", "hello").with_title("A"))
            .await
            .unwrap();
        assert_eq!(
            out,
            EmitOutcome::Emitted {
                content_id: "c-5".into(),
                event_id: "e-1".into()
            }
        );
        c.emit_deleted("b").await.unwrap();

        let events = rec.events.lock().unwrap().clone();
        assert_eq!(events[0].event_type, EventType::Created);
        assert_eq!(events[0].content_id.as_deref(), Some("c-5"));
        assert_eq!(events[0].title.as_deref(), Some("A"));
        assert_eq!(events[1].event_type, EventType::Deleted);
        assert!(events[1].content_id.is_none());
        assert_eq!(c.documents_emitted(), 1);
    }

    #[tokio::test]
    async fn content_failure_skips_document_and_reports() {
        let rec = Arc::new(Recorder::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut c = ctx(rec.clone()).on_content_error(Arc::new(move |id, _err| {
            sink.lock().unwrap().push(id.to_string());
        }));

        assert_eq!(
            c.emit(DocumentDraft::new("x", "bad")).await.unwrap(),
            EmitOutcome::Skipped
        );
        c.emit(DocumentDraft::new("y", "good")).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["x".to_string()]);
        assert_eq!(rec.events.lock().unwrap().len(), 1);
        assert_eq!(c.documents_skipped(), 1);
        assert_eq!(c.documents_scanned(), 2);
        assert_eq!(c.documents_emitted(), 1);
    }

    #[tokio::test]
    async fn transport_failure_is_fatal() {
        let rec = Arc::new(Recorder::default());
        rec.down.store(true, Ordering::SeqCst);
        let mut c = ctx(rec.clone());

        let err = c.emit(DocumentDraft::new("a", "x")).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, SyncError::Ingestion(IngestError::Transport(_))));
    }

    #[tokio::test]
    async fn server_cancellation_flips_local_token() {
        let rec = Arc::new(Recorder {
            cancel_after: Some(2),
            ..Default::default()
        });
        let mut c = ctx(rec.clone());

        c.emit(DocumentDraft::new("a", "1")).await.unwrap();
        assert!(!c.is_cancelled());
        c.emit(DocumentDraft::new("b", "2")).await.unwrap();
        assert!(c.is_cancelled());

        c.fail(&SyncError::Cancelled).await.unwrap();
        assert_eq!(*rec.terminal.lock().unwrap(), vec!["fail:cancelled:true".to_string()]);
    }

    #[tokio::test]
    async fn checkpoint_cadence_and_complete_counts() {
        let rec = Arc::new(Recorder::default());
        let mut c = ctx(rec.clone());

        assert!(!c.checkpoint_due());
        c.emit(DocumentDraft::new("a", "1")).await.unwrap();
        assert!(!c.checkpoint_due());
        c.emit(DocumentDraft::new("b", "2")).await.unwrap();
        assert!(c.checkpoint_due());
        c.increment_scanned().await.unwrap();

        c.complete(None).await.unwrap();
        assert_eq!(*rec.terminal.lock().unwrap(), vec!["complete:3:2".to_string()]);
    }
}
