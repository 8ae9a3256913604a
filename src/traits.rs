//! Connector capability interface.
//!
//! A connector is a value implementing [`Connector`], registered by type in
//! a [`ConnectorRegistry`]. The ingestion service looks connectors up by the
//! `connector_type` of the source being synced and drives them through a
//! [`SyncContext`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │           ConnectorRegistry              │
//! │  ┌────────────┐        ┌──────────────┐  │
//! │  │ Built-in   │        │  Custom      │  │
//! │  │ filesystem │        │  (Rust)      │  │
//! │  └────────────┘        └──────────────┘  │
//! └──────────────┬───────────────────────────┘
//!                ▼
//!    IngestionService::start_sync() → SyncContext → event queue
//! ```
//!
//! # Usage
//!
//! ```rust
//! use ingest_harness::traits::ConnectorRegistry;
//!
//! let mut connectors = ConnectorRegistry::with_builtins();
//! // connectors.register(std::sync::Arc::new(MyConnector::new()));
//! assert!(connectors.find("filesystem").is_some());
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::SyncError;
use crate::models::{JsonMap, Source};
use crate::sync_context::SyncContext;

// ═══════════════════════════════════════════════════════════════════════
// Manifest & Actions
// ═══════════════════════════════════════════════════════════════════════

/// Self-description served from `GET /manifest`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub name: String,
    pub version: String,
    pub sync_modes: Vec<String>,
    pub actions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Success,
    Failure,
    NotSupported,
}

/// Result of `POST /action`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResponse {
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResponse {
    pub fn success(data: Value) -> Self {
        Self {
            status: ActionStatus::Success,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Failure,
            data: None,
            error: Some(error.into()),
        }
    }

    pub fn not_supported(action: &str) -> Self {
        Self {
            status: ActionStatus::NotSupported,
            data: None,
            error: Some(format!("action not supported: {}", action)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Connector Trait
// ═══════════════════════════════════════════════════════════════════════

/// A data source connector.
///
/// # Lifecycle
///
/// 1. The connector is registered via [`ConnectorRegistry::register`].
/// 2. Sources naming its [`connector_type`](Connector::connector_type) have
///    their config validated against [`config_schema`](Connector::config_schema).
/// 3. [`sync`](Connector::sync) runs once per sync run with the source's
///    last checkpoint. It emits through the context, polls
///    [`SyncContext::is_cancelled`] between units of work, and returns the
///    final checkpoint. The runtime turns the result into exactly one
///    `complete` or `fail`.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use ingest_harness::error::SyncError;
/// use ingest_harness::models::{DocumentDraft, JsonMap, Source};
/// use ingest_harness::sync_context::SyncContext;
/// use ingest_harness::traits::Connector;
///
/// pub struct StaticConnector;
///
/// #[async_trait]
/// impl Connector for StaticConnector {
///     fn connector_type(&self) -> &str { "static" }
///     fn description(&self) -> &str { "Emits one fixed document" }
///
///     async fn sync(
///         &self,
///         _source: &Source,
///         _state: Option<JsonMap>,
///         ctx: &mut SyncContext,
///     ) -> Result<Option<JsonMap>, SyncError> {
///         if !ctx.is_cancelled() {
///             ctx.emit(DocumentDraft::new("readme", "hello")).await?;
///         }
///         Ok(None)
///     }
/// }
/// ```
#[async_trait]
pub trait Connector: Send + Sync {
    /// Type identifier sources refer to (e.g. `"filesystem"`).
    fn connector_type(&self) -> &str;

    /// One-line description.
    fn description(&self) -> &str;

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn sync_modes(&self) -> Vec<String> {
        vec!["full".to_string(), "incremental".to_string()]
    }

    /// Names of the actions accepted by [`execute_action`](Connector::execute_action).
    fn actions(&self) -> Vec<String> {
        Vec::new()
    }

    /// JSON Schema (object subset) the source config must satisfy.
    fn config_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    fn manifest(&self) -> Manifest {
        Manifest {
            name: self.connector_type().to_string(),
            version: self.version().to_string(),
            sync_modes: self.sync_modes(),
            actions: self.actions(),
        }
    }

    /// Run one sync. `state` is the checkpoint saved by the previous run,
    /// `None` for a full sync. Returns the checkpoint to persist.
    async fn sync(
        &self,
        source: &Source,
        state: Option<JsonMap>,
        ctx: &mut SyncContext,
    ) -> Result<Option<JsonMap>, SyncError>;

    async fn execute_action(
        &self,
        action: &str,
        _params: JsonMap,
        _credentials: JsonMap,
    ) -> ActionResponse {
        ActionResponse::not_supported(action)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// Connectors available to the ingestion service, keyed by type.
///
/// Connectors are held behind `Arc` because each sync runs on its own task.
pub struct ConnectorRegistry {
    connectors: Vec<Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    /// Create an empty connector registry.
    pub fn new() -> Self {
        Self {
            connectors: Vec::new(),
        }
    }

    /// A registry holding the built-in connectors.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::connector_fs::FilesystemConnector));
        registry
    }

    /// Register a connector. A later registration replaces an earlier one
    /// of the same type.
    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        self.connectors
            .retain(|c| c.connector_type() != connector.connector_type());
        self.connectors.push(connector);
    }

    /// Get all registered connectors.
    pub fn connectors(&self) -> &[Arc<dyn Connector>] {
        &self.connectors
    }

    pub fn find(&self, connector_type: &str) -> Option<Arc<dyn Connector>> {
        self.connectors
            .iter()
            .find(|c| c.connector_type() == connector_type)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
