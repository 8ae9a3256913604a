//! # Ingest Harness
//!
//! Connector sync protocol and ingestion pipeline.
//!
//! Connectors scan external systems and report documents through a
//! [`sync_context::SyncContext`]. Bodies land in a deduplicating content
//! store; events land in a durable SQLite queue that a consumer pool
//! materializes into documents. Materialized documents feed an embedding
//! queue that the batch orchestrator turns into provider batch jobs.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐  emit   ┌──────────────┐ enqueue ┌─────────────┐ apply ┌───────────┐
//! │ Connector │───────▶│ Ingestion API │───────▶│ Event queue │──────▶│ Documents │
//! │ + Context │        │ (in-process   │        │  (SQLite)   │       └─────┬─────┘
//! └───────────┘        │  or HTTP)     │        └──────┬──────┘             │
//!       │ save         └──────────────┘               │ reaper            ▼
//!       ▼                                             ▼ retry       ┌─────────────┐
//! ┌───────────────┐   two-phase GC                                  │ Embedding   │
//! │ Content store │◀─────────────                                   │ queue→batch │
//! └───────────────┘                                                 └─────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`sync_context`] | Connector-facing emit/checkpoint/cancel handle |
//! | [`client`] | Ingestion client trait and its HTTP implementation |
//! | [`ingest`] | Ingestion service: sources, runs, active-sync registry |
//! | [`server`] | Ingestion API over HTTP |
//! | [`queue`] | Durable event queue |
//! | [`consumer`] | Consumer pool applying events to documents |
//! | [`reaper`] | Resets stale processing rows |
//! | [`scheduler`] | Interval syncs and stale-run timeouts |
//! | [`content`] | Content store with dedup |
//! | [`gc`] | Two-phase content garbage collection |
//! | [`batch`] | Embedding batch orchestrator |
//! | [`embedding`] | Embedding providers |
//! | [`chunk`] | Text chunking |
//! | [`connector_fs`] | Filesystem connector |
//! | [`traits`] | Connector trait and registry |
//! | [`config`] | TOML configuration |
//! | [`db`] / [`migrate`] | Database connection and schema |

pub mod batch;
pub mod chunk;
pub mod client;
pub mod config;
pub mod connector_fs;
pub mod consumer;
pub mod content;
pub mod db;
pub mod embedding;
pub mod error;
pub mod gc;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod queue;
pub mod reaper;
pub mod scheduler;
pub mod schema;
pub mod server;
pub mod stats;
pub mod sync_context;
pub mod traits;
