//! # Ingest Harness CLI (`ingest`)
//!
//! ## Usage
//!
//! ```bash
//! ingest --config ./config/ingest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ingest init` | Create the SQLite database and run schema migrations |
//! | `ingest source add` | Register every `[sources.*]` entry of the config |
//! | `ingest source list` | List registered sources |
//! | `ingest sync <source>` | Run one sync in-process and materialize its events |
//! | `ingest serve` | Ingestion API, scheduled syncs and every background worker |
//! | `ingest queue stats\|retry\|reap\|purge` | Event queue maintenance |
//! | `ingest gc run [--dry-run]` / `ingest gc stats` | Content garbage collection |
//! | `ingest batch tick` | One embedding batch pass |
//! | `ingest stats` | Corpus summary |

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use ingest_harness::batch::{self, BatchOrchestrator};
use ingest_harness::config::{self, Config};
use ingest_harness::consumer::{self, Consumer};
use ingest_harness::gc::{self, GcOptions};
use ingest_harness::ingest::IngestionService;
use ingest_harness::traits::ConnectorRegistry;
use ingest_harness::{db, logging, migrate, queue, reaper, scheduler, server, stats};

/// Connector sync protocol and ingestion pipeline.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(name = "ingest", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ingest.toml")]
    config: PathBuf,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Manage sources.
    Source {
        #[command(subcommand)]
        action: SourceAction,
    },

    /// Run one sync of a registered source and wait for it.
    ///
    /// Events the run produced are materialized before the command exits.
    Sync {
        /// Source id (a `[sources.<id>]` key).
        source: String,
    },

    /// Start the Ingestion API with the consumer pool, reaper, retry
    /// sweep, content GC and batch orchestrator.
    Serve,

    /// Inspect and maintain the event queue.
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Content garbage collection.
    Gc {
        #[command(subcommand)]
        action: GcAction,
    },

    /// Embedding batches.
    Batch {
        #[command(subcommand)]
        action: BatchAction,
    },

    /// Show corpus statistics.
    Stats,
}

#[derive(Subcommand)]
enum SourceAction {
    /// Register (or update) every source declared in the config file.
    Add,
    /// List registered sources.
    List,
}

#[derive(Subcommand)]
enum QueueAction {
    /// Row counts by status.
    Stats,
    /// Requeue failed events that have retries left.
    Retry,
    /// Reset processing rows older than `reaper.stale_after_secs`.
    Reap,
    /// Delete completed events older than the given age.
    Purge {
        #[arg(long, default_value_t = 7)]
        older_than_days: u64,
    },
}

#[derive(Subcommand)]
enum GcAction {
    /// Run one mark-and-sweep cycle.
    Run {
        /// Report what would be deleted without deleting it.
        #[arg(long)]
        dry_run: bool,
    },
    /// Orphan statistics.
    Stats,
}

#[derive(Subcommand)]
enum BatchAction {
    /// Accumulate, submit and poll once.
    Tick,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Source { action } => {
            let service = open_service(&cfg).await?;
            match action {
                SourceAction::Add => {
                    let n = service.sync_sources_from_config(&cfg).await?;
                    println!("Registered {} source(s).", n);
                }
                SourceAction::List => {
                    let sources = service.list_sources().await?;
                    if sources.is_empty() {
                        println!("No sources registered. Run `ingest source add`.");
                    }
                    for s in sources {
                        let state = if s.sync_state.is_some() {
                            "checkpointed"
                        } else {
                            "never synced"
                        };
                        let schedule = match s.sync_interval_secs {
                            Some(secs) => format!("every {}s", secs),
                            None => "manual".to_string(),
                        };
                        println!(
                            "  {:<24} {:<12} {:<14} {}",
                            s.id, s.connector_type, schedule, state
                        );
                    }
                }
            }
            service.pool().close().await;
        }
        Commands::Sync { source } => run_sync(&cfg, &source).await?,
        Commands::Serve => run_serve(&cfg).await?,
        Commands::Queue { action } => {
            let pool = open_pool(&cfg).await?;
            let queue = queue::EventQueue::new(pool.clone(), cfg.queue.max_retries);
            match action {
                QueueAction::Stats => {
                    let s = queue.stats().await?;
                    println!("pending:    {}", s.pending);
                    println!("processing: {}", s.processing);
                    println!("completed:  {}", s.completed);
                    println!("failed:     {} ({} exhausted)", s.failed, s.exhausted);
                }
                QueueAction::Retry => {
                    println!("Requeued {} failed event(s).", queue.retry_failed().await?);
                }
                QueueAction::Reap => {
                    let stale_after = Duration::from_secs(cfg.reaper.stale_after_secs);
                    let n = reaper::reap_stale(&pool, stale_after).await?;
                    println!("Reset {} stale event(s).", n);
                }
                QueueAction::Purge { older_than_days } => {
                    let cutoff = db::now_millis() - (older_than_days as i64) * 86_400_000;
                    println!(
                        "Purged {} completed event(s).",
                        queue.purge_completed(cutoff).await?
                    );
                }
            }
            pool.close().await;
        }
        Commands::Gc { action } => {
            let service = open_service(&cfg).await?;
            match action {
                GcAction::Run { dry_run } => {
                    let opts = GcOptions::from_config(&cfg.gc, dry_run);
                    let report = gc::run_gc(service.content(), &opts).await?;
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
                GcAction::Stats => {
                    let grace = Duration::from_secs(cfg.gc.grace_period_secs);
                    let s = gc::orphan_stats(service.content(), grace).await?;
                    println!("{}", serde_json::to_string_pretty(&s)?);
                }
            }
            service.pool().close().await;
        }
        Commands::Batch {
            action: BatchAction::Tick,
        } => {
            let pool = open_pool(&cfg).await?;
            let Some(orchestrator) = BatchOrchestrator::from_config(pool.clone(), &cfg)? else {
                bail!("embedding provider is disabled; set [embedding].provider");
            };
            let report = orchestrator.tick().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            pool.close().await;
        }
        Commands::Stats => {
            migrate::run_migrations(&cfg).await?;
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}

async fn open_pool(cfg: &Config) -> Result<sqlx::SqlitePool> {
    let pool = db::connect(cfg).await?;
    migrate::apply(&pool).await?;
    Ok(pool)
}

async fn open_service(cfg: &Config) -> Result<Arc<IngestionService>> {
    let pool = open_pool(cfg).await?;
    let connectors = Arc::new(ConnectorRegistry::with_builtins());
    Ok(Arc::new(IngestionService::from_config(pool, cfg, connectors)?))
}

async fn run_sync(cfg: &Config, source_id: &str) -> Result<()> {
    let service = open_service(cfg).await?;
    service.sync_sources_from_config(cfg).await?;
    service
        .recover_stale_runs(Duration::from_secs(cfg.scheduler.stale_sync_timeout_secs))
        .await?;

    let run_id = uuid::Uuid::new_v4().to_string();
    let handle = service.start_sync(&run_id, source_id).await?;
    handle.await.context("sync task panicked")?;

    let consumer = Consumer::from_config(service.pool().clone(), cfg);
    let applied = consumer::drain(&consumer, cfg.queue.consumers).await?;

    let run = service
        .get_run(&run_id)
        .await?
        .with_context(|| format!("sync run {} vanished", run_id))?;
    println!(
        "sync {} {}: {} scanned, {} emitted, {} event(s) applied",
        run.id, run.status, run.documents_scanned, run.documents_emitted, applied
    );
    if let Some(err) = &run.error_message {
        println!("  error: {}", err);
    }
    service.pool().close().await;

    if run.status != ingest_harness::models::SyncStatus::Completed {
        bail!("sync {} ended {}", run.id, run.status);
    }
    Ok(())
}

async fn run_serve(cfg: &Config) -> Result<()> {
    let service = open_service(cfg).await?;
    service.sync_sources_from_config(cfg).await?;

    let pool = service.pool().clone();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut workers = consumer::spawn_pool(
        Consumer::from_config(pool.clone(), cfg),
        cfg.queue.consumers,
        Duration::from_millis(cfg.queue.poll_interval_ms),
        shutdown_rx.clone(),
    );
    workers.spawn(reaper::run_reaper(
        pool.clone(),
        Duration::from_secs(cfg.reaper.interval_secs),
        Duration::from_secs(cfg.reaper.stale_after_secs),
        shutdown_rx.clone(),
    ));
    workers.spawn(scheduler::run_scheduler(
        service.clone(),
        Duration::from_secs(cfg.scheduler.interval_secs),
        Duration::from_secs(cfg.scheduler.stale_sync_timeout_secs),
        shutdown_rx.clone(),
    ));
    workers.spawn(queue::run_retry_sweep(
        service.queue().clone(),
        Duration::from_secs(cfg.queue.retry_interval_secs),
        shutdown_rx.clone(),
    ));
    workers.spawn(gc::run_gc_loop(
        service.content().clone(),
        GcOptions::from_config(&cfg.gc, false),
        Duration::from_secs(cfg.gc.interval_secs),
        shutdown_rx.clone(),
    ));
    match BatchOrchestrator::from_config(pool.clone(), cfg)? {
        Some(orchestrator) => {
            workers.spawn(batch::run_batch_loop(
                orchestrator,
                Duration::from_secs(cfg.batch.poll_interval_secs),
                shutdown_rx.clone(),
            ));
        }
        None => tracing::info!("embedding disabled, batch orchestrator not started"),
    }

    let bind = cfg.server.bind.clone();
    let mut api = tokio::spawn(async move { server::run_server(service, &bind, shutdown_rx).await });

    let served = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            tracing::info!("shutting down");
            None
        }
        served = &mut api => Some(served),
    };
    let _ = shutdown_tx.send(true);
    let result = match served {
        Some(served) => served,
        None => api.await,
    }
    .context("server task panicked")?;

    while workers.join_next().await.is_some() {}
    pool.close().await;
    result
}
