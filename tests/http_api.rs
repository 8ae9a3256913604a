//! Ingestion API over HTTP: control routes, error contract, and a remote
//! connector driving a run through `HttpIngestionClient`.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{watch, Notify};

use ingest_harness::client::HttpIngestionClient;
use ingest_harness::config::Config;
use ingest_harness::error::SyncError;
use ingest_harness::ingest::IngestionService;
use ingest_harness::models::{DocumentDraft, JsonMap, Source, SyncStatus};
use ingest_harness::sync_context::{CancellationToken, EmitOutcome, SyncContext};
use ingest_harness::traits::{Connector, ConnectorRegistry};
use ingest_harness::{db, migrate, server};

/// Emits one document, then waits until released or cancelled.
struct Blocking {
    release: Arc<Notify>,
}

#[async_trait]
impl Connector for Blocking {
    fn connector_type(&self) -> &str {
        "blocking"
    }
    fn description(&self) -> &str {
        "holds its run open"
    }
    async fn sync(
        &self,
        _source: &Source,
        _state: Option<JsonMap>,
        ctx: &mut SyncContext,
    ) -> Result<Option<JsonMap>, SyncError> {
        ctx.emit(DocumentDraft::new("only", "held open")).await?;
        while !ctx.is_cancelled() {
            tokio::select! {
                _ = self.release.notified() => return Ok(None),
                _ = tokio::time::sleep(Duration::from_millis(20)) => {}
            }
        }
        Err(SyncError::Cancelled)
    }
}

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_for_server(base: &str) {
    let url = format!("{}/health", base);
    for _ in 0..50 {
        if let Ok(resp) = reqwest::get(&url).await {
            if resp.status().is_success() {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("Server did not become ready within 5 seconds");
}

struct TestServer {
    base: String,
    service: Arc<IngestionService>,
    release: Arc<Notify>,
    files: std::path::PathBuf,
    shutdown: watch::Sender<bool>,
    _tmp: TempDir,
}

async fn start() -> TestServer {
    let tmp = TempDir::new().unwrap();
    let port = find_free_port();
    let config: Config = toml::from_str(&format!(
        r#"
[db]
path = "{root}/data/ingest.sqlite"

[server]
bind = "127.0.0.1:{port}"
"#,
        root = tmp.path().display()
    ))
    .unwrap();

    let files = tmp.path().join("files");
    std::fs::create_dir_all(&files).unwrap();
    std::fs::write(files.join("a.md"), "# A").unwrap();
    std::fs::write(files.join("b.md"), "# B").unwrap();
    std::fs::write(files.join("c.txt"), "C").unwrap();

    let pool = db::connect(&config).await.unwrap();
    migrate::apply(&pool).await.unwrap();
    let release = Arc::new(Notify::new());
    let mut registry = ConnectorRegistry::with_builtins();
    registry.register(Arc::new(Blocking {
        release: release.clone(),
    }));
    let service = Arc::new(IngestionService::from_config(pool, &config, Arc::new(registry)).unwrap());
    service
        .register_source("held", "Held", "blocking", JsonMap::new(), JsonMap::new())
        .await
        .unwrap();
    service
        .register_source("remote", "Remote", "blocking", JsonMap::new(), JsonMap::new())
        .await
        .unwrap();

    let (shutdown, rx) = watch::channel(false);
    let bind = config.server.bind.clone();
    let svc = service.clone();
    tokio::spawn(async move { server::run_server(svc, &bind, rx).await });

    let base = format!("http://127.0.0.1:{}", port);
    wait_for_server(&base).await;
    TestServer {
        base,
        service,
        release,
        files,
        shutdown,
        _tmp: tmp,
    }
}

async fn post(base: &str, path: &str, body: Value) -> (u16, Value) {
    let resp = reqwest::Client::new()
        .post(format!("{}{}", base, path))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap_or(Value::Null))
}

async fn wait_for_status(service: &IngestionService, run_id: &str, want: SyncStatus) {
    for _ in 0..100 {
        if let Some(run) = service.get_run(run_id).await.unwrap() {
            if run.status == want {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("run {} never reached {}", run_id, want);
}

#[tokio::test]
async fn health_and_manifest() {
    let srv = start().await;

    let health: Value = reqwest::get(format!("{}/health", srv.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert!(health["version"].is_string());

    let manifest: Value = reqwest::get(format!("{}/manifest", srv.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(manifest["name"], "ingest-harness");
    let names: Vec<&str> = manifest["connectors"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|c| c["name"].as_str())
        .collect();
    assert!(names.contains(&"filesystem"));
    assert!(names.contains(&"blocking"));
    assert!(manifest["actions"]
        .as_array()
        .unwrap()
        .contains(&json!("test_connection")));

    srv.shutdown.send(true).unwrap();
}

#[tokio::test]
async fn sync_conflict_cancel_and_not_found() {
    let srv = start().await;

    let (status, body) = post(
        &srv.base,
        "/sync",
        json!({ "sync_run_id": "r1", "source_id": "held" }),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "started");

    let (status, body) = post(
        &srv.base,
        "/sync",
        json!({ "sync_run_id": "r2", "source_id": "held" }),
    )
    .await;
    assert_eq!(status, 409);
    assert_eq!(body["error"]["code"], "conflict");

    let (status, body) = post(
        &srv.base,
        "/sync",
        json!({ "sync_run_id": "r3", "source_id": "ghost" }),
    )
    .await;
    assert_eq!(status, 404);
    assert_eq!(body["error"]["code"], "not_found");

    let (_, body) = post(&srv.base, "/cancel", json!({ "sync_run_id": "r1" })).await;
    assert_eq!(body["status"], "cancelled");
    wait_for_status(&srv.service, "r1", SyncStatus::Cancelled).await;

    let (_, body) = post(&srv.base, "/cancel", json!({ "sync_run_id": "r1" })).await;
    assert_eq!(body["status"], "not_found");

    let stats: Value = reqwest::get(format!("{}/queue/stats", srv.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["pending"], 1);

    // A released run completes normally.
    let (status, _) = post(
        &srv.base,
        "/sync",
        json!({ "sync_run_id": "r4", "source_id": "held" }),
    )
    .await;
    assert_eq!(status, 200);
    tokio::time::sleep(Duration::from_millis(100)).await;
    srv.release.notify_one();
    wait_for_status(&srv.service, "r4", SyncStatus::Completed).await;

    srv.shutdown.send(true).unwrap();
}

#[tokio::test]
async fn action_dispatch() {
    let srv = start().await;

    let (status, body) = post(
        &srv.base,
        "/action",
        json!({
            "action": "test_connection",
            "connector_type": "filesystem",
            "params": { "root": srv.files.display().to_string(), "include_globs": ["**/*.md"] },
            "credentials": {}
        }),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "success");
    assert_eq!(body["data"]["files"], 2);

    let (_, body) = post(
        &srv.base,
        "/action",
        json!({ "action": "reindex", "connector_type": "filesystem", "params": {}, "credentials": {} }),
    )
    .await;
    assert_eq!(body["status"], "not_supported");

    let (status, body) = post(
        &srv.base,
        "/action",
        json!({ "action": "x", "connector_type": "nope", "params": {}, "credentials": {} }),
    )
    .await;
    assert_eq!(status, 404);
    assert_eq!(body["error"]["code"], "not_found");

    srv.shutdown.send(true).unwrap();
}

#[tokio::test]
async fn remote_connector_drives_a_run_over_http() {
    let srv = start().await;
    let client = Arc::new(HttpIngestionClient::new(srv.base.clone(), Duration::from_secs(5)).unwrap());

    let begun = client.begin_run("remote-1", "remote").await.unwrap();
    assert!(begun.state.is_none());
    assert!(matches!(
        client.begin_run("remote-2", "remote").await,
        Err(ingest_harness::error::IngestError::Conflict(_))
    ));

    let mut ctx = SyncContext::new("remote-1", "remote", client.clone(), CancellationToken::new())
        .with_checkpoint_every(2);
    for i in 0..3 {
        let outcome = ctx
            .emit(DocumentDraft::new(format!("r{}", i), format!("remote body {}", i)))
            .await
            .unwrap();
        assert!(matches!(outcome, EmitOutcome::Emitted { .. }));
        if ctx.checkpoint_due() {
            let mut state = JsonMap::new();
            state.insert("upto".into(), json!(i));
            ctx.save_state(&state).await.unwrap();
        }
    }
    ctx.emit_deleted("r0").await.unwrap();

    // Cancellation requested on the server reaches the remote context.
    assert!(srv.service.cancel_sync("remote-1"));
    ctx.increment_scanned().await.unwrap();
    assert!(ctx.is_cancelled());
    ctx.fail(&SyncError::Cancelled).await.unwrap();

    let run = srv.service.get_run("remote-1").await.unwrap().unwrap();
    assert_eq!(run.status, SyncStatus::Cancelled);
    assert_eq!(run.documents_emitted, 3);
    assert_eq!(run.checkpoint_state.unwrap()["upto"], 1);
    assert_eq!(srv.service.queue().stats().await.unwrap().pending, 4);

    // Terminal runs reject further traffic.
    let (status, body) = post(
        &srv.base,
        "/sdk/runs/remote-1/state",
        json!({ "state": {} }),
    )
    .await;
    assert_eq!(status, 409);
    assert_eq!(body["error"]["code"], "conflict");

    srv.shutdown.send(true).unwrap();
}
