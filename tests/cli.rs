//! Smoke tests for the `ingest` binary.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha\n\nThe alpha document.\n\nIt talks about cargo and crates.",
    )
    .unwrap();
    fs::write(files_dir.join("beta.md"), "# Beta\n\nThe beta document.").unwrap();
    fs::write(files_dir.join("gamma.txt"), "Gamma plain text.").unwrap();
    fs::write(files_dir.join("skip.bin"), [0u8, 1, 2]).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/ingest.sqlite"

[server]
bind = "127.0.0.1:0"

[content]
object_store_path = "{root}/blobs"

[queue]
consumers = 2

[sources.docs]
connector = "filesystem"
config = {{ root = "{root}/files", include_globs = ["**/*.md", "**/*.txt"] }}
sync_interval_secs = 3600
"#,
        root = root.display()
    );

    let config_path = root.join("ingest.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_ingest(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_ingest"))
        .arg("--config")
        .arg(config_path)
        .args(args)
        .output()
        .expect("failed to run ingest binary");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn init_is_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, ok) = run_ingest(&config_path, &["init"]);
    assert!(ok, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));

    let (_, _, ok) = run_ingest(&config_path, &["init"]);
    assert!(ok, "second init failed");
}

#[test]
fn source_add_and_list() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, ok) = run_ingest(&config_path, &["source", "add"]);
    assert!(ok, "source add failed: {}", stderr);
    assert!(stdout.contains("Registered 1 source"));

    let (stdout, _, ok) = run_ingest(&config_path, &["source", "list"]);
    assert!(ok);
    assert!(stdout.contains("docs"));
    assert!(stdout.contains("filesystem"));
    assert!(stdout.contains("every 3600s"));
    assert!(stdout.contains("never synced"));
}

#[test]
fn sync_is_incremental_and_detects_deletes() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, ok) = run_ingest(&config_path, &["sync", "docs"]);
    assert!(ok, "sync failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("completed"), "{}", stdout);
    assert!(stdout.contains("3 emitted"), "{}", stdout);
    assert!(stdout.contains("3 event(s) applied"), "{}", stdout);

    let (stdout, _, ok) = run_ingest(&config_path, &["sync", "docs"]);
    assert!(ok);
    assert!(stdout.contains("0 emitted"), "unchanged files re-emitted: {}", stdout);

    fs::remove_file(tmp.path().join("files/gamma.txt")).unwrap();
    let (stdout, _, ok) = run_ingest(&config_path, &["sync", "docs"]);
    assert!(ok);
    assert!(stdout.contains("1 event(s) applied"), "{}", stdout);

    let (stdout, _, ok) = run_ingest(&config_path, &["stats"]);
    assert!(ok);
    assert!(stdout.contains("Documents:   2"), "{}", stdout);
}

#[test]
fn unknown_source_fails() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, ok) = run_ingest(&config_path, &["sync", "nope"]);
    assert!(!ok);
    assert!(stderr.contains("not found"), "{}", stderr);
}

#[test]
fn queue_and_gc_maintenance() {
    let (_tmp, config_path) = setup_test_env();
    run_ingest(&config_path, &["sync", "docs"]);

    let (stdout, _, ok) = run_ingest(&config_path, &["queue", "stats"]);
    assert!(ok);
    assert!(stdout.contains("completed:  3"), "{}", stdout);

    let (stdout, _, ok) = run_ingest(&config_path, &["queue", "retry"]);
    assert!(ok);
    assert!(stdout.contains("Requeued 0"));

    let (stdout, _, ok) = run_ingest(&config_path, &["queue", "reap"]);
    assert!(ok);
    assert!(stdout.contains("Reset 0"));

    let (stdout, stderr, ok) = run_ingest(&config_path, &["gc", "run", "--dry-run"]);
    assert!(ok, "gc failed: {}", stderr);
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(report["blobs_deleted"], 0);

    let (stdout, _, ok) = run_ingest(&config_path, &["gc", "stats"]);
    assert!(ok);
    let stats: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(stats["total_blobs"], 3);
}

#[test]
fn batch_tick_requires_an_embedding_provider() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, ok) = run_ingest(&config_path, &["batch", "tick"]);
    assert!(!ok);
    assert!(stderr.contains("disabled"), "{}", stderr);
}
