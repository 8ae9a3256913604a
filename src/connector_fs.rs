//! Built-in filesystem connector.
//!
//! Walks a directory tree and emits one document per matching file, keyed
//! by its path relative to the root. Incremental runs resume from a
//! checkpoint mapping every known path to the (mtime, size) it was last
//! emitted with: new or changed files are emitted, paths that vanished are
//! deleted. A path whose emit did not land (unreadable file, body not
//! stored) is kept with a null fingerprint and retried on the next run.
//!
//! ```toml
//! [sources.docs]
//! connector = "filesystem"
//! config = { root = "./docs", include_globs = ["**/*.md"] }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::SyncError;
use crate::models::{DocumentDraft, JsonMap, Source};
use crate::sync_context::{EmitOutcome, SyncContext};
use crate::traits::{ActionResponse, Connector};

const DEFAULT_EXCLUDES: [&str; 3] = ["**/.git/**", "**/target/**", "**/node_modules/**"];

pub struct FilesystemConnector;

#[derive(Debug, Deserialize)]
struct FsSettings {
    root: PathBuf,
    #[serde(default = "default_include")]
    include_globs: Vec<String>,
    #[serde(default)]
    exclude_globs: Vec<String>,
    #[serde(default)]
    follow_symlinks: bool,
}

fn default_include() -> Vec<String> {
    vec!["**/*".to_string()]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    modified: i64,
    size: u64,
}

/// Checkpoint persisted between runs: `{"files": {path: [mtime, size] | null}}`.
#[derive(Debug, Clone, Default)]
struct FsCheckpoint {
    files: BTreeMap<String, Option<Fingerprint>>,
}

impl FsCheckpoint {
    fn from_state(state: Option<&JsonMap>) -> Self {
        let files = state
            .and_then(|s| s.get("files"))
            .and_then(Value::as_object)
            .map(|files| {
                files
                    .iter()
                    .map(|(path, fp)| {
                        let fp = match fp.as_array().map(Vec::as_slice) {
                            Some([modified, size]) => modified
                                .as_i64()
                                .zip(size.as_u64())
                                .map(|(modified, size)| Fingerprint { modified, size }),
                            _ => None,
                        };
                        (path.clone(), fp)
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self { files }
    }

    fn to_state(&self) -> JsonMap {
        let files: serde_json::Map<String, Value> = self
            .files
            .iter()
            .map(|(path, fp)| {
                let fp = match fp {
                    Some(fp) => json!([fp.modified, fp.size]),
                    None => Value::Null,
                };
                (path.clone(), fp)
            })
            .collect();
        let mut state = JsonMap::new();
        state.insert("files".into(), Value::Object(files));
        state
    }
}

#[derive(Debug)]
struct FileEntry {
    path: PathBuf,
    relative: String,
    modified: i64,
    size: u64,
}

impl FsSettings {
    fn parse(config: &JsonMap) -> Result<Self, SyncError> {
        serde_json::from_value(Value::Object(config.clone()))
            .map_err(|e| SyncError::Configuration(format!("invalid filesystem config: {}", e)))
    }

    fn scan(&self) -> Result<Vec<FileEntry>, SyncError> {
        if !self.root.is_dir() {
            return Err(SyncError::Configuration(format!(
                "filesystem root does not exist: {}",
                self.root.display()
            )));
        }
        let include = build_globset(&self.include_globs)?;
        let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        excludes.extend(self.exclude_globs.iter().cloned());
        let exclude = build_globset(&excludes)?;

        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(self.follow_symlinks) {
            let entry = entry.map_err(|e| SyncError::Other(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = relative_key(&self.root, path);
            if exclude.is_match(&relative) || !include.is_match(&relative) {
                continue;
            }
            let meta = entry.metadata().map_err(|e| SyncError::Other(e.into()))?;
            files.push(FileEntry {
                path: path.to_path_buf(),
                relative,
                modified: modified_millis(&meta),
                size: meta.len(),
            });
        }

        files.sort_by(|a, b| a.relative.cmp(&b.relative));
        Ok(files)
    }
}

#[async_trait]
impl Connector for FilesystemConnector {
    fn connector_type(&self) -> &str {
        "filesystem"
    }

    fn description(&self) -> &str {
        "Files under a local directory, filtered by glob"
    }

    fn actions(&self) -> Vec<String> {
        vec!["test_connection".to_string()]
    }

    fn config_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "root": { "type": "string" },
                "include_globs": { "type": "array", "default": ["**/*"] },
                "exclude_globs": { "type": "array", "default": [] },
                "follow_symlinks": { "type": "boolean", "default": false }
            },
            "required": ["root"],
            "additionalProperties": false
        })
    }

    async fn sync(
        &self,
        source: &Source,
        state: Option<JsonMap>,
        ctx: &mut SyncContext,
    ) -> Result<Option<JsonMap>, SyncError> {
        let settings = FsSettings::parse(&source.config)?;
        let previous = FsCheckpoint::from_state(state.as_ref());
        let files = settings.scan()?;

        tracing::info!(
            source_id = %source.id,
            root = %settings.root.display(),
            files = files.len(),
            known = previous.files.len(),
            "filesystem scan finished"
        );

        let mut progress = previous.clone();
        let mut present = BTreeSet::new();

        for file in &files {
            if ctx.is_cancelled() {
                ctx.save_state(&progress.to_state()).await?;
                return Err(SyncError::Cancelled);
            }
            present.insert(file.relative.clone());

            let fingerprint = Fingerprint {
                modified: file.modified,
                size: file.size,
            };
            let known = previous.files.get(&file.relative);
            if known == Some(&Some(fingerprint)) {
                ctx.increment_scanned().await?;
                continue;
            }

            let body = match tokio::fs::read(&file.path).await {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!(path = %file.path.display(), error = %e, "unreadable file skipped");
                    progress.files.insert(file.relative.clone(), None);
                    ctx.increment_scanned().await?;
                    continue;
                }
            };
            let document = DocumentDraft::new(file.relative.clone(), body)
                .with_title(file_name(&file.path))
                .with_content_type(content_type_for(&file.path))
                .with_metadata("path", file.relative.clone())
                .with_metadata("size_bytes", file.size)
                .with_metadata("modified_at", file.modified);

            let outcome = if matches!(known, Some(Some(_))) {
                ctx.emit_updated(document).await?
            } else {
                ctx.emit(document).await?
            };
            let landed = match outcome {
                EmitOutcome::Emitted { .. } => Some(fingerprint),
                EmitOutcome::Skipped => None,
            };
            progress.files.insert(file.relative.clone(), landed);
            if ctx.checkpoint_due() {
                ctx.save_state(&progress.to_state()).await?;
            }
        }

        for gone in previous.files.keys().filter(|p| !present.contains(*p)) {
            if ctx.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            ctx.emit_deleted(gone).await?;
        }

        progress.files.retain(|path, _| present.contains(path));
        Ok(Some(progress.to_state()))
    }

    async fn execute_action(
        &self,
        action: &str,
        params: JsonMap,
        _credentials: JsonMap,
    ) -> ActionResponse {
        match action {
            "test_connection" => {
                let settings = match FsSettings::parse(&params) {
                    Ok(s) => s,
                    Err(e) => return ActionResponse::failure(e.to_string()),
                };
                match settings.scan() {
                    Ok(files) => ActionResponse::success(json!({
                        "root": settings.root.display().to_string(),
                        "files": files.len(),
                    })),
                    Err(e) => ActionResponse::failure(e.to_string()),
                }
            }
            other => ActionResponse::not_supported(other),
        }
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, SyncError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| SyncError::Configuration(format!("bad glob {}: {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| SyncError::Configuration(e.to_string()))
}

/// Root-relative path with `/` separators on every platform.
fn relative_key(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn modified_millis(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("md" | "markdown") => "text/markdown",
        Some("txt" | "rst" | "log") => "text/plain",
        Some("json") => "application/json",
        Some("html" | "htm") => "text/html",
        Some("csv") => "text/csv",
        Some("toml" | "yaml" | "yml" | "rs" | "py" | "js" | "ts" | "go") => "text/plain",
        _ => "application/octet-stream",
    }
}
