//! File-backed worker artifact store.
//!
//! Every spawned worker owns a private directory `<base>/<worker_id>/`:
//!
//! ```text
//! <base>/
//!   index.json                      — one entry per worker
//!   <worker_id>/
//!     metadata.json                 — status, timestamps, owner, config, summary
//!     result.txt                    — canonical final output (never truncated)
//!     thread.jsonl                  — append-only conversation log
//!     tool_calls/<NNN>_<tool>.txt   — one file per tool call, execution order
//!     monitoring/check_<N>s.json    — roundabout snapshots
//! ```
//!
//! Status truth lives in `metadata.json` (mirrored on the `WorkerJob` row);
//! the derived `summary` is best-effort, regenerable from `result.txt`, and
//! never feeds system decisions.
//!
//! # Access control
//!
//! Every read takes the caller's owner id and fails on mismatch (`None`
//! bypasses the check for system/admin callers). Relative paths containing
//! `..` or escaping the worker directory are rejected outright.

use crate::overmind::models::Id;
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::error::Error;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

const SLUG_MAX_LEN: usize = 30;
const SUMMARY_PREVIEW_CHARS: usize = 200;

/// Errors from artifact operations.
#[derive(Debug)]
pub enum ArtifactError {
    NotFound(String),
    /// Caller's owner id does not match the artifact's.
    AccessDenied(String),
    /// Path contains `..` or resolves outside the worker directory.
    InvalidPath(String),
    Io(std::io::Error),
}

impl fmt::Display for ArtifactError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactError::NotFound(id) => write!(f, "worker {} not found", id),
            ArtifactError::AccessDenied(id) => write!(f, "access denied to worker {}", id),
            ArtifactError::InvalidPath(p) => write!(f, "invalid artifact path {:?}", p),
            ArtifactError::Io(e) => write!(f, "artifact io error: {}", e),
        }
    }
}

impl Error for ArtifactError {}

impl From<std::io::Error> for ArtifactError {
    fn from(e: std::io::Error) -> Self {
        ArtifactError::Io(e)
    }
}

/// The artifact store rooted at a base directory.
pub struct WorkerArtifactStore {
    base: PathBuf,
}

impl WorkerArtifactStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base_path(&self) -> &Path {
        &self.base
    }

    /// Create the artifact directory for a new worker and return its id,
    /// formatted `<compact-utc-timestamp>_<slug>`.
    pub fn create_worker(
        &self,
        task: &str,
        owner_id: Id,
        config: Value,
    ) -> Result<String, ArtifactError> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        let mut worker_id = format!("{}_{}", stamp, slugify(task));
        // Same task within the same second: disambiguate.
        let mut n = 1;
        while self.base.join(&worker_id).exists() {
            n += 1;
            worker_id = format!("{}_{}-{}", stamp, slugify(task), n);
        }

        let dir = self.base.join(&worker_id);
        fs::create_dir_all(dir.join("tool_calls"))?;
        fs::create_dir_all(dir.join("monitoring"))?;

        let metadata = json!({
            "worker_id": worker_id,
            "task": task,
            "owner_id": owner_id,
            "status": "queued",
            "config": config,
            "created_at": Utc::now().to_rfc3339(),
            "started_at": null,
            "finished_at": null,
            "error": null,
            "summary": null,
            "summary_meta": null,
        });
        write_json(&dir.join("metadata.json"), &metadata)?;
        self.update_index(&worker_id, &metadata)?;
        Ok(worker_id)
    }

    /// Mark a worker as running.
    pub fn start_worker(&self, worker_id: &str) -> Result<(), ArtifactError> {
        self.patch_metadata(worker_id, |meta| {
            meta.insert("status".into(), Value::from("running"));
            meta.insert("started_at".into(), Value::from(Utc::now().to_rfc3339()));
        })
    }

    /// Record one tool call's output under `tool_calls/<NNN>_<tool>.txt`.
    pub fn save_tool_output(
        &self,
        worker_id: &str,
        seq: usize,
        tool_name: &str,
        content: &str,
    ) -> Result<(), ArtifactError> {
        let dir = self.worker_dir(worker_id)?;
        let file = dir
            .join("tool_calls")
            .join(format!("{:03}_{}.txt", seq, slugify(tool_name)));
        fs::write(file, content)?;
        Ok(())
    }

    /// Append a conversation message to `thread.jsonl`.
    pub fn save_message(&self, worker_id: &str, message: &Value) -> Result<(), ArtifactError> {
        let dir = self.worker_dir(worker_id)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("thread.jsonl"))?;
        writeln!(file, "{}", serde_json::to_string(message).unwrap_or_default())?;
        Ok(())
    }

    /// Write the canonical final output. Never truncated, never deleted.
    pub fn save_result(&self, worker_id: &str, result: &str) -> Result<(), ArtifactError> {
        let dir = self.worker_dir(worker_id)?;
        fs::write(dir.join("result.txt"), result)?;
        Ok(())
    }

    /// Terminate a worker's metadata and derive the best-effort summary from
    /// `result.txt`.
    pub fn complete_worker(
        &self,
        worker_id: &str,
        status: &str,
        error: Option<&str>,
    ) -> Result<(), ArtifactError> {
        let summary = self.derive_summary(worker_id);
        self.patch_metadata(worker_id, |meta| {
            meta.insert("status".into(), Value::from(status));
            meta.insert("finished_at".into(), Value::from(Utc::now().to_rfc3339()));
            meta.insert(
                "error".into(),
                error.map(Value::from).unwrap_or(Value::Null),
            );
            if let Some(summary) = &summary {
                meta.insert("summary".into(), Value::from(summary.clone()));
                meta.insert(
                    "summary_meta".into(),
                    json!({
                        "derived_from": "result.txt",
                        "generated_at": Utc::now().to_rfc3339(),
                    }),
                );
            }
        })
    }

    /// Write a roundabout monitoring snapshot.
    pub fn save_monitoring_check(
        &self,
        worker_id: &str,
        elapsed_secs: u64,
        snapshot: &Value,
    ) -> Result<(), ArtifactError> {
        let dir = self.worker_dir(worker_id)?;
        let file = dir
            .join("monitoring")
            .join(format!("check_{}s.json", elapsed_secs));
        write_json(&file, snapshot)?;
        Ok(())
    }

    /// Regenerate the summary from `result.txt` (first ~200 chars).
    pub fn derive_summary(&self, worker_id: &str) -> Option<String> {
        let dir = self.base.join(worker_id);
        let result = fs::read_to_string(dir.join("result.txt")).ok()?;
        let trimmed = result.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.chars().count() <= SUMMARY_PREVIEW_CHARS {
            Some(trimmed.to_string())
        } else {
            let preview: String = trimmed.chars().take(SUMMARY_PREVIEW_CHARS - 1).collect();
            Some(format!("{}…", preview))
        }
    }

    // -- Reads (owner-enforced) --------------------------------------------

    /// Read a worker's metadata. `owner_id = None` bypasses the ownership
    /// check (system/admin callers only).
    pub fn get_worker_metadata(
        &self,
        worker_id: &str,
        owner_id: Option<Id>,
    ) -> Result<Value, ArtifactError> {
        let dir = self.worker_dir(worker_id)?;
        let metadata: Value = read_json(&dir.join("metadata.json"))?;
        self.enforce_owner(worker_id, &metadata, owner_id)?;
        Ok(metadata)
    }

    /// Read the canonical result.
    pub fn get_worker_result(
        &self,
        worker_id: &str,
        owner_id: Option<Id>,
    ) -> Result<String, ArtifactError> {
        let metadata = self.get_worker_metadata(worker_id, owner_id)?;
        let _ = metadata;
        let dir = self.worker_dir(worker_id)?;
        Ok(fs::read_to_string(dir.join("result.txt")).unwrap_or_default())
    }

    /// Read an arbitrary file inside the worker directory. Rejects any path
    /// containing `..` (or absolute components) before touching the
    /// filesystem.
    pub fn read_worker_file(
        &self,
        worker_id: &str,
        relative_path: &str,
        owner_id: Option<Id>,
    ) -> Result<String, ArtifactError> {
        let metadata = self.get_worker_metadata(worker_id, owner_id)?;
        let _ = metadata;

        let relative = Path::new(relative_path);
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                _ => return Err(ArtifactError::InvalidPath(relative_path.to_string())),
            }
        }

        let dir = self.worker_dir(worker_id)?;
        let target = dir.join(relative);
        if !target.starts_with(&dir) {
            return Err(ArtifactError::InvalidPath(relative_path.to_string()));
        }
        fs::read_to_string(&target).map_err(|_| ArtifactError::NotFound(relative_path.to_string()))
    }

    /// List workers from the index, optionally filtered by owner.
    pub fn list_workers(&self, owner_id: Option<Id>) -> Vec<Value> {
        let index = self.read_index();
        index
            .into_iter()
            .filter(|entry| match owner_id {
                // Entries without an owner are public-by-absence.
                Some(uid) => entry
                    .get("owner_id")
                    .and_then(|v| v.as_i64())
                    .map(|o| o == uid)
                    .unwrap_or(true),
                None => true,
            })
            .collect()
    }

    // -- Internals ---------------------------------------------------------

    fn worker_dir(&self, worker_id: &str) -> Result<PathBuf, ArtifactError> {
        // Worker ids are path segments; anything else is hostile.
        if worker_id.contains('/') || worker_id.contains("..") || worker_id.contains('\\') {
            return Err(ArtifactError::InvalidPath(worker_id.to_string()));
        }
        let dir = self.base.join(worker_id);
        if !dir.is_dir() {
            return Err(ArtifactError::NotFound(worker_id.to_string()));
        }
        Ok(dir)
    }

    fn enforce_owner(
        &self,
        worker_id: &str,
        metadata: &Value,
        owner_id: Option<Id>,
    ) -> Result<(), ArtifactError> {
        if let Some(requester) = owner_id {
            if let Some(owner) = metadata.get("owner_id").and_then(|v| v.as_i64()) {
                if owner != requester {
                    return Err(ArtifactError::AccessDenied(worker_id.to_string()));
                }
            }
        }
        Ok(())
    }

    fn patch_metadata<F>(&self, worker_id: &str, patch: F) -> Result<(), ArtifactError>
    where
        F: FnOnce(&mut Map<String, Value>),
    {
        let dir = self.worker_dir(worker_id)?;
        let path = dir.join("metadata.json");
        let mut metadata: Value = read_json(&path)?;
        if let Some(map) = metadata.as_object_mut() {
            patch(map);
        }
        write_json(&path, &metadata)?;
        self.update_index(worker_id, &metadata)?;
        Ok(())
    }

    fn read_index(&self) -> Vec<Value> {
        read_json::<Vec<Value>>(&self.base.join("index.json")).unwrap_or_default()
    }

    fn update_index(&self, worker_id: &str, metadata: &Value) -> Result<(), ArtifactError> {
        fs::create_dir_all(&self.base)?;
        let mut index = self.read_index();
        let entry = json!({
            "worker_id": worker_id,
            "task": metadata.get("task").cloned().unwrap_or(Value::Null),
            "owner_id": metadata.get("owner_id").cloned().unwrap_or(Value::Null),
            "status": metadata.get("status").cloned().unwrap_or(Value::Null),
            "created_at": metadata.get("created_at").cloned().unwrap_or(Value::Null),
            "summary": metadata.get("summary").cloned().unwrap_or(Value::Null),
        });
        match index
            .iter_mut()
            .find(|e| e.get("worker_id").and_then(|v| v.as_str()) == Some(worker_id))
        {
            Some(existing) => *existing = entry,
            None => index.push(entry),
        }
        write_json(&self.base.join("index.json"), &Value::Array(index))?;
        Ok(())
    }
}

fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(SLUG_MAX_LEN);
    for ch in text.chars() {
        if slug.len() >= SLUG_MAX_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    let trimmed = slug.trim_matches('-').to_string();
    if trimmed.is_empty() {
        "worker".to_string()
    } else {
        trimmed
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ArtifactError> {
    let raw = fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|e| {
        ArtifactError::Io(std::io::Error::other(format!(
            "corrupt json at {:?}: {}",
            path, e
        )))
    })
}

fn write_json(path: &Path, value: &Value) -> Result<(), ArtifactError> {
    let raw = serde_json::to_string_pretty(value)
        .map_err(|e| ArtifactError::Io(std::io::Error::other(e.to_string())))?;
    fs::write(path, raw)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_worker_id_format_and_layout() {
        let dir = tempdir().unwrap();
        let store = WorkerArtifactStore::new(dir.path());
        let worker_id = store
            .create_worker("Fix the Build!", 7, json!({"model": "gpt-4o"}))
            .unwrap();

        assert!(worker_id.contains("_fix-the-build"));
        assert!(dir.path().join(&worker_id).join("tool_calls").is_dir());
        assert!(dir.path().join(&worker_id).join("monitoring").is_dir());
        assert!(dir.path().join("index.json").is_file());
    }

    #[test]
    fn test_owner_enforcement() {
        let dir = tempdir().unwrap();
        let store = WorkerArtifactStore::new(dir.path());
        let worker_id = store.create_worker("task", 1, json!({})).unwrap();
        store.save_result(&worker_id, "the answer").unwrap();

        assert!(store.get_worker_result(&worker_id, Some(1)).is_ok());
        assert!(matches!(
            store.get_worker_result(&worker_id, Some(2)),
            Err(ArtifactError::AccessDenied(_))
        ));
        // System callers bypass the check.
        assert_eq!(
            store.get_worker_result(&worker_id, None).unwrap(),
            "the answer"
        );
    }

    #[test]
    fn test_path_traversal_is_rejected() {
        let dir = tempdir().unwrap();
        let store = WorkerArtifactStore::new(dir.path());
        let worker_id = store.create_worker("task", 1, json!({})).unwrap();

        assert!(matches!(
            store.read_worker_file(&worker_id, "../other/metadata.json", Some(1)),
            Err(ArtifactError::InvalidPath(_))
        ));
        assert!(matches!(
            store.read_worker_file(&worker_id, "/etc/passwd", Some(1)),
            Err(ArtifactError::InvalidPath(_))
        ));
        assert!(matches!(
            store.get_worker_metadata("../sneaky", Some(1)),
            Err(ArtifactError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_summary_derivation_and_completion() {
        let dir = tempdir().unwrap();
        let store = WorkerArtifactStore::new(dir.path());
        let worker_id = store.create_worker("task", 1, json!({})).unwrap();
        store.start_worker(&worker_id).unwrap();
        store
            .save_result(&worker_id, &"long output ".repeat(50))
            .unwrap();
        store.complete_worker(&worker_id, "success", None).unwrap();

        let metadata = store.get_worker_metadata(&worker_id, Some(1)).unwrap();
        assert_eq!(metadata["status"], "success");
        let summary = metadata["summary"].as_str().unwrap();
        assert!(summary.chars().count() <= SUMMARY_PREVIEW_CHARS);
        assert_eq!(metadata["summary_meta"]["derived_from"], "result.txt");

        // result.txt stays intact and untruncated.
        let result = store.get_worker_result(&worker_id, Some(1)).unwrap();
        assert_eq!(result.len(), "long output ".len() * 50);
    }

    #[test]
    fn test_tool_outputs_and_thread_log() {
        let dir = tempdir().unwrap();
        let store = WorkerArtifactStore::new(dir.path());
        let worker_id = store.create_worker("task", 1, json!({})).unwrap();

        store.save_tool_output(&worker_id, 1, "calculator", "42").unwrap();
        store
            .save_message(&worker_id, &json!({"role": "user", "content": "go"}))
            .unwrap();
        store
            .save_message(&worker_id, &json!({"role": "assistant", "content": "done"}))
            .unwrap();

        let tool_out = store
            .read_worker_file(&worker_id, "tool_calls/001_calculator.txt", Some(1))
            .unwrap();
        assert_eq!(tool_out, "42");
        let log = store
            .read_worker_file(&worker_id, "thread.jsonl", Some(1))
            .unwrap();
        assert_eq!(log.lines().count(), 2);
    }

    #[test]
    fn test_list_workers_filters_by_owner() {
        let dir = tempdir().unwrap();
        let store = WorkerArtifactStore::new(dir.path());
        store.create_worker("one", 1, json!({})).unwrap();
        store.create_worker("two", 2, json!({})).unwrap();

        assert_eq!(store.list_workers(Some(1)).len(), 1);
        assert_eq!(store.list_workers(None).len(), 2);
    }
}
