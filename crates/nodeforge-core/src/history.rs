//! Per-node append-only history log (§4.3, §6.4).
//!
//! Storage layout: `<base_dir>/<server>/<session>/<node_id>/history.ndjson`, one
//! self-contained JSON record per line. Writing is best-effort — a node never fails
//! `execute` because its history writer couldn't keep up.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryOp {
    Input,
    Output,
    Lifecycle,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub timestamp: DateTime<Utc>,
    pub node_id: String,
    pub op: HistoryOp,
    pub payload: serde_json::Value,
}

/// Configuration resolved once per session (§3.1 Session: "configuration for history
/// logging").
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    pub enabled: bool,
    pub base_dir: PathBuf,
    pub server_name: String,
    pub session_name: String,
}

/// Append-only per-node history sink. Cheap to clone; the underlying file handle is
/// shared behind a mutex so concurrent writers from the same node serialize safely
/// (though in practice a node's single-writer lock already prevents that).
#[derive(Clone)]
pub struct HistoryWriter {
    inner: Option<Arc<HistoryInner>>,
    node_id: String,
}

struct HistoryInner {
    path: PathBuf,
    file: Mutex<Option<tokio::fs::File>>,
}

impl HistoryWriter {
    /// A writer that silently drops everything — used when a session has history
    /// logging disabled or for ephemeral test fixtures that don't need a trail.
    pub fn disabled(node_id: impl Into<String>) -> Self {
        Self {
            inner: None,
            node_id: node_id.into(),
        }
    }

    pub fn new(config: &HistoryConfig, node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        if !config.enabled {
            return Self::disabled(node_id);
        }
        let path = config
            .base_dir
            .join(&config.server_name)
            .join(&config.session_name)
            .join(&node_id)
            .join("history.ndjson");
        Self {
            inner: Some(Arc::new(HistoryInner {
                path,
                file: Mutex::new(None),
            })),
            node_id,
        }
    }

    pub async fn record(&self, op: HistoryOp, payload: serde_json::Value) {
        let Some(inner) = &self.inner else { return };
        let record = HistoryRecord {
            timestamp: Utc::now(),
            node_id: self.node_id.clone(),
            op,
            payload,
        };
        if let Err(e) = Self::append(inner, &record).await {
            warn!(node_id = %self.node_id, error = %e, "history write failed; continuing");
        }
    }

    async fn append(inner: &HistoryInner, record: &HistoryRecord) -> std::io::Result<()> {
        let mut guard = inner.file.lock().await;
        if guard.is_none() {
            if let Some(parent) = inner.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&inner.path)
                .await?;
            *guard = Some(file);
        }
        let file = guard.as_mut().expect("just initialized");
        let mut line = serde_json::to_string(record).map_err(std::io::Error::other)?;
        line.push('\n');
        file.write_all(line.as_bytes()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn config(base: &std::path::Path) -> HistoryConfig {
        HistoryConfig {
            enabled: true,
            base_dir: base.to_path_buf(),
            server_name: "srv".to_string(),
            session_name: "default".to_string(),
        }
    }

    #[tokio::test]
    async fn records_are_appended_as_ndjson() {
        let dir = tempfile::tempdir().unwrap();
        let writer = HistoryWriter::new(&config(dir.path()), "node-1");
        writer.record(HistoryOp::Input, serde_json::json!({"text": "hi"})).await;
        writer.record(HistoryOp::Output, serde_json::json!({"text": "hello"})).await;

        let path = dir.path().join("srv/default/node-1/history.ndjson");
        let mut contents = String::new();
        std::fs::File::open(&path).unwrap().read_to_string(&mut contents).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: HistoryRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.node_id, "node-1");
    }

    #[tokio::test]
    async fn disabled_writer_creates_no_files() {
        let dir = tempfile::tempdir().unwrap();
        let writer = HistoryWriter::disabled("node-2");
        writer.record(HistoryOp::Input, serde_json::json!({})).await;
        assert!(!dir.path().join("srv").exists());
    }
}
