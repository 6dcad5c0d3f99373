//! Request audit log
//!
//! One JSON line per completed chat request, appended to a file, plus a
//! bounded in-memory ring for the admin logs endpoint. The ring is updated
//! inline; the file append happens on a background writer task fed through a
//! bounded channel, so a slow or stuck sink never holds up a response. Write
//! failures and a full channel are logged and the line is dropped.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

/// Credential marker for requests that never leased one.
pub const NO_CREDENTIAL: &str = "none";

/// One completed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Unix timestamp in milliseconds
    pub timestamp: u64,
    pub request_id: String,
    pub model: String,
    /// Masked hash of the last credential used, or [`NO_CREDENTIAL`]
    pub credential: String,
    pub status: u16,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub stream: bool,
    /// Upstream calls made, including the successful one
    pub attempts: u32,
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Lines buffered for the writer before new ones are dropped.
const WRITER_CAPACITY: usize = 4096;

enum WriterMsg {
    Line(String),
    Flush(oneshot::Sender<()>),
}

/// Append-only audit sink.
pub struct AuditLog {
    path: PathBuf,
    retention: usize,
    tx: mpsc::Sender<WriterMsg>,
    recent: StdMutex<VecDeque<AuditEntry>>,
}

impl AuditLog {
    /// Create the log and start its file writer on the current runtime.
    pub fn spawn(path: PathBuf, retention: usize) -> Self {
        let (tx, rx) = mpsc::channel(WRITER_CAPACITY);
        tokio::spawn(file_writer(path.clone(), rx));
        Self {
            path,
            retention,
            tx,
            recent: StdMutex::new(VecDeque::with_capacity(retention.min(1024))),
        }
    }

    /// Record an entry in memory and queue it for the file.
    pub fn record(&self, entry: AuditEntry) {
        let line = match serde_json::to_string(&entry) {
            Ok(mut line) => {
                line.push('\n');
                line
            }
            Err(e) => {
                warn!(error = %e, request_id = %entry.request_id, "failed to serialize audit entry");
                return;
            }
        };
        let request_id = entry.request_id.clone();

        if let Ok(mut recent) = self.recent.lock() {
            if recent.len() == self.retention {
                recent.pop_front();
            }
            recent.push_back(entry);
        }

        if let Err(e) = self.tx.try_send(WriterMsg::Line(line)) {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "writer backlogged",
                mpsc::error::TrySendError::Closed(_) => "writer stopped",
            };
            warn!(%request_id, path = %self.path.display(), reason, "audit line dropped");
        }
    }

    /// Wait until every line queued so far has been written or dropped.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(WriterMsg::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Most recent entries, newest first.
    pub fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        match self.recent.lock() {
            Ok(recent) => recent.iter().rev().take(limit).cloned().collect(),
            Err(_) => Vec::new(),
        }
    }
}

async fn file_writer(path: PathBuf, mut rx: mpsc::Receiver<WriterMsg>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            WriterMsg::Line(line) => {
                if let Err(e) = append(&path, line.as_bytes()).await {
                    warn!(error = %e, path = %path.display(), "failed to write audit entry");
                }
            }
            WriterMsg::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

async fn append(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(request_id: &str, status: u16) -> AuditEntry {
        AuditEntry {
            timestamp: now_millis(),
            request_id: request_id.into(),
            model: "glm-4.6".into(),
            credential: NO_CREDENTIAL.into(),
            status,
            duration_ms: 12,
            error: None,
            stream: false,
            attempts: 1,
        }
    }

    #[tokio::test]
    async fn appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::spawn(path.clone(), 10);

        log.record(entry("req_1", 200));
        let mut failed = entry("req_2", 500);
        failed.error = Some("upstream status 503".into());
        log.record(failed);
        log.flush().await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<AuditEntry> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].request_id, "req_1");
        assert!(lines[0].error.is_none());
        assert_eq!(lines[1].status, 500);
        assert_eq!(lines[1].error.as_deref(), Some("upstream status 503"));
    }

    #[tokio::test]
    async fn recent_is_bounded_and_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::spawn(dir.path().join("audit.jsonl"), 3);

        for i in 0..5 {
            log.record(entry(&format!("req_{i}"), 200));
        }

        let recent = log.recent(10);
        let ids: Vec<&str> = recent.iter().map(|e| e.request_id.as_str()).collect();
        assert_eq!(ids, vec!["req_4", "req_3", "req_2"]);
        assert_eq!(log.recent(1).len(), 1);
    }

    #[tokio::test]
    async fn unwritable_path_does_not_fail_record() {
        let log = AuditLog::spawn(PathBuf::from("/nonexistent/dir/audit.jsonl"), 3);
        log.record(entry("req_1", 200));
        log.flush().await;
        assert_eq!(log.recent(10).len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stalled_sink_does_not_block_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        // Opening a FIFO for append blocks until a reader shows up
        let status = std::process::Command::new("mkfifo")
            .arg(&path)
            .status()
            .unwrap();
        assert!(status.success());
        let log = AuditLog::spawn(path.clone(), 10);

        log.record(entry("req_1", 200));
        log.record(entry("req_2", 200));
        assert_eq!(log.recent(10).len(), 2);
        let flushed = tokio::time::timeout(Duration::from_millis(200), log.flush()).await;
        assert!(flushed.is_err(), "writer should still be waiting on the sink");

        // Drain both lines so the writer is not left blocked on the FIFO
        let mut reader = tokio::fs::File::open(&path).await.unwrap();
        let mut written = String::new();
        while !written.contains("req_2") {
            let mut buf = [0u8; 512];
            let n = tokio::io::AsyncReadExt::read(&mut reader, &mut buf).await.unwrap();
            if n == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
            written.push_str(std::str::from_utf8(&buf[..n]).unwrap());
        }
        assert!(written.contains("req_1"));
    }
}
