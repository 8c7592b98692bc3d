//! Correlation-stamped audit log.
//!
//! One append-only NDJSON sink per process. Emitters push onto an
//! unbounded channel and never block; a dedicated writer task appends
//! lines to `<dir>/audit.ndjson`, rotating the file at the configured
//! size (renamed to `audit-<epoch_ms>.ndjson`) and pruning rotated files
//! past the retention window. [`AuditLogger::shutdown`] drains the
//! channel before returning, so records are not dropped on exit.

use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::warn;
use uuid::Uuid;

use crate::config::AuditConfig;
use crate::error::Result;

/// Fresh correlation id for one user request.
pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Optional receiver for events at warning severity or above. The core
/// functions without one.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: &AuditEvent);
}

/// Risk labels that qualify an event for notification.
const NOTIFY_LEVELS: &[&str] = &["warning", "error", "high", "critical"];

/// Immutable audit record. Everything emitted during one plan run shares
/// the plan's correlation id.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub ts: String,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_origin: Option<String>,
    pub details: serde_json::Value,
}

impl AuditEvent {
    pub fn new(correlation_id: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339(),
            correlation_id: correlation_id.into(),
            plan_id: None,
            step_index: None,
            tool_name: None,
            event: event.into(),
            risk_level: None,
            content_origin: None,
            details: serde_json::Value::Null,
        }
    }

    pub fn plan(mut self, plan_id: impl Into<String>) -> Self {
        self.plan_id = Some(plan_id.into());
        self
    }

    pub fn step(mut self, index: usize) -> Self {
        self.step_index = Some(index);
        self
    }

    pub fn tool(mut self, name: impl Into<String>) -> Self {
        self.tool_name = Some(name.into());
        self
    }

    pub fn risk(mut self, level: impl Into<String>) -> Self {
        self.risk_level = Some(level.into());
        self
    }

    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.content_origin = Some(origin.into());
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

enum Message {
    Event(AuditEvent),
    Shutdown(oneshot::Sender<()>),
}

/// Cheaply cloneable handle to the audit sink.
#[derive(Clone)]
pub struct AuditLogger {
    tx: mpsc::UnboundedSender<Message>,
    writer: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl AuditLogger {
    /// Spawn the writer task and return a handle.
    pub fn start(config: &AuditConfig) -> Result<Self> {
        Self::start_with_sink(config, None)
    }

    /// Start with an optional notification sink; events carrying a risk
    /// level of warning or above are forwarded to it from the writer
    /// task, off the emitters' path.
    pub fn start_with_sink(
        config: &AuditConfig,
        sink: Option<Arc<dyn NotificationSink>>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let writer_config = config.clone();
        let handle = tokio::spawn(async move {
            writer_loop(rx, writer_config, sink).await;
        });
        Ok(Self {
            tx,
            writer: Arc::new(Mutex::new(Some(handle))),
        })
    }

    /// Queue an event. Never blocks; a closed sink is logged and dropped.
    pub fn emit(&self, event: AuditEvent) {
        if self.tx.send(Message::Event(event)).is_err() {
            warn!("audit sink closed; event dropped");
        }
    }

    /// Flush pending events and stop the writer.
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Message::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        if let Some(handle) = self.writer.lock().await.take() {
            let _ = handle.await;
        }
    }
}

async fn writer_loop(
    mut rx: mpsc::UnboundedReceiver<Message>,
    config: AuditConfig,
    sink: Option<Arc<dyn NotificationSink>>,
) {
    let active_path = config.dir.join("audit.ndjson");
    let mut bytes_written = std::fs::metadata(&active_path).map(|m| m.len()).unwrap_or(0);
    let mut rotation_seq = 0u64;

    while let Some(message) = rx.recv().await {
        match message {
            Message::Event(event) => {
                if let (Some(sink), Some(level)) = (&sink, &event.risk_level) {
                    if NOTIFY_LEVELS.contains(&level.as_str()) {
                        sink.notify(&event);
                    }
                }
                let line = match serde_json::to_string(&event) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "unserializable audit event dropped");
                        continue;
                    }
                };

                if bytes_written + line.len() as u64 + 1 > config.max_file_bytes {
                    rotate(&active_path, &config, rotation_seq);
                    rotation_seq += 1;
                    bytes_written = 0;
                }

                match append_line(&active_path, &line) {
                    Ok(written) => bytes_written += written,
                    Err(e) => warn!(error = %e, "audit write failed"),
                }
            }
            Message::Shutdown(ack) => {
                // Drain anything queued behind the shutdown marker.
                while let Ok(message) = rx.try_recv() {
                    if let Message::Event(event) = message {
                        if let Ok(line) = serde_json::to_string(&event) {
                            let _ = append_line(&active_path, &line);
                        }
                    }
                }
                let _ = ack.send(());
                return;
            }
        }
    }
}

fn append_line(path: &PathBuf, line: &str) -> std::io::Result<u64> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    Ok(line.len() as u64 + 1)
}

fn rotate(active_path: &PathBuf, config: &AuditConfig, seq: u64) {
    let rotated = config.dir.join(format!(
        "audit-{}-{seq}.ndjson",
        chrono::Utc::now().timestamp_millis()
    ));
    if let Err(e) = std::fs::rename(active_path, &rotated) {
        warn!(error = %e, "audit rotation failed");
        return;
    }
    prune_rotated(config);
}

fn prune_rotated(config: &AuditConfig) {
    let cutoff = chrono::Utc::now().timestamp_millis() - config.retention_days * 24 * 3600 * 1000;
    let Ok(entries) = std::fs::read_dir(&config.dir) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(stamp) = name
            .strip_prefix("audit-")
            .and_then(|s| s.strip_suffix(".ndjson"))
            .and_then(|s| s.split('-').next())
        else {
            continue;
        };
        if let Ok(stamp) = stamp.parse::<i64>() {
            if stamp < cutoff {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }
}
