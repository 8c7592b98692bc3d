//! Source extractor contract and built-in implementations.
//!
//! An extractor adapts one external data source (a mail store, a calendar
//! database, a chat bridge) into normalized [`SourceRecord`]s pulled in
//! batches. How an extractor reads its source — direct database access,
//! scripted automation, files on disk — never leaks past this interface.
//!
//! Built-ins:
//! - [`NdjsonExtractor`] — reads `<records_dir>/<source_app>.ndjson`, one
//!   JSON record per line. This is the standing local format; OS-app
//!   extractors are separate binaries that emit it.
//! - [`StaticExtractor`] — yields a fixed record list; test fixtures.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::models::SourceRecord;

/// Ingest mode for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestMode {
    Full,
    Incremental,
}

impl IngestMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestMode::Full => "full",
            IngestMode::Incremental => "incremental",
        }
    }
}

/// Batched pull handle returned by [`SourceExtractor::open`].
#[async_trait]
pub trait RecordStream: Send {
    /// Next batch of at most `max` records; empty means exhausted.
    async fn next_batch(&mut self, max: usize) -> Result<Vec<SourceRecord>>;

    /// Release any resources held open for the pull.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for dyn RecordStream + '_ {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn RecordStream")
    }
}

/// External adapter yielding normalized records for one source.
#[async_trait]
pub trait SourceExtractor: Send + Sync {
    /// Source label recorded as `Document.source_app`.
    fn source_app(&self) -> &str;

    /// Begin a pull. `since` is set in incremental mode to the completion
    /// instant of the last successful run. Implementations may return
    /// [`Error::PermissionDenied`] when the host refuses access.
    async fn open(&self, mode: IngestMode, since: Option<i64>) -> Result<Box<dyn RecordStream>>;
}

// ============ NDJSON extractor ============

/// Extractor over a directory of newline-delimited JSON record files.
pub struct NdjsonExtractor {
    source_app: String,
    path: PathBuf,
}

impl NdjsonExtractor {
    pub fn new(source_app: impl Into<String>, path: PathBuf) -> Self {
        Self {
            source_app: source_app.into(),
            path,
        }
    }

    /// One extractor per `*.ndjson` file found under `records_dir`,
    /// restricted to `enabled` when non-empty.
    pub fn discover(records_dir: &PathBuf, enabled: &[String]) -> Vec<Arc<dyn SourceExtractor>> {
        let mut extractors: Vec<Arc<dyn SourceExtractor>> = Vec::new();
        if !records_dir.exists() {
            return extractors;
        }

        for entry in WalkDir::new(records_dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("ndjson") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !enabled.is_empty() && !enabled.iter().any(|s| s == stem) {
                continue;
            }
            extractors.push(Arc::new(NdjsonExtractor::new(stem, path.to_path_buf())));
        }

        extractors.sort_by(|a, b| a.source_app().cmp(b.source_app()));
        extractors
    }
}

#[async_trait]
impl SourceExtractor for NdjsonExtractor {
    fn source_app(&self) -> &str {
        &self.source_app
    }

    async fn open(&self, _mode: IngestMode, since: Option<i64>) -> Result<Box<dyn RecordStream>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(Error::PermissionDenied(self.source_app.clone()));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let record: SourceRecord =
                serde_json::from_str(line).map_err(|e| Error::ValidationFailed {
                    field: format!("{}:{}", self.path.display(), line_no + 1),
                    reason: e.to_string(),
                })?;
            records.push(record);
        }

        // Extractor order is file order; the incremental filter drops
        // records not touched since the last completed run.
        if let Some(since) = since {
            records.retain(|r| r.updated_at > since || r.tombstone);
        }

        Ok(Box::new(VecStream { records, cursor: 0 }))
    }
}

// ============ Static extractor ============

/// Fixed-record extractor for tests and seeded installs.
pub struct StaticExtractor {
    source_app: String,
    records: Vec<SourceRecord>,
    deny_permission: bool,
}

impl StaticExtractor {
    pub fn new(source_app: impl Into<String>, records: Vec<SourceRecord>) -> Self {
        Self {
            source_app: source_app.into(),
            records,
            deny_permission: false,
        }
    }

    /// An extractor whose host always refuses access.
    pub fn denied(source_app: impl Into<String>) -> Self {
        Self {
            source_app: source_app.into(),
            records: Vec::new(),
            deny_permission: true,
        }
    }
}

#[async_trait]
impl SourceExtractor for StaticExtractor {
    fn source_app(&self) -> &str {
        &self.source_app
    }

    async fn open(&self, _mode: IngestMode, since: Option<i64>) -> Result<Box<dyn RecordStream>> {
        if self.deny_permission {
            return Err(Error::PermissionDenied(self.source_app.clone()));
        }
        let mut records = self.records.clone();
        if let Some(since) = since {
            records.retain(|r| r.updated_at > since || r.tombstone);
        }
        Ok(Box::new(VecStream { records, cursor: 0 }))
    }
}

struct VecStream {
    records: Vec<SourceRecord>,
    cursor: usize,
}

#[async_trait]
impl RecordStream for VecStream {
    async fn next_batch(&mut self, max: usize) -> Result<Vec<SourceRecord>> {
        if self.cursor >= self.records.len() {
            return Ok(Vec::new());
        }
        let end = (self.cursor + max.max(1)).min(self.records.len());
        let batch = self.records[self.cursor..end].to_vec();
        self.cursor = end;
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentKind;
    use tempfile::TempDir;

    fn record(source_id: &str, updated_at: i64) -> SourceRecord {
        SourceRecord {
            source_id: source_id.into(),
            kind: DocumentKind::Note,
            title: format!("note {source_id}"),
            content: "body".into(),
            source_uri: None,
            fields: serde_json::json!({}),
            created_at: updated_at,
            updated_at,
            tombstone: false,
        }
    }

    #[tokio::test]
    async fn static_extractor_batches_in_order() {
        let extractor = StaticExtractor::new("test", vec![record("a", 1), record("b", 2), record("c", 3)]);
        let mut stream = extractor.open(IngestMode::Full, None).await.unwrap();

        let first = stream.next_batch(2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].source_id, "a");
        let second = stream.next_batch(2).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].source_id, "c");
        assert!(stream.next_batch(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn incremental_filters_by_since_but_keeps_tombstones() {
        let mut dead = record("dead", 1);
        dead.tombstone = true;
        let extractor = StaticExtractor::new("test", vec![record("old", 1), record("new", 10), dead]);
        let mut stream = extractor
            .open(IngestMode::Incremental, Some(5))
            .await
            .unwrap();
        let batch = stream.next_batch(10).await.unwrap();
        let ids: Vec<&str> = batch.iter().map(|r| r.source_id.as_str()).collect();
        assert_eq!(ids, vec!["new", "dead"]);
    }

    #[tokio::test]
    async fn denied_extractor_reports_permission() {
        let extractor = StaticExtractor::denied("mail");
        let err = extractor.open(IngestMode::Full, None).await.unwrap_err();
        assert_eq!(err.kind(), "permission_denied");
    }

    #[tokio::test]
    async fn ndjson_extractor_reads_lines() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("mail.ndjson");
        std::fs::write(
            &path,
            concat!(
                r#"{"source_id":"m1","kind":"email","title":"Hello","content":"Body","created_at":1,"updated_at":1}"#,
                "\n",
                r#"{"source_id":"m2","kind":"email","title":"Again","content":"More","created_at":2,"updated_at":2,"tombstone":true}"#,
                "\n",
            ),
        )
        .unwrap();

        let extractor = NdjsonExtractor::new("mail", path);
        let mut stream = extractor.open(IngestMode::Full, None).await.unwrap();
        let batch = stream.next_batch(10).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].kind, DocumentKind::Email);
        assert!(batch[1].tombstone);
    }

    #[tokio::test]
    async fn discover_filters_and_sorts() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("mail.ndjson"), "").unwrap();
        std::fs::write(tmp.path().join("calendar.ndjson"), "").unwrap();
        std::fs::write(tmp.path().join("readme.txt"), "").unwrap();

        let all = NdjsonExtractor::discover(&tmp.path().to_path_buf(), &[]);
        let names: Vec<&str> = all.iter().map(|e| e.source_app()).collect();
        assert_eq!(names, vec!["calendar", "mail"]);

        let only = NdjsonExtractor::discover(&tmp.path().to_path_buf(), &["mail".to_string()]);
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].source_app(), "mail");
    }
}
