//! Ingest coordination.
//!
//! Drives a set of [`SourceExtractor`]s, normalizes their records into
//! documents plus side records, and applies them to the store with delta
//! semantics: unchanged content (same hash, no newer timestamps) is
//! skipped, changed content is upserted in place, tombstones soft-delete.
//!
//! Sources run **sequentially** — concurrent full ingests contend on the
//! WAL writer lock, so serial order is treated as a correctness
//! requirement here, not a tuning choice. A failing record is skipped and
//! counted; a failing batch is counted and, by default, the source keeps
//! going; a failing source never aborts the other sources.

use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::audit::{AuditEvent, AuditLogger};
use crate::chunker::chunk_document;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::extractor::{IngestMode, RecordStream, SourceExtractor};
use crate::models::{
    now_ts, Document, DocumentKind, IngestStats, Relationship, RelationshipKind, SideFields,
    SourceRecord,
};
use crate::store::{Store, UpsertOutcome};

pub struct IngestCoordinator {
    store: Store,
    config: Config,
    audit: AuditLogger,
}

impl IngestCoordinator {
    pub fn new(store: Store, config: Config, audit: AuditLogger) -> Self {
        Self {
            store,
            config,
            audit,
        }
    }

    /// Run every extractor in order and return per-source stats.
    pub async fn run(
        &self,
        extractors: &[Arc<dyn SourceExtractor>],
        mode: IngestMode,
        correlation_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<IngestStats>> {
        self.audit.emit(
            AuditEvent::new(correlation_id, "ingest_started").details(serde_json::json!({
                "mode": mode.as_str(),
                "sources": extractors.iter().map(|e| e.source_app()).collect::<Vec<_>>(),
            })),
        );

        let mut all_stats = Vec::new();
        for extractor in extractors {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let stats = self
                .run_source(extractor.as_ref(), mode, correlation_id, cancel)
                .await?;
            all_stats.push(stats);
        }

        self.audit.emit(
            AuditEvent::new(correlation_id, "ingest_completed")
                .details(serde_json::to_value(&all_stats)?),
        );
        Ok(all_stats)
    }

    /// One source, start to finish. Only cancellation propagates as an
    /// error; everything else lands in the stats.
    async fn run_source(
        &self,
        extractor: &dyn SourceExtractor,
        mode: IngestMode,
        correlation_id: &str,
        cancel: &CancellationToken,
    ) -> Result<IngestStats> {
        let source = extractor.source_app().to_string();
        let started_at = now_ts();
        let timer = Instant::now();
        let mut stats = IngestStats {
            source: source.clone(),
            ..Default::default()
        };

        let since = match mode {
            IngestMode::Full => None,
            IngestMode::Incremental => self.store.last_ingest_completion(&source).await?,
        };

        let mut stream = match extractor.open(mode, since).await {
            Ok(stream) => stream,
            Err(Error::PermissionDenied(denied)) => {
                warn!(source = %source, "extractor denied access");
                stats.errors += 1;
                stats.duration_ms = timer.elapsed().as_millis() as u64;
                self.audit.emit(
                    AuditEvent::new(correlation_id, "ingest_source_denied")
                        .details(serde_json::json!({"source": denied})),
                );
                return Ok(stats);
            }
            Err(e) => {
                warn!(source = %source, error = %e, "extractor failed to open");
                stats.errors += 1;
                stats.duration_ms = timer.elapsed().as_millis() as u64;
                return Ok(stats);
            }
        };

        let mut consecutive_batch_failures = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let batch = match stream.next_batch(self.config.sources.batch_size).await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(source = %source, error = %e, "batch pull failed");
                    stats.errors += 1;
                    consecutive_batch_failures += 1;
                    if self.config.sources.continue_on_batch_failure
                        && consecutive_batch_failures < 3
                    {
                        continue;
                    }
                    break;
                }
            };
            if batch.is_empty() {
                break;
            }
            consecutive_batch_failures = 0;

            for record in batch {
                stats.processed += 1;
                match self.apply_record(&source, record).await {
                    Ok(Applied::Created) => stats.created += 1,
                    Ok(Applied::Updated) => stats.updated += 1,
                    Ok(Applied::Unchanged) => {}
                    Err(e) => {
                        warn!(source = %source, error = %e, "record skipped");
                        stats.errors += 1;
                    }
                }
            }
        }

        stream.close().await?;

        // Full sync: rows the run did not touch no longer exist at the
        // source; sweep them child-first. Upsert-then-sweep (rather than
        // clear-then-insert) keeps document ids stable across full runs.
        if mode == IngestMode::Full {
            let removed = self.store.remove_stale(&source, started_at).await?;
            if removed > 0 {
                info!(source = %source, removed, "swept rows absent from full sync");
            }
        }

        self.link_source(&source).await?;

        stats.duration_ms = timer.elapsed().as_millis() as u64;
        self.store
            .record_ingest_run(&stats, mode.as_str(), started_at)
            .await?;
        self.audit.emit(
            AuditEvent::new(correlation_id, "ingest_source_completed")
                .details(serde_json::to_value(&stats)?),
        );
        Ok(stats)
    }

    async fn apply_record(&self, source_app: &str, mut record: SourceRecord) -> Result<Applied> {
        if record.source_id.is_empty() {
            record.source_id =
                SourceRecord::synthetic_source_id(record.kind, &record.title, &record.content);
        }

        if record.tombstone {
            let live = self
                .store
                .get_document_by_alt_key(source_app, &record.source_id)
                .await?
                .map(|d| !d.deleted)
                .unwrap_or(false);
            self.store.tombstone(source_app, &record.source_id).await?;
            return Ok(if live { Applied::Updated } else { Applied::Unchanged });
        }

        let side = SideFields::from_json(record.kind, record.fields.clone())?;
        let outcome = self.store.upsert_document(source_app, &record, &side).await?;

        let applied = match &outcome {
            UpsertOutcome::Created(_) => Applied::Created,
            UpsertOutcome::Updated(_) => Applied::Updated,
            UpsertOutcome::Unchanged(_) => return Ok(Applied::Unchanged),
        };

        // Content changed, so the chunk set (and with it any embeddings)
        // is rebuilt from scratch.
        let document = Document {
            id: outcome.document_id().to_string(),
            kind: record.kind,
            title: record.title.clone(),
            content: record.content.clone(),
            source_app: source_app.to_string(),
            source_id: record.source_id.clone(),
            source_uri: record.source_uri.clone(),
            content_hash: record.content_hash(&side),
            created_at: record.created_at,
            updated_at: record.updated_at,
            last_seen_at: now_ts(),
            deleted: false,
        };
        let chunks = chunk_document(&document, &side, &self.config.chunking);
        self.store.replace_chunks(&document.id, &chunks).await?;

        Ok(applied)
    }

    /// Derive relationship edges for a source's documents.
    ///
    /// Emails and messages link to the contacts owning their addresses;
    /// event attendees link as `attended`. Edges are keyed by
    /// `(from, to, kind)` so the pass is idempotent across re-ingests.
    async fn link_source(&self, source_app: &str) -> Result<()> {
        use sqlx::Row;

        let email_rows = sqlx::query(
            r#"
            SELECT d.id, e.from_address, e.to_addresses
            FROM documents d JOIN emails e ON e.document_id = d.id
            WHERE d.source_app = ? AND d.deleted = 0
            "#,
        )
        .bind(source_app)
        .fetch_all(self.store.pool())
        .await?;

        for row in email_rows {
            let doc_id: String = row.get("id");
            let from: String = row.get("from_address");
            let to_raw: String = row.get("to_addresses");
            let to: Vec<String> = serde_json::from_str(&to_raw).unwrap_or_default();

            if !from.is_empty() {
                self.link_to_contact(&doc_id, &from, RelationshipKind::SentBy)
                    .await?;
            }
            for address in &to {
                self.link_to_contact(&doc_id, address, RelationshipKind::Mentions)
                    .await?;
            }
        }

        let message_rows = sqlx::query(
            r#"
            SELECT d.id, m.sender
            FROM documents d JOIN messages m ON m.document_id = d.id
            WHERE d.source_app = ? AND d.deleted = 0 AND m.sender != ''
            "#,
        )
        .bind(source_app)
        .fetch_all(self.store.pool())
        .await?;

        for row in message_rows {
            let doc_id: String = row.get("id");
            let sender: String = row.get("sender");
            self.link_to_contact(&doc_id, &sender, RelationshipKind::SentBy)
                .await?;
        }

        let event_rows = sqlx::query(
            r#"
            SELECT d.id, e.attendees
            FROM documents d JOIN events e ON e.document_id = d.id
            WHERE d.source_app = ? AND d.deleted = 0
            "#,
        )
        .bind(source_app)
        .fetch_all(self.store.pool())
        .await?;

        for row in event_rows {
            let doc_id: String = row.get("id");
            let attendees_raw: String = row.get("attendees");
            let attendees: Vec<String> = serde_json::from_str(&attendees_raw).unwrap_or_default();
            for address in &attendees {
                self.link_to_contact(&doc_id, address, RelationshipKind::Attended)
                    .await?;
            }
        }

        Ok(())
    }

    async fn link_to_contact(
        &self,
        document_id: &str,
        address: &str,
        kind: RelationshipKind,
    ) -> Result<()> {
        let Some(contact_id) = self.store.find_contact_by_email(address).await? else {
            return Ok(());
        };
        if contact_id == document_id {
            return Ok(());
        }
        self.store
            .add_relationship(&Relationship {
                from_id: document_id.to_string(),
                to_id: contact_id,
                kind,
                strength: 1.0,
                created_at: now_ts(),
            })
            .await
    }
}

enum Applied {
    Created,
    Updated,
    Unchanged,
}

/// Build documents for tool-created content (reminders, events, notes the
/// plan engine writes). These reuse the ingest path so every store
/// invariant holds for engine-authored documents too.
pub fn engine_record(
    kind: DocumentKind,
    source_id: String,
    title: String,
    content: String,
    fields: serde_json::Value,
) -> SourceRecord {
    let now = now_ts();
    SourceRecord {
        source_id,
        kind,
        title,
        content,
        source_uri: None,
        fields,
        created_at: now,
        updated_at: now,
        tombstone: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::StaticExtractor;
    use serde_json::json;
    use tempfile::TempDir;

    async fn coordinator() -> (TempDir, Store, IngestCoordinator) {
        let tmp = TempDir::new().unwrap();
        let pool = crate::db::connect(&tmp.path().join("kenny.sqlite3"))
            .await
            .unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        let store = Store::new(pool);
        let mut config = Config::default();
        config.audit.dir = tmp.path().join("logs");
        let audit = AuditLogger::start(&config.audit).unwrap();
        let coordinator = IngestCoordinator::new(store.clone(), config, audit);
        (tmp, store, coordinator)
    }

    fn email(source_id: &str, title: &str, content: &str, from: &str) -> SourceRecord {
        SourceRecord {
            source_id: source_id.into(),
            kind: DocumentKind::Email,
            title: title.into(),
            content: content.into(),
            source_uri: None,
            fields: json!({"from_address": from}),
            created_at: 1_700_000_000,
            updated_at: 1_700_000_000,
            tombstone: false,
        }
    }

    fn contact(source_id: &str, name: &str, address: &str) -> SourceRecord {
        SourceRecord {
            source_id: source_id.into(),
            kind: DocumentKind::Contact,
            title: name.into(),
            content: String::new(),
            source_uri: None,
            fields: json!({"emails": [address]}),
            created_at: 1_700_000_000,
            updated_at: 1_700_000_000,
            tombstone: false,
        }
    }

    #[tokio::test]
    async fn reingest_is_a_no_op() {
        let (_tmp, store, coordinator) = coordinator().await;
        let records = vec![
            email("m1", "Project Apollo kickoff", "budget and milestones", "jane@example.com"),
            email("m2", "Lunch", "pizza", "sam@example.com"),
        ];
        let extractors: Vec<Arc<dyn SourceExtractor>> =
            vec![Arc::new(StaticExtractor::new("mail", records))];
        let cancel = CancellationToken::new();

        let first = coordinator
            .run(&extractors, IngestMode::Incremental, "c1", &cancel)
            .await
            .unwrap();
        assert_eq!(first[0].created, 2);
        assert_eq!(first[0].errors, 0);

        let doc_before = store
            .get_document_by_alt_key("mail", "m1")
            .await
            .unwrap()
            .unwrap();

        let second = coordinator
            .run(&extractors, IngestMode::Incremental, "c2", &cancel)
            .await
            .unwrap();
        assert_eq!(second[0].created, 0);
        assert_eq!(second[0].updated, 0);
        assert_eq!(second[0].errors, 0);

        let doc_after = store
            .get_document_by_alt_key("mail", "m1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc_before.id, doc_after.id, "id must survive re-ingestion");
    }

    #[tokio::test]
    async fn full_reingest_keeps_counts_flat() {
        let (_tmp, store, coordinator) = coordinator().await;
        let records = vec![email("m1", "A", "alpha", "a@example.com")];
        let extractors: Vec<Arc<dyn SourceExtractor>> =
            vec![Arc::new(StaticExtractor::new("mail", records))];
        let cancel = CancellationToken::new();

        coordinator
            .run(&extractors, IngestMode::Full, "c1", &cancel)
            .await
            .unwrap();
        coordinator
            .run(&extractors, IngestMode::Full, "c2", &cancel)
            .await
            .unwrap();

        assert_eq!(store.count("documents").await.unwrap(), 1);
        assert_eq!(store.count("emails").await.unwrap(), 1);
        assert_eq!(store.count("chunks").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn denied_source_does_not_abort_others() {
        let (_tmp, store, coordinator) = coordinator().await;
        let extractors: Vec<Arc<dyn SourceExtractor>> = vec![
            Arc::new(StaticExtractor::denied("mail")),
            Arc::new(StaticExtractor::new(
                "notes",
                vec![SourceRecord {
                    source_id: "n1".into(),
                    kind: DocumentKind::Note,
                    title: "Note".into(),
                    content: "text".into(),
                    source_uri: None,
                    fields: json!({}),
                    created_at: 1,
                    updated_at: 1,
                    tombstone: false,
                }],
            )),
        ];
        let cancel = CancellationToken::new();

        let stats = coordinator
            .run(&extractors, IngestMode::Full, "c1", &cancel)
            .await
            .unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].errors, 1);
        assert_eq!(stats[1].created, 1);
        assert_eq!(store.count("documents").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn tombstone_soft_deletes() {
        let (_tmp, store, coordinator) = coordinator().await;
        let cancel = CancellationToken::new();
        let extractors: Vec<Arc<dyn SourceExtractor>> = vec![Arc::new(StaticExtractor::new(
            "mail",
            vec![email("m1", "A", "alpha", "a@example.com")],
        ))];
        coordinator
            .run(&extractors, IngestMode::Incremental, "c1", &cancel)
            .await
            .unwrap();

        let mut dead = email("m1", "A", "alpha", "a@example.com");
        dead.tombstone = true;
        dead.updated_at = 1_700_000_900;
        let extractors: Vec<Arc<dyn SourceExtractor>> =
            vec![Arc::new(StaticExtractor::new("mail", vec![dead]))];
        let stats = coordinator
            .run(&extractors, IngestMode::Incremental, "c2", &cancel)
            .await
            .unwrap();
        assert_eq!(stats[0].updated, 1);

        let doc = store
            .get_document_by_alt_key("mail", "m1")
            .await
            .unwrap()
            .unwrap();
        assert!(doc.deleted, "tombstones are retained, not removed");
    }

    #[tokio::test]
    async fn emails_link_to_contacts() {
        let (_tmp, store, coordinator) = coordinator().await;
        let cancel = CancellationToken::new();
        // Contacts first, then mail: sequential order matters for linking.
        let extractors: Vec<Arc<dyn SourceExtractor>> = vec![
            Arc::new(StaticExtractor::new(
                "contacts",
                vec![contact("c1", "Jane Roe", "jane@example.com")],
            )),
            Arc::new(StaticExtractor::new(
                "mail",
                vec![email("m1", "Hello", "hi", "jane@example.com")],
            )),
        ];
        coordinator
            .run(&extractors, IngestMode::Full, "c1", &cancel)
            .await
            .unwrap();

        assert_eq!(store.count("relationships").await.unwrap(), 1);

        let mail_doc = store
            .get_document_by_alt_key("mail", "m1")
            .await
            .unwrap()
            .unwrap();
        let related = store.related(&mail_doc.id, 1).await.unwrap();
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].1, "sent_by");
    }

    #[tokio::test]
    async fn cancellation_stops_the_run() {
        let (_tmp, _store, coordinator) = coordinator().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let extractors: Vec<Arc<dyn SourceExtractor>> = vec![Arc::new(StaticExtractor::new(
            "mail",
            vec![email("m1", "A", "alpha", "a@example.com")],
        ))];
        let err = coordinator
            .run(&extractors, IngestMode::Full, "c1", &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "cancelled");
    }

    #[tokio::test]
    async fn records_without_source_id_get_synthetic_ids() {
        let (_tmp, store, coordinator) = coordinator().await;
        let cancel = CancellationToken::new();
        let mut record = email("", "Untracked", "body", "x@example.com");
        record.source_id = String::new();
        let extractors: Vec<Arc<dyn SourceExtractor>> =
            vec![Arc::new(StaticExtractor::new("mail", vec![record]))];

        coordinator
            .run(&extractors, IngestMode::Full, "c1", &cancel)
            .await
            .unwrap();
        // Re-run: synthetic id must be stable, so no duplicate appears.
        coordinator
            .run(&extractors, IngestMode::Full, "c2", &cancel)
            .await
            .unwrap();
        assert_eq!(store.count("documents").await.unwrap(), 1);
    }
}
