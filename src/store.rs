//! Unified content store over SQLite.
//!
//! Documents, per-kind side records, chunks, relationships, and the ingest
//! run log all live here. Three rules hold everywhere:
//!
//! 1. Every logical upsert is one transaction: the document row, its FTS
//!    row, and its side record land together or not at all.
//! 2. `(source_app, source_id)` is the alternate key; an existing `id` is
//!    reused so re-ingestion never reassigns identity.
//! 3. Mutations go through `execute`-style statements only; query paths
//!    never delete.

use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{
    now_ts, Chunk, ContactFields, Document, DocumentKind, EmailFields, EventFields, FileFields,
    IngestStats, MessageFields, NoteFields, Relationship, RelationshipKind, ReminderFields,
    SideFields, SourceRecord,
};

/// Outcome of a document upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created(String),
    Updated(String),
    /// Hash unchanged and timestamps not newer; only `last_seen_at` moved.
    Unchanged(String),
}

impl UpsertOutcome {
    pub fn document_id(&self) -> &str {
        match self {
            UpsertOutcome::Created(id)
            | UpsertOutcome::Updated(id)
            | UpsertOutcome::Unchanged(id) => id,
        }
    }
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ============ Document upserts ============

    /// Foreign-key-safe upsert of a document plus its side record.
    ///
    /// If a row with the same `(source_app, source_id)` exists, its `id` is
    /// reused and the side record is replaced in place. The document row,
    /// FTS row, and side record are written in a single transaction.
    pub async fn upsert_document(
        &self,
        source_app: &str,
        record: &SourceRecord,
        side: &SideFields,
    ) -> Result<UpsertOutcome> {
        let content_hash = record.content_hash(side);
        let now = now_ts();

        let existing = sqlx::query(
            "SELECT id, kind, content_hash, updated_at FROM documents WHERE source_app = ? AND source_id = ?",
        )
        .bind(source_app)
        .bind(&record.source_id)
        .fetch_optional(&self.pool)
        .await?;

        let (doc_id, prior_kind, is_new) = match &existing {
            Some(row) => {
                let id: String = row.get("id");
                let kind: String = row.get("kind");
                let prior_hash: String = row.get("content_hash");
                let prior_updated: i64 = row.get("updated_at");

                if prior_hash == content_hash && record.updated_at <= prior_updated {
                    sqlx::query("UPDATE documents SET last_seen_at = ? WHERE id = ?")
                        .bind(now)
                        .bind(&id)
                        .execute(&self.pool)
                        .await?;
                    return Ok(UpsertOutcome::Unchanged(id));
                }
                (id, Some(DocumentKind::parse(&kind)?), false)
            }
            None => (Uuid::new_v4().to_string(), None, true),
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO documents
                (id, kind, title, content, source_app, source_id, source_uri,
                 content_hash, created_at, updated_at, last_seen_at, deleted)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
            ON CONFLICT(source_app, source_id) DO UPDATE SET
                kind = excluded.kind,
                title = excluded.title,
                content = excluded.content,
                source_uri = excluded.source_uri,
                content_hash = excluded.content_hash,
                updated_at = MAX(documents.updated_at, excluded.updated_at),
                last_seen_at = excluded.last_seen_at,
                deleted = 0
            "#,
        )
        .bind(&doc_id)
        .bind(record.kind.as_str())
        .bind(&record.title)
        .bind(&record.content)
        .bind(source_app)
        .bind(&record.source_id)
        .bind(&record.source_uri)
        .bind(&content_hash)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        // Keyword index row replaced in the same transaction so a crash
        // leaves both or neither.
        sqlx::query("DELETE FROM documents_fts WHERE document_id = ?")
            .bind(&doc_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO documents_fts (document_id, title, content) VALUES (?, ?, ?)")
            .bind(&doc_id)
            .bind(&record.title)
            .bind(&record.content)
            .execute(&mut *tx)
            .await?;

        // A kind change (rare, but extractors have done it) leaves a stale
        // side row behind unless the old table is cleared first.
        if let Some(prior) = prior_kind {
            if prior != record.kind {
                let sql = format!("DELETE FROM {} WHERE document_id = ?", prior.side_table());
                sqlx::query(&sql).bind(&doc_id).execute(&mut *tx).await?;
            }
        }

        write_side_record(&mut tx, &doc_id, side).await?;

        tx.commit().await?;

        if is_new {
            Ok(UpsertOutcome::Created(doc_id))
        } else {
            Ok(UpsertOutcome::Updated(doc_id))
        }
    }

    /// Soft-delete a document from a tombstone record.
    ///
    /// The document row is retained with `deleted = 1`; its FTS row, chunks,
    /// and vectors are removed so it can no longer be retrieved.
    pub async fn tombstone(&self, source_app: &str, source_id: &str) -> Result<Option<String>> {
        let existing: Option<String> =
            sqlx::query_scalar("SELECT id FROM documents WHERE source_app = ? AND source_id = ?")
                .bind(source_app)
                .bind(source_id)
                .fetch_optional(&self.pool)
                .await?;

        let Some(doc_id) = existing else {
            return Ok(None);
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE documents SET deleted = 1, last_seen_at = ? WHERE id = ?")
            .bind(now_ts())
            .bind(&doc_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents_fts WHERE document_id = ?")
            .bind(&doc_id)
            .execute(&mut *tx)
            .await?;
        delete_chunks_for(&mut tx, &doc_id).await?;
        tx.commit().await?;

        Ok(Some(doc_id))
    }

    /// Reconciliation sweep after a full ingest of one source.
    ///
    /// Documents scoped to `source_app` that the run did not touch
    /// (`last_seen_at < seen_before`, not already tombstoned) no longer
    /// exist at the source, so their rows are removed in child-first
    /// order: vectors, embeddings, chunks, FTS rows, side records,
    /// relationships, then documents. Any other ordering would trip
    /// foreign keys. Returns the number of documents removed.
    ///
    /// Upserting first and sweeping after keeps `id` stable across full
    /// re-ingests; a delete-everything-then-reinsert pass would reassign
    /// every identity.
    pub async fn remove_stale(&self, source_app: &str, seen_before: i64) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        const STALE: &str =
            "SELECT id FROM documents WHERE source_app = ? AND deleted = 0 AND last_seen_at < ?";

        sqlx::query(&format!(
            "DELETE FROM chunk_vectors WHERE document_id IN ({STALE})"
        ))
        .bind(source_app)
        .bind(seen_before)
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            "DELETE FROM embeddings WHERE chunk_id IN (SELECT c.id FROM chunks c WHERE c.document_id IN ({STALE}))"
        ))
        .bind(source_app)
        .bind(seen_before)
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!("DELETE FROM chunks WHERE document_id IN ({STALE})"))
            .bind(source_app)
            .bind(seen_before)
            .execute(&mut *tx)
            .await?;

        sqlx::query(&format!(
            "DELETE FROM documents_fts WHERE document_id IN ({STALE})"
        ))
        .bind(source_app)
        .bind(seen_before)
        .execute(&mut *tx)
        .await?;

        for kind in DocumentKind::all() {
            let sql = format!(
                "DELETE FROM {} WHERE document_id IN ({STALE})",
                kind.side_table()
            );
            sqlx::query(&sql)
                .bind(source_app)
                .bind(seen_before)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(&format!(
            "DELETE FROM relationships WHERE from_id IN ({STALE}) OR to_id IN ({STALE})"
        ))
        .bind(source_app)
        .bind(seen_before)
        .bind(source_app)
        .bind(seen_before)
        .execute(&mut *tx)
        .await?;

        let deleted = sqlx::query(
            "DELETE FROM documents WHERE source_app = ? AND deleted = 0 AND last_seen_at < ?",
        )
        .bind(source_app)
        .bind(seen_before)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(deleted)
    }

    // ============ Chunks ============

    /// Replace the chunk set of a document atomically.
    ///
    /// Old vectors and embeddings go first (child-first), then chunks, then
    /// the new rows are inserted in order.
    pub async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        delete_chunks_for(&mut tx, document_id).await?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, order_index, text, start_offset, end_offset)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.order_index)
            .bind(&chunk.text)
            .bind(chunk.start_offset)
            .bind(chunk.end_offset)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Chunk ids and text missing an embedding row, oldest documents first.
    pub async fn chunks_missing_embeddings(&self, limit: i64) -> Result<Vec<(String, String, String)>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.document_id, c.text
            FROM chunks c
            LEFT JOIN embeddings e ON e.chunk_id = c.id
            JOIN documents d ON d.id = c.document_id
            WHERE e.chunk_id IS NULL AND d.deleted = 0
            ORDER BY d.updated_at ASC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| (r.get("id"), r.get("document_id"), r.get("text")))
            .collect())
    }

    // ============ Lookups ============

    pub async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| document_from_row(&r)).transpose()
    }

    pub async fn get_document_by_alt_key(
        &self,
        source_app: &str,
        source_id: &str,
    ) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE source_app = ? AND source_id = ?")
            .bind(source_app)
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| document_from_row(&r)).transpose()
    }

    /// Load the typed side record for a document.
    pub async fn get_side_fields(&self, document_id: &str, kind: DocumentKind) -> Result<SideFields> {
        let sql = format!("SELECT * FROM {} WHERE document_id = ?", kind.side_table());
        let row = sqlx::query(&sql)
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(SideFields::empty(kind));
        };

        Ok(match kind {
            DocumentKind::Email => SideFields::Email(EmailFields {
                from_address: row.get("from_address"),
                to_addresses: parse_json_list(row.get("to_addresses")),
                cc_addresses: parse_json_list(row.get("cc_addresses")),
                mailbox: row.get("mailbox"),
                date_sent: row.get("date_sent"),
                is_read: row.get::<i64, _>("is_read") != 0,
            }),
            DocumentKind::Event => SideFields::Event(EventFields {
                start_at: row.get("start_at"),
                end_at: row.get("end_at"),
                location: row.get("location"),
                organizer: row.get("organizer"),
                attendees: parse_json_list(row.get("attendees")),
                calendar: row.get("calendar"),
                all_day: row.get::<i64, _>("all_day") != 0,
            }),
            DocumentKind::Reminder => SideFields::Reminder(ReminderFields {
                due_at: row.get("due_at"),
                completed: row.get::<i64, _>("completed") != 0,
                completed_at: row.get("completed_at"),
                list_name: row.get("list_name"),
            }),
            DocumentKind::Note => SideFields::Note(NoteFields {
                folder: row.get("folder"),
                word_count: row.get("word_count"),
            }),
            DocumentKind::Contact => SideFields::Contact(ContactFields {
                emails: parse_json_list(row.get("emails")),
                phones: parse_json_list(row.get("phones")),
                organization: row.get("organization"),
            }),
            DocumentKind::Message => SideFields::Message(MessageFields {
                thread_id: row.get("thread_id"),
                sender: row.get("sender"),
                service: row.get("service"),
                is_from_me: row.get::<i64, _>("is_from_me") != 0,
                sent_at: row.get("sent_at"),
            }),
            DocumentKind::File => SideFields::File(FileFields {
                path: row.get("path"),
                mime_type: row.get("mime_type"),
                size_bytes: row.get("size_bytes"),
                modified_at: row.get("modified_at"),
            }),
        })
    }

    /// Contact document id owning the given email address, if any.
    pub async fn find_contact_by_email(&self, email: &str) -> Result<Option<String>> {
        let pattern = format!("%\"{}\"%", email.to_lowercase());
        let id: Option<String> = sqlx::query_scalar(
            r#"
            SELECT c.document_id FROM contacts c
            JOIN documents d ON d.id = c.document_id
            WHERE d.deleted = 0 AND LOWER(c.emails) LIKE ?
            LIMIT 1
            "#,
        )
        .bind(pattern)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    /// Non-deleted events overlapping `[start, end)`.
    pub async fn list_events_between(&self, start: i64, end: i64) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            r#"
            SELECT d.* FROM documents d
            JOIN events e ON e.document_id = d.id
            WHERE d.deleted = 0
              AND e.start_at IS NOT NULL
              AND e.start_at < ?
              AND COALESCE(e.end_at, e.start_at) >= ?
            ORDER BY e.start_at ASC
            "#,
        )
        .bind(end)
        .bind(start)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(document_from_row).collect()
    }

    // ============ Relationships ============

    /// Insert an edge; duplicate `(from, to, kind)` is a no-op, self-edges
    /// are rejected.
    pub async fn add_relationship(&self, rel: &Relationship) -> Result<()> {
        if rel.from_id == rel.to_id {
            return Err(Error::ValidationFailed {
                field: "relationship".into(),
                reason: "self-edges are not allowed".into(),
            });
        }
        if !(0.0..=1.0).contains(&rel.strength) {
            return Err(Error::ValidationFailed {
                field: "strength".into(),
                reason: format!("{} outside [0, 1]", rel.strength),
            });
        }

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO relationships (from_id, to_id, kind, strength, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&rel.from_id)
        .bind(&rel.to_id)
        .bind(rel.kind.as_str())
        .bind(rel.strength)
        .bind(rel.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Breadth-first traversal over relationship edges, bounded by depth.
    ///
    /// Returns `(document_id, edge_kind)` pairs excluding the start node.
    /// Documents form a graph; stable ids and a depth bound keep traversal
    /// finite without in-memory cycles.
    pub async fn related(&self, document_id: &str, max_depth: u32) -> Result<Vec<(String, String)>> {
        let mut seen = std::collections::HashSet::new();
        seen.insert(document_id.to_string());
        let mut frontier = vec![document_id.to_string()];
        let mut found = Vec::new();

        for _ in 0..max_depth {
            if frontier.is_empty() {
                break;
            }
            let mut next = Vec::new();
            for id in frontier.drain(..) {
                let rows = sqlx::query(
                    r#"
                    SELECT to_id AS other, kind FROM relationships WHERE from_id = ?
                    UNION
                    SELECT from_id AS other, kind FROM relationships WHERE to_id = ?
                    "#,
                )
                .bind(&id)
                .bind(&id)
                .fetch_all(&self.pool)
                .await?;

                for row in rows {
                    let other: String = row.get("other");
                    let kind: String = row.get("kind");
                    if seen.insert(other.clone()) {
                        found.push((other.clone(), kind));
                        next.push(other);
                    }
                }
            }
            frontier = next;
        }

        Ok(found)
    }

    // ============ Ingest log ============

    /// Record a completed source run. Incremental mode reads these rows to
    /// derive its `since` instant, so the row must land even when the run
    /// processed nothing.
    pub async fn record_ingest_run(
        &self,
        stats: &IngestStats,
        mode: &str,
        started_at: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ingest_log
                (id, source, mode, started_at, completed_at, processed, created, updated, errors, duration_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&stats.source)
        .bind(mode)
        .bind(started_at)
        .bind(now_ts())
        .bind(stats.processed as i64)
        .bind(stats.created as i64)
        .bind(stats.updated as i64)
        .bind(stats.errors as i64)
        .bind(stats.duration_ms as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Completion instant of the last successful run for a source.
    pub async fn last_ingest_completion(&self, source: &str) -> Result<Option<i64>> {
        let ts: Option<i64> =
            sqlx::query_scalar("SELECT MAX(completed_at) FROM ingest_log WHERE source = ?")
                .bind(source)
                .fetch_one(&self.pool)
                .await?;
        Ok(ts)
    }

    // ============ Counts ============

    pub async fn count(&self, table: &str) -> Result<i64> {
        // Identifier whitelist; table names never come from user input.
        const TABLES: &[&str] = &[
            "documents",
            "emails",
            "events",
            "reminders",
            "notes",
            "contacts",
            "messages",
            "files",
            "chunks",
            "embeddings",
            "chunk_vectors",
            "relationships",
            "ingest_log",
            "plans",
        ];
        if !TABLES.contains(&table) {
            return Err(Error::ValidationFailed {
                field: "table".into(),
                reason: format!("unknown table '{table}'"),
            });
        }
        let sql = format!("SELECT COUNT(*) FROM {table}");
        Ok(sqlx::query_scalar(&sql).fetch_one(&self.pool).await?)
    }
}

async fn delete_chunks_for(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    document_id: &str,
) -> Result<()> {
    sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut **tx)
        .await?;
    sqlx::query(
        "DELETE FROM embeddings WHERE chunk_id IN (SELECT id FROM chunks WHERE document_id = ?)",
    )
    .bind(document_id)
    .execute(&mut **tx)
    .await?;
    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn write_side_record(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    document_id: &str,
    side: &SideFields,
) -> Result<()> {
    match side {
        SideFields::Email(f) => {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO emails
                    (document_id, from_address, to_addresses, cc_addresses, mailbox, date_sent, is_read)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(document_id)
            .bind(&f.from_address)
            .bind(serde_json::to_string(&f.to_addresses)?)
            .bind(serde_json::to_string(&f.cc_addresses)?)
            .bind(&f.mailbox)
            .bind(f.date_sent)
            .bind(f.is_read as i64)
            .execute(&mut **tx)
            .await?;
        }
        SideFields::Event(f) => {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO events
                    (document_id, start_at, end_at, location, organizer, attendees, calendar, all_day)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(document_id)
            .bind(f.start_at)
            .bind(f.end_at)
            .bind(&f.location)
            .bind(&f.organizer)
            .bind(serde_json::to_string(&f.attendees)?)
            .bind(&f.calendar)
            .bind(f.all_day as i64)
            .execute(&mut **tx)
            .await?;
        }
        SideFields::Reminder(f) => {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO reminders
                    (document_id, due_at, completed, completed_at, list_name)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(document_id)
            .bind(f.due_at)
            .bind(f.completed as i64)
            .bind(f.completed_at)
            .bind(&f.list_name)
            .execute(&mut **tx)
            .await?;
        }
        SideFields::Note(f) => {
            sqlx::query(
                "INSERT OR REPLACE INTO notes (document_id, folder, word_count) VALUES (?, ?, ?)",
            )
            .bind(document_id)
            .bind(&f.folder)
            .bind(f.word_count)
            .execute(&mut **tx)
            .await?;
        }
        SideFields::Contact(f) => {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO contacts (document_id, emails, phones, organization)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(document_id)
            .bind(serde_json::to_string(
                &f.emails.iter().map(|e| e.to_lowercase()).collect::<Vec<_>>(),
            )?)
            .bind(serde_json::to_string(&f.phones)?)
            .bind(&f.organization)
            .execute(&mut **tx)
            .await?;
        }
        SideFields::Message(f) => {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO messages
                    (document_id, thread_id, sender, service, is_from_me, sent_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(document_id)
            .bind(&f.thread_id)
            .bind(&f.sender)
            .bind(&f.service)
            .bind(f.is_from_me as i64)
            .bind(f.sent_at)
            .execute(&mut **tx)
            .await?;
        }
        SideFields::File(f) => {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO files
                    (document_id, path, mime_type, size_bytes, modified_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(document_id)
            .bind(&f.path)
            .bind(&f.mime_type)
            .bind(f.size_bytes)
            .bind(f.modified_at)
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}

fn document_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Document> {
    let kind: String = row.get("kind");
    Ok(Document {
        id: row.get("id"),
        kind: DocumentKind::parse(&kind)?,
        title: row.get("title"),
        content: row.get("content"),
        source_app: row.get("source_app"),
        source_id: row.get("source_id"),
        source_uri: row.get("source_uri"),
        content_hash: row.get("content_hash"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        last_seen_at: row.get("last_seen_at"),
        deleted: row.get::<i64, _>("deleted") != 0,
    })
}

fn parse_json_list(raw: String) -> Vec<String> {
    serde_json::from_str(&raw).unwrap_or_default()
}
