//! Core data models used throughout Kenny.
//!
//! These types represent the documents, kind-specific side records, chunks,
//! relationships, and search results that flow through the ingestion and
//! retrieval pipeline. Untyped JSON appears only at extractor and tool
//! boundaries; everything past normalization is a typed record.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// The seven content kinds the unified store understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Email,
    Event,
    Reminder,
    Note,
    Contact,
    Message,
    File,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Email => "email",
            DocumentKind::Event => "event",
            DocumentKind::Reminder => "reminder",
            DocumentKind::Note => "note",
            DocumentKind::Contact => "contact",
            DocumentKind::Message => "message",
            DocumentKind::File => "file",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "email" => Ok(DocumentKind::Email),
            "event" => Ok(DocumentKind::Event),
            "reminder" => Ok(DocumentKind::Reminder),
            "note" => Ok(DocumentKind::Note),
            "contact" => Ok(DocumentKind::Contact),
            "message" => Ok(DocumentKind::Message),
            "file" => Ok(DocumentKind::File),
            other => Err(Error::ValidationFailed {
                field: "kind".into(),
                reason: format!("unknown document kind '{other}'"),
            }),
        }
    }

    /// The side table this kind's record lives in.
    pub fn side_table(&self) -> &'static str {
        match self {
            DocumentKind::Email => "emails",
            DocumentKind::Event => "events",
            DocumentKind::Reminder => "reminders",
            DocumentKind::Note => "notes",
            DocumentKind::Contact => "contacts",
            DocumentKind::Message => "messages",
            DocumentKind::File => "files",
        }
    }

    pub fn all() -> [DocumentKind; 7] {
        [
            DocumentKind::Email,
            DocumentKind::Event,
            DocumentKind::Reminder,
            DocumentKind::Note,
            DocumentKind::Contact,
            DocumentKind::Message,
            DocumentKind::File,
        ]
    }
}

/// Canonical unit of content in the unified store.
///
/// `(source_app, source_id)` is a unique alternate key; `id` is stable
/// across re-ingestion when the alternate key matches. Tombstoned rows are
/// retained with `deleted = true`.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub kind: DocumentKind,
    pub title: String,
    pub content: String,
    pub source_app: String,
    pub source_id: String,
    pub source_uri: Option<String>,
    pub content_hash: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_seen_at: i64,
    pub deleted: bool,
}

// ============ Side records ============

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailFields {
    #[serde(default)]
    pub from_address: String,
    #[serde(default)]
    pub to_addresses: Vec<String>,
    #[serde(default)]
    pub cc_addresses: Vec<String>,
    #[serde(default)]
    pub mailbox: String,
    #[serde(default)]
    pub date_sent: Option<i64>,
    #[serde(default)]
    pub is_read: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFields {
    #[serde(default)]
    pub start_at: Option<i64>,
    #[serde(default)]
    pub end_at: Option<i64>,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub organizer: String,
    #[serde(default)]
    pub attendees: Vec<String>,
    #[serde(default)]
    pub calendar: String,
    #[serde(default)]
    pub all_day: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReminderFields {
    #[serde(default)]
    pub due_at: Option<i64>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub completed_at: Option<i64>,
    #[serde(default)]
    pub list_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NoteFields {
    #[serde(default)]
    pub folder: String,
    #[serde(default)]
    pub word_count: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContactFields {
    #[serde(default)]
    pub emails: Vec<String>,
    #[serde(default)]
    pub phones: Vec<String>,
    #[serde(default)]
    pub organization: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageFields {
    #[serde(default)]
    pub thread_id: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub is_from_me: bool,
    #[serde(default)]
    pub sent_at: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileFields {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub size_bytes: i64,
    #[serde(default)]
    pub modified_at: Option<i64>,
}

/// Kind-specific fields, one-to-one with a [`Document`] of matching kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SideFields {
    Email(EmailFields),
    Event(EventFields),
    Reminder(ReminderFields),
    Note(NoteFields),
    Contact(ContactFields),
    Message(MessageFields),
    File(FileFields),
}

impl SideFields {
    pub fn kind(&self) -> DocumentKind {
        match self {
            SideFields::Email(_) => DocumentKind::Email,
            SideFields::Event(_) => DocumentKind::Event,
            SideFields::Reminder(_) => DocumentKind::Reminder,
            SideFields::Note(_) => DocumentKind::Note,
            SideFields::Contact(_) => DocumentKind::Contact,
            SideFields::Message(_) => DocumentKind::Message,
            SideFields::File(_) => DocumentKind::File,
        }
    }

    /// Parse an untyped field map from an extractor into a typed side record.
    ///
    /// This is the only place untyped JSON from a source crosses into the
    /// engine. Unknown fields are ignored; missing fields take defaults.
    pub fn from_json(kind: DocumentKind, fields: serde_json::Value) -> Result<Self> {
        let fields = if fields.is_null() {
            serde_json::json!({})
        } else {
            fields
        };
        Ok(match kind {
            DocumentKind::Email => SideFields::Email(serde_json::from_value(fields)?),
            DocumentKind::Event => SideFields::Event(serde_json::from_value(fields)?),
            DocumentKind::Reminder => SideFields::Reminder(serde_json::from_value(fields)?),
            DocumentKind::Note => SideFields::Note(serde_json::from_value(fields)?),
            DocumentKind::Contact => SideFields::Contact(serde_json::from_value(fields)?),
            DocumentKind::Message => SideFields::Message(serde_json::from_value(fields)?),
            DocumentKind::File => SideFields::File(serde_json::from_value(fields)?),
        })
    }

    /// Default side record for a kind, used when an extractor supplies none.
    pub fn empty(kind: DocumentKind) -> Self {
        match kind {
            DocumentKind::Email => SideFields::Email(EmailFields::default()),
            DocumentKind::Event => SideFields::Event(EventFields::default()),
            DocumentKind::Reminder => SideFields::Reminder(ReminderFields::default()),
            DocumentKind::Note => SideFields::Note(NoteFields::default()),
            DocumentKind::Contact => SideFields::Contact(ContactFields::default()),
            DocumentKind::Message => SideFields::Message(MessageFields::default()),
            DocumentKind::File => SideFields::File(FileFields::default()),
        }
    }
}

// ============ Extractor records ============

/// Normalized record produced by a [`crate::extractor::SourceExtractor`]
/// before it becomes a [`Document`] plus side record.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceRecord {
    pub source_id: String,
    pub kind: DocumentKind,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub source_uri: Option<String>,
    #[serde(default)]
    pub fields: serde_json::Value,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub tombstone: bool,
}

impl SourceRecord {
    /// Content hash over the normalizable fields, stable across processes.
    ///
    /// SHA-256 over kind, title, content, and the typed side record's
    /// canonical serialization. Timestamps are excluded so touch-only
    /// updates with identical content still skip.
    pub fn content_hash(&self, side: &SideFields) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.kind.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(self.title.as_bytes());
        hasher.update([0]);
        hasher.update(self.content.as_bytes());
        hasher.update([0]);
        // Struct serialization order is fixed by declaration, so this is
        // deterministic without key sorting.
        if let Ok(fields) = serde_json::to_string(side) {
            hasher.update(fields.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    /// Deterministic synthetic id for extractors that cannot supply one.
    pub fn synthetic_source_id(kind: DocumentKind, title: &str, content: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(title.as_bytes());
        hasher.update([0]);
        hasher.update(content.as_bytes());
        format!("synthetic:{:x}", hasher.finalize())
    }
}

// ============ Chunks ============

/// A retrievable slice of a document's content.
///
/// `id` is a pure function of `(document_id, start_offset)`; re-running the
/// chunker over identical content yields identical ids.
#[derive(Debug, Clone, Serialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub order_index: i64,
    pub text: String,
    pub start_offset: i64,
    pub end_offset: i64,
}

impl Chunk {
    pub fn deterministic_id(document_id: &str, start_offset: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(document_id.as_bytes());
        hasher.update([0]);
        hasher.update(start_offset.to_le_bytes());
        format!("{:x}", hasher.finalize())
    }
}

// ============ Relationships ============

/// Edge kinds between documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    RepliesTo,
    Mentions,
    Attended,
    AttachedTo,
    SentBy,
}

impl RelationshipKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipKind::RepliesTo => "replies_to",
            RelationshipKind::Mentions => "mentions",
            RelationshipKind::Attended => "attended",
            RelationshipKind::AttachedTo => "attached_to",
            RelationshipKind::SentBy => "sent_by",
        }
    }
}

/// Directed, weighted edge between two documents.
///
/// Self-edges are rejected at write time; `(from_id, to_id, kind)` is unique.
#[derive(Debug, Clone, Serialize)]
pub struct Relationship {
    pub from_id: String,
    pub to_id: String,
    pub kind: RelationshipKind,
    pub strength: f64,
    pub created_at: i64,
}

// ============ Ingest ============

/// Outcome summary for one source's ingest run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestStats {
    pub source: String,
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub errors: u64,
    pub duration_ms: u64,
}

// ============ Search ============

/// A fused search hit carrying both raw component scores and the combined
/// score. `vector_score` is zero when the vector backend did not contribute.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub document_id: String,
    pub chunk_id: Option<String>,
    pub title: String,
    pub snippet: String,
    pub score: f64,
    pub bm25_score: f64,
    pub vector_score: f64,
    pub source_app: String,
    pub source_uri: Option<String>,
    #[serde(skip)]
    pub updated_at: i64,
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}
