//! Database schema migrations.
//!
//! The schema is resolved to a known version on open. Each migration is
//! numbered and recorded in `schema_migrations(version, applied_at)`;
//! migrations are idempotent (guarded `CREATE ... IF NOT EXISTS`, FTS
//! creation checked against `sqlite_master`) and additive. Designed to be
//! run via `kenny init`, and re-run implicitly whenever the engine opens
//! a store.

use sqlx::SqlitePool;

use crate::error::Result;
use crate::models::now_ts;

/// Latest schema version produced by [`run_migrations`].
pub const SCHEMA_VERSION: i64 = 6;

struct Migration {
    version: i64,
    statements: &'static [&'static str],
}

const MIGRATIONS: &[Migration] = &[
    // v1: documents — the canonical unit of content
    Migration {
        version: 1,
        statements: &[
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                content TEXT NOT NULL DEFAULT '',
                source_app TEXT NOT NULL,
                source_id TEXT NOT NULL,
                source_uri TEXT,
                content_hash TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                last_seen_at INTEGER NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                UNIQUE(source_app, source_id)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_documents_kind ON documents(kind)",
            "CREATE INDEX IF NOT EXISTS idx_documents_source_app ON documents(source_app)",
            "CREATE INDEX IF NOT EXISTS idx_documents_updated_at ON documents(updated_at DESC)",
        ],
    },
    // v2: per-kind side tables, one-to-one with documents
    Migration {
        version: 2,
        statements: &[
            r#"
            CREATE TABLE IF NOT EXISTS emails (
                document_id TEXT PRIMARY KEY,
                from_address TEXT NOT NULL DEFAULT '',
                to_addresses TEXT NOT NULL DEFAULT '[]',
                cc_addresses TEXT NOT NULL DEFAULT '[]',
                mailbox TEXT NOT NULL DEFAULT '',
                date_sent INTEGER,
                is_read INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS events (
                document_id TEXT PRIMARY KEY,
                start_at INTEGER,
                end_at INTEGER,
                location TEXT NOT NULL DEFAULT '',
                organizer TEXT NOT NULL DEFAULT '',
                attendees TEXT NOT NULL DEFAULT '[]',
                calendar TEXT NOT NULL DEFAULT '',
                all_day INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS reminders (
                document_id TEXT PRIMARY KEY,
                due_at INTEGER,
                completed INTEGER NOT NULL DEFAULT 0,
                completed_at INTEGER,
                list_name TEXT NOT NULL DEFAULT '',
                FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS notes (
                document_id TEXT PRIMARY KEY,
                folder TEXT NOT NULL DEFAULT '',
                word_count INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS contacts (
                document_id TEXT PRIMARY KEY,
                emails TEXT NOT NULL DEFAULT '[]',
                phones TEXT NOT NULL DEFAULT '[]',
                organization TEXT NOT NULL DEFAULT '',
                FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                document_id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL DEFAULT '',
                sender TEXT NOT NULL DEFAULT '',
                service TEXT NOT NULL DEFAULT '',
                is_from_me INTEGER NOT NULL DEFAULT 0,
                sent_at INTEGER,
                FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS files (
                document_id TEXT PRIMARY KEY,
                path TEXT NOT NULL DEFAULT '',
                mime_type TEXT NOT NULL DEFAULT '',
                size_bytes INTEGER NOT NULL DEFAULT 0,
                modified_at INTEGER,
                FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
            )
            "#,
        ],
    },
    // v3: chunks and the keyword index (FTS handled separately below)
    Migration {
        version: 3,
        statements: &[
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                order_index INTEGER NOT NULL,
                text TEXT NOT NULL,
                start_offset INTEGER NOT NULL,
                end_offset INTEGER NOT NULL,
                UNIQUE(document_id, order_index),
                FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)",
        ],
    },
    // v4: embeddings metadata and vector blobs
    Migration {
        version: 4,
        statements: &[
            r#"
            CREATE TABLE IF NOT EXISTS embeddings (
                chunk_id TEXT PRIMARY KEY,
                model_id TEXT NOT NULL,
                dims INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (chunk_id) REFERENCES chunks(id) ON DELETE CASCADE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS chunk_vectors (
                chunk_id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                embedding BLOB NOT NULL,
                FOREIGN KEY (chunk_id) REFERENCES chunks(id) ON DELETE CASCADE,
                FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_chunk_vectors_document_id ON chunk_vectors(document_id)",
        ],
    },
    // v5: relationships and the ingest run log
    Migration {
        version: 5,
        statements: &[
            r#"
            CREATE TABLE IF NOT EXISTS relationships (
                from_id TEXT NOT NULL,
                to_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                strength REAL NOT NULL DEFAULT 1.0,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (from_id, to_id, kind),
                CHECK (from_id != to_id),
                FOREIGN KEY (from_id) REFERENCES documents(id) ON DELETE CASCADE,
                FOREIGN KEY (to_id) REFERENCES documents(id) ON DELETE CASCADE
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_relationships_to_id ON relationships(to_id)",
            r#"
            CREATE TABLE IF NOT EXISTS ingest_log (
                id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                mode TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                completed_at INTEGER NOT NULL,
                processed INTEGER NOT NULL,
                created INTEGER NOT NULL,
                updated INTEGER NOT NULL,
                errors INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_ingest_log_source ON ingest_log(source, completed_at DESC)",
        ],
    },
    // v6: persisted plans for cross-process confirm/execute
    Migration {
        version: 6,
        statements: &[
            r#"
            CREATE TABLE IF NOT EXISTS plans (
                id TEXT PRIMARY KEY,
                correlation_id TEXT NOT NULL,
                status TEXT NOT NULL,
                operation_hash TEXT,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                data TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_plans_status ON plans(status)",
        ],
    },
];

pub async fn run_migrations(pool: &SqlitePool) -> Result<i64> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    for migration in MIGRATIONS {
        let applied: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM schema_migrations WHERE version = ?",
        )
        .bind(migration.version)
        .fetch_one(pool)
        .await?;

        if applied {
            continue;
        }

        for statement in migration.statements {
            sqlx::query(statement).execute(pool).await?;
        }

        sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (?, ?)")
            .bind(migration.version)
            .bind(now_ts())
            .execute(pool)
            .await?;
    }

    // FTS5 virtual table over document title + content (not idempotent
    // natively, check first)
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='documents_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE documents_fts USING fts5(
                document_id UNINDEXED,
                title,
                content
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    current_version(pool).await
}

/// Highest applied migration version.
pub async fn current_version(pool: &SqlitePool) -> Result<i64> {
    let version: Option<i64> =
        sqlx::query_scalar("SELECT MAX(version) FROM schema_migrations")
            .fetch_one(pool)
            .await?;
    Ok(version.unwrap_or(0))
}
