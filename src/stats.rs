//! Store statistics and health overview.
//!
//! Provides a quick summary of what's indexed: per-table counts, per-kind
//! and per-source breakdowns, embedding coverage, and the most recent
//! ingest run per source. Used by `kenny stats` to give confidence that
//! ingests and embedding rebuilds are doing what they should.

use serde::Serialize;
use sqlx::Row;

use crate::error::Result;
use crate::migrate;
use crate::store::Store;

#[derive(Debug, Clone, Serialize)]
pub struct SourceBreakdown {
    pub source: String,
    pub documents: i64,
    pub last_run_mode: Option<String>,
    pub last_run_completed_at: Option<i64>,
    pub last_run_errors: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub schema_version: i64,
    pub documents: i64,
    pub deleted_documents: i64,
    pub by_kind: Vec<(String, i64)>,
    pub chunks: i64,
    pub embedded_chunks: i64,
    pub relationships: i64,
    pub plans: i64,
    pub sources: Vec<SourceBreakdown>,
}

pub async fn gather(store: &Store) -> Result<StatsReport> {
    let pool = store.pool();

    let schema_version = migrate::current_version(pool).await?;
    let documents = store.count("documents").await?;
    let deleted_documents: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE deleted = 1")
            .fetch_one(pool)
            .await?;

    let kind_rows = sqlx::query("SELECT kind, COUNT(*) AS n FROM documents GROUP BY kind ORDER BY kind")
        .fetch_all(pool)
        .await?;
    let by_kind = kind_rows
        .iter()
        .map(|r| (r.get::<String, _>("kind"), r.get::<i64, _>("n")))
        .collect();

    let source_rows = sqlx::query(
        r#"
        SELECT d.source_app,
               COUNT(*) AS documents,
               (SELECT mode FROM ingest_log l WHERE l.source = d.source_app
                ORDER BY completed_at DESC LIMIT 1) AS last_mode,
               (SELECT MAX(completed_at) FROM ingest_log l WHERE l.source = d.source_app) AS last_completed,
               (SELECT errors FROM ingest_log l WHERE l.source = d.source_app
                ORDER BY completed_at DESC LIMIT 1) AS last_errors
        FROM documents d
        GROUP BY d.source_app
        ORDER BY d.source_app
        "#,
    )
    .fetch_all(pool)
    .await?;
    let sources = source_rows
        .iter()
        .map(|r| SourceBreakdown {
            source: r.get("source_app"),
            documents: r.get("documents"),
            last_run_mode: r.get("last_mode"),
            last_run_completed_at: r.get("last_completed"),
            last_run_errors: r.get("last_errors"),
        })
        .collect();

    Ok(StatsReport {
        schema_version,
        documents,
        deleted_documents,
        by_kind,
        chunks: store.count("chunks").await?,
        embedded_chunks: store.count("chunk_vectors").await?,
        relationships: store.count("relationships").await?,
        plans: store.count("plans").await?,
        sources,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentKind, SideFields, SourceRecord};
    use tempfile::TempDir;

    #[tokio::test]
    async fn gather_reports_counts() {
        let tmp = TempDir::new().unwrap();
        let pool = crate::db::connect(&tmp.path().join("kenny.sqlite3"))
            .await
            .unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        let store = Store::new(pool);

        let record = SourceRecord {
            source_id: "n1".into(),
            kind: DocumentKind::Note,
            title: "T".into(),
            content: "body".into(),
            source_uri: None,
            fields: serde_json::json!({}),
            created_at: 0,
            updated_at: 0,
            tombstone: false,
        };
        let side = SideFields::empty(DocumentKind::Note);
        store.upsert_document("notes", &record, &side).await.unwrap();

        let report = gather(&store).await.unwrap();
        assert_eq!(report.documents, 1);
        assert_eq!(report.schema_version, crate::migrate::SCHEMA_VERSION);
        assert_eq!(report.by_kind, vec![("note".to_string(), 1)]);
        assert_eq!(report.sources.len(), 1);
        assert_eq!(report.sources[0].source, "notes");
        assert!(report.sources[0].last_run_completed_at.is_none());
    }
}
