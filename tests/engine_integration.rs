//! End-to-end scenarios through the engine facade: ingest → search,
//! hybrid degradation, plan/confirm/execute, rollback, hash gating, and
//! re-ingest stability. Each test builds a fresh engine over a temp
//! store.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use kenny::config::Config;
use kenny::engine::Engine;
use kenny::extractor::{IngestMode, SourceExtractor, StaticExtractor};
use kenny::models::{DocumentKind, SourceRecord};
use kenny::plan::{Planner, PlannerOutput, PlannerStep, PlanStatus};
use kenny::search::SearchOptions;
use kenny::tools::ToolSpec;

fn test_config(tmp: &TempDir, embeddings: bool) -> Config {
    let mut config = Config::default();
    config.store.path = tmp.path().join("kenny.sqlite3");
    config.audit.dir = tmp.path().join("logs");
    config.sources.records_dir = tmp.path().join("sources");
    config.jobs.workers = 2;
    if embeddings {
        config.embedding.provider = "hash".to_string();
        config.embedding.model = Some("hash-projection-v1".to_string());
        config.embedding.dims = Some(64);
    }
    config
}

fn email(source_id: &str, title: &str, content: &str) -> SourceRecord {
    SourceRecord {
        source_id: source_id.into(),
        kind: DocumentKind::Email,
        title: title.into(),
        content: content.into(),
        source_uri: None,
        fields: serde_json::json!({"from_address": "jane@example.com"}),
        created_at: 1_700_000_000,
        updated_at: 1_700_000_000,
        tombstone: false,
    }
}

fn contact(source_id: &str, name: &str) -> SourceRecord {
    SourceRecord {
        source_id: source_id.into(),
        kind: DocumentKind::Contact,
        title: name.into(),
        content: String::new(),
        source_uri: None,
        fields: serde_json::json!({"emails": ["jane@example.com"]}),
        created_at: 1_700_000_000,
        updated_at: 1_700_000_000,
        tombstone: false,
    }
}

fn seed_extractors() -> Vec<Arc<dyn SourceExtractor>> {
    vec![
        Arc::new(StaticExtractor::new(
            "contacts",
            vec![contact("c1", "Jane Roe")],
        )),
        Arc::new(StaticExtractor::new(
            "mail",
            vec![
                email("e1", "Project Apollo kickoff", "budget and milestones"),
                email("e2", "Lunch", "pizza"),
            ],
        )),
    ]
}

async fn seeded_engine(tmp: &TempDir, embeddings: bool) -> Engine {
    let mut engine = Engine::open(test_config(tmp, embeddings)).await.unwrap();
    engine.set_extractors(seed_extractors());
    engine
        .ingest(IngestMode::Full, None, &CancellationToken::new())
        .await
        .unwrap();
    engine
}

fn audit_lines(tmp: &TempDir) -> Vec<serde_json::Value> {
    let raw = std::fs::read_to_string(tmp.path().join("logs").join("audit.ndjson"))
        .unwrap_or_default();
    raw.lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

// ============ Ingest → search ============

#[tokio::test]
async fn ingest_then_keyword_search() {
    let tmp = TempDir::new().unwrap();
    let engine = seeded_engine(&tmp, false).await;

    let hits = engine.keyword_search("Apollo", 10, &[]).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].title, "Project Apollo kickoff");
    assert!(
        hits[0].snippet.contains("<mark>Apollo</mark>"),
        "snippet was: {}",
        hits[0].snippet
    );
    assert!(hits[0].bm25_score > 0.0);

    let hits = engine.keyword_search("pizza", 10, &[]).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].title, "Lunch");

    let hits = engine.keyword_search("Jane", 10, &[]).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].title, "Jane Roe");

    // Empty query is an empty list, not an error.
    let hits = engine.keyword_search("", 10, &[]).await.unwrap();
    assert!(hits.is_empty());

    engine.shutdown().await;
}

#[tokio::test]
async fn kind_filter_restricts_results() {
    let tmp = TempDir::new().unwrap();
    let engine = seeded_engine(&tmp, false).await;

    let hits = engine
        .keyword_search("Jane", 10, &[DocumentKind::Email])
        .await
        .unwrap();
    assert!(hits.is_empty(), "contact must not match an email-only search");

    engine.shutdown().await;
}

// ============ Hybrid degradation ============

#[tokio::test]
async fn hybrid_search_degrades_without_vector_backend() {
    let tmp = TempDir::new().unwrap();
    // Embeddings disabled: the vector path reports unavailable.
    let engine = seeded_engine(&tmp, false).await;

    let opts = engine.default_search_options();
    let response = engine.search("budget", &opts).await.unwrap();
    assert!(!response.partial);
    assert!(response.warning.is_some(), "degradation must be surfaced");
    assert_eq!(response.hits.len(), 1);
    assert_eq!(response.hits[0].title, "Project Apollo kickoff");
    assert!(response.hits[0].bm25_score > 0.0);
    assert_eq!(response.hits[0].vector_score, 0.0);

    engine.shutdown().await;
}

#[tokio::test]
async fn hybrid_search_uses_vectors_when_available() {
    let tmp = TempDir::new().unwrap();
    let engine = seeded_engine(&tmp, true).await;
    let written = engine.rebuild_embeddings(false).await.unwrap();
    assert!(written >= 3, "every chunk should gain a vector, got {written}");

    // Query with the exact stored chunk text: the originating chunk must
    // come back at rank 1 with near-perfect similarity.
    let chunk_text: String = sqlx::query_scalar(
        "SELECT c.text FROM chunks c JOIN documents d ON d.id = c.document_id WHERE d.source_id = 'e2'",
    )
    .fetch_one(engine.store().pool())
    .await
    .unwrap();

    let response = engine
        .search(&chunk_text, &engine.default_search_options())
        .await
        .unwrap();
    assert!(response.warning.is_none());
    assert!(!response.hits.is_empty());
    assert_eq!(response.hits[0].title, "Lunch");
    assert!(
        response.hits[0].vector_score >= 0.99,
        "vector score was {}",
        response.hits[0].vector_score
    );

    engine.shutdown().await;
}

// ============ Plan / confirm / execute ============

#[tokio::test]
async fn plan_confirm_execute_happy_path() {
    let tmp = TempDir::new().unwrap();
    let engine = seeded_engine(&tmp, false).await;

    let plan = engine
        .plan("remind me to call Jane tomorrow at 2pm")
        .await
        .unwrap();
    assert_eq!(plan.status, PlanStatus::Pending);
    assert_eq!(plan.steps.len(), 1);
    assert_eq!(plan.steps[0].tool_name, "create_reminder");
    assert!(plan.steps[0].is_mutating);
    let hash = plan.operation_hash.clone().expect("mutating plan must carry a hash");

    let executed = engine
        .confirm_and_execute(&plan.id, Some(&hash), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(executed.status, PlanStatus::Completed);
    assert_eq!(executed.results.len(), 1);
    let reminder_id = executed.results[0].output["document_id"]
        .as_str()
        .unwrap()
        .to_string();

    let reminder = engine.store().get_document(&reminder_id).await.unwrap().unwrap();
    assert_eq!(reminder.kind, DocumentKind::Reminder);
    assert_eq!(reminder.title, "call Jane tomorrow at 2pm");
    assert!(!reminder.deleted);

    engine.shutdown().await;

    // Every event of the run shares the plan's correlation id.
    let correlation = &plan.correlation_id;
    let events: Vec<String> = audit_lines(&tmp)
        .iter()
        .filter(|l| l["correlation_id"] == correlation.as_str())
        .map(|l| l["event"].as_str().unwrap().to_string())
        .collect();
    for expected in [
        "plan_created",
        "plan_confirmed",
        "execution_started",
        "step_started",
        "step_completed",
        "plan_completed",
    ] {
        assert!(
            events.iter().any(|e| e == expected),
            "missing audit event '{expected}' in {events:?}"
        );
    }
}

#[tokio::test]
async fn executing_a_completed_plan_is_a_noop() {
    let tmp = TempDir::new().unwrap();
    let engine = seeded_engine(&tmp, false).await;

    let plan = engine.plan("remind me to file taxes").await.unwrap();
    let hash = plan.operation_hash.clone().unwrap();
    let cancel = CancellationToken::new();

    let first = engine
        .confirm_and_execute(&plan.id, Some(&hash), &cancel)
        .await
        .unwrap();
    assert_eq!(first.status, PlanStatus::Completed);

    // Second call: same terminal state, no duplicate side effects.
    let second = engine
        .confirm_and_execute(&plan.id, Some(&hash), &cancel)
        .await
        .unwrap();
    assert_eq!(second.status, PlanStatus::Completed);
    assert_eq!(second.results.len(), first.results.len());

    let reminders: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM reminders")
        .fetch_one(engine.store().pool())
        .await
        .unwrap();
    assert_eq!(reminders, 1);

    engine.shutdown().await;
}

// ============ Hash gating ============

#[tokio::test]
async fn wrong_hash_blocks_execution() {
    let tmp = TempDir::new().unwrap();
    let engine = seeded_engine(&tmp, false).await;

    let plan = engine.plan("remind me to call Jane").await.unwrap();
    // A hash computed over tampered arguments never matches the plan's.
    let tampered = engine.plan("remind me to call John").await.unwrap();
    let wrong_hash = tampered.operation_hash.unwrap();
    assert_ne!(plan.operation_hash.as_deref(), Some(wrong_hash.as_str()));

    let err = engine
        .confirm_and_execute(&plan.id, Some(&wrong_hash), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "hash_mismatch");

    // No execution happened: plan still pending, nothing created.
    let reloaded = engine.get_plan(&plan.id).await.unwrap();
    assert_eq!(reloaded.status, PlanStatus::Pending);
    let reminders: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM reminders")
        .fetch_one(engine.store().pool())
        .await
        .unwrap();
    assert_eq!(reminders, 0);

    engine.shutdown().await;

    let events: Vec<serde_json::Value> = audit_lines(&tmp)
        .into_iter()
        .filter(|l| l["correlation_id"] == plan.correlation_id.as_str())
        .collect();
    assert!(
        events.iter().all(|l| l["event"] != "execution_started"),
        "no execution event may be written on hash mismatch"
    );
}

#[tokio::test]
async fn missing_hash_blocks_mutating_plans() {
    let tmp = TempDir::new().unwrap();
    let engine = seeded_engine(&tmp, false).await;

    let plan = engine.plan("remind me to water the plants").await.unwrap();
    let err = engine
        .confirm_and_execute(&plan.id, None, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "hash_mismatch");

    engine.shutdown().await;
}

// ============ Rollback ============

struct ScriptedPlanner {
    steps: Vec<PlannerStep>,
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(&self, _query: &str, _tools: &[ToolSpec]) -> kenny::error::Result<PlannerOutput> {
        Ok(PlannerOutput {
            steps: self
                .steps
                .iter()
                .map(|s| PlannerStep {
                    tool_name: s.tool_name.clone(),
                    arguments: s.arguments.clone(),
                    description: s.description.clone(),
                })
                .collect(),
            intent: "command".into(),
            entities: Vec::new(),
        })
    }
}

#[tokio::test]
async fn failed_step_rolls_back_completed_steps_in_reverse() {
    let tmp = TempDir::new().unwrap();
    let mut engine = Engine::open(test_config(&tmp, false)).await.unwrap();
    engine
        .register_tool(
            "send_probe",
            "Always fails after the creates succeed",
            serde_json::json!({"type": "object", "additionalProperties": false}),
            true,
            true,
            Arc::new(|_| {
                Box::pin(async { Err(kenny::error::Error::Internal("probe transport down".into())) })
            }),
        )
        .unwrap();

    let planner = ScriptedPlanner {
        steps: vec![
            PlannerStep {
                tool_name: "create_reminder".into(),
                arguments: serde_json::json!({"title": "call Jane"}),
                description: "A".into(),
            },
            PlannerStep {
                tool_name: "create_event".into(),
                arguments: serde_json::json!({"title": "Apollo sync"}),
                description: "B".into(),
            },
            PlannerStep {
                tool_name: "send_probe".into(),
                arguments: serde_json::json!({}),
                description: "C".into(),
            },
        ],
    };

    let plan = engine.plan_with("multi-step request", &planner).await.unwrap();
    assert_eq!(plan.steps.len(), 3);
    let hash = plan.operation_hash.clone().unwrap();

    let executed = engine
        .confirm_and_execute(&plan.id, Some(&hash), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(executed.status, PlanStatus::Failed);
    assert_eq!(executed.results.len(), 2, "A and B completed before C failed");

    // Compensation ran over completed steps in strictly decreasing order.
    assert_eq!(executed.rollback_results.len(), 2);
    assert_eq!(executed.rollback_results[0].step_index, 1);
    assert_eq!(executed.rollback_results[0].tool_name, "create_event");
    assert!(executed.rollback_results[0].success);
    assert_eq!(executed.rollback_results[1].step_index, 0);
    assert_eq!(executed.rollback_results[1].tool_name, "create_reminder");
    assert!(executed.rollback_results[1].success);

    // The created reminder and event are gone again.
    for result in &executed.results {
        let id = result.output["document_id"].as_str().unwrap();
        let doc = engine.store().get_document(id).await.unwrap().unwrap();
        assert!(doc.deleted, "{} must be rolled back", result.tool_name);
    }

    engine.shutdown().await;

    let lines = audit_lines(&tmp);
    let compensations: Vec<&serde_json::Value> = lines
        .iter()
        .filter(|l| l["event"] == "compensation_applied")
        .collect();
    assert_eq!(compensations.len(), 2);
    assert_eq!(compensations[0]["step_index"], 1);
    assert_eq!(compensations[1]["step_index"], 0);
}

// ============ Untrusted queries ============

#[tokio::test]
async fn untrusted_query_requires_explicit_confirmation() {
    let tmp = TempDir::new().unwrap();
    let engine = seeded_engine(&tmp, false).await;

    // Non-mutating search, but the destructive pattern downgrades trust.
    let plan = engine.run("find notes mentioning rm -rf cleanup").await.unwrap();
    assert_eq!(plan.status, PlanStatus::Pending, "must not auto-execute");
    assert!(plan
        .risks
        .iter()
        .any(|r| r.step_index.is_none() && r.reason.contains("confirmation")));

    // An explicit execute is the confirmation; no hash needed without
    // mutating steps.
    let executed = engine
        .confirm_and_execute(&plan.id, None, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(executed.status, PlanStatus::Completed);

    engine.shutdown().await;
}

#[tokio::test]
async fn trusted_read_only_queries_auto_execute() {
    let tmp = TempDir::new().unwrap();
    let engine = seeded_engine(&tmp, false).await;

    let plan = engine.run("find the Apollo budget").await.unwrap();
    assert_eq!(plan.status, PlanStatus::Completed);
    assert_eq!(plan.steps[0].tool_name, "search_documents");
    let count = plan.results[0].output["count"].as_u64().unwrap();
    assert!(count >= 1);

    engine.shutdown().await;
}

// ============ Plan TTL ============

#[tokio::test]
async fn expired_plans_refuse_confirmation() {
    let tmp = TempDir::new().unwrap();
    let engine = seeded_engine(&tmp, false).await;

    let plan = engine.plan("remind me to rotate backups").await.unwrap();
    let hash = plan.operation_hash.clone().unwrap();

    // Rewind the stored expiry to one second ago.
    let data: String = sqlx::query_scalar("SELECT data FROM plans WHERE id = ?")
        .bind(&plan.id)
        .fetch_one(engine.store().pool())
        .await
        .unwrap();
    let mut stored: serde_json::Value = serde_json::from_str(&data).unwrap();
    let expired_at = kenny::models::now_ts() - 1;
    stored["expires_at"] = serde_json::json!(expired_at);
    sqlx::query("UPDATE plans SET expires_at = ?, data = ? WHERE id = ?")
        .bind(expired_at)
        .bind(stored.to_string())
        .bind(&plan.id)
        .execute(engine.store().pool())
        .await
        .unwrap();

    let err = engine
        .confirm_and_execute(&plan.id, Some(&hash), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "expired");
    assert_eq!(
        engine.get_plan(&plan.id).await.unwrap().status,
        PlanStatus::Expired
    );

    engine.shutdown().await;
}

// ============ Re-ingest stability ============

#[tokio::test]
async fn full_reingest_reports_no_changes_and_keeps_ids() {
    let tmp = TempDir::new().unwrap();
    let mut engine = Engine::open(test_config(&tmp, false)).await.unwrap();
    engine.set_extractors(seed_extractors());
    let cancel = CancellationToken::new();

    engine.ingest(IngestMode::Full, None, &cancel).await.unwrap();
    let ids_before: Vec<String> = sqlx::query_scalar("SELECT id FROM documents ORDER BY id")
        .fetch_all(engine.store().pool())
        .await
        .unwrap();

    let (_, stats) = engine.ingest(IngestMode::Full, None, &cancel).await.unwrap();
    for source in &stats {
        assert_eq!(source.created, 0, "{}: created", source.source);
        assert_eq!(source.updated, 0, "{}: updated", source.source);
        assert_eq!(source.errors, 0, "{}: errors", source.source);
    }

    let ids_after: Vec<String> = sqlx::query_scalar("SELECT id FROM documents ORDER BY id")
        .fetch_all(engine.store().pool())
        .await
        .unwrap();
    assert_eq!(ids_before, ids_after);

    engine.shutdown().await;
}

// ============ Ingest selection ============

#[tokio::test]
async fn ingest_can_target_named_sources() {
    let tmp = TempDir::new().unwrap();
    let mut engine = Engine::open(test_config(&tmp, false)).await.unwrap();
    engine.set_extractors(seed_extractors());

    let (_, stats) = engine
        .ingest(
            IngestMode::Full,
            Some(&["mail".to_string()]),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].source, "mail");

    let contacts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM contacts")
        .fetch_one(engine.store().pool())
        .await
        .unwrap();
    assert_eq!(contacts, 0);

    engine.shutdown().await;
}

// ============ Background embedding job ============

#[tokio::test]
async fn scheduled_embedding_rebuild_populates_the_index() {
    let tmp = TempDir::new().unwrap();
    let engine = seeded_engine(&tmp, true).await;

    let job_id = engine.schedule_embedding_rebuild(false).await;
    engine.drain_jobs().await;

    let record = engine.job_status(&job_id).await.unwrap();
    assert_eq!(record.status, kenny::jobs::JobStatus::Completed);

    let vectors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
        .fetch_one(engine.store().pool())
        .await
        .unwrap();
    assert!(vectors >= 3);

    engine.shutdown().await;
}
