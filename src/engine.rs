//! Engine facade: one entry point per user-facing operation.
//!
//! An [`Engine`] is an explicit value owning every subsystem — store,
//! vector index, embedder, hybrid search, tool registry, plan manager,
//! compensation engine, background processor, audit sink. Nothing here is
//! a global; tests construct a fresh engine per test and the CLI
//! constructs one per invocation.
//!
//! The facade stays thin: it resolves configuration, builds correlation
//! ids, and wires components. Behavior lives in the subsystems.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audit::{new_correlation_id, AuditLogger};
use crate::compensation::CompensationEngine;
use crate::config::Config;
use crate::db;
use crate::embedding::{create_embedder, Embedder};
use crate::error::{Error, Result};
use crate::extractor::{IngestMode, NdjsonExtractor, SourceExtractor};
use crate::ingest::{engine_record, IngestCoordinator};
use crate::migrate;
use crate::models::{now_ts, Document, DocumentKind, IngestStats, SideFields};
use crate::plan::{create_planner, Plan, PlanManager, Planner};
use crate::search::{HybridSearch, SearchOptions, SearchResponse};
use crate::store::Store;
use crate::tools::{ToolHandler, ToolRegistry};
use crate::vector::VectorIndex;

/// Source label for documents the engine itself authors via tools.
pub const ENGINE_SOURCE_APP: &str = "kenny";

pub struct Engine {
    config: Config,
    store: Store,
    vector: VectorIndex,
    embedder: Arc<dyn Embedder>,
    search: HybridSearch,
    audit: AuditLogger,
    jobs: crate::jobs::BackgroundProcessor,
    plans: PlanManager,
    tools: ToolRegistry,
    compensation: CompensationEngine,
    planner: Box<dyn Planner>,
    extractors: Vec<Arc<dyn SourceExtractor>>,
}

impl Engine {
    /// Open (or create) the store, run migrations, and wire every
    /// subsystem. Configuration problems are fatal here.
    pub async fn open(config: Config) -> Result<Engine> {
        let pool = db::connect(&config.store.path).await?;
        migrate::run_migrations(&pool).await?;
        let store = Store::new(pool);

        let audit = AuditLogger::start(&config.audit)?;
        let vector = VectorIndex::new(store.clone());
        let embedder: Arc<dyn Embedder> = Arc::from(create_embedder(&config.embedding)?);
        let search = HybridSearch::new(store.clone(), vector.clone(), Arc::clone(&embedder));
        let jobs = crate::jobs::BackgroundProcessor::start(
            config.jobs.workers,
            config.jobs.history_capacity,
        );
        let plans = PlanManager::new(store.clone(), audit.clone());
        let compensation = CompensationEngine::with_defaults(audit.clone());
        let planner = create_planner(&config.planner)?;

        let mut tools = ToolRegistry::new(audit.clone());
        register_builtin_tools(&mut tools, &store, &search)?;

        let extractors =
            NdjsonExtractor::discover(&config.sources.records_dir, &config.sources.enabled);

        Ok(Engine {
            config,
            store,
            vector,
            embedder,
            search,
            audit,
            jobs,
            plans,
            tools,
            compensation,
            planner,
            extractors,
        })
    }

    // ============ Wiring hooks ============

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Replace the extractor set (tests, host-app integrations).
    pub fn set_extractors(&mut self, extractors: Vec<Arc<dyn SourceExtractor>>) {
        self.extractors = extractors;
    }

    /// Replace the planner backend.
    pub fn set_planner(&mut self, planner: Box<dyn Planner>) {
        self.planner = planner;
    }

    /// Register an additional tool on this engine's catalog.
    pub fn register_tool(
        &mut self,
        name: &str,
        description: &str,
        schema: serde_json::Value,
        is_mutating: bool,
        requires_confirmation: bool,
        handler: ToolHandler,
    ) -> Result<()> {
        self.tools
            .register(name, description, schema, is_mutating, requires_confirmation, handler)
    }

    // ============ Entry points ============

    /// Run the ingest pipeline over the configured (or named) sources.
    pub async fn ingest(
        &self,
        mode: IngestMode,
        sources: Option<&[String]>,
        cancel: &CancellationToken,
    ) -> Result<(String, Vec<IngestStats>)> {
        let correlation_id = new_correlation_id();
        let selected: Vec<Arc<dyn SourceExtractor>> = match sources {
            None => self.extractors.clone(),
            Some(names) => self
                .extractors
                .iter()
                .filter(|e| names.iter().any(|n| n == e.source_app()))
                .cloned()
                .collect(),
        };

        let coordinator =
            IngestCoordinator::new(self.store.clone(), self.config.clone(), self.audit.clone());
        let stats = coordinator
            .run(&selected, mode, &correlation_id, cancel)
            .await?;
        Ok((correlation_id, stats))
    }

    /// Hybrid search with explicit options.
    pub async fn search(&self, query: &str, opts: &SearchOptions) -> Result<SearchResponse> {
        self.search.search(query, opts).await
    }

    /// Keyword-only search (the plain `search` command).
    pub async fn keyword_search(
        &self,
        query: &str,
        limit: usize,
        kinds: &[DocumentKind],
    ) -> Result<Vec<crate::models::SearchHit>> {
        self.search.keyword_only(query, limit, kinds).await
    }

    pub fn default_search_options(&self) -> SearchOptions {
        SearchOptions::from_config(&self.config.retrieval)
    }

    /// Create a pending plan for a query; never executes.
    pub async fn plan(&self, query: &str) -> Result<Plan> {
        let correlation_id = new_correlation_id();
        self.plans
            .create(query, self.planner.as_ref(), &self.tools, &correlation_id)
            .await
    }

    /// Create a plan with a caller-supplied planner.
    pub async fn plan_with(&self, query: &str, planner: &dyn Planner) -> Result<Plan> {
        let correlation_id = new_correlation_id();
        self.plans
            .create(query, planner, &self.tools, &correlation_id)
            .await
    }

    pub async fn get_plan(&self, plan_id: &str) -> Result<Plan> {
        self.plans.get(plan_id).await
    }

    pub async fn cancel_plan(&self, plan_id: &str) -> Result<Plan> {
        self.plans.cancel(plan_id).await
    }

    /// Confirm (verifying the hash when the plan mutates) and execute.
    ///
    /// Re-running on a completed plan returns it unchanged: the first
    /// execution's hash was already verified, and no side effect repeats.
    pub async fn confirm_and_execute(
        &self,
        plan_id: &str,
        provided_hash: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Plan> {
        self.plans.expire_overdue().await?;

        let current = self.plans.get(plan_id).await?;
        match current.status {
            crate::plan::PlanStatus::Completed => return Ok(current),
            crate::plan::PlanStatus::Pending => {
                self.plans.confirm(plan_id, provided_hash).await?;
            }
            // Confirmed falls through to execute; every other state is
            // execute's conflict to report.
            _ => {}
        }

        self.plans
            .execute(plan_id, &self.tools, &self.compensation, cancel)
            .await
    }

    /// Plan → confirm → execute for one query.
    ///
    /// Plans that mutate, or whose query was flagged untrusted, stop at
    /// `pending` and are returned for an explicit `execute` with the
    /// operation hash — the reason is carried in the plan's risk records,
    /// never silently swallowed.
    pub async fn run(&self, query: &str) -> Result<Plan> {
        let plan = self.plan(query).await?;
        if !plan.auto_confirmable() {
            return Ok(plan);
        }
        self.plans.confirm(&plan.id, None).await?;
        self.plans
            .execute(&plan.id, &self.tools, &self.compensation, &CancellationToken::new())
            .await
    }

    // ============ Embeddings ============

    /// Generate embeddings for chunks missing them; `force` drops and
    /// rebuilds everything. Returns the number of vectors written.
    pub async fn rebuild_embeddings(&self, force: bool) -> Result<u64> {
        if !self.config.embedding.is_enabled() {
            return Err(Error::DependencyUnavailable(
                "embedding provider is disabled".into(),
            ));
        }
        if force {
            self.vector.clear().await?;
        }

        let batch_size = self.config.embedding.batch_size.max(1);
        let mut written = 0u64;
        loop {
            let pending = self
                .store
                .chunks_missing_embeddings(batch_size as i64)
                .await?;
            if pending.is_empty() {
                break;
            }

            let texts: Vec<String> = pending.iter().map(|(_, _, text)| text.clone()).collect();
            let vectors = self.embedder.embed(&texts).await?;
            for ((chunk_id, document_id, _), vector) in pending.iter().zip(vectors.iter()) {
                self.vector
                    .put(chunk_id, document_id, self.embedder.model_id(), vector)
                    .await?;
                written += 1;
            }
        }
        Ok(written)
    }

    /// Queue the embedding rebuild on the background processor.
    pub async fn schedule_embedding_rebuild(&self, force: bool) -> String {
        let store = self.store.clone();
        let vector = self.vector.clone();
        let embedder = Arc::clone(&self.embedder);
        let batch_size = self.config.embedding.batch_size.max(1);

        self.jobs
            .submit(crate::jobs::JobSpec {
                name: "rebuild_embeddings".into(),
                priority: crate::jobs::JobPriority::Low,
                retry_policy: crate::jobs::RetryPolicy::default_policy(),
                run: Arc::new(move |cancel| {
                    let store = store.clone();
                    let vector = vector.clone();
                    let embedder = Arc::clone(&embedder);
                    Box::pin(async move {
                        if force {
                            vector.clear().await?;
                        }
                        let mut written = 0u64;
                        loop {
                            if cancel.is_cancelled() {
                                return Err(Error::Cancelled);
                            }
                            let pending =
                                store.chunks_missing_embeddings(batch_size as i64).await?;
                            if pending.is_empty() {
                                break;
                            }
                            let texts: Vec<String> =
                                pending.iter().map(|(_, _, text)| text.clone()).collect();
                            let vectors = embedder.embed(&texts).await?;
                            for ((chunk_id, document_id, _), v) in
                                pending.iter().zip(vectors.iter())
                            {
                                vector
                                    .put(chunk_id, document_id, embedder.model_id(), v)
                                    .await?;
                                written += 1;
                            }
                        }
                        Ok(serde_json::json!({ "written": written }))
                    })
                }),
            })
            .await
    }

    // ============ Jobs ============

    pub async fn job_status(&self, job_id: &str) -> Result<crate::jobs::JobRecord> {
        self.jobs.status(job_id).await
    }

    pub async fn cancel_job(&self, job_id: &str) -> Result<crate::jobs::JobRecord> {
        self.jobs.cancel(job_id).await
    }

    pub async fn active_jobs(&self) -> Vec<crate::jobs::JobRecord> {
        self.jobs.active_jobs().await
    }

    pub async fn job_history(&self) -> Vec<crate::jobs::JobRecord> {
        self.jobs.history().await
    }

    /// Wait until no job is pending or running (tests, clean shutdown).
    pub async fn drain_jobs(&self) {
        self.jobs.drain().await;
    }

    // ============ Documents ============

    /// One document plus its typed side record.
    pub async fn get_document_with_side(&self, id: &str) -> Result<(Document, SideFields)> {
        let document = self
            .store
            .get_document(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("document '{id}'")))?;
        let side = self.store.get_side_fields(id, document.kind).await?;
        Ok((document, side))
    }

    /// Flush audit records and stop background workers.
    pub async fn shutdown(self) {
        self.jobs.shutdown().await;
        self.audit.shutdown().await;
        self.store.pool().close().await;
    }
}

// ============ Builtin tools ============

fn register_builtin_tools(
    tools: &mut ToolRegistry,
    store: &Store,
    search: &HybridSearch,
) -> Result<()> {
    // search_documents
    {
        let search = search.clone();
        tools.register(
            "search_documents",
            "Search indexed documents by keyword and meaning",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "minLength": 1},
                    "limit": {"type": "integer", "minimum": 1, "maximum": 50}
                },
                "required": ["query"],
                "additionalProperties": false
            }),
            false,
            false,
            Arc::new(move |args| {
                let search = search.clone();
                Box::pin(async move {
                    let query = args["query"].as_str().unwrap_or_default().to_string();
                    let limit = args["limit"].as_u64().unwrap_or(10) as usize;
                    let opts = SearchOptions {
                        limit,
                        kinds: Vec::new(),
                        bm25_weight: 0.5,
                        embedding_weight: 0.5,
                        enhance: false,
                        budget_ms: 5_000,
                    };
                    let response = search.search(&query, &opts).await?;
                    Ok(serde_json::json!({
                        "count": response.hits.len(),
                        "hits": response.hits,
                        "partial": response.partial,
                    }))
                })
            }),
        )?;
    }

    // list_events
    {
        let store = store.clone();
        tools.register(
            "list_events",
            "List calendar events for a day (default: today)",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "date": {"type": "string", "pattern": "^\\d{4}-\\d{2}-\\d{2}$"}
                },
                "additionalProperties": false
            }),
            false,
            false,
            Arc::new(move |args| {
                let store = store.clone();
                Box::pin(async move {
                    let (start, end) = day_bounds(args.get("date").and_then(|d| d.as_str()))?;
                    let events = store.list_events_between(start, end).await?;
                    let items: Vec<serde_json::Value> = events
                        .iter()
                        .map(|d| {
                            serde_json::json!({
                                "document_id": d.id,
                                "title": d.title,
                                "content": d.content,
                            })
                        })
                        .collect();
                    Ok(serde_json::json!({"count": items.len(), "events": items}))
                })
            }),
        )?;
    }

    // related_documents
    {
        let store = store.clone();
        tools.register(
            "related_documents",
            "Walk relationship edges from a document",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "document_id": {"type": "string", "minLength": 1},
                    "max_depth": {"type": "integer", "minimum": 1, "maximum": 5}
                },
                "required": ["document_id"],
                "additionalProperties": false
            }),
            false,
            false,
            Arc::new(move |args| {
                let store = store.clone();
                Box::pin(async move {
                    let id = args["document_id"].as_str().unwrap_or_default().to_string();
                    let depth = args["max_depth"].as_u64().unwrap_or(2) as u32;
                    let related = store.related(&id, depth).await?;
                    let items: Vec<serde_json::Value> = related
                        .iter()
                        .map(|(id, kind)| serde_json::json!({"document_id": id, "kind": kind}))
                        .collect();
                    Ok(serde_json::json!({"count": items.len(), "related": items}))
                })
            }),
        )?;
    }

    // create_reminder / delete_reminder
    {
        let store = store.clone();
        tools.register(
            "create_reminder",
            "Create a reminder",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "title": {"type": "string", "minLength": 1},
                    "due_at": {"type": "integer"},
                    "notes": {"type": "string"},
                    "list_name": {"type": "string"}
                },
                "required": ["title"],
                "additionalProperties": false
            }),
            true,
            true,
            Arc::new(move |args| {
                let store = store.clone();
                Box::pin(async move {
                    let title = args["title"].as_str().unwrap_or_default().to_string();
                    let record = engine_record(
                        DocumentKind::Reminder,
                        format!("reminder:{}", Uuid::new_v4()),
                        title.clone(),
                        args["notes"].as_str().unwrap_or_default().to_string(),
                        serde_json::json!({
                            "due_at": args.get("due_at"),
                            "list_name": args.get("list_name").and_then(|v| v.as_str()).unwrap_or(""),
                        }),
                    );
                    let document_id = upsert_engine_record(&store, record).await?;
                    Ok(serde_json::json!({"document_id": document_id, "title": title}))
                })
            }),
        )?;
    }
    register_delete_tool(tools, store, "delete_reminder", DocumentKind::Reminder)?;

    // create_event / delete_event
    {
        let store = store.clone();
        tools.register(
            "create_event",
            "Create a calendar event",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "title": {"type": "string", "minLength": 1},
                    "start_at": {"type": "integer"},
                    "end_at": {"type": "integer"},
                    "location": {"type": "string"},
                    "notes": {"type": "string"}
                },
                "required": ["title"],
                "additionalProperties": false
            }),
            true,
            true,
            Arc::new(move |args| {
                let store = store.clone();
                Box::pin(async move {
                    let title = args["title"].as_str().unwrap_or_default().to_string();
                    let record = engine_record(
                        DocumentKind::Event,
                        format!("event:{}", Uuid::new_v4()),
                        title.clone(),
                        args["notes"].as_str().unwrap_or_default().to_string(),
                        serde_json::json!({
                            "start_at": args.get("start_at"),
                            "end_at": args.get("end_at"),
                            "location": args.get("location").and_then(|v| v.as_str()).unwrap_or(""),
                        }),
                    );
                    let document_id = upsert_engine_record(&store, record).await?;
                    Ok(serde_json::json!({"document_id": document_id, "title": title}))
                })
            }),
        )?;
    }
    register_delete_tool(tools, store, "delete_event", DocumentKind::Event)?;

    // create_note / delete_note / update_note
    {
        let store = store.clone();
        tools.register(
            "create_note",
            "Create a note",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "title": {"type": "string", "minLength": 1},
                    "content": {"type": "string"},
                    "folder": {"type": "string"}
                },
                "required": ["title"],
                "additionalProperties": false
            }),
            true,
            true,
            Arc::new(move |args| {
                let store = store.clone();
                Box::pin(async move {
                    let title = args["title"].as_str().unwrap_or_default().to_string();
                    let content = args["content"].as_str().unwrap_or_default().to_string();
                    let word_count = content.split_whitespace().count() as i64;
                    let record = engine_record(
                        DocumentKind::Note,
                        format!("note:{}", Uuid::new_v4()),
                        title.clone(),
                        content,
                        serde_json::json!({
                            "folder": args.get("folder").and_then(|v| v.as_str()).unwrap_or(""),
                            "word_count": word_count,
                        }),
                    );
                    let document_id = upsert_engine_record(&store, record).await?;
                    Ok(serde_json::json!({"document_id": document_id, "title": title}))
                })
            }),
        )?;
    }
    register_delete_tool(tools, store, "delete_note", DocumentKind::Note)?;

    {
        let store = store.clone();
        tools.register(
            "update_note",
            "Replace a note's content, capturing the pre-image",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "document_id": {"type": "string", "minLength": 1},
                    "content": {"type": "string"}
                },
                "required": ["document_id", "content"],
                "additionalProperties": false
            }),
            true,
            true,
            Arc::new(move |args| {
                let store = store.clone();
                Box::pin(async move {
                    let id = args["document_id"].as_str().unwrap_or_default().to_string();
                    let content = args["content"].as_str().unwrap_or_default().to_string();

                    let document = store
                        .get_document(&id)
                        .await?
                        .ok_or_else(|| Error::NotFound(format!("document '{id}'")))?;
                    if document.kind != DocumentKind::Note {
                        return Err(Error::ValidationFailed {
                            field: "document_id".into(),
                            reason: format!("'{id}' is a {}, not a note", document.kind.as_str()),
                        });
                    }
                    let previous = serde_json::json!({
                        "title": document.title.clone(),
                        "content": document.content.clone(),
                    });

                    let word_count = content.split_whitespace().count() as i64;
                    let mut record = engine_record(
                        DocumentKind::Note,
                        document.source_id.clone(),
                        document.title.clone(),
                        content,
                        serde_json::json!({"word_count": word_count}),
                    );
                    record.created_at = document.created_at;
                    record.updated_at = now_ts().max(document.updated_at + 1);
                    let side = SideFields::from_json(record.kind, record.fields.clone())?;
                    store
                        .upsert_document(&document.source_app, &record, &side)
                        .await?;

                    // Content changed, so the chunk set is rebuilt with it.
                    let updated = Document {
                        title: record.title.clone(),
                        content: record.content.clone(),
                        updated_at: record.updated_at,
                        ..document
                    };
                    let chunks = crate::chunker::chunk_document(
                        &updated,
                        &side,
                        &crate::config::ChunkingConfig::default(),
                    );
                    store.replace_chunks(&updated.id, &chunks).await?;

                    Ok(serde_json::json!({"document_id": id, "previous": previous}))
                })
            }),
        )?;
    }

    // send_email: the engine only records the scheduled message; actual
    // transmission is delegated to the host mail transport.
    {
        let store = store.clone();
        tools.register(
            "send_email",
            "Schedule an outbound email (delivery is delegated)",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "to": {"type": "array", "items": {"type": "string"}, "minItems": 1},
                    "subject": {"type": "string", "minLength": 1},
                    "body": {"type": "string"}
                },
                "required": ["to", "subject"],
                "additionalProperties": false
            }),
            true,
            true,
            Arc::new(move |args| {
                let store = store.clone();
                Box::pin(async move {
                    let subject = args["subject"].as_str().unwrap_or_default().to_string();
                    let to: Vec<String> = args["to"]
                        .as_array()
                        .map(|items| {
                            items
                                .iter()
                                .filter_map(|v| v.as_str().map(String::from))
                                .collect()
                        })
                        .unwrap_or_default();
                    let record = engine_record(
                        DocumentKind::Email,
                        format!("outbound:{}", Uuid::new_v4()),
                        subject.clone(),
                        args["body"].as_str().unwrap_or_default().to_string(),
                        serde_json::json!({"to_addresses": to, "mailbox": "outbox"}),
                    );
                    let document_id = upsert_engine_record(&store, record).await?;
                    Ok(serde_json::json!({
                        "document_id": document_id,
                        "subject": subject,
                        "scheduled": true,
                    }))
                })
            }),
        )?;
    }

    Ok(())
}

fn register_delete_tool(
    tools: &mut ToolRegistry,
    store: &Store,
    name: &'static str,
    kind: DocumentKind,
) -> Result<()> {
    let store = store.clone();
    tools.register(
        name,
        match kind {
            DocumentKind::Reminder => "Delete a reminder",
            DocumentKind::Event => "Delete a calendar event",
            _ => "Delete an engine-authored document",
        },
        serde_json::json!({
            "type": "object",
            "properties": {
                "document_id": {"type": "string", "minLength": 1}
            },
            "required": ["document_id"],
            "additionalProperties": false
        }),
        true,
        true,
        Arc::new(move |args| {
            let store = store.clone();
            Box::pin(async move {
                let id = args["document_id"].as_str().unwrap_or_default().to_string();
                let document = store
                    .get_document(&id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("document '{id}'")))?;
                if document.kind != kind {
                    return Err(Error::ValidationFailed {
                        field: "document_id".into(),
                        reason: format!(
                            "'{id}' is a {}, expected {}",
                            document.kind.as_str(),
                            kind.as_str()
                        ),
                    });
                }
                store
                    .tombstone(&document.source_app, &document.source_id)
                    .await?;
                Ok(serde_json::json!({"document_id": id, "deleted": true}))
            })
        }),
    )
}

/// Upsert an engine-authored record through the same path ingest uses, so
/// chunks and the keyword index stay consistent.
async fn upsert_engine_record(
    store: &Store,
    record: crate::models::SourceRecord,
) -> Result<String> {
    let side = SideFields::from_json(record.kind, record.fields.clone())?;
    let outcome = store
        .upsert_document(ENGINE_SOURCE_APP, &record, &side)
        .await?;
    let document_id = outcome.document_id().to_string();

    let document = Document {
        id: document_id.clone(),
        kind: record.kind,
        title: record.title.clone(),
        content: record.content.clone(),
        source_app: ENGINE_SOURCE_APP.to_string(),
        source_id: record.source_id.clone(),
        source_uri: None,
        content_hash: record.content_hash(&side),
        created_at: record.created_at,
        updated_at: record.updated_at,
        last_seen_at: now_ts(),
        deleted: false,
    };
    let chunks = crate::chunker::chunk_document(
        &document,
        &side,
        &crate::config::ChunkingConfig::default(),
    );
    store.replace_chunks(&document_id, &chunks).await?;
    Ok(document_id)
}

fn day_bounds(date: Option<&str>) -> Result<(i64, i64)> {
    use chrono::{NaiveDate, Utc};
    let day = match date {
        Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|e| {
            Error::ValidationFailed {
                field: "date".into(),
                reason: e.to_string(),
            }
        })?,
        None => Utc::now().date_naive(),
    };
    let start = day
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| Error::Internal("invalid day start".into()))?
        .and_utc()
        .timestamp();
    Ok((start, start + 24 * 3600))
}
