//! Plan / confirm / execute engine.
//!
//! A user query becomes a [`Plan`]: an ordered list of tool steps with
//! per-step risk records, a content-origin label, and — when any step
//! mutates — an operation hash binding every mutating step's arguments.
//! Plans persist in the store so a dry-run in one process can be
//! confirmed and executed from another.
//!
//! # State machine
//!
//! ```text
//! pending ──confirm(hash)──▶ confirmed ──execute()──▶ executing ─▶ completed
//!    │                                                  │
//!    │──cancel()──▶ cancelled                           └─ step failure ─▶ failed (rollback)
//!    │──ttl(30 min)──▶ expired
//! ```
//!
//! Terminal states are immutable. `confirm` on a confirmed plan and
//! `execute` on a completed plan return the current state unchanged;
//! `execute` on an executing or otherwise-terminal plan is a state
//! conflict.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::Row;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditLogger};
use crate::compensation::{CompensationEngine, CompensationResult};
use crate::config::PlannerConfig;
use crate::error::{Error, Result};
use crate::models::now_ts;
use crate::store::Store;
use crate::tools::{InvocationContext, ToolRegistry, ToolSpec};

/// Plans expire this long after creation if never confirmed.
pub const PLAN_TTL_SECS: i64 = 30 * 60;

// ============ Plan data ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Pending,
    Confirmed,
    Executing,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Pending => "pending",
            PlanStatus::Confirmed => "confirmed",
            PlanStatus::Executing => "executing",
            PlanStatus::Completed => "completed",
            PlanStatus::Failed => "failed",
            PlanStatus::Cancelled => "cancelled",
            PlanStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlanStatus::Completed | PlanStatus::Failed | PlanStatus::Cancelled | PlanStatus::Expired
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

/// Trust label attached to the originating query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentOrigin {
    User,
    System,
    External,
    Untrusted,
}

impl ContentOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentOrigin::User => "user",
            ContentOrigin::System => "system",
            ContentOrigin::External => "external",
            ContentOrigin::Untrusted => "untrusted",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub description: String,
    pub is_mutating: bool,
    pub requires_confirmation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    /// None for plan-level risks (e.g. an untrusted origin).
    pub step_index: Option<usize>,
    pub level: RiskLevel,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_index: usize,
    pub tool_name: String,
    pub output: serde_json::Value,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub correlation_id: String,
    pub query: String,
    pub steps: Vec<PlanStep>,
    pub risks: Vec<RiskAssessment>,
    pub status: PlanStatus,
    pub created_at: i64,
    pub expires_at: i64,
    pub confirmed_at: Option<i64>,
    pub execution_started_at: Option<i64>,
    pub execution_completed_at: Option<i64>,
    pub results: Vec<StepResult>,
    pub rollback_results: Vec<CompensationResult>,
    pub content_origin: ContentOrigin,
    /// Present iff any step mutates.
    pub operation_hash: Option<String>,
    /// Error message of the failing step, if the plan failed.
    pub error: Option<String>,
}

impl Plan {
    pub fn is_mutating(&self) -> bool {
        self.steps.iter().any(|s| s.is_mutating)
    }

    /// Whether this plan may be confirmed without an explicit user action:
    /// only non-mutating plans from trusted origins qualify.
    pub fn auto_confirmable(&self) -> bool {
        !self.is_mutating() && self.content_origin != ContentOrigin::Untrusted
    }
}

// ============ Operation hash ============

/// Canonical JSON: objects with sorted keys, compact separators. Both the
/// planner and the verifier go through here, so the hash comparison is
/// byte-for-byte.
pub fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .iter()
                .map(|k| format!("{}:{}", serde_json::Value::String((*k).clone()), canonical_json(&map[*k])))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

/// SHA-256 over `join("|", "{tool}:{sorted key=value pairs}")` across the
/// mutating steps. `None` when nothing mutates.
pub fn operation_hash(steps: &[PlanStep]) -> Option<String> {
    let mutating: Vec<&PlanStep> = steps.iter().filter(|s| s.is_mutating).collect();
    if mutating.is_empty() {
        return None;
    }

    let canonical: Vec<String> = mutating
        .iter()
        .map(|step| {
            let args = match &step.arguments {
                serde_json::Value::Object(map) => {
                    let mut keys: Vec<&String> = map.keys().collect();
                    keys.sort();
                    keys.iter()
                        .map(|k| format!("{k}={}", canonical_json(&map[*k])))
                        .collect::<Vec<_>>()
                        .join(",")
                }
                other => canonical_json(other),
            };
            format!("{}:{}", step.tool_name, args)
        })
        .collect();

    let mut hasher = Sha256::new();
    hasher.update(canonical.join("|").as_bytes());
    Some(format!("{:x}", hasher.finalize()))
}

// ============ Content origin ============

const DESTRUCTIVE_PATTERNS: &[&str] = &[
    "rm -rf",
    "sudo ",
    "mkfs",
    "dd if=",
    "drop table",
    "delete from ",
    "; --",
    "format c:",
    "curl ",
    "wget ",
    "> /dev/",
];

/// Classify a query's trust level. Destructive shell patterns downgrade to
/// untrusted; embedded URLs mark external content. The label is a signal:
/// untrusted plans demand explicit confirmation but are never silently
/// refused.
pub fn classify_origin(query: &str) -> ContentOrigin {
    let lower = query.to_lowercase();
    if DESTRUCTIVE_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ContentOrigin::Untrusted;
    }
    if lower.contains("http://") || lower.contains("https://") {
        return ContentOrigin::External;
    }
    ContentOrigin::User
}

// ============ Planners ============

#[derive(Debug, Clone, Deserialize)]
pub struct PlannerStep {
    pub tool_name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlannerOutput {
    pub steps: Vec<PlannerStep>,
    #[serde(default)]
    pub intent: String,
    #[serde(default)]
    pub entities: Vec<String>,
}

/// Natural-language planner. May be backed by an LLM; the engine always
/// degrades to [`RulePlanner`] when it is absent or misbehaves.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, query: &str, tools: &[ToolSpec]) -> Result<PlannerOutput>;
}

/// Deterministic keyword-rule fallback. Always available.
pub struct RulePlanner;

#[async_trait]
impl Planner for RulePlanner {
    async fn plan(&self, query: &str, tools: &[ToolSpec]) -> Result<PlannerOutput> {
        let lower = query.to_lowercase();
        let has_tool = |name: &str| tools.iter().any(|t| t.name == name);

        if lower.contains("remind") && has_tool("create_reminder") {
            let title = lower
                .find("remind me to ")
                .and_then(|pos| query.get(pos + "remind me to ".len()..))
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .unwrap_or(query.trim());
            return Ok(PlannerOutput {
                steps: vec![PlannerStep {
                    tool_name: "create_reminder".into(),
                    arguments: serde_json::json!({ "title": title }),
                    description: format!("Create a reminder: {title}"),
                }],
                intent: "command".into(),
                entities: Vec::new(),
            });
        }

        if (lower.contains("today") || lower.contains("calendar")) && has_tool("list_events") {
            return Ok(PlannerOutput {
                steps: vec![PlannerStep {
                    tool_name: "list_events".into(),
                    arguments: serde_json::json!({}),
                    description: "List today's calendar events".into(),
                }],
                intent: "search".into(),
                entities: Vec::new(),
            });
        }

        let search_query = ["find ", "search for ", "search "]
            .iter()
            .find_map(|prefix| {
                lower
                    .find(prefix)
                    .and_then(|pos| query.get(pos + prefix.len()..))
            })
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(query.trim());

        Ok(PlannerOutput {
            steps: vec![PlannerStep {
                tool_name: "search_documents".into(),
                arguments: serde_json::json!({ "query": search_query }),
                description: format!("Search documents for '{search_query}'"),
            }],
            intent: "search".into(),
            entities: Vec::new(),
        })
    }
}

/// Planner backed by an OpenAI-compatible chat endpoint (Ollama's
/// `/api/chat`). Any transport or parse failure surfaces as
/// [`Error::DependencyUnavailable`], which the engine answers with the
/// rule fallback.
pub struct HttpPlanner {
    endpoint: String,
    model: String,
    timeout: std::time::Duration,
}

impl HttpPlanner {
    pub fn new(config: &PlannerConfig) -> Result<Self> {
        let model = config.model.clone().ok_or_else(|| Error::ValidationFailed {
            field: "planner.model".into(),
            reason: "required for the http provider".into(),
        })?;
        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model,
            timeout: std::time::Duration::from_secs(config.timeout_secs),
        })
    }
}

#[async_trait]
impl Planner for HttpPlanner {
    async fn plan(&self, query: &str, tools: &[ToolSpec]) -> Result<PlannerOutput> {
        let catalog = serde_json::to_string(tools)?;
        let system = format!(
            "You decompose user requests into tool steps. Available tools: {catalog}. \
             Respond with JSON: {{\"steps\": [{{\"tool_name\", \"arguments\", \"description\"}}], \
             \"intent\": string, \"entities\": [string]}}."
        );

        let client = reqwest::Client::builder().timeout(self.timeout).build()?;
        let body = serde_json::json!({
            "model": self.model,
            "stream": false,
            "format": "json",
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": query},
            ],
        });

        let response = client
            .post(format!("{}/api/chat", self.endpoint))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::DependencyUnavailable(format!("planner: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::DependencyUnavailable(format!(
                "planner returned HTTP {}",
                response.status()
            )));
        }

        let payload: serde_json::Value = response.json().await?;
        let content = payload["message"]["content"]
            .as_str()
            .ok_or_else(|| Error::DependencyUnavailable("planner response had no content".into()))?;
        let output: PlannerOutput = serde_json::from_str(content)
            .map_err(|e| Error::DependencyUnavailable(format!("planner output unparsable: {e}")))?;

        if output.steps.is_empty() {
            return Err(Error::DependencyUnavailable("planner produced no steps".into()));
        }
        Ok(output)
    }
}

/// Instantiate the configured planner.
pub fn create_planner(config: &PlannerConfig) -> Result<Box<dyn Planner>> {
    match config.provider.as_str() {
        "rule" => Ok(Box::new(RulePlanner)),
        "http" => Ok(Box::new(HttpPlanner::new(config)?)),
        other => Err(Error::ValidationFailed {
            field: "planner.provider".into(),
            reason: format!("unknown provider '{other}'"),
        }),
    }
}

// ============ Plan manager ============

pub struct PlanManager {
    store: Store,
    audit: AuditLogger,
}

impl PlanManager {
    pub fn new(store: Store, audit: AuditLogger) -> Self {
        Self { store, audit }
    }

    /// Build and persist a pending plan for a query.
    ///
    /// The configured planner runs first; any failure or invalid step
    /// falls back to the deterministic rule planner, whose output is
    /// re-validated. Per-step risks: mutating is high, deletes are
    /// critical. An untrusted origin adds a plan-level risk.
    pub async fn create(
        &self,
        query: &str,
        planner: &dyn Planner,
        registry: &ToolRegistry,
        correlation_id: &str,
    ) -> Result<Plan> {
        let origin = classify_origin(query);
        let tools = registry.list();

        let output = match planner.plan(query, &tools).await {
            Ok(output) if self.steps_valid(&output, registry) => output,
            Ok(_) | Err(_) => {
                info!("planner unavailable or invalid; using rule fallback");
                let fallback = RulePlanner.plan(query, &tools).await?;
                if !self.steps_valid(&fallback, registry) {
                    return Err(Error::Internal(
                        "rule planner produced steps that fail tool validation".into(),
                    ));
                }
                fallback
            }
        };

        let mut steps = Vec::new();
        let mut risks = Vec::new();
        for (index, planned) in output.steps.into_iter().enumerate() {
            let tool = registry
                .get(&planned.tool_name)
                .ok_or_else(|| Error::NotFound(format!("tool '{}'", planned.tool_name)))?;

            if tool.is_mutating {
                let critical = tool.name.starts_with("delete_");
                risks.push(RiskAssessment {
                    step_index: Some(index),
                    level: if critical { RiskLevel::Critical } else { RiskLevel::High },
                    reason: if critical {
                        format!("'{}' destroys data", tool.name)
                    } else {
                        format!("'{}' mutates state", tool.name)
                    },
                });
            }

            steps.push(PlanStep {
                tool_name: planned.tool_name,
                arguments: planned.arguments,
                description: planned.description,
                is_mutating: tool.is_mutating,
                requires_confirmation: tool.requires_confirmation,
            });
        }

        if origin == ContentOrigin::Untrusted {
            risks.push(RiskAssessment {
                step_index: None,
                level: RiskLevel::High,
                reason: "query contains destructive patterns; explicit confirmation required".into(),
            });
        }

        let now = now_ts();
        let plan = Plan {
            id: Uuid::new_v4().to_string(),
            correlation_id: correlation_id.to_string(),
            query: query.to_string(),
            operation_hash: operation_hash(&steps),
            steps,
            risks,
            status: PlanStatus::Pending,
            created_at: now,
            expires_at: now + PLAN_TTL_SECS,
            confirmed_at: None,
            execution_started_at: None,
            execution_completed_at: None,
            results: Vec::new(),
            rollback_results: Vec::new(),
            content_origin: origin,
            error: None,
        };

        self.insert(&plan).await?;
        self.audit.emit(
            AuditEvent::new(correlation_id, "plan_created")
                .plan(&plan.id)
                .origin(origin.as_str())
                .details(serde_json::json!({
                    "query": query,
                    "steps": plan.steps.len(),
                    "mutating": plan.is_mutating(),
                    "operation_hash": plan.operation_hash.clone(),
                })),
        );
        Ok(plan)
    }

    fn steps_valid(&self, output: &PlannerOutput, registry: &ToolRegistry) -> bool {
        !output.steps.is_empty()
            && output
                .steps
                .iter()
                .all(|s| registry.validate(&s.tool_name, &s.arguments).is_ok())
    }

    pub async fn get(&self, plan_id: &str) -> Result<Plan> {
        self.load(plan_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("plan '{plan_id}'")))
    }

    /// Confirm a pending plan.
    ///
    /// Plans with mutations require the provided hash to equal the
    /// operation hash byte-for-byte. Confirming an already-confirmed plan
    /// is a no-op; terminal states conflict; an overdue plan expires here.
    pub async fn confirm(&self, plan_id: &str, provided_hash: Option<&str>) -> Result<Plan> {
        let mut plan = self.get(plan_id).await?;

        match plan.status {
            PlanStatus::Confirmed => return Ok(plan),
            PlanStatus::Pending => {}
            other => {
                return Err(Error::StateConflict {
                    expected: "pending".into(),
                    actual: other.as_str().into(),
                })
            }
        }

        if now_ts() >= plan.expires_at {
            plan.status = PlanStatus::Expired;
            self.update(&plan, PlanStatus::Pending).await?;
            self.audit.emit(
                AuditEvent::new(&plan.correlation_id, "plan_expired").plan(&plan.id),
            );
            return Err(Error::Expired(format!("plan '{plan_id}'")));
        }

        if let Some(expected) = &plan.operation_hash {
            match provided_hash {
                Some(provided) if provided == expected.as_str() => {}
                provided => {
                    return Err(Error::HashMismatch {
                        expected: expected.clone(),
                        provided: provided.unwrap_or("<none>").to_string(),
                    })
                }
            }
        }

        plan.status = PlanStatus::Confirmed;
        plan.confirmed_at = Some(now_ts());
        self.update(&plan, PlanStatus::Pending).await?;
        self.audit.emit(
            AuditEvent::new(&plan.correlation_id, "plan_confirmed")
                .plan(&plan.id)
                .details(serde_json::json!({"hash_verified": plan.operation_hash.is_some()})),
        );
        Ok(plan)
    }

    /// Cancel a plan that has not started executing.
    pub async fn cancel(&self, plan_id: &str) -> Result<Plan> {
        let mut plan = self.get(plan_id).await?;
        match plan.status {
            PlanStatus::Cancelled => return Ok(plan),
            PlanStatus::Pending | PlanStatus::Confirmed => {}
            other => {
                return Err(Error::StateConflict {
                    expected: "pending or confirmed".into(),
                    actual: other.as_str().into(),
                })
            }
        }
        let previous = plan.status;
        plan.status = PlanStatus::Cancelled;
        self.update(&plan, previous).await?;
        self.audit
            .emit(AuditEvent::new(&plan.correlation_id, "plan_cancelled").plan(&plan.id));
        Ok(plan)
    }

    /// Execute a confirmed plan: steps run sequentially, all stamped with
    /// the plan's correlation id. The first failing step stops execution
    /// and compensates completed steps in reverse. A cancellation request
    /// lets the in-flight step finish, then fails the plan.
    pub async fn execute(
        &self,
        plan_id: &str,
        registry: &ToolRegistry,
        compensation: &CompensationEngine,
        cancel: &CancellationToken,
    ) -> Result<Plan> {
        let mut plan = self.get(plan_id).await?;

        match plan.status {
            PlanStatus::Completed => return Ok(plan),
            PlanStatus::Confirmed => {}
            other => {
                return Err(Error::StateConflict {
                    expected: "confirmed".into(),
                    actual: other.as_str().into(),
                })
            }
        }

        plan.status = PlanStatus::Executing;
        plan.execution_started_at = Some(now_ts());
        // The guarded update is the mutual exclusion: a racing executor
        // loses the compare-and-swap and sees the state conflict.
        self.update(&plan, PlanStatus::Confirmed).await?;
        self.audit.emit(
            AuditEvent::new(&plan.correlation_id, "execution_started")
                .plan(&plan.id)
                .origin(plan.content_origin.as_str()),
        );

        let mut failure: Option<(usize, Error)> = None;
        let steps = plan.steps.clone();

        for (index, step) in steps.iter().enumerate() {
            if cancel.is_cancelled() {
                failure = Some((index, Error::Cancelled));
                break;
            }

            self.audit.emit(
                AuditEvent::new(&plan.correlation_id, "step_started")
                    .plan(&plan.id)
                    .step(index)
                    .tool(&step.tool_name),
            );

            let ctx = InvocationContext {
                correlation_id: plan.correlation_id.clone(),
                plan_id: Some(plan.id.clone()),
                step_index: Some(index),
                is_rollback: false,
            };
            let timer = Instant::now();
            match registry
                .execute_with_correlation(&step.tool_name, step.arguments.clone(), &ctx)
                .await
            {
                Ok(output) => {
                    plan.results.push(StepResult {
                        step_index: index,
                        tool_name: step.tool_name.clone(),
                        output,
                        duration_ms: timer.elapsed().as_millis() as u64,
                    });
                    self.audit.emit(
                        AuditEvent::new(&plan.correlation_id, "step_completed")
                            .plan(&plan.id)
                            .step(index)
                            .tool(&step.tool_name),
                    );
                }
                Err(e) => {
                    self.audit.emit(
                        AuditEvent::new(&plan.correlation_id, "step_failed")
                            .plan(&plan.id)
                            .step(index)
                            .tool(&step.tool_name)
                            .details(serde_json::json!({"error": e.to_string()})),
                    );
                    failure = Some((index, e));
                    break;
                }
            }
        }

        match failure {
            None => {
                plan.status = PlanStatus::Completed;
                plan.execution_completed_at = Some(now_ts());
                self.update(&plan, PlanStatus::Executing).await?;
                self.audit.emit(
                    AuditEvent::new(&plan.correlation_id, "plan_completed").plan(&plan.id),
                );
            }
            Some((failed_index, error)) => {
                plan.rollback_results = compensation
                    .compensate(
                        registry,
                        &plan.correlation_id,
                        &plan.id,
                        &plan.steps,
                        &plan.results,
                        failed_index,
                    )
                    .await;
                plan.status = PlanStatus::Failed;
                plan.execution_completed_at = Some(now_ts());
                plan.error = Some(error.to_string());
                self.update(&plan, PlanStatus::Executing).await?;
                self.audit.emit(
                    AuditEvent::new(&plan.correlation_id, "plan_failed")
                        .plan(&plan.id)
                        .step(failed_index)
                        .details(serde_json::json!({
                            "error": error.to_string(),
                            "rolled_back_steps": plan.rollback_results.len(),
                        })),
                );
            }
        }

        Ok(plan)
    }

    /// Transition every overdue pending plan to expired. Returns how many
    /// moved.
    pub async fn expire_overdue(&self) -> Result<u64> {
        let rows = sqlx::query("SELECT id FROM plans WHERE status = 'pending' AND expires_at <= ?")
            .bind(now_ts())
            .fetch_all(self.store.pool())
            .await?;

        let mut expired = 0u64;
        for row in rows {
            let id: String = row.get("id");
            if let Some(mut plan) = self.load(&id).await? {
                if plan.status == PlanStatus::Pending {
                    plan.status = PlanStatus::Expired;
                    if self.update(&plan, PlanStatus::Pending).await.is_ok() {
                        expired += 1;
                        self.audit.emit(
                            AuditEvent::new(&plan.correlation_id, "plan_expired").plan(&plan.id),
                        );
                    }
                }
            }
        }
        Ok(expired)
    }

    // ============ Persistence ============

    async fn insert(&self, plan: &Plan) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO plans (id, correlation_id, status, operation_hash, created_at, expires_at, data)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&plan.id)
        .bind(&plan.correlation_id)
        .bind(plan.status.as_str())
        .bind(&plan.operation_hash)
        .bind(plan.created_at)
        .bind(plan.expires_at)
        .bind(serde_json::to_string(plan)?)
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    /// Guarded update: succeeds only when the persisted status still equals
    /// `expected`, which serializes state transitions across processes.
    async fn update(&self, plan: &Plan, expected: PlanStatus) -> Result<()> {
        let changed = sqlx::query("UPDATE plans SET status = ?, data = ? WHERE id = ? AND status = ?")
            .bind(plan.status.as_str())
            .bind(serde_json::to_string(plan)?)
            .bind(&plan.id)
            .bind(expected.as_str())
            .execute(self.store.pool())
            .await?
            .rows_affected();

        if changed != 1 {
            let actual: Option<String> =
                sqlx::query_scalar("SELECT status FROM plans WHERE id = ?")
                    .bind(&plan.id)
                    .fetch_optional(self.store.pool())
                    .await?;
            return Err(Error::StateConflict {
                expected: expected.as_str().into(),
                actual: actual.unwrap_or_else(|| "missing".into()),
            });
        }
        Ok(())
    }

    async fn load(&self, plan_id: &str) -> Result<Option<Plan>> {
        let data: Option<String> = sqlx::query_scalar("SELECT data FROM plans WHERE id = ?")
            .bind(plan_id)
            .fetch_optional(self.store.pool())
            .await?;
        data.map(|raw| serde_json::from_str(&raw).map_err(Error::from))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(tool: &str, args: serde_json::Value, mutating: bool) -> PlanStep {
        PlanStep {
            tool_name: tool.into(),
            arguments: args,
            description: String::new(),
            is_mutating: mutating,
            requires_confirmation: mutating,
        }
    }

    #[test]
    fn hash_absent_without_mutations() {
        let steps = vec![step("search_documents", json!({"query": "x"}), false)];
        assert!(operation_hash(&steps).is_none());
    }

    #[test]
    fn hash_is_stable_under_key_order() {
        let a = vec![step("create_reminder", json!({"title": "t", "due_at": 5}), true)];
        let b = vec![step("create_reminder", json!({"due_at": 5, "title": "t"}), true)];
        assert_eq!(operation_hash(&a), operation_hash(&b));
    }

    #[test]
    fn hash_changes_with_any_argument() {
        let a = vec![step("create_reminder", json!({"title": "call Jane"}), true)];
        let b = vec![step("create_reminder", json!({"title": "call John"}), true)];
        assert_ne!(operation_hash(&a), operation_hash(&b));
    }

    #[test]
    fn hash_covers_only_mutating_steps() {
        let mutating = step("create_reminder", json!({"title": "t"}), true);
        let a = vec![step("search_documents", json!({"query": "x"}), false), mutating.clone()];
        let b = vec![step("search_documents", json!({"query": "y"}), false), mutating];
        assert_eq!(operation_hash(&a), operation_hash(&b));
    }

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let value = json!({"b": {"z": 1, "a": [2, {"y": 3, "x": 4}]}, "a": null});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":null,"b":{"a":[2,{"x":4,"y":3}],"z":1}}"#
        );
    }

    #[test]
    fn origin_classification() {
        assert_eq!(classify_origin("find my notes"), ContentOrigin::User);
        assert_eq!(classify_origin("run rm -rf / now"), ContentOrigin::Untrusted);
        assert_eq!(
            classify_origin("summarize https://example.com/post"),
            ContentOrigin::External
        );
        assert_eq!(classify_origin("sudo make me a sandwich"), ContentOrigin::Untrusted);
    }

    #[tokio::test]
    async fn rule_planner_maps_keywords() {
        let tools = vec![
            ToolSpec {
                name: "create_reminder".into(),
                description: String::new(),
                schema: json!({"type": "object"}),
                is_mutating: true,
                requires_confirmation: true,
            },
            ToolSpec {
                name: "list_events".into(),
                description: String::new(),
                schema: json!({"type": "object"}),
                is_mutating: false,
                requires_confirmation: false,
            },
            ToolSpec {
                name: "search_documents".into(),
                description: String::new(),
                schema: json!({"type": "object"}),
                is_mutating: false,
                requires_confirmation: false,
            },
        ];

        let output = RulePlanner
            .plan("remind me to call Jane tomorrow at 2pm", &tools)
            .await
            .unwrap();
        assert_eq!(output.steps[0].tool_name, "create_reminder");
        assert_eq!(output.steps[0].arguments["title"], "call Jane tomorrow at 2pm");

        let output = RulePlanner.plan("what's on my calendar", &tools).await.unwrap();
        assert_eq!(output.steps[0].tool_name, "list_events");

        let output = RulePlanner.plan("find the Apollo budget", &tools).await.unwrap();
        assert_eq!(output.steps[0].tool_name, "search_documents");
        assert_eq!(output.steps[0].arguments["query"], "the Apollo budget");

        let output = RulePlanner.plan("quarterly numbers", &tools).await.unwrap();
        assert_eq!(output.steps[0].tool_name, "search_documents");
        assert_eq!(output.steps[0].arguments["query"], "quarterly numbers");
    }

    #[test]
    fn auto_confirm_rules() {
        let mut plan = Plan {
            id: "p".into(),
            correlation_id: "c".into(),
            query: "q".into(),
            steps: vec![step("search_documents", json!({}), false)],
            risks: Vec::new(),
            status: PlanStatus::Pending,
            created_at: 0,
            expires_at: PLAN_TTL_SECS,
            confirmed_at: None,
            execution_started_at: None,
            execution_completed_at: None,
            results: Vec::new(),
            rollback_results: Vec::new(),
            content_origin: ContentOrigin::User,
            operation_hash: None,
            error: None,
        };
        assert!(plan.auto_confirmable());

        plan.content_origin = ContentOrigin::Untrusted;
        assert!(!plan.auto_confirmable(), "untrusted queries need explicit confirmation");

        plan.content_origin = ContentOrigin::User;
        plan.steps.push(step("create_reminder", json!({"title": "t"}), true));
        assert!(!plan.auto_confirmable(), "mutating plans need hash confirmation");
    }
}
