//! Typed tool catalog with schema validation and audited invocation.
//!
//! Every capability the plan engine can call is a [`ToolDefinition`]:
//! name, description, JSON schema for its arguments, mutation flags, and
//! an async handler. Arguments are validated against the schema before
//! the handler runs; validation failures never invoke the handler.
//!
//! Execution is wrapped in an audit span (`tool_started` /
//! `tool_completed` / `tool_failed`) carrying the caller's correlation
//! id. Correlation metadata (`_correlation_id`, `_plan_id`,
//! `_step_index`, `_is_rollback`) is injected into handler args after
//! validation and stripped before it.

use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::audit::{AuditEvent, AuditLogger};
use crate::error::{Error, Result};

pub type ToolHandler =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync>;

pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub schema: serde_json::Value,
    pub is_mutating: bool,
    pub requires_confirmation: bool,
    handler: ToolHandler,
    validator: jsonschema::Validator,
}

/// Serializable catalog entry, handed to planners and CLI output.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub schema: serde_json::Value,
    pub is_mutating: bool,
    pub requires_confirmation: bool,
}

/// Caller identity threaded into every invocation.
#[derive(Debug, Clone, Default)]
pub struct InvocationContext {
    pub correlation_id: String,
    pub plan_id: Option<String>,
    pub step_index: Option<usize>,
    pub is_rollback: bool,
}

impl InvocationContext {
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            ..Default::default()
        }
    }
}

pub struct ToolRegistry {
    tools: HashMap<String, ToolDefinition>,
    audit: AuditLogger,
}

impl ToolRegistry {
    pub fn new(audit: AuditLogger) -> Self {
        Self {
            tools: HashMap::new(),
            audit,
        }
    }

    /// Register a tool; the schema is compiled once here.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        schema: serde_json::Value,
        is_mutating: bool,
        requires_confirmation: bool,
        handler: ToolHandler,
    ) -> Result<()> {
        let name = name.into();
        let validator = jsonschema::validator_for(&schema).map_err(|e| Error::ValidationFailed {
            field: format!("tools.{name}.schema"),
            reason: e.to_string(),
        })?;
        self.tools.insert(
            name.clone(),
            ToolDefinition {
                name,
                description: description.into(),
                schema,
                is_mutating,
                requires_confirmation,
                handler,
                validator,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name)
    }

    /// Catalog sorted by name.
    pub fn list(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .values()
            .map(|t| ToolSpec {
                name: t.name.clone(),
                description: t.description.clone(),
                schema: t.schema.clone(),
                is_mutating: t.is_mutating,
                requires_confirmation: t.requires_confirmation,
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Validate arguments against a tool's schema without invoking it.
    /// Correlation metadata keys are stripped first.
    pub fn validate(&self, name: &str, args: &serde_json::Value) -> Result<()> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("tool '{name}'")))?;
        let stripped = strip_metadata(args);
        tool.validator
            .validate(&stripped)
            .map_err(|e| Error::ValidationFailed {
                field: format!("{name}.{}", e.instance_path),
                reason: e.to_string(),
            })
    }

    /// Validate, stamp, execute, and audit one tool call.
    pub async fn execute_with_correlation(
        &self,
        name: &str,
        args: serde_json::Value,
        ctx: &InvocationContext,
    ) -> Result<serde_json::Value> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("tool '{name}'")))?;

        self.validate(name, &args)?;
        let stamped = inject_metadata(strip_metadata(&args), ctx);

        let mut started = AuditEvent::new(&ctx.correlation_id, "tool_started").tool(name);
        if let Some(plan_id) = &ctx.plan_id {
            started = started.plan(plan_id.clone());
        }
        if let Some(step) = ctx.step_index {
            started = started.step(step);
        }
        self.audit.emit(started.details(serde_json::json!({
            "is_rollback": ctx.is_rollback,
            "is_mutating": tool.is_mutating,
        })));

        let timer = Instant::now();
        let outcome = (tool.handler)(stamped).await;
        let duration_ms = timer.elapsed().as_millis() as u64;

        match &outcome {
            Ok(_) => self.audit.emit(
                AuditEvent::new(&ctx.correlation_id, "tool_completed")
                    .tool(name)
                    .details(serde_json::json!({"duration_ms": duration_ms})),
            ),
            Err(e) => self.audit.emit(
                AuditEvent::new(&ctx.correlation_id, "tool_failed")
                    .tool(name)
                    .risk("error")
                    .details(serde_json::json!({
                        "duration_ms": duration_ms,
                        "error": e.to_string(),
                        "kind": e.kind(),
                    })),
            ),
        }

        outcome
    }
}

/// Remove correlation metadata keys before schema validation.
fn strip_metadata(args: &serde_json::Value) -> serde_json::Value {
    match args {
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .filter(|(k, _)| !k.starts_with('_'))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn inject_metadata(args: serde_json::Value, ctx: &InvocationContext) -> serde_json::Value {
    let mut map = match args {
        serde_json::Value::Object(map) => map,
        other => {
            let mut map = serde_json::Map::new();
            if !other.is_null() {
                map.insert("value".into(), other);
            }
            map
        }
    };
    map.insert(
        "_correlation_id".into(),
        serde_json::Value::String(ctx.correlation_id.clone()),
    );
    if let Some(plan_id) = &ctx.plan_id {
        map.insert("_plan_id".into(), serde_json::Value::String(plan_id.clone()));
    }
    if let Some(step) = ctx.step_index {
        map.insert("_step_index".into(), serde_json::json!(step));
    }
    map.insert("_is_rollback".into(), serde_json::json!(ctx.is_rollback));
    serde_json::Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn registry() -> (TempDir, ToolRegistry) {
        let tmp = TempDir::new().unwrap();
        let audit = AuditLogger::start(&crate::config::AuditConfig {
            dir: tmp.path().to_path_buf(),
            max_file_bytes: 1024 * 1024,
            retention_days: 30,
        })
        .unwrap();
        (tmp, ToolRegistry::new(audit))
    }

    fn echo_handler() -> ToolHandler {
        Arc::new(|args| Box::pin(async move { Ok(args) }))
    }

    fn reminder_schema() -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "title": {"type": "string", "minLength": 1},
                "due_at": {"type": "integer"}
            },
            "required": ["title"],
            "additionalProperties": false
        })
    }

    #[tokio::test]
    async fn validation_rejects_before_invoking() {
        let (_tmp, mut registry) = registry().await;
        registry
            .register(
                "create_reminder",
                "Create a reminder",
                reminder_schema(),
                true,
                true,
                echo_handler(),
            )
            .unwrap();

        let err = registry
            .validate("create_reminder", &json!({"due_at": 5}))
            .unwrap_err();
        assert_eq!(err.kind(), "validation_failed");

        let err = registry
            .validate("create_reminder", &json!({"title": "x", "extra": true}))
            .unwrap_err();
        assert_eq!(err.kind(), "validation_failed");

        assert!(registry
            .validate("create_reminder", &json!({"title": "call Jane"}))
            .is_ok());
    }

    #[tokio::test]
    async fn metadata_is_stripped_for_validation_and_injected_for_handlers() {
        let (_tmp, mut registry) = registry().await;
        registry
            .register(
                "create_reminder",
                "Create a reminder",
                reminder_schema(),
                true,
                true,
                echo_handler(),
            )
            .unwrap();

        // `_`-prefixed keys would fail additionalProperties: false if they
        // reached the validator.
        let ctx = InvocationContext {
            correlation_id: "corr-1".into(),
            plan_id: Some("plan-1".into()),
            step_index: Some(0),
            is_rollback: false,
        };
        let result = registry
            .execute_with_correlation(
                "create_reminder",
                json!({"title": "call Jane", "_correlation_id": "stale"}),
                &ctx,
            )
            .await
            .unwrap();

        assert_eq!(result["title"], "call Jane");
        assert_eq!(result["_correlation_id"], "corr-1");
        assert_eq!(result["_plan_id"], "plan-1");
        assert_eq!(result["_step_index"], 0);
        assert_eq!(result["_is_rollback"], false);
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let (_tmp, registry) = registry().await;
        let err = registry
            .execute_with_correlation("nope", json!({}), &InvocationContext::new("c"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn list_is_sorted_and_complete() {
        let (_tmp, mut registry) = registry().await;
        registry
            .register("zeta", "z", json!({"type": "object"}), false, false, echo_handler())
            .unwrap();
        registry
            .register("alpha", "a", json!({"type": "object"}), true, true, echo_handler())
            .unwrap();

        let specs = registry.list();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].name, "alpha");
        assert!(specs[0].is_mutating);
        assert_eq!(specs[1].name, "zeta");
    }
}
