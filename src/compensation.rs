//! Compensation-driven rollback.
//!
//! When a plan step fails, every previously completed step is compensated
//! in reverse order. The strategy per step:
//!
//! - **inverse_op** — a registered inverse tool undoes the step, with
//!   arguments derived from the step's recorded result (typically an id).
//!   An inverse that itself fails is recorded and the walk continues.
//! - **data_restore** — no safe inverse; the pre-image captured in the
//!   step result is preserved for an operator to restore by hand.
//! - **manual_intervention** — irreversible (an email that left the
//!   outbox); remediation instructions are emitted.
//! - **no_action_needed** — the step never mutated anything.
//!
//! Every compensation action lands in the audit log with its strategy,
//! outcome, and captured state.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::audit::{AuditEvent, AuditLogger};
use crate::plan::{PlanStep, StepResult};
use crate::tools::{InvocationContext, ToolRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationStrategy {
    InverseOp,
    DataRestore,
    ManualIntervention,
    NoActionNeeded,
    /// Rollback was attempted and itself failed; preserved for audit.
    Failed,
}

impl CompensationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompensationStrategy::InverseOp => "inverse_op",
            CompensationStrategy::DataRestore => "data_restore",
            CompensationStrategy::ManualIntervention => "manual_intervention",
            CompensationStrategy::NoActionNeeded => "no_action_needed",
            CompensationStrategy::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationResult {
    pub step_index: usize,
    pub tool_name: String,
    pub strategy: CompensationStrategy,
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub captured: Option<serde_json::Value>,
}

pub struct CompensationEngine {
    inverse_ops: HashMap<String, String>,
    audit: AuditLogger,
}

impl CompensationEngine {
    /// Engine with the default inverse registrations.
    pub fn with_defaults(audit: AuditLogger) -> Self {
        let mut engine = Self {
            inverse_ops: HashMap::new(),
            audit,
        };
        engine.register_inverse("create_reminder", "delete_reminder");
        engine.register_inverse("delete_reminder", "create_reminder");
        engine.register_inverse("create_event", "delete_event");
        engine.register_inverse("delete_event", "create_event");
        engine.register_inverse("create_note", "delete_note");
        engine
    }

    pub fn register_inverse(&mut self, tool: impl Into<String>, inverse: impl Into<String>) {
        self.inverse_ops.insert(tool.into(), inverse.into());
    }

    /// Strategy that would apply to a step, before attempting it.
    pub fn strategy_for(&self, step: &PlanStep) -> CompensationStrategy {
        if !step.is_mutating {
            CompensationStrategy::NoActionNeeded
        } else if self.inverse_ops.contains_key(step.tool_name.as_str()) {
            CompensationStrategy::InverseOp
        } else if step.tool_name.starts_with("update_") {
            CompensationStrategy::DataRestore
        } else {
            CompensationStrategy::ManualIntervention
        }
    }

    /// Compensate completed steps `[0, failed_index)` in strictly
    /// decreasing order. Never fails as a whole; individual failures are
    /// recorded in the results.
    pub async fn compensate(
        &self,
        registry: &ToolRegistry,
        correlation_id: &str,
        plan_id: &str,
        steps: &[PlanStep],
        results: &[StepResult],
        failed_index: usize,
    ) -> Vec<CompensationResult> {
        let mut rollback = Vec::new();

        for index in (0..failed_index.min(steps.len())).rev() {
            let step = &steps[index];
            let result = results.iter().find(|r| r.step_index == index);
            let outcome = self
                .compensate_step(registry, correlation_id, plan_id, index, step, result)
                .await;

            self.audit.emit(
                AuditEvent::new(correlation_id, "compensation_applied")
                    .plan(plan_id)
                    .step(index)
                    .tool(&step.tool_name)
                    .details(serde_json::json!({
                        "strategy": outcome.strategy.as_str(),
                        "success": outcome.success,
                        "message": outcome.message,
                        "captured": outcome.captured,
                    })),
            );
            rollback.push(outcome);
        }

        rollback
    }

    async fn compensate_step(
        &self,
        registry: &ToolRegistry,
        correlation_id: &str,
        plan_id: &str,
        step_index: usize,
        step: &PlanStep,
        result: Option<&StepResult>,
    ) -> CompensationResult {
        let base = |strategy, success, message: String, captured| CompensationResult {
            step_index,
            tool_name: step.tool_name.clone(),
            strategy,
            success,
            message,
            captured,
        };

        match self.strategy_for(step) {
            CompensationStrategy::NoActionNeeded => base(
                CompensationStrategy::NoActionNeeded,
                true,
                "non-mutating step; nothing to undo".into(),
                None,
            ),
            CompensationStrategy::DataRestore => {
                let captured = result.and_then(|r| r.output.get("previous").cloned());
                base(
                    CompensationStrategy::DataRestore,
                    false,
                    "manual intervention required: restore the captured pre-image".into(),
                    captured,
                )
            }
            CompensationStrategy::ManualIntervention => base(
                CompensationStrategy::ManualIntervention,
                false,
                format!(
                    "'{}' is irreversible; follow up out-of-band to undo its effect",
                    step.tool_name
                ),
                result.map(|r| r.output.clone()),
            ),
            CompensationStrategy::InverseOp => {
                let inverse = match self.inverse_ops.get(step.tool_name.as_str()) {
                    Some(inverse) => inverse.clone(),
                    None => {
                        return base(
                            CompensationStrategy::Failed,
                            false,
                            "inverse registration vanished".into(),
                            None,
                        )
                    }
                };

                let Some(args) = result.and_then(|r| inverse_args(&r.output)) else {
                    return base(
                        CompensationStrategy::Failed,
                        false,
                        format!("no result id available to drive '{inverse}'"),
                        result.map(|r| r.output.clone()),
                    );
                };

                let ctx = InvocationContext {
                    correlation_id: correlation_id.to_string(),
                    plan_id: Some(plan_id.to_string()),
                    step_index: Some(step_index),
                    is_rollback: true,
                };
                match registry.execute_with_correlation(&inverse, args, &ctx).await {
                    Ok(output) => base(
                        CompensationStrategy::InverseOp,
                        true,
                        format!("undone via '{inverse}'"),
                        Some(output),
                    ),
                    Err(e) => base(
                        CompensationStrategy::Failed,
                        false,
                        format!("'{inverse}' failed: {e}"),
                        result.map(|r| r.output.clone()),
                    ),
                }
            }
            CompensationStrategy::Failed => unreachable!("never pre-selected"),
        }
    }
}

/// Derive inverse-op arguments from a completed step's result. The
/// convention is that creating tools return the created `document_id`.
fn inverse_args(output: &serde_json::Value) -> Option<serde_json::Value> {
    output
        .get("document_id")
        .or_else(|| output.get("id"))
        .map(|id| serde_json::json!({ "document_id": id }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(tool: &str, mutating: bool) -> PlanStep {
        PlanStep {
            tool_name: tool.into(),
            arguments: serde_json::json!({}),
            description: String::new(),
            is_mutating: mutating,
            requires_confirmation: mutating,
        }
    }

    #[tokio::test]
    async fn strategy_selection() {
        let tmp = tempfile::TempDir::new().unwrap();
        let audit = AuditLogger::start(&crate::config::AuditConfig {
            dir: tmp.path().to_path_buf(),
            max_file_bytes: 1024 * 1024,
            retention_days: 30,
        })
        .unwrap();
        let engine = CompensationEngine::with_defaults(audit);

        assert_eq!(
            engine.strategy_for(&step("search_documents", false)),
            CompensationStrategy::NoActionNeeded
        );
        assert_eq!(
            engine.strategy_for(&step("create_reminder", true)),
            CompensationStrategy::InverseOp
        );
        assert_eq!(
            engine.strategy_for(&step("update_note", true)),
            CompensationStrategy::DataRestore
        );
        assert_eq!(
            engine.strategy_for(&step("send_email", true)),
            CompensationStrategy::ManualIntervention
        );
    }

    #[test]
    fn inverse_args_prefer_document_id() {
        let args = inverse_args(&serde_json::json!({"document_id": "d1", "id": "x"})).unwrap();
        assert_eq!(args["document_id"], "d1");
        assert!(inverse_args(&serde_json::json!({"count": 3})).is_none());
    }
}
