//! Execution engine for tool plans
//!
//! Runs steps in dependency order against the record store.
//! No model calls happen here.

use crate::error::OrchestrationError;
use crate::models::{ExecutionStatus, ExecutionStep, ToolOutcome, ToolResult, ToolSelectionResult};
use crate::planner::topological_order;
use crate::tools::{catalog, validate_arguments, ToolRegistry};
use std::collections::HashSet;
use std::time::Instant;
use tracing::{debug, warn};

/// Maximum steps allowed per plan
pub const MAX_STEPS_PER_PLAN: usize = 20;

/// Outcomes of one plan run, in execution order
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub outcomes: Vec<ToolOutcome>,
    pub total_time_ms: u64,
}

impl ExecutionReport {
    pub fn had_errors(&self) -> bool {
        self.outcomes
            .iter()
            .any(|outcome| outcome.status != ExecutionStatus::Success)
    }

    pub fn tools_used(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.status != ExecutionStatus::Skipped)
            .map(|outcome| outcome.tool_name.clone())
            .collect()
    }

    /// Clarification requests produced by missing arguments
    pub fn clarifications(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|outcome| {
                outcome
                    .result
                    .error
                    .as_deref()
                    .map(|error| error.starts_with("Missing required argument"))
                    .unwrap_or(false)
            })
            .filter_map(|outcome| outcome.result.message.as_deref())
            .collect()
    }
}

/// User-facing question for a missing argument
pub fn clarification_message(tool: &str, argument: &str) -> String {
    let action = catalog::lookup(tool)
        .map(|spec| spec.description.to_lowercase())
        .unwrap_or_else(|| tool.replace('_', " "));
    format!(
        "I need the {} to {}. Could you tell me what {} to use?",
        argument, action, argument
    )
}

fn skipped(step: &ExecutionStep, error: String, message: String) -> ToolOutcome {
    ToolOutcome {
        sequence: step.sequence,
        tool_name: step.call.name.clone(),
        arguments: step.call.arguments.clone(),
        result: ToolResult::failure(error, message),
        status: ExecutionStatus::Skipped,
        execution_time_ms: 0,
    }
}

/// Executes a tool plan step by step
pub struct ExecutionEngine {
    tool_registry: ToolRegistry,
}

impl ExecutionEngine {
    pub fn new(tool_registry: ToolRegistry) -> Self {
        Self { tool_registry }
    }

    /// Execute every step; failures never abort independent steps
    pub async fn execute(&self, selection: &ToolSelectionResult, caller_id: &str) -> ExecutionReport {
        let started = Instant::now();
        let steps = &selection.execution_plan;

        if steps.len() > MAX_STEPS_PER_PLAN {
            warn!(steps = steps.len(), "Plan exceeds maximum allowed steps, skipping the rest");
        }

        let order = match topological_order(steps) {
            Ok(order) => order,
            Err(e) => {
                warn!(error = %e, "Invalid dependency graph, running in plan order");
                (0..steps.len()).collect()
            }
        };

        let mut failed: HashSet<usize> = HashSet::new();
        let mut outcomes = Vec::with_capacity(steps.len());

        for (run, position) in order.into_iter().enumerate() {
            let step = &steps[position];

            if run >= MAX_STEPS_PER_PLAN {
                failed.insert(step.sequence);
                outcomes.push(skipped(
                    step,
                    format!("Plan exceeds {} steps", MAX_STEPS_PER_PLAN),
                    format!("Skipped {} because the plan has too many steps", step.call.name),
                ));
                continue;
            }

            let unmet: Vec<usize> = step
                .depends_on
                .iter()
                .filter(|dependency| failed.contains(*dependency))
                .copied()
                .collect();

            if !unmet.is_empty() {
                warn!(
                    sequence = step.sequence,
                    tool_name = %step.call.name,
                    ?unmet,
                    "Skipping step because a dependency failed"
                );
                failed.insert(step.sequence);
                outcomes.push(skipped(
                    step,
                    format!("Unmet dependencies: {:?}", unmet),
                    format!("Skipped {} because an earlier step failed", step.call.name),
                ));
                continue;
            }

            let outcome = self.run_step(step, caller_id).await;
            if outcome.status != ExecutionStatus::Success {
                failed.insert(step.sequence);
            }
            outcomes.push(outcome);
        }

        let total_time_ms = started.elapsed().as_millis() as u64;
        debug!(steps = outcomes.len(), total_time_ms, "Plan execution completed");

        ExecutionReport {
            outcomes,
            total_time_ms,
        }
    }

    async fn run_step(&self, step: &ExecutionStep, caller_id: &str) -> ToolOutcome {
        let start = Instant::now();
        let call = &step.call;

        debug!(sequence = step.sequence, tool_name = %call.name, "Processing step");

        let result = match self.tool_registry.get(&call.name) {
            None => Err(OrchestrationError::ToolNotFound(call.name.clone())),
            Some(tool) => match validate_arguments(tool.spec(), call) {
                Err(e) => Err(e),
                Ok(()) => tool.execute(caller_id, &call.arguments).await,
            },
        };

        let (status, result) = match result {
            Ok(result) if result.success => (ExecutionStatus::Success, result),
            Ok(result) => (ExecutionStatus::Failed, result),
            Err(OrchestrationError::ToolValidationError { tool, argument }) => {
                debug!(tool_name = %tool, argument = %argument, "Missing required argument");
                let error = OrchestrationError::ToolValidationError {
                    tool: tool.clone(),
                    argument: argument.clone(),
                };
                (
                    ExecutionStatus::Failed,
                    ToolResult::failure(error.to_string(), clarification_message(&tool, &argument)),
                )
            }
            Err(e) => {
                warn!(sequence = step.sequence, tool_name = %call.name, error = %e, "Tool execution failed");
                let wrapped = match e {
                    OrchestrationError::ToolNotFound(_) => e,
                    other => OrchestrationError::ToolExecutionError(other.to_string()),
                };
                (
                    ExecutionStatus::Failed,
                    ToolResult::failure(
                        wrapped.to_string(),
                        format!("I couldn't complete {}", call.name.replace('_', " ")),
                    ),
                )
            }
        };

        ToolOutcome {
            sequence: step.sequence,
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
            result,
            status,
            execution_time_ms: start.elapsed().as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ToolCall, UserState};
    use crate::planner::{build_execution_plan, finalize, PlanContext};
    use crate::tools::{create_default_registry, InMemoryRecordStore, ResourceKind};
    use crate::models::CallContext;
    use serde_json::{json, Map, Value};
    use std::sync::Arc;

    fn call(name: &str, arguments: Value) -> ToolCall {
        ToolCall::new(name, arguments.as_object().cloned().unwrap_or_else(Map::new))
    }

    fn plan(calls: Vec<ToolCall>) -> ToolSelectionResult {
        let context = PlanContext {
            user_state: UserState::default(),
            max_tools: 10,
            call_context: CallContext::default(),
        };
        finalize(calls, &context, "test".into(), 1.0)
    }

    fn engine(store: Arc<InMemoryRecordStore>) -> ExecutionEngine {
        ExecutionEngine::new(create_default_registry(store))
    }

    #[tokio::test]
    async fn test_create_then_read() {
        let store = Arc::new(InMemoryRecordStore::new());
        let report = engine(store.clone())
            .execute(
                &plan(vec![
                    call("create_wallet", json!({ "name": "Main" })),
                    call("get_wallets", json!({})),
                ]),
                "alice",
            )
            .await;

        assert_eq!(report.outcomes.len(), 2);
        assert!(!report.had_errors());
        assert_eq!(report.outcomes[1].result.data.as_ref().unwrap().as_array().unwrap().len(), 1);
        assert_eq!(report.tools_used(), vec!["create_wallet", "get_wallets"]);
    }

    #[tokio::test]
    async fn test_missing_argument_asks_for_clarification_without_side_effect() {
        let store = Arc::new(InMemoryRecordStore::new());
        let report = engine(store.clone())
            .execute(&plan(vec![call("create_transaction", json!({ "type": "expense" }))]), "alice")
            .await;

        assert!(report.had_errors());
        assert_eq!(report.outcomes[0].status, ExecutionStatus::Failed);
        let clarifications = report.clarifications();
        assert_eq!(clarifications.len(), 1);
        assert!(clarifications[0].contains("amount"));
        assert_eq!(store.count("alice", ResourceKind::Transaction).await, 0);
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_but_not_independent_steps() {
        let store = Arc::new(InMemoryRecordStore::new());
        store.fail_on(ResourceKind::Wallet).await;

        let report = engine(store.clone())
            .execute(
                &plan(vec![
                    call("create_wallet", json!({ "name": "Travel" })),
                    call("get_budgets", json!({})),
                    call("get_wallets", json!({})),
                ]),
                "alice",
            )
            .await;

        assert_eq!(report.outcomes.len(), 3);
        assert_eq!(report.outcomes[0].status, ExecutionStatus::Failed);
        assert!(report.outcomes[0]
            .result
            .error
            .as_deref()
            .unwrap()
            .starts_with("Tool execution error"));
        assert_eq!(report.outcomes[1].status, ExecutionStatus::Success);
        assert_eq!(report.outcomes[2].status, ExecutionStatus::Skipped);
        assert_eq!(report.tools_used(), vec!["create_wallet", "get_budgets"]);
    }

    #[tokio::test]
    async fn test_steps_past_the_cap_are_recorded_as_skipped() {
        let store = Arc::new(InMemoryRecordStore::new());
        let calls: Vec<ToolCall> = (0..MAX_STEPS_PER_PLAN + 3)
            .map(|i| call("create_category", json!({ "name": format!("c{}", i) })))
            .collect();
        let selection = ToolSelectionResult {
            execution_plan: build_execution_plan(&calls),
            selected_tools: calls,
            reasoning: "oversized".into(),
            confidence: 1.0,
        };

        let report = engine(store.clone()).execute(&selection, "alice").await;

        assert_eq!(report.outcomes.len(), MAX_STEPS_PER_PLAN + 3);
        let skipped: Vec<_> = report
            .outcomes
            .iter()
            .filter(|outcome| outcome.status == ExecutionStatus::Skipped)
            .collect();
        assert_eq!(skipped.len(), 3);
        assert!(skipped[0].result.message.as_deref().unwrap().contains("too many steps"));
        assert_eq!(store.count("alice", ResourceKind::Category).await, MAX_STEPS_PER_PLAN);
    }

    #[test]
    fn test_clarification_wording() {
        let message = clarification_message("create_budget", "category");
        assert_eq!(
            message,
            "I need the category to create a spending budget for a category. Could you tell me what category to use?"
        );
    }
}
