//! Tool planner
//!
//! Chooses which record operations a query needs and builds a
//! dependency-ordered execution plan bounded by `max_tools`.

use crate::execution::MAX_STEPS_PER_PLAN;
use crate::models::{CallContext, ToolCall, ToolSelectionResult, UserState};
use crate::tools::catalog::{self, OperationFamily, ResourceKind};
use crate::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

pub mod fallback;
pub mod graph;
pub mod model;
pub mod priority;

pub use fallback::FALLBACK_CONFIDENCE;
pub use graph::{build_execution_plan, topological_order};
pub use model::ModelToolPlanner;

#[derive(Debug, Clone)]
pub struct PlanContext {
    pub user_state: UserState,
    pub max_tools: usize,
    pub call_context: CallContext,
}

/// Trait for tool selection
#[async_trait]
pub trait ToolPlanner: Send + Sync {
    async fn plan(&self, query: &str, context: &PlanContext) -> Result<ToolSelectionResult>;
}

/// Keyword-only planner for development & testing
pub struct KeywordPlanner;

#[async_trait]
impl ToolPlanner for KeywordPlanner {
    async fn plan(&self, query: &str, context: &PlanContext) -> Result<ToolSelectionResult> {
        Ok(fallback_plan(query, context))
    }
}

/// Deterministic plan with reduced confidence
pub fn fallback_plan(query: &str, context: &PlanContext) -> ToolSelectionResult {
    let calls = fallback::fallback_calls(query, &context.user_state);
    let reasoning = if calls.is_empty() {
        "Fallback keyword plan: no record operation matched".to_string()
    } else {
        format!(
            "Fallback keyword plan: {}",
            calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>().join(", ")
        )
    };

    finalize(calls, context, reasoning, FALLBACK_CONFIDENCE)
}

fn default_limit(resource: ResourceKind) -> u64 {
    match resource {
        ResourceKind::Transaction => 10,
        ResourceKind::Budget => 10,
        ResourceKind::Wallet => 20,
        ResourceKind::Category => 50,
    }
}

/// Fill currency, wallet and result-size defaults the selection left out
pub fn apply_defaults(call: &mut ToolCall, user_state: &UserState) {
    let Some(spec) = catalog::lookup(&call.name) else {
        return;
    };
    let accepts = |argument: &str| spec.required.contains(&argument) || spec.optional.contains(&argument);
    let missing = |call: &ToolCall, argument: &str| matches!(call.arguments.get(argument), None | Some(Value::Null));

    if accepts("currency") && missing(call, "currency") {
        call.arguments
            .insert("currency".to_string(), json!(user_state.default_currency));
    }

    // reads filter on every argument, so only writes get a wallet reference
    if spec.family != OperationFamily::Read && accepts("wallet") && missing(call, "wallet") && user_state.has_wallets {
        call.arguments.insert("wallet".to_string(), json!("main"));
    }

    if spec.family == OperationFamily::Read && missing(call, "limit") {
        call.arguments
            .insert("limit".to_string(), json!(default_limit(spec.resource)));
    }

    if let Some(Value::String(kind)) = call.arguments.get_mut("type") {
        *kind = kind.trim().to_lowercase();
    }
}

/// Shared post-processing for every selection: drop unknown operations,
/// fill defaults, deduplicate, bound to `max_tools`, infer dependencies.
pub fn finalize(
    calls: Vec<ToolCall>,
    context: &PlanContext,
    reasoning: String,
    confidence: f32,
) -> ToolSelectionResult {
    let mut selected: Vec<ToolCall> = Vec::with_capacity(calls.len());

    for mut call in calls {
        if !catalog::is_known(&call.name) {
            warn!(tool_name = %call.name, "Dropping unknown operation from selection");
            continue;
        }

        apply_defaults(&mut call, &context.user_state);

        if !selected.contains(&call) {
            selected.push(call);
        }
    }

    let before = selected.len();
    let max_tools = context.max_tools.min(MAX_STEPS_PER_PLAN);
    let selected = priority::bound(selected, &context.user_state, max_tools);
    if selected.len() < before {
        debug!(before, after = selected.len(), "Selection truncated to max_tools");
    }

    let execution_plan = build_execution_plan(&selected);

    ToolSelectionResult {
        selected_tools: selected,
        execution_plan,
        reasoning,
        confidence: confidence.clamp(0.0, 1.0),
    }
}
