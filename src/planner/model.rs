//! Model-assisted planner
//!
//! Two passes: complexity/intent analysis, then concrete selection with
//! filled arguments. Any call or parse failure yields the keyword fallback.

use super::{fallback_plan, finalize, PlanContext, ToolPlanner};
use crate::extract::extract_as;
use crate::gateway::{purpose, GenerateOptions, LanguageModel};
use crate::models::{ToolCall, ToolSelectionResult, UserState};
use crate::tools::catalog;
use crate::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Used when the selection omits its own confidence
const DEFAULT_SELECTION_CONFIDENCE: f32 = 0.7;

#[derive(Debug, Clone, Deserialize)]
pub struct ComplexityAnalysis {
    #[serde(default = "default_complexity")]
    pub complexity: String,
    #[serde(default)]
    pub intents: Vec<String>,
    #[serde(default)]
    pub required_tools: Vec<String>,
}

fn default_complexity() -> String {
    "simple".to_string()
}

#[derive(Debug, Clone, Deserialize)]
struct SelectionOutput {
    #[serde(default)]
    tools: Vec<ToolCall>,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    confidence: Option<f32>,
}

pub struct ModelToolPlanner {
    model: Arc<dyn LanguageModel>,
}

impl ModelToolPlanner {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    async fn analyze(&self, query: &str, context: &PlanContext) -> Result<ComplexityAnalysis> {
        let prompt = build_complexity_prompt(query, &context.user_state);
        let options = GenerateOptions::for_purpose(purpose::COMPLEXITY_ANALYSIS)
            .with_context(&context.call_context)
            .with_temperature(0.1)
            .with_max_output_tokens(512);

        let response = self.model.try_generate(&prompt, &options).await?;
        Ok(extract_as::<ComplexityAnalysis>(&response.text)?)
    }

    async fn select(
        &self,
        query: &str,
        analysis: &ComplexityAnalysis,
        context: &PlanContext,
    ) -> Result<SelectionOutput> {
        let prompt = build_selection_prompt(query, analysis, context);
        let options = GenerateOptions::for_purpose(purpose::TOOL_SELECTION)
            .with_context(&context.call_context)
            .with_temperature(0.1)
            .with_max_output_tokens(1024);

        let response = self.model.try_generate(&prompt, &options).await?;
        Ok(extract_as::<SelectionOutput>(&response.text)?)
    }
}

#[async_trait]
impl ToolPlanner for ModelToolPlanner {
    async fn plan(&self, query: &str, context: &PlanContext) -> Result<ToolSelectionResult> {
        if context.max_tools == 0 {
            return Ok(ToolSelectionResult::empty("Tool use disabled for this request", 1.0));
        }

        let analysis = match self.analyze(query, context).await {
            Ok(analysis) => analysis,
            Err(e) => {
                warn!(error = %e, "Complexity analysis failed, using fallback plan");
                return Ok(fallback_plan(query, context));
            }
        };

        let hinted: Vec<&String> = analysis
            .required_tools
            .iter()
            .filter(|name| catalog::is_known(name))
            .collect();

        if hinted.is_empty() {
            info!(
                complexity = %analysis.complexity,
                intents = ?analysis.intents,
                "No record operations required"
            );
            return Ok(ToolSelectionResult::empty(
                format!("No record operations needed ({} query)", analysis.complexity),
                0.8,
            ));
        }

        let selection = match self.select(query, &analysis, context).await {
            Ok(selection) => selection,
            Err(e) => {
                warn!(error = %e, "Tool selection failed, using fallback plan");
                return Ok(fallback_plan(query, context));
            }
        };

        let reasoning = if selection.reasoning.trim().is_empty() {
            format!("Selected for intents: {}", analysis.intents.join(", "))
        } else {
            selection.reasoning
        };

        let result = finalize(
            selection.tools,
            context,
            reasoning,
            selection.confidence.unwrap_or(DEFAULT_SELECTION_CONFIDENCE),
        );

        info!(
            tools = ?result.selected_tools.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            confidence = result.confidence,
            "Tool plan ready"
        );

        Ok(result)
    }
}

fn state_summary(user_state: &UserState) -> String {
    format!(
        "has_wallets={}, has_transactions={}, has_budgets={}, has_categories={}, default_currency={}",
        user_state.has_wallets,
        user_state.has_transactions,
        user_state.has_budgets,
        user_state.has_categories,
        user_state.default_currency
    )
}

fn build_complexity_prompt(query: &str, user_state: &UserState) -> String {
    format!(
        r#"You analyze requests to a personal finance assistant.

USER STATE:
{state}

AVAILABLE OPERATIONS:
{catalog}

USER MESSAGE:
{query}

Decide which operations (if any) are required to answer. General advice questions need none.
Return ONLY valid JSON:
{{"complexity": "simple"|"moderate"|"complex", "intents": ["..."], "required_tools": ["operation_name"]}}"#,
        state = state_summary(user_state),
        catalog = catalog::describe(),
        query = query
    )
}

fn build_selection_prompt(query: &str, analysis: &ComplexityAnalysis, context: &PlanContext) -> String {
    format!(
        r#"You select record operations for a personal finance assistant.

USER STATE:
{state}

AVAILABLE OPERATIONS:
{catalog}

INTENTS: {intents}
SUGGESTED OPERATIONS: {suggested}

USER MESSAGE:
{query}

Rules:
- Use only the operations listed above, at most {max_tools}
- Fill arguments from the message; never invent amounts
- Put creations before operations that use the created record
- Return ONLY valid JSON:
{{"tools": [{{"name": "operation_name", "arguments": {{}}}}], "reasoning": "short explanation", "confidence": 0.0-1.0}}"#,
        state = state_summary(&context.user_state),
        catalog = catalog::describe(),
        intents = analysis.intents.join(", "),
        suggested = analysis.required_tools.join(", "),
        query = query,
        max_tools = context.max_tools
    )
}
