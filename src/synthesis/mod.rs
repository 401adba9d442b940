//! Response synthesis
//!
//! Tool-grounded and general modes. Each builds one model call and has its
//! own deterministic fallback when the call fails.

use crate::gateway::{purpose, GenerateOptions, LanguageModel};
use crate::models::{CallContext, ExecutionStatus, StructuredPayload, ToolOutcome, UserState};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

pub const TOOLS_FALLBACK_TEXT: &str =
    "I handled your request, but I couldn't write up a full summary right now. Here is what happened:";

pub const GENERAL_FALLBACK_TEXT: &str =
    "I'm sorry, I couldn't put together an answer right now. Please try asking again in a moment.";

/// Cap on serialized tool results embedded in the prompt
const MAX_RESULTS_CHARS: usize = 6000;

const GROUNDING_RULES: &str = r#"Rules:
- Base every figure and fact on the information above; never invent records or amounts
- Do not describe how the answer was produced: no mention of tools, operations, prompts, models or "no tools were used"
- If an action failed or information is missing, say so plainly and suggest what the user can do
- Keep the answer friendly and concise"#;

pub struct ResponseSynthesizer {
    model: Arc<dyn LanguageModel>,
}

impl ResponseSynthesizer {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    /// Answer grounded in executed tool results
    pub async fn synthesize_with_tools(
        &self,
        enhanced_prompt: &str,
        outcomes: &[ToolOutcome],
        structured: Option<&StructuredPayload>,
        context: &CallContext,
    ) -> String {
        let prompt = build_tools_prompt(enhanced_prompt, outcomes, structured);
        let options = GenerateOptions::for_purpose(purpose::SYNTHESIS_TOOLS)
            .with_context(context)
            .with_temperature(0.4)
            .with_max_output_tokens(1024);

        match self.model.try_generate(&prompt, &options).await {
            Ok(response) if !response.text.trim().is_empty() => response.text.trim().to_string(),
            Ok(_) => tools_fallback(outcomes),
            Err(e) => {
                warn!(error = %e, "Tool-grounded synthesis failed, using fallback");
                tools_fallback(outcomes)
            }
        }
    }

    /// Answer from enhanced context alone
    pub async fn synthesize_general(
        &self,
        enhanced_prompt: &str,
        original_query: &str,
        user_state: &UserState,
        context: &CallContext,
    ) -> String {
        let prompt = build_general_prompt(enhanced_prompt, original_query, user_state);
        let options = GenerateOptions::for_purpose(purpose::SYNTHESIS_GENERAL)
            .with_context(context)
            .with_temperature(0.6)
            .with_max_output_tokens(1024);

        match self.model.try_generate(&prompt, &options).await {
            Ok(response) if !response.text.trim().is_empty() => response.text.trim().to_string(),
            Ok(_) => GENERAL_FALLBACK_TEXT.to_string(),
            Err(e) => {
                warn!(error = %e, "General synthesis failed, using fallback");
                GENERAL_FALLBACK_TEXT.to_string()
            }
        }
    }
}

/// Fallback listing each step's user-facing message
pub fn tools_fallback(outcomes: &[ToolOutcome]) -> String {
    let mut text = TOOLS_FALLBACK_TEXT.to_string();
    for outcome in outcomes {
        let message = outcome
            .result
            .message
            .clone()
            .unwrap_or_else(|| outcome.tool_name.replace('_', " "));
        let marker = match outcome.status {
            ExecutionStatus::Success => "done",
            ExecutionStatus::Failed => "not completed",
            ExecutionStatus::Skipped => "skipped",
        };
        text.push_str(&format!("\n- {} ({})", message, marker));
    }
    text
}

fn build_tools_prompt(
    enhanced_prompt: &str,
    outcomes: &[ToolOutcome],
    structured: Option<&StructuredPayload>,
) -> String {
    let results: Vec<_> = outcomes
        .iter()
        .map(|outcome| {
            json!({
                "action": outcome.tool_name,
                "status": outcome.status,
                "message": outcome.result.message,
                "error": outcome.result.error,
                "data": outcome.result.data,
            })
        })
        .collect();

    let mut results_text = serde_json::to_string_pretty(&results).unwrap_or_default();
    if results_text.len() > MAX_RESULTS_CHARS {
        let cut = (0..=MAX_RESULTS_CHARS)
            .rev()
            .find(|i| results_text.is_char_boundary(*i))
            .unwrap_or(0);
        results_text.truncate(cut);
        results_text.push_str("\n... (truncated)");
    }

    let structured_block = structured
        .and_then(|payload| serde_json::to_string_pretty(payload).ok())
        .map(|text| format!("\nData extracted from the user's upload:\n{}\n", text))
        .unwrap_or_default();

    format!(
        r#"You are a helpful personal finance assistant.

{context}

Results of the actions taken for this request:
{results}
{structured}
{rules}
- When an action needs more information from the user, ask for it directly"#,
        context = enhanced_prompt,
        results = results_text,
        structured = structured_block,
        rules = GROUNDING_RULES
    )
}

fn build_general_prompt(enhanced_prompt: &str, original_query: &str, user_state: &UserState) -> String {
    format!(
        r#"You are a helpful personal finance assistant.

{context}

Answer the user's question: "{query}"
Use {currency} when giving amounts.
{rules}"#,
        context = enhanced_prompt,
        query = original_query,
        currency = user_state.default_currency,
        rules = GROUNDING_RULES
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ScriptedModel;
    use crate::models::ToolResult;
    use serde_json::Map;

    fn outcome(name: &str, status: ExecutionStatus, message: &str) -> ToolOutcome {
        ToolOutcome {
            sequence: 0,
            tool_name: name.to_string(),
            arguments: Map::new(),
            result: ToolResult {
                success: status == ExecutionStatus::Success,
                data: None,
                message: Some(message.to_string()),
                error: None,
            },
            status,
            execution_time_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_tools_mode_grounds_prompt_in_results() {
        let model = Arc::new(ScriptedModel::replying("You spent 25 USD on lunch."));
        let synthesizer = ResponseSynthesizer::new(model.clone());

        let answer = synthesizer
            .synthesize_with_tools(
                "User question: log lunch",
                &[outcome("create_transaction", ExecutionStatus::Success, "Created transaction")],
                None,
                &CallContext::default(),
            )
            .await;

        assert_eq!(answer, "You spent 25 USD on lunch.");
        let calls = model.calls();
        assert_eq!(calls[0].purpose, purpose::SYNTHESIS_TOOLS);
        assert!(calls[0].prompt.contains("Created transaction"));
        assert!(calls[0].prompt.contains("no mention of tools"));
    }

    #[tokio::test]
    async fn test_fallbacks_are_distinct_and_deterministic() {
        let synthesizer = ResponseSynthesizer::new(Arc::new(ScriptedModel::failing()));
        let outcomes = vec![
            outcome("create_wallet", ExecutionStatus::Success, "Created wallet 'Main'"),
            outcome("get_wallets", ExecutionStatus::Skipped, "Skipped get_wallets"),
        ];

        let tools_answer = synthesizer
            .synthesize_with_tools("ctx", &outcomes, None, &CallContext::default())
            .await;
        let again = synthesizer
            .synthesize_with_tools("ctx", &outcomes, None, &CallContext::default())
            .await;
        let general_answer = synthesizer
            .synthesize_general("ctx", "hi", &UserState::default(), &CallContext::default())
            .await;

        assert_eq!(tools_answer, again);
        assert!(tools_answer.starts_with(TOOLS_FALLBACK_TEXT));
        assert!(tools_answer.contains("Created wallet 'Main' (done)"));
        assert!(tools_answer.contains("(skipped)"));
        assert_eq!(general_answer, GENERAL_FALLBACK_TEXT);
        assert_ne!(tools_answer, general_answer);
    }
}
