//! Confidence scoring
//!
//! Four factors, each clamped to [0,100], weighted into one overall score.
//! Only context relevance involves the model.

use crate::extract::extract_as;
use crate::gateway::{purpose, GenerateOptions, LanguageModel};
use crate::models::{CallContext, ConfidenceFactors, ConfidenceScore};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

const WEIGHT_AVAILABILITY: f64 = 0.25;
const WEIGHT_RELEVANCE: f64 = 0.30;
const WEIGHT_COMPLETENESS: f64 = 0.25;
const WEIGHT_ACCURACY: f64 = 0.20;

/// Relevance used when the rating call fails or is unparseable
pub const DEFAULT_RELEVANCE: i64 = 50;

const SLOW_EXECUTION_MS: u64 = 10_000;
const SUGGESTION_THRESHOLD: u8 = 60;
const MAX_SUGGESTIONS: usize = 2;

const FINANCIAL_TERMS: &[&str] = &[
    "money", "budget", "spend", "spent", "expense", "income", "save", "saving", "wallet",
    "transaction", "balance", "cost", "price", "debt", "loan", "invest", "salary", "pay",
];

const ACTIONABLE_PHRASES: &[&str] = &[
    "you can", "you could", "consider", "try ", "i recommend", "i suggest", "next step",
    "start by", "you should", "make sure",
];

/// Reasoning bands, highest first
const BANDS: &[(u8, &str)] = &[
    (80, "High confidence: the answer is well supported by your data and the question."),
    (60, "Moderate confidence: the answer is reasonable but some details may be missing."),
    (40, "Low confidence: the answer may be incomplete or only partly relevant."),
    (0, "Very low confidence: please verify this answer or rephrase the question."),
];

lazy_static! {
    static ref NUMERIC_TOKEN: Option<Regex> =
        Regex::new(r"(?i)[\$€£¥]\s?\d|\d+(?:[.,]\d+)?\s?(?:%|usd|eur|gbp|dollars?|euros?)|\d").ok();
}

/// Everything the scorer looks at
#[derive(Debug, Clone, Default)]
pub struct ScoringContext {
    pub query: String,
    pub answer: String,
    pub tools_used: Vec<String>,
    /// Data payloads returned by the executed tools
    pub data_retrieved: Vec<Value>,
    pub execution_time_ms: u64,
    pub had_errors: bool,
}

#[derive(Debug, Deserialize)]
struct RelevanceRating {
    rating: f64,
}

fn clamp_factor(value: i64) -> u8 {
    value.clamp(0, 100) as u8
}

fn is_empty_collection(value: &Value) -> bool {
    matches!(value, Value::Array(items) if items.is_empty())
}

fn has_data(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
        _ => true,
    }
}

fn has_malformed_entries(value: &Value) -> bool {
    match value {
        Value::Array(items) => items.iter().any(|item| match item {
            Value::Object(fields) => fields.is_empty(),
            _ => true,
        }),
        _ => false,
    }
}

pub fn data_availability(context: &ScoringContext) -> u8 {
    if context.tools_used.is_empty() {
        return 70;
    }

    let mut score: i64 = 100;
    let sources = context.data_retrieved.iter().filter(|value| has_data(value)).count();

    if sources == 0 {
        score -= 40;
    }
    if context.data_retrieved.iter().any(is_empty_collection) {
        score -= 20;
    }
    if sources > 1 {
        score += 10;
    }

    clamp_factor(score)
}

fn is_financial(text: &str) -> bool {
    let lowered = text.to_lowercase();
    FINANCIAL_TERMS.iter().any(|term| lowered.contains(term))
}

fn has_numeric_tokens(text: &str) -> bool {
    match NUMERIC_TOKEN.as_ref() {
        Some(pattern) => pattern.is_match(text),
        None => text.chars().any(|c| c.is_ascii_digit()),
    }
}

pub fn completeness(context: &ScoringContext) -> u8 {
    let answer = context.answer.trim();
    let length = answer.chars().count();
    let mut score: i64 = 50;

    if length < 50 {
        score -= 30;
    } else if length > 200 {
        score += 20;
    }

    if is_financial(&context.query) {
        if has_numeric_tokens(answer) {
            score += 20;
        } else if !context.tools_used.is_empty() {
            score -= 15;
        }
    }

    let lowered = answer.to_lowercase();
    if ACTIONABLE_PHRASES.iter().any(|phrase| lowered.contains(phrase)) {
        score += 15;
    }

    clamp_factor(score)
}

pub fn accuracy(context: &ScoringContext) -> u8 {
    let mut score: i64 = 100;

    if context.had_errors {
        score -= 40;
    }
    if context.execution_time_ms > SLOW_EXECUTION_MS {
        score -= 15;
    }
    if context.data_retrieved.iter().any(has_malformed_entries) {
        score -= 20;
    }

    clamp_factor(score)
}

fn reasoning_for(overall: u8) -> &'static str {
    BANDS
        .iter()
        .find(|(floor, _)| overall >= *floor)
        .map(|(_, text)| *text)
        .unwrap_or(BANDS[BANDS.len() - 1].1)
}

fn suggestions_for(factors: &ConfidenceFactors) -> Vec<String> {
    let ordered = [
        (factors.data_availability, "Add more of your financial records so answers can use your actual data."),
        (factors.context_relevance, "Try rephrasing your question with more specific details."),
        (factors.completeness, "Ask a follow-up question if you need more detail on any part of the answer."),
        (factors.accuracy, "Double-check the figures against your records, as some data could not be retrieved."),
    ];

    ordered
        .iter()
        .filter(|(score, _)| *score < SUGGESTION_THRESHOLD)
        .take(MAX_SUGGESTIONS)
        .map(|(_, text)| text.to_string())
        .collect()
}

/// Weighted combination of the four factors
pub fn compute(context: &ScoringContext, relevance: i64) -> ConfidenceScore {
    let factors = ConfidenceFactors {
        data_availability: data_availability(context),
        context_relevance: clamp_factor(relevance),
        completeness: completeness(context),
        accuracy: accuracy(context),
    };

    let weighted = WEIGHT_AVAILABILITY * factors.data_availability as f64
        + WEIGHT_RELEVANCE * factors.context_relevance as f64
        + WEIGHT_COMPLETENESS * factors.completeness as f64
        + WEIGHT_ACCURACY * factors.accuracy as f64;
    let overall = clamp_factor(weighted.round() as i64);

    ConfidenceScore {
        overall,
        factors,
        reasoning: reasoning_for(overall).to_string(),
        suggestions: suggestions_for(&factors),
    }
}

/// Parse a relevance rating from `{"rating": N}` or a bare number
pub fn parse_relevance(text: &str) -> Option<i64> {
    if let Ok(parsed) = extract_as::<RelevanceRating>(text) {
        return Some(parsed.rating.round() as i64);
    }
    text.trim().trim_end_matches('%').parse::<f64>().ok().map(|v| v.round() as i64)
}

pub struct ConfidenceScorer {
    model: Arc<dyn LanguageModel>,
}

impl ConfidenceScorer {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    pub async fn score(&self, context: &ScoringContext, call_context: &CallContext) -> ConfidenceScore {
        let relevance = self.rate_relevance(context, call_context).await;
        let score = compute(context, relevance);
        debug!(overall = score.overall, relevance, "Confidence scored");
        score
    }

    async fn rate_relevance(&self, context: &ScoringContext, call_context: &CallContext) -> i64 {
        let prompt = format!(
            r#"Rate from 0 to 100 how relevant and useful the answer is to the question.

QUESTION:
{}

ANSWER:
{}

Return ONLY JSON: {{"rating": <0-100>}}"#,
            context.query, context.answer
        );
        let options = GenerateOptions::for_purpose(purpose::RELEVANCE_RATING)
            .with_context(call_context)
            .with_temperature(0.0)
            .with_max_output_tokens(64);

        match self.model.try_generate(&prompt, &options).await {
            Ok(response) => parse_relevance(&response.text).unwrap_or(DEFAULT_RELEVANCE),
            Err(_) => DEFAULT_RELEVANCE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ScriptedModel;
    use serde_json::json;

    fn context() -> ScoringContext {
        ScoringContext {
            query: "How much did I spend on food?".into(),
            answer: "You spent $120 on food this month. Consider setting a budget of $100 to keep it in check next month, and review your grocery receipts weekly.".into(),
            tools_used: vec!["get_transactions".into()],
            data_retrieved: vec![json!([{ "id": "t1", "amount": 120 }])],
            execution_time_ms: 120,
            had_errors: false,
        }
    }

    #[test]
    fn test_general_knowledge_baseline() {
        let ctx = ScoringContext {
            tools_used: vec![],
            data_retrieved: vec![],
            ..context()
        };
        assert_eq!(data_availability(&ctx), 70);
    }

    #[test]
    fn test_data_availability_adjustments() {
        let mut ctx = context();
        assert_eq!(data_availability(&ctx), 100);

        ctx.data_retrieved = vec![json!([])];
        assert_eq!(data_availability(&ctx), 40);

        ctx.data_retrieved = vec![json!([{ "id": 1 }]), json!({ "id": 2 })];
        assert_eq!(data_availability(&ctx), 100);
    }

    #[test]
    fn test_completeness_and_accuracy() {
        let ctx = context();
        // 50 + 20 numeric + 15 actionable; 141 chars is neither short nor long
        assert_eq!(completeness(&ctx), 85);
        assert_eq!(accuracy(&ctx), 100);

        let bad = ScoringContext {
            answer: "Done.".into(),
            had_errors: true,
            execution_time_ms: 15_000,
            data_retrieved: vec![json!(["oops"])],
            ..context()
        };
        assert_eq!(completeness(&bad), 5);
        assert_eq!(accuracy(&bad), 25);
    }

    #[test]
    fn test_overall_weights_and_suggestions() {
        let score = compute(&context(), 90);
        // 0.25*100 + 0.30*90 + 0.25*85 + 0.20*100 = 93.25
        assert_eq!(score.overall, 93);
        assert!(score.reasoning.starts_with("High confidence"));
        assert!(score.suggestions.is_empty());

        let poor = ScoringContext {
            answer: "No.".into(),
            had_errors: true,
            data_retrieved: vec![json!([])],
            ..context()
        };
        let score = compute(&poor, 10);
        assert!(score.overall < 40);
        assert!(score.reasoning.starts_with("Very low"));
        assert_eq!(score.suggestions.len(), 2);
    }

    #[test]
    fn test_adversarial_inputs_clamp() {
        for relevance in [-1_000, -1, 0, 50, 100, 101, 10_000] {
            for had_errors in [false, true] {
                let ctx = ScoringContext {
                    answer: String::new(),
                    had_errors,
                    execution_time_ms: u64::MAX,
                    data_retrieved: vec![json!([]), json!([1, 2]), Value::Null],
                    ..context()
                };
                let score = compute(&ctx, relevance);
                assert!(score.overall <= 100);
                assert!(score.factors.context_relevance <= 100);
                assert!(score.suggestions.len() <= 2);
            }
        }
    }

    #[test]
    fn test_parse_relevance() {
        assert_eq!(parse_relevance(r#"{"rating": 87}"#), Some(87));
        assert_eq!(parse_relevance("Rating: ```json\n{\"rating\": 42.6}\n```"), Some(43));
        assert_eq!(parse_relevance(" 75 "), Some(75));
        assert_eq!(parse_relevance("very relevant"), None);
    }

    #[tokio::test]
    async fn test_failed_relevance_call_defaults_to_fifty_and_is_idempotent() {
        let scorer = ConfidenceScorer::new(Arc::new(ScriptedModel::failing()));
        let first = scorer.score(&context(), &CallContext::default()).await;
        let second = scorer.score(&context(), &CallContext::default()).await;

        assert_eq!(first.factors.context_relevance, 50);
        assert_eq!(first, second);
    }
}
