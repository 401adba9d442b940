//! Defensive parsing of provider response bodies
//!
//! Several historical response shapes are accepted; see `parse_provider_response`.

use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedResponse {
    pub text: Option<String>,
    pub block_reason: Option<String>,
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Extract text, usage, and any safety block from a provider body.
///
/// Text is looked up in order: joined `candidates[0].content.parts[*].text`,
/// `candidates[0].text`, `candidates[0].output`, top-level `text`,
/// `output_text`, then `choices[0].message.content`.
pub fn parse_provider_response(body: &Value) -> ParsedResponse {
    let candidate = body
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first());

    let text = candidate
        .and_then(candidate_text)
        .or_else(|| non_empty_str(body.get("text")))
        .or_else(|| non_empty_str(body.get("output_text")))
        .or_else(|| {
            body.get("choices")
                .and_then(Value::as_array)
                .and_then(|choices| choices.first())
                .and_then(|choice| choice.get("message"))
                .and_then(|message| non_empty_str(message.get("content")))
        });

    let finish_reason = candidate
        .and_then(|c| field(c, "finishReason", "finish_reason"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let block_reason = field(body, "promptFeedback", "prompt_feedback")
        .and_then(|feedback| field(feedback, "blockReason", "block_reason"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| match finish_reason.as_deref() {
            Some("SAFETY") | Some("BLOCKLIST") | Some("PROHIBITED_CONTENT") => finish_reason.clone(),
            _ => None,
        });

    ParsedResponse {
        text,
        block_reason,
        usage: parse_usage(body),
        finish_reason,
    }
}

fn candidate_text(candidate: &Value) -> Option<String> {
    let from_parts = candidate
        .get("content")
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .filter(|joined| !joined.trim().is_empty());

    from_parts
        .or_else(|| non_empty_str(candidate.get("text")))
        .or_else(|| non_empty_str(candidate.get("output")))
}

fn parse_usage(body: &Value) -> Option<TokenUsage> {
    let usage = field(body, "usageMetadata", "usage_metadata").or_else(|| body.get("usage"))?;

    let count = |camel: &str, snake: &str| {
        field(usage, camel, snake)
            .and_then(Value::as_u64)
            .map(|v| v as u32)
    };

    let prompt = count("promptTokenCount", "prompt_token_count")
        .or_else(|| count("promptTokens", "prompt_tokens"))?;
    let completion = count("candidatesTokenCount", "candidates_token_count")
        .or_else(|| count("completionTokens", "completion_tokens"))
        .unwrap_or(0);
    let total = count("totalTokenCount", "total_token_count")
        .or_else(|| count("totalTokens", "total_tokens"))
        .unwrap_or(prompt + completion);

    Some(TokenUsage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: total,
    })
}

fn field<'a>(value: &'a Value, camel: &str, snake: &str) -> Option<&'a Value> {
    value.get(camel).or_else(|| value.get(snake))
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
}

/// Rough token estimate used when the provider omits usage (≈ 4 chars per token)
pub fn estimate_tokens(text: &str) -> u32 {
    ((text.len() + 3) / 4) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_current_gemini_shape() {
        let body = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "Hello " }, { "text": "there" }] },
                "finishReason": "STOP"
            }],
            "usageMetadata": {
                "promptTokenCount": 12,
                "candidatesTokenCount": 3,
                "totalTokenCount": 15
            }
        });

        let parsed = parse_provider_response(&body);
        assert_eq!(parsed.text.as_deref(), Some("Hello there"));
        assert_eq!(parsed.usage.unwrap().total_tokens, 15);
        assert!(parsed.block_reason.is_none());
    }

    #[test]
    fn test_legacy_shapes() {
        let snake = json!({
            "candidates": [{ "output": "legacy output" }],
            "usage_metadata": { "prompt_token_count": 4, "candidates_token_count": 2 }
        });
        let parsed = parse_provider_response(&snake);
        assert_eq!(parsed.text.as_deref(), Some("legacy output"));
        assert_eq!(parsed.usage.unwrap().total_tokens, 6);

        let flat = json!({ "text": "flat text" });
        assert_eq!(parse_provider_response(&flat).text.as_deref(), Some("flat text"));

        let chat = json!({ "choices": [{ "message": { "content": "chat style" } }] });
        assert_eq!(parse_provider_response(&chat).text.as_deref(), Some("chat style"));
    }

    #[test]
    fn test_block_reasons() {
        let prompt_blocked = json!({ "promptFeedback": { "blockReason": "SAFETY" } });
        let parsed = parse_provider_response(&prompt_blocked);
        assert!(parsed.text.is_none());
        assert_eq!(parsed.block_reason.as_deref(), Some("SAFETY"));

        let candidate_blocked = json!({
            "candidates": [{ "content": { "parts": [] }, "finishReason": "SAFETY" }]
        });
        let parsed = parse_provider_response(&candidate_blocked);
        assert!(parsed.text.is_none());
        assert_eq!(parsed.block_reason.as_deref(), Some("SAFETY"));
    }

    #[test]
    fn test_token_estimate() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
