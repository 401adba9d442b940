//! Model Gateway
//!
//! Resilient wrapper around a remote text/vision generation call:
//! bounded attempts with exponential backoff, a hard per-attempt timeout,
//! tolerant response parsing, and one usage entry per terminal outcome.

use crate::audit::{prompt_digest, UsageEntryBuilder, UsageLogger};
use crate::error::OrchestrationError;
use crate::models::{CallContext, UsageStatus};
use crate::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod gemini;
pub mod mock;
pub mod response;

pub use gemini::GeminiTransport;
pub use mock::{ScriptedModel, ScriptedTransport};
pub use response::{estimate_tokens, parse_provider_response, ParsedResponse, TokenUsage};

/// User-safe text returned when the model cannot be reached
pub const APOLOGY_TEXT: &str =
    "I'm sorry, I'm having trouble responding right now. Please try again in a moment.";

/// Returned when the provider refused to answer for safety reasons
pub const BLOCKED_TEXT: &str =
    "I couldn't answer that request. Could you rephrase it and try again?";

/// Purpose tags recorded on every model call
pub mod purpose {
    pub const SECURITY_ANALYSIS: &str = "security_analysis";
    pub const TRANSCRIPTION: &str = "vision_transcription";
    pub const CONTENT_CLASSIFICATION: &str = "content_classification";
    pub const STRUCTURED_EXTRACTION: &str = "structured_extraction";
    pub const COMPLEXITY_ANALYSIS: &str = "complexity_analysis";
    pub const TOOL_SELECTION: &str = "tool_selection";
    pub const SYNTHESIS_TOOLS: &str = "synthesis_tools";
    pub const SYNTHESIS_GENERAL: &str = "synthesis_general";
    pub const RELEVANCE_RATING: &str = "relevance_rating";
    pub const GENERAL: &str = "general";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub mime_type: String,
    pub data_base64: String,
}

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub image: Option<ImagePayload>,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub purpose: &'static str,
    pub context: CallContext,
}

impl GenerateOptions {
    pub fn for_purpose(purpose: &'static str) -> Self {
        Self {
            purpose,
            ..Self::default()
        }
    }

    pub fn with_context(mut self, context: &CallContext) -> Self {
        self.context = context.clone();
        self
    }

    pub fn with_image(mut self, image: ImagePayload) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            image: None,
            temperature: 0.3,
            max_output_tokens: 1024,
            purpose: purpose::GENERAL,
            context: CallContext::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelResponse {
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    /// Token counts were estimated because the provider omitted them
    pub estimated_usage: bool,
    /// The text is a gateway fallback, not model output
    pub degraded: bool,
}

impl ModelResponse {
    pub fn fallback(text: &str) -> Self {
        Self {
            text: text.to_string(),
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            estimated_usage: false,
            degraded: true,
        }
    }
}

/// Text/vision generation as seen by the pipeline stages
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Generate, surfacing failures to callers that must distinguish them
    async fn try_generate(&self, prompt: &str, options: &GenerateOptions) -> Result<ModelResponse>;

    /// Generate, failing closed to a user-safe apology string
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> ModelResponse {
        match self.try_generate(prompt, options).await {
            Ok(response) => response,
            Err(OrchestrationError::ModelBlocked(_)) => ModelResponse::fallback(BLOCKED_TEXT),
            Err(_) => ModelResponse::fallback(APOLOGY_TEXT),
        }
    }
}

//
// ================= Transport =================
//

#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub prompt: String,
    pub image: Option<ImagePayload>,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("provider returned HTTP {code}: {body}")]
    Status { code: u16, body: String },

    #[error("network failure: {0}")]
    Network(String),

    #[error("undecodable response body: {0}")]
    Decode(String),
}

/// One raw request/response exchange with a model provider
#[async_trait]
pub trait ModelTransport: Send + Sync {
    fn provider(&self) -> &str;
    fn model(&self) -> &str;
    async fn send(&self, request: &TransportRequest) -> std::result::Result<Value, TransportError>;
}

//
// ================= Gateway =================
//

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    /// Hard limit for a single attempt
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            timeout: Duration::from_secs(12),
        }
    }
}

enum AttemptFailure {
    Retryable(OrchestrationError),
    Terminal(OrchestrationError),
}

pub struct ModelGateway {
    transport: Arc<dyn ModelTransport>,
    policy: RetryPolicy,
    usage: UsageLogger,
}

impl ModelGateway {
    pub fn new(transport: Arc<dyn ModelTransport>, policy: RetryPolicy, usage: UsageLogger) -> Self {
        Self {
            transport,
            policy,
            usage,
        }
    }

    pub fn model_name(&self) -> &str {
        self.transport.model()
    }

    async fn attempt(&self, request: &TransportRequest) -> std::result::Result<ParsedResponse, AttemptFailure> {
        let outcome = tokio::time::timeout(self.policy.timeout, self.transport.send(request)).await;

        match outcome {
            Ok(Ok(body)) => Ok(parse_provider_response(&body)),
            Ok(Err(TransportError::Status { code: 429, body })) => {
                Err(AttemptFailure::Retryable(OrchestrationError::ModelRateLimited(body)))
            }
            Ok(Err(TransportError::Status { code, body })) => {
                let error = OrchestrationError::ModelError {
                    status: Some(code),
                    message: body,
                };
                if error.is_retryable() {
                    Err(AttemptFailure::Retryable(error))
                } else {
                    Err(AttemptFailure::Terminal(error))
                }
            }
            Ok(Err(TransportError::Network(message))) | Ok(Err(TransportError::Decode(message))) => {
                Err(AttemptFailure::Retryable(OrchestrationError::ModelError {
                    status: None,
                    message,
                }))
            }
            Err(_) => Err(AttemptFailure::Retryable(OrchestrationError::ModelTimeout(
                self.policy.timeout.as_millis() as u64,
            ))),
        }
    }

    async fn log_failure(
        &self,
        prompt: &str,
        options: &GenerateOptions,
        error: &OrchestrationError,
        attempts: u32,
        latency_ms: u64,
    ) {
        let entry = self
            .entry(prompt, options, error.usage_status(), attempts, latency_ms)
            .metadata("error", Value::String(error.to_string()))
            .build();
        self.usage.log(entry).await;
    }

    fn entry(
        &self,
        prompt: &str,
        options: &GenerateOptions,
        status: UsageStatus,
        attempts: u32,
        latency_ms: u64,
    ) -> UsageEntryBuilder {
        let correlation = options.context.correlation_id.clone();
        UsageEntryBuilder::new(
            options.context.caller_id.clone(),
            self.transport.provider(),
            self.transport.model(),
            prompt,
            status,
        )
        .latency_ms(latency_ms)
        .correlation_id(if correlation.is_empty() { None } else { Some(correlation) })
        .metadata("purpose", json!(options.purpose))
        .metadata("attempts", json!(attempts))
        .metadata("has_image", json!(options.image.is_some()))
        .metadata("prompt_sha256", json!(prompt_digest(prompt)))
    }
}

#[async_trait]
impl LanguageModel for ModelGateway {
    async fn try_generate(&self, prompt: &str, options: &GenerateOptions) -> Result<ModelResponse> {
        let started = Instant::now();
        let request = TransportRequest {
            prompt: prompt.to_string(),
            image: options.image.clone(),
            temperature: options.temperature,
            max_output_tokens: options.max_output_tokens,
        };

        let max_attempts = self.policy.max_attempts.max(1);
        let mut backoff = self.policy.initial_backoff;
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(purpose = options.purpose, attempt, "Calling model");

            let failure = match self.attempt(&request).await {
                Ok(parsed) => {
                    let latency_ms = started.elapsed().as_millis() as u64;

                    if let Some(text) = parsed.text {
                        let (prompt_tokens, completion_tokens, total_tokens, estimated_usage) =
                            match parsed.usage {
                                Some(usage) => (
                                    usage.prompt_tokens,
                                    usage.completion_tokens,
                                    usage.total_tokens,
                                    false,
                                ),
                                None => {
                                    let p = estimate_tokens(prompt);
                                    let c = estimate_tokens(&text);
                                    (p, c, p + c, true)
                                }
                            };

                        let entry = self
                            .entry(prompt, options, UsageStatus::Success, attempt, latency_ms)
                            .response(text.clone())
                            .tokens(prompt_tokens, completion_tokens, total_tokens)
                            .cost(estimate_cost(self.transport.model(), prompt_tokens, completion_tokens))
                            .metadata("estimated_usage", json!(estimated_usage))
                            .build();
                        self.usage.log(entry).await;

                        info!(
                            purpose = options.purpose,
                            attempt,
                            latency_ms,
                            total_tokens,
                            "Model response received"
                        );

                        return Ok(ModelResponse {
                            text,
                            prompt_tokens,
                            completion_tokens,
                            total_tokens,
                            estimated_usage,
                            degraded: false,
                        });
                    }

                    if let Some(reason) = parsed.block_reason {
                        warn!(purpose = options.purpose, reason = %reason, "Model response blocked");
                        let entry = self
                            .entry(prompt, options, UsageStatus::Error, attempt, latency_ms)
                            .response(BLOCKED_TEXT)
                            .metadata("block_reason", json!(reason))
                            .build();
                        self.usage.log(entry).await;
                        return Err(OrchestrationError::ModelBlocked(reason));
                    }

                    AttemptFailure::Terminal(OrchestrationError::ModelError {
                        status: None,
                        message: "provider returned no text".to_string(),
                    })
                }
                Err(failure) => failure,
            };

            let (error, retryable) = match failure {
                AttemptFailure::Retryable(e) => (e, true),
                AttemptFailure::Terminal(e) => (e, false),
            };

            warn!(
                purpose = options.purpose,
                attempt,
                max_attempts,
                retryable,
                error = %error,
                "Model attempt failed"
            );

            if !retryable || attempt >= max_attempts {
                let latency_ms = started.elapsed().as_millis() as u64;
                self.log_failure(prompt, options, &error, attempt, latency_ms).await;
                return Err(error);
            }

            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
    }
}

/// USD per million tokens (prompt, completion)
fn price_per_million(model: &str) -> Option<(f64, f64)> {
    let model = model.to_lowercase();
    if model.contains("gemini-2.0-flash-lite") {
        Some((0.075, 0.30))
    } else if model.contains("gemini-2.0-flash") {
        Some((0.10, 0.40))
    } else if model.contains("gemini-1.5-flash") {
        Some((0.075, 0.30))
    } else if model.contains("gemini-1.5-pro") {
        Some((1.25, 5.00))
    } else {
        None
    }
}

pub fn estimate_cost(model: &str, prompt_tokens: u32, completion_tokens: u32) -> Option<f64> {
    let (input_price, output_price) = price_per_million(model)?;
    let input_cost = (prompt_tokens as f64 / 1_000_000.0) * input_price;
    let output_cost = (completion_tokens as f64 / 1_000_000.0) * output_price;
    Some(input_cost + output_cost)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryUsageSink;
    use serde_json::json;

    fn gateway(transport: Arc<ScriptedTransport>) -> (ModelGateway, Arc<InMemoryUsageSink>) {
        let sink = Arc::new(InMemoryUsageSink::new());
        let gateway = ModelGateway::new(
            transport,
            RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                timeout: Duration::from_millis(200),
            },
            UsageLogger::inline(sink.clone()),
        );
        (gateway, sink)
    }

    fn ok_body(text: &str) -> Value {
        json!({ "candidates": [{ "content": { "parts": [{ "text": text }] }, "finishReason": "STOP" }] })
    }

    fn options() -> GenerateOptions {
        GenerateOptions::for_purpose(purpose::GENERAL).with_context(&CallContext {
            caller_id: "alice".into(),
            correlation_id: "session-1".into(),
        })
    }

    #[tokio::test]
    async fn test_success_estimates_tokens_and_logs_once() {
        let transport = Arc::new(
            ScriptedTransport::new(vec![Ok(ok_body("Twelve chars"))]).with_model("gemini-2.0-flash"),
        );
        let (gateway, sink) = gateway(transport.clone());

        let response = gateway.try_generate("abcdefgh", &options()).await.unwrap();
        assert_eq!(response.text, "Twelve chars");
        assert!(response.estimated_usage);
        assert_eq!(response.prompt_tokens, 2);
        assert_eq!(response.completion_tokens, 3);

        let entries = sink.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, UsageStatus::Success);
        assert_eq!(entries[0].caller_id, "alice");
        assert_eq!(entries[0].correlation_id.as_deref(), Some("session-1"));
        let cost = entries[0].cost_estimate_usd.unwrap();
        assert!((cost - (2.0 * 0.10 + 3.0 * 0.40) / 1_000_000.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_unpriced_model_has_no_cost_estimate() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(ok_body("ok"))]));
        let (gateway, sink) = gateway(transport);

        gateway.try_generate("hi", &options()).await.unwrap();

        let entries = sink.entries().await;
        assert_eq!(entries[0].status, UsageStatus::Success);
        assert!(entries[0].cost_estimate_usd.is_none());
    }

    #[tokio::test]
    async fn test_retries_server_errors_then_succeeds() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(TransportError::Status { code: 503, body: "unavailable".into() }),
            Err(TransportError::Network("reset".into())),
            Ok(ok_body("recovered")),
        ]));
        let (gateway, sink) = gateway(transport.clone());

        let response = gateway.try_generate("hi", &options()).await.unwrap();
        assert_eq!(response.text, "recovered");
        assert_eq!(transport.calls(), 3);

        // one entry per terminal state, not per retry
        let entries = sink.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].metadata["attempts"], 3);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(TransportError::Status { code: 400, body: "bad request".into() }),
            Ok(ok_body("never reached")),
        ]));
        let (gateway, sink) = gateway(transport.clone());

        let error = gateway.try_generate("hi", &options()).await.unwrap_err();
        assert!(matches!(error, OrchestrationError::ModelError { status: Some(400), .. }));
        assert_eq!(transport.calls(), 1);
        assert_eq!(sink.entries().await[0].status, UsageStatus::Error);
    }

    #[tokio::test]
    async fn test_rate_limited_exhausts_attempts_and_falls_back() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(TransportError::Status { code: 429, body: "quota".into() }),
            Err(TransportError::Status { code: 429, body: "quota".into() }),
            Err(TransportError::Status { code: 429, body: "quota".into() }),
        ]));
        let (gateway, sink) = gateway(transport.clone());

        let response = gateway.generate("hi", &options()).await;
        assert_eq!(response.text, APOLOGY_TEXT);
        assert!(response.degraded);
        assert_eq!(transport.calls(), 3);

        let entries = sink.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, UsageStatus::RateLimited);
    }

    #[tokio::test]
    async fn test_timeout_is_retried_and_logged_as_timeout() {
        let transport = Arc::new(
            ScriptedTransport::new(vec![Ok(ok_body("slow")), Ok(ok_body("slow")), Ok(ok_body("slow"))])
                .with_delay(Duration::from_millis(500)),
        );
        let (gateway, sink) = gateway(transport.clone());

        let error = gateway.try_generate("hi", &options()).await.unwrap_err();
        assert!(matches!(error, OrchestrationError::ModelTimeout(_)));
        assert_eq!(transport.calls(), 3);
        assert_eq!(sink.entries().await[0].status, UsageStatus::Timeout);
    }

    #[tokio::test]
    async fn test_safety_block_returns_rephrase_message() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(json!({
            "promptFeedback": { "blockReason": "SAFETY" }
        }))]));
        let (gateway, sink) = gateway(transport.clone());

        let response = gateway.generate("something", &options()).await;
        assert_eq!(response.text, BLOCKED_TEXT);

        let entries = sink.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, UsageStatus::Error);
        assert_eq!(entries[0].metadata["block_reason"], "SAFETY");
    }

    #[test]
    fn test_cost_estimate() {
        let cost = estimate_cost("gemini-2.0-flash", 1_000_000, 1_000_000).unwrap();
        assert!((cost - 0.50).abs() < 1e-9);
        assert!(estimate_cost("unknown-model", 10, 10).is_none());
    }
}
