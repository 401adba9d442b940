//! Scripted model doubles for development and testing
//!
//! Keeps the pipeline runnable without a provider key.

use super::{GenerateOptions, LanguageModel, ModelResponse, ModelTransport, TransportError, TransportRequest};
use super::response::estimate_tokens;
use crate::error::OrchestrationError;
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Transport that replays a fixed queue of provider outcomes
pub struct ScriptedTransport {
    script: Mutex<VecDeque<std::result::Result<Value, TransportError>>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
    model: String,
}

impl ScriptedTransport {
    pub fn new(script: Vec<std::result::Result<Value, TransportError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            delay: None,
            model: "scripted-model".to_string(),
        }
    }

    /// Report a provider model name, e.g. to exercise cost estimation
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Delay every reply, e.g. to exercise the gateway timeout
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelTransport for ScriptedTransport {
    fn provider(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn send(&self, _request: &TransportRequest) -> std::result::Result<Value, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Network("script exhausted".to_string())))
    }
}

type Responder = dyn Fn(&str, &GenerateOptions) -> Result<String> + Send + Sync;

/// Recorded model invocation
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub purpose: &'static str,
    pub prompt: String,
    pub had_image: bool,
}

/// `LanguageModel` whose replies come from a closure, with call recording
pub struct ScriptedModel {
    responder: Box<Responder>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedModel {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&str, &GenerateOptions) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Same reply for every call
    pub fn replying(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(move |_, _| Ok(text.clone()))
    }

    /// Every call fails as if the provider were down
    pub fn failing() -> Self {
        Self::new(|_, _| {
            Err(OrchestrationError::ModelError {
                status: Some(503),
                message: "scripted outage".to_string(),
            })
        })
    }

    /// Reply by purpose tag; purposes without an entry fail
    pub fn by_purpose(replies: HashMap<&'static str, String>) -> Self {
        Self::new(move |_, options| {
            replies.get(options.purpose).cloned().ok_or_else(|| OrchestrationError::ModelError {
                status: Some(503),
                message: format!("no scripted reply for {}", options.purpose),
            })
        })
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn calls_for(&self, purpose: &str) -> usize {
        self.calls().iter().filter(|call| call.purpose == purpose).count()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn try_generate(&self, prompt: &str, options: &GenerateOptions) -> Result<ModelResponse> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedCall {
                purpose: options.purpose,
                prompt: prompt.to_string(),
                had_image: options.image.is_some(),
            });

        let text = (self.responder)(prompt, options)?;
        let prompt_tokens = estimate_tokens(prompt);
        let completion_tokens = estimate_tokens(&text);

        Ok(ModelResponse {
            text,
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            estimated_usage: true,
            degraded: false,
        })
    }
}

/// Canned replies per purpose so the binaries run without a provider key
pub fn demo_model() -> ScriptedModel {
    let mut replies = HashMap::new();
    replies.insert(
        super::purpose::SECURITY_ANALYSIS,
        r#"{"safe": true, "threat_level": "none", "reasoning": "demo mode", "suspicious_elements": []}"#.to_string(),
    );
    replies.insert(
        super::purpose::COMPLEXITY_ANALYSIS,
        r#"{"complexity": "simple", "intents": ["record expense"], "required_tools": ["create_transaction"]}"#.to_string(),
    );
    replies.insert(
        super::purpose::TOOL_SELECTION,
        r#"{"tools": [{"name": "create_transaction", "arguments": {"amount": 12.5, "type": "expense", "category": "food", "description": "lunch"}}], "reasoning": "Log the lunch expense", "confidence": 0.85}"#.to_string(),
    );
    replies.insert(
        super::purpose::SYNTHESIS_TOOLS,
        "I've recorded your 12.50 lunch expense under food. Keeping food spending in a budget makes it easier to track.".to_string(),
    );
    replies.insert(
        super::purpose::SYNTHESIS_GENERAL,
        "A simple starting point is the 50/30/20 rule: needs, wants, then savings.".to_string(),
    );
    replies.insert(super::purpose::RELEVANCE_RATING, r#"{"rating": 85}"#.to_string());
    ScriptedModel::by_purpose(replies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{purpose, APOLOGY_TEXT};

    #[tokio::test]
    async fn test_scripted_model_routes_by_purpose() {
        let mut replies = HashMap::new();
        replies.insert(purpose::RELEVANCE_RATING, "{\"rating\": 90}".to_string());
        let model = ScriptedModel::by_purpose(replies);

        let rated = model
            .try_generate("rate", &GenerateOptions::for_purpose(purpose::RELEVANCE_RATING))
            .await
            .unwrap();
        assert_eq!(rated.text, "{\"rating\": 90}");

        let fallback = model
            .generate("other", &GenerateOptions::for_purpose(purpose::GENERAL))
            .await;
        assert_eq!(fallback.text, APOLOGY_TEXT);
        assert_eq!(model.calls().len(), 2);
        assert_eq!(model.calls_for(purpose::RELEVANCE_RATING), 1);
    }
}
