//! Core data models for the request pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

//
// ================= Enums =================
//

/// How likely an input is an attempt to subvert system behavior.
/// Ordered none < low < medium < high.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    #[default]
    None,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    Strict,
    #[default]
    Standard,
    Relaxed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExperienceLevel {
    #[default]
    Beginner,
    Intermediate,
    Advanced,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Receipt,
    Document,
    Chart,
    Table,
    Handwriting,
    #[default]
    Unknown,
}

/// Transport shape the input arrived in
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InputFormat {
    Text,
    Url,
    DataUri,
    File,
    Buffer,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UsageStatus {
    Success,
    Error,
    RateLimited,
    Timeout,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Failed,
    Skipped,
}

//
// ================= Request =================
//

/// Raw user input as handed over by the transport layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RequestInput {
    Text(String),
    Url(String),
    DataUri(String),
    File {
        filename: Option<String>,
        mime_type: Option<String>,
        bytes: Vec<u8>,
    },
    Buffer(Vec<u8>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserState {
    #[serde(default)]
    pub has_wallets: bool,
    #[serde(default)]
    pub has_transactions: bool,
    #[serde(default)]
    pub has_budgets: bool,
    #[serde(default)]
    pub has_categories: bool,
    #[serde(default = "default_currency")]
    pub default_currency: String,
    #[serde(default)]
    pub experience_level: ExperienceLevel,
}

fn default_currency() -> String {
    "USD".to_string()
}

impl Default for UserState {
    fn default() -> Self {
        Self {
            has_wallets: false,
            has_transactions: false,
            has_budgets: false,
            has_categories: false,
            default_currency: default_currency(),
            experience_level: ExperienceLevel::Beginner,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestOptions {
    #[serde(default = "default_true")]
    pub include_confidence: bool,
    #[serde(default = "default_true")]
    pub enable_knowledge: bool,
    #[serde(default)]
    pub security_level: SecurityLevel,
    #[serde(default = "default_max_tools")]
    pub max_tools: usize,
    #[serde(default = "default_true")]
    pub extract_structured: bool,
}

fn default_true() -> bool {
    true
}

fn default_max_tools() -> usize {
    3
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            include_confidence: true,
            enable_knowledge: true,
            security_level: SecurityLevel::Standard,
            max_tools: default_max_tools(),
            extract_structured: true,
        }
    }
}

/// A prior conversation turn supplied by the transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: String,
    pub content: String,
}

/// One user message entering the pipeline. Built once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub request_id: Uuid,
    pub caller_id: String,
    pub session_id: Option<String>,
    pub input: RequestInput,
    pub user_state: UserState,
    pub options: RequestOptions,
    #[serde(default)]
    pub history: Vec<HistoryTurn>,
    pub received_at: DateTime<Utc>,
}

impl Request {
    pub fn new(caller_id: impl Into<String>, input: RequestInput) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            caller_id: caller_id.into(),
            session_id: None,
            input,
            user_state: UserState::default(),
            options: RequestOptions::default(),
            history: Vec::new(),
            received_at: Utc::now(),
        }
    }

    pub fn text(caller_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(caller_id, RequestInput::Text(text.into()))
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_user_state(mut self, user_state: UserState) -> Self {
        self.user_state = user_state;
        self
    }

    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_history(mut self, history: Vec<HistoryTurn>) -> Self {
        self.history = history;
        self
    }

    /// Correlation id used on every usage entry this request produces
    pub fn correlation_id(&self) -> String {
        self.session_id
            .clone()
            .unwrap_or_else(|| self.request_id.to_string())
    }

    pub fn call_context(&self) -> CallContext {
        CallContext {
            caller_id: self.caller_id.clone(),
            correlation_id: self.correlation_id(),
        }
    }
}

/// Identity attached to model calls for usage accounting
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallContext {
    pub caller_id: String,
    pub correlation_id: String,
}

//
// ================= Security =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecurityVerdict {
    pub safe: bool,
    pub threat_level: ThreatLevel,
    pub detected_patterns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sanitized_input: Option<String>,
    pub reasoning: String,
}

impl SecurityVerdict {
    /// Build a verdict whose `safe` flag is derived from the threat level
    pub fn from_level(
        threat_level: ThreatLevel,
        detected_patterns: Vec<String>,
        reasoning: impl Into<String>,
    ) -> Self {
        Self {
            safe: threat_level <= ThreatLevel::Low,
            threat_level,
            detected_patterns,
            sanitized_input: None,
            reasoning: reasoning.into(),
        }
    }

    pub fn clean() -> Self {
        Self::from_level(ThreatLevel::None, Vec::new(), "No threats detected")
    }
}

//
// ================= Normalized input =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReceiptItem {
    pub description: String,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub quantity: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReceiptData {
    #[serde(default)]
    pub merchant: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub total: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub items: Vec<ReceiptItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentData {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub key_values: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableData {
    #[serde(default)]
    pub headers: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<Value>>,
}

/// Structured payload typed per content classification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StructuredPayload {
    Receipt(ReceiptData),
    Document(DocumentData),
    Table(TableData),
    Raw { data: Value },
    ExtractionFailed { error: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizedInput {
    pub text: String,
    pub content_type: ContentType,
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured: Option<StructuredPayload>,
    pub original_format: InputFormat,
}

//
// ================= Tools =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }

    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.arguments.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionStep {
    pub sequence: usize,
    pub call: ToolCall,
    pub depends_on: BTreeSet<usize>,
    pub optional: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSelectionResult {
    pub selected_tools: Vec<ToolCall>,
    pub execution_plan: Vec<ExecutionStep>,
    pub reasoning: String,
    pub confidence: f32,
}

impl ToolSelectionResult {
    pub fn empty(reasoning: impl Into<String>, confidence: f32) -> Self {
        Self {
            selected_tools: Vec::new(),
            execution_plan: Vec::new(),
            reasoning: reasoning.into(),
            confidence,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.selected_tools.is_empty()
    }
}

/// Outcome of one executed tool call. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(data: Value, message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: Some(message.into()),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message.into()),
            error: Some(error.into()),
        }
    }
}

/// A tool result together with the step that produced it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub sequence: usize,
    pub tool_name: String,
    pub arguments: Map<String, Value>,
    pub result: ToolResult,
    pub status: ExecutionStatus,
    pub execution_time_ms: u64,
}

//
// ================= Confidence =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfidenceFactors {
    pub data_availability: u8,
    pub context_relevance: u8,
    pub completeness: u8,
    pub accuracy: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfidenceScore {
    pub overall: u8,
    pub factors: ConfidenceFactors,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

//
// ================= Usage log =================
//

/// One audit record per terminal model-call or pipeline outcome. Write-once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLogEntry {
    pub entry_id: Uuid,
    pub caller_id: String,
    pub provider: String,
    pub model: String,
    pub prompt: String,
    pub response: Option<String>,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
    pub cost_estimate_usd: Option<f64>,
    pub status: UsageStatus,
    pub latency_ms: u64,
    pub correlation_id: Option<String>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

//
// ================= Final Result =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineOutcome {
    Answered,
    SecurityBlocked,
    RateLimited,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecurityBlock {
    pub safe: bool,
    pub threat_level: ThreatLevel,
    pub detected_patterns: Vec<String>,
    pub blocked: bool,
}

impl SecurityBlock {
    pub fn from_verdict(verdict: &SecurityVerdict, blocked: bool) -> Self {
        Self {
            safe: verdict.safe,
            threat_level: verdict.threat_level,
            detected_patterns: verdict.detected_patterns.clone(),
            blocked,
        }
    }

    pub fn unchecked() -> Self {
        Self {
            safe: true,
            threat_level: ThreatLevel::None,
            detected_patterns: Vec::new(),
            blocked: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProcessingTrace {
    pub stages: Vec<String>,
    pub tools_used: Vec<String>,
    pub knowledge_snippets: usize,
    pub total_latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub request_id: Uuid,
    pub outcome: PipelineOutcome,
    pub answer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<ConfidenceScore>,
    pub security: SecurityBlock,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<ContentType>,
    pub trace: ProcessingTrace,
}

//
// ================= Ordering & Display =================
//

impl ThreatLevel {
    fn rank(&self) -> u8 {
        match self {
            ThreatLevel::None => 0,
            ThreatLevel::Low => 1,
            ThreatLevel::Medium => 2,
            ThreatLevel::High => 3,
        }
    }

    pub fn parse_lenient(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "none" | "safe" => Some(ThreatLevel::None),
            "low" => Some(ThreatLevel::Low),
            "medium" | "moderate" => Some(ThreatLevel::Medium),
            "high" | "critical" => Some(ThreatLevel::High),
            _ => None,
        }
    }
}

impl PartialOrd for ThreatLevel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ThreatLevel {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ThreatLevel::None => "none",
            ThreatLevel::Low => "low",
            ThreatLevel::Medium => "medium",
            ThreatLevel::High => "high",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContentType::Receipt => "receipt",
            ContentType::Document => "document",
            ContentType::Chart => "chart",
            ContentType::Table => "table",
            ContentType::Handwriting => "handwriting",
            ContentType::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for ExperienceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExperienceLevel::Beginner => "beginner",
            ExperienceLevel::Intermediate => "intermediate",
            ExperienceLevel::Advanced => "advanced",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threat_level_ordering() {
        assert!(ThreatLevel::None < ThreatLevel::Low);
        assert!(ThreatLevel::Low < ThreatLevel::Medium);
        assert!(ThreatLevel::Medium < ThreatLevel::High);
        assert_eq!(
            std::cmp::max(ThreatLevel::Medium, ThreatLevel::High),
            ThreatLevel::High
        );
    }

    #[test]
    fn test_verdict_safe_follows_level() {
        assert!(SecurityVerdict::from_level(ThreatLevel::Low, vec![], "").safe);
        assert!(!SecurityVerdict::from_level(ThreatLevel::Medium, vec![], "").safe);
        assert!(SecurityVerdict::clean().detected_patterns.is_empty());
    }

    #[test]
    fn test_request_options_defaults_from_partial_json() {
        let options: RequestOptions = serde_json::from_str(r#"{"max_tools": 5}"#).unwrap();
        assert_eq!(options.max_tools, 5);
        assert!(options.include_confidence);
        assert_eq!(options.security_level, SecurityLevel::Standard);

        let state: UserState = serde_json::from_str(r#"{"has_wallets": true}"#).unwrap();
        assert_eq!(state.default_currency, "USD");
    }
}
