//! Error types for the request pipeline

use crate::extract::ExtractionError;
use crate::models::UsageStatus;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Security
    // =============================

    #[error("Security blocked: {0}")]
    SecurityBlocked(String),

    // =============================
    // Model Gateway
    // =============================

    #[error("Model call timed out after {0} ms")]
    ModelTimeout(u64),

    #[error("Model rate limited: {0}")]
    ModelRateLimited(String),

    #[error("Model error (status {status:?}): {message}")]
    ModelError {
        status: Option<u16>,
        message: String,
    },

    #[error("Model response blocked: {0}")]
    ModelBlocked(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    // =============================
    // Tools
    // =============================

    #[error("Missing required argument '{argument}' for {tool}")]
    ToolValidationError {
        tool: String,
        argument: String,
    },

    #[error("Tool execution error: {0}")]
    ToolExecutionError(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Record store error: {0}")]
    RecordStoreError(String),

    // =============================
    // Infrastructure
    // =============================

    #[error("Usage sink error: {0}")]
    UsageSinkError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl OrchestrationError {
    /// Whether a model call that failed this way is worth another attempt.
    /// 429, 5xx, network failures and timeouts are transient; other 4xx are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            OrchestrationError::ModelTimeout(_) | OrchestrationError::ModelRateLimited(_) => true,
            OrchestrationError::ModelError { status, .. } => match status {
                None => true,
                Some(code) => *code >= 500,
            },
            OrchestrationError::HttpError(e) => !e.is_builder() && !e.is_status(),
            _ => false,
        }
    }

    /// Status recorded in the usage log for a terminal model failure
    pub fn usage_status(&self) -> UsageStatus {
        match self {
            OrchestrationError::ModelTimeout(_) => UsageStatus::Timeout,
            OrchestrationError::ModelRateLimited(_) => UsageStatus::RateLimited,
            _ => UsageStatus::Error,
        }
    }
}

impl From<ExtractionError> for OrchestrationError {
    fn from(err: ExtractionError) -> Self {
        OrchestrationError::ParseError(err.to_string())
    }
}
