//! Configuration management

use crate::gateway::gemini::{DEFAULT_BASE_URL, DEFAULT_MODEL};
use crate::gateway::RetryPolicy;
use crate::rate_limit::RateLimitConfig;
use crate::security::SecurityConfig;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Gemini API key; without it binaries fall back to scripted replies
    pub gemini_api_key: Option<String>,

    pub gemini_model: String,

    pub gemini_base_url: String,

    pub model_timeout_secs: u64,

    pub model_max_attempts: u32,

    pub model_initial_backoff_ms: u64,

    pub rate_limit_per_caller: u32,

    pub rate_limit_global: u32,

    pub rate_limit_window_secs: i64,

    /// Inputs longer than this always get model-assisted screening
    pub security_ai_length_threshold: usize,

    /// max_tools applied when a request carries no options
    pub default_max_tools: usize,

    /// Postgres URL for the usage sink (optional)
    pub database_url: Option<String>,

    /// Financial records API (optional; in-memory store otherwise)
    pub financial_api_base_url: Option<String>,

    pub port: u16,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            gemini_api_key: None,
            gemini_model: DEFAULT_MODEL.to_string(),
            gemini_base_url: DEFAULT_BASE_URL.to_string(),
            model_timeout_secs: 12,
            model_max_attempts: 3,
            model_initial_backoff_ms: 500,
            rate_limit_per_caller: 20,
            rate_limit_global: 1000,
            rate_limit_window_secs: 60,
            security_ai_length_threshold: 500,
            default_max_tools: 3,
            database_url: None,
            financial_api_base_url: None,
            port: 8080,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let text = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        Self {
            gemini_api_key: text("GEMINI_API_KEY"),
            gemini_model: text("GEMINI_MODEL").unwrap_or(defaults.gemini_model),
            gemini_base_url: text("GEMINI_BASE_URL").unwrap_or(defaults.gemini_base_url),
            model_timeout_secs: parsed(&text, "MODEL_TIMEOUT_SECS", defaults.model_timeout_secs),
            model_max_attempts: parsed(&text, "MODEL_MAX_ATTEMPTS", defaults.model_max_attempts),
            model_initial_backoff_ms: parsed(
                &text,
                "MODEL_INITIAL_BACKOFF_MS",
                defaults.model_initial_backoff_ms,
            ),
            rate_limit_per_caller: parsed(&text, "RATE_LIMIT_PER_CALLER", defaults.rate_limit_per_caller),
            rate_limit_global: parsed(&text, "RATE_LIMIT_GLOBAL", defaults.rate_limit_global),
            rate_limit_window_secs: parsed(&text, "RATE_LIMIT_WINDOW_SECS", defaults.rate_limit_window_secs),
            security_ai_length_threshold: parsed(
                &text,
                "SECURITY_AI_LENGTH_THRESHOLD",
                defaults.security_ai_length_threshold,
            ),
            default_max_tools: parsed(&text, "DEFAULT_MAX_TOOLS", defaults.default_max_tools),
            database_url: text("DATABASE_URL").or_else(|| text("POSTGRES_URL")),
            financial_api_base_url: text("FINANCIAL_API_BASE_URL"),
            port: match text("PORT").or_else(|| text("API_PORT")) {
                Some(value) => parse_or_default("PORT", &value, defaults.port),
                None => defaults.port,
            },
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.model_max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.model_initial_backoff_ms),
            timeout: Duration::from_secs(self.model_timeout_secs.max(1)),
        }
    }

    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            per_caller_max: self.rate_limit_per_caller,
            global_max: self.rate_limit_global,
            window: chrono::Duration::seconds(self.rate_limit_window_secs.max(1)),
        }
    }

    pub fn security(&self) -> SecurityConfig {
        SecurityConfig {
            ai_length_threshold: self.security_ai_length_threshold,
        }
    }
}

fn parsed<T, F>(text: &F, name: &str, default: T) -> T
where
    T: FromStr + Copy,
    F: Fn(&str) -> Option<String>,
{
    match text(name) {
        Some(value) => parse_or_default(name, &value, default),
        None => default,
    }
}

fn parse_or_default<T: FromStr>(name: &str, value: &str, default: T) -> T {
    value.parse().unwrap_or_else(|_| {
        warn!(variable = name, value, "Unparseable configuration value, using default");
        default
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> PipelineConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PipelineConfig::from_lookup(move |name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = config(&[]);
        assert!(config.gemini_api_key.is_none());
        assert_eq!(config.gemini_model, "gemini-2.0-flash");
        assert_eq!(config.port, 8080);
        assert_eq!(config.retry_policy().max_attempts, 3);
        assert_eq!(config.rate_limit().per_caller_max, 20);
        assert_eq!(config.security().ai_length_threshold, 500);
    }

    #[test]
    fn test_overrides_and_bad_values() {
        let config = config(&[
            ("GEMINI_API_KEY", "key"),
            ("RATE_LIMIT_PER_CALLER", "5"),
            ("MODEL_TIMEOUT_SECS", "soon"),
            ("POSTGRES_URL", "postgres://localhost/usage"),
            ("API_PORT", "9090"),
            ("FINANCIAL_API_BASE_URL", "  "),
        ]);

        assert_eq!(config.gemini_api_key.as_deref(), Some("key"));
        assert_eq!(config.rate_limit_per_caller, 5);
        assert_eq!(config.model_timeout_secs, 12);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/usage"));
        assert_eq!(config.port, 9090);
        assert!(config.financial_api_base_url.is_none());
    }
}
