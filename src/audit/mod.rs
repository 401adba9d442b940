//! Usage logging for audit and cost tracking
//!
//! Every terminal model-call outcome and every completed pipeline run
//! produces exactly one `UsageLogEntry`. Sinks are append-only; a sink
//! failure is logged locally and never reaches the caller.

use crate::models::{UsageLogEntry, UsageStatus};
use crate::Result;
use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Destination for usage entries
#[async_trait::async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, entry: UsageLogEntry) -> Result<()>;
}

/// In-memory sink for development and tests
pub struct InMemoryUsageSink {
    entries: Arc<RwLock<Vec<UsageLogEntry>>>,
}

impl InMemoryUsageSink {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn entries(&self) -> Vec<UsageLogEntry> {
        self.entries.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Entries for a caller, oldest first
    pub async fn for_caller(&self, caller_id: &str) -> Vec<UsageLogEntry> {
        let entries = self.entries.read().await;
        let mut items: Vec<_> = entries
            .iter()
            .filter(|entry| entry.caller_id == caller_id)
            .cloned()
            .collect();
        items.sort_by_key(|entry| entry.created_at);
        items
    }
}

impl Default for InMemoryUsageSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl UsageSink for InMemoryUsageSink {
    async fn record(&self, entry: UsageLogEntry) -> Result<()> {
        self.entries.write().await.push(entry);
        Ok(())
    }
}

/// Sink that only emits a structured tracing event per entry
pub struct TracingUsageSink;

#[async_trait::async_trait]
impl UsageSink for TracingUsageSink {
    async fn record(&self, entry: UsageLogEntry) -> Result<()> {
        info!(
            caller_id = %entry.caller_id,
            model = %entry.model,
            status = ?entry.status,
            latency_ms = entry.latency_ms,
            total_tokens = ?entry.total_tokens,
            cost_usd = ?entry.cost_estimate_usd,
            "usage"
        );
        Ok(())
    }
}

/// Postgres-backed sink (table `ai_usage_logs`, created on first write)
pub struct PostgresUsageSink {
    pool: PgPool,
    schema_ready: OnceCell<()>,
}

impl PostgresUsageSink {
    /// Lazily connecting pool; no connection is opened until the first write
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)?;

        Ok(Self {
            pool,
            schema_ready: OnceCell::new(),
        })
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS ai_usage_logs (
                      entry_id UUID PRIMARY KEY,
                      caller_id TEXT NOT NULL,
                      provider TEXT NOT NULL,
                      model TEXT NOT NULL,
                      prompt TEXT NOT NULL,
                      response TEXT,
                      prompt_tokens INTEGER,
                      completion_tokens INTEGER,
                      total_tokens INTEGER,
                      cost_estimate_usd DOUBLE PRECISION,
                      status TEXT NOT NULL,
                      latency_ms BIGINT NOT NULL,
                      correlation_id TEXT,
                      metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_ai_usage_logs_caller_time
                    ON ai_usage_logs (caller_id, created_at);
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl UsageSink for PostgresUsageSink {
    async fn record(&self, entry: UsageLogEntry) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            INSERT INTO ai_usage_logs
              (entry_id, caller_id, provider, model, prompt, response, prompt_tokens,
               completion_tokens, total_tokens, cost_estimate_usd, status, latency_ms,
               correlation_id, metadata, created_at)
            VALUES
              ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(entry.entry_id)
        .bind(&entry.caller_id)
        .bind(&entry.provider)
        .bind(&entry.model)
        .bind(&entry.prompt)
        .bind(&entry.response)
        .bind(entry.prompt_tokens.map(|t| t as i32))
        .bind(entry.completion_tokens.map(|t| t as i32))
        .bind(entry.total_tokens.map(|t| t as i32))
        .bind(entry.cost_estimate_usd)
        .bind(status_to_db(entry.status))
        .bind(entry.latency_ms as i64)
        .bind(&entry.correlation_id)
        .bind(sqlx::types::Json(&entry.metadata))
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn status_to_db(status: UsageStatus) -> &'static str {
    match status {
        UsageStatus::Success => "success",
        UsageStatus::Error => "error",
        UsageStatus::RateLimited => "rate_limited",
        UsageStatus::Timeout => "timeout",
    }
}

/// Front for a `UsageSink`. In detached mode each write runs on its own
/// task so the pipeline's return path never waits on the sink.
#[derive(Clone)]
pub struct UsageLogger {
    sink: Arc<dyn UsageSink>,
    detached: bool,
}

impl UsageLogger {
    pub fn new(sink: Arc<dyn UsageSink>) -> Self {
        Self {
            sink,
            detached: true,
        }
    }

    /// Awaits each write; used where tests need to observe entries immediately
    pub fn inline(sink: Arc<dyn UsageSink>) -> Self {
        Self {
            sink,
            detached: false,
        }
    }

    pub async fn log(&self, entry: UsageLogEntry) {
        debug!(
            entry_id = %entry.entry_id,
            status = ?entry.status,
            "Recording usage entry"
        );

        if self.detached {
            let sink = self.sink.clone();
            tokio::spawn(async move {
                if let Err(e) = sink.record(entry).await {
                    warn!(error = %e, "Usage sink write failed");
                }
            });
        } else if let Err(e) = self.sink.record(entry).await {
            warn!(error = %e, "Usage sink write failed");
        }
    }
}

/// Builder for usage entries; fills ids and timestamps
pub struct UsageEntryBuilder {
    entry: UsageLogEntry,
}

impl UsageEntryBuilder {
    pub fn new(
        caller_id: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
        prompt: impl Into<String>,
        status: UsageStatus,
    ) -> Self {
        Self {
            entry: UsageLogEntry {
                entry_id: Uuid::new_v4(),
                caller_id: caller_id.into(),
                provider: provider.into(),
                model: model.into(),
                prompt: prompt.into(),
                response: None,
                prompt_tokens: None,
                completion_tokens: None,
                total_tokens: None,
                cost_estimate_usd: None,
                status,
                latency_ms: 0,
                correlation_id: None,
                metadata: Value::Object(Default::default()),
                created_at: Utc::now(),
            },
        }
    }

    pub fn response(mut self, response: impl Into<String>) -> Self {
        self.entry.response = Some(response.into());
        self
    }

    pub fn tokens(mut self, prompt: u32, completion: u32, total: u32) -> Self {
        self.entry.prompt_tokens = Some(prompt);
        self.entry.completion_tokens = Some(completion);
        self.entry.total_tokens = Some(total);
        self
    }

    pub fn cost(mut self, cost_usd: Option<f64>) -> Self {
        self.entry.cost_estimate_usd = cost_usd;
        self
    }

    pub fn latency_ms(mut self, latency_ms: u64) -> Self {
        self.entry.latency_ms = latency_ms;
        self
    }

    pub fn correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.entry.correlation_id = correlation_id;
        self
    }

    pub fn metadata(mut self, key: &str, value: Value) -> Self {
        if let Value::Object(map) = &mut self.entry.metadata {
            map.insert(key.to_string(), value);
        }
        self
    }

    pub fn build(self) -> UsageLogEntry {
        self.entry
    }
}

/// SHA-256 hex digest of a prompt, stored in entry metadata for deduplication
pub fn prompt_digest(prompt: &str) -> String {
    hex::encode(Sha256::digest(prompt.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrchestrationError;

    struct FailingSink;

    #[async_trait::async_trait]
    impl UsageSink for FailingSink {
        async fn record(&self, _entry: UsageLogEntry) -> Result<()> {
            Err(OrchestrationError::UsageSinkError("disk full".into()))
        }
    }

    fn entry(caller: &str, status: UsageStatus) -> UsageLogEntry {
        UsageEntryBuilder::new(caller, "gemini", "gemini-2.0-flash", "prompt", status)
            .response("answer")
            .tokens(10, 5, 15)
            .latency_ms(42)
            .metadata("purpose", Value::String("test".into()))
            .build()
    }

    #[tokio::test]
    async fn test_inline_logger_records_entries() {
        let sink = Arc::new(InMemoryUsageSink::new());
        let logger = UsageLogger::inline(sink.clone());

        logger.log(entry("alice", UsageStatus::Success)).await;
        logger.log(entry("bob", UsageStatus::Timeout)).await;
        logger.log(entry("alice", UsageStatus::Error)).await;

        assert_eq!(sink.len().await, 3);
        let alice = sink.for_caller("alice").await;
        assert_eq!(alice.len(), 2);
        assert_eq!(alice[0].metadata["purpose"], "test");
        assert_eq!(alice[0].total_tokens, Some(15));
    }

    #[tokio::test]
    async fn test_sink_failure_is_swallowed() {
        let logger = UsageLogger::inline(Arc::new(FailingSink));
        logger.log(entry("alice", UsageStatus::Success)).await;

        let detached = UsageLogger::new(Arc::new(FailingSink));
        detached.log(entry("alice", UsageStatus::Success)).await;
    }

    #[tokio::test]
    async fn test_detached_logger_eventually_records() {
        let sink = Arc::new(InMemoryUsageSink::new());
        let logger = UsageLogger::new(sink.clone());

        logger.log(entry("alice", UsageStatus::Success)).await;

        for _ in 0..10 {
            if !sink.is_empty().await {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(sink.len().await, 1);
    }

    #[test]
    fn test_prompt_digest_is_stable() {
        let a = prompt_digest("show my transactions");
        let b = prompt_digest("show my transactions");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, prompt_digest("show my wallets"));
    }
}
