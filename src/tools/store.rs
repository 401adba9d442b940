//! Record store collaborator
//!
//! Per-resource create/list/update keyed by caller identity.
//! `HttpRecordStore` talks to the financial API service;
//! `InMemoryRecordStore` backs development and tests.

use super::catalog::ResourceKind;
use crate::error::OrchestrationError;
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Url};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Filters applied when listing records
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub limit: Option<usize>,
    /// Exact-match field filters, e.g. `{"category": "food"}`
    pub fields: Map<String, Value>,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create(&self, caller_id: &str, kind: ResourceKind, record: Map<String, Value>) -> Result<Value>;

    async fn list(&self, caller_id: &str, kind: ResourceKind, filter: &ListFilter) -> Result<Vec<Value>>;

    /// Update the record whose id or name matches `reference`
    async fn update(
        &self,
        caller_id: &str,
        kind: ResourceKind,
        reference: &str,
        changes: Map<String, Value>,
    ) -> Result<Value>;
}

//
// ================= In-memory =================
//

#[derive(Default)]
pub struct InMemoryRecordStore {
    records: RwLock<HashMap<(String, ResourceKind), Vec<Value>>>,
    failing: RwLock<HashSet<ResourceKind>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation on `kind` fail, to exercise partial failures
    pub async fn fail_on(&self, kind: ResourceKind) {
        self.failing.write().await.insert(kind);
    }

    pub async fn count(&self, caller_id: &str, kind: ResourceKind) -> usize {
        self.records
            .read()
            .await
            .get(&(caller_id.to_string(), kind))
            .map(Vec::len)
            .unwrap_or(0)
    }

    async fn check_available(&self, kind: ResourceKind) -> Result<()> {
        if self.failing.read().await.contains(&kind) {
            return Err(OrchestrationError::RecordStoreError(format!(
                "{} store unavailable",
                kind.plural()
            )));
        }
        Ok(())
    }
}

fn matches_reference(record: &Value, reference: &str) -> bool {
    let field_matches = |key: &str| {
        record
            .get(key)
            .and_then(Value::as_str)
            .map(|value| value.eq_ignore_ascii_case(reference))
            .unwrap_or(false)
    };
    field_matches("id") || field_matches("name")
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn create(&self, caller_id: &str, kind: ResourceKind, record: Map<String, Value>) -> Result<Value> {
        self.check_available(kind).await?;

        let mut record = record;
        record.insert("id".to_string(), json!(Uuid::new_v4().to_string()));
        record.insert("created_at".to_string(), json!(Utc::now().to_rfc3339()));
        let record = Value::Object(record);

        self.records
            .write()
            .await
            .entry((caller_id.to_string(), kind))
            .or_default()
            .push(record.clone());

        debug!(caller_id, resource = %kind, "Record created");
        Ok(record)
    }

    async fn list(&self, caller_id: &str, kind: ResourceKind, filter: &ListFilter) -> Result<Vec<Value>> {
        self.check_available(kind).await?;

        let records = self.records.read().await;
        let items = records
            .get(&(caller_id.to_string(), kind))
            .map(|items| items.as_slice())
            .unwrap_or(&[]);

        // newest first
        let matched = items
            .iter()
            .rev()
            .filter(|record| {
                filter
                    .fields
                    .iter()
                    .all(|(key, expected)| record.get(key) == Some(expected))
            })
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();

        Ok(matched)
    }

    async fn update(
        &self,
        caller_id: &str,
        kind: ResourceKind,
        reference: &str,
        changes: Map<String, Value>,
    ) -> Result<Value> {
        self.check_available(kind).await?;

        let mut records = self.records.write().await;
        let items = records
            .get_mut(&(caller_id.to_string(), kind))
            .filter(|items| !items.is_empty())
            .ok_or_else(|| {
                OrchestrationError::RecordStoreError(format!("no {} to update", kind.plural()))
            })?;

        // "main" resolves to the first record when nothing carries that name
        let index = match items.iter().position(|record| matches_reference(record, reference)) {
            Some(index) => index,
            None if reference.eq_ignore_ascii_case("main") => 0,
            None => {
                return Err(OrchestrationError::RecordStoreError(format!(
                    "{} '{}' not found",
                    kind, reference
                )))
            }
        };

        let record = &mut items[index];
        if let Value::Object(fields) = &mut *record {
            for (key, value) in changes {
                if key != "id" {
                    fields.insert(key, value);
                }
            }
            fields.insert("updated_at".to_string(), json!(Utc::now().to_rfc3339()));
        }

        Ok(record.clone())
    }
}

//
// ================= HTTP =================
//

/// JSON client for the financial API service
#[derive(Clone)]
pub struct HttpRecordStore {
    client: Client,
    base_url: String,
}

impl HttpRecordStore {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn collection_url(&self, kind: ResourceKind) -> String {
        format!("{}/api/v1/{}", self.base_url, kind.plural())
    }

    async fn send(&self, request: reqwest::RequestBuilder, path: &str) -> Result<Value> {
        let response = request
            .header("Content-Type", "application/json")
            .send()
            .await
            .map_err(|e| {
                OrchestrationError::RecordStoreError(format!(
                    "Financial API request failed for {}: {}",
                    path,
                    e.without_url()
                ))
            })?;

        let status = response.status();
        let body = response.json::<Value>().await.map_err(|e| {
            OrchestrationError::RecordStoreError(format!("Invalid JSON response: {}", e))
        })?;

        if !status.is_success() {
            return Err(OrchestrationError::RecordStoreError(format!(
                "Financial API returned {} for {}: {}",
                status, path, body
            )));
        }

        // services wrap payloads as {"data": ...}
        Ok(match body {
            Value::Object(mut fields) if fields.contains_key("data") => {
                fields.remove("data").unwrap_or(Value::Null)
            }
            other => other,
        })
    }
}

#[async_trait]
impl RecordStore for HttpRecordStore {
    async fn create(&self, caller_id: &str, kind: ResourceKind, record: Map<String, Value>) -> Result<Value> {
        let mut body = record;
        body.insert("caller_id".to_string(), json!(caller_id));

        let url = self.collection_url(kind);
        self.send(self.client.post(&url).json(&body), kind.plural()).await
    }

    async fn list(&self, caller_id: &str, kind: ResourceKind, filter: &ListFilter) -> Result<Vec<Value>> {
        let mut params = vec![("caller_id".to_string(), caller_id.to_string())];
        if let Some(limit) = filter.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        for (key, value) in &filter.fields {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            params.push((key.clone(), value));
        }

        let url = Url::parse_with_params(&self.collection_url(kind), &params).map_err(|e| {
            OrchestrationError::ConfigError(format!("Invalid FINANCIAL_API_BASE_URL: {}", e))
        })?;

        match self.send(self.client.get(url), kind.plural()).await? {
            Value::Array(items) => Ok(items),
            Value::Null => Ok(Vec::new()),
            other => Err(OrchestrationError::RecordStoreError(format!(
                "Expected a list of {}, got {}",
                kind.plural(),
                other
            ))),
        }
    }

    async fn update(
        &self,
        caller_id: &str,
        kind: ResourceKind,
        reference: &str,
        changes: Map<String, Value>,
    ) -> Result<Value> {
        let mut body = changes;
        body.insert("caller_id".to_string(), json!(caller_id));

        let mut url = Url::parse(&self.collection_url(kind)).map_err(|e| {
            OrchestrationError::ConfigError(format!("Invalid FINANCIAL_API_BASE_URL: {}", e))
        })?;
        url.path_segments_mut()
            .map_err(|_| OrchestrationError::ConfigError("FINANCIAL_API_BASE_URL cannot be a base".to_string()))?
            .push(reference);

        self.send(self.client.patch(url).json(&body), kind.plural()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_records_are_scoped_per_caller() {
        let store = InMemoryRecordStore::new();
        store
            .create("alice", ResourceKind::Wallet, record(&[("name", json!("Main"))]))
            .await
            .unwrap();

        let alice = store.list("alice", ResourceKind::Wallet, &ListFilter::default()).await.unwrap();
        let bob = store.list("bob", ResourceKind::Wallet, &ListFilter::default()).await.unwrap();
        assert_eq!(alice.len(), 1);
        assert!(alice[0]["id"].is_string());
        assert!(bob.is_empty());
    }

    #[tokio::test]
    async fn test_list_filters_and_limits_newest_first() {
        let store = InMemoryRecordStore::new();
        for (amount, category) in [(10, "food"), (20, "rent"), (30, "food")] {
            store
                .create(
                    "alice",
                    ResourceKind::Transaction,
                    record(&[("amount", json!(amount)), ("category", json!(category))]),
                )
                .await
                .unwrap();
        }

        let filter = ListFilter {
            limit: Some(1),
            fields: record(&[("category", json!("food"))]),
        };
        let items = store.list("alice", ResourceKind::Transaction, &filter).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["amount"], 30);
    }

    #[tokio::test]
    async fn test_update_resolves_main_and_rejects_unknown() {
        let store = InMemoryRecordStore::new();
        store
            .create("alice", ResourceKind::Wallet, record(&[("name", json!("Checking"))]))
            .await
            .unwrap();

        let updated = store
            .update("alice", ResourceKind::Wallet, "main", record(&[("currency", json!("EUR"))]))
            .await
            .unwrap();
        assert_eq!(updated["currency"], "EUR");
        assert_eq!(updated["name"], "Checking");

        let missing = store
            .update("alice", ResourceKind::Wallet, "savings", Map::new())
            .await;
        assert!(matches!(missing, Err(OrchestrationError::RecordStoreError(_))));
    }

    #[tokio::test]
    async fn test_fail_on_simulates_outage() {
        let store = InMemoryRecordStore::new();
        store.fail_on(ResourceKind::Budget).await;

        let result = store.list("alice", ResourceKind::Budget, &ListFilter::default()).await;
        tokio_test::assert_err!(result);
        tokio_test::assert_ok!(store.list("alice", ResourceKind::Wallet, &ListFilter::default()).await);
    }
}
