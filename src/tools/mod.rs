//! Tool trait and registry
//!
//! Every tool wraps one catalog operation over the record store.
//! Required arguments are validated before any side effect.

use crate::error::OrchestrationError;
use crate::models::{ToolCall, ToolResult};
use crate::Result;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

pub mod catalog;
pub mod store;

pub use catalog::{OperationFamily, OperationSpec, ResourceKind, CATALOG};
pub use store::{HttpRecordStore, InMemoryRecordStore, ListFilter, RecordStore};

/// Trait for a single tool
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> &'static OperationSpec;

    fn name(&self) -> &'static str {
        self.spec().name
    }

    fn description(&self) -> &'static str {
        self.spec().description
    }

    async fn execute(&self, caller_id: &str, arguments: &Map<String, Value>) -> Result<ToolResult>;
}

/// Tool registry for looking up and executing tools
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Check that every required argument is present and non-empty
pub fn validate_arguments(spec: &OperationSpec, call: &ToolCall) -> Result<()> {
    for argument in spec.required {
        let present = match call.arguments.get(*argument) {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => !s.trim().is_empty(),
            Some(_) => true,
        };

        if !present {
            return Err(OrchestrationError::ToolValidationError {
                tool: spec.name.to_string(),
                argument: argument.to_string(),
            });
        }
    }
    Ok(())
}

fn limit_argument(arguments: &Map<String, Value>) -> Option<usize> {
    match arguments.get("limit")? {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Catalog operation backed by the record store
pub struct RecordTool {
    spec: &'static OperationSpec,
    store: Arc<dyn RecordStore>,
}

impl RecordTool {
    pub fn new(spec: &'static OperationSpec, store: Arc<dyn RecordStore>) -> Self {
        Self { spec, store }
    }

    async fn create(&self, caller_id: &str, arguments: &Map<String, Value>) -> Result<ToolResult> {
        let resource = self.spec.resource;
        let record = self.store.create(caller_id, resource, arguments.clone()).await?;

        let label = record
            .get("name")
            .or_else(|| record.get("description"))
            .and_then(Value::as_str)
            .map(|label| format!(" '{}'", label))
            .unwrap_or_default();

        Ok(ToolResult::ok(record, format!("Created {}{}", resource, label)))
    }

    async fn read(&self, caller_id: &str, arguments: &Map<String, Value>) -> Result<ToolResult> {
        let resource = self.spec.resource;
        let filter = ListFilter {
            limit: limit_argument(arguments),
            fields: arguments
                .iter()
                .filter(|(key, value)| key.as_str() != "limit" && !value.is_null())
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        };

        let records = self.store.list(caller_id, resource, &filter).await?;
        let message = if records.is_empty() {
            format!("No {} found", resource.plural())
        } else {
            format!("Found {} {}", records.len(), resource.plural())
        };

        Ok(ToolResult::ok(json!(records), message))
    }

    async fn update(&self, caller_id: &str, arguments: &Map<String, Value>) -> Result<ToolResult> {
        let resource = self.spec.resource;
        let reference_key = self.spec.reference_argument().unwrap_or("id");
        let reference = arguments
            .get(reference_key)
            .and_then(Value::as_str)
            .ok_or_else(|| OrchestrationError::ToolValidationError {
                tool: self.spec.name.to_string(),
                argument: reference_key.to_string(),
            })?;

        let changes: Map<String, Value> = arguments
            .iter()
            .filter(|(key, _)| key.as_str() != reference_key)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        let record = self.store.update(caller_id, resource, reference, changes).await?;
        Ok(ToolResult::ok(record, format!("Updated {} '{}'", resource, reference)))
    }
}

#[async_trait::async_trait]
impl Tool for RecordTool {
    fn spec(&self) -> &'static OperationSpec {
        self.spec
    }

    async fn execute(&self, caller_id: &str, arguments: &Map<String, Value>) -> Result<ToolResult> {
        match self.spec.family {
            OperationFamily::Create => self.create(caller_id, arguments).await,
            OperationFamily::Read => self.read(caller_id, arguments).await,
            OperationFamily::Update => self.update(caller_id, arguments).await,
        }
    }
}

/// Registry with one record tool per catalog operation
pub fn create_default_registry(store: Arc<dyn RecordStore>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    for spec in CATALOG {
        registry.register(Arc::new(RecordTool::new(spec, store.clone())));
    }

    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_default_registry_covers_catalog() {
        let registry = create_default_registry(Arc::new(InMemoryRecordStore::new()));
        assert_eq!(registry.list().len(), CATALOG.len());
        assert!(registry.get("create_budget").is_some());
        assert!(registry.get("fetch_market_data").is_none());
    }

    #[test]
    fn test_validation_reports_first_missing_argument() {
        let spec = catalog::lookup("create_transaction").unwrap();

        let missing_type = ToolCall::new("create_transaction", args(json!({ "amount": 25 })));
        match validate_arguments(spec, &missing_type) {
            Err(OrchestrationError::ToolValidationError { tool, argument }) => {
                assert_eq!(tool, "create_transaction");
                assert_eq!(argument, "type");
            }
            other => panic!("expected validation error, got {:?}", other),
        }

        let blank = ToolCall::new("create_transaction", args(json!({ "amount": 25, "type": " " })));
        tokio_test::assert_err!(validate_arguments(spec, &blank));

        let complete = ToolCall::new("create_transaction", args(json!({ "amount": 25, "type": "expense" })));
        tokio_test::assert_ok!(validate_arguments(spec, &complete));
    }

    #[tokio::test]
    async fn test_create_then_read_through_tools() {
        let store = Arc::new(InMemoryRecordStore::new());
        let registry = create_default_registry(store.clone());

        let created = registry
            .get("create_category")
            .unwrap()
            .execute("alice", &args(json!({ "name": "Groceries", "type": "expense" })))
            .await
            .unwrap();
        assert!(created.success);
        assert_eq!(created.message.as_deref(), Some("Created category 'Groceries'"));

        let listed = registry
            .get("get_categories")
            .unwrap()
            .execute("alice", &args(json!({ "limit": "5" })))
            .await
            .unwrap();
        assert_eq!(listed.data.unwrap().as_array().unwrap().len(), 1);
        assert_eq!(listed.message.as_deref(), Some("Found 1 categories"));
    }

    #[tokio::test]
    async fn test_update_wallet_by_reference() {
        let store = Arc::new(InMemoryRecordStore::new());
        let registry = create_default_registry(store.clone());

        registry
            .get("create_wallet")
            .unwrap()
            .execute("alice", &args(json!({ "name": "Main", "currency": "USD" })))
            .await
            .unwrap();

        let updated = registry
            .get("update_wallet")
            .unwrap()
            .execute("alice", &args(json!({ "wallet": "main", "name": "Everyday" })))
            .await
            .unwrap();
        assert_eq!(updated.data.unwrap()["name"], "Everyday");
    }
}
