//! Execution plan as a DAG over step indices
//!
//! Edges always point from a later step to an earlier one, so a plan built
//! here is acyclic. `topological_order` still verifies that for plans that
//! arrive from elsewhere.

use crate::error::OrchestrationError;
use crate::models::{ExecutionStep, ToolCall};
use crate::tools::catalog::{self, OperationFamily, ResourceKind};
use crate::Result;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

/// Arguments that reference a record of another resource
const REFERENCE_ARGUMENTS: &[(&str, ResourceKind)] = &[
    ("wallet", ResourceKind::Wallet),
    ("category", ResourceKind::Category),
];

struct CreatedRecord<'a> {
    index: usize,
    resource: ResourceKind,
    name: Option<&'a str>,
}

fn references(created: &CreatedRecord<'_>, value: &str) -> bool {
    match created.name {
        Some(name) if name.eq_ignore_ascii_case(value) => true,
        _ => created.resource == ResourceKind::Wallet && value.eq_ignore_ascii_case("main"),
    }
}

/// Build execution steps, marking each step dependent on earlier creation
/// steps whose record it reads, updates or appends to.
pub fn build_execution_plan(calls: &[ToolCall]) -> Vec<ExecutionStep> {
    let mut created: Vec<CreatedRecord<'_>> = Vec::new();
    let mut steps = Vec::with_capacity(calls.len());

    for (index, call) in calls.iter().enumerate() {
        let mut depends_on = BTreeSet::new();
        let spec = catalog::lookup(&call.name);

        if let Some(spec) = spec {
            // reads and updates of a resource created earlier in the plan
            if spec.family != OperationFamily::Create {
                depends_on.extend(
                    created
                        .iter()
                        .filter(|record| record.resource == spec.resource)
                        .map(|record| record.index),
                );
            }

            // appends that name a record created earlier
            for (argument, resource) in REFERENCE_ARGUMENTS {
                if spec.resource == *resource {
                    continue;
                }
                if let Some(value) = call.arguments.get(*argument).and_then(Value::as_str) {
                    depends_on.extend(
                        created
                            .iter()
                            .filter(|record| record.resource == *resource && references(record, value))
                            .map(|record| record.index),
                    );
                }
            }

            if spec.family == OperationFamily::Create {
                created.push(CreatedRecord {
                    index,
                    resource: spec.resource,
                    name: call.arg_str("name"),
                });
            }
        }

        steps.push(ExecutionStep {
            sequence: index,
            call: call.clone(),
            depends_on,
            optional: spec.map(|s| s.family == OperationFamily::Read).unwrap_or(false),
        });
    }

    steps
}

/// Kahn's algorithm; among ready steps the lowest sequence runs first,
/// so independent steps keep plan order.
pub fn topological_order(steps: &[ExecutionStep]) -> Result<Vec<usize>> {
    let position: HashMap<usize, usize> = steps
        .iter()
        .enumerate()
        .map(|(pos, step)| (step.sequence, pos))
        .collect();

    let mut in_degree = vec![0usize; steps.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];

    for (pos, step) in steps.iter().enumerate() {
        for dependency in &step.depends_on {
            let dep_pos = position.get(dependency).copied().ok_or_else(|| {
                OrchestrationError::ParseError(format!(
                    "step {} depends on unknown step {}",
                    step.sequence, dependency
                ))
            })?;
            in_degree[pos] += 1;
            dependents[dep_pos].push(pos);
        }
    }

    let mut ready: BTreeSet<(usize, usize)> = steps
        .iter()
        .enumerate()
        .filter(|(pos, _)| in_degree[*pos] == 0)
        .map(|(pos, step)| (step.sequence, pos))
        .collect();

    let mut order = Vec::with_capacity(steps.len());
    while let Some(next) = ready.iter().next().copied() {
        ready.remove(&next);
        let (_, pos) = next;
        order.push(pos);

        for &dependent in &dependents[pos] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert((steps[dependent].sequence, dependent));
            }
        }
    }

    if order.len() != steps.len() {
        return Err(OrchestrationError::ParseError(
            "execution plan contains a dependency cycle".to_string(),
        ));
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn call(name: &str, arguments: Value) -> ToolCall {
        ToolCall::new(name, arguments.as_object().cloned().unwrap_or_else(Map::new))
    }

    #[test]
    fn test_read_after_create_depends_on_it() {
        let calls = vec![
            call("create_wallet", json!({ "name": "Travel" })),
            call("get_budgets", json!({})),
            call("get_wallets", json!({})),
        ];

        let steps = build_execution_plan(&calls);
        assert!(steps[0].depends_on.is_empty());
        assert!(steps[1].depends_on.is_empty());
        assert_eq!(steps[2].depends_on, BTreeSet::from([0]));
        assert!(steps[2].optional);
        assert!(!steps[0].optional);
    }

    #[test]
    fn test_transaction_referencing_new_wallet_and_category() {
        let calls = vec![
            call("create_category", json!({ "name": "Food" })),
            call("create_wallet", json!({ "name": "Cash" })),
            call(
                "create_transaction",
                json!({ "amount": 12, "type": "expense", "wallet": "cash", "category": "Food" }),
            ),
        ];

        let steps = build_execution_plan(&calls);
        assert_eq!(steps[2].depends_on, BTreeSet::from([0, 1]));
    }

    #[test]
    fn test_topological_order_keeps_plan_order_for_independent_steps() {
        let calls = vec![
            call("get_transactions", json!({})),
            call("get_budgets", json!({})),
            call("get_categories", json!({})),
        ];
        let steps = build_execution_plan(&calls);
        assert_eq!(topological_order(&steps).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_cycle_is_reported() {
        let mut steps = build_execution_plan(&[
            call("create_wallet", json!({ "name": "A" })),
            call("get_wallets", json!({})),
        ]);
        steps[0].depends_on.insert(1);

        assert!(matches!(
            topological_order(&steps),
            Err(OrchestrationError::ParseError(_))
        ));
    }
}
