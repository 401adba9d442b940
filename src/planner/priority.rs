//! Priority table used to bound a selection to `max_tools`

use crate::models::{ToolCall, UserState};
use crate::tools::catalog::{self, OperationFamily, ResourceKind};

/// Base priority per operation family, highest first
const FAMILY_PRIORITY: &[(OperationFamily, u32)] = &[
    (OperationFamily::Create, 300),
    (OperationFamily::Read, 200),
    (OperationFamily::Update, 100),
];

/// Added to a creation the caller needs because the resource does not exist yet
const MISSING_RESOURCE_BOOST: u32 = 50;

fn has_resource(user_state: &UserState, resource: ResourceKind) -> bool {
    match resource {
        ResourceKind::Wallet => user_state.has_wallets,
        ResourceKind::Transaction => user_state.has_transactions,
        ResourceKind::Budget => user_state.has_budgets,
        ResourceKind::Category => user_state.has_categories,
    }
}

pub fn priority(call: &ToolCall, user_state: &UserState) -> u32 {
    let Some(spec) = catalog::lookup(&call.name) else {
        return 0;
    };

    let base = FAMILY_PRIORITY
        .iter()
        .find(|(family, _)| *family == spec.family)
        .map(|(_, score)| *score)
        .unwrap_or(0);

    if spec.family == OperationFamily::Create && !has_resource(user_state, spec.resource) {
        base + MISSING_RESOURCE_BOOST
    } else {
        base
    }
}

/// Keep the `max_tools` highest-priority calls, preserving their plan order
pub fn bound(calls: Vec<ToolCall>, user_state: &UserState, max_tools: usize) -> Vec<ToolCall> {
    if calls.len() <= max_tools {
        return calls;
    }

    let mut ranked: Vec<(usize, u32)> = calls
        .iter()
        .enumerate()
        .map(|(index, call)| (index, priority(call, user_state)))
        .collect();

    // stable: equal priorities keep plan order
    ranked.sort_by(|a, b| b.1.cmp(&a.1));

    let mut keep: Vec<usize> = ranked.into_iter().take(max_tools).map(|(index, _)| index).collect();
    keep.sort_unstable();

    let mut calls: Vec<Option<ToolCall>> = calls.into_iter().map(Some).collect();
    keep.into_iter().filter_map(|index| calls[index].take()).collect()
}
