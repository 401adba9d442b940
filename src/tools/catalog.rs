//! Fixed catalog of record operations the planner may select

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationFamily {
    Create,
    Read,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Wallet,
    Transaction,
    Budget,
    Category,
}

impl ResourceKind {
    pub fn plural(&self) -> &'static str {
        match self {
            ResourceKind::Wallet => "wallets",
            ResourceKind::Transaction => "transactions",
            ResourceKind::Budget => "budgets",
            ResourceKind::Category => "categories",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Wallet => "wallet",
            ResourceKind::Transaction => "transaction",
            ResourceKind::Budget => "budget",
            ResourceKind::Category => "category",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug)]
pub struct OperationSpec {
    pub name: &'static str,
    pub family: OperationFamily,
    pub resource: ResourceKind,
    pub description: &'static str,
    pub required: &'static [&'static str],
    pub optional: &'static [&'static str],
}

impl OperationSpec {
    /// Argument naming the record an update targets
    pub fn reference_argument(&self) -> Option<&'static str> {
        match (self.family, self.resource) {
            (OperationFamily::Update, ResourceKind::Wallet) => Some("wallet"),
            _ => None,
        }
    }
}

pub const CATALOG: &[OperationSpec] = &[
    OperationSpec {
        name: "create_wallet",
        family: OperationFamily::Create,
        resource: ResourceKind::Wallet,
        description: "Create a wallet (account) to hold money",
        required: &["name"],
        optional: &["currency", "balance", "wallet_type"],
    },
    OperationSpec {
        name: "get_wallets",
        family: OperationFamily::Read,
        resource: ResourceKind::Wallet,
        description: "List the user's wallets and balances",
        required: &[],
        optional: &["limit"],
    },
    OperationSpec {
        name: "update_wallet",
        family: OperationFamily::Update,
        resource: ResourceKind::Wallet,
        description: "Rename a wallet or change its currency",
        required: &["wallet"],
        optional: &["name", "currency", "balance"],
    },
    OperationSpec {
        name: "create_transaction",
        family: OperationFamily::Create,
        resource: ResourceKind::Transaction,
        description: "Record an expense or income",
        required: &["amount", "type"],
        optional: &["currency", "wallet", "category", "description", "date"],
    },
    OperationSpec {
        name: "get_transactions",
        family: OperationFamily::Read,
        resource: ResourceKind::Transaction,
        description: "List recent transactions, optionally filtered",
        required: &[],
        optional: &["limit", "wallet", "category", "type"],
    },
    OperationSpec {
        name: "create_budget",
        family: OperationFamily::Create,
        resource: ResourceKind::Budget,
        description: "Create a spending budget for a category",
        required: &["category", "amount"],
        optional: &["currency", "period"],
    },
    OperationSpec {
        name: "get_budgets",
        family: OperationFamily::Read,
        resource: ResourceKind::Budget,
        description: "List budgets and their limits",
        required: &[],
        optional: &["limit"],
    },
    OperationSpec {
        name: "create_category",
        family: OperationFamily::Create,
        resource: ResourceKind::Category,
        description: "Create a transaction category",
        required: &["name"],
        optional: &["type"],
    },
    OperationSpec {
        name: "get_categories",
        family: OperationFamily::Read,
        resource: ResourceKind::Category,
        description: "List transaction categories",
        required: &[],
        optional: &["limit", "type"],
    },
];

pub fn lookup(name: &str) -> Option<&'static OperationSpec> {
    CATALOG.iter().find(|spec| spec.name == name)
}

pub fn is_known(name: &str) -> bool {
    lookup(name).is_some()
}

/// One line per operation, used in planner prompts
pub fn describe() -> String {
    CATALOG
        .iter()
        .map(|spec| {
            format!(
                "- {}: {} (required: [{}], optional: [{}])",
                spec.name,
                spec.description,
                spec.required.join(", "),
                spec.optional.join(", ")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_names_are_unique() {
        for (i, spec) in CATALOG.iter().enumerate() {
            assert!(CATALOG[i + 1..].iter().all(|other| other.name != spec.name));
        }
        assert_eq!(CATALOG.len(), 9);
    }

    #[test]
    fn test_lookup_and_reader() {
        let spec = lookup("create_transaction").unwrap();
        assert_eq!(spec.family, OperationFamily::Create);
        assert_eq!(spec.resource, ResourceKind::Transaction);
        assert!(lookup("transfer_funds").is_none());
        assert!(describe().contains("get_categories"));
    }
}
