//! Deterministic keyword plan used when the model path fails

use crate::models::{ToolCall, UserState};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Map, Value};

pub const FALLBACK_CONFIDENCE: f32 = 0.3;

const CREATE_VERBS: &[&str] = &["add", "record", "log", "spent", "paid", "bought", "received", "earned", "got paid"];
const INCOME_WORDS: &[&str] = &["income", "salary", "earned", "received", "paycheck", "got paid"];
const EXPENSE_WORDS: &[&str] = &["expense", "spent", "paid", "bought", "purchase", "cost"];
const READ_VERBS: &[&str] = &["show", "list", "get", "view", "see", "display", "what are", "how much"];

/// Read operation per resource keyword, in output order
const READ_TARGETS: &[(&[&str], &str)] = &[
    (&["wallet", "wallets", "balance", "balances", "account", "accounts"], "get_wallets"),
    (
        &["transaction", "transactions", "expenses", "spending", "history", "purchases"],
        "get_transactions",
    ),
    (&["budget", "budgets"], "get_budgets"),
    (&["category", "categories"], "get_categories"),
];

lazy_static! {
    static ref AMOUNT: Option<Regex> = Regex::new(r"(\d+(?:[.,]\d{1,2})?)").ok();
}

/// Lowercased words of the query, joined by single spaces and padded so
/// keyword phrases only match on word boundaries
fn word_line(text: &str) -> String {
    let words: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect();
    format!(" {} ", words.join(" "))
}

fn contains_any(line: &str, words: &[&str]) -> bool {
    words.iter().any(|word| line.contains(&format!(" {} ", word)))
}

/// First number in the query, accepting a decimal comma
pub fn first_amount(query: &str) -> Option<f64> {
    let captures = AMOUNT.as_ref()?.captures(query)?;
    captures.get(1)?.as_str().replace(',', ".").parse().ok()
}

/// A creation needs a money word and a parsed amount
fn transaction_call(query: &str, line: &str) -> Option<ToolCall> {
    let kind = if contains_any(line, INCOME_WORDS) {
        "income"
    } else if contains_any(line, EXPENSE_WORDS) {
        "expense"
    } else {
        return None;
    };
    let amount = first_amount(query)?;

    let mut arguments = Map::new();
    arguments.insert("type".to_string(), json!(kind));
    arguments.insert("amount".to_string(), json!(amount));
    let description: String = query.trim().chars().take(200).collect();
    arguments.insert("description".to_string(), Value::String(description));

    Some(ToolCall::new("create_transaction", arguments))
}

/// Keyword plan: a creation when the query records money, otherwise reads
pub fn fallback_calls(query: &str, _user_state: &UserState) -> Vec<ToolCall> {
    let line = word_line(query);

    if contains_any(&line, CREATE_VERBS) {
        if let Some(call) = transaction_call(query, &line) {
            return vec![call];
        }
    }

    if !contains_any(&line, READ_VERBS) {
        return Vec::new();
    }

    READ_TARGETS
        .iter()
        .filter(|(keywords, _)| contains_any(&line, keywords))
        .map(|(_, operation)| ToolCall::new(*operation, Map::new()))
        .collect()
}
