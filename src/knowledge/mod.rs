//! Knowledge enhancement
//!
//! Augments the user query with the caller's profile, recent history and
//! relevant domain snippets. The retrieval corpus is a collaborator; the
//! built-in `StaticKnowledgeEnhancer` ships a small keyword-matched corpus.

use crate::models::{ExperienceLevel, HistoryTurn, UserState};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// History turns carried into the prompt
const MAX_HISTORY_TURNS: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeSnippet {
    pub id: String,
    pub topic: String,
    pub content: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhancedContext {
    pub enhanced_prompt: String,
    pub relevant_snippets: Vec<KnowledgeSnippet>,
    pub confidence: f32,
}

#[async_trait]
pub trait KnowledgeEnhancer: Send + Sync {
    async fn enhance(
        &self,
        query: &str,
        profile: &UserState,
        history: &[HistoryTurn],
    ) -> Result<EnhancedContext>;
}

/// Context without any snippets, used when enhancement is disabled or fails
pub fn plain_context(query: &str, profile: &UserState, history: &[HistoryTurn]) -> EnhancedContext {
    EnhancedContext {
        enhanced_prompt: compose_prompt(query, profile, history, &[]),
        relevant_snippets: Vec::new(),
        confidence: 0.0,
    }
}

fn profile_summary(profile: &UserState) -> String {
    let mut has = Vec::new();
    let mut missing = Vec::new();
    for (flag, label) in [
        (profile.has_wallets, "wallets"),
        (profile.has_transactions, "transactions"),
        (profile.has_budgets, "budgets"),
        (profile.has_categories, "categories"),
    ] {
        if flag {
            has.push(label);
        } else {
            missing.push(label);
        }
    }

    let mut summary = format!(
        "Experience level: {}. Default currency: {}.",
        profile.experience_level, profile.default_currency
    );
    if !has.is_empty() {
        summary.push_str(&format!(" Has set up: {}.", has.join(", ")));
    }
    if !missing.is_empty() {
        summary.push_str(&format!(" Not set up yet: {}.", missing.join(", ")));
    }
    summary
}

fn style_guidance(level: ExperienceLevel) -> &'static str {
    match level {
        ExperienceLevel::Beginner => {
            "Explain financial terms in plain language and suggest one concrete next step."
        }
        ExperienceLevel::Intermediate => "Be practical and reference the user's own numbers where possible.",
        ExperienceLevel::Advanced => "Be concise; skip basic definitions and focus on trade-offs.",
    }
}

fn compose_prompt(
    query: &str,
    profile: &UserState,
    history: &[HistoryTurn],
    snippets: &[KnowledgeSnippet],
) -> String {
    let mut prompt = format!(
        "User profile: {}\nStyle: {}\n",
        profile_summary(profile),
        style_guidance(profile.experience_level)
    );

    let recent = &history[history.len().saturating_sub(MAX_HISTORY_TURNS)..];
    if !recent.is_empty() {
        prompt.push_str("\nRecent conversation:\n");
        for turn in recent {
            prompt.push_str(&format!("{}: {}\n", turn.role, turn.content));
        }
    }

    if !snippets.is_empty() {
        prompt.push_str("\nRelevant guidance:\n");
        for snippet in snippets {
            prompt.push_str(&format!("- [{}] {}\n", snippet.topic, snippet.content));
        }
    }

    prompt.push_str(&format!("\nUser question: {}", query));
    prompt
}

//
// ================= Static corpus =================
//

struct CorpusEntry {
    id: &'static str,
    topic: &'static str,
    keywords: &'static [&'static str],
    content: &'static str,
}

const CORPUS: &[CorpusEntry] = &[
    CorpusEntry {
        id: "budget-50-30-20",
        topic: "Budgeting",
        keywords: &["budget", "budgeting", "monthly", "expenses", "plan", "spending"],
        content: "A common starting point is the 50/30/20 split: about half of take-home pay for needs, 30% for wants and 20% for savings or debt repayment.",
    },
    CorpusEntry {
        id: "emergency-fund",
        topic: "Emergency fund",
        keywords: &["emergency", "fund", "savings", "unexpected", "safety", "cushion"],
        content: "An emergency fund covering three to six months of essential expenses protects against job loss or surprise bills; keep it in an easily accessible account.",
    },
    CorpusEntry {
        id: "debt-strategies",
        topic: "Debt repayment",
        keywords: &["debt", "loan", "credit", "card", "repay", "interest", "payoff"],
        content: "The avalanche method pays the highest-interest debt first and minimizes total interest; the snowball method pays the smallest balance first for quicker wins.",
    },
    CorpusEntry {
        id: "automate-saving",
        topic: "Saving habits",
        keywords: &["save", "saving", "savings", "automate", "goal", "habit"],
        content: "Automating a transfer to savings on payday makes saving the default instead of relying on what is left at the end of the month.",
    },
    CorpusEntry {
        id: "track-expenses",
        topic: "Expense tracking",
        keywords: &["track", "tracking", "expense", "expenses", "transactions", "spent", "spending"],
        content: "Recording every transaction for a month, then grouping it by category, usually reveals the two or three areas where spending can be cut.",
    },
    CorpusEntry {
        id: "categories",
        topic: "Categories",
        keywords: &["category", "categories", "organize", "groceries", "rent", "utilities"],
        content: "A small set of broad categories (housing, food, transport, fun, savings) is easier to maintain than dozens of narrow ones.",
    },
    CorpusEntry {
        id: "wallets",
        topic: "Wallets",
        keywords: &["wallet", "wallets", "account", "accounts", "cash", "balance"],
        content: "Separate wallets for everyday spending and for savings make it harder to spend money that is set aside for a goal.",
    },
    CorpusEntry {
        id: "irregular-income",
        topic: "Irregular income",
        keywords: &["freelance", "irregular", "variable", "income", "gig", "commission"],
        content: "With irregular income, budget from your lowest typical month and treat anything above it as a bonus for savings or debt.",
    },
    CorpusEntry {
        id: "subscriptions",
        topic: "Subscriptions",
        keywords: &["subscription", "subscriptions", "recurring", "streaming", "membership"],
        content: "Reviewing recurring subscriptions every quarter is one of the quickest ways to lower fixed monthly costs.",
    },
    CorpusEntry {
        id: "investing-basics",
        topic: "Investing basics",
        keywords: &["invest", "investing", "investment", "retirement", "stocks", "index"],
        content: "Low-cost, diversified index funds held for the long term are a common foundation once an emergency fund is in place and high-interest debt is paid off.",
    },
];

pub struct StaticKnowledgeEnhancer {
    max_snippets: usize,
}

impl StaticKnowledgeEnhancer {
    pub fn new(max_snippets: usize) -> Self {
        Self { max_snippets }
    }

    /// Corpus entries ranked by keyword overlap with the query
    pub fn search(&self, query: &str) -> Vec<KnowledgeSnippet> {
        let lowered = query.to_lowercase();
        let tokens: HashSet<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|token| !token.is_empty())
            .collect();

        let mut scored: Vec<(usize, &CorpusEntry)> = CORPUS
            .iter()
            .map(|entry| {
                let hits = entry
                    .keywords
                    .iter()
                    .filter(|keyword| tokens.contains(*keyword))
                    .count();
                (hits, entry)
            })
            .filter(|(hits, _)| *hits > 0)
            .collect();

        // stable sort keeps corpus order among ties
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        scored
            .into_iter()
            .take(self.max_snippets)
            .map(|(hits, entry)| KnowledgeSnippet {
                id: entry.id.to_string(),
                topic: entry.topic.to_string(),
                content: entry.content.to_string(),
                score: (hits as f32 / entry.keywords.len() as f32).min(1.0),
            })
            .collect()
    }
}

impl Default for StaticKnowledgeEnhancer {
    fn default() -> Self {
        Self::new(3)
    }
}

#[async_trait]
impl KnowledgeEnhancer for StaticKnowledgeEnhancer {
    async fn enhance(
        &self,
        query: &str,
        profile: &UserState,
        history: &[HistoryTurn],
    ) -> Result<EnhancedContext> {
        let snippets = self.search(query);
        let confidence = if snippets.is_empty() {
            0.3
        } else {
            (0.4 + 0.2 * snippets.len() as f32).min(1.0)
        };

        Ok(EnhancedContext {
            enhanced_prompt: compose_prompt(query, profile, history, &snippets),
            relevant_snippets: snippets,
            confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_budget_question_pulls_budget_snippet() {
        let enhancer = StaticKnowledgeEnhancer::default();
        let context = enhancer
            .enhance("How should I budget my monthly expenses?", &UserState::default(), &[])
            .await
            .unwrap();

        assert!(!context.relevant_snippets.is_empty());
        assert_eq!(context.relevant_snippets[0].id, "budget-50-30-20");
        assert!(context.relevant_snippets.len() <= 3);
        assert!(context.enhanced_prompt.contains("50/30/20"));
        assert!(context.enhanced_prompt.ends_with("User question: How should I budget my monthly expenses?"));
    }

    #[tokio::test]
    async fn test_unrelated_query_has_no_snippets() {
        let enhancer = StaticKnowledgeEnhancer::default();
        let context = enhancer.enhance("hello there", &UserState::default(), &[]).await.unwrap();
        assert!(context.relevant_snippets.is_empty());
        assert!(!context.enhanced_prompt.contains("Relevant guidance"));
    }

    #[test]
    fn test_prompt_carries_profile_and_recent_history() {
        let profile = UserState {
            has_wallets: true,
            default_currency: "EUR".into(),
            experience_level: ExperienceLevel::Advanced,
            ..UserState::default()
        };
        let history: Vec<HistoryTurn> = (0..8)
            .map(|i| HistoryTurn {
                role: "user".into(),
                content: format!("turn {}", i),
            })
            .collect();

        let context = plain_context("what next?", &profile, &history);
        assert!(context.enhanced_prompt.contains("Default currency: EUR"));
        assert!(context.enhanced_prompt.contains("Has set up: wallets"));
        assert!(context.enhanced_prompt.contains("skip basic definitions"));
        assert!(context.enhanced_prompt.contains("turn 7"));
        assert!(!context.enhanced_prompt.contains("turn 2"));
        assert_eq!(context.confidence, 0.0);
    }
}
