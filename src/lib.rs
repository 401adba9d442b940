//! Finance Assistant Pipeline
//!
//! A request pipeline for a personal finance assistant that:
//! - Admits requests through per-caller and global rate limits
//! - Screens input for prompt injection before any side effect
//! - Transcribes images and documents into text and structured data
//! - Plans and runs record operations in dependency order
//! - Grounds answers in tool results and scores their confidence
//! - Records every model interaction for audit and cost tracking
//!
//! PIPELINE:
//! RATE LIMIT → (NORMALIZE) → SECURITY → KNOWLEDGE → PLAN → EXECUTE → SYNTHESIZE → SCORE

pub mod api;
pub mod audit;
pub mod confidence;
pub mod config;
pub mod error;
pub mod execution;
pub mod extract;
pub mod gateway;
pub mod knowledge;
pub mod models;
pub mod normalizer;
pub mod pipeline;
pub mod planner;
pub mod rate_limit;
pub mod security;
pub mod synthesis;
pub mod tools;

pub use error::Result;

// Re-export common types
pub use config::PipelineConfig;
pub use models::*;
pub use pipeline::{build_orchestrator, Orchestrator};
