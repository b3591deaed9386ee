//! reprompt - Self-Improving Assistant Core Library
//!
//! Feedback-driven prompt improvement:
//! - Pattern-based feedback classification with an LLM fallback
//! - Analyzer and versioner agents driven by a bounded tool-calling loop
//! - Append-only, rollback-capable prompt version store (SQLite)
//! - JSONL conversation and improvement event logs
//!
//! # Example
//!
//! ```ignore
//! use reprompt::feedback::FeedbackClassifier;
//!
//! #[tokio::main]
//! async fn main() {
//!     let classifier = FeedbackClassifier::new();
//!     if let Some(fb) = classifier.detect("too long, make it shorter").await {
//!         println!("{} feedback about {}", fb.feedback_type.as_str(), fb.category.as_str());
//!     }
//! }
//! ```

pub mod agent;
pub mod cli;
pub mod config;
pub mod error;
pub mod feedback;
pub mod improve;
pub mod security;
pub mod storage;

// Re-export commonly used types for convenience
pub use agent::{
    llm::{ModelSession, OpenRouterClient, ReasoningSession},
    tool_loop::{LoopOutcome, ToolRegistry},
};

pub use error::{StoreError, ToolLoopError, VersioningError};
pub use feedback::{Feedback, FeedbackClassifier};
pub use improve::{AnalyzerAgent, ImprovementOrchestrator, ImprovementResult, VersionerAgent};
pub use storage::{JsonlLogStore, LogSink, PromptVersionStore};

/// Version of the reprompt crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
