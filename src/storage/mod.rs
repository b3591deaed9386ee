//! Persistence: versioned prompts (SQLite) and JSONL conversation logs.

pub mod logs;
pub mod prompts;

pub use logs::{feedback_stats, DateRange, FeedbackStats, JsonlLogStore, LogSink, NewTurn, TurnLog};
pub use prompts::{PromptDiff, PromptVersion, PromptVersionStore, VersionSummary, KNOWN_AGENTS};
