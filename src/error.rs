//! Typed errors the improvement pipeline matches on.
//!
//! Most I/O and HTTP failures stay as `anyhow::Error` with context; these
//! variants exist where callers branch on the failure kind.

use thiserror::Error;

/// Errors escaping a tool-use loop.
#[derive(Debug, Error)]
pub enum ToolLoopError {
    /// The loop hit its configured turn cap without reaching the terminal tool.
    #[error("tool loop exceeded {max_turns} turns without terminal tool '{terminal_tool}'")]
    MaxTurnsExceeded {
        max_turns: usize,
        terminal_tool: String,
    },

    /// The reasoning backend call itself failed.
    #[error("reasoning backend error: {0}")]
    Backend(#[source] anyhow::Error),

    /// The dispatch registry does not cover the declared tool schemas.
    /// Caught before the first backend call.
    #[error("tool registry does not match declared schemas: {0}")]
    SchemaMismatch(String),
}

/// Errors from the versioning agent.
#[derive(Debug, Error)]
pub enum VersioningError {
    /// The versioner's loop ended without calling create_prompt_version.
    /// An unreviewed prompt must never become active, so this is fatal for
    /// the improvement run.
    #[error("versioner finished without creating a new version: {0}")]
    NoVersionCreated(String),

    /// The submitted payload failed validation after the loop.
    #[error("submitted prompt failed validation: {issues:?}")]
    InvalidPrompt { issues: Vec<String> },

    #[error(transparent)]
    ToolLoop(#[from] ToolLoopError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the prompt version store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no prompt versions exist for agent '{agent}'")]
    NoActivePrompt { agent: String },

    #[error("version {version} not found for agent '{agent}'")]
    VersionNotFound { agent: String, version: i64 },

    #[error(transparent)]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_turns_message_names_terminal_tool() {
        let err = ToolLoopError::MaxTurnsExceeded {
            max_turns: 10,
            terminal_tool: "submit_analysis".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("10"));
        assert!(msg.contains("submit_analysis"));
    }

    #[test]
    fn test_versioning_error_from_tool_loop() {
        let err: VersioningError = ToolLoopError::MaxTurnsExceeded {
            max_turns: 3,
            terminal_tool: "create_prompt_version".to_string(),
        }
        .into();
        assert!(matches!(err, VersioningError::ToolLoop(_)));
    }
}
