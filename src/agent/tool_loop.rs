//! Generic bounded tool-calling loop
//!
//! Drives a multi-turn exchange with a reasoning backend that may request
//! tool invocations. The loop ends when the caller's designated terminal tool
//! is invoked and accepted by its handler, when the backend stops requesting
//! tools, or when the turn cap is hit.

use std::collections::HashMap;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, warn};

use crate::agent::llm::{ChatMessage, ReasoningSession, ToolDefinition};
use crate::error::ToolLoopError;

/// Default cap on backend round-trips per loop run.
pub const DEFAULT_MAX_TURNS: usize = 10;

/// A tool handler: structured input in, structured output or a revisable
/// error message out. Handler failures never abort the loop; they are fed
/// back to the model as the tool's result.
pub type ToolHandler = Box<dyn Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// Dispatch table mapping tool names to handlers.
///
/// Validated against the declared tool schema set when the loop is built, so
/// a schema/handler mismatch fails at construction instead of mid-run.
#[derive(Default)]
pub struct ToolRegistry {
    handlers: HashMap<String, ToolHandler>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a tool name.
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Box::new(handler));
    }

    /// Check that every declared tool has a handler and every handler has a
    /// declared schema.
    pub fn validate_against(&self, tools: &[ToolDefinition]) -> anyhow::Result<()> {
        for tool in tools {
            if !self.handlers.contains_key(&tool.function.name) {
                anyhow::bail!("declared tool '{}' has no handler", tool.function.name);
            }
        }
        for name in self.handlers.keys() {
            if !tools.iter().any(|t| &t.function.name == name) {
                anyhow::bail!("handler '{}' has no declared tool schema", name);
            }
        }
        Ok(())
    }

    /// Execute a tool by name. Returns the result payload and whether the
    /// handler accepted the call. Unknown names and handler failures become
    /// structured error payloads so the model can self-correct.
    pub async fn dispatch(&self, name: &str, input: Value) -> (Value, bool) {
        match self.handlers.get(name) {
            None => {
                warn!(tool = name, "unknown tool requested");
                (serde_json::json!({ "error": format!("Unknown tool: {}", name) }), false)
            }
            Some(handler) => match handler(input).await {
                Ok(result) => (result, true),
                Err(message) => {
                    debug!(tool = name, error = %message, "tool handler rejected call");
                    (serde_json::json!({ "error": message }), false)
                }
            },
        }
    }
}

/// Configuration for one tool loop run.
pub struct ToolLoopConfig {
    /// System instruction for the reasoning backend.
    pub system_prompt: String,
    /// Declared tool schemas, including the terminal tool.
    pub tools: Vec<ToolDefinition>,
    /// Tool whose accepted invocation ends the run and carries its output.
    pub terminal_tool: String,
    /// Maximum backend round-trips before failing with MaxTurnsExceeded.
    pub max_turns: usize,
}

/// How a tool loop run ended.
#[derive(Debug)]
pub enum LoopOutcome {
    /// The terminal tool was invoked and its handler accepted the payload.
    Submitted {
        /// The terminal tool's input payload.
        payload: Value,
        /// Backend calls made.
        turns: usize,
        /// Concatenated assistant text across all turns.
        transcript: String,
    },
    /// The backend stopped requesting tools without submitting. The caller
    /// decides whether this is a lenient fallback or a hard failure.
    NoSubmit { text: String, turns: usize },
}

/// Run a tool loop against a reasoning session.
///
/// The registry must cover exactly the declared tool set; this is checked
/// before the first backend call.
pub async fn run_tool_loop(
    session: &dyn ReasoningSession,
    registry: &ToolRegistry,
    config: &ToolLoopConfig,
    seed_messages: Vec<ChatMessage>,
) -> Result<LoopOutcome, ToolLoopError> {
    registry
        .validate_against(&config.tools)
        .map_err(|e| ToolLoopError::SchemaMismatch(e.to_string()))?;

    let mut messages = seed_messages;
    let mut transcript = String::new();

    for turn in 1..=config.max_turns {
        debug!(turn, max = config.max_turns, terminal = %config.terminal_tool, "tool loop turn");

        let response = session
            .send(&config.system_prompt, &messages, &config.tools)
            .await
            .map_err(ToolLoopError::Backend)?;

        if let Some(text) = response.content_as_text() {
            transcript.push_str(&text);
        }

        let tool_calls = match &response.tool_calls {
            Some(calls) if !calls.is_empty() => calls.clone(),
            _ => {
                // Backend stopped requesting tools.
                return Ok(LoopOutcome::NoSubmit {
                    text: transcript,
                    turns: turn,
                });
            }
        };

        messages.push(ChatMessage::assistant_with_tools(
            response.content.clone(),
            tool_calls.clone(),
        ));

        // Execute requested tools in order, batching results into this turn.
        let mut terminal_payload: Option<Value> = None;
        for call in &tool_calls {
            let name = &call.function.name;
            let input = call.input();
            let (result, accepted) = registry.dispatch(name, input.clone()).await;

            let serialized =
                serde_json::to_string(&result).unwrap_or_else(|_| "{}".to_string());
            messages.push(ChatMessage::tool_result(call.id.clone(), name.clone(), serialized));

            if accepted && name == &config.terminal_tool && terminal_payload.is_none() {
                terminal_payload = Some(input);
            }
        }

        if let Some(payload) = terminal_payload {
            return Ok(LoopOutcome::Submitted {
                payload,
                turns: turn,
                transcript,
            });
        }
    }

    Err(ToolLoopError::MaxTurnsExceeded {
        max_turns: config.max_turns,
        terminal_tool: config.terminal_tool.clone(),
    })
}
