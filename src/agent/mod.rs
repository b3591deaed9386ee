//! Reasoning backend client and the generic tool-calling loop.

pub mod llm;
pub mod tool_loop;

pub use llm::{ChatMessage, ModelSession, OpenRouterClient, ReasoningSession, ToolDefinition};
pub use tool_loop::{run_tool_loop, LoopOutcome, ToolLoopConfig, ToolRegistry, DEFAULT_MAX_TURNS};

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use anyhow::{bail, Result};
    use async_trait::async_trait;

    use super::llm::{ChatMessage, ReasoningSession, ToolDefinition};

    /// Scripted backend: returns pre-built assistant turns in order and
    /// records every request for assertions.
    pub struct ScriptedSession {
        responses: Mutex<std::collections::VecDeque<ChatMessage>>,
        calls: Mutex<usize>,
        last_messages: Mutex<Vec<ChatMessage>>,
    }

    impl ScriptedSession {
        pub fn new(responses: Vec<ChatMessage>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(0),
                last_messages: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }

        pub fn last_messages(&self) -> Vec<ChatMessage> {
            self.last_messages.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ReasoningSession for ScriptedSession {
        async fn send(
            &self,
            _system_prompt: &str,
            messages: &[ChatMessage],
            _tools: &[ToolDefinition],
        ) -> Result<ChatMessage> {
            *self.calls.lock().unwrap() += 1;
            *self.last_messages.lock().unwrap() = messages.to_vec();
            match self.responses.lock().unwrap().pop_front() {
                Some(msg) => Ok(msg),
                None => bail!("scripted session exhausted"),
            }
        }
    }
}
