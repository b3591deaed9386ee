//! Reasoning backend client (OpenRouter and other OpenAI-compatible providers)
//!
//! The improvement pipeline consumes the backend through the [`ReasoningSession`]
//! trait so agents can be driven by scripted sessions in tests.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Configuration for an LLM API provider
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Base URL for the API (e.g., "https://openrouter.ai/api/v1")
    pub base_url: String,
    /// API key for authentication
    pub api_key: String,
    /// Extra headers to include in requests (e.g., X-Title)
    pub extra_headers: Vec<(String, String)>,
}

impl ProviderConfig {
    /// Create an OpenRouter provider configuration
    pub fn openrouter(api_key: String) -> Self {
        Self {
            base_url: OPENROUTER_BASE_URL.to_string(),
            api_key,
            extra_headers: vec![("X-Title".to_string(), "Reprompt".to_string())],
        }
    }

    /// Create a provider with a custom OpenAI-compatible base URL
    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        Self {
            base_url,
            api_key,
            extra_headers: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
}

/// A single chat turn. Role and content are kept as loose JSON values because
/// providers disagree on shapes (string vs array-of-parts content, etc.).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub role: Option<serde_json::Value>,
    #[serde(default)]
    pub content: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Tool definition for OpenAI-compatible function calling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub r#type: String,
    pub function: FunctionDefinition,
}

impl ToolDefinition {
    /// Build a function tool definition from name, description and JSON schema.
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            r#type: "function".to_string(),
            function: FunctionDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

/// Function definition for tools
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Tool call from an LLM response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub r#type: String,
    pub function: FunctionCall,
}

/// Function call details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub name: String,
    /// Arguments can arrive as either a JSON string or a raw JSON object
    /// depending on the model. We normalize to a string for downstream use.
    #[serde(default, deserialize_with = "deserialize_arguments")]
    pub arguments: String,
}

impl ToolCall {
    /// Parse the call's arguments into a JSON value (empty object on failure).
    pub fn input(&self) -> serde_json::Value {
        serde_json::from_str(&self.function.arguments).unwrap_or_else(|_| serde_json::json!({}))
    }
}

/// Deserialize arguments that may be a JSON string or a raw JSON object.
fn deserialize_arguments<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Null => Ok(String::new()),
        other => Ok(other.to_string()),
    }
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Some(serde_json::json!("user")),
            content: Some(serde_json::json!(content.into())),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Some(serde_json::json!("system")),
            content: Some(serde_json::json!(content.into())),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Some(serde_json::json!("assistant")),
            content: Some(serde_json::json!(content.into())),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    /// Create an assistant message carrying tool calls
    pub fn assistant_with_tools(
        content: Option<serde_json::Value>,
        tool_calls: Vec<ToolCall>,
    ) -> Self {
        Self {
            role: Some(serde_json::json!("assistant")),
            content,
            tool_calls: Some(tool_calls),
            tool_call_id: None,
            name: None,
        }
    }

    /// Create a tool result message
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: Some(serde_json::json!("tool")),
            content: Some(serde_json::json!(content.into())),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            name: Some(tool_name.into()),
        }
    }

    /// Check if the message carries tool calls
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().map(|c| !c.is_empty()).unwrap_or(false)
    }

    /// Extract content as plain text, handling both string and
    /// array-of-content-parts formats.
    pub fn content_as_text(&self) -> Option<String> {
        self.content.as_ref().and_then(|c| match c {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Array(parts) => {
                let texts: Vec<String> = parts
                    .iter()
                    .filter_map(|part| {
                        if part.get("type").and_then(|t| t.as_str()) == Some("text") {
                            part.get("text").and_then(|t| t.as_str()).map(|s| s.to_string())
                        } else {
                            None
                        }
                    })
                    .collect();
                if texts.is_empty() {
                    None
                } else {
                    Some(texts.join(""))
                }
            }
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        })
    }
}

/// Contract between the improvement pipeline and the reasoning backend.
///
/// One call per awaiting-model step: full history in, one assistant turn out.
/// Test doubles script this trait; production uses [`ModelSession`].
#[async_trait]
pub trait ReasoningSession: Send + Sync {
    async fn send(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatMessage>;
}

/// LLM API client (OpenRouter and other OpenAI-compatible providers)
#[derive(Clone)]
pub struct OpenRouterClient {
    client: Arc<Client>,
    provider: ProviderConfig,
}

impl OpenRouterClient {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Arc::new(Client::new()),
            provider: ProviderConfig::openrouter(api_key),
        }
    }

    pub fn with_provider(provider: ProviderConfig) -> Self {
        Self {
            client: Arc::new(Client::new()),
            provider,
        }
    }

    /// Create a client with the API key from the keyring
    pub fn from_keyring() -> Result<Self> {
        let api_key = crate::security::keyring::get_api_key()?;
        Ok(Self::new(api_key))
    }

    /// Send a chat completion request, optionally with tool definitions.
    /// Returns the assistant message from the first choice.
    pub async fn complete(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolDefinition>,
        max_tokens: Option<u32>,
    ) -> Result<ChatMessage> {
        let has_tools = !tools.is_empty();
        let request = ChatRequest {
            model: model.to_string(),
            messages,
            max_tokens,
            tools: if has_tools { Some(tools) } else { None },
            tool_choice: if has_tools { Some("auto".to_string()) } else { None },
        };

        let mut req_builder = self
            .client
            .post(format!("{}/chat/completions", self.provider.base_url))
            .header("Authorization", format!("Bearer {}", self.provider.api_key));
        for (key, value) in &self.provider.extra_headers {
            req_builder = req_builder.header(key.as_str(), value.as_str());
        }
        let response = req_builder
            .json(&request)
            .send()
            .await
            .context("Failed to send request to LLM provider")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("LLM API error ({}): {}", status, body);
        }

        // Parse as raw Value first for maximum provider compatibility.
        // Strict struct deserialization breaks on models that return
        // non-standard field types.
        let body = response.text().await.context("Failed to read response body")?;
        let raw: serde_json::Value =
            serde_json::from_str(body.trim()).context("Failed to parse JSON response")?;

        let message = raw
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|arr| arr.first())
            .and_then(|choice| choice.get("message"))
            .ok_or_else(|| anyhow::anyhow!("No message in response"))?;

        let tool_calls: Option<Vec<ToolCall>> = message
            .get("tool_calls")
            .and_then(|tc| tc.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|tc| {
                        let id = tc.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string();
                        let tc_type = tc
                            .get("type")
                            .and_then(|v| v.as_str())
                            .unwrap_or("function")
                            .to_string();
                        let func = tc.get("function")?;
                        let name = func
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string();
                        // arguments: accept both string and raw object
                        let arguments = match func.get("arguments") {
                            Some(serde_json::Value::String(s)) => s.clone(),
                            Some(serde_json::Value::Null) | None => String::new(),
                            Some(other) => other.to_string(),
                        };
                        Some(ToolCall {
                            id,
                            r#type: tc_type,
                            function: FunctionCall { name, arguments },
                        })
                    })
                    .collect()
            });

        Ok(ChatMessage {
            role: message
                .get("role")
                .cloned()
                .or(Some(serde_json::json!("assistant"))),
            content: message.get("content").cloned(),
            tool_calls,
            tool_call_id: None,
            name: None,
        })
    }
}

/// A client bound to one model and token budget; the production
/// [`ReasoningSession`] implementation.
#[derive(Clone)]
pub struct ModelSession {
    client: OpenRouterClient,
    model: String,
    max_tokens: u32,
}

impl ModelSession {
    pub fn new(client: OpenRouterClient, model: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            client,
            model: model.into(),
            max_tokens,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl ReasoningSession for ModelSession {
    async fn send(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatMessage> {
        let mut full = Vec::with_capacity(messages.len() + 1);
        full.push(ChatMessage::system(system_prompt));
        full.extend_from_slice(messages);

        tracing::debug!(
            model = %self.model,
            messages = full.len(),
            tools = tools.len(),
            "sending reasoning request"
        );

        self.client
            .complete(&self.model, full, tools.to_vec(), Some(self.max_tokens))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_message_creation() {
        let user_msg = ChatMessage::user("Hello");
        assert_eq!(user_msg.role, Some(serde_json::json!("user")));
        assert_eq!(user_msg.content, Some(serde_json::json!("Hello")));

        let sys_msg = ChatMessage::system("You are helpful");
        assert_eq!(sys_msg.role, Some(serde_json::json!("system")));
    }

    #[test]
    fn test_function_call_arguments_string() {
        // Standard format: arguments as a JSON string
        let json = r#"{"name":"search_logs","arguments":"{\"query\":\"verbose\"}"}"#;
        let fc: FunctionCall = serde_json::from_str(json).unwrap();
        assert_eq!(fc.name, "search_logs");
        assert_eq!(fc.arguments, r#"{"query":"verbose"}"#);
    }

    #[test]
    fn test_function_call_arguments_object() {
        // Some models return arguments as a raw object instead of a string
        let json = r#"{"name":"search_logs","arguments":{"query":"verbose"}}"#;
        let fc: FunctionCall = serde_json::from_str(json).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&fc.arguments).unwrap();
        assert_eq!(parsed["query"], "verbose");
    }

    #[test]
    fn test_function_call_arguments_null() {
        let json = r#"{"name":"get_current_prompt","arguments":null}"#;
        let fc: FunctionCall = serde_json::from_str(json).unwrap();
        assert_eq!(fc.arguments, "");
    }

    #[test]
    fn test_tool_call_input_parses_arguments() {
        let call = ToolCall {
            id: "1".to_string(),
            r#type: "function".to_string(),
            function: FunctionCall {
                name: "search_logs".to_string(),
                arguments: r#"{"query": "verbose", "limit": 3}"#.to_string(),
            },
        };
        let input = call.input();
        assert_eq!(input["query"], "verbose");
        assert_eq!(input["limit"], 3);
    }

    #[test]
    fn test_tool_call_input_falls_back_to_empty_object() {
        let call = ToolCall {
            id: "1".to_string(),
            r#type: "function".to_string(),
            function: FunctionCall {
                name: "x".to_string(),
                arguments: "not json".to_string(),
            },
        };
        assert_eq!(call.input(), serde_json::json!({}));
    }

    #[test]
    fn test_content_as_text_array() {
        let msg = ChatMessage {
            role: Some(serde_json::json!("assistant")),
            content: Some(serde_json::json!([
                {"type": "text", "text": "Hello "},
                {"type": "text", "text": "world"}
            ])),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        };
        assert_eq!(msg.content_as_text(), Some("Hello world".to_string()));
    }

    #[test]
    fn test_has_tool_calls() {
        let msg = ChatMessage::assistant("done");
        assert!(!msg.has_tool_calls());

        let with_calls = ChatMessage::assistant_with_tools(
            None,
            vec![ToolCall {
                id: "c1".to_string(),
                r#type: "function".to_string(),
                function: FunctionCall {
                    name: "validate_prompt".to_string(),
                    arguments: "{}".to_string(),
                },
            }],
        );
        assert!(with_calls.has_tool_calls());
    }
}
