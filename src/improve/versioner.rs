//! Versioner agent: rewrites a prompt to address analysis findings and
//! persists the result as a new active version.
//!
//! Unlike the analyzer, stopping without submitting is a hard error here.
//! An improvement run must never end with an unreviewed prompt half-applied.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::agent::llm::{ChatMessage, ReasoningSession, ToolDefinition};
use crate::agent::tool_loop::{run_tool_loop, LoopOutcome, ToolLoopConfig, ToolRegistry};
use crate::error::VersioningError;
use crate::improve::analyzer::AnalysisResult;
use crate::improve::truncate_chars;
use crate::storage::prompts::PromptVersionStore;

/// Maximum prompt length in characters (roughly 4000 tokens).
pub const MAX_PROMPT_LENGTH: usize = 16_000;

/// Long prompts without section markers get flagged above this length.
const STRUCTURE_CHECK_THRESHOLD: usize = 500;

/// A single change applied to the prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptChange {
    pub section: String,
    /// "add", "modify", or "remove".
    pub change_type: String,
    pub description: String,
    #[serde(default)]
    pub hypothesis_id: String,
}

/// Outcome of a successful versioning run.
#[derive(Debug, Clone)]
pub struct NewPromptVersion {
    pub version: i64,
    pub content: String,
    pub changes: Vec<PromptChange>,
    pub hypothesis_ids: Vec<String>,
    pub rationale: String,
}

/// Result of static prompt validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub length: usize,
    pub issues: Vec<String>,
    pub estimated_tokens: usize,
}

/// Validate a candidate prompt for length, emptiness, leftover template
/// syntax, and missing structure.
pub fn validate_prompt(prompt: &str, max_length: usize) -> ValidationReport {
    let length = prompt.chars().count();
    let mut issues = Vec::new();

    if length > max_length {
        issues.push(format!(
            "Prompt too long: {} chars (max: {})",
            length, max_length
        ));
    }
    if prompt.trim().is_empty() {
        issues.push("Prompt is empty".to_string());
    }
    if prompt.contains("{{") || prompt.contains("}}") {
        issues.push("Prompt contains template syntax that may not be filled".to_string());
    }
    let has_sections = prompt.contains("##") || prompt.contains("**");
    if length > STRUCTURE_CHECK_THRESHOLD && !has_sections {
        issues.push("Long prompt without clear sections - consider adding headers".to_string());
    }

    ValidationReport {
        valid: issues.is_empty(),
        length,
        issues,
        estimated_tokens: length / 4,
    }
}

/// Agent that generates and persists improved prompt versions.
pub struct VersionerAgent {
    session: Arc<dyn ReasoningSession>,
    prompts: Arc<PromptVersionStore>,
    max_turns: usize,
    max_prompt_length: usize,
}

impl VersionerAgent {
    pub fn new(
        session: Arc<dyn ReasoningSession>,
        prompts: Arc<PromptVersionStore>,
        max_turns: usize,
        max_prompt_length: usize,
    ) -> Self {
        Self {
            session,
            prompts,
            max_turns,
            max_prompt_length,
        }
    }

    fn tools() -> Vec<ToolDefinition> {
        vec![
            ToolDefinition::function(
                "get_current_prompt",
                "Get the current system prompt for an agent",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "agent_name": {
                            "type": "string",
                            "enum": ["main_agent", "analyzer", "versioner"],
                            "description": "Agent name"
                        }
                    },
                    "required": ["agent_name"]
                }),
            ),
            ToolDefinition::function(
                "get_prompt_diff",
                "Compare two versions of a prompt",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "agent_name": {"type": "string"},
                        "version_a": {"type": "integer"},
                        "version_b": {"type": "integer"}
                    },
                    "required": ["agent_name", "version_a", "version_b"]
                }),
            ),
            ToolDefinition::function(
                "validate_prompt",
                "Validate a prompt for length, format, and potential issues",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "prompt_content": {
                            "type": "string",
                            "description": "The prompt content to validate"
                        }
                    },
                    "required": ["prompt_content"]
                }),
            ),
            ToolDefinition::function(
                "create_prompt_version",
                "Create a new version of the prompt",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "agent_name": {"type": "string"},
                        "new_prompt": {
                            "type": "string",
                            "description": "The complete new prompt content"
                        },
                        "changes": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "section": {"type": "string"},
                                    "change_type": {
                                        "type": "string",
                                        "enum": ["add", "modify", "remove"]
                                    },
                                    "description": {"type": "string"},
                                    "hypothesis_id": {"type": "string"}
                                },
                                "required": ["section", "change_type", "description"]
                            }
                        },
                        "rationale": {
                            "type": "string",
                            "description": "Overall explanation of the improvements"
                        }
                    },
                    "required": ["agent_name", "new_prompt", "changes", "rationale"]
                }),
            ),
        ]
    }

    fn registry(&self, target_agent: &str) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        let max_length = self.max_prompt_length;

        let prompts = self.prompts.clone();
        let default_agent = target_agent.to_string();
        registry.register("get_current_prompt", move |input| {
            let prompts = prompts.clone();
            let default_agent = default_agent.clone();
            Box::pin(async move {
                let agent = input
                    .get("agent_name")
                    .and_then(|a| a.as_str())
                    .unwrap_or(&default_agent)
                    .to_string();
                let prompt = prompts.current(&agent).await.map_err(|e| e.to_string())?;
                let version = prompts
                    .current_version(&agent)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(serde_json::json!({
                    "prompt": prompt,
                    "version": version,
                    "length": prompt.chars().count(),
                }))
            })
        });

        let prompts = self.prompts.clone();
        registry.register("get_prompt_diff", move |input| {
            let prompts = prompts.clone();
            Box::pin(async move {
                let agent = input
                    .get("agent_name")
                    .and_then(|a| a.as_str())
                    .ok_or_else(|| "missing required field 'agent_name'".to_string())?
                    .to_string();
                let version_a = input
                    .get("version_a")
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| "missing required field 'version_a'".to_string())?;
                let version_b = input
                    .get("version_b")
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| "missing required field 'version_b'".to_string())?;
                let diff = prompts
                    .get_diff(&agent, version_a, version_b)
                    .await
                    .map_err(|e| e.to_string())?;
                serde_json::to_value(diff).map_err(|e| e.to_string())
            })
        });

        registry.register("validate_prompt", move |input| {
            Box::pin(async move {
                let prompt = input
                    .get("prompt_content")
                    .and_then(|p| p.as_str())
                    .ok_or_else(|| "missing required field 'prompt_content'".to_string())?;
                serde_json::to_value(validate_prompt(prompt, max_length)).map_err(|e| e.to_string())
            })
        });

        // Terminal tool. Rejecting here feeds the issues back to the model
        // so it can revise; persistence happens after the loop.
        registry.register("create_prompt_version", move |input| {
            Box::pin(async move {
                let prompt = input
                    .get("new_prompt")
                    .and_then(|p| p.as_str())
                    .ok_or_else(|| "missing required field 'new_prompt'".to_string())?;
                let report = validate_prompt(prompt, max_length);
                if !report.valid {
                    return Err(format!("Validation failed: {}", report.issues.join("; ")));
                }
                Ok(serde_json::json!({ "status": "version_created" }))
            })
        });

        registry
    }

    /// Generate an improved prompt for `target_agent` and persist it as the
    /// new active version.
    pub async fn improve(
        &self,
        target_agent: &str,
        analysis: &AnalysisResult,
    ) -> Result<NewPromptVersion, VersioningError> {
        let system_prompt = self
            .prompts
            .current("versioner")
            .await
            .map_err(|e| VersioningError::Other(e.into()))?;
        let current_prompt = self
            .prompts
            .current(target_agent)
            .await
            .map_err(|e| VersioningError::Other(e.into()))?;
        let current_version = self
            .prompts
            .current_version(target_agent)
            .await
            .map_err(|e| VersioningError::Other(e.into()))?;

        let problems_text = analysis
            .problems
            .iter()
            .map(|p| format!("- [{}] {} (severity: {})", p.id, p.description, p.severity))
            .collect::<Vec<_>>()
            .join("\n");
        let hypotheses_text = analysis
            .hypotheses
            .iter()
            .map(|h| {
                format!(
                    "- [{}] {} -> {} (confidence: {})\n  Addresses: {}",
                    h.id,
                    h.suggestion,
                    h.expected_effect,
                    h.confidence,
                    h.problem_ids.join(", ")
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let seed = format!(
            r#"Improve the system prompt for agent "{target_agent}" based on the analysis.

## Current Prompt (v{current_version})
```
{current_prompt}
```

## Analysis Results

### Problems Identified
{problems_text}

### Improvement Hypotheses
{hypotheses_text}

### Analysis Summary
{analysis_summary}

## Instructions
1. First, use validate_prompt to check the current prompt
2. Make targeted improvements based on the hypotheses
3. Keep changes minimal but effective
4. Use create_prompt_version to save the improved prompt

Remember:
- Don't remove existing functionality without clear reason
- Maintain the overall structure and tone
- Each change should address a specific hypothesis
- Maximum prompt length: {max_length} characters
"#,
            analysis_summary = truncate_chars(&analysis.raw_analysis, 2000),
            max_length = self.max_prompt_length,
        );

        let config = ToolLoopConfig {
            system_prompt,
            tools: Self::tools(),
            terminal_tool: "create_prompt_version".to_string(),
            max_turns: self.max_turns,
        };
        let registry = self.registry(target_agent);

        let outcome = run_tool_loop(
            self.session.as_ref(),
            &registry,
            &config,
            vec![ChatMessage::user(seed)],
        )
        .await?;

        match outcome {
            LoopOutcome::Submitted { payload, turns, .. } => {
                info!(turns, target_agent, "versioner submitted new prompt");
                self.persist(target_agent, &payload, analysis).await
            }
            LoopOutcome::NoSubmit { text, .. } => Err(VersioningError::NoVersionCreated(
                truncate_chars(&text, 200),
            )),
        }
    }

    async fn persist(
        &self,
        target_agent: &str,
        payload: &Value,
        analysis: &AnalysisResult,
    ) -> Result<NewPromptVersion, VersioningError> {
        let agent = payload
            .get("agent_name")
            .and_then(|a| a.as_str())
            .unwrap_or(target_agent);
        let new_prompt = payload
            .get("new_prompt")
            .and_then(|p| p.as_str())
            .ok_or_else(|| VersioningError::InvalidPrompt {
                issues: vec!["submission is missing 'new_prompt'".to_string()],
            })?;

        // The terminal handler already validated; re-check so the invariant
        // holds even if handlers change.
        let report = validate_prompt(new_prompt, self.max_prompt_length);
        if !report.valid {
            return Err(VersioningError::InvalidPrompt {
                issues: report.issues,
            });
        }

        let changes: Vec<PromptChange> = payload
            .get("changes")
            .and_then(|c| c.as_array())
            .map(|arr| {
                arr.iter()
                    .map(|c| PromptChange {
                        section: c.get("section").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                        change_type: c
                            .get("change_type")
                            .and_then(|v| v.as_str())
                            .unwrap_or("modify")
                            .to_string(),
                        description: c
                            .get("description")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string(),
                        hypothesis_id: c
                            .get("hypothesis_id")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let rationale = payload
            .get("rationale")
            .and_then(|r| r.as_str())
            .unwrap_or("")
            .to_string();

        let hypothesis_ids: Vec<String> =
            analysis.hypotheses.iter().map(|h| h.id.clone()).collect();
        let improvement = serde_json::json!({
            "trigger": "feedback",
            "feedback_summary": analysis
                .problems
                .first()
                .map(|p| p.description.clone())
                .unwrap_or_default(),
            "hypothesis_ids": hypothesis_ids,
            "analyzer_confidence": analysis.confidence_score,
        });

        let version = self
            .prompts
            .create_version(
                agent,
                new_prompt,
                serde_json::to_value(&changes).map_err(|e| VersioningError::Other(e.into()))?,
                improvement,
                "versioner_agent",
            )
            .await
            .map_err(|e| VersioningError::Other(e.into()))?;

        Ok(NewPromptVersion {
            version,
            content: new_prompt.to_string(),
            changes,
            hypothesis_ids,
            rationale,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::llm::{FunctionCall, ToolCall};
    use crate::agent::testing::ScriptedSession;
    use crate::improve::analyzer::{Hypothesis, Problem};

    fn analysis() -> AnalysisResult {
        AnalysisResult {
            problems: vec![Problem {
                id: "P1".to_string(),
                description: "answers are too long".to_string(),
                severity: "important".to_string(),
                examples: vec![],
            }],
            hypotheses: vec![Hypothesis {
                id: "H1".to_string(),
                problem_ids: vec!["P1".to_string()],
                suggestion: "add brevity rule".to_string(),
                expected_effect: "shorter answers".to_string(),
                confidence: 0.8,
            }],
            confidence_score: 0.75,
            raw_analysis: "analysis text".to_string(),
        }
    }

    fn create_call(arguments: &str) -> ChatMessage {
        ChatMessage::assistant_with_tools(
            None,
            vec![ToolCall {
                id: "c1".to_string(),
                r#type: "function".to_string(),
                function: FunctionCall {
                    name: "create_prompt_version".to_string(),
                    arguments: arguments.to_string(),
                },
            }],
        )
    }

    async fn agent(session: ScriptedSession) -> (Arc<PromptVersionStore>, VersionerAgent) {
        let prompts = Arc::new(PromptVersionStore::in_memory().unwrap());
        prompts.ensure_seeded().await.unwrap();
        let agent = VersionerAgent::new(
            Arc::new(session),
            prompts.clone(),
            10,
            MAX_PROMPT_LENGTH,
        );
        (prompts, agent)
    }

    #[tokio::test]
    async fn test_improve_persists_and_activates_new_version() {
        let session = ScriptedSession::new(vec![create_call(
            r#"{"agent_name": "main_agent",
                "new_prompt": "Be brief.",
                "changes": [{"section": "Style", "change_type": "add",
                             "description": "brevity rule", "hypothesis_id": "H1"}],
                "rationale": "user complained about verbosity"}"#,
        )]);
        let (prompts, agent) = agent(session).await;

        let result = agent.improve("main_agent", &analysis()).await.unwrap();
        assert_eq!(result.version, 2);
        assert_eq!(result.changes.len(), 1);
        assert_eq!(result.hypothesis_ids, vec!["H1".to_string()]);
        assert_eq!(prompts.current("main_agent").await.unwrap(), "Be brief.");

        let stored = prompts.get_version("main_agent", 2).await.unwrap();
        assert_eq!(stored.author, "versioner_agent");
        assert_eq!(stored.improvement["analyzer_confidence"], 0.75);
    }

    #[tokio::test]
    async fn test_no_submit_is_hard_error_and_nothing_persisted() {
        let session = ScriptedSession::new(vec![ChatMessage::assistant(
            "The current prompt already looks fine.",
        )]);
        let (prompts, agent) = agent(session).await;

        let err = agent.improve("main_agent", &analysis()).await.unwrap_err();
        assert!(matches!(err, VersioningError::NoVersionCreated(_)));
        assert_eq!(prompts.current_version("main_agent").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_invalid_prompt_is_rejected_then_revised() {
        // First submission is empty; the handler rejects it and the model
        // retries with a valid prompt.
        let session = ScriptedSession::new(vec![
            create_call(r#"{"agent_name": "main_agent", "new_prompt": "   ", "changes": [], "rationale": ""}"#),
            create_call(r#"{"agent_name": "main_agent", "new_prompt": "Be brief.", "changes": [], "rationale": "second try"}"#),
        ]);
        let (prompts, agent) = agent(session).await;

        let result = agent.improve("main_agent", &analysis()).await.unwrap();
        assert_eq!(result.content, "Be brief.");
        assert_eq!(prompts.current_version("main_agent").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_max_turns_surfaces_as_tool_loop_error() {
        let session = ScriptedSession::new(vec![
            create_call(r#"{"agent_name": "main_agent", "new_prompt": "", "changes": [], "rationale": ""}"#),
            create_call(r#"{"agent_name": "main_agent", "new_prompt": "", "changes": [], "rationale": ""}"#),
        ]);
        let prompts = Arc::new(PromptVersionStore::in_memory().unwrap());
        prompts.ensure_seeded().await.unwrap();
        let agent = VersionerAgent::new(Arc::new(session), prompts, 2, MAX_PROMPT_LENGTH);

        let err = agent.improve("main_agent", &analysis()).await.unwrap_err();
        assert!(matches!(err, VersioningError::ToolLoop(_)));
    }

    #[test]
    fn test_validate_prompt_length() {
        let long = "x".repeat(20_001);
        let report = validate_prompt(&long, MAX_PROMPT_LENGTH);
        assert!(!report.valid);
        assert!(report.issues[0].contains("too long"));
        assert_eq!(report.length, 20_001);
    }

    #[test]
    fn test_validate_prompt_empty() {
        let report = validate_prompt("", MAX_PROMPT_LENGTH);
        assert!(!report.valid);
        assert!(report.issues.iter().any(|i| i.contains("empty")));
    }

    #[test]
    fn test_validate_prompt_template_syntax() {
        let report = validate_prompt("Hello {{name}}, **be** good", MAX_PROMPT_LENGTH);
        assert!(!report.valid);
        assert!(report.issues.iter().any(|i| i.contains("template")));
    }

    #[test]
    fn test_validate_prompt_structure_check() {
        let long_flat = "word ".repeat(200);
        let report = validate_prompt(&long_flat, MAX_PROMPT_LENGTH);
        assert!(report.issues.iter().any(|i| i.contains("sections")));

        let long_structured = format!("## Rules\n{}", "word ".repeat(200));
        assert!(validate_prompt(&long_structured, MAX_PROMPT_LENGTH).valid);
    }

    #[test]
    fn test_validate_prompt_ok() {
        let report = validate_prompt("Be helpful and concise.", MAX_PROMPT_LENGTH);
        assert!(report.valid);
        assert!(report.issues.is_empty());
        assert_eq!(report.estimated_tokens, report.length / 4);
    }
}
