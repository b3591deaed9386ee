//! Analyzer agent: reviews logs and feedback, formulates improvement
//! hypotheses, and submits a structured analysis through its terminal tool.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::agent::llm::{ChatMessage, ReasoningSession, ToolDefinition};
use crate::agent::tool_loop::{run_tool_loop, LoopOutcome, ToolLoopConfig, ToolRegistry};
use crate::feedback::Feedback;
use crate::improve::truncate_chars;
use crate::storage::logs::{DateRange, LogSink};
use crate::storage::prompts::PromptVersionStore;

/// Caps on tool result sizes fed back to the model.
const SEARCH_RESULT_CAP: usize = 20;
const SEARCH_SCAN_LIMIT: usize = 100;
const RAW_LOGS_IN_SEED: usize = 10;
const NEGATIVE_EXCERPTS_IN_SUMMARY: usize = 5;

/// An identified problem from analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Problem {
    pub id: String,
    pub description: String,
    /// "critical", "important", or "cosmetic".
    pub severity: String,
    #[serde(default)]
    pub examples: Vec<String>,
}

/// A proposed prompt change and its expected effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hypothesis {
    pub id: String,
    #[serde(default)]
    pub problem_ids: Vec<String>,
    pub suggestion: String,
    pub expected_effect: String,
    pub confidence: f64,
}

/// Structured output of an analysis run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub problems: Vec<Problem>,
    pub hypotheses: Vec<Hypothesis>,
    pub confidence_score: f64,
    pub raw_analysis: String,
}

/// Agent that analyzes conversation logs against triggering feedback.
pub struct AnalyzerAgent {
    session: Arc<dyn ReasoningSession>,
    prompts: Arc<PromptVersionStore>,
    logs: Arc<dyn LogSink>,
    max_turns: usize,
}

impl AnalyzerAgent {
    pub fn new(
        session: Arc<dyn ReasoningSession>,
        prompts: Arc<PromptVersionStore>,
        logs: Arc<dyn LogSink>,
        max_turns: usize,
    ) -> Self {
        Self {
            session,
            prompts,
            logs,
            max_turns,
        }
    }

    fn tools() -> Vec<ToolDefinition> {
        vec![
            ToolDefinition::function(
                "search_logs",
                "Search conversation logs by keywords or patterns",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "query": {
                            "type": "string",
                            "description": "Search query (keywords or phrases)"
                        },
                        "date_range": {
                            "type": "string",
                            "enum": ["last_day", "last_week", "last_month", "all"],
                            "description": "Date range to search"
                        },
                        "feedback_type": {
                            "type": "string",
                            "enum": ["positive", "negative", "all"],
                            "description": "Filter by feedback type"
                        }
                    },
                    "required": ["query"]
                }),
            ),
            ToolDefinition::function(
                "get_conversation",
                "Get full conversation by session ID",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "session_id": {
                            "type": "string",
                            "description": "Session ID to retrieve"
                        }
                    },
                    "required": ["session_id"]
                }),
            ),
            ToolDefinition::function(
                "get_prompt_history",
                "Get history of prompt versions for an agent",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "agent_name": {
                            "type": "string",
                            "enum": ["main_agent", "analyzer", "versioner"],
                            "description": "Agent name"
                        },
                        "limit": {
                            "type": "integer",
                            "description": "Maximum versions to return",
                            "default": 10
                        }
                    },
                    "required": ["agent_name"]
                }),
            ),
            ToolDefinition::function(
                "submit_analysis",
                "Submit the final analysis result",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "problems": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "id": {"type": "string"},
                                    "description": {"type": "string"},
                                    "severity": {
                                        "type": "string",
                                        "enum": ["critical", "important", "cosmetic"]
                                    },
                                    "examples": {
                                        "type": "array",
                                        "items": {"type": "string"}
                                    }
                                },
                                "required": ["id", "description", "severity"]
                            }
                        },
                        "hypotheses": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "id": {"type": "string"},
                                    "problem_ids": {
                                        "type": "array",
                                        "items": {"type": "string"}
                                    },
                                    "suggestion": {"type": "string"},
                                    "expected_effect": {"type": "string"},
                                    "confidence": {"type": "number"}
                                },
                                "required": ["id", "suggestion", "expected_effect", "confidence"]
                            }
                        },
                        "overall_confidence": {
                            "type": "number",
                            "description": "Overall confidence in the analysis (0.0-1.0)"
                        }
                    },
                    "required": ["problems", "hypotheses", "overall_confidence"]
                }),
            ),
        ]
    }

    fn registry(&self) -> ToolRegistry {
        let mut registry = ToolRegistry::new();

        let logs = self.logs.clone();
        registry.register("search_logs", move |input| {
            let logs = logs.clone();
            Box::pin(async move {
                let query = input
                    .get("query")
                    .and_then(|q| q.as_str())
                    .ok_or_else(|| "missing required field 'query'".to_string())?
                    .to_string();
                let date_range = DateRange::parse(
                    input.get("date_range").and_then(|d| d.as_str()).unwrap_or("last_week"),
                );
                let mut results = logs
                    .search(&query, date_range, SEARCH_SCAN_LIMIT)
                    .await
                    .map_err(|e| e.to_string())?;

                if let Some(wanted) = input
                    .get("feedback_type")
                    .and_then(|f| f.as_str())
                    .filter(|f| *f != "all")
                {
                    results.retain(|entry| {
                        entry
                            .get("feedback")
                            .and_then(|f| f.get("type"))
                            .and_then(|t| t.as_str())
                            == Some(wanted)
                    });
                }

                let total = results.len();
                results.truncate(SEARCH_RESULT_CAP);
                Ok(serde_json::json!({ "results": results, "total": total }))
            })
        });

        let logs = self.logs.clone();
        registry.register("get_conversation", move |input| {
            let logs = logs.clone();
            Box::pin(async move {
                let session_id = input
                    .get("session_id")
                    .and_then(|s| s.as_str())
                    .ok_or_else(|| "missing required field 'session_id'".to_string())?
                    .to_string();
                let conversation = logs
                    .get_session(&session_id)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(serde_json::json!({ "conversation": conversation }))
            })
        });

        let prompts = self.prompts.clone();
        registry.register("get_prompt_history", move |input| {
            let prompts = prompts.clone();
            Box::pin(async move {
                let agent = input
                    .get("agent_name")
                    .and_then(|a| a.as_str())
                    .ok_or_else(|| "missing required field 'agent_name'".to_string())?
                    .to_string();
                let limit = input
                    .get("limit")
                    .and_then(|l| l.as_u64())
                    .unwrap_or(10) as usize;
                let history = prompts
                    .get_history(&agent, limit)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(serde_json::json!({ "history": history }))
            })
        });

        registry.register("submit_analysis", |_input| {
            Box::pin(async { Ok(serde_json::json!({ "status": "analysis_submitted" })) })
        });

        registry
    }

    /// Analyze feedback against recent logs and the target agent's prompt.
    ///
    /// Falls back to a synthesized low-confidence result when the model stops
    /// without submitting, so the caller's confidence gate decides.
    pub async fn analyze(
        &self,
        feedback: &Feedback,
        recent_logs: &[Value],
        current_prompt: &str,
    ) -> Result<AnalysisResult> {
        let system_prompt = self.prompts.current("analyzer").await?;
        let logs_summary = summarize_logs(recent_logs);
        let raw_slice = &recent_logs[..recent_logs.len().min(RAW_LOGS_IN_SEED)];

        let seed = format!(
            r#"Analyze the following data and formulate improvement hypotheses.

## Triggering Feedback
{feedback_json}

## Current System Prompt (main_agent)
```
{current_prompt}
```

## Recent Conversation Logs Summary
{logs_summary}

## Raw Logs (last {raw_count} interactions)
{raw_logs}

Use the available tools to search for more context if needed, then submit your analysis using submit_analysis.

Focus on:
1. What specific problem does the feedback indicate?
2. Are there similar issues in the logs?
3. What changes to the prompt could address this?
"#,
            feedback_json = feedback.to_json(),
            raw_count = raw_slice.len(),
            raw_logs = serde_json::to_string_pretty(raw_slice)?,
        );

        let config = ToolLoopConfig {
            system_prompt,
            tools: Self::tools(),
            terminal_tool: "submit_analysis".to_string(),
            max_turns: self.max_turns,
        };
        let registry = self.registry();

        let outcome = run_tool_loop(
            self.session.as_ref(),
            &registry,
            &config,
            vec![ChatMessage::user(seed)],
        )
        .await?;

        match outcome {
            LoopOutcome::Submitted {
                payload,
                turns,
                transcript,
            } => {
                debug!(turns, "analysis submitted");
                Ok(parse_analysis(&payload, transcript))
            }
            LoopOutcome::NoSubmit { text, turns } => {
                warn!(turns, "analyzer stopped without submitting, using fallback result");
                Ok(fallback_result(feedback, text))
            }
        }
    }
}

fn summarize_logs(logs: &[Value]) -> String {
    let with_feedback: Vec<&Value> = logs
        .iter()
        .filter(|l| l.get("feedback").map(|f| !f.is_null()).unwrap_or(false))
        .collect();
    let negative: Vec<&&Value> = with_feedback
        .iter()
        .filter(|l| {
            l.get("feedback")
                .and_then(|f| f.get("type"))
                .and_then(|t| t.as_str())
                == Some("negative")
        })
        .collect();

    let mut summary = format!(
        "\n- Total interactions: {}\n- Interactions with feedback: {}\n- Negative feedback count: {}\n",
        logs.len(),
        with_feedback.len(),
        negative.len()
    );

    if !negative.is_empty() {
        summary.push_str("\nRecent negative feedback:\n");
        for log in negative.iter().take(NEGATIVE_EXCERPTS_IN_SUMMARY) {
            let fb = log.get("feedback").cloned().unwrap_or(Value::Null);
            let category = fb.get("category").and_then(|c| c.as_str()).unwrap_or("general");
            let text = fb.get("raw_text").and_then(|t| t.as_str()).unwrap_or("");
            summary.push_str(&format!("- [{}] {}\n", category, truncate_chars(text, 100)));
        }
    }

    summary
}

/// Parse the submit_analysis payload, filling defaults for missing fields.
fn parse_analysis(payload: &Value, raw_analysis: String) -> AnalysisResult {
    let problems = payload
        .get("problems")
        .and_then(|p| p.as_array())
        .map(|arr| {
            arr.iter()
                .enumerate()
                .map(|(i, p)| Problem {
                    id: p
                        .get("id")
                        .and_then(|v| v.as_str())
                        .map(String::from)
                        .unwrap_or_else(|| format!("P{}", i)),
                    description: p
                        .get("description")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    severity: p
                        .get("severity")
                        .and_then(|v| v.as_str())
                        .unwrap_or("important")
                        .to_string(),
                    examples: p
                        .get("examples")
                        .and_then(|v| v.as_array())
                        .map(|arr| {
                            arr.iter()
                                .filter_map(|e| e.as_str().map(String::from))
                                .collect()
                        })
                        .unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default();

    let hypotheses = payload
        .get("hypotheses")
        .and_then(|h| h.as_array())
        .map(|arr| {
            arr.iter()
                .enumerate()
                .map(|(i, h)| Hypothesis {
                    id: h
                        .get("id")
                        .and_then(|v| v.as_str())
                        .map(String::from)
                        .unwrap_or_else(|| format!("H{}", i)),
                    problem_ids: h
                        .get("problem_ids")
                        .and_then(|v| v.as_array())
                        .map(|arr| {
                            arr.iter()
                                .filter_map(|p| p.as_str().map(String::from))
                                .collect()
                        })
                        .unwrap_or_default(),
                    suggestion: h
                        .get("suggestion")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    expected_effect: h
                        .get("expected_effect")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    confidence: h
                        .get("confidence")
                        .and_then(|v| v.as_f64())
                        .unwrap_or(0.5)
                        .clamp(0.0, 1.0),
                })
                .collect()
        })
        .unwrap_or_default();

    AnalysisResult {
        problems,
        hypotheses,
        confidence_score: payload
            .get("overall_confidence")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.5)
            .clamp(0.0, 1.0),
        raw_analysis,
    }
}

/// Synthesized result when the analyzer never submitted. Confidence is set
/// below the default gate so it only proceeds when the caller lowered it.
fn fallback_result(feedback: &Feedback, raw_analysis: String) -> AnalysisResult {
    AnalysisResult {
        problems: vec![Problem {
            id: "P1".to_string(),
            description: format!("User feedback: {}", feedback.raw_text),
            severity: "important".to_string(),
            examples: vec![feedback.raw_text.clone()],
        }],
        hypotheses: vec![Hypothesis {
            id: "H1".to_string(),
            problem_ids: vec!["P1".to_string()],
            suggestion: format!("Address feedback about {}", feedback.category.as_str()),
            expected_effect: "Improved user satisfaction".to_string(),
            confidence: 0.6,
        }],
        confidence_score: 0.5,
        raw_analysis,
    }
}
