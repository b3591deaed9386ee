//! End-to-end tests for the improvement pipeline with a scripted reasoning
//! backend: feedback in, versioned prompt (or clean failure) out.

use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tempfile::TempDir;

use reprompt::agent::llm::{ChatMessage, FunctionCall, ReasoningSession, ToolCall, ToolDefinition};
use reprompt::feedback::{Feedback, FeedbackCategory, FeedbackClassifier, FeedbackType};
use reprompt::improve::{AnalyzerAgent, ImprovementOrchestrator, VersionerAgent, MAX_PROMPT_LENGTH};
use reprompt::storage::logs::{DateRange, JsonlLogStore, LogSink, NewTurn};
use reprompt::storage::prompts::PromptVersionStore;

/// Returns pre-built assistant turns in order; errors when exhausted.
struct ScriptedSession {
    responses: Mutex<VecDeque<ChatMessage>>,
}

impl ScriptedSession {
    fn new(responses: Vec<ChatMessage>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
        }
    }
}

#[async_trait]
impl ReasoningSession for ScriptedSession {
    async fn send(
        &self,
        _system_prompt: &str,
        _messages: &[ChatMessage],
        _tools: &[ToolDefinition],
    ) -> Result<ChatMessage> {
        match self.responses.lock().unwrap().pop_front() {
            Some(msg) => Ok(msg),
            None => bail!("scripted session exhausted"),
        }
    }
}

fn tool_call(name: &str, arguments: &str) -> ChatMessage {
    ChatMessage::assistant_with_tools(
        None,
        vec![ToolCall {
            id: "call_1".to_string(),
            r#type: "function".to_string(),
            function: FunctionCall {
                name: name.to_string(),
                arguments: arguments.to_string(),
            },
        }],
    )
}

fn submit_analysis(confidence: f64) -> ChatMessage {
    tool_call(
        "submit_analysis",
        &format!(
            r#"{{"problems": [{{"id": "P1", "description": "answers too verbose",
                               "severity": "important"}}],
                 "hypotheses": [{{"id": "H1", "problem_ids": ["P1"],
                                  "suggestion": "add a brevity rule",
                                  "expected_effect": "shorter answers",
                                  "confidence": 0.8}}],
                 "overall_confidence": {confidence}}}"#
        ),
    )
}

fn create_version(new_prompt: &str) -> ChatMessage {
    tool_call(
        "create_prompt_version",
        &serde_json::json!({
            "agent_name": "main_agent",
            "new_prompt": new_prompt,
            "changes": [{"section": "Style", "change_type": "add",
                         "description": "brevity rule", "hypothesis_id": "H1"}],
            "rationale": "verbosity feedback"
        })
        .to_string(),
    )
}

struct Pipeline {
    _dir: TempDir,
    prompts: Arc<PromptVersionStore>,
    logs: Arc<JsonlLogStore>,
    orchestrator: ImprovementOrchestrator,
}

async fn pipeline(analyzer_script: Vec<ChatMessage>, versioner_script: Vec<ChatMessage>) -> Pipeline {
    let dir = TempDir::new().unwrap();
    let prompts = Arc::new(PromptVersionStore::in_memory().unwrap());
    prompts.ensure_seeded().await.unwrap();
    let logs = Arc::new(JsonlLogStore::new(dir.path()).await.unwrap());

    let analyzer = AnalyzerAgent::new(
        Arc::new(ScriptedSession::new(analyzer_script)),
        prompts.clone(),
        logs.clone(),
        10,
    );
    let versioner = VersionerAgent::new(
        Arc::new(ScriptedSession::new(versioner_script)),
        prompts.clone(),
        10,
        MAX_PROMPT_LENGTH,
    );
    let orchestrator =
        ImprovementOrchestrator::new(analyzer, versioner, prompts.clone(), logs.clone());

    Pipeline {
        _dir: dir,
        prompts,
        logs,
        orchestrator,
    }
}

async fn detected_feedback(text: &str) -> Feedback {
    FeedbackClassifier::new()
        .detect(text)
        .await
        .expect("message should classify as feedback")
}

#[tokio::test]
async fn detected_negative_feedback_drives_a_full_improvement_cycle() {
    let p = pipeline(
        vec![
            // Analyzer looks around once, then submits.
            tool_call("search_logs", r#"{"query": "verbose"}"#),
            submit_analysis(0.9),
        ],
        vec![create_version("You are a helpful assistant.\n\n## Style\n- Be brief.")],
    )
    .await;

    // Seed a couple of logged turns so the analyzer has material.
    let feedback = detected_feedback("это слишком длинно и непонятно").await;
    assert_eq!(feedback.feedback_type, FeedbackType::Negative);
    assert_eq!(feedback.category, FeedbackCategory::Verbosity);
    assert!(feedback.should_trigger_improvement(0.8));

    p.logs
        .log_turn(NewTurn {
            session_id: "s1".to_string(),
            user_message: "расскажи про rust".to_string(),
            assistant_response: "очень длинный ответ...".to_string(),
            prompt_version: 1,
            feedback: Some(feedback.clone()),
            ..Default::default()
        })
        .await
        .unwrap();
    let recent = p.logs.get_recent(50, None, DateRange::LastWeek).await.unwrap();

    let result = p.orchestrator.run(&feedback, &recent, "main_agent", 0.6).await;

    assert!(result.success, "cycle should succeed: {:?}", result.error);
    assert_eq!(result.old_version, 1);
    assert_eq!(result.new_version, Some(2));
    assert!(p
        .prompts
        .current("main_agent")
        .await
        .unwrap()
        .contains("Be brief"));

    // The trail covers the whole run, oldest first.
    let events = p.logs.get_improvement_events(20).await.unwrap();
    let types: Vec<&str> = events
        .iter()
        .rev()
        .filter_map(|e| e.get("type").and_then(|t| t.as_str()))
        .collect();
    assert_eq!(
        types,
        vec![
            "improvement_started",
            "analysis_started",
            "analysis_completed",
            "versioning_started",
            "version_created",
            "improvement_completed",
        ]
    );
}

#[tokio::test]
async fn low_confidence_analysis_never_reaches_the_versioner() {
    // Versioner script is empty: any call to it would fail the run loudly.
    let p = pipeline(vec![submit_analysis(0.4)], vec![]).await;

    let feedback = detected_feedback("this is wrong").await;
    let result = p.orchestrator.run(&feedback, &[], "main_agent", 0.6).await;

    assert!(!result.success);
    assert_eq!(result.new_version, None);
    assert_eq!(p.prompts.current_version("main_agent").await.unwrap(), 1);

    let events = p.logs.get_improvement_events(20).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.get("type").and_then(|t| t.as_str()) == Some("improvement_skipped")));
}

#[tokio::test]
async fn explicit_feedback_bypasses_the_confidence_gate() {
    let p = pipeline(
        vec![submit_analysis(0.3)],
        vec![create_version("Be concise.")],
    )
    .await;

    let feedback = Feedback::explicit("the tone is too formal");
    assert!(feedback.should_trigger_improvement(0.99));

    // Explicit path passes a zero threshold.
    let result = p.orchestrator.run(&feedback, &[], "main_agent", 0.0).await;

    assert!(result.success);
    assert_eq!(p.prompts.current_version("main_agent").await.unwrap(), 2);
}

#[tokio::test]
async fn versioner_refusing_to_submit_fails_without_persisting() {
    let p = pipeline(
        vec![submit_analysis(0.9)],
        vec![ChatMessage::assistant("the prompt already handles this")],
    )
    .await;

    let feedback = detected_feedback("too long").await;
    let result = p.orchestrator.run(&feedback, &[], "main_agent", 0.6).await;

    assert!(!result.success);
    assert!(result.error.is_some());
    assert_eq!(p.prompts.current_version("main_agent").await.unwrap(), 1);

    let events = p.logs.get_improvement_events(20).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.get("type").and_then(|t| t.as_str()) == Some("versioning_failed")));
}

#[tokio::test]
async fn oversized_prompt_is_rejected_until_the_model_fixes_it() {
    let oversized = "## Rules\n".to_string() + &"x".repeat(MAX_PROMPT_LENGTH + 1);
    let p = pipeline(
        vec![submit_analysis(0.9)],
        vec![
            create_version(&oversized),
            create_version("## Rules\nBe brief."),
        ],
    )
    .await;

    let feedback = detected_feedback("too long").await;
    let result = p.orchestrator.run(&feedback, &[], "main_agent", 0.6).await;

    assert!(result.success);
    assert_eq!(
        p.prompts.current("main_agent").await.unwrap(),
        "## Rules\nBe brief."
    );
    // Only the valid prompt was persisted.
    assert_eq!(p.prompts.get_history("main_agent", 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn rollback_after_improvement_restores_the_old_prompt() {
    let p = pipeline(
        vec![submit_analysis(0.9)],
        vec![create_version("Be brief.")],
    )
    .await;

    let original = p.prompts.current("main_agent").await.unwrap();
    let feedback = detected_feedback("too long").await;
    let result = p.orchestrator.run(&feedback, &[], "main_agent", 0.6).await;
    assert!(result.success);
    assert_eq!(p.prompts.current("main_agent").await.unwrap(), "Be brief.");

    assert!(p.prompts.rollback("main_agent", 1, "regression").await.unwrap());
    assert_eq!(p.prompts.current("main_agent").await.unwrap(), original);
    // Both versions survive the rollback.
    assert_eq!(p.prompts.get_history("main_agent", 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn backend_failure_becomes_a_failed_result_not_a_panic() {
    // Empty analyzer script: the first backend call errors.
    let p = pipeline(vec![], vec![]).await;

    let feedback = detected_feedback("too long").await;
    let result = p.orchestrator.run(&feedback, &[], "main_agent", 0.6).await;

    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("exhausted"));
    assert_eq!(p.prompts.current_version("main_agent").await.unwrap(), 1);

    let events = p.logs.get_improvement_events(20).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.get("type").and_then(|t| t.as_str()) == Some("improvement_failed")));
}
