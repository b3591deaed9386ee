//! Improvement pipeline orchestration
//!
//! Analyzer -> confidence gate -> versioner, with every step recorded in the
//! improvement event log. `run` never returns an error: any failure becomes
//! an `ImprovementResult` with `success: false` so the calling conversation
//! is never disrupted.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::feedback::Feedback;
use crate::improve::analyzer::AnalyzerAgent;
use crate::improve::truncate_chars;
use crate::improve::versioner::VersionerAgent;
use crate::storage::logs::LogSink;
use crate::storage::prompts::PromptVersionStore;

/// Default minimum analyzer confidence required to apply a change.
pub const DEFAULT_IMPROVEMENT_CONFIDENCE: f64 = 0.6;

/// Outcome of one improvement cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementResult {
    pub success: bool,
    pub old_version: i64,
    pub new_version: Option<i64>,
    pub analysis_summary: String,
    pub changes_summary: Vec<String>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Coordinates analyzer and versioner into one improvement cycle.
pub struct ImprovementOrchestrator {
    analyzer: AnalyzerAgent,
    versioner: VersionerAgent,
    prompts: Arc<PromptVersionStore>,
    logs: Arc<dyn LogSink>,
}

impl ImprovementOrchestrator {
    pub fn new(
        analyzer: AnalyzerAgent,
        versioner: VersionerAgent,
        prompts: Arc<PromptVersionStore>,
        logs: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            analyzer,
            versioner,
            prompts,
            logs,
        }
    }

    /// Run the full improvement cycle.
    ///
    /// `improvement_threshold` gates on the analyzer's confidence; explicit
    /// user feedback passes 0.0 to always proceed past the gate.
    pub async fn run(
        &self,
        feedback: &Feedback,
        recent_logs: &[Value],
        target_agent: &str,
        improvement_threshold: f64,
    ) -> ImprovementResult {
        let start = Instant::now();
        let old_version = self
            .prompts
            .current_version(target_agent)
            .await
            .unwrap_or(0);

        match self
            .run_inner(feedback, recent_logs, target_agent, improvement_threshold, old_version, start)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                let duration_ms = start.elapsed().as_millis() as u64;
                error!(error = %e, target_agent, "improvement cycle failed");
                self.log_event(
                    "improvement_failed",
                    serde_json::json!({
                        "error": e.to_string(),
                        "duration_ms": duration_ms,
                    }),
                )
                .await;
                ImprovementResult {
                    success: false,
                    old_version,
                    new_version: None,
                    analysis_summary: String::new(),
                    changes_summary: vec![],
                    duration_ms,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn run_inner(
        &self,
        feedback: &Feedback,
        recent_logs: &[Value],
        target_agent: &str,
        improvement_threshold: f64,
        old_version: i64,
        start: Instant,
    ) -> anyhow::Result<ImprovementResult> {
        self.log_event(
            "improvement_started",
            serde_json::json!({
                "trigger": "feedback",
                "feedback_type": feedback.feedback_type.as_str(),
                "feedback_category": feedback.category.as_str(),
                "feedback_text": truncate_chars(&feedback.raw_text, 200),
                "target_agent": target_agent,
                "logs_count": recent_logs.len(),
            }),
        )
        .await;

        self.log_event(
            "analysis_started",
            serde_json::json!({ "target_agent": target_agent }),
        )
        .await;

        let current_prompt = self.prompts.current(target_agent).await?;
        let analysis = self
            .analyzer
            .analyze(feedback, recent_logs, &current_prompt)
            .await?;

        self.log_event(
            "analysis_completed",
            serde_json::json!({
                "problems_count": analysis.problems.len(),
                "hypotheses_count": analysis.hypotheses.len(),
                "confidence": analysis.confidence_score,
            }),
        )
        .await;

        if analysis.confidence_score < improvement_threshold {
            warn!(
                confidence = analysis.confidence_score,
                threshold = improvement_threshold,
                "improvement skipped: low confidence"
            );
            self.log_event(
                "improvement_skipped",
                serde_json::json!({
                    "reason": "low_confidence",
                    "confidence": analysis.confidence_score,
                    "threshold": improvement_threshold,
                }),
            )
            .await;

            return Ok(ImprovementResult {
                success: false,
                old_version,
                new_version: None,
                analysis_summary: format!(
                    "Analysis confidence too low: {:.2}",
                    analysis.confidence_score
                ),
                changes_summary: vec![],
                duration_ms: start.elapsed().as_millis() as u64,
                error: Some("Low confidence - improvement skipped".to_string()),
            });
        }

        self.log_event(
            "versioning_started",
            serde_json::json!({
                "target_agent": target_agent,
                "hypotheses_count": analysis.hypotheses.len(),
            }),
        )
        .await;

        let new_version = match self.versioner.improve(target_agent, &analysis).await {
            Ok(v) => v,
            Err(e) => {
                self.log_event(
                    "versioning_failed",
                    serde_json::json!({ "error": e.to_string() }),
                )
                .await;
                return Err(e.into());
            }
        };

        self.log_event(
            "version_created",
            serde_json::json!({
                "agent": target_agent,
                "old_version": old_version,
                "new_version": new_version.version,
                "changes_count": new_version.changes.len(),
                "rationale": truncate_chars(&new_version.rationale, 500),
            }),
        )
        .await;

        let duration_ms = start.elapsed().as_millis() as u64;
        self.log_event(
            "improvement_completed",
            serde_json::json!({
                "success": true,
                "duration_ms": duration_ms,
                "old_version": old_version,
                "new_version": new_version.version,
            }),
        )
        .await;

        info!(
            target_agent,
            old_version,
            new_version = new_version.version,
            duration_ms,
            "improvement cycle completed"
        );

        Ok(ImprovementResult {
            success: true,
            old_version,
            new_version: Some(new_version.version),
            analysis_summary: truncate_chars(&analysis.raw_analysis, 500),
            changes_summary: new_version.changes.iter().map(|c| c.description.clone()).collect(),
            duration_ms,
            error: None,
        })
    }

    /// Trail events are best effort; a logging failure must not abort the run.
    async fn log_event(&self, event_type: &str, data: Value) {
        if let Err(e) = self.logs.log_improvement_event(event_type, data).await {
            warn!(error = %e, event_type, "failed to write improvement event");
        }
    }

    /// Run the cycle on a background task, detached from the conversation.
    pub fn spawn(
        self: Arc<Self>,
        feedback: Feedback,
        recent_logs: Vec<Value>,
        target_agent: String,
        improvement_threshold: f64,
    ) -> JoinHandle<ImprovementResult> {
        tokio::spawn(async move {
            self.run(&feedback, &recent_logs, &target_agent, improvement_threshold)
                .await
        })
    }
}
