//! CLI interface for reprompt

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;

use crate::agent::llm::{ModelSession, OpenRouterClient};
use crate::config::{data_dir, Config};
use crate::feedback::Feedback;
use crate::improve::{AnalyzerAgent, ImprovementOrchestrator, VersionerAgent};
use crate::storage::logs::{feedback_stats, DateRange, JsonlLogStore, LogSink};
use crate::storage::prompts::PromptVersionStore;

const ANALYZER_MAX_TOKENS: u32 = 4096;
const VERSIONER_MAX_TOKENS: u32 = 8192;

#[derive(Parser)]
#[command(name = "reprompt")]
#[command(about = "Self-improving assistant core: feedback-driven prompt versioning", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the current system prompt for an agent
    Prompt {
        /// Agent name
        #[arg(default_value = "main_agent")]
        agent: String,
    },
    /// Show prompt version history
    History {
        /// Agent name
        #[arg(default_value = "main_agent")]
        agent: String,
        /// Maximum versions to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Roll back an agent's prompt to an earlier version
    Rollback {
        /// Version number to roll back to
        version: i64,
        /// Agent name
        #[arg(long, default_value = "main_agent")]
        agent: String,
        /// Reason recorded in the improvement log
        #[arg(long, default_value = "Manual rollback via CLI")]
        reason: String,
    },
    /// Compare two prompt versions
    Diff {
        version_a: i64,
        version_b: i64,
        /// Agent name
        #[arg(long, default_value = "main_agent")]
        agent: String,
    },
    /// Submit explicit feedback and run an improvement cycle
    Feedback {
        /// Feedback text
        text: String,
        /// Agent whose prompt to improve
        #[arg(long, default_value = "main_agent")]
        agent: String,
    },
    /// Show improvement pipeline status and feedback statistics
    Status,
    /// Configure reprompt
    Config {
        /// Set OpenRouter API key
        #[arg(long)]
        set_api_key: Option<String>,
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Prompt { agent } => {
            let prompts = open_prompt_store().await?;
            let version = prompts.current_version(&agent).await?;
            let prompt = prompts.current(&agent).await?;
            println!("# {} (v{})\n\n{}", agent, version, prompt);
        }
        Commands::History { agent, limit } => {
            show_history(&agent, limit).await?;
        }
        Commands::Rollback {
            version,
            agent,
            reason,
        } => {
            rollback(&agent, version, &reason).await?;
        }
        Commands::Diff {
            version_a,
            version_b,
            agent,
        } => {
            let prompts = open_prompt_store().await?;
            let diff = prompts.get_diff(&agent, version_a, version_b).await?;
            if diff.diff.is_empty() {
                println!("v{} and v{} are identical", version_a, version_b);
            } else {
                println!("{}", diff.diff);
                println!("+{} -{}", diff.added_lines, diff.removed_lines);
            }
        }
        Commands::Feedback { text, agent } => {
            submit_feedback(&config, &text, &agent).await?;
        }
        Commands::Status => {
            show_status().await?;
        }
        Commands::Config { set_api_key, show } => {
            if let Some(key) = set_api_key {
                crate::security::keyring::set_api_key(&key)?;
                println!("OpenRouter API key stored securely in keyring.");
            } else if show {
                let contents = toml::to_string_pretty(&config)?;
                println!("{}", contents);
                println!(
                    "api_key = {}",
                    if crate::security::keyring::has_api_key() {
                        "(set)"
                    } else {
                        "(not set)"
                    }
                );
            } else {
                println!("Usage: reprompt config --set-api-key KEY | --show");
            }
        }
    }

    Ok(())
}

async fn open_prompt_store() -> Result<Arc<PromptVersionStore>> {
    let store = PromptVersionStore::new(data_dir()?.join("prompts.db")).await?;
    store.ensure_seeded().await?;
    Ok(Arc::new(store))
}

async fn open_log_store() -> Result<Arc<JsonlLogStore>> {
    Ok(Arc::new(
        JsonlLogStore::new(data_dir()?.join("logs")).await?,
    ))
}

async fn show_history(agent: &str, limit: usize) -> Result<()> {
    let prompts = open_prompt_store().await?;
    let current = prompts.current_version(agent).await?;
    let history = prompts.get_history(agent, limit).await?;

    if history.is_empty() {
        println!("No version history for '{}'", agent);
        return Ok(());
    }

    println!("Prompt history for {}:", agent);
    for entry in history {
        let marker = if entry.version == current { " [current]" } else { "" };
        let changes = if entry.changes_summary.is_empty() {
            "(initial)".to_string()
        } else {
            entry.changes_summary.join(", ")
        };
        println!(
            "  v{}{}  {}  {}  {}",
            entry.version,
            marker,
            &entry.created_at[..entry.created_at.len().min(19)],
            entry.author,
            changes
        );
    }
    Ok(())
}

async fn rollback(agent: &str, version: i64, reason: &str) -> Result<()> {
    let prompts = open_prompt_store().await?;
    let logs = open_log_store().await?;

    if prompts.rollback(agent, version, reason).await? {
        logs.log_improvement_event(
            "rollback",
            serde_json::json!({
                "agent": agent,
                "target_version": version,
                "reason": reason,
            }),
        )
        .await?;
        println!("Rolled back {} to v{}", agent, version);
    } else {
        anyhow::bail!("version {} not found for agent '{}'", version, agent);
    }
    Ok(())
}

/// Explicit feedback always runs the pipeline: the confidence gate is passed
/// a zero threshold.
async fn submit_feedback(config: &Config, text: &str, target_agent: &str) -> Result<()> {
    let prompts = open_prompt_store().await?;
    let logs = open_log_store().await?;

    let client = OpenRouterClient::from_keyring()
        .context("API key required. Run 'reprompt config --set-api-key YOUR_KEY' first.")?;
    let analyzer_session = Arc::new(ModelSession::new(
        client.clone(),
        &config.models.analyzer,
        ANALYZER_MAX_TOKENS,
    ));
    let versioner_session = Arc::new(ModelSession::new(
        client,
        &config.models.versioner,
        VERSIONER_MAX_TOKENS,
    ));

    let analyzer = AnalyzerAgent::new(
        analyzer_session,
        prompts.clone(),
        logs.clone() as Arc<dyn LogSink>,
        config.improvement.max_turns,
    );
    let versioner = VersionerAgent::new(
        versioner_session,
        prompts.clone(),
        config.improvement.max_turns,
        config.improvement.max_prompt_length,
    );
    let orchestrator =
        ImprovementOrchestrator::new(analyzer, versioner, prompts.clone(), logs.clone());

    let feedback = Feedback::explicit(text);
    let recent_logs = logs
        .get_recent(config.improvement.recent_logs_limit, None, DateRange::LastWeek)
        .await?;

    println!("Processing feedback...");
    let result = orchestrator
        .run(&feedback, &recent_logs, target_agent, 0.0)
        .await;

    if result.success {
        println!(
            "Improvement applied: v{} -> v{} ({} ms)",
            result.old_version,
            result.new_version.unwrap_or(result.old_version),
            result.duration_ms
        );
        for change in &result.changes_summary {
            println!("  - {}", change);
        }
    } else {
        println!(
            "Improvement did not apply: {}",
            result.error.as_deref().unwrap_or("unknown reason")
        );
    }
    Ok(())
}

async fn show_status() -> Result<()> {
    let prompts = open_prompt_store().await?;
    let logs = open_log_store().await?;

    println!(
        "Prompt version (main_agent): v{}",
        prompts.current_version("main_agent").await?
    );

    let stats = feedback_stats(logs.as_ref(), DateRange::LastWeek).await?;
    println!("\nFeedback over the last week:");
    println!("  turns: {}", stats.total_turns);
    println!(
        "  with feedback: {} ({:.0}%)",
        stats.turns_with_feedback,
        stats.feedback_rate * 100.0
    );
    println!("  positive: {}", stats.positive_count);
    println!("  negative: {}", stats.negative_count);

    let events = logs.get_improvement_events(10).await?;
    if events.is_empty() {
        println!("\nNo improvement events recorded.");
    } else {
        println!("\nRecent improvement events:");
        for event in events {
            let ts = event
                .get("timestamp")
                .and_then(|t| t.as_str())
                .unwrap_or("");
            let kind = event.get("type").and_then(|t| t.as_str()).unwrap_or("?");
            println!("  {}  {}", &ts[..ts.len().min(19)], kind);
        }
    }
    Ok(())
}
