//! Conversation and improvement event logs
//!
//! JSONL files partitioned by day:
//!   logs/conversations/2026-08-29.jsonl
//!   logs/improvements/2026-08-29.jsonl

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::feedback::Feedback;

/// A single logged conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnLog {
    pub timestamp: String,
    pub session_id: String,
    pub turn_id: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub user_message: String,
    pub assistant_response: String,
    pub prompt_version: i64,
    pub model: String,
    pub tokens: Value,
    pub latency_ms: u64,
    pub feedback: Option<Feedback>,
}

/// Input for logging a turn; the sink assigns timestamp and turn id.
#[derive(Debug, Clone)]
pub struct NewTurn {
    pub session_id: String,
    pub user_message: String,
    pub assistant_response: String,
    pub prompt_version: i64,
    pub model: String,
    pub tokens: Value,
    pub latency_ms: u64,
    pub feedback: Option<Feedback>,
}

impl Default for NewTurn {
    fn default() -> Self {
        Self {
            session_id: String::new(),
            user_message: String::new(),
            assistant_response: String::new(),
            prompt_version: 0,
            model: String::new(),
            tokens: serde_json::json!({}),
            latency_ms: 0,
            feedback: None,
        }
    }
}

/// Date window for log queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DateRange {
    LastDay,
    #[default]
    LastWeek,
    LastMonth,
    All,
}

impl DateRange {
    pub fn parse(s: &str) -> Self {
        match s {
            "last_day" => DateRange::LastDay,
            "last_week" => DateRange::LastWeek,
            "last_month" => DateRange::LastMonth,
            _ => DateRange::All,
        }
    }

    fn start_date(&self, today: NaiveDate) -> NaiveDate {
        match self {
            DateRange::LastDay => today - Duration::days(1),
            DateRange::LastWeek => today - Duration::days(7),
            DateRange::LastMonth => today - Duration::days(30),
            DateRange::All => NaiveDate::from_ymd_opt(2020, 1, 1)
                .unwrap_or(NaiveDate::MIN),
        }
    }
}

/// Aggregate feedback statistics over a date window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackStats {
    pub total_turns: usize,
    pub turns_with_feedback: usize,
    pub positive_count: usize,
    pub negative_count: usize,
    pub feedback_rate: f64,
    pub positive_rate: f64,
}

/// Append-only sink for conversation turns and improvement events, with
/// the query surface the analysis tools need.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Append one conversation turn.
    async fn log_turn(&self, turn: NewTurn) -> Result<TurnLog>;

    /// Append one improvement pipeline event.
    async fn log_improvement_event(&self, event_type: &str, data: Value) -> Result<()>;

    /// Recent conversation entries, newest file first, optionally filtered
    /// by feedback type.
    async fn get_recent(
        &self,
        limit: usize,
        feedback_type: Option<&str>,
        date_range: DateRange,
    ) -> Result<Vec<Value>>;

    /// All turns of one session, ordered by turn id.
    async fn get_session(&self, session_id: &str) -> Result<Vec<Value>>;

    /// Case-insensitive substring search over raw log lines.
    async fn search(&self, query: &str, date_range: DateRange, limit: usize) -> Result<Vec<Value>>;

    /// Recent improvement events, newest file first.
    async fn get_improvement_events(&self, limit: usize) -> Result<Vec<Value>>;
}

/// JSONL-on-disk implementation of [`LogSink`].
pub struct JsonlLogStore {
    conversations_path: PathBuf,
    improvements_path: PathBuf,
    turn_counters: Mutex<HashMap<String, u64>>,
}

impl JsonlLogStore {
    pub async fn new(base_path: impl AsRef<Path>) -> Result<Self> {
        let base = base_path.as_ref();
        let conversations_path = base.join("conversations");
        let improvements_path = base.join("improvements");
        tokio::fs::create_dir_all(&conversations_path)
            .await
            .context("Failed to create conversations log directory")?;
        tokio::fs::create_dir_all(&improvements_path)
            .await
            .context("Failed to create improvements log directory")?;

        Ok(Self {
            conversations_path,
            improvements_path,
            turn_counters: Mutex::new(HashMap::new()),
        })
    }

    fn next_turn_id(&self, session_id: &str) -> u64 {
        let mut counters = self
            .turn_counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let counter = counters.entry(session_id.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    async fn append_line(&self, path: &Path, entry: &Value) -> Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    fn today_file(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.jsonl", Utc::now().date_naive()))
    }

    /// Files within the range, newest first. Non-date filenames are skipped.
    async fn log_files(&self, dir: &Path, date_range: DateRange) -> Result<Vec<PathBuf>> {
        let start = date_range.start_date(Utc::now().date_naive());
        let mut dated: Vec<(NaiveDate, PathBuf)> = Vec::new();

        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let stem = match path.file_stem().and_then(|s| s.to_str()) {
                Some(s) => s,
                None => continue,
            };
            if let Ok(date) = stem.parse::<NaiveDate>() {
                if date >= start {
                    dated.push((date, path));
                }
            }
        }

        dated.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(dated.into_iter().map(|(_, p)| p).collect())
    }

    async fn read_entries(&self, path: &Path) -> Result<Vec<Value>> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}

#[async_trait]
impl LogSink for JsonlLogStore {
    async fn log_turn(&self, turn: NewTurn) -> Result<TurnLog> {
        let entry = TurnLog {
            timestamp: Utc::now().to_rfc3339(),
            session_id: turn.session_id.clone(),
            turn_id: self.next_turn_id(&turn.session_id),
            kind: "turn".to_string(),
            user_message: turn.user_message,
            assistant_response: turn.assistant_response,
            prompt_version: turn.prompt_version,
            model: turn.model,
            tokens: if turn.tokens.is_null() {
                serde_json::json!({})
            } else {
                turn.tokens
            },
            latency_ms: turn.latency_ms,
            feedback: turn.feedback,
        };

        let path = self.today_file(&self.conversations_path);
        self.append_line(&path, &serde_json::to_value(&entry)?).await?;
        debug!(session = %entry.session_id, turn = entry.turn_id, "logged conversation turn");
        Ok(entry)
    }

    async fn log_improvement_event(&self, event_type: &str, data: Value) -> Result<()> {
        let mut entry = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "type": event_type,
        });
        if let (Some(obj), Value::Object(extra)) = (entry.as_object_mut(), data) {
            for (k, v) in extra {
                obj.insert(k, v);
            }
        }

        let path = self.today_file(&self.improvements_path);
        self.append_line(&path, &entry).await
    }

    async fn get_recent(
        &self,
        limit: usize,
        feedback_type: Option<&str>,
        date_range: DateRange,
    ) -> Result<Vec<Value>> {
        let mut logs = Vec::new();
        for file in self.log_files(&self.conversations_path, date_range).await? {
            for entry in self.read_entries(&file).await? {
                if let Some(wanted) = feedback_type {
                    let matches = entry
                        .get("feedback")
                        .and_then(|f| f.get("type"))
                        .and_then(|t| t.as_str())
                        .map(|t| t == wanted)
                        .unwrap_or(false);
                    if !matches {
                        continue;
                    }
                }
                logs.push(entry);
                if logs.len() >= limit {
                    return Ok(logs);
                }
            }
        }
        Ok(logs)
    }

    async fn get_session(&self, session_id: &str) -> Result<Vec<Value>> {
        let mut logs = Vec::new();
        for file in self.log_files(&self.conversations_path, DateRange::All).await? {
            for entry in self.read_entries(&file).await? {
                if entry.get("session_id").and_then(|s| s.as_str()) == Some(session_id) {
                    logs.push(entry);
                }
            }
        }
        logs.sort_by_key(|e| e.get("turn_id").and_then(|t| t.as_u64()).unwrap_or(0));
        Ok(logs)
    }

    async fn search(&self, query: &str, date_range: DateRange, limit: usize) -> Result<Vec<Value>> {
        let query_lower = query.to_lowercase();
        let mut results = Vec::new();

        for file in self.log_files(&self.conversations_path, date_range).await? {
            let content = match tokio::fs::read_to_string(&file).await {
                Ok(c) => c,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for line in content.lines() {
                if line.to_lowercase().contains(&query_lower) {
                    if let Ok(entry) = serde_json::from_str(line) {
                        results.push(entry);
                        if results.len() >= limit {
                            return Ok(results);
                        }
                    }
                }
            }
        }
        Ok(results)
    }

    async fn get_improvement_events(&self, limit: usize) -> Result<Vec<Value>> {
        let mut events = Vec::new();
        for file in self.log_files(&self.improvements_path, DateRange::All).await? {
            let mut entries = self.read_entries(&file).await?;
            // Newest events last in the file.
            entries.reverse();
            for entry in entries {
                events.push(entry);
                if events.len() >= limit {
                    return Ok(events);
                }
            }
        }
        Ok(events)
    }
}

/// Compute feedback statistics from recent logs.
pub async fn feedback_stats(sink: &dyn LogSink, date_range: DateRange) -> Result<FeedbackStats> {
    let logs = sink.get_recent(1000, None, date_range).await?;

    let total = logs.len();
    let with_feedback: Vec<&Value> = logs
        .iter()
        .filter(|l| l.get("feedback").map(|f| !f.is_null()).unwrap_or(false))
        .collect();
    let count_type = |wanted: &str| {
        with_feedback
            .iter()
            .filter(|l| {
                l.get("feedback")
                    .and_then(|f| f.get("type"))
                    .and_then(|t| t.as_str())
                    == Some(wanted)
            })
            .count()
    };
    let positive = count_type("positive");
    let negative = count_type("negative");

    Ok(FeedbackStats {
        total_turns: total,
        turns_with_feedback: with_feedback.len(),
        positive_count: positive,
        negative_count: negative,
        feedback_rate: if total > 0 {
            with_feedback.len() as f64 / total as f64
        } else {
            0.0
        },
        positive_rate: if !with_feedback.is_empty() {
            positive as f64 / with_feedback.len() as f64
        } else {
            0.0
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::{Feedback, FeedbackCategory, FeedbackType};
    use tempfile::TempDir;

    fn negative_feedback(text: &str) -> Feedback {
        Feedback {
            feedback_type: FeedbackType::Negative,
            category: FeedbackCategory::Verbosity,
            raw_text: text.to_string(),
            confidence: 0.85,
            triggered_improvement: true,
        }
    }

    async fn store() -> (TempDir, JsonlLogStore) {
        let dir = TempDir::new().unwrap();
        let store = JsonlLogStore::new(dir.path()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_turn_ids_increment_per_session() {
        let (_dir, store) = store().await;

        let t1 = store
            .log_turn(NewTurn {
                session_id: "s1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let t2 = store
            .log_turn(NewTurn {
                session_id: "s1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let other = store
            .log_turn(NewTurn {
                session_id: "s2".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(t1.turn_id, 1);
        assert_eq!(t2.turn_id, 2);
        assert_eq!(other.turn_id, 1);
    }

    #[tokio::test]
    async fn test_get_recent_filters_by_feedback_type() {
        let (_dir, store) = store().await;

        store
            .log_turn(NewTurn {
                session_id: "s1".to_string(),
                user_message: "too verbose".to_string(),
                feedback: Some(negative_feedback("too verbose")),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .log_turn(NewTurn {
                session_id: "s1".to_string(),
                user_message: "what is rust".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let all = store.get_recent(50, None, DateRange::LastWeek).await.unwrap();
        assert_eq!(all.len(), 2);

        let negative = store
            .get_recent(50, Some("negative"), DateRange::LastWeek)
            .await
            .unwrap();
        assert_eq!(negative.len(), 1);
        assert_eq!(negative[0]["user_message"], "too verbose");
    }

    #[tokio::test]
    async fn test_get_recent_respects_limit() {
        let (_dir, store) = store().await;
        for i in 0..5 {
            store
                .log_turn(NewTurn {
                    session_id: format!("s{}", i),
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        let logs = store.get_recent(3, None, DateRange::All).await.unwrap();
        assert_eq!(logs.len(), 3);
    }

    #[tokio::test]
    async fn test_get_session_orders_by_turn_id() {
        let (_dir, store) = store().await;
        for msg in ["first", "second", "third"] {
            store
                .log_turn(NewTurn {
                    session_id: "s1".to_string(),
                    user_message: msg.to_string(),
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        let session = store.get_session("s1").await.unwrap();
        assert_eq!(session.len(), 3);
        assert_eq!(session[0]["user_message"], "first");
        assert_eq!(session[2]["user_message"], "third");
        assert!(store.get_session("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_search_is_case_insensitive() {
        let (_dir, store) = store().await;
        store
            .log_turn(NewTurn {
                session_id: "s1".to_string(),
                user_message: "The Answer Was Too Verbose".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let hits = store.search("too verbose", DateRange::All, 100).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(store.search("missing term", DateRange::All, 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_improvement_events_round_trip() {
        let (_dir, store) = store().await;
        store
            .log_improvement_event(
                "improvement_started",
                serde_json::json!({"target_agent": "main_agent"}),
            )
            .await
            .unwrap();
        store
            .log_improvement_event("improvement_completed", serde_json::json!({"success": true}))
            .await
            .unwrap();

        let events = store.get_improvement_events(10).await.unwrap();
        assert_eq!(events.len(), 2);
        // Newest first.
        assert_eq!(events[0]["type"], "improvement_completed");
        assert_eq!(events[1]["target_agent"], "main_agent");
    }

    #[tokio::test]
    async fn test_feedback_stats() {
        let (_dir, store) = store().await;
        store
            .log_turn(NewTurn {
                session_id: "s1".to_string(),
                feedback: Some(negative_feedback("bad")),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .log_turn(NewTurn {
                session_id: "s1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let stats = feedback_stats(&store, DateRange::LastWeek).await.unwrap();
        assert_eq!(stats.total_turns, 2);
        assert_eq!(stats.turns_with_feedback, 1);
        assert_eq!(stats.negative_count, 1);
        assert_eq!(stats.positive_count, 0);
        assert!((stats.feedback_rate - 0.5).abs() < 1e-9);
    }
}
