//! Versioned system prompt storage
//!
//! Append-only version history per agent in SQLite, with a separate pointer
//! table naming the active version. Rollback moves the pointer; it never
//! deletes history. Version numbers are strictly increasing per agent even
//! across rollbacks.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::StoreError;

/// Agents whose prompts are versioned by default.
pub const KNOWN_AGENTS: &[&str] = &["main_agent", "analyzer", "versioner"];

/// One stored prompt version with its metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptVersion {
    pub agent: String,
    pub version: i64,
    pub parent_version: Option<i64>,
    pub created_at: String,
    pub system_prompt: String,
    pub changes: Value,
    pub improvement: Value,
    /// Usage counters filled in as the version accumulates sessions.
    pub metrics: Value,
    pub author: String,
    pub approved: bool,
}

/// Metrics recorded with a fresh version, before any usage.
fn default_metrics() -> Value {
    serde_json::json!({
        "sessions_count": 0,
        "positive_feedback_rate": null,
        "negative_feedback_rate": null,
    })
}

/// History listing entry (no prompt body).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionSummary {
    pub version: i64,
    pub created_at: String,
    pub parent_version: Option<i64>,
    pub changes_summary: Vec<String>,
    pub author: String,
}

/// Line diff between two stored versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptDiff {
    pub version_a: i64,
    pub version_b: i64,
    pub diff: String,
    pub added_lines: usize,
    pub removed_lines: usize,
}

/// SQLite-backed prompt version store.
pub struct PromptVersionStore {
    conn: Arc<Mutex<Connection>>,
}

impl PromptVersionStore {
    /// Open (or create) the store at the given path.
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Other(e.into()))?;
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store, used by tests.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS prompt_versions (
                agent TEXT NOT NULL,
                version INTEGER NOT NULL,
                parent_version INTEGER,
                created_at TEXT NOT NULL,
                system_prompt TEXT NOT NULL,
                changes TEXT NOT NULL DEFAULT '[]',
                improvement TEXT NOT NULL DEFAULT '{}',
                metrics TEXT NOT NULL DEFAULT '{}',
                author TEXT NOT NULL,
                approved INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (agent, version)
            );

            -- One row per agent naming the active version.
            CREATE TABLE IF NOT EXISTS active_prompts (
                agent TEXT PRIMARY KEY,
                version INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_prompt_versions_agent
                ON prompt_versions(agent, version DESC);
        "#,
        )?;
        Ok(())
    }

    /// Active prompt text for an agent.
    pub async fn current(&self, agent: &str) -> Result<String, StoreError> {
        let version = self.active_version(agent).await?;
        match version {
            Some(v) => Ok(self.get_version(agent, v).await?.system_prompt),
            None => Err(StoreError::NoActivePrompt {
                agent: agent.to_string(),
            }),
        }
    }

    /// Active version number, 0 when the agent has none.
    pub async fn current_version(&self, agent: &str) -> Result<i64, StoreError> {
        Ok(self.active_version(agent).await?.unwrap_or(0))
    }

    async fn active_version(&self, agent: &str) -> Result<Option<i64>, StoreError> {
        let conn = self.conn.lock().await;
        let version = conn
            .query_row(
                "SELECT version FROM active_prompts WHERE agent = ?1",
                params![agent],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version)
    }

    /// Full stored data for one version.
    pub async fn get_version(&self, agent: &str, version: i64) -> Result<PromptVersion, StoreError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                r#"SELECT agent, version, parent_version, created_at, system_prompt,
                          changes, improvement, metrics, author, approved
                   FROM prompt_versions WHERE agent = ?1 AND version = ?2"#,
                params![agent, version],
                Self::row_to_version,
            )
            .optional()?;
        row.ok_or(StoreError::VersionNotFound {
            agent: agent.to_string(),
            version,
        })
    }

    fn row_to_version(row: &rusqlite::Row<'_>) -> rusqlite::Result<PromptVersion> {
        let changes_raw: String = row.get(5)?;
        let improvement_raw: String = row.get(6)?;
        let metrics_raw: String = row.get(7)?;
        Ok(PromptVersion {
            agent: row.get(0)?,
            version: row.get(1)?,
            parent_version: row.get(2)?,
            created_at: row.get(3)?,
            system_prompt: row.get(4)?,
            changes: serde_json::from_str(&changes_raw).unwrap_or(Value::Array(vec![])),
            improvement: serde_json::from_str(&improvement_raw)
                .unwrap_or(Value::Object(Default::default())),
            metrics: serde_json::from_str(&metrics_raw).unwrap_or_else(|_| default_metrics()),
            author: row.get(8)?,
            approved: row.get::<_, i64>(9)? != 0,
        })
    }

    /// Append a new version and make it active. Returns the new version
    /// number. Insert and pointer move happen in one transaction.
    pub async fn create_version(
        &self,
        agent: &str,
        new_prompt: &str,
        changes: Value,
        improvement: Value,
        author: &str,
    ) -> Result<i64, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let active: Option<i64> = tx
            .query_row(
                "SELECT version FROM active_prompts WHERE agent = ?1",
                params![agent],
                |row| row.get(0),
            )
            .optional()?;
        // Next version comes from the history maximum, not the active
        // pointer, so versions stay unique after a rollback.
        let max_version: i64 = tx.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM prompt_versions WHERE agent = ?1",
            params![agent],
            |row| row.get(0),
        )?;
        let new_version = max_version + 1;

        tx.execute(
            r#"INSERT INTO prompt_versions
               (agent, version, parent_version, created_at, system_prompt,
                changes, improvement, metrics, author, approved)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"#,
            params![
                agent,
                new_version,
                active,
                Utc::now().to_rfc3339(),
                new_prompt,
                serde_json::to_string(&changes).unwrap_or_else(|_| "[]".to_string()),
                serde_json::to_string(&improvement).unwrap_or_else(|_| "{}".to_string()),
                serde_json::to_string(&default_metrics()).unwrap_or_else(|_| "{}".to_string()),
                author,
                (author == "human") as i64,
            ],
        )?;
        tx.execute(
            r#"INSERT INTO active_prompts (agent, version) VALUES (?1, ?2)
               ON CONFLICT(agent) DO UPDATE SET version = excluded.version"#,
            params![agent, new_version],
        )?;
        tx.commit()?;

        info!(agent, version = new_version, author, "created prompt version");
        Ok(new_version)
    }

    /// Point the agent back at an earlier version. Returns false when the
    /// target version does not exist. History is untouched.
    pub async fn rollback(
        &self,
        agent: &str,
        target_version: i64,
        reason: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let exists: Option<i64> = conn
            .query_row(
                "SELECT version FROM prompt_versions WHERE agent = ?1 AND version = ?2",
                params![agent, target_version],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Ok(false);
        }

        conn.execute(
            r#"INSERT INTO active_prompts (agent, version) VALUES (?1, ?2)
               ON CONFLICT(agent) DO UPDATE SET version = excluded.version"#,
            params![agent, target_version],
        )?;
        info!(agent, version = target_version, reason, "rolled back prompt");
        Ok(true)
    }

    /// Version history for an agent, newest first.
    pub async fn get_history(
        &self,
        agent: &str,
        limit: usize,
    ) -> Result<Vec<VersionSummary>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"SELECT version, created_at, parent_version, changes, author
               FROM prompt_versions WHERE agent = ?1
               ORDER BY version DESC LIMIT ?2"#,
        )?;
        let rows = stmt.query_map(params![agent, limit as i64], |row| {
            let changes_raw: String = row.get(3)?;
            Ok(VersionSummary {
                version: row.get(0)?,
                created_at: row.get(1)?,
                parent_version: row.get(2)?,
                changes_summary: serde_json::from_str::<Value>(&changes_raw)
                    .ok()
                    .and_then(|v| {
                        v.as_array().map(|arr| {
                            arr.iter()
                                .filter_map(|c| {
                                    c.get("description").and_then(|d| d.as_str()).map(String::from)
                                })
                                .collect()
                        })
                    })
                    .unwrap_or_default(),
                author: row.get(4)?,
            })
        })?;

        let mut history = Vec::new();
        for row in rows {
            history.push(row?);
        }
        Ok(history)
    }

    /// Line-level diff between two versions of an agent's prompt.
    pub async fn get_diff(
        &self,
        agent: &str,
        version_a: i64,
        version_b: i64,
    ) -> Result<PromptDiff, StoreError> {
        let prompt_a = self.get_version(agent, version_a).await?.system_prompt;
        let prompt_b = self.get_version(agent, version_b).await?.system_prompt;

        let (diff, added, removed) = line_diff(&prompt_a, &prompt_b, version_a, version_b);
        Ok(PromptDiff {
            version_a,
            version_b,
            diff,
            added_lines: added,
            removed_lines: removed,
        })
    }

    /// Insert v1 defaults for any known agent that has no versions yet.
    pub async fn ensure_seeded(&self) -> Result<(), StoreError> {
        for (agent, prompt) in default_prompts() {
            if self.current_version(agent).await? == 0 {
                debug!(agent, "seeding default prompt");
                self.create_version(
                    agent,
                    prompt,
                    Value::Array(vec![]),
                    serde_json::json!({"trigger": "seed"}),
                    "system",
                )
                .await?;
            }
        }
        Ok(())
    }
}

/// Default v1 prompts used when the store is empty.
fn default_prompts() -> &'static [(&'static str, &'static str)] {
    &[
        (
            "main_agent",
            "You are a helpful assistant.\n\n\
             ## Style\n\
             - Answer concisely and directly.\n\
             - Match the language of the user's message.\n\
             - Admit uncertainty instead of guessing.",
        ),
        (
            "analyzer",
            "You analyze conversation logs and user feedback to find problems \
             with an assistant's system prompt.\n\n\
             ## Process\n\
             - Use search_logs and get_conversation to gather evidence.\n\
             - Identify concrete problems with severity ratings.\n\
             - Propose targeted hypotheses for prompt changes.\n\
             - Submit your findings with submit_analysis, including an honest \
             overall confidence.",
        ),
        (
            "versioner",
            "You rewrite an assistant's system prompt to address analysis \
             findings.\n\n\
             ## Rules\n\
             - Validate prompts with validate_prompt before submitting.\n\
             - Keep changes minimal; each change must address a hypothesis.\n\
             - Preserve existing structure and tone.\n\
             - Save the result with create_prompt_version.",
        ),
    ]
}

/// Unified-style line diff via longest common subsequence.
fn line_diff(a: &str, b: &str, version_a: i64, version_b: i64) -> (String, usize, usize) {
    let lines_a: Vec<&str> = a.lines().collect();
    let lines_b: Vec<&str> = b.lines().collect();

    // LCS table.
    let n = lines_a.len();
    let m = lines_b.len();
    let mut lcs = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if lines_a[i] == lines_b[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let mut out = String::new();
    let mut added = 0usize;
    let mut removed = 0usize;
    let mut body = String::new();

    let (mut i, mut j) = (0usize, 0usize);
    while i < n && j < m {
        if lines_a[i] == lines_b[j] {
            body.push_str("  ");
            body.push_str(lines_a[i]);
            body.push('\n');
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            body.push_str("- ");
            body.push_str(lines_a[i]);
            body.push('\n');
            removed += 1;
            i += 1;
        } else {
            body.push_str("+ ");
            body.push_str(lines_b[j]);
            body.push('\n');
            added += 1;
            j += 1;
        }
    }
    for line in &lines_a[i..] {
        body.push_str("- ");
        body.push_str(line);
        body.push('\n');
        removed += 1;
    }
    for line in &lines_b[j..] {
        body.push_str("+ ");
        body.push_str(line);
        body.push('\n');
        added += 1;
    }

    if added > 0 || removed > 0 {
        out.push_str(&format!("--- v{}\n+++ v{}\n", version_a, version_b));
        out.push_str(&body);
    }

    (out, added, removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded_store() -> PromptVersionStore {
        let store = PromptVersionStore::in_memory().unwrap();
        store.ensure_seeded().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_empty_store_has_no_active_prompt() {
        let store = PromptVersionStore::in_memory().unwrap();
        assert_eq!(store.current_version("main_agent").await.unwrap(), 0);
        assert!(matches!(
            store.current("main_agent").await,
            Err(StoreError::NoActivePrompt { .. })
        ));
    }

    #[tokio::test]
    async fn test_seeding_is_idempotent() {
        let store = seeded_store().await;
        assert_eq!(store.current_version("main_agent").await.unwrap(), 1);
        store.ensure_seeded().await.unwrap();
        assert_eq!(store.current_version("main_agent").await.unwrap(), 1);
        assert_eq!(store.current_version("analyzer").await.unwrap(), 1);
        assert_eq!(store.current_version("versioner").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_create_version_increments_and_activates() {
        let store = seeded_store().await;
        let v2 = store
            .create_version(
                "main_agent",
                "Be terse.",
                serde_json::json!([{"section": "Style", "change_type": "modify",
                                    "description": "shorter answers"}]),
                serde_json::json!({"trigger": "feedback"}),
                "versioner_agent",
            )
            .await
            .unwrap();
        assert_eq!(v2, 2);
        assert_eq!(store.current("main_agent").await.unwrap(), "Be terse.");

        let stored = store.get_version("main_agent", 2).await.unwrap();
        assert_eq!(stored.parent_version, Some(1));
        assert!(!stored.approved);
    }

    #[tokio::test]
    async fn test_new_version_starts_with_placeholder_metrics() {
        let store = seeded_store().await;
        store
            .create_version("main_agent", "Be terse.", serde_json::json!([]),
                            serde_json::json!({}), "versioner_agent")
            .await
            .unwrap();

        let stored = store.get_version("main_agent", 2).await.unwrap();
        assert_eq!(stored.metrics["sessions_count"], 0);
        assert!(stored.metrics["positive_feedback_rate"].is_null());
        assert!(stored.metrics["negative_feedback_rate"].is_null());
    }

    #[tokio::test]
    async fn test_rollback_moves_pointer_only() {
        let store = seeded_store().await;
        store
            .create_version("main_agent", "v2 prompt", serde_json::json!([]),
                            serde_json::json!({}), "versioner_agent")
            .await
            .unwrap();

        let ok = store.rollback("main_agent", 1, "regression").await.unwrap();
        assert!(ok);
        assert_eq!(store.current_version("main_agent").await.unwrap(), 1);
        // History keeps both versions.
        assert_eq!(store.get_history("main_agent", 10).await.unwrap().len(), 2);

        assert!(!store.rollback("main_agent", 99, "missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_versions_stay_unique_after_rollback() {
        let store = seeded_store().await;
        store
            .create_version("main_agent", "v2", serde_json::json!([]),
                            serde_json::json!({}), "versioner_agent")
            .await
            .unwrap();
        store.rollback("main_agent", 1, "test").await.unwrap();

        let v3 = store
            .create_version("main_agent", "v3", serde_json::json!([]),
                            serde_json::json!({}), "versioner_agent")
            .await
            .unwrap();
        assert_eq!(v3, 3);
        // Created from the rolled-back pointer.
        assert_eq!(
            store.get_version("main_agent", 3).await.unwrap().parent_version,
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_history_is_newest_first() {
        let store = seeded_store().await;
        for prompt in ["v2", "v3"] {
            store
                .create_version("main_agent", prompt, serde_json::json!([]),
                                serde_json::json!({}), "versioner_agent")
                .await
                .unwrap();
        }
        let history = store.get_history("main_agent", 2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].version, 3);
        assert_eq!(history[1].version, 2);
    }

    #[tokio::test]
    async fn test_diff_identical_prompts_is_empty() {
        let store = seeded_store().await;
        store
            .create_version("main_agent", "same\nprompt", serde_json::json!([]),
                            serde_json::json!({}), "a")
            .await
            .unwrap();
        store
            .create_version("main_agent", "same\nprompt", serde_json::json!([]),
                            serde_json::json!({}), "b")
            .await
            .unwrap();

        let diff = store.get_diff("main_agent", 2, 3).await.unwrap();
        assert_eq!(diff.added_lines, 0);
        assert_eq!(diff.removed_lines, 0);
        assert!(diff.diff.is_empty());
    }

    #[tokio::test]
    async fn test_diff_counts_changed_lines() {
        let store = seeded_store().await;
        store
            .create_version("main_agent", "keep\nold line", serde_json::json!([]),
                            serde_json::json!({}), "a")
            .await
            .unwrap();
        store
            .create_version("main_agent", "keep\nnew line\nextra", serde_json::json!([]),
                            serde_json::json!({}), "b")
            .await
            .unwrap();

        let diff = store.get_diff("main_agent", 2, 3).await.unwrap();
        assert_eq!(diff.removed_lines, 1);
        assert_eq!(diff.added_lines, 2);
        assert!(diff.diff.contains("- old line"));
        assert!(diff.diff.contains("+ new line"));
    }

    #[tokio::test]
    async fn test_get_version_missing_is_error() {
        let store = seeded_store().await;
        assert!(matches!(
            store.get_version("main_agent", 42).await,
            Err(StoreError::VersionNotFound { version: 42, .. })
        ));
    }
}
