//! Point lookup/update persistence for workflow runs.
//!
//! There is no row lock: callers that need a specific prior status use
//! [`WorkflowRunStore::update_if_status`], which applies the patch in a single
//! conditional `UPDATE` and reports whether the precondition still held.

use rusqlite::types::Value as SqlValue;
use rusqlite::{OptionalExtension, Row};

use crate::db::Database;
use crate::error::ServerError;
use crate::models::workflow_run::{RunPatch, RunStatus, RunTargetType, WorkflowRun};

#[derive(Clone)]
pub struct WorkflowRunStore {
    db: Database,
}

impl WorkflowRunStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn insert(&self, run: &WorkflowRun) -> Result<(), ServerError> {
        let r = run.clone();
        let input = serde_json::to_string(&r.input)?;
        let output = serde_json::to_string(&r.output)?;
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO workflow_runs (id, target_type, target_id, status, input, output, started_at, finished_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        r.id,
                        r.target_type.as_str(),
                        r.target_id,
                        r.status.as_str(),
                        input,
                        output,
                        r.started_at.timestamp_millis(),
                        r.finished_at.map(|t| t.timestamp_millis()),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, run_id: &str) -> Result<Option<WorkflowRun>, ServerError> {
        let id = run_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT id, target_type, target_id, status, input, output, started_at, finished_at
                     FROM workflow_runs WHERE id = ?1",
                    rusqlite::params![id],
                    |row| Ok(row_to_run(row)),
                )
                .optional()
            })
            .await
    }

    pub async fn list_recent(&self, limit: usize) -> Result<Vec<WorkflowRun>, ServerError> {
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, target_type, target_id, status, input, output, started_at, finished_at
                     FROM workflow_runs ORDER BY started_at DESC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![limit as i64], |row| Ok(row_to_run(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Apply a patch unconditionally. Returns false if the run does not exist.
    pub async fn update_partial(&self, run_id: &str, patch: RunPatch) -> Result<bool, ServerError> {
        self.apply(run_id, patch, &[]).await
    }

    /// Apply a patch only if the run's current status is one of `expected`.
    /// Returns false when the row is missing or the status precondition failed.
    pub async fn update_if_status(
        &self,
        run_id: &str,
        expected: &[RunStatus],
        patch: RunPatch,
    ) -> Result<bool, ServerError> {
        if expected.is_empty() {
            return Ok(false);
        }
        self.apply(run_id, patch, expected).await
    }

    async fn apply(
        &self,
        run_id: &str,
        patch: RunPatch,
        expected: &[RunStatus],
    ) -> Result<bool, ServerError> {
        let mut sets: Vec<String> = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();

        if let Some(status) = patch.status {
            params.push(SqlValue::Text(status.as_str().to_string()));
            sets.push(format!("status = ?{}", params.len()));
        }
        if let Some(output) = patch.output {
            params.push(SqlValue::Text(serde_json::to_string(&output)?));
            sets.push(format!("output = ?{}", params.len()));
        }
        if let Some(finished_at) = patch.finished_at {
            params.push(match finished_at {
                Some(t) => SqlValue::Integer(t.timestamp_millis()),
                None => SqlValue::Null,
            });
            sets.push(format!("finished_at = ?{}", params.len()));
        }
        if sets.is_empty() {
            return Ok(self.get(run_id).await?.is_some());
        }

        params.push(SqlValue::Text(run_id.to_string()));
        let mut sql = format!(
            "UPDATE workflow_runs SET {} WHERE id = ?{}",
            sets.join(", "),
            params.len()
        );
        if !expected.is_empty() {
            let mut slots = Vec::with_capacity(expected.len());
            for status in expected {
                params.push(SqlValue::Text(status.as_str().to_string()));
                slots.push(format!("?{}", params.len()));
            }
            sql.push_str(&format!(" AND status IN ({})", slots.join(", ")));
        }

        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute(&sql, rusqlite::params_from_iter(params))?;
                Ok(n > 0)
            })
            .await
    }
}

fn row_to_run(row: &Row<'_>) -> WorkflowRun {
    let to_dt = |ms: Option<i64>| ms.and_then(chrono::DateTime::from_timestamp_millis);
    let input: String = row.get(4).unwrap_or_default();
    let output: String = row.get(5).unwrap_or_default();

    WorkflowRun {
        id: row.get(0).unwrap_or_default(),
        target_type: RunTargetType::from_str(&row.get::<_, String>(1).unwrap_or_default())
            .unwrap_or(RunTargetType::Workflow),
        target_id: row.get(2).unwrap_or_default(),
        status: RunStatus::from_str(&row.get::<_, String>(3).unwrap_or_default())
            .unwrap_or(RunStatus::Failed),
        input: serde_json::from_str(&input).unwrap_or(serde_json::Value::Null),
        output: serde_json::from_str(&output).unwrap_or_else(|_| serde_json::json!({})),
        started_at: to_dt(row.get(6).ok()).unwrap_or_else(chrono::Utc::now),
        finished_at: to_dt(row.get(7).unwrap_or(None)),
    }
}
