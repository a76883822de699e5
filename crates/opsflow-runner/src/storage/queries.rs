//! Database queries for execution logs.

use opsflow_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::{ExecutionLogRow, ExecutionSummary};
use crate::orchestration::ExecutionLog;

impl Database {
    /// Insert or replace the record for `log`.
    pub async fn save_execution_log(&self, log: &ExecutionLog) -> Result<(), DatabaseError> {
        let payload = serde_json::to_string(log)?;

        sqlx::query(
            r"
            INSERT INTO execution_logs
                (id, workflow_id, workflow_name, status, started_at, finished_at,
                 error, payload, saved_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                finished_at = excluded.finished_at,
                error = excluded.error,
                payload = excluded.payload,
                saved_at = excluded.saved_at
            ",
        )
        .bind(&log.id)
        .bind(&log.workflow_id)
        .bind(&log.workflow_name)
        .bind(log.status.as_str())
        .bind(log.started_at)
        .bind(log.finished_at)
        .bind(log.error.as_deref())
        .bind(payload)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Get an execution log by ID.
    pub async fn get_execution_log(&self, id: &str) -> Result<ExecutionLog, DatabaseError> {
        let row = sqlx::query_as::<_, ExecutionLogRow>("SELECT * FROM execution_logs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Execution {id}")))?;

        Ok(serde_json::from_str(&row.payload)?)
    }

    /// Most recent executions of a workflow, newest first.
    pub async fn list_executions(
        &self,
        workflow_id: &str,
        limit: i64,
    ) -> Result<Vec<ExecutionSummary>, DatabaseError> {
        let rows = sqlx::query_as::<_, ExecutionSummary>(
            r"
            SELECT id, workflow_id, workflow_name, status, started_at, finished_at, error
            FROM execution_logs
            WHERE workflow_id = ?
            ORDER BY started_at DESC
            LIMIT ?
            ",
        )
        .bind(workflow_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }
}
