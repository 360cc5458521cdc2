//! Durable workflow storage.
//!
//! Definitions are written by configuration tooling and consumed read-only
//! here. Executions have exactly two mutation points, cursor advancement
//! and terminal transition, both CAS-guarded so a crashed or duplicated
//! call can never double-advance or resurrect an execution.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use sqlx::{PgPool, Row};

use super::types::{
    ExecutionId, ExecutionStatus, StepId, WorkflowDefinition, WorkflowExecution, WorkflowId,
};
use crate::error::EngineError;

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn definition(
        &self,
        id: WorkflowId,
    ) -> Result<Option<WorkflowDefinition>, EngineError>;

    /// Upsert a definition (configuration tooling surface).
    async fn put_definition(&self, definition: &WorkflowDefinition) -> Result<(), EngineError>;

    async fn insert_execution(&self, execution: &WorkflowExecution) -> Result<(), EngineError>;

    async fn execution(
        &self,
        id: ExecutionId,
    ) -> Result<Option<WorkflowExecution>, EngineError>;

    /// CAS cursor advance: succeeds only while the execution is IN_PROGRESS
    /// and still positioned at `expected_step`.
    async fn advance_cursor(
        &self,
        id: ExecutionId,
        expected_step: StepId,
        next_step: StepId,
    ) -> Result<bool, EngineError>;

    /// CAS terminal transition from IN_PROGRESS. Statuses are monotonic;
    /// a second finish attempt returns `false`.
    async fn finish_execution(
        &self,
        id: ExecutionId,
        status: ExecutionStatus,
        final_result: Option<&Value>,
        error: Option<&str>,
    ) -> Result<bool, EngineError>;
}

// ============================================================================
// In-memory store
// ============================================================================

pub struct MemoryWorkflowStore {
    definitions: DashMap<WorkflowId, WorkflowDefinition>,
    executions: DashMap<String, WorkflowExecution>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self {
            definitions: DashMap::new(),
            executions: DashMap::new(),
        }
    }
}

impl Default for MemoryWorkflowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn definition(
        &self,
        id: WorkflowId,
    ) -> Result<Option<WorkflowDefinition>, EngineError> {
        Ok(self.definitions.get(&id).map(|d| d.clone()))
    }

    async fn put_definition(&self, definition: &WorkflowDefinition) -> Result<(), EngineError> {
        self.definitions.insert(definition.id, definition.clone());
        Ok(())
    }

    async fn insert_execution(&self, execution: &WorkflowExecution) -> Result<(), EngineError> {
        self.executions
            .insert(execution.id.to_string(), execution.clone());
        Ok(())
    }

    async fn execution(
        &self,
        id: ExecutionId,
    ) -> Result<Option<WorkflowExecution>, EngineError> {
        Ok(self.executions.get(&id.to_string()).map(|e| e.clone()))
    }

    async fn advance_cursor(
        &self,
        id: ExecutionId,
        expected_step: StepId,
        next_step: StepId,
    ) -> Result<bool, EngineError> {
        match self.executions.get_mut(&id.to_string()) {
            Some(mut execution)
                if execution.status == ExecutionStatus::InProgress
                    && execution.current_step_id == expected_step =>
            {
                execution.current_step_id = next_step;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish_execution(
        &self,
        id: ExecutionId,
        status: ExecutionStatus,
        final_result: Option<&Value>,
        error: Option<&str>,
    ) -> Result<bool, EngineError> {
        match self.executions.get_mut(&id.to_string()) {
            Some(mut execution) if execution.status == ExecutionStatus::InProgress => {
                execution.status = status;
                execution.final_result = final_result.cloned();
                execution.error = error.map(str::to_string);
                execution.completed_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// ============================================================================
// PostgreSQL store
// ============================================================================

/// Definitions are persisted as one JSONB document per version-bearing row;
/// the engine deserializes and validates on read.
pub struct PgWorkflowStore {
    pool: PgPool,
}

impl PgWorkflowStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_definitions_tb (
                workflow_id BIGINT PRIMARY KEY,
                name TEXT NOT NULL,
                version INT NOT NULL,
                is_active BOOLEAN NOT NULL,
                definition JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_executions_tb (
                id TEXT PRIMARY KEY,
                workflow_id BIGINT NOT NULL,
                user_id BIGINT NOT NULL,
                session_id TEXT NOT NULL,
                status SMALLINT NOT NULL,
                current_step_id BIGINT NOT NULL,
                final_result JSONB,
                error TEXT,
                started_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                completed_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_execution(row: &sqlx::postgres::PgRow) -> Result<WorkflowExecution, EngineError> {
        let id_str: String = row.get("id");
        let id: ExecutionId = id_str
            .parse()
            .map_err(|_| EngineError::System(format!("invalid execution id: {}", id_str)))?;
        let status_id: i16 = row.get("status");
        let status = ExecutionStatus::from_id(status_id)
            .ok_or_else(|| EngineError::System(format!("invalid status id: {}", status_id)))?;

        Ok(WorkflowExecution {
            id,
            workflow_id: row.get("workflow_id"),
            user_id: row.get("user_id"),
            session_id: row.get("session_id"),
            status,
            current_step_id: row.get("current_step_id"),
            final_result: row.get("final_result"),
            error: row.get("error"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
        })
    }
}

#[async_trait]
impl WorkflowStore for PgWorkflowStore {
    async fn definition(
        &self,
        id: WorkflowId,
    ) -> Result<Option<WorkflowDefinition>, EngineError> {
        let row = sqlx::query(
            r#"SELECT definition FROM workflow_definitions_tb WHERE workflow_id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let doc: Value = row.get("definition");
                let definition: WorkflowDefinition = serde_json::from_value(doc)
                    .map_err(|e| EngineError::Configuration(format!("workflow {}: {}", id, e)))?;
                Ok(Some(definition))
            }
            None => Ok(None),
        }
    }

    async fn put_definition(&self, definition: &WorkflowDefinition) -> Result<(), EngineError> {
        let doc = serde_json::to_value(definition)
            .map_err(|e| EngineError::System(format!("serialize definition: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO workflow_definitions_tb (workflow_id, name, version, is_active, definition, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (workflow_id)
            DO UPDATE SET name = EXCLUDED.name, version = EXCLUDED.version,
                          is_active = EXCLUDED.is_active, definition = EXCLUDED.definition,
                          updated_at = NOW()
            "#,
        )
        .bind(definition.id)
        .bind(&definition.name)
        .bind(definition.version as i32)
        .bind(definition.is_active)
        .bind(doc)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_execution(&self, execution: &WorkflowExecution) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_executions_tb
                (id, workflow_id, user_id, session_id, status, current_step_id,
                 final_result, error, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(execution.id.to_string())
        .bind(execution.workflow_id)
        .bind(execution.user_id)
        .bind(&execution.session_id)
        .bind(execution.status.id())
        .bind(execution.current_step_id)
        .bind(&execution.final_result)
        .bind(&execution.error)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn execution(
        &self,
        id: ExecutionId,
    ) -> Result<Option<WorkflowExecution>, EngineError> {
        let row = sqlx::query(r#"SELECT * FROM workflow_executions_tb WHERE id = $1"#)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(Self::row_to_execution(&row)?)),
            None => Ok(None),
        }
    }

    async fn advance_cursor(
        &self,
        id: ExecutionId,
        expected_step: StepId,
        next_step: StepId,
    ) -> Result<bool, EngineError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_executions_tb
            SET current_step_id = $1
            WHERE id = $2 AND current_step_id = $3 AND status = $4
            "#,
        )
        .bind(next_step)
        .bind(id.to_string())
        .bind(expected_step)
        .bind(ExecutionStatus::InProgress.id())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn finish_execution(
        &self,
        id: ExecutionId,
        status: ExecutionStatus,
        final_result: Option<&Value>,
        error: Option<&str>,
    ) -> Result<bool, EngineError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_executions_tb
            SET status = $1, final_result = $2, error = $3, completed_at = NOW()
            WHERE id = $4 AND status = $5
            "#,
        )
        .bind(status.id())
        .bind(final_result)
        .bind(error)
        .bind(id.to_string())
        .bind(ExecutionStatus::InProgress.id())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execution() -> WorkflowExecution {
        WorkflowExecution::new(1, 42, "sess-1", 10)
    }

    #[tokio::test]
    async fn test_cursor_cas_advances_exactly_once() {
        let store = MemoryWorkflowStore::new();
        let execution = execution();
        let id = execution.id;
        store.insert_execution(&execution).await.unwrap();

        assert!(store.advance_cursor(id, 10, 20).await.unwrap());
        // Stale expected step loses
        assert!(!store.advance_cursor(id, 10, 30).await.unwrap());
        assert_eq!(
            store.execution(id).await.unwrap().unwrap().current_step_id,
            20
        );
    }

    #[tokio::test]
    async fn test_finish_is_monotonic() {
        let store = MemoryWorkflowStore::new();
        let execution = execution();
        let id = execution.id;
        store.insert_execution(&execution).await.unwrap();

        assert!(store
            .finish_execution(id, ExecutionStatus::Completed, None, None)
            .await
            .unwrap());
        // No resurrection, no overwrite
        assert!(!store
            .finish_execution(id, ExecutionStatus::Failed, None, Some("late"))
            .await
            .unwrap());

        let stored = store.execution(id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Completed);
        assert!(stored.error.is_none());
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_cursor_frozen_after_terminal() {
        let store = MemoryWorkflowStore::new();
        let execution = execution();
        let id = execution.id;
        store.insert_execution(&execution).await.unwrap();

        store
            .finish_execution(id, ExecutionStatus::Cancelled, None, Some("user cancelled"))
            .await
            .unwrap();
        assert!(!store.advance_cursor(id, 10, 20).await.unwrap());
    }
}
