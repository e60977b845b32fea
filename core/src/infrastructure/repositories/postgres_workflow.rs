// Copyright (c) 2026 Termflux
// SPDX-License-Identifier: AGPL-3.0

//! Workflow definition and run persistence.
//!
//! The step tree and accumulated step results are stored as JSON documents
//! beside the searchable columns, mirroring how the in-memory aggregates
//! serialize.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::domain::repository::{RepositoryError, RunRepository, WorkflowRepository};
use crate::domain::workflow::{
    RunId, RunStatus, WorkflowDefinition, WorkflowId, WorkflowRun,
};
use crate::domain::workspace::WorkspaceId;

pub struct PostgresWorkflowRepository {
    pool: PgPool,
}

impl PostgresWorkflowRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkflowRepository for PostgresWorkflowRepository {
    async fn save(&self, workflow: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let definition = serde_json::to_value(workflow)
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO workflows (id, workspace_id, name, definition, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                definition = EXCLUDED.definition,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(workflow.id.0)
        .bind(workflow.workspace_id.0)
        .bind(&workflow.name)
        .bind(&definition)
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("failed to save workflow: {e}")))?;

        Ok(())
    }

    async fn find_by_id(
        &self,
        id: WorkflowId,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(e.to_string()))?;

        match row {
            Some(row) => {
                let definition: serde_json::Value = row
                    .try_get("definition")
                    .map_err(|e| RepositoryError::Database(e.to_string()))?;
                serde_json::from_value(definition)
                    .map(Some)
                    .map_err(|e| RepositoryError::Serialization(e.to_string()))
            }
            None => Ok(None),
        }
    }

    async fn list_by_workspace(
        &self,
        id: WorkspaceId,
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT definition FROM workflows WHERE workspace_id = $1 ORDER BY name ASC",
        )
        .bind(id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                let definition: serde_json::Value = row
                    .try_get("definition")
                    .map_err(|e| RepositoryError::Database(e.to_string()))?;
                serde_json::from_value(definition)
                    .map_err(|e| RepositoryError::Serialization(e.to_string()))
            })
            .collect()
    }

    async fn delete(&self, id: WorkflowId) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM workflows WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(e.to_string()))?;
        Ok(())
    }
}

pub struct PostgresRunRepository {
    pool: PgPool,
}

impl PostgresRunRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: &sqlx::postgres::PgRow) -> Result<WorkflowRun, RepositoryError> {
        let db = |e: sqlx::Error| RepositoryError::Database(e.to_string());
        let status: String = row.try_get("status").map_err(db)?;
        let step_results: serde_json::Value = row.try_get("step_results").map_err(db)?;
        let variables: serde_json::Value = row.try_get("variables").map_err(db)?;

        Ok(WorkflowRun {
            id: RunId::from_string(row.try_get::<String, _>("id").map_err(db)?),
            workflow_id: WorkflowId(row.try_get("workflow_id").map_err(db)?),
            workspace_id: WorkspaceId(row.try_get("workspace_id").map_err(db)?),
            user_id: row.try_get("user_id").map_err(db)?,
            status: RunStatus::parse(&status)
                .map_err(|e| RepositoryError::Serialization(e.to_string()))?,
            step_results: serde_json::from_value(step_results)
                .map_err(|e| RepositoryError::Serialization(e.to_string()))?,
            variables: serde_json::from_value(variables)
                .map_err(|e| RepositoryError::Serialization(e.to_string()))?,
            started_at: row.try_get("started_at").map_err(db)?,
            completed_at: row.try_get("completed_at").map_err(db)?,
            error: row.try_get("error").map_err(db)?,
            created_at: row.try_get("created_at").map_err(db)?,
        })
    }
}

#[async_trait]
impl RunRepository for PostgresRunRepository {
    async fn save(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        let step_results = serde_json::to_value(&run.step_results)
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?;
        let variables = serde_json::to_value(&run.variables)
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO workflow_runs
                (id, workflow_id, workspace_id, user_id, status, step_results,
                 variables, started_at, completed_at, error, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                step_results = EXCLUDED.step_results,
                started_at = EXCLUDED.started_at,
                completed_at = EXCLUDED.completed_at,
                error = EXCLUDED.error
            "#,
        )
        .bind(run.id.as_str())
        .bind(run.workflow_id.0)
        .bind(run.workspace_id.0)
        .bind(&run.user_id)
        .bind(run.status.as_str())
        .bind(&step_results)
        .bind(&variables)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(&run.error)
        .bind(run.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("failed to save run: {e}")))?;

        Ok(())
    }

    async fn find_by_id(&self, id: &RunId) -> Result<Option<WorkflowRun>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(e.to_string()))?;

        row.as_ref().map(Self::map_row).transpose()
    }

    async fn list_by_workflow(
        &self,
        id: WorkflowId,
        limit: i64,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM workflow_runs
            WHERE workflow_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(id.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(e.to_string()))?;

        rows.iter().map(Self::map_row).collect()
    }
}
