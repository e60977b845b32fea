// Copyright (c) 2026 Termflux
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::domain::repository::{RepositoryError, WorkspaceRepository};
use crate::domain::workspace::{
    ContainerHandle, ResourceLimits, Workspace, WorkspaceId, WorkspaceStatus,
};

pub struct PostgresWorkspaceRepository {
    pool: PgPool,
}

impl PostgresWorkspaceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: &sqlx::postgres::PgRow) -> Result<Workspace, RepositoryError> {
        let status: String = row
            .try_get("status")
            .map_err(|e| RepositoryError::Database(e.to_string()))?;
        let env: serde_json::Value = row
            .try_get("env")
            .map_err(|e| RepositoryError::Database(e.to_string()))?;
        let handle: Option<String> = row
            .try_get("container_handle")
            .map_err(|e| RepositoryError::Database(e.to_string()))?;

        Ok(Workspace {
            id: WorkspaceId(
                row.try_get("id")
                    .map_err(|e| RepositoryError::Database(e.to_string()))?,
            ),
            name: row
                .try_get("name")
                .map_err(|e| RepositoryError::Database(e.to_string()))?,
            user_id: row
                .try_get("user_id")
                .map_err(|e| RepositoryError::Database(e.to_string()))?,
            org_id: row
                .try_get("org_id")
                .map_err(|e| RepositoryError::Database(e.to_string()))?,
            status: WorkspaceStatus::parse(&status)
                .map_err(|e| RepositoryError::Serialization(e.to_string()))?,
            container_handle: handle.map(ContainerHandle::new),
            resources: ResourceLimits {
                cpu_cores: row
                    .try_get::<i32, _>("cpu_cores")
                    .map_err(|e| RepositoryError::Database(e.to_string()))?
                    as u32,
                memory_mib: row
                    .try_get::<i64, _>("memory_mib")
                    .map_err(|e| RepositoryError::Database(e.to_string()))?
                    as u64,
                disk_mib: row
                    .try_get::<i64, _>("disk_mib")
                    .map_err(|e| RepositoryError::Database(e.to_string()))?
                    as u64,
            },
            env: serde_json::from_value(env)
                .map_err(|e| RepositoryError::Serialization(e.to_string()))?,
            created_at: row
                .try_get("created_at")
                .map_err(|e| RepositoryError::Database(e.to_string()))?,
            updated_at: row
                .try_get("updated_at")
                .map_err(|e| RepositoryError::Database(e.to_string()))?,
        })
    }
}

#[async_trait]
impl WorkspaceRepository for PostgresWorkspaceRepository {
    async fn save(&self, workspace: &Workspace) -> Result<(), RepositoryError> {
        let env = serde_json::to_value(&workspace.env)
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO workspaces
                (id, name, user_id, org_id, status, container_handle,
                 cpu_cores, memory_mib, disk_mib, env, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                status = EXCLUDED.status,
                container_handle = EXCLUDED.container_handle,
                cpu_cores = EXCLUDED.cpu_cores,
                memory_mib = EXCLUDED.memory_mib,
                disk_mib = EXCLUDED.disk_mib,
                env = EXCLUDED.env,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(workspace.id.0)
        .bind(&workspace.name)
        .bind(&workspace.user_id)
        .bind(&workspace.org_id)
        .bind(workspace.status.as_str())
        .bind(workspace.container_handle.as_ref().map(|h| h.as_str()))
        .bind(workspace.resources.cpu_cores as i32)
        .bind(workspace.resources.memory_mib as i64)
        .bind(workspace.resources.disk_mib as i64)
        .bind(&env)
        .bind(workspace.created_at)
        .bind(workspace.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("failed to save workspace: {e}")))?;

        Ok(())
    }

    async fn find_by_id(&self, id: WorkspaceId) -> Result<Option<Workspace>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workspaces WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(e.to_string()))?;

        row.as_ref().map(Self::map_row).transpose()
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<Workspace>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workspaces WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(e.to_string()))?;

        rows.iter().map(Self::map_row).collect()
    }

    async fn delete(&self, id: WorkspaceId) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM workspaces WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(e.to_string()))?;
        Ok(())
    }
}
