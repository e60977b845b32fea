// Copyright (c) 2026 Termflux
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::domain::repository::{RepositoryError, SecretRepository};
use crate::domain::secret::Secret;
use crate::domain::workspace::WorkspaceId;

pub struct PostgresSecretRepository {
    pool: PgPool,
}

impl PostgresSecretRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: &sqlx::postgres::PgRow) -> Result<Secret, RepositoryError> {
        let db = |e: sqlx::Error| RepositoryError::Database(e.to_string());
        let envelope: serde_json::Value = row.try_get("envelope").map_err(db)?;

        Ok(Secret {
            id: row.try_get("id").map_err(db)?,
            workspace_id: WorkspaceId(row.try_get("workspace_id").map_err(db)?),
            name: row.try_get("name").map_err(db)?,
            envelope: serde_json::from_value(envelope)
                .map_err(|e| RepositoryError::Serialization(e.to_string()))?,
            created_at: row.try_get("created_at").map_err(db)?,
            updated_at: row.try_get("updated_at").map_err(db)?,
        })
    }
}

#[async_trait]
impl SecretRepository for PostgresSecretRepository {
    async fn save(&self, secret: &Secret) -> Result<(), RepositoryError> {
        let envelope = serde_json::to_value(&secret.envelope)
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO secrets (id, workspace_id, name, envelope, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (workspace_id, name) DO UPDATE SET
                envelope = EXCLUDED.envelope,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(secret.id)
        .bind(secret.workspace_id.0)
        .bind(&secret.name)
        .bind(&envelope)
        .bind(secret.created_at)
        .bind(secret.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("failed to save secret: {e}")))?;

        Ok(())
    }

    async fn find_by_name(
        &self,
        workspace_id: WorkspaceId,
        name: &str,
    ) -> Result<Option<Secret>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM secrets WHERE workspace_id = $1 AND name = $2")
            .bind(workspace_id.0)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(e.to_string()))?;

        row.as_ref().map(Self::map_row).transpose()
    }

    async fn list_by_workspace(
        &self,
        workspace_id: WorkspaceId,
    ) -> Result<Vec<Secret>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM secrets WHERE workspace_id = $1 ORDER BY name ASC",
        )
        .bind(workspace_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(e.to_string()))?;

        rows.iter().map(Self::map_row).collect()
    }

    async fn delete(
        &self,
        workspace_id: WorkspaceId,
        name: &str,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM secrets WHERE workspace_id = $1 AND name = $2")
            .bind(workspace_id.0)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}
