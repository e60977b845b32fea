// Copyright (c) 2026 Termflux
// SPDX-License-Identifier: AGPL-3.0

//! Auth token and app-install rows. Token issuance lives outside the core;
//! these repositories only resolve and record.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::domain::repository::{
    AppInstallRecord, AppInstallRepository, AuthToken, AuthTokenRepository, RepositoryError,
};
use crate::domain::workspace::WorkspaceId;

pub struct PostgresAuthTokenRepository {
    pool: PgPool,
}

impl PostgresAuthTokenRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuthTokenRepository for PostgresAuthTokenRepository {
    async fn find_valid(&self, token: &str) -> Result<Option<AuthToken>, RepositoryError> {
        let row = sqlx::query(
            "SELECT token, user_id, expires_at FROM auth_tokens WHERE token = $1 AND expires_at > $2",
        )
        .bind(token)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(e.to_string()))?;

        let db = |e: sqlx::Error| RepositoryError::Database(e.to_string());
        row.map(|row| {
            Ok(AuthToken {
                token: row.try_get("token").map_err(db)?,
                user_id: row.try_get("user_id").map_err(db)?,
                expires_at: row.try_get("expires_at").map_err(db)?,
            })
        })
        .transpose()
    }
}

pub struct PostgresAppInstallRepository {
    pool: PgPool,
}

impl PostgresAppInstallRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AppInstallRepository for PostgresAppInstallRepository {
    async fn record(&self, install: &AppInstallRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO app_installs (workspace_id, app_id, installed_at, success)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (workspace_id, app_id) DO UPDATE SET
                installed_at = EXCLUDED.installed_at,
                success = EXCLUDED.success
            "#,
        )
        .bind(install.workspace_id.0)
        .bind(&install.app_id)
        .bind(install.installed_at)
        .bind(install.success)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(e.to_string()))?;
        Ok(())
    }

    async fn list_by_workspace(
        &self,
        workspace_id: WorkspaceId,
    ) -> Result<Vec<AppInstallRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM app_installs WHERE workspace_id = $1 ORDER BY installed_at DESC",
        )
        .bind(workspace_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(e.to_string()))?;

        let db = |e: sqlx::Error| RepositoryError::Database(e.to_string());
        rows.into_iter()
            .map(|row| {
                Ok(AppInstallRecord {
                    workspace_id: WorkspaceId(row.try_get("workspace_id").map_err(db)?),
                    app_id: row.try_get("app_id").map_err(db)?,
                    installed_at: row.try_get("installed_at").map_err(db)?,
                    success: row.try_get("success").map_err(db)?,
                })
            })
            .collect()
    }
}
