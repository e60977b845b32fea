// Copyright (c) 2026 Termflux
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::domain::repository::{RepositoryError, SessionRepository};
use crate::domain::session::{Session, SessionId, SessionStatus, TerminalSize};
use crate::domain::workspace::WorkspaceId;

pub struct PostgresSessionRepository {
    pool: PgPool,
}

impl PostgresSessionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: &sqlx::postgres::PgRow) -> Result<Session, RepositoryError> {
        let db = |e: sqlx::Error| RepositoryError::Database(e.to_string());
        let status: String = row.try_get("status").map_err(db)?;

        Ok(Session {
            id: SessionId::from_string(row.try_get::<String, _>("id").map_err(db)?),
            workspace_id: WorkspaceId(row.try_get("workspace_id").map_err(db)?),
            user_id: row.try_get("user_id").map_err(db)?,
            window_index: row.try_get::<i32, _>("window_index").map_err(db)? as u32,
            size: TerminalSize {
                cols: row.try_get::<i32, _>("cols").map_err(db)? as u16,
                rows: row.try_get::<i32, _>("rows").map_err(db)? as u16,
            },
            status: SessionStatus::parse(&status)
                .map_err(|e| RepositoryError::Serialization(e.to_string()))?,
            created_at: row.try_get("created_at").map_err(db)?,
            last_seen_at: row.try_get("last_seen_at").map_err(db)?,
            closed_at: row.try_get("closed_at").map_err(db)?,
        })
    }
}

#[async_trait]
impl SessionRepository for PostgresSessionRepository {
    async fn save(&self, session: &Session) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO sessions
                (id, workspace_id, user_id, window_index, cols, rows,
                 status, created_at, last_seen_at, closed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                window_index = EXCLUDED.window_index,
                cols = EXCLUDED.cols,
                rows = EXCLUDED.rows,
                status = EXCLUDED.status,
                last_seen_at = EXCLUDED.last_seen_at,
                closed_at = EXCLUDED.closed_at
            "#,
        )
        .bind(session.id.as_str())
        .bind(session.workspace_id.0)
        .bind(&session.user_id)
        .bind(session.window_index as i32)
        .bind(i32::from(session.size.cols))
        .bind(i32::from(session.size.rows))
        .bind(session.status.as_str())
        .bind(session.created_at)
        .bind(session.last_seen_at)
        .bind(session.closed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("failed to save session: {e}")))?;

        Ok(())
    }

    async fn find_by_id(&self, id: &SessionId) -> Result<Option<Session>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(e.to_string()))?;

        row.as_ref().map(Self::map_row).transpose()
    }

    async fn list_by_workspace(&self, id: WorkspaceId) -> Result<Vec<Session>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM sessions WHERE workspace_id = $1 ORDER BY created_at DESC",
        )
        .bind(id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(e.to_string()))?;

        rows.iter().map(Self::map_row).collect()
    }

    async fn delete(&self, id: &SessionId) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(e.to_string()))?;
        Ok(())
    }
}
