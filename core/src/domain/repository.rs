// Copyright (c) 2026 Termflux
// SPDX-License-Identifier: AGPL-3.0

//! Repository abstractions for the relational store.
//!
//! The relational store persists rows whose authoritative state lives
//! elsewhere (cache, container runtime) and serves non-routing reads:
//! listings and history. Infrastructure provides PostgreSQL and in-memory
//! implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::secret::Secret;
use crate::domain::session::{Session, SessionId};
use crate::domain::workflow::{RunId, WorkflowDefinition, WorkflowId, WorkflowRun};
use crate::domain::workspace::{Workspace, WorkspaceId};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl From<RepositoryError> for crate::domain::errors::CoreError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(id) => Self::not_found("record", id),
            other => Self::Backend(other.to_string()),
        }
    }
}

#[async_trait]
pub trait WorkspaceRepository: Send + Sync {
    async fn save(&self, workspace: &Workspace) -> Result<(), RepositoryError>;
    async fn find_by_id(&self, id: WorkspaceId) -> Result<Option<Workspace>, RepositoryError>;
    async fn list_by_user(&self, user_id: &str) -> Result<Vec<Workspace>, RepositoryError>;
    async fn delete(&self, id: WorkspaceId) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn save(&self, session: &Session) -> Result<(), RepositoryError>;
    async fn find_by_id(&self, id: &SessionId) -> Result<Option<Session>, RepositoryError>;
    async fn list_by_workspace(&self, id: WorkspaceId) -> Result<Vec<Session>, RepositoryError>;
    async fn delete(&self, id: &SessionId) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn save(&self, workflow: &WorkflowDefinition) -> Result<(), RepositoryError>;
    async fn find_by_id(&self, id: WorkflowId)
        -> Result<Option<WorkflowDefinition>, RepositoryError>;
    async fn list_by_workspace(
        &self,
        id: WorkspaceId,
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError>;
    async fn delete(&self, id: WorkflowId) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait RunRepository: Send + Sync {
    async fn save(&self, run: &WorkflowRun) -> Result<(), RepositoryError>;
    async fn find_by_id(&self, id: &RunId) -> Result<Option<WorkflowRun>, RepositoryError>;
    /// History listing, most recent first.
    async fn list_by_workflow(
        &self,
        id: WorkflowId,
        limit: i64,
    ) -> Result<Vec<WorkflowRun>, RepositoryError>;
}

#[async_trait]
pub trait SecretRepository: Send + Sync {
    /// Upsert by `(workspace_id, name)`.
    async fn save(&self, secret: &Secret) -> Result<(), RepositoryError>;
    async fn find_by_name(
        &self,
        workspace_id: WorkspaceId,
        name: &str,
    ) -> Result<Option<Secret>, RepositoryError>;
    async fn list_by_workspace(
        &self,
        workspace_id: WorkspaceId,
    ) -> Result<Vec<Secret>, RepositoryError>;
    /// Returns true when a row was deleted.
    async fn delete(&self, workspace_id: WorkspaceId, name: &str) -> Result<bool, RepositoryError>;
}

/// Issued bearer token row. Issuance itself is out of scope; the gateway
/// only resolves tokens to users.
#[derive(Debug, Clone)]
pub struct AuthToken {
    pub token: String,
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait AuthTokenRepository: Send + Sync {
    async fn find_valid(&self, token: &str) -> Result<Option<AuthToken>, RepositoryError>;
}

/// App-catalog install record written by the provisioner.
#[derive(Debug, Clone)]
pub struct AppInstallRecord {
    pub workspace_id: WorkspaceId,
    pub app_id: String,
    pub installed_at: DateTime<Utc>,
    pub success: bool,
}

#[async_trait]
pub trait AppInstallRepository: Send + Sync {
    async fn record(&self, install: &AppInstallRecord) -> Result<(), RepositoryError>;
    async fn list_by_workspace(
        &self,
        workspace_id: WorkspaceId,
    ) -> Result<Vec<AppInstallRecord>, RepositoryError>;
}
