// Copyright (c) 2026 Termflux
// SPDX-License-Identifier: AGPL-3.0

//! Repository implementations.
//!
//! PostgreSQL repositories persist rows; in-memory twins back tests and
//! single-process development. Infrastructure errors are mapped to
//! `RepositoryError` at this boundary.

pub mod postgres_auth;
pub mod postgres_secret;
pub mod postgres_session;
pub mod postgres_workflow;
pub mod postgres_workspace;

pub use postgres_auth::{PostgresAppInstallRepository, PostgresAuthTokenRepository};
pub use postgres_secret::PostgresSecretRepository;
pub use postgres_session::PostgresSessionRepository;
pub use postgres_workflow::{PostgresRunRepository, PostgresWorkflowRepository};
pub use postgres_workspace::PostgresWorkspaceRepository;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::domain::repository::{
    AppInstallRecord, AppInstallRepository, AuthToken, AuthTokenRepository, RepositoryError,
    RunRepository, SecretRepository, SessionRepository, WorkflowRepository, WorkspaceRepository,
};
use crate::domain::secret::Secret;
use crate::domain::session::{Session, SessionId};
use crate::domain::workflow::{RunId, WorkflowDefinition, WorkflowId, WorkflowRun};
use crate::domain::workspace::{Workspace, WorkspaceId};

#[derive(Default)]
pub struct InMemoryWorkspaceRepository {
    rows: RwLock<HashMap<WorkspaceId, Workspace>>,
}

impl InMemoryWorkspaceRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkspaceRepository for InMemoryWorkspaceRepository {
    async fn save(&self, workspace: &Workspace) -> Result<(), RepositoryError> {
        self.rows
            .write()
            .unwrap()
            .insert(workspace.id, workspace.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: WorkspaceId) -> Result<Option<Workspace>, RepositoryError> {
        Ok(self.rows.read().unwrap().get(&id).cloned())
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<Workspace>, RepositoryError> {
        Ok(self
            .rows
            .read()
            .unwrap()
            .values()
            .filter(|w| w.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn delete(&self, id: WorkspaceId) -> Result<(), RepositoryError> {
        self.rows.write().unwrap().remove(&id);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemorySessionRepository {
    rows: RwLock<HashMap<String, Session>>,
}

impl InMemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn save(&self, session: &Session) -> Result<(), RepositoryError> {
        self.rows
            .write()
            .unwrap()
            .insert(session.id.to_string(), session.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &SessionId) -> Result<Option<Session>, RepositoryError> {
        Ok(self.rows.read().unwrap().get(id.as_str()).cloned())
    }

    async fn list_by_workspace(&self, id: WorkspaceId) -> Result<Vec<Session>, RepositoryError> {
        Ok(self
            .rows
            .read()
            .unwrap()
            .values()
            .filter(|s| s.workspace_id == id)
            .cloned()
            .collect())
    }

    async fn delete(&self, id: &SessionId) -> Result<(), RepositoryError> {
        self.rows.write().unwrap().remove(id.as_str());
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryWorkflowRepository {
    rows: RwLock<HashMap<WorkflowId, WorkflowDefinition>>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn save(&self, workflow: &WorkflowDefinition) -> Result<(), RepositoryError> {
        self.rows
            .write()
            .unwrap()
            .insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn find_by_id(
        &self,
        id: WorkflowId,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.rows.read().unwrap().get(&id).cloned())
    }

    async fn list_by_workspace(
        &self,
        id: WorkspaceId,
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        Ok(self
            .rows
            .read()
            .unwrap()
            .values()
            .filter(|w| w.workspace_id == id)
            .cloned()
            .collect())
    }

    async fn delete(&self, id: WorkflowId) -> Result<(), RepositoryError> {
        self.rows.write().unwrap().remove(&id);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryRunRepository {
    rows: RwLock<HashMap<String, WorkflowRun>>,
}

impl InMemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunRepository for InMemoryRunRepository {
    async fn save(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        self.rows
            .write()
            .unwrap()
            .insert(run.id.to_string(), run.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &RunId) -> Result<Option<WorkflowRun>, RepositoryError> {
        Ok(self.rows.read().unwrap().get(id.as_str()).cloned())
    }

    async fn list_by_workflow(
        &self,
        id: WorkflowId,
        limit: i64,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let mut runs: Vec<WorkflowRun> = self
            .rows
            .read()
            .unwrap()
            .values()
            .filter(|r| r.workflow_id == id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs.truncate(limit.max(0) as usize);
        Ok(runs)
    }
}

#[derive(Default)]
pub struct InMemorySecretRepository {
    rows: RwLock<HashMap<(WorkspaceId, String), Secret>>,
}

impl InMemorySecretRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretRepository for InMemorySecretRepository {
    async fn save(&self, secret: &Secret) -> Result<(), RepositoryError> {
        self.rows
            .write()
            .unwrap()
            .insert((secret.workspace_id, secret.name.clone()), secret.clone());
        Ok(())
    }

    async fn find_by_name(
        &self,
        workspace_id: WorkspaceId,
        name: &str,
    ) -> Result<Option<Secret>, RepositoryError> {
        Ok(self
            .rows
            .read()
            .unwrap()
            .get(&(workspace_id, name.to_string()))
            .cloned())
    }

    async fn list_by_workspace(
        &self,
        workspace_id: WorkspaceId,
    ) -> Result<Vec<Secret>, RepositoryError> {
        let mut secrets: Vec<Secret> = self
            .rows
            .read()
            .unwrap()
            .values()
            .filter(|s| s.workspace_id == workspace_id)
            .cloned()
            .collect();
        secrets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(secrets)
    }

    async fn delete(
        &self,
        workspace_id: WorkspaceId,
        name: &str,
    ) -> Result<bool, RepositoryError> {
        Ok(self
            .rows
            .write()
            .unwrap()
            .remove(&(workspace_id, name.to_string()))
            .is_some())
    }
}

#[derive(Default)]
pub struct InMemoryAuthTokenRepository {
    rows: RwLock<HashMap<String, AuthToken>>,
}

impl InMemoryAuthTokenRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: AuthToken) {
        self.rows
            .write()
            .unwrap()
            .insert(token.token.clone(), token);
    }
}

#[async_trait]
impl AuthTokenRepository for InMemoryAuthTokenRepository {
    async fn find_valid(&self, token: &str) -> Result<Option<AuthToken>, RepositoryError> {
        Ok(self
            .rows
            .read()
            .unwrap()
            .get(token)
            .filter(|t| t.expires_at > chrono::Utc::now())
            .cloned())
    }
}

#[derive(Default)]
pub struct InMemoryAppInstallRepository {
    rows: RwLock<Vec<AppInstallRecord>>,
}

impl InMemoryAppInstallRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AppInstallRepository for InMemoryAppInstallRepository {
    async fn record(&self, install: &AppInstallRecord) -> Result<(), RepositoryError> {
        self.rows.write().unwrap().push(install.clone());
        Ok(())
    }

    async fn list_by_workspace(
        &self,
        workspace_id: WorkspaceId,
    ) -> Result<Vec<AppInstallRecord>, RepositoryError> {
        Ok(self
            .rows
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.workspace_id == workspace_id)
            .cloned()
            .collect())
    }
}
