// Copyright (c) 2026 Termflux
// SPDX-License-Identifier: AGPL-3.0

//! Session/state cache abstraction.
//!
//! The cache is authoritative for live routing (which sessions exist, where
//! they attach) and advisory for everything else; relational rows win once a
//! record goes terminal. Keys are partitioned by session/workspace id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::CoreError;
use crate::domain::session::{SessionId, SessionStatus, TerminalSize};
use crate::domain::workspace::{ContainerHandle, WorkspaceId, WorkspaceStatus};

/// Session TTL; every write refreshes it.
pub const SESSION_TTL_SECS: i64 = 86_400;

/// Replay buffer cap in entries.
pub const BUFFER_MAX_ENTRIES: isize = 1000;

/// Cache mirror of a session, extended with routing fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSession {
    pub id: SessionId,
    pub workspace_id: WorkspaceId,
    pub user_id: String,
    pub container_handle: Option<ContainerHandle>,
    pub multiplexer_name: String,
    pub window_index: u32,
    pub size: TerminalSize,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Cache mirror of a workspace for hot reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheWorkspace {
    pub id: WorkspaceId,
    pub user_id: String,
    pub status: WorkspaceStatus,
    pub container_handle: Option<ContainerHandle>,
}

/// Key/value store operations used by the runtime core.
///
/// Reads after a completed write observe the write; no cross-key atomicity
/// is assumed anywhere.
#[async_trait]
pub trait CacheStore: Send + Sync {
    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Write the session record and its set memberships, refreshing TTLs.
    async fn set_session(&self, session: &CacheSession) -> Result<(), CoreError>;

    async fn get_session(&self, id: &SessionId) -> Result<Option<CacheSession>, CoreError>;

    /// Refresh the TTL without rewriting fields.
    async fn touch_session(&self, id: &SessionId) -> Result<(), CoreError>;

    /// Remove the record, its replay buffer and both set memberships.
    async fn remove_session(&self, id: &SessionId) -> Result<(), CoreError>;

    async fn workspace_sessions(&self, id: WorkspaceId) -> Result<Vec<SessionId>, CoreError>;

    async fn user_sessions(&self, user_id: &str) -> Result<Vec<SessionId>, CoreError>;

    // ------------------------------------------------------------------
    // Replay buffer
    // ------------------------------------------------------------------

    /// Append an output chunk, trim to the last `BUFFER_MAX_ENTRIES`, and
    /// refresh the buffer TTL.
    async fn append_buffer(&self, id: &SessionId, chunk: &str) -> Result<(), CoreError>;

    async fn read_buffer(&self, id: &SessionId) -> Result<Vec<String>, CoreError>;

    async fn clear_buffer(&self, id: &SessionId) -> Result<(), CoreError>;

    // ------------------------------------------------------------------
    // Workspaces
    // ------------------------------------------------------------------

    async fn set_workspace(&self, workspace: &CacheWorkspace) -> Result<(), CoreError>;

    async fn get_workspace(&self, id: WorkspaceId) -> Result<Option<CacheWorkspace>, CoreError>;

    async fn remove_workspace(&self, id: WorkspaceId) -> Result<(), CoreError>;

    async fn user_workspaces(&self, user_id: &str) -> Result<Vec<WorkspaceId>, CoreError>;

    // ------------------------------------------------------------------
    // Auth tokens
    // ------------------------------------------------------------------

    /// Cache `auth:{token} -> user id` with the issued expiry.
    async fn set_auth_token(
        &self,
        token: &str,
        user_id: &str,
        ttl_secs: i64,
    ) -> Result<(), CoreError>;

    async fn get_auth_token(&self, token: &str) -> Result<Option<String>, CoreError>;

    async fn remove_auth_token(&self, token: &str) -> Result<(), CoreError>;
}
