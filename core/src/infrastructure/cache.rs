// Copyright (c) 2026 Termflux
// SPDX-License-Identifier: AGPL-3.0

//! Cache store implementations.
//!
//! `RedisCache` is the production implementation over a shared connection
//! manager; `MemoryCache` backs tests and single-process development. Key
//! layout:
//!
//! ```text
//! session:{id}             hash -> CacheSession fields
//! session:{id}:buffer      list -> output chunk ring
//! workspace:{id}           hash -> CacheWorkspace fields
//! workspace:{id}:sessions  set  -> session ids
//! user:{id}:sessions       set  -> session ids
//! user:{id}:workspaces     set  -> workspace ids
//! auth:{token}             str  -> user id (expiring)
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use uuid::Uuid;

use crate::domain::cache::{
    CacheSession, CacheStore, CacheWorkspace, BUFFER_MAX_ENTRIES, SESSION_TTL_SECS,
};
use crate::domain::errors::CoreError;
use crate::domain::session::{SessionId, SessionStatus, TerminalSize};
use crate::domain::workspace::{ContainerHandle, WorkspaceId, WorkspaceStatus};

impl From<redis::RedisError> for CoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(format!("cache error: {err}"))
    }
}

// ============================================================================
// Redis implementation
// ============================================================================

#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| CoreError::Backend(format!("invalid redis url: {e}")))?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }

    fn session_key(id: &SessionId) -> String {
        format!("session:{id}")
    }

    fn buffer_key(id: &SessionId) -> String {
        format!("session:{id}:buffer")
    }

    fn workspace_key(id: WorkspaceId) -> String {
        format!("workspace:{id}")
    }

    fn workspace_sessions_key(id: WorkspaceId) -> String {
        format!("workspace:{id}:sessions")
    }

    fn user_sessions_key(user_id: &str) -> String {
        format!("user:{user_id}:sessions")
    }

    fn user_workspaces_key(user_id: &str) -> String {
        format!("user:{user_id}:workspaces")
    }

    fn auth_key(token: &str) -> String {
        format!("auth:{token}")
    }

    fn session_fields(session: &CacheSession) -> Vec<(&'static str, String)> {
        vec![
            ("id", session.id.to_string()),
            ("workspace_id", session.workspace_id.to_string()),
            ("user_id", session.user_id.clone()),
            (
                "container_handle",
                session
                    .container_handle
                    .as_ref()
                    .map(|h| h.to_string())
                    .unwrap_or_default(),
            ),
            ("multiplexer_name", session.multiplexer_name.clone()),
            ("window_index", session.window_index.to_string()),
            ("cols", session.size.cols.to_string()),
            ("rows", session.size.rows.to_string()),
            ("status", session.status.as_str().to_string()),
            ("created_at", session.created_at.to_rfc3339()),
            ("last_seen_at", session.last_seen_at.to_rfc3339()),
        ]
    }

    fn parse_session(fields: HashMap<String, String>) -> Result<CacheSession, CoreError> {
        let get = |key: &str| {
            fields
                .get(key)
                .cloned()
                .ok_or_else(|| CoreError::Backend(format!("cache session missing field '{key}'")))
        };
        let parse_ts = |raw: String| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|e| CoreError::Backend(format!("bad cache timestamp: {e}")))
        };
        let workspace_id = Uuid::parse_str(&get("workspace_id")?)
            .map_err(|e| CoreError::Backend(format!("bad workspace id in cache: {e}")))?;
        let handle = get("container_handle")?;

        Ok(CacheSession {
            id: SessionId::from_string(get("id")?),
            workspace_id: WorkspaceId(workspace_id),
            user_id: get("user_id")?,
            container_handle: (!handle.is_empty()).then(|| ContainerHandle::new(handle)),
            multiplexer_name: get("multiplexer_name")?,
            window_index: get("window_index")?.parse().unwrap_or(0),
            size: TerminalSize {
                cols: get("cols")?.parse().unwrap_or(80),
                rows: get("rows")?.parse().unwrap_or(24),
            },
            status: SessionStatus::parse(&get("status")?)?,
            created_at: parse_ts(get("created_at")?)?,
            last_seen_at: parse_ts(get("last_seen_at")?)?,
        })
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn set_session(&self, session: &CacheSession) -> Result<(), CoreError> {
        let mut conn = self.conn.clone();
        let key = Self::session_key(&session.id);
        let fields = Self::session_fields(session);
        let () = conn.hset_multiple(&key, &fields).await?;
        let () = conn.expire(&key, SESSION_TTL_SECS).await?;
        let () = conn
            .sadd(
                Self::workspace_sessions_key(session.workspace_id),
                session.id.to_string(),
            )
            .await?;
        let () = conn
            .sadd(
                Self::user_sessions_key(&session.user_id),
                session.id.to_string(),
            )
            .await?;
        Ok(())
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<CacheSession>, CoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(Self::session_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Self::parse_session(fields).map(Some)
    }

    async fn touch_session(&self, id: &SessionId) -> Result<(), CoreError> {
        let mut conn = self.conn.clone();
        let () = conn.expire(Self::session_key(id), SESSION_TTL_SECS).await?;
        let () = conn.expire(Self::buffer_key(id), SESSION_TTL_SECS).await?;
        Ok(())
    }

    async fn remove_session(&self, id: &SessionId) -> Result<(), CoreError> {
        let session = self.get_session(id).await?;
        let mut conn = self.conn.clone();
        let () = conn.del(Self::session_key(id)).await?;
        let () = conn.del(Self::buffer_key(id)).await?;
        if let Some(session) = session {
            let () = conn
                .srem(
                    Self::workspace_sessions_key(session.workspace_id),
                    id.to_string(),
                )
                .await?;
            let () = conn
                .srem(Self::user_sessions_key(&session.user_id), id.to_string())
                .await?;
        }
        Ok(())
    }

    async fn workspace_sessions(&self, id: WorkspaceId) -> Result<Vec<SessionId>, CoreError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(Self::workspace_sessions_key(id)).await?;
        Ok(members.into_iter().map(SessionId::from_string).collect())
    }

    async fn user_sessions(&self, user_id: &str) -> Result<Vec<SessionId>, CoreError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(Self::user_sessions_key(user_id)).await?;
        Ok(members.into_iter().map(SessionId::from_string).collect())
    }

    async fn append_buffer(&self, id: &SessionId, chunk: &str) -> Result<(), CoreError> {
        let mut conn = self.conn.clone();
        let key = Self::buffer_key(id);
        let () = conn.rpush(&key, chunk).await?;
        let () = conn.ltrim(&key, -BUFFER_MAX_ENTRIES, -1).await?;
        let () = conn.expire(&key, SESSION_TTL_SECS).await?;
        Ok(())
    }

    async fn read_buffer(&self, id: &SessionId) -> Result<Vec<String>, CoreError> {
        let mut conn = self.conn.clone();
        let chunks: Vec<String> = conn.lrange(Self::buffer_key(id), 0, -1).await?;
        Ok(chunks)
    }

    async fn clear_buffer(&self, id: &SessionId) -> Result<(), CoreError> {
        let mut conn = self.conn.clone();
        let () = conn.del(Self::buffer_key(id)).await?;
        Ok(())
    }

    async fn set_workspace(&self, workspace: &CacheWorkspace) -> Result<(), CoreError> {
        let mut conn = self.conn.clone();
        let key = Self::workspace_key(workspace.id);
        let fields = vec![
            ("id", workspace.id.to_string()),
            ("user_id", workspace.user_id.clone()),
            ("status", workspace.status.as_str().to_string()),
            (
                "container_handle",
                workspace
                    .container_handle
                    .as_ref()
                    .map(|h| h.to_string())
                    .unwrap_or_default(),
            ),
        ];
        let () = conn.hset_multiple(&key, &fields).await?;
        let () = conn
            .sadd(
                Self::user_workspaces_key(&workspace.user_id),
                workspace.id.to_string(),
            )
            .await?;
        Ok(())
    }

    async fn get_workspace(&self, id: WorkspaceId) -> Result<Option<CacheWorkspace>, CoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(Self::workspace_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let handle = fields.get("container_handle").cloned().unwrap_or_default();
        Ok(Some(CacheWorkspace {
            id,
            user_id: fields.get("user_id").cloned().unwrap_or_default(),
            status: WorkspaceStatus::parse(
                fields.get("status").map(String::as_str).unwrap_or("error"),
            )?,
            container_handle: (!handle.is_empty()).then(|| ContainerHandle::new(handle)),
        }))
    }

    async fn remove_workspace(&self, id: WorkspaceId) -> Result<(), CoreError> {
        let workspace = self.get_workspace(id).await?;
        let mut conn = self.conn.clone();
        let () = conn.del(Self::workspace_key(id)).await?;
        let () = conn.del(Self::workspace_sessions_key(id)).await?;
        if let Some(workspace) = workspace {
            let () = conn
                .srem(
                    Self::user_workspaces_key(&workspace.user_id),
                    id.to_string(),
                )
                .await?;
        }
        Ok(())
    }

    async fn user_workspaces(&self, user_id: &str) -> Result<Vec<WorkspaceId>, CoreError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(Self::user_workspaces_key(user_id)).await?;
        Ok(members
            .into_iter()
            .filter_map(|raw| Uuid::parse_str(&raw).ok().map(WorkspaceId))
            .collect())
    }

    async fn set_auth_token(
        &self,
        token: &str,
        user_id: &str,
        ttl_secs: i64,
    ) -> Result<(), CoreError> {
        if ttl_secs <= 0 {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let () = conn
            .set_ex(Self::auth_key(token), user_id, ttl_secs as u64)
            .await?;
        Ok(())
    }

    async fn get_auth_token(&self, token: &str) -> Result<Option<String>, CoreError> {
        let mut conn = self.conn.clone();
        let user_id: Option<String> = conn.get(Self::auth_key(token)).await?;
        Ok(user_id)
    }

    async fn remove_auth_token(&self, token: &str) -> Result<(), CoreError> {
        let mut conn = self.conn.clone();
        let () = conn.del(Self::auth_key(token)).await?;
        Ok(())
    }
}

// ============================================================================
// In-memory implementation (tests, single-process development)
// ============================================================================

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<String, CacheSession>,
    buffers: HashMap<String, VecDeque<String>>,
    workspaces: HashMap<WorkspaceId, CacheWorkspace>,
    auth: HashMap<String, (String, DateTime<Utc>)>,
}

#[derive(Default)]
pub struct MemoryCache {
    state: Mutex<MemoryState>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn set_session(&self, session: &CacheSession) -> Result<(), CoreError> {
        let mut state = self.state.lock().unwrap();
        state
            .sessions
            .insert(session.id.to_string(), session.clone());
        Ok(())
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<CacheSession>, CoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.sessions.get(id.as_str()).cloned())
    }

    async fn touch_session(&self, _id: &SessionId) -> Result<(), CoreError> {
        Ok(())
    }

    async fn remove_session(&self, id: &SessionId) -> Result<(), CoreError> {
        let mut state = self.state.lock().unwrap();
        state.sessions.remove(id.as_str());
        state.buffers.remove(id.as_str());
        Ok(())
    }

    async fn workspace_sessions(&self, id: WorkspaceId) -> Result<Vec<SessionId>, CoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .sessions
            .values()
            .filter(|s| s.workspace_id == id)
            .map(|s| s.id.clone())
            .collect())
    }

    async fn user_sessions(&self, user_id: &str) -> Result<Vec<SessionId>, CoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .map(|s| s.id.clone())
            .collect())
    }

    async fn append_buffer(&self, id: &SessionId, chunk: &str) -> Result<(), CoreError> {
        let mut state = self.state.lock().unwrap();
        let buffer = state.buffers.entry(id.to_string()).or_default();
        buffer.push_back(chunk.to_string());
        while buffer.len() > BUFFER_MAX_ENTRIES as usize {
            buffer.pop_front();
        }
        Ok(())
    }

    async fn read_buffer(&self, id: &SessionId) -> Result<Vec<String>, CoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .buffers
            .get(id.as_str())
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn clear_buffer(&self, id: &SessionId) -> Result<(), CoreError> {
        let mut state = self.state.lock().unwrap();
        state.buffers.remove(id.as_str());
        Ok(())
    }

    async fn set_workspace(&self, workspace: &CacheWorkspace) -> Result<(), CoreError> {
        let mut state = self.state.lock().unwrap();
        state.workspaces.insert(workspace.id, workspace.clone());
        Ok(())
    }

    async fn get_workspace(&self, id: WorkspaceId) -> Result<Option<CacheWorkspace>, CoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.workspaces.get(&id).cloned())
    }

    async fn remove_workspace(&self, id: WorkspaceId) -> Result<(), CoreError> {
        let mut state = self.state.lock().unwrap();
        state.workspaces.remove(&id);
        Ok(())
    }

    async fn user_workspaces(&self, user_id: &str) -> Result<Vec<WorkspaceId>, CoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .workspaces
            .values()
            .filter(|w| w.user_id == user_id)
            .map(|w| w.id)
            .collect())
    }

    async fn set_auth_token(
        &self,
        token: &str,
        user_id: &str,
        ttl_secs: i64,
    ) -> Result<(), CoreError> {
        let mut state = self.state.lock().unwrap();
        let expires_at = Utc::now() + chrono::Duration::seconds(ttl_secs.max(0));
        state
            .auth
            .insert(token.to_string(), (user_id.to_string(), expires_at));
        Ok(())
    }

    async fn get_auth_token(&self, token: &str) -> Result<Option<String>, CoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.auth.get(token).and_then(|(user_id, expires_at)| {
            (*expires_at > Utc::now()).then(|| user_id.clone())
        }))
    }

    async fn remove_auth_token(&self, token: &str) -> Result<(), CoreError> {
        let mut state = self.state.lock().unwrap();
        state.auth.remove(token);
        Ok(())
    }
}
