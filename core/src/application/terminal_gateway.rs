// Copyright (c) 2026 Termflux
// SPDX-License-Identifier: AGPL-3.0

//! Terminal gateway application service.
//!
//! Owns the mapping {session -> container-exec stream -> client socket}.
//! The gateway process holding the attach stream is the single writer of
//! `session:{id}` and its replay buffer; everyone else reads. A second
//! attach kicks the prior connection and drives the cache record to
//! disconnected before taking over. On crash the cache TTL reclaims state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::domain::cache::{CacheSession, CacheStore};
use crate::domain::container::{AttachedStream, ContainerDriver, ContainerStatus, ExecOptions};
use crate::domain::errors::CoreError;
use crate::domain::repository::{AuthTokenRepository, SessionRepository, WorkspaceRepository};
use crate::domain::session::{Session, SessionId, SessionStatus, TerminalSize};
use crate::domain::workspace::WorkspaceId;

/// Transport keepalive period; a missed pong closes the connection at the
/// next tick.
pub const KEEPALIVE_SECS: u64 = 30;

/// An accepted attach: the session, the optional replay prefix for
/// reattaches, the duplex stream, and the kick receiver fired when another
/// connection takes the session over.
pub struct OpenedSession {
    pub session: Session,
    pub replay: Option<String>,
    pub stream: AttachedStream,
    pub connection_id: u64,
    pub kick: mpsc::Receiver<()>,
}

impl std::fmt::Debug for OpenedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedSession")
            .field("session", &self.session)
            .field("replay", &self.replay)
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

struct Attachment {
    connection_id: u64,
    kick: mpsc::Sender<()>,
}

pub struct TerminalGateway {
    driver: Arc<dyn ContainerDriver>,
    cache: Arc<dyn CacheStore>,
    sessions: Arc<dyn SessionRepository>,
    workspaces: Arc<dyn WorkspaceRepository>,
    auth_tokens: Arc<dyn AuthTokenRepository>,
    /// Live attachments: session id -> current writer connection.
    attachments: Mutex<HashMap<String, Attachment>>,
    connection_counter: AtomicU64,
}

impl TerminalGateway {
    pub fn new(
        driver: Arc<dyn ContainerDriver>,
        cache: Arc<dyn CacheStore>,
        sessions: Arc<dyn SessionRepository>,
        workspaces: Arc<dyn WorkspaceRepository>,
        auth_tokens: Arc<dyn AuthTokenRepository>,
    ) -> Self {
        Self {
            driver,
            cache,
            sessions,
            workspaces,
            auth_tokens,
            attachments: Mutex::new(HashMap::new()),
            connection_counter: AtomicU64::new(1),
        }
    }

    // ========================================================================
    // Authentication
    // ========================================================================

    /// Resolve a bearer token to a user id, cache-through to the relational
    /// auth table.
    pub async fn authenticate(&self, token: &str) -> Result<String, CoreError> {
        if token.is_empty() {
            return Err(CoreError::Auth("missing token".into()));
        }
        if let Some(user_id) = self.cache.get_auth_token(token).await? {
            return Ok(user_id);
        }
        let Some(row) = self.auth_tokens.find_valid(token).await? else {
            return Err(CoreError::Auth("invalid or expired token".into()));
        };
        let ttl = (row.expires_at - chrono::Utc::now()).num_seconds();
        if ttl > 0 {
            self.cache
                .set_auth_token(token, &row.user_id, ttl)
                .await?;
        }
        Ok(row.user_id)
    }

    // ========================================================================
    // Attach / reattach
    // ========================================================================

    /// Open a session for an authenticated user: mint a new one or reattach
    /// by id, then bind the tmux attach stream.
    pub async fn open_session(
        &self,
        user_id: &str,
        workspace_id: WorkspaceId,
        session_id: Option<SessionId>,
        size: TerminalSize,
    ) -> Result<OpenedSession, CoreError> {
        size.validate()?;

        let workspace = self
            .workspaces
            .find_by_id(workspace_id)
            .await?
            .ok_or_else(|| CoreError::not_found("workspace", workspace_id.to_string()))?;
        if workspace.user_id != user_id {
            return Err(CoreError::Auth("workspace belongs to another user".into()));
        }
        if self.driver.status(workspace_id).await? != ContainerStatus::Running {
            return Err(CoreError::Validation("workspace is not running".into()));
        }

        match session_id {
            None => self.create_session(user_id, workspace_id, size).await,
            Some(id) => self.reattach_session(user_id, workspace_id, id).await,
        }
    }

    async fn create_session(
        &self,
        user_id: &str,
        workspace_id: WorkspaceId,
        size: TerminalSize,
    ) -> Result<OpenedSession, CoreError> {
        let session = Session::new(workspace_id, user_id, size);
        let name = session.multiplexer_name();

        let created = self
            .driver
            .exec(
                workspace_id,
                &[
                    "tmux".to_string(),
                    "new-session".to_string(),
                    "-d".to_string(),
                    "-s".to_string(),
                    name.clone(),
                    "-x".to_string(),
                    size.cols.to_string(),
                    "-y".to_string(),
                    size.rows.to_string(),
                ],
                ExecOptions::default(),
            )
            .await?;
        if !created.success() {
            return Err(CoreError::Backend(format!(
                "tmux new-session failed: {}",
                created.output_string()
            )));
        }

        self.sessions.save(&session).await?;
        self.write_cache_session(&session).await?;

        let stream = self.attach(workspace_id, &name).await?;
        let (connection_id, kick) = self.register_attachment(&session.id).await;

        info!(
            session_id = %session.id,
            workspace_id = %workspace_id,
            cols = size.cols,
            rows = size.rows,
            "Created terminal session"
        );

        Ok(OpenedSession {
            session,
            replay: None,
            stream,
            connection_id,
            kick,
        })
    }

    async fn reattach_session(
        &self,
        user_id: &str,
        workspace_id: WorkspaceId,
        session_id: SessionId,
    ) -> Result<OpenedSession, CoreError> {
        let cached = self
            .cache
            .get_session(&session_id)
            .await?
            .ok_or_else(|| CoreError::Auth(format!("session {session_id} not available")))?;
        if cached.user_id != user_id || cached.workspace_id != workspace_id {
            return Err(CoreError::Auth("session belongs to another user".into()));
        }

        // Drive any prior writer off the session before taking over.
        self.kick_current_writer(&session_id).await;

        let mut session = self
            .sessions
            .find_by_id(&session_id)
            .await?
            .ok_or_else(|| CoreError::not_found("session", session_id.to_string()))?;
        session.transition(SessionStatus::Active)?;
        session.touch();
        self.sessions.save(&session).await?;
        self.write_cache_session(&session).await?;

        // Single prefix frame carrying the concatenated buffer; subsequent
        // bytes arrive as plain output.
        let chunks = self.cache.read_buffer(&session_id).await?;
        let replay = (!chunks.is_empty()).then(|| chunks.concat());

        let stream = self.attach(workspace_id, &cached.multiplexer_name).await?;
        let (connection_id, kick) = self.register_attachment(&session_id).await;

        info!(session_id = %session_id, workspace_id = %workspace_id, "Reattached terminal session");

        Ok(OpenedSession {
            session,
            replay,
            stream,
            connection_id,
            kick,
        })
    }

    async fn attach(
        &self,
        workspace_id: WorkspaceId,
        multiplexer_name: &str,
    ) -> Result<AttachedStream, CoreError> {
        self.driver
            .attach_stream(
                workspace_id,
                &[
                    "tmux".to_string(),
                    "attach-session".to_string(),
                    "-t".to_string(),
                    multiplexer_name.to_string(),
                ],
            )
            .await
    }

    // ========================================================================
    // I/O bookkeeping
    // ========================================================================

    /// Append decoded container output to the replay buffer and refresh
    /// activity.
    pub async fn append_output(&self, session_id: &SessionId, chunk: &str) -> Result<(), CoreError> {
        self.cache.append_buffer(session_id, chunk).await?;
        self.cache.touch_session(session_id).await
    }

    pub async fn touch(&self, session_id: &SessionId) {
        if let Err(e) = self.cache.touch_session(session_id).await {
            debug!(session_id = %session_id, error = %e, "Session touch failed");
        }
    }

    /// Best-effort window resize; failures are logged only.
    pub async fn resize(&self, session_id: &SessionId, size: TerminalSize) {
        if size.validate().is_err() {
            warn!(session_id = %session_id, cols = size.cols, rows = size.rows, "Ignoring out-of-range resize");
            return;
        }
        let Ok(Some(mut session)) = self.sessions.find_by_id(session_id).await else {
            return;
        };

        let result = self
            .driver
            .exec(
                session.workspace_id,
                &[
                    "tmux".to_string(),
                    "resize-window".to_string(),
                    "-t".to_string(),
                    session.multiplexer_name(),
                    "-x".to_string(),
                    size.cols.to_string(),
                    "-y".to_string(),
                    size.rows.to_string(),
                ],
                ExecOptions::default(),
            )
            .await;
        if let Err(e) = result {
            warn!(session_id = %session_id, error = %e, "tmux resize failed");
            return;
        }

        session.size = size;
        session.touch();
        if let Err(e) = self.sessions.save(&session).await {
            warn!(session_id = %session_id, error = %e, "Failed to persist resized geometry");
        }
        if let Err(e) = self.write_cache_session(&session).await {
            warn!(session_id = %session_id, error = %e, "Failed to refresh cache after resize");
        }
    }

    // ========================================================================
    // Lifecycle transitions
    // ========================================================================

    /// Client went away: session survives as disconnected, the multiplexer
    /// session inside the container stays alive, the buffer is preserved.
    /// A connection that was superseded by a newer writer releases nothing.
    pub async fn mark_disconnected(
        &self,
        session_id: &SessionId,
        connection_id: u64,
    ) -> Result<(), CoreError> {
        if !self.release_attachment(session_id, connection_id).await {
            return Ok(());
        }

        let Some(mut session) = self.sessions.find_by_id(session_id).await? else {
            return Ok(());
        };
        if session.status != SessionStatus::Active {
            return Ok(());
        }
        session.transition(SessionStatus::Disconnected)?;
        self.sessions.save(&session).await?;
        self.write_cache_session(&session).await?;
        info!(session_id = %session_id, "Session disconnected");
        Ok(())
    }

    /// The attach stream itself ended (multiplexer exit or container stop):
    /// the session is gone for good.
    pub async fn mark_terminated(
        &self,
        session_id: &SessionId,
        connection_id: u64,
    ) -> Result<(), CoreError> {
        if !self.release_attachment(session_id, connection_id).await {
            return Ok(());
        }
        self.finish_session(session_id).await
    }

    /// Explicit delete: kill the multiplexer session, then clean up.
    pub async fn delete_session(&self, session_id: &SessionId) -> Result<(), CoreError> {
        if let Some(session) = self.sessions.find_by_id(session_id).await? {
            let result = self
                .driver
                .exec(
                    session.workspace_id,
                    &[
                        "tmux".to_string(),
                        "kill-session".to_string(),
                        "-t".to_string(),
                        session.multiplexer_name(),
                    ],
                    ExecOptions::default(),
                )
                .await;
            if let Err(e) = result {
                warn!(session_id = %session_id, error = %e, "tmux kill-session failed");
            }
        }
        self.kick_current_writer(session_id).await;
        self.finish_session(session_id).await
    }

    async fn finish_session(&self, session_id: &SessionId) -> Result<(), CoreError> {
        if let Some(mut session) = self.sessions.find_by_id(session_id).await? {
            if session.status != SessionStatus::Terminated {
                session.transition(SessionStatus::Terminated)?;
                self.sessions.save(&session).await?;
            }
        }
        self.cache.remove_session(session_id).await?;
        info!(session_id = %session_id, "Session terminated");
        Ok(())
    }

    // ========================================================================
    // Listings and reaping
    // ========================================================================

    /// Relational rows merged with cache liveness: a row claiming active
    /// without a live cache record reads as disconnected.
    pub async fn list_sessions(&self, workspace_id: WorkspaceId) -> Result<Vec<Session>, CoreError> {
        let mut sessions = self.sessions.list_by_workspace(workspace_id).await?;
        for session in &mut sessions {
            if session.status == SessionStatus::Active
                && self.cache.get_session(&session.id).await?.is_none()
            {
                session.status = SessionStatus::Disconnected;
            }
        }
        Ok(sessions)
    }

    /// Reconcile rows whose cache record expired (crash recovery via TTL).
    pub async fn sweep_stale_sessions(&self, workspace_id: WorkspaceId) -> Result<usize, CoreError> {
        let mut swept = 0;
        for mut session in self.sessions.list_by_workspace(workspace_id).await? {
            if session.status == SessionStatus::Active
                && self.cache.get_session(&session.id).await?.is_none()
            {
                session.transition(SessionStatus::Disconnected)?;
                self.sessions.save(&session).await?;
                swept += 1;
            }
        }
        Ok(swept)
    }

    // ========================================================================
    // Writer registry
    // ========================================================================

    async fn register_attachment(&self, session_id: &SessionId) -> (u64, mpsc::Receiver<()>) {
        let connection_id = self.connection_counter.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(1);
        self.attachments.lock().await.insert(
            session_id.to_string(),
            Attachment {
                connection_id,
                kick: tx,
            },
        );
        (connection_id, rx)
    }

    /// Remove the caller's registry entry. Returns false when a newer
    /// connection has already taken the session over, in which case the
    /// caller must not touch session state.
    async fn release_attachment(&self, session_id: &SessionId, connection_id: u64) -> bool {
        let mut attachments = self.attachments.lock().await;
        match attachments.get(session_id.as_str()) {
            Some(a) if a.connection_id == connection_id => {
                attachments.remove(session_id.as_str());
                true
            }
            Some(_) => false,
            None => true,
        }
    }

    async fn kick_current_writer(&self, session_id: &SessionId) {
        let kick = {
            let attachments = self.attachments.lock().await;
            attachments
                .get(session_id.as_str())
                .map(|a| a.kick.clone())
        };
        if let Some(kick) = kick {
            debug!(session_id = %session_id, "Kicking prior session writer");
            let _ = kick.try_send(());
        }
    }

    async fn write_cache_session(&self, session: &Session) -> Result<(), CoreError> {
        let workspace = self.workspaces.find_by_id(session.workspace_id).await?;
        self.cache
            .set_session(&CacheSession {
                id: session.id.clone(),
                workspace_id: session.workspace_id,
                user_id: session.user_id.clone(),
                container_handle: workspace.and_then(|w| w.container_handle),
                multiplexer_name: session.multiplexer_name(),
                window_index: session.window_index,
                size: session.size,
                status: session.status,
                created_at: session.created_at,
                last_seen_at: session.last_seen_at,
            })
            .await
    }
}
