// Copyright (c) 2026 Termflux
// SPDX-License-Identifier: AGPL-3.0

//! Terminal session domain model.
//!
//! A session is a named tmux session inside a workspace container. Its
//! multiplexer name is derived from the session id and unique within the
//! container. Status may bounce between `Active` and `Disconnected` any
//! number of times; `Terminated` is terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::CoreError;
use crate::domain::ids::short_id;
use crate::domain::workspace::WorkspaceId;

/// Short opaque session identifier (12-char token).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(short_id())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Disconnected,
    Terminated,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Disconnected => "disconnected",
            Self::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "active" => Ok(Self::Active),
            "disconnected" => Ok(Self::Disconnected),
            "terminated" => Ok(Self::Terminated),
            other => Err(CoreError::Validation(format!(
                "unknown session status '{other}'"
            ))),
        }
    }
}

/// Terminal geometry in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl TerminalSize {
    /// Reject degenerate or absurd geometry before it reaches tmux.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.cols == 0 || self.rows == 0 || self.cols > 1000 || self.rows > 1000 {
            return Err(CoreError::Validation(format!(
                "terminal geometry out of range: {}x{}",
                self.cols, self.rows
            )));
        }
        Ok(())
    }
}

/// Session entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub workspace_id: WorkspaceId,
    pub user_id: String,
    /// tmux window index, default 0.
    pub window_index: u32,
    pub size: TerminalSize,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(workspace_id: WorkspaceId, user_id: impl Into<String>, size: TerminalSize) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            workspace_id,
            user_id: user_id.into(),
            window_index: 0,
            size,
            status: SessionStatus::Active,
            created_at: now,
            last_seen_at: now,
            closed_at: None,
        }
    }

    /// tmux session name, unique within the container.
    pub fn multiplexer_name(&self) -> String {
        format!("termflux-{}", self.id)
    }

    pub fn touch(&mut self) {
        self.last_seen_at = Utc::now();
    }

    /// `Active <-> Disconnected` is free; nothing leaves `Terminated`.
    pub fn transition(&mut self, next: SessionStatus) -> Result<(), CoreError> {
        if self.status == SessionStatus::Terminated && next != SessionStatus::Terminated {
            return Err(CoreError::Validation(format!(
                "session {} already terminated",
                self.id
            )));
        }
        self.status = next;
        if next == SessionStatus::Terminated {
            self.closed_at = Some(Utc::now());
        }
        self.last_seen_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiplexer_name_derives_from_id() {
        let s = Session::new(WorkspaceId::new(), "u1", TerminalSize::default());
        assert_eq!(s.multiplexer_name(), format!("termflux-{}", s.id));
    }

    #[test]
    fn active_disconnected_cycles_until_terminated() {
        let mut s = Session::new(WorkspaceId::new(), "u1", TerminalSize::default());
        s.transition(SessionStatus::Disconnected).unwrap();
        s.transition(SessionStatus::Active).unwrap();
        s.transition(SessionStatus::Disconnected).unwrap();
        s.transition(SessionStatus::Terminated).unwrap();
        assert!(s.closed_at.is_some());
        assert!(s.transition(SessionStatus::Active).is_err());
    }

    #[test]
    fn geometry_bounds() {
        assert!(TerminalSize { cols: 120, rows: 40 }.validate().is_ok());
        assert!(TerminalSize { cols: 0, rows: 40 }.validate().is_err());
        assert!(TerminalSize { cols: 80, rows: 2000 }.validate().is_err());
    }
}
