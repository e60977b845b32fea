// Copyright (c) 2026 Termflux
// SPDX-License-Identifier: AGPL-3.0

//! Client wire protocol: one JSON object per message.
//!
//! The client sends `input`, `resize` and `ping`; the gateway sends
//! `output`, `ready` (once, with the bound session id), `reconnect` (a
//! single prefix carrying the replay buffer on reattach), `error` and
//! `pong`.

use serde::{Deserialize, Serialize};

use crate::domain::errors::CoreError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Input {
        data: String,
    },
    Output {
        data: String,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
    Ping,
    Pong,
    Error {
        error: String,
    },
    Ready {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Reconnect {
        data: String,
    },
}

impl Frame {
    pub fn to_json(&self) -> String {
        // Frame serialization cannot fail: every variant is a flat struct
        // of strings and integers.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn parse(text: &str) -> Result<Self, CoreError> {
        serde_json::from_str(text)
            .map_err(|e| CoreError::Validation(format!("malformed frame: {e}")))
    }
}

// ============================================================================
// Close codes (client direction)
// ============================================================================

pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Server shutting down.
    pub const GOING_AWAY: u16 = 1001;
    /// Missing required query parameters.
    pub const MISSING_PARAMS: u16 = 4001;
    /// Authentication failed.
    pub const AUTH_FAILED: u16 = 4002;
    /// Workspace not found, not running, or access denied.
    pub const ACCESS_DENIED: u16 = 4003;
    /// Session setup failed on the backend.
    pub const SETUP_FAILED: u16 = 4004;
}

/// Map a setup error onto the close code the client should observe.
pub fn close_code_for(error: &CoreError) -> u16 {
    match error {
        CoreError::Auth(_) | CoreError::NotFound { .. } | CoreError::Validation(_) => {
            close_code::ACCESS_DENIED
        }
        _ => close_code::SETUP_FAILED,
    }
}
