// Copyright (c) 2026 Termflux
// SPDX-License-Identifier: AGPL-3.0

//! Core error taxonomy shared across all runtime components.
//!
//! Validation, auth, not-found and conflict errors surface to the caller
//! unchanged. Timeouts and backend failures inside a workflow step are
//! converted to failed step results by the engine and do not bubble out.

use thiserror::Error;

/// Result type alias for core runtime operations.
pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed input: secret name, step definition, geometry, missing field.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Invalid or expired token, or ownership mismatch.
    #[error("access denied: {0}")]
    Auth(String),

    /// Workspace, session or run id not present.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Duplicate container name that survived forced cleanup, or a
    /// create-only secret name collision.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The container runtime refused the CPU/memory/disk request.
    #[error("resource request refused: {0}")]
    Resource(String),

    /// A step exceeded its configured wall-clock timeout.
    #[error("timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// Transport failure talking to the container runtime or either store.
    #[error("backend error: {0}")]
    Backend(String),

    /// Run or step aborted by operator request.
    #[error("cancelled")]
    Cancelled,
}

impl CoreError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }

    /// True when the error should be reported to the caller as-is rather
    /// than logged and absorbed.
    pub fn is_caller_fault(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::Auth(_) | Self::NotFound { .. } | Self::Conflict(_)
        )
    }
}

impl From<bollard::errors::Error> for CoreError {
    fn from(err: bollard::errors::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_fault_classification() {
        assert!(CoreError::Validation("bad name".into()).is_caller_fault());
        assert!(CoreError::not_found("workspace", "ws-1").is_caller_fault());
        assert!(!CoreError::Backend("socket closed".into()).is_caller_fault());
        assert!(!CoreError::Timeout { seconds: 300 }.is_caller_fault());
    }

    #[test]
    fn not_found_message_names_the_kind() {
        let err = CoreError::not_found("session", "abc123");
        assert_eq!(err.to_string(), "session not found: abc123");
    }
}
