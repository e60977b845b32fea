// Copyright (c) 2026 Termflux
// SPDX-License-Identifier: AGPL-3.0

//! Secret domain model: envelope-encrypted per-workspace secrets.
//!
//! Plaintext is never persisted. The envelope carries everything needed to
//! decrypt under the process master key: algorithm id, per-write salt and
//! nonce, and the ciphertext, all base64.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::CoreError;
use crate::domain::workspace::WorkspaceId;

/// Envelope format identifier. Bump when the KDF or cipher changes.
pub const ENVELOPE_ALG_ID: &str = "pbkdf2-sha256-100000/aes-256-gcm";

/// Opaque ciphertext envelope stored as a single JSON field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretEnvelope {
    pub alg_id: String,
    pub salt_b64: String,
    pub nonce_b64: String,
    pub ct_b64: String,
}

/// Secret row. The plaintext only ever exists in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Secret {
    pub id: Uuid,
    pub workspace_id: WorkspaceId,
    pub name: String,
    pub envelope: SecretEnvelope,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Secret {
    pub fn new(workspace_id: WorkspaceId, name: impl Into<String>, envelope: SecretEnvelope) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            name: name.into(),
            envelope,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Listing entry: metadata only, no plaintext and no envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretInfo {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Secret> for SecretInfo {
    fn from(secret: &Secret) -> Self {
        Self {
            id: secret.id,
            name: secret.name.clone(),
            created_at: secret.created_at,
            updated_at: secret.updated_at,
        }
    }
}

/// Validate a secret name against `^[A-Z_][A-Z0-9_]*$`.
pub fn validate_secret_name(name: &str) -> Result<(), CoreError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_uppercase() || c == '_' => {
            chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(CoreError::Validation(format!(
            "invalid secret name '{name}': must match ^[A-Z_][A-Z0-9_]*$"
        )))
    }
}

/// Parse `KEY=VALUE` env-file text. Blank lines and `#` comments are
/// skipped; one layer of paired surrounding quotes is stripped; malformed
/// names are rejected.
pub fn parse_env_text(text: &str) -> Result<Vec<(String, String)>, CoreError> {
    let mut entries = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((name, value)) = line.split_once('=') else {
            return Err(CoreError::Validation(format!(
                "malformed env line: '{line}'"
            )));
        };
        let name = name.trim();
        validate_secret_name(name)?;
        entries.push((name.to_string(), strip_quotes(value.trim()).to_string()));
    }
    Ok(entries)
}

/// Strip one pair of matching surrounding ASCII quotes.
fn strip_quotes(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && (first == b'"' || first == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Render env-file text. Values containing whitespace or shell-special
/// characters are double-quoted with embedded `"` escaped.
pub fn render_env_text<'a>(entries: impl Iterator<Item = (&'a str, &'a str)>) -> String {
    let mut out = String::new();
    for (name, value) in entries {
        let needs_quoting = value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '$' | '`' | '\\'));
        if needs_quoting {
            out.push_str(name);
            out.push_str("=\"");
            out.push_str(&value.replace('"', "\\\""));
            out.push_str("\"\n");
        } else {
            out.push_str(name);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
    }
    out
}

/// Escape a value for a single-quoted shell string: `'` becomes `'\''`.
pub fn shell_single_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}
