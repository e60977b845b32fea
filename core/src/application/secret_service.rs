// Copyright (c) 2026 Termflux
// SPDX-License-Identifier: AGPL-3.0

//! Secret store application service.
//!
//! Secrets are envelope-encrypted per workspace and injected into the
//! container as a sourced shell file, so every interactive shell picks
//! them up. Plaintext exists only in memory on this side of the exec
//! boundary.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::container::{ContainerDriver, ExecOptions};
use crate::domain::errors::CoreError;
use crate::domain::repository::SecretRepository;
use crate::domain::secret::{
    parse_env_text, render_env_text, shell_single_quote, validate_secret_name, Secret, SecretInfo,
};
use crate::domain::workspace::WorkspaceId;
use crate::infrastructure::crypto::EnvelopeCipher;
use crate::infrastructure::runtime::HOME_DIR;

/// In-container path of the generated secrets file.
pub const SECRETS_FILE: &str = "/home/dev/.termflux_secrets";

const BASHRC_SENTINEL: &str = "# termflux secrets";

pub struct SecretService {
    repository: Arc<dyn SecretRepository>,
    cipher: EnvelopeCipher,
    driver: Arc<dyn ContainerDriver>,
}

impl SecretService {
    pub fn new(
        repository: Arc<dyn SecretRepository>,
        cipher: EnvelopeCipher,
        driver: Arc<dyn ContainerDriver>,
    ) -> Self {
        Self {
            repository,
            cipher,
            driver,
        }
    }

    /// Upsert a secret by `(workspace, name)`.
    pub async fn set(
        &self,
        workspace_id: WorkspaceId,
        name: &str,
        value: &str,
    ) -> Result<(), CoreError> {
        validate_secret_name(name)?;
        let envelope = self.cipher.seal(value.as_bytes())?;

        // Preserve the original row identity and creation time on update.
        let secret = match self.repository.find_by_name(workspace_id, name).await? {
            Some(mut existing) => {
                existing.envelope = envelope;
                existing.updated_at = chrono::Utc::now();
                existing
            }
            None => Secret::new(workspace_id, name, envelope),
        };

        self.repository.save(&secret).await?;
        debug!(workspace_id = %workspace_id, name, "Stored secret");
        Ok(())
    }

    /// Create-only variant: an existing name is a conflict.
    pub async fn create(
        &self,
        workspace_id: WorkspaceId,
        name: &str,
        value: &str,
    ) -> Result<(), CoreError> {
        validate_secret_name(name)?;
        if self
            .repository
            .find_by_name(workspace_id, name)
            .await?
            .is_some()
        {
            return Err(CoreError::Conflict(format!(
                "secret '{name}' already exists"
            )));
        }
        self.set(workspace_id, name, value).await
    }

    pub async fn get(
        &self,
        workspace_id: WorkspaceId,
        name: &str,
    ) -> Result<Option<String>, CoreError> {
        let Some(secret) = self.repository.find_by_name(workspace_id, name).await? else {
            return Ok(None);
        };
        let plaintext = self.cipher.open(&secret.envelope)?;
        String::from_utf8(plaintext)
            .map(Some)
            .map_err(|_| CoreError::Backend(format!("secret '{name}' is not valid UTF-8")))
    }

    /// Metadata listing; plaintext is never included.
    pub async fn list(&self, workspace_id: WorkspaceId) -> Result<Vec<SecretInfo>, CoreError> {
        let secrets = self.repository.list_by_workspace(workspace_id).await?;
        Ok(secrets.iter().map(SecretInfo::from).collect())
    }

    pub async fn delete(&self, workspace_id: WorkspaceId, name: &str) -> Result<bool, CoreError> {
        Ok(self.repository.delete(workspace_id, name).await?)
    }

    /// Parse `KEY=VALUE` text and store each entry. Returns the names
    /// written, in input order.
    pub async fn import_env(
        &self,
        workspace_id: WorkspaceId,
        text: &str,
    ) -> Result<Vec<String>, CoreError> {
        let entries = parse_env_text(text)?;
        let mut names = Vec::with_capacity(entries.len());
        for (name, value) in entries {
            self.set(workspace_id, &name, &value).await?;
            names.push(name);
        }
        info!(workspace_id = %workspace_id, count = names.len(), "Imported env secrets");
        Ok(names)
    }

    /// Render all secrets as env-file text with shell-safe quoting.
    pub async fn export_env(&self, workspace_id: WorkspaceId) -> Result<String, CoreError> {
        let pairs = self.decrypt_all(workspace_id).await?;
        Ok(render_env_text(
            pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        ))
    }

    /// Write the secrets file inside the container (mode 0600) and make
    /// `.bashrc` source it, guarded by a sentinel so the append happens
    /// exactly once.
    pub async fn inject(&self, workspace_id: WorkspaceId) -> Result<(), CoreError> {
        let pairs = self.decrypt_all(workspace_id).await?;

        let mut file = String::from("# Generated by termflux - do not edit\n");
        for (name, value) in &pairs {
            file.push_str("export ");
            file.push_str(name);
            file.push('=');
            file.push_str(&shell_single_quote(value));
            file.push('\n');
        }

        let script = format!(
            concat!(
                "umask 077\n",
                "cat > {path} <<'TERMFLUX_EOF'\n",
                "{content}TERMFLUX_EOF\n",
                "chmod 600 {path}\n",
                "grep -qF '{sentinel}' {home}/.bashrc 2>/dev/null || ",
                "printf '\\n{sentinel}\\n[ -f {path} ] && source {path}\\n' >> {home}/.bashrc\n",
            ),
            path = SECRETS_FILE,
            content = file,
            sentinel = BASHRC_SENTINEL,
            home = HOME_DIR,
        );

        let result = self
            .driver
            .exec(
                workspace_id,
                &["sh".to_string(), "-c".to_string(), script],
                ExecOptions::default(),
            )
            .await?;

        if !result.success() {
            return Err(CoreError::Backend(format!(
                "secret injection failed (exit {}): {}",
                result.exit_code,
                result.output_string()
            )));
        }

        info!(workspace_id = %workspace_id, count = pairs.len(), "Injected secrets into container");
        Ok(())
    }

    /// Re-encrypt every secret with a fresh salt and nonce. A secret whose
    /// envelope no longer decrypts is left untouched and does not block the
    /// rest of the batch. Returns the number rotated.
    pub async fn rotate(&self, workspace_id: WorkspaceId) -> Result<usize, CoreError> {
        let secrets = self.repository.list_by_workspace(workspace_id).await?;
        let mut rotated = 0;
        for mut secret in secrets {
            let plaintext = match self.cipher.open(&secret.envelope) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    warn!(
                        workspace_id = %workspace_id,
                        name = %secret.name,
                        error = %e,
                        "Skipping rotation of secret that failed to decrypt"
                    );
                    continue;
                }
            };
            secret.envelope = self.cipher.seal(&plaintext)?;
            secret.updated_at = chrono::Utc::now();
            self.repository.save(&secret).await?;
            rotated += 1;
        }
        info!(workspace_id = %workspace_id, rotated, "Rotated secret envelopes");
        Ok(rotated)
    }

    /// Replace literal occurrences of secret values (length >= 4) with a
    /// fixed mask.
    pub async fn mask_in_text(
        &self,
        workspace_id: WorkspaceId,
        text: &str,
    ) -> Result<String, CoreError> {
        let pairs = self.decrypt_all(workspace_id).await?;
        let mut masked = text.to_string();
        for (_, value) in &pairs {
            if value.len() >= 4 {
                masked = masked.replace(value.as_str(), "********");
            }
        }
        Ok(masked)
    }

    /// Decrypt every secret of a workspace. A decryption failure is fatal
    /// for that secret only: it is skipped with a warning and never
    /// surfaces as corrupted plaintext, while its siblings still resolve.
    async fn decrypt_all(
        &self,
        workspace_id: WorkspaceId,
    ) -> Result<Vec<(String, String)>, CoreError> {
        let secrets = self.repository.list_by_workspace(workspace_id).await?;
        let mut pairs = Vec::with_capacity(secrets.len());
        for secret in &secrets {
            let plaintext = match self.cipher.open(&secret.envelope) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    warn!(
                        workspace_id = %workspace_id,
                        name = %secret.name,
                        error = %e,
                        "Skipping secret that failed to decrypt"
                    );
                    continue;
                }
            };
            match String::from_utf8(plaintext) {
                Ok(value) => pairs.push((secret.name.clone(), value)),
                Err(_) => {
                    warn!(
                        workspace_id = %workspace_id,
                        name = %secret.name,
                        "Skipping secret with non-UTF-8 plaintext"
                    );
                }
            }
        }
        Ok(pairs)
    }
}
