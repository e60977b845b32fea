// Copyright (c) 2026 Termflux
// SPDX-License-Identifier: AGPL-3.0

//! Workspace provisioner.
//!
//! Orchestrates the full first-boot sequence in a fixed order: container
//! provision and filesystem layout, registration, then the optional
//! personalization steps (keys, identity, dotfiles, apps, repos, secrets,
//! env, startup script). If anything after the container exists fails, the
//! container is force-removed but the volume is kept so a retry can pick
//! up where it left off.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::application::secret_service::SecretService;
use crate::domain::cache::{CacheStore, CacheWorkspace};
use crate::domain::container::{ContainerConfig, ContainerDriver, ContainerStatus, ExecOptions};
use crate::domain::errors::CoreError;
use crate::domain::repository::{
    AppInstallRecord, AppInstallRepository, SessionRepository, WorkspaceRepository,
};
use crate::domain::session::SessionStatus;
use crate::domain::workspace::{
    ProvisionRequest, ResourceLimits, Workspace, WorkspaceHealth, WorkspaceId, WorkspaceStatus,
};
use crate::infrastructure::runtime::HOME_DIR;

/// In-container path of the generated per-workspace env file.
pub const ENV_FILE: &str = "/home/dev/.termflux_env";

const BASHRC_ENV_SENTINEL: &str = "# termflux env";

/// Default stop grace period handed to the container runtime.
const STOP_GRACE_SECS: i64 = 10;

pub struct WorkspaceProvisioner {
    driver: Arc<dyn ContainerDriver>,
    cache: Arc<dyn CacheStore>,
    workspaces: Arc<dyn WorkspaceRepository>,
    sessions: Arc<dyn SessionRepository>,
    app_installs: Arc<dyn AppInstallRepository>,
    secrets: Arc<SecretService>,
    default_image: String,
}

impl WorkspaceProvisioner {
    pub fn new(
        driver: Arc<dyn ContainerDriver>,
        cache: Arc<dyn CacheStore>,
        workspaces: Arc<dyn WorkspaceRepository>,
        sessions: Arc<dyn SessionRepository>,
        app_installs: Arc<dyn AppInstallRepository>,
        secrets: Arc<SecretService>,
        default_image: String,
    ) -> Self {
        Self {
            driver,
            cache,
            workspaces,
            sessions,
            app_installs,
            secrets,
            default_image,
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Create a workspace and run the full first-boot sequence.
    pub async fn create_workspace(
        &self,
        name: &str,
        user_id: &str,
        resources: ResourceLimits,
        request: ProvisionRequest,
    ) -> Result<Workspace, CoreError> {
        let mut workspace = Workspace::new(name, user_id);
        workspace.resources = resources;
        workspace.env = request.env.clone();
        self.workspaces.save(&workspace).await?;

        // Step 1: container + filesystem layout.
        let provisioned = async {
            let handle = self
                .driver
                .provision(&ContainerConfig {
                    workspace_id: workspace.id,
                    user_id: user_id.to_string(),
                    image: self.default_image.clone(),
                    resources,
                    env: request.env.clone(),
                })
                .await?;
            self.driver.init_filesystem(workspace.id).await?;
            Ok::<_, CoreError>(handle)
        }
        .await;

        let handle = match provisioned {
            Ok(handle) => handle,
            Err(e) => {
                workspace.mark_error();
                self.workspaces.save(&workspace).await?;
                return Err(e);
            }
        };

        // Step 2: register as running in cache and relational store.
        workspace.mark_running(handle);
        self.workspaces.save(&workspace).await?;
        self.cache
            .set_workspace(&CacheWorkspace {
                id: workspace.id,
                user_id: workspace.user_id.clone(),
                status: workspace.status,
                container_handle: workspace.container_handle.clone(),
            })
            .await?;

        // Steps 3-11 are optional; a failure rolls the container back but
        // keeps the volume for an idempotent retry.
        if let Err(e) = self.first_boot(&workspace, &request).await {
            warn!(workspace_id = %workspace.id, error = %e, "First boot failed, rolling back container");
            if let Err(remove_err) = self.driver.remove(workspace.id, false).await {
                warn!(workspace_id = %workspace.id, error = %remove_err, "Rollback removal failed");
            }
            workspace.mark_error();
            self.workspaces.save(&workspace).await?;
            self.cache.remove_workspace(workspace.id).await?;
            return Err(e);
        }

        info!(workspace_id = %workspace.id, name, "Workspace provisioned");
        Ok(workspace)
    }

    async fn first_boot(
        &self,
        workspace: &Workspace,
        request: &ProvisionRequest,
    ) -> Result<(), CoreError> {
        // Step 3: SSH key.
        if let Some(ssh) = &request.ssh_key {
            self.install_ssh_key(workspace.id, &ssh.private_key, ssh.public_key.as_deref())
                .await?;
        }

        // Step 4: GPG key and signing.
        if let Some(gpg_key) = &request.gpg_key {
            self.import_gpg_key(workspace.id, gpg_key).await?;
        }

        // Step 5: VCS identity.
        if request.git_user_name.is_some() || request.git_user_email.is_some() {
            self.configure_git_identity(
                workspace.id,
                request.git_user_name.as_deref(),
                request.git_user_email.as_deref(),
            )
            .await?;
        }

        // Step 6: dotfiles.
        if let Some(dotfiles) = &request.dotfiles {
            self.setup_dotfiles(workspace.id, dotfiles).await?;
        }

        // Step 7: app installs.
        for app in &request.apps {
            let success = self.install_app(workspace.id, &app.install_script, &app.config).await;
            self.app_installs
                .record(&AppInstallRecord {
                    workspace_id: workspace.id,
                    app_id: app.app_id.clone(),
                    installed_at: Utc::now(),
                    success: success.is_ok(),
                })
                .await?;
            success?;
        }

        // Step 8: repo clones.
        for repo in &request.repos {
            self.clone_repo(workspace.id, &repo.url, &repo.path, repo.branch.as_deref())
                .await?;
        }

        // Step 9: secrets.
        self.secrets.inject(workspace.id).await?;

        // Step 10: per-workspace env file.
        if !request.env.is_empty() {
            self.write_env_file(workspace.id, &request.env).await?;
        }

        // Step 11: startup script.
        if let Some(script) = &request.startup_script {
            self.exec_checked(workspace.id, script, &[], "startup script")
                .await?;
        }

        Ok(())
    }

    /// Stop the container and mark every session terminated.
    pub async fn stop_workspace(&self, workspace_id: WorkspaceId) -> Result<(), CoreError> {
        let mut workspace = self.load(workspace_id).await?;

        self.driver.stop(workspace_id, STOP_GRACE_SECS).await?;
        self.terminate_sessions(workspace_id).await?;

        workspace.mark_stopped();
        self.workspaces.save(&workspace).await?;
        self.cache
            .set_workspace(&CacheWorkspace {
                id: workspace.id,
                user_id: workspace.user_id.clone(),
                status: workspace.status,
                container_handle: None,
            })
            .await?;

        info!(workspace_id = %workspace_id, "Workspace stopped");
        Ok(())
    }

    /// Restart a stopped workspace. The volume survives, so this is the
    /// provision path again without personalization.
    pub async fn start_workspace(&self, workspace_id: WorkspaceId) -> Result<(), CoreError> {
        let mut workspace = self.load(workspace_id).await?;
        if workspace.is_running() {
            return Ok(());
        }

        let handle = self
            .driver
            .provision(&ContainerConfig {
                workspace_id: workspace.id,
                user_id: workspace.user_id.clone(),
                image: self.default_image.clone(),
                resources: workspace.resources,
                env: workspace.env.clone(),
            })
            .await?;
        self.driver.init_filesystem(workspace.id).await?;

        workspace.mark_running(handle);
        self.workspaces.save(&workspace).await?;
        self.cache
            .set_workspace(&CacheWorkspace {
                id: workspace.id,
                user_id: workspace.user_id.clone(),
                status: workspace.status,
                container_handle: workspace.container_handle.clone(),
            })
            .await?;

        info!(workspace_id = %workspace_id, "Workspace restarted");
        Ok(())
    }

    /// Remove the container (optionally its volume), all cache state and
    /// the relational row.
    pub async fn destroy_workspace(
        &self,
        workspace_id: WorkspaceId,
        remove_volume: bool,
    ) -> Result<(), CoreError> {
        let workspace = self.load(workspace_id).await?;

        self.terminate_sessions(workspace_id).await?;
        self.driver.remove(workspace_id, remove_volume).await?;
        self.cache.remove_workspace(workspace_id).await?;
        self.workspaces.delete(workspace_id).await?;

        info!(
            workspace_id = %workspace_id,
            user_id = %workspace.user_id,
            remove_volume,
            "Workspace destroyed"
        );
        Ok(())
    }

    pub async fn list_workspaces(&self, user_id: &str) -> Result<Vec<Workspace>, CoreError> {
        Ok(self.workspaces.list_by_user(user_id).await?)
    }

    // ========================================================================
    // Health
    // ========================================================================

    /// Aggregate container status, live stats, disk usage, session count
    /// and uptime.
    pub async fn health(&self, workspace_id: WorkspaceId) -> Result<WorkspaceHealth, CoreError> {
        let workspace = self.load(workspace_id).await?;
        let status = self.driver.status(workspace_id).await?;

        let (stats, uptime, disk) = if status == ContainerStatus::Running {
            let stats = self.driver.stats(workspace_id).await.unwrap_or_default();
            let uptime = self.driver.uptime_seconds(workspace_id).await.unwrap_or(0);
            let disk = self.disk_usage(workspace_id).await.unwrap_or((0, 0));
            (stats, uptime, disk)
        } else {
            (Default::default(), 0, (0, 0))
        };

        let sessions = self.cache.workspace_sessions(workspace_id).await?;

        Ok(WorkspaceHealth {
            workspace_id,
            status: match status {
                ContainerStatus::Running => WorkspaceStatus::Running,
                ContainerStatus::Stopped => WorkspaceStatus::Stopped,
                ContainerStatus::NotFound => workspace.status,
            },
            cpu_percent: stats.cpu_percent,
            memory_used_bytes: stats.memory_used_bytes,
            memory_limit_bytes: stats.memory_limit_bytes,
            disk_used_bytes: disk.0,
            disk_total_bytes: disk.1,
            active_sessions: sessions.len(),
            uptime_seconds: uptime,
        })
    }

    async fn disk_usage(&self, workspace_id: WorkspaceId) -> Result<(u64, u64), CoreError> {
        let result = self
            .driver
            .exec(
                workspace_id,
                &[
                    "df".to_string(),
                    "-B1".to_string(),
                    HOME_DIR.to_string(),
                ],
                ExecOptions::default(),
            )
            .await?;
        Ok(parse_df_output(&result.output_string()).unwrap_or((0, 0)))
    }

    // ========================================================================
    // First-boot helpers
    // ========================================================================

    async fn install_ssh_key(
        &self,
        workspace_id: WorkspaceId,
        private_key: &str,
        public_key: Option<&str>,
    ) -> Result<(), CoreError> {
        let mut script = format!(
            concat!(
                "umask 077\n",
                "mkdir -p {home}/.ssh\n",
                "cat > {home}/.ssh/id_ed25519 <<'TERMFLUX_EOF'\n",
                "{key}\n",
                "TERMFLUX_EOF\n",
                "chmod 600 {home}/.ssh/id_ed25519\n",
            ),
            home = HOME_DIR,
            key = private_key.trim_end(),
        );
        if let Some(public_key) = public_key {
            script.push_str(&format!(
                concat!(
                    "cat > {home}/.ssh/id_ed25519.pub <<'TERMFLUX_EOF'\n",
                    "{key}\n",
                    "TERMFLUX_EOF\n",
                    "chmod 644 {home}/.ssh/id_ed25519.pub\n",
                ),
                home = HOME_DIR,
                key = public_key.trim_end(),
            ));
        }
        // Canned client config for the common forges.
        script.push_str(&format!(
            concat!(
                "if [ ! -f {home}/.ssh/config ]; then\n",
                "cat > {home}/.ssh/config <<'TERMFLUX_EOF'\n",
                "Host github.com gitlab.com bitbucket.org\n",
                "  IdentityFile ~/.ssh/id_ed25519\n",
                "  StrictHostKeyChecking accept-new\n",
                "TERMFLUX_EOF\n",
                "chmod 600 {home}/.ssh/config\n",
                "fi\n",
            ),
            home = HOME_DIR,
        ));

        self.exec_checked(workspace_id, &script, &[], "ssh key install")
            .await
    }

    async fn import_gpg_key(
        &self,
        workspace_id: WorkspaceId,
        gpg_key: &str,
    ) -> Result<(), CoreError> {
        let script = format!(
            concat!(
                "cat <<'TERMFLUX_EOF' | gpg --batch --import\n",
                "{key}\n",
                "TERMFLUX_EOF\n",
                "git config --global commit.gpgsign true\n",
            ),
            key = gpg_key.trim_end(),
        );
        self.exec_checked(workspace_id, &script, &[], "gpg key import")
            .await
    }

    async fn configure_git_identity(
        &self,
        workspace_id: WorkspaceId,
        name: Option<&str>,
        email: Option<&str>,
    ) -> Result<(), CoreError> {
        let mut script = String::new();
        if let Some(name) = name {
            script.push_str(&format!(
                "git config --global user.name {}\n",
                crate::domain::secret::shell_single_quote(name)
            ));
        }
        if let Some(email) = email {
            script.push_str(&format!(
                "git config --global user.email {}\n",
                crate::domain::secret::shell_single_quote(email)
            ));
        }
        self.exec_checked(workspace_id, &script, &[], "git identity")
            .await
    }

    async fn setup_dotfiles(
        &self,
        workspace_id: WorkspaceId,
        dotfiles: &crate::domain::workspace::DotfilesConfig,
    ) -> Result<(), CoreError> {
        if let Some(repo_url) = &dotfiles.repo_url {
            let clone = format!(
                "[ -d {home}/.dotfiles ] || git clone --depth 1 {url} {home}/.dotfiles",
                home = HOME_DIR,
                url = crate::domain::secret::shell_single_quote(repo_url),
            );
            self.exec_checked(workspace_id, &clone, &[], "dotfiles clone")
                .await?;

            match &dotfiles.install_script {
                Some(install) => {
                    let run = format!("cd {HOME_DIR}/.dotfiles && {install}");
                    self.exec_checked(workspace_id, &run, &[], "dotfiles install")
                        .await?;
                }
                None => {
                    // Default: symlink the well-known files that exist in
                    // the repo.
                    let link = format!(
                        concat!(
                            "for f in .bashrc .zshrc .vimrc .tmux.conf .gitconfig; do\n",
                            "  [ -f {home}/.dotfiles/$f ] && ln -sf {home}/.dotfiles/$f {home}/$f\n",
                            "done\ntrue\n",
                        ),
                        home = HOME_DIR,
                    );
                    self.exec_checked(workspace_id, &link, &[], "dotfiles symlink")
                        .await?;
                }
            }
        }

        for (path, content) in &dotfiles.files {
            if path.contains("..") || path.starts_with('/') {
                return Err(CoreError::Validation(format!(
                    "dotfile path '{path}' must be relative to the home directory"
                )));
            }
            let script = format!(
                concat!(
                    "mkdir -p \"$(dirname {home}/{path})\"\n",
                    "cat > {home}/{path} <<'TERMFLUX_EOF'\n",
                    "{content}\n",
                    "TERMFLUX_EOF\n",
                ),
                home = HOME_DIR,
                path = path,
                content = content.trim_end(),
            );
            self.exec_checked(workspace_id, &script, &[], "dotfile write")
                .await?;
        }

        Ok(())
    }

    async fn install_app(
        &self,
        workspace_id: WorkspaceId,
        install_script: &str,
        config: &HashMap<String, String>,
    ) -> Result<(), CoreError> {
        let env: Vec<String> = config.iter().map(|(k, v)| format!("{k}={v}")).collect();
        self.exec_checked(workspace_id, install_script, &env, "app install")
            .await
    }

    async fn clone_repo(
        &self,
        workspace_id: WorkspaceId,
        url: &str,
        path: &str,
        branch: Option<&str>,
    ) -> Result<(), CoreError> {
        let branch_arg = branch
            .map(|b| format!("-b {} ", crate::domain::secret::shell_single_quote(b)))
            .unwrap_or_default();
        let script = format!(
            "git clone {branch_arg}{url} {path}",
            url = crate::domain::secret::shell_single_quote(url),
            path = crate::domain::secret::shell_single_quote(path),
        );
        self.exec_checked(workspace_id, &script, &[], "repo clone")
            .await
    }

    async fn write_env_file(
        &self,
        workspace_id: WorkspaceId,
        env: &HashMap<String, String>,
    ) -> Result<(), CoreError> {
        let mut file = String::from("# Generated by termflux - do not edit\n");
        for (key, value) in env {
            file.push_str("export ");
            file.push_str(key);
            file.push('=');
            file.push_str(&crate::domain::secret::shell_single_quote(value));
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
            path = ENV_FILE,
            content = file,
            sentinel = BASHRC_ENV_SENTINEL,
            home = HOME_DIR,
        );
        self.exec_checked(workspace_id, &script, &[], "env file write")
            .await
    }

    async fn exec_checked(
        &self,
        workspace_id: WorkspaceId,
        script: &str,
        env: &[String],
        what: &str,
    ) -> Result<(), CoreError> {
        debug!(workspace_id = %workspace_id, what, "Running first-boot step");
        let result = self
            .driver
            .exec(
                workspace_id,
                &["sh".to_string(), "-c".to_string(), script.to_string()],
                ExecOptions {
                    env: env.to_vec(),
                    working_dir: None,
                    user: None,
                },
            )
            .await?;
        if !result.success() {
            return Err(CoreError::Backend(format!(
                "{what} failed (exit {}): {}",
                result.exit_code,
                result.output_string()
            )));
        }
        Ok(())
    }

    async fn terminate_sessions(&self, workspace_id: WorkspaceId) -> Result<(), CoreError> {
        for mut session in self.sessions.list_by_workspace(workspace_id).await? {
            if session.status == SessionStatus::Terminated {
                continue;
            }
            let _ = session.transition(SessionStatus::Terminated);
            self.sessions.save(&session).await?;
            self.cache.remove_session(&session.id).await?;
        }
        Ok(())
    }

    async fn load(&self, workspace_id: WorkspaceId) -> Result<Workspace, CoreError> {
        self.workspaces
            .find_by_id(workspace_id)
            .await?
            .ok_or_else(|| CoreError::not_found("workspace", workspace_id.to_string()))
    }
}

/// Parse `df -B1 <path>` output into `(used, total)` bytes.
fn parse_df_output(output: &str) -> Option<(u64, u64)> {
    let line = output.lines().nth(1)?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    let total = fields.get(1)?.parse().ok()?;
    let used = fields.get(2)?.parse().ok()?;
    Some((used, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn df_output_parses_used_and_total() {
        let output = "Filesystem        1B-blocks       Used  Available Use% Mounted on\n\
                      /dev/vda1       10726932480 5863353344 4847042560  55% /home/dev\n";
        assert_eq!(
            parse_df_output(output),
            Some((5_863_353_344, 10_726_932_480))
        );
    }

    #[test]
    fn malformed_df_output_is_none() {
        assert_eq!(parse_df_output(""), None);
        assert_eq!(parse_df_output("Filesystem only header\n"), None);
    }
}
