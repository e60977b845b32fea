// Copyright (c) 2026 Termflux
// SPDX-License-Identifier: AGPL-3.0

//! Docker-backed container driver.
//!
//! Thin typed facade over the Docker Engine API with hardened defaults:
//! unprivileged uid, dropped capabilities, resource caps, pid limits, log
//! rotation. Exec output framing is stripped on the non-TTY path; the
//! terminal attach path is TTY and passes bytes through unmodified.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{HostConfig, HostConfigLogConfig, RestartPolicy, RestartPolicyNameEnum};
use bollard::volume::CreateVolumeOptions;
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::domain::container::{
    AttachedStream, ContainerConfig, ContainerDriver, ContainerStats, ContainerStatus, ExecOptions,
    ExecOutput, ManagedContainer,
};
use crate::domain::errors::CoreError;
use crate::domain::workspace::{ContainerHandle, WorkspaceId};

/// Label identifying containers owned by this system.
pub const MANAGED_LABEL: &str = "termflux.managed";

/// In-container home directory backed by the workspace volume.
pub const HOME_DIR: &str = "/home/dev";

/// uid:gid everything runs as inside the container.
const CONTAINER_USER: &str = "1000:1000";

const PID_LIMIT: i64 = 256;

/// Capabilities granted back after dropping ALL.
const ALLOWED_CAPS: &[&str] = &[
    "CHOWN",
    "DAC_OVERRIDE",
    "FOWNER",
    "FSETID",
    "KILL",
    "SETGID",
    "SETUID",
    "SETPCAP",
    "NET_BIND_SERVICE",
    "SYS_CHROOT",
    "MKNOD",
    "AUDIT_WRITE",
    "SETFCAP",
];

pub struct DockerDriver {
    docker: Docker,
}

impl DockerDriver {
    /// Connect to the Docker daemon at a custom socket or the local default.
    pub fn new(socket_path: Option<&str>) -> Result<Self, CoreError> {
        let docker = match socket_path {
            Some(path) => Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| {
                    CoreError::Backend(format!("failed to connect to Docker at {path}: {e}"))
                })?,
            None => Docker::connect_with_local_defaults()
                .map_err(|e| CoreError::Backend(format!("failed to connect to Docker: {e}")))?,
        };
        Ok(Self { docker })
    }

    /// Verify the daemon is reachable.
    pub async fn healthcheck(&self) -> Result<(), CoreError> {
        self.docker
            .ping()
            .await
            .map_err(|e| CoreError::Backend(format!("Docker daemon unreachable: {e}")))?;
        Ok(())
    }

    fn container_name(workspace_id: WorkspaceId) -> String {
        format!("termflux-{workspace_id}")
    }

    fn volume_name(workspace_id: WorkspaceId) -> String {
        format!("termflux-{workspace_id}-home")
    }

    /// Force-remove a container by name, treating 404 as success.
    async fn force_remove(&self, name: &str, remove_volume: bool) -> Result<(), CoreError> {
        let options = RemoveContainerOptions {
            force: true,
            v: remove_volume,
            ..Default::default()
        };
        match self.docker.remove_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Map a create/start failure onto the error taxonomy: 409 means the name
/// collision survived forced cleanup, 400 means the daemon refused the
/// resource request.
fn map_provision_error(err: bollard::errors::Error, name: &str) -> CoreError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message,
        } => CoreError::Conflict(format!("container '{name}' already exists: {message}")),
        bollard::errors::Error::DockerResponseServerError {
            status_code: 400,
            message,
        } => CoreError::Resource(message),
        other => CoreError::Backend(other.to_string()),
    }
}

/// Strip the 8-byte exec demux header `[stream, 0, 0, 0, len32be]` from a
/// chunk when present. TTY streams never carry it.
pub fn strip_stream_frame(chunk: &[u8]) -> &[u8] {
    if chunk.len() >= 9 && (chunk[0] == 0x01 || chunk[0] == 0x02) {
        &chunk[8..]
    } else {
        chunk
    }
}

#[async_trait]
impl ContainerDriver for DockerDriver {
    async fn provision(&self, config: &ContainerConfig) -> Result<ContainerHandle, CoreError> {
        let name = Self::container_name(config.workspace_id);
        let volume = Self::volume_name(config.workspace_id);

        // The named volume persists across re-provisions; creating it again
        // is a no-op.
        self.docker
            .create_volume(CreateVolumeOptions {
                name: volume.clone(),
                labels: HashMap::from([(MANAGED_LABEL.to_string(), "true".to_string())]),
                ..Default::default()
            })
            .await?;

        self.force_remove(&name, false).await?;

        let mut env: Vec<String> = vec![
            format!("WORKSPACE_ID={}", config.workspace_id),
            format!("USER_ID={}", config.user_id),
            "TERM=xterm-256color".to_string(),
            format!("HOME={HOME_DIR}"),
        ];
        for (key, value) in &config.env {
            env.push(format!("{key}={value}"));
        }

        let host_config = HostConfig {
            binds: Some(vec![format!("{volume}:{HOME_DIR}")]),
            nano_cpus: Some(config.resources.nano_cpus()),
            memory: Some(config.resources.memory_bytes()),
            memory_swap: Some(config.resources.memory_swap_bytes()),
            pids_limit: Some(PID_LIMIT),
            cap_drop: Some(vec!["ALL".to_string()]),
            cap_add: Some(ALLOWED_CAPS.iter().map(|c| c.to_string()).collect()),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: Some(3),
            }),
            log_config: Some(HostConfigLogConfig {
                typ: Some("json-file".to_string()),
                config: Some(HashMap::from([
                    ("max-size".to_string(), "10m".to_string()),
                    ("max-file".to_string(), "3".to_string()),
                ])),
            }),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(config.image.clone()),
            user: Some(CONTAINER_USER.to_string()),
            working_dir: Some(HOME_DIR.to_string()),
            env: Some(env),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            labels: Some(HashMap::from([
                (MANAGED_LABEL.to_string(), "true".to_string()),
                (
                    "termflux.workspace".to_string(),
                    config.workspace_id.to_string(),
                ),
            ])),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(|e| map_provision_error(e, &name))?;

        self.docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_provision_error(e, &name))?;

        info!(
            workspace_id = %config.workspace_id,
            container = %name,
            cpu_cores = config.resources.cpu_cores,
            memory_mib = config.resources.memory_mib,
            "Provisioned workspace container"
        );

        Ok(ContainerHandle::new(created.id))
    }

    async fn exec(
        &self,
        workspace_id: WorkspaceId,
        argv: &[String],
        options: ExecOptions,
    ) -> Result<ExecOutput, CoreError> {
        let name = Self::container_name(workspace_id);

        let exec = self
            .docker
            .create_exec(
                &name,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(argv.to_vec()),
                    env: (!options.env.is_empty()).then(|| options.env.clone()),
                    user: Some(options.user.unwrap_or_else(|| CONTAINER_USER.to_string())),
                    working_dir: Some(
                        options
                            .working_dir
                            .unwrap_or_else(|| HOME_DIR.to_string()),
                    ),
                    ..Default::default()
                },
            )
            .await?;

        let started = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    ..Default::default()
                }),
            )
            .await?;

        let mut output = Vec::new();
        if let StartExecResults::Attached {
            output: mut stream, ..
        } = started
        {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    // LogOutput demultiplexes the stream framing for us;
                    // stdout and stderr are combined in arrival order.
                    Ok(LogOutput::StdOut { message })
                    | Ok(LogOutput::StdErr { message })
                    | Ok(LogOutput::Console { message }) => output.extend_from_slice(&message),
                    Ok(_) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        let exit_code = inspect.exit_code.unwrap_or(0);

        debug!(
            workspace_id = %workspace_id,
            exit_code,
            output_bytes = output.len(),
            "Exec completed"
        );

        Ok(ExecOutput { output, exit_code })
    }

    async fn attach_stream(
        &self,
        workspace_id: WorkspaceId,
        argv: &[String],
    ) -> Result<AttachedStream, CoreError> {
        let name = Self::container_name(workspace_id);

        let exec = self
            .docker
            .create_exec(
                &name,
                CreateExecOptions {
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    cmd: Some(argv.to_vec()),
                    user: Some(CONTAINER_USER.to_string()),
                    working_dir: Some(HOME_DIR.to_string()),
                    env: Some(vec!["TERM=xterm-256color".to_string()]),
                    ..Default::default()
                },
            )
            .await?;

        let started = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    ..Default::default()
                }),
            )
            .await?;

        match started {
            StartExecResults::Attached { output, input } => Ok(AttachedStream {
                input,
                output: Box::pin(output.map(|item| {
                    item.map(LogOutput::into_bytes)
                        .map_err(CoreError::from)
                })),
            }),
            StartExecResults::Detached => Err(CoreError::Backend(
                "exec unexpectedly started detached".to_string(),
            )),
        }
    }

    async fn status(&self, workspace_id: WorkspaceId) -> Result<ContainerStatus, CoreError> {
        let name = Self::container_name(workspace_id);
        match self
            .docker
            .inspect_container(&name, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => {
                let running = inspect
                    .state
                    .as_ref()
                    .and_then(|s| s.running)
                    .unwrap_or(false);
                Ok(if running {
                    ContainerStatus::Running
                } else {
                    ContainerStatus::Stopped
                })
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(ContainerStatus::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    async fn stats(&self, workspace_id: WorkspaceId) -> Result<ContainerStats, CoreError> {
        let name = Self::container_name(workspace_id);
        let mut stream = self.docker.stats(
            &name,
            Some(StatsOptions {
                stream: false,
                one_shot: false,
            }),
        );

        let Some(stats) = stream.next().await else {
            return Ok(ContainerStats::default());
        };
        let stats = stats?;

        let cpu_delta = stats
            .cpu_stats
            .cpu_usage
            .total_usage
            .saturating_sub(stats.precpu_stats.cpu_usage.total_usage);
        let system_delta = stats
            .cpu_stats
            .system_cpu_usage
            .unwrap_or(0)
            .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0));
        let online_cpus = stats.cpu_stats.online_cpus.unwrap_or(1).max(1);
        let cpu_percent = if system_delta > 0 {
            (cpu_delta as f64 / system_delta as f64) * online_cpus as f64 * 100.0
        } else {
            0.0
        };

        let (net_rx, net_tx) = stats
            .networks
            .as_ref()
            .map(|nets| {
                nets.values().fold((0u64, 0u64), |(rx, tx), net| {
                    (rx + net.rx_bytes, tx + net.tx_bytes)
                })
            })
            .unwrap_or((0, 0));

        Ok(ContainerStats {
            cpu_percent,
            memory_used_bytes: stats.memory_stats.usage.unwrap_or(0),
            memory_limit_bytes: stats.memory_stats.limit.unwrap_or(0),
            net_rx_bytes: net_rx,
            net_tx_bytes: net_tx,
        })
    }

    async fn uptime_seconds(&self, workspace_id: WorkspaceId) -> Result<u64, CoreError> {
        let name = Self::container_name(workspace_id);
        let inspect = self
            .docker
            .inspect_container(&name, None::<InspectContainerOptions>)
            .await?;
        let started_at = inspect
            .state
            .and_then(|s| s.started_at)
            .and_then(|ts| DateTime::parse_from_rfc3339(&ts).ok());
        Ok(started_at
            .map(|ts| (Utc::now() - ts.with_timezone(&Utc)).num_seconds().max(0) as u64)
            .unwrap_or(0))
    }

    async fn stop(&self, workspace_id: WorkspaceId, grace_secs: i64) -> Result<(), CoreError> {
        let name = Self::container_name(workspace_id);
        match self
            .docker
            .stop_container(&name, Some(StopContainerOptions { t: grace_secs }))
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404 | 304,
                ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, workspace_id: WorkspaceId, remove_volume: bool) -> Result<(), CoreError> {
        let name = Self::container_name(workspace_id);
        self.force_remove(&name, false).await?;
        if remove_volume {
            let volume = Self::volume_name(workspace_id);
            match self.docker.remove_volume(&volume, None).await {
                Ok(())
                | Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, CoreError> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{MANAGED_LABEL}=true")],
        )]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let name = c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| id.clone());
                Some(ManagedContainer {
                    handle: ContainerHandle::new(id),
                    name,
                    state: c.state.unwrap_or_default(),
                    finished_at: None,
                })
            })
            .collect())
    }

    async fn cleanup(&self, older_than_secs: i64) -> Result<usize, CoreError> {
        let cutoff = Utc::now() - chrono::Duration::seconds(older_than_secs);
        let mut removed = 0;

        for container in self.list_managed().await? {
            if container.state != "exited" {
                continue;
            }
            let inspect = match self
                .docker
                .inspect_container(container.handle.as_str(), None::<InspectContainerOptions>)
                .await
            {
                Ok(i) => i,
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => continue,
                Err(e) => return Err(e.into()),
            };
            let finished_at = inspect
                .state
                .and_then(|s| s.finished_at)
                .and_then(|ts| DateTime::parse_from_rfc3339(&ts).ok())
                .map(|ts| ts.with_timezone(&Utc));

            if finished_at.is_some_and(|ts| ts < cutoff) {
                if let Err(e) = self.force_remove(container.handle.as_str(), false).await {
                    warn!(container = %container.name, error = %e, "Cleanup removal failed");
                    continue;
                }
                removed += 1;
            }
        }

        info!(removed, "Cleanup sweep finished");
        Ok(removed)
    }

    async fn init_filesystem(&self, workspace_id: WorkspaceId) -> Result<(), CoreError> {
        let script = format!(
            r#"set -e
mkdir -p {home}/.config {home}/.ssh {home}/.local/bin {home}/projects
chmod 700 {home}/.ssh
if [ ! -f {home}/.bashrc ]; then
cat > {home}/.bashrc <<'TERMFLUX_RC'
# Default termflux shell configuration
export PS1='\u@\h:\w\$ '
export HISTSIZE=10000
export HISTFILESIZE=20000
shopt -s histappend
export PATH="$HOME/.local/bin:$PATH"
TERMFLUX_RC
fi
if [ ! -f {home}/.gitconfig ]; then
cat > {home}/.gitconfig <<'TERMFLUX_GIT'
[init]
	defaultBranch = main
[pull]
	rebase = false
TERMFLUX_GIT
fi
if [ ! -f {home}/.tmux.conf ]; then
cat > {home}/.tmux.conf <<'TERMFLUX_TMUX'
set -g default-terminal "screen-256color"
set -ga terminal-overrides ",xterm-256color:Tc"
set -g mouse on
set -g history-limit 50000
set -g base-index 1
setw -g pane-base-index 1
TERMFLUX_TMUX
fi
"#,
            home = HOME_DIR
        );

        let result = self
            .exec(
                workspace_id,
                &["sh".to_string(), "-c".to_string(), script],
                ExecOptions::default(),
            )
            .await?;

        if !result.success() {
            return Err(CoreError::Backend(format!(
                "filesystem init failed (exit {}): {}",
                result.exit_code,
                result.output_string()
            )));
        }
        Ok(())
    }
}
