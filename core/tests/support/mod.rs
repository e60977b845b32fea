// Copyright (c) 2026 Termflux
// SPDX-License-Identifier: AGPL-3.0

//! Scripted container driver shared by the integration tests.
//!
//! Interprets a small command vocabulary (`echo`, `false`, `true`,
//! `sleep N`, `df`) and records every invocation so tests can assert on
//! what reached the container boundary.

// Each test binary uses a different slice of the mock.
#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

use termflux_core::domain::container::{
    AttachedStream, ContainerConfig, ContainerDriver, ContainerStats, ContainerStatus,
    ExecOptions, ExecOutput, ManagedContainer,
};
use termflux_core::domain::errors::CoreError;
use termflux_core::domain::workspace::{ContainerHandle, WorkspaceId};

#[derive(Debug, Clone)]
pub struct Invocation {
    pub command: String,
    pub env: Vec<String>,
    pub working_dir: Option<String>,
}

#[derive(Default)]
pub struct MockDriver {
    pub invocations: Mutex<Vec<Invocation>>,
    pub provisioned: Mutex<Vec<WorkspaceId>>,
    pub stopped: Mutex<Vec<WorkspaceId>>,
    pub removed: Mutex<Vec<(WorkspaceId, bool)>>,
    /// Commands containing this substring exit 1.
    pub fail_matching: Mutex<Option<String>>,
    /// Reported container status; defaults to running.
    pub status: Mutex<Option<ContainerStatus>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_commands_matching(&self, needle: &str) {
        *self.fail_matching.lock().unwrap() = Some(needle.to_string());
    }

    pub fn set_status(&self, status: ContainerStatus) {
        *self.status.lock().unwrap() = Some(status);
    }

    pub fn commands(&self) -> Vec<String> {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .map(|i| i.command.clone())
            .collect()
    }

    fn flatten(argv: &[String]) -> String {
        if argv.len() == 3 && argv[0] == "sh" && argv[1] == "-c" {
            argv[2].clone()
        } else {
            argv.join(" ")
        }
    }
}

const DF_OUTPUT: &str = "Filesystem     1B-blocks       Used  Available Use% Mounted on\n\
                         overlay      10737418240 2147483648 8589934592  20% /home/dev\n";

#[async_trait]
impl ContainerDriver for MockDriver {
    async fn provision(&self, config: &ContainerConfig) -> Result<ContainerHandle, CoreError> {
        self.provisioned.lock().unwrap().push(config.workspace_id);
        Ok(ContainerHandle::new(format!(
            "mock-{}",
            config.workspace_id
        )))
    }

    async fn exec(
        &self,
        _workspace_id: WorkspaceId,
        argv: &[String],
        options: ExecOptions,
    ) -> Result<ExecOutput, CoreError> {
        let command = Self::flatten(argv);
        self.invocations.lock().unwrap().push(Invocation {
            command: command.clone(),
            env: options.env.clone(),
            working_dir: options.working_dir.clone(),
        });

        if let Some(needle) = self.fail_matching.lock().unwrap().as_deref() {
            if command.contains(needle) {
                return Ok(ExecOutput {
                    output: b"scripted failure\n".to_vec(),
                    exit_code: 1,
                });
            }
        }

        if let Some(secs) = command
            .strip_prefix("sleep ")
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|n| n.parse::<u64>().ok())
        {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            return Ok(ExecOutput {
                output: Vec::new(),
                exit_code: 0,
            });
        }

        if command == "false" || command.ends_with("&& false") {
            return Ok(ExecOutput {
                output: Vec::new(),
                exit_code: 1,
            });
        }

        if let Some(rest) = command.strip_prefix("echo ") {
            return Ok(ExecOutput {
                output: format!("{rest}\n").into_bytes(),
                exit_code: 0,
            });
        }

        if command.starts_with("df ") {
            return Ok(ExecOutput {
                output: DF_OUTPUT.as_bytes().to_vec(),
                exit_code: 0,
            });
        }

        Ok(ExecOutput {
            output: Vec::new(),
            exit_code: 0,
        })
    }

    async fn attach_stream(
        &self,
        _workspace_id: WorkspaceId,
        argv: &[String],
    ) -> Result<AttachedStream, CoreError> {
        self.invocations.lock().unwrap().push(Invocation {
            command: Self::flatten(argv),
            env: Vec::new(),
            working_dir: None,
        });
        Ok(AttachedStream {
            input: Box::pin(tokio::io::sink()),
            output: Box::pin(futures::stream::pending()),
        })
    }

    async fn status(&self, _workspace_id: WorkspaceId) -> Result<ContainerStatus, CoreError> {
        Ok(self
            .status
            .lock()
            .unwrap()
            .unwrap_or(ContainerStatus::Running))
    }

    async fn stats(&self, _workspace_id: WorkspaceId) -> Result<ContainerStats, CoreError> {
        Ok(ContainerStats {
            cpu_percent: 12.5,
            memory_used_bytes: 256 << 20,
            memory_limit_bytes: 512 << 20,
            net_rx_bytes: 1024,
            net_tx_bytes: 2048,
        })
    }

    async fn uptime_seconds(&self, _workspace_id: WorkspaceId) -> Result<u64, CoreError> {
        Ok(3600)
    }

    async fn stop(&self, workspace_id: WorkspaceId, _grace_secs: i64) -> Result<(), CoreError> {
        self.stopped.lock().unwrap().push(workspace_id);
        Ok(())
    }

    async fn remove(
        &self,
        workspace_id: WorkspaceId,
        remove_volume: bool,
    ) -> Result<(), CoreError> {
        self.removed
            .lock()
            .unwrap()
            .push((workspace_id, remove_volume));
        Ok(())
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, CoreError> {
        Ok(Vec::new())
    }

    async fn cleanup(&self, _older_than_secs: i64) -> Result<usize, CoreError> {
        Ok(0)
    }

    async fn init_filesystem(&self, workspace_id: WorkspaceId) -> Result<(), CoreError> {
        self.invocations.lock().unwrap().push(Invocation {
            command: format!("init-filesystem {workspace_id}"),
            env: Vec::new(),
            working_dir: None,
        });
        Ok(())
    }
}
