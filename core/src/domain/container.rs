// Copyright (c) 2026 Termflux
// SPDX-License-Identifier: AGPL-3.0

//! Container driver abstraction.
//!
//! The trait is the seam between the runtime middle layer and the host
//! container runtime; the bollard-backed implementation lives in
//! `infrastructure::runtime`. Tests substitute a scripted driver.

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use tokio::io::AsyncWrite;

use crate::domain::errors::CoreError;
use crate::domain::workspace::{ContainerHandle, ResourceLimits, WorkspaceId};

/// Inputs for provisioning a workspace container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub workspace_id: WorkspaceId,
    pub user_id: String,
    pub image: String,
    pub resources: ResourceLimits,
    /// User environment, layered on top of the mandatory base set.
    pub env: HashMap<String, String>,
}

/// Options for a one-shot exec.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Extra `KEY=VALUE` environment entries.
    pub env: Vec<String>,
    /// Working directory; defaults to the home directory.
    pub working_dir: Option<String>,
    /// Run as a different user than the workspace default.
    pub user: Option<String>,
}

/// Captured result of a one-shot exec: combined output with the runtime
/// stream framing already stripped, plus the inspect-reported exit code.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub output: Vec<u8>,
    pub exit_code: i64,
}

impl ExecOutput {
    pub fn output_string(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A hijacked bidirectional byte stream bound to an in-container command.
/// The caller owns the lifetime of both halves.
pub struct AttachedStream {
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
    pub output: Pin<Box<dyn Stream<Item = Result<Bytes, CoreError>> + Send>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Running,
    Stopped,
    NotFound,
}

/// Point-in-time resource usage for a running container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_limit_bytes: u64,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
}

/// Summary of a managed container from a list call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedContainer {
    pub handle: ContainerHandle,
    pub name: String,
    pub state: String,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Typed facade over the host container runtime.
///
/// Transport errors surface verbatim as `CoreError::Backend`; `stop` and
/// `remove` treat a missing container as success.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Create volume + container with hardened defaults, start it, and
    /// return its handle. An existing container of the same name is removed
    /// first.
    async fn provision(&self, config: &ContainerConfig) -> Result<ContainerHandle, CoreError>;

    /// Run a command to completion and capture combined output. No timeout
    /// is imposed here; callers race against their own timers.
    async fn exec(
        &self,
        workspace_id: WorkspaceId,
        argv: &[String],
        options: ExecOptions,
    ) -> Result<ExecOutput, CoreError>;

    /// Open a TTY-attached duplex stream running `argv`.
    async fn attach_stream(
        &self,
        workspace_id: WorkspaceId,
        argv: &[String],
    ) -> Result<AttachedStream, CoreError>;

    async fn status(&self, workspace_id: WorkspaceId) -> Result<ContainerStatus, CoreError>;

    async fn stats(&self, workspace_id: WorkspaceId) -> Result<ContainerStats, CoreError>;

    /// Uptime in seconds from the inspect-reported start time.
    async fn uptime_seconds(&self, workspace_id: WorkspaceId) -> Result<u64, CoreError>;

    async fn stop(&self, workspace_id: WorkspaceId, grace_secs: i64) -> Result<(), CoreError>;

    async fn remove(&self, workspace_id: WorkspaceId, remove_volume: bool) -> Result<(), CoreError>;

    /// List containers carrying the managed label.
    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, CoreError>;

    /// Remove exited managed containers older than `older_than_secs`.
    /// Returns the number removed.
    async fn cleanup(&self, older_than_secs: i64) -> Result<usize, CoreError>;

    /// First-boot filesystem layout inside the container.
    async fn init_filesystem(&self, workspace_id: WorkspaceId) -> Result<(), CoreError>;
}
