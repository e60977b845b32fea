// Copyright (c) 2026 Termflux
// SPDX-License-Identifier: AGPL-3.0

//! Workspace domain model.
//!
//! A workspace is a named, resource-capped container plus its persistent
//! volume, owned by a single user. Invariant: `container_handle` is set
//! exactly while the workspace status is `Running`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::errors::CoreError;

// ============================================================================
// Value Objects: Identifiers
// ============================================================================

/// Unique identifier for a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkspaceId(pub Uuid);

impl WorkspaceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for WorkspaceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque container handle returned by the container runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerHandle(pub String);

impl ContainerHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Entity: Workspace
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    Creating,
    Running,
    Stopped,
    Error,
}

impl WorkspaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "creating" => Ok(Self::Creating),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "error" => Ok(Self::Error),
            other => Err(CoreError::Validation(format!(
                "unknown workspace status '{other}'"
            ))),
        }
    }
}

/// Resource caps handed to the container runtime at provision time.
///
/// CPU is whole cores (converted to nanocores), memory and disk are MiB.
/// Disk is advisory and enforced by the storage driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu_cores: u32,
    pub memory_mib: u64,
    pub disk_mib: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_cores: 2,
            memory_mib: 2048,
            disk_mib: 10240,
        }
    }
}

impl ResourceLimits {
    pub fn nano_cpus(&self) -> i64 {
        i64::from(self.cpu_cores) * 1_000_000_000
    }

    pub fn memory_bytes(&self) -> i64 {
        self.memory_mib as i64 * (1 << 20)
    }

    /// Swap cap is twice the memory cap.
    pub fn memory_swap_bytes(&self) -> i64 {
        self.memory_bytes() * 2
    }
}

/// Workspace aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub name: String,
    pub user_id: String,
    pub org_id: Option<String>,
    pub status: WorkspaceStatus,
    pub container_handle: Option<ContainerHandle>,
    pub resources: ResourceLimits,
    pub env: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workspace {
    pub fn new(name: impl Into<String>, user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: WorkspaceId::new(),
            name: name.into(),
            user_id: user_id.into(),
            org_id: None,
            status: WorkspaceStatus::Creating,
            container_handle: None,
            resources: ResourceLimits::default(),
            env: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Container name derived from the workspace id.
    pub fn container_name(&self) -> String {
        format!("termflux-{}", self.id)
    }

    /// Mark running with its container handle. The handle and status move
    /// together so the running invariant holds.
    pub fn mark_running(&mut self, handle: ContainerHandle) {
        self.container_handle = Some(handle);
        self.status = WorkspaceStatus::Running;
        self.updated_at = Utc::now();
    }

    pub fn mark_stopped(&mut self) {
        self.container_handle = None;
        self.status = WorkspaceStatus::Stopped;
        self.updated_at = Utc::now();
    }

    pub fn mark_error(&mut self) {
        self.container_handle = None;
        self.status = WorkspaceStatus::Error;
        self.updated_at = Utc::now();
    }

    pub fn is_running(&self) -> bool {
        self.status == WorkspaceStatus::Running
    }
}

// ============================================================================
// Provisioning request
// ============================================================================

/// SSH key material installed at first boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshKeyConfig {
    pub private_key: String,
    pub public_key: Option<String>,
}

/// Dotfiles source: a repo to clone or inline file contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DotfilesConfig {
    pub repo_url: Option<String>,
    pub install_script: Option<String>,
    /// Relative path -> file body, written verbatim under the home directory.
    #[serde(default)]
    pub files: HashMap<String, String>,
}

/// One entry from the app catalog selected for install.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppInstall {
    pub app_id: String,
    pub install_script: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
}

/// One repository to clone at first boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoClone {
    pub url: String,
    pub path: String,
    pub branch: Option<String>,
}

/// Everything the provisioner needs for a full first boot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvisionRequest {
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub ssh_key: Option<SshKeyConfig>,
    pub gpg_key: Option<String>,
    pub git_user_name: Option<String>,
    pub git_user_email: Option<String>,
    pub dotfiles: Option<DotfilesConfig>,
    #[serde(default)]
    pub apps: Vec<AppInstall>,
    #[serde(default)]
    pub repos: Vec<RepoClone>,
    pub startup_script: Option<String>,
}

// ============================================================================
// Health
// ============================================================================

/// Aggregated workspace health: runtime status, live stats, disk usage,
/// session count and uptime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceHealth {
    pub workspace_id: WorkspaceId,
    pub status: WorkspaceStatus,
    pub cpu_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_limit_bytes: u64,
    pub disk_used_bytes: u64,
    pub disk_total_bytes: u64,
    pub active_sessions: usize,
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_invariant_moves_handle_and_status_together() {
        let mut ws = Workspace::new("dev-box", "user-1");
        assert!(ws.container_handle.is_none());
        assert_eq!(ws.status, WorkspaceStatus::Creating);

        ws.mark_running(ContainerHandle::new("abc"));
        assert!(ws.container_handle.is_some());
        assert!(ws.is_running());

        ws.mark_stopped();
        assert!(ws.container_handle.is_none());
        assert_eq!(ws.status, WorkspaceStatus::Stopped);
    }

    #[test]
    fn resource_unit_conversions() {
        let limits = ResourceLimits {
            cpu_cores: 2,
            memory_mib: 512,
            disk_mib: 1024,
        };
        assert_eq!(limits.nano_cpus(), 2_000_000_000);
        assert_eq!(limits.memory_bytes(), 512 * 1024 * 1024);
        assert_eq!(limits.memory_swap_bytes(), 1024 * 1024 * 1024);
    }

    #[test]
    fn container_name_is_prefixed_with_workspace_id() {
        let ws = Workspace::new("x", "u");
        assert_eq!(ws.container_name(), format!("termflux-{}", ws.id));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            WorkspaceStatus::Creating,
            WorkspaceStatus::Running,
            WorkspaceStatus::Stopped,
            WorkspaceStatus::Error,
        ] {
            assert_eq!(WorkspaceStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(WorkspaceStatus::parse("zombie").is_err());
    }
}
