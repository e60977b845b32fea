// Copyright (c) 2026 Termflux
// SPDX-License-Identifier: AGPL-3.0

//! Workflow domain model.
//!
//! A workflow definition is a nested tree of steps: `shell` and `wait` are
//! leaves, `parallel`/`sequential`/`conditional` are composites. The tree is
//! a tagged variant walked by a single recursive evaluator in the
//! application layer; this module owns the shape and its invariants.
//!
//! # Invariants
//!
//! - `shell` steps carry a command; `wait` steps carry neither command nor
//!   children.
//! - Composite steps have at least one nested step.
//! - Children of a `parallel` step are restricted to `shell`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::errors::CoreError;
use crate::domain::ids::short_id;
use crate::domain::workspace::WorkspaceId;

// ============================================================================
// Value Objects: Identifiers
// ============================================================================

/// Unique identifier for a workflow definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Short opaque run identifier, same generator as session ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
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

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Step tree
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Shell,
    Parallel,
    Sequential,
    Conditional,
    Wait,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shell => "shell",
            Self::Parallel => "parallel",
            Self::Sequential => "sequential",
            Self::Conditional => "conditional",
            Self::Wait => "wait",
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::Shell | Self::Wait)
    }
}

/// Policy applied when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    Continue,
    #[default]
    Stop,
    Retry,
}

/// One node of the step tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub name: String,
    pub kind: StepKind,
    pub command: Option<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Shell exit-status predicate for conditional steps.
    pub condition: Option<String>,
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub on_failure: OnFailure,
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Advisory only; declaration order drives execution.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl Step {
    /// Validate this step and its subtree against the structural invariants.
    pub fn validate(&self) -> Result<(), CoreError> {
        match self.kind {
            StepKind::Shell => {
                if self.command.as_deref().map_or(true, str::is_empty) {
                    return Err(CoreError::Validation(format!(
                        "shell step '{}' is missing a command",
                        self.id
                    )));
                }
                if !self.steps.is_empty() {
                    return Err(CoreError::Validation(format!(
                        "shell step '{}' cannot have nested steps",
                        self.id
                    )));
                }
            }
            StepKind::Wait => {
                if !self.steps.is_empty() {
                    return Err(CoreError::Validation(format!(
                        "wait step '{}' cannot have nested steps",
                        self.id
                    )));
                }
            }
            StepKind::Parallel => {
                if self.steps.is_empty() {
                    return Err(CoreError::Validation(format!(
                        "parallel step '{}' has no nested steps",
                        self.id
                    )));
                }
                for child in &self.steps {
                    if child.kind != StepKind::Shell {
                        return Err(CoreError::Validation(format!(
                            "parallel step '{}' may only contain shell steps, found '{}' ({})",
                            self.id,
                            child.id,
                            child.kind.as_str()
                        )));
                    }
                }
            }
            StepKind::Sequential => {
                if self.steps.is_empty() {
                    return Err(CoreError::Validation(format!(
                        "sequential step '{}' has no nested steps",
                        self.id
                    )));
                }
            }
            StepKind::Conditional => {
                if self.condition.as_deref().map_or(true, str::is_empty) {
                    return Err(CoreError::Validation(format!(
                        "conditional step '{}' is missing a condition",
                        self.id
                    )));
                }
                if self.steps.is_empty() {
                    return Err(CoreError::Validation(format!(
                        "conditional step '{}' has no nested steps",
                        self.id
                    )));
                }
            }
        }
        for child in &self.steps {
            child.validate()?;
        }
        Ok(())
    }
}

/// Workflow definition aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    pub workspace_id: WorkspaceId,
    pub name: String,
    pub steps: Vec<Step>,
    /// Default variables, overridden by caller-supplied values at start.
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    pub fn new(
        workspace_id: WorkspaceId,
        name: impl Into<String>,
        steps: Vec<Step>,
    ) -> Result<Self, CoreError> {
        if steps.is_empty() {
            return Err(CoreError::Validation("workflow has no steps".into()));
        }
        for step in &steps {
            step.validate()?;
        }
        let now = Utc::now();
        Ok(Self {
            id: WorkflowId::new(),
            workspace_id,
            name: name.into(),
            steps,
            env: HashMap::new(),
            created_at: now,
            updated_at: now,
        })
    }
}

// ============================================================================
// Runs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(CoreError::Validation(format!(
                "unknown run status '{other}'"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Persisted outcome of one evaluated step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    pub output: String,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Workflow run record. Step results are appended in execution order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: RunId,
    pub workflow_id: WorkflowId,
    pub workspace_id: WorkspaceId,
    pub user_id: String,
    pub status: RunStatus,
    pub step_results: Vec<StepResult>,
    pub variables: HashMap<String, String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn new(
        workflow_id: WorkflowId,
        workspace_id: WorkspaceId,
        user_id: impl Into<String>,
        variables: HashMap<String, String>,
    ) -> Self {
        Self {
            id: RunId::new(),
            workflow_id,
            workspace_id,
            user_id: user_id.into(),
            status: RunStatus::Pending,
            step_results: Vec::new(),
            variables,
            started_at: None,
            completed_at: None,
            error: None,
            created_at: Utc::now(),
        }
    }
}

// ============================================================================
// Variable substitution
// ============================================================================

/// Replace `${NAME}` and `$NAME` occurrences with variable values.
///
/// `${NAME}` is resolved first and is unambiguous; bare `$NAME` consumes the
/// longest identifier run (`[A-Za-z_][A-Za-z0-9_]*`). Unknown names are left
/// verbatim. The output is built in a single pass over the input, so
/// replacement values are never re-scanned.
pub fn substitute_variables(command: &str, vars: &HashMap<String, String>) -> String {
    let bytes = command.as_bytes();
    let mut out = String::with_capacity(command.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'$' {
            // Copy the whole UTF-8 char, not just one byte.
            let ch = command[i..].chars().next().expect("in-bounds char");
            out.push(ch);
            i += ch.len_utf8();
            continue;
        }

        // "${NAME}"
        if i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if let Some(close) = command[i + 2..].find('}') {
                let name = &command[i + 2..i + 2 + close];
                if let Some(value) = vars.get(name) {
                    out.push_str(value);
                } else {
                    out.push_str(&command[i..i + close + 3]);
                }
                i += close + 3;
                continue;
            }
            out.push('$');
            i += 1;
            continue;
        }

        // "$NAME"
        let rest = &bytes[i + 1..];
        let ident_len = rest
            .iter()
            .take_while(|b| b.is_ascii_alphanumeric() || **b == b'_')
            .count();
        let valid_start = rest
            .first()
            .map(|b| b.is_ascii_alphabetic() || *b == b'_')
            .unwrap_or(false);
        if ident_len > 0 && valid_start {
            let name = &command[i + 1..i + 1 + ident_len];
            if let Some(value) = vars.get(name) {
                out.push_str(value);
            } else {
                out.push('$');
                out.push_str(name);
            }
            i += 1 + ident_len;
        } else {
            out.push('$');
            i += 1;
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(id: &str, command: &str) -> Step {
        Step {
            id: id.to_string(),
            name: id.to_string(),
            kind: StepKind::Shell,
            command: Some(command.to_string()),
            steps: vec![],
            condition: None,
            timeout_secs: None,
            retries: 0,
            on_failure: OnFailure::default(),
            working_dir: None,
            env: HashMap::new(),
            depends_on: vec![],
        }
    }

    fn composite(id: &str, kind: StepKind, steps: Vec<Step>) -> Step {
        Step {
            id: id.to_string(),
            name: id.to_string(),
            kind,
            command: None,
            steps,
            condition: (kind == StepKind::Conditional).then(|| "true".to_string()),
            timeout_secs: None,
            retries: 0,
            on_failure: OnFailure::default(),
            working_dir: None,
            env: HashMap::new(),
            depends_on: vec![],
        }
    }

    #[test]
    fn shell_requires_command() {
        let mut step = shell("a", "echo hi");
        assert!(step.validate().is_ok());
        step.command = None;
        assert!(step.validate().is_err());
    }

    #[test]
    fn parallel_children_must_be_shell() {
        let ok = composite(
            "p",
            StepKind::Parallel,
            vec![shell("a", "echo a"), shell("b", "echo b")],
        );
        assert!(ok.validate().is_ok());

        let nested_seq = composite("inner", StepKind::Sequential, vec![shell("c", "true")]);
        let bad = composite("p", StepKind::Parallel, vec![nested_seq]);
        assert!(bad.validate().is_err());
    }

    #[test]
    fn composites_need_children() {
        let empty = composite("s", StepKind::Sequential, vec![]);
        assert!(empty.validate().is_err());
    }

    #[test]
    fn wait_is_a_leaf() {
        let mut step = composite("w", StepKind::Wait, vec![]);
        step.condition = None;
        assert!(step.validate().is_ok());
        step.steps.push(shell("x", "true"));
        assert!(step.validate().is_err());
    }

    #[test]
    fn substitution_handles_both_forms() {
        let vars = HashMap::from([
            ("A".to_string(), "x".to_string()),
            ("LONG".to_string(), "y".to_string()),
        ]);
        assert_eq!(substitute_variables("echo $A ${LONG}", &vars), "echo x y");
    }

    #[test]
    fn substitution_is_stable_under_reapplication() {
        let vars = HashMap::from([("B".to_string(), "done".to_string())]);
        let once = substitute_variables("run ${B} $B", &vars);
        assert_eq!(once, "run done done");
        assert_eq!(substitute_variables(&once, &vars), once);
    }

    #[test]
    fn unknown_variables_are_left_verbatim() {
        let vars = HashMap::new();
        assert_eq!(
            substitute_variables("echo $MISSING ${ALSO}", &vars),
            "echo $MISSING ${ALSO}"
        );
    }

    #[test]
    fn dollar_digit_and_trailing_dollar_pass_through() {
        let vars = HashMap::from([("X".to_string(), "v".to_string())]);
        assert_eq!(
            substitute_variables("awk '{print $1}' $", &vars),
            "awk '{print $1}' $"
        );
        assert_eq!(substitute_variables("$X$X", &vars), "vv");
    }

    #[test]
    fn definition_rejects_empty_step_list() {
        let err = WorkflowDefinition::new(WorkspaceId::new(), "wf", vec![]);
        assert!(err.is_err());
    }
}
