// Copyright (c) 2026 Termflux
// SPDX-License-Identifier: AGPL-3.0

//! Integration tests for the workflow engine: submission, the recursive
//! step evaluator, timeouts, failure policies and cancellation, driven
//! against the scripted mock driver and in-memory repositories.

mod support;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use support::MockDriver;
use termflux_core::application::workflow_engine::{RunJob, WorkflowEngine};
use termflux_core::domain::repository::WorkflowRepository;
use termflux_core::domain::workflow::{
    OnFailure, RunId, RunStatus, Step, StepKind, StepStatus, WorkflowDefinition,
};
use termflux_core::domain::workspace::WorkspaceId;
use termflux_core::infrastructure::queue::JobQueue;
use termflux_core::infrastructure::repositories::{InMemoryRunRepository, InMemoryWorkflowRepository};

struct Harness {
    engine: Arc<WorkflowEngine>,
    driver: Arc<MockDriver>,
    workflows: Arc<InMemoryWorkflowRepository>,
    workspace_id: WorkspaceId,
}

fn harness() -> Harness {
    let driver = Arc::new(MockDriver::new());
    let workflows = Arc::new(InMemoryWorkflowRepository::new());
    let runs = Arc::new(InMemoryRunRepository::new());
    // Single attempt keeps failure tests deterministic; retry behavior is
    // covered by the queue's own tests.
    let queue = Arc::new(JobQueue::<RunJob>::with_max_attempts(1));
    let engine = Arc::new(WorkflowEngine::new(
        driver.clone(),
        workflows.clone(),
        runs,
        queue,
        None,
    ));
    engine.spawn_workers();
    Harness {
        engine,
        driver,
        workflows,
        workspace_id: WorkspaceId::new(),
    }
}

fn shell_step(id: &str, command: &str) -> Step {
    Step {
        id: id.to_string(),
        name: id.to_string(),
        kind: StepKind::Shell,
        command: Some(command.to_string()),
        steps: vec![],
        condition: None,
        timeout_secs: None,
        retries: 0,
        on_failure: OnFailure::Stop,
        working_dir: None,
        env: HashMap::new(),
        depends_on: vec![],
    }
}

async fn submit(harness: &Harness, steps: Vec<Step>, variables: HashMap<String, String>) -> RunId {
    let definition = WorkflowDefinition::new(harness.workspace_id, "test-workflow", steps).unwrap();
    harness.workflows.save(&definition).await.unwrap();
    harness
        .engine
        .start_workflow(definition.id, harness.workspace_id, "user-1", variables)
        .await
        .unwrap()
}

async fn wait_terminal(harness: &Harness, run_id: &RunId) -> termflux_core::domain::workflow::WorkflowRun {
    for _ in 0..100 {
        if let Some(run) = harness.engine.run_status(run_id).await.unwrap() {
            if run.status.is_terminal() {
                return run;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("run {run_id} did not reach a terminal state");
}

#[tokio::test]
async fn parallel_composition_appends_each_child_and_fails_the_run() {
    let h = harness();
    let parallel = Step {
        id: "par".to_string(),
        name: "par".to_string(),
        kind: StepKind::Parallel,
        command: None,
        steps: vec![
            shell_step("a", "echo a"),
            shell_step("b", "echo b"),
            shell_step("c", "false"),
        ],
        condition: None,
        timeout_secs: None,
        retries: 0,
        on_failure: OnFailure::Stop,
        working_dir: None,
        env: HashMap::new(),
        depends_on: vec![],
    };

    let run_id = submit(&h, vec![parallel], HashMap::new()).await;
    let run = wait_terminal(&h, &run_id).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.step_results.len(), 3);

    let by_id: HashMap<_, _> = run
        .step_results
        .iter()
        .map(|r| (r.step_id.as_str(), r))
        .collect();
    assert_eq!(by_id["a"].status, StepStatus::Success);
    assert!(by_id["a"].output.contains('a'));
    assert_eq!(by_id["b"].status, StepStatus::Success);
    assert!(by_id["b"].output.contains('b'));
    assert_eq!(by_id["c"].status, StepStatus::Failed);
    assert!(by_id["c"].output.is_empty());
}

#[tokio::test]
async fn parallel_child_with_continue_policy_does_not_fail_the_run() {
    let h = harness();
    let mut tolerated = shell_step("tolerated", "false");
    tolerated.on_failure = OnFailure::Continue;
    let parallel = Step {
        id: "par".to_string(),
        name: "par".to_string(),
        kind: StepKind::Parallel,
        command: None,
        steps: vec![shell_step("a", "echo a"), tolerated],
        condition: None,
        timeout_secs: None,
        retries: 0,
        on_failure: OnFailure::Stop,
        working_dir: None,
        env: HashMap::new(),
        depends_on: vec![],
    };

    let run_id = submit(
        &h,
        vec![parallel, shell_step("after", "echo after")],
        HashMap::new(),
    )
    .await;
    let run = wait_terminal(&h, &run_id).await;

    // The child's own policy absorbs the failure; the run proceeds.
    assert_eq!(run.status, RunStatus::Completed);
    let by_id: HashMap<_, _> = run
        .step_results
        .iter()
        .map(|r| (r.step_id.as_str(), r))
        .collect();
    assert_eq!(by_id["tolerated"].status, StepStatus::Failed);
    assert_eq!(by_id["after"].status, StepStatus::Success);
}

#[tokio::test]
async fn parallel_child_retry_policy_reruns_the_child() {
    let h = harness();
    let mut flaky = shell_step("flaky", "false");
    flaky.on_failure = OnFailure::Retry;
    flaky.retries = 2;
    let parallel = Step {
        id: "par".to_string(),
        name: "par".to_string(),
        kind: StepKind::Parallel,
        command: None,
        steps: vec![flaky],
        condition: None,
        timeout_secs: None,
        retries: 0,
        on_failure: OnFailure::Stop,
        working_dir: None,
        env: HashMap::new(),
        depends_on: vec![],
    };

    let run_id = submit(&h, vec![parallel], HashMap::new()).await;
    let run = wait_terminal(&h, &run_id).await;

    // Exhausted retries fall back to stop, and every attempt is recorded.
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.as_deref().unwrap().contains("flaky"));
    let attempts = h
        .driver
        .commands()
        .iter()
        .filter(|c| c.as_str() == "false")
        .count();
    assert_eq!(attempts, 3);
    assert_eq!(run.step_results.len(), 3);
}

#[tokio::test]
async fn variables_are_substituted_before_exec() {
    let h = harness();
    let variables = HashMap::from([
        ("A".to_string(), "x".to_string()),
        ("LONG".to_string(), "y".to_string()),
    ]);
    let run_id = submit(&h, vec![shell_step("s", "echo $A ${LONG}")], variables).await;
    let run = wait_terminal(&h, &run_id).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert!(h.driver.commands().contains(&"echo x y".to_string()));
    assert_eq!(run.step_results[0].output, "x y\n");
}

#[tokio::test]
async fn variables_are_passed_as_environment() {
    let h = harness();
    let variables = HashMap::from([("API_URL".to_string(), "http://localhost".to_string())]);
    let run_id = submit(&h, vec![shell_step("s", "true")], variables).await;
    wait_terminal(&h, &run_id).await;

    let invocations = h.driver.invocations.lock().unwrap();
    let shell = invocations.iter().find(|i| i.command == "true").unwrap();
    assert!(shell
        .env
        .contains(&"API_URL=http://localhost".to_string()));
}

#[tokio::test]
async fn step_timeout_produces_a_failed_result_within_bounds() {
    let h = harness();
    let mut step = shell_step("slow", "sleep 5");
    step.timeout_secs = Some(1);
    step.on_failure = OnFailure::Continue;

    let run_id = submit(&h, vec![step], HashMap::new()).await;
    let run = wait_terminal(&h, &run_id).await;

    assert_eq!(run.status, RunStatus::Completed);
    let result = &run.step_results[0];
    assert_eq!(result.status, StepStatus::Failed);
    assert!(result.error.as_deref().unwrap().contains("timed out"));
    assert!(result.exit_code.is_none());
    assert!(
        (1000..1500).contains(&result.duration_ms),
        "duration was {}ms",
        result.duration_ms
    );
}

#[tokio::test]
async fn on_failure_continue_lets_the_run_finish() {
    let h = harness();
    let mut failing = shell_step("bad", "false");
    failing.on_failure = OnFailure::Continue;

    let run_id = submit(
        &h,
        vec![failing, shell_step("after", "echo after")],
        HashMap::new(),
    )
    .await;
    let run = wait_terminal(&h, &run_id).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.step_results.len(), 2);
    assert_eq!(run.step_results[1].status, StepStatus::Success);
}

#[tokio::test]
async fn on_failure_stop_terminates_the_run() {
    let h = harness();
    let run_id = submit(
        &h,
        vec![shell_step("bad", "false"), shell_step("never", "echo never")],
        HashMap::new(),
    )
    .await;
    let run = wait_terminal(&h, &run_id).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.step_results.len(), 1);
    assert!(run.error.as_deref().unwrap().contains("bad"));
    assert!(!h.driver.commands().contains(&"echo never".to_string()));
}

#[tokio::test]
async fn on_failure_retry_reruns_before_stopping() {
    let h = harness();
    let mut flaky = shell_step("flaky", "false");
    flaky.on_failure = OnFailure::Retry;
    flaky.retries = 2;

    let run_id = submit(&h, vec![flaky], HashMap::new()).await;
    let run = wait_terminal(&h, &run_id).await;

    assert_eq!(run.status, RunStatus::Failed);
    let attempts = h
        .driver
        .commands()
        .iter()
        .filter(|c| c.as_str() == "false")
        .count();
    assert_eq!(attempts, 3);
}

#[tokio::test]
async fn sequential_steps_run_in_declaration_order() {
    let h = harness();
    let sequential = Step {
        id: "seq".to_string(),
        name: "seq".to_string(),
        kind: StepKind::Sequential,
        command: None,
        steps: vec![shell_step("one", "echo one"), shell_step("two", "echo two")],
        condition: None,
        timeout_secs: None,
        retries: 0,
        on_failure: OnFailure::Stop,
        working_dir: None,
        env: HashMap::new(),
        depends_on: vec![],
    };

    let run_id = submit(&h, vec![sequential], HashMap::new()).await;
    let run = wait_terminal(&h, &run_id).await;

    assert_eq!(run.status, RunStatus::Completed);
    let ids: Vec<_> = run.step_results.iter().map(|r| r.step_id.as_str()).collect();
    assert_eq!(ids, vec!["one", "two"]);
}

#[tokio::test]
async fn conditional_takes_branch_on_zero_exit() {
    let h = harness();
    let conditional = Step {
        id: "cond".to_string(),
        name: "cond".to_string(),
        kind: StepKind::Conditional,
        command: None,
        steps: vec![shell_step("branch", "echo taken")],
        condition: Some("true".to_string()),
        timeout_secs: None,
        retries: 0,
        on_failure: OnFailure::Stop,
        working_dir: None,
        env: HashMap::new(),
        depends_on: vec![],
    };

    let run_id = submit(&h, vec![conditional], HashMap::new()).await;
    let run = wait_terminal(&h, &run_id).await;

    assert_eq!(run.status, RunStatus::Completed);
    let marker = &run.step_results[0];
    assert_eq!(marker.step_id, "cond");
    assert_eq!(marker.status, StepStatus::Success);
    assert!(marker.output.contains("condition met"));
    assert_eq!(run.step_results[1].step_id, "branch");
}

#[tokio::test]
async fn conditional_skips_branch_on_nonzero_exit() {
    let h = harness();
    let conditional = Step {
        id: "cond".to_string(),
        name: "cond".to_string(),
        kind: StepKind::Conditional,
        command: None,
        steps: vec![shell_step("branch", "echo taken")],
        condition: Some("false".to_string()),
        timeout_secs: None,
        retries: 0,
        on_failure: OnFailure::Stop,
        working_dir: None,
        env: HashMap::new(),
        depends_on: vec![],
    };

    let run_id = submit(&h, vec![conditional], HashMap::new()).await;
    let run = wait_terminal(&h, &run_id).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.step_results.len(), 1);
    assert!(run.step_results[0].output.contains("not met"));
    assert!(!h.driver.commands().contains(&"echo taken".to_string()));
}

#[tokio::test]
async fn wait_step_sleeps_and_succeeds() {
    let h = harness();
    let wait = Step {
        id: "pause".to_string(),
        name: "pause".to_string(),
        kind: StepKind::Wait,
        command: None,
        steps: vec![],
        condition: None,
        timeout_secs: Some(1),
        retries: 0,
        on_failure: OnFailure::Stop,
        working_dir: None,
        env: HashMap::new(),
        depends_on: vec![],
    };

    let run_id = submit(&h, vec![wait], HashMap::new()).await;
    let run = wait_terminal(&h, &run_id).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.step_results[0].status, StepStatus::Success);
    assert!(run.step_results[0].duration_ms >= 1000);
}

#[tokio::test]
async fn cancellation_stops_between_steps() {
    let h = harness();
    let run_id = submit(
        &h,
        vec![shell_step("slow", "sleep 2"), shell_step("after", "echo after")],
        HashMap::new(),
    )
    .await;

    // Let the first step get in flight, then cancel.
    tokio::time::sleep(Duration::from_millis(300)).await;
    h.engine.cancel_workflow(&run_id).await.unwrap();

    let run = wait_terminal(&h, &run_id).await;
    assert_eq!(run.status, RunStatus::Cancelled);

    // The in-flight step completes and is recorded; the next never starts.
    tokio::time::sleep(Duration::from_millis(2200)).await;
    let run = h.engine.run_status(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(!h.driver.commands().contains(&"echo after".to_string()));
}

#[tokio::test]
async fn unknown_workflow_is_not_found() {
    let h = harness();
    let missing = termflux_core::domain::workflow::WorkflowId::new();
    let err = h
        .engine
        .start_workflow(missing, h.workspace_id, "user-1", HashMap::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[tokio::test]
async fn caller_variables_override_workflow_defaults() {
    let h = harness();
    let mut definition =
        WorkflowDefinition::new(h.workspace_id, "defaults", vec![shell_step("s", "echo ${WHO}")])
            .unwrap();
    definition
        .env
        .insert("WHO".to_string(), "default".to_string());
    h.workflows.save(&definition).await.unwrap();

    let run_id = h
        .engine
        .start_workflow(
            definition.id,
            h.workspace_id,
            "user-1",
            HashMap::from([("WHO".to_string(), "caller".to_string())]),
        )
        .await
        .unwrap();
    let run = wait_terminal(&h, &run_id).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.step_results[0].output, "caller\n");
}
