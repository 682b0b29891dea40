//! End-to-end execution scenarios driven through `PlumberService`, with the
//! test acting as the agents.

mod common;

use common::{fast_config, TestHarness};
use plumber_core::api::ReportOutcome;
use plumber_core::models::NewStepExecution;
use plumber_core::state_machine::{AgentStatus, RunStatus};
use plumber_core::store::{InMemoryStateStore, StateStore};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_three_steps_on_three_agents_succeed_in_order() {
    let harness = TestHarness::start().await;
    let a1 = harness.online_agent("a1").await;
    let a2 = harness.online_agent("a2").await;
    let a3 = harness.online_agent("a3").await;
    let task = harness
        .task_with_steps(&[(a1.id, "echo one"), (a2.id, "echo two"), (a3.id, "echo three")])
        .await;

    let started = harness
        .service
        .run_task(&task.id.to_string())
        .await
        .unwrap();
    assert_eq!(started.status, "started");
    assert_eq!(started.execution.status, RunStatus::Running);

    for (agent, output) in [(&a1, "one"), (&a2, "two"), (&a3, "three")] {
        let step = harness.next_step(agent.id).await;
        let response = harness.report(step.step_id, 0, output).await;
        assert_eq!(response.status, ReportOutcome::Updated);
    }

    let execution = harness.wait_for_execution(started.execution_id).await;
    assert_eq!(execution.status, RunStatus::Success);
    assert!(execution.end_time.is_some());
    assert_eq!(execution.steps.len(), 3);
    for (index, step) in execution.steps.iter().enumerate() {
        assert_eq!(step.step_index as usize, index);
        assert_eq!(step.status, RunStatus::Success);
        assert_eq!(step.exit_code, Some(0));
    }
    // completion order follows step order
    assert!(execution.steps[0].end_time <= execution.steps[1].start_time);
    assert!(execution.steps[1].end_time <= execution.steps[2].start_time);

    harness.wait_for_task_status(task.id, RunStatus::Success).await;
    harness.stop().await;
}

#[tokio::test]
async fn test_nonzero_exit_fails_execution_and_skips_remaining_steps() {
    let harness = TestHarness::start().await;
    let agent = harness.online_agent("worker").await;
    let task = harness
        .task_with_steps(&[(agent.id, "true"), (agent.id, "exit 7"), (agent.id, "true")])
        .await;
    let started = harness
        .service
        .run_task(&task.id.to_string())
        .await
        .unwrap();

    let first = harness.next_step(agent.id).await;
    harness.report(first.step_id, 0, "").await;
    let second = harness.next_step(agent.id).await;
    assert_eq!(second.command, "exit 7");
    harness.report(second.step_id, 7, "partial output").await;

    let execution = harness.wait_for_execution(started.execution_id).await;
    assert_eq!(execution.status, RunStatus::Failed);
    assert_eq!(execution.steps.len(), 2, "step 3 must never be created");
    assert_eq!(execution.steps[1].exit_code, Some(7));
    assert_eq!(execution.steps[1].output, "partial output");

    harness.wait_for_task_status(task.id, RunStatus::Failed).await;
    harness.stop().await;
}

#[tokio::test]
async fn test_success_report_with_nonzero_exit_counts_as_failure() {
    let harness = TestHarness::start().await;
    let agent = harness.online_agent("worker").await;
    let task = harness.task_with_steps(&[(agent.id, "false")]).await;
    let started = harness
        .service
        .run_task(&task.id.to_string())
        .await
        .unwrap();

    let step = harness.next_step(agent.id).await;
    harness
        .service
        .report_step(plumber_core::api::ReportParams {
            step_id: step.step_id.to_string(),
            status: "success".to_string(),
            exit_code: 3,
            output: String::new(),
        })
        .await
        .unwrap();

    let execution = harness.wait_for_execution(started.execution_id).await;
    assert_eq!(execution.status, RunStatus::Failed);
    assert_eq!(execution.steps[0].status, RunStatus::Failed);
    harness.stop().await;
}

#[tokio::test]
async fn test_offline_agent_fails_execution_without_creating_steps() {
    let harness = TestHarness::start().await;
    let agent = harness.offline_agent("sleeping").await;
    assert_eq!(agent.status, AgentStatus::Offline);
    let task = harness.task_with_steps(&[(agent.id, "true")]).await;

    let started = harness
        .service
        .run_task(&task.id.to_string())
        .await
        .unwrap();
    let execution = harness.wait_for_execution(started.execution_id).await;

    assert_eq!(execution.status, RunStatus::Failed);
    assert!(execution.steps.is_empty());
    assert!(execution.end_time.is_some());
    harness.stop().await;
}

#[tokio::test]
async fn test_deleted_agent_fails_execution() {
    let harness = TestHarness::start().await;
    let agent = harness.online_agent("gone").await;
    let task = harness.task_with_steps(&[(agent.id, "true")]).await;
    harness
        .service
        .delete_agent(&agent.id.to_string())
        .await
        .unwrap();

    let started = harness
        .service
        .run_task(&task.id.to_string())
        .await
        .unwrap();
    let execution = harness.wait_for_execution(started.execution_id).await;
    assert_eq!(execution.status, RunStatus::Failed);
    assert!(execution.steps.is_empty());
    harness.stop().await;
}

#[tokio::test]
async fn test_unreported_step_times_out_without_exit_code() {
    let mut config = fast_config();
    config.orchestrator.step_timeout_ms = 200;
    let harness = TestHarness::start_with(config).await;
    let agent = harness.online_agent("silent").await;
    let task = harness
        .task_with_steps(&[(agent.id, "sleep 60"), (agent.id, "true")])
        .await;

    let started = harness
        .service
        .run_task(&task.id.to_string())
        .await
        .unwrap();
    let claimed = harness.next_step(agent.id).await;

    let execution = harness.wait_for_execution(started.execution_id).await;
    assert_eq!(execution.status, RunStatus::Failed);
    assert_eq!(execution.steps.len(), 1);
    assert_eq!(execution.steps[0].id, claimed.step_id);
    assert_eq!(execution.steps[0].status, RunStatus::Failed);
    assert_eq!(execution.steps[0].exit_code, None);

    // a late report is accepted but changes nothing
    let late = harness.report(claimed.step_id, 0, "finally").await;
    assert_eq!(late.status, ReportOutcome::Ignored);
    let step = harness.store.get_step(claimed.step_id).await.unwrap();
    assert_eq!(step.status, RunStatus::Failed);
    assert_eq!(step.output, "");
    harness.stop().await;
}

#[tokio::test]
async fn test_unclaimed_step_times_out_and_is_never_dispatched() {
    let mut config = fast_config();
    config.orchestrator.step_timeout_ms = 150;
    let harness = TestHarness::start_with(config).await;
    let agent = harness.online_agent("busy").await;
    let task = harness.task_with_steps(&[(agent.id, "true")]).await;

    let started = harness
        .service
        .run_task(&task.id.to_string())
        .await
        .unwrap();
    let execution = harness.wait_for_execution(started.execution_id).await;
    assert_eq!(execution.status, RunStatus::Failed);
    assert_eq!(execution.steps[0].exit_code, None);

    let poll = harness
        .service
        .poll_task(&agent.id.to_string())
        .await
        .unwrap();
    assert!(!poll.has_task);
    harness.stop().await;
}

#[tokio::test]
async fn test_duplicate_report_leaves_result_unchanged() {
    let harness = TestHarness::start().await;
    let agent = harness.online_agent("worker").await;
    let task = harness.task_with_steps(&[(agent.id, "echo ok")]).await;
    let started = harness
        .service
        .run_task(&task.id.to_string())
        .await
        .unwrap();

    let step = harness.next_step(agent.id).await;
    let first = harness.report(step.step_id, 0, "ok").await;
    let second = harness.report(step.step_id, 1, "different").await;
    assert_eq!(first.status, ReportOutcome::Updated);
    assert_eq!(second.status, ReportOutcome::Ignored);

    let stored = harness.store.get_step(step.step_id).await.unwrap();
    assert_eq!(stored.status, RunStatus::Success);
    assert_eq!(stored.exit_code, Some(0));
    assert_eq!(stored.output, "ok");

    let execution = harness.wait_for_execution(started.execution_id).await;
    assert_eq!(execution.status, RunStatus::Success);
    harness.stop().await;
}

#[tokio::test]
async fn test_independent_executions_progress_concurrently() {
    let harness = TestHarness::start().await;
    let a = harness.online_agent("a").await;
    let b = harness.online_agent("b").await;
    let slow = harness.task_with_steps(&[(a.id, "sleep 1")]).await;
    let fast = harness.task_with_steps(&[(b.id, "true")]).await;

    let slow_run = harness.service.run_task(&slow.id.to_string()).await.unwrap();
    let fast_run = harness.service.run_task(&fast.id.to_string()).await.unwrap();

    // agent a holds its step; b's execution still completes
    let _held = harness.next_step(a.id).await;
    let step = harness.next_step(b.id).await;
    harness.report(step.step_id, 0, "").await;

    let finished = harness.wait_for_execution(fast_run.execution_id).await;
    assert_eq!(finished.status, RunStatus::Success);
    let still_running = harness
        .store
        .get_execution(slow_run.execution_id)
        .await
        .unwrap();
    assert_eq!(still_running.status, RunStatus::Running);
    harness.stop().await;
}

#[tokio::test]
async fn test_recovery_resumes_after_last_successful_step() {
    let store = Arc::new(InMemoryStateStore::new());
    let first = TestHarness::start_on(store.clone(), fast_config()).await;
    let agent = first.online_agent("worker").await;
    let task = first
        .task_with_steps(&[(agent.id, "step-0"), (agent.id, "step-1")])
        .await;
    first.stop().await;

    // Simulate a process that died after step 0 succeeded
    let execution = store.create_execution(task.id).await.unwrap();
    let step0 = store
        .create_step(NewStepExecution {
            execution_id: execution.id,
            step_index: 0,
            agent_id: agent.id,
            path: String::new(),
            command: "step-0".into(),
        })
        .await
        .unwrap();
    store.claim_pending_steps(agent.id, 1).await.unwrap();
    store.start_step(step0.id).await.unwrap();
    store
        .complete_step(plumber_core::models::StepCompletion {
            step_id: step0.id,
            status: RunStatus::Success,
            exit_code: 0,
            output: String::new(),
        })
        .await
        .unwrap();

    let second = TestHarness::start_on(store.clone(), fast_config()).await;
    assert!(second
        .system
        .orchestrator()
        .active_executions()
        .contains(&execution.id));

    let next = second.next_step(agent.id).await;
    assert_eq!(next.command, "step-1");
    second.report(next.step_id, 0, "").await;

    let finished = second.wait_for_execution(execution.id).await;
    assert_eq!(finished.status, RunStatus::Success);
    assert_eq!(finished.steps.len(), 2);
    second.stop().await;
}

#[tokio::test]
async fn test_recovery_waits_again_for_running_step() {
    let store = Arc::new(InMemoryStateStore::new());
    let first = TestHarness::start_on(store.clone(), fast_config()).await;
    let agent = first.online_agent("worker").await;
    let task = first.task_with_steps(&[(agent.id, "long")]).await;
    let started = first.service.run_task(&task.id.to_string()).await.unwrap();
    let in_flight = first.next_step(agent.id).await;
    first.stop().await;

    let interrupted = store.get_execution(started.execution_id).await.unwrap();
    assert_eq!(interrupted.status, RunStatus::Running);

    let second = TestHarness::start_on(store.clone(), fast_config()).await;
    second.report(in_flight.step_id, 0, "done").await;

    let finished = second.wait_for_execution(started.execution_id).await;
    assert_eq!(finished.status, RunStatus::Success);
    assert_eq!(finished.steps.len(), 1);
    second.stop().await;
}

#[tokio::test]
async fn test_recovery_finalizes_execution_with_failed_step() {
    let store = Arc::new(InMemoryStateStore::new());
    let first = TestHarness::start_on(store.clone(), fast_config()).await;
    let agent = first.online_agent("worker").await;
    let task = first
        .task_with_steps(&[(agent.id, "bad"), (agent.id, "never")])
        .await;
    first.stop().await;

    let execution = store.create_execution(task.id).await.unwrap();
    let step0 = store
        .create_step(NewStepExecution {
            execution_id: execution.id,
            step_index: 0,
            agent_id: agent.id,
            path: String::new(),
            command: "bad".into(),
        })
        .await
        .unwrap();
    store.fail_unfinished_step(step0.id).await.unwrap();

    let second = TestHarness::start_on(store.clone(), fast_config()).await;
    let finished = second.wait_for_execution(execution.id).await;
    assert_eq!(finished.status, RunStatus::Failed);
    assert_eq!(finished.steps.len(), 1);
    second.stop().await;
}

#[tokio::test]
async fn test_recovery_disabled_leaves_execution_running() {
    let store = Arc::new(InMemoryStateStore::new());
    let mut config = fast_config();
    config.orchestrator.recover_on_startup = false;
    let harness = TestHarness::start_on(store.clone(), config).await;
    let agent = harness.online_agent("worker").await;
    let task = harness.task_with_steps(&[(agent.id, "true")]).await;
    let execution = store.create_execution(task.id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let stored = store.get_execution(execution.id).await.unwrap();
    assert_eq!(stored.status, RunStatus::Running);
    assert!(harness.system.orchestrator().active_executions().is_empty());
    harness.stop().await;
}
