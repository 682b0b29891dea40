mod common;

use plumber_core::models::{NewAgent, NewStepExecution, NewTask, StepCompletion, TaskConfig};
use plumber_core::state_machine::RunStatus;
use plumber_core::store::{InMemoryStateStore, StateStore};
use proptest::prelude::*;
use std::collections::HashSet;
use uuid::Uuid;

#[derive(Debug, Clone)]
enum Action {
    /// Poll as agent 0 or 1
    Claim(usize),
    /// Finish the lowest running step
    Complete { success: bool },
    /// Abandon the lowest unfinished step
    Expire,
}

fn action_strategy() -> impl Strategy<Value = Action> {
    prop_oneof![
        4 => (0usize..2).prop_map(Action::Claim),
        3 => any::<bool>().prop_map(|success| Action::Complete { success }),
        1 => Just(Action::Expire),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Drive one execution through `actions` and check every dispatched step
/// was eligible at the moment it was handed out.
async fn check_dispatch_order(step_agents: Vec<usize>, actions: Vec<Action>) -> Result<(), String> {
    let store = InMemoryStateStore::new();
    let agents = [
        store.create_agent(NewAgent::named("a0")).await.unwrap().id,
        store.create_agent(NewAgent::named("a1")).await.unwrap().id,
    ];
    let task = store.create_task(NewTask::default()).await.unwrap();
    let execution = store.create_execution(task.id).await.unwrap();
    for (index, agent) in step_agents.iter().enumerate() {
        store
            .create_step(NewStepExecution {
                execution_id: execution.id,
                step_index: index as i32,
                agent_id: agents[*agent],
                path: String::new(),
                command: format!("step-{index}"),
            })
            .await
            .unwrap();
    }

    let mut dispatched: HashSet<Uuid> = HashSet::new();
    for action in actions {
        let steps = store.list_steps(execution.id).await.unwrap();
        match action {
            Action::Claim(agent) => {
                let claimed = store.claim_pending_steps(agents[agent], 2).await.unwrap();
                if claimed.len() > 1 {
                    return Err(format!("{} steps of one execution eligible at once", claimed.len()));
                }
                for step in claimed {
                    if step.agent_id != agents[agent] {
                        return Err(format!("step {} handed to the wrong agent", step.step_index));
                    }
                    if !dispatched.insert(step.id) {
                        return Err(format!("step {} dispatched twice", step.step_index));
                    }
                    let blocked = steps
                        .iter()
                        .filter(|s| s.step_index < step.step_index)
                        .find(|s| s.status != RunStatus::Success);
                    if let Some(blocker) = blocked {
                        return Err(format!(
                            "step {} dispatched while step {} was {}",
                            step.step_index, blocker.step_index, blocker.status
                        ));
                    }
                    store.start_step(step.id).await.unwrap();
                }
            }
            Action::Complete { success } => {
                if let Some(running) = steps.iter().find(|s| s.status == RunStatus::Running) {
                    store
                        .complete_step(StepCompletion {
                            step_id: running.id,
                            status: if success { RunStatus::Success } else { RunStatus::Failed },
                            exit_code: if success { 0 } else { 1 },
                            output: String::new(),
                        })
                        .await
                        .unwrap();
                }
            }
            Action::Expire => {
                if let Some(open) = steps.iter().find(|s| s.status.is_unfinished()) {
                    let expired = store.fail_unfinished_step(open.id).await.unwrap();
                    if expired.as_ref().map(|s| s.assigned) != Some(true) {
                        return Err("expired step left dispatchable".to_string());
                    }
                }
            }
        }
    }
    Ok(())
}

proptest! {
    /// Property: a step is only dispatched after every earlier step succeeded,
    /// and never more than once
    #[test]
    fn dispatch_respects_step_order(
        step_agents in prop::collection::vec(0usize..2, 1..6),
        actions in prop::collection::vec(action_strategy(), 0..40),
    ) {
        let outcome = runtime().block_on(check_dispatch_order(step_agents, actions));
        prop_assert!(outcome.is_ok(), "{}", outcome.unwrap_err());
    }

    /// Property: every `[[step]]` table becomes one step, in document order
    #[test]
    fn toml_step_lists_keep_their_order(commands in prop::collection::vec("[a-z][a-z0-9 _-]{0,20}", 1..8)) {
        let agent_id = Uuid::new_v4();
        let document: String = commands
            .iter()
            .map(|command| common::step_toml(agent_id, "/srv", command))
            .collect();

        let config = TaskConfig::parse(&document).unwrap();
        prop_assert_eq!(config.steps.len(), commands.len());
        for (step, command) in config.steps.iter().zip(&commands) {
            prop_assert_eq!(step.agent_id, agent_id);
            prop_assert_eq!(&step.command, command);
            prop_assert_eq!(step.path.as_str(), "/srv");
        }
    }
}
