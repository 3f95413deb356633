use std::collections::HashSet;

use tracing::{error, info};

use crate::{
    runner::{LaunchOptions, ObservedContainer, Runner, RunnerError},
    schedule::{NetworkMode, Schedule, Task},
};

/// One step needed to move the runtime toward the schedule.
#[derive(Debug, PartialEq)]
pub enum Action {
    Stop { container_id: String },
    Start { task: Task },
}

/// Computes the minimal action set that converges the observed containers
/// to the schedule. All stops are ordered before any start: pruning first
/// bounds resource usage and frees the task-derived container name before
/// a restarted task reclaims it.
///
/// The observed list is already scoped to managed containers; bearing the
/// managed label is sufficient grounds to be stopped here, whether the
/// task-id label is missing, stale, or from an older schedule.
pub fn plan(schedule: &Schedule, observed: &[ObservedContainer]) -> Vec<Action> {
    let desired: HashSet<&str> = schedule
        .containers
        .iter()
        .map(|task| task.id.as_str())
        .collect();

    let mut actions = Vec::new();
    let mut satisfied = HashSet::new();

    for container in observed {
        match container
            .task_id
            .as_deref()
            .filter(|task_id| desired.contains(task_id))
        {
            // Any matching container satisfies the task, including the
            // transient case of two containers carrying the same task id
            // during a restart race. Never double-start.
            Some(task_id) => {
                satisfied.insert(task_id.to_owned());
            }
            None => actions.push(Action::Stop {
                container_id: container.id.clone(),
            }),
        }
    }

    for task in schedule.containers.iter() {
        if !satisfied.contains(task.id.as_str()) {
            actions.push(Action::Start { task: task.clone() });
        }
    }

    actions
}

/// Applies schedules to the runtime, one tick at a time. Failures are
/// fail-soft per task: no single task's error aborts the rest of the tick,
/// and everything is retried on the next tick.
pub struct Reconciler {
    runner: Runner,
    /// Host-side runtime socket path, handed to tasks that bind-mount the
    /// control socket.
    host_socket: String,
}

impl Reconciler {
    pub fn new(runner: Runner, host_socket: String) -> Self {
        Self {
            runner,
            host_socket,
        }
    }

    /// One fetch-free reconciliation pass: list, plan, apply. Only a
    /// failure to list observed containers aborts the pass; there is
    /// nothing safe to reconcile against without it.
    #[tracing::instrument(name = "Reconciler::reconcile", skip_all, fields(
        schedule_id = %schedule.id
    ))]
    pub async fn reconcile(&self, schedule: &Schedule) -> Result<(), RunnerError> {
        let observed = self.runner.list_managed().await?;

        let actions = plan(schedule, &observed);

        info!(
            observed = observed.len(),
            actions = actions.len(),
            "applying reconciliation actions"
        );

        for action in actions {
            match action {
                Action::Stop { container_id } => {
                    info!(%container_id, "stopping container");

                    // Best effort. A failed stop must not block starts.
                    if let Err(error) = self.runner.kill(&container_id).await {
                        error!(?error, %container_id, "unable to stop container");
                    }
                }
                Action::Start { task } => {
                    if let Err(error) = self.start_task(&task, &schedule.id).await {
                        error!(?error, task_id = %task.id, "unable to start task");
                    }
                }
            }
        }

        Ok(())
    }

    /// Pull, then create and start, then attach logs: sequential for one
    /// task, independent across tasks.
    #[tracing::instrument(name = "Reconciler::start_task", skip_all, fields(
        task_id = %task.id,
        task_name = %task.name
    ))]
    async fn start_task(&self, task: &Task, schedule_id: &str) -> Result<(), RunnerError> {
        self.runner.pull_image(&task.container_image).await?;

        let opts = LaunchOptions {
            bind_docker_socket: task.bind_docker_socket,
            network_mode_host: task.network_mode == NetworkMode::Host,
            network_mode_container: None,
            docker_socket_override: Some(self.host_socket.clone()),
        };

        let container_id = self.runner.start_task(task, schedule_id, &opts).await?;

        info!(task_id = %task.id, %container_id, "task started");

        Ok(())
    }
}
