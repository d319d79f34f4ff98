//! Concurrent workflow runner that executes independent branches as Tokio
//! tasks while streaming lifecycle events.
//!
//! Scheduling follows the same dependency order as [`Driver::run_all`]; a step
//! starts once all of its dependencies have succeeded and a slot among
//! `max_parallel_steps` is free. Create-or-replace statements for the same
//! resource name are serialized through the driver's resource locks.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use propensity_types::workflow::{RunEvent, RunStatus};
use tokio::task::{Id as TaskId, JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::driver::{Driver, send_event};
use crate::error::DriverError;
use crate::executor::step_once::{StepContext, StepFailure, execute_step};
use crate::executor::types::StepRecord;
use crate::model::StepDefinition;

impl Driver {
    /// Run every registered step once, executing independent steps concurrently.
    ///
    /// On the first failure no new steps are scheduled; steps already in
    /// flight finish and are recorded, and the unscheduled remainder is marked
    /// `SKIPPED`. The first error is returned.
    pub async fn run_all_concurrent(&mut self) -> Result<Vec<StepRecord>, DriverError> {
        let order: Vec<StepDefinition> = self.workflow.execution_order()?.into_iter().cloned().collect();
        self.ensure_dataset().await?;

        let first_record = self.history.len();
        let max_parallel = self.config.max_parallel_steps.max(1);
        self.emit(RunEvent::RunStarted {
            at: Utc::now(),
            step_count: order.len(),
        });
        info!(steps = order.len(), max_parallel, "concurrent workflow execution started");

        let position: HashMap<&str, usize> = order.iter().enumerate().map(|(index, step)| (step.name.as_str(), index)).collect();
        let mut remaining_dependencies: Vec<usize> = Vec::with_capacity(order.len());
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); order.len()];
        for (index, step) in order.iter().enumerate() {
            let dependencies = step.all_dependencies()?;
            for dependency in &dependencies {
                if let Some(&parent) = position.get(dependency.as_str()) {
                    dependents[parent].push(index);
                }
            }
            remaining_dependencies.push(dependencies.len());
        }

        let mut ready: BTreeSet<usize> = (0..order.len()).filter(|index| remaining_dependencies[*index] == 0).collect();
        let mut scheduled = vec![false; order.len()];
        let mut in_flight: HashMap<TaskId, usize> = HashMap::new();
        let mut tasks = JoinSet::new();
        let mut first_error: Option<DriverError> = None;

        loop {
            while first_error.is_none() && tasks.len() < max_parallel {
                let Some(index) = ready.pop_first() else {
                    break;
                };
                scheduled[index] = true;
                let step = order[index].clone();
                self.mark_started(&step.name);

                let warehouse = Arc::clone(&self.warehouse);
                let config = self.config.clone();
                let resources = self.resources.step_names();
                let locks = self.locks.clone();
                let cancel = self.cancel.clone();
                let events = self.events.clone();

                let handle = tasks.spawn(async move {
                    let started = Instant::now();
                    let step_id = step.name.clone();
                    let on_poll = move |attempt| send_event(events.as_ref(), RunEvent::StepPolled { step_id: step_id.clone(), attempt });
                    let context = StepContext {
                        warehouse: warehouse.as_ref(),
                        config: &config,
                        resources: &resources,
                        locks: &locks,
                        cancel: &cancel,
                    };
                    let result = execute_step(&step, context, on_poll).await;
                    (result, started.elapsed())
                });
                in_flight.insert(handle.id(), index);
            }

            let Some(joined) = tasks.join_next_with_id().await else {
                break;
            };
            let (index, result, elapsed) = match joined {
                Ok((task_id, (result, elapsed))) => (in_flight.remove(&task_id), result, elapsed),
                Err(join_error) => {
                    let index = in_flight.remove(&join_error.id());
                    let step = index.map(|index| order[index].name.clone()).unwrap_or_default();
                    (index, Err(aborted_task_failure(step, &join_error)), Default::default())
                }
            };
            let Some(index) = index else {
                continue;
            };

            match self.finish_step(&order[index].name, result, elapsed) {
                Ok(_) => {
                    for &dependent in &dependents[index] {
                        remaining_dependencies[dependent] = remaining_dependencies[dependent].saturating_sub(1);
                        if remaining_dependencies[dependent] == 0 {
                            ready.insert(dependent);
                        }
                    }
                }
                Err(error) => {
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
        }

        let unscheduled: Vec<&StepDefinition> = order.iter().enumerate().filter(|(index, _)| !scheduled[*index]).map(|(_, step)| step).collect();
        self.skip_steps(unscheduled);

        match first_error {
            Some(error) => {
                self.complete_run(if error.is_cancelled() { RunStatus::Cancelled } else { RunStatus::Failed });
                Err(error)
            }
            None => {
                self.complete_run(RunStatus::Succeeded);
                Ok(self.history[first_record..].to_vec())
            }
        }
    }
}

fn aborted_task_failure(step: String, join_error: &JoinError) -> StepFailure {
    warn!(step_id = %step, error = %join_error, "step task stopped");
    let detail = if join_error.is_panic() { "the step task panicked" } else { "the step task was aborted" };
    StepFailure::from(DriverError::TaskAborted {
        step,
        detail: detail.to_string(),
    })
}
