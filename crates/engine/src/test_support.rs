//! Scripted in-memory warehouse used by the engine's tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use propensity_types::{DatasetRef, JobHandle, JobState, RemoteError, ResourceKind, RowSet, StatementRequest, Submission};
use propensity_warehouse::Warehouse;

struct ScriptedFailure {
    needle: String,
    error: RemoteError,
    remaining: Option<u32>,
}

#[derive(Default)]
struct ScriptState {
    submitted: Vec<StatementRequest>,
    datasets: Vec<DatasetRef>,
    rows: Vec<(String, RowSet)>,
    failures: Vec<ScriptedFailure>,
    training: Vec<(String, Vec<JobState>)>,
    job_states: HashMap<String, VecDeque<JobState>>,
    status_errors: HashMap<String, VecDeque<RemoteError>>,
    jobs_created: u32,
    cancelled: Vec<String>,
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
}

/// Warehouse double whose answers are matched on substrings of the submitted SQL.
///
/// Queries without a scripted answer return no rows, views are created
/// immediately, and model statements return a job that succeeds on its first
/// status check unless training states were scripted.
#[derive(Default)]
pub(crate) struct ScriptedWarehouse {
    state: Mutex<ScriptState>,
    latency: Duration,
}

impl ScriptedWarehouse {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Return `rows` for statements containing `needle`.
    pub(crate) fn with_rows(self, needle: &str, rows: RowSet) -> Self {
        self.lock().rows.push((needle.to_string(), rows));
        self
    }

    /// Reject every statement containing `needle`.
    pub(crate) fn failing(self, needle: &str, error: RemoteError) -> Self {
        self.lock().failures.push(ScriptedFailure {
            needle: needle.to_string(),
            error,
            remaining: None,
        });
        self
    }

    /// Reject the next `times` statements containing `needle`.
    pub(crate) fn failing_times(self, needle: &str, error: RemoteError, times: u32) -> Self {
        self.lock().failures.push(ScriptedFailure {
            needle: needle.to_string(),
            error,
            remaining: Some(times),
        });
        self
    }

    /// Status sequence for jobs created by model statements containing `needle`.
    pub(crate) fn with_training_states(self, needle: &str, states: Vec<JobState>) -> Self {
        self.lock().training.push((needle.to_string(), states));
        self
    }

    /// Status sequence for a known job id. The last state repeats.
    pub(crate) fn with_job_states(self, job_id: &str, states: Vec<JobState>) -> Self {
        self.lock().job_states.insert(job_id.to_string(), states.into());
        self
    }

    /// Errors returned by status checks of `job_id` before its states.
    pub(crate) fn with_status_errors(self, job_id: &str, errors: Vec<RemoteError>) -> Self {
        self.lock().status_errors.insert(job_id.to_string(), errors.into());
        self
    }

    /// Time each create-or-replace statement takes.
    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub(crate) fn submitted_sql(&self) -> Vec<String> {
        self.lock().submitted.iter().map(|request| request.sql.clone()).collect()
    }

    pub(crate) fn datasets(&self) -> Vec<DatasetRef> {
        self.lock().datasets.clone()
    }

    pub(crate) fn cancelled_jobs(&self) -> Vec<String> {
        self.lock().cancelled.clone()
    }

    /// Highest number of simultaneous statements observed for a resource name.
    pub(crate) fn max_concurrent(&self, resource: &str) -> usize {
        self.lock().max_in_flight.get(resource).copied().unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().expect("script state lock")
    }
}

#[async_trait]
impl Warehouse for ScriptedWarehouse {
    async fn ensure_dataset(&self, dataset: &DatasetRef) -> Result<(), RemoteError> {
        self.lock().datasets.push(dataset.clone());
        Ok(())
    }

    async fn execute(&self, request: &StatementRequest) -> Result<Submission, RemoteError> {
        {
            let mut state = self.lock();
            state.submitted.push(request.clone());
            for failure in state.failures.iter_mut() {
                if !request.sql.contains(&failure.needle) {
                    continue;
                }
                match failure.remaining {
                    None => return Err(failure.error.clone()),
                    Some(0) => {}
                    Some(remaining) => {
                        failure.remaining = Some(remaining - 1);
                        return Err(failure.error.clone());
                    }
                }
            }
        }

        let Some(resource) = &request.resource else {
            let state = self.lock();
            let rows = state
                .rows
                .iter()
                .find(|(needle, _)| request.sql.contains(needle.as_str()))
                .map(|(_, rows)| rows.clone())
                .unwrap_or_default();
            return Ok(Submission::Rows(rows));
        };

        {
            let mut state = self.lock();
            let active = state.in_flight.entry(resource.name.clone()).or_default();
            *active += 1;
            let active = *active;
            let peak = state.max_in_flight.entry(resource.name.clone()).or_default();
            *peak = (*peak).max(active);
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut state = self.lock();
        if let Some(active) = state.in_flight.get_mut(&resource.name) {
            *active -= 1;
        }

        match resource.kind {
            ResourceKind::View => Ok(Submission::Resource(resource.clone())),
            ResourceKind::Model(_) => {
                state.jobs_created += 1;
                let job_id = format!("job_{}", state.jobs_created);
                let states = state
                    .training
                    .iter()
                    .find(|(needle, _)| request.sql.contains(needle.as_str()))
                    .map(|(_, states)| states.clone())
                    .unwrap_or_else(|| vec![JobState::Succeeded]);
                state.job_states.insert(job_id.clone(), states.into());
                Ok(Submission::Job(JobHandle { job_id, location: None }))
            }
        }
    }

    async fn job_status(&self, job: &JobHandle) -> Result<JobState, RemoteError> {
        let mut state = self.lock();
        if let Some(error) = state.status_errors.get_mut(&job.job_id).and_then(VecDeque::pop_front) {
            return Err(error);
        }
        let Some(states) = state.job_states.get_mut(&job.job_id) else {
            return Err(RemoteError::new(format!("Not found: Job {}", job.job_id)));
        };
        if states.len() > 1 {
            Ok(states.pop_front().unwrap_or(JobState::Running))
        } else {
            Ok(states.front().cloned().unwrap_or(JobState::Running))
        }
    }

    async fn cancel_job(&self, job: &JobHandle) -> Result<(), RemoteError> {
        self.lock().cancelled.push(job.job_id.clone());
        Ok(())
    }
}
