//! Executes one step: render, submit, wait for the job if any, interpret the result.

use std::collections::HashMap;

use propensity_types::workflow::CancelReason;
use propensity_types::{RemoteError, ResourceHandle, StatementRequest, Submission};
use propensity_util::redact_sensitive;
use propensity_warehouse::Warehouse;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DriverConfig;
use crate::error::DriverError;
use crate::executor::poll::{PollFailure, PollSettings, await_job};
use crate::executor::resources::ResourceLocks;
use crate::executor::statement::{StatementScope, prepare_statement};
use crate::executor::types::{EvaluationMetrics, StepOutput};
use crate::identifier::ResourceName;
use crate::model::{StepDefinition, StepKind};

/// Everything a single step execution borrows from its driver.
pub struct StepContext<'a> {
    pub warehouse: &'a dyn Warehouse,
    pub config: &'a DriverConfig,
    /// Step id to resource name for resources created so far
    pub resources: &'a HashMap<String, ResourceName>,
    pub locks: &'a ResourceLocks,
    pub cancel: &'a CancellationToken,
}

/// Successful step execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedStep {
    pub output: StepOutput,
    pub sql: String,
    pub polls: u32,
    /// Resource created or replaced by the step
    pub created: Option<(ResourceName, ResourceHandle)>,
}

/// Failed step execution with whatever was learned before failing.
#[derive(Debug, Clone, PartialEq)]
pub struct StepFailure {
    pub error: DriverError,
    pub polls: u32,
}

impl From<DriverError> for StepFailure {
    fn from(error: DriverError) -> Self {
        Self { error, polls: 0 }
    }
}

/// Execute `step` once.
///
/// Nothing is submitted when rendering fails. Create-or-replace statements hold
/// the resource's write lock until the resource exists (or the attempt ends).
/// `on_poll` observes each status check made while waiting for a job.
pub async fn execute_step<F>(step: &StepDefinition, context: StepContext<'_>, on_poll: F) -> Result<ExecutedStep, StepFailure>
where
    F: FnMut(u32) + Send,
{
    if context.cancel.is_cancelled() {
        return Err(cancelled(step, CancelReason::Requested).into());
    }

    let prepared = prepare_statement(
        step,
        StatementScope {
            config: context.config,
            resources: context.resources,
        },
    )?;
    debug!(step_id = %step.name, sql = %redact_sensitive(&prepared.sql), "prepared statement");

    let _guard = match &prepared.resource_name {
        Some(name) => Some(tokio::select! {
            _ = context.cancel.cancelled() => return Err(cancelled(step, CancelReason::Requested).into()),
            guard = context.locks.acquire(name) => guard,
        }),
        None => None,
    };

    let request = prepared.request();
    let submission = submit(step, &request, &context).await?;

    let (output, polls) = match submission {
        Submission::Job(job) => {
            let settings = PollSettings {
                interval: context.config.poll_interval,
                max_wait: context.config.max_wait,
            };
            let polls = match await_job(&step.name, &job, context.warehouse, settings, context.cancel, on_poll).await {
                Ok(polls) => polls,
                Err(PollFailure::Failed { message, polls }) => {
                    let error = match step.kind {
                        StepKind::TrainModel { .. } => DriverError::TrainingFailed {
                            step: step.name.clone(),
                            message,
                            sql: request.sql.clone(),
                        },
                        _ => DriverError::RemoteExecution {
                            step: step.name.clone(),
                            message,
                            sql: request.sql.clone(),
                            retryable: false,
                        },
                    };
                    return Err(StepFailure { error, polls });
                }
                Err(PollFailure::Cancelled { reason, polls }) => {
                    return Err(StepFailure {
                        error: cancelled(step, reason),
                        polls,
                    });
                }
                Err(PollFailure::Remote(remote)) => {
                    return Err(remote_failure(step, &request.sql, remote).into());
                }
            };
            (created_output(step, prepared.resource.as_ref(), "a job")?, polls)
        }
        Submission::Resource(handle) => match step.kind {
            StepKind::CreateView | StepKind::TrainModel { .. } => (created_output(step, Some(&handle), "a resource")?, 0),
            _ => return Err(malformed(step, "the warehouse reported a created resource for a statement that returns rows").into()),
        },
        Submission::Rows(rows) => {
            let output = match &step.kind {
                StepKind::Query => StepOutput::Rows(rows),
                StepKind::Predict { .. } => StepOutput::Predictions(rows),
                StepKind::Evaluate { .. } => StepOutput::Metrics(EvaluationMetrics::from_rows(&rows).map_err(|detail| malformed(step, &detail))?),
                // DDL answered synchronously with an empty result.
                StepKind::CreateView | StepKind::TrainModel { .. } => created_output(step, prepared.resource.as_ref(), "rows")?,
            };
            (output, 0)
        }
    };

    info!(step_id = %step.name, polls, "step succeeded");
    let created = prepared.resource_name.zip(prepared.resource);
    Ok(ExecutedStep {
        output,
        sql: request.sql,
        polls,
        created,
    })
}

/// Submit, resubmitting after retryable failures when configured. Training
/// statements are never resubmitted.
async fn submit(step: &StepDefinition, request: &StatementRequest, context: &StepContext<'_>) -> Result<Submission, DriverError> {
    let max_retries = match step.kind {
        StepKind::TrainModel { .. } => 0,
        _ => context.config.max_transient_retries,
    };
    let mut retries = 0u32;

    loop {
        let result = tokio::select! {
            _ = context.cancel.cancelled() => return Err(cancelled(step, CancelReason::Requested)),
            result = context.warehouse.execute(request) => result,
        };
        match result {
            Ok(submission) => return Ok(submission),
            Err(error) if error.retryable && retries < max_retries => {
                retries += 1;
                warn!(step_id = %step.name, retries, %error, "transient failure; resubmitting");
                tokio::select! {
                    _ = context.cancel.cancelled() => return Err(cancelled(step, CancelReason::Requested)),
                    _ = sleep(context.config.poll_interval) => {}
                }
            }
            Err(error) => return Err(remote_failure(step, &request.sql, error)),
        }
    }
}

fn created_output(step: &StepDefinition, handle: Option<&ResourceHandle>, answer: &str) -> Result<StepOutput, DriverError> {
    match (&step.kind, handle) {
        (StepKind::CreateView, Some(handle)) => Ok(StepOutput::View(handle.clone())),
        (StepKind::TrainModel { .. }, Some(handle)) => Ok(StepOutput::Model(handle.clone())),
        _ => Err(malformed(step, &format!("the warehouse answered with {answer}, which this step cannot use"))),
    }
}

fn remote_failure(step: &StepDefinition, sql: &str, error: RemoteError) -> DriverError {
    warn!(step_id = %step.name, error = %error, "statement failed");
    DriverError::RemoteExecution {
        step: step.name.clone(),
        message: error.message,
        sql: sql.to_string(),
        retryable: error.retryable,
    }
}

fn cancelled(step: &StepDefinition, reason: CancelReason) -> DriverError {
    DriverError::Cancelled {
        step: step.name.clone(),
        reason,
    }
}

fn malformed(step: &StepDefinition, detail: &str) -> DriverError {
    DriverError::MalformedResult {
        step: step.name.clone(),
        detail: detail.to_string(),
    }
}
