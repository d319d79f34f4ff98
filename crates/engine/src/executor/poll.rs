//! Poll loop for long-running warehouse jobs.

use std::time::Duration;

use propensity_types::workflow::CancelReason;
use propensity_types::{JobHandle, JobState, RemoteError};
use propensity_warehouse::Warehouse;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Timing limits for a single poll loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_wait: Option<Duration>,
}

/// Why a poll loop stopped without the job succeeding.
#[derive(Debug, Clone, PartialEq)]
pub enum PollFailure {
    /// The job reached `FAILED`.
    Failed { message: String, polls: u32 },
    /// The loop was abandoned; the remote job was asked to cancel.
    Cancelled { reason: CancelReason, polls: u32 },
    /// A status check failed with a non-retryable error.
    Remote(RemoteError),
}

/// Check `job` every `settings.interval` until it succeeds, fails, the token
/// is cancelled, or `settings.max_wait` elapses. Returns the number of status
/// checks made.
///
/// `on_poll` is called after every status check with the running count.
/// Status checks that fail with a retryable error are logged and retried on
/// the next tick; they count towards `max_wait`.
pub async fn await_job<F>(
    step_id: &str,
    job: &JobHandle,
    warehouse: &dyn Warehouse,
    settings: PollSettings,
    cancel: &CancellationToken,
    mut on_poll: F,
) -> Result<u32, PollFailure>
where
    F: FnMut(u32) + Send,
{
    let started = Instant::now();
    // A bound too far out to represent as an instant is treated as unbounded.
    let deadline = settings.max_wait.and_then(|max_wait| started.checked_add(max_wait));
    let mut polls = 0u32;

    info!(step_id, job_id = %job.job_id, "waiting for job");

    loop {
        let state = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(abandon(step_id, job, warehouse, CancelReason::Requested, polls).await);
            }
            state = warehouse.job_status(job) => state,
        };
        polls += 1;
        on_poll(polls);

        match state {
            Ok(JobState::Succeeded) => {
                info!(step_id, job_id = %job.job_id, polls, "job succeeded");
                return Ok(polls);
            }
            Ok(JobState::Failed { message }) => {
                warn!(step_id, job_id = %job.job_id, polls, "job failed");
                return Err(PollFailure::Failed { message, polls });
            }
            Ok(state) => debug!(step_id, job_id = %job.job_id, polls, ?state, "job still running"),
            Err(error) if error.retryable => warn!(step_id, job_id = %job.job_id, polls, %error, "status check failed; will retry"),
            Err(error) => return Err(PollFailure::Remote(error)),
        }

        let mut wait = settings.interval;
        if let Some(deadline) = deadline {
            let now = Instant::now();
            if now >= deadline {
                return Err(abandon(step_id, job, warehouse, CancelReason::MaxWaitExceeded, polls).await);
            }
            wait = wait.min(deadline - now);
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(abandon(step_id, job, warehouse, CancelReason::Requested, polls).await);
            }
            _ = sleep(wait) => {}
        }
    }
}

async fn abandon(step_id: &str, job: &JobHandle, warehouse: &dyn Warehouse, reason: CancelReason, polls: u32) -> PollFailure {
    warn!(step_id, job_id = %job.job_id, polls, %reason, "abandoning job");
    if let Err(error) = warehouse.cancel_job(job).await {
        warn!(step_id, job_id = %job.job_id, %error, "remote cancel request failed");
    }
    PollFailure::Cancelled { reason, polls }
}
