//! Run lifecycle vocabulary shared by the engine and its front ends.
//!
//! The engine emits [`RunEvent`]s while it drives a workflow; the CLI renders
//! them as they arrive. Statuses mirror the remote job lifecycle with the
//! addition of `Cancelled`, which is reserved for locally abandoned waits.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Final (or current) status of a workflow step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Registered but not executed in this session.
    Pending,
    /// Submission issued; waiting on the warehouse.
    Running,
    /// Step finished and its outputs are recorded.
    Succeeded,
    /// Remote or local failure; halts `run_all`.
    Failed,
    /// Wait abandoned locally (explicit cancel or max wait). Eligible for re-run.
    Cancelled,
    /// Not attempted because the run halted before reaching it.
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "PENDING",
            StepStatus::Running => "RUNNING",
            StepStatus::Succeeded => "SUCCEEDED",
            StepStatus::Failed => "FAILED",
            StepStatus::Cancelled => "CANCELLED",
            StepStatus::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a wait on a remote job was abandoned.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The caller cancelled the run.
    Requested,
    /// The configured maximum wait elapsed before a terminal status.
    MaxWaitExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Requested => f.write_str("cancellation requested"),
            CancelReason::MaxWaitExceeded => f.write_str("maximum wait exceeded"),
        }
    }
}

/// Aggregate status of a whole run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// Lifecycle events emitted while a workflow run progresses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        at: DateTime<Utc>,
        step_count: usize,
    },
    StepStarted {
        step_id: String,
        started_at: DateTime<Utc>,
    },
    /// Emitted after each status poll of a long-running step.
    StepPolled {
        step_id: String,
        attempt: u32,
    },
    StepFinished {
        step_id: String,
        status: StepStatus,
        duration_ms: u64,
        /// Failure or cancellation detail, verbatim from the source.
        #[serde(default)]
        message: Option<String>,
    },
    RunCompleted {
        status: RunStatus,
        finished_at: DateTime<Utc>,
    },
}
