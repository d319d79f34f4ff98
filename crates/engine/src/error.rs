//! Error taxonomy for the workflow driver.
//!
//! Local errors are raised before anything reaches the warehouse and are
//! always fatal to registration or planning. Remote errors carry the
//! warehouse's message verbatim together with the step and the exact SQL that
//! was submitted, so the statement can be pasted into a console for diagnosis.

use propensity_types::workflow::CancelReason;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DriverError {
    #[error("step '{name}' is already registered")]
    DuplicateStep { name: String },

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("cycle detected in workflow steps involving: {}", .steps.join(", "))]
    Cycle { steps: Vec<String> },

    #[error("invalid identifier '{identifier}': {reason}")]
    InvalidIdentifier { identifier: String, reason: String },

    #[error("unknown step '{name}'")]
    UnknownStep { name: String },

    #[error("step '{step}' is invalid: {reason}")]
    InvalidStep { step: String, reason: String },

    #[error("step '{step}' references '{reference}', which is not a {expected} step")]
    KindMismatch {
        step: String,
        reference: String,
        expected: &'static str,
    },

    #[error("step '{step}' has an unresolved template reference: ${{{{ {expression} }}}}")]
    UnresolvedTemplate { step: String, expression: String },

    #[error("step '{step}' references resource of step '{reference}', which has not been created in this session")]
    UnknownResource { step: String, reference: String },

    #[error("step '{step}' failed remotely: {message}\n--- submitted SQL ---\n{sql}")]
    RemoteExecution {
        step: String,
        message: String,
        sql: String,
        retryable: bool,
    },

    #[error("training for step '{step}' failed: {message}\n--- submitted SQL ---\n{sql}")]
    TrainingFailed { step: String, message: String, sql: String },

    #[error("step '{step}' was cancelled: {reason}")]
    Cancelled { step: String, reason: CancelReason },

    #[error("step '{step}' returned an unexpected result: {detail}")]
    MalformedResult { step: String, detail: String },

    /// The local task executing the step panicked or was aborted.
    #[error("step '{step}' stopped before finishing: {detail}")]
    TaskAborted { step: String, detail: String },

    #[error("dataset '{dataset}' could not be ensured: {message}")]
    DatasetUnavailable { dataset: String, message: String },
}

impl DriverError {
    /// Step the error concerns, when there is one.
    pub fn step(&self) -> Option<&str> {
        match self {
            DriverError::DuplicateStep { name } | DriverError::UnknownStep { name } => Some(name),
            DriverError::UnknownDependency { step, .. }
            | DriverError::InvalidStep { step, .. }
            | DriverError::KindMismatch { step, .. }
            | DriverError::UnresolvedTemplate { step, .. }
            | DriverError::UnknownResource { step, .. }
            | DriverError::RemoteExecution { step, .. }
            | DriverError::TrainingFailed { step, .. }
            | DriverError::Cancelled { step, .. }
            | DriverError::MalformedResult { step, .. }
            | DriverError::TaskAborted { step, .. } => Some(step),
            DriverError::Cycle { .. } | DriverError::InvalidIdentifier { .. } | DriverError::DatasetUnavailable { .. } => None,
        }
    }

    /// Exact SQL submitted to the warehouse, for remote failures.
    pub fn offending_sql(&self) -> Option<&str> {
        match self {
            DriverError::RemoteExecution { sql, .. } | DriverError::TrainingFailed { sql, .. } => Some(sql),
            _ => None,
        }
    }

    /// True for errors detected before any submission.
    pub fn is_local(&self) -> bool {
        !matches!(
            self,
            DriverError::RemoteExecution { .. }
                | DriverError::TrainingFailed { .. }
                | DriverError::Cancelled { .. }
                | DriverError::MalformedResult { .. }
                | DriverError::DatasetUnavailable { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DriverError::Cancelled { .. })
    }
}
