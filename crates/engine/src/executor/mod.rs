//! Execution engine: orders steps, renders their statements, submits them to
//! the warehouse and waits on long-running jobs.
//!
//! - `planning` orders steps by dependency, ties broken by registration order
//! - `statement` renders SQL templates into create-or-replace statements
//! - `step_once` executes one step against a [`propensity_warehouse::Warehouse`]
//! - `poll` waits on remote jobs with interval, max wait and cancellation
//! - `resources` tracks created resources and serializes same-name writes

pub mod planning;
pub mod poll;
pub mod resources;
pub mod statement;
pub mod step_once;
pub mod types;

pub use planning::{order_steps_for_execution, plan_for_target};
pub use poll::{PollFailure, PollSettings, await_job};
pub use resources::{RegisteredResource, ResourceLocks, ResourceRegistry};
pub use statement::{PreparedStatement, StatementScope, prepare_statement};
pub use step_once::{ExecutedStep, StepContext, StepFailure, execute_step};
pub use types::{EvaluationMetrics, StepOutput, StepRecord};
