//! Remote execution interface for the data warehouse.
//!
//! The workflow driver never processes data locally; every state change goes
//! through the [`Warehouse`] trait defined here. Two implementations ship with
//! the crate:
//!
//! - [`RestWarehouse`] talks to a BigQuery-style v2 REST API.
//! - [`NoopWarehouse`] records statements and fabricates successful outcomes,
//!   which backs dry runs and plan previews.
//!
//! # Example
//!
//! ```ignore
//! use propensity_types::StatementRequest;
//! use propensity_warehouse::{RestWarehouse, Warehouse};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let warehouse = RestWarehouse::new_from_env("my-project", Some("US".into()))?;
//! let submission = warehouse.execute(&StatementRequest::query("SELECT 1 AS one")).await?;
//! println!("{submission:?}");
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use propensity_types::{DatasetRef, JobHandle, JobState, RemoteError, StatementRequest, Submission};

mod client;
mod noop;
mod rows;

pub use client::RestWarehouse;
pub use noop::NoopWarehouse;
pub use rows::{FieldSchema, TableCell, TableRow, decode_rows};

/// Sole means of changing warehouse state.
///
/// Implementations must return remote error messages verbatim and flag
/// transient failures through [`RemoteError::retryable`]; callers decide
/// whether a retry is appropriate.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Create the dataset if it does not exist. Existing datasets are left untouched.
    async fn ensure_dataset(&self, dataset: &DatasetRef) -> Result<(), RemoteError>;

    /// Submit one SQL statement.
    ///
    /// Statements that create a resource carry it in `request.resource`. Long-running
    /// statements may return [`Submission::Job`], which callers poll with
    /// [`Warehouse::job_status`].
    async fn execute(&self, request: &StatementRequest) -> Result<Submission, RemoteError>;

    /// Fetch the current status of a submitted job.
    async fn job_status(&self, job: &JobHandle) -> Result<JobState, RemoteError>;

    /// Request cancellation of a running job. Best effort; the job may still finish.
    async fn cancel_job(&self, job: &JobHandle) -> Result<(), RemoteError>;
}
