use std::sync::Mutex;

use async_trait::async_trait;
use propensity_types::{DatasetRef, JobHandle, JobState, RemoteError, ResourceKind, Row, RowSet, StatementRequest, Submission};
use serde_json::json;

use crate::Warehouse;

/// Warehouse that records statements and reports success without side effects.
///
/// Queries return an empty row set, except evaluations which get a single
/// zeroed metrics row. Views are created immediately and model training
/// returns a job that is already `SUCCEEDED` on the first poll. Used for dry
/// runs, where the interesting output is the rendered SQL.
#[derive(Debug, Default)]
pub struct NoopWarehouse {
    submitted: Mutex<Vec<StatementRequest>>,
    datasets: Mutex<Vec<DatasetRef>>,
}

impl NoopWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statements submitted so far, in order.
    pub fn submitted(&self) -> Vec<StatementRequest> {
        self.submitted.lock().map(|submitted| submitted.clone()).unwrap_or_default()
    }

    /// Datasets passed to `ensure_dataset`, in order.
    pub fn datasets(&self) -> Vec<DatasetRef> {
        self.datasets.lock().map(|datasets| datasets.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Warehouse for NoopWarehouse {
    async fn ensure_dataset(&self, dataset: &DatasetRef) -> Result<(), RemoteError> {
        if let Ok(mut datasets) = self.datasets.lock() {
            datasets.push(dataset.clone());
        }
        Ok(())
    }

    async fn execute(&self, request: &StatementRequest) -> Result<Submission, RemoteError> {
        let sequence = match self.submitted.lock() {
            Ok(mut submitted) => {
                submitted.push(request.clone());
                submitted.len()
            }
            Err(_) => 0,
        };
        Ok(match &request.resource {
            Some(resource) if matches!(resource.kind, ResourceKind::Model(_)) => Submission::Job(JobHandle {
                job_id: format!("noop_job_{sequence}"),
                location: None,
            }),
            Some(resource) => Submission::Resource(resource.clone()),
            None if request.sql.contains("ML.EVALUATE") => Submission::Rows(zeroed_metrics()),
            None => Submission::Rows(RowSet::default()),
        })
    }

    async fn job_status(&self, _job: &JobHandle) -> Result<JobState, RemoteError> {
        Ok(JobState::Succeeded)
    }

    async fn cancel_job(&self, _job: &JobHandle) -> Result<(), RemoteError> {
        Ok(())
    }
}

fn zeroed_metrics() -> RowSet {
    let row: Row = ["precision", "recall", "f1_score", "roc_auc"]
        .into_iter()
        .map(|column| (column.to_string(), json!(0.0)))
        .collect();
    RowSet::from_rows(vec![row])
}
