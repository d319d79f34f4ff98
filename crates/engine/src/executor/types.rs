use propensity_types::workflow::StepStatus;
use propensity_types::{ResourceHandle, RowSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Model quality metrics reported by an evaluation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub auc: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_loss: Option<f64>,
}

impl EvaluationMetrics {
    /// Read metrics from the first row of an evaluation result.
    ///
    /// Accepts `f1_score` or `f1`, and `roc_auc` or `auc`. Numeric strings are
    /// accepted because some warehouses encode FLOAT64 cells as strings.
    pub fn from_rows(rows: &RowSet) -> Result<Self, String> {
        let row = rows.first().ok_or_else(|| "evaluation returned no rows".to_string())?;
        let metric = |names: &[&str]| -> Option<f64> { names.iter().find_map(|name| row.get(*name).and_then(as_f64)) };
        let required = |names: &[&str]| -> Result<f64, String> { metric(names).ok_or_else(|| format!("evaluation result is missing '{}'", names.join("' or '"))) };

        Ok(Self {
            precision: required(&["precision"])?,
            recall: required(&["recall"])?,
            f1: required(&["f1_score", "f1"])?,
            auc: required(&["roc_auc", "auc"])?,
            accuracy: metric(&["accuracy"]),
            log_loss: metric(&["log_loss"]),
        })
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// What a successfully executed step produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutput {
    /// Rows returned by a query, unchanged.
    Rows(RowSet),
    /// A view created or replaced.
    View(ResourceHandle),
    /// A model whose training finished.
    Model(ResourceHandle),
    Metrics(EvaluationMetrics),
    /// Prediction rows as the warehouse returned them.
    Predictions(RowSet),
}

impl StepOutput {
    pub fn rows(&self) -> Option<&RowSet> {
        match self {
            StepOutput::Rows(rows) | StepOutput::Predictions(rows) => Some(rows),
            _ => None,
        }
    }

    pub fn resource(&self) -> Option<&ResourceHandle> {
        match self {
            StepOutput::View(handle) | StepOutput::Model(handle) => Some(handle),
            _ => None,
        }
    }

    /// One-line description for progress output.
    pub fn summary(&self) -> String {
        match self {
            StepOutput::Rows(rows) => format!("{} row(s)", rows.len()),
            StepOutput::View(handle) => format!("view {}", handle.name),
            StepOutput::Model(handle) => format!("model {}", handle.name),
            StepOutput::Metrics(metrics) => format!(
                "precision={:.4} recall={:.4} f1={:.4} auc={:.4}",
                metrics.precision, metrics.recall, metrics.f1, metrics.auc
            ),
            StepOutput::Predictions(rows) => format!("{} prediction row(s)", rows.len()),
        }
    }
}

/// Outcome of one step execution, kept in the driver's history.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub id: String,
    pub status: StepStatus,
    /// Status checks made while waiting on a job (0 for synchronous statements)
    pub polls: u32,
    pub duration_ms: u64,
    pub output: Option<StepOutput>,
    /// Error message for failed or cancelled steps
    pub message: Option<String>,
    /// Statement submitted, when one was
    pub sql: Option<String>,
}
