//! Shared type definitions for the propensity workflow driver.
//!
//! Everything in this crate describes warehouse-side state as the driver sees it:
//! references to datasets, views and models, tabular results, and handles for
//! long-running remote jobs. The warehouse remains the source of truth; these
//! values are identifiers plus the metadata needed to reason about ordering.

use std::{fmt, str::FromStr};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod workflow;

/// Model families offered by the warehouse's built-in ML feature.
///
/// The set is closed on purpose: an unsupported kind is rejected while the
/// workflow document is parsed instead of surfacing as a remote error.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    /// Binary logistic regression.
    LogisticReg,
    /// Managed AutoML classifier.
    AutomlClassifier,
    /// Deep neural network classifier.
    DnnClassifier,
}

impl ModelType {
    /// Value used for the `model_type` option in training statements.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::LogisticReg => "logistic_reg",
            ModelType::AutomlClassifier => "automl_classifier",
            ModelType::DnnClassifier => "dnn_classifier",
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a model type literal is not one of the supported kinds.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unsupported model type '{0}' (expected logistic_reg, automl_classifier or dnn_classifier)")]
pub struct UnknownModelType(pub String);

impl FromStr for ModelType {
    type Err = UnknownModelType;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "logistic_reg" => Ok(ModelType::LogisticReg),
            "automl_classifier" => Ok(ModelType::AutomlClassifier),
            "dnn_classifier" => Ok(ModelType::DnnClassifier),
            _ => Err(UnknownModelType(value.to_string())),
        }
    }
}

/// Kind of a warehouse resource created by a workflow step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", content = "model_type", rename_all = "snake_case")]
pub enum ResourceKind {
    /// A saved, named query.
    View,
    /// A trained model handle.
    Model(ModelType),
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::View => f.write_str("view"),
            ResourceKind::Model(model_type) => write!(f, "model ({model_type})"),
        }
    }
}

/// Reference to a warehouse resource by fully qualified `<dataset>.<name>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceHandle {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Fully qualified `<dataset>.<name>` identifier.
    pub name: String,
}

impl ResourceHandle {
    pub fn view(name: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::View,
            name: name.into(),
        }
    }

    pub fn model(name: impl Into<String>, model_type: ModelType) -> Self {
        Self {
            kind: ResourceKind::Model(model_type),
            name: name.into(),
        }
    }
}

/// Named container in the warehouse that holds views and models.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatasetRef {
    /// Billing/owning project. `None` lets the warehouse client use its default.
    #[serde(default)]
    pub project: Option<String>,
    /// Dataset identifier.
    pub dataset: String,
    /// Data location, e.g. `US`.
    #[serde(default)]
    pub location: Option<String>,
}

/// One result row, preserving the column order reported by the warehouse.
pub type Row = IndexMap<String, JsonValue>;

/// Ordered tabular result returned by a query, evaluation or prediction.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RowSet {
    /// Column names in schema order. May be empty when the warehouse reports no schema.
    #[serde(default)]
    pub columns: Vec<String>,
    /// Rows in the order they were returned.
    #[serde(default)]
    pub rows: Vec<Row>,
}

impl RowSet {
    /// Build a row set, deriving the column list from the first row.
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let columns = rows.first().map(|row| row.keys().cloned().collect()).unwrap_or_default();
        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    /// Iterate the values of one column; rows missing the column yield `None`.
    pub fn column<'a>(&'a self, name: &'a str) -> impl Iterator<Item = Option<&'a JsonValue>> + 'a {
        self.rows.iter().map(move |row| row.get(name))
    }
}

/// Handle for an asynchronous remote job, such as model training.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobHandle {
    /// Warehouse-assigned job identifier.
    pub job_id: String,
    /// Location the job runs in, when the warehouse requires it for lookups.
    #[serde(default)]
    pub location: Option<String>,
}

/// Remote status of a submitted job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed { message: String },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed { .. })
    }
}

/// SQL statement submitted to the warehouse.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatementRequest {
    /// Statement text exactly as it will be executed.
    pub sql: String,
    /// Resource the statement creates or replaces, if any.
    #[serde(default)]
    pub resource: Option<ResourceHandle>,
}

impl StatementRequest {
    pub fn query(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            resource: None,
        }
    }

    pub fn creating(sql: impl Into<String>, resource: ResourceHandle) -> Self {
        Self {
            sql: sql.into(),
            resource: Some(resource),
        }
    }
}

/// Immediate outcome of submitting a statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Statement finished and produced rows.
    Rows(RowSet),
    /// Statement finished and created or replaced a resource.
    Resource(ResourceHandle),
    /// Statement was accepted and keeps running remotely.
    Job(JobHandle),
}

/// Error reported by the warehouse, carried verbatim.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct RemoteError {
    /// Message as reported by the remote service.
    pub message: String,
    /// Whether the remote service marked the failure as transient.
    #[serde(default)]
    pub retryable: bool,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn model_type_parses_known_kinds_and_rejects_others() {
        assert_eq!("logistic_reg".parse::<ModelType>(), Ok(ModelType::LogisticReg));
        assert_eq!(" DNN_CLASSIFIER ".parse::<ModelType>(), Ok(ModelType::DnnClassifier));
        let error = "boosted_tree_classifier".parse::<ModelType>().expect_err("unsupported");
        assert!(error.to_string().contains("boosted_tree_classifier"));
    }

    #[test]
    fn model_type_deserializes_from_snake_case_yaml() {
        let parsed: ModelType = serde_yaml::from_str("automl_classifier").expect("parse");
        assert_eq!(parsed, ModelType::AutomlClassifier);
        assert_eq!(parsed.to_string(), "automl_classifier");
    }

    #[test]
    fn row_set_derives_columns_from_first_row() {
        let mut row = Row::new();
        row.insert("country".into(), json!("United States"));
        row.insert("total_predicted_purchases".into(), json!(220));
        let rows = RowSet::from_rows(vec![row]);

        assert_eq!(rows.columns, vec!["country", "total_predicted_purchases"]);
        let values: Vec<_> = rows.column("country").collect();
        assert_eq!(values, vec![Some(&json!("United States"))]);
    }

    #[test]
    fn only_succeeded_and_failed_are_terminal() {
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed { message: "boom".into() }.is_terminal());
    }
}
