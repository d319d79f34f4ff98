//! # Propensity Engine
//!
//! The engine drives a warehouse ML workflow: it registers SQL steps, orders
//! them by dependency, renders their statements, submits them to a
//! [`propensity_warehouse::Warehouse`] and waits for model training to finish.
//!
//! ## Key Features
//!
//! - **Workflow Parsing**: YAML/JSON workflow documents (single or multi-workflow)
//! - **Template Rendering**: `${{ ... }}` references to the dataset and earlier resources
//! - **Dependency Planning**: topological execution with registration-order tie breaks
//! - **Polling**: interval, maximum wait and cancellation for long-running training
//!
//! ## Usage
//!
//! ```rust
//! use propensity_engine::{parse_workflow_file, Workflow};
//!
//! let temp_dir = tempfile::tempdir()?;
//! let workflow_path = temp_dir.path().join("workflow.yaml");
//! std::fs::write(&workflow_path, r#"
//! workflow: demo
//! steps:
//!   - id: raw_query
//!     kind: query
//!     sql: SELECT 1
//! "#)?;
//!
//! let bundle = parse_workflow_file(&workflow_path)?;
//! for (name, document) in bundle.workflows {
//!     let workflow = Workflow::from_document(document)?;
//!     println!("{name}: {} step(s)", workflow.len());
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Architecture
//!
//! - **`model`**: workflow documents and step definitions
//! - **`templates`** and **`identifier`**: SQL templating and resource names
//! - **`executor`**: planning, statement rendering, polling and the resource registry
//! - **`driver`**: `define_step`, `run` and `run_all`
//! - **`workflow`**: concurrent branch execution with event streaming
//! - **`config`**: configuration file, environment overrides and validation

use std::{fs, path::Path};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::Deserialize;

pub mod config;
pub mod driver;
pub mod error;
pub mod executor;
pub mod identifier;
pub mod model;
pub mod templates;
pub mod workflow;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{ConfigError, ConfigFile, DriverConfig};
pub use driver::{Driver, PlannedStatement, Workflow};
pub use error::DriverError;
pub use executor::{EvaluationMetrics, StepOutput, StepRecord};
pub use identifier::ResourceName;
pub use model::{StepDefinition, StepDocument, StepKind, WorkflowBundle, WorkflowDocument};

/// The purchase-propensity tutorial workflow shipped with the driver.
pub const BUNDLED_WORKFLOW: &str = include_str!("../../../workflows/purchase_propensity.yaml");

/// Loads a workflow file from the filesystem.
///
/// JSON is a subset of YAML, so both formats go through the same parser.
///
/// # Errors
///
/// Returns an error if the file cannot be read or does not match either the
/// single-workflow or the multi-workflow document shape.
pub fn parse_workflow_file(file_path: impl AsRef<Path>) -> Result<WorkflowBundle> {
    let file_path = file_path.as_ref();
    let content = fs::read_to_string(file_path).with_context(|| format!("Failed to read workflow file: {}", file_path.display()))?;
    parse_workflow_str(&content).with_context(|| format!("Failed to parse workflow file: {}", file_path.display()))
}

/// Parses workflow document text.
pub fn parse_workflow_str(content: &str) -> Result<WorkflowBundle> {
    // Try the multi-workflow shape first so a bundle is never accepted as a
    // single workflow with its `workflows` key ignored.
    #[derive(Deserialize)]
    struct MultiWorkflowDocument {
        workflows: IndexMap<String, WorkflowDocument>,
    }

    if let Ok(multi_workflow_document) = serde_yaml::from_str::<MultiWorkflowDocument>(content) {
        let workflows = multi_workflow_document
            .workflows
            .into_iter()
            .map(|(name, mut document)| {
                if document.workflow.is_none() {
                    document.workflow = Some(name.clone());
                }
                (name, document)
            })
            .collect();
        return Ok(WorkflowBundle { workflows });
    }

    let document = serde_yaml::from_str::<WorkflowDocument>(content).context(
        "Unsupported workflow document format. Expected one of:\n\
         - Single workflow with 'workflow' and 'steps' fields\n\
         - Multi-workflow document with workflows under a 'workflows' key",
    )?;
    let workflow_name = document.workflow.clone().unwrap_or_else(|| "default".to_string());
    let mut workflows = IndexMap::new();
    workflows.insert(workflow_name, document);
    Ok(WorkflowBundle { workflows })
}
