//! Turns a step definition into the exact statement submitted to the warehouse.
//!
//! Rendering happens immediately before submission so `${{ steps.<id> }}`
//! resolves against the resources created so far in the session.

use std::collections::HashMap;

use indexmap::IndexMap;
use propensity_types::{ModelType, ResourceHandle, StatementRequest};
use serde_json::Value;

use crate::config::DriverConfig;
use crate::error::DriverError;
use crate::identifier::ResourceName;
use crate::model::{StepDefinition, StepKind};
use crate::templates::{TemplateExpression, render_template};

pub const DEFAULT_EVALUATE_SQL: &str = "SELECT * FROM ML.EVALUATE(MODEL `${{ model }}`)";
pub const DEFAULT_PREDICT_SQL: &str = "SELECT * FROM ML.PREDICT(MODEL `${{ model }}`, TABLE `${{ input }}`)";

/// Values templates may resolve against.
#[derive(Debug, Clone, Copy)]
pub struct StatementScope<'a> {
    pub config: &'a DriverConfig,
    /// Resources created so far, keyed by the step that created them.
    pub resources: &'a HashMap<String, ResourceName>,
}

/// Fully rendered statement for one step.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedStatement {
    pub step_id: String,
    pub sql: String,
    /// Name of the view or model the statement creates
    pub resource_name: Option<ResourceName>,
    pub resource: Option<ResourceHandle>,
}

impl PreparedStatement {
    pub fn request(&self) -> StatementRequest {
        StatementRequest {
            sql: self.sql.clone(),
            resource: self.resource.clone(),
        }
    }
}

/// Name the step's resource will have, without rendering its SQL.
pub fn resource_name_for(step: &StepDefinition, scope: StatementScope<'_>) -> Result<Option<ResourceName>, DriverError> {
    if !step.kind.creates_resource() {
        return Ok(None);
    }
    let name = match step.resource.as_deref() {
        Some(template) => {
            let rendered = render_template(&step.name, template, |expression| resolve(step, scope, None, expression))?;
            ResourceName::parse(&rendered)?
        }
        None => ResourceName::qualified(&scope.config.dataset_id, &step.name)?,
    };
    Ok(Some(name))
}

/// Render the statement for `step`.
///
/// Fails locally with `UnresolvedTemplate`, `UnknownResource` or
/// `InvalidIdentifier`; nothing has been submitted when this returns an error.
pub fn prepare_statement(step: &StepDefinition, scope: StatementScope<'_>) -> Result<PreparedStatement, DriverError> {
    let resource_name = resource_name_for(step, scope)?;
    let template = match (&step.kind, step.sql.as_deref()) {
        (_, Some(sql)) => sql,
        (StepKind::Evaluate { .. }, None) => DEFAULT_EVALUATE_SQL,
        (StepKind::Predict { .. }, None) => DEFAULT_PREDICT_SQL,
        (kind, None) => {
            return Err(DriverError::InvalidStep {
                step: step.name.clone(),
                reason: format!("{} steps require 'sql'", kind.label()),
            });
        }
    };
    let body = render_template(&step.name, template, |expression| resolve(step, scope, resource_name.as_ref(), expression))?;
    let body = trim_statement(&body);

    let (sql, resource) = match (&step.kind, &resource_name) {
        (StepKind::CreateView, Some(name)) => (
            format!("CREATE OR REPLACE VIEW {} AS\n{}", name.quoted(), body),
            Some(ResourceHandle::view(name.to_string())),
        ),
        (StepKind::TrainModel { model_type, options }, Some(name)) => {
            let body = sample_training_body(body, scope.config.sample_fraction);
            (
                format!(
                    "CREATE OR REPLACE MODEL {}\nOPTIONS({}) AS\n{}",
                    name.quoted(),
                    render_options(*model_type, options),
                    body
                ),
                Some(ResourceHandle::model(name.to_string(), *model_type)),
            )
        }
        _ => (body.to_string(), None),
    };

    Ok(PreparedStatement {
        step_id: step.name.clone(),
        sql,
        resource_name,
        resource,
    })
}

fn resolve(
    step: &StepDefinition,
    scope: StatementScope<'_>,
    own_resource: Option<&ResourceName>,
    expression: &TemplateExpression,
) -> Result<Option<String>, DriverError> {
    let created_by = |reference: &str| -> Result<Option<String>, DriverError> {
        scope
            .resources
            .get(reference)
            .map(|name| Some(name.to_string()))
            .ok_or_else(|| DriverError::UnknownResource {
                step: step.name.clone(),
                reference: reference.to_string(),
            })
    };

    match expression {
        TemplateExpression::Dataset => Ok(Some(scope.config.dataset_id.clone())),
        TemplateExpression::Project => Ok(scope.config.project_id.clone()),
        TemplateExpression::Location => Ok(scope.config.location.clone()),
        TemplateExpression::SampleFraction => Ok(Some(scope.config.sample_fraction.to_string())),
        TemplateExpression::Resource => Ok(own_resource.map(ToString::to_string)),
        TemplateExpression::ModelType => Ok(match &step.kind {
            StepKind::TrainModel { model_type, .. } => Some(model_type.as_str().to_string()),
            _ => None,
        }),
        TemplateExpression::Model => match &step.kind {
            StepKind::Evaluate { model } | StepKind::Predict { model, .. } => created_by(model),
            _ => Ok(None),
        },
        TemplateExpression::Input => match &step.kind {
            StepKind::Predict { input, .. } => created_by(input),
            _ => Ok(None),
        },
        TemplateExpression::Step(reference) => created_by(reference),
    }
}

fn trim_statement(sql: &str) -> &str {
    sql.trim().trim_end_matches(';').trim_end()
}

/// Wrap a training body so only a random fraction of rows is used.
pub fn sample_training_body(body: &str, fraction: f64) -> String {
    if fraction >= 1.0 {
        return body.to_string();
    }
    format!("SELECT * FROM (\n{body}\n) WHERE RAND() < {fraction}")
}

/// Render `model_type` followed by the step's options.
pub fn render_options(model_type: ModelType, options: &IndexMap<String, Value>) -> String {
    let mut rendered = vec![format!("model_type='{}'", model_type.as_str())];
    rendered.extend(options.iter().map(|(key, value)| format!("{key}={}", render_option_value(value))));
    rendered.join(", ")
}

fn render_option_value(value: &Value) -> String {
    match value {
        Value::String(text) => format!("'{}'", text.replace('\\', "\\\\").replace('\'', "\\'")),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Number(number) => number.to_string(),
        Value::Array(items) => format!("[{}]", items.iter().map(render_option_value).collect::<Vec<_>>().join(", ")),
        Value::Null => "NULL".to_string(),
        Value::Object(_) => "NULL".to_string(),
    }
}
