//! `${{ ... }}` template parsing and rendering.
//!
//! SQL templates may reference the configured dataset and project, the step's
//! own resource, and resources created by earlier steps. Rendering is strict:
//! an unknown or unresolvable expression is a local error, never an empty
//! string silently sent to the warehouse.

use crate::error::DriverError;

/// Recognised template expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateExpression {
    /// `dataset`: configured dataset id.
    Dataset,
    /// `project`: configured project id.
    Project,
    /// `location`: configured data location.
    Location,
    /// `sample_fraction`: configured sampling fraction.
    SampleFraction,
    /// `resource`: this step's own qualified resource name.
    Resource,
    /// `model`: qualified name of the model an evaluate/predict step targets.
    Model,
    /// `input`: qualified name of the view a predict step reads.
    Input,
    /// `model_type`: model type of a training step.
    ModelType,
    /// `steps.<id>`: qualified resource name created by step `<id>`.
    Step(String),
}

impl TemplateExpression {
    /// Parse a raw expression (without delimiters).
    pub fn parse(expression: &str) -> Option<Self> {
        match expression.trim() {
            "dataset" => Some(Self::Dataset),
            "project" => Some(Self::Project),
            "location" => Some(Self::Location),
            "sample_fraction" => Some(Self::SampleFraction),
            "resource" => Some(Self::Resource),
            "model" => Some(Self::Model),
            "input" => Some(Self::Input),
            "model_type" => Some(Self::ModelType),
            other => {
                let step_id = other.strip_prefix("steps.")?;
                let valid = !step_id.is_empty() && step_id.chars().all(|character| character.is_ascii_alphanumeric() || character == '_');
                valid.then(|| Self::Step(step_id.to_string()))
            }
        }
    }
}

/// Extracts template expressions from a string value.
///
/// Returned expressions do not include `${{` or `}}` delimiters.
pub fn extract_template_expressions(value: &str) -> Vec<String> {
    let mut expressions = Vec::new();
    let mut remainder = value;

    while let Some(start) = remainder.find("${{") {
        let after_start = &remainder[start + 3..];
        let Some(end) = after_start.find("}}") else {
            break;
        };
        let expression = after_start[..end].trim();
        if !expression.is_empty() {
            expressions.push(expression.to_string());
        }
        remainder = &after_start[end + 2..];
    }

    expressions
}

/// Parse every expression in `template`, failing on the first unknown one.
pub fn parse_template(step_id: &str, template: &str) -> Result<Vec<TemplateExpression>, DriverError> {
    extract_template_expressions(template)
        .into_iter()
        .map(|expression| {
            TemplateExpression::parse(&expression).ok_or_else(|| DriverError::UnresolvedTemplate {
                step: step_id.to_string(),
                expression,
            })
        })
        .collect()
}

/// Step ids referenced through `steps.<id>` in a template.
pub fn referenced_steps(step_id: &str, template: &str) -> Result<Vec<String>, DriverError> {
    Ok(parse_template(step_id, template)?
        .into_iter()
        .filter_map(|expression| match expression {
            TemplateExpression::Step(id) => Some(id),
            _ => None,
        })
        .collect())
}

/// Render `template`, resolving each expression through `resolve`.
///
/// `resolve` returns `Ok(None)` for expressions that have no value in the
/// current scope, which is reported as [`DriverError::UnresolvedTemplate`].
pub fn render_template<F>(step_id: &str, template: &str, mut resolve: F) -> Result<String, DriverError>
where
    F: FnMut(&TemplateExpression) -> Result<Option<String>, DriverError>,
{
    let mut rendered = String::with_capacity(template.len());
    let mut remainder = template;

    while let Some(start) = remainder.find("${{") {
        let after_start = &remainder[start + 3..];
        let Some(end) = after_start.find("}}") else {
            break;
        };
        rendered.push_str(&remainder[..start]);

        let raw_expression = after_start[..end].trim();
        let unresolved = || DriverError::UnresolvedTemplate {
            step: step_id.to_string(),
            expression: raw_expression.to_string(),
        };
        let expression = TemplateExpression::parse(raw_expression).ok_or_else(unresolved)?;
        let value = resolve(&expression)?.ok_or_else(unresolved)?;
        rendered.push_str(&value);

        remainder = &after_start[end + 2..];
    }

    rendered.push_str(remainder);
    Ok(rendered)
}
