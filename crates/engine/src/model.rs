//! # Workflow Model Definitions
//!
//! This module contains the data structures that describe a warehouse ML
//! workflow: the serializable document form (`WorkflowBundle`,
//! `WorkflowDocument`, `StepDocument`) and the validated in-memory form the
//! driver executes (`StepDefinition`, `StepKind`).
//!
//! ## Core Concepts
//!
//! - **WorkflowBundle**: A collection of named workflow documents
//! - **WorkflowDocument**: One workflow with its ordered list of steps
//! - **StepDefinition**: A single SQL submission with a kind and dependencies
//!
//! ## Usage
//!
//! ```rust
//! use propensity_engine::model::StepDefinition;
//! use propensity_types::ModelType;
//!
//! let view = StepDefinition::create_view("training_data", "SELECT 1 AS label");
//! let model = StepDefinition::train_model(
//!     "logistic_model",
//!     ModelType::LogisticReg,
//!     "SELECT * FROM `${{ steps.training_data }}`",
//! )
//! .with_option("input_label_cols", serde_json::json!(["label"]));
//!
//! assert_eq!(model.all_dependencies().expect("valid template"), vec!["training_data".to_string()]);
//! # let _ = view;
//! ```

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use propensity_types::ModelType;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DriverError;
use crate::templates::{TemplateExpression, parse_template};

static OPTION_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("option key regex should compile"));

/// A collection of named workflows loaded from a single file.
///
/// Multi-workflow documents use a top-level `workflows:` map; single workflow
/// documents are wrapped into a bundle by [`crate::parse_workflow_file`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkflowBundle {
    /// Mapping of workflow names to their documents, in file order
    pub workflows: IndexMap<String, WorkflowDocument>,
}

/// Serializable definition of one workflow.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkflowDocument {
    /// Optional workflow identifier
    ///
    /// In multi-workflow bundles this is filled from the map key when the
    /// document leaves it blank.
    #[serde(default)]
    pub workflow: Option<String>,

    /// Human-readable summary shown by `plan`
    #[serde(default)]
    pub description: Option<String>,

    /// Steps in registration order
    ///
    /// Registration order breaks ties between steps that are otherwise
    /// independent, so it is also the order `run-all` prefers.
    #[serde(default)]
    pub steps: Vec<StepDocument>,
}

/// Step kind tag as written in workflow documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKindTag {
    Query,
    CreateView,
    TrainModel,
    Evaluate,
    Predict,
}

/// Serializable form of a single step.
///
/// Which optional fields apply depends on `kind`; [`StepDocument::into_definition`]
/// rejects combinations that make no sense (for example `model_type` on a query).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDocument {
    /// Unique step identifier, also the default resource name
    pub id: String,

    /// What the step does with its SQL
    pub kind: StepKindTag,

    /// SQL template
    ///
    /// Required for `query`, `create_view` and `train_model`. Optional for
    /// `evaluate` and `predict`, which have default templates.
    #[serde(default)]
    pub sql: Option<String>,

    /// Explicit dependencies on other steps
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Override for the created resource name (`<dataset>.<name>` template)
    #[serde(default)]
    pub resource: Option<String>,

    /// Model type for `train_model` steps
    #[serde(default)]
    pub model_type: Option<ModelType>,

    /// Extra `OPTIONS(...)` entries for `train_model` steps
    #[serde(default)]
    pub options: IndexMap<String, Value>,

    /// Training step whose model `evaluate`/`predict` steps target
    #[serde(default)]
    pub model: Option<String>,

    /// View step a `predict` step reads from
    #[serde(default)]
    pub input: Option<String>,

    /// Free-form description
    #[serde(default)]
    pub description: Option<String>,
}

impl StepDocument {
    /// Convert into a validated [`StepDefinition`].
    pub fn into_definition(self) -> Result<StepDefinition, DriverError> {
        let invalid = |reason: &str| DriverError::InvalidStep {
            step: self.id.clone(),
            reason: reason.to_string(),
        };

        let kind = match self.kind {
            StepKindTag::Query => StepKind::Query,
            StepKindTag::CreateView => StepKind::CreateView,
            StepKindTag::TrainModel => StepKind::TrainModel {
                model_type: self.model_type.ok_or_else(|| invalid("train_model steps require 'model_type'"))?,
                options: self.options.clone(),
            },
            StepKindTag::Evaluate => StepKind::Evaluate {
                model: self.model.clone().ok_or_else(|| invalid("evaluate steps require 'model'"))?,
            },
            StepKindTag::Predict => StepKind::Predict {
                model: self.model.clone().ok_or_else(|| invalid("predict steps require 'model'"))?,
                input: self.input.clone().ok_or_else(|| invalid("predict steps require 'input'"))?,
            },
        };

        if self.model_type.is_some() && !matches!(kind, StepKind::TrainModel { .. }) {
            return Err(invalid("'model_type' only applies to train_model steps"));
        }
        if !self.options.is_empty() && !matches!(kind, StepKind::TrainModel { .. }) {
            return Err(invalid("'options' only apply to train_model steps"));
        }
        if self.model.is_some() && !matches!(kind, StepKind::Evaluate { .. } | StepKind::Predict { .. }) {
            return Err(invalid("'model' only applies to evaluate and predict steps"));
        }
        if self.input.is_some() && !matches!(kind, StepKind::Predict { .. }) {
            return Err(invalid("'input' only applies to predict steps"));
        }

        let definition = StepDefinition {
            name: self.id,
            kind,
            sql: self.sql,
            depends_on: self.depends_on,
            resource: self.resource,
            description: self.description,
            misplaced_options: Vec::new(),
        };
        definition.validate()?;
        Ok(definition)
    }
}

/// What a step does with its SQL and what it produces.
#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    /// Submit SQL and return the rows unchanged.
    Query,
    /// Create or replace a view from the SQL body.
    CreateView,
    /// Create or replace a model trained on the SQL body.
    TrainModel {
        model_type: ModelType,
        options: IndexMap<String, Value>,
    },
    /// Evaluate the model created by step `model`.
    Evaluate { model: String },
    /// Predict with the model of step `model` over the view of step `input`.
    Predict { model: String, input: String },
}

impl StepKind {
    /// Label matching the document tag.
    pub fn label(&self) -> &'static str {
        match self {
            StepKind::Query => "query",
            StepKind::CreateView => "create_view",
            StepKind::TrainModel { .. } => "train_model",
            StepKind::Evaluate { .. } => "evaluate",
            StepKind::Predict { .. } => "predict",
        }
    }

    /// True for kinds that create a named resource.
    pub fn creates_resource(&self) -> bool {
        matches!(self, StepKind::CreateView | StepKind::TrainModel { .. })
    }
}

/// A validated step ready for registration with a workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct StepDefinition {
    pub name: String,
    pub kind: StepKind,
    /// SQL template; `None` selects the kind's default template
    pub sql: Option<String>,
    /// Declared dependencies, in declaration order
    pub depends_on: Vec<String>,
    /// Resource name template overriding `<dataset>.<name>`
    pub resource: Option<String>,
    pub description: Option<String>,
    /// Option keys passed to `with_option` on a kind that takes no options
    misplaced_options: Vec<String>,
}

impl StepDefinition {
    fn with_kind(name: impl Into<String>, kind: StepKind, sql: Option<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            sql,
            depends_on: Vec::new(),
            resource: None,
            description: None,
            misplaced_options: Vec::new(),
        }
    }

    pub fn query(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::with_kind(name, StepKind::Query, Some(sql.into()))
    }

    pub fn create_view(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::with_kind(name, StepKind::CreateView, Some(sql.into()))
    }

    pub fn train_model(name: impl Into<String>, model_type: ModelType, sql: impl Into<String>) -> Self {
        let kind = StepKind::TrainModel {
            model_type,
            options: IndexMap::new(),
        };
        Self::with_kind(name, kind, Some(sql.into()))
    }

    pub fn evaluate(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self::with_kind(name, StepKind::Evaluate { model: model.into() }, None)
    }

    pub fn predict(name: impl Into<String>, model: impl Into<String>, input: impl Into<String>) -> Self {
        let kind = StepKind::Predict {
            model: model.into(),
            input: input.into(),
        };
        Self::with_kind(name, kind, None)
    }

    /// Add explicit dependencies.
    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(dependencies.into_iter().map(Into::into));
        self
    }

    /// Replace the SQL template.
    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    /// Override the created resource name.
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// Add a training option. On kinds other than `TrainModel` the option is
    /// not stored and [`StepDefinition::validate`] rejects the step.
    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        match &mut self.kind {
            StepKind::TrainModel { options, .. } => {
                options.insert(key.into(), value);
            }
            _ => self.misplaced_options.push(key.into()),
        }
        self
    }

    /// Steps this step reads from without declaring them: `model`, `input`
    /// and `${{ steps.<id> }}` references, in that order.
    pub fn implied_dependencies(&self) -> Result<Vec<String>, DriverError> {
        let mut implied = Vec::new();
        match &self.kind {
            StepKind::Evaluate { model } => implied.push(model.clone()),
            StepKind::Predict { model, input } => {
                implied.push(model.clone());
                implied.push(input.clone());
            }
            _ => {}
        }
        for template in self.templates() {
            for expression in parse_template(&self.name, template)? {
                if let TemplateExpression::Step(step_id) = expression {
                    implied.push(step_id);
                }
            }
        }
        Ok(implied)
    }

    /// Declared and implied dependencies, de-duplicated, declared ones first.
    pub fn all_dependencies(&self) -> Result<Vec<String>, DriverError> {
        let mut dependencies: Vec<String> = Vec::new();
        for dependency in self.depends_on.iter().cloned().chain(self.implied_dependencies()?) {
            if !dependencies.contains(&dependency) {
                dependencies.push(dependency);
            }
        }
        Ok(dependencies)
    }

    fn templates(&self) -> impl Iterator<Item = &str> {
        self.sql.as_deref().into_iter().chain(self.resource.as_deref())
    }

    /// Self-contained checks that need no knowledge of other steps.
    pub fn validate(&self) -> Result<(), DriverError> {
        let invalid = |reason: String| DriverError::InvalidStep {
            step: self.name.clone(),
            reason,
        };

        if self.name.is_empty() || !self.name.chars().all(|character| character.is_ascii_alphanumeric() || character == '_') {
            return Err(DriverError::InvalidIdentifier {
                identifier: self.name.clone(),
                reason: "step names may only contain letters, digits and underscores".to_string(),
            });
        }

        let needs_sql = matches!(self.kind, StepKind::Query | StepKind::CreateView | StepKind::TrainModel { .. });
        match self.sql.as_deref() {
            None if needs_sql => return Err(invalid(format!("{} steps require 'sql'", self.kind.label()))),
            Some(sql) if sql.trim().is_empty() => return Err(invalid("'sql' must not be empty".to_string())),
            _ => {}
        }

        if self.resource.is_some() && !self.kind.creates_resource() {
            return Err(invalid(format!("'resource' does not apply to {} steps", self.kind.label())));
        }
        if let Some(key) = self.misplaced_options.first() {
            return Err(invalid(format!("option '{key}' only applies to train_model steps")));
        }

        if let StepKind::TrainModel { options, .. } = &self.kind {
            for (key, value) in options {
                if key == "model_type" {
                    return Err(invalid("set the model type with 'model_type', not in 'options'".to_string()));
                }
                if !OPTION_KEY.is_match(key) {
                    return Err(invalid(format!("option '{key}' is not a valid option name")));
                }
                if !is_renderable_option(value) {
                    return Err(invalid(format!("option '{key}' must be a string, number, boolean or array of those")));
                }
            }
        }

        for template in self.templates() {
            for expression in parse_template(&self.name, template)? {
                let applies = match expression {
                    TemplateExpression::Resource => self.kind.creates_resource(),
                    TemplateExpression::Model => matches!(self.kind, StepKind::Evaluate { .. } | StepKind::Predict { .. }),
                    TemplateExpression::Input => matches!(self.kind, StepKind::Predict { .. }),
                    TemplateExpression::ModelType => matches!(self.kind, StepKind::TrainModel { .. }),
                    _ => true,
                };
                if !applies {
                    return Err(DriverError::UnresolvedTemplate {
                        step: self.name.clone(),
                        expression: expression_label(&expression),
                    });
                }
            }
        }

        if let Some(resource) = self.resource.as_deref()
            && parse_template(&self.name, resource)?
                .iter()
                .any(|expression| matches!(expression, TemplateExpression::Resource))
        {
            return Err(invalid("'resource' cannot reference itself".to_string()));
        }

        Ok(())
    }
}

fn is_renderable_option(value: &Value) -> bool {
    match value {
        Value::String(_) | Value::Number(_) | Value::Bool(_) => true,
        Value::Array(items) => items.iter().all(|item| matches!(item, Value::String(_) | Value::Number(_) | Value::Bool(_))),
        Value::Null | Value::Object(_) => false,
    }
}

fn expression_label(expression: &TemplateExpression) -> String {
    match expression {
        TemplateExpression::Dataset => "dataset".to_string(),
        TemplateExpression::Project => "project".to_string(),
        TemplateExpression::Location => "location".to_string(),
        TemplateExpression::SampleFraction => "sample_fraction".to_string(),
        TemplateExpression::Resource => "resource".to_string(),
        TemplateExpression::Model => "model".to_string(),
        TemplateExpression::Input => "input".to_string(),
        TemplateExpression::ModelType => "model_type".to_string(),
        TemplateExpression::Step(step_id) => format!("steps.{step_id}"),
    }
}
