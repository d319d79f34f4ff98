//! The workflow driver: step registration, dependency-ordered execution and
//! session state (statuses, created resources, history).

use std::iter;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use indexmap::IndexMap;
use propensity_types::workflow::{RunEvent, RunStatus, StepStatus};
use propensity_warehouse::Warehouse;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::DriverConfig;
use crate::error::DriverError;
use crate::executor::planning::{order_steps_for_execution, plan_for_target};
use crate::executor::resources::{ResourceLocks, ResourceRegistry};
use crate::executor::statement::{StatementScope, prepare_statement, resource_name_for};
use crate::executor::step_once::{ExecutedStep, StepContext, StepFailure, execute_step};
use crate::executor::types::{StepOutput, StepRecord};
use crate::model::{StepDefinition, StepKind, WorkflowDocument};
use crate::templates::referenced_steps;

/// Registered steps, in registration order.
#[derive(Debug, Clone, Default)]
pub struct Workflow {
    steps: IndexMap<String, StepDefinition>,
}

impl Workflow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a workflow from a document, registering its steps as one batch.
    pub fn from_document(document: WorkflowDocument) -> Result<Self, DriverError> {
        let definitions = document
            .steps
            .into_iter()
            .map(|step| step.into_definition())
            .collect::<Result<Vec<_>, _>>()?;
        let mut workflow = Self::new();
        workflow.define_steps(definitions)?;
        Ok(workflow)
    }

    /// Register one step. Every dependency must already be registered, so a
    /// workflow built only through this method cannot contain a cycle.
    pub fn define_step(&mut self, step: StepDefinition) -> Result<(), DriverError> {
        step.validate()?;
        if self.steps.contains_key(&step.name) {
            return Err(DriverError::DuplicateStep { name: step.name });
        }
        check_references(&step, |name| self.steps.get(name))?;
        self.steps.insert(step.name.clone(), step);
        Ok(())
    }

    /// Register several steps at once. Steps may reference each other in any
    /// order; nothing is registered unless every step is valid. Cycles are
    /// reported when the workflow is planned.
    pub fn define_steps<I>(&mut self, steps: I) -> Result<(), DriverError>
    where
        I: IntoIterator<Item = StepDefinition>,
    {
        let mut batch: IndexMap<String, StepDefinition> = IndexMap::new();
        for step in steps {
            step.validate()?;
            if self.steps.contains_key(&step.name) || batch.contains_key(&step.name) {
                return Err(DriverError::DuplicateStep { name: step.name });
            }
            batch.insert(step.name.clone(), step);
        }
        for step in batch.values() {
            check_references(step, |name| batch.get(name).or_else(|| self.steps.get(name)))?;
        }
        self.steps.extend(batch);
        Ok(())
    }

    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.get(name)
    }

    pub fn steps(&self) -> impl Iterator<Item = &StepDefinition> {
        self.steps.values()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Every step, dependencies first, ties broken by registration order.
    pub fn execution_order(&self) -> Result<Vec<&StepDefinition>, DriverError> {
        order_steps_for_execution(&self.steps)
    }

    /// `target` preceded by its transitive dependencies.
    pub fn plan_for(&self, target: &str) -> Result<Vec<&StepDefinition>, DriverError> {
        plan_for_target(&self.steps, target)
    }
}

fn check_references<'a, F>(step: &StepDefinition, lookup: F) -> Result<(), DriverError>
where
    F: Fn(&str) -> Option<&'a StepDefinition>,
{
    let find = |reference: &str| {
        lookup(reference).ok_or_else(|| DriverError::UnknownDependency {
            step: step.name.clone(),
            dependency: reference.to_string(),
        })
    };
    let expect_kind = |reference: &str, expected: &'static str, matches: fn(&StepKind) -> bool| -> Result<(), DriverError> {
        if matches(&find(reference)?.kind) {
            Ok(())
        } else {
            Err(DriverError::KindMismatch {
                step: step.name.clone(),
                reference: reference.to_string(),
                expected,
            })
        }
    };

    for dependency in step.all_dependencies()? {
        find(&dependency)?;
    }
    match &step.kind {
        StepKind::Evaluate { model } => expect_kind(model, "train_model", |kind| matches!(kind, StepKind::TrainModel { .. }))?,
        StepKind::Predict { model, input } => {
            expect_kind(model, "train_model", |kind| matches!(kind, StepKind::TrainModel { .. }))?;
            expect_kind(input, "create_view", |kind| matches!(kind, StepKind::CreateView))?;
        }
        _ => {}
    }
    for template in step.sql.iter().chain(step.resource.iter()) {
        for reference in referenced_steps(&step.name, template)? {
            expect_kind(&reference, "resource-creating", StepKind::creates_resource)?;
        }
    }
    Ok(())
}

/// Statement a step would submit, rendered without contacting the warehouse.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedStatement {
    pub step_id: String,
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    pub sql: String,
}

/// Executes a workflow against a warehouse and tracks the session's state.
///
/// The dataset is ensured once per driver, before the first submission.
/// Resources created by earlier steps stay registered after a failure, so a
/// later `run` resumes where the session stopped.
pub struct Driver {
    pub(crate) workflow: Workflow,
    pub(crate) warehouse: Arc<dyn Warehouse>,
    pub(crate) config: DriverConfig,
    pub(crate) resources: ResourceRegistry,
    pub(crate) locks: ResourceLocks,
    pub(crate) statuses: IndexMap<String, StepStatus>,
    pub(crate) history: Vec<StepRecord>,
    pub(crate) cancel: CancellationToken,
    pub(crate) events: Option<UnboundedSender<RunEvent>>,
    dataset_ready: bool,
}

impl Driver {
    pub fn new(config: DriverConfig, warehouse: Arc<dyn Warehouse>) -> Self {
        Self {
            workflow: Workflow::new(),
            warehouse,
            config,
            resources: ResourceRegistry::default(),
            locks: ResourceLocks::default(),
            statuses: IndexMap::new(),
            history: Vec::new(),
            cancel: CancellationToken::new(),
            events: None,
            dataset_ready: false,
        }
    }

    /// Replace the registered steps. Every step starts `PENDING`.
    pub fn with_workflow(mut self, workflow: Workflow) -> Self {
        self.statuses = workflow.steps().map(|step| (step.name.clone(), StepStatus::Pending)).collect();
        self.workflow = workflow;
        self
    }

    /// Stream lifecycle events to `events`. Send failures are ignored.
    pub fn with_event_sender(mut self, events: UnboundedSender<RunEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn define_step(&mut self, step: StepDefinition) -> Result<(), DriverError> {
        let name = step.name.clone();
        self.workflow.define_step(step)?;
        self.statuses.insert(name, StepStatus::Pending);
        Ok(())
    }

    pub fn define_steps<I>(&mut self, steps: I) -> Result<(), DriverError>
    where
        I: IntoIterator<Item = StepDefinition>,
    {
        let steps: Vec<StepDefinition> = steps.into_iter().collect();
        let names: Vec<String> = steps.iter().map(|step| step.name.clone()).collect();
        self.workflow.define_steps(steps)?;
        for name in names {
            self.statuses.insert(name, StepStatus::Pending);
        }
        Ok(())
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn status(&self, step: &str) -> Option<StepStatus> {
        self.statuses.get(step).copied()
    }

    /// Current status of every registered step, in registration order.
    pub fn statuses(&self) -> &IndexMap<String, StepStatus> {
        &self.statuses
    }

    /// Every step execution (and skip) of the session, in order.
    pub fn history(&self) -> &[StepRecord] {
        &self.history
    }

    /// True when any step's latest execution ended `FAILED`.
    pub fn any_failed(&self) -> bool {
        self.statuses.values().any(|status| *status == StepStatus::Failed)
    }

    pub fn resources(&self) -> &ResourceRegistry {
        &self.resources
    }

    /// Token that cancels in-flight steps when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Install a fresh token after a cancellation so steps can run again.
    pub fn reset_cancellation(&mut self) -> CancellationToken {
        self.cancel = CancellationToken::new();
        self.cancel.clone()
    }

    /// Render every statement in execution order without submitting anything.
    ///
    /// Resources are assumed to be created under their planned names, so the
    /// rendered SQL matches what `run_all` would submit.
    pub fn preview(&self) -> Result<Vec<PlannedStatement>, DriverError> {
        let mut planned_names = self.resources.step_names();
        let mut planned = Vec::with_capacity(self.workflow.len());

        for step in self.workflow.execution_order()? {
            let scope = StatementScope {
                config: &self.config,
                resources: &planned_names,
            };
            let prepared = prepare_statement(step, scope)?;
            if let Some(name) = resource_name_for(step, scope)? {
                planned_names.insert(step.name.clone(), name);
            }
            planned.push(PlannedStatement {
                step_id: step.name.clone(),
                kind: step.kind.label(),
                depends_on: step.all_dependencies()?,
                resource: prepared.resource_name.map(|name| name.to_string()),
                sql: prepared.sql,
            });
        }
        Ok(planned)
    }

    /// Run `target`, first running each transitive dependency that has not
    /// already succeeded in this session.
    pub async fn run(&mut self, target: &str) -> Result<StepOutput, DriverError> {
        let plan: Vec<StepDefinition> = self.workflow.plan_for(target)?.into_iter().cloned().collect();
        let Some((target_step, dependencies)) = plan.split_last() else {
            return Err(DriverError::UnknownStep { name: target.to_string() });
        };
        self.ensure_dataset().await?;

        for (index, dependency) in dependencies.iter().enumerate() {
            if self.status(&dependency.name) == Some(StepStatus::Succeeded) {
                continue;
            }
            if let Err(error) = self.execute_sequential(dependency).await {
                let unattempted: Vec<&StepDefinition> = dependencies[index + 1..].iter().chain(iter::once(target_step)).collect();
                self.skip_steps(unattempted);
                return Err(error);
            }
        }

        self.execute_sequential(target_step).await
    }

    /// Run every registered step once, dependencies first. The first failure
    /// halts the run and the remaining steps are marked `SKIPPED`.
    pub async fn run_all(&mut self) -> Result<Vec<StepRecord>, DriverError> {
        let order: Vec<StepDefinition> = self.workflow.execution_order()?.into_iter().cloned().collect();
        self.ensure_dataset().await?;

        let first_record = self.history.len();
        self.emit(RunEvent::RunStarted {
            at: Utc::now(),
            step_count: order.len(),
        });
        info!(steps = order.len(), "workflow execution started");

        for (index, step) in order.iter().enumerate() {
            if let Err(error) = self.execute_sequential(step).await {
                self.skip_steps(order[index + 1..].iter());
                self.complete_run(if error.is_cancelled() { RunStatus::Cancelled } else { RunStatus::Failed });
                return Err(error);
            }
        }

        self.complete_run(RunStatus::Succeeded);
        Ok(self.history[first_record..].to_vec())
    }

    pub(crate) async fn ensure_dataset(&mut self) -> Result<(), DriverError> {
        if self.dataset_ready {
            return Ok(());
        }
        let dataset = self.config.dataset_ref();
        self.warehouse
            .ensure_dataset(&dataset)
            .await
            .map_err(|error| DriverError::DatasetUnavailable {
                dataset: dataset.dataset.clone(),
                message: error.message,
            })?;
        info!(dataset = %dataset.dataset, "dataset ready");
        self.dataset_ready = true;
        Ok(())
    }

    async fn execute_sequential(&mut self, step: &StepDefinition) -> Result<StepOutput, DriverError> {
        self.mark_started(&step.name);
        let started = Instant::now();
        let resources = self.resources.step_names();
        let events = self.events.clone();
        let step_id = step.name.clone();
        let on_poll = move |attempt| send_event(events.as_ref(), RunEvent::StepPolled { step_id: step_id.clone(), attempt });

        let context = StepContext {
            warehouse: self.warehouse.as_ref(),
            config: &self.config,
            resources: &resources,
            locks: &self.locks,
            cancel: &self.cancel,
        };
        let result = execute_step(step, context, on_poll).await;
        self.finish_step(&step.name, result, started.elapsed())
    }

    pub(crate) fn mark_started(&mut self, step_id: &str) {
        self.statuses.insert(step_id.to_string(), StepStatus::Running);
        info!(step_id, "step execution started");
        self.emit(RunEvent::StepStarted {
            step_id: step_id.to_string(),
            started_at: Utc::now(),
        });
    }

    /// Record the outcome of one execution in the session state and emit `StepFinished`.
    pub(crate) fn finish_step(
        &mut self,
        step_id: &str,
        result: Result<ExecutedStep, StepFailure>,
        elapsed: Duration,
    ) -> Result<StepOutput, DriverError> {
        let duration_ms = elapsed.as_millis().try_into().unwrap_or(u64::MAX);
        let (record, outcome) = match result {
            Ok(executed) => {
                if let Some((name, handle)) = executed.created {
                    self.resources.register(step_id, name, handle, executed.sql.clone());
                }
                info!(step_id, polls = executed.polls, duration_ms, "step execution finished");
                let record = StepRecord {
                    id: step_id.to_string(),
                    status: StepStatus::Succeeded,
                    polls: executed.polls,
                    duration_ms,
                    output: Some(executed.output.clone()),
                    message: None,
                    sql: Some(executed.sql),
                };
                (record, Ok(executed.output))
            }
            Err(StepFailure { error, polls }) => {
                let status = if error.is_cancelled() { StepStatus::Cancelled } else { StepStatus::Failed };
                warn!(step_id, %status, error = %error, "step execution failed");
                let record = StepRecord {
                    id: step_id.to_string(),
                    status,
                    polls,
                    duration_ms,
                    output: None,
                    message: Some(error.to_string()),
                    sql: error.offending_sql().map(str::to_string),
                };
                (record, Err(error))
            }
        };

        self.statuses.insert(step_id.to_string(), record.status);
        self.emit(RunEvent::StepFinished {
            step_id: step_id.to_string(),
            status: record.status,
            duration_ms,
            message: record.message.clone(),
        });
        self.history.push(record);
        outcome
    }

    /// Mark steps that were not attempted because the run halted.
    pub(crate) fn skip_steps<'a, I>(&mut self, steps: I)
    where
        I: IntoIterator<Item = &'a StepDefinition>,
    {
        for step in steps {
            if self.status(&step.name) == Some(StepStatus::Succeeded) {
                continue;
            }
            info!(step_id = %step.name, "step execution skipped");
            self.statuses.insert(step.name.clone(), StepStatus::Skipped);
            self.emit(RunEvent::StepFinished {
                step_id: step.name.clone(),
                status: StepStatus::Skipped,
                duration_ms: 0,
                message: None,
            });
            self.history.push(StepRecord {
                id: step.name.clone(),
                status: StepStatus::Skipped,
                polls: 0,
                duration_ms: 0,
                output: None,
                message: None,
                sql: None,
            });
        }
    }

    pub(crate) fn complete_run(&mut self, status: RunStatus) {
        info!(?status, "workflow execution finished");
        self.emit(RunEvent::RunCompleted {
            status,
            finished_at: Utc::now(),
        });
    }

    pub(crate) fn emit(&self, event: RunEvent) {
        send_event(self.events.as_ref(), event);
    }
}

pub(crate) fn send_event(events: Option<&UnboundedSender<RunEvent>>, event: RunEvent) {
    if let Some(events) = events {
        let _ = events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedWarehouse;
    use propensity_types::workflow::CancelReason;
    use propensity_types::{JobState, ModelType, RemoteError, Row, RowSet};
    use serde_json::json;

    fn driver(warehouse: Arc<ScriptedWarehouse>) -> Driver {
        Driver::new(DriverConfig::new("bqml_tutorial"), warehouse)
    }

    fn tutorial_steps() -> Vec<StepDefinition> {
        vec![
            StepDefinition::create_view("training_data", "SELECT label, os FROM sessions"),
            StepDefinition::train_model("logistic_model", ModelType::LogisticReg, "SELECT * FROM `${{ steps.training_data }}`")
                .with_option("input_label_cols", json!(["label"])),
            StepDefinition::create_view("july_sessions", "SELECT os FROM july"),
            StepDefinition::predict("predictions", "logistic_model", "july_sessions"),
        ]
    }

    fn statuses(driver: &Driver) -> Vec<(String, StepStatus)> {
        driver.statuses().iter().map(|(name, status)| (name.clone(), *status)).collect()
    }

    #[test]
    fn duplicate_registration_keeps_the_first_definition() {
        let mut workflow = Workflow::new();
        workflow.define_step(StepDefinition::query("raw_query", "SELECT 1")).expect("first");

        let error = workflow
            .define_step(StepDefinition::query("raw_query", "SELECT 2"))
            .expect_err("duplicate");
        assert_eq!(error, DriverError::DuplicateStep { name: "raw_query".into() });
        assert_eq!(workflow.step("raw_query").and_then(|step| step.sql.as_deref()), Some("SELECT 1"));
        assert_eq!(workflow.len(), 1);
    }

    #[test]
    fn single_registration_requires_known_dependencies() {
        let mut workflow = Workflow::new();
        let error = workflow
            .define_step(StepDefinition::query("info", "SELECT 1").depends_on(["model"]))
            .expect_err("unknown");
        assert_eq!(
            error,
            DriverError::UnknownDependency {
                step: "info".into(),
                dependency: "model".into()
            }
        );

        let error = workflow
            .define_step(StepDefinition::query("loop", "SELECT 1").depends_on(["loop"]))
            .expect_err("self");
        assert!(matches!(error, DriverError::UnknownDependency { .. }));
        assert!(workflow.is_empty());
    }

    #[test]
    fn references_must_point_at_the_right_kind() {
        let mut workflow = Workflow::new();
        workflow.define_step(StepDefinition::query("raw_query", "SELECT 1")).expect("query");
        workflow.define_step(StepDefinition::create_view("view", "SELECT 1")).expect("view");

        let error = workflow
            .define_step(StepDefinition::evaluate("evaluation", "view"))
            .expect_err("view is not a model");
        assert_eq!(
            error,
            DriverError::KindMismatch {
                step: "evaluation".into(),
                reference: "view".into(),
                expected: "train_model"
            }
        );

        let error = workflow
            .define_step(StepDefinition::query("q", "SELECT * FROM `${{ steps.raw_query }}`"))
            .expect_err("queries create nothing");
        assert!(matches!(error, DriverError::KindMismatch { expected: "resource-creating", .. }));
    }

    #[test]
    fn batch_registration_allows_forward_references_and_is_atomic() {
        let mut workflow = Workflow::new();
        workflow
            .define_steps(vec![
                StepDefinition::query("info", "SELECT * FROM ML.TRAINING_INFO(MODEL `${{ steps.model }}`)"),
                StepDefinition::train_model("model", ModelType::LogisticReg, "SELECT 1 AS label"),
            ])
            .expect("forward reference");
        assert_eq!(workflow.len(), 2);

        let error = workflow
            .define_steps(vec![
                StepDefinition::query("ok", "SELECT 1"),
                StepDefinition::query("broken", "SELECT 1").depends_on(["missing"]),
            ])
            .expect_err("unknown");
        assert!(matches!(error, DriverError::UnknownDependency { .. }));
        assert!(workflow.step("ok").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cycles_fail_at_run_time() {
        let warehouse = Arc::new(ScriptedWarehouse::new());
        let mut driver = driver(Arc::clone(&warehouse));
        driver
            .define_steps(vec![
                StepDefinition::query("a", "SELECT 1").depends_on(["b"]),
                StepDefinition::query("b", "SELECT 2").depends_on(["a"]),
            ])
            .expect("batch registration accepts cycles");

        let error = driver.run_all().await.expect_err("cycle");
        assert_eq!(error, DriverError::Cycle { steps: vec!["a".into(), "b".into()] });
        let error = driver.run("a").await.expect_err("cycle");
        assert!(matches!(error, DriverError::Cycle { .. }));
        assert!(warehouse.submitted_sql().is_empty());
        assert!(warehouse.datasets().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_returns_query_rows_unchanged() {
        let row: Row = [("os".to_string(), json!("Macintosh")), ("visits".to_string(), json!(12))]
            .into_iter()
            .collect();
        let rows = RowSet::from_rows(vec![row]);
        let warehouse = Arc::new(ScriptedWarehouse::new().with_rows("SELECT os", rows.clone()));
        let mut driver = driver(Arc::clone(&warehouse));
        driver
            .define_step(StepDefinition::query("raw_query", "SELECT os, COUNT(*) AS visits FROM t GROUP BY os"))
            .expect("define");

        let output = driver.run("raw_query").await.expect("run");
        assert_eq!(output, StepOutput::Rows(rows));
        assert_eq!(driver.status("raw_query"), Some(StepStatus::Succeeded));
        assert_eq!(warehouse.datasets().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_executes_dependencies_first() {
        let warehouse = Arc::new(ScriptedWarehouse::new());
        let mut driver = driver(Arc::clone(&warehouse));
        driver.define_steps(tutorial_steps()).expect("define");

        let output = driver.run("logistic_model").await.expect("run");
        assert_eq!(output.resource().map(|handle| handle.name.as_str()), Some("bqml_tutorial.logistic_model"));

        let executed: Vec<(&str, StepStatus)> = driver.history().iter().map(|record| (record.id.as_str(), record.status)).collect();
        assert_eq!(
            executed,
            vec![("training_data", StepStatus::Succeeded), ("logistic_model", StepStatus::Succeeded)]
        );
        assert_eq!(driver.status("july_sessions"), Some(StepStatus::Pending));

        driver.run("logistic_model").await.expect("re-run");
        let submitted = warehouse.submitted_sql();
        assert_eq!(submitted.len(), 3, "succeeded dependencies are not re-run: {submitted:?}");
        assert_eq!(driver.resources().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn run_all_visits_each_step_once_dependencies_first() {
        let warehouse = Arc::new(ScriptedWarehouse::new());
        let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut driver = driver(Arc::clone(&warehouse)).with_event_sender(events_tx);
        driver.define_steps(tutorial_steps()).expect("define");

        let records = driver.run_all().await.expect("run all");
        let order: Vec<&str> = records.iter().map(|record| record.id.as_str()).collect();
        assert_eq!(order, vec!["training_data", "logistic_model", "july_sessions", "predictions"]);
        assert!(records.iter().all(|record| record.status == StepStatus::Succeeded));
        assert_eq!(warehouse.submitted_sql().len(), 4);
        assert_eq!(warehouse.datasets().len(), 1);

        let mut events = Vec::new();
        while let Ok(event) = events_rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(events.first(), Some(RunEvent::RunStarted { step_count: 4, .. })));
        assert!(matches!(
            events.last(),
            Some(RunEvent::RunCompleted {
                status: RunStatus::Succeeded,
                ..
            })
        ));
        assert!(events.iter().any(|event| matches!(event, RunEvent::StepPolled { step_id, .. } if step_id == "logistic_model")));
    }

    #[tokio::test(start_paused = true)]
    async fn rerunning_creators_keeps_one_resource_per_name() {
        let warehouse = Arc::new(ScriptedWarehouse::new());
        let mut driver = driver(Arc::clone(&warehouse));
        driver.define_steps(tutorial_steps()).expect("define");

        driver.run_all().await.expect("first");
        driver.run_all().await.expect("second");

        assert_eq!(driver.resources().len(), 3);
        assert_eq!(warehouse.datasets().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_training_halts_the_run() {
        let warehouse = Arc::new(ScriptedWarehouse::new().with_training_states(
            "logistic_model",
            vec![
                JobState::Running,
                JobState::Failed {
                    message: "Input data has only one label".into(),
                },
            ],
        ));
        let mut driver = driver(Arc::clone(&warehouse));
        driver.define_steps(tutorial_steps()).expect("define");

        let error = driver.run_all().await.expect_err("training fails");
        assert!(matches!(error, DriverError::TrainingFailed { ref step, .. } if step == "logistic_model"));
        assert!(error.to_string().contains("Input data has only one label"));

        assert_eq!(
            statuses(&driver),
            vec![
                ("training_data".to_string(), StepStatus::Succeeded),
                ("logistic_model".to_string(), StepStatus::Failed),
                ("july_sessions".to_string(), StepStatus::Skipped),
                ("predictions".to_string(), StepStatus::Skipped),
            ]
        );
        assert!(!warehouse.submitted_sql().iter().any(|sql| sql.contains("ML.PREDICT")));
        assert_eq!(driver.resources().len(), 1);
        assert!(driver.any_failed());
    }

    #[tokio::test(start_paused = true)]
    async fn remote_errors_name_the_step_and_sql() {
        let warehouse = Arc::new(ScriptedWarehouse::new().failing("july", RemoteError::new("Syntax error: Unexpected keyword")));
        let mut driver = driver(Arc::clone(&warehouse));
        driver.define_steps(tutorial_steps()).expect("define");

        let error = driver.run("predictions").await.expect_err("remote failure");
        assert_eq!(
            error,
            DriverError::RemoteExecution {
                step: "july_sessions".into(),
                message: "Syntax error: Unexpected keyword".into(),
                sql: "CREATE OR REPLACE VIEW `bqml_tutorial.july_sessions` AS\nSELECT os FROM july".into(),
                retryable: false,
            }
        );
        assert_eq!(driver.status("predictions"), Some(StepStatus::Skipped));
    }

    #[tokio::test(start_paused = true)]
    async fn max_wait_cancels_and_allows_rerun() {
        let warehouse = Arc::new(ScriptedWarehouse::new().with_training_states("slow_model", vec![JobState::Running]));
        let mut config = DriverConfig::new("bqml_tutorial");
        config.poll_interval = Duration::from_secs(5);
        config.max_wait = Some(Duration::from_secs(12));
        let mut driver = Driver::new(config, Arc::clone(&warehouse) as Arc<dyn Warehouse>);
        driver
            .define_step(StepDefinition::train_model("slow_model", ModelType::DnnClassifier, "SELECT 1 AS label"))
            .expect("define");

        let error = driver.run("slow_model").await.expect_err("timeout");
        assert_eq!(
            error,
            DriverError::Cancelled {
                step: "slow_model".into(),
                reason: CancelReason::MaxWaitExceeded
            }
        );
        assert_eq!(driver.status("slow_model"), Some(StepStatus::Cancelled));
        assert_eq!(warehouse.cancelled_jobs(), vec!["job_1".to_string()]);
        assert!(!driver.any_failed(), "cancellation is not a failure");

        let error = driver.run("slow_model").await.expect_err("still slow");
        assert!(error.is_cancelled());
        assert_eq!(warehouse.submitted_sql().len(), 2, "cancelled steps may be re-run");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_token_marks_steps_cancelled() {
        let warehouse = Arc::new(ScriptedWarehouse::new().with_training_states("logistic_model", vec![JobState::Running]));
        let mut driver = driver(Arc::clone(&warehouse));
        driver.define_steps(tutorial_steps()).expect("define");

        let token = driver.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            token.cancel();
        });

        let error = driver.run_all().await.expect_err("cancelled");
        assert!(matches!(error, DriverError::Cancelled { reason: CancelReason::Requested, .. }));
        assert_eq!(driver.status("logistic_model"), Some(StepStatus::Cancelled));
        assert_eq!(warehouse.cancelled_jobs().len(), 1);

        driver.reset_cancellation();
        driver.run("training_data").await.expect("runs again after reset");
    }

    #[test]
    fn preview_renders_every_statement_without_submitting() {
        let warehouse = Arc::new(ScriptedWarehouse::new());
        let mut driver = driver(Arc::clone(&warehouse));
        driver.define_steps(tutorial_steps()).expect("define");

        let planned = driver.preview().expect("preview");
        let ids: Vec<&str> = planned.iter().map(|statement| statement.step_id.as_str()).collect();
        assert_eq!(ids, vec!["training_data", "logistic_model", "july_sessions", "predictions"]);
        assert!(planned[1].sql.contains("FROM `bqml_tutorial.training_data`"));
        assert_eq!(
            planned[3].sql,
            "SELECT * FROM ML.PREDICT(MODEL `bqml_tutorial.logistic_model`, TABLE `bqml_tutorial.july_sessions`)"
        );
        assert!(warehouse.submitted_sql().is_empty());
    }
}
