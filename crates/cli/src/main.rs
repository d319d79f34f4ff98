use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use propensity_engine::config::{MaxWaitSetting, load_config, load_config_from_path};
use propensity_engine::{BUNDLED_WORKFLOW, ConfigFile, Driver, DriverConfig, StepOutput, Workflow, parse_workflow_file, parse_workflow_str};
use propensity_types::workflow::{RunEvent, StepStatus};
use propensity_util::parse_interval;
use propensity_warehouse::{NoopWarehouse, RestWarehouse, Warehouse};
use tracing::warn;

/// Drive the warehouse purchase-propensity workflow: build training views,
/// train the model, evaluate it and score new sessions.
#[derive(Debug, Parser)]
#[command(name = "propensity", version, about)]
struct Cli {
    #[command(flatten)]
    options: GlobalOptions,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the statements each step would submit, in execution order
    Plan,
    /// Run one step, first running any dependency that has not succeeded
    Run {
        /// Step id
        step: String,
    },
    /// Run every step, dependencies first
    RunAll,
}

#[derive(Debug, Args)]
struct GlobalOptions {
    /// Workflow YAML/JSON file; the bundled tutorial workflow is used when omitted
    #[arg(long, short = 'f', global = true)]
    file: Option<PathBuf>,

    /// Workflow name within a multi-workflow file
    #[arg(long, global = true)]
    workflow: Option<String>,

    /// Configuration file (defaults to PROPENSITY_CONFIG or the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    dataset: Option<String>,

    #[arg(long, global = true)]
    project: Option<String>,

    #[arg(long, global = true)]
    location: Option<String>,

    /// Delay between status checks, e.g. `10s` or `1m`
    #[arg(long, global = true, value_parser = parse_interval)]
    poll_interval: Option<Duration>,

    /// Longest wait on a single job, e.g. `30m`, or `unbounded`
    #[arg(long, global = true)]
    max_wait: Option<String>,

    /// Fraction of training rows to keep, in (0, 1]
    #[arg(long, global = true)]
    sample_fraction: Option<f64>,

    /// Number of independent steps to execute at once
    #[arg(long, global = true)]
    parallel: Option<usize>,

    /// Submit to an in-memory warehouse instead of the REST API
    #[arg(long, global = true)]
    dry_run: bool,

    /// Stream run events to stderr as JSON lines
    #[arg(long, global = true)]
    events: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();

    let config = resolve_config(&cli.options)?;
    let workflow = load_workflow(&cli.options)?;

    let warehouse: Arc<dyn Warehouse> = if cli.options.dry_run || matches!(cli.command, Command::Plan) {
        Arc::new(NoopWarehouse::new())
    } else {
        let project = config
            .project_id
            .as_deref()
            .context("projectId is required to reach the warehouse (set it in the config file, PROPENSITY_PROJECT or --project)")?;
        Arc::new(RestWarehouse::new_from_env(project, config.location.clone())?)
    };

    let mut driver = Driver::new(config, warehouse).with_workflow(workflow);
    if cli.options.events {
        let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel::<RunEvent>();
        driver = driver.with_event_sender(events_tx);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if let Ok(line) = serde_json::to_string(&event) {
                    eprintln!("{line}");
                }
            }
        });
    }

    let cancel = driver.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; abandoning in-flight waits");
            cancel.cancel();
        }
    });

    match cli.command {
        Command::Plan => {
            let planned = driver.preview()?;
            println!("{}", serde_json::to_string_pretty(&planned)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Run { step } => {
            let result = driver.run(&step).await;
            print_statuses(&driver)?;
            match result {
                Ok(output) => {
                    print_output(&step, &output)?;
                    Ok(exit_code(&driver))
                }
                Err(error) if error.is_cancelled() => {
                    eprintln!("{error}");
                    Ok(exit_code(&driver))
                }
                Err(error) => Err(anyhow!(error)),
            }
        }
        Command::RunAll => {
            let result = if driver.config().max_parallel_steps > 1 {
                driver.run_all_concurrent().await
            } else {
                driver.run_all().await
            };
            print_statuses(&driver)?;
            match result {
                Ok(_) => Ok(exit_code(&driver)),
                Err(error) if error.is_cancelled() => {
                    eprintln!("{error}");
                    Ok(exit_code(&driver))
                }
                Err(error) => Err(anyhow!(error)),
            }
        }
    }
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Layers the config file, then environment overrides, then flags.
fn resolve_config(options: &GlobalOptions) -> Result<DriverConfig> {
    let mut file = match &options.config {
        Some(path) => load_config_from_path(path)?,
        None => load_config()?,
    };
    file.apply_env_overrides();
    apply_flags(&mut file, options);
    Ok(file.into_driver_config()?)
}

fn apply_flags(file: &mut ConfigFile, options: &GlobalOptions) {
    if let Some(dataset) = &options.dataset {
        file.dataset_id = Some(dataset.clone());
    }
    if let Some(project) = &options.project {
        file.project_id = Some(project.clone());
    }
    if let Some(location) = &options.location {
        file.location = Some(location.clone());
    }
    if let Some(interval) = options.poll_interval {
        file.poll_interval_seconds = Some(interval.as_secs_f64());
    }
    if let Some(max_wait) = &options.max_wait {
        file.max_wait_seconds = Some(match parse_interval(max_wait) {
            Ok(duration) => MaxWaitSetting::Seconds(duration.as_secs_f64()),
            Err(_) => MaxWaitSetting::Keyword(max_wait.clone()),
        });
    }
    if let Some(fraction) = options.sample_fraction {
        file.sample_fraction = Some(fraction);
    }
    if let Some(parallel) = options.parallel {
        file.max_parallel_steps = Some(parallel);
    }
}

fn load_workflow(options: &GlobalOptions) -> Result<Workflow> {
    let bundle = match &options.file {
        Some(path) => parse_workflow_file(path)?,
        None => parse_workflow_str(BUNDLED_WORKFLOW).context("bundled workflow")?,
    };
    let document = match &options.workflow {
        Some(name) => bundle
            .workflows
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("workflow '{name}' not found in file"))?,
        None => bundle.workflows.into_values().next().context("workflow file contains no workflows")?,
    };
    Ok(Workflow::from_document(document)?)
}

/// Prints every step's status in execution order.
fn print_statuses(driver: &Driver) -> Result<()> {
    for step in driver.workflow().execution_order()? {
        let status = driver.status(&step.name).unwrap_or(StepStatus::Pending);
        let record = driver.history().iter().rev().find(|record| record.id == step.name);
        let detail = record
            .and_then(|record| match (&record.output, &record.message) {
                (Some(output), _) => Some(output.summary()),
                (None, Some(message)) => Some(message.clone()),
                (None, None) => None,
            })
            .unwrap_or_default();
        println!("{:<28} {:<10} {detail}", step.name, status);
    }
    Ok(())
}

fn print_output(step: &str, output: &StepOutput) -> Result<()> {
    match output {
        StepOutput::Rows(rows) | StepOutput::Predictions(rows) => println!("{}", serde_json::to_string_pretty(&rows.rows)?),
        StepOutput::Metrics(metrics) => println!("{}", serde_json::to_string_pretty(metrics)?),
        other => println!("{step}: {}", other.summary()),
    }
    Ok(())
}

fn exit_code(driver: &Driver) -> ExitCode {
    if driver.any_failed() { ExitCode::FAILURE } else { ExitCode::SUCCESS }
}
