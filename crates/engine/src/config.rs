//! Driver configuration: file loading, environment overrides and validation.
//!
//! The file lives at `<config dir>/propensity/config.json` unless
//! `PROPENSITY_CONFIG` points elsewhere. A missing file is not an error; the
//! dataset id can come entirely from the environment or the command line.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use dirs_next::config_dir;
use propensity_types::DatasetRef;
use propensity_util::expand_tilde;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identifier::validate_dataset_id;

pub const CONFIG_PATH_ENV: &str = "PROPENSITY_CONFIG";
pub const DATASET_ENV: &str = "PROPENSITY_DATASET";
pub const PROJECT_ENV: &str = "PROPENSITY_PROJECT";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("datasetId is required (set it in the config file, {DATASET_ENV} or --dataset)")]
    MissingDataset,

    #[error("invalid datasetId '{dataset}': {reason}")]
    InvalidDataset { dataset: String, reason: String },

    #[error("pollIntervalSeconds must be greater than zero, got {0}")]
    InvalidPollInterval(f64),

    #[error("maxWaitSeconds must be a positive number or \"unbounded\", got {0}")]
    InvalidMaxWait(String),

    #[error("sampleFraction must be in (0, 1], got {0}")]
    InvalidSampleFraction(f64),

    #[error("maxParallelSteps must be at least 1")]
    InvalidParallelism,
}

/// `maxWaitSeconds` as written in the file: a number of seconds or `"unbounded"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MaxWaitSetting {
    Seconds(f64),
    Keyword(String),
}

/// Raw configuration file contents. Every field is optional so files,
/// environment variables and flags can be layered before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_wait_seconds: Option<MaxWaitSetting>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_fraction: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_transient_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel_steps: Option<usize>,
}

impl ConfigFile {
    /// Apply `PROPENSITY_DATASET` and `PROPENSITY_PROJECT` when set.
    pub fn apply_env_overrides(&mut self) {
        if let Some(dataset) = non_empty_env(DATASET_ENV) {
            self.dataset_id = Some(dataset);
        }
        if let Some(project) = non_empty_env(PROJECT_ENV) {
            self.project_id = Some(project);
        }
    }

    /// Validate and convert into a [`DriverConfig`].
    pub fn into_driver_config(self) -> Result<DriverConfig, ConfigError> {
        let dataset_id = self.dataset_id.ok_or(ConfigError::MissingDataset)?;
        let mut config = DriverConfig::new(dataset_id);
        config.project_id = self.project_id;
        config.location = self.location;

        if let Some(seconds) = self.poll_interval_seconds {
            config.poll_interval = Duration::try_from_secs_f64(seconds)
                .ok()
                .filter(|interval| !interval.is_zero())
                .ok_or(ConfigError::InvalidPollInterval(seconds))?;
        }
        config.max_wait = match self.max_wait_seconds {
            None => None,
            Some(MaxWaitSetting::Keyword(keyword)) if keyword.eq_ignore_ascii_case("unbounded") => None,
            Some(MaxWaitSetting::Keyword(other)) => return Err(ConfigError::InvalidMaxWait(other)),
            Some(MaxWaitSetting::Seconds(seconds)) => Some(
                Duration::try_from_secs_f64(seconds)
                    .ok()
                    .filter(|max_wait| !max_wait.is_zero())
                    .ok_or_else(|| ConfigError::InvalidMaxWait(seconds.to_string()))?,
            ),
        };
        if let Some(fraction) = self.sample_fraction {
            config.sample_fraction = fraction;
        }
        if let Some(retries) = self.max_transient_retries {
            config.max_transient_retries = retries;
        }
        if let Some(parallel) = self.max_parallel_steps {
            config.max_parallel_steps = parallel;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Validated settings for one driver session.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverConfig {
    pub dataset_id: String,
    pub project_id: Option<String>,
    pub location: Option<String>,
    /// Delay between status checks of a long-running job
    pub poll_interval: Duration,
    /// Upper bound on a single poll loop; `None` waits indefinitely
    pub max_wait: Option<Duration>,
    /// Fraction of training rows to keep, in (0, 1]
    pub sample_fraction: f64,
    /// Resubmissions of a non-training statement after a retryable failure
    pub max_transient_retries: u32,
    pub max_parallel_steps: usize,
}

impl DriverConfig {
    /// Defaults: 10 second polls, unbounded wait, full sample, no retries, sequential.
    pub fn new(dataset_id: impl Into<String>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            project_id: None,
            location: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_wait: None,
            sample_fraction: 1.0,
            max_transient_retries: 0,
            max_parallel_steps: 1,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_dataset_id(&self.dataset_id).map_err(|error| ConfigError::InvalidDataset {
            dataset: self.dataset_id.clone(),
            reason: error.to_string(),
        })?;
        if self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidPollInterval(0.0));
        }
        if let Some(max_wait) = self.max_wait
            && max_wait.is_zero()
        {
            return Err(ConfigError::InvalidMaxWait("0".to_string()));
        }
        if !(self.sample_fraction > 0.0 && self.sample_fraction <= 1.0) {
            return Err(ConfigError::InvalidSampleFraction(self.sample_fraction));
        }
        if self.max_parallel_steps == 0 {
            return Err(ConfigError::InvalidParallelism);
        }
        Ok(())
    }

    pub fn dataset_ref(&self) -> DatasetRef {
        DatasetRef {
            project: self.project_id.clone(),
            dataset: self.dataset_id.clone(),
            location: self.location.clone(),
        }
    }
}

/// Returns the default path for the driver configuration file.
pub fn default_config_path() -> PathBuf {
    if let Some(path) = non_empty_env(CONFIG_PATH_ENV) {
        return expand_tilde(&path);
    }

    config_dir().unwrap_or_else(|| PathBuf::from(".")).join("propensity").join("config.json")
}

/// Loads the configuration file from the default path.
pub fn load_config() -> anyhow::Result<ConfigFile> {
    load_config_from_path(&default_config_path())
}

/// Loads a configuration file, returning defaults when it does not exist.
pub fn load_config_from_path(path: &Path) -> anyhow::Result<ConfigFile> {
    if !path.exists() {
        return Ok(ConfigFile::default());
    }

    let content = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    let config: ConfigFile = serde_json::from_str(&content).with_context(|| format!("parse config {}", path.display()))?;
    Ok(config)
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_path_honors_environment_override() {
        let override_path = "~/custom/propensity/config.json";
        temp_env::with_var(CONFIG_PATH_ENV, Some(override_path), || {
            assert_eq!(default_config_path(), expand_tilde(override_path));
        });
    }

    #[test]
    fn loads_camel_case_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            file,
            r#"{{"datasetId":"bqml_tutorial","pollIntervalSeconds":2.5,"maxWaitSeconds":"unbounded","sampleFraction":0.1,"maxParallelSteps":3}}"#
        )
        .expect("write");

        let config = load_config_from_path(file.path())
            .expect("load")
            .into_driver_config()
            .expect("valid");
        assert_eq!(config.dataset_id, "bqml_tutorial");
        assert_eq!(config.poll_interval, Duration::from_millis(2_500));
        assert_eq!(config.max_wait, None);
        assert_eq!(config.sample_fraction, 0.1);
        assert_eq!(config.max_parallel_steps, 3);
        assert_eq!(config.max_transient_retries, 0);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let directory = tempfile::tempdir().expect("temp dir");
        let config = load_config_from_path(&directory.path().join("absent.json")).expect("load");
        assert_eq!(config, ConfigFile::default());
        assert_eq!(config.into_driver_config(), Err(ConfigError::MissingDataset));
    }

    #[test]
    fn rejects_out_of_range_values() {
        let base = ConfigFile {
            dataset_id: Some("bqml_tutorial".into()),
            ..ConfigFile::default()
        };

        let zero_poll = ConfigFile {
            poll_interval_seconds: Some(0.0),
            ..base.clone()
        };
        assert_eq!(zero_poll.into_driver_config(), Err(ConfigError::InvalidPollInterval(0.0)));

        for fraction in [0.0, -0.5, 1.5] {
            let sample = ConfigFile {
                sample_fraction: Some(fraction),
                ..base.clone()
            };
            assert_eq!(sample.into_driver_config(), Err(ConfigError::InvalidSampleFraction(fraction)));
        }

        let keyword = ConfigFile {
            max_wait_seconds: Some(MaxWaitSetting::Keyword("forever".into())),
            ..base.clone()
        };
        assert_eq!(keyword.into_driver_config(), Err(ConfigError::InvalidMaxWait("forever".into())));

        let bad_dataset = ConfigFile {
            dataset_id: Some("bqml-tutorial".into()),
            ..base
        };
        assert!(matches!(bad_dataset.into_driver_config(), Err(ConfigError::InvalidDataset { .. })));
    }

    #[test]
    fn environment_overrides_file_values() {
        temp_env::with_vars([(DATASET_ENV, Some("from_env")), (PROJECT_ENV, Some("env-project"))], || {
            let mut config = ConfigFile {
                dataset_id: Some("from_file".into()),
                ..ConfigFile::default()
            };
            config.apply_env_overrides();
            assert_eq!(config.dataset_id.as_deref(), Some("from_env"));
            assert_eq!(config.project_id.as_deref(), Some("env-project"));
        });
    }

    #[test]
    fn oversized_timings_are_rejected() {
        let base = ConfigFile {
            dataset_id: Some("bqml_tutorial".into()),
            ..ConfigFile::default()
        };

        let huge_poll = ConfigFile {
            poll_interval_seconds: Some(1e30),
            ..base.clone()
        };
        assert_eq!(huge_poll.into_driver_config(), Err(ConfigError::InvalidPollInterval(1e30)));

        let infinite_poll = ConfigFile {
            poll_interval_seconds: Some(f64::INFINITY),
            ..base.clone()
        };
        assert!(matches!(infinite_poll.into_driver_config(), Err(ConfigError::InvalidPollInterval(_))));

        let huge_wait = ConfigFile {
            max_wait_seconds: Some(MaxWaitSetting::Seconds(1e30)),
            ..base.clone()
        };
        assert!(matches!(huge_wait.into_driver_config(), Err(ConfigError::InvalidMaxWait(_))));

        let negative_wait = ConfigFile {
            max_wait_seconds: Some(MaxWaitSetting::Seconds(-5.0)),
            ..base
        };
        assert!(matches!(negative_wait.into_driver_config(), Err(ConfigError::InvalidMaxWait(_))));
    }

    #[test]
    fn numeric_max_wait_becomes_a_bound() {
        let config = ConfigFile {
            dataset_id: Some("bqml_tutorial".into()),
            max_wait_seconds: Some(MaxWaitSetting::Seconds(90.0)),
            ..ConfigFile::default()
        }
        .into_driver_config()
        .expect("valid");
        assert_eq!(config.max_wait, Some(Duration::from_secs(90)));

        let far = ConfigFile {
            dataset_id: Some("bqml_tutorial".into()),
            max_wait_seconds: Some(MaxWaitSetting::Seconds(1e19)),
            ..ConfigFile::default()
        }
        .into_driver_config()
        .expect("representable bound");
        assert!(far.max_wait.is_some());
    }
}
