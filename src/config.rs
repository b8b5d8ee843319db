//! Harvester configuration, loaded from a JSON file.
//!
//! Every field has a default, so an empty object (or no file at all) is a
//! valid configuration. Command-line flags are applied on top by the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::kaggle::ResourceKind;
use crate::retry::RetryPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Settings for the Kaggle command-line collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KaggleConfig {
    /// Executable to invoke.
    pub program: String,
    pub command_timeout_secs: u64,
    /// Datasets listed below this usability rating are not harvested.
    pub min_usability: f64,
    /// Page size requested from listings that accept one.
    pub page_size: u32,
}

impl Default for KaggleConfig {
    fn default() -> Self {
        Self {
            program: "kaggle".to_string(),
            command_timeout_secs: 600,
            min_usability: 0.8,
            page_size: 20,
        }
    }
}

impl KaggleConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    /// Directory for per-run log files. Console only when absent.
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            log_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub target: Option<ResourceKind>,
    /// Root of the per-item scratch directories.
    pub work_dir: PathBuf,
    /// Page artifacts and downloaded content.
    pub output_dir: PathBuf,
    /// Checkpoint files.
    pub state_dir: PathBuf,
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub step_timeout_secs: u64,
    /// Leave item workspaces on disk after processing.
    pub keep_workspaces: bool,
    pub kaggle: KaggleConfig,
    pub logging: LoggingConfig,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            target: None,
            work_dir: PathBuf::from("local_workspace/tmp"),
            output_dir: PathBuf::from("local_workspace/output"),
            state_dir: PathBuf::from("setting"),
            concurrency: crate::executor::DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
            step_timeout_secs: 300,
            keep_workspaces: false,
            kaggle: KaggleConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl HarvestConfig {
    /// Reads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON, or
    /// fails [`HarvestConfig::validate`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges, reporting every problem at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.concurrency == 0 {
            errors.push("concurrency must be at least 1".to_string());
        }
        if self.retry.max_attempts == 0 {
            errors.push("retry.max_attempts must be at least 1".to_string());
        }
        if self.retry.backoff_factor.is_nan() || self.retry.backoff_factor < 1.0 {
            errors.push(format!(
                "retry.backoff_factor must be >= 1.0, got {}",
                self.retry.backoff_factor
            ));
        }
        if self.retry.jitter_min_ms > self.retry.jitter_max_ms {
            errors.push(format!(
                "retry.jitter_min_ms ({}) exceeds retry.jitter_max_ms ({})",
                self.retry.jitter_min_ms, self.retry.jitter_max_ms
            ));
        }
        if self.step_timeout_secs == 0 {
            errors.push("step_timeout_secs must be > 0".to_string());
        }
        if self.kaggle.program.trim().is_empty() {
            errors.push("kaggle.program must not be empty".to_string());
        }
        if self.kaggle.command_timeout_secs == 0 {
            errors.push("kaggle.command_timeout_secs must be > 0".to_string());
        }
        if self.kaggle.page_size == 0 {
            errors.push("kaggle.page_size must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    /// Directory holding the page artifacts of `kind`.
    pub fn pages_dir(&self, kind: ResourceKind) -> PathBuf {
        self.output_dir.join(kind.as_str()).join("pages")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), body).unwrap();
        file
    }

    #[test]
    fn test_empty_object_gives_defaults() {
        let file = write_config("{}");
        let config = HarvestConfig::load(file.path()).unwrap();
        assert_eq!(config, HarvestConfig::default());
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.kaggle.program, "kaggle");
        assert_eq!(config.step_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_partial_override() {
        let file = write_config(
            r#"{
                "target": "models",
                "concurrency": 2,
                "retry": { "max_attempts": 6 },
                "kaggle": { "min_usability": 0.5 },
                "logging": { "log_dir": "logs" }
            }"#,
        );
        let config = HarvestConfig::load(file.path()).unwrap();
        assert_eq!(config.target, Some(ResourceKind::Models));
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.retry.max_attempts, 6);
        assert_eq!(config.retry.base_delay_ms, 3_000);
        assert_eq!(config.kaggle.min_usability, 0.5);
        assert_eq!(config.kaggle.page_size, 20);
        assert_eq!(config.logging.log_dir, Some(PathBuf::from("logs")));
        assert_eq!(
            config.pages_dir(ResourceKind::Models),
            PathBuf::from("local_workspace/output/models/pages")
        );
    }

    #[test]
    fn test_validation_reports_every_problem() {
        let file = write_config(
            r#"{
                "concurrency": 0,
                "retry": { "backoff_factor": 0.5, "jitter_min_ms": 10, "jitter_max_ms": 1 }
            }"#,
        );
        match HarvestConfig::load(file.path()) {
            Err(ConfigError::Invalid(errors)) => {
                assert_eq!(errors.len(), 3);
                assert!(errors[0].contains("concurrency"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_target_is_parse_error() {
        let file = write_config(r#"{ "target": "notebooks" }"#);
        assert!(matches!(
            HarvestConfig::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = HarvestConfig::load(Path::new("/nonexistent/harvester.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("/nonexistent/harvester.json"));
    }
}
