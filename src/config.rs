//! Experiment and database configuration, loadable from JSON.

use crate::pir_internals::{
    error::MutualPIRError,
    params::{KEY_BYTE_LEN, VALUE_BYTE_LEN},
};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

/// How idempotent reads are retried after a transient transport failure. Writes are never retried.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: u32,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    50
}

fn default_backoff_multiplier() -> u32 {
    2
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Policy which gives up after the first failure
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt number `attempt + 1`, counting from zero
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = (self.backoff_multiplier as u64).saturating_pow(attempt);
        Duration::from_millis(self.initial_backoff_ms.saturating_mul(factor))
    }
}

/// Parameters of a generated contact database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub num_records: usize,
    #[serde(default = "default_key_len")]
    pub key_len: usize,
    #[serde(default = "default_value_len")]
    pub value_len: usize,
    #[serde(default)]
    pub auth: bool,
    /// Seed of the record generator, equal seeds give byte-identical databases
    #[serde(default)]
    pub seed: u64,
}

fn default_key_len() -> usize {
    KEY_BYTE_LEN
}

fn default_value_len() -> usize {
    VALUE_BYTE_LEN
}

/// One experiment, i.e. one client identity running a number of rounds against both servers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Table files are `<db_path_prefix>.ipir` and `<db_path_prefix>.kwpir`
    pub db_path_prefix: PathBuf,
    /// Reload tables and discard the notification matrix before this experiment
    #[serde(default)]
    pub reset_server: bool,
    /// Split server-side work across the worker pool, instead of one job per request
    #[serde(default)]
    pub multi_client: bool,
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,
    /// Row of the index table whose key is the client's own identity
    #[serde(default)]
    pub client_index: usize,
    /// Keyword queries per round
    #[serde(default = "default_rate")]
    pub rate_send: usize,
    /// Index queries per round
    #[serde(default = "default_rate")]
    pub rate_recv: usize,
    #[serde(default = "default_num_repetitions")]
    pub num_repetitions: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Bound on every call to a server, measured from when it is issued
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
}

fn default_num_threads() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

fn default_rate() -> usize {
    4
}

fn default_num_repetitions() -> usize {
    1
}

fn default_rpc_timeout_ms() -> u64 {
    30_000
}

impl ExperimentConfig {
    pub fn new(db_path_prefix: impl Into<PathBuf>) -> Self {
        Self {
            db_path_prefix: db_path_prefix.into(),
            reset_server: true,
            multi_client: false,
            num_threads: default_num_threads(),
            client_index: 0,
            rate_send: default_rate(),
            rate_recv: default_rate(),
            num_repetitions: default_num_repetitions(),
            retry: RetryPolicy::default(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), MutualPIRError> {
        if self.num_threads == 0 {
            return Err(MutualPIRError::InvalidConfig("num_threads must be positive".to_string()));
        }
        if self.rate_send == 0 || self.rate_recv == 0 {
            return Err(MutualPIRError::InvalidConfig("send and receive rates must be positive".to_string()));
        }
        if self.num_repetitions == 0 {
            return Err(MutualPIRError::InvalidConfig("num_repetitions must be positive".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(MutualPIRError::InvalidConfig("retry policy needs at least one attempt".to_string()));
        }
        if self.rpc_timeout_ms == 0 {
            return Err(MutualPIRError::InvalidConfig("rpc_timeout_ms must be positive".to_string()));
        }

        Ok(())
    }
}

/// A batch of experiments, run one after the other
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExperimentSuite {
    pub experiments: Vec<ExperimentConfig>,
}

impl ExperimentSuite {
    /// Load a suite from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MutualPIRError> {
        let context = path.as_ref().display().to_string();
        let content = std::fs::read_to_string(path.as_ref()).map_err(|err| MutualPIRError::serialization(&context, err))?;
        let suite: ExperimentSuite = serde_json::from_str(&content).map_err(|err| MutualPIRError::serialization(&context, err))?;

        for experiment in &suite.experiments {
            experiment.validate()?;
        }
        Ok(suite)
    }

    /// Save a suite to a JSON file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), MutualPIRError> {
        let context = path.as_ref().display().to_string();
        let content = serde_json::to_string_pretty(self).map_err(|err| MutualPIRError::serialization(&context, err))?;
        std::fs::write(path.as_ref(), content).map_err(|err| MutualPIRError::serialization(&context, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_take_defaults() {
        let json = r#"{ "experiments": [ { "db_path_prefix": "/data/contacts", "rate_send": 8 } ] }"#;
        let suite: ExperimentSuite = serde_json::from_str(json).unwrap();

        let experiment = &suite.experiments[0];
        assert_eq!(experiment.db_path_prefix, PathBuf::from("/data/contacts"));
        assert_eq!(experiment.rate_send, 8);
        assert_eq!(experiment.rate_recv, 4);
        assert!(!experiment.reset_server);
        assert!(experiment.num_threads >= 1);
        assert_eq!(experiment.retry, RetryPolicy::default());
        assert_eq!(experiment.rpc_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_suite_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("suite.json");

        let mut experiment = ExperimentConfig::new(dir.path().join("contacts"));
        experiment.multi_client = true;
        experiment.retry = RetryPolicy::no_retry();

        let suite = ExperimentSuite {
            experiments: vec![experiment],
        };
        suite.save(&path).unwrap();

        assert_eq!(ExperimentSuite::load(&path).unwrap(), suite);
    }

    #[test]
    fn test_invalid_experiments_are_rejected() {
        let mut experiment = ExperimentConfig::new("/data/contacts");
        assert!(experiment.validate().is_ok());

        experiment.num_threads = 0;
        assert!(matches!(experiment.validate(), Err(MutualPIRError::InvalidConfig(_))));

        let mut experiment = ExperimentConfig::new("/data/contacts");
        experiment.rate_recv = 0;
        assert!(experiment.validate().is_err());

        let mut experiment = ExperimentConfig::new("/data/contacts");
        experiment.rpc_timeout_ms = 0;
        assert!(matches!(experiment.validate(), Err(MutualPIRError::InvalidConfig(_))));
    }

    #[test]
    fn test_backoff_grows_geometrically() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(50));
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
    }
}
