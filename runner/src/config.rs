use crate::batch;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    io::Error,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{error, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound)
    } else {
        match fs::metadata(path) {
            Ok(metadata) => Ok((metadata.permissions().mode() & 0o111) != 0),
            Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Batch system '{0}' not supported")]
    UnsupportedBatchSystem(String),
    #[error("Invalid {name}: {reason}")]
    InvalidParameter { name: String, reason: String },
    #[error("File not found")]
    FileNotFound,
    #[error("Metadata not found")]
    MetadataNotFound(#[from] Error),
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: Error,
    },
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SimConfig {
    // batch system the simulations are submitted to
    pub batch: BatchConfig,
    // per-simulation runner, invoked once per simulation in its working directory
    pub runner: RunnerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct BatchConfig {
    // Name of the selected batch system, see BatchSystems::load for the selection proccess
    pub name: String,
    // backend specific parameters, e.g., submit_exec or job_name for cluster schedulers
    #[serde(default)]
    pub parameter: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    pub exec: PathBuf,
    #[serde(default)]
    pub params: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    #[serde(default)]
    pub credentials: Credentials,
    // request timeout in seconds
    #[serde(default = "default_store_timeout")]
    pub timeout: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            credentials: Credentials::default(),
            timeout: default_store_timeout(),
        }
    }
}

/// Credentials for the record store's REST API
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Credentials {
    pub username: String,
    pub api_key: String,
}

impl Credentials {
    /// format the credentials for an HTTP Authorization header
    pub fn for_http_header(&self) -> String {
        format!("ApiKey {}:{}", self.username, self.api_key)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(default)]
    pub name: CacheKind,
    // cache directory, required for the directory cache
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub on_error: CacheFailurePolicy,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    #[default]
    None,
    Directory,
}

/// What a failure while caching input files means for the rest of the group
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheFailurePolicy {
    // log and keep submitting
    #[default]
    Continue,
    // abort the submission script, the group stays at CACHING_FILES
    Abort,
}

impl BatchConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameter: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, name: &str, value: impl Into<serde_yaml::Value>) -> Self {
        self.parameter.insert(name.to_owned(), value.into());
        self
    }

    fn invalid(name: &str, reason: &str) -> ConfigErrors {
        ConfigErrors::InvalidParameter {
            name: format!("batch.parameter.{name}"),
            reason: reason.to_owned(),
        }
    }

    pub fn parameter_str(&self, name: &str) -> Result<Option<&str>, ConfigErrors> {
        match self.parameter.get(name) {
            Some(value) => value
                .as_str()
                .map(Some)
                .ok_or_else(|| Self::invalid(name, "must be a string")),
            None => Ok(None),
        }
    }

    pub fn parameter_u64(&self, name: &str) -> Result<Option<u64>, ConfigErrors> {
        match self.parameter.get(name) {
            Some(value) => value
                .as_u64()
                .map(Some)
                .ok_or_else(|| Self::invalid(name, "must be a natural number")),
            None => Ok(None),
        }
    }

    pub fn parameter_u64_list(&self, name: &str) -> Result<Vec<u64>, ConfigErrors> {
        match self.parameter.get(name) {
            Some(serde_yaml::Value::Sequence(values)) => values
                .iter()
                .map(|value| {
                    value
                        .as_u64()
                        .ok_or_else(|| Self::invalid(name, "must only contain natural numbers"))
                })
                .collect(),
            Some(_) => Err(Self::invalid(name, "must be a list")),
            None => Ok(Vec::new()),
        }
    }
}

impl SimConfig {
    pub fn read(path: &Path) -> Result<Self, ConfigErrors> {
        let content = fs::read_to_string(path).map_err(|source| ConfigErrors::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigErrors> {
        let mut config: Self = serde_yaml::from_str(content)?;
        config.batch.name = config.batch.name.to_lowercase();

        Ok(config)
    }

    /// check the config for problems and log all of them, returns true if any were found
    pub fn preflight_checks(&self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if !batch::SUPPORTED_BATCH_SYSTEMS.contains(&self.batch.name.as_str()) {
            error!(
                "batch.name ({}) is not supported, please use one of: {}",
                self.batch.name,
                batch::SUPPORTED_BATCH_SYSTEMS.join(", ")
            );
            contains_error = true;
        } else if let Err(e) = batch::BatchSystems::load(&self.batch) {
            error!("batch.parameter is invalid: {e}");
            contains_error = true;
        }

        match check_executable(&self.runner.exec) {
            Ok(true) => {}
            Ok(false) => {
                error!(
                    "runner.exec target {} is not executable",
                    self.runner.exec.to_string_lossy()
                );
                contains_error = true;
            }
            Err(e) => {
                error!(
                    "Failed to determine if runner.exec ({}) is an executable: {e}",
                    self.runner.exec.to_string_lossy()
                );
                contains_error = true;
            }
        }

        if !self.runner.exec.is_absolute() {
            warn!(
                "runner.exec ({}) is relative, it is resolved in each simulation's working directory",
                self.runner.exec.to_string_lossy()
            );
        }

        if self.store.credentials.username.is_empty() || self.store.credentials.api_key.is_empty()
        {
            error!("store.credentials requires both a username and an api_key");
            contains_error = true;
        }

        if self.store.timeout == 0 {
            error!("store.timeout cannot be 0");
            contains_error = true;
        }

        if self.cache.name == CacheKind::Directory {
            match &self.cache.path {
                Some(path) if path.is_dir() => {}
                Some(path) => {
                    error!(
                        "cache.path ({}) is not a directory",
                        path.to_string_lossy()
                    );
                    contains_error = true;
                }
                None => {
                    error!("cache.path is required for the directory cache");
                    contains_error = true;
                }
            }
        }

        contains_error
    }
}

fn default_store_timeout() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
batch:
  name: PBS
  parameter:
    submit_exec: /usr/local/bin/qsub
    timeout: 5000
runner:
  exec: /usr/bin/python3
  params: [/opt/simmgr/run_simulation.py]
store:
  credentials:
    username: script-user
    api_key: 0123456789abcdef
cache:
  name: directory
  path: /var/cache/simmgr
  on_error: abort
"#;

    fn executable(dir: &Path, name: &str, mode: u32) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    #[test]
    fn parses_full_config() {
        let config = SimConfig::parse(CONFIG).unwrap();

        assert_eq!(config.batch.name, "pbs");
        assert_eq!(
            config.batch.parameter_str("submit_exec").unwrap(),
            Some("/usr/local/bin/qsub")
        );
        assert_eq!(config.batch.parameter_u64("timeout").unwrap(), Some(5000));
        assert_eq!(config.runner.params, vec!["/opt/simmgr/run_simulation.py"]);
        assert_eq!(config.store.timeout, 30);
        assert_eq!(config.cache.on_error, CacheFailurePolicy::Abort);
        assert_eq!(config.cache.name, CacheKind::Directory);
        assert_eq!(config.cache.path, Some(PathBuf::from("/var/cache/simmgr")));
    }

    #[test]
    fn optional_sections_default() {
        let config = SimConfig::parse("batch: {name: mock}\nrunner: {exec: /bin/true}\n").unwrap();

        assert!(config.batch.parameter.is_empty());
        assert!(config.runner.params.is_empty());
        assert_eq!(config.store.credentials, Credentials::default());
        assert_eq!(config.cache.on_error, CacheFailurePolicy::Continue);
        assert_eq!(config.cache.name, CacheKind::None);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result = SimConfig::parse("batch: {name: mock, threads: 4}\nrunner: {exec: /bin/true}\n");

        assert!(matches!(result, Err(ConfigErrors::Parse(_))));
    }

    #[test]
    fn wrongly_typed_parameters_are_rejected() {
        let config = BatchConfig::new("pbs")
            .with_parameter("timeout", "soon")
            .with_parameter("fail_on", 3);

        assert!(matches!(
            config.parameter_u64("timeout"),
            Err(ConfigErrors::InvalidParameter { .. })
        ));
        assert!(matches!(
            config.parameter_u64_list("fail_on"),
            Err(ConfigErrors::InvalidParameter { .. })
        ));
        assert!(matches!(
            config.parameter_str("fail_on"),
            Err(ConfigErrors::InvalidParameter { .. })
        ));
    }

    #[test]
    fn credentials_header() {
        let credentials = Credentials {
            username: "script-user".to_owned(),
            api_key: "abc123".to_owned(),
        };

        assert_eq!(credentials.for_http_header(), "ApiKey script-user:abc123");
    }

    #[test]
    fn check_executable_looks_at_mode_bits() {
        let tmp = tempfile::tempdir().unwrap();

        assert!(check_executable(&executable(tmp.path(), "run.sh", 0o755)).unwrap());
        assert!(!check_executable(&executable(tmp.path(), "data.txt", 0o644)).unwrap());
        assert!(matches!(
            check_executable(&tmp.path().join("missing")),
            Err(ConfigErrors::FileNotFound)
        ));
    }

    #[test]
    fn preflight_accepts_valid_config() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = SimConfig::parse(CONFIG).unwrap();
        config.runner.exec = executable(tmp.path(), "runner", 0o755);
        config.cache.path = Some(tmp.path().to_path_buf());

        assert!(!config.preflight_checks());
    }

    #[test]
    fn preflight_reports_missing_cache_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = SimConfig::parse(CONFIG).unwrap();
        config.runner.exec = executable(tmp.path(), "runner", 0o755);
        config.cache.path = Some(tmp.path().join("missing"));

        assert!(config.preflight_checks());

        config.cache.path = None;
        assert!(config.preflight_checks());
    }

    #[test]
    fn preflight_reports_unknown_batch_system_and_missing_runner() {
        let mut config = SimConfig::parse(CONFIG).unwrap();
        config.batch.name = "condor".to_owned();
        config.runner.exec = PathBuf::from("/nonexistent/runner");

        assert!(config.preflight_checks());
    }

    #[test]
    fn preflight_reports_missing_credentials() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = SimConfig::parse(CONFIG).unwrap();
        config.runner.exec = executable(tmp.path(), "runner", 0o755);
        config.store.credentials.api_key.clear();

        assert!(config.preflight_checks());
    }
}
