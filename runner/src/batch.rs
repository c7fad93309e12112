mod cluster;
pub mod local;
mod mock;

pub use cluster::{ClusterScheduler, Dialect};
pub use local::LocalProcess;
pub use mock::{MockBatchSystem, SubmittedJob};

use crate::config::{check_executable, BatchConfig, ConfigErrors};
use serde::{Deserialize, Serialize};
use std::{
    fmt, io,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// identifiers accepted in `batch.name`
pub const SUPPORTED_BATCH_SYSTEMS: [&str; 6] = ["mock", "local", "psutil", "pbs", "cluster", "slurm"];

/// Opaque handle of a submitted job, e.g., a process id or a scheduler job id
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Violations of the submission contract, a rejected submission is reported as `Ok(None)` instead
#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Working directory {0:?} does not exist")]
    MissingWorkingDir(PathBuf),
    #[error("{0:?} is not an executable file")]
    NotExecutable(PathBuf),
    #[error("Working directory {0:?} cannot be used in scheduler directives")]
    UnsupportedWorkingDir(PathBuf),
    #[error("Failed to prepare job files: {0}")]
    Io(#[from] io::Error),
}

pub trait BatchSystem {
    /// Submit `executable` with `args` to run in `working_dir`
    ///
    /// Returns `Ok(None)` if the backend failed to accept the job, callers are expected to mark
    /// the job as failed and move on.
    fn submit_job(
        &self,
        executable: &Path,
        working_dir: &Path,
        args: &[String],
    ) -> Result<Option<JobId>, BatchError>;
}

/// check the inputs of a job before handing it to a real backend
pub fn check_job_inputs(executable: &Path, working_dir: &Path) -> Result<(), BatchError> {
    if !working_dir.is_dir() {
        return Err(BatchError::MissingWorkingDir(working_dir.to_path_buf()));
    }

    match check_executable(executable) {
        Ok(true) => Ok(()),
        Ok(false) | Err(ConfigErrors::FileNotFound) => {
            Err(BatchError::NotExecutable(executable.to_path_buf()))
        }
        Err(ConfigErrors::MetadataNotFound(e)) => Err(BatchError::Io(e)),
        Err(_) => Err(BatchError::NotExecutable(executable.to_path_buf())),
    }
}

#[derive(Debug)]
pub enum BatchSystems {
    Mock(MockBatchSystem),
    Local(LocalProcess),
    Cluster(ClusterScheduler),
}

impl BatchSystems {
    /// resolve the configured batch system, unknown names are rejected here and not at submission
    pub fn load(config: &BatchConfig) -> Result<Self, ConfigErrors> {
        match config.name.to_lowercase().as_str() {
            "mock" => Ok(Self::Mock(MockBatchSystem::load(config)?)),
            "local" | "psutil" => Ok(Self::Local(LocalProcess::load(config)?)),
            "pbs" | "cluster" => Ok(Self::Cluster(ClusterScheduler::load(Dialect::Pbs, config)?)),
            "slurm" => Ok(Self::Cluster(ClusterScheduler::load(
                Dialect::Slurm,
                config,
            )?)),
            _ => Err(ConfigErrors::UnsupportedBatchSystem(config.name.clone())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Mock(_) => "mock",
            Self::Local(_) => "local",
            Self::Cluster(scheduler) => match scheduler.dialect() {
                Dialect::Pbs => "pbs",
                Dialect::Slurm => "slurm",
            },
        }
    }
}

impl BatchSystem for BatchSystems {
    fn submit_job(
        &self,
        executable: &Path,
        working_dir: &Path,
        args: &[String],
    ) -> Result<Option<JobId>, BatchError> {
        match self {
            Self::Mock(batch) => batch.submit_job(executable, working_dir, args),
            Self::Local(batch) => batch.submit_job(executable, working_dir, args),
            Self::Cluster(batch) => batch.submit_job(executable, working_dir, args),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_every_supported_name() {
        for name in SUPPORTED_BATCH_SYSTEMS {
            assert!(
                BatchSystems::load(&BatchConfig::new(name)).is_ok(),
                "{name} failed to load"
            );
        }
    }

    #[test]
    fn registry_resolves_aliases() {
        assert_eq!(
            BatchSystems::load(&BatchConfig::new("psutil")).unwrap().name(),
            "local"
        );
        assert_eq!(
            BatchSystems::load(&BatchConfig::new("Cluster")).unwrap().name(),
            "pbs"
        );
        assert_eq!(
            BatchSystems::load(&BatchConfig::new("slurm")).unwrap().name(),
            "slurm"
        );
    }

    #[test]
    fn registry_rejects_unknown_names() {
        match BatchSystems::load(&BatchConfig::new("condor")) {
            Err(ConfigErrors::UnsupportedBatchSystem(name)) => assert_eq!(name, "condor"),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn registry_rejects_bad_parameters_at_load() {
        let config = BatchConfig::new("pbs").with_parameter("timeout", "forever");

        assert!(matches!(
            BatchSystems::load(&config),
            Err(ConfigErrors::InvalidParameter { .. })
        ));
    }

    #[test]
    fn registry_dispatches_to_mock() {
        let batch = BatchSystems::load(&BatchConfig::new("mock").with_parameter("prefix", "job-"))
            .unwrap();

        let job = batch
            .submit_job(Path::new("/bin/true"), Path::new("/nonexistent"), &[])
            .unwrap();

        assert_eq!(job, Some(JobId::new("job-1")));
    }

    #[test]
    fn job_inputs_are_checked() {
        let tmp = tempfile::tempdir().unwrap();

        assert!(matches!(
            check_job_inputs(Path::new("/bin/sh"), &tmp.path().join("missing")),
            Err(BatchError::MissingWorkingDir(_))
        ));
        assert!(matches!(
            check_job_inputs(&tmp.path().join("missing"), tmp.path()),
            Err(BatchError::NotExecutable(_))
        ));
        assert!(check_job_inputs(Path::new("/bin/sh"), tmp.path()).is_ok());
    }

    #[test]
    fn job_ids_serialize_transparently() {
        assert_eq!(
            serde_json::to_value(JobId::new("4711.headnode")).unwrap(),
            serde_json::json!("4711.headnode")
        );
    }
}
