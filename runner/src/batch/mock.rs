use super::{BatchError, BatchSystem, JobId};
use crate::config::{BatchConfig, ConfigErrors};
use parking_lot::Mutex;
use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};
use tracing::debug;

/// a single recorded call to `submit_job`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedJob {
    pub executable: PathBuf,
    pub working_dir: PathBuf,
    pub args: Vec<String>,
}

/// Batch system that only records submissions, nothing is executed
///
/// Handles are `<prefix><call number>`, call numbers in `fail_on` (1-based) return no handle.
#[derive(Debug)]
pub struct MockBatchSystem {
    prefix: String,
    fail_on: BTreeSet<usize>,
    calls: Mutex<Vec<SubmittedJob>>,
}

impl Default for MockBatchSystem {
    fn default() -> Self {
        Self {
            prefix: "mock-".to_owned(),
            fail_on: BTreeSet::new(),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl MockBatchSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(config: &BatchConfig) -> Result<Self, ConfigErrors> {
        let mut mock = Self::new();

        if let Some(prefix) = config.parameter_str("prefix")? {
            mock.prefix = prefix.to_owned();
        }

        mock.fail_on = config
            .parameter_u64_list("fail_on")?
            .into_iter()
            .map(|call| call as usize)
            .collect();

        Ok(mock)
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn fail_on(mut self, calls: impl IntoIterator<Item = usize>) -> Self {
        self.fail_on.extend(calls);
        self
    }

    /// all submissions so far, in call order
    pub fn calls(&self) -> Vec<SubmittedJob> {
        self.calls.lock().clone()
    }
}

impl BatchSystem for MockBatchSystem {
    fn submit_job(
        &self,
        executable: &Path,
        working_dir: &Path,
        args: &[String],
    ) -> Result<Option<JobId>, BatchError> {
        let mut calls = self.calls.lock();
        calls.push(SubmittedJob {
            executable: executable.to_path_buf(),
            working_dir: working_dir.to_path_buf(),
            args: args.to_vec(),
        });
        let call = calls.len();

        if self.fail_on.contains(&call) {
            debug!(call, "Mock batch system rejecting job");

            Ok(None)
        } else {
            Ok(Some(JobId::new(format!("{}{call}", self.prefix))))
        }
    }
}
