use crate::{
    batch::{BatchError, BatchSystem, JobId},
    cache::{CacheError, InputCache},
    config::{CacheFailurePolicy, RunnerConfig},
    models::{ScriptStatus, SimulationDefinition, SimulationStatus},
    store::{GroupRecord, RecordStore, StoreError},
    working_dirs::{self, DocumentError},
};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// error details recorded for a simulation whose job the batch system did not accept
pub const SUBMISSION_FAILED: &str = "Batch system failed to accept the simulation's job";

/// Errors that abort the submission script, the group keeps its last persisted status
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("Failed to load group documents: {0}")]
    Document(#[from] DocumentError),
    #[error("Record store request failed: {0}")]
    Store(#[from] StoreError),
    #[error("Input file caching failed: {0}")]
    Cache(#[from] CacheError),
    #[error("Invalid batch job: {0}")]
    Batch(#[from] BatchError),
}

/// Outcome of one simulation's submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedSimulation {
    pub url: String,
    pub id_on_client: String,
    pub working_dir: PathBuf,
    // None if the batch system did not accept the job
    pub job: Option<JobId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubmissionReport {
    pub simulations: Vec<SubmittedSimulation>,
}

impl SubmissionReport {
    pub fn failed(&self) -> usize {
        self.simulations
            .iter()
            .filter(|simulation| simulation.job.is_none())
            .count()
    }
}

/// Drives a simulation group from READY_TO_RUN to SCRIPT_DONE
///
/// Every status change is persisted before the next step starts. Simulations are submitted one at
/// a time in request order, a rejected job only marks its own simulation as failed.
pub struct GroupSubmission<'a> {
    store: &'a dyn RecordStore,
    batch: &'a dyn BatchSystem,
    cache: &'a dyn InputCache,
    runner: &'a RunnerConfig,
    on_cache_error: CacheFailurePolicy,
}

impl<'a> GroupSubmission<'a> {
    pub fn new(
        store: &'a dyn RecordStore,
        batch: &'a dyn BatchSystem,
        cache: &'a dyn InputCache,
        runner: &'a RunnerConfig,
    ) -> Self {
        Self {
            store,
            batch,
            cache,
            runner,
            on_cache_error: CacheFailurePolicy::default(),
        }
    }

    pub fn on_cache_error(mut self, policy: CacheFailurePolicy) -> Self {
        self.on_cache_error = policy;
        self
    }

    /// Submit all simulations of the group whose working directory is `group_dir`
    ///
    /// Not idempotent: running it twice for one group creates a second set of simulation records
    /// and jobs.
    #[instrument(skip(self), level = "info")]
    pub fn run(&self, group_dir: &Path) -> Result<SubmissionReport, SubmitError> {
        let urls = working_dirs::read_group_urls(group_dir)?;
        info!(
            group_url = %urls.group_url,
            simulations_url = %urls.simulations_url,
            "Loaded API URLs"
        );
        let group = GroupRecord::new(self.store, &urls);
        let mut status = ScriptStatus::ReadyToRun;

        self.advance(&group, &mut status, ScriptStatus::StartedScript)?;

        info!("Loading execution request...");
        let request = working_dirs::read_execution_request(group_dir)?;

        self.advance(&group, &mut status, ScriptStatus::CachingFiles)?;
        self.cache_input_files(&request.input_files())?;

        info!(
            simulations = request.simulations().len(),
            "Submitting simulations..."
        );
        self.advance(&group, &mut status, ScriptStatus::SubmittingJobs)?;

        let mut report = SubmissionReport::default();
        for definition in request.simulations() {
            report
                .simulations
                .push(self.submit_simulation(&group, definition)?);
        }

        self.advance(&group, &mut status, ScriptStatus::ScriptDone)?;
        info!(
            submitted = report.simulations.len() - report.failed(),
            failed = report.failed(),
            "Done"
        );

        Ok(report)
    }

    fn advance(
        &self,
        group: &GroupRecord,
        current: &mut ScriptStatus,
        next: ScriptStatus,
    ) -> Result<(), StoreError> {
        debug_assert!(current.can_advance_to(next), "{current} -> {next}");
        if !current.can_advance_to(next) {
            error!(%current, %next, "Unexpected script status transition");
        }

        group.update_script_status(next)?;
        *current = next;

        Ok(())
    }

    fn cache_input_files(&self, urls: &[&str]) -> Result<(), SubmitError> {
        debug!(files = urls.len(), "Caching input files");

        match self.cache.add_to_cache(urls) {
            Ok(()) => Ok(()),
            Err(e) => match self.on_cache_error {
                CacheFailurePolicy::Continue => {
                    warn!(error = ?e, "Failed to cache input files, continuing: {e}");

                    Ok(())
                }
                CacheFailurePolicy::Abort => Err(e.into()),
            },
        }
    }

    #[instrument(skip(self, group, definition), fields(id_on_client = %definition.id_on_client))]
    fn submit_simulation(
        &self,
        group: &GroupRecord,
        definition: &SimulationDefinition,
    ) -> Result<SubmittedSimulation, SubmitError> {
        let (record, working_dir) = group.add_new_simulation(&definition.id_on_client)?;
        info!(simulation = %record.url(), "Created simulation");

        working_dirs::setup_for_simulation(&working_dir, definition, record.url())?;

        let job = self
            .batch
            .submit_job(&self.runner.exec, &working_dir, &self.runner.params)?;

        match &job {
            Some(job) => {
                info!(simulation = %record.url(), job = %job, "Submitted batch job");
                record.set_batch_job(job)?;
            }
            None => {
                error!(simulation = %record.url(), "Batch system did not accept the job");
                record.error_occurred(SimulationStatus::ScriptError, SUBMISSION_FAILED)?;
            }
        }

        Ok(SubmittedSimulation {
            url: record.url().to_owned(),
            id_on_client: definition.id_on_client.clone(),
            working_dir,
            job,
        })
    }
}
