//! Client side of the record store holding group and simulation state
//!
//! All updates are field-scoped patches, so the submission script and the simulation runners can
//! update the same records without clobbering each other's fields.

mod http;
mod memory;

pub use self::http::HttpRecordStore;
pub use memory::{MemoryStore, SimulationRow, StoreEvent};

use crate::{
    batch::JobId,
    models::{ScriptStatus, SimulationStatus},
    working_dirs::GroupUrls,
};
use ::http::StatusCode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: ureq::Error,
    },
    #[error("Expected response status {expected} from {url}, but got {actual}")]
    UnexpectedStatus {
        url: String,
        expected: StatusCode,
        actual: StatusCode,
    },
    #[error("Response from {url} has no Location header")]
    MissingLocation { url: String },
    #[error("Malformed response from {url}: {reason}")]
    InvalidResponse { url: String, reason: String },
    #[error("Unknown record {0}")]
    UnknownRecord(String),
}

/// The only group field the submission script may update
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct GroupPatch {
    pub script_status: ScriptStatus,
}

/// Updatable simulation fields, unset fields are left untouched
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct SimulationPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_job_id: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SimulationStatus>,
}

/// Body for creating a simulation below a group
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct NewSimulation {
    pub group: String,
    pub id_on_client: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatedSimulation {
    pub url: String,
    pub working_dir: PathBuf,
}

pub trait RecordStore {
    fn patch_group(&self, group_url: &str, patch: &GroupPatch) -> Result<(), StoreError>;

    fn create_simulation(
        &self,
        simulations_url: &str,
        simulation: &NewSimulation,
    ) -> Result<CreatedSimulation, StoreError>;

    fn patch_simulation(
        &self,
        simulation_url: &str,
        patch: &SimulationPatch,
    ) -> Result<(), StoreError>;
}

/// Proxy for a simulation group's record
pub struct GroupRecord<'s> {
    store: &'s dyn RecordStore,
    url: String,
    simulations_url: String,
}

impl<'s> GroupRecord<'s> {
    pub fn new(store: &'s dyn RecordStore, urls: &GroupUrls) -> Self {
        Self {
            store,
            url: urls.group_url.to_string(),
            simulations_url: urls.simulations_url.to_string(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn update_script_status(&self, status: ScriptStatus) -> Result<(), StoreError> {
        debug!(group = %self.url, %status, "Updating script status");

        self.store.patch_group(
            &self.url,
            &GroupPatch {
                script_status: status,
            },
        )
    }

    /// create a new simulation related to this group, returns its record and working directory
    pub fn add_new_simulation(
        &self,
        id_on_client: &str,
    ) -> Result<(SimulationRecord<'s>, PathBuf), StoreError> {
        let created = self.store.create_simulation(
            &self.simulations_url,
            &NewSimulation {
                group: self.url.clone(),
                id_on_client: id_on_client.to_owned(),
            },
        )?;

        Ok((
            SimulationRecord::new(self.store, created.url),
            created.working_dir,
        ))
    }
}

/// Proxy for a simulation's record
pub struct SimulationRecord<'s> {
    store: &'s dyn RecordStore,
    url: String,
}

impl<'s> SimulationRecord<'s> {
    pub fn new(store: &'s dyn RecordStore, url: String) -> Self {
        Self { store, url }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn set_batch_job(&self, job: &JobId) -> Result<(), StoreError> {
        self.store.patch_simulation(
            &self.url,
            &SimulationPatch {
                batch_job_id: Some(job.clone()),
                ..Default::default()
            },
        )
    }

    pub fn update_status(&self, status: SimulationStatus) -> Result<(), StoreError> {
        self.store.patch_simulation(
            &self.url,
            &SimulationPatch {
                status: Some(status),
                ..Default::default()
            },
        )
    }

    pub fn error_occurred(
        &self,
        status: SimulationStatus,
        details: &str,
    ) -> Result<(), StoreError> {
        debug_assert!(status.is_error());

        self.store.patch_simulation(
            &self.url,
            &SimulationPatch {
                status: Some(status),
                error_details: Some(details.to_owned()),
                ..Default::default()
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn patches_only_carry_set_fields() {
        assert_eq!(
            serde_json::to_value(SimulationPatch {
                batch_job_id: Some(JobId::new("17")),
                ..Default::default()
            })
            .unwrap(),
            json!({"batch_job_id": "17"})
        );
        assert_eq!(
            serde_json::to_value(SimulationPatch {
                status: Some(SimulationStatus::ScriptError),
                error_details: Some("qsub failed".to_owned()),
                ..Default::default()
            })
            .unwrap(),
            json!({"status": "SCRIPT_ERROR", "error_details": "qsub failed"})
        );
        assert_eq!(
            serde_json::to_value(GroupPatch {
                script_status: ScriptStatus::CachingFiles
            })
            .unwrap(),
            json!({"script_status": "CACHING_FILES"})
        );
    }

    #[test]
    fn records_forward_to_the_store() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(tmp.path());
        let urls = GroupUrls {
            group_url: "http://localhost/api/v1/sim-groups/1/".parse().unwrap(),
            simulations_url: "http://localhost/api/v1/simulations/".parse().unwrap(),
        };
        let group = GroupRecord::new(&store, &urls);

        group.update_script_status(ScriptStatus::StartedScript).unwrap();
        let (simulation, working_dir) = group.add_new_simulation("349").unwrap();
        simulation.set_batch_job(&JobId::new("4711")).unwrap();
        simulation.update_status(SimulationStatus::RunningModel).unwrap();
        simulation
            .error_occurred(SimulationStatus::OutputError, "upload rejected")
            .unwrap();

        assert_eq!(
            store.group_status(group.url()),
            Some(ScriptStatus::StartedScript)
        );

        let rows = store.simulations();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].url, simulation.url());
        assert_eq!(rows[0].group, group.url());
        assert_eq!(rows[0].id_on_client, "349");
        assert_eq!(rows[0].batch_job_id, "4711");
        assert_eq!(rows[0].status, SimulationStatus::OutputError);
        assert_eq!(rows[0].error_details, "upload rejected");
        assert_eq!(rows[0].working_dir, working_dir);
    }
}
