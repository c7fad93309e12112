use super::{
    CreatedSimulation, GroupPatch, NewSimulation, RecordStore, SimulationPatch, StoreError,
};
use crate::models::{ScriptStatus, SimulationStatus};
use parking_lot::Mutex;
use std::{collections::BTreeMap, path::PathBuf};

/// every request the store received, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    GroupPatched {
        url: String,
        patch: GroupPatch,
    },
    SimulationCreated {
        url: String,
        group: String,
        id_on_client: String,
    },
    SimulationPatched {
        url: String,
        patch: SimulationPatch,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationRow {
    pub url: String,
    pub group: String,
    pub id_on_client: String,
    pub status: SimulationStatus,
    pub batch_job_id: String,
    pub error_details: String,
    pub working_dir: PathBuf,
}

#[derive(Debug, Default)]
struct Inner {
    events: Vec<StoreEvent>,
    groups: BTreeMap<String, ScriptStatus>,
    simulations: Vec<SimulationRow>,
}

/// In-process record store, used for dry runs and tests
///
/// Groups are registered on their first update. Simulation working directories are assigned
/// below `working_dirs`, numbered like the simulation ids, but not created.
#[derive(Debug)]
pub struct MemoryStore {
    working_dirs: PathBuf,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new(working_dirs: impl Into<PathBuf>) -> Self {
        Self {
            working_dirs: working_dirs.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn events(&self) -> Vec<StoreEvent> {
        self.inner.lock().events.clone()
    }

    pub fn group_status(&self, url: &str) -> Option<ScriptStatus> {
        self.inner.lock().groups.get(url).copied()
    }

    /// script statuses the group went through, in order
    pub fn group_history(&self, url: &str) -> Vec<ScriptStatus> {
        self.inner
            .lock()
            .events
            .iter()
            .filter_map(|event| match event {
                StoreEvent::GroupPatched { url: patched, patch } if patched == url => {
                    Some(patch.script_status)
                }
                _ => None,
            })
            .collect()
    }

    pub fn simulations(&self) -> Vec<SimulationRow> {
        self.inner.lock().simulations.clone()
    }
}

impl RecordStore for MemoryStore {
    fn patch_group(&self, group_url: &str, patch: &GroupPatch) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();

        inner
            .groups
            .insert(group_url.to_owned(), patch.script_status);
        inner.events.push(StoreEvent::GroupPatched {
            url: group_url.to_owned(),
            patch: patch.clone(),
        });

        Ok(())
    }

    fn create_simulation(
        &self,
        simulations_url: &str,
        simulation: &NewSimulation,
    ) -> Result<CreatedSimulation, StoreError> {
        let mut inner = self.inner.lock();

        let id = inner.simulations.len() + 1;
        let url = format!("{}/{id}/", simulations_url.trim_end_matches('/'));
        let working_dir = self.working_dirs.join(id.to_string());

        inner.simulations.push(SimulationRow {
            url: url.clone(),
            group: simulation.group.clone(),
            id_on_client: simulation.id_on_client.clone(),
            status: SimulationStatus::ReadyToRun,
            batch_job_id: String::new(),
            error_details: String::new(),
            working_dir: working_dir.clone(),
        });
        inner.events.push(StoreEvent::SimulationCreated {
            url: url.clone(),
            group: simulation.group.clone(),
            id_on_client: simulation.id_on_client.clone(),
        });

        Ok(CreatedSimulation { url, working_dir })
    }

    fn patch_simulation(
        &self,
        simulation_url: &str,
        patch: &SimulationPatch,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();

        let row = inner
            .simulations
            .iter_mut()
            .find(|row| row.url == simulation_url)
            .ok_or_else(|| StoreError::UnknownRecord(simulation_url.to_owned()))?;

        if let Some(job) = &patch.batch_job_id {
            row.batch_job_id = job.to_string();
        }
        if let Some(details) = &patch.error_details {
            row.error_details = details.clone();
        }
        if let Some(status) = patch.status {
            row.status = status;
        }

        inner.events.push(StoreEvent::SimulationPatched {
            url: simulation_url.to_owned(),
            patch: patch.clone(),
        });

        Ok(())
    }
}
