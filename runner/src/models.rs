use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// Progress of the submission script for a simulation group
///
/// READY_TO_RUN -> STARTED_SCRIPT -> CACHING_FILES -> SUBMITTING_JOBS -> SCRIPT_DONE, with
/// SCRIPT_ERROR reachable from any non-terminal state
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScriptStatus {
    #[default]
    ReadyToRun,
    StartedScript,
    CachingFiles,
    SubmittingJobs,
    ScriptDone,
    ScriptError,
}

impl ScriptStatus {
    pub const ALL: [ScriptStatus; 6] = [
        Self::ReadyToRun,
        Self::StartedScript,
        Self::CachingFiles,
        Self::SubmittingJobs,
        Self::ScriptDone,
        Self::ScriptError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadyToRun => "READY_TO_RUN",
            Self::StartedScript => "STARTED_SCRIPT",
            Self::CachingFiles => "CACHING_FILES",
            Self::SubmittingJobs => "SUBMITTING_JOBS",
            Self::ScriptDone => "SCRIPT_DONE",
            Self::ScriptError => "SCRIPT_ERROR",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::ReadyToRun => 0,
            Self::StartedScript => 1,
            Self::CachingFiles => 2,
            Self::SubmittingJobs => 3,
            Self::ScriptDone | Self::ScriptError => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ScriptDone | Self::ScriptError)
    }

    /// Whether a group may move from `self` to `next`, statuses never regress
    pub fn can_advance_to(&self, next: ScriptStatus) -> bool {
        if self.is_terminal() {
            return false;
        }

        match next {
            Self::ScriptError => true,
            next => next.rank() > self.rank(),
        }
    }
}

impl fmt::Display for ScriptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a single simulation
///
/// The orchestrator only ever creates simulations (READY_TO_RUN) or marks a failed submission
/// (SCRIPT_ERROR), everything else is reported by the simulation runner itself.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SimulationStatus {
    #[default]
    ReadyToRun,
    StartedScript,
    StagingInput,
    RunningModel,
    StagingOutput,
    ScriptDone,
    ScriptError,
    OutputError,
}

impl SimulationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadyToRun => "READY_TO_RUN",
            Self::StartedScript => "STARTED_SCRIPT",
            Self::StagingInput => "STAGING_INPUT",
            Self::RunningModel => "RUNNING_MODEL",
            Self::StagingOutput => "STAGING_OUTPUT",
            Self::ScriptDone => "SCRIPT_DONE",
            Self::ScriptError => "SCRIPT_ERROR",
            Self::OutputError => "OUTPUT_ERROR",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::ScriptError | Self::OutputError)
    }

    pub fn is_terminal(&self) -> bool {
        self.is_error() || *self == Self::ScriptDone
    }
}

impl fmt::Display for SimulationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Definition of a single simulation, also the document handed to the runner
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SimulationDefinition {
    pub model: String,
    pub model_version: String,
    // local file name -> source url
    #[serde(default)]
    pub input_files: BTreeMap<String, String>,
    #[serde(default)]
    pub output_url: Option<String>,
    #[serde(default)]
    pub cmd_line_args: Vec<String>,
    #[serde(default)]
    pub id_on_client: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct SimulationGroupSpec {
    #[serde(default)]
    pub simulations: Vec<SimulationDefinition>,
}

/// Request to execute one simulation group, as submitted by a client
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct ExecutionRequest {
    pub simulation_group: SimulationGroupSpec,
}

impl ExecutionRequest {
    pub fn simulations(&self) -> &[SimulationDefinition] {
        &self.simulation_group.simulations
    }

    /// all input file urls across the group, in order of first appearance
    pub fn input_files(&self) -> Vec<&str> {
        self.simulations()
            .iter()
            .flat_map(|simulation| simulation.input_files.values())
            .map(String::as_str)
            .unique()
            .collect_vec()
    }
}
