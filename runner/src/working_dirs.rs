//! Files shared between the server, the group submission script and the simulation runner
//!
//! A group working directory holds `execution_request.json` and `api_urls.json`, a simulation
//! working directory holds `simulation.json` and its own `api_urls.json`.

use crate::models::{ExecutionRequest, SimulationDefinition};
use http::Uri;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, warn};

pub const EXECUTION_REQUEST_FILENAME: &str = "execution_request.json";
pub const SIMULATION_DEFINITION_FILENAME: &str = "simulation.json";
pub const API_URLS_FILENAME: &str = "api_urls.json";
pub const STDOUT_FILENAME: &str = "stdout.txt";

#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Failed to access {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Malformed document {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// API endpoints the submission script needs for its group
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct GroupUrls {
    #[serde(with = "http_serde::uri")]
    pub group_url: Uri,
    // list endpoint where new simulations are created
    #[serde(with = "http_serde::uri")]
    pub simulations_url: Uri,
}

/// API endpoint the simulation runner reports its status to
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SimulationUrls {
    pub simulation_url: String,
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, DocumentError> {
    let file = File::open(path).map_err(|source| DocumentError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    serde_json::from_reader(BufReader::new(file)).map_err(|source| DocumentError::Json {
        path: path.to_path_buf(),
        source,
    })
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), DocumentError> {
    let io_error = |source| DocumentError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut writer = BufWriter::new(File::create(path).map_err(io_error)?);
    serde_json::to_writer_pretty(&mut writer, value).map_err(|source| DocumentError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    writer.flush().map_err(io_error)
}

/// create a working directory if necessary, an existing one is reused
pub fn create_working_dir(path: &Path) -> io::Result<()> {
    if path.is_dir() {
        warn!(path = ?path, "Working directory already exists");

        Ok(())
    } else {
        fs::create_dir_all(path)?;
        debug!(path = ?path, "Created working directory");

        Ok(())
    }
}

/// setup a group working directory with the request the submission script will execute
pub fn setup_for_group(
    working_dir: &Path,
    request: &ExecutionRequest,
    urls: &GroupUrls,
) -> Result<(), DocumentError> {
    create_working_dir(working_dir).map_err(|source| DocumentError::Io {
        path: working_dir.to_path_buf(),
        source,
    })?;

    write_json(&working_dir.join(EXECUTION_REQUEST_FILENAME), request)?;
    write_json(&working_dir.join(API_URLS_FILENAME), urls)
}

pub fn read_group_urls(working_dir: &Path) -> Result<GroupUrls, DocumentError> {
    read_json(&working_dir.join(API_URLS_FILENAME))
}

pub fn read_execution_request(working_dir: &Path) -> Result<ExecutionRequest, DocumentError> {
    read_json(&working_dir.join(EXECUTION_REQUEST_FILENAME))
}

/// setup a simulation working directory, so the runner can find its definition and record
pub fn setup_for_simulation(
    working_dir: &Path,
    definition: &SimulationDefinition,
    simulation_url: &str,
) -> Result<(), DocumentError> {
    create_working_dir(working_dir).map_err(|source| DocumentError::Io {
        path: working_dir.to_path_buf(),
        source,
    })?;

    write_json(
        &working_dir.join(SIMULATION_DEFINITION_FILENAME),
        definition,
    )?;
    write_json(
        &working_dir.join(API_URLS_FILENAME),
        &SimulationUrls {
            simulation_url: simulation_url.to_owned(),
        },
    )
}

pub fn read_simulation_definition(
    working_dir: &Path,
) -> Result<SimulationDefinition, DocumentError> {
    read_json(&working_dir.join(SIMULATION_DEFINITION_FILENAME))
}

pub fn read_simulation_urls(working_dir: &Path) -> Result<SimulationUrls, DocumentError> {
    read_json(&working_dir.join(API_URLS_FILENAME))
}
