use super::{
    CreatedSimulation, GroupPatch, NewSimulation, RecordStore, SimulationPatch, StoreError,
};
use crate::config::StoreConfig;
use ::http::{header, StatusCode};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};
use tracing::{debug, instrument, warn};
use ureq::Agent;

/// body of the response to a created simulation
#[derive(Deserialize, Debug)]
struct CreatedBody {
    working_dir: PathBuf,
}

/// Record store reached over its REST API
pub struct HttpRecordStore {
    agent: Agent,
    authorization: String,
}

impl HttpRecordStore {
    pub fn new(config: &StoreConfig) -> Self {
        // status codes are checked by hand, the API answers PATCH with 202 and POST with 201
        let agent = Agent::new_with_config(
            Agent::config_builder()
                .http_status_as_error(false)
                .timeout_global(Some(Duration::from_secs(config.timeout)))
                .build(),
        );

        Self {
            agent,
            authorization: config.credentials.for_http_header(),
        }
    }

    #[instrument(skip(self, body), level = "debug")]
    fn patch<T: Serialize>(&self, url: &str, body: &T) -> Result<(), StoreError> {
        let response = self
            .agent
            .patch(url)
            .header("Authorization", &self.authorization)
            .send_json(body)
            .map_err(|source| StoreError::Http {
                url: url.to_owned(),
                source,
            })?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(StoreError::UnexpectedStatus {
                url: url.to_owned(),
                expected: StatusCode::ACCEPTED,
                actual: status,
            });
        }
        if status != StatusCode::ACCEPTED {
            warn!(url, "Expected response status 202, but got {status} instead");
        }

        Ok(())
    }
}

impl RecordStore for HttpRecordStore {
    fn patch_group(&self, group_url: &str, patch: &GroupPatch) -> Result<(), StoreError> {
        self.patch(group_url, patch)
    }

    #[instrument(skip(self), level = "debug")]
    fn create_simulation(
        &self,
        simulations_url: &str,
        simulation: &NewSimulation,
    ) -> Result<CreatedSimulation, StoreError> {
        let response = self
            .agent
            .post(simulations_url)
            .header("Authorization", &self.authorization)
            .send_json(simulation)
            .map_err(|source| StoreError::Http {
                url: simulations_url.to_owned(),
                source,
            })?;

        if response.status() != StatusCode::CREATED {
            return Err(StoreError::UnexpectedStatus {
                url: simulations_url.to_owned(),
                expected: StatusCode::CREATED,
                actual: response.status(),
            });
        }

        let url = response
            .headers()
            .get(header::LOCATION)
            .ok_or_else(|| StoreError::MissingLocation {
                url: simulations_url.to_owned(),
            })?
            .to_str()
            .map_err(|e| StoreError::InvalidResponse {
                url: simulations_url.to_owned(),
                reason: e.to_string(),
            })?
            .to_owned();

        let body: CreatedBody =
            response
                .into_body()
                .read_json()
                .map_err(|e| StoreError::InvalidResponse {
                    url: simulations_url.to_owned(),
                    reason: e.to_string(),
                })?;

        debug!(simulation = %url, working_dir = ?body.working_dir, "Created simulation");

        Ok(CreatedSimulation {
            url,
            working_dir: body.working_dir,
        })
    }

    fn patch_simulation(
        &self,
        simulation_url: &str,
        patch: &SimulationPatch,
    ) -> Result<(), StoreError> {
        self.patch(simulation_url, patch)
    }
}
