// HTTP program runtime adapter

use crate::errors::RuntimeError;
use crate::models::{LaunchArguments, ProgramId, RunId};
use crate::runtime::ProgramRuntime;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct RunResponse {
    run_id: String,
}

/// Talks to the program runtime's REST API
pub struct HttpProgramRuntime {
    client: Client,
    base_url: String,
}

impl HttpProgramRuntime {
    /// Create a new runtime client with the specified request timeout
    pub fn new(base_url: impl Into<String>, timeout_seconds: u64) -> Result<Self, RuntimeError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| {
                RuntimeError::RequestFailed(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn program_url(&self, program: &ProgramId) -> String {
        format!(
            "{}/v3/namespaces/{}/apps/{}/programs/{}",
            self.base_url, program.namespace, program.application, program.program
        )
    }

    async fn check_status(program: &ProgramId, response: Response) -> Result<Response, RuntimeError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(RuntimeError::ProgramNotFound(program.to_string()));
        }
        let body = response.text().await.unwrap_or_default();
        Err(RuntimeError::UnexpectedStatus {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl ProgramRuntime for HttpProgramRuntime {
    #[tracing::instrument(skip(self, arguments), fields(program = %program))]
    async fn launch(
        &self,
        program: &ProgramId,
        arguments: &LaunchArguments,
    ) -> Result<RunId, RuntimeError> {
        let url = format!("{}/start", self.program_url(program));
        tracing::debug!(
            url = %url,
            system_args = arguments.system_args.len(),
            user_args = arguments.user_args.len(),
            "Submitting program launch"
        );

        let response = self.client.post(&url).json(arguments).send().await?;
        let response = Self::check_status(program, response).await?;
        let run: RunResponse = response.json().await?;

        tracing::info!(program = %program, run_id = %run.run_id, "Program launched");
        Ok(RunId(run.run_id))
    }

    #[tracing::instrument(skip(self), fields(program = %program))]
    async fn list_active_runs(&self, program: &ProgramId) -> Result<HashSet<RunId>, RuntimeError> {
        let url = format!("{}/runs", self.program_url(program));
        let response = self
            .client
            .get(&url)
            .query(&[("status", "running")])
            .send()
            .await?;
        let response = Self::check_status(program, response).await?;
        let runs: Vec<RunResponse> = response.json().await?;

        Ok(runs.into_iter().map(|r| RunId(r.run_id)).collect())
    }
}
