// Program runtime collaborator
// The scheduler only decides when a program runs; starting it is delegated here.

pub mod http;

pub use http::HttpProgramRuntime;

use crate::errors::RuntimeError;
use crate::models::{LaunchArguments, ProgramId, RunId};
use async_trait::async_trait;
use std::collections::HashSet;

/// Launches programs and reports their active runs
#[async_trait]
pub trait ProgramRuntime: Send + Sync {
    /// Submit a run of `program` and return its run id
    async fn launch(
        &self,
        program: &ProgramId,
        arguments: &LaunchArguments,
    ) -> Result<RunId, RuntimeError>;

    /// Runs of `program` that have not yet reached a terminal status
    async fn list_active_runs(&self, program: &ProgramId) -> Result<HashSet<RunId>, RuntimeError>;
}
