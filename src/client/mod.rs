//! Remote workflow client.
//!
//! The controller only sees [`WorkflowClient`]; the composition root decides which
//! implementation to hand it. Starting a run and waiting for it are separate calls
//! so a run can be cancelled while it is still generating.

mod flowscale;

pub use flowscale::FlowscaleClient;

use crate::error::Result;
use crate::model::{RunHistory, WorkflowInputs, WorkflowResult};

#[async_trait::async_trait]
pub trait WorkflowClient: Send + Sync {
    /// Upload the inputs and start a run. Returns the service-assigned run id.
    async fn start_run(&self, workflow_id: &str, inputs: WorkflowInputs) -> Result<String>;

    /// Wait for a started run to finish and fetch its output.
    async fn await_run(&self, run_id: &str) -> Result<WorkflowResult>;

    /// Ask the service to stop a run.
    async fn cancel_run(&self, run_id: &str) -> Result<()>;

    /// Fetch previously executed runs.
    async fn get_runs(&self) -> Result<RunHistory>;
}
