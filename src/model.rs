use crate::intake::ImageFile;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

/// Workflow coordinates and timing used for every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSettings {
    pub workflow_id: String,
    pub image_slot: String,
    pub prompt_slot: String,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub run_timeout: Duration,
}

/// What the user has staged for the next submission.
#[derive(Debug, Clone, Default)]
pub struct PendingInput {
    pub file: Option<ImageFile>,
    pub prompt: String,
}

impl PendingInput {
    pub fn new(file: Option<ImageFile>, prompt: impl Into<String>) -> Self {
        Self {
            file,
            prompt: prompt.into(),
        }
    }
}

/// A single named input slot value for a workflow invocation.
#[derive(Debug, Clone)]
pub enum InputValue {
    Text(String),
    Image(ImageFile),
}

/// Named inputs for one workflow invocation, in submission order.
pub type WorkflowInputs = Vec<(String, InputValue)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Map the service's status vocabulary onto the four run states.
    pub fn from_remote(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "queued" | "pending" | "running" | "in_progress" | "processing" => RunStatus::Pending,
            "completed" | "success" | "succeeded" => RunStatus::Succeeded,
            "cancelled" | "canceled" => RunStatus::Cancelled,
            _ => RunStatus::Failed,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl<'de> Deserialize<'de> for RunStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(RunStatus::from_remote(&s))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutput {
    pub filename: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub outputs: Vec<RunOutput>,
}

impl RunRecord {
    pub fn first_output_url(&self) -> Option<&str> {
        self.outputs
            .iter()
            .map(|o| o.url.as_str())
            .find(|u| !u.is_empty())
    }
}

/// Previously executed runs, owned by the remote service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunHistory {
    #[serde(default)]
    pub group_id: String,
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub runs: Vec<RunRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowResultData {
    #[serde(default)]
    pub download_url: String,
    #[serde(default)]
    pub generation_status: String,
}

/// Settled result of one workflow execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub status: String,
    #[serde(rename = "runId", alias = "run_id", default)]
    pub run_id: String,
    #[serde(default)]
    pub data: WorkflowResultData,
}

impl WorkflowResult {
    /// Success requires both the envelope and the generation itself to report success.
    pub fn is_success(&self) -> bool {
        self.status == "success" && self.data.generation_status == "success"
    }
}

/// Controller state. Everything but `AwaitingResult` is a resting state between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RunState {
    #[default]
    Idle,
    AwaitingResult,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn label(self) -> &'static str {
        match self {
            RunState::Idle => "Idle",
            RunState::AwaitingResult => "Generating",
            RunState::Succeeded => "Succeeded",
            RunState::Failed => "Failed",
            RunState::Cancelled => "Cancelled",
        }
    }
}

/// Everything a presentation layer needs to render the controller.
#[derive(Debug, Clone, Default)]
pub struct ControllerSnapshot {
    pub state: RunState,
    pub progress: u8,
    pub active_run_id: Option<String>,
    pub last_run_id: Option<String>,
    pub output_url: Option<String>,
    pub message: Option<String>,
    pub history: RunHistory,
}

/// Events emitted by the controller and consumed by UI/CLI layers.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    Snapshot(Box<ControllerSnapshot>),
    Info(InfoEvent),
}

/// Structured info events for status lines.
#[derive(Debug, Clone)]
pub enum InfoEvent {
    Message(String),
    Submitted { filename: String },
    RunAccepted { run_id: String },
    HistoryRefreshed { count: usize },
    HistoryRefreshFailed(String),
}

impl InfoEvent {
    /// Render a human-readable message for UI/CLI layers.
    pub fn to_message(&self) -> String {
        match self {
            InfoEvent::Message(msg) => msg.clone(),
            InfoEvent::Submitted { filename } => format!("Uploading {filename}…"),
            InfoEvent::RunAccepted { run_id } => format!("Run {run_id} accepted, generating…"),
            InfoEvent::HistoryRefreshed { count } => format!("History refreshed: {count} run(s)"),
            InfoEvent::HistoryRefreshFailed(e) => format!("History refresh failed: {e}"),
        }
    }
}

/// Summary of one generation episode, used for JSON output and exports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub timestamp_utc: String,
    pub workflow_id: String,
    #[serde(default)]
    pub run_id: Option<String>,
    pub state: RunState,
    pub input_filename: String,
    pub prompt: String,
    #[serde(default)]
    pub output_url: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    #[serde(default)]
    pub saved_output: Option<std::path::PathBuf>,
}
