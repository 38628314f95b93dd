use thiserror::Error;

/// User-facing text for a run that failed because the service timed out.
pub const TIMEOUT_MESSAGE: &str = "Request timed out. Please try again.";
/// User-facing text for any other failed run.
pub const FAILURE_MESSAGE: &str = "Failed to generate image. Please try again.";

/// Errors returned by the remote workflow client.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The service returned a non-success HTTP status.
    #[error("Flowscale returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The response was missing expected fields or had an unexpected shape.
    #[error("{0}")]
    InvalidResponse(String),

    /// Gave up waiting for the run to reach a terminal status.
    #[error("Workflow execution timed out after {}", format_elapsed(.after))]
    Timeout {
        run_id: String,
        after: std::time::Duration,
    },

    /// The run reached a terminal status other than success.
    #[error("Workflow execution failed: {0}")]
    RunFailed(String),

    /// Network-level request failure with context.
    #[error("{context}: {source}")]
    Network {
        context: String,
        source: reqwest::Error,
    },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// Whether the failure indicates a timeout, either structurally or by the
    /// service's own failure message. Request context and raw HTTP bodies are not
    /// inspected.
    pub fn is_timeout(&self) -> bool {
        match self {
            ClientError::Timeout { .. } => true,
            ClientError::Network { source, .. } => source.is_timeout(),
            ClientError::RunFailed(reason) | ClientError::InvalidResponse(reason) => {
                mentions_timeout(reason)
            }
            ClientError::Http { .. } | ClientError::Json(_) => false,
        }
    }
}

/// Rejections raised by file intake before anything reaches the network.
#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("{name} is {size} bytes; the limit is {limit} bytes")]
    TooLarge { name: String, size: u64, limit: u64 },

    #[error("{name} is not a supported image (png, jpg, jpeg, gif)")]
    UnsupportedType { name: String },

    #[error("{name} is empty")]
    Empty { name: String },

    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

/// Start-up configuration problems. Always fatal.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required setting {flag} (or environment variable {env})")]
    Missing {
        flag: &'static str,
        env: &'static str,
    },

    #[error("invalid base URL {url:?}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },
}

/// Errors surfaced by the run lifecycle controller.
#[derive(Error, Debug)]
pub enum RunError {
    /// No file selected, or the file failed size/type checks.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A run is already awaiting its result; concurrent submissions are rejected.
    #[error("a generation is already in progress")]
    RunInProgress,

    #[error("remote timeout: {0}")]
    RemoteTimeout(String),

    #[error("remote failure: {0}")]
    RemoteFailure(String),

    /// Only ever logged; local state still resolves to cancelled.
    #[error("cancel request failed: {0}")]
    CancelFailure(String),
}

impl RunError {
    /// Map a client error from a workflow call into the run taxonomy.
    pub fn from_remote(err: &ClientError) -> Self {
        if err.is_timeout() {
            RunError::RemoteTimeout(err.to_string())
        } else {
            RunError::RemoteFailure(err.to_string())
        }
    }

    /// Text suitable for showing to the user.
    pub fn user_message(&self) -> String {
        match self {
            RunError::InvalidInput(reason) => format!("Please select a valid image: {reason}"),
            RunError::RunInProgress => {
                "A generation is already running. Cancel it before starting another.".into()
            }
            RunError::RemoteTimeout(_) => TIMEOUT_MESSAGE.into(),
            RunError::RemoteFailure(_) => FAILURE_MESSAGE.into(),
            RunError::CancelFailure(_) => "Cancelled.".into(),
        }
    }
}

impl From<IntakeError> for RunError {
    fn from(err: IntakeError) -> Self {
        RunError::InvalidInput(err.to_string())
    }
}

fn format_elapsed(d: &std::time::Duration) -> humantime::FormattedDuration {
    humantime::format_duration(*d)
}

pub(crate) fn mentions_timeout(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("timed out") || lower.contains("timeout")
}

pub type Result<T> = std::result::Result<T, ClientError>;
