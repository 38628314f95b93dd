//! Start-up configuration.
//!
//! Built once from CLI flags (with environment fallbacks) by the composition root.
//! Missing required settings are fatal: the process refuses to start.

use crate::cli::Cli;
use crate::error::ConfigError;
use crate::model::WorkflowSettings;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_key: String,
    pub base_url: String,
    pub workflow: WorkflowSettings,
    pub user_agent: String,
}

fn required(
    value: Option<&str>,
    flag: &'static str,
    env: &'static str,
) -> Result<String, ConfigError> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(ConfigError::Missing { flag, env }),
    }
}

impl AppConfig {
    pub fn from_cli(args: &Cli) -> Result<Self, ConfigError> {
        let api_key = required(args.api_key.as_deref(), "--api-key", "FLOWSCALE_API_KEY")?;
        let base_url = required(args.base_url.as_deref(), "--base-url", "FLOWSCALE_API_URL")?;
        let workflow_id = required(
            args.workflow_id.as_deref(),
            "--workflow-id",
            "FLOWSCALE_WORKFLOW_ID",
        )?;

        let parsed = reqwest::Url::parse(&base_url).map_err(|e| ConfigError::InvalidBaseUrl {
            url: base_url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidBaseUrl {
                url: base_url,
                reason: "scheme must be http or https".into(),
            });
        }

        Ok(Self {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            workflow: WorkflowSettings {
                workflow_id,
                image_slot: args.image_slot.clone(),
                prompt_slot: args.prompt_slot.clone(),
                group_id: args.group_id.clone().filter(|g| !g.trim().is_empty()),
                poll_interval: Duration::from(args.poll_interval),
                run_timeout: Duration::from(args.run_timeout),
            },
            user_agent: format!("flowscale-cli/{}", env!("CARGO_PKG_VERSION")),
        })
    }
}
