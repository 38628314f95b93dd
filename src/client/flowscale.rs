use super::WorkflowClient;
use crate::config::AppConfig;
use crate::error::{ClientError, Result};
use crate::model::{
    InputValue, RunHistory, RunRecord, RunStatus, WorkflowInputs, WorkflowResult,
    WorkflowResultData,
};
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const API_KEY_HEADER: &str = "X-API-KEY";

/// reqwest-backed client for the Flowscale REST API.
#[derive(Debug, Clone)]
pub struct FlowscaleClient {
    http: Client,
    base_url: String,
    api_key: String,
    group_id: Option<String>,
    poll_interval: Duration,
    run_timeout: Duration,
}

impl FlowscaleClient {
    pub fn new(cfg: &AppConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent(cfg.user_agent.clone())
            .build()
            .map_err(|e| ClientError::Network {
                context: "Failed to build HTTP client".into(),
                source: e,
            })?;
        Ok(Self::with_http(cfg, http))
    }

    fn with_http(cfg: &AppConfig, http: Client) -> Self {
        Self {
            http,
            base_url: cfg.base_url.clone(),
            api_key: cfg.api_key.clone(),
            group_id: cfg.workflow.group_id.clone(),
            poll_interval: cfg.workflow.poll_interval,
            run_timeout: cfg.workflow.run_timeout,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authed(&self, rb: RequestBuilder) -> RequestBuilder {
        rb.header(API_KEY_HEADER, &self.api_key)
    }

    /// Send a request and decode the JSON body, mapping transport and HTTP failures.
    async fn send_json(&self, rb: RequestBuilder, context: &str) -> Result<Value> {
        let resp = self
            .authed(rb)
            .send()
            .await
            .map_err(|e| ClientError::Network {
                context: format!("{context} ({})", self.base_url),
                source: e,
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::Http { status, body });
        }

        resp.json().await.map_err(|e| ClientError::Network {
            context: format!("Failed to parse response: {context}"),
            source: e,
        })
    }

    async fn fetch_run(&self, run_id: &str) -> Result<RunRecord> {
        let rb = self
            .http
            .get(self.url(&format!("/api/v1/runs/{run_id}")))
            .timeout(Duration::from_secs(10));
        let json = self.send_json(rb, "Failed to fetch run status").await?;
        parse_run_record(&json)
    }

    async fn fetch_output(&self, filename: &str) -> Result<(String, WorkflowResultData)> {
        let rb = self
            .http
            .get(self.url("/api/v1/runs/output"))
            .query(&[("filename", filename)])
            .timeout(Duration::from_secs(10));
        let json = self.send_json(rb, "Failed to fetch run output").await?;
        parse_output(&json)
    }

    /// Download an output image. Output URLs are pre-signed, so no API key is sent.
    pub async fn download(&self, url: &str) -> Result<Bytes> {
        let resp = self
            .http
            .get(url)
            .timeout(Duration::from_secs(60))
            .send()
            .await
            .map_err(|e| ClientError::Network {
                context: format!("Failed to download {url}"),
                source: e,
            })?;
        if !resp.status().is_success() {
            return Err(ClientError::Http {
                status: resp.status().as_u16(),
                body: format!("Failed to download {url}"),
            });
        }
        resp.bytes().await.map_err(|e| ClientError::Network {
            context: "Failed to read output bytes".into(),
            source: e,
        })
    }
}

#[async_trait::async_trait]
impl WorkflowClient for FlowscaleClient {
    async fn start_run(&self, workflow_id: &str, inputs: WorkflowInputs) -> Result<String> {
        let mut form = Form::new();
        for (slot, value) in inputs {
            form = match value {
                InputValue::Text(text) => form.text(slot, text),
                InputValue::Image(image) => {
                    let part = Part::stream(image.bytes.clone())
                        .file_name(image.name.clone())
                        .mime_str(image.mime.as_str())
                        .map_err(|e| ClientError::Network {
                            context: format!("Invalid mime type for {}", image.name),
                            source: e,
                        })?;
                    form.part(slot, part)
                }
            };
        }
        if let Some(group) = &self.group_id {
            form = form.text("group_id", group.clone());
        }

        let rb = self
            .http
            .post(self.url("/api/v1/run"))
            .query(&[("workflow_id", workflow_id)])
            .timeout(Duration::from_secs(60))
            .multipart(form);
        let json = self.send_json(rb, "Failed to start workflow run").await?;
        parse_run_started(&json)
    }

    async fn await_run(&self, run_id: &str) -> Result<WorkflowResult> {
        let deadline = tokio::time::Instant::now() + self.run_timeout;
        loop {
            let run = self.fetch_run(run_id).await?;
            debug!(run_id, status = run.status.label(), "polled run");
            match run.status {
                RunStatus::Pending => {}
                RunStatus::Succeeded => {
                    let filename = run
                        .outputs
                        .first()
                        .map(|o| o.filename.clone())
                        .ok_or_else(|| {
                            ClientError::InvalidResponse(format!(
                                "Run {run_id} completed without outputs"
                            ))
                        })?;
                    let (status, data) = self.fetch_output(&filename).await?;
                    return Ok(WorkflowResult {
                        status,
                        run_id: run_id.to_string(),
                        data,
                    });
                }
                RunStatus::Failed | RunStatus::Cancelled => {
                    return Err(ClientError::RunFailed(format!(
                        "run {run_id} ended as {}",
                        run.status.label()
                    )));
                }
            }

            if tokio::time::Instant::now() + self.poll_interval > deadline {
                return Err(ClientError::Timeout {
                    run_id: run_id.to_string(),
                    after: self.run_timeout,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn cancel_run(&self, run_id: &str) -> Result<()> {
        let rb = self
            .http
            .post(self.url(&format!("/api/v1/runs/{run_id}/cancel")))
            .timeout(Duration::from_secs(10));
        let json = self.send_json(rb, "Failed to cancel run").await?;
        match envelope_status(&json) {
            Some("success") | None => Ok(()),
            Some(other) => Err(ClientError::InvalidResponse(format!(
                "Cancel of {run_id} returned status {other}"
            ))),
        }
    }

    async fn get_runs(&self) -> Result<RunHistory> {
        let mut rb = self
            .http
            .get(self.url("/api/v1/runs"))
            .timeout(Duration::from_secs(10));
        if let Some(group) = &self.group_id {
            rb = rb.query(&[("group_id", group.as_str())]);
        }
        let json = self.send_json(rb, "Failed to fetch run history").await?;
        parse_history(json)
    }
}

fn envelope_status(json: &Value) -> Option<&str> {
    json.get("status").and_then(|v| v.as_str())
}

fn parse_run_started(json: &Value) -> Result<String> {
    if let Some(status) = envelope_status(json) {
        if status != "success" {
            let msg = json
                .get("errors")
                .or_else(|| json.get("message"))
                .map(|v| v.to_string())
                .unwrap_or_else(|| status.to_string());
            return Err(ClientError::RunFailed(msg));
        }
    }
    json.pointer("/data/run_id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| ClientError::InvalidResponse("Response missing data.run_id".into()))
}

fn parse_run_record(json: &Value) -> Result<RunRecord> {
    let data = json
        .get("data")
        .cloned()
        .ok_or_else(|| ClientError::InvalidResponse("Run response missing data".into()))?;
    Ok(serde_json::from_value(data)?)
}

fn parse_output(json: &Value) -> Result<(String, WorkflowResultData)> {
    let status = envelope_status(json).unwrap_or("unknown").to_string();
    let data = match json.get("data") {
        Some(d) => serde_json::from_value(d.clone())?,
        None => WorkflowResultData::default(),
    };
    Ok((status, data))
}

fn parse_history(mut json: Value) -> Result<RunHistory> {
    match json.get_mut("data").map(Value::take) {
        Some(data) => Ok(serde_json::from_value(data)?),
        None => Err(ClientError::InvalidResponse(
            "History response missing data".into(),
        )),
    }
}
