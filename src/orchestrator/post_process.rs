//! Post-run processing utilities.
//!
//! Builds the generation record once a run settles, downloads the output image and
//! writes exports for one-shot CLI modes and the TUI.

use crate::cli::Cli;
use crate::client::FlowscaleClient;
use crate::model::{ControllerSnapshot, GenerationRecord, RunState};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Result of post-run processing, ready for presentation layers.
pub(crate) struct ProcessedRun {
    pub record: GenerationRecord,
    pub messages: Vec<String>,
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "now".into())
}

/// Summarise a settled episode from the controller's final snapshot.
pub(crate) fn build_record(
    workflow_id: &str,
    input_filename: &str,
    prompt: &str,
    snapshot: &ControllerSnapshot,
    elapsed: Duration,
) -> GenerationRecord {
    GenerationRecord {
        timestamp_utc: now_rfc3339(),
        workflow_id: workflow_id.to_string(),
        run_id: snapshot.last_run_id.clone(),
        state: snapshot.state,
        input_filename: input_filename.to_string(),
        prompt: prompt.to_string(),
        output_url: snapshot.output_url.clone(),
        message: snapshot.message.clone(),
        elapsed,
        saved_output: None,
    }
}

/// Write a record as pretty JSON, creating parent directories as needed.
pub(crate) fn export_json(path: &Path, record: &GenerationRecord) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(record)?;
    std::fs::write(path, json).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Default export filename for a record, e.g. `flowscale-2024-05-01_10-00-00Z-run-42.json`.
pub(crate) fn default_export_name(record: &GenerationRecord) -> String {
    let run: String = record
        .run_id
        .as_deref()
        .unwrap_or("norun")
        .chars()
        .take(12)
        .collect();
    format!(
        "flowscale-{}-{}.json",
        record.timestamp_utc.replace(':', "-").replace('T', "_"),
        run
    )
}

async fn save_output(client: &FlowscaleClient, url: &str, dest: &Path) -> Result<PathBuf> {
    let bytes = client
        .download(url)
        .await
        .context("download output image")?;
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    std::fs::write(dest, &bytes).with_context(|| format!("write {}", dest.display()))?;
    Ok(dest.to_path_buf())
}

/// Download the output (if requested and available) and write the JSON export (if requested).
pub(crate) async fn process_run_completion(
    args: &Cli,
    client: &FlowscaleClient,
    mut record: GenerationRecord,
) -> ProcessedRun {
    let mut messages = Vec::new();

    if let (RunState::Succeeded, Some(url), Some(dest)) = (
        record.state,
        record.output_url.clone(),
        args.output.as_deref(),
    ) {
        match save_output(client, &url, dest).await {
            Ok(p) => {
                messages.push(format!("Saved output: {}", p.display()));
                record.saved_output = Some(p);
            }
            Err(e) => messages.push(format!("Saving output failed: {e:#}")),
        }
    }

    if let Some(export_path) = args.export_json.as_deref() {
        match export_json(export_path, &record) {
            Ok(_) => messages.push(format!("Exported JSON: {}", export_path.display())),
            Err(e) => messages.push(format!("Export JSON failed: {e:#}")),
        }
    }

    ProcessedRun { record, messages }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> ControllerSnapshot {
        ControllerSnapshot {
            state: RunState::Succeeded,
            progress: 100,
            last_run_id: Some("run-1234567890abcdef".into()),
            output_url: Some("https://x/out.png".into()),
            message: Some("Image generated successfully.".into()),
            ..Default::default()
        }
    }

    #[test]
    fn record_carries_snapshot_outcome() {
        let record = build_record("wf-1", "valid.png", "a cat", &snapshot(), Duration::from_secs(7));
        assert_eq!(record.state, RunState::Succeeded);
        assert_eq!(record.run_id.as_deref(), Some("run-1234567890abcdef"));
        assert_eq!(record.output_url.as_deref(), Some("https://x/out.png"));
        assert_eq!(record.prompt, "a cat");
        assert!(record.saved_output.is_none());
    }

    #[test]
    fn export_writes_readable_json() {
        let dir = tempfile::tempdir().unwrap();
        let record = build_record("wf-1", "valid.png", "a cat", &snapshot(), Duration::from_secs(7));
        let path = dir.path().join("nested").join(default_export_name(&record));
        export_json(&path, &record).unwrap();

        let back: GenerationRecord =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back.state, RunState::Succeeded);
        assert_eq!(back.elapsed, Duration::from_secs(7));
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"elapsed\": \"7s\""));
    }

    #[test]
    fn export_name_is_filesystem_friendly() {
        let mut record = build_record("wf", "a.png", "", &snapshot(), Duration::ZERO);
        record.timestamp_utc = "2024-05-01T10:00:00Z".into();
        assert_eq!(
            default_export_name(&record),
            "flowscale-2024-05-01_10-00-00Z-run-12345678.json"
        );
    }

    #[test]
    fn export_name_truncates_non_ascii_run_ids_by_character() {
        let mut record = build_record("wf", "a.png", "", &snapshot(), Duration::ZERO);
        record.timestamp_utc = "2024-05-01T10:00:00Z".into();
        record.run_id = Some("run-xéééééééé".into());
        assert_eq!(
            default_export_name(&record),
            "flowscale-2024-05-01_10-00-00Z-run-xééééééé.json"
        );
    }
}
