use crate::model::GenerationRecord;
use crate::orchestrator;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::sync::OnceLock;
use std::time::Duration;

use super::state::UiState;

static CLIPBOARD_SENDER: OnceLock<std_mpsc::Sender<String>> = OnceLock::new();

/// Write the record into `dir` under its default export name.
pub fn export_record_in(dir: &Path, record: &GenerationRecord) -> Result<PathBuf> {
    let path = dir.join(orchestrator::default_export_name(record));
    orchestrator::export_json(&path, record)?;
    Ok(path)
}

/// Export the last settled episode into the current directory and report it on the status line.
pub fn export_last_record(state: &mut UiState) {
    let Some(record) = state.last_record.as_ref() else {
        state.info = "No finished generation to export yet.".into();
        return;
    };
    let res = std::env::current_dir()
        .context("get current directory")
        .and_then(|dir| export_record_in(&dir, record));
    match res {
        Ok(p) => {
            state.last_exported_path = Some(p.to_string_lossy().to_string());
            state.info = format!("Exported JSON: {}", p.display());
        }
        Err(e) => state.info = format!("JSON export failed: {e:#}"),
    }
}

/// What `y` copies on the current tab: the selected run's output on History,
/// otherwise the latest output URL, falling back to the last export path.
pub fn copy_target(state: &UiState) -> Option<String> {
    if state.tab == super::state::TAB_HISTORY {
        return state
            .selected_run()
            .and_then(|r| r.first_output_url())
            .map(str::to_string);
    }
    state
        .snapshot
        .output_url
        .clone()
        .or_else(|| state.last_exported_path.clone())
}

/// Background thread that owns clipboard instances, keeping each alive long enough
/// for clipboard managers on Linux to read it.
fn init_clipboard_manager() -> Result<&'static std_mpsc::Sender<String>> {
    CLIPBOARD_SENDER.get_or_init(|| {
        let (tx, rx) = std_mpsc::channel::<String>();

        std::thread::spawn(move || {
            use arboard::Clipboard;

            for text in rx {
                if let Ok(mut clipboard) = Clipboard::new() {
                    if clipboard.set_text(&text).is_ok() {
                        std::thread::sleep(Duration::from_secs(2));
                    }
                }
            }
        });

        tx
    });

    CLIPBOARD_SENDER
        .get()
        .ok_or_else(|| anyhow::anyhow!("Failed to initialize clipboard manager"))
}

/// Queue text for the clipboard without blocking the UI thread.
pub fn copy_to_clipboard(text: &str) -> Result<()> {
    let sender = init_clipboard_manager()?;
    sender
        .send(text.to_string())
        .map_err(|_| anyhow::anyhow!("Clipboard manager channel closed"))?;
    Ok(())
}
