use crate::client::FlowscaleClient;
use crate::config::AppConfig;
use crate::error::RunError;
use crate::intake::ImageFile;
use crate::model::{ControllerEvent, PendingInput, RunHistory, RunState};
use crate::orchestrator::{self, RunController};
use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "flowscale-cli",
    version,
    about = "Image-to-image generation on Flowscale workflows with optional TUI"
)]
pub struct Cli {
    /// Flowscale API key
    #[arg(long, env = "FLOWSCALE_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Base URL of the Flowscale API
    #[arg(long, env = "FLOWSCALE_API_URL")]
    pub base_url: Option<String>,

    /// Workflow to execute
    #[arg(long, env = "FLOWSCALE_WORKFLOW_ID")]
    pub workflow_id: Option<String>,

    /// Input slot id of the workflow's image input
    #[arg(long, env = "FLOWSCALE_IMAGE_SLOT", default_value = "image_input")]
    pub image_slot: String,

    /// Input slot id of the workflow's prompt input
    #[arg(long, env = "FLOWSCALE_PROMPT_SLOT", default_value = "prompt_input")]
    pub prompt_slot: String,

    /// Group runs under this id (also filters history)
    #[arg(long, env = "FLOWSCALE_GROUP_ID")]
    pub group_id: Option<String>,

    /// How often to poll a running workflow
    #[arg(long, default_value = "1s")]
    pub poll_interval: humantime::Duration,

    /// Give up on a run after this long
    #[arg(long, default_value = "10m")]
    pub run_timeout: humantime::Duration,

    /// Image to upload (png, jpg, jpeg, gif; at most 10 MiB)
    #[arg(long)]
    pub image: Option<std::path::PathBuf>,

    /// Prompt sent alongside the image
    #[arg(long, default_value = "")]
    pub prompt: String,

    /// Print JSON result and exit (no TUI)
    #[arg(long)]
    pub json: bool,

    /// Print text summary and exit (no TUI)
    #[arg(long)]
    pub text: bool,

    /// Run silently: suppress all output except errors (for scripts)
    #[arg(long)]
    pub silent: bool,

    /// Print the run history and exit
    #[arg(long)]
    pub history: bool,

    /// Export the generation record as JSON
    #[arg(long)]
    pub export_json: Option<std::path::PathBuf>,

    /// Download the generated image to this path
    #[arg(long)]
    pub output: Option<std::path::PathBuf>,
}

impl Cli {
    pub fn is_interactive(&self) -> bool {
        !(self.json || self.text || self.silent || self.history)
    }
}

pub async fn run(args: Cli) -> Result<()> {
    // Validate that --silent can only be used with --json
    if args.silent && !args.json {
        return Err(anyhow::anyhow!(
            "--silent can only be used with --json. Use --silent --json together."
        ));
    }

    // Refuse to start on partial configuration.
    let cfg = AppConfig::from_cli(&args).context("invalid configuration")?;

    if args.history {
        return run_history(&args, &cfg).await;
    }

    if args.is_interactive() {
        #[cfg(feature = "tui")]
        {
            return crate::tui::run(args, cfg).await;
        }
        #[cfg(not(feature = "tui"))]
        {
            // Fallback when built without TUI support.
            return run_once(args, cfg).await;
        }
    }

    run_once(args, cfg).await
}

/// Stage the CLI's image and prompt. A missing `--image` is left for the controller to reject.
fn pending_input(args: &Cli) -> Result<PendingInput> {
    let file = match args.image.as_deref() {
        Some(path) => Some(
            ImageFile::load(path)
                .map_err(|e| anyhow::anyhow!(RunError::from(e).user_message()))?,
        ),
        None => None,
    };
    Ok(PendingInput::new(file, args.prompt.clone()))
}

/// Submit one generation, follow it to completion and report the outcome.
async fn run_once(args: Cli, cfg: AppConfig) -> Result<()> {
    let client = Arc::new(FlowscaleClient::new(&cfg).context("create Flowscale client")?);
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<ControllerEvent>();
    let mut controller =
        RunController::new(client.clone(), cfg.workflow.clone()).with_events(evt_tx);

    let input = pending_input(&args)?;
    let input_filename = input
        .file
        .as_ref()
        .map(|f| f.name.clone())
        .unwrap_or_default();
    let prompt = input.prompt.clone();

    let started = Instant::now();
    controller
        .submit(input)
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;

    let (out_tx, out_handle) = spawn_output_writer();
    let verbose = args.text;
    let progress_tx = out_tx.clone();
    let printer = tokio::spawn(async move {
        let mut last_progress = None;
        while let Some(ev) = evt_rx.recv().await {
            if !verbose {
                continue;
            }
            match ev {
                ControllerEvent::Snapshot(s) => {
                    if s.state == RunState::AwaitingResult && last_progress != Some(s.progress) {
                        last_progress = Some(s.progress);
                        let _ = progress_tx.send(OutputLine::Stderr(format!(
                            "Generating: {:>3}%",
                            s.progress
                        )));
                    }
                }
                ControllerEvent::Info(info) => {
                    let _ = progress_tx.send(OutputLine::Stderr(info.to_message()));
                }
            }
        }
    });

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;
    while controller.state() == RunState::AwaitingResult {
        tokio::select! {
            wake = controller.next_wake() => {
                controller.apply(wake).await;
            }
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                let _ = out_tx.send(OutputLine::Stderr("Cancelling…".into()));
                controller.cancel();
            }
        }
    }

    let snapshot = controller.snapshot();
    // Lets a cancelled run reach the service, then closes the event channel so the
    // printer drains and exits.
    controller.shutdown().await;
    let _ = printer.await;

    let record = orchestrator::build_record(
        &cfg.workflow.workflow_id,
        &input_filename,
        &prompt,
        &snapshot,
        started.elapsed(),
    );
    let processed = orchestrator::process_run_completion(&args, &client, record).await;

    if !args.silent {
        for msg in &processed.messages {
            let _ = out_tx.send(OutputLine::Stderr(msg.clone()));
        }
        if args.json {
            let out = serde_json::to_string_pretty(&processed.record)?;
            let _ = out_tx.send(OutputLine::Stdout(out));
        } else {
            match (snapshot.state, snapshot.output_url.as_deref()) {
                (RunState::Succeeded, Some(url)) => {
                    let _ = out_tx.send(OutputLine::Stdout(url.to_string()));
                }
                (state, _) => {
                    let msg = snapshot.message.clone().unwrap_or_default();
                    let _ = out_tx.send(OutputLine::Stderr(format!("{}: {msg}", state.label())));
                }
            }
        }
    }

    drop(out_tx);
    let _ = out_handle.await;

    match snapshot.state {
        RunState::Succeeded => Ok(()),
        RunState::Cancelled => Err(anyhow::anyhow!("Generation cancelled")),
        _ => Err(anyhow::anyhow!(snapshot
            .message
            .unwrap_or_else(|| "Generation failed".into()))),
    }
}

/// Render history rows for text mode.
pub(crate) fn history_lines(history: &RunHistory) -> Vec<String> {
    let mut lines = vec![format!(
        "{} run(s){}",
        history.runs.len(),
        if history.group_id.is_empty() {
            String::new()
        } else {
            format!(" in group {}", history.group_id)
        }
    )];
    for run in &history.runs {
        lines.push(format!(
            "{:<26} {:<10} {}",
            run.id,
            run.status.label(),
            run.first_output_url().unwrap_or("-")
        ));
    }
    lines
}

async fn run_history(args: &Cli, cfg: &AppConfig) -> Result<()> {
    let client = Arc::new(FlowscaleClient::new(cfg).context("create Flowscale client")?);
    let mut controller = RunController::new(client, cfg.workflow.clone());
    controller
        .refresh_history()
        .await
        .context("fetch run history")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(controller.history())?);
    } else {
        for line in history_lines(controller.history()) {
            println!("{line}");
        }
    }
    Ok(())
}
