//! Run lifecycle controller.
//!
//! Owns the submit/cancel/settle state machine, the cosmetic progress ticker and the
//! run history, and emits snapshots for presentation layers. The controller is owned
//! by a single task; network work runs in spawned tasks that report back through a
//! channel tagged with the episode that started them.

use crate::client::WorkflowClient;
use crate::error::{mentions_timeout, ClientError, RunError};
use crate::model::{
    ControllerEvent, ControllerSnapshot, InfoEvent, InputValue, PendingInput, RunHistory,
    RunState, WorkflowInputs, WorkflowResult, WorkflowSettings,
};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

pub(crate) const TICK_INTERVAL: Duration = Duration::from_millis(500);
pub(crate) const TICK_STEP: u8 = 5;
/// The ticker never reaches 100 on its own; only a real success does.
pub(crate) const TICK_CEILING: u8 = 95;
/// How long shutdown waits for cancelled runs to be cancelled remotely.
pub(crate) const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Commands emitted by UI layers to drive the controller.
#[derive(Debug)]
pub(crate) enum UiCommand {
    Submit(PendingInput),
    Cancel,
    RefreshHistory,
    Quit,
}

/// Messages from the task executing an episode's network calls.
#[derive(Debug)]
pub(crate) enum RemoteUpdate {
    Accepted {
        episode: u64,
        run_id: String,
    },
    Settled {
        episode: u64,
        outcome: std::result::Result<WorkflowResult, ClientError>,
    },
}

/// Something the controller has to react to.
#[derive(Debug)]
pub(crate) enum Wake {
    Tick,
    Remote(RemoteUpdate),
}

/// What applying a [`Wake`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Applied {
    Ticked,
    Accepted,
    Transitioned(RunState),
    Discarded,
}

/// Recurring cosmetic progress timer. Dropping it stops the ticks.
struct ProgressTicker {
    interval: Interval,
}

impl ProgressTicker {
    fn start() -> Self {
        let mut interval = tokio::time::interval_at(Instant::now() + TICK_INTERVAL, TICK_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }

    async fn tick(&mut self) {
        self.interval.tick().await;
    }
}

pub(crate) fn advance_progress(progress: u8) -> u8 {
    progress.saturating_add(TICK_STEP).min(TICK_CEILING)
}

struct ActiveRun {
    episode: u64,
    run_id: Option<String>,
    task: JoinHandle<()>,
    /// Firing or dropping this tells the episode task to cancel its run remotely.
    cancel_tx: oneshot::Sender<()>,
}

pub(crate) struct RunController<C: WorkflowClient + 'static> {
    client: Arc<C>,
    workflow: WorkflowSettings,
    state: RunState,
    progress: u8,
    output_url: Option<String>,
    message: Option<String>,
    history: RunHistory,
    active: Option<ActiveRun>,
    /// Episode tasks that were cancelled but may still owe the service a cancel request.
    cancelling: Vec<JoinHandle<()>>,
    last_run_id: Option<String>,
    ticker: Option<ProgressTicker>,
    next_episode: u64,
    updates_tx: UnboundedSender<RemoteUpdate>,
    updates_rx: UnboundedReceiver<RemoteUpdate>,
    event_tx: Option<UnboundedSender<ControllerEvent>>,
}

impl<C: WorkflowClient + 'static> RunController<C> {
    pub(crate) fn new(client: Arc<C>, workflow: WorkflowSettings) -> Self {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        Self {
            client,
            workflow,
            state: RunState::Idle,
            progress: 0,
            output_url: None,
            message: None,
            history: RunHistory::default(),
            active: None,
            cancelling: Vec::new(),
            last_run_id: None,
            ticker: None,
            next_episode: 0,
            updates_tx,
            updates_rx,
            event_tx: None,
        }
    }

    /// Publish snapshots and info messages to a presentation layer.
    pub(crate) fn with_events(mut self, event_tx: UnboundedSender<ControllerEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub(crate) fn state(&self) -> RunState {
        self.state
    }

    pub(crate) fn progress(&self) -> u8 {
        self.progress
    }

    pub(crate) fn output_url(&self) -> Option<&str> {
        self.output_url.as_deref()
    }

    pub(crate) fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub(crate) fn history(&self) -> &RunHistory {
        &self.history
    }

    pub(crate) fn active_run_id(&self) -> Option<&str> {
        self.active.as_ref().and_then(|a| a.run_id.as_deref())
    }

    /// Id of the most recently settled or cancelled run, if the service assigned one.
    pub(crate) fn last_run_id(&self) -> Option<&str> {
        self.last_run_id.as_deref()
    }

    pub(crate) fn snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            state: self.state,
            progress: self.progress,
            active_run_id: self.active_run_id().map(str::to_string),
            last_run_id: self.last_run_id.clone(),
            output_url: self.output_url.clone(),
            message: self.message.clone(),
            history: self.history.clone(),
        }
    }

    pub(crate) fn publish(&self) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(ControllerEvent::Snapshot(Box::new(self.snapshot())));
        }
    }

    fn emit_info(&self, info: InfoEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(ControllerEvent::Info(info));
        }
    }

    /// Start a new run. Rejected without a file or while another run is awaiting its result.
    pub(crate) fn submit(&mut self, input: PendingInput) -> std::result::Result<(), RunError> {
        let PendingInput { file, prompt } = input;
        let file = file.ok_or_else(|| RunError::InvalidInput("no image selected".into()))?;
        if self.state == RunState::AwaitingResult {
            return Err(RunError::RunInProgress);
        }

        self.next_episode += 1;
        let episode = self.next_episode;
        let filename = file.name.clone();
        let inputs: WorkflowInputs = vec![
            (self.workflow.image_slot.clone(), InputValue::Image(file)),
            (self.workflow.prompt_slot.clone(), InputValue::Text(prompt)),
        ];

        self.state = RunState::AwaitingResult;
        self.progress = 0;
        self.output_url = None;
        self.message = None;
        self.ticker = Some(ProgressTicker::start());

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let task = tokio::spawn(execute_episode(
            self.client.clone(),
            self.workflow.workflow_id.clone(),
            episode,
            inputs,
            self.updates_tx.clone(),
            cancel_rx,
        ));
        self.active = Some(ActiveRun {
            episode,
            run_id: None,
            task,
            cancel_tx,
        });

        info!(episode, file = %filename, "submitted generation");
        self.emit_info(InfoEvent::Submitted { filename });
        self.publish();
        Ok(())
    }

    /// Wait for the next tick or remote update. Cancel-safe, so it can sit in a `select!`.
    pub(crate) async fn next_wake(&mut self) -> Wake {
        let ticker = self.ticker.as_mut();
        tokio::select! {
            Some(update) = self.updates_rx.recv() => Wake::Remote(update),
            _ = async {
                match ticker {
                    Some(t) => t.tick().await,
                    None => futures::future::pending().await,
                }
            } => Wake::Tick,
        }
    }

    pub(crate) async fn apply(&mut self, wake: Wake) -> Applied {
        match wake {
            Wake::Tick => {
                if self.state == RunState::AwaitingResult {
                    self.progress = advance_progress(self.progress);
                    self.publish();
                }
                Applied::Ticked
            }
            Wake::Remote(RemoteUpdate::Accepted { episode, run_id }) => match self.active.as_mut() {
                Some(active) if active.episode == episode => {
                    info!(episode, run_id = %run_id, "run accepted");
                    active.run_id = Some(run_id.clone());
                    self.emit_info(InfoEvent::RunAccepted { run_id });
                    self.publish();
                    Applied::Accepted
                }
                _ => {
                    // The episode task cancels its own run once it sees the cancel signal.
                    debug!(episode, run_id = %run_id, "discarding acceptance of inactive run");
                    Applied::Discarded
                }
            },
            Wake::Remote(RemoteUpdate::Settled { episode, outcome }) => {
                if self.active.as_ref().map(|a| a.episode) != Some(episode) {
                    debug!(episode, "discarding result of inactive run");
                    return Applied::Discarded;
                }
                self.settle_active(outcome).await
            }
        }
    }

    /// Drive ticks and remote updates until the current run leaves `AwaitingResult`.
    pub(crate) async fn settle(&mut self) -> RunState {
        while self.state == RunState::AwaitingResult {
            let wake = self.next_wake().await;
            self.apply(wake).await;
        }
        self.state
    }

    async fn settle_active(
        &mut self,
        outcome: std::result::Result<WorkflowResult, ClientError>,
    ) -> Applied {
        self.ticker = None;
        let run_id = self
            .active
            .take()
            .and_then(|a| a.run_id)
            .unwrap_or_default();
        self.last_run_id = Some(run_id.clone()).filter(|id| !id.is_empty());

        let failure = match outcome {
            Ok(result) if result.is_success() => {
                info!(run_id = %run_id, url = %result.data.download_url, "generation succeeded");
                self.state = RunState::Succeeded;
                self.progress = 100;
                self.output_url =
                    Some(result.data.download_url).filter(|url| !url.trim().is_empty());
                self.message = Some("Image generated successfully.".into());
                self.publish();
                let _ = self.refresh_history().await;
                return Applied::Transitioned(RunState::Succeeded);
            }
            Ok(result) => classify_unsuccessful(&result),
            Err(e) => RunError::from_remote(&e),
        };

        warn!(run_id = %run_id, error = %failure, "generation failed");
        self.state = RunState::Failed;
        self.message = Some(failure.user_message());
        self.publish();
        Applied::Transitioned(RunState::Failed)
    }

    /// Cancel the active run. No-op when nothing is awaiting a result.
    ///
    /// The transition is local and immediate; the episode task sends the remote
    /// cancel request in the background, whether or not the run id is known yet.
    pub(crate) fn cancel(&mut self) {
        if self.state != RunState::AwaitingResult {
            return;
        }
        let Some(ActiveRun {
            episode,
            run_id,
            task,
            cancel_tx,
        }) = self.active.take()
        else {
            return;
        };
        self.ticker = None;

        let _ = cancel_tx.send(());
        self.cancelling.retain(|t| !t.is_finished());
        self.cancelling.push(task);
        info!(episode, run_id = ?run_id, "run cancelled");

        self.last_run_id = run_id;
        self.state = RunState::Cancelled;
        self.progress = 0;
        self.output_url = None;
        self.message = Some("Generation cancelled.".into());
        self.publish();
    }

    /// Cancel whatever is active and give pending remote cancellations up to
    /// [`SHUTDOWN_GRACE`] to finish before the controller goes away.
    pub(crate) async fn shutdown(mut self) {
        self.cancel();
        let pending = std::mem::take(&mut self.cancelling);
        if pending.iter().all(|t| t.is_finished()) {
            return;
        }
        debug!(count = pending.len(), "waiting for remote cancellations");
        if tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(pending))
            .await
            .is_err()
        {
            warn!("gave up waiting for remote cancellation");
        }
    }

    /// Replace the run history with the service's current list.
    pub(crate) async fn refresh_history(&mut self) -> std::result::Result<(), ClientError> {
        match self.client.get_runs().await {
            Ok(history) => {
                debug!(count = history.runs.len(), "history refreshed");
                self.emit_info(InfoEvent::HistoryRefreshed {
                    count: history.runs.len(),
                });
                self.history = history;
                self.publish();
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "history refresh failed");
                self.emit_info(InfoEvent::HistoryRefreshFailed(e.to_string()));
                Err(e)
            }
        }
    }
}

fn classify_unsuccessful(result: &WorkflowResult) -> RunError {
    let reason = format!(
        "status={}, generation_status={}",
        result.status, result.data.generation_status
    );
    if mentions_timeout(&reason) {
        RunError::RemoteTimeout(reason)
    } else {
        RunError::RemoteFailure(reason)
    }
}

async fn execute_episode<C: WorkflowClient + 'static>(
    client: Arc<C>,
    workflow_id: String,
    episode: u64,
    inputs: WorkflowInputs,
    updates_tx: UnboundedSender<RemoteUpdate>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    // Not raced against cancellation: abandoning the request could leave a run
    // on the service whose id we never learn.
    let run_id = match client.start_run(&workflow_id, inputs).await {
        Ok(id) => id,
        Err(e) => {
            let _ = updates_tx.send(RemoteUpdate::Settled {
                episode,
                outcome: Err(e),
            });
            return;
        }
    };

    // A fired or dropped sender both mean the episode is no longer wanted.
    if !matches!(cancel_rx.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
        cancel_remote(&*client, &run_id).await;
        return;
    }
    let accepted = RemoteUpdate::Accepted {
        episode,
        run_id: run_id.clone(),
    };
    if updates_tx.send(accepted).is_err() {
        cancel_remote(&*client, &run_id).await;
        return;
    }

    tokio::select! {
        outcome = client.await_run(&run_id) => {
            let _ = updates_tx.send(RemoteUpdate::Settled { episode, outcome });
        }
        _ = &mut cancel_rx => cancel_remote(&*client, &run_id).await,
    }
}

/// Best-effort remote cancel. Failures are logged; local state is already cancelled.
async fn cancel_remote<C: WorkflowClient + ?Sized>(client: &C, run_id: &str) {
    match client.cancel_run(run_id).await {
        Ok(()) => info!(run_id, "remote run cancelled"),
        Err(e) => {
            let err = RunError::CancelFailure(e.to_string());
            warn!(run_id, error = %err, "remote cancel failed");
        }
    }
}

enum Step {
    Command(Option<UiCommand>),
    Wake(Wake),
}

/// Serve UI commands until quit, applying ticks and remote updates in between.
pub(crate) async fn run_controller<C: WorkflowClient + 'static>(
    mut controller: RunController<C>,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
) -> Result<()> {
    let _ = controller.refresh_history().await;
    controller.publish();

    loop {
        // Only the waits race; handling happens outside the select so it is never dropped midway.
        let step = tokio::select! {
            cmd = cmd_rx.recv() => Step::Command(cmd),
            wake = controller.next_wake() => Step::Wake(wake),
        };

        match step {
            Step::Command(Some(UiCommand::Submit(input))) => {
                if let Err(e) = controller.submit(input) {
                    info!(error = %e, "submission rejected");
                    controller.emit_info(InfoEvent::Message(e.user_message()));
                }
            }
            Step::Command(Some(UiCommand::Cancel)) => controller.cancel(),
            Step::Command(Some(UiCommand::RefreshHistory)) => {
                let _ = controller.refresh_history().await;
            }
            Step::Command(Some(UiCommand::Quit)) | Step::Command(None) => {
                controller.shutdown().await;
                break;
            }
            Step::Wake(wake) => {
                controller.apply(wake).await;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FAILURE_MESSAGE, TIMEOUT_MESSAGE};
    use crate::intake::ImageFile;
    use crate::model::WorkflowResultData;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    #[derive(Clone)]
    enum Outcome {
        Result(WorkflowResult),
        Fail(String),
    }

    #[derive(Default)]
    struct FakeClient {
        outcome: Mutex<Option<Outcome>>,
        start_fails: bool,
        cancel_fails: bool,
        start_gate: Option<Arc<Notify>>,
        result_gate: Option<Arc<Notify>>,
        result_returned: Arc<Notify>,
        cancel_seen: Arc<Notify>,
        inputs: Mutex<Vec<(String, String)>>,
        start_calls: AtomicUsize,
        cancel_calls: AtomicUsize,
        runs_calls: AtomicUsize,
    }

    impl FakeClient {
        fn with_result(status: &str, generation_status: &str, url: &str) -> Self {
            Self {
                outcome: Mutex::new(Some(Outcome::Result(WorkflowResult {
                    status: status.into(),
                    run_id: "run-1".into(),
                    data: WorkflowResultData {
                        download_url: url.into(),
                        generation_status: generation_status.into(),
                    },
                }))),
                ..Default::default()
            }
        }

        fn succeeding(url: &str) -> Self {
            Self::with_result("success", "success", url)
        }

        fn failing(message: &str) -> Self {
            Self {
                outcome: Mutex::new(Some(Outcome::Fail(message.into()))),
                ..Default::default()
            }
        }

        fn gated(mut self) -> (Self, Arc<Notify>) {
            let gate = Arc::new(Notify::new());
            self.result_gate = Some(gate.clone());
            (self, gate)
        }
    }

    #[async_trait::async_trait]
    impl WorkflowClient for FakeClient {
        async fn start_run(
            &self,
            _workflow_id: &str,
            inputs: WorkflowInputs,
        ) -> crate::error::Result<String> {
            self.start_calls.fetch_add(1, Ordering::SeqCst);
            let described = inputs
                .into_iter()
                .map(|(slot, v)| match v {
                    InputValue::Text(t) => (slot, format!("text:{t}")),
                    InputValue::Image(i) => (slot, format!("image:{}", i.name)),
                })
                .collect();
            *self.inputs.lock().unwrap() = described;
            if let Some(gate) = &self.start_gate {
                gate.notified().await;
            }
            if self.start_fails {
                return Err(ClientError::Http {
                    status: 502,
                    body: "bad gateway".into(),
                });
            }
            Ok("run-1".into())
        }

        async fn await_run(&self, run_id: &str) -> crate::error::Result<WorkflowResult> {
            if let Some(gate) = &self.result_gate {
                gate.notified().await;
            }
            let outcome = self.outcome.lock().unwrap().clone();
            self.result_returned.notify_one();
            match outcome {
                Some(Outcome::Result(mut r)) => {
                    r.run_id = run_id.to_string();
                    Ok(r)
                }
                Some(Outcome::Fail(msg)) => Err(ClientError::RunFailed(msg)),
                None => Err(ClientError::InvalidResponse("no outcome configured".into())),
            }
        }

        async fn cancel_run(&self, _run_id: &str) -> crate::error::Result<()> {
            self.cancel_calls.fetch_add(1, Ordering::SeqCst);
            self.cancel_seen.notify_one();
            if self.cancel_fails {
                return Err(ClientError::InvalidResponse("connection reset".into()));
            }
            Ok(())
        }

        async fn get_runs(&self) -> crate::error::Result<RunHistory> {
            self.runs_calls.fetch_add(1, Ordering::SeqCst);
            Ok(RunHistory {
                group_id: "g".into(),
                count: 0,
                runs: Vec::new(),
            })
        }
    }

    fn settings() -> WorkflowSettings {
        WorkflowSettings {
            workflow_id: "wf-1".into(),
            image_slot: "image_35728".into(),
            prompt_slot: "prompt_24243".into(),
            group_id: None,
            poll_interval: Duration::from_secs(1),
            run_timeout: Duration::from_secs(600),
        }
    }

    fn controller(client: FakeClient) -> (RunController<FakeClient>, Arc<FakeClient>) {
        let client = Arc::new(client);
        (RunController::new(client.clone(), settings()), client)
    }

    fn valid_input(prompt: &str) -> PendingInput {
        let file = ImageFile::from_bytes("valid.png", vec![1u8, 2, 3]).unwrap();
        PendingInput::new(Some(file), prompt)
    }

    async fn drive_until_accepted(c: &mut RunController<FakeClient>) {
        while c.active_run_id().is_none() {
            let wake = c.next_wake().await;
            c.apply(wake).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn successful_run_reaches_succeeded_with_output() {
        let (mut c, client) = controller(FakeClient::succeeding("https://x/out.png"));
        c.submit(valid_input("a cat")).unwrap();
        assert_eq!(c.state(), RunState::AwaitingResult);

        assert_eq!(c.settle().await, RunState::Succeeded);
        assert_eq!(c.output_url(), Some("https://x/out.png"));
        assert_eq!(c.progress(), 100);
        assert_eq!(c.active_run_id(), None);
        assert_eq!(c.last_run_id(), Some("run-1"));
        assert!(c.ticker.is_none());
        assert_eq!(client.runs_calls.load(Ordering::SeqCst), 1);
        assert_eq!(c.history().group_id, "g");

        let inputs = client.inputs.lock().unwrap().clone();
        assert_eq!(
            inputs,
            vec![
                ("image_35728".to_string(), "image:valid.png".to_string()),
                ("prompt_24243".to_string(), "text:a cat".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn submit_without_file_is_rejected_without_state_change() {
        let (mut c, client) = controller(FakeClient::succeeding("https://x/out.png"));
        let err = c.submit(PendingInput::new(None, "a cat")).unwrap_err();
        assert!(matches!(err, RunError::InvalidInput(_)));
        assert_eq!(c.state(), RunState::Idle);
        assert!(c.ticker.is_none());

        // Same from a resting state after a completed run.
        c.submit(valid_input("a cat")).unwrap();
        c.settle().await;
        let err = c.submit(PendingInput::default()).unwrap_err();
        assert!(matches!(err, RunError::InvalidInput(_)));
        assert_eq!(c.state(), RunState::Succeeded);
        assert_eq!(c.output_url(), Some("https://x/out.png"));
        assert_eq!(client.start_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unsuccessful_status_combinations_fail_without_history_refresh() {
        for (status, generation) in [("success", "failed"), ("error", "success"), ("error", "")] {
            let (mut c, client) =
                controller(FakeClient::with_result(status, generation, "https://x/out.png"));
            c.submit(valid_input("a cat")).unwrap();
            assert_eq!(c.settle().await, RunState::Failed, "{status}/{generation}");
            assert_eq!(c.message(), Some(FAILURE_MESSAGE));
            assert_eq!(c.output_url(), None);
            assert_eq!(c.active_run_id(), None);
            assert_eq!(client.runs_calls.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_rejection_gets_timeout_message() {
        let (mut c, client) = controller(FakeClient::failing("Request timed out"));
        c.submit(valid_input("a cat")).unwrap();
        assert_eq!(c.settle().await, RunState::Failed);
        assert_eq!(c.message(), Some(TIMEOUT_MESSAGE));
        assert_eq!(client.runs_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn generic_rejection_gets_generic_message() {
        let (mut c, _client) = controller(FakeClient::failing("out of GPUs"));
        c.submit(valid_input("a cat")).unwrap();
        assert_eq!(c.settle().await, RunState::Failed);
        assert_eq!(c.message(), Some(FAILURE_MESSAGE));
    }

    #[tokio::test(start_paused = true)]
    async fn start_failure_is_caught_and_controller_accepts_new_runs() {
        let (mut c, client) = controller(FakeClient {
            start_fails: true,
            ..FakeClient::succeeding("https://x/out.png")
        });
        c.submit(valid_input("a cat")).unwrap();
        assert_eq!(c.settle().await, RunState::Failed);
        assert_eq!(c.message(), Some(FAILURE_MESSAGE));

        c.submit(valid_input("a dog")).unwrap();
        assert_eq!(c.state(), RunState::AwaitingResult);
        assert_eq!(c.progress(), 0);
        assert_eq!(c.message(), None);
        assert_eq!(c.settle().await, RunState::Failed);
        assert_eq!(client.start_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_without_active_run_is_noop() {
        let (mut c, client) = controller(FakeClient::succeeding("https://x/out.png"));
        c.cancel();
        assert_eq!(c.state(), RunState::Idle);
        assert_eq!(client.cancel_calls.load(Ordering::SeqCst), 0);

        c.submit(valid_input("a cat")).unwrap();
        c.settle().await;
        c.cancel();
        assert_eq!(c.state(), RunState::Succeeded);
        assert_eq!(c.progress(), 100);
        assert_eq!(client.cancel_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_active_run_resets_progress_and_stops_ticker() {
        let (client, _gate) = FakeClient::succeeding("https://x/out.png").gated();
        let (mut c, client) = controller(client);
        c.submit(valid_input("a cat")).unwrap();
        drive_until_accepted(&mut c).await;
        for _ in 0..3 {
            let wake = c.next_wake().await;
            c.apply(wake).await;
        }
        assert!(c.progress() > 0);

        c.cancel();
        assert_eq!(c.state(), RunState::Cancelled);
        assert_eq!(c.progress(), 0);
        assert_eq!(c.active_run_id(), None);
        assert_eq!(c.last_run_id(), Some("run-1"));
        assert_eq!(c.output_url(), None);
        assert!(c.ticker.is_none());

        // The remote request goes out from the episode task.
        tokio::time::timeout(Duration::from_secs(5), client.cancel_seen.notified())
            .await
            .unwrap();
        assert_eq!(client.cancel_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_cancel_request_still_cancels_locally() {
        let (client, _gate) = FakeClient {
            cancel_fails: true,
            ..FakeClient::succeeding("https://x/out.png")
        }
        .gated();
        let (mut c, client) = controller(client);
        c.submit(valid_input("a cat")).unwrap();
        drive_until_accepted(&mut c).await;

        c.cancel();
        assert_eq!(c.state(), RunState::Cancelled);
        assert_eq!(c.progress(), 0);
        c.shutdown().await;
        assert_eq!(client.cancel_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn late_success_after_cancel_is_discarded() {
        let (client, gate) = FakeClient::succeeding("https://x/out.png").gated();
        let (mut c, client) = controller(client);
        c.submit(valid_input("a cat")).unwrap();
        drive_until_accepted(&mut c).await;

        // The remote call resolves, but the user cancels before the result is applied.
        gate.notify_one();
        client.result_returned.notified().await;
        c.cancel();

        let mut applied = Vec::new();
        while applied.last() != Some(&Applied::Discarded) {
            let wake = c.next_wake().await;
            applied.push(c.apply(wake).await);
        }
        assert_eq!(c.state(), RunState::Cancelled);
        assert_eq!(c.progress(), 0);
        assert_eq!(c.output_url(), None);
        assert_eq!(client.runs_calls.load(Ordering::SeqCst), 0);
    }

    fn start_gated(client: FakeClient) -> (FakeClient, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        (
            FakeClient {
                start_gate: Some(gate.clone()),
                ..client
            },
            gate,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_acceptance_cancels_run_in_background() {
        let (client, start_gate) = start_gated(FakeClient::succeeding("https://x/out.png"));
        let (mut c, client) = controller(client);
        c.submit(valid_input("a cat")).unwrap();

        c.cancel();
        assert_eq!(c.state(), RunState::Cancelled);
        assert_eq!(c.last_run_id(), None);
        assert_eq!(client.cancel_calls.load(Ordering::SeqCst), 0);

        start_gate.notify_one();
        tokio::time::timeout(Duration::from_secs(5), client.cancel_seen.notified())
            .await
            .unwrap();
        assert_eq!(client.cancel_calls.load(Ordering::SeqCst), 1);

        // Nothing from the cancelled episode reaches the controller.
        let quiet = tokio::time::timeout(Duration::from_secs(5), c.next_wake()).await;
        assert!(quiet.is_err());
        assert_eq!(c.state(), RunState::Cancelled);
        assert_eq!(c.output_url(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn run_accepted_after_controller_is_gone_is_still_cancelled() {
        let (client, start_gate) = start_gated(FakeClient::succeeding("https://x/out.png"));
        let (mut c, client) = controller(client);
        c.submit(valid_input("a cat")).unwrap();
        c.cancel();
        drop(c);

        start_gate.notify_one();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(client.cancel_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_controller_mid_run_cancels_remotely() {
        let (client, _gate) = FakeClient::succeeding("https://x/out.png").gated();
        let (mut c, client) = controller(client);
        c.submit(valid_input("a cat")).unwrap();
        drive_until_accepted(&mut c).await;
        drop(c);

        tokio::time::timeout(Duration::from_secs(5), client.cancel_seen.notified())
            .await
            .unwrap();
        assert_eq!(client.cancel_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_pending_remote_cancel() {
        let (client, start_gate) = start_gated(FakeClient::succeeding("https://x/out.png"));
        let (mut c, client) = controller(client);
        c.submit(valid_input("a cat")).unwrap();

        // Shutdown cancels the active run itself.
        start_gate.notify_one();
        c.shutdown().await;
        assert_eq!(client.cancel_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_gives_up_after_grace_period() {
        let (client, _start_gate) = start_gated(FakeClient::succeeding("https://x/out.png"));
        let (mut c, client) = controller(client);
        c.submit(valid_input("a cat")).unwrap();

        let started = Instant::now();
        c.shutdown().await;
        assert!(started.elapsed() >= SHUTDOWN_GRACE);
        assert_eq!(client.cancel_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn second_submit_while_awaiting_is_rejected() {
        let (client, gate) = FakeClient::succeeding("https://x/out.png").gated();
        let (mut c, client) = controller(client);
        c.submit(valid_input("a cat")).unwrap();
        let err = c.submit(valid_input("a dog")).unwrap_err();
        assert!(matches!(err, RunError::RunInProgress));
        assert_eq!(c.state(), RunState::AwaitingResult);

        gate.notify_one();
        assert_eq!(c.settle().await, RunState::Succeeded);
        assert_eq!(client.start_calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.inputs.lock().unwrap()[1].1, "text:a cat");
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_advances_in_steps_and_caps_below_completion() {
        let (client, gate) = FakeClient::succeeding("https://x/out.png").gated();
        let (mut c, _client) = controller(client);
        c.submit(valid_input("a cat")).unwrap();

        let started = Instant::now();
        let mut ticks = 0;
        while ticks < 40 {
            let wake = c.next_wake().await;
            if c.apply(wake).await == Applied::Ticked {
                ticks += 1;
                assert!(c.progress() <= TICK_CEILING);
                if ticks == 1 {
                    assert_eq!(c.progress(), TICK_STEP);
                    assert!(started.elapsed() >= TICK_INTERVAL);
                    assert!(started.elapsed() < TICK_INTERVAL * 2);
                }
            }
        }
        assert_eq!(c.progress(), TICK_CEILING);
        assert_eq!(c.state(), RunState::AwaitingResult);

        gate.notify_one();
        assert_eq!(c.settle().await, RunState::Succeeded);
        assert_eq!(c.progress(), 100);
    }

    #[test]
    fn advance_progress_saturates_at_ceiling() {
        assert_eq!(advance_progress(0), 5);
        assert_eq!(advance_progress(90), 95);
        assert_eq!(advance_progress(93), 95);
        assert_eq!(advance_progress(95), 95);
    }

    #[tokio::test(start_paused = true)]
    async fn command_loop_refreshes_history_on_start_and_after_success() {
        let client = Arc::new(FakeClient::succeeding("https://x/out.png"));
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let c = RunController::new(client.clone(), settings()).with_events(event_tx);
        let handle = tokio::spawn(run_controller(c, cmd_rx));

        cmd_tx.send(UiCommand::Submit(PendingInput::default())).unwrap();
        cmd_tx.send(UiCommand::Submit(valid_input("a cat"))).unwrap();

        let mut rejected = false;
        let final_snapshot = loop {
            match event_rx.recv().await.unwrap() {
                ControllerEvent::Info(InfoEvent::Message(_)) => rejected = true,
                ControllerEvent::Snapshot(s) if s.state == RunState::Succeeded => break s,
                _ => {}
            }
        };
        assert!(rejected);
        assert_eq!(final_snapshot.progress, 100);
        assert_eq!(final_snapshot.output_url.as_deref(), Some("https://x/out.png"));

        cmd_tx.send(UiCommand::Quit).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(client.runs_calls.load(Ordering::SeqCst), 2);
    }
}
