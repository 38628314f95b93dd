use crate::error::RunError;
use crate::intake::ImageFile;
use crate::model::{
    ControllerEvent, ControllerSnapshot, GenerationRecord, PendingInput, RunRecord, RunState,
};
use crate::orchestrator;
use crossterm::event::KeyCode;
use std::time::Instant;

pub const TAB_GENERATE: usize = 0;
pub const TAB_HISTORY: usize = 1;
pub const TAB_HELP: usize = 2;
pub const TAB_COUNT: usize = 3;

/// Which input line is being edited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    ImagePath,
    Prompt,
}

/// Values captured at submission, used to describe the episode once it settles.
#[derive(Debug, Clone)]
pub struct Submission {
    pub filename: String,
    pub prompt: String,
    pub started: Instant,
}

pub struct UiState {
    pub tab: usize,
    pub info: String,
    pub workflow_id: String,

    pub snapshot: ControllerSnapshot,

    pub image_path: String,
    pub prompt: String,
    pub editing: Option<Field>,
    pub edit_buffer: String,
    /// Outcome of checking `image_path`: a short description or the rejection message.
    pub preview: Option<Result<String, String>>,

    pub submission: Option<Submission>,
    pub last_record: Option<GenerationRecord>,
    pub last_exported_path: Option<String>,

    pub history_selected: usize, // Index of selected history item (0 = most recent)
    pub history_scroll_offset: usize,
}

impl UiState {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            tab: TAB_GENERATE,
            info: String::new(),
            workflow_id: workflow_id.into(),
            snapshot: ControllerSnapshot::default(),
            image_path: String::new(),
            prompt: String::new(),
            editing: None,
            edit_buffer: String::new(),
            preview: None,
            submission: None,
            last_record: None,
            last_exported_path: None,
            history_selected: 0,
            history_scroll_offset: 0,
        }
    }

    pub fn is_generating(&self) -> bool {
        self.snapshot.state == RunState::AwaitingResult
    }

    /// Fold a controller event into the UI state.
    pub fn apply_event(&mut self, ev: ControllerEvent) {
        match ev {
            ControllerEvent::Snapshot(snap) => self.apply_snapshot(*snap),
            ControllerEvent::Info(info) => self.info = info.to_message(),
        }
    }

    fn apply_snapshot(&mut self, snap: ControllerSnapshot) {
        let settled = self.snapshot.state == RunState::AwaitingResult
            && snap.state != RunState::AwaitingResult;
        self.snapshot = snap;

        if settled {
            if let Some(sub) = self.submission.take() {
                self.last_record = Some(orchestrator::build_record(
                    &self.workflow_id,
                    &sub.filename,
                    &sub.prompt,
                    &self.snapshot,
                    sub.started.elapsed(),
                ));
            }
            if let Some(msg) = self.snapshot.message.clone() {
                self.info = msg;
            }
        }

        let len = self.snapshot.history.runs.len();
        if self.history_selected >= len {
            self.history_selected = len.saturating_sub(1);
        }
        if self.history_scroll_offset > self.history_selected {
            self.history_scroll_offset = self.history_selected;
        }
    }

    /// Re-check the staged image so the Generate tab can show what will be uploaded.
    pub fn refresh_preview(&mut self) {
        self.preview = if self.image_path.is_empty() {
            None
        } else {
            Some(
                ImageFile::load(std::path::Path::new(&self.image_path))
                    .map(|f| f.describe())
                    .map_err(|e| RunError::from(e).user_message()),
            )
        };
    }

    pub fn begin_edit(&mut self, field: Field) {
        self.edit_buffer = match field {
            Field::ImagePath => self.image_path.clone(),
            Field::Prompt => self.prompt.clone(),
        };
        self.editing = Some(field);
    }

    /// Feed a key to the active editor. Returns false when no field is being edited.
    pub fn edit_key(&mut self, code: KeyCode) -> bool {
        let Some(field) = self.editing else {
            return false;
        };
        match code {
            KeyCode::Enter => {
                let value = std::mem::take(&mut self.edit_buffer);
                match field {
                    Field::ImagePath => {
                        self.image_path = value.trim().to_string();
                        self.refresh_preview();
                    }
                    Field::Prompt => self.prompt = value,
                }
                self.editing = None;
            }
            KeyCode::Esc => {
                self.edit_buffer.clear();
                self.editing = None;
            }
            KeyCode::Backspace => {
                self.edit_buffer.pop();
            }
            KeyCode::Char(c) => self.edit_buffer.push(c),
            _ => {}
        }
        true
    }

    /// Load the staged image and remember what was submitted.
    ///
    /// An empty path yields an input without a file; the controller rejects it.
    pub fn prepare_submission(&mut self) -> Result<PendingInput, String> {
        let file = if self.image_path.is_empty() {
            None
        } else {
            let loaded = ImageFile::load(std::path::Path::new(&self.image_path))
                .map_err(|e| RunError::from(e).user_message())?;
            Some(loaded)
        };
        if !self.is_generating() {
            if let Some(f) = file.as_ref() {
                self.submission = Some(Submission {
                    filename: f.name.clone(),
                    prompt: self.prompt.clone(),
                    started: Instant::now(),
                });
            }
        }
        Ok(PendingInput::new(file, self.prompt.clone()))
    }

    pub fn selected_run(&self) -> Option<&RunRecord> {
        self.snapshot.history.runs.get(self.history_selected)
    }

    pub fn select_prev(&mut self) {
        if self.history_selected > 0 {
            self.history_selected -= 1;
            if self.history_selected < self.history_scroll_offset {
                self.history_scroll_offset = self.history_selected;
            }
        }
    }

    pub fn select_next(&mut self, visible: usize) {
        let len = self.snapshot.history.runs.len();
        if self.history_selected + 1 < len {
            self.history_selected += 1;
            let visible = visible.max(1);
            if self.history_selected >= self.history_scroll_offset + visible {
                self.history_scroll_offset = self.history_selected + 1 - visible;
            }
        }
    }

    pub fn next_tab(&mut self) {
        self.tab = (self.tab + 1) % TAB_COUNT;
    }
}
