mod export;
mod help;
mod state;

use crate::cli::Cli;
use crate::client::FlowscaleClient;
use crate::config::AppConfig;
use crate::model::{ControllerEvent, RunState, RunStatus};
use crate::orchestrator::{self, RunController, UiCommand};
use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph, Tabs, Wrap},
    Terminal,
};
use state::{Field, UiState, TAB_GENERATE, TAB_HELP, TAB_HISTORY};
use std::sync::Arc;
use std::{io, time::Duration, time::Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::info;

pub async fn run(args: Cli, cfg: AppConfig) -> Result<()> {
    let (event_tx, event_rx) = mpsc::unbounded_channel::<ControllerEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();

    let client = Arc::new(FlowscaleClient::new(&cfg).context("create Flowscale client")?);
    let controller = RunController::new(client, cfg.workflow.clone()).with_events(event_tx);

    let mut ui_state = UiState::new(cfg.workflow.workflow_id.clone());
    if let Some(path) = args.image.as_ref() {
        ui_state.image_path = path.display().to_string();
    }
    ui_state.prompt = args.prompt.clone();
    ui_state.refresh_preview();

    info!(workflow = %cfg.workflow.workflow_id, "starting TUI");

    // TUI runs in a dedicated thread to keep all blocking I/O out of the Tokio runtime.
    let ui_handle = std::thread::spawn(move || run_threaded(ui_state, event_rx, cmd_tx));

    let res = orchestrator::run_controller(controller, cmd_rx).await;

    let join_res = tokio::task::spawn_blocking(move || ui_handle.join()).await;
    if let Ok(joined) = join_res {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(anyhow::anyhow!("TUI thread panicked")),
        }
    }

    res
}

/// Run the TUI loop on a dedicated thread.
pub fn run_threaded(
    mut state: UiState,
    mut event_rx: UnboundedReceiver<ControllerEvent>,
    cmd_tx: UnboundedSender<UiCommand>,
) -> Result<()> {
    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).ok();

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;
    terminal.clear().ok();

    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();
    let mut history_rows = 20usize;

    let res = loop {
        // Drain events without blocking to keep UI responsive.
        while let Ok(ev) = event_rx.try_recv() {
            state.apply_event(ev);
        }

        if last_tick.elapsed() >= tick_rate {
            terminal
                .draw(|f| {
                    let area = f.area();
                    history_rows = (area.height as usize).saturating_sub(8).max(1);
                    draw(area, f, &state)
                })
                .ok();
            last_tick = Instant::now();
        }

        // Poll input with a short timeout to avoid blocking the render loop.
        if !event::poll(Duration::from_millis(10)).unwrap_or(false) {
            continue;
        }
        let Ok(Event::Key(k)) = event::read() else {
            continue;
        };
        if k.kind != KeyEventKind::Press {
            continue;
        }
        if k.modifiers == KeyModifiers::CONTROL && k.code == KeyCode::Char('c') {
            let _ = cmd_tx.send(UiCommand::Quit);
            break Ok(());
        }
        if state.edit_key(k.code) {
            continue;
        }

        match k.code {
            KeyCode::Char('q') => {
                let _ = cmd_tx.send(UiCommand::Quit);
                break Ok(());
            }
            KeyCode::Tab => state.next_tab(),
            KeyCode::Char('?') => state.tab = TAB_HELP,
            KeyCode::Char('i') if state.tab == TAB_GENERATE => state.begin_edit(Field::ImagePath),
            KeyCode::Char('p') if state.tab == TAB_GENERATE => state.begin_edit(Field::Prompt),
            KeyCode::Enter | KeyCode::Char('g') if state.tab == TAB_GENERATE => {
                match state.prepare_submission() {
                    Ok(input) => {
                        let _ = cmd_tx.send(UiCommand::Submit(input));
                    }
                    Err(msg) => state.info = msg,
                }
            }
            KeyCode::Char('c') => {
                if state.is_generating() {
                    state.info = "Cancelling…".into();
                    let _ = cmd_tx.send(UiCommand::Cancel);
                }
            }
            KeyCode::Char('e') => export::export_last_record(&mut state),
            KeyCode::Char('r') => {
                state.info = "Refreshing history…".into();
                let _ = cmd_tx.send(UiCommand::RefreshHistory);
            }
            KeyCode::Char('y') => match export::copy_target(&state) {
                Some(text) => match export::copy_to_clipboard(&text) {
                    Ok(_) => state.info = format!("✓ Copied to clipboard: {}", ellipsize(&text, 60)),
                    Err(e) => state.info = format!("Clipboard copy failed: {e:#}"),
                },
                None => state.info = "Nothing to copy yet.".into(),
            },
            KeyCode::Up | KeyCode::Char('k') if state.tab == TAB_HISTORY => state.select_prev(),
            KeyCode::Down | KeyCode::Char('j') if state.tab == TAB_HISTORY => {
                state.select_next(history_rows)
            }
            _ => {}
        }
    };

    disable_raw_mode().ok();
    let mut stdout = io::stdout();
    execute!(stdout, LeaveAlternateScreen).ok();
    res
}

fn ellipsize(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let head: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{head}...")
}

fn draw(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0)].as_ref())
        .split(area);

    let tabs = Tabs::new(vec![
        Line::from("Generate"),
        Line::from("History"),
        Line::from("Help"),
    ])
    .select(state.tab)
    .block(Block::default().borders(Borders::ALL).title("flowscale-cli"))
    .highlight_style(Style::default().fg(Color::Yellow));
    f.render_widget(tabs, chunks[0]);

    match state.tab {
        TAB_GENERATE => draw_generate(chunks[1], f, state),
        TAB_HISTORY => draw_history(chunks[1], f, state),
        _ => help::draw_help(chunks[1], f),
    }
}

fn state_color(s: RunState) -> Color {
    match s {
        RunState::Idle => Color::Gray,
        RunState::AwaitingResult => Color::Yellow,
        RunState::Succeeded => Color::Green,
        RunState::Failed => Color::Red,
        RunState::Cancelled => Color::Magenta,
    }
}

fn input_line<'a>(label: &'a str, key: &'a str, value: &'a str, editing: bool) -> Line<'a> {
    let value_style = if editing {
        Style::default().fg(Color::Yellow)
    } else {
        Style::default()
    };
    let shown = if value.is_empty() && !editing {
        Span::styled("<none>", Style::default().fg(Color::DarkGray))
    } else {
        Span::styled(value, value_style)
    };
    let mut spans = vec![
        Span::styled(format!("[{key}] "), Style::default().fg(Color::Magenta)),
        Span::styled(format!("{label}: "), Style::default().fg(Color::Gray)),
        shown,
    ];
    if editing {
        spans.push(Span::styled("▏", Style::default().fg(Color::Yellow)));
    }
    Line::from(spans)
}

fn draw_generate(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(5),
            Constraint::Length(3),
            Constraint::Min(0),
        ])
        .split(area);

    let editing_image = state.editing == Some(Field::ImagePath);
    let editing_prompt = state.editing == Some(Field::Prompt);
    let image = if editing_image {
        state.edit_buffer.as_str()
    } else {
        state.image_path.as_str()
    };
    let prompt = if editing_prompt {
        state.edit_buffer.as_str()
    } else {
        state.prompt.as_str()
    };
    let preview = match &state.preview {
        None => Span::styled("no image selected", Style::default().fg(Color::DarkGray)),
        Some(Ok(desc)) => Span::styled(desc.as_str(), Style::default().fg(Color::Green)),
        Some(Err(msg)) => Span::styled(msg.as_str(), Style::default().fg(Color::Red)),
    };
    let inputs = Paragraph::new(vec![
        input_line("Image", "i", image, editing_image),
        Line::from(vec![
            Span::raw("    "),
            Span::styled("Preview: ", Style::default().fg(Color::Gray)),
            preview,
        ]),
        input_line("Prompt", "p", prompt, editing_prompt),
    ])
    .block(Block::default().borders(Borders::ALL).title("Input"));
    f.render_widget(inputs, rows[0]);

    let snap = &state.snapshot;
    let gauge = Gauge::default()
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(format!("Progress: {}", snap.state.label())),
        )
        .gauge_style(Style::default().fg(state_color(snap.state)))
        .percent(u16::from(snap.progress.min(100)))
        .label(format!("{}%", snap.progress));
    f.render_widget(gauge, rows[1]);

    let mut lines = vec![Line::from(vec![
        Span::styled("Workflow: ", Style::default().fg(Color::Gray)),
        Span::raw(state.workflow_id.as_str()),
    ])];
    if let Some(run_id) = snap.active_run_id.as_deref().or(snap.last_run_id.as_deref()) {
        lines.push(Line::from(vec![
            Span::styled("Run: ", Style::default().fg(Color::Gray)),
            Span::raw(run_id),
        ]));
    }
    if let Some(url) = snap.output_url.as_deref() {
        lines.push(Line::from(vec![
            Span::styled("Output: ", Style::default().fg(Color::Gray)),
            Span::styled(url, Style::default().fg(Color::Cyan)),
        ]));
    }
    if let Some(msg) = snap.message.as_deref() {
        lines.push(Line::from(vec![
            Span::styled("Result: ", Style::default().fg(Color::Gray)),
            Span::styled(msg, Style::default().fg(state_color(snap.state))),
        ]));
    }
    if !state.info.is_empty() {
        lines.push(Line::from(""));
        lines.push(Line::from(vec![
            Span::styled("Info: ", Style::default().fg(Color::Gray)),
            Span::raw(state.info.as_str()),
        ]));
    }
    lines.push(Line::from(""));
    let hint = if state.editing.is_some() {
        "Enter: accept, Esc: discard"
    } else if state.is_generating() {
        "c: cancel, tab: switch tabs, q: quit"
    } else {
        "i: image, p: prompt, Enter/g: generate, e: export, y: copy URL, q: quit"
    };
    lines.push(Line::from(Span::styled(
        hint,
        Style::default().fg(Color::DarkGray),
    )));

    let status = Paragraph::new(lines)
        .wrap(Wrap { trim: false })
        .block(Block::default().borders(Borders::ALL).title("Status"));
    f.render_widget(status, rows[2]);
}

fn status_color(s: RunStatus) -> Color {
    match s {
        RunStatus::Pending => Color::Yellow,
        RunStatus::Succeeded => Color::Green,
        RunStatus::Failed => Color::Red,
        RunStatus::Cancelled => Color::Magenta,
    }
}

fn draw_history(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let runs = &state.snapshot.history.runs;
    // Borders plus the header and info lines.
    let max_items = (area.height as usize).saturating_sub(5).max(1);

    let current_pos = if runs.is_empty() {
        0
    } else {
        state.history_selected + 1
    };
    let mut lines: Vec<Line> = vec![Line::from(vec![
        Span::raw(format!("History ({}/{}) - ", current_pos, runs.len())),
        Span::styled("↑/↓/j/k", Style::default().fg(Color::Magenta)),
        Span::raw(": navigate, "),
        Span::styled("r", Style::default().fg(Color::Magenta)),
        Span::raw(": refresh, "),
        Span::styled("y", Style::default().fg(Color::Magenta)),
        Span::raw(": copy URL"),
    ])];
    lines.push(Line::from(vec![
        Span::styled("Info: ", Style::default().fg(Color::Gray)),
        Span::raw(state.info.as_str()),
    ]));
    lines.push(Line::from(""));

    if runs.is_empty() {
        lines.push(Line::from(Span::styled(
            "No runs yet. Press r to refresh.",
            Style::default().fg(Color::DarkGray),
        )));
    }

    let offset = if state.history_selected >= state.history_scroll_offset + max_items {
        state.history_selected + 1 - max_items
    } else {
        state.history_scroll_offset.min(state.history_selected)
    };

    for (idx, run) in runs.iter().enumerate().skip(offset).take(max_items) {
        let selected = idx == state.history_selected;
        let marker = if selected { "▶ " } else { "  " };
        let base = if selected {
            Style::default().add_modifier(Modifier::BOLD)
        } else {
            Style::default()
        };
        lines.push(Line::from(vec![
            Span::styled(marker, Style::default().fg(Color::Yellow)),
            Span::styled(format!("{:<26} ", run.id), base),
            Span::styled(
                format!("{:<10} ", run.status.label()),
                base.fg(status_color(run.status)),
            ),
            Span::styled(
                run.first_output_url().unwrap_or("-").to_string(),
                Style::default().fg(Color::Cyan),
            ),
        ]));
    }

    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(
        if state.snapshot.history.group_id.is_empty() {
            "Runs".to_string()
        } else {
            format!("Runs in group {}", state.snapshot.history.group_id)
        },
    ));
    f.render_widget(p, area);
}
