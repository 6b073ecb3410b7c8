use std::collections::VecDeque;
use std::io;
use std::sync::mpsc::TryRecvError;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossterm::ExecutableCommand;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use miette::IntoDiagnostic;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};

use crate::app::{CancelToken, ProgressEvent, ProgressSink};
use crate::error::ImageDownloaderError;

const EVENTS_MAX: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Dataverse,
    Prepare,
    Provenance,
    Attributes,
    Resolve,
    Download,
    Retry,
}

impl Phase {
    const ALL: [Phase; 7] = [
        Phase::Dataverse,
        Phase::Prepare,
        Phase::Provenance,
        Phase::Attributes,
        Phase::Resolve,
        Phase::Download,
        Phase::Retry,
    ];

    fn label(self) -> &'static str {
        match self {
            Phase::Dataverse => "Dataverse",
            Phase::Prepare => "Prepare",
            Phase::Provenance => "Provenance",
            Phase::Attributes => "Attributes",
            Phase::Resolve => "Resolve",
            Phase::Download => "Download",
            Phase::Retry => "Retry",
        }
    }
}

#[derive(Debug)]
struct AppState {
    status: String,
    phase: Phase,
    done: usize,
    total: usize,
    index_bytes: u64,
    retry_rounds: u32,
    events: VecDeque<String>,
    started: Instant,
}

pub struct Tui {
    state: Arc<Mutex<AppState>>,
}

struct TuiProgress {
    state: Arc<Mutex<AppState>>,
}

impl ProgressSink for TuiProgress {
    fn event(&self, event: ProgressEvent) {
        if let Ok(mut state) = self.state.lock() {
            let message = event.message.trim().to_string();
            if let Some((done, total)) = parse_download_progress(&message) {
                state.done = done;
                state.total = total;
                return;
            }
            if let Some(bytes) = parse_field(&message, "bytes=") {
                state.index_bytes = bytes;
                return;
            }
            if let Some((phase, payload)) = parse_phase(&message) {
                if phase == Phase::Retry {
                    state.retry_rounds = state.retry_rounds.saturating_add(1);
                }
                if phase != state.phase {
                    state.done = 0;
                    state.total = 0;
                }
                state.phase = phase;
                state.status = payload.to_string();
            } else {
                state.status = message.clone();
            }
            push_event(
                &mut state.events,
                format!("[{}] {message}", chrono::Local::now().format("%H:%M:%S")),
            );
        }
    }
}

impl Default for Tui {
    fn default() -> Self {
        Self::new()
    }
}

impl Tui {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(AppState {
                status: "starting".to_string(),
                phase: Phase::Prepare,
                done: 0,
                total: 0,
                index_bytes: 0,
                retry_rounds: 0,
                events: VecDeque::new(),
                started: Instant::now(),
            })),
        }
    }

    /// Runs `f` on a worker thread and redraws until it returns. `q` or
    /// `Esc` raises `cancel` and waits for the worker to wind down, so the
    /// run still writes its finish marker.
    pub fn run<F, R>(&mut self, cancel: CancelToken, f: F) -> miette::Result<R>
    where
        F: FnOnce(&dyn ProgressSink) -> Result<R, ImageDownloaderError> + Send + 'static,
        R: Send + 'static,
    {
        let mut stdout = io::stdout();
        enable_raw_mode().into_diagnostic()?;
        stdout.execute(EnterAlternateScreen).into_diagnostic()?;

        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend).into_diagnostic()?;
        terminal.clear().into_diagnostic()?;

        let (tx, rx) = std::sync::mpsc::channel();
        let sink = TuiProgress {
            state: self.state.clone(),
        };
        let handle = thread::spawn(move || tx.send(f(&sink)));

        let mut tick = 0usize;
        loop {
            if let Ok(state) = self.state.lock() {
                terminal
                    .draw(|frame| draw_ui(frame, &state, tick))
                    .into_diagnostic()?;
            }

            match rx.try_recv() {
                Ok(result) => {
                    restore_terminal()?;
                    handle.join().ok();
                    return result.map_err(miette::Report::new);
                }
                Err(TryRecvError::Disconnected) => {
                    restore_terminal()?;
                    handle.join().ok();
                    return Err(miette::Report::msg("run stopped without a result"));
                }
                Err(TryRecvError::Empty) => {}
            }

            if event::poll(Duration::from_millis(120)).into_diagnostic()? {
                if let Event::Key(key) = event::read().into_diagnostic()? {
                    let quit = key.kind == KeyEventKind::Press
                        && matches!(key.code, KeyCode::Char('q') | KeyCode::Esc);
                    if quit && !cancel.is_cancelled() {
                        cancel.cancel();
                        if let Ok(mut state) = self.state.lock() {
                            state.status = "cancelling, waiting for running downloads".to_string();
                        }
                    }
                }
            }
            tick = tick.wrapping_add(1);
        }
    }
}

fn restore_terminal() -> miette::Result<()> {
    disable_raw_mode().into_diagnostic()?;
    io::stdout()
        .execute(LeaveAlternateScreen)
        .into_diagnostic()?;
    Ok(())
}

fn draw_ui(frame: &mut ratatui::Frame, state: &AppState, tick: usize) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(2),
            Constraint::Length(6),
            Constraint::Min(4),
        ])
        .split(frame.area());

    let heartbeat = if tick % 2 == 0 { "*" } else { " " };
    let header = Paragraph::new(Line::from(vec![
        Span::styled(
            "KIRA-IMGDL",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw(" "),
        Span::styled(env!("CARGO_PKG_VERSION"), Style::default().fg(Color::Gray)),
        Span::raw(format!(
            "   elapsed {}s   q to quit   ",
            state.started.elapsed().as_secs()
        )),
        Span::styled(heartbeat, Style::default().fg(Color::Green)),
    ]))
    .block(Block::default().borders(Borders::BOTTOM));
    frame.render_widget(header, chunks[0]);

    let phases: Vec<Span> = Phase::ALL
        .iter()
        .flat_map(|phase| {
            let style = if *phase == state.phase {
                Style::default()
                    .fg(Color::Cyan)
                    .add_modifier(Modifier::BOLD)
            } else {
                Style::default().fg(Color::DarkGray)
            };
            [Span::styled(phase.label(), style), Span::raw("  ")]
        })
        .collect();
    let mut status = vec![
        Line::from(phases),
        Line::from(vec![
            Span::styled("Status: ", Style::default().fg(Color::Gray)),
            Span::raw(state.status.clone()),
        ]),
    ];
    if state.total > 0 {
        let percent = (state.done * 100 / state.total) as u8;
        status.push(Line::from(format!(
            "Images: {} {:>3}%  {}/{}",
            progress_bar(percent),
            percent,
            state.done,
            state.total
        )));
    }
    if state.index_bytes > 0 {
        status.push(Line::from(format!(
            "Index: {} MiB fetched",
            state.index_bytes / (1024 * 1024)
        )));
    }
    status.push(Line::from(format!("Retry rounds: {}", state.retry_rounds)));
    frame.render_widget(
        Paragraph::new(status).block(Block::default().borders(Borders::BOTTOM)),
        chunks[1],
    );

    let events: Vec<Line> = state
        .events
        .iter()
        .rev()
        .map(|event| Line::from(event.clone()))
        .collect();
    frame.render_widget(
        Paragraph::new(events)
            .block(Block::default().title("Recent events"))
            .wrap(Wrap { trim: true }),
        chunks[2],
    );
}

fn progress_bar(percent: u8) -> String {
    let total = 20;
    let filled = (percent as usize * total) / 100;
    let mut out = String::from("[");
    for i in 0..total {
        out.push(if i < filled { '#' } else { '.' });
    }
    out.push(']');
    out
}

fn parse_phase(message: &str) -> Option<(Phase, &str)> {
    let rest = message.strip_prefix("phase=")?;
    let (name, payload) = rest.split_once(';')?;
    Phase::ALL
        .into_iter()
        .find(|phase| phase.label() == name)
        .map(|phase| (phase, payload.trim()))
}

fn parse_download_progress(message: &str) -> Option<(usize, usize)> {
    if !message.starts_with("download.progress") {
        return None;
    }
    let done = parse_field(message, "done=")?;
    let total = parse_field(message, "total=")?;
    Some((done as usize, total as usize))
}

fn parse_field(message: &str, key: &str) -> Option<u64> {
    message
        .split_whitespace()
        .find_map(|token| token.strip_prefix(key))
        .and_then(|value| value.parse().ok())
}

fn push_event(buffer: &mut VecDeque<String>, item: String) {
    buffer.push_back(item);
    while buffer.len() > EVENTS_MAX {
        buffer.pop_front();
    }
}
