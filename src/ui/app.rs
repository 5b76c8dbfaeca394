//! The tabbed terminal UI.
//!
//! One tab per applicable plugin. The app task owns rendering and input;
//! it never reads a PTY directly - everything arrives through the bounded
//! event queue, drained in batches, which caps the refresh rate
//! independently of producer speed. Keystrokes go through the input
//! router: bindings act on the app, everything else is forwarded to the
//! focused tab's PTY stdin.

use super::input::{InputRouter, Routed};
use super::keys::{KeyBindings, UiAction};
use super::logsave;
use super::status;
use super::tab::{Tab, VisualStatus};
use crate::controller::{ControllerCommand, ControllerState};
use crate::events::EventQueue;
use crate::executor::SessionSurface;
use crate::metrics::MetricsStore;
use anyhow::{Context, Result};
use crossterm::event::{
    DisableMouseCapture, EnableMouseCapture, Event, EventStream, KeyEvent, KeyEventKind,
    MouseButton, MouseEvent, MouseEventKind,
};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use futures::StreamExt;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Clear, Gauge, Paragraph, Tabs};
use ratatui::Terminal;
use std::collections::HashMap;
use std::io::Stdout;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Batch size per drain; with the 50 ms drain window this bounds the
/// render cadence near the target 30 Hz.
const DRAIN_BATCH: usize = 256;
const DRAIN_WAIT: Duration = Duration::from_millis(50);

/// How long transient status messages stay visible.
const MESSAGE_TTL: Duration = Duration::from_secs(4);

/// Rows reserved around the terminal area: tab bar, status bar, progress.
const CHROME_ROWS: u16 = 3;

pub struct App {
    tabs: Vec<Tab>,
    by_name: HashMap<String, usize>,
    focused: usize,
    queue: Arc<EventQueue>,
    metrics: Arc<MetricsStore>,
    controller_state: watch::Receiver<ControllerState>,
    commands: mpsc::Sender<ControllerCommand>,
    cancel: CancellationToken,
    router: InputRouter,
    show_help: bool,
    log_dir: PathBuf,
    status_message: Option<(String, Instant)>,
    /// Horizontal click zones of the tab headers, from the last render.
    tab_zones: Vec<(u16, u16)>,
}

impl App {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        plugin_names: &[String],
        queue: Arc<EventQueue>,
        metrics: Arc<MetricsStore>,
        controller_state: watch::Receiver<ControllerState>,
        commands: mpsc::Sender<ControllerCommand>,
        cancel: CancellationToken,
        bindings: KeyBindings,
        log_dir: PathBuf,
        max_scrollback: usize,
    ) -> Self {
        let tabs: Vec<Tab> = plugin_names
            .iter()
            .map(|name| Tab::new(name, 80, 24, max_scrollback))
            .collect();
        let by_name = plugin_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self {
            tabs,
            by_name,
            focused: 0,
            queue,
            metrics,
            controller_state,
            commands,
            cancel,
            router: InputRouter::new(bindings),
            show_help: false,
            log_dir,
            status_message: None,
            tab_zones: Vec::new(),
        }
    }

    /// Surfaces for the scheduler, one per tab.
    pub fn surfaces(&self) -> HashMap<String, SessionSurface> {
        self.tabs
            .iter()
            .map(|tab| (tab.plugin.clone(), tab.surface()))
            .collect()
    }

    /// Take over the terminal and run until quit or run completion.
    pub async fn run(mut self) -> Result<()> {
        enable_raw_mode().context("Failed to enable raw mode")?;
        let mut stdout = std::io::stdout();
        execute!(stdout, EnterAlternateScreen, EnableMouseCapture)
            .context("Failed to enter alternate screen")?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend).context("Failed to build terminal")?;

        let result = self.event_loop(&mut terminal).await;

        disable_raw_mode().ok();
        execute!(
            terminal.backend_mut(),
            LeaveAlternateScreen,
            DisableMouseCapture
        )
        .ok();
        terminal.show_cursor().ok();
        result
    }

    async fn event_loop(&mut self, terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
        let size = terminal.size()?;
        self.resize_tabs(size.width, size.height);

        let mut input = EventStream::new();
        loop {
            enum Step {
                Batch(Vec<crate::events::StreamEvent>),
                Term(Event),
                InputClosed,
                Cancelled,
                StateChanged,
            }

            let step = tokio::select! {
                batch = self.queue.drain_batched(DRAIN_BATCH, DRAIN_WAIT) => Step::Batch(batch),
                event = input.next() => match event {
                    Some(Ok(event)) => Step::Term(event),
                    Some(Err(_)) | None => Step::InputClosed,
                },
                _ = self.cancel.cancelled() => Step::Cancelled,
                changed = self.controller_state.changed() => {
                    if changed.is_ok() { Step::StateChanged } else { Step::Cancelled }
                }
            };

            let mut drained_empty = false;
            match step {
                Step::Batch(batch) => {
                    drained_empty = batch.is_empty();
                    for event in &batch {
                        if let Some(&index) = self.by_name.get(&event.plugin) {
                            self.tabs[index].apply_event(event);
                        }
                    }
                }
                Step::Term(event) => self.handle_terminal_event(event, terminal)?,
                Step::InputClosed | Step::Cancelled => {
                    self.cancel.cancel();
                    break;
                }
                Step::StateChanged => {}
            }

            self.refresh_cpu();
            self.expire_status_message();
            self.draw(terminal)?;

            let controller_done = matches!(
                *self.controller_state.borrow(),
                ControllerState::Completed | ControllerState::Failed
            );
            if controller_done && drained_empty {
                break;
            }
        }
        Ok(())
    }

    fn handle_terminal_event(
        &mut self,
        event: Event,
        terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    ) -> Result<()> {
        match event {
            Event::Key(key) if key.kind != KeyEventKind::Release => self.handle_key(key),
            Event::Mouse(mouse) => self.handle_mouse(mouse),
            Event::Resize(width, height) => {
                self.resize_tabs(width, height);
                terminal.autoresize().ok();
            }
            _ => {}
        }
        Ok(())
    }

    fn handle_key(&mut self, key: KeyEvent) {
        match self.router.route(&key) {
            Routed::Action(action) => self.apply_action(action),
            Routed::Input(bytes) => {
                // Only the focused tab ever receives keystrokes.
                if let Some(tab) = self.tabs.get(self.focused) {
                    if !tab.writer.write(&bytes) {
                        tracing::debug!(plugin = %tab.plugin, "keystrokes dropped, no live session");
                    }
                }
            }
            Routed::Ignored => {}
        }
    }

    fn apply_action(&mut self, action: UiAction) {
        match action {
            UiAction::NextTab => {
                if !self.tabs.is_empty() {
                    self.focused = (self.focused + 1) % self.tabs.len();
                }
            }
            UiAction::PrevTab => {
                if !self.tabs.is_empty() {
                    self.focused = (self.focused + self.tabs.len() - 1) % self.tabs.len();
                }
            }
            UiAction::Tab(k) => {
                let index = k as usize - 1;
                if index < self.tabs.len() {
                    self.focused = index;
                }
            }
            UiAction::ScrollUp => self.with_focused(|tab| tab.scroll_up(3)),
            UiAction::ScrollDown => self.with_focused(|tab| tab.scroll_down(3)),
            UiAction::ScrollTop => self.with_focused(Tab::scroll_top),
            UiAction::ScrollBottom => self.with_focused(Tab::scroll_bottom),
            UiAction::PauseToggle => {
                if self.controller_state.borrow().is_paused() {
                    let _ = self.commands.try_send(ControllerCommand::Resume);
                    self.set_message("resuming");
                } else {
                    self.set_message("nothing to resume (pause gates apply between phases)");
                }
            }
            UiAction::Retry => {
                let Some(tab) = self.tabs.get(self.focused) else {
                    return;
                };
                if tab.visual_status() == VisualStatus::Error {
                    let _ = self
                        .commands
                        .try_send(ControllerCommand::Retry(tab.plugin.clone()));
                    self.set_message(&format!("retrying {}", tab.plugin));
                } else {
                    self.set_message("retry is only available on a failed tab");
                }
            }
            UiAction::SaveLogs => self.save_focused_logs(),
            UiAction::Help => self.show_help = !self.show_help,
            UiAction::Quit => self.cancel.cancel(),
        }
    }

    fn handle_mouse(&mut self, mouse: MouseEvent) {
        match mouse.kind {
            MouseEventKind::Down(MouseButton::Left) if mouse.row == 0 => {
                for (index, (start, end)) in self.tab_zones.iter().enumerate() {
                    if mouse.column >= *start && mouse.column < *end {
                        self.focused = index;
                        break;
                    }
                }
            }
            MouseEventKind::ScrollUp => self.with_focused(|tab| tab.scroll_up(3)),
            MouseEventKind::ScrollDown => self.with_focused(|tab| tab.scroll_down(3)),
            _ => {}
        }
    }

    fn with_focused(&mut self, f: impl FnOnce(&mut Tab)) {
        if let Some(tab) = self.tabs.get_mut(self.focused) {
            f(tab);
        }
    }

    fn save_focused_logs(&mut self) {
        let Some(tab) = self.tabs.get(self.focused) else {
            return;
        };
        let metrics = self.metrics.snapshot(&tab.plugin);
        let label = self.controller_state.borrow().display_label().to_string();
        match logsave::save_tab_log(tab, metrics.as_ref(), &label, &self.log_dir) {
            Ok(path) => self.set_message(&format!("logs saved to {}", path.display())),
            Err(err) => self.set_message(&format!("log save failed: {err}")),
        }
    }

    fn resize_tabs(&mut self, width: u16, height: u16) {
        let rows = height.saturating_sub(CHROME_ROWS).max(1) as usize;
        let cols = width.max(1) as usize;
        for tab in &mut self.tabs {
            tab.resize(cols, rows);
        }
    }

    fn refresh_cpu(&mut self) {
        for tab in &mut self.tabs {
            if tab.visual_status() == VisualStatus::Running {
                if let Some(record) = self
                    .metrics
                    .snapshot(&tab.plugin)
                    .and_then(|m| tab.current_phase.and_then(|p| m.record_for(p).cloned()))
                {
                    tab.cpu.update(record.cpu_total_secs());
                }
            }
        }
    }

    fn set_message(&mut self, message: &str) {
        self.status_message = Some((message.to_string(), Instant::now()));
    }

    fn expire_status_message(&mut self) {
        if let Some((_, at)) = &self.status_message {
            if at.elapsed() > MESSAGE_TTL {
                self.status_message = None;
            }
        }
    }

    fn draw(&mut self, terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
        // Precompute click zones: the Tabs widget separates titles with "│".
        let mut zones = Vec::new();
        let mut x = 1u16;
        for (index, tab) in self.tabs.iter().enumerate() {
            let width = status::tab_title(tab, index).width() as u16 + 1;
            zones.push((x, x + width));
            x += width + 2;
        }
        self.tab_zones = zones;

        let tabs = &self.tabs;
        let focused = self.focused;
        let metrics = self.metrics.snapshot_all();
        let state_label = self.controller_state.borrow().display_label().to_string();
        let status_message = self.status_message.clone();
        let show_help = self.show_help;
        let help_entries = self.router.bindings().entries().to_vec();

        terminal.draw(|frame| {
            let [tab_area, term_area, status_area, gauge_area] = Layout::vertical([
                Constraint::Length(1),
                Constraint::Min(1),
                Constraint::Length(1),
                Constraint::Length(1),
            ])
            .areas(frame.area());

            // Tab headers.
            let titles: Vec<Line> = tabs
                .iter()
                .enumerate()
                .map(|(i, tab)| status::tab_title(tab, i))
                .collect();
            let tabs_widget = Tabs::new(titles)
                .select(focused)
                .highlight_style(Style::default().add_modifier(Modifier::BOLD | Modifier::UNDERLINED));
            frame.render_widget(tabs_widget, tab_area);

            // Focused terminal.
            if let Some(tab) = tabs.get(focused) {
                let screen = tab.screen.lock().expect("screen poisoned");
                let lines: Vec<Line> = screen
                    .visible_lines(tab.scroll_offset)
                    .iter()
                    .map(|row| status::row_to_line(row))
                    .collect();
                drop(screen);
                frame.render_widget(Paragraph::new(lines), term_area);

                if tab.scroll_offset > 0 {
                    let marker = format!(" scrollback -{} ", tab.scroll_offset);
                    let width = marker.len() as u16;
                    if term_area.width > width {
                        let area = Rect {
                            x: term_area.right() - width,
                            y: term_area.y,
                            width,
                            height: 1,
                        };
                        frame.render_widget(
                            Paragraph::new(marker).style(
                                Style::default().bg(Color::DarkGray).fg(Color::White),
                            ),
                            area,
                        );
                    }
                }

                // Status bar for the focused tab.
                let line = match &status_message {
                    Some((message, _)) => Line::from(Span::styled(
                        format!(" {message}"),
                        Style::default().fg(Color::Cyan),
                    )),
                    None => status::status_bar_line(
                        tab,
                        metrics.get(&tab.plugin),
                        &state_label,
                    ),
                };
                frame.render_widget(
                    Paragraph::new(line).style(Style::default().bg(Color::Black)),
                    status_area,
                );
            }

            // Aggregate progress across plugins.
            let (ratio, label) = status::aggregate_progress(tabs);
            frame.render_widget(
                Gauge::default()
                    .ratio(ratio)
                    .label(format!("{state_label} - {label}"))
                    .gauge_style(Style::default().fg(Color::Cyan).bg(Color::DarkGray)),
                gauge_area,
            );

            // Help overlay.
            if show_help {
                let area = centered_rect(50, 70, frame.area());
                let mut lines = vec![Line::from(Span::styled(
                    "Key bindings",
                    Style::default().add_modifier(Modifier::BOLD),
                ))];
                for (combo, action) in &help_entries {
                    lines.push(Line::from(format!(
                        "{:<18} {}",
                        combo.display(),
                        action.config_name()
                    )));
                }
                lines.push(Line::from(""));
                lines.push(Line::from("all other keys go to the focused terminal"));
                frame.render_widget(Clear, area);
                frame.render_widget(
                    Paragraph::new(lines)
                        .block(Block::default().borders(Borders::ALL).title(" help ")),
                    area,
                );
            }
        })?;
        Ok(())
    }
}

fn centered_rect(percent_x: u16, percent_y: u16, area: Rect) -> Rect {
    let [_, vert, _] = Layout::vertical([
        Constraint::Percentage((100 - percent_y) / 2),
        Constraint::Percentage(percent_y),
        Constraint::Percentage((100 - percent_y) / 2),
    ])
    .areas(area);
    let [_, rect, _] = Layout::horizontal([
        Constraint::Percentage((100 - percent_x) / 2),
        Constraint::Percentage(percent_x),
        Constraint::Percentage((100 - percent_x) / 2),
    ])
    .areas(vert);
    rect
}
