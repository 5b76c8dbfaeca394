//! Per-plugin tab state.
//!
//! A tab owns the terminal screen, its scrollback, the stdin handle, and
//! the per-tab view state (scroll offset, pane state, latest progress).
//! Executors write into the screen through a `SessionSurface`; the screen
//! and everything the user sees survive PTY sessions.

use crate::events::{EventKind, ProgressUpdate, StreamEvent};
use crate::executor::SessionSurface;
use crate::plugin::Phase;
use crate::pty::PtyWriter;
use crate::term::TerminalScreen;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::watch;

/// Lifecycle of the pane's current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaneState {
    #[default]
    Idle,
    Running,
    Success,
    Failed,
    Exited,
}

/// What the tab header shows, derived from pane state plus schedulability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisualStatus {
    Completed,
    Running,
    Error,
    Pending,
    /// Admission announced but the phase has not started: the plugin is
    /// waiting on permits or mutexes.
    Locked,
}

/// Derives CPU% from successive cumulative CPU readings.
#[derive(Debug, Default)]
pub struct CpuTracker {
    last: Option<(Instant, f64)>,
    pub percent: f64,
}

impl CpuTracker {
    pub fn update(&mut self, cpu_secs: f64) {
        let now = Instant::now();
        if let Some((at, prev)) = self.last {
            let wall = now.duration_since(at).as_secs_f64();
            if wall > 0.2 {
                self.percent = ((cpu_secs - prev).max(0.0) / wall) * 100.0;
                self.last = Some((now, cpu_secs));
            }
        } else {
            self.last = Some((now, cpu_secs));
        }
    }

    pub fn reset(&mut self) {
        self.last = None;
        self.percent = 0.0;
    }
}

pub struct Tab {
    pub plugin: String,
    pub screen: Arc<Mutex<TerminalScreen>>,
    pub writer: PtyWriter,
    size_tx: watch::Sender<(u16, u16)>,
    size_rx: watch::Receiver<(u16, u16)>,
    /// Scrollback offset; 0 is the live viewport.
    pub scroll_offset: usize,
    pub pane_state: PaneState,
    pub current_phase: Option<Phase>,
    /// Set once admission is announced, cleared by PhaseStart.
    waiting_admission: bool,
    pub progress: ProgressUpdate,
    pub error: Option<String>,
    pub packages_updated: u64,
    pub phase_started_at: Option<Instant>,
    pub cpu: CpuTracker,
}

impl Tab {
    pub fn new(plugin: &str, cols: usize, rows: usize, max_scrollback: usize) -> Self {
        let (size_tx, size_rx) = watch::channel((cols as u16, rows as u16));
        Self {
            plugin: plugin.to_string(),
            screen: Arc::new(Mutex::new(TerminalScreen::with_scrollback(
                cols,
                rows,
                max_scrollback,
            ))),
            writer: PtyWriter::default(),
            size_tx,
            size_rx,
            scroll_offset: 0,
            pane_state: PaneState::Idle,
            current_phase: None,
            waiting_admission: false,
            progress: ProgressUpdate::default(),
            error: None,
            packages_updated: 0,
            phase_started_at: None,
            cpu: CpuTracker::default(),
        }
    }

    /// The surface executors write through.
    pub fn surface(&self) -> SessionSurface {
        SessionSurface {
            screen: self.screen.clone(),
            writer: self.writer.clone(),
            size_rx: self.size_rx.clone(),
        }
    }

    /// Resize the viewport and tell any live PTY.
    pub fn resize(&mut self, cols: usize, rows: usize) {
        self.screen
            .lock()
            .expect("screen poisoned")
            .resize(cols, rows);
        let _ = self.size_tx.send((cols as u16, rows as u16));
    }

    /// Apply one stream event to the view state. Output events do not
    /// carry screen content (the executor feeds the screen directly); they
    /// only matter here for auto-scroll behavior.
    pub fn apply_event(&mut self, event: &StreamEvent) {
        match &event.kind {
            EventKind::Output { .. } => {}
            EventKind::Progress { phase, update } => {
                if !matches!(self.pane_state, PaneState::Running) {
                    // Progress before PhaseStart is the admission notice.
                    self.waiting_admission = true;
                }
                self.current_phase = Some(*phase);
                if update.percent.is_some() {
                    self.progress.percent = update.percent;
                }
                if update.message.is_some() {
                    self.progress.message = update.message.clone();
                }
                if update.bytes_done.is_some() {
                    self.progress.bytes_done = update.bytes_done;
                }
                if update.bytes_total.is_some() {
                    self.progress.bytes_total = update.bytes_total;
                }
                if update.items_done.is_some() {
                    self.progress.items_done = update.items_done;
                }
                if update.items_total.is_some() {
                    self.progress.items_total = update.items_total;
                }
            }
            EventKind::PhaseStart { phase } => {
                self.pane_state = PaneState::Running;
                self.current_phase = Some(*phase);
                self.waiting_admission = false;
                self.phase_started_at = Some(Instant::now());
                self.progress = ProgressUpdate::default();
                self.cpu.reset();
            }
            EventKind::PhaseEnd { success, error, .. } => {
                self.pane_state = if *success {
                    PaneState::Exited
                } else {
                    PaneState::Failed
                };
                if let Some(error) = error {
                    self.error = Some(error.clone());
                }
                self.phase_started_at = None;
            }
            EventKind::Completion {
                success,
                packages_updated,
                error,
                ..
            } => {
                self.pane_state = if *success {
                    PaneState::Success
                } else {
                    PaneState::Failed
                };
                self.packages_updated = *packages_updated;
                if let Some(error) = error {
                    self.error = Some(error.clone());
                }
            }
        }
    }

    pub fn visual_status(&self) -> VisualStatus {
        match self.pane_state {
            PaneState::Success => VisualStatus::Completed,
            PaneState::Failed => VisualStatus::Error,
            PaneState::Running => VisualStatus::Running,
            PaneState::Idle | PaneState::Exited => {
                if self.waiting_admission {
                    VisualStatus::Locked
                } else {
                    VisualStatus::Pending
                }
            }
        }
    }

    /// ETA from percent progress and elapsed time; none below a floor.
    pub fn eta(&self) -> Option<std::time::Duration> {
        let percent = self.progress.percent?;
        let started = self.phase_started_at?;
        if percent < 1.0 {
            return None;
        }
        let elapsed = started.elapsed().as_secs_f64();
        let remaining = elapsed * (100.0 - percent) / percent;
        Some(std::time::Duration::from_secs_f64(remaining.max(0.0)))
    }

    pub fn scroll_up(&mut self, lines: usize) {
        let max = self.screen.lock().expect("screen poisoned").scrollback_len();
        self.scroll_offset = (self.scroll_offset + lines).min(max);
    }

    pub fn scroll_down(&mut self, lines: usize) {
        self.scroll_offset = self.scroll_offset.saturating_sub(lines);
    }

    pub fn scroll_top(&mut self) {
        self.scroll_offset = self.screen.lock().expect("screen poisoned").scrollback_len();
    }

    pub fn scroll_bottom(&mut self) {
        self.scroll_offset = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::OutputStream;

    fn event(plugin: &str, kind: EventKind) -> StreamEvent {
        StreamEvent::now(plugin, kind)
    }

    #[test]
    fn test_lifecycle_states() {
        let mut tab = Tab::new("apt", 80, 24, 100);
        assert_eq!(tab.visual_status(), VisualStatus::Pending);

        tab.apply_event(&event(
            "apt",
            EventKind::Progress {
                phase: Phase::Check,
                update: ProgressUpdate {
                    message: Some("waiting for admission".into()),
                    ..Default::default()
                },
            },
        ));
        assert_eq!(tab.visual_status(), VisualStatus::Locked);

        tab.apply_event(&event("apt", EventKind::PhaseStart { phase: Phase::Check }));
        assert_eq!(tab.visual_status(), VisualStatus::Running);
        assert_eq!(tab.current_phase, Some(Phase::Check));

        tab.apply_event(&event(
            "apt",
            EventKind::PhaseEnd {
                phase: Phase::Check,
                success: true,
                error: None,
            },
        ));
        assert_eq!(tab.visual_status(), VisualStatus::Pending);

        tab.apply_event(&event(
            "apt",
            EventKind::Completion {
                success: true,
                packages_updated: 4,
                duration: std::time::Duration::from_secs(3),
                error: None,
            },
        ));
        assert_eq!(tab.visual_status(), VisualStatus::Completed);
        assert_eq!(tab.packages_updated, 4);
    }

    #[test]
    fn test_failure_shows_error() {
        let mut tab = Tab::new("apt", 80, 24, 100);
        tab.apply_event(&event("apt", EventKind::PhaseStart { phase: Phase::Execute }));
        tab.apply_event(&event(
            "apt",
            EventKind::PhaseEnd {
                phase: Phase::Execute,
                success: false,
                error: Some("exit 100".into()),
            },
        ));
        assert_eq!(tab.visual_status(), VisualStatus::Error);
        assert_eq!(tab.error.as_deref(), Some("exit 100"));
    }

    #[test]
    fn test_progress_merges_fields() {
        let mut tab = Tab::new("apt", 80, 24, 100);
        tab.apply_event(&event("apt", EventKind::PhaseStart { phase: Phase::Download }));
        tab.apply_event(&event(
            "apt",
            EventKind::Progress {
                phase: Phase::Download,
                update: ProgressUpdate {
                    percent: Some(40.0),
                    bytes_done: Some(400),
                    bytes_total: Some(1000),
                    ..Default::default()
                },
            },
        ));
        tab.apply_event(&event(
            "apt",
            EventKind::Progress {
                phase: Phase::Download,
                update: ProgressUpdate {
                    message: Some("fetching".into()),
                    ..Default::default()
                },
            },
        ));
        // The message update did not erase the numeric fields.
        assert_eq!(tab.progress.percent, Some(40.0));
        assert_eq!(tab.progress.bytes_done, Some(400));
        assert_eq!(tab.progress.message.as_deref(), Some("fetching"));
    }

    #[test]
    fn test_scrollback_is_preserved_across_sessions() {
        let mut tab = Tab::new("apt", 40, 2, 100);
        // Phase one writes through the surface.
        let surface = tab.surface();
        surface
            .screen
            .lock()
            .unwrap()
            .feed(b"check output one\r\ncheck output two\r\ncheck output three\r\n");
        let before = tab.screen.lock().unwrap().scrollback_len();
        assert!(before > 0);

        // The next phase gets a new surface; history stays.
        tab.apply_event(&event("apt", EventKind::PhaseStart { phase: Phase::Execute }));
        let surface2 = tab.surface();
        surface2.screen.lock().unwrap().feed(b"execute output\r\n");
        assert!(tab.screen.lock().unwrap().scrollback_len() >= before);
    }

    #[test]
    fn test_scroll_offsets_clamp() {
        let mut tab = Tab::new("apt", 40, 2, 100);
        tab.screen.lock().unwrap().feed(b"1\n2\n3\n4\n5\n");
        let sb = tab.screen.lock().unwrap().scrollback_len();
        tab.scroll_up(999);
        assert_eq!(tab.scroll_offset, sb);
        tab.scroll_down(1);
        assert_eq!(tab.scroll_offset, sb - 1);
        tab.scroll_bottom();
        assert_eq!(tab.scroll_offset, 0);
        tab.scroll_top();
        assert_eq!(tab.scroll_offset, sb);
    }

    #[test]
    fn test_output_events_do_not_disturb_view_state() {
        let mut tab = Tab::new("apt", 80, 24, 100);
        tab.apply_event(&event("apt", EventKind::PhaseStart { phase: Phase::Check }));
        tab.apply_event(&event(
            "apt",
            EventKind::Output {
                stream: OutputStream::Stdout,
                line: b"some line".to_vec(),
            },
        ));
        assert_eq!(tab.visual_status(), VisualStatus::Running);
    }
}
