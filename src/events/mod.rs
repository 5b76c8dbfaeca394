//! Typed stream events and the bounded, backpressured event queue.
//!
//! Every plugin subprocess produces a stream of typed events that feed the
//! metrics store and the UI. The queue decouples producer rate from UI
//! refresh rate: producers enqueue without blocking (beyond a small bound),
//! the UI drains in batches at up to 30 Hz.
//!
//! Overflow policy:
//! - Output events are dropped oldest-first.
//! - A Progress event overwrites the queued Progress event for the same
//!   (plugin, phase) when one is still pending.
//! - PhaseStart / PhaseEnd / Completion are never dropped: they wait
//!   briefly for space and, as a last resort, expand the queue by one slot.

use crate::plugin::Phase;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

/// Default queue capacity.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Bound on how long a mandatory-event publish may wait for space.
const MANDATORY_WAIT: Duration = Duration::from_millis(10);

/// Which output stream a line arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A structured progress update, decoded from the plugin protocol or
/// synthesized by the executor.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProgressUpdate {
    pub percent: Option<f64>,
    pub message: Option<String>,
    pub bytes_done: Option<u64>,
    pub bytes_total: Option<u64>,
    pub items_done: Option<u64>,
    pub items_total: Option<u64>,
}

/// Event payload variants.
#[derive(Debug, Clone)]
pub enum EventKind {
    /// One opaque output line from the plugin's terminal.
    Output {
        stream: OutputStream,
        line: Vec<u8>,
    },
    /// Progress within a phase.
    Progress { phase: Phase, update: ProgressUpdate },
    PhaseStart {
        phase: Phase,
    },
    PhaseEnd {
        phase: Phase,
        success: bool,
        error: Option<String>,
    },
    /// Published once per plugin, after its last PhaseEnd.
    Completion {
        success: bool,
        packages_updated: u64,
        duration: Duration,
        error: Option<String>,
    },
}

impl EventKind {
    /// PhaseStart, PhaseEnd and Completion must never be dropped.
    pub fn is_mandatory(&self) -> bool {
        matches!(
            self,
            EventKind::PhaseStart { .. } | EventKind::PhaseEnd { .. } | EventKind::Completion { .. }
        )
    }
}

/// A tagged event with its origin and wall-clock timestamp.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub plugin: String,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

impl StreamEvent {
    pub fn now(plugin: &str, kind: EventKind) -> Self {
        Self {
            plugin: plugin.to_string(),
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Output line as lossy text, for logs and tests.
    pub fn output_text(&self) -> Option<String> {
        match &self.kind {
            EventKind::Output { line, .. } => Some(String::from_utf8_lossy(line).into_owned()),
            _ => None,
        }
    }
}

struct QueueState {
    buf: VecDeque<StreamEvent>,
    /// Extra slots granted to mandatory events that found the queue full.
    expanded: usize,
    dropped_outputs: u64,
}

/// Bounded multi-producer event queue with batched consumption.
pub struct EventQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    /// Woken when events are available to drain.
    readable: Notify,
    /// Woken when space frees up, for waiting mandatory publishes.
    writable: Notify,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                buf: VecDeque::with_capacity(capacity),
                expanded: 0,
                dropped_outputs: 0,
            }),
            capacity,
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    /// Publish an event.
    ///
    /// Droppable events (Output, Progress) never wait: they apply the
    /// overflow policy and return. Mandatory events wait up to 10 ms for
    /// space, then expand the queue by one slot and log a warning.
    pub async fn publish(&self, event: StreamEvent) {
        if event.kind.is_mandatory() {
            self.publish_mandatory(event).await;
        } else {
            self.publish_droppable(event);
        }
        self.readable.notify_one();
    }

    fn publish_droppable(&self, event: StreamEvent) {
        let mut state = self.state.lock().expect("event queue poisoned");

        // Progress coalescing: overwrite a pending Progress for the same
        // (plugin, phase).
        let progress_phase = match &event.kind {
            EventKind::Progress { phase, .. } => Some(*phase),
            _ => None,
        };
        if let Some(phase) = progress_phase {
            let pos = state.buf.iter().rposition(|e| {
                e.plugin == event.plugin
                    && matches!(&e.kind, EventKind::Progress { phase: p, .. } if *p == phase)
            });
            if let Some(pos) = pos {
                state.buf[pos] = event;
                return;
            }
        }

        if state.buf.len() >= self.capacity {
            // Drop the oldest Output first; if the queue somehow holds no
            // droppable Output, drop the incoming event instead.
            if let Some(pos) = state
                .buf
                .iter()
                .position(|e| matches!(e.kind, EventKind::Output { .. }))
            {
                state.buf.remove(pos);
                state.dropped_outputs += 1;
                if state.dropped_outputs.is_power_of_two() {
                    tracing::warn!(
                        dropped = state.dropped_outputs,
                        "event queue full, dropping oldest output lines"
                    );
                }
            } else {
                tracing::warn!(plugin = %event.plugin, "event queue full, dropping incoming event");
                return;
            }
        }
        state.buf.push_back(event);
    }

    async fn publish_mandatory(&self, event: StreamEvent) {
        let deadline = tokio::time::Instant::now() + MANDATORY_WAIT;
        loop {
            {
                let mut state = self.state.lock().expect("event queue poisoned");
                if state.buf.len() < self.capacity + state.expanded {
                    state.buf.push_back(event);
                    return;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::select! {
                _ = self.writable.notified() => {}
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }
        // Last resort: grow by one slot so the lifecycle invariant holds.
        let mut state = self.state.lock().expect("event queue poisoned");
        state.expanded += 1;
        tracing::warn!(
            plugin = %event.plugin,
            expanded = state.expanded,
            "event queue full, expanding for mandatory event"
        );
        state.buf.push_back(event);
    }

    /// Drain up to `max` events, waiting at most `wait` for the first one.
    pub async fn drain_batched(&self, max: usize, wait: Duration) -> Vec<StreamEvent> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            {
                let mut state = self.state.lock().expect("event queue poisoned");
                if !state.buf.is_empty() {
                    let n = state.buf.len().min(max);
                    let drained: Vec<StreamEvent> = state.buf.drain(..n).collect();
                    // Reclaim emergency slots once the queue is back under
                    // its bound.
                    if state.buf.len() < self.capacity {
                        state.expanded = 0;
                    }
                    drop(state);
                    self.writable.notify_waiters();
                    return drained;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Vec::new();
            }
            tokio::select! {
                _ = self.readable.notified() => {}
                _ = tokio::time::sleep_until(deadline) => return Vec::new(),
            }
        }
    }

    /// Number of queued events (tests and diagnostics).
    pub fn len(&self) -> usize {
        self.state.lock().expect("event queue poisoned").buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total Output events discarded by the overflow policy.
    pub fn dropped_outputs(&self) -> u64 {
        self.state
            .lock()
            .expect("event queue poisoned")
            .dropped_outputs
    }
}
