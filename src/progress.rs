//! In-process progress aggregation and broadcast.
//!
//! One [`ProgressTracker`] is shared by every component: walkers add to the
//! totals, download workers add completions and failures, and the engine's
//! publisher task periodically snapshots the counters onto a broadcast
//! channel. Counters are lock-free atomics; the only locks guard the speed
//! window and the current-file label, both touched at human timescales.
//!
//! Subscribers receive [`ProgressEvent`]s through `tokio::sync::broadcast`,
//! which drops updates for receivers that fall behind, so a slow reporter
//! can never stall the pipeline.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

use crate::state::Session;

/// Broadcast channel capacity; slow subscribers past this lag drop updates.
const CHANNEL_CAPACITY: usize = 64;

/// Sampling window for speed calculation (30 seconds at 100ms cadence).
const SPEED_WINDOW: Duration = Duration::from_secs(30);

/// Cadence at which byte samples should be recorded.
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

/// EWMA smoothing factor; higher weights recent samples more.
const EWMA_ALPHA: f64 = 0.3;

/// Coarse engine state reported to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// No session running.
    Idle,
    /// Sync in progress.
    Running,
    /// Interrupted; resumable.
    Paused,
    /// Finished successfully.
    Completed,
    /// Aborted by a fatal condition.
    Error,
}

impl EngineState {
    /// Returns the wire string representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

/// One published progress snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    /// Engine state at snapshot time.
    pub state: EngineState,
    /// Files discovered so far.
    pub total_files: u64,
    /// Files completed.
    pub completed_files: u64,
    /// Files failed.
    pub failed_files: u64,
    /// Bytes discovered so far.
    pub total_bytes: u64,
    /// Bytes completed.
    pub completed_bytes: u64,
    /// Completion percentage (0-100); byte-based when totals are known.
    pub percent: f64,
    /// Smoothed transfer speed in bytes/sec.
    pub speed_bps: f64,
    /// Estimated seconds remaining; `None` until totals and speed are
    /// positive.
    pub eta_seconds: Option<u64>,
    /// Seconds since the tracker started.
    pub elapsed_seconds: u64,
    /// Relative path of the most recently started file.
    pub current_file: Option<String>,
    /// Non-fatal errors recorded so far.
    pub error_count: u64,
    /// Workers currently holding an item.
    pub active_workers: usize,
}

/// Events published to subscribers.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// Periodic counter snapshot.
    Snapshot(Snapshot),
    /// The engine changed state.
    StateChanged(EngineState),
}

/// Circular sample window for speed estimation.
#[derive(Debug)]
struct SpeedWindow {
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedWindow {
    fn new() -> Self {
        Self {
            samples: VecDeque::new(),
        }
    }

    fn record(&mut self, now: Instant, cumulative_bytes: u64) {
        self.samples.push_back((now, cumulative_bytes));
        while let Some(&(t, _)) = self.samples.front() {
            if now.duration_since(t) > SPEED_WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// EWMA of per-interval rates across the window, recent samples
    /// weighted higher. Returns 0.0 with fewer than two samples.
    fn speed_bps(&self) -> f64 {
        let mut ewma: Option<f64> = None;
        let mut prev: Option<(Instant, u64)> = None;

        for &(t, bytes) in &self.samples {
            if let Some((pt, pbytes)) = prev {
                let dt = t.duration_since(pt).as_secs_f64();
                if dt > 0.0 {
                    #[allow(clippy::cast_precision_loss)]
                    let rate = bytes.saturating_sub(pbytes) as f64 / dt;
                    ewma = Some(match ewma {
                        Some(current) => EWMA_ALPHA * rate + (1.0 - EWMA_ALPHA) * current,
                        None => rate,
                    });
                }
            }
            prev = Some((t, bytes));
        }

        ewma.unwrap_or(0.0)
    }
}

/// Shared progress state: atomic counters plus a broadcast publisher.
#[derive(Debug)]
pub struct ProgressTracker {
    total_files: AtomicU64,
    completed_files: AtomicU64,
    failed_files: AtomicU64,
    total_bytes: AtomicU64,
    completed_bytes: AtomicU64,
    in_flight_bytes: AtomicU64,
    error_count: AtomicU64,
    active_workers: AtomicUsize,
    current_file: Mutex<Option<String>>,
    state: Mutex<EngineState>,
    speed: Mutex<SpeedWindow>,
    started_at: Instant,
    sender: broadcast::Sender<ProgressEvent>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    /// Creates an idle tracker with zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            total_files: AtomicU64::new(0),
            completed_files: AtomicU64::new(0),
            failed_files: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            completed_bytes: AtomicU64::new(0),
            in_flight_bytes: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            active_workers: AtomicUsize::new(0),
            current_file: Mutex::new(None),
            state: Mutex::new(EngineState::Idle),
            speed: Mutex::new(SpeedWindow::new()),
            started_at: Instant::now(),
            sender,
        }
    }

    /// Seeds counters from a persisted session, for resume.
    #[allow(clippy::cast_sign_loss)]
    pub fn seed_from_session(&self, session: &Session) {
        self.total_files
            .store(session.total_files.max(0) as u64, Ordering::SeqCst);
        self.completed_files
            .store(session.completed_files.max(0) as u64, Ordering::SeqCst);
        self.failed_files
            .store(session.failed_files.max(0) as u64, Ordering::SeqCst);
        self.total_bytes
            .store(session.total_bytes.max(0) as u64, Ordering::SeqCst);
        self.completed_bytes
            .store(session.completed_bytes.max(0) as u64, Ordering::SeqCst);
        self.error_count
            .store(session.error_count.max(0) as u64, Ordering::SeqCst);
    }

    /// Subscribes to progress events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    /// Adds walk-discovered files and bytes to the totals.
    pub fn add_discovered(&self, files: u64, bytes: u64) {
        self.total_files.fetch_add(files, Ordering::SeqCst);
        self.total_bytes.fetch_add(bytes, Ordering::SeqCst);
    }

    /// Records one completed file of the given size.
    ///
    /// `size_was_unknown` contributes the bytes to the total as well, for
    /// files whose size only became known after export.
    pub fn add_completed(&self, bytes: u64, size_was_unknown: bool) {
        self.completed_files.fetch_add(1, Ordering::SeqCst);
        self.completed_bytes.fetch_add(bytes, Ordering::SeqCst);
        if size_was_unknown {
            self.total_bytes.fetch_add(bytes, Ordering::SeqCst);
        }
    }

    /// Records one failed file.
    pub fn add_failed(&self) {
        self.failed_files.fetch_add(1, Ordering::SeqCst);
        self.error_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Adds in-flight bytes for speed sampling.
    ///
    /// Chunk progress cannot fold straight into `completed_bytes` (that sum
    /// is the completed-items invariant), so mid-item bytes accumulate here
    /// and are cleared when the item settles.
    pub fn add_transferred(&self, bytes: u64) {
        self.in_flight_bytes.fetch_add(bytes, Ordering::SeqCst);
    }

    /// Clears in-flight bytes for an item that finished or failed.
    pub fn clear_transferred(&self, bytes: u64) {
        let _ = self
            .in_flight_bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_sub(bytes))
            });
    }

    /// Sets the most recently started file label.
    pub fn set_current_file(&self, rel_path: &str) {
        if let Ok(mut current) = self.current_file.lock() {
            *current = Some(rel_path.to_string());
        }
    }

    /// Marks a worker as holding an item.
    pub fn worker_started(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    /// Marks a worker as idle again.
    pub fn worker_finished(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Transitions the engine state and broadcasts the change.
    pub fn set_state(&self, state: EngineState) {
        if let Ok(mut current) = self.state.lock() {
            if *current == state {
                return;
            }
            *current = state;
        }
        debug!(state = state.as_str(), "engine state changed");
        let _ = self.sender.send(ProgressEvent::StateChanged(state));
    }

    /// Records one speed sample; call at [`SAMPLE_INTERVAL`] cadence.
    pub fn record_sample(&self) {
        let cumulative = self.completed_bytes.load(Ordering::SeqCst)
            + self.in_flight_bytes.load(Ordering::SeqCst);
        if let Ok(mut window) = self.speed.lock() {
            window.record(Instant::now(), cumulative);
        }
    }

    /// Builds a snapshot of the current counters.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn snapshot(&self) -> Snapshot {
        let state = self.state.lock().map_or(EngineState::Idle, |s| *s);
        let total_files = self.total_files.load(Ordering::SeqCst);
        let completed_files = self.completed_files.load(Ordering::SeqCst);
        let failed_files = self.failed_files.load(Ordering::SeqCst);
        let total_bytes = self.total_bytes.load(Ordering::SeqCst);
        let completed_bytes = self.completed_bytes.load(Ordering::SeqCst);
        let speed_bps = self.speed.lock().map_or(0.0, |w| w.speed_bps());

        let percent = if total_bytes > 0 {
            (completed_bytes as f64 / total_bytes as f64) * 100.0
        } else if total_files > 0 {
            (completed_files as f64 / total_files as f64) * 100.0
        } else {
            0.0
        };

        let eta_seconds = if total_bytes > completed_bytes && speed_bps > 0.0 {
            Some(((total_bytes - completed_bytes) as f64 / speed_bps) as u64)
        } else {
            None
        };

        Snapshot {
            state,
            total_files,
            completed_files,
            failed_files,
            total_bytes,
            completed_bytes,
            percent,
            speed_bps,
            eta_seconds,
            elapsed_seconds: self.started_at.elapsed().as_secs(),
            current_file: self.current_file.lock().ok().and_then(|c| c.clone()),
            error_count: self.error_count.load(Ordering::SeqCst),
            active_workers: self.active_workers.load(Ordering::SeqCst),
        }
    }

    /// Publishes a snapshot to subscribers; lagging subscribers drop it.
    pub fn publish_snapshot(&self) {
        let _ = self.sender.send(ProgressEvent::Snapshot(self.snapshot()));
    }
}
