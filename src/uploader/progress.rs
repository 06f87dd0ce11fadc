//! Weighted per-file progress accounting and throttled emission.
//!
//! Atomics carry the hot path (bytes uploaded, completed chunk count);
//! a short sliding window tracks instantaneous speed. Progress is only
//! emitted when it actually moved, rather than on every chunk tick.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct SpeedCalculator {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
}

impl SpeedCalculator {
    pub fn new(window: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
        }
    }

    pub fn record(&mut self, total_bytes: u64) {
        let now = Instant::now();
        self.samples.push_back((now, total_bytes));
        while let Some((t, _)) = self.samples.front() {
            if now.duration_since(*t) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn bytes_per_sec(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let (t0, b0) = *self.samples.front().unwrap();
        let (t1, b1) = *self.samples.back().unwrap();
        let elapsed = t1.duration_since(t0).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        (b1.saturating_sub(b0)) as f64 / elapsed
    }
}

/// Progress snapshot handed to observers. `percent`/`loaded`/`total` are
/// the documented wire fields; the rest is detail plugins may ignore.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct ProgressUpdate {
    pub percent: f64,
    pub loaded: u64,
    pub total: u64,
    pub speed_bytes_per_sec: f64,
    pub total_chunks: usize,
    pub completed_chunks: usize,
}

pub struct ProgressTracker {
    total_size: u64,
    total_chunks: usize,
    uploaded_bytes: AtomicU64,
    completed_chunks: AtomicU64,
    speed: Mutex<SpeedCalculator>,
    last_reported_progress: AtomicU64,
}

/// progress is stored as a fixed-point integer (progress * 1e6) so it
/// can live in an `AtomicU64` without a lock.
const PROGRESS_SCALE: f64 = 1_000_000.0;

impl ProgressTracker {
    pub fn new(total_size: u64, total_chunks: usize) -> Self {
        Self {
            total_size,
            total_chunks,
            uploaded_bytes: AtomicU64::new(0),
            completed_chunks: AtomicU64::new(0),
            speed: Mutex::new(SpeedCalculator::new(Duration::from_secs(10))),
            last_reported_progress: AtomicU64::new(0),
        }
    }

    pub fn add_bytes(&self, n: u64) {
        let total = self.uploaded_bytes.fetch_add(n, Ordering::SeqCst) + n;
        self.speed.lock().expect("progress lock poisoned").record(total);
    }

    pub fn complete_chunk(&self) {
        self.completed_chunks.fetch_add(1, Ordering::SeqCst);
    }

    pub fn total_uploaded(&self) -> u64 {
        self.uploaded_bytes.load(Ordering::SeqCst)
    }

    fn progress_ratio(&self) -> f64 {
        if self.total_size == 0 {
            return 1.0;
        }
        (self.total_uploaded() as f64 / self.total_size as f64).min(1.0)
    }

    /// Returns `Some(update)` only if the rounded percent or the raw
    /// ratio moved by at least 0.01 since the last reported value (or
    /// this is a terminal snapshot), otherwise `None`.
    pub fn snapshot_if_changed(&self, terminal: bool) -> Option<ProgressUpdate> {
        let ratio = self.progress_ratio();
        let scaled = (ratio * PROGRESS_SCALE) as u64;
        let last = self.last_reported_progress.load(Ordering::SeqCst);
        let delta = scaled.abs_diff(last);
        if !terminal && delta < (0.01 * PROGRESS_SCALE) as u64 {
            return None;
        }
        self.last_reported_progress.store(scaled, Ordering::SeqCst);
        Some(ProgressUpdate {
            percent: ratio * 100.0,
            loaded: self.total_uploaded(),
            total: self.total_size,
            speed_bytes_per_sec: self.speed.lock().expect("progress lock poisoned").bytes_per_sec(),
            total_chunks: self.total_chunks,
            completed_chunks: self.completed_chunks.load(Ordering::SeqCst) as usize,
        })
    }
}
