//! Throughput metering for a run

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Completions older than this no longer count towards CPM
pub const CPM_WINDOW: Duration = Duration::from_secs(60);

/// Point-in-time view of a run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunMetrics {
    pub processed: u64,
    pub skip: u64,
    pub total: u64,
    /// Completions per minute over the rolling window
    pub cpm: u64,
    /// (processed + skip) / total, clamped to 1.0
    pub progress: f32,
    pub elapsed: Duration,
    /// Estimated time left, unknown while CPM is zero
    pub remaining: Option<Duration>,
}

pub(crate) struct MetricsTracker {
    processed: AtomicU64,
    cpm: AtomicU64,
    recomputing: AtomicBool,
    timestamps: Mutex<VecDeque<Instant>>,
    started_at: Mutex<Option<Instant>>,
    finished_at: Mutex<Option<Instant>>,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self {
            processed: AtomicU64::new(0),
            cpm: AtomicU64::new(0),
            recomputing: AtomicBool::new(false),
            timestamps: Mutex::new(VecDeque::new()),
            started_at: Mutex::new(None),
            finished_at: Mutex::new(None),
        }
    }

    pub fn reset(&self) {
        self.processed.store(0, Ordering::Relaxed);
        self.cpm.store(0, Ordering::Relaxed);
        self.timestamps.lock().clear();
        *self.started_at.lock() = Some(Instant::now());
        *self.finished_at.lock() = None;
    }

    pub fn finish(&self) {
        *self.finished_at.lock() = Some(Instant::now());
    }

    pub fn record_completion(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.timestamps.lock().push_back(Instant::now());
        self.recompute_cpm();
    }

    /// Drop timestamps that left the window and publish the new count.
    /// Only one caller recomputes at a time; the others return immediately.
    pub fn recompute_cpm(&self) {
        if self
            .recomputing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let now = Instant::now();
        {
            let mut timestamps = self.timestamps.lock();
            while let Some(oldest) = timestamps.front() {
                if now.duration_since(*oldest) > CPM_WINDOW {
                    timestamps.pop_front();
                } else {
                    break;
                }
            }
            self.cpm.store(timestamps.len() as u64, Ordering::Relaxed);
        }

        self.recomputing.store(false, Ordering::Release);
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn cpm(&self) -> u64 {
        self.cpm.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Duration {
        let Some(started) = *self.started_at.lock() else {
            return Duration::ZERO;
        };
        let end = self.finished_at.lock().unwrap_or_else(Instant::now);
        end.duration_since(started)
    }

    pub fn progress(&self, skip: u64, total: u64) -> f32 {
        if total == 0 {
            return 0.0;
        }
        ((self.processed() + skip) as f64 / total as f64).min(1.0) as f32
    }

    pub fn snapshot(&self, skip: u64, total: u64) -> RunMetrics {
        let processed = self.processed();
        let cpm = self.cpm();
        let remaining = if cpm == 0 {
            None
        } else {
            let left = total.saturating_sub(skip).saturating_sub(processed);
            Some(Duration::from_secs_f64(left as f64 / cpm as f64 * 60.0))
        };

        RunMetrics {
            processed,
            skip,
            total,
            cpm,
            progress: self.progress(skip, total),
            elapsed: self.elapsed(),
            remaining,
        }
    }
}
