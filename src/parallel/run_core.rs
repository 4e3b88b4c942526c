//! State shared by every dispatch strategy, plus the per-item wrapper

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::metrics::{MetricsTracker, RunMetrics};
use super::{ExecutionStatus, ParallelizerEvent, WorkFunction};
use crate::error::{is_cancellation, Result, RunnerError};
use crate::events::EventBus;

/// Poll interval used by throttling and pause waits
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub(crate) struct RunCore<I, O> {
    work: WorkFunction<I, O>,
    status: watch::Sender<ExecutionStatus>,
    dop: AtomicUsize,
    staged_dop: Mutex<Option<usize>>,
    pub(crate) max_dop: usize,
    pub(crate) total: u64,
    pub(crate) skip: u64,
    cpm_limit: AtomicU64,
    soft: Mutex<CancellationToken>,
    hard: Mutex<CancellationToken>,
    pub(crate) metrics: MetricsTracker,
    pub(crate) events: EventBus<ParallelizerEvent<I, O>>,
}

impl<I, O> RunCore<I, O> {
    pub fn soft_token(&self) -> CancellationToken {
        self.soft.lock().clone()
    }

    pub fn hard_token(&self) -> CancellationToken {
        self.hard.lock().clone()
    }
}

impl<I, O> RunCore<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    pub fn new(
        work: WorkFunction<I, O>,
        dop: usize,
        max_dop: usize,
        total: u64,
        skip: u64,
        cpm_limit: Option<u64>,
    ) -> Self {
        let (status, _) = watch::channel(ExecutionStatus::Idle);
        Self {
            work,
            status,
            dop: AtomicUsize::new(dop),
            staged_dop: Mutex::new(None),
            max_dop,
            total,
            skip,
            cpm_limit: AtomicU64::new(cpm_limit.unwrap_or(0)),
            soft: Mutex::new(CancellationToken::new()),
            hard: Mutex::new(CancellationToken::new()),
            metrics: MetricsTracker::new(),
            events: EventBus::new(),
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ExecutionStatus> {
        self.status.subscribe()
    }

    pub fn set_status(&self, status: ExecutionStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            self.events.emit(ParallelizerEvent::StatusChanged(status));
        }
    }

    /// Atomically move from one of `from` to `to`, failing with an
    /// invalid-state error naming `operation` otherwise.
    pub fn transition(
        &self,
        operation: &'static str,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
    ) -> Result<ExecutionStatus> {
        let mut observed = ExecutionStatus::Idle;
        let changed = self.status.send_if_modified(|current| {
            observed = *current;
            if from.contains(current) {
                *current = to;
                true
            } else {
                false
            }
        });

        if !changed {
            return Err(RunnerError::invalid_state(operation, observed));
        }
        if observed != to {
            self.events.emit(ParallelizerEvent::StatusChanged(to));
        }
        Ok(observed)
    }

    /// Like `transition` but silently does nothing when the status moved on
    pub fn try_transition(&self, from: &[ExecutionStatus], to: ExecutionStatus) -> bool {
        self.transition("change status", from, to).is_ok()
    }

    pub fn degree_of_parallelism(&self) -> usize {
        self.dop.load(Ordering::Acquire)
    }

    pub fn set_degree_of_parallelism(&self, dop: usize) {
        self.dop.store(dop, Ordering::Release);
    }

    pub fn stage_degree_of_parallelism(&self, dop: usize) {
        *self.staged_dop.lock() = Some(dop);
    }

    pub fn take_staged_degree_of_parallelism(&self) -> Option<usize> {
        self.staged_dop.lock().take()
    }

    pub fn set_cpm_limit(&self, limit: Option<u64>) {
        self.cpm_limit.store(limit.unwrap_or(0), Ordering::Relaxed);
    }

    pub fn cpm_limit(&self) -> Option<u64> {
        match self.cpm_limit.load(Ordering::Relaxed) {
            0 => None,
            limit => Some(limit),
        }
    }

    /// Fresh tokens and metrics for a new run
    pub fn reset_for_run(&self) -> (CancellationToken, CancellationToken) {
        let soft = CancellationToken::new();
        let hard = CancellationToken::new();
        *self.soft.lock() = soft.clone();
        *self.hard.lock() = hard.clone();
        self.metrics.reset();
        (soft, hard)
    }

    pub fn snapshot(&self) -> RunMetrics {
        self.metrics.snapshot(self.skip, self.total)
    }

    /// Hold dispatch while the rolling window is at or above the CPM limit
    pub async fn throttle(&self, soft: &CancellationToken) {
        while let Some(limit) = self.cpm_limit() {
            self.metrics.recompute_cpm();
            if self.metrics.cpm() < limit {
                return;
            }

            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = soft.cancelled() => return,
            }
        }
    }

    /// Run the operation for one item and record the outcome.
    /// A failing item never ends the run.
    pub async fn run_item(self: Arc<Self>, item: I, soft: CancellationToken, hard: CancellationToken) {
        if soft.is_cancelled() {
            return;
        }

        match (self.work)(item.clone(), hard).await {
            Ok(output) => self.events.emit(ParallelizerEvent::NewResult {
                input: item,
                output,
            }),
            Err(e) if is_cancellation(&e) => {
                debug!("Work item cancelled");
            }
            Err(e) => {
                debug!("Work item failed: {:#}", e);
                self.events.emit(ParallelizerEvent::TaskError {
                    input: item,
                    error: Arc::new(e),
                });
            }
        }

        self.metrics.record_completion();
        self.events.emit(ParallelizerEvent::ProgressChanged(
            self.metrics.progress(self.skip, self.total),
        ));
    }

    /// Terminal bookkeeping for a run, whatever the way it ended
    pub fn finish(&self, result: anyhow::Result<()>) {
        self.metrics.finish();
        if let Err(e) = result {
            error!("Parallel run failed: {:#}", e);
            self.events.emit(ParallelizerEvent::Error(Arc::new(e)));
        }
        self.events.emit(ParallelizerEvent::Completed);
        self.set_status(ExecutionStatus::Idle);
    }
}
