//! Parallel execution engine
//!
//! Turns a sequence of inputs into bounded-concurrency invocations of an
//! async operation. The engine supports:
//! - Live changes of the degree of parallelism (DOP)
//! - Pause/resume (strategy dependent)
//! - Soft (stop) and hard (abort) cancellation
//! - CPM metering over a rolling window, with an optional CPM cap

mod run_core;
mod metrics;
mod structured;
mod task_based;
mod thread_based;

pub use metrics::{RunMetrics, CPM_WINDOW};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Result, RunnerError};

use run_core::RunCore;
use structured::StructuredStrategy;
use task_based::TaskBasedStrategy;
use thread_based::ThreadBasedStrategy;

/// The operation run once per input; receives the hard cancellation token
pub type WorkFunction<I, O> =
    Arc<dyn Fn(I, CancellationToken) -> BoxFuture<'static, anyhow::Result<O>> + Send + Sync>;

/// Lazily produced input sequence
pub type InputSequence<I> = Box<dyn Iterator<Item = I> + Send>;

/// Status of a parallel run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Idle,
    Starting,
    Running,
    Pausing,
    Paused,
    Stopping,
    Resuming,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Idle => "Idle",
            ExecutionStatus::Starting => "Starting",
            ExecutionStatus::Running => "Running",
            ExecutionStatus::Pausing => "Pausing",
            ExecutionStatus::Paused => "Paused",
            ExecutionStatus::Stopping => "Stopping",
            ExecutionStatus::Resuming => "Resuming",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatch strategy of a parallelizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelizerType {
    /// Explicit pool of workers, one spawned task per slot
    ThreadBased,
    /// Refillable queue gated by a counting semaphore
    #[default]
    TaskBased,
    /// One bulk bounded-concurrency call over the whole sequence
    Parallel,
}

impl ParallelizerType {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "thread_based" | "threadbased" | "thread-based" | "threads" => Self::ThreadBased,
            "parallel" | "structured" => Self::Parallel,
            _ => Self::TaskBased,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ThreadBased => "thread_based",
            Self::TaskBased => "task_based",
            Self::Parallel => "parallel",
        }
    }
}

/// Events published by a parallelizer
#[derive(Debug, Clone)]
pub enum ParallelizerEvent<I, O> {
    StatusChanged(ExecutionStatus),
    ProgressChanged(f32),
    NewResult { input: I, output: O },
    TaskError { input: I, error: Arc<anyhow::Error> },
    /// A failure of the dispatch loop itself; the run ends
    Error(Arc<anyhow::Error>),
    Completed,
}

#[derive(Debug, Clone, Copy)]
pub struct ParallelizerSettings {
    pub degree_of_parallelism: usize,
    pub max_degree_of_parallelism: usize,
    pub total_amount: u64,
    /// Items discarded from the start of the sequence
    pub skip: u64,
    pub cpm_limit: Option<u64>,
}

impl ParallelizerSettings {
    pub fn new(degree_of_parallelism: usize, total_amount: u64) -> Self {
        Self {
            degree_of_parallelism,
            max_degree_of_parallelism: degree_of_parallelism.max(200),
            total_amount,
            skip: 0,
            cpm_limit: None,
        }
    }
}

/// What differs between dispatch strategies
#[async_trait]
pub(crate) trait DispatchStrategy<I, O>: Send + Sync
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    /// Dispatch every input, returning once all started items finished
    async fn run(
        &self,
        core: Arc<RunCore<I, O>>,
        inputs: InputSequence<I>,
        soft: CancellationToken,
        hard: CancellationToken,
    ) -> anyhow::Result<()>;

    /// Called in `Starting`, before the status becomes `Running`, so that
    /// controls issued right after `start` see this run's state
    fn prepare(&self, _core: &Arc<RunCore<I, O>>) {}

    fn supports_pause(&self) -> bool {
        true
    }

    fn supports_stop(&self) -> bool {
        true
    }

    /// Called in `Pausing`; returns once nothing is in flight
    async fn pause(&self, core: &Arc<RunCore<I, O>>) -> Result<()>;

    /// Called in `Resuming`
    async fn resume(&self, core: &Arc<RunCore<I, O>>) -> Result<()>;

    /// Called in `Running`
    async fn change_degree_of_parallelism(&self, core: &Arc<RunCore<I, O>>, dop: usize) -> Result<()>;
}

/// Bounded-concurrency driver over a sequence of inputs
pub struct Parallelizer<I, O> {
    kind: ParallelizerType,
    core: Arc<RunCore<I, O>>,
    strategy: Arc<dyn DispatchStrategy<I, O>>,
    inputs: Mutex<Option<InputSequence<I>>>,
    run_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<I, O> Parallelizer<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    pub fn new(
        kind: ParallelizerType,
        inputs: impl Iterator<Item = I> + Send + 'static,
        work: WorkFunction<I, O>,
        settings: ParallelizerSettings,
    ) -> Result<Self> {
        if settings.degree_of_parallelism < 1 {
            return Err(RunnerError::InvalidArgument(
                "degree of parallelism must be at least 1".into(),
            ));
        }
        if settings.degree_of_parallelism > settings.max_degree_of_parallelism {
            return Err(RunnerError::InvalidArgument(format!(
                "degree of parallelism {} exceeds the maximum {}",
                settings.degree_of_parallelism, settings.max_degree_of_parallelism
            )));
        }
        if settings.skip >= settings.total_amount {
            return Err(RunnerError::InvalidArgument(format!(
                "skip {} must be lower than the total amount {}",
                settings.skip, settings.total_amount
            )));
        }

        let strategy: Arc<dyn DispatchStrategy<I, O>> = match kind {
            ParallelizerType::ThreadBased => Arc::new(ThreadBasedStrategy::new()),
            ParallelizerType::TaskBased => Arc::new(TaskBasedStrategy::new()),
            ParallelizerType::Parallel => Arc::new(StructuredStrategy),
        };

        let core = RunCore::new(
            work,
            settings.degree_of_parallelism,
            settings.max_degree_of_parallelism,
            settings.total_amount,
            settings.skip,
            settings.cpm_limit,
        );

        Ok(Self {
            kind,
            core: Arc::new(core),
            strategy,
            inputs: Mutex::new(Some(Box::new(inputs))),
            run_handle: Mutex::new(None),
        })
    }

    pub fn kind(&self) -> ParallelizerType {
        self.kind
    }

    pub fn status(&self) -> ExecutionStatus {
        self.core.status()
    }

    pub fn metrics(&self) -> RunMetrics {
        self.core.snapshot()
    }

    pub fn degree_of_parallelism(&self) -> usize {
        self.core.degree_of_parallelism()
    }

    pub fn max_degree_of_parallelism(&self) -> usize {
        self.core.max_dop
    }

    pub fn set_cpm_limit(&self, limit: Option<u64>) {
        self.core.set_cpm_limit(limit);
    }

    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<ParallelizerEvent<I, O>> {
        self.core.events.subscribe()
    }

    /// Start dispatching; returns as soon as the run is underway
    pub async fn start(&self) -> Result<()> {
        self.core
            .transition("start", &[ExecutionStatus::Idle], ExecutionStatus::Starting)?;

        let Some(inputs) = self.inputs.lock().take() else {
            self.core.set_status(ExecutionStatus::Idle);
            return Err(RunnerError::invalid_state(
                "start",
                "the input sequence was already consumed",
            ));
        };

        let (soft, hard) = self.core.reset_for_run();
        let inputs: InputSequence<I> = Box::new(inputs.skip(self.core.skip as usize));
        self.strategy.prepare(&self.core);

        self.core.set_status(ExecutionStatus::Running);
        info!(
            strategy = self.kind.as_str(),
            dop = self.core.degree_of_parallelism(),
            total = self.core.total,
            skip = self.core.skip,
            "Parallel run started"
        );

        let core = self.core.clone();
        let strategy = self.strategy.clone();
        let handle = tokio::spawn(async move {
            let result = strategy.run(core.clone(), inputs, soft, hard).await;
            debug!(processed = core.metrics.processed(), "Parallel run finished");
            core.finish(result);
        });
        *self.run_handle.lock() = Some(handle);

        Ok(())
    }

    /// Suspend dispatch; returns once nothing is in flight
    pub async fn pause(&self) -> Result<()> {
        if !self.strategy.supports_pause() {
            return Err(RunnerError::NotSupported(format!(
                "pause is not supported by the {} parallelizer",
                self.kind.as_str()
            )));
        }
        self.core
            .transition("pause", &[ExecutionStatus::Running], ExecutionStatus::Pausing)?;

        if let Err(e) = self.strategy.pause(&self.core).await {
            self.core
                .try_transition(&[ExecutionStatus::Pausing], ExecutionStatus::Running);
            return Err(e);
        }

        // The run may have ended, or been stopped, before reaching a pause point
        let mut status = self.core.watch_status();
        let reached = status
            .wait_for(|s| *s != ExecutionStatus::Pausing)
            .await
            .map(|s| *s)
            .unwrap_or(ExecutionStatus::Idle);
        match reached {
            ExecutionStatus::Idle | ExecutionStatus::Stopping => {
                Err(RunnerError::invalid_state("pause", reached))
            }
            _ => Ok(()),
        }
    }

    pub async fn resume(&self) -> Result<()> {
        if !self.strategy.supports_pause() {
            return Err(RunnerError::NotSupported(format!(
                "resume is not supported by the {} parallelizer",
                self.kind.as_str()
            )));
        }
        self.core
            .transition("resume", &[ExecutionStatus::Paused], ExecutionStatus::Resuming)?;
        self.strategy.resume(&self.core).await
    }

    /// Stop admitting new items and wait for the in-flight ones
    pub async fn stop(&self) -> Result<()> {
        if !self.strategy.supports_stop() {
            return Err(RunnerError::NotSupported(format!(
                "stop is not supported by the {} parallelizer, use abort",
                self.kind.as_str()
            )));
        }
        self.core.transition(
            "stop",
            &[ExecutionStatus::Running, ExecutionStatus::Paused],
            ExecutionStatus::Stopping,
        )?;

        self.core.soft_token().cancel();
        self.wait_completion().await;
        Ok(())
    }

    /// Stop admitting new items and cancel the in-flight ones
    pub async fn abort(&self) -> Result<()> {
        self.core.transition(
            "abort",
            &[
                ExecutionStatus::Running,
                ExecutionStatus::Paused,
                ExecutionStatus::Stopping,
                ExecutionStatus::Pausing,
            ],
            ExecutionStatus::Stopping,
        )?;

        self.core.soft_token().cancel();
        self.core.hard_token().cancel();
        self.wait_completion().await;
        Ok(())
    }

    pub async fn change_degree_of_parallelism(&self, dop: usize) -> Result<()> {
        if dop > self.core.max_dop {
            return Err(RunnerError::InvalidArgument(format!(
                "degree of parallelism {} exceeds the maximum {}",
                dop, self.core.max_dop
            )));
        }

        match self.core.status() {
            ExecutionStatus::Idle => self.core.set_degree_of_parallelism(dop),
            ExecutionStatus::Paused => self.core.stage_degree_of_parallelism(dop),
            ExecutionStatus::Running => {
                self.strategy
                    .change_degree_of_parallelism(&self.core, dop)
                    .await?
            }
            status => {
                return Err(RunnerError::invalid_state(
                    "change the degree of parallelism",
                    status,
                ))
            }
        }

        debug!(dop, "Degree of parallelism changed");
        Ok(())
    }

    /// Wait until the run is back to `Idle`
    pub async fn wait_completion(&self) {
        let mut status = self.core.watch_status();
        let _ = status.wait_for(|s| *s == ExecutionStatus::Idle).await;
    }
}

impl<I, O> Drop for Parallelizer<I, O> {
    fn drop(&mut self) {
        if let Some(handle) = self.run_handle.lock().take() {
            if !handle.is_finished() {
                self.core.soft_token().cancel();
                self.core.hard_token().cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::mpsc::UnboundedReceiver;

    /// Work function that sleeps and tracks the peak number of concurrent calls
    fn tracked_work(
        delay: Duration,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    ) -> WorkFunction<u64, u64> {
        Arc::new(move |item, cancel: CancellationToken| {
            let active = active.clone();
            let peak = peak.clone();
            Box::pin(async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        active.fetch_sub(1, Ordering::SeqCst);
                        return Err(RunnerError::Cancelled.into());
                    }
                }
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(item * 2)
            })
        })
    }

    fn drain<I, O>(rx: &mut UnboundedReceiver<ParallelizerEvent<I, O>>) -> Vec<ParallelizerEvent<I, O>> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn settings(dop: usize, total: u64) -> ParallelizerSettings {
        ParallelizerSettings {
            degree_of_parallelism: dop,
            max_degree_of_parallelism: 10,
            total_amount: total,
            skip: 0,
            cpm_limit: None,
        }
    }

    #[test]
    fn test_construction_validation() {
        let work = tracked_work(
            Duration::ZERO,
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
        );

        let zero = Parallelizer::new(ParallelizerType::TaskBased, 0..10u64, work.clone(), settings(0, 10));
        assert!(matches!(zero, Err(RunnerError::InvalidArgument(_))));

        let too_many = Parallelizer::new(ParallelizerType::TaskBased, 0..10u64, work.clone(), settings(11, 10));
        assert!(matches!(too_many, Err(RunnerError::InvalidArgument(_))));

        let mut skip_all = settings(1, 10);
        skip_all.skip = 10;
        let skipped = Parallelizer::new(ParallelizerType::TaskBased, 0..10u64, work.clone(), skip_all);
        assert!(matches!(skipped, Err(RunnerError::InvalidArgument(_))));

        assert!(Parallelizer::new(ParallelizerType::TaskBased, 0..10u64, work, settings(10, 10)).is_ok());
    }

    #[test]
    fn test_parallelizer_type_from_str() {
        assert_eq!(ParallelizerType::from_str("thread-based"), ParallelizerType::ThreadBased);
        assert_eq!(ParallelizerType::from_str("parallel"), ParallelizerType::Parallel);
        assert_eq!(ParallelizerType::from_str("whatever"), ParallelizerType::TaskBased);
        assert_eq!(ParallelizerType::TaskBased.as_str(), "task_based");
    }

    async fn run_ten_items(kind: ParallelizerType) {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let work = tracked_work(Duration::from_millis(50), active.clone(), peak.clone());

        let parallelizer = Parallelizer::new(kind, 0..10u64, work, settings(3, 10)).unwrap();
        let mut events = parallelizer.subscribe();

        parallelizer.start().await.unwrap();
        parallelizer.wait_completion().await;

        let metrics = parallelizer.metrics();
        assert_eq!(metrics.processed, 10);
        assert_eq!(metrics.progress, 1.0);
        assert!(metrics.cpm > 0);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(parallelizer.status(), ExecutionStatus::Idle);

        let events = drain(&mut events);
        let completed = events
            .iter()
            .filter(|e| matches!(e, ParallelizerEvent::Completed))
            .count();
        assert_eq!(completed, 1);

        let mut outputs: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                ParallelizerEvent::NewResult { output, .. } => Some(*output),
                _ => None,
            })
            .collect();
        outputs.sort_unstable();
        assert_eq!(outputs, (0..10u64).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_thread_based_runs_all_items() {
        run_ten_items(ParallelizerType::ThreadBased).await;
    }

    #[tokio::test]
    async fn test_task_based_runs_all_items() {
        run_ten_items(ParallelizerType::TaskBased).await;
    }

    #[tokio::test]
    async fn test_structured_runs_all_items() {
        run_ten_items(ParallelizerType::Parallel).await;
    }

    #[tokio::test]
    async fn test_skipped_items_are_never_dispatched() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_work = seen.clone();
        let work: WorkFunction<u64, u64> = Arc::new(move |item, _| {
            let seen = seen_in_work.clone();
            Box::pin(async move {
                seen.lock().push(item);
                Ok(item)
            })
        });

        let mut s = settings(2, 10);
        s.skip = 4;
        let parallelizer = Parallelizer::new(ParallelizerType::TaskBased, 0..10u64, work, s).unwrap();
        parallelizer.start().await.unwrap();
        parallelizer.wait_completion().await;

        let mut seen = seen.lock().clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![4, 5, 6, 7, 8, 9]);
        assert_eq!(parallelizer.metrics().processed, 6);
        assert_eq!(parallelizer.metrics().progress, 1.0);
    }

    #[tokio::test]
    async fn test_task_errors_do_not_stop_the_run() {
        let work: WorkFunction<u64, u64> = Arc::new(|item, _| {
            Box::pin(async move {
                if item % 2 == 0 {
                    anyhow::bail!("even item {}", item);
                }
                Ok(item)
            })
        });

        let parallelizer = Parallelizer::new(ParallelizerType::ThreadBased, 0..6u64, work, settings(2, 6)).unwrap();
        let mut events = parallelizer.subscribe();
        parallelizer.start().await.unwrap();
        parallelizer.wait_completion().await;

        let events = drain(&mut events);
        let errors = events
            .iter()
            .filter(|e| matches!(e, ParallelizerEvent::TaskError { .. }))
            .count();
        let results = events
            .iter()
            .filter(|e| matches!(e, ParallelizerEvent::NewResult { .. }))
            .count();
        assert_eq!(errors, 3);
        assert_eq!(results, 3);
        assert_eq!(parallelizer.metrics().processed, 6);
    }

    #[tokio::test]
    async fn test_control_operations_require_legal_status() {
        let work = tracked_work(
            Duration::from_millis(10),
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
        );
        let parallelizer = Parallelizer::new(ParallelizerType::TaskBased, 0..5u64, work, settings(1, 5)).unwrap();

        assert!(matches!(parallelizer.pause().await, Err(RunnerError::InvalidState { .. })));
        assert!(matches!(parallelizer.resume().await, Err(RunnerError::InvalidState { .. })));
        assert!(matches!(parallelizer.stop().await, Err(RunnerError::InvalidState { .. })));
        assert!(matches!(parallelizer.abort().await, Err(RunnerError::InvalidState { .. })));

        // Idle just reassigns
        parallelizer.change_degree_of_parallelism(4).await.unwrap();
        assert_eq!(parallelizer.degree_of_parallelism(), 4);
        assert!(matches!(
            parallelizer.change_degree_of_parallelism(11).await,
            Err(RunnerError::InvalidArgument(_))
        ));

        parallelizer.start().await.unwrap();
        assert!(matches!(parallelizer.start().await, Err(RunnerError::InvalidState { .. })));
        parallelizer.wait_completion().await;

        // The sequence is consumed by the first run
        assert!(matches!(parallelizer.start().await, Err(RunnerError::InvalidState { .. })));
        assert_eq!(parallelizer.status(), ExecutionStatus::Idle);
    }

    #[tokio::test]
    async fn test_structured_rejects_pause_and_stop() {
        let work = tracked_work(
            Duration::from_millis(20),
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
        );
        let parallelizer = Parallelizer::new(ParallelizerType::Parallel, 0..100u64, work, settings(2, 100)).unwrap();
        parallelizer.start().await.unwrap();

        assert!(matches!(parallelizer.pause().await, Err(RunnerError::NotSupported(_))));
        assert!(matches!(parallelizer.stop().await, Err(RunnerError::NotSupported(_))));
        assert!(matches!(
            parallelizer.change_degree_of_parallelism(5).await,
            Err(RunnerError::NotSupported(_))
        ));

        parallelizer.abort().await.unwrap();
        assert_eq!(parallelizer.status(), ExecutionStatus::Idle);
        assert!(parallelizer.metrics().processed < 100);
    }

    async fn grow_dop_while_running(kind: ParallelizerType) {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let work = tracked_work(Duration::from_millis(40), active.clone(), peak.clone());
        let parallelizer = Parallelizer::new(kind, 0..60u64, work, settings(1, 60)).unwrap();

        parallelizer.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);

        parallelizer.change_degree_of_parallelism(4).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(peak.load(Ordering::SeqCst), 4);

        parallelizer.wait_completion().await;
        assert_eq!(parallelizer.metrics().processed, 60);
        assert!(peak.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn test_thread_based_grows_dop() {
        grow_dop_while_running(ParallelizerType::ThreadBased).await;
    }

    #[tokio::test]
    async fn test_task_based_grows_dop() {
        grow_dop_while_running(ParallelizerType::TaskBased).await;
    }

    async fn shrink_dop_while_running(kind: ParallelizerType) {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let work = tracked_work(Duration::from_millis(30), active.clone(), peak.clone());
        let parallelizer = Parallelizer::new(kind, 0..200u64, work, settings(4, 200)).unwrap();

        parallelizer.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        parallelizer.change_degree_of_parallelism(1).await.unwrap();

        // Let the excess in-flight items drain, then nothing above one runs
        tokio::time::sleep(Duration::from_millis(100)).await;
        for _ in 0..10 {
            assert!(active.load(Ordering::SeqCst) <= 1);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        parallelizer.abort().await.unwrap();
    }

    #[tokio::test]
    async fn test_thread_based_shrinks_dop() {
        shrink_dop_while_running(ParallelizerType::ThreadBased).await;
    }

    #[tokio::test]
    async fn test_task_based_shrinks_dop() {
        shrink_dop_while_running(ParallelizerType::TaskBased).await;
    }

    async fn pause_and_resume(kind: ParallelizerType) {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let work = tracked_work(Duration::from_millis(20), active.clone(), peak.clone());
        let parallelizer = Parallelizer::new(kind, 0..30u64, work, settings(3, 30)).unwrap();

        parallelizer.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        parallelizer.pause().await.unwrap();
        assert_eq!(parallelizer.status(), ExecutionStatus::Paused);
        assert_eq!(active.load(Ordering::SeqCst), 0);

        let processed = parallelizer.metrics().processed;
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(parallelizer.metrics().processed, processed);

        // Staged while paused, applied on resume
        parallelizer.change_degree_of_parallelism(2).await.unwrap();
        parallelizer.resume().await.unwrap();
        assert_eq!(parallelizer.status(), ExecutionStatus::Running);
        assert_eq!(parallelizer.degree_of_parallelism(), 2);

        parallelizer.wait_completion().await;
        assert_eq!(parallelizer.metrics().processed, 30);
    }

    #[tokio::test]
    async fn test_thread_based_pause_resume() {
        pause_and_resume(ParallelizerType::ThreadBased).await;
    }

    #[tokio::test]
    async fn test_task_based_pause_resume() {
        pause_and_resume(ParallelizerType::TaskBased).await;
    }

    async fn pause_right_after_start(kind: ParallelizerType) {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let work = tracked_work(Duration::from_millis(20), active.clone(), peak);
        let parallelizer = Parallelizer::new(kind, 0..20u64, work, settings(3, 20)).unwrap();

        parallelizer.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(3), parallelizer.pause())
            .await
            .expect("pause should not hang")
            .unwrap();
        assert_eq!(parallelizer.status(), ExecutionStatus::Paused);
        assert_eq!(active.load(Ordering::SeqCst), 0);
        assert!(parallelizer.metrics().processed < 20);

        parallelizer.resume().await.unwrap();
        tokio::time::timeout(Duration::from_secs(3), parallelizer.wait_completion())
            .await
            .unwrap();
        assert_eq!(parallelizer.metrics().processed, 20);
    }

    #[tokio::test]
    async fn test_thread_based_pause_right_after_start() {
        pause_right_after_start(ParallelizerType::ThreadBased).await;
    }

    #[tokio::test]
    async fn test_task_based_pause_right_after_start() {
        pause_right_after_start(ParallelizerType::TaskBased).await;
    }

    async fn shrink_right_after_start(kind: ParallelizerType) {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let work = tracked_work(Duration::from_millis(20), active, peak);
        let parallelizer = Parallelizer::new(kind, 0..20u64, work, settings(3, 20)).unwrap();

        parallelizer.start().await.unwrap();
        tokio::time::timeout(
            Duration::from_secs(3),
            parallelizer.change_degree_of_parallelism(1),
        )
        .await
        .expect("shrinking should not hang")
        .unwrap();
        assert_eq!(parallelizer.degree_of_parallelism(), 1);

        tokio::time::timeout(Duration::from_secs(3), parallelizer.wait_completion())
            .await
            .unwrap();
        assert_eq!(parallelizer.metrics().processed, 20);
        assert_eq!(parallelizer.status(), ExecutionStatus::Idle);
    }

    #[tokio::test]
    async fn test_thread_based_shrink_right_after_start() {
        shrink_right_after_start(ParallelizerType::ThreadBased).await;
    }

    #[tokio::test]
    async fn test_task_based_shrink_right_after_start() {
        shrink_right_after_start(ParallelizerType::TaskBased).await;
    }

    #[tokio::test]
    async fn test_stop_lets_in_flight_items_finish() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let work = tracked_work(Duration::from_millis(50), active.clone(), peak.clone());
        let parallelizer = Parallelizer::new(ParallelizerType::TaskBased, 0..100u64, work, settings(2, 100)).unwrap();
        let mut events = parallelizer.subscribe();

        parallelizer.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(75)).await;
        parallelizer.stop().await.unwrap();

        assert_eq!(parallelizer.status(), ExecutionStatus::Idle);
        assert_eq!(active.load(Ordering::SeqCst), 0);

        // Every started item completed with a result, none was cancelled
        let processed = parallelizer.metrics().processed;
        assert!(processed < 100);
        let results = drain(&mut events)
            .iter()
            .filter(|e| matches!(e, ParallelizerEvent::NewResult { .. }))
            .count() as u64;
        assert_eq!(results, processed);
    }

    #[tokio::test]
    async fn test_abort_cancels_in_flight_items() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let work = tracked_work(Duration::from_secs(30), active.clone(), peak.clone());
        let parallelizer = Parallelizer::new(ParallelizerType::ThreadBased, 0..10u64, work, settings(3, 10)).unwrap();

        parallelizer.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(active.load(Ordering::SeqCst), 3);

        tokio::time::timeout(Duration::from_secs(2), parallelizer.abort())
            .await
            .expect("abort should not wait for the slow items")
            .unwrap();
        assert_eq!(active.load(Ordering::SeqCst), 0);
        assert_eq!(parallelizer.metrics().processed, 3);
    }

    #[tokio::test]
    async fn test_cpm_limit_throttles_dispatch() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let work = tracked_work(Duration::ZERO, active, peak);
        let mut s = settings(5, 100);
        s.cpm_limit = Some(5);
        let parallelizer = Parallelizer::new(ParallelizerType::TaskBased, 0..100u64, work, s).unwrap();

        parallelizer.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        // At most one batch of DOP items can slip past the cap
        let processed = parallelizer.metrics().processed;
        assert!(processed >= 5);
        assert!(processed <= 10);
        assert_eq!(parallelizer.status(), ExecutionStatus::Running);

        parallelizer.abort().await.unwrap();
    }
}
