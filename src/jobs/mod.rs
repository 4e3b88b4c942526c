//! Jobs built on top of the parallel execution engine
//!
//! A job owns its identity, a start condition and a status derived from the
//! engine it drives. Two kinds exist:
//! - `MultiRunJob`: runs a config's operation over every line of a data pool
//! - `ProxyCheckJob`: checks a list of proxies against a target page

pub mod data_pool;
pub mod multi_run;
pub mod outputs;
pub mod proxy_check;
pub mod registry;
pub mod start_condition;
pub mod stats;

pub use data_pool::{DataPool, FileDataPool, MemoryDataPool, RangeDataPool};
pub use multi_run::{
    BotOutcome, BotWorkItem, JobProxyMode, MultiRunJob, MultiRunJobOptions, NoValidProxyBehaviour,
};
pub use outputs::{FileHitOutput, FileProxyCheckOutput, ProxyCheckOutput, ProxyGeolocator};
pub use proxy_check::{ProxyCheckJob, ProxyCheckJobOptions};
pub use registry::JobRegistry;
pub use start_condition::{
    AbsoluteTimeStartCondition, ImmediateStartCondition, RelativeTimeStartCondition, StartCondition,
};
pub use stats::{JobStats, JobTick, MultiRunStatsSnapshot, ProxyCheckStatsSnapshot};

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, RunnerError};
use crate::events::EventBus;
use crate::models::{Hit, Proxy};
use crate::parallel::{ExecutionStatus, Parallelizer, ParallelizerEvent};

/// Status of a job; the engine statuses plus `Waiting` for the start condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Idle,
    Waiting,
    Starting,
    Running,
    Pausing,
    Paused,
    Stopping,
    Resuming,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Idle => "Idle",
            JobStatus::Waiting => "Waiting",
            JobStatus::Starting => "Starting",
            JobStatus::Running => "Running",
            JobStatus::Pausing => "Pausing",
            JobStatus::Paused => "Paused",
            JobStatus::Stopping => "Stopping",
            JobStatus::Resuming => "Resuming",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ExecutionStatus> for JobStatus {
    fn from(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Idle => JobStatus::Idle,
            ExecutionStatus::Starting => JobStatus::Starting,
            ExecutionStatus::Running => JobStatus::Running,
            ExecutionStatus::Pausing => JobStatus::Pausing,
            ExecutionStatus::Paused => JobStatus::Paused,
            ExecutionStatus::Stopping => JobStatus::Stopping,
            ExecutionStatus::Resuming => JobStatus::Resuming,
        }
    }
}

/// Events published by a job
#[derive(Debug, Clone)]
pub enum JobEvent {
    StatusChanged(JobStatus),
    ProgressChanged(f32),
    /// A work item failed outside the normal status flow
    TaskError { input: String, message: String },
    /// The run itself failed and ended
    Error(String),
    Completed,
    BotsChanged(usize),
    Tick(JobTick),
    NewHit(Hit),
    ProxyChecked(Proxy),
}

#[async_trait]
pub trait Job: Send + Sync {
    fn id(&self) -> Uuid;

    fn owner_id(&self) -> u64;

    fn status(&self) -> JobStatus;

    fn bots(&self) -> usize;

    fn stats(&self) -> JobStats;

    fn subscribe(&self) -> mpsc::UnboundedReceiver<JobEvent>;

    /// Set up, wait for the start condition and start the run
    async fn start(&self) -> Result<()>;

    async fn pause(&self) -> Result<()>;

    async fn resume(&self) -> Result<()>;

    /// Finish the in-flight items, start no new ones
    async fn stop(&self) -> Result<()>;

    /// Cancel everything, including a pending start condition
    async fn abort(&self) -> Result<()>;

    async fn change_bots(&self, bots: usize) -> Result<()>;

    /// Stop waiting for the start condition and start right away
    fn skip_wait(&self);

    async fn wait_completion(&self);
}

/// State and controls shared by every job kind
pub(crate) struct JobCore {
    pub id: Uuid,
    pub owner_id: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Mutex<Option<DateTime<Utc>>>,
    status: watch::Sender<JobStatus>,
    skip_wait: Mutex<CancellationToken>,
    /// Cancels setup and the start condition wait
    setup: Mutex<CancellationToken>,
    bots: AtomicUsize,
    pub events: EventBus<JobEvent>,
}

impl JobCore {
    pub fn new(owner_id: u64, bots: usize) -> Self {
        let (status, _) = watch::channel(JobStatus::Idle);
        Self {
            id: Uuid::new_v4(),
            owner_id,
            created_at: Utc::now(),
            started_at: Mutex::new(None),
            status,
            skip_wait: Mutex::new(CancellationToken::new()),
            setup: Mutex::new(CancellationToken::new()),
            bots: AtomicUsize::new(bots),
            events: EventBus::new(),
        }
    }

    pub fn status(&self) -> JobStatus {
        *self.status.borrow()
    }

    pub fn set_status(&self, status: JobStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            debug!(job = %self.id, status = %status, "Job status changed");
            self.events.emit(JobEvent::StatusChanged(status));
        }
    }

    pub fn bots(&self) -> usize {
        self.bots.load(Ordering::Relaxed)
    }

    /// Idle -> Starting, handing out a fresh setup token
    pub fn begin_start(&self) -> Result<CancellationToken> {
        let mut moved = false;
        self.status.send_if_modified(|status| {
            if *status == JobStatus::Idle {
                *status = JobStatus::Starting;
                moved = true;
            }
            moved
        });
        if !moved {
            return Err(RunnerError::invalid_state("start", self.status()));
        }
        self.events.emit(JobEvent::StatusChanged(JobStatus::Starting));

        *self.skip_wait.lock() = CancellationToken::new();
        let setup = CancellationToken::new();
        *self.setup.lock() = setup.clone();
        Ok(setup)
    }

    /// Sit in `Waiting` until the condition holds.
    /// Fails with `Cancelled` if the job is aborted meanwhile.
    pub async fn wait_start_condition(
        &self,
        condition: &dyn StartCondition,
        setup: &CancellationToken,
    ) -> Result<()> {
        self.set_status(JobStatus::Waiting);
        let skip = self.skip_wait.lock().clone();

        tokio::select! {
            biased;
            _ = setup.cancelled() => return Err(RunnerError::Cancelled),
            _ = condition.wait(&skip) => {}
        }

        self.set_status(JobStatus::Starting);
        *self.started_at.lock() = Some(Utc::now());
        Ok(())
    }

    pub fn skip_wait(&self) {
        self.skip_wait.lock().cancel();
    }

    pub async fn wait_idle(&self) {
        let mut status = self.status.subscribe();
        let _ = status.wait_for(|s| *s == JobStatus::Idle).await;
    }

    async fn wait_for(&self, targets: &[JobStatus]) {
        let mut status = self.status.subscribe();
        let _ = status
            .wait_for(|s| *s == JobStatus::Idle || targets.contains(s))
            .await;
    }

    fn engine_or_err<I, O>(
        &self,
        operation: &'static str,
        engine: Option<Arc<Parallelizer<I, O>>>,
    ) -> Result<Arc<Parallelizer<I, O>>> {
        engine.ok_or_else(|| RunnerError::invalid_state(operation, self.status()))
    }

    pub async fn pause<I, O>(&self, engine: Option<Arc<Parallelizer<I, O>>>) -> Result<()>
    where
        I: Clone + Send + Sync + 'static,
        O: Clone + Send + Sync + 'static,
    {
        self.engine_or_err("pause", engine)?.pause().await?;
        self.wait_for(&[JobStatus::Paused]).await;
        info!(job = %self.id, "Job paused");
        Ok(())
    }

    pub async fn resume<I, O>(&self, engine: Option<Arc<Parallelizer<I, O>>>) -> Result<()>
    where
        I: Clone + Send + Sync + 'static,
        O: Clone + Send + Sync + 'static,
    {
        self.engine_or_err("resume", engine)?.resume().await?;
        self.wait_for(&[JobStatus::Running]).await;
        info!(job = %self.id, "Job resumed");
        Ok(())
    }

    pub async fn stop<I, O>(&self, engine: Option<Arc<Parallelizer<I, O>>>) -> Result<()>
    where
        I: Clone + Send + Sync + 'static,
        O: Clone + Send + Sync + 'static,
    {
        self.engine_or_err("stop", engine)?.stop().await?;
        self.wait_idle().await;
        info!(job = %self.id, "Job stopped");
        Ok(())
    }

    /// Abort the run, or the setup when no engine exists yet.
    /// `engine` is looked up again once setup settles.
    pub async fn abort<I, O, F>(&self, engine: F) -> Result<()>
    where
        I: Clone + Send + Sync + 'static,
        O: Clone + Send + Sync + 'static,
        F: Fn() -> Option<Arc<Parallelizer<I, O>>>,
    {
        let setting_up = matches!(self.status(), JobStatus::Waiting | JobStatus::Starting);
        if setting_up && engine().is_none() {
            self.setup.lock().cancel();

            let mut status = self.status.subscribe();
            let settled = status
                .wait_for(|s| !matches!(s, JobStatus::Waiting | JobStatus::Starting))
                .await
                .map(|s| *s)
                .unwrap_or(JobStatus::Idle);
            if settled == JobStatus::Idle {
                info!(job = %self.id, "Job aborted before it started");
                return Ok(());
            }
            // Setup got past its last check and the engine is running
        }

        self.engine_or_err("abort", engine())?.abort().await?;
        self.wait_idle().await;
        info!(job = %self.id, "Job aborted");
        Ok(())
    }

    pub async fn change_bots<I, O>(
        &self,
        bots: usize,
        engine: Option<Arc<Parallelizer<I, O>>>,
    ) -> Result<()>
    where
        I: Clone + Send + Sync + 'static,
        O: Clone + Send + Sync + 'static,
    {
        if bots == 0 {
            return Err(RunnerError::InvalidArgument("bots must be at least 1".into()));
        }

        match (self.status(), engine) {
            (JobStatus::Idle, _) => {}
            (_, Some(engine)) => engine.change_degree_of_parallelism(bots).await?,
            (status, None) => return Err(RunnerError::invalid_state("change bots", status)),
        }

        self.bots.store(bots, Ordering::Relaxed);
        self.events.emit(JobEvent::BotsChanged(bots));
        Ok(())
    }

    /// Mirror an engine lifecycle event onto the job.
    /// Returns `true` once the engine is back to idle.
    pub fn relay<I, O>(&self, event: &ParallelizerEvent<I, O>) -> bool
    where
        I: fmt::Display,
    {
        match event {
            ParallelizerEvent::StatusChanged(status) => {
                self.set_status((*status).into());
                return *status == ExecutionStatus::Idle;
            }
            ParallelizerEvent::ProgressChanged(progress) => {
                self.events.emit(JobEvent::ProgressChanged(*progress));
            }
            ParallelizerEvent::TaskError { input, error } => {
                self.events.emit(JobEvent::TaskError {
                    input: input.to_string(),
                    message: format!("{:#}", error),
                });
            }
            ParallelizerEvent::Error(error) => {
                self.events.emit(JobEvent::Error(format!("{:#}", error)));
            }
            ParallelizerEvent::NewResult { .. } | ParallelizerEvent::Completed => {}
        }
        false
    }
}
