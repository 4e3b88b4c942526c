//! Worker-pool strategy: one spawned task per occupied slot

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::run_core::{RunCore, POLL_INTERVAL};
use super::{DispatchStrategy, ExecutionStatus, InputSequence};
use crate::error::Result;

pub(crate) struct ThreadBasedStrategy {
    pause_requested: AtomicBool,
    resumed: Notify,
}

impl ThreadBasedStrategy {
    pub fn new() -> Self {
        Self {
            pause_requested: AtomicBool::new(false),
            resumed: Notify::new(),
        }
    }
}

fn log_join(result: std::result::Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!("Worker panicked: {}", e);
        }
    }
}

#[async_trait]
impl<I, O> DispatchStrategy<I, O> for ThreadBasedStrategy
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    async fn run(
        &self,
        core: Arc<RunCore<I, O>>,
        mut inputs: InputSequence<I>,
        soft: CancellationToken,
        hard: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut workers = JoinSet::new();

        loop {
            if soft.is_cancelled() {
                break;
            }

            if self.pause_requested.load(Ordering::Acquire) {
                while let Some(result) = workers.join_next().await {
                    log_join(result);
                }
                core.try_transition(&[ExecutionStatus::Pausing], ExecutionStatus::Paused);
                debug!("Workers drained, run paused");

                tokio::select! {
                    _ = self.resumed.notified() => continue,
                    _ = soft.cancelled() => break,
                }
            }

            if workers.len() >= core.degree_of_parallelism() {
                tokio::select! {
                    result = workers.join_next(), if !workers.is_empty() => {
                        if let Some(result) = result {
                            log_join(result);
                        }
                    }
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    _ = soft.cancelled() => break,
                }
                continue;
            }

            core.throttle(&soft).await;
            if soft.is_cancelled() || self.pause_requested.load(Ordering::Acquire) {
                continue;
            }

            let Some(item) = inputs.next() else {
                break;
            };
            workers.spawn(core.clone().run_item(item, soft.clone(), hard.clone()));
        }

        while let Some(result) = workers.join_next().await {
            log_join(result);
        }
        Ok(())
    }

    fn prepare(&self, _core: &Arc<RunCore<I, O>>) {
        self.pause_requested.store(false, Ordering::Release);
    }

    async fn pause(&self, core: &Arc<RunCore<I, O>>) -> Result<()> {
        self.pause_requested.store(true, Ordering::Release);

        let mut status = core.watch_status();
        let _ = status
            .wait_for(|s| *s != ExecutionStatus::Pausing)
            .await;
        Ok(())
    }

    async fn resume(&self, core: &Arc<RunCore<I, O>>) -> Result<()> {
        if let Some(dop) = core.take_staged_degree_of_parallelism() {
            core.set_degree_of_parallelism(dop);
        }
        self.pause_requested.store(false, Ordering::Release);
        core.try_transition(&[ExecutionStatus::Resuming], ExecutionStatus::Running);
        self.resumed.notify_one();
        Ok(())
    }

    async fn change_degree_of_parallelism(&self, core: &Arc<RunCore<I, O>>, dop: usize) -> Result<()> {
        // The dispatch loop compares against the live value before every spawn
        core.set_degree_of_parallelism(dop);
        Ok(())
    }
}
