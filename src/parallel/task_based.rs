//! Queue + gate strategy
//!
//! Upcoming items sit in a small queue refilled from the sequence as it
//! drains. Every dispatch takes one permit from a semaphore sized to the
//! DOP. Pausing shrinks the gate to zero and resuming grows it back.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use super::run_core::RunCore;
use super::{DispatchStrategy, ExecutionStatus, InputSequence};
use crate::error::Result;

const QUEUE_CAPACITY: usize = 64;

pub(crate) struct TaskBasedStrategy {
    gate: Mutex<Arc<Semaphore>>,
    resizing: tokio::sync::Mutex<()>,
    saved_dop: AtomicUsize,
}

impl TaskBasedStrategy {
    pub fn new() -> Self {
        Self {
            gate: Mutex::new(Arc::new(Semaphore::new(0))),
            resizing: tokio::sync::Mutex::new(()),
            saved_dop: AtomicUsize::new(0),
        }
    }

    /// Grow or shrink the gate to `target` permits.
    /// Shrinking reclaims one permit at a time, waiting for in-flight items.
    /// Returns false when the run was cancelled or ended before reaching the target.
    async fn resize<I, O>(&self, core: &Arc<RunCore<I, O>>, target: usize) -> bool
    where
        I: Clone + Send + Sync + 'static,
        O: Clone + Send + Sync + 'static,
    {
        let _resizing = self.resizing.lock().await;
        let gate = self.gate.lock().clone();
        let current = core.degree_of_parallelism();
        let mut status = core.watch_status();

        if target >= current {
            gate.add_permits(target - current);
            core.set_degree_of_parallelism(target);
            return true;
        }

        let soft = core.soft_token();
        for _ in target..current {
            tokio::select! {
                permit = gate.acquire() => match permit {
                    Ok(permit) => permit.forget(),
                    Err(_) => return false,
                },
                _ = soft.cancelled() => return false,
                _ = async {
                    let _ = status.wait_for(|s| *s == ExecutionStatus::Idle).await;
                } => return false,
            }
            core.set_degree_of_parallelism(core.degree_of_parallelism().saturating_sub(1));
        }
        true
    }
}

#[async_trait]
impl<I, O> DispatchStrategy<I, O> for TaskBasedStrategy
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
        let gate = self.gate.lock().clone();

        let tracker = TaskTracker::new();
        let mut queue: VecDeque<I> = VecDeque::with_capacity(QUEUE_CAPACITY);

        loop {
            if soft.is_cancelled() {
                break;
            }

            if queue.is_empty() {
                queue.extend(inputs.by_ref().take(QUEUE_CAPACITY));
                if queue.is_empty() {
                    break;
                }
            }

            core.throttle(&soft).await;

            let permit = tokio::select! {
                permit = gate.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = soft.cancelled() => break,
            };

            let Some(item) = queue.pop_front() else {
                continue;
            };
            let core = core.clone();
            let soft = soft.clone();
            let hard = hard.clone();
            tracker.spawn(async move {
                core.run_item(item, soft, hard).await;
                drop(permit);
            });
        }

        tracker.close();
        tracker.wait().await;
        gate.close();
        Ok(())
    }

    fn prepare(&self, core: &Arc<RunCore<I, O>>) {
        *self.gate.lock() = Arc::new(Semaphore::new(core.degree_of_parallelism()));
        self.saved_dop.store(core.degree_of_parallelism(), Ordering::Release);
    }

    async fn pause(&self, core: &Arc<RunCore<I, O>>) -> Result<()> {
        let dop = core.degree_of_parallelism();
        self.saved_dop.store(dop, Ordering::Release);

        if self.resize(core, 0).await {
            core.try_transition(&[ExecutionStatus::Pausing], ExecutionStatus::Paused);
            debug!(saved_dop = dop, "Gate closed, run paused");
        }
        Ok(())
    }

    async fn resume(&self, core: &Arc<RunCore<I, O>>) -> Result<()> {
        let target = core
            .take_staged_degree_of_parallelism()
            .unwrap_or_else(|| self.saved_dop.load(Ordering::Acquire));

        self.resize(core, target).await;
        core.try_transition(&[ExecutionStatus::Resuming], ExecutionStatus::Running);
        Ok(())
    }

    async fn change_degree_of_parallelism(&self, core: &Arc<RunCore<I, O>>, dop: usize) -> Result<()> {
        self.resize(core, dop).await;
        Ok(())
    }
}
