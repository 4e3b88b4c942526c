//! Bulk strategy: one bounded-concurrency pass over the whole sequence

use std::sync::Arc;

use async_trait::async_trait;
use futures::{future, stream, StreamExt};
use tokio_util::sync::CancellationToken;

use super::run_core::RunCore;
use super::{DispatchStrategy, InputSequence};
use crate::error::{Result, RunnerError};

pub(crate) struct StructuredStrategy;

fn not_supported(operation: &str) -> RunnerError {
    RunnerError::NotSupported(format!(
        "{} is not supported by the parallel strategy, use abort",
        operation
    ))
}

#[async_trait]
impl<I, O> DispatchStrategy<I, O> for StructuredStrategy
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    async fn run(
        &self,
        core: Arc<RunCore<I, O>>,
        inputs: InputSequence<I>,
        soft: CancellationToken,
        hard: CancellationToken,
    ) -> anyhow::Result<()> {
        // The concurrency limit is fixed for the whole pass
        let limit = core.degree_of_parallelism().max(1);
        let admitting = soft.clone();

        stream::iter(inputs)
            .take_while(move |_| future::ready(!admitting.is_cancelled()))
            .for_each_concurrent(limit, |item| {
                let core = core.clone();
                let soft = soft.clone();
                let hard = hard.clone();
                async move {
                    core.throttle(&soft).await;
                    core.run_item(item, soft, hard).await;
                }
            })
            .await;

        Ok(())
    }

    fn supports_pause(&self) -> bool {
        false
    }

    fn supports_stop(&self) -> bool {
        false
    }

    async fn pause(&self, _core: &Arc<RunCore<I, O>>) -> Result<()> {
        Err(not_supported("pause"))
    }

    async fn resume(&self, _core: &Arc<RunCore<I, O>>) -> Result<()> {
        Err(not_supported("resume"))
    }

    async fn change_degree_of_parallelism(&self, _core: &Arc<RunCore<I, O>>, _dop: usize) -> Result<()> {
        Err(not_supported("changing the degree of parallelism"))
    }
}
