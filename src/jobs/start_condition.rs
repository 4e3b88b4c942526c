//! Conditions a job waits on before its run begins

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait StartCondition: Send + Sync {
    /// Resolve once the condition holds, or early when `skip` fires
    async fn wait(&self, skip: &CancellationToken);
}

async fn sleep_or_skip(duration: Duration, skip: &CancellationToken) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = skip.cancelled() => {}
    }
}

/// Start right away
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateStartCondition;

#[async_trait]
impl StartCondition for ImmediateStartCondition {
    async fn wait(&self, _skip: &CancellationToken) {}
}

/// Start after a delay counted from the start request
#[derive(Debug, Clone, Copy)]
pub struct RelativeTimeStartCondition {
    pub delay: Duration,
}

impl RelativeTimeStartCondition {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl StartCondition for RelativeTimeStartCondition {
    async fn wait(&self, skip: &CancellationToken) {
        sleep_or_skip(self.delay, skip).await;
    }
}

/// Start at a wall-clock time; times in the past start immediately
#[derive(Debug, Clone, Copy)]
pub struct AbsoluteTimeStartCondition {
    pub start_at: DateTime<Utc>,
}

impl AbsoluteTimeStartCondition {
    pub fn new(start_at: DateTime<Utc>) -> Self {
        Self { start_at }
    }
}

#[async_trait]
impl StartCondition for AbsoluteTimeStartCondition {
    async fn wait(&self, skip: &CancellationToken) {
        let remaining = (self.start_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        sleep_or_skip(remaining, skip).await;
    }
}
