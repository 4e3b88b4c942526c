//! Registry of live jobs
//!
//! Each registered job gets a forwarding task that re-publishes its events
//! tagged with the job id. Unregistering stops the forwarding.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Job, JobEvent, JobStatus};
use crate::error::{Result, RunnerError};
use crate::events::EventBus;

struct RegisteredJob {
    job: Arc<dyn Job>,
    forwarder: JoinHandle<()>,
}

pub struct JobRegistry {
    jobs: DashMap<Uuid, RegisteredJob>,
    events: Arc<EventBus<(Uuid, JobEvent)>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
            events: Arc::new(EventBus::new()),
        }
    }

    /// Track `job` and start re-publishing its events. Returns its id.
    pub fn register(&self, job: Arc<dyn Job>) -> Uuid {
        let id = job.id();
        let mut job_events = job.subscribe();
        let events = self.events.clone();

        let forwarder = tokio::spawn(async move {
            while let Some(event) = job_events.recv().await {
                events.emit((id, event));
            }
        });

        if let Some(previous) = self.jobs.insert(id, RegisteredJob { job, forwarder }) {
            previous.forwarder.abort();
        }
        info!(job = %id, "Job registered");
        id
    }

    /// Forget an idle job. Running jobs have to be stopped first.
    pub fn unregister(&self, id: &Uuid) -> Result<Arc<dyn Job>> {
        let status = self
            .jobs
            .get(id)
            .map(|entry| entry.job.status())
            .ok_or(RunnerError::JobNotFound { id: *id })?;
        if status != JobStatus::Idle {
            return Err(RunnerError::invalid_state("unregister a job", status));
        }

        let (_, registered) = self
            .jobs
            .remove(id)
            .ok_or(RunnerError::JobNotFound { id: *id })?;
        registered.forwarder.abort();
        debug!(job = %id, "Job unregistered");
        Ok(registered.job)
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<dyn Job>> {
        self.jobs.get(id).map(|entry| entry.job.clone())
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.jobs.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Events of every registered job, tagged with the job id
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<(Uuid, JobEvent)> {
        self.events.subscribe()
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for JobRegistry {
    fn drop(&mut self) {
        for entry in self.jobs.iter() {
            entry.forwarder.abort();
        }
    }
}
