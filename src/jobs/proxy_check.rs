//! Proxy check job: fetch a known page through every proxy

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::outputs::{ProxyCheckOutput, ProxyGeolocator};
use super::start_condition::{ImmediateStartCondition, StartCondition};
use super::stats::{JobStats, JobTick, ProxyCheckStats};
use super::{Job, JobCore, JobEvent, JobStatus};
use crate::error::{Result, RunnerError};
use crate::models::{Proxy, ProxyWorkingStatus};
use crate::parallel::{
    Parallelizer, ParallelizerEvent, ParallelizerSettings, ParallelizerType, WorkFunction,
};
use crate::proxy::{http_get, ConnectionSettings};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyCheckJobOptions {
    pub bots: usize,
    pub max_bots: usize,
    pub parallelizer: ParallelizerType,
    /// Page fetched through each proxy; must be `http://`
    pub target_url: String,
    /// Text the page must contain for the proxy to count as working
    pub success_key: String,
    pub timeout_ms: u64,
    pub only_untested: bool,
    pub tick_interval_ms: u64,
    pub cpm_limit: Option<u64>,
}

impl Default for ProxyCheckJobOptions {
    fn default() -> Self {
        Self {
            bots: 1,
            max_bots: 200,
            parallelizer: ParallelizerType::default(),
            target_url: "http://example.com/".to_string(),
            success_key: "Example Domain".to_string(),
            timeout_ms: 10_000,
            only_untested: false,
            tick_interval_ms: 1000,
            cpm_limit: None,
        }
    }
}

type Engine = Parallelizer<Proxy, Proxy>;

struct ProxyChecker {
    url: Url,
    success_key: String,
    timeout: Duration,
    connection: ConnectionSettings,
    geolocator: Option<Arc<dyn ProxyGeolocator>>,
}

impl ProxyChecker {
    async fn check(&self, mut proxy: Proxy, cancel: CancellationToken) -> anyhow::Result<Proxy> {
        let started = Instant::now();
        let result = http_get(&self.url, Some(&proxy), &self.connection, self.timeout, &cancel).await;

        match result {
            Ok(response) if response.body.contains(&self.success_key) => {
                proxy.working_status = ProxyWorkingStatus::Working;
                proxy.ping = started.elapsed().as_millis().min(u32::MAX as u128) as u32;
            }
            Ok(response) => {
                debug!(proxy = %proxy, status = response.status, "Success key not found");
                proxy.working_status = ProxyWorkingStatus::NotWorking;
            }
            Err(e) if e.is_cancelled() => return Err(e.into()),
            Err(e) => {
                debug!(proxy = %proxy, "Proxy check failed: {}", e);
                proxy.working_status = ProxyWorkingStatus::NotWorking;
            }
        }
        proxy.last_checked = Some(Utc::now());

        if let Some(geolocator) = &self.geolocator {
            match geolocator.geolocate(&proxy.host).await {
                Ok(country) => proxy.country = country,
                Err(e) => debug!(proxy = %proxy, "Geolocation failed: {:#}", e),
            }
        }

        Ok(proxy)
    }
}

pub struct ProxyCheckJob {
    core: Arc<JobCore>,
    options: ProxyCheckJobOptions,
    connection: ConnectionSettings,
    proxies: Arc<Mutex<Vec<Proxy>>>,
    output: Option<Arc<dyn ProxyCheckOutput>>,
    geolocator: Option<Arc<dyn ProxyGeolocator>>,
    start_condition: Arc<dyn StartCondition>,
    stats: Arc<ProxyCheckStats>,
    engine: Mutex<Option<Arc<Engine>>>,
}

impl ProxyCheckJob {
    pub fn new(owner_id: u64, proxies: Vec<Proxy>, options: ProxyCheckJobOptions) -> Self {
        Self {
            core: Arc::new(JobCore::new(owner_id, options.bots)),
            options,
            connection: ConnectionSettings::default(),
            proxies: Arc::new(Mutex::new(proxies)),
            output: None,
            geolocator: None,
            start_condition: Arc::new(ImmediateStartCondition),
            stats: Arc::new(ProxyCheckStats::new()),
            engine: Mutex::new(None),
        }
    }

    pub fn with_output(mut self, output: Arc<dyn ProxyCheckOutput>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_geolocator(mut self, geolocator: Arc<dyn ProxyGeolocator>) -> Self {
        self.geolocator = Some(geolocator);
        self
    }

    pub fn with_start_condition(mut self, condition: Arc<dyn StartCondition>) -> Self {
        self.start_condition = condition;
        self
    }

    pub fn with_connection_settings(mut self, connection: ConnectionSettings) -> Self {
        self.connection = connection;
        self
    }

    /// Proxies with the results of the checks done so far
    pub fn proxies(&self) -> Vec<Proxy> {
        self.proxies.lock().clone()
    }

    fn engine(&self) -> Option<Arc<Engine>> {
        self.engine.lock().clone()
    }

    async fn launch(&self, setup: CancellationToken) -> Result<()> {
        let output = self
            .output
            .clone()
            .ok_or_else(|| RunnerError::JobSetup("a check output is required".into()))?;

        let url = Url::parse(&self.options.target_url)?;
        if url.scheme() != "http" {
            return Err(RunnerError::JobSetup(format!(
                "target URL must be http://, got {}",
                url
            )));
        }
        if self.options.success_key.is_empty() {
            return Err(RunnerError::JobSetup("a success key is required".into()));
        }

        let targets: Vec<Proxy> = self
            .proxies
            .lock()
            .iter()
            .filter(|p| !self.options.only_untested || p.working_status == ProxyWorkingStatus::Untested)
            .cloned()
            .collect();
        if targets.is_empty() {
            return Err(RunnerError::JobSetup("no proxies to check".into()));
        }

        self.core
            .wait_start_condition(self.start_condition.as_ref(), &setup)
            .await?;
        self.stats.reset();

        let checker = Arc::new(ProxyChecker {
            url,
            success_key: self.options.success_key.clone(),
            timeout: Duration::from_millis(self.options.timeout_ms),
            connection: self.connection,
            geolocator: self.geolocator.clone(),
        });
        let work: WorkFunction<Proxy, Proxy> = Arc::new(move |proxy, cancel| {
            let checker = checker.clone();
            async move { checker.check(proxy, cancel).await }.boxed()
        });

        let total = targets.len() as u64;
        let settings = ParallelizerSettings {
            degree_of_parallelism: self.core.bots(),
            max_degree_of_parallelism: self.options.max_bots.max(self.core.bots()),
            total_amount: total,
            skip: 0,
            cpm_limit: self.options.cpm_limit,
        };
        let engine = Arc::new(Parallelizer::new(
            self.options.parallelizer,
            targets.into_iter(),
            work,
            settings,
        )?);

        if setup.is_cancelled() {
            return Err(RunnerError::Cancelled);
        }

        let ticker_stop = CancellationToken::new();
        self.spawn_ticker(engine.clone(), ticker_stop.clone());
        self.spawn_forwarder(engine.subscribe(), output, ticker_stop.clone(), engine.clone());

        *self.engine.lock() = Some(engine.clone());
        if let Err(e) = engine.start().await {
            ticker_stop.cancel();
            return Err(e);
        }

        info!(
            job = %self.core.id,
            proxies = total,
            bots = self.core.bots(),
            target = %self.options.target_url,
            "Proxy check job started"
        );
        Ok(())
    }

    fn spawn_forwarder(
        &self,
        mut events: mpsc::UnboundedReceiver<ParallelizerEvent<Proxy, Proxy>>,
        output: Arc<dyn ProxyCheckOutput>,
        ticker_stop: CancellationToken,
        engine: Arc<Engine>,
    ) {
        let core = self.core.clone();
        let stats = self.stats.clone();
        let proxies = self.proxies.clone();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match &event {
                    ParallelizerEvent::NewResult { output: checked, .. } => {
                        stats.record(checked.working_status == ProxyWorkingStatus::Working);
                        if let Some(stored) = proxies.lock().iter_mut().find(|p| **p == *checked) {
                            *stored = checked.clone();
                        }
                        core.events.emit(JobEvent::ProxyChecked(checked.clone()));

                        let output = output.clone();
                        let checked = checked.clone();
                        tokio::spawn(async move {
                            if let Err(e) = output.store(&checked).await {
                                warn!(proxy = %checked, "Failed to store checked proxy: {:#}", e);
                            }
                        });
                    }
                    ParallelizerEvent::Completed => {
                        ticker_stop.cancel();
                        core.events.emit(JobEvent::Tick(JobTick {
                            stats: JobStats::ProxyCheck(stats.snapshot()),
                            metrics: Some(engine.metrics()),
                        }));
                        core.events.emit(JobEvent::Completed);
                        info!(job = %core.id, stats = ?stats.snapshot(), "Proxy check job completed");
                    }
                    _ => {}
                }

                if core.relay(&event) {
                    break;
                }
            }
        });
    }

    fn spawn_ticker(&self, engine: Arc<Engine>, stop: CancellationToken) {
        let core = self.core.clone();
        let stats = self.stats.clone();
        let tick_interval = Duration::from_millis(self.options.tick_interval_ms.max(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {}
                }
                core.events.emit(JobEvent::Tick(JobTick {
                    stats: JobStats::ProxyCheck(stats.snapshot()),
                    metrics: Some(engine.metrics()),
                }));
            }
        });
    }
}

#[async_trait]
impl Job for ProxyCheckJob {
    fn id(&self) -> Uuid {
        self.core.id
    }

    fn owner_id(&self) -> u64 {
        self.core.owner_id
    }

    fn status(&self) -> JobStatus {
        self.core.status()
    }

    fn bots(&self) -> usize {
        self.core.bots()
    }

    fn stats(&self) -> JobStats {
        JobStats::ProxyCheck(self.stats.snapshot())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<JobEvent> {
        self.core.events.subscribe()
    }

    async fn start(&self) -> Result<()> {
        let setup = self.core.begin_start()?;
        *self.engine.lock() = None;
        if let Err(e) = self.launch(setup).await {
            if !e.is_cancelled() {
                warn!(job = %self.core.id, "Proxy check job failed to start: {}", e);
            }
            *self.engine.lock() = None;
            self.core.set_status(JobStatus::Idle);
            return Err(e);
        }
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        self.core.pause(self.engine()).await
    }

    async fn resume(&self) -> Result<()> {
        self.core.resume(self.engine()).await
    }

    async fn stop(&self) -> Result<()> {
        self.core.stop(self.engine()).await
    }

    async fn abort(&self) -> Result<()> {
        self.core.abort(|| self.engine()).await
    }

    async fn change_bots(&self, bots: usize) -> Result<()> {
        self.core.change_bots(bots, self.engine()).await
    }

    fn skip_wait(&self) {
        self.core.skip_wait();
    }

    async fn wait_completion(&self) {
        self.core.wait_idle().await;
    }
}
