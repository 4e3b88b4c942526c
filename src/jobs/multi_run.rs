//! Multi-run job: a config's operation over every line of a data pool

use std::fmt;
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
use uuid::Uuid;

use super::data_pool::DataPool;
use super::start_condition::{ImmediateStartCondition, StartCondition};
use super::stats::{JobStats, JobTick, MultiRunStats};
use super::{Job, JobCore, JobEvent, JobStatus};
use crate::error::{is_cancellation, Result, RunnerError};
use crate::locker::AsyncLocker;
use crate::models::{
    BotConfig, BotData, BotStatus, CaptchaReporter, DataLine, Hit, HitOutput, LineValidator, Proxy,
    Variable,
};
use crate::parallel::{
    Parallelizer, ParallelizerEvent, ParallelizerSettings, ParallelizerType, WorkFunction,
};
use crate::proxy::{ProxyPool, ProxySource};

/// Pause between two attempts at getting a proxy from an exhausted pool
const PROXY_RETRY_DELAY: Duration = Duration::from_millis(100);

const RELOAD_LOCK: (&str, &str) = ("proxy_pool", "reload");

/// Whether the job's bots go through proxies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobProxyMode {
    /// Whatever the config asks for
    #[default]
    Default,
    On,
    Off,
}

/// What a bot does when the pool has no usable proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoValidProxyBehaviour {
    DoNothing,
    Unban,
    #[default]
    Reload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiRunJobOptions {
    pub bots: usize,
    pub max_bots: usize,
    pub skip: u64,
    pub parallelizer: ParallelizerType,
    pub proxy_mode: JobProxyMode,
    pub shuffle_proxies: bool,
    /// Hand the same proxy to several bots at once
    pub concurrent_proxy_mode: bool,
    pub never_ban_proxies: bool,
    /// Count lines interrupted by an abort as "to check" instead of dropping them
    pub mark_as_to_check_on_abort: bool,
    pub no_valid_proxy_behaviour: NoValidProxyBehaviour,
    /// Banned proxies become available again after this many seconds (0 = never)
    pub proxy_ban_time_secs: u64,
    /// Reload the proxy pool every this many seconds (0 = never)
    pub periodic_reload_interval_secs: u64,
    pub tick_interval_ms: u64,
    pub cpm_limit: Option<u64>,
}

impl Default for MultiRunJobOptions {
    fn default() -> Self {
        Self {
            bots: 1,
            max_bots: 200,
            skip: 0,
            parallelizer: ParallelizerType::default(),
            proxy_mode: JobProxyMode::Default,
            shuffle_proxies: true,
            concurrent_proxy_mode: false,
            never_ban_proxies: false,
            mark_as_to_check_on_abort: false,
            no_valid_proxy_behaviour: NoValidProxyBehaviour::Reload,
            proxy_ban_time_secs: 0,
            periodic_reload_interval_secs: 0,
            tick_interval_ms: 1000,
            cpm_limit: None,
        }
    }
}

/// One data line to process
#[derive(Debug, Clone)]
pub struct BotWorkItem {
    pub line: DataLine,
}

impl fmt::Display for BotWorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.line.data)
    }
}

/// Terminal result of one line
#[derive(Debug, Clone)]
pub struct BotOutcome {
    pub status: BotStatus,
    pub captured: Vec<Variable>,
    pub proxy: Option<Proxy>,
}

impl BotOutcome {
    fn bare(status: BotStatus, proxy: Option<Proxy>) -> Self {
        Self {
            status,
            captured: Vec::new(),
            proxy,
        }
    }
}

type Engine = Parallelizer<BotWorkItem, BotOutcome>;

/// Per-run context shared by all bots
struct BotRunner {
    config: BotConfig,
    validator: LineValidator,
    pool: Option<Arc<ProxyPool>>,
    locker: Arc<AsyncLocker>,
    options: MultiRunJobOptions,
    stats: Arc<MultiRunStats>,
    captcha_reporter: Option<Arc<dyn CaptchaReporter>>,
}

impl BotRunner {
    async fn run(&self, item: BotWorkItem, cancel: CancellationToken) -> anyhow::Result<BotOutcome> {
        let line = item.line;
        if !self.validator.is_valid(&line) {
            return Ok(BotOutcome::bare(BotStatus::Invalid, None));
        }

        let settings = &self.config.settings;
        let mut failures = 0u32;

        loop {
            let proxy = match &self.pool {
                Some(pool) => match self.acquire_proxy(pool, &cancel).await {
                    Ok(proxy) => Some(proxy),
                    Err(e) if e.is_cancelled() => return self.interrupted(None),
                    Err(e) => return Err(e.into()),
                },
                None => None,
            };

            let mut data = BotData::new(line.clone(), &settings.wordlist_type, proxy.clone());
            match self.config.operation.execute(&mut data, cancel.clone()).await {
                Ok(()) => {}
                Err(e) if cancel.is_cancelled() && is_cancellation(&e) => {}
                Err(e) => {
                    debug!(line = %line.data, "Operation failed: {:#}", e);
                    data.status = BotStatus::Error;
                }
            }

            if let (Some(pool), Some(proxy)) = (&self.pool, &proxy) {
                let ban = !self.options.never_ban_proxies
                    && settings.ban_proxy_statuses.contains(&data.status);
                pool.release_proxy(proxy, ban);
            }

            if cancel.is_cancelled() {
                return self.interrupted(proxy);
            }

            match &data.status {
                BotStatus::Retry => {
                    self.report_captcha(&data).await;
                    self.stats.record_retry();
                }
                BotStatus::Ban | BotStatus::Error => {
                    failures += 1;
                    if settings.ban_loop_evasion > 0 && failures > settings.ban_loop_evasion {
                        debug!(line = %line.data, failures, "Ban loop evaded");
                        return Ok(BotOutcome::bare(BotStatus::None, proxy));
                    }
                    if data.status == BotStatus::Ban {
                        self.stats.record_ban();
                    } else {
                        self.stats.record_error();
                    }
                }
                _ => {
                    return Ok(BotOutcome {
                        captured: data.captured(),
                        status: data.status.clone(),
                        proxy,
                    })
                }
            }
        }
    }

    fn interrupted(&self, proxy: Option<Proxy>) -> anyhow::Result<BotOutcome> {
        if self.options.mark_as_to_check_on_abort {
            Ok(BotOutcome::bare(BotStatus::None, proxy))
        } else {
            Err(RunnerError::Cancelled.into())
        }
    }

    async fn report_captcha(&self, data: &BotData) {
        if let (Some(reporter), Some(captcha_id)) = (&self.captcha_reporter, &data.last_captcha_id) {
            if let Err(e) = reporter.report_bad(captcha_id).await {
                warn!(captcha_id = %captcha_id, "Failed to report bad captcha: {:#}", e);
            }
        }
    }

    async fn acquire_proxy(&self, pool: &ProxyPool, cancel: &CancellationToken) -> Result<Proxy> {
        let max_uses = self.config.settings.max_uses_per_proxy;
        loop {
            if cancel.is_cancelled() {
                return Err(RunnerError::Cancelled);
            }
            if let Some(proxy) = pool.get_proxy(self.options.concurrent_proxy_mode, max_uses) {
                return Ok(proxy);
            }

            match self.options.no_valid_proxy_behaviour {
                NoValidProxyBehaviour::Reload => {
                    reload_pool(pool, &self.locker, self.options.shuffle_proxies, cancel).await?
                }
                NoValidProxyBehaviour::Unban => {
                    pool.unban_all();
                }
                NoValidProxyBehaviour::DoNothing => {}
            }

            tokio::select! {
                _ = tokio::time::sleep(PROXY_RETRY_DELAY) => {}
                _ = cancel.cancelled() => return Err(RunnerError::Cancelled),
            }
        }
    }
}

/// Reload under the shared lock. Waiters that queued behind a reload reuse
/// its result instead of reloading again.
async fn reload_pool(
    pool: &ProxyPool,
    locker: &AsyncLocker,
    shuffle: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let generation = pool.generation();
    let _guard = locker.acquire(RELOAD_LOCK.0, RELOAD_LOCK.1, cancel).await?;
    if pool.generation() != generation {
        return Ok(());
    }

    match pool.reload_all(shuffle, cancel).await {
        Ok(count) => {
            info!(count, "Proxy pool reloaded");
            Ok(())
        }
        Err(e) if e.is_cancelled() => Err(e),
        Err(e) => {
            warn!("Proxy pool reload failed: {}", e);
            Ok(())
        }
    }
}

pub struct MultiRunJob {
    core: Arc<JobCore>,
    config: BotConfig,
    options: MultiRunJobOptions,
    data_pool: Arc<dyn DataPool>,
    proxy_sources: Vec<Arc<dyn ProxySource>>,
    hit_outputs: Vec<Arc<dyn HitOutput>>,
    start_condition: Arc<dyn StartCondition>,
    captcha_reporter: Option<Arc<dyn CaptchaReporter>>,
    locker: Arc<AsyncLocker>,
    stats: Arc<MultiRunStats>,
    hits: Arc<Mutex<Vec<Hit>>>,
    pool: Mutex<Option<Arc<ProxyPool>>>,
    engine: Mutex<Option<Arc<Engine>>>,
}

impl MultiRunJob {
    pub fn new(
        owner_id: u64,
        config: BotConfig,
        data_pool: Arc<dyn DataPool>,
        options: MultiRunJobOptions,
    ) -> Self {
        Self {
            core: Arc::new(JobCore::new(owner_id, options.bots)),
            config,
            options,
            data_pool,
            proxy_sources: Vec::new(),
            hit_outputs: Vec::new(),
            start_condition: Arc::new(ImmediateStartCondition),
            captcha_reporter: None,
            locker: Arc::new(AsyncLocker::new()),
            stats: Arc::new(MultiRunStats::new()),
            hits: Arc::new(Mutex::new(Vec::new())),
            pool: Mutex::new(None),
            engine: Mutex::new(None),
        }
    }

    pub fn with_proxy_source(mut self, source: Arc<dyn ProxySource>) -> Self {
        self.proxy_sources.push(source);
        self
    }

    pub fn with_hit_output(mut self, output: Arc<dyn HitOutput>) -> Self {
        self.hit_outputs.push(output);
        self
    }

    pub fn with_start_condition(mut self, condition: Arc<dyn StartCondition>) -> Self {
        self.start_condition = condition;
        self
    }

    pub fn with_captcha_reporter(mut self, reporter: Arc<dyn CaptchaReporter>) -> Self {
        self.captcha_reporter = Some(reporter);
        self
    }

    /// Share reload locks with other jobs
    pub fn with_locker(mut self, locker: Arc<AsyncLocker>) -> Self {
        self.locker = locker;
        self
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    pub fn options(&self) -> &MultiRunJobOptions {
        &self.options
    }

    /// Hits of the current or last run
    pub fn hits(&self) -> Vec<Hit> {
        self.hits.lock().clone()
    }

    /// Pool of the current or last run, if it uses proxies
    pub fn proxy_pool(&self) -> Option<Arc<ProxyPool>> {
        self.pool.lock().clone()
    }

    fn uses_proxies(&self) -> bool {
        match self.options.proxy_mode {
            JobProxyMode::Default => self.config.settings.needs_proxies,
            JobProxyMode::On => true,
            JobProxyMode::Off => false,
        }
    }

    fn engine(&self) -> Option<Arc<Engine>> {
        self.engine.lock().clone()
    }

    async fn build_pool(&self, setup: &CancellationToken) -> Result<Option<Arc<ProxyPool>>> {
        if !self.uses_proxies() {
            return Ok(None);
        }
        if self.proxy_sources.is_empty() {
            return Err(RunnerError::JobSetup(
                "proxies are required but no proxy source was given".into(),
            ));
        }

        let pool = ProxyPool::new(
            self.proxy_sources.clone(),
            self.config.settings.allowed_proxy_types.clone(),
        );
        let count = pool.reload_all(self.options.shuffle_proxies, setup).await?;
        if count == 0 {
            return Err(RunnerError::NoProxiesAvailable);
        }
        info!(job = %self.core.id, count, "Proxy pool loaded");
        Ok(Some(Arc::new(pool)))
    }

    async fn launch(&self, setup: CancellationToken) -> Result<()> {
        let validator = LineValidator::new(
            self.config.settings.wordlist_type.clone(),
            &self.config.settings.data_rules,
        )?;

        let total = self.data_pool.size();
        if self.options.skip >= total {
            return Err(RunnerError::JobSetup(format!(
                "nothing to process: skip {} with {} lines",
                self.options.skip, total
            )));
        }

        let pool = self.build_pool(&setup).await?;
        *self.pool.lock() = pool.clone();

        self.core
            .wait_start_condition(self.start_condition.as_ref(), &setup)
            .await?;

        self.stats.reset();
        self.hits.lock().clear();

        let inputs = self
            .data_pool
            .lines()?
            .enumerate()
            .map(|(index, data)| BotWorkItem {
                line: DataLine::new(data, index as u64),
            });

        let runner = Arc::new(BotRunner {
            config: self.config.clone(),
            validator,
            pool: pool.clone(),
            locker: self.locker.clone(),
            options: self.options.clone(),
            stats: self.stats.clone(),
            captcha_reporter: self.captcha_reporter.clone(),
        });
        let work: WorkFunction<BotWorkItem, BotOutcome> = Arc::new(move |item, cancel| {
            let runner = runner.clone();
            async move { runner.run(item, cancel).await }.boxed()
        });

        let settings = ParallelizerSettings {
            degree_of_parallelism: self.core.bots(),
            max_degree_of_parallelism: self.options.max_bots.max(self.core.bots()),
            total_amount: total,
            skip: self.options.skip,
            cpm_limit: self.options.cpm_limit,
        };
        let engine = Arc::new(Parallelizer::new(self.options.parallelizer, inputs, work, settings)?);

        if setup.is_cancelled() {
            return Err(RunnerError::Cancelled);
        }

        let ticker_stop = CancellationToken::new();
        self.spawn_ticker(engine.clone(), pool, ticker_stop.clone());
        self.spawn_forwarder(engine.subscribe(), ticker_stop.clone(), engine.clone());

        *self.engine.lock() = Some(engine.clone());
        if let Err(e) = engine.start().await {
            ticker_stop.cancel();
            return Err(e);
        }

        info!(
            job = %self.core.id,
            config = %self.config.name,
            bots = self.core.bots(),
            total,
            skip = self.options.skip,
            "Multi-run job started"
        );
        Ok(())
    }

    fn spawn_forwarder(
        &self,
        mut events: mpsc::UnboundedReceiver<ParallelizerEvent<BotWorkItem, BotOutcome>>,
        ticker_stop: CancellationToken,
        engine: Arc<Engine>,
    ) {
        let core = self.core.clone();
        let stats = self.stats.clone();
        let hits = self.hits.clone();
        let outputs = self.hit_outputs.clone();
        let config_id = self.config.id.clone();
        let config_name = self.config.name.clone();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match &event {
                    ParallelizerEvent::NewResult { input, output } => {
                        stats.record_result(&output.status);
                        if output.status.is_bad() {
                            continue;
                        }

                        let hit = Hit {
                            id: Uuid::new_v4(),
                            data: input.line.data.clone(),
                            captured: output.captured.clone(),
                            proxy: output.proxy.clone(),
                            date: Utc::now(),
                            hit_type: output.status.clone(),
                            config_id: config_id.clone(),
                            config_name: config_name.clone(),
                            job_id: core.id,
                            owner_id: core.owner_id,
                        };
                        hits.lock().push(hit.clone());
                        core.events.emit(JobEvent::NewHit(hit.clone()));
                        store_hit(&outputs, hit);
                    }
                    ParallelizerEvent::Completed => {
                        ticker_stop.cancel();
                        core.events.emit(JobEvent::Tick(JobTick {
                            stats: JobStats::MultiRun(stats.snapshot()),
                            metrics: Some(engine.metrics()),
                        }));
                        core.events.emit(JobEvent::Completed);
                        info!(job = %core.id, stats = ?stats.snapshot(), "Multi-run job completed");
                    }
                    _ => {}
                }

                if core.relay(&event) {
                    break;
                }
            }
        });
    }

    fn spawn_ticker(&self, engine: Arc<Engine>, pool: Option<Arc<ProxyPool>>, stop: CancellationToken) {
        let core = self.core.clone();
        let stats = self.stats.clone();
        let locker = self.locker.clone();
        let tick_interval = Duration::from_millis(self.options.tick_interval_ms.max(1));
        let ban_time = Duration::from_secs(self.options.proxy_ban_time_secs);
        let reload_every = Duration::from_secs(self.options.periodic_reload_interval_secs);
        let shuffle = self.options.shuffle_proxies;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            interval.tick().await;
            let mut last_reload = Instant::now();

            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {}
                }

                core.events.emit(JobEvent::Tick(JobTick {
                    stats: JobStats::MultiRun(stats.snapshot()),
                    metrics: Some(engine.metrics()),
                }));

                let Some(pool) = &pool else { continue };
                if !ban_time.is_zero() {
                    let unbanned = pool.unban_expired(ban_time);
                    if unbanned > 0 {
                        debug!(unbanned, "Unbanned expired proxies");
                    }
                }
                if !reload_every.is_zero() && last_reload.elapsed() >= reload_every {
                    last_reload = Instant::now();
                    if let Err(e) = reload_pool(pool, &locker, shuffle, &stop).await {
                        debug!("Periodic reload interrupted: {}", e);
                    }
                }
            }
        });
    }
}

fn store_hit(outputs: &[Arc<dyn HitOutput>], hit: Hit) {
    for output in outputs {
        let output = output.clone();
        let hit = hit.clone();
        tokio::spawn(async move {
            if let Err(e) = output.store(&hit).await {
                warn!(hit = %hit.id, "Failed to store hit: {:#}", e);
            }
        });
    }
}

#[async_trait]
impl Job for MultiRunJob {
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
        JobStats::MultiRun(self.stats.snapshot())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<JobEvent> {
        self.core.events.subscribe()
    }

    async fn start(&self) -> Result<()> {
        let setup = self.core.begin_start()?;
        *self.engine.lock() = None;
        if let Err(e) = self.launch(setup).await {
            if !e.is_cancelled() {
                warn!(job = %self.core.id, "Multi-run job failed to start: {}", e);
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
