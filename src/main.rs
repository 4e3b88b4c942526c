//! Rota Runner - Entry Point
//!
//! Checks the proxies of a list file and appends the working ones to the
//! output file. Ctrl+C aborts the check.

use std::sync::Arc;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rota_runner::jobs::{FileProxyCheckOutput, Job, JobEvent, JobStats, ProxyCheckJob, ProxyCheckJobOptions};
use rota_runner::proxy::{FileProxySource, ProxySource};
use rota_runner::{Config, Result};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("rota_runner={}", config.log.level).into());
    let registry = tracing_subscriber::registry().with(filter);
    if config.log.format == "pretty" {
        registry.with(tracing_subscriber::fmt::layer().pretty()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    }

    info!("Starting Rota Runner");

    // Load proxies
    let source = FileProxySource::new(&config.check.proxies_file, config.check.default_proxy_type);
    let proxies = source.get_all(&CancellationToken::new()).await?;
    info!(
        "Loaded {} proxies from {}",
        proxies.len(),
        config.check.proxies_file.display()
    );

    let options = ProxyCheckJobOptions {
        bots: config.runner.bots,
        max_bots: config.runner.max_bots,
        parallelizer: config.runner.parallelizer,
        target_url: config.check.target_url.to_string(),
        success_key: config.check.success_key.clone(),
        timeout_ms: config.check.timeout * 1000,
        only_untested: config.check.only_untested,
        tick_interval_ms: config.runner.tick_interval.max(1) * 1000,
        cpm_limit: config.cpm_limit(),
    };
    let job = Arc::new(
        ProxyCheckJob::new(0, proxies, options)
            .with_output(Arc::new(FileProxyCheckOutput::new(&config.check.output_file)))
            .with_connection_settings(config.connection_settings()),
    );

    let mut events = job.subscribe();
    let event_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                JobEvent::Tick(tick) => {
                    if let (JobStats::ProxyCheck(stats), Some(metrics)) = (tick.stats, tick.metrics) {
                        info!(
                            tested = stats.tested,
                            working = stats.working,
                            not_working = stats.not_working,
                            cpm = metrics.cpm,
                            progress = format!("{:.1}%", metrics.progress * 100.0),
                            "Progress"
                        );
                    }
                }
                JobEvent::ProxyChecked(proxy) => {
                    debug!(proxy = %proxy, status = ?proxy.working_status, ping = proxy.ping, "Proxy checked");
                }
                JobEvent::Error(message) => error!("Check failed: {}", message),
                JobEvent::Completed => break,
                _ => {}
            }
        }
    });

    job.start().await?;
    info!("Proxy check started with {} bots", job.bots());

    tokio::select! {
        _ = job.wait_completion() => {}
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            if let Err(e) = job.abort().await {
                warn!("Abort failed: {}", e);
            }
        }
    }

    let _ = event_task.await;
    if let JobStats::ProxyCheck(stats) = job.stats() {
        info!(
            "Rota Runner stopped - tested: {}, working: {}, not working: {}",
            stats.tested, stats.working, stats.not_working
        );
    }
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
