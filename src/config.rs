use crate::error::{Result, RunnerError};
use crate::models::ProxyType;
use crate::parallel::ParallelizerType;
use crate::proxy::ConnectionSettings;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Execution engine configuration
    pub runner: RunnerConfig,
    /// Proxy connection timeouts
    pub connection: ConnectionConfig,
    /// Proxy check job configuration
    pub check: CheckConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Number of bots, the degree of parallelism (default: 10)
    pub bots: usize,
    /// Upper bound for live bot changes (default: 200)
    pub max_bots: usize,
    /// Dispatch strategy (thread_based, task_based, parallel)
    pub parallelizer: ParallelizerType,
    /// Statistics tick interval in seconds
    pub tick_interval: u64,
    /// Checks per minute cap, 0 = unlimited
    pub cpm_limit: u64,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// TCP connect timeout in seconds
    pub connect_timeout: u64,
    /// Handshake read timeout in seconds
    pub read_timeout: u64,
}

#[derive(Debug, Clone)]
pub struct CheckConfig {
    /// Page fetched through every proxy (http only)
    pub target_url: Url,
    /// Text the page must contain for the proxy to count as working
    pub success_key: String,
    /// Whole-check timeout in seconds
    pub timeout: u64,
    /// Proxy list, one per line
    pub proxies_file: PathBuf,
    /// Where working proxies are appended
    pub output_file: PathBuf,
    /// Type assumed for lines without a `(type)` prefix
    pub default_proxy_type: ProxyType,
    /// Only check proxies that were never tested
    pub only_untested: bool,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let runner = RunnerConfig {
            bots: get_env_or("RUNNER_BOTS", "10").parse().map_err(|_| {
                RunnerError::InvalidConfig("RUNNER_BOTS must be a valid number".into())
            })?,
            max_bots: get_env_or("RUNNER_MAX_BOTS", "200").parse().map_err(|_| {
                RunnerError::InvalidConfig("RUNNER_MAX_BOTS must be a valid number".into())
            })?,
            parallelizer: ParallelizerType::from_str(&get_env_or("RUNNER_PARALLELIZER", "task_based")),
            tick_interval: get_env_or("RUNNER_TICK_INTERVAL", "1").parse().unwrap_or(1),
            cpm_limit: get_env_or("RUNNER_CPM_LIMIT", "0").parse().unwrap_or(0),
        };

        if runner.bots == 0 || runner.bots > runner.max_bots {
            return Err(RunnerError::InvalidConfig(format!(
                "RUNNER_BOTS must be between 1 and RUNNER_MAX_BOTS ({})",
                runner.max_bots
            )));
        }

        let target_url = Url::parse(&get_env_or("CHECK_TARGET_URL", "http://example.com/"))?;
        if target_url.scheme() != "http" {
            return Err(RunnerError::InvalidConfig(
                "CHECK_TARGET_URL must be an http:// URL".into(),
            ));
        }

        let proxy_type = get_env_or("CHECK_PROXY_TYPE", "http");
        let default_proxy_type = ProxyType::from_str(&proxy_type).ok_or_else(|| {
            RunnerError::InvalidConfig(format!(
                "CHECK_PROXY_TYPE has unsupported value: {}",
                proxy_type
            ))
        })?;

        Ok(Config {
            runner,
            connection: ConnectionConfig {
                connect_timeout: get_env_or("PROXY_CONNECT_TIMEOUT", "10")
                    .parse()
                    .unwrap_or(10),
                read_timeout: get_env_or("PROXY_READ_TIMEOUT", "10").parse().unwrap_or(10),
            },
            check: CheckConfig {
                target_url,
                success_key: get_env_or("CHECK_SUCCESS_KEY", "Example Domain"),
                timeout: get_env_or("CHECK_TIMEOUT", "10").parse().unwrap_or(10),
                proxies_file: PathBuf::from(get_env_or("CHECK_PROXIES_FILE", "proxies.txt")),
                output_file: PathBuf::from(get_env_or("CHECK_OUTPUT_FILE", "working_proxies.txt")),
                default_proxy_type,
                only_untested: get_env_or("CHECK_ONLY_UNTESTED", "false")
                    .parse()
                    .unwrap_or(false),
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "json"),
            },
        })
    }

    /// Timeouts for proxied connections
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            connect_timeout: Duration::from_secs(self.connection.connect_timeout),
            read_timeout: Duration::from_secs(self.connection.read_timeout),
        }
    }

    /// Engine CPM cap, `None` when unlimited
    pub fn cpm_limit(&self) -> Option<u64> {
        match self.runner.cpm_limit {
            0 => None,
            limit => Some(limit),
        }
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
