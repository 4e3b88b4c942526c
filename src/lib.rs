//! Rota Runner - parallel job runner with proxy rotation
//!
//! Runs a user supplied operation over large input lists with bounded,
//! adjustable concurrency.
//!
//! ## Features
//!
//! - Three dispatch strategies (worker pool, semaphore-gated queue, bulk)
//! - Live degree of parallelism changes, pause/resume, stop and abort
//! - CPM metering with an optional CPM cap
//! - Multi-run jobs with a retry/ban state machine and hit outputs
//! - Proxy check jobs
//! - A shared proxy pool fed by static, file or remote sources
//! - HTTP CONNECT, SOCKS4, SOCKS4a and SOCKS5 proxy clients

pub mod config;
pub mod error;
pub mod events;
pub mod jobs;
pub mod locker;
pub mod models;
pub mod parallel;
pub mod proxy;

pub use config::Config;
pub use error::{Result, RunnerError};
