//! Live run counters
//!
//! Counters only ever increase during a run; `reset` happens when a new run
//! starts.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::models::BotStatus;
use crate::parallel::RunMetrics;

#[derive(Debug, Default)]
pub struct MultiRunStats {
    tested: AtomicU64,
    hits: AtomicU64,
    custom: AtomicU64,
    fails: AtomicU64,
    retried: AtomicU64,
    banned: AtomicU64,
    errors: AtomicU64,
    to_check: AtomicU64,
    invalid: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MultiRunStatsSnapshot {
    pub tested: u64,
    pub hits: u64,
    pub custom: u64,
    pub fails: u64,
    pub retried: u64,
    pub banned: u64,
    pub errors: u64,
    pub to_check: u64,
    pub invalid: u64,
}

impl MultiRunStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a terminal outcome, first matching class wins
    pub fn record_result(&self, status: &BotStatus) {
        self.tested.fetch_add(1, Ordering::Relaxed);
        let counter = match status {
            BotStatus::Success => &self.hits,
            BotStatus::None => &self.to_check,
            BotStatus::Fail => &self.fails,
            BotStatus::Invalid => &self.invalid,
            _ => &self.custom,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ban(&self) {
        self.banned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        for counter in [
            &self.tested,
            &self.hits,
            &self.custom,
            &self.fails,
            &self.retried,
            &self.banned,
            &self.errors,
            &self.to_check,
            &self.invalid,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MultiRunStatsSnapshot {
        MultiRunStatsSnapshot {
            tested: self.tested.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            custom: self.custom.load(Ordering::Relaxed),
            fails: self.fails.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            banned: self.banned.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            to_check: self.to_check.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
pub struct ProxyCheckStats {
    tested: AtomicU64,
    working: AtomicU64,
    not_working: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProxyCheckStatsSnapshot {
    pub tested: u64,
    pub working: u64,
    pub not_working: u64,
}

impl ProxyCheckStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, working: bool) {
        self.tested.fetch_add(1, Ordering::Relaxed);
        if working {
            self.working.fetch_add(1, Ordering::Relaxed);
        } else {
            self.not_working.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn reset(&self) {
        self.tested.store(0, Ordering::Relaxed);
        self.working.store(0, Ordering::Relaxed);
        self.not_working.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProxyCheckStatsSnapshot {
        ProxyCheckStatsSnapshot {
            tested: self.tested.load(Ordering::Relaxed),
            working: self.working.load(Ordering::Relaxed),
            not_working: self.not_working.load(Ordering::Relaxed),
        }
    }
}

/// Counters of either job kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobStats {
    MultiRun(MultiRunStatsSnapshot),
    ProxyCheck(ProxyCheckStatsSnapshot),
}

/// Periodic progress report of a running job
#[derive(Debug, Clone)]
pub struct JobTick {
    pub stats: JobStats,
    pub metrics: Option<RunMetrics>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let stats = MultiRunStats::new();
        for status in [
            BotStatus::Success,
            BotStatus::Success,
            BotStatus::None,
            BotStatus::Fail,
            BotStatus::Invalid,
            BotStatus::Custom("2FA".into()),
        ] {
            stats.record_result(&status);
        }
        stats.record_ban();
        stats.record_retry();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.tested, 6);
        assert_eq!(snapshot.hits, 2);
        assert_eq!(snapshot.to_check, 1);
        assert_eq!(snapshot.fails, 1);
        assert_eq!(snapshot.invalid, 1);
        assert_eq!(snapshot.custom, 1);
        assert_eq!(snapshot.banned, 1);
        assert_eq!(snapshot.retried, 1);

        stats.reset();
        assert_eq!(stats.snapshot(), MultiRunStatsSnapshot::default());
    }

    #[test]
    fn test_proxy_check_counters() {
        let stats = ProxyCheckStats::new();
        stats.record(true);
        stats.record(false);
        stats.record(false);
        assert_eq!(
            stats.snapshot(),
            ProxyCheckStatsSnapshot {
                tested: 3,
                working: 1,
                not_working: 2,
            }
        );
    }
}
