//! Shared proxy allocation
//!
//! Every mutation of the proxy list happens under the pool's lock, so
//! allocation is an atomic scan-and-mark even with many workers competing.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::source::ProxySource;
use crate::error::Result;
use crate::models::{Proxy, ProxyStatus, ProxyType};

pub struct ProxyPool {
    proxies: Mutex<Vec<Proxy>>,
    sources: Vec<Arc<dyn ProxySource>>,
    allowed_types: Vec<ProxyType>,
    /// Bumped by every reload
    generation: AtomicU64,
}

impl ProxyPool {
    pub fn new(sources: Vec<Arc<dyn ProxySource>>, allowed_types: Vec<ProxyType>) -> Self {
        Self {
            proxies: Mutex::new(Vec::new()),
            sources,
            allowed_types,
            generation: AtomicU64::new(0),
        }
    }

    /// Pool over a fixed list, without sources
    pub fn with_proxies(proxies: Vec<Proxy>) -> Self {
        let pool = Self::new(Vec::new(), Vec::new());
        *pool.proxies.lock() = proxies;
        pool
    }

    /// Take the first usable proxy and mark it busy.
    ///
    /// Busy proxies qualify only with `allow_busy`; when `max_uses` is
    /// non-zero, proxies used that many times are skipped.
    pub fn get_proxy(&self, allow_busy: bool, max_uses: u32) -> Option<Proxy> {
        let mut proxies = self.proxies.lock();
        let proxy = proxies.iter_mut().find(|p| {
            let usable = match p.status {
                ProxyStatus::Available => true,
                ProxyStatus::Busy => allow_busy,
                ProxyStatus::Banned | ProxyStatus::Bad => false,
            };
            usable && (max_uses == 0 || p.total_uses < max_uses)
        })?;

        proxy.being_used_by += 1;
        proxy.status = ProxyStatus::Busy;
        proxy.last_used = Some(Utc::now());
        Some(proxy.clone())
    }

    /// Hand a proxy back, banning it when `ban` is set
    pub fn release_proxy(&self, proxy: &Proxy, ban: bool) {
        let mut proxies = self.proxies.lock();
        // A reload may have replaced the list since the proxy was taken
        let Some(entry) = proxies.iter_mut().find(|p| *p == proxy) else {
            debug!(proxy = %proxy, "Released proxy is no longer in the pool");
            return;
        };

        entry.total_uses = entry.total_uses.saturating_add(1);
        entry.being_used_by = entry.being_used_by.saturating_sub(1);

        if ban {
            entry.status = ProxyStatus::Banned;
            entry.last_banned = Some(Utc::now());
        } else if entry.status != ProxyStatus::Banned {
            entry.status = if entry.being_used_by > 0 {
                ProxyStatus::Busy
            } else {
                ProxyStatus::Available
            };
        }
    }

    /// Return every banned proxy to service with fresh usage counters
    pub fn unban_all(&self) -> usize {
        let mut proxies = self.proxies.lock();
        let mut unbanned = 0;
        for proxy in proxies.iter_mut().filter(|p| p.status == ProxyStatus::Banned) {
            proxy.reset_usage();
            unbanned += 1;
        }
        if unbanned > 0 {
            info!(unbanned, "Unbanned all proxies");
        }
        unbanned
    }

    /// Unban proxies banned for longer than `ban_time`
    pub fn unban_expired(&self, ban_time: Duration) -> usize {
        let Ok(ban_time) = chrono::Duration::from_std(ban_time) else {
            return 0;
        };
        let now = Utc::now();

        let mut proxies = self.proxies.lock();
        let mut unbanned = 0;
        for proxy in proxies.iter_mut().filter(|p| p.status == ProxyStatus::Banned) {
            let expired = proxy
                .last_banned
                .map(|banned| now - banned >= ban_time)
                .unwrap_or(true);
            if expired {
                proxy.reset_usage();
                unbanned += 1;
            }
        }
        if unbanned > 0 {
            debug!(unbanned, "Unbanned proxies after ban time");
        }
        unbanned
    }

    /// Replace the content with the deduplicated union of all sources.
    ///
    /// A failing source is skipped; the others still contribute.
    pub async fn reload_all(&self, shuffle: bool, cancel: &CancellationToken) -> Result<usize> {
        let mut seen = HashSet::new();
        let mut fresh = Vec::new();

        for source in &self.sources {
            match source.get_all(cancel).await {
                Ok(proxies) => {
                    for proxy in proxies {
                        if !self.allowed_types.is_empty() && !self.allowed_types.contains(&proxy.proxy_type) {
                            continue;
                        }
                        if seen.insert(proxy.clone()) {
                            fresh.push(proxy);
                        }
                    }
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => warn!("Proxy source failed: {}", e),
            }
        }

        if shuffle {
            fresh.shuffle(&mut rand::thread_rng());
        }

        let count = fresh.len();
        *self.proxies.lock() = fresh;
        self.generation.fetch_add(1, Ordering::AcqRel);

        info!(count, "Proxy pool reloaded");
        Ok(count)
    }

    /// Reload counter, lets waiters detect a reload that happened meanwhile
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn proxies(&self) -> Vec<Proxy> {
        self.proxies.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.proxies.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.lock().is_empty()
    }

    pub fn available_count(&self) -> usize {
        self.proxies
            .lock()
            .iter()
            .filter(|p| p.status == ProxyStatus::Available)
            .count()
    }

    pub fn banned_count(&self) -> usize {
        self.proxies
            .lock()
            .iter()
            .filter(|p| p.status == ProxyStatus::Banned)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::source::StaticProxySource;
    use std::sync::atomic::AtomicUsize;

    fn proxy(last_octet: u8) -> Proxy {
        Proxy::new(format!("10.0.0.{}", last_octet), 8080, ProxyType::Http)
    }

    #[test]
    fn test_max_uses_exhausts_pool() {
        let pool = ProxyPool::with_proxies(vec![proxy(1), proxy(2)]);

        let a = pool.get_proxy(false, 1).unwrap();
        assert_eq!(a, proxy(1));
        pool.release_proxy(&a, false);

        let b = pool.get_proxy(false, 1).unwrap();
        assert_eq!(b, proxy(2));
        pool.release_proxy(&b, false);

        assert!(pool.get_proxy(false, 1).is_none());
    }

    #[test]
    fn test_busy_and_banned_are_skipped() {
        let pool = ProxyPool::with_proxies(vec![proxy(1), proxy(2)]);

        let a = pool.get_proxy(false, 0).unwrap();
        let b = pool.get_proxy(false, 0).unwrap();
        assert_ne!(a, b);
        assert!(pool.get_proxy(false, 0).is_none());

        // Busy proxies are shared only when allowed
        let shared = pool.get_proxy(true, 0).unwrap();
        assert_eq!(shared, a);
        assert_eq!(pool.proxies()[0].being_used_by, 2);

        pool.release_proxy(&a, true);
        pool.release_proxy(&b, false);
        assert_eq!(pool.banned_count(), 1);
        assert_eq!(pool.available_count(), 1);

        // Still banned after the second user leaves
        pool.release_proxy(&shared, false);
        assert_eq!(pool.proxies()[0].status, ProxyStatus::Banned);
        assert_eq!(pool.proxies()[0].being_used_by, 0);
        assert!(pool.proxies()[0].last_banned.is_some());

        assert_eq!(pool.get_proxy(true, 0).unwrap(), b);
    }

    #[test]
    fn test_release_never_underflows() {
        let pool = ProxyPool::with_proxies(vec![proxy(1)]);
        let p = pool.get_proxy(false, 0).unwrap();
        pool.release_proxy(&p, false);
        pool.release_proxy(&p, false);

        let state = &pool.proxies()[0];
        assert_eq!(state.being_used_by, 0);
        assert_eq!(state.total_uses, 2);
        assert_eq!(state.status, ProxyStatus::Available);
    }

    #[test]
    fn test_unban_all_resets_usage() {
        let pool = ProxyPool::with_proxies(vec![proxy(1), proxy(2)]);
        let a = pool.get_proxy(false, 0).unwrap();
        pool.release_proxy(&a, true);

        assert_eq!(pool.unban_all(), 1);
        let state = &pool.proxies()[0];
        assert_eq!(state.status, ProxyStatus::Available);
        assert_eq!(state.total_uses, 0);
    }

    #[test]
    fn test_unban_expired_respects_ban_time() {
        let pool = ProxyPool::with_proxies(vec![proxy(1), proxy(2)]);
        let a = pool.get_proxy(false, 0).unwrap();
        pool.release_proxy(&a, true);

        assert_eq!(pool.unban_expired(Duration::from_secs(3600)), 0);
        assert_eq!(pool.unban_expired(Duration::ZERO), 1);
        assert_eq!(pool.banned_count(), 0);
    }

    #[test]
    fn test_concurrent_allocation_never_double_books() {
        let proxies: Vec<Proxy> = (1..=20).map(proxy).collect();
        let pool = Arc::new(ProxyPool::with_proxies(proxies));
        let taken = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let taken = taken.clone();
                std::thread::spawn(move || {
                    while pool.get_proxy(false, 0).is_some() {
                        taken.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(taken.load(Ordering::SeqCst), 20);
        assert!(pool.proxies().iter().all(|p| p.being_used_by == 1));
    }

    #[tokio::test]
    async fn test_reload_dedupes_and_filters() {
        let first: Arc<dyn ProxySource> = Arc::new(StaticProxySource::new(vec![
            proxy(1),
            proxy(2),
            Proxy::new("10.0.0.9", 1080, ProxyType::Socks5),
        ]));
        let second: Arc<dyn ProxySource> = Arc::new(StaticProxySource::new(vec![proxy(2), proxy(3)]));

        let pool = ProxyPool::new(vec![first, second], vec![ProxyType::Http]);
        assert_eq!(pool.generation(), 0);

        let count = pool.reload_all(true, &CancellationToken::new()).await.unwrap();
        assert_eq!(count, 3);
        assert_eq!(pool.generation(), 1);

        let mut hosts: Vec<String> = pool.proxies().into_iter().map(|p| p.host).collect();
        hosts.sort();
        assert_eq!(hosts, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    }
}
