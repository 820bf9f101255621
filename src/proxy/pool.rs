//! The proxy pool: a free queue of leasable endpoints refilled on demand from
//! a [`ProxyLoader`].

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::proxy::entry::{ProxyEntry, ProxyInfo, ProxyStatus};
use crate::proxy::loader::ProxyLoader;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Aggregate counters over every proxy the pool knows about.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProxyStats {
    pub total: usize,
    pub free: usize,
    pub leased: usize,
    pub retired: usize,
    pub banned: usize,
    pub banned_hosts: usize,
    pub success_pages: u64,
    pub failed_pages: u64,
}

#[derive(Default)]
struct PoolState {
    free: VecDeque<Arc<ProxyEntry>>,
    entries: HashMap<String, Arc<ProxyEntry>>,
    banned_hosts: HashSet<String>,
}

pub struct ProxyPool {
    loader: Box<dyn ProxyLoader>,
    state: Mutex<PoolState>,
    available: Notify,
    active: AtomicBool,
    poll_timeout: Duration,
    max_retries: usize,
    reload_interval: Duration,
}

impl ProxyPool {
    pub fn new(
        loader: Box<dyn ProxyLoader>,
        poll_timeout: Duration,
        max_retries: usize,
        reload_interval: Duration,
    ) -> Self {
        Self {
            loader,
            state: Mutex::new(PoolState::default()),
            available: Notify::new(),
            active: AtomicBool::new(true),
            poll_timeout,
            max_retries: max_retries.max(1),
            reload_interval,
        }
    }

    pub fn from_config(loader: Box<dyn ProxyLoader>, config: &PoolConfig) -> Self {
        Self::new(
            loader,
            config.proxy_poll_timeout,
            config.proxy_max_retries,
            config.proxy_reload_interval,
        )
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Add fresh proxies to the free queue. Entries already tracked or whose
    /// host was banned are ignored. Returns how many were added.
    pub fn offer(&self, proxies: Vec<ProxyEntry>) -> usize {
        let mut added = 0;
        {
            let mut state = self.state.lock();
            for proxy in proxies {
                if state.banned_hosts.contains(&proxy.host) {
                    debug!(proxy = %proxy.key(), "Ignoring proxy on banned host");
                    continue;
                }
                let key = proxy.key();
                if state.entries.contains_key(&key) {
                    continue;
                }
                let proxy = Arc::new(proxy);
                state.entries.insert(key, proxy.clone());
                state.free.push_back(proxy);
                added += 1;
            }
        }
        for _ in 0..added {
            self.available.notify_one();
        }
        added
    }

    /// Lease a proxy. Each attempt refreshes the pool when the free queue is
    /// empty and then polls once with the configured timeout. `None` after
    /// `max_retries` attempts, or as soon as the pool is shut down.
    pub async fn take(&self) -> Option<Arc<ProxyEntry>> {
        for attempt in 1..=self.max_retries {
            if !self.is_active() {
                return None;
            }

            if self.free_count() == 0 {
                let batch = self.loader.update_proxies(self.reload_interval).await;
                if !batch.is_empty() {
                    self.offer(batch);
                }
            }

            if let Some(proxy) = self.poll(self.poll_timeout).await {
                debug!(proxy = %proxy.key(), attempt, "Leased proxy");
                return Some(proxy);
            }
            debug!(attempt, max = self.max_retries, "No proxy available yet");
        }

        warn!(attempts = self.max_retries, "Gave up waiting for a proxy");
        None
    }

    /// Wait up to `timeout` for a leasable entry on the free queue.
    async fn poll(&self, timeout: Duration) -> Option<Arc<ProxyEntry>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(proxy) = self.pop_free() {
                return Some(proxy);
            }
            if !self.is_active() {
                return None;
            }
            if tokio::time::timeout_at(deadline, self.available.notified())
                .await
                .is_err()
            {
                return None;
            }
        }
    }

    fn pop_free(&self) -> Option<Arc<ProxyEntry>> {
        let mut state = self.state.lock();
        while let Some(proxy) = state.free.pop_front() {
            if proxy.is_banned() || state.banned_hosts.contains(&proxy.host) {
                continue;
            }
            if proxy.is_expired() {
                proxy.retire();
                debug!(proxy = %proxy.key(), "Retired expired proxy");
                continue;
            }
            if proxy.lease() {
                return Some(proxy);
            }
        }
        None
    }

    /// Return a leased proxy to the free queue.
    pub fn release(&self, proxy: &Arc<ProxyEntry>) {
        if proxy.status() != ProxyStatus::Leased {
            return;
        }
        if proxy.set_free() {
            self.state.lock().free.push_back(proxy.clone());
            self.available.notify_one();
        }
    }

    /// Take a proxy out of rotation without forgetting it; `recover` may
    /// bring it back.
    pub fn retire(&self, proxy: &Arc<ProxyEntry>) {
        if proxy.retire() {
            self.state.lock().free.retain(|p| !Arc::ptr_eq(p, proxy));
            debug!(proxy = %proxy.key(), "Retired proxy");
        }
    }

    /// Ban a proxy permanently, together with its host.
    pub fn ban(&self, proxy: &Arc<ProxyEntry>) {
        proxy.ban();
        {
            let mut state = self.state.lock();
            state.banned_hosts.insert(proxy.host.clone());
            state.free.retain(|p| p.host != proxy.host);
        }
        self.report(proxy);
    }

    /// Log what a proxy served before it was banned.
    fn report(&self, proxy: &ProxyEntry) {
        info!(
            proxy = %proxy.key(),
            success_pages = proxy.num_success_pages(),
            failed_pages = proxy.num_failed_pages(),
            uptime_mins = proxy.uptime().num_minutes(),
            "Proxy banned"
        );
    }

    /// Test up to `limit` retired, unexpired proxies and return the reachable
    /// ones to the free queue.
    pub async fn recover(&self, limit: usize) -> usize {
        let candidates: Vec<_> = {
            let state = self.state.lock();
            state
                .entries
                .values()
                .filter(|p| p.is_retired() && !p.is_expired())
                .filter(|p| !state.banned_hosts.contains(&p.host))
                .take(limit)
                .cloned()
                .collect()
        };

        let mut recovered = 0;
        for proxy in candidates {
            if proxy.can_connect(CONNECT_TIMEOUT).await && proxy.set_free() {
                self.state.lock().free.push_back(proxy.clone());
                self.available.notify_one();
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!(recovered, "Recovered retired proxies");
        }
        recovered
    }

    pub fn stats(&self) -> ProxyStats {
        let state = self.state.lock();
        let mut stats = ProxyStats {
            total: state.entries.len(),
            banned_hosts: state.banned_hosts.len(),
            ..Default::default()
        };
        for proxy in state.entries.values() {
            match proxy.status() {
                ProxyStatus::Free => stats.free += 1,
                ProxyStatus::Leased => stats.leased += 1,
                ProxyStatus::Retired => stats.retired += 1,
                ProxyStatus::Banned => stats.banned += 1,
            }
            stats.success_pages += proxy.num_success_pages();
            stats.failed_pages += proxy.num_failed_pages();
        }
        stats
    }

    pub fn list(&self) -> Vec<ProxyInfo> {
        self.state
            .lock()
            .entries
            .values()
            .map(|p| ProxyInfo::from(p.as_ref()))
            .collect()
    }

    /// Stop handing out proxies and wake every waiter.
    pub fn shutdown(&self) {
        self.active.store(false, Ordering::Release);
        self.available.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct CountingEmptyLoader(Arc<AtomicUsize>);

    #[async_trait]
    impl ProxyLoader for CountingEmptyLoader {
        async fn update_proxies(&self, _reload_interval: Duration) -> Vec<ProxyEntry> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Vec::new()
        }
    }

    fn pool_with(loader: impl ProxyLoader + 'static) -> ProxyPool {
        ProxyPool::new(
            Box::new(loader),
            Duration::from_millis(5),
            10,
            Duration::ZERO,
        )
    }

    #[tokio::test]
    async fn test_take_gives_up_after_exactly_max_retries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pool = pool_with(CountingEmptyLoader(calls.clone()));

        assert!(pool.take().await.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_take_returns_none_when_inactive() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pool = pool_with(CountingEmptyLoader(calls.clone()));
        pool.shutdown();

        assert!(pool.take().await.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_lease_release_cycle() {
        let pool = pool_with(CountingEmptyLoader(Arc::default()));
        pool.offer(vec![ProxyEntry::new("10.0.0.1", 80)]);

        let proxy = pool.take().await.unwrap();
        assert_eq!(proxy.status(), ProxyStatus::Leased);
        assert_eq!(pool.free_count(), 0);

        pool.release(&proxy);
        assert_eq!(proxy.status(), ProxyStatus::Free);
        assert_eq!(pool.take().await.unwrap().key(), "10.0.0.1:80");
    }

    #[tokio::test]
    async fn test_banned_host_is_never_reissued() {
        let pool = pool_with(CountingEmptyLoader(Arc::default()));
        pool.offer(vec![ProxyEntry::new("10.0.0.1", 80)]);

        let proxy = pool.take().await.unwrap();
        pool.ban(&proxy);
        pool.release(&proxy);

        assert_eq!(pool.offer(vec![ProxyEntry::new("10.0.0.1", 81)]), 0);
        assert!(pool.take().await.is_none());

        let stats = pool.stats();
        assert_eq!(stats.banned, 1);
        assert_eq!(stats.banned_hosts, 1);
    }

    #[tokio::test]
    async fn test_expired_proxy_is_retired_not_leased() {
        let pool = pool_with(CountingEmptyLoader(Arc::default()));
        let stale = ProxyEntry::new("10.0.0.1", 80)
            .with_declared_ttl(Some(chrono::Utc::now() - chrono::Duration::seconds(5)));
        pool.offer(vec![stale]);

        assert!(pool.take().await.is_none());
        assert_eq!(pool.stats().retired, 1);
    }

    #[tokio::test]
    async fn test_waiter_wakes_when_proxy_is_released() {
        let pool = Arc::new(ProxyPool::new(
            Box::new(CountingEmptyLoader(Arc::default())),
            Duration::from_secs(5),
            1,
            Duration::ZERO,
        ));
        pool.offer(vec![ProxyEntry::new("10.0.0.1", 80)]);
        let held = pool.take().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.take().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.release(&held);

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.key(), "10.0.0.1:80");
    }

    #[tokio::test]
    async fn test_recover_returns_reachable_retired_proxy() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let pool = pool_with(CountingEmptyLoader(Arc::default()));
        pool.offer(vec![ProxyEntry::new("127.0.0.1", port)]);
        let proxy = pool.take().await.unwrap();
        pool.retire(&proxy);
        assert_eq!(pool.free_count(), 0);

        assert_eq!(pool.recover(10).await, 1);
        assert_eq!(proxy.status(), ProxyStatus::Free);
        assert_eq!(pool.free_count(), 1);
    }
}
