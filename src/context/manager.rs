//! Policy over the context pool: which context serves a task, when contexts
//! are created, and when they are retired.

use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::pool::{PoolSnapshot, PrivacyContextPool};
use super::PrivacyContext;
use crate::agent::{AgentRequirement, PrivacyAgent, SequentialRoster};
use crate::browser_files::ProfileDirectoryAllocator;
use crate::config::{PoolConfig, ProxySourceConfig};
use crate::driver::{BrowserLauncher, WebDriverPoolManager};
use crate::error::{DirError, PoolError};
use crate::fingerprint::{BrowserKind, Fingerprint};
use crate::proxy::{loader_from_config, ProxyInfo, ProxyPool, ProxyStats};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(15);
const PROXY_RECOVER_BATCH: usize = 10;

/// Callback run every time a context is retired.
pub type RetireHook = Box<dyn Fn(&PrivacyContext) + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct ManagerSnapshot {
    pub active: bool,
    pub contexts: PoolSnapshot,
    pub proxies: Option<ProxyStats>,
    pub proxy_entries: Vec<ProxyInfo>,
    pub browsers: usize,
}

pub struct PrivacyContextManager {
    config: PoolConfig,
    pool: Arc<PrivacyContextPool>,
    drivers: Arc<WebDriverPoolManager>,
    proxies: Option<Arc<ProxyPool>>,
    dirs: Arc<ProfileDirectoryAllocator>,
    roster: SequentialRoster,
    hooks: Mutex<Vec<RetireHook>>,
    capacity: Arc<Notify>,
    active: AtomicBool,
    round_robin: AtomicUsize,
    shutdown: CancellationToken,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl PrivacyContextManager {
    /// Build a manager with the proxy source named in `config`.
    pub fn new(config: PoolConfig, launcher: Arc<dyn BrowserLauncher>) -> Result<Arc<Self>, PoolError> {
        let proxies = match &config.proxy_source {
            ProxySourceConfig::None => None,
            source => Some(Arc::new(ProxyPool::from_config(loader_from_config(source), &config))),
        };
        Self::with_proxy_pool(config, launcher, proxies)
    }

    pub fn with_proxy_pool(
        config: PoolConfig,
        launcher: Arc<dyn BrowserLauncher>,
        proxies: Option<Arc<ProxyPool>>,
    ) -> Result<Arc<Self>, PoolError> {
        config.validate()?;
        let drivers = Arc::new(WebDriverPoolManager::new(
            launcher,
            config.max_open_tabs,
            config.driver_acquire_timeout,
        ));
        Ok(Arc::new(Self {
            pool: Arc::new(PrivacyContextPool::new(
                config.allowed_privacy_context_count,
                config.context_close_grace,
            )),
            drivers,
            proxies,
            dirs: Arc::new(ProfileDirectoryAllocator::new(
                &config.context_tmp_dir,
                config.file_lock_timeout,
            )),
            roster: SequentialRoster::new(config.max_sequential_agents),
            hooks: Mutex::new(Vec::new()),
            capacity: Arc::new(Notify::new()),
            active: AtomicBool::new(true),
            round_robin: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
            maintenance: Mutex::new(None),
            config,
        }))
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<PrivacyContextPool> {
        &self.pool
    }

    pub fn drivers(&self) -> &Arc<WebDriverPoolManager> {
        &self.drivers
    }

    pub fn proxies(&self) -> Option<&Arc<ProxyPool>> {
        self.proxies.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Register a callback run, in registration order, on every retirement.
    pub fn add_retire_hook<F>(&self, hook: F)
    where
        F: Fn(&PrivacyContext) + Send + Sync + 'static,
    {
        self.hooks.lock().push(Box::new(hook));
    }

    /// Resolve a requirement to a live, active context.
    pub async fn acquire(&self, requirement: &AgentRequirement) -> Result<Arc<PrivacyContext>, PoolError> {
        if !self.is_active() {
            return Err(PoolError::Inactive);
        }

        match requirement {
            AgentRequirement::Specific(agent) => self.get_or_create(agent).await,
            AgentRequirement::NextSequential => {
                let seq = self.roster.next_seq();
                let dirs = self.dirs.clone();
                let dir = blocking_dir(move || dirs.sequential_dir(seq)).await?;
                let agent = PrivacyAgent::sequential(seq, dir, Fingerprint::random(BrowserKind::Chrome));
                self.get_or_create(&agent).await
            }
            AgentRequirement::AnyTemporary => {
                if !self.pool.has_capacity() {
                    if let Some(context) = self.next_temporary() {
                        return Ok(context);
                    }
                }

                let dirs = self.dirs.clone();
                let dir = blocking_dir(move || dirs.allocate_next()).await?;
                let agent = PrivacyAgent::temporary(dir.clone(), Fingerprint::random(BrowserKind::Chrome));
                match self.get_or_create(&agent).await {
                    Ok(context) => Ok(context),
                    Err(e) => {
                        // Nothing was launched in it; an empty dir is safe to drop.
                        if let Err(rm) = std::fs::remove_dir(&dir) {
                            debug!(dir = %dir.display(), error = %rm, "Could not remove unused context dir");
                        }
                        match self.next_temporary() {
                            Some(context) => Ok(context),
                            None => Err(e),
                        }
                    }
                }
            }
        }
    }

    /// Round robin over active temporary contexts.
    fn next_temporary(&self) -> Option<Arc<PrivacyContext>> {
        let mut candidates: Vec<_> = self
            .pool
            .temporary_contexts()
            .into_iter()
            .filter(|c| c.agent().is_temporary() && c.is_active())
            .collect();
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_by(|a, b| a.id().cmp(b.id()));
        let i = self.round_robin.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(candidates.swap_remove(i))
    }

    /// Get or create the context for `agent`. Inactive contexts are retired
    /// and replaced. At capacity, dying contexts are reclaimed and the call
    /// waits up to the acquire timeout before failing with `Saturated`.
    ///
    /// Every wait, including closing predecessors, is bounded by the acquire
    /// timeout.
    async fn get_or_create(&self, agent: &PrivacyAgent) -> Result<Arc<PrivacyContext>, PoolError> {
        let deadline = Instant::now() + self.config.context_acquire_timeout;
        loop {
            let notified = self.capacity.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // A profile directory is locked by one browser process, so a
            // replacement must wait for its predecessor's browser to exit.
            if agent.context_dir.is_some() && self.pool.is_dying(&agent.id) {
                let drained = self.drain_until(deadline).await.is_some();
                if self.pool.is_dying(&agent.id) {
                    // Closed by another task, which notifies capacity when done.
                    if drained && tokio::time::timeout_at(deadline, notified.as_mut()).await.is_ok() {
                        continue;
                    }
                    warn!(
                        agent = %agent.display(),
                        waited = ?self.config.context_acquire_timeout,
                        "Previous context for this profile is still closing"
                    );
                    return Err(self.saturated());
                }
            }

            match self.pool.get_or_create(agent, |a| self.new_context(a)) {
                Ok(context) if context.is_active() => return Ok(context),
                Ok(context) => {
                    debug!(context = %context, "Replacing inactive privacy context");
                    self.retire_quietly(&context)?;
                    if context.is_browser_crashed() {
                        let crashed = context.clone();
                        if finish_by(deadline, async move { crashed.force_close().await })
                            .await
                            .is_none()
                        {
                            return Err(self.saturated());
                        }
                    }
                }
                Err(PoolError::Saturated { active, allowed }) => {
                    if self.pool.zombie_count() > 0 {
                        self.drain_until(deadline).await;
                    }
                    if self.pool.has_capacity() {
                        continue;
                    }
                    if tokio::time::timeout_at(deadline, notified.as_mut()).await.is_err() {
                        warn!(
                            agent = %agent.display(),
                            active,
                            allowed,
                            waited = ?self.config.context_acquire_timeout,
                            "Privacy context pool saturated"
                        );
                        return Err(PoolError::Saturated { active, allowed });
                    }
                }
                Err(e) => return Err(e),
            }

            if !self.is_active() {
                return Err(PoolError::Inactive);
            }
        }
    }

    /// Close dying contexts, giving up at `deadline`. Returns how many were
    /// closed, or `None` if the drain missed the deadline; it then keeps
    /// running in the background.
    async fn drain_until(&self, deadline: Instant) -> Option<usize> {
        let pool = self.pool.clone();
        let closed = finish_by(deadline, async move { pool.close_dying_contexts().await }).await?;
        let closed = closed.unwrap_or(0);
        if closed > 0 {
            self.capacity.notify_waiters();
        }
        Some(closed)
    }

    fn saturated(&self) -> PoolError {
        PoolError::Saturated {
            active: self.pool.active_context_count(),
            allowed: self.pool.allowed(),
        }
    }

    fn new_context(&self, agent: &PrivacyAgent) -> PrivacyContext {
        PrivacyContext::new(
            agent.clone(),
            self.drivers.clone(),
            self.proxies.clone(),
            self.config.privacy_max_warnings,
        )
    }

    /// Retire a context and close it in the background. Crashed contexts are
    /// force closed.
    pub fn retire(&self, context: &Arc<PrivacyContext>) -> Result<(), PoolError> {
        self.retire_quietly(context)?;

        let pool = self.pool.clone();
        let capacity = self.capacity.clone();
        let crashed = context.is_browser_crashed().then(|| context.clone());
        tokio::spawn(async move {
            if let Some(context) = crashed {
                context.force_close().await;
            }
            pool.close_dying_contexts().await;
            capacity.notify_waiters();
        });
        Ok(())
    }

    /// Retire without scheduling a drain.
    fn retire_quietly(&self, context: &Arc<PrivacyContext>) -> Result<(), PoolError> {
        self.pool.retire(context)?;
        self.run_hooks(context);
        self.capacity.notify_waiters();
        Ok(())
    }

    fn run_hooks(&self, context: &PrivacyContext) {
        for hook in self.hooks.lock().iter() {
            hook(context);
        }
    }

    /// Retire inactive, idle and failing contexts, then close retired ones.
    pub async fn maintain(&self) {
        let idle_timeout = self.config.privacy_context_idle_timeout;
        let mut crashed = Vec::new();

        for context in self.pool.active_contexts() {
            let reason = if context.is_browser_crashed() {
                crashed.push(context.clone());
                "browser crashed"
            } else if !context.is_active() {
                "inactive"
            } else if !context.is_permanent() && context.is_idle(idle_timeout) {
                "idle"
            } else if context.is_high_failure_rate() {
                "high failure rate"
            } else {
                continue;
            };

            info!(context = %context.readable_state(), reason, "Retiring privacy context");
            if let Err(e) = self.retire_quietly(&context) {
                error!(context = %context, error = %e, "Failed to retire context");
            }
        }

        for context in crashed {
            context.force_close().await;
        }
        let closed = self.pool.close_dying_contexts().await;
        if closed > 0 {
            self.capacity.notify_waiters();
        }
    }

    /// Spawn the periodic maintenance loop. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.maintenance.lock();
        if slot.is_some() {
            return;
        }

        let manager = self.clone();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = manager.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.maintain().await;
                        manager.reclaim_dirs().await;
                        if let Some(proxies) = &manager.proxies {
                            proxies.recover(PROXY_RECOVER_BATCH).await;
                        }
                    }
                }
            }
            debug!("Maintenance loop stopped");
        }));
        info!(
            allowed = self.config.allowed_privacy_context_count,
            max_open_tabs = self.config.max_open_tabs,
            proxies = self.proxies.is_some(),
            "Privacy context manager started"
        );
    }

    async fn reclaim_dirs(&self) {
        let dirs = self.dirs.clone();
        let expiry = self.config.context_tmp_dir_expiry;
        match blocking_dir(move || dirs.reclaim_expired(expiry)).await {
            Ok(n) if n > 0 => debug!(reclaimed = n, "Reclaimed context dirs"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Context dir reclaim failed"),
        }
    }

    /// Retire and close every live context. The manager stays usable.
    pub async fn reset(&self, reason: &str) {
        let retired = self.pool.retire_all();
        info!(reason, contexts = retired.len(), "Resetting privacy contexts");
        for context in &retired {
            self.run_hooks(context);
        }
        self.capacity.notify_waiters();
        self.pool.close_dying_contexts().await;
        self.capacity.notify_waiters();
    }

    /// Stop maintenance, refuse new work, and close every context and browser.
    pub async fn shutdown(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        self.capacity.notify_waiters();
        if let Some(proxies) = &self.proxies {
            proxies.shutdown();
        }

        let handle = self.maintenance.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Maintenance loop ended abnormally");
            }
        }

        self.reset("shutdown").await;
        self.drivers.close_all().await;
        info!("Privacy context manager shut down");
    }

    pub fn snapshot(&self) -> ManagerSnapshot {
        ManagerSnapshot {
            active: self.is_active(),
            contexts: self.pool.snapshot(),
            proxies: self.proxies.as_ref().map(|p| p.stats()),
            proxy_entries: self.proxies.as_ref().map(|p| p.list()).unwrap_or_default(),
            browsers: self.drivers.browser_count(),
        }
    }
}

/// Run `work` as its own task and wait for it until `deadline`. A task that
/// misses the deadline is left running, so no close is abandoned half way.
/// `None` means the deadline passed; `Some(None)` means the task failed.
async fn finish_by<F>(deadline: Instant, work: F) -> Option<Option<F::Output>>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match tokio::time::timeout_at(deadline, tokio::spawn(work)).await {
        Ok(Ok(output)) => Some(Some(output)),
        Ok(Err(e)) => {
            warn!(error = %e, "Privacy context close task failed");
            Some(None)
        }
        Err(_) => None,
    }
}

async fn blocking_dir<T, F>(f: F) -> Result<T, DirError>
where
    F: FnOnce() -> Result<T, DirError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DirError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}
