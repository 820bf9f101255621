//! Privacy contexts: one identity, at most one proxy, one browser and its
//! driver pool. All browser work goes through [`PrivacyContext::run`].

pub mod manager;
pub mod pool;

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{AgentKind, BrowserId, PrivacyAgent, PrivacyAgentId};
use crate::driver::{WebDriver, WebDriverPoolManager};
use crate::error::{FetchError, ProxyError};
use crate::fetch::FetchTask;
use crate::fingerprint::Fingerprint;
use crate::proxy::{ProxyEntry, ProxyPool};

pub use manager::{PrivacyContextManager, RetireHook};
pub use pool::{PoolSnapshot, PrivacyContextPool};

/// Minor warnings that add up to one leak warning.
const MINOR_WARNINGS_PER_WARNING: u32 = 5;
const HIGH_FAILURE_MIN_TASKS: u64 = 100;
const HIGH_FAILURE_RATE: f64 = 0.6;
/// Consecutive proxy failures that count as one leak warning.
const PROXY_FAILURE_STREAK: u32 = 5;
/// How long cancelled runs get to unwind before the browser is closed.
const CANCEL_UNWIND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextState {
    Ready,
    Active,
    Leaked,
    Retired,
    Closing,
    Closed,
}

impl ContextState {
    /// Whether new runs are admitted.
    pub fn accepts_tasks(&self) -> bool {
        matches!(self, ContextState::Ready | ContextState::Active)
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContextState::Ready => "ready",
            ContextState::Active => "active",
            ContextState::Leaked => "leaked",
            ContextState::Retired => "retired",
            ContextState::Closing => "closing",
            ContextState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Default)]
struct Health {
    tasks: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    small_pages: AtomicU64,
}

/// Serializable view of one context.
#[derive(Debug, Clone, Serialize)]
pub struct ContextSnapshot {
    pub id: String,
    pub serial: u64,
    pub kind: AgentKind,
    pub state: ContextState,
    pub running: usize,
    pub tasks: u64,
    pub successes: u64,
    pub failures: u64,
    pub small_pages: u64,
    pub leak_warnings: u32,
    pub proxy: Option<String>,
    pub elapsed_secs: u64,
    pub idle_secs: u64,
}

pub struct PrivacyContext {
    agent: PrivacyAgent,
    /// Distinguishes this context's browser from any other context's with the same agent id.
    serial: u64,
    fingerprint: Mutex<Fingerprint>,
    browser_id: Mutex<Option<BrowserId>>,
    proxy: Mutex<Option<Arc<ProxyEntry>>>,
    bind_lock: tokio::sync::Mutex<()>,
    state: Mutex<ContextState>,
    running: AtomicUsize,
    drained: Notify,
    cancel: CancellationToken,
    leak_warnings: AtomicU32,
    minor_warnings: AtomicU32,
    max_warnings: u32,
    health: Health,
    created_at: Instant,
    last_active: Mutex<Instant>,
    drivers: Arc<WebDriverPoolManager>,
    proxies: Option<Arc<ProxyPool>>,
}

/// Keeps `running` accurate however a run ends.
struct RunGuard<'a> {
    context: &'a PrivacyContext,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        *self.context.last_active.lock() = Instant::now();
        if self.context.running.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.context.drained.notify_waiters();
        }
    }
}

impl PrivacyContext {
    pub fn new(
        agent: PrivacyAgent,
        drivers: Arc<WebDriverPoolManager>,
        proxies: Option<Arc<ProxyPool>>,
        max_warnings: u32,
    ) -> Self {
        let now = Instant::now();
        Self {
            fingerprint: Mutex::new(agent.fingerprint.clone()),
            agent,
            serial: BrowserId::next_serial(),
            browser_id: Mutex::new(None),
            proxy: Mutex::new(None),
            bind_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(ContextState::Ready),
            running: AtomicUsize::new(0),
            drained: Notify::new(),
            cancel: CancellationToken::new(),
            leak_warnings: AtomicU32::new(0),
            minor_warnings: AtomicU32::new(0),
            max_warnings: max_warnings.max(1),
            health: Health::default(),
            created_at: now,
            last_active: Mutex::new(now),
            drivers,
            proxies,
        }
    }

    pub fn id(&self) -> &PrivacyAgentId {
        &self.agent.id
    }

    pub fn agent(&self) -> &PrivacyAgent {
        &self.agent
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn is_permanent(&self) -> bool {
        self.agent.is_permanent()
    }

    /// The fingerprint in effect, including a lazily bound proxy.
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint.lock().clone()
    }

    pub fn proxy(&self) -> Option<Arc<ProxyEntry>> {
        self.proxy.lock().clone()
    }

    pub fn browser_id(&self) -> Option<BrowserId> {
        self.browser_id.lock().clone()
    }

    pub fn state(&self) -> ContextState {
        *self.state.lock()
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ContextState::Closed
    }

    pub fn is_leaked(&self) -> bool {
        self.state() == ContextState::Leaked
    }

    /// The browser was launched and has since died.
    pub fn is_browser_crashed(&self) -> bool {
        match self.browser_id() {
            Some(id) => self.drivers.has_browser(&id) && !self.drivers.is_browser_alive(&id),
            None => false,
        }
    }

    /// Accepting tasks with a healthy browser.
    pub fn is_active(&self) -> bool {
        self.state().accepts_tasks() && !self.is_browser_crashed()
    }

    /// Run `work` with a driver of this context's browser.
    ///
    /// The task's timeout cancels only this run; the driver is recycled and the
    /// context keeps serving. Closing the context cancels every in-flight run
    /// with `ContextClosed`.
    pub async fn run<F, Fut, T>(&self, task: &FetchTask, work: F) -> Result<T, FetchError>
    where
        F: FnOnce(Arc<dyn WebDriver>) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let _guard = self.enter()?;

        let body = async {
            let browser_id = self.ensure_bound().await?;
            if let Some(proxy) = self.proxy().filter(|p| p.is_banned()) {
                return Err(ProxyError::Banned(proxy.key()).into());
            }
            let lease = self.drivers.acquire(&browser_id).await?;
            let driver = lease.driver().clone();
            let result = match tokio::time::timeout(task.timeout, work(driver)).await {
                Ok(result) => result,
                Err(_) => {
                    debug!(task = %task.id, context = %self.agent.display(), "Task timed out");
                    Err(FetchError::Timeout(task.timeout))
                }
            };
            self.drivers.release(lease).await;
            result
        };

        tokio::select! {
            _ = self.cancel.cancelled() => Err(FetchError::ContextClosed(self.agent.id.to_string())),
            result = body => result,
        }
    }

    fn enter(&self) -> Result<RunGuard<'_>, FetchError> {
        let mut state = self.state.lock();
        match *state {
            ContextState::Ready | ContextState::Active => {
                *state = ContextState::Active;
                self.running.fetch_add(1, Ordering::AcqRel);
                Ok(RunGuard { context: self })
            }
            ContextState::Leaked => Err(FetchError::ContextLeaked(self.agent.id.to_string())),
            _ => Err(FetchError::ContextClosed(self.agent.id.to_string())),
        }
    }

    /// Bind a proxy on first use and fix the browser identity. Later calls
    /// return the same identity.
    async fn ensure_bound(&self) -> Result<BrowserId, FetchError> {
        if let Some(id) = self.browser_id() {
            return Ok(id);
        }

        let _bind = self.bind_lock.lock().await;
        if let Some(id) = self.browser_id() {
            return Ok(id);
        }

        if let Some(proxies) = &self.proxies {
            if !self.fingerprint.lock().has_proxy() {
                let proxy = proxies.take().await.ok_or(ProxyError::Unavailable)?;
                self.fingerprint.lock().bind_proxy(&proxy)?;
                info!(context = %self.agent.display(), proxy = %proxy.key(), "Bound proxy");
                *self.proxy.lock() = Some(proxy);
            }
        }

        let id = BrowserId {
            agent_id: self.agent.id.clone(),
            serial: self.serial,
            fingerprint: self.fingerprint(),
            context_dir: self.agent.context_dir.clone(),
        };
        *self.browser_id.lock() = Some(id.clone());
        Ok(id)
    }

    /// Flag the identity as detected. New runs are refused; in-flight runs
    /// finish. Permanent contexts never leak.
    pub fn mark_leaked(&self) -> bool {
        if self.is_permanent() {
            debug!(context = %self.agent.display(), "Permanent context can not leak");
            return false;
        }
        let mut state = self.state.lock();
        if state.accepts_tasks() {
            *state = ContextState::Leaked;
            warn!(
                context = %self.agent.display(),
                warnings = self.leak_warnings.load(Ordering::Relaxed),
                "Privacy context leaked"
            );
            true
        } else {
            false
        }
    }

    /// Add a leak warning, marking the context leaked at the threshold.
    pub fn warn_leak(&self) {
        let warnings = self.leak_warnings.fetch_add(1, Ordering::AcqRel) + 1;
        if warnings >= self.max_warnings {
            self.mark_leaked();
        }
    }

    /// Retryable trouble, e.g. network errors. Counts as a fraction of a warning.
    pub fn warn_minor(&self) {
        let minor = self.minor_warnings.fetch_add(1, Ordering::AcqRel) + 1;
        if minor % MINOR_WARNINGS_PER_WARNING == 0 {
            self.warn_leak();
        }
    }

    pub fn leak_warnings(&self) -> u32 {
        self.leak_warnings.load(Ordering::Acquire)
    }

    pub fn record_success(&self, small_page: bool) {
        self.health.tasks.fetch_add(1, Ordering::Relaxed);
        self.health.successes.fetch_add(1, Ordering::Relaxed);
        if small_page {
            self.health.small_pages.fetch_add(1, Ordering::Relaxed);
        }
        let _ = self
            .leak_warnings
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| w.checked_sub(1));
        if let Some(proxy) = self.proxy() {
            proxy.mark_success();
        }
    }

    pub fn record_failure(&self) {
        self.health.tasks.fetch_add(1, Ordering::Relaxed);
        self.health.failures.fetch_add(1, Ordering::Relaxed);
        if let Some(proxy) = self.proxy() {
            let streak = proxy.mark_failure();
            if streak % PROXY_FAILURE_STREAK == 0 {
                warn!(
                    context = %self.agent.display(),
                    proxy = %proxy.key(),
                    streak,
                    "Proxy keeps failing"
                );
                self.warn_leak();
            }
        }
    }

    pub fn failure_rate(&self) -> f64 {
        let tasks = self.health.tasks.load(Ordering::Relaxed);
        if tasks == 0 {
            return 0.0;
        }
        self.health.failures.load(Ordering::Relaxed) as f64 / tasks as f64
    }

    pub fn is_high_failure_rate(&self) -> bool {
        self.health.tasks.load(Ordering::Relaxed) > HIGH_FAILURE_MIN_TASKS
            && self.failure_rate() > HIGH_FAILURE_RATE
    }

    /// No run started or finished within `timeout`, and none in flight.
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.running() == 0 && self.last_active.lock().elapsed() > timeout
    }

    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn successes(&self) -> u64 {
        self.health.successes.load(Ordering::Relaxed)
    }

    /// Pool bookkeeping: the context left the live maps.
    pub(crate) fn dismiss(&self) {
        let mut state = self.state.lock();
        if matches!(
            *state,
            ContextState::Ready | ContextState::Active | ContextState::Leaked
        ) {
            *state = ContextState::Retired;
        }
    }

    /// Wait up to `grace` for in-flight runs, cancel the rest, then close the
    /// browser and hand back the proxy. Best effort: never fails.
    pub async fn close(&self, grace: Duration) {
        {
            let mut state = self.state.lock();
            if matches!(*state, ContextState::Closing | ContextState::Closed) {
                return;
            }
            *state = ContextState::Closing;
        }

        if tokio::time::timeout(grace, self.wait_drained()).await.is_err() {
            warn!(
                context = %self.agent.display(),
                running = self.running(),
                "Cancelling runs still in flight"
            );
        }
        self.cancel.cancel();
        let _ = tokio::time::timeout(CANCEL_UNWIND_TIMEOUT, self.wait_drained()).await;

        if let Some(id) = self.browser_id() {
            self.drivers.close_browser(&id).await;
        }

        if let (Some(proxies), Some(proxy)) = (&self.proxies, self.proxy()) {
            if !proxy.is_banned() {
                if self.leak_warnings() > 0 {
                    proxies.retire(&proxy);
                } else {
                    proxies.release(&proxy);
                }
            }
        }

        *self.state.lock() = ContextState::Closed;
        info!(
            context = %self.agent.display(),
            tasks = self.health.tasks.load(Ordering::Relaxed),
            successes = self.successes(),
            elapsed_secs = self.elapsed().as_secs(),
            "Privacy context closed"
        );
    }

    /// Close immediately, cancelling in-flight runs. Used when the browser crashed.
    pub async fn force_close(&self) {
        self.cancel.cancel();
        self.close(Duration::ZERO).await;
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.running() == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            id: self.agent.id.to_string(),
            serial: self.serial,
            kind: self.agent.kind(),
            state: self.state(),
            running: self.running(),
            tasks: self.health.tasks.load(Ordering::Relaxed),
            successes: self.successes(),
            failures: self.health.failures.load(Ordering::Relaxed),
            small_pages: self.health.small_pages.load(Ordering::Relaxed),
            leak_warnings: self.leak_warnings(),
            proxy: self.proxy().map(|p| p.key()),
            elapsed_secs: self.elapsed().as_secs(),
            idle_secs: self.last_active.lock().elapsed().as_secs(),
        }
    }

    /// Human readable one-line state, for logs.
    pub fn readable_state(&self) -> String {
        format!(
            "{} {} running={} tasks={} failure_rate={:.2} warnings={}",
            self.agent.display(),
            self.state(),
            self.running(),
            self.health.tasks.load(Ordering::Relaxed),
            self.failure_rate(),
            self.leak_warnings()
        )
    }
}

impl fmt::Debug for PrivacyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivacyContext")
            .field("id", &self.agent.id)
            .field("serial", &self.serial)
            .field("state", &self.state())
            .field("running", &self.running())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for PrivacyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.agent.display(), self.state())
    }
}
