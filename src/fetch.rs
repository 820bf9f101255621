//! Fetch tasks: one page load through a privacy context, its outcome
//! classification, and the feedback into context health.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::AgentRequirement;
use crate::context::{PrivacyContext, PrivacyContextManager};
use crate::error::{FailureKind, FetchError};

pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(60);
/// Pages shorter than this are loaded but counted as suspicious.
pub const SMALL_PAGE_BYTES: usize = 1_000;
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

static BLOCKED_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(checkpoint|challenge|suspicious|banned|/sorry/|captcha)").expect("static pattern")
});

static BLOCKED_CONTENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(unusual traffic|captcha-form|g-recaptcha|systems have detected|verify it's you|security check|temporarily locked|are you a robot)",
    )
    .expect("static pattern")
});

static FORBIDDEN_CONTENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(<title>\s*(403 forbidden|access denied)|\b403 forbidden\b)").expect("static pattern")
});

/// A single page load request.
#[derive(Debug, Clone)]
pub struct FetchTask {
    pub id: Uuid,
    pub url: String,
    pub requirement: AgentRequirement,
    /// Extra attempts after the first one
    pub retries: u32,
    pub timeout: Duration,
}

impl FetchTask {
    pub fn new(url: impl Into<String>, requirement: AgentRequirement) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: url.into(),
            requirement,
            retries: 0,
            timeout: DEFAULT_TASK_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

/// What the loaded page looked like.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageOutcome {
    Success,
    SmallPage,
    /// Robot check, captcha or checkpoint
    Blocked,
    Forbidden,
}

impl PageOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PageOutcome::Success | PageOutcome::SmallPage)
    }
}

/// Classify a loaded page by its final url and content.
pub fn classify_page(url: &str, html: &str) -> PageOutcome {
    if BLOCKED_URL.is_match(url) || BLOCKED_CONTENT.is_match(html) {
        PageOutcome::Blocked
    } else if FORBIDDEN_CONTENT.is_match(html) {
        PageOutcome::Forbidden
    } else if html.len() < SMALL_PAGE_BYTES {
        PageOutcome::SmallPage
    } else {
        PageOutcome::Success
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchResult {
    pub task_id: Uuid,
    pub url: String,
    pub final_url: Option<String>,
    /// Agent id of the context that served the last attempt
    pub context: Option<String>,
    pub proxy: Option<String>,
    pub outcome: Option<PageOutcome>,
    pub failure: Option<FailureKind>,
    pub error: Option<String>,
    pub attempts: u32,
    pub content_length: usize,
    pub elapsed_ms: u64,
    #[serde(skip)]
    pub html: Option<String>,
}

impl FetchResult {
    fn new(task: &FetchTask) -> Self {
        Self {
            task_id: task.id,
            url: task.url.clone(),
            final_url: None,
            context: None,
            proxy: None,
            outcome: None,
            failure: None,
            error: None,
            attempts: 0,
            content_length: 0,
            elapsed_ms: 0,
            html: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none() && self.outcome.map_or(false, |o| o.is_success())
    }
}

/// Runs fetch tasks through the manager's contexts.
pub struct FetchExecutor {
    manager: Arc<PrivacyContextManager>,
    retry_backoff: Duration,
}

impl FetchExecutor {
    pub fn new(manager: Arc<PrivacyContextManager>) -> Self {
        Self {
            manager,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    /// Base delay between attempts, multiplied by the attempt number.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn manager(&self) -> &Arc<PrivacyContextManager> {
        &self.manager
    }

    /// Load `task.url`, retrying on target or context trouble. Never fails:
    /// errors are classified into the result.
    pub async fn fetch(&self, task: &FetchTask) -> FetchResult {
        let started = Instant::now();
        let mut result = FetchResult::new(task);
        let max_attempts = task.retries + 1;

        for attempt in 1..=max_attempts {
            if attempt > 1 && !self.retry_backoff.is_zero() {
                tokio::time::sleep(self.retry_backoff * (attempt - 1)).await;
            }
            result.attempts = attempt;

            let context = match self.manager.acquire(&task.requirement).await {
                Ok(context) => context,
                Err(e) => {
                    // Acquire already waited its budget.
                    let e = FetchError::from(e);
                    warn!(task = %task.id, url = %task.url, error = %e, "No privacy context for task");
                    result.failure = Some(e.kind());
                    result.error = Some(e.to_string());
                    break;
                }
            };
            result.context = Some(context.id().to_string());

            let retry = self.attempt(task, &context, &mut result).await;
            result.proxy = context.proxy().map(|p| p.key());
            if !retry {
                break;
            }
            debug!(task = %task.id, attempt, max_attempts, "Retrying fetch");
        }

        result.elapsed_ms = started.elapsed().as_millis() as u64;
        if result.is_success() {
            info!(
                task = %task.id,
                url = %task.url,
                context = result.context.as_deref().unwrap_or("-"),
                bytes = result.content_length,
                attempts = result.attempts,
                "Fetched"
            );
        } else {
            warn!(
                task = %task.id,
                url = %task.url,
                failure = ?result.failure,
                outcome = ?result.outcome,
                attempts = result.attempts,
                "Fetch failed"
            );
        }
        result
    }

    /// One attempt. Returns whether another attempt is worthwhile.
    async fn attempt(&self, task: &FetchTask, context: &Arc<PrivacyContext>, result: &mut FetchResult) -> bool {
        let url = task.url.clone();
        let loaded = context
            .run(task, |driver| async move {
                driver.navigate(&url).await.map_err(FetchError::Page)?;
                let html = driver.page_source().await.map_err(FetchError::Page)?;
                let final_url = driver.current_url().await.map_err(FetchError::Page)?;
                Ok((final_url, html))
            })
            .await;

        match loaded {
            Ok((final_url, html)) => {
                let outcome = classify_page(&final_url, &html);
                result.outcome = Some(outcome);
                result.content_length = html.len();
                result.final_url = Some(final_url);

                match outcome {
                    PageOutcome::Success | PageOutcome::SmallPage => {
                        context.record_success(outcome == PageOutcome::SmallPage);
                        result.failure = None;
                        result.error = None;
                        result.html = Some(html);
                        false
                    }
                    PageOutcome::Blocked | PageOutcome::Forbidden => {
                        context.record_failure();
                        match (outcome, context.proxy(), self.manager.proxies()) {
                            // The exit address itself is refused; it is burned for every identity.
                            (PageOutcome::Forbidden, Some(proxy), Some(proxies)) => {
                                proxies.ban(&proxy);
                                context.mark_leaked();
                            }
                            _ => context.warn_leak(),
                        }
                        result.failure = Some(FailureKind::Blocked);
                        result.error = Some(format!("{:?} page served to {}", outcome, context.id()));
                        if context.is_leaked() {
                            self.retire(context);
                        }
                        true
                    }
                }
            }
            Err(e) => {
                context.record_failure();
                let kind = e.kind();
                result.failure = Some(kind);
                result.error = Some(e.to_string());
                if context.is_browser_crashed() {
                    self.retire(context);
                }
                match kind {
                    FailureKind::Unreachable | FailureKind::Timeout => {
                        context.warn_minor();
                        true
                    }
                    FailureKind::ContextClosed => true,
                    // The bound proxy was banned; the identity goes with it.
                    FailureKind::Blocked => {
                        if context.mark_leaked() {
                            self.retire(context);
                        }
                        true
                    }
                    FailureKind::NoCapacity => false,
                }
            }
        }
    }

    fn retire(&self, context: &Arc<PrivacyContext>) {
        if let Err(e) = self.manager.retire(context) {
            debug!(context = %context, error = %e, "Context already gone");
        }
    }
}
