//! In-memory browsers and drivers for tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::agent::BrowserId;
use crate::driver::{Browser, BrowserLauncher, WebDriver};

/// Shared page behavior for every browser a launcher creates.
#[derive(Debug, Clone)]
pub struct MockPage {
    pub html: String,
    pub navigate_delay: Duration,
    pub fail_navigation: bool,
}

impl Default for MockPage {
    fn default() -> Self {
        Self {
            html: format!("<html><body>{}</body></html>", "content ".repeat(200)),
            navigate_delay: Duration::ZERO,
            fail_navigation: false,
        }
    }
}

#[derive(Default)]
pub struct MockLauncher {
    page: Arc<Mutex<MockPage>>,
    browsers: Mutex<Vec<Arc<MockBrowser>>>,
    fail_launch: AtomicBool,
}

impl MockLauncher {
    pub fn with_page(page: MockPage) -> Self {
        Self {
            page: Arc::new(Mutex::new(page)),
            ..Default::default()
        }
    }

    pub fn set_page(&self, page: MockPage) {
        *self.page.lock() = page;
    }

    pub fn fail_launches(&self, fail: bool) {
        self.fail_launch.store(fail, Ordering::SeqCst);
    }

    pub fn launch_count(&self) -> usize {
        self.browsers.lock().len()
    }

    pub fn browsers(&self) -> Vec<Arc<MockBrowser>> {
        self.browsers.lock().clone()
    }
}

#[async_trait]
impl BrowserLauncher for MockLauncher {
    async fn launch(&self, id: &BrowserId) -> anyhow::Result<Arc<dyn Browser>> {
        if self.fail_launch.load(Ordering::SeqCst) {
            anyhow::bail!("mock launch failure");
        }
        let browser = Arc::new(MockBrowser {
            id: id.clone(),
            page: self.page.clone(),
            alive: AtomicBool::new(true),
            next_driver: AtomicUsize::new(1),
            drivers: Mutex::new(Vec::new()),
        });
        self.browsers.lock().push(browser.clone());
        Ok(browser)
    }
}

pub struct MockBrowser {
    id: BrowserId,
    page: Arc<Mutex<MockPage>>,
    alive: AtomicBool,
    next_driver: AtomicUsize,
    drivers: Mutex<Vec<Arc<MockDriver>>>,
}

impl MockBrowser {
    /// Simulate the process dying.
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn driver(&self, id: usize) -> Option<Arc<MockDriver>> {
        self.drivers.lock().iter().find(|d| d.id == id).cloned()
    }

    pub fn driver_count(&self) -> usize {
        self.drivers.lock().len()
    }
}

#[async_trait]
impl Browser for MockBrowser {
    fn id(&self) -> &BrowserId {
        &self.id
    }

    async fn new_driver(&self) -> anyhow::Result<Arc<dyn WebDriver>> {
        if !self.is_alive() {
            anyhow::bail!("browser is gone");
        }
        let driver = Arc::new(MockDriver {
            id: self.next_driver.fetch_add(1, Ordering::SeqCst),
            page: self.page.clone(),
            url: Mutex::new("about:blank".to_string()),
            crashed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.drivers.lock().push(driver.clone());
        Ok(driver)
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn pid(&self) -> Option<u32> {
        None
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.kill();
        Ok(())
    }
}

pub struct MockDriver {
    id: usize,
    page: Arc<Mutex<MockPage>>,
    url: Mutex<String>,
    crashed: AtomicBool,
    closed: AtomicBool,
}

impl MockDriver {
    pub fn crash(&self) {
        self.crashed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WebDriver for MockDriver {
    fn id(&self) -> usize {
        self.id
    }

    async fn navigate(&self, url: &str) -> anyhow::Result<()> {
        let page = self.page.lock().clone();
        if !page.navigate_delay.is_zero() {
            tokio::time::sleep(page.navigate_delay).await;
        }
        if page.fail_navigation {
            anyhow::bail!("net::ERR_CONNECTION_REFUSED at {}", url);
        }
        *self.url.lock() = url.to_string();
        Ok(())
    }

    async fn evaluate(&self, _script: &str) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }

    async fn click(&self, _selector: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn type_text(&self, _selector: &str, _text: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn wait_for_selector(&self, _selector: &str, _timeout: Duration) -> anyhow::Result<()> {
        Ok(())
    }

    async fn page_source(&self) -> anyhow::Result<String> {
        Ok(self.page.lock().html.clone())
    }

    async fn current_url(&self) -> anyhow::Result<String> {
        Ok(self.url.lock().clone())
    }

    fn is_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
