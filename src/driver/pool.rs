//! Per-browser pools of tab-backed driver handles.
//!
//! Each browser gets a semaphore with `max_open_tabs` permits; a permit is
//! held for as long as a driver is leased. Released drivers go back to an
//! idle list and are reused before a new tab is opened, so the number of
//! live tabs never exceeds the cap.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OnceCell, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use super::{Browser, BrowserLauncher, WebDriver};
use crate::agent::BrowserId;
use crate::error::DriverError;

const DRIVER_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

struct BrowserSlot {
    browser: Arc<dyn Browser>,
    tabs: Arc<Semaphore>,
    idle: Mutex<Vec<Arc<dyn WebDriver>>>,
    live: Mutex<HashMap<usize, Arc<dyn WebDriver>>>,
    closed: AtomicBool,
}

impl BrowserSlot {
    /// Pop a healthy idle driver. Tabs that crashed while idle are closed
    /// and dropped.
    async fn take_idle(&self) -> Option<Arc<dyn WebDriver>> {
        loop {
            let next = self.idle.lock().pop();
            let driver = next?;
            if !driver.is_crashed() {
                return Some(driver);
            }
            self.discard(&driver);
            close_quietly(&driver).await;
        }
    }

    fn discard(&self, driver: &Arc<dyn WebDriver>) {
        self.live.lock().remove(&driver.id());
        debug!(browser = %self.browser.id(), driver = driver.id(), "Discarded driver");
    }

    fn recycle(&self, driver: Arc<dyn WebDriver>) -> bool {
        if driver.is_crashed() || self.closed.load(Ordering::Acquire) || !self.browser.is_alive() {
            self.discard(&driver);
            return false;
        }
        self.idle.lock().push(driver);
        true
    }

    fn live_count(&self) -> usize {
        self.live.lock().len()
    }
}

/// A leased driver. Dropping the lease recycles the driver; prefer
/// [`WebDriverPoolManager::release`], which also closes crashed tabs.
pub struct DriverLease {
    driver: Arc<dyn WebDriver>,
    slot: Arc<BrowserSlot>,
    released: bool,
    _permit: OwnedSemaphorePermit,
}

impl DriverLease {
    pub fn driver(&self) -> &Arc<dyn WebDriver> {
        &self.driver
    }

    pub fn browser_id(&self) -> &BrowserId {
        self.slot.browser.id()
    }
}

impl Drop for DriverLease {
    fn drop(&mut self) {
        if !self.released {
            self.slot.recycle(self.driver.clone());
        }
    }
}

pub struct WebDriverPoolManager {
    launcher: Arc<dyn BrowserLauncher>,
    browsers: Mutex<HashMap<BrowserId, Arc<OnceCell<Arc<BrowserSlot>>>>>,
    max_open_tabs: usize,
    acquire_timeout: Duration,
    launches: AtomicUsize,
}

impl WebDriverPoolManager {
    pub fn new(launcher: Arc<dyn BrowserLauncher>, max_open_tabs: usize, acquire_timeout: Duration) -> Self {
        Self {
            launcher,
            browsers: Mutex::new(HashMap::new()),
            max_open_tabs: max_open_tabs.max(1),
            acquire_timeout,
            launches: AtomicUsize::new(0),
        }
    }

    async fn slot(&self, id: &BrowserId) -> Result<Arc<BrowserSlot>, DriverError> {
        let cell = self.browsers.lock().entry(id.clone()).or_default().clone();
        let slot = cell
            .get_or_try_init(|| async {
                let launched = tokio::time::timeout(self.acquire_timeout, self.launcher.launch(id))
                    .await
                    .map_err(|_| DriverError::Launch {
                        browser: id.to_string(),
                        message: format!("timed out after {:?}", self.acquire_timeout),
                    })?
                    .map_err(|e| DriverError::Launch {
                        browser: id.to_string(),
                        message: format!("{:#}", e),
                    })?;
                self.launches.fetch_add(1, Ordering::Relaxed);
                Ok::<_, DriverError>(Arc::new(BrowserSlot {
                    browser: launched,
                    tabs: Arc::new(Semaphore::new(self.max_open_tabs)),
                    idle: Mutex::new(Vec::new()),
                    live: Mutex::new(HashMap::new()),
                    closed: AtomicBool::new(false),
                }))
            })
            .await?;
        Ok(slot.clone())
    }

    fn existing_slot(&self, id: &BrowserId) -> Option<Arc<BrowserSlot>> {
        self.browsers.lock().get(id).and_then(|cell| cell.get().cloned())
    }

    /// Lease a driver for `id`, launching the browser on first use. Waits up
    /// to the acquire timeout when every tab is leased.
    pub async fn acquire(&self, id: &BrowserId) -> Result<DriverLease, DriverError> {
        let slot = self.slot(id).await?;

        let permit = match tokio::time::timeout(self.acquire_timeout, slot.tabs.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(DriverError::BrowserClosed(id.to_string())),
            Err(_) => {
                return Err(DriverError::AcquireTimeout {
                    browser: id.to_string(),
                    waited: self.acquire_timeout,
                })
            }
        };

        if slot.closed.load(Ordering::Acquire) || !slot.browser.is_alive() {
            return Err(DriverError::BrowserClosed(id.to_string()));
        }

        let driver = match slot.take_idle().await {
            Some(driver) => driver,
            None => {
                let driver = slot.browser.new_driver().await.map_err(|e| DriverError::OpenTab {
                    browser: id.to_string(),
                    message: format!("{:#}", e),
                })?;
                slot.live.lock().insert(driver.id(), driver.clone());
                debug!(browser = %id, driver = driver.id(), live = slot.live_count(), "Opened new tab");
                driver
            }
        };

        Ok(DriverLease {
            driver,
            slot,
            released: false,
            _permit: permit,
        })
    }

    /// Return a leased driver. Crashed drivers are closed and discarded so
    /// a fresh tab can take their place.
    pub async fn release(&self, mut lease: DriverLease) {
        lease.released = true;
        let driver = lease.driver.clone();
        if !lease.slot.recycle(driver.clone()) {
            close_quietly(&driver).await;
        }
    }

    pub fn is_browser_alive(&self, id: &BrowserId) -> bool {
        self.existing_slot(id)
            .map(|slot| !slot.closed.load(Ordering::Acquire) && slot.browser.is_alive())
            .unwrap_or(false)
    }

    /// A browser was launched for `id` and not closed through the pool.
    pub fn has_browser(&self, id: &BrowserId) -> bool {
        self.existing_slot(id).is_some()
    }

    pub fn live_driver_count(&self, id: &BrowserId) -> usize {
        self.existing_slot(id).map(|slot| slot.live_count()).unwrap_or(0)
    }

    pub fn idle_driver_count(&self, id: &BrowserId) -> usize {
        self.existing_slot(id).map(|slot| slot.idle.lock().len()).unwrap_or(0)
    }

    pub fn browser_count(&self) -> usize {
        self.browsers.lock().values().filter(|cell| cell.initialized()).count()
    }

    /// Total browsers launched over the manager's lifetime.
    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::Relaxed)
    }

    /// Close every driver of a browser, then the browser itself. Waiters on
    /// the browser's tabs fail with `BrowserClosed`. Errors are logged.
    pub async fn close_browser(&self, id: &BrowserId) {
        let cell = self.browsers.lock().remove(id);
        let Some(slot) = cell.and_then(|cell| cell.get().cloned()) else {
            return;
        };

        slot.closed.store(true, Ordering::Release);
        slot.tabs.close();

        slot.idle.lock().clear();
        let drivers: Vec<_> = slot.live.lock().drain().map(|(_, d)| d).collect();
        let count = drivers.len();
        for driver in drivers {
            close_quietly(&driver).await;
        }

        match tokio::time::timeout(DRIVER_CLOSE_TIMEOUT, slot.browser.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(browser = %id, error = %e, "Failed to close browser"),
            Err(_) => warn!(browser = %id, "Timed out closing browser"),
        }
        info!(browser = %id, drivers = count, "Browser closed");
    }

    pub async fn close_all(&self) {
        let ids: Vec<_> = self.browsers.lock().keys().cloned().collect();
        for id in ids {
            self.close_browser(&id).await;
        }
    }
}

async fn close_quietly(driver: &Arc<dyn WebDriver>) {
    match tokio::time::timeout(DRIVER_CLOSE_TIMEOUT, driver.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(driver = driver.id(), error = %e, "Failed to close driver"),
        Err(_) => debug!(driver = driver.id(), "Timed out closing driver"),
    }
}
