//! Browser and driver capabilities.
//!
//! A [`Browser`] is one launched browser process. A [`WebDriver`] is one tab
//! inside it. The pool never looks past these traits, so tests plug in mock
//! implementations and production uses [`chrome`].

pub mod chrome;
pub mod pool;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::agent::BrowserId;

pub use chrome::ChromeLauncher;
pub use pool::{DriverLease, WebDriverPoolManager};

/// One tab-backed driver handle.
#[async_trait]
pub trait WebDriver: Send + Sync {
    /// Unique within the owning browser.
    fn id(&self) -> usize;

    async fn navigate(&self, url: &str) -> anyhow::Result<()>;

    async fn evaluate(&self, script: &str) -> anyhow::Result<serde_json::Value>;

    async fn click(&self, selector: &str) -> anyhow::Result<()>;

    async fn type_text(&self, selector: &str, text: &str) -> anyhow::Result<()>;

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> anyhow::Result<()>;

    async fn page_source(&self) -> anyhow::Result<String>;

    async fn current_url(&self) -> anyhow::Result<String>;

    /// The tab crashed or stopped answering; the handle must not be reused.
    fn is_crashed(&self) -> bool;

    async fn close(&self) -> anyhow::Result<()>;
}

/// One launched browser process.
#[async_trait]
pub trait Browser: Send + Sync {
    fn id(&self) -> &BrowserId;

    /// Open a new tab with the stealth script installed.
    async fn new_driver(&self) -> anyhow::Result<Arc<dyn WebDriver>>;

    fn is_alive(&self) -> bool;

    fn pid(&self) -> Option<u32>;

    async fn close(&self) -> anyhow::Result<()>;
}

/// Launches a browser process for an identity.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, id: &BrowserId) -> anyhow::Result<Arc<dyn Browser>>;
}
