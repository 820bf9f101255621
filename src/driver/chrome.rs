//! Headless Chrome behind the [`Browser`]/[`WebDriver`] capabilities.
//!
//! `headless_chrome` is synchronous, so every call runs on the blocking pool.

use async_trait::async_trait;
use headless_chrome::protocol::cdp::Emulation::{SetLocaleOverride, SetTimezoneOverride};
use headless_chrome::protocol::cdp::Page::AddScriptToEvaluateOnNewDocument;
use headless_chrome::{LaunchOptions, Tab};
use parking_lot::Mutex;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Browser, BrowserLauncher, WebDriver};
use crate::agent::BrowserId;
use crate::browser_files::PID_FILE_NAME;
use crate::config::PoolConfig;
use crate::proxy::generate_proxy_auth_extension;
use crate::stealth::{stealth_script, StealthProfile};

/// The browser must outlive long idle gaps between fetches.
const IDLE_BROWSER_TIMEOUT: Duration = Duration::from_secs(24 * 3600);

async fn blocking<T, F>(f: F) -> anyhow::Result<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

/// Errors that mean the tab or its connection is gone for good.
fn is_fatal(e: &anyhow::Error) -> bool {
    let msg = format!("{:#}", e).to_lowercase();
    msg.contains("crash") || msg.contains("target closed") || msg.contains("connection closed")
}

pub struct ChromeLauncher {
    headless: bool,
    browser_path: Option<PathBuf>,
}

impl ChromeLauncher {
    pub fn new(headless: bool, browser_path: Option<PathBuf>) -> Self {
        Self {
            headless,
            browser_path,
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(config.browser_headless, config.browser_path.clone())
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self, id: &BrowserId) -> anyhow::Result<Arc<dyn Browser>> {
        let fingerprint = id.fingerprint.clone();
        let user_data_dir = id.user_data_dir();
        let context_dir = id.context_dir.clone();
        let headless = self.headless;
        let path = self.browser_path.clone();

        let extension_dir = match (&context_dir, &fingerprint.username, &fingerprint.password) {
            (Some(dir), Some(user), Some(pass)) => {
                Some(generate_proxy_auth_extension(dir, user, pass)?)
            }
            _ => None,
        };

        let browser = blocking(move || {
            let mut owned: Vec<String> = vec![
                "--disable-blink-features=AutomationControlled".into(),
                "--no-sandbox".into(),
                "--disable-dev-shm-usage".into(),
                "--disable-infobars".into(),
                "--window-position=0,0".into(),
                "--ignore-certificate-errors".into(),
                "--ignore-certificate-errors-spki-list".into(),
            ];
            if let Some(ua) = &fingerprint.user_agent {
                owned.push(format!("--user-agent={}", ua));
            }
            if headless {
                owned.push("--headless=new".into());
            }
            if let Some(proxy) = &fingerprint.proxy_server {
                owned.push(format!("--proxy-server={}", proxy));
            }
            if let Some(ext) = &extension_dir {
                owned.push(format!("--load-extension={}", ext.display()));
            }
            let args: Vec<&OsStr> = owned.iter().map(OsStr::new).collect();

            headless_chrome::Browser::new(LaunchOptions {
                // Headless mode is selected via --headless=new
                headless: false,
                window_size: Some((1920, 1080)),
                path,
                user_data_dir,
                idle_browser_timeout: IDLE_BROWSER_TIMEOUT,
                args,
                ..Default::default()
            })
        })
        .await?;

        let pid = browser.get_process_id();
        if let (Some(dir), Some(pid)) = (&context_dir, pid) {
            if let Err(e) = std::fs::write(dir.join(PID_FILE_NAME), pid.to_string()) {
                warn!(dir = %dir.display(), error = %e, "Failed to write launcher pid file");
            }
        }
        info!(browser = %id, pid = ?pid, proxy = ?id.fingerprint.proxy_server, "Launched browser");

        Ok(Arc::new(ChromeBrowser {
            id: id.clone(),
            inner: Mutex::new(Some(Arc::new(browser))),
            pid,
            profile: StealthProfile::random(),
            next_driver_id: AtomicUsize::new(1),
        }))
    }
}

pub struct ChromeBrowser {
    id: BrowserId,
    inner: Mutex<Option<Arc<headless_chrome::Browser>>>,
    pid: Option<u32>,
    profile: StealthProfile,
    next_driver_id: AtomicUsize,
}

impl ChromeBrowser {
    fn handle(&self) -> anyhow::Result<Arc<headless_chrome::Browser>> {
        self.inner
            .lock()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("browser {} is closed", self.id))
    }
}

#[async_trait]
impl Browser for ChromeBrowser {
    fn id(&self) -> &BrowserId {
        &self.id
    }

    async fn new_driver(&self) -> anyhow::Result<Arc<dyn WebDriver>> {
        let browser = self.handle()?;
        let profile = self.profile.clone();
        let tab = blocking(move || {
            let tab = browser.new_tab()?;
            tab.enable_debugger()?;
            tab.call_method(AddScriptToEvaluateOnNewDocument {
                source: stealth_script(&profile),
                world_name: None,
                include_command_line_api: None,
                run_immediately: None,
            })?;
            if let Some(timezone_id) = &profile.timezone {
                tab.call_method(SetTimezoneOverride {
                    timezone_id: timezone_id.clone(),
                })?;
            }
            if let Err(e) = tab.call_method(SetLocaleOverride {
                locale: Some(profile.locale.clone()),
            }) {
                debug!(error = %e, "Locale override rejected");
            }
            Ok(tab)
        })
        .await?;

        let id = self.next_driver_id.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(ChromeDriver {
            id,
            tab,
            crashed: AtomicBool::new(false),
        }))
    }

    fn is_alive(&self) -> bool {
        if self.inner.lock().is_none() {
            return false;
        }
        #[cfg(target_os = "linux")]
        if let Some(pid) = self.pid {
            return std::path::Path::new(&format!("/proc/{}", pid)).exists();
        }
        true
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn close(&self) -> anyhow::Result<()> {
        let browser = self.inner.lock().take();
        if let Some(browser) = browser {
            // Dropping the last handle kills the process.
            blocking(move || {
                drop(browser);
                Ok(())
            })
            .await?;
            info!(browser = %self.id, "Closed browser");
        }
        Ok(())
    }
}

pub struct ChromeDriver {
    id: usize,
    tab: Arc<Tab>,
    crashed: AtomicBool,
}

impl ChromeDriver {
    async fn with_tab<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(Arc<Tab>) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let tab = self.tab.clone();
        let result = blocking(move || f(tab)).await;
        if let Err(e) = &result {
            if is_fatal(e) {
                self.crashed.store(true, Ordering::Release);
            }
        }
        result
    }
}

#[async_trait]
impl WebDriver for ChromeDriver {
    fn id(&self) -> usize {
        self.id
    }

    async fn navigate(&self, url: &str) -> anyhow::Result<()> {
        let url = url.to_string();
        self.with_tab(move |tab| {
            tab.navigate_to(&url)?;
            tab.wait_until_navigated()?;
            Ok(())
        })
        .await
    }

    async fn evaluate(&self, script: &str) -> anyhow::Result<serde_json::Value> {
        let script = script.to_string();
        self.with_tab(move |tab| {
            let result = tab.evaluate(&script, true)?;
            Ok(result.value.unwrap_or(serde_json::Value::Null))
        })
        .await
    }

    async fn click(&self, selector: &str) -> anyhow::Result<()> {
        let selector = selector.to_string();
        self.with_tab(move |tab| {
            tab.wait_for_element(&selector)?.click()?;
            Ok(())
        })
        .await
    }

    async fn type_text(&self, selector: &str, text: &str) -> anyhow::Result<()> {
        let selector = selector.to_string();
        let text = text.to_string();
        self.with_tab(move |tab| {
            tab.wait_for_element(&selector)?.type_into(&text)?;
            Ok(())
        })
        .await
    }

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> anyhow::Result<()> {
        let selector = selector.to_string();
        self.with_tab(move |tab| {
            tab.wait_for_element_with_custom_timeout(&selector, timeout)?;
            Ok(())
        })
        .await
    }

    async fn page_source(&self) -> anyhow::Result<String> {
        self.with_tab(|tab| tab.get_content()).await
    }

    async fn current_url(&self) -> anyhow::Result<String> {
        self.with_tab(|tab| Ok(tab.get_url())).await
    }

    fn is_crashed(&self) -> bool {
        self.crashed.load(Ordering::Acquire)
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.with_tab(|tab| {
            tab.close(false)?;
            Ok(())
        })
        .await
    }
}
