//! Browser fingerprints: the browser kind, proxy, credentials and user agent
//! that make one browser look like a distinct user.

use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::ProxyError;
use crate::proxy::ProxyEntry;

static USER_AGENTS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    ]
});

/// Browser family launched for a fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrowserKind {
    #[default]
    Chrome,
    Chromium,
}

impl BrowserKind {
    /// Directory name of the user data dir inside a context directory.
    pub fn dir_name(&self) -> &'static str {
        match self {
            BrowserKind::Chrome => "chrome",
            BrowserKind::Chromium => "chromium",
        }
    }
}

/// The identity a browser presents to target sites.
///
/// Equality and ordering ignore `browser_kind`; absent fields sort before
/// concrete ones.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Fingerprint {
    pub browser_kind: BrowserKind,
    pub proxy_server: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub user_agent: Option<String>,
}

impl Fingerprint {
    pub fn new(browser_kind: BrowserKind) -> Self {
        Self {
            browser_kind,
            ..Default::default()
        }
    }

    /// A fingerprint with a user agent picked from the built-in roster.
    pub fn random(browser_kind: BrowserKind) -> Self {
        let user_agent = USER_AGENTS
            .choose(&mut rand::thread_rng())
            .map(|ua| ua.to_string());
        Self {
            browser_kind,
            user_agent,
            ..Default::default()
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn has_proxy(&self) -> bool {
        self.proxy_server.is_some()
    }

    /// Bind a proxy to this fingerprint. A fingerprint is bound at most once.
    pub fn bind_proxy(&mut self, proxy: &ProxyEntry) -> Result<(), ProxyError> {
        if proxy.is_banned() {
            return Err(ProxyError::Banned(proxy.key()));
        }
        if let Some(bound) = &self.proxy_server {
            return Err(ProxyError::AlreadyBound {
                bound: bound.clone(),
                requested: proxy.key(),
            });
        }
        self.proxy_server = Some(proxy.to_chrome_arg());
        self.username = proxy.username.clone();
        self.password = proxy.password.clone();
        Ok(())
    }

    fn key(&self) -> (&Option<String>, &Option<String>, &Option<String>, &Option<String>) {
        (&self.proxy_server, &self.username, &self.password, &self.user_agent)
    }
}

impl PartialEq for Fingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Fingerprint {}

impl Hash for Fingerprint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for Fingerprint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Fingerprint {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}|{}",
            self.browser_kind,
            self.proxy_server.as_deref().unwrap_or("direct")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_ignores_browser_kind() {
        let a = Fingerprint::new(BrowserKind::Chrome).with_user_agent("ua");
        let b = Fingerprint::new(BrowserKind::Chromium).with_user_agent("ua");
        assert_eq!(a, b);
    }

    #[test]
    fn test_absent_fields_sort_first() {
        let bare = Fingerprint::new(BrowserKind::Chrome);
        let with_ua = Fingerprint::new(BrowserKind::Chrome).with_user_agent("a");
        assert!(bare < with_ua);
    }

    #[test]
    fn test_proxy_binds_once() {
        let mut fp = Fingerprint::new(BrowserKind::Chrome);
        let first = ProxyEntry::parse("user:pass@10.0.0.1:8080").unwrap();
        let second = ProxyEntry::parse("10.0.0.2:8080").unwrap();

        fp.bind_proxy(&first).unwrap();
        assert_eq!(fp.proxy_server.as_deref(), Some("http://10.0.0.1:8080"));
        assert_eq!(fp.username.as_deref(), Some("user"));

        assert!(fp.bind_proxy(&second).is_err());
        assert_eq!(fp.proxy_server.as_deref(), Some("http://10.0.0.1:8080"));
    }

    #[test]
    fn test_banned_proxy_is_refused() {
        let mut fp = Fingerprint::new(BrowserKind::Chrome);
        let proxy = ProxyEntry::parse("10.0.0.1:8080").unwrap();
        proxy.ban();
        assert!(matches!(fp.bind_proxy(&proxy), Err(ProxyError::Banned(_))));
        assert!(fp.proxy_server.is_none());
    }

    #[test]
    fn test_random_picks_a_user_agent() {
        let fp = Fingerprint::random(BrowserKind::Chrome);
        assert!(fp.user_agent.unwrap().starts_with("Mozilla/5.0"));
    }
}
