//! Proxy sources. A loader fetches a batch of endpoints and hands back only
//! the ones it has not returned before. Failures never escape a loader: they
//! are logged and turned into an empty batch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::ProxySourceConfig;
use crate::proxy::entry::{ProxyEntry, ProxyProtocol};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait ProxyLoader: Send + Sync {
    /// Load proxies not yet handed out by this loader. Calls closer together
    /// than `reload_interval` return an empty batch without touching the
    /// source.
    async fn update_proxies(&self, reload_interval: Duration) -> Vec<ProxyEntry>;
}

/// Remembers which endpoints a loader already returned and when it last
/// hit its source.
#[derive(Debug, Default)]
struct LoadTracker {
    inner: Mutex<TrackerState>,
}

#[derive(Debug, Default)]
struct TrackerState {
    tracked: HashSet<String>,
    last_load: Option<Instant>,
}

impl LoadTracker {
    /// Claim the right to load now. False while still inside `reload_interval`.
    fn begin(&self, reload_interval: Duration) -> bool {
        let mut state = self.inner.lock();
        if let Some(last) = state.last_load {
            if last.elapsed() < reload_interval {
                return false;
            }
        }
        state.last_load = Some(Instant::now());
        true
    }

    fn retain_new(&self, proxies: Vec<ProxyEntry>) -> Vec<ProxyEntry> {
        let mut state = self.inner.lock();
        proxies
            .into_iter()
            .filter(|p| state.tracked.insert(p.key()))
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct HubResponse {
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<HubData>,
}

#[derive(Debug, Deserialize)]
struct HubData {
    #[serde(default)]
    proxies: Vec<HubProxy>,
}

#[derive(Debug, Deserialize)]
struct HubProxy {
    host: String,
    port: u16,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(rename = "declaredTTL", default)]
    declared_ttl: Option<String>,
}

impl From<HubProxy> for ProxyEntry {
    fn from(p: HubProxy) -> Self {
        let declared_ttl = p
            .declared_ttl
            .as_deref()
            .and_then(|ttl| DateTime::parse_from_rfc3339(ttl).ok())
            .map(|ttl| ttl.with_timezone(&Utc));
        ProxyEntry::new(p.host, p.port)
            .with_credentials(p.username, p.password)
            .with_protocol(ProxyProtocol::from_kind(p.kind.as_deref().unwrap_or("http")))
            .with_declared_ttl(declared_ttl)
    }
}

/// Loads proxies from a proxy hub speaking the JSON protocol.
pub struct ProxyHubLoader {
    url: String,
    client: reqwest::Client,
    tracker: LoadTracker,
}

impl ProxyHubLoader {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: http_client(),
            tracker: LoadTracker::default(),
        }
    }

    async fn fetch(&self) -> anyhow::Result<Vec<ProxyEntry>> {
        let resp: HubResponse = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if resp.status != "success" {
            anyhow::bail!("proxy hub returned {}: {}", resp.status, resp.message);
        }

        Ok(resp
            .data
            .map(|d| d.proxies.into_iter().map(ProxyEntry::from).collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl ProxyLoader for ProxyHubLoader {
    async fn update_proxies(&self, reload_interval: Duration) -> Vec<ProxyEntry> {
        if !self.tracker.begin(reload_interval) {
            debug!(url = %self.url, "Proxy hub reload throttled");
            return Vec::new();
        }
        match self.fetch().await {
            Ok(proxies) => {
                let fresh = self.tracker.retain_new(proxies);
                info!(url = %self.url, count = fresh.len(), "Loaded proxies from hub");
                fresh
            }
            Err(e) => {
                warn!(url = %self.url, error = %e, "Failed to load proxies from hub");
                Vec::new()
            }
        }
    }
}

/// Loads proxies from a vendor rotation endpoint answering one proxy per line.
pub struct VendorProxyLoader {
    url: String,
    client: reqwest::Client,
    tracker: LoadTracker,
}

impl VendorProxyLoader {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: http_client(),
            tracker: LoadTracker::default(),
        }
    }
}

#[async_trait]
impl ProxyLoader for VendorProxyLoader {
    async fn update_proxies(&self, reload_interval: Duration) -> Vec<ProxyEntry> {
        if !self.tracker.begin(reload_interval) {
            return Vec::new();
        }
        let body = async {
            self.client
                .get(&self.url)
                .send()
                .await?
                .error_for_status()?
                .text()
                .await
        };
        match body.await {
            Ok(text) => {
                let fresh = self.tracker.retain_new(parse_lines(&text));
                info!(url = %self.url, count = fresh.len(), "Loaded proxies from vendor");
                fresh
            }
            Err(e) => {
                warn!(url = %self.url, error = %e, "Failed to load proxies from vendor");
                Vec::new()
            }
        }
    }
}

/// A fixed list, e.g. from `PROXY_LIST`. Every entry is handed out once.
pub struct StaticProxyLoader {
    list: String,
    tracker: LoadTracker,
}

impl StaticProxyLoader {
    pub fn new(list: impl Into<String>) -> Self {
        Self {
            list: list.into(),
            tracker: LoadTracker::default(),
        }
    }
}

#[async_trait]
impl ProxyLoader for StaticProxyLoader {
    async fn update_proxies(&self, reload_interval: Duration) -> Vec<ProxyEntry> {
        if !self.tracker.begin(reload_interval) {
            return Vec::new();
        }
        self.tracker.retain_new(parse_lines(&self.list))
    }
}

/// Loader for deployments without proxies.
pub struct NoProxyLoader;

#[async_trait]
impl ProxyLoader for NoProxyLoader {
    async fn update_proxies(&self, _reload_interval: Duration) -> Vec<ProxyEntry> {
        Vec::new()
    }
}

/// Build the loader for a configured source.
pub fn loader_from_config(source: &ProxySourceConfig) -> Box<dyn ProxyLoader> {
    match source {
        ProxySourceConfig::None => Box::new(NoProxyLoader),
        ProxySourceConfig::Hub(url) => Box::new(ProxyHubLoader::new(url.clone())),
        ProxySourceConfig::Vendor(url) => Box::new(VendorProxyLoader::new(url.clone())),
        ProxySourceConfig::Static(list) => Box::new(StaticProxyLoader::new(list.clone())),
    }
}

/// Parse comma or newline separated proxy lines, skipping blanks, `#`
/// comments and malformed entries.
pub fn parse_lines(text: &str) -> Vec<ProxyEntry> {
    text.split(|c| c == ',' || c == '\n')
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| match ProxyEntry::parse(line) {
            Ok(p) => Some(p),
            Err(e) => {
                warn!(line, error = %e, "Skipping malformed proxy line");
                None
            }
        })
        .collect()
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_hub_failure_yields_empty_list() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/proxies"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "failed",
                "message": "no proxies"
            })))
            .mount(&server)
            .await;

        let loader = ProxyHubLoader::new(format!("{}/proxies", server.uri()));
        assert!(loader.update_proxies(Duration::ZERO).await.is_empty());
    }

    #[tokio::test]
    async fn test_hub_garbage_yields_empty_list() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let loader = ProxyHubLoader::new(server.uri());
        assert!(loader.update_proxies(Duration::ZERO).await.is_empty());
    }

    #[tokio::test]
    async fn test_hub_returns_only_untracked_proxies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success",
                "message": "",
                "data": { "proxies": [
                    {"host": "10.0.0.1", "port": 8080, "username": "u", "password": "p",
                     "type": "http", "declaredTTL": "2099-01-01T00:00:00Z"},
                    {"host": "10.0.0.2", "port": 1080, "username": "", "password": "",
                     "type": "socks5", "declaredTTL": ""}
                ]}
            })))
            .mount(&server)
            .await;

        let loader = ProxyHubLoader::new(server.uri());
        let first = loader.update_proxies(Duration::ZERO).await;
        assert_eq!(first.len(), 2);
        assert!(first[0].requires_auth());
        assert!(first[0].declared_ttl.is_some());
        assert_eq!(first[1].protocol, ProxyProtocol::Socks5);
        assert!(!first[1].requires_auth());

        assert!(loader.update_proxies(Duration::ZERO).await.is_empty());
    }

    #[tokio::test]
    async fn test_reload_interval_throttles_source() {
        let loader = StaticProxyLoader::new("10.0.0.1:80");
        assert_eq!(loader.update_proxies(Duration::from_secs(60)).await.len(), 1);
        assert!(loader.update_proxies(Duration::from_secs(60)).await.is_empty());
    }

    #[test]
    fn test_parse_lines_skips_garbage() {
        let proxies = parse_lines("10.0.0.1:80, # comment\nnot-a-proxy\nuser:pass@10.0.0.2:3128\n");
        let keys: Vec<_> = proxies.iter().map(|p| p.key()).collect();
        assert_eq!(keys, vec!["10.0.0.1:80", "10.0.0.2:3128"]);
    }
}
