//! Error taxonomy for the privacy context subsystem.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the context pool and its manager.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("privacy context pool saturated: {active}/{allowed} live contexts")]
    Saturated { active: usize, allowed: usize },
    /// Lifecycle bug: an operation targeted a context the pool does not own.
    #[error("privacy context {0} is not tracked by the pool")]
    NotTracked(String),
    #[error("privacy context manager is not active")]
    Inactive,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Dir(#[from] DirError),
}

/// Errors raised by the proxy subsystem.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("no proxy available")]
    Unavailable,
    #[error("proxy {0} is banned")]
    Banned(String),
    #[error("invalid proxy: {0}")]
    Parse(String),
    #[error("fingerprint already bound to proxy {bound}, refusing {requested}")]
    AlreadyBound { bound: String, requested: String },
}

/// Errors raised while allocating or reclaiming profile directories.
#[derive(Debug, Error)]
pub enum DirError {
    #[error("timed out after {waited:?} waiting for lock {path}")]
    LockTimeout { path: PathBuf, waited: Duration },
    #[error("failed to lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("refusing to touch {0}: outside the temporary context root")]
    OutsideRoot(PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised by the driver pool.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("no driver available for browser {browser} within {waited:?}")]
    AcquireTimeout { browser: String, waited: Duration },
    #[error("browser {0} is closed")]
    BrowserClosed(String),
    #[error("failed to launch browser {browser}: {message}")]
    Launch { browser: String, message: String },
    #[error("failed to open a new tab in browser {browser}: {message}")]
    OpenTab { browser: String, message: String },
}

/// Errors surfaced to a single fetch task.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("privacy context {0} is closed")]
    ContextClosed(String),
    #[error("privacy context {0} is leaked and refuses new tasks")]
    ContextLeaked(String),
    #[error("fetch task timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error("page load failed: {0:#}")]
    Page(anyhow::Error),
}

/// Coarse failure classes that upstream retry logic switches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No context, driver or proxy could be obtained in budget.
    NoCapacity,
    /// The target could not be loaded.
    Unreachable,
    /// The target detected us (captcha, checkpoint, 403).
    Blocked,
    /// The serving context was closed under the task.
    ContextClosed,
    /// The per-task timeout elapsed.
    Timeout,
}

impl FetchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            FetchError::ContextClosed(_) | FetchError::ContextLeaked(_) => {
                FailureKind::ContextClosed
            }
            FetchError::Timeout(_) => FailureKind::Timeout,
            FetchError::Driver(DriverError::BrowserClosed(_)) => FailureKind::ContextClosed,
            FetchError::Driver(_) | FetchError::Pool(_) => FailureKind::NoCapacity,
            FetchError::Proxy(ProxyError::Banned(_)) => FailureKind::Blocked,
            FetchError::Proxy(_) => FailureKind::NoCapacity,
            FetchError::Page(_) => FailureKind::Unreachable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kinds_distinguish_capacity_from_target() {
        let saturated = FetchError::Pool(PoolError::Saturated {
            active: 2,
            allowed: 2,
        });
        assert_eq!(saturated.kind(), FailureKind::NoCapacity);

        let page = FetchError::Page(anyhow::anyhow!("net::ERR_NAME_NOT_RESOLVED"));
        assert_eq!(page.kind(), FailureKind::Unreachable);

        let banned = FetchError::Proxy(ProxyError::Banned("1.2.3.4:8080".into()));
        assert_eq!(banned.kind(), FailureKind::Blocked);

        let closed = FetchError::ContextClosed("cx.1".into());
        assert_eq!(closed.kind(), FailureKind::ContextClosed);
    }
}
