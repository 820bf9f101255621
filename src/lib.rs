//! Privacy contexts and a bounded browser resource pool for stealth crawling.
//!
//! A [`PrivacyContext`](context::PrivacyContext) couples one identity, at most
//! one proxy and one headless browser. The
//! [`PrivacyContextManager`](context::PrivacyContextManager) decides which
//! context serves a fetch and retires contexts that leak or fail.

pub mod agent;
pub mod browser_files;
pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod fetch;
pub mod fingerprint;
pub mod proxy;
pub mod stealth;

#[cfg(test)]
pub(crate) mod testing;

pub use agent::{AgentRequirement, PrivacyAgent, PrivacyAgentId};
pub use config::PoolConfig;
pub use context::{PrivacyContext, PrivacyContextManager};
pub use error::{FailureKind, FetchError, PoolError};
pub use fetch::{FetchExecutor, FetchResult, FetchTask};
