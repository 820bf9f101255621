//! External proxy sourcing, leasing and health tracking.

pub mod entry;
pub mod loader;
pub mod pool;

pub use entry::{generate_proxy_auth_extension, ProxyEntry, ProxyInfo, ProxyProtocol, ProxyStatus};
pub use loader::{loader_from_config, ProxyLoader};
pub use pool::{ProxyPool, ProxyStats};
