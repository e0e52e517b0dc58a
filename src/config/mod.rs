//! Proxy configuration.

pub mod proxy;

pub use proxy::{PROXY_CONFIG_FILE, ProxyConfig};
