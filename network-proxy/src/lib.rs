//! Localhost filtering proxies for sandboxed commands.
//!
//! Both proxies bind an ephemeral port on 127.0.0.1 and consult a
//! [`HostFilter`] before opening any upstream connection. Policy lives with
//! the caller; this crate only speaks the wire protocols.

mod http;
mod responses;
mod socks5;

pub use http::HttpProxy;
pub use socks5::SocksProxy;

use async_trait::async_trait;

/// Per-connection admission decision for a proxied destination.
#[async_trait]
pub trait HostFilter: Send + Sync {
    /// Returns true when a connection to `host:port` may proceed.
    async fn allow(&self, host: &str, port: u16) -> bool;
}

/// Strip brackets, port, and case from an authority-style host string.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    if host.starts_with('[') {
        if let Some(end) = host.find(']') {
            return host[1..end].to_ascii_lowercase();
        }
    }
    host.split(':').next().unwrap_or("").to_ascii_lowercase()
}

/// Split `host:port` (or `[v6]:port`) into its parts, defaulting to `default_port`.
pub(crate) fn split_authority(authority: &str, default_port: u16) -> (String, u16) {
    if let Some(host) = authority.strip_prefix('[') {
        if let Some(end) = host.find(']') {
            let hostname = host[..end].to_string();
            let port = host[end + 1..]
                .strip_prefix(':')
                .and_then(|p| p.parse::<u16>().ok())
                .unwrap_or(default_port);
            return (hostname, port);
        }
    }
    let mut parts = authority.splitn(2, ':');
    let host = parts.next().unwrap_or("").to_string();
    let port = parts
        .next()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(default_port);
    (host, port)
}
