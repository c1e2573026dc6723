//! ECH Proxy - SOCKS5 proxy tunnelling over WebSocket with Encrypted Client Hello
//!
//! This library runs a local SOCKS5 listener and carries every CONNECT
//! session to a remote relay over a WebSocket secured by TLS 1.3 with ECH,
//! so the real server name stays inside the encrypted inner ClientHello.
//! The ECH config list is fetched once at startup from an HTTPS DNS record
//! over DoH.

pub mod client;
pub mod dns;
pub mod dns_wire;
pub mod ech;
pub mod error;
pub mod ffi;
pub mod logging;
pub mod proxy;
pub mod socks5;
pub mod tls_crypto;
pub mod tunnel;

pub use client::EchClient;
pub use error::EchProxyError;
pub use proxy::EchProxyServer;

use error::{EchProxyError as Error, Result};
use tunnel::RelayAddr;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:30000";
pub const DEFAULT_DOH_SERVER: &str = "dns.alidns.com/dns-query";
pub const DEFAULT_ECH_DOMAIN: &str = "cloudflare-ech.com";

/// Proxy configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Local SOCKS5 listen address (default: 127.0.0.1:30000)
    pub listen_addr: String,
    /// Relay address: `host:port` with an optional `/path`
    pub server_addr: String,
    /// Shared secret offered as the WebSocket subprotocol
    pub token: Option<String>,
    /// Address to dial instead of the relay host; TLS still verifies the host
    pub server_ip: Option<String>,
    /// DOH server URL used for the ECH lookup
    pub doh_server: String,
    /// Domain whose HTTPS record carries the ECH config list
    pub ech_domain: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            server_addr: String::new(),
            token: None,
            server_ip: None,
            doh_server: DEFAULT_DOH_SERVER.to_string(),
            ech_domain: DEFAULT_ECH_DOMAIN.to_string(),
        }
    }
}

impl ProxyConfig {
    /// Check everything that can be checked before touching the network.
    pub fn validate(&self) -> Result<RelayAddr> {
        if self.server_addr.is_empty() {
            return Err(Error::Config("server address is not configured".to_string()));
        }
        if self.ech_domain.is_empty() {
            return Err(Error::Config("ECH domain is not configured".to_string()));
        }
        if let Some(token) = &self.token {
            if token.is_empty() || !token.chars().all(|c| c.is_ascii_graphic()) {
                return Err(Error::Config(
                    "token must be non-empty printable ASCII without spaces".to_string(),
                ));
            }
        }
        RelayAddr::parse(&self.server_addr).map_err(|e| Error::Config(e.to_string()))
    }
}
