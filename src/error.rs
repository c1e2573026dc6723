//! Error types for the ECH proxy

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Top-level errors surfaced by the proxy service.
#[derive(Error, Debug)]
pub enum EchProxyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Proxy is already running")]
    AlreadyRunning,

    #[error("Failed to load ECH config: {0}")]
    EchResolution(#[from] ResolveError),

    #[error("TLS setup error: {0}")]
    Tls(#[from] TlsSetupError),

    #[error("Failed to listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("SOCKS5 error: {0}")]
    Protocol(#[from] Socks5Error),

    #[error("Tunnel dial failed: {0}")]
    Dial(#[from] DialError),

    #[error("Tunnel I/O error: {0}")]
    TunnelIo(#[from] std::io::Error),
}

/// DNS wire format errors.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsError {
    #[error("DNS response truncated")]
    Truncated,

    #[error("DNS response has no answer records")]
    NoAnswer,

    #[error("No ECH parameter in HTTPS records")]
    NoEchParameter,

    #[error("Domain name does not fit in a DNS query")]
    InvalidName,
}

/// Errors while fetching the ECH config list over DoH.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Invalid DoH URL: {0}")]
    InvalidUrl(String),

    #[error("DNS query failed: {0}")]
    DnsQueryFailed(String),

    #[error("ECH parameter not found")]
    NoEchParameter,

    #[error("ECH config decode failed: {0}")]
    DecodeFailed(#[from] base64::DecodeError),
}

impl From<DnsError> for ResolveError {
    fn from(e: DnsError) -> Self {
        match e {
            DnsError::NoAnswer | DnsError::NoEchParameter => ResolveError::NoEchParameter,
            DnsError::Truncated | DnsError::InvalidName => {
                ResolveError::DnsQueryFailed(e.to_string())
            }
        }
    }
}

/// Errors while building a TLS client context with ECH.
#[derive(Error, Debug)]
pub enum TlsSetupError {
    #[error("ECH config list is empty")]
    EmptyEchConfig,

    #[error("Failed to load system root certificates: {0}")]
    RootCertLoadFailed(String),

    #[error("ECH setup failed: {0}")]
    EchSetupFailed(String),

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),
}

/// Errors while opening a tunnel to the relay.
#[derive(Error, Debug)]
pub enum DialError {
    #[error("Invalid relay address: {0}")]
    InvalidRelayAddr(String),

    #[error("ECH config not loaded")]
    EchUnavailable,

    #[error("TLS setup error: {0}")]
    Tls(#[from] TlsSetupError),

    #[error("TCP connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS handshake failed: {0}")]
    Handshake(std::io::Error),

    #[error("Server rejected ECH")]
    EchRejected,

    #[error("WebSocket handshake failed: {0}")]
    WebSocket(tungstenite::Error),

    #[error("Relay dial timed out")]
    Timeout,

    #[error("Failed to send target address: {0}")]
    SendTarget(tungstenite::Error),
}

/// SOCKS5 protocol errors.
#[derive(Error, Debug)]
pub enum Socks5Error {
    #[error("invalid SOCKS version: 0x{0:02x}")]
    InvalidVersion(u8),

    #[error("unsupported command: 0x{0:02x}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type: 0x{0:02x}")]
    UnsupportedAddressType(u8),

    #[error("domain name is not valid UTF-8")]
    InvalidDomain,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EchProxyError>;
