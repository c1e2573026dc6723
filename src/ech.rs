//! ECH (Encrypted Client Hello) TLS connection handling
//!
//! The ECH config list fetched at startup lives in an [`EchStore`]. Every
//! relay dial snapshots it and builds a TLS 1.3 client context that seals
//! the real server name inside the inner ClientHello. There is no fallback
//! to plain TLS: an empty list or a rejection by the server fails the dial.

use crate::dns::EchResolver;
use crate::error::{DialError, ResolveError, TlsSetupError};
use async_trait::async_trait;
use parking_lot::RwLock;
use rustls::client::{EchConfig, EchMode, EchStatus};
use rustls::pki_types::{EchConfigListBytes, ServerName};
use rustls::{ClientConfig, RootCertStore};
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// Raw ECHConfigList bytes from the HTTPS record `ech` parameter.
#[derive(Clone, PartialEq, Eq)]
pub struct EchConfigList(Arc<[u8]>);

impl EchConfigList {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Bytes in the form rustls expects: a 2-byte length-prefixed list.
    pub fn to_rustls(&self) -> EchConfigListBytes<'static> {
        EchConfigListBytes::from(ensure_len_prefix(&self.0))
    }
}

impl fmt::Debug for EchConfigList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EchConfigList({} bytes)", self.0.len())
    }
}

fn ensure_len_prefix(bytes: &[u8]) -> Vec<u8> {
    if bytes.len() >= 2 {
        let declared = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        if declared == bytes.len() - 2 {
            return bytes.to_vec();
        }
    }

    if bytes.len() > u16::MAX as usize {
        warn!(
            "ECH config list too large ({} bytes), passing as-is",
            bytes.len()
        );
        return bytes.to_vec();
    }

    let mut prefixed = Vec::with_capacity(bytes.len() + 2);
    prefixed.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    prefixed.extend_from_slice(bytes);
    prefixed
}

/// Shared cell holding the current ECH config list.
///
/// Written by resolution, read by every dial. Clones share the same cell.
#[derive(Clone, Default)]
pub struct EchStore {
    inner: Arc<RwLock<Option<EchConfigList>>>,
}

impl EchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored list. Empty lists are never published.
    pub fn publish(&self, list: EchConfigList) {
        if list.is_empty() {
            warn!("Ignoring empty ECH config list");
            return;
        }
        info!("ECH config loaded ({} bytes)", list.len());
        *self.inner.write() = Some(list);
    }

    /// Current list, or `None` if nothing has been loaded yet.
    pub fn snapshot(&self) -> Option<EchConfigList> {
        self.inner.read().clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.read().is_some()
    }

    /// Re-run resolution for `domain`. The stored list is kept on failure.
    pub async fn refresh(&self, resolver: &EchResolver, domain: &str) -> Result<(), ResolveError> {
        resolver.resolve_into(domain, self).await
    }
}

impl fmt::Debug for EchStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EchStore")
            .field("list", &*self.inner.read())
            .finish()
    }
}

/// A TLS client context for one server name with ECH attached.
#[derive(Clone)]
pub struct TlsContext {
    config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
}

impl TlsContext {
    pub fn config(&self) -> Arc<ClientConfig> {
        self.config.clone()
    }

    pub fn server_name(&self) -> &ServerName<'static> {
        &self.server_name
    }

    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.config.clone())
    }
}

/// Builds ECH-enabled TLS client contexts on top of a fixed root store.
#[derive(Clone)]
pub struct TlsContextBuilder {
    root_store: Arc<RootCertStore>,
    crypto_provider: Arc<rustls::crypto::CryptoProvider>,
}

impl TlsContextBuilder {
    /// Use the platform trust store.
    pub fn with_native_roots() -> Result<Self, TlsSetupError> {
        let loaded = rustls_native_certs::load_native_certs();
        for err in &loaded.errors {
            warn!("Error loading system root certificate: {}", err);
        }

        let mut root_store = RootCertStore::empty();
        let (added, ignored) = root_store.add_parsable_certificates(loaded.certs);
        if root_store.is_empty() {
            return Err(TlsSetupError::RootCertLoadFailed(format!(
                "no usable certificates ({} errors, {} unparsable)",
                loaded.errors.len(),
                ignored
            )));
        }
        debug!("Loaded {} system root certificates ({} ignored)", added, ignored);

        Ok(Self::with_roots(root_store))
    }

    pub fn with_roots(root_store: RootCertStore) -> Self {
        Self {
            root_store: Arc::new(root_store),
            crypto_provider: Arc::new(crate::tls_crypto::build_provider()),
        }
    }

    /// Build a context that validates `server_name` and seals it with `ech`.
    pub fn build(&self, server_name: &str, ech: &EchConfigList) -> Result<TlsContext, TlsSetupError> {
        if ech.is_empty() {
            return Err(TlsSetupError::EmptyEchConfig);
        }

        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|_| TlsSetupError::InvalidServerName(server_name.to_string()))?;

        let ech_config = EchConfig::new(ech.to_rustls(), crate::tls_crypto::hpke_suites())
            .map_err(|e| TlsSetupError::EchSetupFailed(e.to_string()))?;

        // with_ech restricts the config to TLS 1.3
        let config = ClientConfig::builder_with_provider(self.crypto_provider.clone())
            .with_ech(EchMode::Enable(ech_config))
            .map_err(|e| TlsSetupError::EchSetupFailed(e.to_string()))?
            .with_root_certificates(self.root_store.clone())
            .with_no_client_auth();

        Ok(TlsContext {
            config: Arc::new(config),
            server_name,
        })
    }
}

/// Trait for streams that support bidirectional I/O
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadWrite for T {}

pub type BoxedStream = Box<dyn AsyncReadWrite>;

/// Secures a connected TCP stream for `server_name` using the ECH list.
#[async_trait]
pub trait TlsConnect: Send + Sync {
    async fn connect(
        &self,
        server_name: &str,
        ech: &EchConfigList,
        stream: TcpStream,
    ) -> Result<BoxedStream, DialError>;
}

/// Production [`TlsConnect`]: rustls with ECH enforced.
pub struct EchTlsConnector {
    builder: TlsContextBuilder,
}

impl EchTlsConnector {
    pub fn new(builder: TlsContextBuilder) -> Self {
        Self { builder }
    }
}

#[async_trait]
impl TlsConnect for EchTlsConnector {
    async fn connect(
        &self,
        server_name: &str,
        ech: &EchConfigList,
        stream: TcpStream,
    ) -> Result<BoxedStream, DialError> {
        let context = self.builder.build(server_name, ech)?;
        let tls_stream = context
            .connector()
            .connect(context.server_name().clone(), stream)
            .await
            .map_err(classify_handshake_error)?;

        let (_, conn) = tls_stream.get_ref();
        let ech_status = conn.ech_status();
        if ech_status != EchStatus::Accepted {
            warn!("ECH not accepted by {} (status: {:?})", server_name, ech_status);
            return Err(DialError::EchRejected);
        }
        debug!(
            "TLS connection to {} established, protocol: {:?}, ECH accepted",
            server_name,
            conn.protocol_version()
        );

        Ok(Box::new(tls_stream))
    }
}

fn classify_handshake_error(err: std::io::Error) -> DialError {
    let rejected = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .is_some_and(|e| {
            matches!(
                e,
                rustls::Error::PeerIncompatible(
                    rustls::PeerIncompatible::ServerRejectedEncryptedClientHello(_)
                )
            )
        });

    if rejected {
        DialError::EchRejected
    } else {
        DialError::Handshake(err)
    }
}
