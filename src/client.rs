//! Start/stop handle around the proxy server
//!
//! [`EchClient`] holds the configuration between runs and owns the running
//! server's shutdown handle, bound address and ECH state.

use crate::dns::{EchResolver, RelayDohClient};
use crate::ech::{EchConfigList, EchStore, EchTlsConnector, TlsConnect, TlsContextBuilder};
use crate::error::{EchProxyError, ResolveError, Result};
use crate::proxy::{EchProxyServer, ShutdownHandle};
use crate::tunnel::{RelayAddr, TunnelDialer};
use crate::ProxyConfig;
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

struct Running {
    shutdown: ShutdownHandle,
    local_addr: SocketAddr,
    ech: EchStore,
    relay: RelayAddr,
    pinned_ip: Option<String>,
    tls_builder: Option<TlsContextBuilder>,
}

/// ECH SOCKS5 proxy client
pub struct EchClient {
    config: RwLock<ProxyConfig>,
    tls: RwLock<Option<Arc<dyn TlsConnect>>>,
    running: Mutex<Option<Running>>,
}

impl Default for EchClient {
    fn default() -> Self {
        Self::new()
    }
}

impl EchClient {
    pub fn new() -> Self {
        Self::with_config(ProxyConfig::default())
    }

    pub fn with_config(config: ProxyConfig) -> Self {
        Self {
            config: RwLock::new(config),
            tls: RwLock::new(None),
            running: Mutex::new(None),
        }
    }

    /// Use `tls` instead of rustls with system roots for relay connections.
    pub fn with_tls_connector(self, tls: Arc<dyn TlsConnect>) -> Self {
        *self.tls.write() = Some(tls);
        self
    }

    /// Update the configuration used by the next [`start`](Self::start).
    ///
    /// The relay address, token and pinned IP are always replaced (empty
    /// clears token and IP). Empty listen, DoH and ECH domain values keep the
    /// current setting.
    pub fn configure(
        &self,
        server_addr: &str,
        listen_addr: &str,
        token: &str,
        server_ip: &str,
        doh_server: &str,
        ech_domain: &str,
    ) {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());

        let mut config = self.config.write();
        config.server_addr = server_addr.to_string();
        if !listen_addr.is_empty() {
            config.listen_addr = listen_addr.to_string();
        }
        config.token = non_empty(token);
        config.server_ip = non_empty(server_ip);
        if !doh_server.is_empty() {
            config.doh_server = doh_server.to_string();
        }
        if !ech_domain.is_empty() {
            config.ech_domain = ech_domain.to_string();
        }
    }

    pub fn config(&self) -> ProxyConfig {
        self.config.read().clone()
    }

    /// Forward log lines to `callback` in addition to the tracing output.
    ///
    /// Installs the default subscriber if none is set yet.
    pub fn set_log_callback<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        crate::logging::set_log_callback(Some(Arc::new(callback)));
    }

    /// Fetch the ECH config, bind the listener and start accepting.
    ///
    /// A failure is also logged, so hosts that only watch the log callback
    /// see why.
    pub async fn start(&self) -> Result<()> {
        let result = self.try_start().await;
        if let Err(e) = &result {
            error!("Failed to start ECH proxy: {}", e);
        }
        result
    }

    async fn try_start(&self) -> Result<()> {
        if self.running.lock().is_some() {
            return Err(EchProxyError::AlreadyRunning);
        }

        let config = self.config();
        let relay = config.validate()?;

        info!("Fetching ECH config for {}", config.ech_domain);
        let resolver = EchResolver::new(&config.doh_server)?;
        let ech = EchStore::new();
        ech.refresh(&resolver, &config.ech_domain).await?;

        let injected = self.tls.read().clone();
        let (tls, tls_builder) = match injected {
            Some(tls) => (tls, None),
            None => {
                let builder = TlsContextBuilder::with_native_roots()?;
                let tls: Arc<dyn TlsConnect> = Arc::new(EchTlsConnector::new(builder.clone()));
                (tls, Some(builder))
            }
        };

        let dialer = TunnelDialer::new(relay.clone(), ech.clone(), tls)
            .with_pinned_ip(config.server_ip.clone())
            .with_token(config.token.clone());

        let server = EchProxyServer::bind(&config.listen_addr, dialer).await?;
        let local_addr = server.local_addr();
        let shutdown = server.shutdown_handle();

        {
            let mut running = self.running.lock();
            if running.is_some() {
                return Err(EchProxyError::AlreadyRunning);
            }
            *running = Some(Running {
                shutdown,
                local_addr,
                ech,
                relay: relay.clone(),
                pinned_ip: config.server_ip.clone(),
                tls_builder,
            });
        }

        info!("Proxy started on {}", local_addr);
        info!("Relay: {}", relay);
        tokio::spawn(server.run());
        Ok(())
    }

    /// Stop accepting connections. Open tunnels run until they end.
    pub fn stop(&self) {
        if let Some(running) = self.running.lock().take() {
            running.shutdown.shutdown();
            info!("Proxy on {} stopped", running.local_addr);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    /// ECH config list loaded by the current run.
    pub fn ech_config(&self) -> Option<EchConfigList> {
        self.running.lock().as_ref().and_then(|r| r.ech.snapshot())
    }

    /// Send a raw DNS query through the relay's DoH front.
    pub async fn relay_dns_query(&self, wire: &[u8]) -> Result<Vec<u8>> {
        let (relay, pinned_ip, ech, tls_builder) = {
            let running = self.running.lock();
            let running = running
                .as_ref()
                .ok_or_else(|| EchProxyError::Config("proxy is not running".to_string()))?;
            (
                running.relay.clone(),
                running.pinned_ip.clone(),
                running.ech.snapshot(),
                running.tls_builder.clone(),
            )
        };

        let ech = ech.ok_or(ResolveError::NoEchParameter)?;
        let tls_builder = match tls_builder {
            Some(builder) => builder,
            None => TlsContextBuilder::with_native_roots()?,
        };

        let client = RelayDohClient::new(&relay, pinned_ip.as_deref(), &tls_builder, &ech).await?;
        Ok(client.query(wire).await?)
    }
}

impl Drop for EchClient {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configure_keeps_defaults_for_empty_values() {
        let client = EchClient::new();
        client.configure("relay.example.com:443/ws", "", "secret", "", "", "");

        let config = client.config();
        assert_eq!(config.server_addr, "relay.example.com:443/ws");
        assert_eq!(config.listen_addr, crate::DEFAULT_LISTEN_ADDR);
        assert_eq!(config.token.as_deref(), Some("secret"));
        assert_eq!(config.server_ip, None);
        assert_eq!(config.doh_server, crate::DEFAULT_DOH_SERVER);
        assert_eq!(config.ech_domain, crate::DEFAULT_ECH_DOMAIN);
    }

    #[test]
    fn configure_clears_token_and_ip() {
        let client = EchClient::new();
        client.configure("a:1", "127.0.0.1:1080", "t", "1.2.3.4", "doh.example/q", "ech.example");
        client.configure("b:2", "", "", "", "", "");

        let config = client.config();
        assert_eq!(config.server_addr, "b:2");
        assert_eq!(config.listen_addr, "127.0.0.1:1080");
        assert!(config.token.is_none());
        assert!(config.server_ip.is_none());
        assert_eq!(config.doh_server, "doh.example/q");
        assert_eq!(config.ech_domain, "ech.example");
    }

    #[tokio::test]
    async fn start_without_relay_is_config_error() {
        let client = EchClient::new();
        assert!(matches!(client.start().await, Err(EchProxyError::Config(_))));
        assert!(!client.is_running());
        assert!(client.local_addr().is_none());
    }

    #[tokio::test]
    async fn start_failure_reaches_log_callback() {
        let lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = lines.clone();
        let client = EchClient::new();
        client.set_log_callback(move |line| sink.lock().push(line.to_string()));

        assert!(client.start().await.is_err());
        crate::logging::set_log_callback(None);

        let lines = lines.lock();
        assert!(
            lines
                .iter()
                .any(|l| l.starts_with("[ERROR]") && l.contains("server address is not configured")),
            "{lines:?}"
        );
    }

    #[tokio::test]
    async fn relay_query_requires_running_proxy() {
        let client = EchClient::new();
        assert!(matches!(
            client.relay_dns_query(&[0u8; 12]).await,
            Err(EchProxyError::Config(_))
        ));
    }

    #[test]
    fn stop_when_idle_is_noop() {
        let client = EchClient::new();
        client.stop();
        assert!(!client.is_running());
    }
}
