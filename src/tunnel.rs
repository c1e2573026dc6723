//! WebSocket tunnel to the relay
//!
//! A dial connects TCP (to the pinned address if one is set), secures it
//! with TLS + ECH for the relay host, upgrades to WebSocket and sends the
//! SOCKS target as the first text frame. After that every frame is raw
//! payload in one direction or the other.

use crate::ech::{BoxedStream, EchStore, TlsConnect};
use crate::error::DialError;
use crate::socks5::SocksTarget;
use futures_util::{SinkExt, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{client_async, WebSocketStream};
use tracing::debug;

/// Bound on TCP connect + TLS handshake + WebSocket upgrade.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest chunk read from the client per binary frame.
pub const RELAY_BUFFER_SIZE: usize = 32 * 1024;

pub type RelayStream = WebSocketStream<BoxedStream>;

/// Relay location: `host:port` plus the WebSocket path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayAddr {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl RelayAddr {
    /// Parse `host:port[/path]`. IPv6 hosts are written in brackets.
    pub fn parse(addr: &str) -> Result<Self, DialError> {
        let invalid = || DialError::InvalidRelayAddr(addr.to_string());

        let (host_port, path) = match addr.find('/') {
            Some(idx) => (&addr[..idx], &addr[idx..]),
            None => (addr, "/"),
        };

        let (host, port) = if let Some(rest) = host_port.strip_prefix('[') {
            let (host, rest) = rest.split_once(']').ok_or_else(invalid)?;
            let port = rest.strip_prefix(':').ok_or_else(invalid)?;
            (host, port)
        } else {
            host_port.rsplit_once(':').ok_or_else(invalid)?
        };

        if host.is_empty() || (host.contains(':') && !host_port.starts_with('[')) {
            return Err(invalid());
        }
        let port: u16 = port.parse().map_err(|_| invalid())?;

        Ok(Self {
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }

    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn ws_url(&self) -> String {
        format!("wss://{}{}", self.authority(), self.path)
    }
}

impl fmt::Display for RelayAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.authority(), self.path)
    }
}

/// Opens WebSocket tunnels to a fixed relay.
pub struct TunnelDialer {
    relay: RelayAddr,
    pinned_host: Option<String>,
    token: Option<String>,
    ech: EchStore,
    tls: Arc<dyn TlsConnect>,
}

impl TunnelDialer {
    pub fn new(relay: RelayAddr, ech: EchStore, tls: Arc<dyn TlsConnect>) -> Self {
        Self {
            relay,
            pinned_host: None,
            token: None,
            ech,
            tls,
        }
    }

    /// Dial this address instead of the relay host. TLS still verifies the host.
    pub fn with_pinned_ip(mut self, pinned: Option<String>) -> Self {
        self.pinned_host = pinned;
        self
    }

    /// Offer `token` as the WebSocket subprotocol.
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn relay(&self) -> &RelayAddr {
        &self.relay
    }

    /// Open a tunnel and announce `target` to the relay.
    pub async fn open(&self, target: &SocksTarget) -> Result<RelayStream, DialError> {
        let mut ws = tokio::time::timeout(DIAL_TIMEOUT, self.dial())
            .await
            .map_err(|_| DialError::Timeout)??;

        ws.send(Message::Text(target.to_string()))
            .await
            .map_err(DialError::SendTarget)?;
        Ok(ws)
    }

    async fn dial(&self) -> Result<RelayStream, DialError> {
        let ech = self.ech.snapshot().ok_or(DialError::EchUnavailable)?;

        let connect_host = self.pinned_host.as_deref().unwrap_or(&self.relay.host);
        let tcp = TcpStream::connect((connect_host, self.relay.port))
            .await
            .map_err(|source| DialError::Connect {
                addr: format!("{}:{}", connect_host, self.relay.port),
                source,
            })?;
        let _ = tcp.set_nodelay(true);

        let tls_stream = self.tls.connect(&self.relay.host, &ech, tcp).await?;

        let mut request = self
            .relay
            .ws_url()
            .into_client_request()
            .map_err(DialError::WebSocket)?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(token)
                .map_err(|e| DialError::WebSocket(tungstenite::Error::HttpFormat(e.into())))?;
            request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
        }

        let (ws, _response) = client_async(request, tls_stream)
            .await
            .map_err(DialError::WebSocket)?;
        debug!("WebSocket tunnel to {} established", self.relay);
        Ok(ws)
    }
}

/// Bytes moved in each direction of a finished session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub client_to_relay: u64,
    pub relay_to_client: u64,
}

/// A SOCKS client paired with its relay tunnel.
pub struct TunnelSession<C, R = BoxedStream> {
    client: C,
    relay: WebSocketStream<R>,
    target: SocksTarget,
}

impl<C, R> TunnelSession<C, R>
where
    C: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(client: C, relay: WebSocketStream<R>, target: SocksTarget) -> Self {
        Self {
            client,
            relay,
            target,
        }
    }

    /// Forward in both directions until both have ended.
    ///
    /// Client EOF sends a WebSocket close; relay close shuts down the client
    /// write side. Both connections are dropped when this returns.
    pub async fn pump(self) -> PumpStats {
        let Self {
            client,
            relay,
            target,
        } = self;
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut relay_sink, mut relay_stream) = relay.split();

        let upstream = async {
            let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
            let mut total = 0u64;
            loop {
                let n = match client_read.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if relay_sink.send(Message::Binary(buf[..n].to_vec())).await.is_err() {
                    break;
                }
                total += n as u64;
            }
            let _ = relay_sink.close().await;
            total
        };

        let downstream = async {
            let mut total = 0u64;
            while let Some(message) = relay_stream.next().await {
                let payload = match message {
                    Ok(Message::Binary(data)) => data,
                    Ok(Message::Text(text)) => text.into_bytes(),
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                if client_write.write_all(&payload).await.is_err() {
                    break;
                }
                total += payload.len() as u64;
            }
            let _ = client_write.shutdown().await;
            total
        };

        let (client_to_relay, relay_to_client) = tokio::join!(upstream, downstream);
        let stats = PumpStats {
            client_to_relay,
            relay_to_client,
        };
        debug!(
            "Tunnel to {} closed: {} bytes up, {} bytes down",
            target, stats.client_to_relay, stats.relay_to_client
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socks5::TargetHost;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};
    use tokio::io::{duplex, DuplexStream, ReadBuf};
    use tokio_tungstenite::tungstenite::protocol::Role;

    fn target() -> SocksTarget {
        SocksTarget {
            host: TargetHost::Domain("example.com".to_string()),
            port: 443,
        }
    }

    async fn ws_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (a, b) = duplex(64 * 1024);
        let client = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
        (client, server)
    }

    #[test]
    fn parse_host_port_path() {
        let relay = RelayAddr::parse("relay.example.com:8443/ws/tunnel").unwrap();
        assert_eq!(relay.host, "relay.example.com");
        assert_eq!(relay.port, 8443);
        assert_eq!(relay.path, "/ws/tunnel");
        assert_eq!(relay.ws_url(), "wss://relay.example.com:8443/ws/tunnel");
    }

    #[test]
    fn parse_defaults_path() {
        let relay = RelayAddr::parse("relay.example.com:443").unwrap();
        assert_eq!(relay.path, "/");
        assert_eq!(relay.ws_url(), "wss://relay.example.com:443/");
    }

    #[test]
    fn parse_bracketed_ipv6() {
        let relay = RelayAddr::parse("[2001:db8::1]:443/p").unwrap();
        assert_eq!(relay.host, "2001:db8::1");
        assert_eq!(relay.authority(), "[2001:db8::1]:443");
    }

    #[test]
    fn parse_rejects_malformed() {
        for bad in ["relay.example.com", ":443", "relay:notaport", "2001:db8::1:443", "[::1/x"] {
            assert!(
                matches!(RelayAddr::parse(bad), Err(DialError::InvalidRelayAddr(_))),
                "{bad}"
            );
        }
    }

    #[tokio::test]
    async fn pump_forwards_both_ways() {
        let (relay_client, mut relay_server) = ws_pair().await;
        let (local, mut app) = duplex(64 * 1024);

        let session = TunnelSession::new(local, relay_client, target());
        let pump = tokio::spawn(session.pump());

        app.write_all(b"ping").await.unwrap();
        match relay_server.next().await.unwrap().unwrap() {
            Message::Binary(data) => assert_eq!(data, b"ping"),
            other => panic!("unexpected frame: {other:?}"),
        }

        relay_server
            .send(Message::Binary(b"pong".to_vec()))
            .await
            .unwrap();
        let mut buf = [0u8; 4];
        app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Client EOF closes the tunnel; relay answers the close.
        app.shutdown().await.unwrap();
        drop(app);
        while let Some(Ok(message)) = relay_server.next().await {
            if message.is_close() {
                break;
            }
        }
        let _ = relay_server.close(None).await;

        let stats = tokio::time::timeout(Duration::from_secs(5), pump)
            .await
            .expect("pump did not finish")
            .unwrap();
        assert_eq!(stats.client_to_relay, 4);
        assert_eq!(stats.relay_to_client, 4);
    }

    /// Client stream that counts shutdowns and drops.
    struct Counted {
        inner: DuplexStream,
        shutdowns: Arc<AtomicUsize>,
        drops: Arc<AtomicUsize>,
    }

    impl Drop for Counted {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl AsyncRead for Counted {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for Counted {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            let result = Pin::new(&mut self.inner).poll_shutdown(cx);
            if result.is_ready() {
                self.shutdowns.fetch_add(1, Ordering::SeqCst);
            }
            result
        }
    }

    #[tokio::test]
    async fn teardown_when_both_sides_drop() {
        let (relay_client, relay_server) = ws_pair().await;
        let (local, app) = duplex(1024);
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let drops = Arc::new(AtomicUsize::new(0));
        let client = Counted {
            inner: local,
            shutdowns: shutdowns.clone(),
            drops: drops.clone(),
        };

        let session = TunnelSession::new(client, relay_client, target());
        drop(app);
        drop(relay_server);

        let stats = tokio::time::timeout(Duration::from_secs(5), session.pump())
            .await
            .expect("pump did not finish");
        assert_eq!(stats, PumpStats::default());
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
