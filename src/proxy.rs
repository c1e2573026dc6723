//! Local SOCKS5 listener feeding the ECH WebSocket tunnel
//!
//! Each accepted connection gets its own task. The first byte picks the
//! protocol: 0x05 is SOCKS5, anything else is closed without a reply.

use crate::error::{EchProxyError, Result};
use crate::socks5::{self, REPLY_HOST_UNREACHABLE, REPLY_SUCCEEDED, SOCKS5_VERSION};
use crate::tunnel::{TunnelDialer, TunnelSession};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Deadline for the first byte of a new connection.
pub const FIRST_BYTE_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause after a failed accept so a persistent error (e.g. EMFILE) does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// SOCKS5 proxy server bound to a local address
pub struct EchProxyServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    dialer: Arc<TunnelDialer>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_rx: broadcast::Receiver<()>,
}

/// Stops the accept loop of a running [`EchProxyServer`].
#[derive(Clone)]
pub struct ShutdownHandle {
    shutdown_tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl EchProxyServer {
    /// Bind the listener. Nothing is accepted until [`run`](Self::run).
    pub async fn bind(addr: &str, dialer: TunnelDialer) -> Result<Self> {
        let listen_err = |source| EchProxyError::Listen {
            addr: addr.to_string(),
            source,
        };
        let listener = TcpListener::bind(addr).await.map_err(listen_err)?;
        let local_addr = listener.local_addr().map_err(listen_err)?;
        // Subscribed now so a shutdown sent before `run` is not lost.
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        Ok(Self {
            listener,
            local_addr,
            dialer: Arc::new(dialer),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Get the local address the server is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shutdown_tx: self.shutdown_tx.clone(),
        }
    }

    /// Accept connections until shut down.
    ///
    /// The listener closes when this returns. Sessions already running are
    /// left to finish on their own.
    pub async fn run(mut self) {
        info!("SOCKS5 proxy listening on {}", self.local_addr);

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!("New connection from {}", peer_addr);
                            let _ = stream.set_nodelay(true);
                            let dialer = self.dialer.clone();

                            tokio::spawn(async move {
                                match handle_connection(stream, &dialer).await {
                                    Ok(()) => {}
                                    Err(EchProxyError::Protocol(e)) => {
                                        debug!("Dropped connection from {}: {}", peer_addr, e);
                                    }
                                    Err(e) => {
                                        warn!("Connection error from {}: {}", peer_addr, e);
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!("Shutting down proxy server on {}", self.local_addr);
                    break;
                }
            }
        }
    }
}

/// Handle a single connection
async fn handle_connection<S>(mut client: S, dialer: &TunnelDialer) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let first = match tokio::time::timeout(FIRST_BYTE_TIMEOUT, client.read_u8()).await {
        Ok(Ok(byte)) => byte,
        Ok(Err(e)) => return Err(socks5_io(e)),
        Err(_) => {
            debug!("No data within {:?}, closing", FIRST_BYTE_TIMEOUT);
            return Ok(());
        }
    };

    if first != SOCKS5_VERSION {
        warn!("Unsupported protocol (first byte 0x{:02x}), closing", first);
        return Ok(());
    }

    handle_socks5(client, first, dialer).await
}

fn socks5_io(e: std::io::Error) -> EchProxyError {
    EchProxyError::Protocol(e.into())
}

/// Serve one SOCKS5 client whose version byte has already been read.
///
/// The success reply is written only once the tunnel is open and the target
/// has been sent; a failed dial gets host-unreachable instead.
pub async fn handle_socks5<S>(mut client: S, version: u8, dialer: &TunnelDialer) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target = socks5::handshake(&mut client, version).await?;
    info!(%target, "SOCKS5 CONNECT");

    let relay = match dialer.open(&target).await {
        Ok(relay) => relay,
        Err(e) => {
            let _ = socks5::send_reply(&mut client, REPLY_HOST_UNREACHABLE).await;
            return Err(e.into());
        }
    };

    socks5::send_reply(&mut client, REPLY_SUCCEEDED).await?;
    TunnelSession::new(client, relay, target).pump().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ech::{BoxedStream, EchConfigList, EchStore, TlsConnect};
    use crate::error::DialError;
    use crate::tunnel::RelayAddr;
    use async_trait::async_trait;
    use futures_util::{SinkExt, StreamExt};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message;

    /// Hands the TCP stream back untouched.
    struct Passthrough;

    #[async_trait]
    impl TlsConnect for Passthrough {
        async fn connect(
            &self,
            _server_name: &str,
            _ech: &EchConfigList,
            stream: TcpStream,
        ) -> std::result::Result<BoxedStream, DialError> {
            Ok(Box::new(stream))
        }
    }

    /// Never finishes the handshake.
    struct Stalled;

    #[async_trait]
    impl TlsConnect for Stalled {
        async fn connect(
            &self,
            _server_name: &str,
            _ech: &EchConfigList,
            _stream: TcpStream,
        ) -> std::result::Result<BoxedStream, DialError> {
            std::future::pending().await
        }
    }

    fn loaded_store() -> EchStore {
        let store = EchStore::new();
        store.publish(EchConfigList::new(vec![0xfe, 0x0d]));
        store
    }

    fn dialer(relay: &str, ech: EchStore) -> TunnelDialer {
        TunnelDialer::new(RelayAddr::parse(relay).unwrap(), ech, Arc::new(Passthrough))
    }

    const CONNECT_EXAMPLE: &[u8] = &[
        0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x03, 11, b'e', b'x', b'a', b'm', b'p', b'l', b'e',
        b'.', b'c', b'o', b'm', 0x01, 0xbb,
    ];

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn dial_failure_replies_host_unreachable() {
        let port = closed_port().await;
        let dialer = dialer(&format!("127.0.0.1:{port}"), loaded_store());

        let (mut app, local) = tokio::io::duplex(1024);
        app.write_all(&CONNECT_EXAMPLE[1..]).await.unwrap();

        let result = handle_socks5(local, 0x05, &dialer).await;
        assert!(matches!(result, Err(EchProxyError::Dial(DialError::Connect { .. }))));

        let mut written = Vec::new();
        app.read_to_end(&mut written).await.unwrap();
        assert_eq!(
            written,
            vec![0x05, 0x00, 0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
        );
    }

    #[tokio::test]
    async fn missing_ech_fails_the_dial() {
        let dialer = dialer("127.0.0.1:9", EchStore::new());

        let (mut app, local) = tokio::io::duplex(1024);
        app.write_all(&CONNECT_EXAMPLE[1..]).await.unwrap();

        let result = handle_socks5(local, 0x05, &dialer).await;
        assert!(matches!(result, Err(EchProxyError::Dial(DialError::EchUnavailable))));

        let mut written = Vec::new();
        app.read_to_end(&mut written).await.unwrap();
        assert_eq!(&written[2..4], &[0x05, 0x04]);
    }

    #[tokio::test]
    async fn success_reply_follows_target_frame() {
        let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = relay.local_addr().unwrap();
        let relay_task = tokio::spawn(async move {
            let (stream, _) = relay.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let first = ws.next().await.unwrap().unwrap();
            assert_eq!(first, Message::Text("example.com:443".to_string()));
            while let Some(Ok(message)) = ws.next().await {
                if message.is_binary() {
                    ws.send(message).await.unwrap();
                } else if message.is_close() {
                    break;
                }
            }
        });

        let server = EchProxyServer::bind("127.0.0.1:0", dialer(&relay_addr.to_string(), loaded_store()))
            .await
            .unwrap();
        let proxy_addr = server.local_addr();
        let shutdown = server.shutdown_handle();
        tokio::spawn(server.run());

        let mut app = TcpStream::connect(proxy_addr).await.unwrap();
        app.write_all(CONNECT_EXAMPLE).await.unwrap();

        let mut reply = [0u8; 12];
        app.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00, 0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

        app.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        app.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");

        drop(app);
        tokio::time::timeout(Duration::from_secs(5), relay_task)
            .await
            .expect("relay did not see close")
            .unwrap();
        shutdown.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn dial_timeout_replies_host_unreachable() {
        let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = RelayAddr::parse(&relay.local_addr().unwrap().to_string()).unwrap();
        let dialer = TunnelDialer::new(relay_addr, loaded_store(), Arc::new(Stalled));

        let (mut app, local) = tokio::io::duplex(1024);
        app.write_all(&CONNECT_EXAMPLE[1..]).await.unwrap();

        let result = handle_socks5(local, 0x05, &dialer).await;
        assert!(matches!(result, Err(EchProxyError::Dial(DialError::Timeout))));

        let mut written = Vec::new();
        app.read_to_end(&mut written).await.unwrap();
        assert_eq!(
            written,
            vec![0x05, 0x00, 0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
        );
        drop(relay);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_closed_after_first_byte_deadline() {
        let dialer = dialer("127.0.0.1:9", loaded_store());
        let (mut app, local) = tokio::io::duplex(64);

        let started = tokio::time::Instant::now();
        handle_connection(local, &dialer).await.unwrap();
        assert!(started.elapsed() >= FIRST_BYTE_TIMEOUT);

        let mut written = Vec::new();
        app.read_to_end(&mut written).await.unwrap();
        assert!(written.is_empty());
    }

    #[tokio::test]
    async fn non_socks_first_byte_is_closed() {
        let server = EchProxyServer::bind("127.0.0.1:0", dialer("127.0.0.1:9", loaded_store()))
            .await
            .unwrap();
        let proxy_addr = server.local_addr();
        tokio::spawn(server.run());

        let mut app = TcpStream::connect(proxy_addr).await.unwrap();
        app.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let mut buf = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), app.read_to_end(&mut buf))
            .await
            .expect("connection was not closed")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn bind_failure_is_listen_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let result = EchProxyServer::bind(&addr, dialer("127.0.0.1:9", loaded_store())).await;
        assert!(matches!(result, Err(EchProxyError::Listen { .. })));
    }
}
