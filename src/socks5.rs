//! SOCKS5 server side: greeting, CONNECT request and replies (RFC 1928).
//!
//! Only the no-auth method and the CONNECT command are served. The success
//! reply is not written here; the caller sends it once the tunnel is open.

use crate::error::Socks5Error;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const SOCKS5_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;

pub const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// SOCKS5 reply codes.
pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_HOST_UNREACHABLE: u8 = 0x04;
pub const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
    DomainName,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetHost {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

/// Destination requested by a SOCKS5 CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksTarget {
    pub host: TargetHost,
    pub port: u16,
}

impl SocksTarget {
    pub fn address_family(&self) -> AddressFamily {
        match self.host {
            TargetHost::Ipv4(_) => AddressFamily::Ipv4,
            TargetHost::Ipv6(_) => AddressFamily::Ipv6,
            TargetHost::Domain(_) => AddressFamily::DomainName,
        }
    }
}

/// `host:port`, with IPv6 hosts in brackets.
impl fmt::Display for SocksTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            TargetHost::Ipv4(ip) => write!(f, "{}:{}", ip, self.port),
            TargetHost::Ipv6(ip) => write!(f, "[{}]:{}", ip, self.port),
            TargetHost::Domain(name) => write!(f, "{}:{}", name, self.port),
        }
    }
}

/// Run the greeting and read the CONNECT request.
///
/// `version` is the first byte of the connection, already consumed by the
/// dispatcher.
pub async fn handshake<S>(stream: &mut S, version: u8) -> Result<SocksTarget, Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate_method(stream, version).await?;
    read_request(stream).await
}

/// Method negotiation. Whatever methods are offered, no-auth is selected.
pub async fn negotiate_method<S>(stream: &mut S, version: u8) -> Result<(), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if version != SOCKS5_VERSION {
        return Err(Socks5Error::InvalidVersion(version));
    }

    let nmethods = stream.read_u8().await? as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    stream.write_all(&[SOCKS5_VERSION, METHOD_NO_AUTH]).await?;
    Ok(())
}

/// Read the request that follows negotiation.
///
/// A bad version or a command other than CONNECT aborts without a reply.
/// An unknown address type is answered with 0x08 before failing.
pub async fn read_request<S>(stream: &mut S) -> Result<SocksTarget, Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // VER CMD RSV ATYP
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS5_VERSION {
        return Err(Socks5Error::InvalidVersion(header[0]));
    }
    if header[1] != CMD_CONNECT {
        return Err(Socks5Error::UnsupportedCommand(header[1]));
    }

    let atyp = header[3];
    let host = match atyp {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            TargetHost::Ipv4(Ipv4Addr::from(ip))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            let name = String::from_utf8(name).map_err(|_| Socks5Error::InvalidDomain)?;
            TargetHost::Domain(name)
        }
        ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            TargetHost::Ipv6(Ipv6Addr::from(ip))
        }
        _ => {
            let _ = send_reply(stream, REPLY_ADDRESS_TYPE_NOT_SUPPORTED).await;
            return Err(Socks5Error::UnsupportedAddressType(atyp));
        }
    };

    let port = stream.read_u16().await?;
    Ok(SocksTarget { host, port })
}

/// Send a reply with a zeroed IPv4 bind address (0.0.0.0:0).
pub async fn send_reply<S>(stream: &mut S, reply: u8) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&[SOCKS5_VERSION, reply, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await
}
