//! DOH lookup of the ECH config list from an HTTPS DNS record

use crate::dns_wire::{self, TYPE_HTTPS};
use crate::ech::{EchConfigList, EchStore, TlsContextBuilder};
use crate::error::{ResolveError, TlsSetupError};
use crate::tunnel::RelayAddr;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use reqwest::{header, Client, StatusCode, Url};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::lookup_host;
use tracing::{debug, info};

/// Timeout for a single DoH exchange.
pub const DOH_TIMEOUT: Duration = Duration::from_secs(10);

const DNS_MESSAGE: &str = "application/dns-message";

/// Host the relay fronts for DNS queries.
pub const RELAY_DOH_HOST: &str = "cloudflare-dns.com";

/// Fetches ECH config lists with DoH GET requests.
#[derive(Clone)]
pub struct EchResolver {
    doh_url: Url,
    client: Client,
}

impl EchResolver {
    /// Create a resolver for `doh_server`.
    ///
    /// A bare `host/path` gets an `https://` scheme.
    pub fn new(doh_server: &str) -> Result<Self, ResolveError> {
        let doh_url = normalize_doh_url(doh_server)?;
        let client = Client::builder()
            .timeout(DOH_TIMEOUT)
            .build()
            .map_err(|e| ResolveError::DnsQueryFailed(format!("Failed to build DoH client: {}", e)))?;
        Ok(Self { doh_url, client })
    }

    pub fn doh_url(&self) -> &Url {
        &self.doh_url
    }

    /// The GET URL for an HTTPS query on `domain`.
    pub fn query_url(&self, domain: &str) -> Result<Url, ResolveError> {
        let encoded = URL_SAFE_NO_PAD.encode(dns_wire::build_query(domain, TYPE_HTTPS)?);

        let mut url = self.doh_url.clone();
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| key != "dns")
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        url.query_pairs_mut()
            .clear()
            .extend_pairs(kept)
            .append_pair("dns", &encoded);
        Ok(url)
    }

    /// Look up the ECH config list published for `domain`.
    pub async fn resolve(&self, domain: &str) -> Result<EchConfigList, ResolveError> {
        let start = std::time::Instant::now();
        let response = self
            .client
            .get(self.query_url(domain)?)
            .header(header::ACCEPT, DNS_MESSAGE)
            .header(header::CONTENT_TYPE, DNS_MESSAGE)
            .send()
            .await
            .map_err(|e| ResolveError::DnsQueryFailed(format!("DoH GET failed: {}", e)))?;

        if response.status() != StatusCode::OK {
            return Err(ResolveError::DnsQueryFailed(format!(
                "DoH GET http error: {}",
                response.status()
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ResolveError::DnsQueryFailed(format!("DoH GET read failed: {}", e)))?;

        let encoded = dns_wire::parse_response(&body)?;
        let raw = STANDARD.decode(encoded.as_bytes())?;

        debug!(
            "ECH DoH lookup for {} returned {} bytes in {} ms",
            domain,
            raw.len(),
            start.elapsed().as_millis()
        );
        Ok(EchConfigList::new(raw))
    }

    /// Resolve `domain` and publish the result into `store`.
    pub async fn resolve_into(&self, domain: &str, store: &EchStore) -> Result<(), ResolveError> {
        let list = self.resolve(domain).await?;
        info!("Resolved ECH config for {} via {}", domain, self.doh_url);
        store.publish(list);
        Ok(())
    }
}

fn normalize_doh_url(doh_server: &str) -> Result<Url, ResolveError> {
    let doh_server = doh_server.trim();
    if doh_server.is_empty() {
        return Err(ResolveError::InvalidUrl("empty DoH server".to_string()));
    }

    let with_scheme = if doh_server.starts_with("https://") || doh_server.starts_with("http://") {
        doh_server.to_string()
    } else {
        format!("https://{}", doh_server)
    };

    Url::parse(&with_scheme)
        .map_err(|e| ResolveError::InvalidUrl(format!("Invalid DOH URL '{}': {}", doh_server, e)))
}

/// Sends raw DNS wire queries through the relay's DoH front.
///
/// Requests go to `https://cloudflare-dns.com:<relay port>/dns-query` with
/// ECH enabled, dialled at the pinned address when one is configured.
pub struct RelayDohClient {
    url: Url,
    client: Client,
}

impl RelayDohClient {
    pub async fn new(
        relay: &RelayAddr,
        pinned_ip: Option<&str>,
        tls: &TlsContextBuilder,
        ech: &EchConfigList,
    ) -> Result<Self, ResolveError> {
        let context = tls.build(RELAY_DOH_HOST, ech).map_err(tls_error)?;

        let url = Url::parse(&format!("https://{}:{}/dns-query", RELAY_DOH_HOST, relay.port))
            .map_err(|e| ResolveError::InvalidUrl(e.to_string()))?;

        let mut builder = Client::builder()
            .timeout(DOH_TIMEOUT)
            .use_preconfigured_tls((*context.config()).clone());

        if let Some(pinned) = pinned_ip {
            let addr = resolve_pinned(pinned, relay.port).await?;
            debug!("Routing {} to pinned address {}", RELAY_DOH_HOST, addr);
            builder = builder.resolve(RELAY_DOH_HOST, addr);
        }

        let client = builder
            .build()
            .map_err(|e| ResolveError::DnsQueryFailed(format!("Failed to build DoH client: {}", e)))?;

        Ok(Self::from_parts(url, client))
    }

    fn from_parts(url: Url, client: Client) -> Self {
        Self { url, client }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// POST `wire` and return the raw DNS response.
    pub async fn query(&self, wire: &[u8]) -> Result<Vec<u8>, ResolveError> {
        let response = self
            .client
            .post(self.url.clone())
            .header(header::ACCEPT, DNS_MESSAGE)
            .header(header::CONTENT_TYPE, DNS_MESSAGE)
            .body(wire.to_vec())
            .send()
            .await
            .map_err(|e| ResolveError::DnsQueryFailed(format!("DoH POST failed: {}", e)))?;

        if response.status() != StatusCode::OK {
            return Err(ResolveError::DnsQueryFailed(format!(
                "DoH POST http error: {}",
                response.status()
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ResolveError::DnsQueryFailed(format!("DoH POST read failed: {}", e)))?;
        Ok(body.to_vec())
    }
}

async fn resolve_pinned(pinned: &str, port: u16) -> Result<SocketAddr, ResolveError> {
    if let Ok(ip) = pinned.parse() {
        return Ok(SocketAddr::new(ip, port));
    }
    lookup_host((pinned, port))
        .await
        .map_err(|e| ResolveError::DnsQueryFailed(format!("Failed to resolve {}: {}", pinned, e)))?
        .next()
        .ok_or_else(|| ResolveError::DnsQueryFailed(format!("No address for {}", pinned)))
}

fn tls_error(e: TlsSetupError) -> ResolveError {
    ResolveError::DnsQueryFailed(format!("TLS setup for {} failed: {}", RELAY_DOH_HOST, e))
}
