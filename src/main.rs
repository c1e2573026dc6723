//! ECH Proxy - Standalone executable

use clap::Parser;
use ech_proxy::{logging, EchClient, DEFAULT_DOH_SERVER, DEFAULT_ECH_DOMAIN, DEFAULT_LISTEN_ADDR};
use tracing::info;

/// Local SOCKS5 proxy tunnelling over WebSocket with TLS Encrypted Client Hello
#[derive(Parser, Debug)]
#[command(name = "ech-proxy", version)]
struct Args {
    /// Local SOCKS5 listen address
    #[arg(short = 'l', long, default_value = DEFAULT_LISTEN_ADDR)]
    listen: String,

    /// Relay address: host:port[/path]
    #[arg(short = 'f', long = "forward")]
    forward: String,

    /// Connect to this IP instead of resolving the relay host
    #[arg(long)]
    ip: Option<String>,

    /// Token offered as the WebSocket subprotocol
    #[arg(long)]
    token: Option<String>,

    /// DoH server used for the ECH lookup
    #[arg(long, default_value = DEFAULT_DOH_SERVER)]
    dns: String,

    /// Domain whose HTTPS record carries the ECH config
    #[arg(long, default_value = DEFAULT_ECH_DOMAIN)]
    ech: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    logging::init_logging();

    info!("Starting ECH proxy");

    let client = EchClient::new();
    client.configure(
        &args.forward,
        &args.listen,
        args.token.as_deref().unwrap_or_default(),
        args.ip.as_deref().unwrap_or_default(),
        &args.dns,
        &args.ech,
    );

    client.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    client.stop();

    Ok(())
}
