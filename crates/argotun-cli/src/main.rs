//! argotun - edge tunnel client.
//!
//! Connects outbound to the edge over QUIC, registers the tunnel and
//! reverse-proxies incoming requests to a local origin server.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use argotun_client::{ClientConfig, Credentials, OriginConfig, Tunnel, TunnelMode};
use argotun_connection::Multiplexer;
use argotun_proto::{EDGE_DEFAULT_HOST, EDGE_DEFAULT_PORT};
use argotun_transport_quic::{QuicConfig, QuicTransport};

/// Expose a local origin server through an edge tunnel.
#[derive(Parser, Debug)]
#[command(name = "argotun")]
#[command(about = "Edge tunnel client", version)]
struct Cli {
    /// "full" runs the tunnel; any other value is a handshake-only smoke
    /// test that exits after the QUIC handshake.
    #[arg(long, env = "CF_MODE", default_value = "handshake")]
    mode: String,

    /// Edge hostname.
    #[arg(long, env = "CF_EDGE", default_value = EDGE_DEFAULT_HOST)]
    edge: String,

    /// Edge port.
    #[arg(long, env = "CF_PORT", default_value_t = EDGE_DEFAULT_PORT)]
    port: u16,

    /// Tunnel UUID (hyphenated or bare 32 hex digits). Required in full
    /// mode.
    #[arg(long, env = "CF_TUNNEL_ID")]
    tunnel_id: Option<String>,

    /// Account tag. Required in full mode.
    #[arg(long, env = "CF_ACCOUNT_TAG")]
    account_tag: Option<String>,

    /// Base64-encoded tunnel secret. Required in full mode.
    #[arg(long, env = "CF_TUNNEL_SECRET", hide_env_values = true)]
    tunnel_secret: Option<String>,

    /// Origin base URL (plain HTTP).
    #[arg(long, env = "CF_ORIGIN_URL", default_value = "http://localhost:8080")]
    origin_url: String,

    /// Log level (trace, debug, info, warn, error). RUST_LOG overrides.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with(fmt::layer())
        .init();

    let mode = TunnelMode::from_mode_string(&cli.mode);
    let mut config = ClientConfig::new(mode);
    config.edge_host = cli.edge;
    config.edge_port = cli.port;
    config.origin = OriginConfig::from_url(&cli.origin_url)
        .with_context(|| format!("invalid origin url '{}'", cli.origin_url))?;

    if mode == TunnelMode::Full {
        let tunnel_id = cli.tunnel_id.context("CF_TUNNEL_ID is required in full mode")?;
        let account_tag = cli
            .account_tag
            .context("CF_ACCOUNT_TAG is required in full mode")?;
        let tunnel_secret = cli
            .tunnel_secret
            .context("CF_TUNNEL_SECRET is required in full mode")?;
        config.credentials = Some(
            Credentials::parse(&tunnel_id, &account_tag, &tunnel_secret)
                .context("invalid tunnel credentials")?,
        );
    }

    info!(
        edge = %config.edge_host,
        port = config.edge_port,
        mode = ?config.mode,
        "starting tunnel"
    );

    let quic_config = QuicConfig::new(config.edge_host.clone(), config.edge_port);
    let transport = QuicTransport::connect(&quic_config)
        .await
        .context("failed to connect to edge")?;

    let mut tunnel = Tunnel::new(&config);
    let mut connection = Multiplexer::new(transport);
    connection
        .run(&mut tunnel)
        .await
        .context("tunnel connection failed")?;

    info!("tunnel exited");
    Ok(())
}
