use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use jabberwock::{ChatServer, ServerConfig};

/// Single-threaded chat message router.
#[derive(Debug, Parser)]
#[command(name = "jabberwockd", version, about)]
struct Args {
    /// Routable domain this server answers for
    #[arg(long)]
    domain: String,

    /// Shared secret for peer link key derivation
    #[arg(long, env = "JABBERWOCK_SECRET")]
    secret: String,

    /// Port for client connections
    #[arg(long, default_value_t = 5222)]
    client_port: u16,

    /// Port for peer server connections
    #[arg(long, default_value_t = 5269)]
    s2s_port: u16,

    /// Port used when dialing peer servers (defaults to --s2s-port)
    #[arg(long)]
    s2s_dial_port: Option<u16>,

    /// Address to bind the listeners to
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    info!("jabberwockd {} starting", env!("CARGO_PKG_VERSION"));

    let dial_port = args.s2s_dial_port.unwrap_or(args.s2s_port);
    let config = ServerConfig::new(&args.domain, &args.secret).with_s2s_port(dial_port);

    let mut server = ChatServer::new(config);
    server.listen(args.client_port, args.s2s_port, &args.bind)?;
    server.serve_forever()?;

    Ok(())
}
