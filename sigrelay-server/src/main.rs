use std::net::{IpAddr, SocketAddr};

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use sigrelay_server::{RelayConfig, RelayServer};

#[derive(Parser, Debug)]
#[command(name = "sigrelay-server")]
#[command(author, version, about = "Request/response WebSocket relay", long_about = None)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// Port to listen on.
    #[arg(short, long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// URL path for the WebSocket endpoint.
    #[arg(long, default_value = "/ws")]
    ws_path: String,

    /// Shared secret producers must present.
    #[arg(long, env = "PRODUCER_TOKEN", default_value = "producer-secret", hide_env_values = true)]
    producer_token: String,

    /// Shared secret consumers must present.
    #[arg(long, env = "CONSUMER_TOKEN", default_value = "consumer-secret", hide_env_values = true)]
    consumer_token: String,

    /// Seconds to wait for a producer response before failing a request.
    #[arg(long, default_value_t = 10)]
    request_timeout: u64,

    /// Seconds between WebSocket keepalive pings.
    #[arg(long, default_value_t = 20)]
    keepalive_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let config = RelayConfig::new()
        .bind(SocketAddr::new(args.host, args.port))
        .path(args.ws_path)
        .with_tokens(args.producer_token, args.consumer_token)
        .with_request_timeout(std::time::Duration::from_secs(args.request_timeout))
        .with_keepalive_interval(std::time::Duration::from_secs(args.keepalive_interval));

    let server = RelayServer::bind(config).await?;

    tokio::select! {
        result = server.serve() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal, exiting gracefully");
        }
    }

    Ok(())
}
