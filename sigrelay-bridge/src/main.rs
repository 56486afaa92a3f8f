use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use sigrelay_bridge::{BridgeClient, BridgeConfig, SqliteResolver};

#[derive(Parser, Debug)]
#[command(name = "sigrelay-bridge")]
#[command(author, version, about = "Producer-side relay agent", long_about = None)]
struct Args {
    /// ws(s):// URL of the relay endpoint.
    #[arg(long, env = "RELAY_URL", default_value = "ws://localhost:8080/ws")]
    url: String,

    /// Producer auth token.
    #[arg(long, env = "PRODUCER_TOKEN", default_value = "producer-secret", hide_env_values = true)]
    token: String,

    /// Path to the SQLite database to serve.
    #[arg(long, env = "SQLITE_PATH", default_value = "live_signals.db")]
    db: PathBuf,

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

    let resolver = SqliteResolver::open(&args.db)
        .with_context(|| format!("failed to open database {}", args.db.display()))?;

    let config = BridgeConfig {
        url: args.url,
        token: args.token,
        keepalive_interval: std::time::Duration::from_secs(args.keepalive_interval),
        ..BridgeConfig::default()
    };

    let client = BridgeClient::new(config, Arc::new(resolver));

    tokio::select! {
        _ = client.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal, exiting gracefully");
        }
    }

    Ok(())
}
