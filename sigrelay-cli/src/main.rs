//! One-shot consumer client: authenticate, fetch one resource through the
//! relay, pretty-print the response, exit. Exits nonzero when the response
//! carries an error status (timeout, producer offline, unknown resource).

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing_subscriber::{fmt, EnvFilter};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Parser, Debug)]
#[command(name = "sigrelay")]
#[command(author, version, about = "Fetch data through a sigrelay relay", long_about = None)]
struct Args {
    /// ws(s):// URL of the relay endpoint.
    #[arg(long, env = "RELAY_URL", default_value = "ws://localhost:8080/ws")]
    url: String,

    /// Consumer auth token.
    #[arg(long, env = "CONSUMER_TOKEN", default_value = "consumer-secret", hide_env_values = true)]
    token: String,

    /// Resource to fetch.
    #[arg(long, default_value = "probabilities")]
    resource: String,

    /// Maximum number of records to request.
    #[arg(long, default_value_t = 5)]
    limit: u32,

    /// Seconds to wait for the response before giving up.
    #[arg(long, default_value_t = 15)]
    wait: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let (mut ws, _) = connect_async(&args.url)
        .await
        .with_context(|| format!("failed to connect to {}", args.url))?;

    // Auth handshake.
    let auth = json!({"type": "auth", "role": "consumer", "token": args.token});
    ws.send(Message::Text(auth.to_string().into())).await?;
    let ack = recv_json(&mut ws, Duration::from_secs(10))
        .await
        .context("waiting for auth reply")?;
    if ack["type"] != "auth_ok" {
        bail!("authentication rejected: {}", ack);
    }

    // One get, correlated by a fresh id.
    let request_id = uuid::Uuid::new_v4().to_string();
    let get = json!({
        "type": "get",
        "resource": args.resource,
        "params": {"limit": args.limit},
        "request_id": request_id,
    });
    ws.send(Message::Text(get.to_string().into())).await?;

    // Wait for the matching response; unrelated frames are skipped.
    let deadline = Duration::from_secs(args.wait);
    let response = loop {
        let msg = recv_json(&mut ws, deadline)
            .await
            .context("waiting for response")?;
        if msg["type"] == "response" && msg["request_id"] == request_id.as_str() {
            break msg;
        }
    };

    println!("{}", serde_json::to_string_pretty(&response)?);

    if response["status"] == "error" {
        bail!(
            "relay returned error: {}",
            response["error"].as_str().unwrap_or("unknown")
        );
    }

    Ok(())
}

async fn recv_json(ws: &mut Ws, deadline: Duration) -> Result<Value> {
    let wait = tokio::time::sleep(deadline);
    tokio::pin!(wait);

    loop {
        tokio::select! {
            _ = &mut wait => bail!("timed out after {:?}", deadline),
            frame = ws.next() => {
                let msg = frame.context("connection closed")??;
                match msg {
                    Message::Text(text) => {
                        return serde_json::from_str(&text).context("invalid JSON from relay")
                    }
                    Message::Close(frame) => {
                        bail!("relay closed the connection: {:?}", frame)
                    }
                    _ => continue,
                }
            }
        }
    }
}
