// src/main.rs
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use log::{error, info, warn};
use std::sync::Arc;

use relay_client::transport::WsConnector;
use relay_client::{ConnectionManager, Headers, ManagerRegistry, Settings};

#[derive(Parser)]
#[command(name = "relay-client", about = "Talk to a STOMP messaging gateway")]
struct Cli {
    /// Settings file (TOML, extension optional)
    #[arg(long, default_value = "Settings")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Subscribe to destinations and print every message until Ctrl+C
    Listen {
        #[arg(required = true)]
        destinations: Vec<String>,
    },
    /// Publish one message
    Send {
        destination: String,
        body: String,
        /// Extra header, as key=value
        #[arg(short = 'H', long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,
    },
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    let settings = Settings::load(&cli.config).context("Failed to load settings")?;

    let registry = ManagerRegistry::new(Arc::new(WsConnector::new()), settings.manager_config());
    let manager = registry.get_or_create(&settings.relay.identity, &settings.relay.endpoint)?;

    manager.add_on_connect(|| info!("Connected"));
    manager.add_on_disconnect(|info| {
        if info.will_reconnect {
            warn!("Disconnected ({:?}), retrying", info.reason);
        } else {
            warn!(
                "Disconnected ({:?}) after {} attempts, not retrying",
                info.reason, info.reconnect_attempts
            );
        }
    });

    let result = match cli.command {
        Command::Listen { destinations } => listen(&manager, &destinations).await,
        Command::Send {
            destination,
            body,
            headers,
        } => send(&manager, &destination, &body, headers).await,
    };

    // let queued frames reach the server before the runtime is dropped
    registry.shutdown_all().await;
    result
}

async fn listen(manager: &ConnectionManager, destinations: &[String]) -> Result<()> {
    for destination in destinations {
        manager.subscribe(destination, |envelope| {
            let line = serde_json::json!({
                "received_at": chrono::Local::now().to_rfc3339(),
                "envelope": envelope,
            });
            println!("{}", line);
        });
    }

    // the manager keeps retrying in the background if this first attempt fails
    if let Err(e) = manager.connect().await {
        error!("Initial connect failed: {}", e);
    }

    info!("Listening on {} destinations. Press Ctrl+C to stop...", destinations.len());
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    Ok(())
}

async fn send(
    manager: &ConnectionManager,
    destination: &str,
    body: &str,
    headers: Vec<(String, String)>,
) -> Result<()> {
    manager.connect().await.context("Failed to connect")?;

    let headers: Headers = headers.into_iter().collect();
    manager
        .send(destination, &headers, body)
        .with_context(|| format!("Failed to send to {}", destination))?;
    info!("Sent {} bytes to {}", body.len(), destination);

    Ok(())
}
