use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use mcp_relay::commands::{Relay, ServerSource};
use mcp_relay::config::{resolve_config_path, RelayConfig};
use mcp_relay::inference::AnthropicClient;

#[derive(Parser, Debug)]
#[command(name = "mcp-relay")]
#[command(version)]
#[command(about = "Chat relay that routes model tool calls to MCP servers")]
struct Args {
    /// Path to config.yaml (default: $MCP_RELAY_CONFIG, then the data directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the MCP servers JSON file (overrides `servers_file` in config)
    #[arg(short, long)]
    servers: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_dir = mcp_relay::data_dir();
    let log_path = mcp_relay::init_tracing(&log_dir)
        .with_context(|| format!("failed to initialise logging in {}", log_dir.display()))?;

    let config_path = resolve_config_path(args.config);
    let config = RelayConfig::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    let config_dir = config_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let servers_path = args
        .servers
        .unwrap_or_else(|| config.servers_path(&config_dir));

    let model = AnthropicClient::from_config(config.model.clone())
        .context("failed to configure the model client")?;
    tracing::info!(
        model = model.model_name(),
        endpoint = model.endpoint(),
        config = %config_path.display(),
        servers = %servers_path.display(),
        "relay configured"
    );

    let relay = Relay::new(
        Arc::new(model),
        config.orchestrator.to_settings(),
        config.connections.to_settings(),
        ServerSource::File(servers_path),
    );

    let connected = relay.start().await;
    eprintln!(
        "mcp-relay ready: {connected} server(s) connected. Logs: {}",
        log_path.display()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received");
                break;
            }
        };
        let Some(line) = line else {
            break;
        };
        let message = line.trim();
        if message.is_empty() {
            continue;
        }

        let reply = relay.handle_message(message).await;
        stdout.write_all(reply.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }

    relay.shutdown().await;
    tracing::info!("=== mcp-relay stopped ===");
    Ok(())
}
