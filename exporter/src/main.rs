//! `not-my-board-exporter`: the board-side proxy. Boots the CONNECT
//! listener, registers the export description with the hub over a
//! JSON-RPC WebSocket, and serves the hub's `set_allowed_ips`/
//! `get_id_token` reverse calls until the process is killed. Grounded on
//! spec.md §4.5 and the teacher's `hub/src/main.rs` bootstrap shape.

mod config;
mod error;
mod proxy;
mod rpc;
mod state;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use nmb_auth::{IdTokenFromCmd, IdTokenFromFile, IdTokenSource};
use nmb_http::json::JsonCache;
use nmb_http::proxy::ProxyConfig;
use tracing_subscriber::EnvFilter;

use config::ExporterConfig;
use error::ExporterError;
use rpc::ExporterRpcHandler;
use state::ExporterState;

#[derive(Parser, Debug)]
#[command(name = "not-my-board-exporter", about = "Board-side CONNECT proxy and USB/IP host")]
struct Cli {
    /// Path to the exporter's TOML config.
    #[arg(long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = ExporterConfig::load(&cli.config)?;

    run(config).await?;
    Ok(())
}

async fn run(config: ExporterConfig) -> Result<(), ExporterError> {
    let state = Arc::new(ExporterState::new(&config.export));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.export.port)).await?;
    tracing::info!(port = config.export.port, name = %config.export.name, "connect listener bound");
    tokio::spawn(proxy::accept_loop(listener, state.clone()));

    let cache = JsonCache::new();
    let proxy_config = ProxyConfig::from_env();

    let id_token_source: Arc<dyn IdTokenSource> = match &config.id_token_cmd {
        Some(cmd) => Arc::new(IdTokenFromCmd::new(config.hub_url.clone(), cache, proxy_config.clone(), cmd.clone())),
        None => Arc::new(IdTokenFromFile::new(
            config.hub_url.clone(),
            cache,
            proxy_config.clone(),
            nmb_auth::TokenStore::default_path(),
        )),
    };

    let ws_url = format!("{}/ws", config.hub_url);
    let channel = nmb_http::ws::open(&ws_url, &proxy_config, None).await?;
    channel.set_handler(Arc::new(ExporterRpcHandler { state: state.clone(), id_token_source })).await;

    let export_desc = serde_json::to_value(&config.export).map_err(|e| ExporterError::Config(e.to_string()))?;
    let place_id = channel.call("register_place", vec![export_desc], serde_json::Map::new()).await?;
    tracing::info!(?place_id, "place registered with hub");

    tokio::signal::ctrl_c().await.ok();
    Ok(())
}
