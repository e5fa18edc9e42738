//! `not-my-board-hub`: the board-farm broker. Boots a single axum server
//! carrying both the `/ws` JSON-RPC endpoint and the REST surface, per
//! spec.md §4.4/§6. Grounded on the teacher's `server/src/main.rs`.

mod api;
mod auth;
mod config;
mod error;
mod handlers;
mod rpc;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use config::HubConfig;
use state::Hub;

#[derive(Parser, Debug)]
#[command(name = "not-my-board-hub", about = "Board-farm broker")]
struct Cli {
    /// Path to the hub's TOML config. Falls back to
    /// `NOT_MY_BOARD_HUB_CONFIG` if unset.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match config::HubConfig::resolve_path(cli.config.as_deref()) {
        Some(path) => HubConfig::load(&path)?,
        None => toml::from_str("")?,
    };

    let filter = config
        .log_level
        .as_deref()
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let (authenticator, auth_config) = match &config.auth {
        Some(auth) => {
            let mut trusted_issuers = vec![auth.issuer.clone()];
            trusted_issuers.extend(auth.issuers.keys().cloned());
            let authenticator =
                auth::Authenticator::new(auth.client_id.clone(), auth.permissions.clone(), Some(trusted_issuers));
            (Some(Arc::new(authenticator)), Some(Arc::new(auth.clone())))
        }
        None => (None, None),
    };

    let hub = Hub::new(authenticator, auth_config);

    let app = Router::new()
        .route("/ws", get(handlers::ws_handler))
        .route("/api/v1/places", get(api::get_places))
        .route("/api/v1/auth-info", get(api::get_auth_info))
        .route("/oidc-callback", get(api::oidc_callback))
        .layer(CorsLayer::permissive())
        .with_state(hub);

    let addr: SocketAddr = config.bind.parse()?;
    tracing::info!(%addr, "hub listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}
