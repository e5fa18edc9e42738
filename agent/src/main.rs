//! `not-my-board-agent`: runs as a daemon holding reservations and tunnels,
//! and doubles as the CLI client that talks to that daemon over the local
//! control socket.

mod config;
mod daemon;
mod error;
mod ipc;
mod matching;
mod rpc;
mod state;
mod tunnel;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use nmb_auth::{IdTokenFromCmd, IdTokenFromFile, IdTokenSource, LoginFlow, TokenStore};
use nmb_http::json::JsonCache;
use nmb_http::proxy::ProxyConfig;
use nmb_protocol::jsonrpc::Channel;
use serde_json::Value;
use tokio::net::UnixStream;
use tracing_subscriber::EnvFilter;

use config::AgentConfig;

#[derive(Parser, Debug)]
#[command(name = "not-my-board-agent", about = "Reserves boards from a hub and tunnels their parts locally")]
struct Cli {
    #[arg(long, default_value = "/etc/not-my-board/agent.toml")]
    config: PathBuf,

    #[arg(long)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon in the foreground.
    Daemon,
    /// Log in to the hub's identity provider interactively.
    Login,
    /// Reserve a place matching the parts described by an import file.
    Reserve {
        /// Path to an import description.
        import: PathBuf,
        /// Reserve under a different local name than the import's own `name`.
        #[arg(short = 'n', long = "with-name")]
        with_name: Option<String>,
    },
    /// Release a held reservation.
    Return {
        name: String,
        #[arg(long)]
        force: bool,
    },
    /// Start the tunnels for a held reservation.
    Attach { name: String },
    /// Tear down the tunnels for an attached reservation.
    Detach { name: String },
    /// Show the import description currently in effect for a reservation.
    GetImportDescription { name: String },
    /// Replace the import description for a detached reservation.
    UpdateImportDescription {
        name: String,
        #[arg(long)]
        import: PathBuf,
    },
    /// List held reservations.
    List,
    /// Show detailed status for all held reservations.
    Status {
        #[arg(long)]
        flat: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Command::Daemon => run_daemon(&cli).await,
        Command::Login => run_login(&cli).await,
        other => run_client(&cli, other).await,
    }
}

async fn run_daemon(cli: &Cli) -> anyhow::Result<()> {
    let config = AgentConfig::load(&cli.config)?;
    let cache = JsonCache::new();
    let proxy = ProxyConfig::from_env();

    let id_token_source: Arc<dyn IdTokenSource> = match &config.id_token_cmd {
        Some(cmd) => Arc::new(IdTokenFromCmd::new(config.hub_url.clone(), cache, proxy, cmd.clone())),
        None => Arc::new(IdTokenFromFile::new(
            config.hub_url.clone(),
            cache,
            proxy,
            TokenStore::default_path(),
        )),
    };

    let state = state::AgentState::new(config.hub_url.clone(), id_token_source);
    daemon::serve(&socket_path(cli), state).await
}

fn socket_path(cli: &Cli) -> PathBuf {
    cli.socket.clone().unwrap_or_else(|| PathBuf::from(daemon::DEFAULT_SOCKET_PATH))
}

async fn run_login(cli: &Cli) -> anyhow::Result<()> {
    let config = AgentConfig::load(&cli.config)?;
    let cache = JsonCache::new();
    let proxy = ProxyConfig::from_env();

    let flow = LoginFlow::start(&config.hub_url, cache, proxy, TokenStore::default_path()).await?;
    println!("Open this URL to log in:\n\n    {}\n", flow.login_url()?);

    let claims = flow.finish().await?;
    println!("Logged in. Claims:");
    for (key, value) in claims {
        println!("  {key}: {value}");
    }
    Ok(())
}

async fn run_client(cli: &Cli, command: &Command) -> anyhow::Result<()> {
    let stream = UnixStream::connect(socket_path(cli)).await?;
    let channel = ipc::wrap(stream);

    let result = match command {
        Command::Reserve { import, with_name } => {
            let import_toml = std::fs::read_to_string(import)?;
            let with_name = with_name.clone().map(Value::String).unwrap_or(Value::Null);
            call(&channel, "reserve", vec![Value::String(import_toml), with_name]).await?
        }
        Command::Return { name, force } => {
            call(&channel, "return_reservation", vec![Value::String(name.clone()), Value::Bool(*force)]).await?
        }
        Command::Attach { name } => call(&channel, "attach", vec![Value::String(name.clone())]).await?,
        Command::Detach { name } => call(&channel, "detach", vec![Value::String(name.clone())]).await?,
        Command::GetImportDescription { name } => {
            call(&channel, "get_import_description", vec![Value::String(name.clone())]).await?
        }
        Command::UpdateImportDescription { name, import } => {
            let import_toml = std::fs::read_to_string(import)?;
            call(
                &channel,
                "update_import_description",
                vec![Value::String(name.clone()), Value::String(import_toml)],
            )
            .await?
        }
        Command::List => call(&channel, "list", vec![]).await?,
        Command::Status { flat } => {
            let status = call(&channel, "status", vec![]).await?;
            print_status(&status, *flat);
            return Ok(());
        }
        Command::Daemon | Command::Login => unreachable!("handled before run_client"),
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn call(channel: &Channel, method: &str, args: Vec<Value>) -> anyhow::Result<Value> {
    Ok(channel.call(method, args, serde_json::Map::new()).await?)
}

fn print_status(status: &Value, flat: bool) {
    if !flat {
        println!("{}", serde_json::to_string_pretty(status).unwrap_or_default());
        return;
    }
    for line in flatten(status, "") {
        println!("{line}");
    }
}

/// `key.path[index]=value` lines, one leaf per line, ported from
/// `_util/_flat_format.py::to_flat_format`.
fn flatten(value: &Value, parent_key: &str) -> Vec<String> {
    match value {
        Value::Object(map) => map
            .iter()
            .flat_map(|(k, v)| {
                let key = if parent_key.is_empty() { k.clone() } else { format!("{parent_key}.{k}") };
                flatten(v, &key)
            })
            .collect(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .flat_map(|(i, v)| flatten(v, &format!("{parent_key}[{i}]")))
            .collect(),
        other => vec![format!("{parent_key}={other}")],
    }
}
