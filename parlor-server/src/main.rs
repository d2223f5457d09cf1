//! Parlor server binary: configuration, the session sweeper, and the axum
//! service loop.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use parlor_server::api::{create_api_routes, ApiState};
use parlor_server::config::ConfigManager;
use parlor_server::session;

/// Room and voting server over a reactive entity store
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Set the log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Path to a TOML config file (defaults to the platform config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server port (automatically finds a free port if occupied)
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let manager = match cli.config {
        Some(path) => ConfigManager::load_with_path(path)?,
        None => ConfigManager::load()?,
    };
    let mut config = manager.config().clone();
    if let Some(port) = cli.port {
        config.http.port = port;
    }

    let state = ApiState::new(config.clone()).context("failed to initialize the store")?;
    spawn_session_sweeper(state.clone());

    let port = pick_port(&config.http.interface, config.http.port).await?;
    if port != config.http.port {
        warn!(
            requested = config.http.port,
            actual = port,
            "preferred port occupied"
        );
    }
    let addr: SocketAddr = format!("{}:{}", config.http.interface, port)
        .parse()
        .context("invalid listen address")?;

    let app = create_api_routes().with_state(state);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "parlor server listening");
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

/// Probe the configured interface for a listenable port, starting at the
/// preferred one and walking upward.
async fn pick_port(interface: &str, preferred: u16) -> Result<u16> {
    for candidate in preferred..=preferred.saturating_add(100) {
        if TcpListener::bind((interface, candidate)).await.is_ok() {
            return Ok(candidate);
        }
    }
    anyhow::bail!("no free port within 100 of {preferred} on {interface}")
}

/// Periodically remove sessions whose expiry has passed. Removal runs the
/// session cleanup hook, so room listeners and suspended polls die with the
/// session.
fn spawn_session_sweeper(state: ApiState) {
    let interval = state.config.sweep_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let mut store = state.store.lock().await;
            for session_id in session::get_expired_session_ids(&store) {
                info!(session = %session_id, "sweeping expired session");
                if let Err(error) = store.remove_entity("session", &session_id) {
                    warn!(session = %session_id, %error, "failed to sweep session");
                }
            }
        }
    });
}
