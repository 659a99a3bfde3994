use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use rustls::crypto::{ring, CryptoProvider};
use tokio::sync::broadcast;

use vibeshine::apps::AppsStore;
use vibeshine::auth::{spawn_token_sweeper, TokenStore};
use vibeshine::config::ConfigStore;
use vibeshine::crypto::HostIdentity;
use vibeshine::display::{DisplayArbiter, DisplayHelperClient};
use vibeshine::logging::{self, LogLevel};
use vibeshine::pairing::{NamedCertStore, PairingEngine};
use vibeshine::playnite::{should_terminate_on_stop, PlayniteIpc, StatusEvent};
use vibeshine::proc::{AppSupervisor, RunState};
use vibeshine::session::SessionManager;
use vibeshine::state::AppState;
use vibeshine::web;
use vibeshine::webrtc::WebRtcRegistry;

/// Cadence of the supervisor liveness tick.
const SESSION_TICK: Duration = Duration::from_secs(1);

/// Vibeshine command line arguments
#[derive(Parser, Debug)]
#[command(name = "vibeshine")]
#[command(version, about = "Low-latency game streaming host", long_about = None)]
struct CliArgs {
    /// Listen address (overrides config)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// Stream base port; the HTTPS API listens one above (overrides config)
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// Data directory path
    #[arg(short = 'd', long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    let logs = logging::init(args.log_level, args.verbose);

    // Required by rustls 0.23+
    CryptoProvider::install_default(ring::default_provider())
        .expect("Failed to install rustls crypto provider");

    tracing::info!("Starting Vibeshine v{}", env!("CARGO_PKG_VERSION"));

    let data_dir = args.data_dir.unwrap_or_else(default_data_dir);
    tokio::fs::create_dir_all(&data_dir).await?;
    tracing::info!("Data directory: {}", data_dir.display());

    // Configuration
    let config = ConfigStore::load(&data_dir.join("vibeshine.conf")).await?;
    if let Some(address) = args.address {
        config.update(|cfg| cfg.set("address", address.clone())).await?;
    }
    if let Some(port) = args.port {
        config.update(|cfg| cfg.set("port", port.to_string())).await?;
    }
    if config.get().get("host_uuid").is_none() {
        let host_uuid = uuid::Uuid::new_v4().to_string();
        config.update(|cfg| cfg.set("host_uuid", host_uuid.clone())).await?;
    }

    // Host identity: config paths win, otherwise a generated pair under the
    // data dir. The same pair backs HTTPS and pairing.
    let web_cfg = config.get().web();
    let cert_path = web_cfg
        .cert_path
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join("certs").join("vibeshine.crt"));
    let key_path = web_cfg
        .pkey_path
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join("certs").join("vibeshine.key"));
    let identity = HostIdentity::load_or_generate(&cert_path, &key_path).await?;

    // Stores
    let clients = NamedCertStore::load(&data_dir.join("named_certs.json")).await?;
    let pairing = Arc::new(PairingEngine::new(clients.clone()));
    let tokens = TokenStore::load(&data_dir).await?;

    let apps_file = {
        let configured = config.get().proc().apps_file;
        let path = PathBuf::from(&configured);
        if path.is_absolute() {
            path
        } else {
            data_dir.join(path)
        }
    };
    let apps = AppsStore::load(&apps_file).await?;

    // Core components
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let sessions = SessionManager::new();
    let supervisor = AppSupervisor::new(config.clone(), apps.clone());
    let arbiter = Arc::new(DisplayArbiter::new(DisplayHelperClient::new()));
    let webrtc = WebRtcRegistry::new();
    let playnite = PlayniteIpc::new(config.clone(), apps.clone());

    // Supervisor asks Playnite to stop its game before escalating
    {
        let playnite = playnite.clone();
        supervisor.set_playnite_stop_hook(Arc::new(move |id: &str| playnite.send_stop(id)));
    }

    let state = AppState::new(
        config.clone(),
        identity.clone(),
        clients,
        pairing,
        apps,
        supervisor.clone(),
        sessions.clone(),
        arbiter,
        webrtc,
        tokens.clone(),
        playnite.clone(),
        logs,
        shutdown_tx.clone(),
        data_dir,
    );

    // Background tasks
    spawn_token_sweeper(tokens, shutdown_tx.subscribe());
    tokio::spawn(playnite.clone().run(shutdown_tx.subscribe()));
    spawn_session_ticker(state.clone());
    spawn_game_stop_watcher(state.clone());

    // HTTPS listener on the config port + 1, with the pairing identity
    let web_cfg = state.config.get().web();
    let bind_ip: IpAddr = web_cfg
        .address
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid bind address: {}", web_cfg.address))?;
    let bind_addr = SocketAddr::new(bind_ip, web_cfg.https_port);

    let tls_config = RustlsConfig::from_pem(
        identity.cert_pem().as_bytes().to_vec(),
        identity.key_pem().as_bytes().to_vec(),
    )
    .await?;

    let app = web::create_router(state.clone());
    tracing::info!("Starting HTTPS server on https://{}", bind_addr);

    let server = axum_server::bind_rustls(bind_addr, tls_config)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    let mut shutdown_rx = shutdown_tx.subscribe();
    let shutdown_signal = async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("Shutdown signal received"),
            _ = shutdown_rx.recv() => tracing::info!("Shutdown requested"),
        }
    };

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!("HTTPS server error: {}", e);
                cleanup(&state).await;
                anyhow::bail!("failed to serve HTTPS API");
            }
        }
        _ = shutdown_signal => {
            cleanup(&state).await;
        }
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Get the application data directory
fn default_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var("VIBESHINE_DATA_DIR") {
        return PathBuf::from(path);
    }
    if cfg!(windows) {
        let base = std::env::var("PROGRAMDATA").unwrap_or_else(|_| "C:\\ProgramData".to_string());
        PathBuf::from(base).join("Vibeshine")
    } else {
        PathBuf::from("/etc/vibeshine")
    }
}

/// Drive the supervisor liveness check and unwind the session when the app
/// goes away on its own.
fn spawn_session_ticker(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut shutdown = state.shutdown_signal();
        let mut ticker = tokio::time::interval(SESSION_TICK);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv() => break,
            }

            let run_state = state.supervisor.tick().await;
            if run_state == RunState::Idle && state.sessions.any_active() {
                tracing::info!("App exited on its own, ending the stream session");
                if let Err(e) = state.close_app().await {
                    tracing::warn!("Session teardown failed: {}", e);
                }
            }
        }
    });
}

/// Apply the gameStopped termination rules from Playnite status events.
fn spawn_game_stop_watcher(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut shutdown = state.shutdown_signal();
        let mut events = state.playnite.events();
        let mut observed_started = false;

        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = shutdown.recv() => break,
            };
            let event = match event {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            };

            match event {
                StatusEvent::GameStarted { .. } => observed_started = true,
                StatusEvent::Disconnected => observed_started = false,
                StatusEvent::GameStopped { id } => {
                    let active = state.sessions.active().await;
                    let app = state.supervisor.running_app().await;
                    let playnite_id = app
                        .as_ref()
                        .filter(|a| a.is_playnite_backed())
                        .map(|a| a.playnite_id.as_str());
                    let age = active
                        .as_ref()
                        .map(|s| s.started_at.elapsed())
                        .unwrap_or_default();

                    if should_terminate_on_stop(playnite_id, observed_started, &id, age) {
                        tracing::info!(game = %id, "Playnite game stopped, closing the app");
                        observed_started = false;
                        if let Err(e) = state.close_app().await {
                            tracing::warn!("Failed to close app after game stop: {}", e);
                        }
                    }
                }
                StatusEvent::Connected => {}
            }
        }
    });
}

/// Clean up subsystems on shutdown
async fn cleanup(state: &Arc<AppState>) {
    if let Err(e) = state.close_app().await {
        tracing::warn!("Failed to close running app: {}", e);
    }
    if let Err(e) = state.arbiter.revert().await {
        tracing::warn!("Failed to revert display configuration: {}", e);
    }
}
