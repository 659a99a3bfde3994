use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use sysinfo::System;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use super::protocol::{
    parse_line, InboundMessage, LineAccumulator, OutboundMessage, PlayniteCategory,
    PlayniteGame, PlaynitePlugin, PLAYNITE_PIPE,
};
use super::sync::run_autosync;
use crate::apps::AppsStore;
use crate::config::ConfigStore;
use crate::utils::ipc::IpcStream;

/// Probe cadence for the Playnite process / plugin installation.
const PROBE_INTERVAL: Duration = Duration::from_secs(2);
/// Quiet period after the last games batch before the snapshot counts as
/// complete.
const SNAPSHOT_SETTLE: Duration = Duration::from_secs(2);

/// Game start/stop notifications surfaced to the session glue.
#[derive(Debug, Clone)]
pub enum StatusEvent {
    GameStarted { id: String },
    GameStopped { id: String },
    Connected,
    Disconnected,
}

#[derive(Default)]
struct Snapshots {
    games: Vec<PlayniteGame>,
    categories: Vec<PlayniteCategory>,
    plugins: Vec<PlaynitePlugin>,
}

/// Snapshot accumulation across `games` batches. The first batch after a
/// connect replaces the set; later batches append, deduped by id.
struct GamesAccumulator {
    fresh: bool,
}

impl GamesAccumulator {
    fn new() -> Self {
        Self { fresh: true }
    }

    fn apply(&mut self, snapshots: &mut Snapshots, batch: Vec<PlayniteGame>) {
        if self.fresh {
            snapshots.games.clear();
            self.fresh = false;
        }
        for game in batch {
            if !snapshots.games.iter().any(|g| g.id == game.id) {
                snapshots.games.push(game);
            }
        }
    }
}

/// Client for the Playnite plugin pipe plus the supervisor that keeps it
/// connected while Playnite runs.
pub struct PlayniteIpc {
    config: ConfigStore,
    apps: AppsStore,
    snapshots: RwLock<Snapshots>,
    connected: AtomicBool,
    out_tx: RwLock<Option<mpsc::UnboundedSender<OutboundMessage>>>,
    events_tx: broadcast::Sender<StatusEvent>,
}

impl PlayniteIpc {
    pub fn new(config: ConfigStore, apps: AppsStore) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            config,
            apps,
            snapshots: RwLock::new(Snapshots::default()),
            connected: AtomicBool::new(false),
            out_tx: RwLock::new(None),
            events_tx,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> broadcast::Receiver<StatusEvent> {
        self.events_tx.subscribe()
    }

    pub fn games(&self) -> Vec<PlayniteGame> {
        self.snapshots.read().games.clone()
    }

    pub fn categories(&self) -> Vec<PlayniteCategory> {
        self.snapshots.read().categories.clone()
    }

    pub fn plugins(&self) -> Vec<PlaynitePlugin> {
        self.snapshots.read().plugins.clone()
    }

    /// Queue a command for the plugin; silently dropped while disconnected.
    pub fn send(&self, msg: OutboundMessage) {
        if let Some(tx) = self.out_tx.read().as_ref() {
            let _ = tx.send(msg);
        }
    }

    pub fn send_stop(&self, id: &str) {
        self.send(OutboundMessage::stop(if id.is_empty() { None } else { Some(id) }));
    }

    /// Run the supervisor until shutdown: probe for Playnite + plugin,
    /// connect, pump messages, clear state on disconnect.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(PROBE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv() => break,
            }

            if !playnite_running() || !plugin_installed() {
                continue;
            }
            let Ok(stream) = IpcStream::connect(PLAYNITE_PIPE).await else {
                continue;
            };

            tracing::info!("Connected to Playnite plugin");
            self.connected.store(true, Ordering::SeqCst);
            let _ = self.events_tx.send(StatusEvent::Connected);

            self.pump(stream, &mut shutdown).await;

            tracing::info!("Playnite plugin disconnected");
            self.connected.store(false, Ordering::SeqCst);
            *self.out_tx.write() = None;
            *self.snapshots.write() = Snapshots::default();
            let _ = self.events_tx.send(StatusEvent::Disconnected);
        }
    }

    /// Pump one connection until it drops or shutdown is signalled.
    async fn pump(self: &Arc<Self>, stream: IpcStream, shutdown: &mut broadcast::Receiver<()>) {
        let (mut reader, mut writer) = tokio::io::split(stream);

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundMessage>();
        *self.out_tx.write() = Some(out_tx);
        self.send(OutboundMessage::hello("sunshine"));

        let writer_task = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if writer.write_all(msg.to_line().as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let mut accumulator = LineAccumulator::new();
        let mut games_acc = GamesAccumulator::new();
        let mut last_batch: Option<Instant> = None;
        let mut buf = vec![0u8; 16 * 1024];

        loop {
            let settle = async {
                match last_batch {
                    Some(at) => tokio::time::sleep_until(at + SNAPSHOT_SETTLE).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                read = reader.read(&mut buf) => {
                    let n = match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    for line in accumulator.push(&buf[..n]) {
                        let Some(msg) = parse_line(&line) else { continue };
                        if matches!(msg, InboundMessage::Games { .. }) {
                            last_batch = Some(Instant::now());
                        }
                        self.dispatch(msg, &mut games_acc).await;
                    }
                }
                _ = settle => {
                    let count = self.snapshots.read().games.len();
                    tracing::info!("Playnite library snapshot completed: {} game(s)", count);
                    last_batch = None;
                }
                _ = shutdown.recv() => break,
            }
        }

        writer_task.abort();
    }

    async fn dispatch(self: &Arc<Self>, msg: InboundMessage, games_acc: &mut GamesAccumulator) {
        match msg {
            InboundMessage::Categories { categories } => {
                let mut snapshots = self.snapshots.write();
                snapshots.categories.clear();
                for category in categories {
                    let dup = snapshots
                        .categories
                        .iter()
                        .any(|c| c.id == category.id || c.name == category.name);
                    if !dup {
                        snapshots.categories.push(category);
                    }
                }
            }
            InboundMessage::Plugins { plugins } => {
                let mut snapshots = self.snapshots.write();
                snapshots.plugins.clear();
                for plugin in plugins {
                    let dup = snapshots
                        .plugins
                        .iter()
                        .any(|p| p.id.to_lowercase() == plugin.id.to_lowercase());
                    if !dup {
                        snapshots.plugins.push(plugin);
                    }
                }
            }
            InboundMessage::Games { games } => {
                {
                    let mut snapshots = self.snapshots.write();
                    games_acc.apply(&mut snapshots, games);
                }
                let playnite_cfg = self.config.get().playnite();
                if playnite_cfg.auto_sync {
                    let games = self.games();
                    if let Err(e) = run_autosync(&playnite_cfg, &games, &self.apps).await {
                        tracing::warn!("Playnite auto-sync failed: {}", e);
                    }
                }
            }
            InboundMessage::Status { name, id, .. } => match name.as_str() {
                "gameStarted" => {
                    tracing::info!(game = %id, "Playnite reports game started");
                    let _ = self.events_tx.send(StatusEvent::GameStarted { id });
                }
                "gameStopped" => {
                    tracing::info!(game = %id, "Playnite reports game stopped");
                    let _ = self.events_tx.send(StatusEvent::GameStopped { id });
                }
                other => tracing::debug!("Unhandled Playnite status \"{}\"", other),
            },
        }
    }
}

/// Is a Playnite desktop/fullscreen process alive?
fn playnite_running() -> bool {
    let mut system = System::new();
    system.refresh_processes();
    system
        .processes()
        .values()
        .any(|p| p.name().to_lowercase().starts_with("playnite."))
}

/// The PowerShell plugin drops into the Playnite extensions directory.
fn plugin_installed() -> bool {
    plugin_dir().map(|d| d.is_dir()).unwrap_or(false)
}

fn plugin_dir() -> Option<PathBuf> {
    let base = std::env::var_os("LOCALAPPDATA").map(PathBuf::from)?;
    Some(base.join("Playnite").join("Extensions").join("SunshinePlaynite"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn game(id: &str) -> PlayniteGame {
        PlayniteGame {
            id: id.to_string(),
            name: id.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn first_batch_replaces_then_appends_deduped() {
        let mut snapshots = Snapshots {
            games: vec![game("stale")],
            ..Default::default()
        };
        let mut acc = GamesAccumulator::new();

        acc.apply(&mut snapshots, vec![game("a"), game("b")]);
        assert_eq!(
            snapshots.games.iter().map(|g| g.id.as_str()).collect::<Vec<_>>(),
            ["a", "b"]
        );

        // Later batches append and dedup by id
        acc.apply(&mut snapshots, vec![game("b"), game("c")]);
        assert_eq!(
            snapshots.games.iter().map(|g| g.id.as_str()).collect::<Vec<_>>(),
            ["a", "b", "c"]
        );
    }

    #[test]
    fn reconnect_starts_a_fresh_snapshot() {
        let mut snapshots = Snapshots::default();
        let mut acc = GamesAccumulator::new();
        acc.apply(&mut snapshots, vec![game("a")]);

        // New connection, new accumulator
        let mut acc = GamesAccumulator::new();
        acc.apply(&mut snapshots, vec![game("z")]);
        assert_eq!(snapshots.games.len(), 1);
        assert_eq!(snapshots.games[0].id, "z");
    }
}
