use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::apps::AppsStore;
use crate::auth::TokenStore;
use crate::config::ConfigStore;
use crate::crypto::HostIdentity;
use crate::display::DisplayArbiter;
use crate::error::{AppError, Result};
use crate::logging::LogRing;
use crate::lossless;
use crate::pairing::{NamedCertStore, PairingEngine};
use crate::playnite::PlayniteIpc;
use crate::proc::AppSupervisor;
use crate::session::{AppMetadata, LaunchSession, SessionManager};
use crate::webrtc::WebRtcRegistry;

/// Application-wide state shared across handlers.
///
/// Everything is constructed in `main`'s setup phase and injected here;
/// shutdown unwinds web → webrtc → capture → playnite → supervisor →
/// display → tokens → identity.
pub struct AppState {
    pub config: ConfigStore,
    pub identity: HostIdentity,
    pub clients: NamedCertStore,
    pub pairing: Arc<PairingEngine>,
    pub apps: AppsStore,
    pub supervisor: Arc<AppSupervisor>,
    pub sessions: Arc<SessionManager>,
    pub arbiter: Arc<DisplayArbiter>,
    pub webrtc: Arc<WebRtcRegistry>,
    pub tokens: TokenStore,
    pub playnite: Arc<PlayniteIpc>,
    pub lossless: Arc<lossless::Sidecar>,
    pub logs: LogRing,
    pub shutdown_tx: broadcast::Sender<()>,
    data_dir: PathBuf,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ConfigStore,
        identity: HostIdentity,
        clients: NamedCertStore,
        pairing: Arc<PairingEngine>,
        apps: AppsStore,
        supervisor: Arc<AppSupervisor>,
        sessions: Arc<SessionManager>,
        arbiter: Arc<DisplayArbiter>,
        webrtc: Arc<WebRtcRegistry>,
        tokens: TokenStore,
        playnite: Arc<PlayniteIpc>,
        logs: LogRing,
        shutdown_tx: broadcast::Sender<()>,
        data_dir: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            identity,
            clients,
            pairing,
            apps,
            supervisor,
            sessions,
            arbiter,
            webrtc,
            tokens,
            playnite,
            lossless: lossless::Sidecar::new(),
            logs,
            shutdown_tx,
            data_dir,
        })
    }

    pub fn data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Full launch sequence for one session: shape the display, start the
    /// app, register the session, kick off frame-generation helpers.
    pub async fn launch_app(&self, app_uuid: &str, mut launch: LaunchSession) -> Result<()> {
        let app = self
            .apps
            .find_by_uuid(app_uuid)
            .await
            .ok_or_else(|| AppError::BadRequest("Cannot find requested application".to_string()))?;
        let meta = AppMetadata::from_app(&app);
        launch.appid = app.id;
        launch.gen1_framegen_fix |= app.gen1_framegen_fix;
        launch.gen2_framegen_fix |= app.gen2_framegen_fix;
        launch.lossless_scaling_framegen |= app.lossless_scaling_framegen;

        let dd = self.config.get().dd();
        self.arbiter
            .apply_for_session(&dd, &mut launch, &meta, &[])
            .await?;

        let baseline = lossless::wants_sidecar(&app).then(lossless::snapshot_pids);

        if let Err(e) = self.supervisor.execute(app_uuid, &launch).await {
            // Unwind the display change; the stream is not happening
            let _ = self.arbiter.revert().await;
            return Err(e);
        }

        if let Some(baseline) = baseline {
            self.lossless.begin(&app, baseline);
        }

        self.sessions.begin(launch, &app.uuid, &app.name).await;
        Ok(())
    }

    /// Session end: unwind in reverse of launch.
    pub async fn close_app(&self) -> Result<()> {
        self.supervisor.terminate().await?;
        self.lossless.end().await;

        if self.config.get().dd().config_revert_on_disconnect {
            if let Err(e) = self.arbiter.revert().await {
                tracing::warn!("Display revert on disconnect failed: {}", e);
            }
        }
        self.sessions.end().await;
        Ok(())
    }
}
