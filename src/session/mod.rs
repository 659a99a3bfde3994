//! Per-launch session state: what the client asked for, what the display
//! arbiter decided, and the registry the rest of the host consults to know
//! whether a stream is live.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::apps::AppDef;

/// App attributes the display arbiter cares about, snapshotted at launch so
/// later apps.json edits cannot shift a live session.
#[derive(Debug, Clone, Default)]
pub struct AppMetadata {
    pub virtual_screen: bool,
    pub gen1_framegen_fix: bool,
    pub gen2_framegen_fix: bool,
    pub frame_gen_limiter_fix: bool,
    pub lossless_scaling_framegen: bool,
}

impl AppMetadata {
    pub fn from_app(app: &AppDef) -> Self {
        Self {
            virtual_screen: app.virtual_screen,
            gen1_framegen_fix: app.gen1_framegen_fix,
            gen2_framegen_fix: app.gen2_framegen_fix,
            frame_gen_limiter_fix: app.frame_gen_limiter_fix,
            lossless_scaling_framegen: app.lossless_scaling_framegen,
        }
    }

    pub fn any_framegen_fix(&self) -> bool {
        self.gen1_framegen_fix || self.gen2_framegen_fix
    }
}

/// Ephemeral per-client, per-launch state. Created when the stream is
/// announced, shared by reference into the supervisor and display arbiter,
/// dropped when the stream ends.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchSession {
    pub unique_id: String,
    pub device_name: String,
    pub appid: i32,
    pub width: i32,
    pub height: i32,
    pub fps: i32,
    /// Client-requested refresh override when frame generation is active
    pub framegen_refresh_rate: Option<i32>,
    pub enable_hdr: bool,
    pub enable_sops: bool,
    pub gcmap: i32,
    pub surround_info: i32,
    pub surround_params: String,
    pub host_audio: bool,

    pub virtual_display: bool,
    pub virtual_display_device_id: String,
    pub virtual_display_guid_bytes: [u8; 16],
    pub virtual_display_detach_with_app: bool,

    pub gen1_framegen_fix: bool,
    pub gen2_framegen_fix: bool,
    pub lossless_scaling_framegen: bool,

    pub dd_config_option_override: Option<String>,
    pub virtual_display_mode_override: Option<String>,
    pub virtual_display_layout_override: Option<String>,
}

/// A live stream session as tracked by the host.
#[derive(Clone)]
pub struct ActiveSession {
    pub launch: LaunchSession,
    pub app_uuid: String,
    pub app_name: String,
    pub started_at: Instant,
    pub started_at_wall: chrono::DateTime<chrono::Utc>,
}

/// Registry of live sessions. The host runs a single active app, but the
/// count is tracked separately so config-apply decisions stay cheap.
pub struct SessionManager {
    active: RwLock<Option<ActiveSession>>,
    count: AtomicUsize,
}

impl SessionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            active: RwLock::new(None),
            count: AtomicUsize::new(0),
        })
    }

    pub async fn begin(&self, launch: LaunchSession, app_uuid: &str, app_name: &str) {
        let mut slot = self.active.write().await;
        if slot.is_none() {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
        *slot = Some(ActiveSession {
            launch,
            app_uuid: app_uuid.to_string(),
            app_name: app_name.to_string(),
            started_at: Instant::now(),
            started_at_wall: chrono::Utc::now(),
        });
    }

    pub async fn end(&self) -> Option<ActiveSession> {
        let mut slot = self.active.write().await;
        let prev = slot.take();
        if prev.is_some() {
            self.count.fetch_sub(1, Ordering::SeqCst);
        }
        prev
    }

    pub async fn active(&self) -> Option<ActiveSession> {
        self.active.read().await.clone()
    }

    /// Lock-free check used by the config-apply path.
    pub fn any_active(&self) -> bool {
        self.count.load(Ordering::SeqCst) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn begin_end_tracks_count() {
        let mgr = SessionManager::new();
        assert!(!mgr.any_active());

        mgr.begin(LaunchSession::default(), "uuid", "Game").await;
        assert!(mgr.any_active());
        assert_eq!(mgr.active().await.unwrap().app_name, "Game");

        let prev = mgr.end().await.unwrap();
        assert_eq!(prev.app_uuid, "uuid");
        assert!(!mgr.any_active());
        assert!(mgr.end().await.is_none());
    }

    #[tokio::test]
    async fn replacing_session_keeps_count_stable() {
        let mgr = SessionManager::new();
        mgr.begin(LaunchSession::default(), "a", "A").await;
        mgr.begin(LaunchSession::default(), "b", "B").await;
        assert!(mgr.any_active());
        mgr.end().await;
        assert!(!mgr.any_active());
    }
}
