//! Lossless Scaling integration: find the freshly launched game process,
//! swap a `Vibeshine` profile into the Lossless Scaling settings file, and
//! restore the user's configuration on teardown.

pub mod detect;
pub mod profile;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

pub use detect::{detect_game_process, score_candidate, snapshot_pids};
pub use profile::{apply_vibeshine_profile, read_setting, write_setting, ProfileBackup};

use crate::apps::{AppDef, FrameGenProvider, LosslessProfile};
use crate::proc::graceful_then_forceful;

/// Profile title injected into the Lossless Scaling settings.
pub const PROFILE_TITLE: &str = "Vibeshine";

/// Does this app want the Lossless Scaling sidecar for a real launch?
/// Playnite-backed and placebo launches handle it in the launcher helper.
pub fn wants_sidecar(app: &AppDef) -> bool {
    app.lossless_scaling_framegen
        && app.frame_generation_provider == FrameGenProvider::LosslessScaling
        && !app.cmd.is_empty()
}

/// Session-scoped Lossless Scaling driver: detection, profile swap, and
/// restore.
pub struct Sidecar {
    settings_path: Option<PathBuf>,
    backup: Mutex<Option<ProfileBackup>>,
}

impl Sidecar {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            settings_path: default_settings_path(),
            backup: Mutex::new(None),
        })
    }

    #[cfg(test)]
    fn with_settings_path(path: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            settings_path: Some(path),
            backup: Mutex::new(None),
        })
    }

    /// Kick off the background pass for one launch: observe new processes,
    /// then swap the profile in and bounce Lossless Scaling.
    pub fn begin(self: &Arc<Self>, app: &AppDef, baseline: HashSet<u32>) {
        let sidecar = Arc::clone(self);
        let app = app.clone();
        tokio::spawn(async move {
            let detected = detect_game_process(
                &baseline,
                Some(&app.working_dir),
                detect::DETECT_WINDOW,
            )
            .await;
            if detected.is_none() {
                tracing::info!("Skipping Lossless Scaling setup, no game process found");
                return;
            }

            if let Err(e) = sidecar.apply_profile(&app).await {
                tracing::warn!("Lossless Scaling profile apply failed: {}", e);
                return;
            }
            restart_lossless_scaling().await;
        });
    }

    async fn apply_profile(&self, app: &AppDef) -> std::io::Result<()> {
        let Some(path) = &self.settings_path else {
            return Ok(());
        };
        let xml = tokio::fs::read_to_string(path).await?;

        {
            let mut backup = self.backup.lock().await;
            if backup.is_none() {
                *backup = Some(ProfileBackup::capture(&xml));
            }
        }

        let overrides = match app.lossless_scaling_profile {
            LosslessProfile::Recommended => &app.lossless_scaling_recommended,
            LosslessProfile::Custom => &app.lossless_scaling_custom,
        };
        let updated = apply_vibeshine_profile(&xml, overrides, app.lossless_scaling_target_fps);
        tokio::fs::write(path, updated).await?;
        tracing::info!("Applied Lossless Scaling profile \"{}\"", PROFILE_TITLE);
        Ok(())
    }

    /// Restore the user's settings at session teardown. Safe to call when
    /// nothing was applied.
    pub async fn end(&self) {
        let backup = self.backup.lock().await.take();
        let (Some(backup), Some(path)) = (backup, &self.settings_path) else {
            return;
        };
        match tokio::fs::read_to_string(path).await {
            Ok(xml) => {
                let restored = backup.restore(&xml);
                if let Err(e) = tokio::fs::write(path, restored).await {
                    tracing::warn!("Lossless Scaling settings restore failed: {}", e);
                } else {
                    tracing::info!("Restored Lossless Scaling settings");
                }
            }
            Err(e) => tracing::warn!("Lossless Scaling settings unreadable on restore: {}", e),
        }
    }
}

/// Stop running Lossless Scaling instances and start them again so the
/// edited settings file is picked up.
async fn restart_lossless_scaling() {
    use sysinfo::System;

    let mut system = System::new();
    system.refresh_processes();

    let mut exe_path: Option<PathBuf> = None;
    let mut pids = Vec::new();
    for (pid, process) in system.processes() {
        if process.name().eq_ignore_ascii_case("LosslessScaling.exe")
            || process.name().eq_ignore_ascii_case("LosslessScaling")
        {
            pids.push(pid.as_u32());
            if exe_path.is_none() {
                exe_path = process.exe().map(|p| p.to_path_buf());
            }
        }
    }
    if pids.is_empty() {
        return;
    }

    graceful_then_forceful(&pids, std::time::Duration::from_secs(5)).await;
    if let Some(path) = exe_path {
        if let Err(e) = tokio::process::Command::new(&path).spawn() {
            tracing::warn!("Failed to restart Lossless Scaling: {}", e);
        } else {
            tracing::info!("Restarted Lossless Scaling");
        }
    }
}

fn default_settings_path() -> Option<PathBuf> {
    let base = std::env::var_os("LOCALAPPDATA").map(PathBuf::from)?;
    Some(base.join("Lossless Scaling").join("Settings.xml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_gating() {
        let mut app = AppDef {
            cmd: "game.exe".to_string(),
            lossless_scaling_framegen: true,
            ..Default::default()
        };
        assert!(wants_sidecar(&app));

        app.frame_generation_provider = FrameGenProvider::NvidiaSmoothMotion;
        assert!(!wants_sidecar(&app));

        app.frame_generation_provider = FrameGenProvider::LosslessScaling;
        app.cmd.clear();
        assert!(!wants_sidecar(&app));
    }

    #[tokio::test]
    async fn apply_and_end_round_trips_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Settings.xml");
        tokio::fs::write(
            &path,
            "<Settings><AutoScale>False</AutoScale><Profiles></Profiles></Settings>",
        )
        .await
        .unwrap();

        let sidecar = Sidecar::with_settings_path(path.clone());
        let app = AppDef {
            cmd: "game.exe".to_string(),
            lossless_scaling_framegen: true,
            lossless_scaling_target_fps: Some(120),
            ..Default::default()
        };
        sidecar.apply_profile(&app).await.unwrap();

        let applied = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(applied.contains("Vibeshine"));
        assert_eq!(read_setting(&applied, "AutoScale").as_deref(), Some("True"));

        sidecar.end().await;
        let restored = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(!restored.contains("Vibeshine"));
        assert_eq!(read_setting(&restored, "AutoScale").as_deref(), Some("False"));
    }

    #[tokio::test]
    async fn end_without_apply_is_a_noop() {
        let sidecar = Sidecar::new();
        sidecar.end().await;
    }
}
