use std::path::PathBuf;
use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::json;

use super::require_windows;
use crate::error::Result;
use crate::state::AppState;

/// `GET /api/display-devices`: what the host knows about attached
/// displays. Enumeration itself is owned by the display helper; this
/// surfaces the configured output and virtual-display settings.
pub async fn get_display_devices(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let dd = state.config.get().dd();
    Json(json!({
        "status": true,
        "output_name": dd.output_name,
        "virtual_display_mode": match dd.virtual_display_mode {
            crate::config::VirtualDisplayMode::Disabled => "disabled",
            crate::config::VirtualDisplayMode::PerClient => "per_client",
            crate::config::VirtualDisplayMode::Shared => "shared",
        },
        "applied": state.arbiter.has_applied().await,
    }))
}

/// `GET /api/framegen/edid-refresh` (Windows): highest refresh the EDID of
/// the configured output advertises, for framegen rate validation.
pub async fn get_framegen_edid_refresh(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>> {
    require_windows()?;
    let dd = state.config.get().dd();
    Ok(Json(json!({
        "status": true,
        "output_name": dd.output_name,
        // Filled by the display helper on Windows hosts
        "refresh_rates": [],
    })))
}

/// `GET /api/health/vigem` (Windows): virtual gamepad driver presence.
pub async fn get_vigem_health() -> Result<Json<serde_json::Value>> {
    require_windows()?;
    Ok(Json(json!({"status": true, "installed": false})))
}

/// `POST /api/reset-display-device-persistence`: clear the helper's
/// persisted display state.
pub async fn reset_persistence(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let ok = state.arbiter.reset_persistence().await.is_ok();
    Json(json!({"status": ok}))
}

/// Candidate paths where the helper writes the golden snapshot. Both the
/// roaming and local profile directories are probed since the helper may
/// run under either.
fn golden_snapshot_candidates() -> Vec<PathBuf> {
    let mut out = Vec::new();
    for base in ["APPDATA", "LOCALAPPDATA"] {
        if let Some(base) = std::env::var_os(base) {
            out.push(
                PathBuf::from(base)
                    .join("Vibeshine")
                    .join("display_golden_restore.json"),
            );
        }
    }
    out
}

/// `POST /api/display/export_golden` (Windows): have the helper snapshot
/// the current display topology as the known-good revert target.
pub async fn export_golden(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>> {
    require_windows()?;
    let ok = state.arbiter.export_golden().await.is_ok();
    Ok(Json(json!({"status": ok})))
}

/// `GET /api/display/golden_status` (Windows)
pub async fn golden_status(State(_state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>> {
    require_windows()?;
    let exists = golden_snapshot_candidates().iter().any(|p| p.is_file());
    Ok(Json(json!({"exists": exists})))
}

/// `DELETE /api/display/golden` (Windows): remove the helper-written
/// snapshot wherever it landed.
pub async fn delete_golden(State(_state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>> {
    require_windows()?;
    let mut any_deleted = false;
    for path in golden_snapshot_candidates() {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => any_deleted = true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove {}: {}", path.display(), e),
        }
    }
    Ok(Json(json!({"deleted": any_deleted})))
}
