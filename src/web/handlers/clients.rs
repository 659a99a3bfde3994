use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::json;

use super::{ok, require_windows, StatusResponse};
use crate::error::{AppError, Result};
use crate::state::AppState;

/// `GET /api/clients/list`
pub async fn list_clients(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let clients: Vec<_> = state
        .clients
        .list()
        .await
        .into_iter()
        .map(|c| {
            json!({
                "uuid": c.uuid,
                "name": c.name,
                "perm": c.perm.bits(),
                "permissions": c.perm.names(),
                "display_mode": c.display_mode,
                "output_name_override": c.output_name_override,
                "always_use_virtual_display": c.always_use_virtual_display,
                "virtual_display_mode": c.virtual_display_mode,
                "virtual_display_layout": c.virtual_display_layout,
                "prefer_10bit_sdr": c.prefer_10bit_sdr,
                "enable_legacy_ordering": c.enable_legacy_ordering,
                "allow_client_commands": c.allow_client_commands,
                "hdr_profile": c.hdr_profile,
                "config_overrides": c.config_overrides,
                "do_cmds": c.do_cmds,
                "undo_cmds": c.undo_cmds,
            })
        })
        .collect();
    Json(json!({"clients": clients}))
}

#[derive(Deserialize)]
pub struct UpdateClientRequest {
    pub uuid: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub perm: Option<u32>,
    #[serde(default)]
    pub display_mode: Option<String>,
    #[serde(default)]
    pub output_name_override: Option<String>,
    #[serde(default)]
    pub always_use_virtual_display: Option<bool>,
    #[serde(default)]
    pub virtual_display_mode: Option<String>,
    #[serde(default)]
    pub virtual_display_layout: Option<String>,
    #[serde(default)]
    pub prefer_10bit_sdr: Option<bool>,
    #[serde(default)]
    pub enable_legacy_ordering: Option<bool>,
    #[serde(default)]
    pub allow_client_commands: Option<bool>,
    #[serde(default)]
    pub hdr_profile: Option<String>,
    #[serde(default)]
    pub config_overrides: Option<std::collections::BTreeMap<String, String>>,
    #[serde(default)]
    pub do_cmds: Option<Vec<String>>,
    #[serde(default)]
    pub undo_cmds: Option<Vec<String>>,
}

/// `POST /api/clients/update`: merge the provided fields by uuid.
pub async fn update_client(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UpdateClientRequest>,
) -> Result<Json<StatusResponse>> {
    state
        .clients
        .update(&body.uuid, |client| {
            if let Some(v) = body.name.clone() {
                client.name = v;
            }
            if let Some(v) = body.perm {
                client.perm = crate::pairing::Perm::from_bits_truncate(v);
            }
            if let Some(v) = body.display_mode.clone() {
                client.display_mode = v;
            }
            if let Some(v) = body.output_name_override.clone() {
                client.output_name_override = v;
            }
            if let Some(v) = body.always_use_virtual_display {
                client.always_use_virtual_display = v;
            }
            if let Some(v) = body.virtual_display_mode.clone() {
                client.virtual_display_mode = v;
            }
            if let Some(v) = body.virtual_display_layout.clone() {
                client.virtual_display_layout = v;
            }
            if let Some(v) = body.prefer_10bit_sdr {
                client.prefer_10bit_sdr = v;
            }
            if let Some(v) = body.enable_legacy_ordering {
                client.enable_legacy_ordering = v;
            }
            if let Some(v) = body.allow_client_commands {
                client.allow_client_commands = v;
            }
            if let Some(v) = body.hdr_profile.clone() {
                client.hdr_profile = v;
            }
            if let Some(v) = body.config_overrides.clone() {
                client.config_overrides = v;
            }
            if let Some(v) = body.do_cmds.clone() {
                client.do_cmds = v;
            }
            if let Some(v) = body.undo_cmds.clone() {
                client.undo_cmds = v;
            }
        })
        .await?;
    Ok(ok())
}

#[derive(Deserialize)]
pub struct UnpairRequest {
    pub uuid: String,
}

/// `POST /api/clients/unpair`
pub async fn unpair(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UnpairRequest>,
) -> Result<Json<StatusResponse>> {
    if !state.clients.remove(&body.uuid).await? {
        return Err(AppError::NotFound(format!("client {}", body.uuid)));
    }
    Ok(ok())
}

/// `POST /api/clients/unpair-all`
pub async fn unpair_all(State(state): State<Arc<AppState>>) -> Result<Json<StatusResponse>> {
    state.clients.remove_all().await?;
    Ok(ok())
}

/// `POST /api/clients/disconnect`: end the active stream session.
pub async fn disconnect(State(state): State<Arc<AppState>>) -> Result<Json<StatusResponse>> {
    state.close_app().await?;
    Ok(ok())
}

/// `GET /api/clients/hdr-profiles` (Windows): ICC profiles selectable per
/// client.
pub async fn hdr_profiles(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>> {
    require_windows()?;
    let dir = state.data_dir().join("hdr-profiles");
    let mut profiles = Vec::new();
    if let Ok(mut entries) = tokio::fs::read_dir(&dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.to_lowercase().ends_with(".icc") || name.to_lowercase().ends_with(".icm") {
                profiles.push(name);
            }
        }
    }
    profiles.sort();
    Ok(Json(json!({"profiles": profiles})))
}

// ============================================================================
// Pairing
// ============================================================================

#[derive(Deserialize)]
pub struct PinRequest {
    pub pin: String,
    #[serde(default)]
    pub name: String,
}

/// `POST /api/pin`: complete a pending pairing with the user-entered PIN.
pub async fn save_pin(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PinRequest>,
) -> Result<Json<StatusResponse>> {
    if body.pin.is_empty() {
        return Err(AppError::BadRequest("pin must not be empty".to_string()));
    }
    state.pairing.submit_pin(&body.pin, &body.name).await?;
    Ok(ok())
}

#[derive(Deserialize)]
pub struct OtpRequest {
    #[serde(default)]
    pub name: String,
}

/// `POST /api/otp`: issue a one-time pairing code.
pub async fn get_otp(
    State(state): State<Arc<AppState>>,
    Json(body): Json<OtpRequest>,
) -> Json<serde_json::Value> {
    let (otp, expires_in) = state.pairing.issue_otp(&body.name).await;
    Json(json!({"status": true, "otp": otp, "expires_in": expires_in}))
}
