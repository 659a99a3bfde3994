use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::Response,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use super::{ok, StatusResponse};
use crate::apps::{migrate_legacy_keys, validate_app_image_path, AppDef};
use crate::error::{AppError, Result};
use crate::session::LaunchSession;
use crate::state::AppState;

/// `GET /api/apps`: the apps file plus host identity and what is running.
pub async fn get_apps(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>> {
    let file = state.apps.snapshot().await;
    let current = state.supervisor.running_app().await;
    let config = state.config.get();

    Ok(Json(json!({
        "env": file.env,
        "apps": file.apps,
        "current_app": current.map(|app| json!({"uuid": app.uuid, "name": app.name})),
        "host_uuid": config.get("host_uuid").unwrap_or_default(),
        "host_name": hostname(),
    })))
}

fn hostname() -> String {
    std::env::var("COMPUTERNAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "vibeshine".to_string())
}

/// `POST /api/apps`: merge one app by uuid, appending when new.
pub async fn save_app(
    State(state): State<Arc<AppState>>,
    Json(mut body): Json<serde_json::Value>,
) -> Result<Json<StatusResponse>> {
    migrate_legacy_keys(&mut body);

    let app: AppDef = serde_json::from_value(body)
        .map_err(|e| AppError::BadRequest(format!("invalid app definition: {e}")))?;

    // The capture fixes hook Windows swap-chain internals
    if !cfg!(windows) && (app.gen1_framegen_fix || app.gen2_framegen_fix) {
        return Err(AppError::BadRequest(
            "frame-generation capture fixes are only supported on Windows".to_string(),
        ));
    }
    if app.name.is_empty() {
        return Err(AppError::BadRequest("app name must not be empty".to_string()));
    }

    state.apps.upsert(app).await?;
    Ok(ok())
}

#[derive(Deserialize)]
pub struct ReorderRequest {
    pub order: Vec<String>,
}

/// `POST /api/apps/reorder`: uuid ordering, unlisted apps appended.
pub async fn reorder_apps(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ReorderRequest>,
) -> Result<Json<StatusResponse>> {
    state.apps.reorder(&body.order).await?;
    Ok(ok())
}

#[derive(Deserialize)]
pub struct DeleteRequest {
    pub uuid: String,
}

/// `POST /api/apps/delete`: removal by uuid.
pub async fn delete_app(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DeleteRequest>,
) -> Result<Json<StatusResponse>> {
    let removed = state
        .apps
        .remove_by_uuid(&body.uuid)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("app {}", body.uuid)))?;
    after_delete(&state, &removed).await?;
    Ok(ok())
}

/// `DELETE /api/apps/{index}`: legacy positional form.
pub async fn delete_app_by_index(
    State(state): State<Arc<AppState>>,
    Path(index): Path<usize>,
) -> Result<Json<StatusResponse>> {
    let removed = state
        .apps
        .remove_by_index(index)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("app index {index}")))?;
    after_delete(&state, &removed).await?;
    Ok(ok())
}

/// Deleting the Playnite fullscreen entry also turns the feature off so the
/// reconciler does not bring it straight back.
async fn after_delete(state: &AppState, removed: &AppDef) -> Result<()> {
    if removed.playnite_fullscreen {
        state
            .config
            .update(|cfg| cfg.set("playnite_fullscreen_entry_enabled", "false".to_string()))
            .await?;
    }
    Ok(())
}

/// `GET /api/apps/{uuid}/cover`
pub async fn get_app_cover(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
) -> Result<Response> {
    let app = state
        .apps
        .find_by_uuid(&uuid)
        .await
        .ok_or_else(|| AppError::NotFound(format!("app {uuid}")))?;

    let path = validate_app_image_path(&app.image_path);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| AppError::NotFound(format!("cover for {uuid}")))?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "image/png")
        .body(Body::from(bytes))
        .unwrap())
}

#[derive(Deserialize)]
pub struct LaunchRequest {
    pub uuid: String,
    #[serde(default)]
    pub session: LaunchSession,
}

/// `POST /api/apps/launch`
pub async fn launch_app(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LaunchRequest>,
) -> Result<Json<StatusResponse>> {
    if state.apps.find_by_uuid(&body.uuid).await.is_none() {
        return Err(AppError::BadRequest(
            "Cannot find requested application".to_string(),
        ));
    }
    match state.launch_app(&body.uuid, body.session).await {
        Ok(()) => Ok(ok()),
        Err(AppError::ServiceUnavailable(_)) => Err(AppError::BadRequest(
            "Failed to initialize video capture/encoding. Is a display connected and turned on?"
                .to_string(),
        )),
        Err(e) => Err(e),
    }
}

/// `POST /api/apps/close`: succeeds even when nothing runs.
pub async fn close_app(State(state): State<Arc<AppState>>) -> Result<Json<StatusResponse>> {
    state.close_app().await?;
    Ok(ok())
}

/// `POST /api/apps/purge_autosync`
pub async fn purge_autosync(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>> {
    let removed = state.apps.purge_autosync().await?;
    Ok(Json(json!({"status": true, "removed": removed})))
}
