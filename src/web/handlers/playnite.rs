use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::json;

use super::{ok, require_windows, StatusResponse};
use crate::error::Result;
use crate::playnite::protocol::OutboundMessage;
use crate::playnite::sync::run_autosync;
use crate::state::AppState;

/// `GET /api/playnite/status` (Windows)
pub async fn status(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>> {
    require_windows()?;
    Ok(Json(json!({
        "status": true,
        "connected": state.playnite.is_connected(),
        "games": state.playnite.games().len(),
        "categories": state.playnite.categories().len(),
        "plugins": state.playnite.plugins().len(),
    })))
}

/// `GET /api/playnite/games` (Windows)
pub async fn games(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>> {
    require_windows()?;
    Ok(Json(json!({"games": state.playnite.games()})))
}

/// `GET /api/playnite/categories` (Windows)
pub async fn categories(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>> {
    require_windows()?;
    Ok(Json(json!({"categories": state.playnite.categories()})))
}

/// `GET /api/playnite/plugins` (Windows)
pub async fn plugins(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>> {
    require_windows()?;
    Ok(Json(json!({"plugins": state.playnite.plugins()})))
}

/// `POST /api/playnite/sync` (Windows): force one reconcile pass.
pub async fn force_sync(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>> {
    require_windows()?;
    let cfg = state.config.get().playnite();
    let games = state.playnite.games();
    let outcome = run_autosync(&cfg, &games, &state.apps).await?;
    Ok(Json(json!({
        "status": true,
        "changed": outcome.changed,
        "added": outcome.added,
        "removed": outcome.removed,
        "updated": outcome.updated,
    })))
}

#[derive(Deserialize)]
pub struct GameCommand {
    pub id: String,
}

/// `POST /api/playnite/launch` (Windows)
pub async fn launch_game(
    State(state): State<Arc<AppState>>,
    Json(body): Json<GameCommand>,
) -> Result<Json<StatusResponse>> {
    require_windows()?;
    state.playnite.send(OutboundMessage::launch(&body.id));
    Ok(ok())
}

/// `POST /api/playnite/stop` (Windows)
pub async fn stop_game(
    State(state): State<Arc<AppState>>,
    Json(body): Json<GameCommand>,
) -> Result<Json<StatusResponse>> {
    require_windows()?;
    state.playnite.send_stop(&body.id);
    Ok(ok())
}
