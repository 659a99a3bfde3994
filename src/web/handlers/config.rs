use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::json;

use crate::error::{AppError, Result};
use crate::state::AppState;

/// `GET /api/config`: the raw key set plus platform/version so the UI can
/// shape itself.
pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let config = state.config.get();
    Json(json!({
        "status": true,
        "platform": std::env::consts::OS,
        "version": env!("CARGO_PKG_VERSION"),
        "config": config.raw(),
    }))
}

fn value_to_config_string(value: &serde_json::Value) -> Result<Option<String>> {
    Ok(match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) if s.is_empty() => None,
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        // JSON-valued keys (playnite_sync_categories etc.) stay JSON text
        other => Some(serde_json::to_string(other)?),
    })
}

fn apply_outcome_body(outcome: crate::config::ConfigApplyOutcome) -> serde_json::Value {
    json!({
        "status": true,
        "appliedNow": outcome.applied_now,
        "deferred": outcome.deferred,
        "restartRequired": outcome.restart_required,
    })
}

/// `POST /api/config`: replace the whole key set.
pub async fn save_config(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>> {
    let object = body
        .as_object()
        .ok_or_else(|| AppError::BadRequest("config body must be an object".to_string()))?;

    let mut map = BTreeMap::new();
    for (key, value) in object {
        if let Some(text) = value_to_config_string(value)? {
            map.insert(key.clone(), text);
        }
    }

    let outcome = state
        .config
        .replace_all(map, state.sessions.any_active())
        .await?;
    Ok(Json(apply_outcome_body(outcome)))
}

/// `PATCH /api/config`: partial update; null or empty removes a key.
pub async fn patch_config(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>> {
    let object = body
        .as_object()
        .ok_or_else(|| AppError::BadRequest("config body must be an object".to_string()))?;

    let mut changes = BTreeMap::new();
    for (key, value) in object {
        changes.insert(key.clone(), value_to_config_string(value)?);
    }

    let outcome = state
        .config
        .patch(changes, state.sessions.any_active())
        .await?;
    Ok(Json(apply_outcome_body(outcome)))
}
