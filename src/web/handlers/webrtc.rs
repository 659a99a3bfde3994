use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    response::sse::{KeepAlive, Sse},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use super::{ok, StatusResponse};
use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::webrtc::{ice_event_stream, SessionOptions, MAX_ICE_CANDIDATES_PER_REQUEST};

/// `POST /api/webrtc/sessions`
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(options): Json<SessionOptions>,
) -> Result<Json<serde_json::Value>> {
    let session = state.webrtc.create_session(options)?;
    Ok(Json(json!({
        "status": true,
        "session": session,
        "cert_fingerprint": state.identity.fingerprint(),
        "cert_pem": state.identity.cert_pem(),
        "ice_servers": state.webrtc.ice_servers(),
    })))
}

/// `GET /api/webrtc/sessions`
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({"sessions": state.webrtc.list_sessions()}))
}

/// `GET /api/webrtc/sessions/{id}`
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let session = state
        .webrtc
        .session(&id)
        .ok_or_else(|| AppError::NotFound(format!("session {id}")))?;
    Ok(Json(json!({"status": true, "session": session})))
}

/// `DELETE /api/webrtc/sessions/{id}`
pub async fn close_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>> {
    if !state.webrtc.close_session(&id) {
        return Err(AppError::NotFound(format!("session {id}")));
    }
    Ok(ok())
}

#[derive(Deserialize)]
pub struct OfferRequest {
    pub sdp: String,
    #[serde(default = "default_offer_type")]
    pub r#type: String,
}

fn default_offer_type() -> String {
    "offer".to_string()
}

/// `POST /api/webrtc/sessions/{id}/offer`
pub async fn set_offer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<OfferRequest>,
) -> Result<Json<StatusResponse>> {
    if body.sdp.is_empty() {
        return Err(AppError::BadRequest("offer sdp must not be empty".to_string()));
    }
    state.webrtc.set_remote_offer(&id, body.sdp, body.r#type)?;
    Ok(ok())
}

#[derive(Deserialize)]
pub struct AnswerQuery {
    #[serde(default = "default_answer_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_answer_timeout_ms() -> u64 {
    10_000
}

/// `GET /api/webrtc/sessions/{id}/answer`: long-poll the local SDP answer.
pub async fn get_answer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<AnswerQuery>,
) -> Result<Json<serde_json::Value>> {
    let timeout = Duration::from_millis(query.timeout_ms.min(60_000));
    let sdp = state.webrtc.wait_for_local_answer(&id, timeout).await?;
    Ok(Json(json!({"status": true, "sdp": sdp, "type": "answer"})))
}

#[derive(Deserialize)]
pub struct IceCandidateBody {
    #[serde(default)]
    pub mid: String,
    #[serde(default)]
    pub mline_index: u32,
    pub candidate: String,
}

#[derive(Deserialize)]
pub struct AddCandidatesRequest {
    pub candidates: Vec<IceCandidateBody>,
}

/// `POST /api/webrtc/sessions/{id}/ice`
pub async fn add_ice_candidates(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<AddCandidatesRequest>,
) -> Result<Json<serde_json::Value>> {
    if body.candidates.len() > MAX_ICE_CANDIDATES_PER_REQUEST {
        return Err(AppError::BadRequest(format!(
            "at most {MAX_ICE_CANDIDATES_PER_REQUEST} candidates per request"
        )));
    }
    let total = state.webrtc.add_ice_candidates(
        &id,
        body.candidates
            .into_iter()
            .map(|c| (c.mid, c.mline_index, c.candidate))
            .collect(),
    )?;
    Ok(Json(json!({"status": true, "total": total})))
}

#[derive(Deserialize)]
pub struct SinceQuery {
    #[serde(default)]
    pub since: u64,
}

/// `GET /api/webrtc/sessions/{id}/ice?since=N`
pub async fn get_ice_candidates(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<SinceQuery>,
) -> Result<Json<serde_json::Value>> {
    let candidates = state.webrtc.local_candidates_since(&id, query.since)?;
    Ok(Json(json!({"status": true, "candidates": candidates})))
}

/// `GET /api/webrtc/sessions/{id}/ice/stream?since=N` (SSE)
pub async fn ice_stream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<SinceQuery>,
) -> Result<
    Sse<impl futures::Stream<Item = std::result::Result<axum::response::sse::Event, std::convert::Infallible>>>,
> {
    // 404 up front; afterwards the stream just ends on close
    state
        .webrtc
        .session(&id)
        .ok_or_else(|| AppError::NotFound(format!("session {id}")))?;

    let stream = ice_event_stream(state.webrtc.clone(), id, query.since);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
