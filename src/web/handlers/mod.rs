pub mod apps;
pub mod auth;
pub mod clients;
pub mod config;
pub mod display;
pub mod playnite;
pub mod webrtc;

use std::sync::Arc;

use axum::{extract::State, http::header, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};

use crate::auth::hash_password;
use crate::error::{AppError, Result};
use crate::state::AppState;

/// Body returned by every side-effecting endpoint on success.
#[derive(Serialize)]
pub struct StatusResponse {
    pub status: bool,
}

pub fn ok() -> Json<StatusResponse> {
    Json(StatusResponse { status: true })
}

/// Endpoints that only make sense against the Windows display/driver
/// stack reject everywhere else.
pub fn require_windows() -> Result<()> {
    if cfg!(windows) {
        Ok(())
    } else {
        Err(AppError::BadRequest(
            "this endpoint is only supported on Windows".to_string(),
        ))
    }
}

// ============================================================================
// Host metadata / locale / logs
// ============================================================================

#[derive(Serialize)]
pub struct Metadata {
    pub status: bool,
    pub version: &'static str,
    pub platform: &'static str,
}

pub async fn get_metadata() -> Json<Metadata> {
    Json(Metadata {
        status: true,
        version: env!("CARGO_PKG_VERSION"),
        platform: std::env::consts::OS,
    })
}

#[derive(Serialize)]
pub struct LocaleResponse {
    pub locale: String,
}

/// Public: the SPA needs the locale before login.
pub async fn get_locale(State(state): State<Arc<AppState>>) -> Json<LocaleResponse> {
    let locale = state
        .config
        .get()
        .get("locale")
        .unwrap_or("en")
        .to_string();
    Json(LocaleResponse { locale })
}

pub async fn get_logs(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let text = state.logs.snapshot().join("\n");
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], text)
}

pub async fn export_logs(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    require_windows()?;
    let text = state.logs.snapshot().join("\n");
    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"vibeshine-logs.txt\"",
            ),
        ],
        text,
    ))
}

// ============================================================================
// Session status / process control
// ============================================================================

#[derive(Serialize)]
pub struct SessionStatus {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub appid: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
}

pub async fn session_status(State(state): State<Arc<AppState>>) -> Json<SessionStatus> {
    match state.sessions.active().await {
        Some(session) => Json(SessionStatus {
            active: true,
            appid: Some(session.launch.appid),
            app_name: Some(session.app_name),
            client_name: Some(session.launch.device_name),
            started_at: Some(session.started_at_wall.to_rfc3339()),
        }),
        None => Json(SessionStatus {
            active: false,
            appid: None,
            app_name: None,
            client_name: None,
            started_at: None,
        }),
    }
}

pub async fn restart(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    tracing::info!("Restart requested over the API");
    let _ = state.shutdown_tx.send(());
    ok()
}

pub async fn quit(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    tracing::info!("Shutdown requested over the API");
    let _ = state.shutdown_tx.send(());
    ok()
}

// ============================================================================
// Credentials
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordChange {
    #[serde(default)]
    pub current_username: String,
    #[serde(default)]
    pub current_password: String,
    pub new_username: String,
    pub new_password: String,
    #[serde(default)]
    pub confirm_new_password: String,
}

pub async fn save_password(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PasswordChange>,
) -> Result<Json<StatusResponse>> {
    if body.new_username.is_empty() || body.new_password.is_empty() {
        return Err(AppError::BadRequest(
            "username and password must not be empty".to_string(),
        ));
    }
    if !body.confirm_new_password.is_empty() && body.confirm_new_password != body.new_password {
        return Err(AppError::BadRequest(
            "password confirmation does not match".to_string(),
        ));
    }

    let web = state.config.get().web();
    if web.credentials_configured()
        && !crate::auth::password_matches(&web, &body.current_username, &body.current_password)
    {
        return Err(AppError::Unauthorized);
    }

    let salt: String = {
        use rand::RngCore;
        let mut raw = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut raw);
        raw.iter().map(|b| format!("{:02x}", b)).collect()
    };
    let hash = hash_password(&body.new_password, &salt);

    state
        .config
        .update(|cfg| {
            cfg.set("username", body.new_username.clone());
            cfg.set("salt", salt.clone());
            cfg.set("password", hash.clone());
        })
        .await?;

    Ok(ok())
}
