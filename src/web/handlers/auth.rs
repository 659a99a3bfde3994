use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::extract::CookieJar;
use serde::Deserialize;
use serde_json::json;

use super::{ok, StatusResponse};
use crate::auth::{password_matches, TokenScope, AUTH_COOKIE, REFRESH_COOKIE};
use crate::error::{AppError, Result};
use crate::state::AppState;

fn cookie_header(name: &str, value: &str, max_age_secs: i64) -> String {
    format!(
        "{name}={value}; Path=/; Secure; HttpOnly; SameSite=Strict; Priority=High; Max-Age={max_age_secs}"
    )
}

fn clear_cookie_header(name: &str) -> String {
    format!("{name}=; Path=/; Secure; HttpOnly; SameSite=Strict; Max-Age=0")
}

fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

// ============================================================================
// Login / refresh / logout / status
// ============================================================================

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub remember_me: bool,
}

/// `POST /api/auth/login`
pub async fn login(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<LoginRequest>,
) -> Result<Response> {
    let web = state.config.get().web();
    if !web.credentials_configured() {
        return Err(AppError::BadRequest(
            "no credentials configured yet".to_string(),
        ));
    }
    if !password_matches(&web, &body.username, &body.password) {
        return Err(AppError::Unauthorized);
    }

    let ua = user_agent(&headers);
    let addr = remote.ip().to_string();

    let session_raw = state
        .tokens
        .create_session_token(
            &web.username,
            &web.salt,
            Duration::from_secs(web.session_token_ttl_secs.max(0) as u64),
            &ua,
            &addr,
            false,
        )
        .await?;

    let mut response = (
        StatusCode::OK,
        Json(json!({"status": true, "username": web.username})),
    )
        .into_response();

    let headers = response.headers_mut();
    headers.append(
        header::SET_COOKIE,
        cookie_header(AUTH_COOKIE, &session_raw, web.session_token_ttl_secs)
            .parse()
            .unwrap(),
    );

    if body.remember_me {
        let refresh_raw = state
            .tokens
            .create_session_token(
                &web.username,
                &web.salt,
                Duration::from_secs(web.refresh_token_ttl_secs.max(0) as u64),
                &ua,
                &addr,
                true,
            )
            .await?;
        headers.append(
            header::SET_COOKIE,
            cookie_header(REFRESH_COOKIE, &refresh_raw, web.refresh_token_ttl_secs)
                .parse()
                .unwrap(),
        );
    }

    Ok(response)
}

/// `POST /api/auth/refresh`: mint a fresh session cookie off the refresh
/// token.
pub async fn refresh(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    cookies: CookieJar,
) -> Result<Response> {
    let web = state.config.get().web();
    let raw = cookies
        .get(REFRESH_COOKIE)
        .map(|c| c.value().to_string())
        .ok_or(AppError::Unauthorized)?;

    let token = state
        .tokens
        .check_session_token(&raw, &web.salt)
        .await
        .filter(|t| t.is_refresh)
        .ok_or(AppError::Unauthorized)?;

    let session_raw = state
        .tokens
        .create_session_token(
            &token.username,
            &web.salt,
            Duration::from_secs(web.session_token_ttl_secs.max(0) as u64),
            &user_agent(&headers),
            &remote.ip().to_string(),
            false,
        )
        .await?;

    let mut response = (StatusCode::OK, ok()).into_response();
    response.headers_mut().append(
        header::SET_COOKIE,
        cookie_header(AUTH_COOKIE, &session_raw, web.session_token_ttl_secs)
            .parse()
            .unwrap(),
    );
    Ok(response)
}

/// `POST /api/auth/logout`: revoke both tokens and clear both cookies.
pub async fn logout(
    State(state): State<Arc<AppState>>,
    cookies: CookieJar,
) -> Result<Response> {
    let web = state.config.get().web();
    if let Some(cookie) = cookies.get(AUTH_COOKIE) {
        let _ = state
            .tokens
            .revoke_session_raw(cookie.value(), &web.salt)
            .await;
    }
    if let Some(cookie) = cookies.get(REFRESH_COOKIE) {
        let _ = state
            .tokens
            .revoke_session_raw(cookie.value(), &web.salt)
            .await;
    }

    let mut response = (StatusCode::OK, ok()).into_response();
    let headers = response.headers_mut();
    headers.append(
        header::SET_COOKIE,
        clear_cookie_header(AUTH_COOKIE).parse().unwrap(),
    );
    headers.append(
        header::SET_COOKIE,
        clear_cookie_header(REFRESH_COOKIE).parse().unwrap(),
    );
    Ok(response)
}

/// `GET /api/auth/status` (public)
pub async fn status(
    State(state): State<Arc<AppState>>,
    cookies: CookieJar,
) -> Json<serde_json::Value> {
    let web = state.config.get().web();
    let configured = web.credentials_configured();

    let authenticated = match cookies.get(AUTH_COOKIE) {
        Some(cookie) if configured => state
            .tokens
            .check_session_token(cookie.value(), &web.salt)
            .await
            .is_some(),
        _ => false,
    };

    Json(json!({
        "credentials_configured": configured,
        "login_required": configured,
        "authenticated": authenticated || !configured,
    }))
}

/// `GET /api/auth/sessions`
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let sessions: Vec<_> = state
        .tokens
        .list_sessions()
        .await
        .into_iter()
        .map(|t| {
            json!({
                "hash": t.hash,
                "username": t.username,
                "created_at": t.created_at.to_rfc3339(),
                "expires_at": t.expires_at.to_rfc3339(),
                "user_agent": t.user_agent,
                "remote_addr": t.remote_addr,
                "is_refresh": t.is_refresh,
            })
        })
        .collect();
    Json(json!({"sessions": sessions}))
}

/// `DELETE /api/auth/sessions/{hash}`: revoking the current session also
/// clears the cookie.
pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
    cookies: CookieJar,
) -> Result<Response> {
    let web = state.config.get().web();
    let removed = state.tokens.revoke_session_hash(&hash).await?;
    if !removed {
        return Err(AppError::NotFound(format!("session {hash}")));
    }

    let was_current = cookies
        .get(AUTH_COOKIE)
        .map(|c| {
            crate::crypto::sha256_hex(format!("{}{}", c.value(), web.salt).as_bytes()) == hash
        })
        .unwrap_or(false);

    let mut response = (StatusCode::OK, ok()).into_response();
    if was_current {
        response.headers_mut().append(
            header::SET_COOKIE,
            clear_cookie_header(AUTH_COOKIE).parse().unwrap(),
        );
    }
    Ok(response)
}

// ============================================================================
// API tokens
// ============================================================================

#[derive(Deserialize)]
pub struct CreateTokenRequest {
    pub scopes: Vec<TokenScope>,
}

/// `POST /api/token`
pub async fn create_api_token(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateTokenRequest>,
) -> Result<Json<serde_json::Value>> {
    if body.scopes.is_empty() {
        return Err(AppError::BadRequest("token needs at least one scope".to_string()));
    }
    for scope in &body.scopes {
        regex::Regex::new(&scope.path)
            .map_err(|e| AppError::BadRequest(format!("invalid scope regex: {e}")))?;
    }

    let web = state.config.get().web();
    let raw = state
        .tokens
        .create_api_token(&web.username, &web.salt, body.scopes)
        .await?;
    Ok(Json(json!({"status": true, "token": raw})))
}

/// `GET /api/tokens`
pub async fn list_api_tokens(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let tokens: Vec<_> = state
        .tokens
        .list_api_tokens()
        .await
        .into_iter()
        .map(|t| {
            json!({
                "hash": t.hash,
                "username": t.username,
                "created_at": t.created_at.to_rfc3339(),
                "scopes": t.scopes,
            })
        })
        .collect();
    Json(json!({"tokens": tokens}))
}

/// `DELETE /api/token/{hash}`
pub async fn delete_api_token(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
) -> Result<Json<StatusResponse>> {
    if !state.tokens.revoke_api_token(&hash).await? {
        return Err(AppError::NotFound(format!("token {hash}")));
    }
    Ok(ok())
}
