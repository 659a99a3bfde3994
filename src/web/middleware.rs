//! Cross-cutting request policy: security headers on every response,
//! Content-Type validation on mutating methods, and the three-layer auth
//! gate.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
    Json,
};
use axum_extra::extract::CookieJar;

use crate::auth::{check_auth, origin_allowed, AuthOutcome, AUTH_COOKIE};
use crate::error::ErrorResponse;
use crate::state::AppState;

/// Paths reachable without credentials. The SPA shell and its assets are
/// handled by the fallback and are public by construction.
fn is_public_endpoint(path: &str) -> bool {
    matches!(
        path,
        "/api/configLocale"
            | "/api/auth/login"
            | "/api/auth/refresh"
            | "/api/auth/logout"
            | "/api/auth/status"
    )
}

/// Attach the standard security headers to every response.
pub async fn security_headers(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let https_port = state.config.get().web().https_port;
    let mut response = next.run(request).await;

    let headers = response.headers_mut();
    if let Ok(origin) = HeaderValue::from_str(&format!("https://localhost:{https_port}")) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    }
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("frame-ancestors 'none';"),
    );
    response
}

/// Mutating requests must declare the JSON content type; a missing header
/// is as much a 400 as a wrong one. Parameters are stripped and the
/// comparison is case-insensitive.
pub async fn content_type_guard(request: Request, next: Next) -> Response {
    let mutating = matches!(
        *request.method(),
        Method::POST | Method::PUT | Method::PATCH
    );
    if mutating {
        let Some(value) = request.headers().get(header::CONTENT_TYPE) else {
            let body = ErrorResponse {
                error: "Content type not provided".to_string(),
            };
            return (StatusCode::BAD_REQUEST, Json(body)).into_response();
        };
        let declared = value
            .to_str()
            .unwrap_or("")
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        if declared != "application/json" {
            let body = ErrorResponse {
                error: format!("unsupported content type \"{declared}\""),
            };
            return (StatusCode::BAD_REQUEST, Json(body)).into_response();
        }
    }
    next.run(request).await
}

/// Origin gate plus per-request authentication.
pub async fn auth_gate(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    cookies: CookieJar,
    request: Request,
    next: Next,
) -> Response {
    let web = state.config.get().web();

    // Layer 1: origin classification, 403 on the spot
    if !origin_allowed(remote.ip(), web.origin_web_ui_allowed) {
        let body = ErrorResponse {
            error: "origin not allowed".to_string(),
        };
        return (StatusCode::FORBIDDEN, Json(body)).into_response();
    }

    // The SPA shell and its assets are public; the frontend owns login
    // redirects for pages
    let path = request.uri().path();
    if !path.starts_with("/api") || is_public_endpoint(path) {
        return next.run(request).await;
    }

    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let cookie_token = cookies.get(AUTH_COOKIE).map(|c| c.value().to_string());
    let browser_get = *request.method() == Method::GET
        && request
            .headers()
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .map(|accept| accept.contains("text/html"))
            .unwrap_or(false);

    let outcome = check_auth(
        &web,
        &state.tokens,
        authorization.as_deref(),
        cookie_token.as_deref(),
        request.method().as_str(),
        path,
        browser_get,
    )
    .await;

    match outcome {
        AuthOutcome::Ok => next.run(request).await,
        AuthOutcome::Redirect => Redirect::temporary("/").into_response(),
        AuthOutcome::Forbidden => {
            let body = ErrorResponse {
                error: "forbidden".to_string(),
            };
            (StatusCode::FORBIDDEN, Json(body)).into_response()
        }
        AuthOutcome::Unauthorized => {
            let body = ErrorResponse {
                error: "not authenticated".to_string(),
            };
            (StatusCode::UNAUTHORIZED, Json(body)).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_endpoint_list() {
        assert!(is_public_endpoint("/api/configLocale"));
        assert!(is_public_endpoint("/api/auth/login"));
        assert!(!is_public_endpoint("/api/apps"));
        assert!(!is_public_endpoint("/api/auth/sessions"));
    }
}
