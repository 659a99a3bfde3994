use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use rust_embed::Embed;

use crate::error::ErrorResponse;

/// Embedded SPA build output.
#[derive(Embed)]
#[folder = "web/dist"]
#[prefix = ""]
pub struct StaticAssets;

/// Path prefixes that never fall through to the SPA shell.
const RESERVED_PREFIXES: &[&str] = &["/api", "/assets", "/covers", "/images"];

pub fn is_reserved_path(path: &str) -> bool {
    RESERVED_PREFIXES
        .iter()
        .any(|prefix| path == *prefix || path.starts_with(&format!("{prefix}/")))
}

/// Fallback for everything the API router did not match.
///
/// Non-reserved GETs receive the SPA shell (the frontend owns its own login
/// redirects), reserved paths 404, and unrouted mutating methods are a 400
/// by contract.
pub async fn fallback(request: Request<Body>) -> Response {
    let path = request.uri().path().to_string();

    if request.method() != Method::GET {
        let body = ErrorResponse {
            error: format!("no such endpoint: {path}"),
        };
        return (StatusCode::BAD_REQUEST, Json(body)).into_response();
    }

    if is_reserved_path(&path) {
        let body = ErrorResponse {
            error: format!("not found: {path}"),
        };
        return (StatusCode::NOT_FOUND, Json(body)).into_response();
    }

    // Exact asset match first, SPA shell for everything route-like
    let trimmed = path.trim_start_matches('/');
    if !trimmed.is_empty() {
        if let Some(response) = serve_embedded(trimmed) {
            return response;
        }
    }
    serve_embedded("index.html").unwrap_or_else(|| {
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
            .body(Body::from(placeholder_html()))
            .unwrap()
    })
}

fn serve_embedded(path: &str) -> Option<Response> {
    let asset = StaticAssets::get(path)?;
    let mime = mime_guess::from_path(path)
        .first_or_octet_stream()
        .to_string();

    Some(
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, mime)
            .header(header::CACHE_CONTROL, "public, max-age=86400")
            .body(Body::from(asset.data.to_vec()))
            .unwrap(),
    )
}

/// Minimal shell used when the frontend was not built into the binary.
pub fn placeholder_html() -> &'static str {
    r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Vibeshine</title>
</head>
<body>
    <h1>Vibeshine</h1>
    <p>Web UI not built. The API is available under /api.</p>
</body>
</html>"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_prefixes_match_whole_segments() {
        assert!(is_reserved_path("/api"));
        assert!(is_reserved_path("/api/apps"));
        assert!(is_reserved_path("/covers/x.png"));
        assert!(!is_reserved_path("/apidocs"));
        assert!(!is_reserved_path("/settings"));
        assert!(!is_reserved_path("/"));
    }
}
