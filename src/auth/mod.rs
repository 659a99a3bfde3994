//! Request authentication: origin gating, credential checks, and the
//! session/refresh/API token stores.
//!
//! Three layers run in order on every protected request: the origin gate
//! (403 on a disallowed remote), the credentials check (first-run hosts
//! with no username pass everything), then per-request auth via Basic
//! credentials, a session token, or a scoped API token.

pub mod tokens;

use std::net::IpAddr;

use base64::Engine;

use crate::config::schema::OriginScope;
use crate::config::WebConfig;
use crate::crypto::sha256_hex;

pub use tokens::{spawn_token_sweeper, ApiToken, SessionToken, TokenScope, TokenStore};

/// Cookie carrying the raw session token.
pub const AUTH_COOKIE: &str = "auth";
/// Cookie carrying the raw refresh token.
pub const REFRESH_COOKIE: &str = "auth_refresh";

/// Outcome of the auth layer for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Ok,
    Unauthorized,
    Forbidden,
    /// Browser GET against a protected page without credentials
    Redirect,
}

/// Classify a remote address against the allowed origin scope.
pub fn origin_allowed(remote: IpAddr, scope: OriginScope) -> bool {
    match scope {
        OriginScope::Wan => true,
        OriginScope::Pc => remote.is_loopback(),
        OriginScope::Lan => remote.is_loopback() || is_private(remote),
    }
}

fn is_private(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            // fc00::/7 unique local, fe80::/10 link local
            let segments = v6.segments();
            (segments[0] & 0xfe00) == 0xfc00 || (segments[0] & 0xffc0) == 0xfe80
        }
    }
}

/// Verify a cleartext password against the stored salted hash.
pub fn password_matches(web: &WebConfig, username: &str, password: &str) -> bool {
    if !web.credentials_configured() {
        return false;
    }
    let hash = sha256_hex(format!("{}{}", password, web.salt).as_bytes());
    web.username.eq_ignore_ascii_case(username) && hash == web.password_hash
}

/// Compute the stored form of a new password.
pub fn hash_password(password: &str, salt: &str) -> String {
    sha256_hex(format!("{}{}", password, salt).as_bytes())
}

/// Parse an `Authorization: Basic` header into (username, password).
pub fn parse_basic_auth(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Per-request auth over the three credential forms.
///
/// `authorization` is the raw header if present, `cookie_token` the raw
/// value of the auth cookie. Async because token checks hit the store.
pub async fn check_auth(
    web: &WebConfig,
    tokens: &TokenStore,
    authorization: Option<&str>,
    cookie_token: Option<&str>,
    method: &str,
    path: &str,
    browser_get: bool,
) -> AuthOutcome {
    // First-run: nothing configured, everything passes
    if !web.credentials_configured() {
        return AuthOutcome::Ok;
    }

    if let Some(header) = authorization {
        if header.starts_with("Basic ") {
            if let Some((user, pass)) = parse_basic_auth(header) {
                if password_matches(web, &user, &pass) {
                    return AuthOutcome::Ok;
                }
            }
            return AuthOutcome::Unauthorized;
        }
        if let Some(raw) = header.strip_prefix("Session ") {
            if tokens.check_session_token(raw.trim(), &web.salt).await.is_some() {
                return AuthOutcome::Ok;
            }
            return AuthOutcome::Unauthorized;
        }
        if let Some(raw) = header.strip_prefix("Bearer ") {
            if tokens
                .check_api_token(raw.trim(), &web.salt, path, method)
                .await
            {
                return AuthOutcome::Ok;
            }
            return AuthOutcome::Unauthorized;
        }
    }

    if let Some(raw) = cookie_token {
        if tokens.check_session_token(raw, &web.salt).await.is_some() {
            return AuthOutcome::Ok;
        }
    }

    if browser_get {
        return AuthOutcome::Redirect;
    }
    AuthOutcome::Unauthorized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::AppConfig;
    use std::collections::BTreeMap;

    fn web_with_credentials() -> WebConfig {
        let mut map = BTreeMap::new();
        map.insert("username".to_string(), "admin".to_string());
        map.insert("salt".to_string(), "pepper".to_string());
        map.insert(
            "password".to_string(),
            hash_password("hunter2", "pepper"),
        );
        AppConfig::from_map(map).web()
    }

    #[test]
    fn origin_scopes() {
        let loopback: IpAddr = "127.0.0.1".parse().unwrap();
        let lan: IpAddr = "192.168.1.20".parse().unwrap();
        let wan: IpAddr = "8.8.8.8".parse().unwrap();

        assert!(origin_allowed(loopback, OriginScope::Pc));
        assert!(!origin_allowed(lan, OriginScope::Pc));
        assert!(origin_allowed(lan, OriginScope::Lan));
        assert!(!origin_allowed(wan, OriginScope::Lan));
        assert!(origin_allowed(wan, OriginScope::Wan));

        let ula: IpAddr = "fd12:3456:789a::1".parse().unwrap();
        assert!(origin_allowed(ula, OriginScope::Lan));
    }

    #[test]
    fn password_check_is_salted_and_case_insensitive_on_username() {
        let web = web_with_credentials();
        assert!(password_matches(&web, "admin", "hunter2"));
        assert!(password_matches(&web, "ADMIN", "hunter2"));
        assert!(!password_matches(&web, "admin", "hunter3"));
        assert!(!password_matches(&web, "other", "hunter2"));
    }

    #[test]
    fn basic_header_parses() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("admin:hunter2");
        let (user, pass) = parse_basic_auth(&format!("Basic {encoded}")).unwrap();
        assert_eq!(user, "admin");
        assert_eq!(pass, "hunter2");
        assert!(parse_basic_auth("Bearer xyz").is_none());
    }

    #[tokio::test]
    async fn first_run_passes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = TokenStore::load(dir.path()).await.unwrap();
        let web = AppConfig::default().web();
        assert_eq!(
            check_auth(&web, &tokens, None, None, "GET", "/api/apps", false).await,
            AuthOutcome::Ok
        );
    }

    #[tokio::test]
    async fn browser_get_redirects_instead_of_401() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = TokenStore::load(dir.path()).await.unwrap();
        let web = web_with_credentials();

        assert_eq!(
            check_auth(&web, &tokens, None, None, "GET", "/", true).await,
            AuthOutcome::Redirect
        );
        assert_eq!(
            check_auth(&web, &tokens, None, None, "POST", "/api/apps", false).await,
            AuthOutcome::Unauthorized
        );
    }

    #[tokio::test]
    async fn basic_auth_grants_access() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = TokenStore::load(dir.path()).await.unwrap();
        let web = web_with_credentials();
        let encoded = base64::engine::general_purpose::STANDARD.encode("admin:hunter2");

        assert_eq!(
            check_auth(
                &web,
                &tokens,
                Some(&format!("Basic {encoded}")),
                None,
                "GET",
                "/api/apps",
                false
            )
            .await,
            AuthOutcome::Ok
        );
    }
}
