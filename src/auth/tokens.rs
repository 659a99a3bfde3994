use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngCore;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::crypto::sha256_hex;
use crate::error::Result;
use crate::utils::atomic_replace;

/// Sweep cadence for expired session tokens.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// One web-UI session. Only the salted hash of the raw cookie value is
/// persisted; user agent and remote address are informational.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionToken {
    pub hash: String,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub user_agent: String,
    pub remote_addr: String,
    /// Refresh tokens outlive session tokens and can mint new ones
    #[serde(default)]
    pub is_refresh: bool,
}

impl SessionToken {
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// One scope of an API token: a path regex plus the methods it covers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenScope {
    pub path: String,
    pub methods: Vec<String>,
}

impl TokenScope {
    /// A scope matches when its anchored regex covers the path and the
    /// method is listed.
    pub fn matches(&self, path: &str, method: &str) -> bool {
        let Ok(re) = Regex::new(&format!("^{}$", self.path)) else {
            return false;
        };
        re.is_match(path) && self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }
}

/// A long-lived scoped API token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiToken {
    pub hash: String,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub scopes: Vec<TokenScope>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SessionFile {
    tokens: Vec<SessionToken>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ApiFile {
    tokens: Vec<ApiToken>,
}

/// Persisted token stores (session + API), JSON files under the data dir.
#[derive(Clone)]
pub struct TokenStore {
    session_path: PathBuf,
    api_path: PathBuf,
    sessions: Arc<RwLock<Vec<SessionToken>>>,
    api_tokens: Arc<RwLock<Vec<ApiToken>>>,
}

fn random_token() -> String {
    let mut raw = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut raw);
    raw.iter().map(|b| format!("{:02x}", b)).collect()
}

fn token_hash(raw: &str, salt: &str) -> String {
    sha256_hex(format!("{}{}", raw, salt).as_bytes())
}

impl TokenStore {
    pub async fn load(data_dir: &Path) -> Result<Self> {
        let session_path = data_dir.join("session_tokens.json");
        let api_path = data_dir.join("api_tokens.json");

        let sessions: SessionFile = read_or_default(&session_path).await?;
        let api_tokens: ApiFile = read_or_default(&api_path).await?;

        Ok(Self {
            session_path,
            api_path,
            sessions: Arc::new(RwLock::new(sessions.tokens)),
            api_tokens: Arc::new(RwLock::new(api_tokens.tokens)),
        })
    }

    /// Mint a session (or refresh) token. Returns the raw value for the
    /// cookie; only its hash is stored.
    pub async fn create_session_token(
        &self,
        username: &str,
        salt: &str,
        ttl: Duration,
        user_agent: &str,
        remote_addr: &str,
        is_refresh: bool,
    ) -> Result<String> {
        let raw = random_token();
        let token = SessionToken {
            hash: token_hash(&raw, salt),
            username: username.to_string(),
            created_at: Utc::now(),
            expires_at: Utc::now()
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero()),
            user_agent: user_agent.to_string(),
            remote_addr: remote_addr.to_string(),
            is_refresh,
        };

        let snapshot = {
            let mut sessions = self.sessions.write().await;
            sessions.push(token);
            sessions.clone()
        };
        self.persist_sessions(&snapshot).await?;
        Ok(raw)
    }

    /// Look a raw token up and enforce its TTL.
    pub async fn check_session_token(&self, raw: &str, salt: &str) -> Option<SessionToken> {
        let hash = token_hash(raw, salt);
        let sessions = self.sessions.read().await;
        sessions
            .iter()
            .find(|t| t.hash == hash && !t.expired(Utc::now()))
            .cloned()
    }

    /// Revoke by stored hash (the sessions API exposes hashes, not raws).
    pub async fn revoke_session_hash(&self, hash: &str) -> Result<bool> {
        let (snapshot, removed) = {
            let mut sessions = self.sessions.write().await;
            let before = sessions.len();
            sessions.retain(|t| t.hash != hash);
            (sessions.clone(), sessions.len() != before)
        };
        if removed {
            self.persist_sessions(&snapshot).await?;
        }
        Ok(removed)
    }

    /// Revoke by raw value (logout path).
    pub async fn revoke_session_raw(&self, raw: &str, salt: &str) -> Result<bool> {
        self.revoke_session_hash(&token_hash(raw, salt)).await
    }

    pub async fn list_sessions(&self) -> Vec<SessionToken> {
        self.sessions.read().await.clone()
    }

    /// Drop expired session tokens; returns how many went away.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let (snapshot, removed) = {
            let mut sessions = self.sessions.write().await;
            let before = sessions.len();
            sessions.retain(|t| !t.expired(now));
            (sessions.clone(), before - sessions.len())
        };
        if removed > 0 {
            self.persist_sessions(&snapshot).await?;
        }
        Ok(removed)
    }

    /// Mint a scoped API token; returns the raw bearer value.
    pub async fn create_api_token(
        &self,
        username: &str,
        salt: &str,
        scopes: Vec<TokenScope>,
    ) -> Result<String> {
        let raw = random_token();
        let token = ApiToken {
            hash: token_hash(&raw, salt),
            username: username.to_string(),
            created_at: Utc::now(),
            scopes,
        };

        let snapshot = {
            let mut tokens = self.api_tokens.write().await;
            tokens.push(token);
            tokens.clone()
        };
        self.persist_api(&snapshot).await?;
        Ok(raw)
    }

    /// Bearer check: any scope must match both path and method.
    pub async fn check_api_token(&self, raw: &str, salt: &str, path: &str, method: &str) -> bool {
        let hash = token_hash(raw, salt);
        let tokens = self.api_tokens.read().await;
        tokens
            .iter()
            .find(|t| t.hash == hash)
            .map(|t| t.scopes.iter().any(|s| s.matches(path, method)))
            .unwrap_or(false)
    }

    pub async fn list_api_tokens(&self) -> Vec<ApiToken> {
        self.api_tokens.read().await.clone()
    }

    pub async fn revoke_api_token(&self, hash: &str) -> Result<bool> {
        let (snapshot, removed) = {
            let mut tokens = self.api_tokens.write().await;
            let before = tokens.len();
            tokens.retain(|t| t.hash != hash);
            (tokens.clone(), tokens.len() != before)
        };
        if removed {
            self.persist_api(&snapshot).await?;
        }
        Ok(removed)
    }

    async fn persist_sessions(&self, tokens: &[SessionToken]) -> Result<()> {
        let file = SessionFile {
            tokens: tokens.to_vec(),
        };
        atomic_replace(&self.session_path, &serde_json::to_vec_pretty(&file)?).await?;
        Ok(())
    }

    async fn persist_api(&self, tokens: &[ApiToken]) -> Result<()> {
        let file = ApiFile {
            tokens: tokens.to_vec(),
        };
        atomic_replace(&self.api_path, &serde_json::to_vec_pretty(&file)?).await?;
        Ok(())
    }
}

async fn read_or_default<T: serde::de::DeserializeOwned + Default>(path: &Path) -> Result<T> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(serde_json::from_str(&text)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

/// Background sweeper deleting expired session tokens every hour.
pub fn spawn_token_sweeper(store: TokenStore, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match store.cleanup_expired().await {
                        Ok(0) => {}
                        Ok(n) => tracing::info!("Swept {} expired session token(s)", n),
                        Err(e) => tracing::warn!("Token sweep failed: {}", e),
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    });
}
