use arc_swap::ArcSwap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::schema::{is_hot_applicable, AppConfig, RESTART_REQUIRED_KEYS};
use crate::error::Result;
use crate::utils::atomic_replace;

/// Configuration store backed by the `key = value` file.
///
/// Uses `ArcSwap` for lock-free reads, so hot paths (auth checks, encode
/// loop) can consult the config without taking a lock.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    cache: Arc<ArcSwap<AppConfig>>,
    change_tx: broadcast::Sender<ConfigChange>,
}

/// Configuration change event
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub keys: Vec<String>,
}

/// What happened to a config write relative to the running process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigApplyOutcome {
    pub applied_now: bool,
    pub deferred: bool,
    pub restart_required: bool,
}

impl ConfigStore {
    /// Load (or create) the config file at `path`.
    pub async fn load(path: &Path) -> Result<Self> {
        let config = match tokio::fs::read_to_string(path).await {
            Ok(text) => AppConfig::from_map(parse_config_text(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
            Err(e) => return Err(e.into()),
        };

        let (change_tx, _) = broadcast::channel(16);

        Ok(Self {
            path: path.to_path_buf(),
            cache: Arc::new(ArcSwap::from_pointee(config)),
            change_tx,
        })
    }

    /// Get current configuration (lock-free).
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Subscribe to configuration changes.
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }

    /// Replace the whole key set (`POST /api/config`).
    ///
    /// `sessions_active` decides whether non-restart changes apply now or
    /// are deferred until the streams end.
    pub async fn replace_all(
        &self,
        map: BTreeMap<String, String>,
        sessions_active: bool,
    ) -> Result<ConfigApplyOutcome> {
        let current = self.get();
        let changed: Vec<String> = changed_keys(current.raw(), &map);
        let next = AppConfig::from_map(map);
        self.persist(next, &changed).await?;
        Ok(classify_changes(&changed, sessions_active))
    }

    /// Apply a partial update (`PATCH /api/config`). `None` (or empty
    /// string) removes the key.
    pub async fn patch(
        &self,
        changes: BTreeMap<String, Option<String>>,
        sessions_active: bool,
    ) -> Result<ConfigApplyOutcome> {
        let current = self.get();
        let mut map = current.raw().clone();
        let mut changed = Vec::new();

        for (key, value) in changes {
            match value {
                Some(v) if !v.is_empty() => {
                    if map.get(&key).map(String::as_str) != Some(v.as_str()) {
                        map.insert(key.clone(), v);
                        changed.push(key);
                    }
                }
                _ => {
                    if map.remove(&key).is_some() {
                        changed.push(key);
                    }
                }
            }
        }

        if changed.is_empty() {
            return Ok(ConfigApplyOutcome {
                applied_now: false,
                deferred: false,
                restart_required: false,
            });
        }

        let next = AppConfig::from_map(map);
        self.persist(next, &changed).await?;
        Ok(classify_changes(&changed, sessions_active))
    }

    /// Update configuration with a closure, persisting the result.
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let current = self.get();
        let mut config = (*current).clone();
        f(&mut config);
        let changed = changed_keys(current.raw(), config.raw());
        self.persist(config, &changed).await
    }

    async fn persist(&self, config: AppConfig, changed: &[String]) -> Result<()> {
        let text = serialize_config(config.raw());
        atomic_replace(&self.path, text.as_bytes()).await?;
        self.cache.store(Arc::new(config));

        if !changed.is_empty() {
            let _ = self.change_tx.send(ConfigChange {
                keys: changed.to_vec(),
            });
        }
        Ok(())
    }
}

/// Decide how a set of changed keys lands in the running process.
pub fn classify_changes(changed: &[String], sessions_active: bool) -> ConfigApplyOutcome {
    let restart_required = changed
        .iter()
        .any(|k| RESTART_REQUIRED_KEYS.contains(&k.as_str()));
    if restart_required {
        return ConfigApplyOutcome {
            applied_now: false,
            deferred: false,
            restart_required: true,
        };
    }

    let applied_now = !sessions_active || changed.iter().all(|k| is_hot_applicable(k));
    ConfigApplyOutcome {
        applied_now,
        deferred: !applied_now,
        restart_required: false,
    }
}

/// Parse the `key = value` grammar: one pair per line, `#` comments and
/// blank lines ignored, values are the raw remainder after the first `=`.
pub fn parse_config_text(text: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        map.insert(key.to_string(), value.trim().to_string());
    }
    map
}

/// Serialize back to the file grammar, keys sorted for stable diffs.
/// Unknown keys survive a load/save round trip untouched.
pub fn serialize_config(map: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in map {
        out.push_str(key);
        out.push_str(" = ");
        out.push_str(value);
        out.push('\n');
    }
    out
}

fn changed_keys(old: &BTreeMap<String, String>, new: &BTreeMap<String, String>) -> Vec<String> {
    let mut changed = Vec::new();
    for (k, v) in new {
        if old.get(k) != Some(v) {
            changed.push(k.clone());
        }
    }
    for k in old.keys() {
        if !new.contains_key(k) {
            changed.push(k.clone());
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_skips_comments_and_blanks() {
        let text = "# comment\n\nport = 47989\n  output_name = \\\\.\\DISPLAY1  \nbroken line\n";
        let map = parse_config_text(text);
        assert_eq!(map.len(), 2);
        assert_eq!(map["port"], "47989");
        assert_eq!(map["output_name"], r"\\.\DISPLAY1");
    }

    #[test]
    fn value_keeps_embedded_equals() {
        let map = parse_config_text("global_prep_cmd = [{\"do\":\"x=1\"}]\n");
        assert_eq!(map["global_prep_cmd"], "[{\"do\":\"x=1\"}]");
    }

    #[test]
    fn round_trip_preserves_unknown_keys() {
        let text = "future_key = something\nport = 48010\n";
        let map = parse_config_text(text);
        let out = serialize_config(&map);
        assert!(out.contains("future_key = something"));
        assert_eq!(parse_config_text(&out), map);
    }

    #[test]
    fn classify_restart_wins() {
        let outcome = classify_changes(&["port".into(), "playnite_auto_sync".into()], false);
        assert!(outcome.restart_required);
        assert!(!outcome.applied_now);
        assert!(!outcome.deferred);
    }

    #[test]
    fn classify_playnite_hot_applies_mid_session() {
        let outcome = classify_changes(&["playnite_auto_sync".into()], true);
        assert!(outcome.applied_now);
        assert!(!outcome.deferred);
        assert!(!outcome.restart_required);
    }

    #[test]
    fn classify_defers_other_keys_mid_session() {
        let outcome = classify_changes(&["output_name".into()], true);
        assert!(!outcome.applied_now);
        assert!(outcome.deferred);
    }

    #[tokio::test]
    async fn store_patch_and_removal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vibeshine.conf");

        let store = ConfigStore::load(&path).await.unwrap();
        let mut changes = BTreeMap::new();
        changes.insert("port".to_string(), Some("48010".to_string()));
        changes.insert("output_name".to_string(), Some("DISPLAY2".to_string()));
        store.patch(changes, false).await.unwrap();

        let store2 = ConfigStore::load(&path).await.unwrap();
        assert_eq!(store2.get().get("port"), Some("48010"));

        let mut removal = BTreeMap::new();
        removal.insert("output_name".to_string(), None);
        store2.patch(removal, false).await.unwrap();
        assert_eq!(store2.get().get("output_name"), None);
    }
}
