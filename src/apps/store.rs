use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::types::AppDef;
use crate::error::{AppError, Result};
use crate::utils::atomic_replace;

/// The persisted apps.json shape: a shared launch environment plus the app
/// list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppsFile {
    pub env: BTreeMap<String, String>,
    pub apps: Vec<AppDef>,
}

/// Compute the short app id: CRC32 over name + image key, clamped to a
/// non-negative i32. `index` disambiguates CRC collisions within one file.
pub fn calculate_app_id(name: &str, image_key: &str, index: Option<i32>) -> i32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(name.as_bytes());
    hasher.update(image_key.as_bytes());
    if let Some(index) = index {
        hasher.update(index.to_string().as_bytes());
    }
    let raw = hasher.finalize() as i32;
    raw.checked_abs().unwrap_or(i32::MAX)
}

/// Image identity used for id computation: the SHA-256 of the file when it
/// is readable, otherwise the path string itself.
pub fn image_digest_or_path(image_path: &str) -> String {
    if image_path.is_empty() {
        return String::new();
    }
    match std::fs::read(image_path) {
        Ok(bytes) => {
            let digest = Sha256::digest(&bytes);
            digest.iter().map(|b| format!("{:02x}", b)).collect()
        }
        Err(_) => image_path.to_string(),
    }
}

/// Reorder `apps` to follow `order` (a uuid list). Unknown uuids in `order`
/// are dropped; apps not named keep their relative order and go last.
pub fn reorder_apps(apps: &mut Vec<AppDef>, order: &[String]) {
    let mut picked = Vec::with_capacity(apps.len());
    for uuid in order {
        if let Some(pos) = apps.iter().position(|a| &a.uuid == uuid) {
            picked.push(apps.remove(pos));
        }
    }
    picked.append(apps);
    *apps = picked;
}

/// Case-insensitive sort used only by the client-apps cache refresh.
pub fn sort_apps_by_name(apps: &mut [AppDef]) {
    apps.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
}

/// Migrate legacy JSON keys in place. Returns whether anything changed.
pub fn migrate_legacy_keys(app: &mut serde_json::Value) -> bool {
    let Some(obj) = app.as_object_mut() else {
        return false;
    };
    // Renamed when gen2 capture fixes landed
    if let Some(value) = obj.remove("dlss-framegen-capture-fix") {
        obj.entry("gen1-framegen-fix").or_insert(value);
        return true;
    }
    false
}

/// Persisted app store. All mutation goes through here so ids stay
/// consistent and the file is rewritten atomically.
#[derive(Clone)]
pub struct AppsStore {
    path: PathBuf,
    file: Arc<RwLock<AppsFile>>,
}

impl AppsStore {
    /// Load apps.json, normalizing legacy fields. Normalization (missing
    /// uuids, migrated keys) is persisted immediately so later readers see
    /// the canonical form.
    pub async fn load(path: &Path) -> Result<Self> {
        let (file, changed) = match tokio::fs::read_to_string(path).await {
            Ok(text) => Self::parse(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut file = AppsFile::default();
                file.apps.push(AppDef {
                    name: "Desktop".to_string(),
                    ..Default::default()
                });
                (file, true)
            }
            Err(e) => return Err(e.into()),
        };

        let store = Self {
            path: path.to_path_buf(),
            file: Arc::new(RwLock::new(file)),
        };
        if changed {
            let snapshot = store.file.read().await.clone();
            store.persist(&snapshot).await?;
        }
        Ok(store)
    }

    fn parse(text: &str) -> Result<(AppsFile, bool)> {
        let mut value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| AppError::Parse(format!("apps.json: {e}")))?;

        let mut changed = false;
        if let Some(apps) = value.get_mut("apps").and_then(|a| a.as_array_mut()) {
            for app in apps.iter_mut() {
                changed |= migrate_legacy_keys(app);
            }
        }

        let mut file: AppsFile = serde_json::from_value(value)
            .map_err(|e| AppError::Parse(format!("apps.json: {e}")))?;

        for app in &mut file.apps {
            if app.uuid.is_empty() {
                app.uuid = Uuid::new_v4().to_string();
                changed = true;
            }
        }
        assign_ids(&mut file.apps);
        Ok((file, changed))
    }

    /// Reload from disk, e.g. after the Playnite reconciler rewrote the
    /// file behind us.
    pub async fn refresh(&self) -> Result<()> {
        let text = tokio::fs::read_to_string(&self.path).await?;
        let (file, _) = Self::parse(&text)?;
        *self.file.write().await = file;
        Ok(())
    }

    pub async fn snapshot(&self) -> AppsFile {
        self.file.read().await.clone()
    }

    pub async fn find_by_uuid(&self, uuid: &str) -> Option<AppDef> {
        self.file
            .read()
            .await
            .apps
            .iter()
            .find(|a| a.uuid == uuid)
            .cloned()
    }

    pub async fn find_by_id(&self, id: i32) -> Option<AppDef> {
        self.file
            .read()
            .await
            .apps
            .iter()
            .find(|a| a.id == id)
            .cloned()
    }

    /// Replace by uuid, or append when the uuid is new/empty. Returns the
    /// stored app with its uuid and id settled.
    pub async fn upsert(&self, mut app: AppDef) -> Result<AppDef> {
        if app.uuid.is_empty() {
            app.uuid = Uuid::new_v4().to_string();
        }

        let snapshot = {
            let mut file = self.file.write().await;
            match file.apps.iter_mut().find(|a| a.uuid == app.uuid) {
                Some(slot) => *slot = app.clone(),
                None => file.apps.push(app.clone()),
            }
            assign_ids(&mut file.apps);
            file.clone()
        };
        self.persist(&snapshot).await?;
        Ok(snapshot
            .apps
            .iter()
            .find(|a| a.uuid == app.uuid)
            .cloned()
            .unwrap())
    }

    /// Apply a uuid ordering (`POST /api/apps/reorder`).
    pub async fn reorder(&self, order: &[String]) -> Result<()> {
        let snapshot = {
            let mut file = self.file.write().await;
            reorder_apps(&mut file.apps, order);
            file.clone()
        };
        self.persist(&snapshot).await
    }

    pub async fn remove_by_uuid(&self, uuid: &str) -> Result<Option<AppDef>> {
        let (snapshot, removed) = {
            let mut file = self.file.write().await;
            let removed = file
                .apps
                .iter()
                .position(|a| a.uuid == uuid)
                .map(|pos| file.apps.remove(pos));
            assign_ids(&mut file.apps);
            (file.clone(), removed)
        };
        if removed.is_some() {
            self.persist(&snapshot).await?;
        }
        Ok(removed)
    }

    pub async fn remove_by_index(&self, index: usize) -> Result<Option<AppDef>> {
        let (snapshot, removed) = {
            let mut file = self.file.write().await;
            if index >= file.apps.len() {
                return Ok(None);
            }
            let removed = file.apps.remove(index);
            assign_ids(&mut file.apps);
            (file.clone(), Some(removed))
        };
        self.persist(&snapshot).await?;
        Ok(removed)
    }

    /// Drop every auto-synced entry in one pass.
    pub async fn purge_autosync(&self) -> Result<usize> {
        let (snapshot, removed) = {
            let mut file = self.file.write().await;
            let before = file.apps.len();
            file.apps.retain(|a| a.playnite_managed != "auto");
            assign_ids(&mut file.apps);
            (file.clone(), before - file.apps.len())
        };
        if removed > 0 {
            self.persist(&snapshot).await?;
        }
        Ok(removed)
    }

    /// Replace the whole file (Playnite reconcile path).
    pub async fn replace(&self, mut file: AppsFile) -> Result<()> {
        assign_ids(&mut file.apps);
        *self.file.write().await = file.clone();
        self.persist(&file).await
    }

    async fn persist(&self, file: &AppsFile) -> Result<()> {
        let json = serde_json::to_vec_pretty(file)?;
        atomic_replace(&self.path, &json).await?;
        Ok(())
    }
}

fn assign_ids(apps: &mut [AppDef]) {
    let mut seen = HashSet::new();
    for i in 0..apps.len() {
        let image_key = image_digest_or_path(&apps[i].image_path);
        let mut id = calculate_app_id(&apps[i].name, &image_key, None);
        if !seen.insert(id) {
            id = calculate_app_id(&apps[i].name, &image_key, Some(i as i32));
            seen.insert(id);
        }
        apps[i].id = id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn named(uuid: &str) -> AppDef {
        AppDef {
            uuid: uuid.to_string(),
            name: uuid.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn app_id_is_deterministic_and_index_sensitive() {
        let a = calculate_app_id("Game", "imgkey", None);
        let b = calculate_app_id("Game", "imgkey", None);
        assert_eq!(a, b);
        assert!(a >= 0);

        let with_index = calculate_app_id("Game", "imgkey", Some(1));
        assert_ne!(a, with_index);

        let other = calculate_app_id("Other Game", "imgkey", None);
        assert_ne!(a, other);
    }

    #[test]
    fn duplicate_entries_get_distinct_ids() {
        let mut apps = vec![named("A"), named("A")];
        apps[1].uuid = "B".to_string();
        apps[1].name = "A".to_string();
        assign_ids(&mut apps);
        assert_ne!(apps[0].id, apps[1].id);
    }

    #[test]
    fn reorder_matches_spec_scenario() {
        // apps = [A, B, C]; order = [C, A] -> [C, A, B]
        let mut apps = vec![named("A"), named("B"), named("C")];
        reorder_apps(&mut apps, &["C".to_string(), "A".to_string()]);
        let uuids: Vec<_> = apps.iter().map(|a| a.uuid.as_str()).collect();
        assert_eq!(uuids, ["C", "A", "B"]);
    }

    #[test]
    fn reorder_is_idempotent_and_drops_unknown_uuids() {
        let mut apps = vec![named("A"), named("B"), named("C")];
        let order = vec!["C".to_string(), "ghost".to_string(), "A".to_string()];
        reorder_apps(&mut apps, &order);
        let once: Vec<_> = apps.iter().map(|a| a.uuid.clone()).collect();
        reorder_apps(&mut apps, &order);
        let twice: Vec<_> = apps.iter().map(|a| a.uuid.clone()).collect();
        assert_eq!(once, twice);
        assert_eq!(once, ["C", "A", "B"]);
    }

    #[test]
    fn legacy_framegen_key_migrates() {
        let mut value = serde_json::json!({"name": "G", "dlss-framegen-capture-fix": true});
        assert!(migrate_legacy_keys(&mut value));
        assert_eq!(value["gen1-framegen-fix"], serde_json::json!(true));
        assert!(value.get("dlss-framegen-capture-fix").is_none());
    }

    #[tokio::test]
    async fn load_assigns_uuids_and_persists_normalization() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("apps.json");
        tokio::fs::write(
            &path,
            r#"{"env":{},"apps":[{"name":"Game","elevated":"true"}]}"#,
        )
        .await
        .unwrap();

        let store = AppsStore::load(&path).await.unwrap();
        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.apps.len(), 1);
        assert!(!snapshot.apps[0].uuid.is_empty());
        assert!(snapshot.apps[0].elevated);

        // Normalization was written back
        let text = tokio::fs::read_to_string(&path).await.unwrap();
        let reparsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert!(reparsed["apps"][0]["uuid"].as_str().unwrap().len() > 0);
    }

    #[tokio::test]
    async fn missing_file_seeds_desktop_entry() {
        let dir = tempdir().unwrap();
        let store = AppsStore::load(&dir.path().join("apps.json"))
            .await
            .unwrap();
        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.apps.len(), 1);
        assert_eq!(snapshot.apps[0].name, "Desktop");
        assert!(snapshot.apps[0].is_placebo());
    }

    #[tokio::test]
    async fn upsert_replaces_by_uuid() {
        let dir = tempdir().unwrap();
        let store = AppsStore::load(&dir.path().join("apps.json"))
            .await
            .unwrap();

        let stored = store.upsert(named("X")).await.unwrap();
        let mut edited = stored.clone();
        edited.cmd = "game.exe".to_string();
        store.upsert(edited).await.unwrap();

        let snapshot = store.snapshot().await;
        // Desktop seed + one app, not two
        assert_eq!(snapshot.apps.len(), 2);
        assert_eq!(store.find_by_uuid("X").await.unwrap().cmd, "game.exe");
    }

    #[tokio::test]
    async fn purge_autosync_removes_only_managed() {
        let dir = tempdir().unwrap();
        let store = AppsStore::load(&dir.path().join("apps.json"))
            .await
            .unwrap();
        let mut managed = named("M");
        managed.playnite_managed = "auto".to_string();
        store.upsert(managed).await.unwrap();
        store.upsert(named("user")).await.unwrap();

        let removed = store.purge_autosync().await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.find_by_uuid("M").await.is_none());
        assert!(store.find_by_uuid("user").await.is_some());
    }
}
