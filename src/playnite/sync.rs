//! Library auto-sync: reconcile the Playnite snapshot into apps.json.
//!
//! Selection is recent-N plus configured categories, minus exclusions;
//! matching against existing apps prefers playnite id, then launch command,
//! then working directory. Entries this reconciler creates are stamped
//! `playnite-managed = auto` and pruned when they fall out of selection.

use chrono::{DateTime, Utc};

use super::protocol::PlayniteGame;
use crate::apps::{AppDef, AppsFile, AppsStore};
use crate::config::PlayniteConfig;
use crate::error::Result;

/// Selection-source bitfield rendered into `playnite-source`.
const SOURCE_RECENT: u8 = 1;
const SOURCE_CATEGORY: u8 = 2;

fn source_name(bits: u8) -> &'static str {
    match bits {
        0 => "unknown",
        SOURCE_RECENT => "recent",
        SOURCE_CATEGORY => "category",
        _ => "recent+category",
    }
}

/// Parse the plugin's ISO-8601 stamps, tolerating fractional seconds.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// What one reconcile pass did.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub changed: bool,
    pub added: usize,
    pub removed: usize,
    pub updated: usize,
}

/// Select the "recent" game ids per config.
fn select_recent(cfg: &PlayniteConfig, games: &[PlayniteGame], now: DateTime<Utc>) -> Vec<String> {
    let mut dated: Vec<(&PlayniteGame, DateTime<Utc>)> = games
        .iter()
        .filter(|g| g.installed)
        .filter_map(|g| parse_timestamp(&g.last_played).map(|ts| (g, ts)))
        .collect();

    if cfg.recent_max_age_days > 0 {
        let cutoff = now - chrono::Duration::days(cfg.recent_max_age_days);
        dated.retain(|(_, ts)| *ts >= cutoff);
    }

    dated.sort_by(|a, b| b.1.cmp(&a.1));
    dated
        .into_iter()
        .take(cfg.recent_games)
        .map(|(g, _)| g.id.clone())
        .collect()
}

/// Select game ids by the configured include categories.
fn select_categories(cfg: &PlayniteConfig, games: &[PlayniteGame]) -> Vec<String> {
    if cfg.sync_categories.is_empty() {
        return Vec::new();
    }
    let wanted: Vec<String> = cfg
        .sync_categories
        .iter()
        .map(|c| c.to_lowercase())
        .collect();

    games
        .iter()
        .filter(|g| g.installed)
        .filter(|g| {
            g.categories
                .iter()
                .any(|c| wanted.contains(&c.to_lowercase()))
        })
        .map(|g| g.id.clone())
        .collect()
}

fn excluded(cfg: &PlayniteConfig, game: &PlayniteGame) -> bool {
    let id = game.id.to_lowercase();
    let name = game.name.to_lowercase();
    if cfg
        .exclude_games
        .iter()
        .any(|e| e.to_lowercase() == id || e.to_lowercase() == name)
    {
        return true;
    }
    if game
        .categories
        .iter()
        .any(|c| cfg.exclude_categories.iter().any(|e| e.eq_ignore_ascii_case(c)))
    {
        return true;
    }
    if cfg
        .exclude_plugins
        .iter()
        .any(|e| e.to_lowercase() == game.plugin_id.to_lowercase())
    {
        return true;
    }
    false
}

fn normalize_path(path: &str) -> String {
    let lowered = if cfg!(windows) {
        path.to_lowercase()
    } else {
        path.to_string()
    };
    lowered.replace('\\', "/")
}

/// Find the index of the app matching a game: id first, then command path,
/// then working directory.
fn match_app(apps: &[AppDef], game: &PlayniteGame) -> Option<usize> {
    if let Some(i) = apps.iter().position(|a| a.playnite_id == game.id) {
        return Some(i);
    }
    if !game.exe.is_empty() {
        let exe = normalize_path(&game.exe);
        if let Some(i) = apps
            .iter()
            .position(|a| !a.cmd.is_empty() && normalize_path(&a.cmd).contains(&exe))
        {
            return Some(i);
        }
    }
    if !game.working_dir.is_empty() {
        let dir = normalize_path(&game.working_dir);
        if let Some(i) = apps
            .iter()
            .position(|a| !a.working_dir.is_empty() && normalize_path(&a.working_dir) == dir)
        {
            return Some(i);
        }
    }
    None
}

/// One reconcile pass over the full snapshot. Pure; the caller persists the
/// file when `changed` is set.
pub fn autosync_reconcile(
    cfg: &PlayniteConfig,
    games: &[PlayniteGame],
    file: &mut AppsFile,
    now: DateTime<Utc>,
) -> ReconcileOutcome {
    let mut outcome = ReconcileOutcome::default();

    // Selection with the source bitfield
    let mut selected: std::collections::BTreeMap<String, u8> = std::collections::BTreeMap::new();
    for id in select_recent(cfg, games, now) {
        *selected.entry(id).or_insert(0) |= SOURCE_RECENT;
    }
    for id in select_categories(cfg, games) {
        *selected.entry(id).or_insert(0) |= SOURCE_CATEGORY;
    }
    selected.retain(|id, _| {
        games
            .iter()
            .find(|g| &g.id == id)
            .map(|g| !excluded(cfg, g))
            .unwrap_or(false)
    });

    // Update matched apps, collect what is missing
    for (id, bits) in &selected {
        let game = games.iter().find(|g| &g.id == id).unwrap();
        match match_app(&file.apps, game) {
            Some(i) => {
                let app = &mut file.apps[i];
                let source = source_name(*bits).to_string();
                if app.playnite_managed != "auto"
                    || app.playnite_source != source
                    || app.playnite_id.is_empty()
                {
                    app.playnite_managed = "auto".to_string();
                    app.playnite_source = source;
                    if app.playnite_id.is_empty() {
                        app.playnite_id = game.id.clone();
                    }
                    outcome.updated += 1;
                    outcome.changed = true;
                }
            }
            None => {
                file.apps.push(AppDef {
                    name: game.name.clone(),
                    image_path: game.box_art_path.clone(),
                    playnite_id: game.id.clone(),
                    playnite_managed: "auto".to_string(),
                    playnite_source: source_name(*bits).to_string(),
                    playnite_added_at: now.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
                    ..Default::default()
                });
                outcome.added += 1;
                outcome.changed = true;
            }
        }
    }

    // Prune stale auto-managed entries
    let before = file.apps.len();
    file.apps.retain(|app| {
        if app.playnite_managed != "auto" || app.playnite_id.is_empty() {
            return true;
        }
        if selected.contains_key(&app.playnite_id) {
            return true;
        }

        let in_snapshot = games.iter().any(|g| g.id == app.playnite_id);
        if !in_snapshot {
            return false;
        }

        // TTL pruning, disabled at <= 0 and when the game was played after
        // the entry was added
        if cfg.autosync_delete_after_days <= 0 {
            return true;
        }
        let Some(added_at) = parse_timestamp(&app.playnite_added_at) else {
            return true;
        };
        let played_since = games
            .iter()
            .find(|g| g.id == app.playnite_id)
            .and_then(|g| parse_timestamp(&g.last_played))
            .map(|ts| ts > added_at)
            .unwrap_or(false);
        if played_since {
            return true;
        }
        now - added_at <= chrono::Duration::days(cfg.autosync_delete_after_days)
    });
    outcome.removed = before - file.apps.len();
    outcome.changed |= outcome.removed > 0;

    outcome
}

/// Run a reconcile against the store, writing apps.json once when anything
/// changed and reloading the supervisor's view.
pub async fn run_autosync(
    cfg: &PlayniteConfig,
    games: &[PlayniteGame],
    store: &AppsStore,
) -> Result<ReconcileOutcome> {
    let mut file = store.snapshot().await;
    let outcome = autosync_reconcile(cfg, games, &mut file, Utc::now());
    if outcome.changed {
        store.replace(file).await?;
        tracing::info!(
            added = outcome.added,
            removed = outcome.removed,
            updated = outcome.updated,
            "Playnite auto-sync reconciled apps.json"
        );
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::AppConfig;
    use std::collections::BTreeMap;

    fn cfg(pairs: &[(&str, &str)]) -> PlayniteConfig {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_map(map).playnite()
    }

    fn game(id: &str, name: &str, last_played: &str) -> PlayniteGame {
        PlayniteGame {
            id: id.to_string(),
            name: name.to_string(),
            last_played: last_played.to_string(),
            installed: true,
            ..Default::default()
        }
    }

    fn now() -> DateTime<Utc> {
        parse_timestamp("2025-08-01T12:00:00Z").unwrap()
    }

    #[test]
    fn timestamp_parsing_tolerates_fractional_seconds() {
        assert!(parse_timestamp("2025-07-01T10:00:00Z").is_some());
        assert!(parse_timestamp("2025-07-01T10:00:00.1234567Z").is_some());
        assert!(parse_timestamp("yesterday").is_none());
        assert!(parse_timestamp("").is_none());
    }

    #[test]
    fn recent_selection_respects_count_and_age() {
        let games = vec![
            game("old", "Old", "2024-01-01T00:00:00Z"),
            game("mid", "Mid", "2025-07-20T00:00:00Z"),
            game("new", "New", "2025-07-30T00:00:00Z"),
            game("undated", "Undated", ""),
        ];

        let selected = select_recent(&cfg(&[("playnite_recent_games", "2")]), &games, now());
        assert_eq!(selected, vec!["new", "mid"]);

        // Age filter drops the old entry even within the count
        let selected = select_recent(
            &cfg(&[
                ("playnite_recent_games", "10"),
                ("playnite_recent_max_age_days", "30"),
            ]),
            &games,
            now(),
        );
        assert_eq!(selected, vec!["new", "mid"]);
    }

    #[test]
    fn matching_prefers_id_then_cmd_then_dir() {
        let mut g = game("g1", "Game", "2025-07-30T00:00:00Z");
        g.exe = "C:\\Games\\g1\\game.exe".to_string();
        g.working_dir = "C:\\Games\\g1".to_string();

        let by_id = AppDef {
            playnite_id: "g1".to_string(),
            ..Default::default()
        };
        let by_cmd = AppDef {
            cmd: "\"C:\\Games\\g1\\game.exe\" -fullscreen".to_string(),
            ..Default::default()
        };
        let by_dir = AppDef {
            working_dir: "C:\\Games\\g1".to_string(),
            ..Default::default()
        };

        assert_eq!(
            match_app(&[by_dir.clone(), by_cmd.clone(), by_id.clone()], &g),
            Some(2)
        );
        assert_eq!(match_app(&[by_dir.clone(), by_cmd.clone()], &g), Some(1));
        assert_eq!(match_app(&[by_dir.clone()], &g), Some(0));
        assert_eq!(match_app(&[], &g), None);
    }

    #[test]
    fn new_selection_adds_auto_managed_entries() {
        let games = vec![game("g1", "Fresh Game", "2025-07-30T00:00:00Z")];
        let mut file = AppsFile::default();

        let outcome = autosync_reconcile(
            &cfg(&[("playnite_recent_games", "5")]),
            &games,
            &mut file,
            now(),
        );
        assert!(outcome.changed);
        assert_eq!(outcome.added, 1);

        let app = &file.apps[0];
        assert_eq!(app.playnite_managed, "auto");
        assert_eq!(app.playnite_source, "recent");
        assert_eq!(app.playnite_added_at, "2025-08-01T12:00:00Z");
    }

    #[test]
    fn recent_and_category_combine_in_the_source_field() {
        let mut g = game("g1", "Game", "2025-07-30T00:00:00Z");
        g.categories = vec!["Action".to_string()];
        let mut file = AppsFile::default();

        autosync_reconcile(
            &cfg(&[
                ("playnite_recent_games", "5"),
                ("playnite_sync_categories", r#"["action"]"#),
            ]),
            &[g],
            &mut file,
            now(),
        );
        assert_eq!(file.apps[0].playnite_source, "recent+category");
    }

    #[test]
    fn exclusions_remove_from_selection() {
        let mut g1 = game("g1", "Wanted", "2025-07-30T00:00:00Z");
        g1.plugin_id = "steam".to_string();
        let mut g2 = game("g2", "Unwanted", "2025-07-29T00:00:00Z");
        g2.plugin_id = "EPIC".to_string();

        let mut file = AppsFile::default();
        autosync_reconcile(
            &cfg(&[
                ("playnite_recent_games", "5"),
                ("playnite_exclude_plugins", r#"["epic"]"#),
            ]),
            &[g1, g2],
            &mut file,
            now(),
        );
        assert_eq!(file.apps.len(), 1);
        assert_eq!(file.apps[0].name, "Wanted");
    }

    #[test]
    fn missing_from_snapshot_is_pruned_user_entries_kept() {
        let mut file = AppsFile::default();
        file.apps.push(AppDef {
            name: "Gone".to_string(),
            playnite_id: "gone".to_string(),
            playnite_managed: "auto".to_string(),
            ..Default::default()
        });
        file.apps.push(AppDef {
            name: "Manual".to_string(),
            cmd: "game.exe".to_string(),
            ..Default::default()
        });

        let outcome = autosync_reconcile(&cfg(&[]), &[], &mut file, now());
        assert_eq!(outcome.removed, 1);
        assert_eq!(file.apps.len(), 1);
        assert_eq!(file.apps[0].name, "Manual");
    }

    #[test]
    fn ttl_prune_rules() {
        let stale_cfg = cfg(&[
            ("playnite_recent_games", "0"),
            ("playnite_autosync_delete_after_days", "7"),
        ]);

        // Unselected but still in the snapshot, added long ago, not played
        // since: pruned
        let mut file = AppsFile::default();
        file.apps.push(AppDef {
            playnite_id: "g1".to_string(),
            playnite_managed: "auto".to_string(),
            playnite_added_at: "2025-07-01T00:00:00Z".to_string(),
            ..Default::default()
        });
        let snapshot = vec![game("g1", "G", "2025-06-01T00:00:00Z")];
        let outcome = autosync_reconcile(&stale_cfg, &snapshot, &mut file, now());
        assert_eq!(outcome.removed, 1);

        // Played after it was added: kept
        let mut file = AppsFile::default();
        file.apps.push(AppDef {
            playnite_id: "g1".to_string(),
            playnite_managed: "auto".to_string(),
            playnite_added_at: "2025-07-01T00:00:00Z".to_string(),
            ..Default::default()
        });
        let snapshot = vec![game("g1", "G", "2025-07-15T00:00:00Z")];
        let outcome = autosync_reconcile(&stale_cfg, &snapshot, &mut file, now());
        assert_eq!(outcome.removed, 0);

        // TTL disabled: kept
        let mut file = AppsFile::default();
        file.apps.push(AppDef {
            playnite_id: "g1".to_string(),
            playnite_managed: "auto".to_string(),
            playnite_added_at: "2025-07-01T00:00:00Z".to_string(),
            ..Default::default()
        });
        let snapshot = vec![game("g1", "G", "2025-06-01T00:00:00Z")];
        let outcome = autosync_reconcile(
            &cfg(&[("playnite_recent_games", "0")]),
            &snapshot,
            &mut file,
            now(),
        );
        assert_eq!(outcome.removed, 0);
    }
}
