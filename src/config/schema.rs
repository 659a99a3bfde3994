use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Config keys that require a process restart when changed.
pub const RESTART_REQUIRED_KEYS: &[&str] = &["port", "address_family", "upnp", "pkey", "cert"];

/// Keys safe to hot-apply even while a streaming session is active.
pub fn is_hot_applicable(key: &str) -> bool {
    key.starts_with("playnite_")
}

/// Main application configuration.
///
/// The persisted form is the flat `key = value` file the whole Moonlight
/// ecosystem shares, so the canonical state is a string map with unknown
/// keys preserved verbatim. Typed accessors parse the sections the host
/// actually consumes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    raw: BTreeMap<String, String>,
}

impl AppConfig {
    pub fn from_map(raw: BTreeMap<String, String>) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &BTreeMap<String, String> {
        &self.raw
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.raw.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: String) {
        self.raw.insert(key.to_string(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.raw.remove(key)
    }

    fn str_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    fn bool_or(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(v) => matches!(v.trim(), "true" | "1" | "enabled" | "yes"),
            None => default,
        }
    }

    fn u32_or(&self, key: &str, default: u32) -> u32 {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn i64_or(&self, key: &str, default: i64) -> i64 {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn json_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .and_then(|v| serde_json::from_str::<Vec<String>>(v).ok())
            .unwrap_or_default()
    }

    /// Web / TLS settings.
    pub fn web(&self) -> WebConfig {
        let port = self.u32_or("port", 47989) as u16;
        WebConfig {
            address: self.str_or("address", "0.0.0.0"),
            port,
            // The config API listens one above the stream base port
            https_port: port + 1,
            cert_path: self.get("cert").map(str::to_string),
            pkey_path: self.get("pkey").map(str::to_string),
            origin_web_ui_allowed: match self.str_or("origin_web_ui_allowed", "lan").as_str() {
                "pc" => OriginScope::Pc,
                "wan" => OriginScope::Wan,
                _ => OriginScope::Lan,
            },
            username: self.str_or("username", ""),
            password_hash: self.str_or("password", ""),
            salt: self.str_or("salt", ""),
            session_token_ttl_secs: self.i64_or("session_token_ttl", 60 * 60 * 24),
            refresh_token_ttl_secs: self.i64_or("refresh_token_ttl", 60 * 60 * 24 * 30),
        }
    }

    /// Display-device (dd) settings.
    pub fn dd(&self) -> DdConfig {
        DdConfig {
            configuration_option: match self.str_or("dd_configuration_option", "verify_only")
                .as_str()
            {
                "disabled" => DevicePreparation::Disabled,
                "ensure_active" => DevicePreparation::EnsureActive,
                "ensure_primary" => DevicePreparation::EnsurePrimary,
                "ensure_only_display" => DevicePreparation::EnsureOnlyDisplay,
                _ => DevicePreparation::VerifyOnly,
            },
            resolution_option: match self.str_or("dd_resolution_option", "automatic").as_str() {
                "disabled" => ResolutionOption::Disabled,
                "manual" => ResolutionOption::Manual,
                _ => ResolutionOption::Automatic,
            },
            manual_resolution: self.str_or("dd_manual_resolution", ""),
            refresh_rate_option: match self.str_or("dd_refresh_rate_option", "automatic").as_str() {
                "disabled" => RefreshRateOption::Disabled,
                "manual" => RefreshRateOption::Manual,
                "prefer_highest" => RefreshRateOption::PreferHighest,
                _ => RefreshRateOption::Automatic,
            },
            manual_refresh_rate: self.str_or("dd_manual_refresh_rate", ""),
            hdr_option: match self.str_or("dd_hdr_option", "automatic").as_str() {
                "disabled" => HdrOption::Disabled,
                _ => HdrOption::Automatic,
            },
            config_revert_on_disconnect: self.bool_or("dd_config_revert_on_disconnect", false),
            mode_remapping: self
                .get("dd_mode_remapping")
                .and_then(|v| serde_json::from_str(v).ok())
                .unwrap_or_default(),
            dummy_plug_hdr10: self.bool_or("dummy_plug_hdr10", false),
            output_name: self.str_or("output_name", ""),
            virtual_display_mode: match self.str_or("virtual_display_mode", "disabled").as_str() {
                "per_client" => VirtualDisplayMode::PerClient,
                "shared" => VirtualDisplayMode::Shared,
                _ => VirtualDisplayMode::Disabled,
            },
            virtual_double_refresh: self.bool_or("virtual_double_refresh", false),
        }
    }

    /// App supervisor settings.
    pub fn proc(&self) -> ProcConfig {
        ProcConfig {
            apps_file: self.str_or("file_apps", "apps.json"),
            exit_timeout_secs: self.u32_or("exit_timeout", 10),
            global_prep_cmd: self
                .get("global_prep_cmd")
                .and_then(|v| serde_json::from_str(v).ok())
                .unwrap_or_default(),
        }
    }

    /// Playnite integration settings.
    pub fn playnite(&self) -> PlayniteConfig {
        PlayniteConfig {
            auto_sync: self.bool_or("playnite_auto_sync", false),
            recent_games: self.u32_or("playnite_recent_games", 10) as usize,
            recent_max_age_days: self.i64_or("playnite_recent_max_age_days", 0),
            sync_categories: self.json_list("playnite_sync_categories"),
            exclude_categories: self.json_list("playnite_exclude_categories"),
            exclude_games: self.json_list("playnite_exclude_games"),
            exclude_plugins: self.json_list("playnite_exclude_plugins"),
            autosync_delete_after_days: self.i64_or("playnite_autosync_delete_after_days", 0),
            fullscreen_entry_enabled: self.bool_or("playnite_fullscreen_entry_enabled", false),
            focus_attempts: self.u32_or("playnite_focus_attempts", 3),
            focus_timeout_secs: self.u32_or("playnite_focus_timeout_secs", 30),
            exit_timeout_secs: self.u32_or("playnite_exit_timeout_secs", 10),
        }
    }
}

/// Remote origin scopes allowed to reach the web UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginScope {
    /// Loopback only
    Pc,
    /// Loopback + private ranges
    Lan,
    /// Anyone
    Wan,
}

/// Web / TLS view of the config.
#[derive(Debug, Clone)]
pub struct WebConfig {
    pub address: String,
    pub port: u16,
    pub https_port: u16,
    pub cert_path: Option<String>,
    pub pkey_path: Option<String>,
    pub origin_web_ui_allowed: OriginScope,
    pub username: String,
    pub password_hash: String,
    pub salt: String,
    pub session_token_ttl_secs: i64,
    pub refresh_token_ttl_secs: i64,
}

impl WebConfig {
    /// Credentials are unset on first run; every request passes auth then.
    pub fn credentials_configured(&self) -> bool {
        !self.username.is_empty()
    }
}

/// How far display preparation may go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DevicePreparation {
    Disabled,
    #[default]
    VerifyOnly,
    EnsureActive,
    EnsurePrimary,
    EnsureOnlyDisplay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionOption {
    Disabled,
    Automatic,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshRateOption {
    Disabled,
    Automatic,
    Manual,
    PreferHighest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HdrOption {
    Disabled,
    Automatic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualDisplayMode {
    Disabled,
    PerClient,
    Shared,
}

/// One entry of the `dd_mode_remapping` table. Null requested fields are
/// wildcards; at least one final field must be present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModeRemapEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_fps: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_refresh_rate: Option<String>,
}

/// Display-device view of the config.
#[derive(Debug, Clone)]
pub struct DdConfig {
    pub configuration_option: DevicePreparation,
    pub resolution_option: ResolutionOption,
    pub manual_resolution: String,
    pub refresh_rate_option: RefreshRateOption,
    pub manual_refresh_rate: String,
    pub hdr_option: HdrOption,
    pub config_revert_on_disconnect: bool,
    pub mode_remapping: Vec<ModeRemapEntry>,
    pub dummy_plug_hdr10: bool,
    pub output_name: String,
    pub virtual_display_mode: VirtualDisplayMode,
    pub virtual_double_refresh: bool,
}

/// One global prep command from `global_prep_cmd`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalPrepCmd {
    #[serde(default)]
    pub r#do: String,
    #[serde(default)]
    pub undo: String,
    #[serde(default)]
    pub elevated: bool,
}

/// Supervisor view of the config.
#[derive(Debug, Clone)]
pub struct ProcConfig {
    pub apps_file: String,
    pub exit_timeout_secs: u32,
    pub global_prep_cmd: Vec<GlobalPrepCmd>,
}

/// Playnite view of the config.
#[derive(Debug, Clone)]
pub struct PlayniteConfig {
    pub auto_sync: bool,
    pub recent_games: usize,
    pub recent_max_age_days: i64,
    pub sync_categories: Vec<String>,
    pub exclude_categories: Vec<String>,
    pub exclude_games: Vec<String>,
    pub exclude_plugins: Vec<String>,
    pub autosync_delete_after_days: i64,
    pub fullscreen_entry_enabled: bool,
    pub focus_attempts: u32,
    pub focus_timeout_secs: u32,
    pub exit_timeout_secs: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pairs: &[(&str, &str)]) -> AppConfig {
        AppConfig::from_map(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn https_port_follows_base_port() {
        let cfg = config(&[("port", "48010")]);
        assert_eq!(cfg.web().port, 48010);
        assert_eq!(cfg.web().https_port, 48011);
    }

    #[test]
    fn dd_defaults_and_enums() {
        let cfg = config(&[
            ("dd_configuration_option", "ensure_active"),
            ("dd_refresh_rate_option", "prefer_highest"),
        ]);
        let dd = cfg.dd();
        assert_eq!(dd.configuration_option, DevicePreparation::EnsureActive);
        assert_eq!(dd.refresh_rate_option, RefreshRateOption::PreferHighest);
        assert_eq!(dd.resolution_option, ResolutionOption::Automatic);
        assert_eq!(dd.virtual_display_mode, VirtualDisplayMode::Disabled);
    }

    #[test]
    fn playnite_json_lists() {
        let cfg = config(&[
            ("playnite_sync_categories", r#"["Action","Indie"]"#),
            ("playnite_recent_games", "5"),
        ]);
        let p = cfg.playnite();
        assert_eq!(p.sync_categories, vec!["Action", "Indie"]);
        assert_eq!(p.recent_games, 5);
    }

    #[test]
    fn hot_apply_covers_playnite_prefix_only() {
        assert!(is_hot_applicable("playnite_auto_sync"));
        assert!(!is_hot_applicable("port"));
        assert!(!is_hot_applicable("output_name"));
    }
}
