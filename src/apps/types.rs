use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

/// Fallback cover art served when an app image is unusable.
pub const DEFAULT_APP_IMAGE_PATH: &str = "./assets/box.png";

/// Pre-rework builds shipped this relative Steam cover; keep resolving it.
const LEGACY_STEAM_IMAGE_PATH: &str = "./assets/steam.png";

/// Accept booleans that older apps.json files stored as strings or numbers.
fn legacy_bool<'de, D: Deserializer<'de>>(de: D) -> Result<bool, D::Error> {
    let value = serde_json::Value::deserialize(de)?;
    Ok(match value {
        serde_json::Value::Bool(b) => b,
        serde_json::Value::String(s) => {
            matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "enabled")
        }
        serde_json::Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    })
}

/// Accept integers that older apps.json files stored as strings.
fn legacy_opt_u32<'de, D: Deserializer<'de>>(de: D) -> Result<Option<u32>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(de)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_u64().map(|v| v as u32),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// One prep command hook; `undo` runs in reverse order on teardown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PrepCmd {
    pub r#do: String,
    pub undo: String,
    #[serde(deserialize_with = "legacy_bool")]
    pub elevated: bool,
}

/// Frame-generation backend an app opts into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameGenProvider {
    #[default]
    #[serde(rename = "lossless-scaling")]
    LosslessScaling,
    #[serde(rename = "nvidia-smooth-motion")]
    NvidiaSmoothMotion,
}

/// Which Lossless Scaling override bundle applies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LosslessProfile {
    #[default]
    Recommended,
    Custom,
}

/// Lossless Scaling upscaler selection. Stored lowercase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalingType {
    #[default]
    Off,
    Ls1,
    Fsr,
    Nis,
    Sgsr,
    Bcas,
    Anime4k,
    Xbr,
    #[serde(rename = "sharp-bilinear")]
    SharpBilinear,
    Integer,
    Nearest,
}

/// One Lossless Scaling override bundle (`recommended` or `custom`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LosslessOverrides {
    #[serde(deserialize_with = "legacy_bool")]
    pub performance_mode: bool,
    /// 0..=100
    #[serde(deserialize_with = "legacy_opt_u32")]
    pub flow_scale: Option<u32>,
    /// 10..=100
    #[serde(deserialize_with = "legacy_opt_u32")]
    pub resolution_scale: Option<u32>,
    pub scaling_type: ScalingType,
    /// 1..=10
    #[serde(deserialize_with = "legacy_opt_u32")]
    pub sharpening: Option<u32>,
    /// S, M, L, VL
    pub anime4k_size: String,
    #[serde(deserialize_with = "legacy_bool")]
    pub anime4k_vrs: bool,
}

/// Immutable description of one launchable app as persisted in apps.json.
///
/// `uuid` is the stable identity; `id` is derived at parse time and never
/// persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AppDef {
    pub uuid: String,
    pub name: String,
    pub image_path: String,

    pub cmd: String,
    pub working_dir: String,
    pub detached: Vec<String>,
    /// Child stdout/stderr redirect target
    pub output: String,
    #[serde(deserialize_with = "legacy_bool")]
    pub elevated: bool,
    #[serde(deserialize_with = "legacy_bool")]
    pub auto_detach: bool,
    #[serde(deserialize_with = "legacy_bool")]
    pub wait_all: bool,
    #[serde(deserialize_with = "legacy_opt_u32")]
    pub exit_timeout: Option<u32>,

    pub prep_cmd: Vec<PrepCmd>,
    #[serde(deserialize_with = "legacy_bool")]
    pub exclude_global_prep_cmd: bool,

    #[serde(deserialize_with = "legacy_bool")]
    pub virtual_screen: bool,
    #[serde(deserialize_with = "legacy_bool")]
    pub gen1_framegen_fix: bool,
    #[serde(deserialize_with = "legacy_bool")]
    pub gen2_framegen_fix: bool,
    #[serde(deserialize_with = "legacy_bool")]
    pub frame_gen_limiter_fix: bool,

    #[serde(deserialize_with = "legacy_bool")]
    pub lossless_scaling_framegen: bool,
    pub frame_generation_provider: FrameGenProvider,
    #[serde(deserialize_with = "legacy_opt_u32")]
    pub lossless_scaling_target_fps: Option<u32>,
    #[serde(deserialize_with = "legacy_bool")]
    pub lossless_scaling_rtss_limit: bool,
    pub lossless_scaling_profile: LosslessProfile,
    pub lossless_scaling_recommended: LosslessOverrides,
    pub lossless_scaling_custom: LosslessOverrides,

    pub playnite_id: String,
    #[serde(deserialize_with = "legacy_bool")]
    pub playnite_fullscreen: bool,
    /// "auto" when the Playnite reconciler owns this entry
    pub playnite_managed: String,
    /// Bitfield rendered as {unknown, recent, category, recent+category}
    pub playnite_source: String,
    /// ISO-8601 UTC stamp set when auto-sync added the entry
    pub playnite_added_at: String,

    /// Derived at parse time, not persisted
    #[serde(skip)]
    pub id: i32,
}

impl AppDef {
    /// A Playnite-backed app has a library id but no launch command; the
    /// launcher helper's lifetime is the app lifetime.
    pub fn is_playnite_backed(&self) -> bool {
        !self.playnite_id.is_empty() && self.cmd.is_empty()
    }

    /// Desktop session: nothing to spawn, the stream itself is the app.
    pub fn is_placebo(&self) -> bool {
        self.cmd.is_empty() && self.playnite_id.is_empty() && !self.playnite_fullscreen
    }

    pub fn effective_exit_timeout(&self, default_secs: u32) -> u32 {
        self.exit_timeout.unwrap_or(default_secs)
    }
}

/// Resolve an app image to something servable: only existing `.png` files
/// pass through, everything else falls back to the default box art.
pub fn validate_app_image_path(image_path: &str) -> String {
    if image_path.is_empty() {
        return DEFAULT_APP_IMAGE_PATH.to_string();
    }
    if image_path == LEGACY_STEAM_IMAGE_PATH {
        return DEFAULT_APP_IMAGE_PATH.to_string();
    }

    let path = Path::new(image_path);
    let is_png = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("png"))
        .unwrap_or(false);
    if !is_png || !path.is_file() {
        return DEFAULT_APP_IMAGE_PATH.to_string();
    }

    image_path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_string_booleans_and_integers_parse() {
        let json = r#"{
            "name": "Game",
            "elevated": "true",
            "auto-detach": "0",
            "wait-all": 1,
            "exit-timeout": "30"
        }"#;
        let app: AppDef = serde_json::from_str(json).unwrap();
        assert!(app.elevated);
        assert!(!app.auto_detach);
        assert!(app.wait_all);
        assert_eq!(app.exit_timeout, Some(30));
    }

    #[test]
    fn scaling_type_stores_lowercase() {
        assert_eq!(
            serde_json::to_string(&ScalingType::SharpBilinear).unwrap(),
            "\"sharp-bilinear\""
        );
        let parsed: ScalingType = serde_json::from_str("\"fsr\"").unwrap();
        assert_eq!(parsed, ScalingType::Fsr);
    }

    #[test]
    fn playnite_backed_vs_placebo() {
        let desktop = AppDef {
            name: "Desktop".to_string(),
            ..Default::default()
        };
        assert!(desktop.is_placebo());
        assert!(!desktop.is_playnite_backed());

        let playnite = AppDef {
            playnite_id: "abc".to_string(),
            ..Default::default()
        };
        assert!(playnite.is_playnite_backed());
        assert!(!playnite.is_placebo());

        let regular = AppDef {
            cmd: "game.exe".to_string(),
            ..Default::default()
        };
        assert!(!regular.is_placebo());
    }

    #[test]
    fn image_validation_falls_back() {
        assert_eq!(validate_app_image_path(""), DEFAULT_APP_IMAGE_PATH);
        assert_eq!(
            validate_app_image_path("./assets/steam.png"),
            DEFAULT_APP_IMAGE_PATH
        );
        assert_eq!(
            validate_app_image_path("/nonexistent/cover.jpg"),
            DEFAULT_APP_IMAGE_PATH
        );
        assert_eq!(
            validate_app_image_path("/nonexistent/cover.png"),
            DEFAULT_APP_IMAGE_PATH
        );
    }

    #[test]
    fn image_validation_accepts_existing_png() {
        let dir = tempfile::tempdir().unwrap();
        let png = dir.path().join("cover.PNG");
        std::fs::write(&png, b"png-bytes").unwrap();
        let path = png.to_string_lossy().to_string();
        assert_eq!(validate_app_image_path(&path), path);
    }
}
