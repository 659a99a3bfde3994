//! Launchable-app model: the `apps.json` schema, id computation, image
//! validation, and the persisted store the supervisor and API share.

pub mod store;
pub mod types;

pub use store::{
    calculate_app_id, image_digest_or_path, migrate_legacy_keys, reorder_apps, sort_apps_by_name,
    AppsFile, AppsStore,
};
pub use types::{
    validate_app_image_path, AppDef, FrameGenProvider, LosslessOverrides, LosslessProfile,
    PrepCmd, ScalingType, DEFAULT_APP_IMAGE_PATH,
};
