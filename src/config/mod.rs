//! Host configuration: the `key = value` file, its typed views, and the
//! store that caches it for lock-free reads.

pub mod schema;
pub mod store;

pub use schema::{
    AppConfig, DdConfig, DevicePreparation, HdrOption, PlayniteConfig, ProcConfig,
    RefreshRateOption, ResolutionOption, VirtualDisplayMode, WebConfig,
};
pub use store::{ConfigApplyOutcome, ConfigChange, ConfigStore};
