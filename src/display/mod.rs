//! Display-configuration arbiter: parse client/session intent into a
//! `DisplayConfig`, drive the out-of-process display helper, and track the
//! virtual-display lifecycle.

pub mod arbiter;
pub mod helper;
pub mod parser;

pub use arbiter::{Arrangement, DisplayArbiter};
pub use helper::{DisplayHelperClient, HelperMessage};
pub use parser::{
    parse_configuration, parse_refresh_rate, parse_resolution, DisplayConfig, HdrState,
    ParsedConfiguration, Ratio, REFRESH_PREFER_HIGHEST,
};
