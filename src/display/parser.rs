use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{
    DdConfig, DevicePreparation, HdrOption, RefreshRateOption, ResolutionOption,
};
use crate::config::schema::ModeRemapEntry;
use crate::error::{AppError, Result};
use crate::session::LaunchSession;

/// Sentinel meaning "pick the highest mode the OS supports".
pub const REFRESH_PREFER_HIGHEST: Ratio = Ratio { num: 10000, den: 1 };

/// Refresh rate as a rational so "59.94" survives exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ratio {
    pub num: u32,
    pub den: u32,
}

impl Ratio {
    pub fn integer(num: u32) -> Self {
        Self { num, den: 1 }
    }
}

impl std::fmt::Display for Ratio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.den == 1 {
            write!(f, "{}", self.num)
        } else {
            write!(f, "{}/{}", self.num, self.den)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HdrState {
    Enabled,
    Disabled,
}

/// The display shape one session asks the helper to realize.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DisplayConfig {
    pub device_id: String,
    pub device_prep: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<(u32, u32)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_rate: Option<Ratio>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hdr_state: Option<HdrState>,
    /// Groups of device ids forming extended/mirror sets
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topology: Option<Vec<Vec<String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor_positions: Option<BTreeMap<String, (i32, i32)>>,
    /// Helper must detach the (virtual) display if the host goes away
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub watchdog: bool,

    #[serde(skip)]
    pub preparation: DevicePreparation,
}

/// Outcome of the pure parse pipeline.
#[derive(Debug, Clone)]
pub enum ParsedConfiguration {
    /// Display handling is turned off for this session
    Disabled,
    Config(DisplayConfig),
}

/// Parse a `WxH` resolution string. Empty means "leave unchanged"; anything
/// else must match `^\d+x\d+$` after trimming.
pub fn parse_resolution(input: &str) -> Result<Option<(u32, u32)>> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(None);
    }

    let invalid = || AppError::Parse(format!("invalid resolution \"{input}\""));
    let (w, h) = input.split_once('x').ok_or_else(invalid)?;
    if w.is_empty() || h.is_empty() {
        return Err(invalid());
    }
    if !w.bytes().all(|b| b.is_ascii_digit()) || !h.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let width: u32 = w.parse().map_err(|_| invalid())?;
    let height: u32 = h.parse().map_err(|_| invalid())?;
    Ok(Some((width, height)))
}

/// Parse a refresh-rate string into a rational. `"60"` becomes 60/1,
/// `"59.94"` becomes 5994/100 with trailing zeros of the fraction stripped
/// first. Empty means "leave unchanged". Decimal input is only legal for
/// manual configuration.
pub fn parse_refresh_rate(input: &str, allow_decimal: bool) -> Result<Option<Ratio>> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(None);
    }

    let invalid = || AppError::Parse(format!("invalid refresh rate \"{input}\""));

    let (whole, fraction) = match input.split_once('.') {
        Some((w, f)) => {
            if !allow_decimal {
                return Err(invalid());
            }
            (w, f.trim_end_matches('0'))
        }
        None => (input, ""),
    };

    if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    if !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    if fraction.is_empty() {
        let num: u32 = whole.parse().map_err(|_| invalid())?;
        return Ok(Some(Ratio::integer(num)));
    }

    let den = 10u32
        .checked_pow(fraction.len() as u32)
        .ok_or_else(invalid)?;
    let whole_num: u32 = whole.parse().map_err(|_| invalid())?;
    let frac_num: u32 = fraction.parse().map_err(|_| invalid())?;
    let num = whole_num
        .checked_mul(den)
        .and_then(|n| n.checked_add(frac_num))
        .ok_or_else(invalid)?;
    Ok(Some(Ratio { num, den }))
}

fn prep_to_string(prep: DevicePreparation) -> String {
    match prep {
        DevicePreparation::Disabled => "disabled",
        DevicePreparation::VerifyOnly => "verify_only",
        DevicePreparation::EnsureActive => "ensure_active",
        DevicePreparation::EnsurePrimary => "ensure_primary",
        DevicePreparation::EnsureOnlyDisplay => "ensure_only_display",
    }
    .to_string()
}

fn prep_from_override(value: &str) -> Option<DevicePreparation> {
    match value {
        "disabled" => Some(DevicePreparation::Disabled),
        "verify_only" => Some(DevicePreparation::VerifyOnly),
        "ensure_active" => Some(DevicePreparation::EnsureActive),
        "ensure_primary" => Some(DevicePreparation::EnsurePrimary),
        "ensure_only_display" => Some(DevicePreparation::EnsureOnlyDisplay),
        _ => None,
    }
}

/// Turn `{user config, launch session}` into a `DisplayConfig`.
///
/// Pure: no OS access; the arbiter layers the virtual-display and
/// dummy-plug branches on top of this result.
pub fn parse_configuration(
    dd: &DdConfig,
    session: &LaunchSession,
) -> Result<ParsedConfiguration> {
    // 1. Resolve preparation; a per-session override from the client wins
    let prep = session
        .dd_config_option_override
        .as_deref()
        .and_then(prep_from_override)
        .unwrap_or(dd.configuration_option);
    if prep == DevicePreparation::Disabled {
        return Ok(ParsedConfiguration::Disabled);
    }

    // 2. Resolution
    let resolution = match dd.resolution_option {
        ResolutionOption::Disabled => None,
        ResolutionOption::Automatic => {
            if session.width < 0 || session.height < 0 {
                return Err(AppError::Parse(format!(
                    "invalid session resolution {}x{}",
                    session.width, session.height
                )));
            }
            Some((session.width as u32, session.height as u32))
        }
        ResolutionOption::Manual => parse_resolution(&dd.manual_resolution)?,
    };

    // 3. Refresh rate
    let refresh_rate = match dd.refresh_rate_option {
        RefreshRateOption::Disabled => None,
        RefreshRateOption::PreferHighest => Some(REFRESH_PREFER_HIGHEST),
        RefreshRateOption::Automatic => {
            let fps = match session.framegen_refresh_rate {
                Some(r) if r > 0 => r,
                _ => session.fps,
            };
            if fps < 0 {
                return Err(AppError::Parse(format!("invalid session fps {fps}")));
            }
            Some(Ratio::integer(fps as u32))
        }
        RefreshRateOption::Manual => parse_refresh_rate(&dd.manual_refresh_rate, true)?,
    };

    // 4. HDR
    let hdr_state = if dd.dummy_plug_hdr10 {
        Some(HdrState::Enabled)
    } else {
        match dd.hdr_option {
            HdrOption::Disabled => None,
            HdrOption::Automatic => Some(if session.enable_hdr {
                HdrState::Enabled
            } else {
                HdrState::Disabled
            }),
        }
    };

    // 5. Remapping table
    let (resolution, refresh_rate) =
        apply_remapping(&dd.mode_remapping, resolution, refresh_rate)?;

    Ok(ParsedConfiguration::Config(DisplayConfig {
        device_id: String::new(),
        device_prep: prep_to_string(prep),
        resolution,
        refresh_rate,
        hdr_state,
        topology: None,
        monitor_positions: None,
        watchdog: false,
        preparation: prep,
    }))
}

/// Match the first remap entry whose requested fields all equal the parsed
/// values (missing fields are wildcards) and substitute its final fields.
fn apply_remapping(
    entries: &[ModeRemapEntry],
    mut resolution: Option<(u32, u32)>,
    mut refresh: Option<Ratio>,
) -> Result<(Option<(u32, u32)>, Option<Ratio>)> {
    for entry in entries {
        if entry.final_resolution.is_none() && entry.final_refresh_rate.is_none() {
            return Err(AppError::Parse(
                "display mode remapping entry has no final fields".to_string(),
            ));
        }

        let res_matches = match &entry.requested_resolution {
            None => true,
            Some(wanted) => parse_resolution(wanted)? == resolution,
        };
        let fps_matches = match &entry.requested_fps {
            None => true,
            Some(wanted) => parse_refresh_rate(wanted, true)? == refresh,
        };
        if !res_matches || !fps_matches {
            continue;
        }

        if let Some(final_res) = &entry.final_resolution {
            resolution = parse_resolution(final_res)?;
        }
        if let Some(final_refresh) = &entry.final_refresh_rate {
            refresh = parse_refresh_rate(final_refresh, true)?;
        }
        break;
    }
    Ok((resolution, refresh))
}
