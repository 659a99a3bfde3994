use std::collections::BTreeMap;

use tokio::sync::Mutex;
use uuid::Uuid;

use super::helper::DisplayHelperClient;
use super::parser::{
    parse_configuration, DisplayConfig, HdrState, ParsedConfiguration, Ratio,
    REFRESH_PREFER_HIGHEST,
};
use crate::config::{DdConfig, VirtualDisplayMode};
use crate::error::Result;
use crate::session::{AppMetadata, LaunchSession};

/// Far offset used to park displays the cursor must not reach.
pub const ISOLATED_OFFSET: (i32, i32) = (64000, 64000);

/// Dummy-plug capture runs at a fixed low refresh unless a framegen fix
/// needs the highest-mode sentinel.
const DUMMY_PLUG_REFRESH: Ratio = Ratio { num: 30, den: 1 };

/// How the streaming surface relates to the host's other displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Arrangement {
    /// Streaming display is the only active display
    Exclusive,
    #[default]
    Extended,
    /// Extended and made primary
    ExtendedPrimary,
    /// Extended, parked at the far offset so the cursor cannot escape
    ExtendedIsolated,
    /// Primary at origin, everything else parked at the far offset
    ExtendedPrimaryIsolated,
}

impl Arrangement {
    pub fn from_layout(layout: &str) -> Self {
        match layout {
            "exclusive" => Arrangement::Exclusive,
            "extended_primary" => Arrangement::ExtendedPrimary,
            "extended_isolated" => Arrangement::ExtendedIsolated,
            "extended_primary_isolated" => Arrangement::ExtendedPrimaryIsolated,
            _ => Arrangement::Extended,
        }
    }

    pub fn isolated(&self) -> bool {
        matches!(
            self,
            Arrangement::ExtendedIsolated | Arrangement::ExtendedPrimaryIsolated
        )
    }
}

/// One currently attached display, as reported by the platform glue.
#[derive(Debug, Clone)]
pub struct DisplayInfo {
    pub device_id: String,
    pub origin: (i32, i32),
    pub refresh_hz: u32,
}

#[derive(Default)]
struct ArbiterState {
    /// Only a successful Apply arms the revert on teardown
    applied: bool,
    shared_virtual_guid: Option<[u8; 16]>,
    saved_positions: Option<BTreeMap<String, (i32, i32)>>,
}

/// Owns the helper connection and the per-host display state. Apply/revert
/// are serialized here; the helper's own queue is FIFO behind that.
pub struct DisplayArbiter {
    helper: DisplayHelperClient,
    state: Mutex<ArbiterState>,
}

impl DisplayArbiter {
    pub fn new(helper: DisplayHelperClient) -> Self {
        Self {
            helper,
            state: Mutex::new(ArbiterState::default()),
        }
    }

    /// Build and apply the display configuration for a session.
    ///
    /// On parse failure the caller must not stream against a misconfigured
    /// display; on helper failure the caller may proceed without
    /// reconfiguration (revert becomes a no-op).
    pub async fn apply_for_session(
        &self,
        dd: &DdConfig,
        session: &mut LaunchSession,
        meta: &AppMetadata,
        current_displays: &[DisplayInfo],
    ) -> Result<bool> {
        let mut config = match parse_configuration(dd, session)? {
            ParsedConfiguration::Disabled => return Ok(false),
            ParsedConfiguration::Config(config) => config,
        };

        let wants_virtual = session.virtual_display
            || meta.virtual_screen
            || dd.virtual_display_mode != VirtualDisplayMode::Disabled;

        let mut state = self.state.lock().await;
        if wants_virtual {
            self.prepare_virtual(dd, session, meta, &mut config, &mut state);
        } else {
            prepare_standard(dd, session, meta, &mut config);
        }

        let arrangement = Arrangement::from_layout(
            session
                .virtual_display_layout_override
                .as_deref()
                .unwrap_or(""),
        );
        let stream_device = config.device_id.clone();
        apply_arrangement(
            arrangement,
            &stream_device,
            current_displays,
            &mut config,
            &mut state,
        );

        match self.helper.apply(&config).await {
            Ok(()) => {
                state.applied = true;
                Ok(true)
            }
            Err(e) => {
                // Stream anyway; the display simply keeps its current shape
                tracing::warn!("Display apply failed, continuing unconfigured: {}", e);
                state.saved_positions = None;
                Ok(false)
            }
        }
    }

    /// Revert the display to its pre-session shape. No-op unless a prior
    /// apply succeeded.
    pub async fn revert(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.applied {
            return Ok(());
        }
        self.helper.revert().await?;
        state.applied = false;
        state.saved_positions = None;
        Ok(())
    }

    /// Clear helper-side persistence.
    pub async fn reset_persistence(&self) -> Result<()> {
        self.helper.reset_persistence().await
    }

    /// Snapshot the current OS display topology as the golden restore
    /// target. The helper owns the snapshot file.
    pub async fn export_golden(&self) -> Result<()> {
        self.helper.export_golden().await
    }

    pub async fn has_applied(&self) -> bool {
        self.state.lock().await.applied
    }

    fn prepare_virtual(
        &self,
        dd: &DdConfig,
        session: &mut LaunchSession,
        meta: &AppMetadata,
        config: &mut DisplayConfig,
        state: &mut ArbiterState,
    ) {
        session.virtual_display = true;

        // Stable GUID for the shared display, fresh one per client otherwise
        let guid = match dd.virtual_display_mode {
            VirtualDisplayMode::Shared => *state
                .shared_virtual_guid
                .get_or_insert_with(|| *Uuid::new_v4().as_bytes()),
            _ => {
                if session.virtual_display_guid_bytes == [0u8; 16] {
                    session.virtual_display_guid_bytes = *Uuid::new_v4().as_bytes();
                }
                session.virtual_display_guid_bytes
            }
        };
        session.virtual_display_guid_bytes = guid;

        // The virtual display must refresh fast enough for framegen output
        if dd.virtual_double_refresh || meta.lossless_scaling_framegen || meta.any_framegen_fix() {
            if let Some(rate) = config.refresh_rate {
                let fps = session.fps.max(0) as u32;
                let floor = (2 * fps).max(rate.num / rate.den.max(1));
                config.refresh_rate = Some(Ratio::integer(floor));
            }
        }

        config.device_id = if !session.virtual_display_device_id.is_empty() {
            session.virtual_display_device_id.clone()
        } else {
            dd.output_name.clone()
        };
        config.watchdog = true;
    }
}

fn prepare_standard(
    dd: &DdConfig,
    session: &LaunchSession,
    meta: &AppMetadata,
    config: &mut DisplayConfig,
) {
    config.device_id = dd.output_name.clone();

    if dd.dummy_plug_hdr10 {
        // Dummy plugs advertise HDR but not high refresh; pin both unless a
        // framegen fix needs the highest mode
        config.hdr_state = Some(HdrState::Enabled);
        config.refresh_rate = Some(if meta.any_framegen_fix() {
            REFRESH_PREFER_HIGHEST
        } else {
            DUMMY_PLUG_REFRESH
        });
    } else if meta.any_framegen_fix() || session.gen1_framegen_fix || session.gen2_framegen_fix {
        config.refresh_rate = Some(REFRESH_PREFER_HIGHEST);
    }
}

/// Translate an arrangement into topology + positions, snapshotting the
/// current origins of the other displays so revert can restore them.
fn apply_arrangement(
    arrangement: Arrangement,
    stream_device: &str,
    current_displays: &[DisplayInfo],
    config: &mut DisplayConfig,
    state: &mut ArbiterState,
) {
    if stream_device.is_empty() {
        return;
    }

    match arrangement {
        Arrangement::Exclusive => {
            config.topology = Some(vec![vec![stream_device.to_string()]]);
        }
        Arrangement::Extended => {}
        Arrangement::ExtendedPrimary => {
            let mut positions = BTreeMap::new();
            positions.insert(stream_device.to_string(), (0, 0));
            config.monitor_positions = Some(positions);
        }
        Arrangement::ExtendedIsolated | Arrangement::ExtendedPrimaryIsolated => {
            let mut saved = BTreeMap::new();
            let mut positions = BTreeMap::new();

            if arrangement == Arrangement::ExtendedPrimaryIsolated {
                // Streaming surface at origin, everything else far away
                positions.insert(stream_device.to_string(), (0, 0));
                for display in current_displays {
                    if display.device_id != stream_device {
                        saved.insert(display.device_id.clone(), display.origin);
                        positions.insert(display.device_id.clone(), ISOLATED_OFFSET);
                    }
                }
            } else {
                // Streaming surface itself parked at the far offset
                for display in current_displays {
                    saved.insert(display.device_id.clone(), display.origin);
                }
                positions.insert(stream_device.to_string(), ISOLATED_OFFSET);
            }

            state.saved_positions = Some(saved);
            config.monitor_positions = Some(positions);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::AppConfig;

    fn dd_with(pairs: &[(&str, &str)]) -> DdConfig {
        AppConfig::from_map(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
        .dd()
    }

    fn session_1080p60() -> LaunchSession {
        LaunchSession {
            width: 1920,
            height: 1080,
            fps: 60,
            ..Default::default()
        }
    }

    #[test]
    fn arrangement_parse_and_isolation() {
        assert_eq!(Arrangement::from_layout("exclusive"), Arrangement::Exclusive);
        assert_eq!(Arrangement::from_layout(""), Arrangement::Extended);
        assert!(Arrangement::from_layout("extended_isolated").isolated());
        assert!(!Arrangement::ExtendedPrimary.isolated());
    }

    #[test]
    fn dummy_plug_forces_hdr_and_30hz() {
        let dd = dd_with(&[("dummy_plug_hdr10", "true")]);
        let mut config = DisplayConfig::default();
        prepare_standard(&dd, &session_1080p60(), &AppMetadata::default(), &mut config);
        assert_eq!(config.hdr_state, Some(HdrState::Enabled));
        assert_eq!(config.refresh_rate, Some(Ratio { num: 30, den: 1 }));
    }

    #[test]
    fn dummy_plug_with_framegen_fix_prefers_highest() {
        let dd = dd_with(&[("dummy_plug_hdr10", "true")]);
        let meta = AppMetadata {
            gen1_framegen_fix: true,
            ..Default::default()
        };
        let mut config = DisplayConfig::default();
        prepare_standard(&dd, &session_1080p60(), &meta, &mut config);
        assert_eq!(config.hdr_state, Some(HdrState::Enabled));
        assert_eq!(config.refresh_rate, Some(REFRESH_PREFER_HIGHEST));
    }

    #[test]
    fn isolated_primary_parks_other_displays() {
        let displays = vec![
            DisplayInfo {
                device_id: "virt-1".to_string(),
                origin: (0, 0),
                refresh_hz: 120,
            },
            DisplayInfo {
                device_id: "real-1".to_string(),
                origin: (1920, 0),
                refresh_hz: 60,
            },
        ];
        let mut config = DisplayConfig::default();
        let mut state = ArbiterState::default();
        apply_arrangement(
            Arrangement::ExtendedPrimaryIsolated,
            "virt-1",
            &displays,
            &mut config,
            &mut state,
        );

        let positions = config.monitor_positions.unwrap();
        assert_eq!(positions["virt-1"], (0, 0));
        assert_eq!(positions["real-1"], ISOLATED_OFFSET);
        // Original origin snapshotted for restore
        assert_eq!(state.saved_positions.unwrap()["real-1"], (1920, 0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn revert_is_noop_without_successful_apply() {
        let arbiter =
            DisplayArbiter::new(DisplayHelperClient::with_pipe_name("arbiter-test-none"));
        // No apply happened; revert must not touch the helper at all
        arbiter.revert().await.unwrap();
        assert!(!arbiter.has_applied().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_apply_leaves_revert_disarmed() {
        let arbiter =
            DisplayArbiter::new(DisplayHelperClient::with_pipe_name("arbiter-test-dead"));
        let dd = dd_with(&[]);
        let mut session = session_1080p60();
        let applied = arbiter
            .apply_for_session(&dd, &mut session, &AppMetadata::default(), &[])
            .await
            .unwrap();
        assert!(!applied);
        assert!(!arbiter.has_applied().await);
    }

    #[test]
    fn virtual_refresh_floor_doubles_fps() {
        let dd = dd_with(&[("virtual_double_refresh", "true"), ("output_name", "VIRT")]);
        let arbiter = DisplayArbiter::new(DisplayHelperClient::with_pipe_name("x"));
        let mut session = session_1080p60();
        let mut config = DisplayConfig {
            refresh_rate: Some(Ratio::integer(60)),
            ..Default::default()
        };
        let mut state = ArbiterState::default();
        arbiter.prepare_virtual(
            &dd,
            &mut session,
            &AppMetadata::default(),
            &mut config,
            &mut state,
        );
        assert_eq!(config.refresh_rate, Some(Ratio::integer(120)));
        assert!(session.virtual_display);
        assert_ne!(session.virtual_display_guid_bytes, [0u8; 16]);
        assert_eq!(config.device_id, "VIRT");
    }
}
