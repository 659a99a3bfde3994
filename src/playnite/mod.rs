//! Playnite integration: the plugin IPC client, library snapshots, and the
//! auto-sync reconciliation into apps.json.

pub mod ipc;
pub mod protocol;
pub mod sync;

use std::time::Duration;

pub use ipc::{PlayniteIpc, StatusEvent};
pub use protocol::{LineAccumulator, PlayniteCategory, PlayniteGame, PlaynitePlugin};

/// Ignore `gameStopped` right after launch; Playnite emits transient stop
/// events while a game boots.
pub const GAME_STOP_GUARD: Duration = Duration::from_secs(2);

/// Decide whether a `gameStopped` status should terminate the active app.
///
/// All four conditions of the contract: a Playnite-backed app is active,
/// the ids match (or one side is empty), a `gameStarted` was observed for
/// this session, and the session is past the launch guard window.
pub fn should_terminate_on_stop(
    active_playnite_id: Option<&str>,
    observed_started: bool,
    stopped_id: &str,
    session_age: Duration,
) -> bool {
    let Some(active_id) = active_playnite_id else {
        return false;
    };
    if !observed_started {
        return false;
    }
    if session_age < GAME_STOP_GUARD {
        return false;
    }
    active_id.is_empty() || stopped_id.is_empty() || active_id == stopped_id
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAST_GUARD: Duration = Duration::from_secs(10);

    #[test]
    fn requires_an_active_playnite_app() {
        assert!(!should_terminate_on_stop(None, true, "g1", PAST_GUARD));
        assert!(should_terminate_on_stop(Some("g1"), true, "g1", PAST_GUARD));
    }

    #[test]
    fn requires_observed_start() {
        assert!(!should_terminate_on_stop(Some("g1"), false, "g1", PAST_GUARD));
    }

    #[test]
    fn guard_window_suppresses_early_stops() {
        assert!(!should_terminate_on_stop(
            Some("g1"),
            true,
            "g1",
            Duration::from_millis(500)
        ));
    }

    #[test]
    fn empty_id_on_either_side_matches() {
        assert!(should_terminate_on_stop(Some("g1"), true, "", PAST_GUARD));
        assert!(should_terminate_on_stop(Some(""), true, "g1", PAST_GUARD));
        assert!(!should_terminate_on_stop(Some("g1"), true, "g2", PAST_GUARD));
    }
}
