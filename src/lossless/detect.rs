//! Game-process detection: watch for processes that appeared after launch
//! and pick the one that looks most like the game.

use std::collections::HashSet;
use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};

/// Observation window after launch.
pub const DETECT_WINDOW: Duration = Duration::from_secs(10);
/// Sampling cadence within the window.
const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Paths that are never the game.
const SYSTEM_PATH_MARKERS: &[&str] = &[
    "/windows/system32",
    "/windows/syswow64",
    "/windows/systemapps",
    "/program files/windowsapps",
];

/// All live process ids, captured before launch as the baseline.
pub fn snapshot_pids() -> HashSet<u32> {
    let mut system = System::new();
    system.refresh_processes();
    system.processes().keys().map(|p| p.as_u32()).collect()
}

/// Weighted score for one candidate process. CPU and memory both count;
/// living under the install dir is a strong signal, a system path a strong
/// counter-signal.
pub fn score_candidate(cpu: f32, memory_bytes: u64, path: &str, install_dir: Option<&str>) -> f64 {
    let mut score = cpu as f64 * 10.0 + (memory_bytes as f64 / (1024.0 * 1024.0));

    let normalized = path.to_lowercase().replace('\\', "/");
    if let Some(dir) = install_dir.filter(|d| !d.is_empty()) {
        let dir = dir.to_lowercase().replace('\\', "/");
        if normalized.starts_with(&dir) {
            score += 10_000.0;
        }
    }
    if SYSTEM_PATH_MARKERS.iter().any(|m| normalized.contains(m)) {
        score -= 100_000.0;
    }
    score
}

/// Observe new processes for the window and return the best candidate pid.
pub async fn detect_game_process(
    baseline: &HashSet<u32>,
    install_dir: Option<&str>,
    window: Duration,
) -> Option<u32> {
    let refresh = RefreshKind::new().with_processes(ProcessRefreshKind::everything());
    let mut system = System::new_with_specifics(refresh);

    let deadline = tokio::time::Instant::now() + window;
    let mut best: Option<(u32, f64)> = None;

    while tokio::time::Instant::now() < deadline {
        tokio::time::sleep(SAMPLE_INTERVAL).await;
        system.refresh_processes();

        for (pid, process) in system.processes() {
            let pid = pid.as_u32();
            if baseline.contains(&pid) {
                continue;
            }
            let path = process
                .exe()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            let score = score_candidate(
                process.cpu_usage(),
                process.memory(),
                &path,
                install_dir,
            );
            if best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((pid, score));
            }
        }
    }

    let found = best.map(|(pid, _)| pid);
    if let Some(pid) = found {
        tracing::info!(pid, "Detected game process for frame generation");
    } else {
        tracing::info!("No game process detected within the observation window");
    }
    found
}

/// Does this pid still exist?
pub fn pid_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes();
    system.process(Pid::from_u32(pid)).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_dir_outweighs_resource_usage() {
        let in_dir = score_candidate(1.0, 50 << 20, "C:\\Games\\Foo\\foo.exe", Some("C:\\Games\\Foo"));
        let heavy_elsewhere = score_candidate(90.0, 4 << 30, "C:\\Other\\bar.exe", Some("C:\\Games\\Foo"));
        assert!(in_dir > heavy_elsewhere);
    }

    #[test]
    fn system_paths_are_penalized() {
        let system = score_candidate(50.0, 1 << 30, "C:\\Windows\\System32\\svchost.exe", None);
        let game = score_candidate(5.0, 100 << 20, "D:\\SteamLibrary\\game.exe", None);
        assert!(game > system);
        assert!(system < 0.0);
    }

    #[test]
    fn path_comparison_is_separator_and_case_insensitive() {
        let a = score_candidate(0.0, 0, "c:/games/foo/FOO.EXE", Some("C:\\Games\\Foo"));
        assert!(a >= 10_000.0);
    }

    #[test]
    fn baseline_snapshot_contains_self() {
        assert!(snapshot_pids().contains(&std::process::id()));
    }

    #[tokio::test]
    async fn empty_window_detects_nothing_new() {
        let baseline = snapshot_pids();
        let found = detect_game_process(&baseline, None, Duration::from_millis(10)).await;
        // Nothing spawned between snapshot and scan (processes may appear
        // on a busy CI box; tolerate either outcome but don't hang)
        let _ = found;
    }
}
