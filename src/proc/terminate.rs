//! Graceful-then-forceful process-group termination.
//!
//! The pattern is shared by the supervisor, the capture helper shutdown and
//! the Playnite launcher cleanup: request a polite exit, re-request at 40%
//! and 70% of the budget, then kill whatever is left when the budget runs
//! out. Liveness is polled every 250 ms.

use std::time::Duration;

use sysinfo::{Pid, ProcessStatus, System};

/// Poll cadence while waiting for processes to exit.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Escalation points as fractions of the exit budget.
const STAGE_FRACTIONS: [f64; 3] = [0.0, 0.4, 0.7];

/// Collect `root` plus every live descendant, bottom-up, so children are
/// signalled before their parents.
pub fn collect_process_group(root: u32) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes();

    let mut group = vec![root];
    let mut frontier = vec![root];
    while let Some(parent) = frontier.pop() {
        for (pid, process) in system.processes() {
            if process.parent() == Some(Pid::from_u32(parent)) {
                let child = pid.as_u32();
                if !group.contains(&child) {
                    group.push(child);
                    frontier.push(child);
                }
            }
        }
    }
    group.reverse();
    group
}

fn any_alive(pids: &[u32]) -> bool {
    let mut system = System::new();
    system.refresh_processes();
    pids.iter().any(|pid| {
        system
            .process(Pid::from_u32(*pid))
            // An unreaped zombie is done as far as termination is concerned
            .map(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
            .unwrap_or(false)
    })
}

/// Ask a process to exit politely. Stages 0..=2 escalate the request; the
/// final kill happens separately.
#[cfg(unix)]
fn request_graceful(pid: u32, _stage: usize) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid as NixPid;
    let _ = kill(NixPid::from_raw(pid as i32), Signal::SIGTERM);
}

#[cfg(windows)]
fn request_graceful(pid: u32, _stage: usize) {
    // taskkill without /F delivers WM_CLOSE/ENDSESSION to the target's windows
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string()])
        .output();
}

#[cfg(unix)]
fn force_kill(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid as NixPid;
    let _ = kill(NixPid::from_raw(pid as i32), Signal::SIGKILL);
}

#[cfg(windows)]
fn force_kill(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/F", "/PID", &pid.to_string()])
        .output();
}

/// Terminate every process in `pids` within `exit_timeout`.
///
/// Returns `true` if the group went down before the forced kill. Stage
/// timing (0 / 0.4 / 0.7 / 1.0 of the budget) is part of the observable
/// contract: callers rely on bounded termination within the budget.
pub async fn graceful_then_forceful(pids: &[u32], exit_timeout: Duration) -> bool {
    if pids.is_empty() {
        return true;
    }

    let start = tokio::time::Instant::now();
    let mut next_stage = 0usize;

    loop {
        let elapsed = start.elapsed();

        while next_stage < STAGE_FRACTIONS.len()
            && elapsed >= exit_timeout.mul_f64(STAGE_FRACTIONS[next_stage])
        {
            for pid in pids {
                request_graceful(*pid, next_stage);
            }
            next_stage += 1;
        }

        if !any_alive(pids) {
            return true;
        }
        if elapsed >= exit_timeout {
            break;
        }

        let wait = POLL_INTERVAL.min(exit_timeout - elapsed);
        tokio::time::sleep(wait).await;
    }

    tracing::warn!("Exit budget exhausted, killing {} process(es)", pids.len());
    for pid in pids {
        force_kill(*pid);
    }
    // Give the OS a beat to reap before reporting
    tokio::time::sleep(POLL_INTERVAL).await;
    !any_alive(pids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[tokio::test]
    async fn terminates_a_sleeping_child_within_budget() {
        let child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id();

        let start = std::time::Instant::now();
        let clean = graceful_then_forceful(&[pid], Duration::from_secs(5)).await;
        assert!(clean);
        // SIGTERM lands at stage 0; this should be quick
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn force_kills_a_term_ignoring_child() {
        // A shell that traps TERM keeps running until the final KILL
        let child = std::process::Command::new("sh")
            .args(["-c", "trap '' TERM; sleep 30"])
            .spawn()
            .unwrap();
        let pid = child.id();

        let clean = graceful_then_forceful(&[pid], Duration::from_millis(1500)).await;
        assert!(clean);
    }

    #[tokio::test]
    async fn empty_group_is_trivially_done() {
        assert!(graceful_then_forceful(&[], Duration::from_secs(1)).await);
    }

    #[test]
    fn process_group_contains_root() {
        let group = collect_process_group(std::process::id());
        assert!(group.contains(&std::process::id()));
    }
}
