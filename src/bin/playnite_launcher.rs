//! Playnite launcher child process.
//!
//! The supervisor spawns one of these per Playnite-backed launch; its
//! lifetime is the app lifetime. It asks the Playnite plugin to start the
//! game, pushes the game window to the foreground within a focus budget,
//! and exits when the game stops or Playnite dies. A detached cleanup
//! sibling sweeps the install directory after the launcher itself exits.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use sysinfo::{Pid, System};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;

use vibeshine::apps::{AppDef, LosslessProfile};
use vibeshine::lossless;
use vibeshine::playnite::protocol::{
    parse_line, InboundMessage, LineAccumulator, OutboundMessage, PLAYNITE_PIPE,
};
use vibeshine::proc::{collect_process_group, graceful_then_forceful};
use vibeshine::utils::ipc::IpcStream;

/// Budget for Playnite to report gameStarted; does not apply once the game
/// is up.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(120);
/// How long to keep retrying the plugin pipe.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Poll cadence for process liveness.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser, Debug, Clone)]
#[command(name = "playnite-launcher")]
#[command(version, about = "Playnite launch helper", long_about = None)]
struct CliArgs {
    /// Playnite game id to launch
    #[arg(long, value_name = "ID")]
    game_id: Option<String>,

    /// Launch Playnite fullscreen mode instead of a game
    #[arg(long)]
    fullscreen: bool,

    /// Run as the cleanup watchdog for an exited launcher
    #[arg(long)]
    do_cleanup: bool,

    /// Confirmed foreground transitions to attempt
    #[arg(long, value_name = "N", default_value_t = 3)]
    focus_attempts: u32,

    /// Seconds the focus loop may run overall
    #[arg(long, value_name = "SECS", default_value_t = 30)]
    focus_timeout: u64,

    /// Stop focusing after the first confirmed transition
    #[arg(long)]
    focus_exit_on_first: bool,

    /// Termination budget used by the cleanup pass
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    exit_timeout: u64,

    /// Game install directory, used for focus and cleanup
    #[arg(long, value_name = "DIR")]
    install_dir: Option<PathBuf>,

    /// Pid the cleanup watchdog waits on
    #[arg(long, value_name = "PID")]
    wait_for_pid: Option<u32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "playnite_launcher=info".into()),
        )
        .init();

    let args = CliArgs::parse();

    if args.do_cleanup {
        return run_cleanup(args).await;
    }
    if args.game_id.is_none() && !args.fullscreen {
        anyhow::bail!("one of --game-id or --fullscreen is required");
    }
    run_launcher(args).await
}

// ============================================================================
// Launcher role
// ============================================================================

async fn run_launcher(args: CliArgs) -> anyhow::Result<()> {
    ensure_playnite_running(args.fullscreen)?;

    let mut stream = connect_plugin().await?;
    let game_id = args.game_id.clone().unwrap_or_default();

    send_line(&mut stream, &OutboundMessage::hello("launcher")).await?;
    if !game_id.is_empty() {
        send_line(&mut stream, &OutboundMessage::announce(&game_id)).await?;
    }

    spawn_cleanup_watchdog(&args);

    // Lossless Scaling wiring is re-derived from the env the supervisor set
    let lossless_baseline = lossless_app_from_env().map(|app| (app, lossless::snapshot_pids()));

    if args.fullscreen {
        tracing::info!("Waiting for Playnite fullscreen mode");
        run_focus_budget(&args, "Playnite.FullscreenApp").await;
        wait_for_playnite_exit().await;
        return Ok(());
    }

    tracing::info!(game = %game_id, "Requesting game launch");
    send_line(&mut stream, &OutboundMessage::launch(&game_id)).await?;

    // Phase 1: wait for gameStarted under the startup budget
    let started = wait_for_status(&mut stream, &game_id, "gameStarted", Some(STARTUP_TIMEOUT))
        .await;
    if !started {
        tracing::warn!("Game never reported started, exiting");
        return Ok(());
    }
    tracing::info!(game = %game_id, "Game started");

    let sidecar = lossless_baseline.map(|(app, baseline)| {
        let sidecar = lossless::Sidecar::new();
        sidecar.begin(&app, baseline);
        sidecar
    });

    // Phase 2: shove the game to the foreground within the budget
    let focus_target = args
        .install_dir
        .as_ref()
        .map(|d| d.to_string_lossy().into_owned())
        .unwrap_or_default();
    run_focus_budget(&args, &focus_target).await;

    // Phase 3: run until the game stops or Playnite goes away
    let stopped = wait_for_status(&mut stream, &game_id, "gameStopped", None).await;
    if stopped {
        tracing::info!(game = %game_id, "Game stopped");
    } else {
        tracing::info!("Playnite connection lost after game start, exiting");
    }

    if let Some(sidecar) = sidecar {
        sidecar.end().await;
    }
    Ok(())
}

fn ensure_playnite_running(fullscreen: bool) -> anyhow::Result<()> {
    if playnite_alive() {
        return Ok(());
    }
    tracing::info!("Playnite not running, starting it via URL association");

    // The playnite:// association resolves to whichever mode is installed
    #[cfg(windows)]
    {
        let url = if fullscreen {
            "playnite://playnite/startfullscreen"
        } else {
            "playnite://"
        };
        std::process::Command::new("cmd")
            .args(["/C", "start", "", url])
            .spawn()?;
    }
    #[cfg(not(windows))]
    {
        let _ = fullscreen;
        anyhow::bail!("Playnite is not available on this platform");
    }
    #[cfg(windows)]
    Ok(())
}

async fn connect_plugin() -> anyhow::Result<IpcStream> {
    let deadline = Instant::now() + CONNECT_TIMEOUT;
    loop {
        match IpcStream::connect(PLAYNITE_PIPE).await {
            Ok(stream) => return Ok(stream),
            Err(e) if Instant::now() >= deadline => {
                anyhow::bail!("could not reach the Playnite plugin: {e}");
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(500)).await,
        }
    }
}

async fn send_line(stream: &mut IpcStream, msg: &OutboundMessage) -> std::io::Result<()> {
    stream.write_all(msg.to_line().as_bytes()).await?;
    stream.flush().await
}

/// Read status messages until the wanted one arrives for our game (or any
/// game when ids are empty). Returns false on disconnect/timeout.
async fn wait_for_status(
    stream: &mut IpcStream,
    game_id: &str,
    wanted: &str,
    timeout: Option<Duration>,
) -> bool {
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut accumulator = LineAccumulator::new();
    let mut buf = vec![0u8; 8 * 1024];

    loop {
        // Playnite dying counts as the game ending
        if !playnite_alive() {
            return false;
        }

        let read = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return false;
                }
                match tokio::time::timeout(remaining, stream.read(&mut buf)).await {
                    Ok(result) => result,
                    Err(_) => return false,
                }
            }
            None => {
                match tokio::time::timeout(Duration::from_secs(1), stream.read(&mut buf)).await {
                    Ok(result) => result,
                    // Periodic wake-up to re-check the Playnite process
                    Err(_) => continue,
                }
            }
        };

        let n = match read {
            Ok(0) | Err(_) => return false,
            Ok(n) => n,
        };

        for line in accumulator.push(&buf[..n]) {
            if let Some(InboundMessage::Status { name, id, .. }) = parse_line(&line) {
                let id_matches = game_id.is_empty() || id.is_empty() || id == game_id;
                if name == wanted && id_matches {
                    return true;
                }
            }
        }
    }
}

fn playnite_alive() -> bool {
    let mut system = System::new();
    system.refresh_processes();
    system
        .processes()
        .values()
        .any(|p| p.name().to_lowercase().starts_with("playnite."))
}

async fn wait_for_playnite_exit() {
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if !playnite_alive() {
            return;
        }
    }
}

// ============================================================================
// Focus budget
// ============================================================================

/// At most one attempt per second, at most `focus_attempts` confirmed
/// transitions, at most `focus_timeout` seconds overall.
async fn run_focus_budget(args: &CliArgs, target: &str) {
    let budget = Duration::from_secs(args.focus_timeout);
    let deadline = Instant::now() + budget;
    let mut confirmed = 0u32;

    while Instant::now() < deadline && confirmed < args.focus_attempts {
        if attempt_focus(target) {
            confirmed += 1;
            tracing::debug!(confirmed, "Foreground transition confirmed");
            if args.focus_exit_on_first {
                break;
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Best-effort foreground push for the first process matching `target`
/// (install-dir prefix or executable-name fragment).
fn attempt_focus(target: &str) -> bool {
    if target.is_empty() {
        return false;
    }

    let mut system = System::new();
    system.refresh_processes();
    let wanted = target.to_lowercase().replace('\\', "/");

    let candidate = system.processes().iter().find(|(_, p)| {
        let exe = p
            .exe()
            .map(|e| e.to_string_lossy().to_lowercase().replace('\\', "/"))
            .unwrap_or_default();
        exe.contains(&wanted) || p.name().to_lowercase().contains(&wanted)
    });
    let Some((pid, _)) = candidate else {
        return false;
    };

    #[cfg(windows)]
    {
        // AppActivate reports whether the window actually took focus
        let script = format!(
            "(New-Object -ComObject WScript.Shell).AppActivate({})",
            pid.as_u32()
        );
        std::process::Command::new("powershell")
            .args(["-NoProfile", "-Command", &script])
            .output()
            .map(|out| String::from_utf8_lossy(&out.stdout).trim() == "True")
            .unwrap_or(false)
    }
    #[cfg(not(windows))]
    {
        let _ = pid;
        false
    }
}

// ============================================================================
// Cleanup role
// ============================================================================

fn spawn_cleanup_watchdog(args: &CliArgs) {
    let Ok(exe) = std::env::current_exe() else {
        tracing::warn!("Cannot resolve own path, skipping cleanup watchdog");
        return;
    };

    let mut command = std::process::Command::new(exe);
    command
        .arg("--do-cleanup")
        .args(["--wait-for-pid", &std::process::id().to_string()])
        .args(["--exit-timeout", &args.exit_timeout.to_string()]);
    if let Some(dir) = &args.install_dir {
        command.args(["--install-dir", &dir.to_string_lossy()]);
    }
    if args.fullscreen {
        command.arg("--fullscreen");
    }

    match command.spawn() {
        Ok(child) => tracing::info!(pid = child.id(), "Cleanup watchdog started"),
        Err(e) => tracing::warn!("Failed to start cleanup watchdog: {}", e),
    }
}

async fn run_cleanup(args: CliArgs) -> anyhow::Result<()> {
    let Some(wait_pid) = args.wait_for_pid else {
        anyhow::bail!("--do-cleanup requires --wait-for-pid");
    };

    // Outlive the launcher, then sweep
    loop {
        let mut system = System::new();
        system.refresh_processes();
        if system.process(Pid::from_u32(wait_pid)).is_none() {
            break;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    tracing::info!(pid = wait_pid, "Launcher exited, running cleanup");

    if args.fullscreen {
        // Drop Playnite out of big-picture mode instead of killing games
        return start_desktop_mode();
    }

    let Some(install_dir) = args.install_dir else {
        return Ok(());
    };
    let prefix = install_dir
        .to_string_lossy()
        .to_lowercase()
        .replace('\\', "/");

    let mut system = System::new();
    system.refresh_processes();
    let mut targets = Vec::new();
    for (pid, process) in system.processes() {
        let exe = process
            .exe()
            .map(|e| e.to_string_lossy().to_lowercase().replace('\\', "/"))
            .unwrap_or_default();
        if !prefix.is_empty() && exe.starts_with(&prefix) {
            targets.extend(collect_process_group(pid.as_u32()));
        }
    }
    targets.sort_unstable();
    targets.dedup();

    if targets.is_empty() {
        tracing::info!("Nothing left to clean up under {}", install_dir.display());
        return Ok(());
    }

    tracing::info!("Terminating {} leftover process(es)", targets.len());
    graceful_then_forceful(&targets, Duration::from_secs(args.exit_timeout)).await;
    Ok(())
}

fn start_desktop_mode() -> anyhow::Result<()> {
    #[cfg(windows)]
    {
        let mut system = System::new();
        system.refresh_processes();
        let desktop_exe = system
            .processes()
            .values()
            .find(|p| p.name().eq_ignore_ascii_case("Playnite.FullscreenApp.exe"))
            .and_then(|p| p.exe())
            .and_then(|e| e.parent().map(|d| d.join("Playnite.DesktopApp.exe")));

        if let Some(exe) = desktop_exe {
            std::process::Command::new(exe).arg("--startdesktop").spawn()?;
        }
    }
    Ok(())
}

// ============================================================================
// Lossless Scaling passthrough
// ============================================================================

/// Rebuild the frame-generation settings from the env the supervisor
/// injected, if frame generation is on for this launch.
fn lossless_app_from_env() -> Option<AppDef> {
    if std::env::var("SUNSHINE_LOSSLESS_SCALING_FRAMEGEN").ok()?.as_str() != "true" {
        return None;
    }
    let target_fps = std::env::var("SUNSHINE_LOSSLESS_SCALING_TARGET_FPS")
        .ok()
        .and_then(|v| v.parse().ok());

    Some(AppDef {
        cmd: "playnite".to_string(),
        lossless_scaling_framegen: true,
        lossless_scaling_target_fps: target_fps,
        lossless_scaling_profile: LosslessProfile::Recommended,
        ..Default::default()
    })
}
