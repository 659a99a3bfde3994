use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::terminate::{collect_process_group, graceful_then_forceful};
use super::expand_env_vars;
use crate::apps::{AppDef, AppsStore, PrepCmd};
use crate::config::ConfigStore;
use crate::error::{AppError, Result};
use crate::session::LaunchSession;

/// A clean exit inside this window with `auto_detach` flips the app to
/// placebo instead of ending the stream.
const AUTO_DETACH_WINDOW: Duration = Duration::from_secs(5);

/// Hook the Playnite integration installs so terminate can ask the plugin
/// to stop the game before escalating on the process group.
pub type PlayniteStopHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Supervisor lifecycle as observed between ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    /// Tracking a live child (or the Playnite launcher)
    Running,
    /// Nothing tracked; the app lives as long as the stream does
    Placebo,
}

struct RunningApp {
    app: AppDef,
    child: Option<Child>,
    child_pid: Option<u32>,
    /// Prep commands that actually ran, for reverse-order undo
    started_prep: Vec<PrepCmd>,
    env: BTreeMap<String, String>,
    launched_at: Instant,
    placebo: bool,
}

/// The app supervisor. One app runs at a time; `execute` and `terminate`
/// serialize on the internal mutex.
pub struct AppSupervisor {
    config: ConfigStore,
    apps: AppsStore,
    current: Mutex<Option<RunningApp>>,
    playnite_stop: parking_lot::Mutex<Option<PlayniteStopHook>>,
    launcher_path: PathBuf,
}

impl AppSupervisor {
    pub fn new(config: ConfigStore, apps: AppsStore) -> Arc<Self> {
        Arc::new(Self {
            config,
            apps,
            current: Mutex::new(None),
            playnite_stop: parking_lot::Mutex::new(None),
            launcher_path: default_launcher_path(),
        })
    }

    pub fn set_playnite_stop_hook(&self, hook: PlayniteStopHook) {
        *self.playnite_stop.lock() = Some(hook);
    }

    pub fn apps(&self) -> &AppsStore {
        &self.apps
    }

    /// Launch an app for a session. Any previously running app is torn down
    /// first (single active app).
    pub async fn execute(&self, app_uuid: &str, launch: &LaunchSession) -> Result<AppDef> {
        let app = self
            .apps
            .find_by_uuid(app_uuid)
            .await
            .ok_or_else(|| AppError::NotFound("Cannot find requested application".to_string()))?;

        let mut slot = self.current.lock().await;
        if slot.is_some() {
            tracing::info!("Terminating previous app before launch");
            self.teardown(&mut slot).await;
        }

        let env = self.build_env(&app, launch).await;

        // Prep commands run sequentially; a failure unwinds what ran
        let mut started_prep = Vec::new();
        if let Err(e) = self.run_prep(&app, &env, &mut started_prep).await {
            self.run_undo(&started_prep, &env).await;
            return Err(e);
        }

        let proc_cfg = self.config.get().proc();
        let playnite_cfg = self.config.get().playnite();
        let exit_timeout = app.effective_exit_timeout(proc_cfg.exit_timeout_secs);

        // Launch paths, in precedence order
        let (child, placebo) = if app.is_playnite_backed() {
            let child = self
                .spawn_playnite_launcher(&app, &env, exit_timeout, &playnite_cfg, false)
                .await?;
            (Some(child), false)
        } else if app.playnite_fullscreen && app.cmd.is_empty() {
            let child = self
                .spawn_playnite_launcher(&app, &env, exit_timeout, &playnite_cfg, true)
                .await?;
            (Some(child), false)
        } else if app.cmd.is_empty() {
            tracing::info!("Launching desktop session (placebo)");
            (None, true)
        } else {
            let child = self.spawn_app_command(&app, &env).await?;
            for detached in &app.detached {
                let detached = expand_env_vars(detached, &env);
                if let Err(e) = self.spawn_detached(&detached, &app.working_dir, &env) {
                    tracing::warn!("Failed to start detached command \"{}\": {}", detached, e);
                }
            }
            (Some(child), false)
        };

        let child_pid = child.as_ref().and_then(|c| c.id());
        *slot = Some(RunningApp {
            app: app.clone(),
            child,
            child_pid,
            started_prep,
            env,
            launched_at: Instant::now(),
            placebo,
        });

        tracing::info!(app = %app.name, pid = ?child_pid, "App launched");
        Ok(app)
    }

    /// Periodic liveness check driven at the session tick cadence.
    pub async fn tick(&self) -> RunState {
        let mut slot = self.current.lock().await;
        let Some(running) = slot.as_mut() else {
            return RunState::Idle;
        };
        if running.placebo {
            return RunState::Placebo;
        }

        let exited = match running.child.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(Some(status)) => Some(status),
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!("Child wait failed: {}", e);
                    None
                }
            },
            None => None,
        };

        if let Some(status) = exited {
            let within_window = running.launched_at.elapsed() <= AUTO_DETACH_WINDOW;
            if running.app.auto_detach && status.success() && within_window {
                // Launcher-style command exited cleanly right away; the real
                // game carries on somewhere in the session
                tracing::info!(app = %running.app.name, "Auto-detach: treating app as placebo");
                running.child = None;
                running.child_pid = None;
                running.placebo = true;
                return RunState::Placebo;
            }

            if running.app.wait_all {
                if let Some(root) = running.child_pid {
                    let group = collect_process_group(root);
                    if group.len() > 1 {
                        // Descendants still running count as the app
                        return RunState::Running;
                    }
                }
            }

            tracing::info!(app = %running.app.name, status = ?status.code(), "App exited");
            self.teardown(&mut slot).await;
            return RunState::Idle;
        }

        RunState::Running
    }

    pub async fn running_app(&self) -> Option<AppDef> {
        self.current.lock().await.as_ref().map(|r| r.app.clone())
    }

    /// Terminate the running app with graceful → forceful escalation, then
    /// unwind prep commands.
    pub async fn terminate(&self) -> Result<()> {
        let mut slot = self.current.lock().await;
        self.teardown(&mut slot).await;
        Ok(())
    }

    async fn teardown(&self, slot: &mut Option<RunningApp>) {
        let Some(mut running) = slot.take() else {
            return;
        };

        let proc_cfg = self.config.get().proc();
        let exit_timeout = Duration::from_secs(
            running
                .app
                .effective_exit_timeout(proc_cfg.exit_timeout_secs) as u64,
        );

        if running.app.is_playnite_backed() {
            // Ask Playnite first; the launcher exits on gameStopped
            if let Some(hook) = self.playnite_stop.lock().clone() {
                hook(&running.app.playnite_id);
            }
        }

        if let Some(root) = running.child_pid {
            let group = collect_process_group(root);
            let clean = graceful_then_forceful(&group, exit_timeout).await;
            if !clean {
                tracing::warn!(app = %running.app.name, "Process group survived the kill");
            }
        }
        // Reap whatever we still own
        if let Some(mut child) = running.child.take() {
            let _ = child.try_wait();
        }

        self.run_undo(&running.started_prep, &running.env).await;
        tracing::info!(app = %running.app.name, "App torn down");
    }

    async fn build_env(&self, app: &AppDef, launch: &LaunchSession) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = std::env::vars().collect();
        let file = self.apps.snapshot().await;
        for (k, v) in &file.env {
            env.insert(k.clone(), expand_env_vars(v, &env));
        }

        env.insert("SUNSHINE_APP_ID".to_string(), app.id.to_string());
        env.insert("SUNSHINE_APP_NAME".to_string(), app.name.clone());
        env.insert(
            "SUNSHINE_CLIENT_NAME".to_string(),
            launch.device_name.clone(),
        );
        env.insert(
            "SUNSHINE_CLIENT_WIDTH".to_string(),
            launch.width.to_string(),
        );
        env.insert(
            "SUNSHINE_CLIENT_HEIGHT".to_string(),
            launch.height.to_string(),
        );
        env.insert("SUNSHINE_CLIENT_FPS".to_string(), launch.fps.to_string());
        env.insert(
            "SUNSHINE_CLIENT_HDR".to_string(),
            if launch.enable_hdr { "true" } else { "false" }.to_string(),
        );

        if app.lossless_scaling_framegen {
            env.insert(
                "SUNSHINE_LOSSLESS_SCALING_FRAMEGEN".to_string(),
                "true".to_string(),
            );
            if let Some(fps) = app.lossless_scaling_target_fps {
                env.insert(
                    "SUNSHINE_LOSSLESS_SCALING_TARGET_FPS".to_string(),
                    fps.to_string(),
                );
            }
            env.insert(
                "SUNSHINE_LOSSLESS_SCALING_RTSS_LIMIT".to_string(),
                if app.lossless_scaling_rtss_limit {
                    "true"
                } else {
                    "false"
                }
                .to_string(),
            );
        }
        env.insert(
            "SUNSHINE_FRAME_GENERATION_PROVIDER".to_string(),
            serde_json::to_value(app.frame_generation_provider)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default(),
        );

        env
    }

    async fn run_prep(
        &self,
        app: &AppDef,
        env: &BTreeMap<String, String>,
        started: &mut Vec<PrepCmd>,
    ) -> Result<()> {
        let proc_cfg = self.config.get().proc();

        if !app.exclude_global_prep_cmd {
            for cmd in &proc_cfg.global_prep_cmd {
                let prep = PrepCmd {
                    r#do: cmd.r#do.clone(),
                    undo: cmd.undo.clone(),
                    elevated: cmd.elevated,
                };
                self.run_one_prep(app, &prep, env, started).await?;
            }
        }
        for prep in &app.prep_cmd {
            self.run_one_prep(app, prep, env, started).await?;
        }
        Ok(())
    }

    async fn run_one_prep(
        &self,
        app: &AppDef,
        prep: &PrepCmd,
        env: &BTreeMap<String, String>,
        started: &mut Vec<PrepCmd>,
    ) -> Result<()> {
        started.push(prep.clone());
        if prep.r#do.is_empty() {
            return Ok(());
        }

        let cmd = expand_env_vars(&prep.r#do, env);
        tracing::info!("Running prep command: {}", cmd);
        match run_shell(&cmd, &app.working_dir, env).await {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(AppError::Process(format!(
                "prep command \"{}\" exited with {:?}",
                cmd,
                status.code()
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied && app.is_placebo() => {
                // The desktop entry tolerates hooks it cannot run
                tracing::warn!("Prep command \"{}\" denied, continuing: {}", cmd, e);
                Ok(())
            }
            Err(e) => Err(AppError::Process(format!(
                "prep command \"{}\" failed: {}",
                cmd, e
            ))),
        }
    }

    async fn run_undo(&self, started: &[PrepCmd], env: &BTreeMap<String, String>) {
        for prep in started.iter().rev() {
            if prep.undo.is_empty() {
                continue;
            }
            let cmd = expand_env_vars(&prep.undo, env);
            tracing::info!("Running undo command: {}", cmd);
            match run_shell(&cmd, "", env).await {
                Ok(status) if !status.success() => {
                    tracing::warn!("Undo command \"{}\" exited with {:?}", cmd, status.code());
                }
                Err(e) => tracing::warn!("Undo command \"{}\" failed: {}", cmd, e),
                _ => {}
            }
        }
    }

    async fn spawn_app_command(
        &self,
        app: &AppDef,
        env: &BTreeMap<String, String>,
    ) -> Result<Child> {
        let cmd = expand_env_vars(&app.cmd, env);
        tracing::info!("Launching: {}", cmd);

        let mut command = shell_command(&cmd);
        command.env_clear().envs(env).kill_on_drop(false);
        if !app.working_dir.is_empty() {
            command.current_dir(expand_env_vars(&app.working_dir, env));
        }
        if app.elevated {
            tracing::warn!("Elevated launch requested; running with current privileges");
        }

        if app.output.is_empty() {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        } else {
            let path = expand_env_vars(&app.output, env);
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| AppError::Process(format!("cannot open output log {path}: {e}")))?;
            let err = file
                .try_clone()
                .map_err(|e| AppError::Process(format!("cannot clone output log: {e}")))?;
            command.stdout(Stdio::from(file)).stderr(Stdio::from(err));
        }

        command
            .spawn()
            .map_err(|e| AppError::Process(format!("failed to launch \"{}\": {}", cmd, e)))
    }

    fn spawn_detached(
        &self,
        cmd: &str,
        working_dir: &str,
        env: &BTreeMap<String, String>,
    ) -> std::io::Result<()> {
        let mut command = shell_command(cmd);
        command
            .env_clear()
            .envs(env)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false);
        if !working_dir.is_empty() {
            command.current_dir(working_dir);
        }
        command.spawn().map(|_| ())
    }

    async fn spawn_playnite_launcher(
        &self,
        app: &AppDef,
        env: &BTreeMap<String, String>,
        exit_timeout: u32,
        playnite_cfg: &crate::config::PlayniteConfig,
        fullscreen: bool,
    ) -> Result<Child> {
        let mut command = Command::new(&self.launcher_path);
        command.env_clear().envs(env).kill_on_drop(false);

        if fullscreen {
            command.arg("--fullscreen");
        } else {
            command.args(["--game-id", &app.playnite_id]);
        }
        command.args(["--exit-timeout", &exit_timeout.to_string()]);
        command.args(["--focus-attempts", &playnite_cfg.focus_attempts.to_string()]);
        command.args([
            "--focus-timeout",
            &playnite_cfg.focus_timeout_secs.to_string(),
        ]);
        if !app.working_dir.is_empty() {
            command.args(["--install-dir", &app.working_dir]);
        }

        tracing::info!(game_id = %app.playnite_id, fullscreen, "Spawning Playnite launcher");
        command.spawn().map_err(|e| {
            AppError::Process(format!(
                "failed to start Playnite launcher {}: {}",
                self.launcher_path.display(),
                e
            ))
        })
    }
}

/// Run a command line through the platform shell and wait for it.
async fn run_shell(
    cmd: &str,
    working_dir: &str,
    env: &BTreeMap<String, String>,
) -> std::io::Result<std::process::ExitStatus> {
    let mut command = shell_command(cmd);
    command
        .env_clear()
        .envs(env)
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if !working_dir.is_empty() {
        command.current_dir(working_dir);
    }
    command.status().await
}

fn shell_command(cmd: &str) -> Command {
    #[cfg(windows)]
    {
        let mut command = Command::new("cmd");
        command.args(["/C", cmd]);
        command
    }
    #[cfg(unix)]
    {
        let mut command = Command::new("sh");
        command.args(["-c", cmd]);
        command
    }
}

fn default_launcher_path() -> PathBuf {
    let name = format!("playnite-launcher{}", std::env::consts::EXE_SUFFIX);
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("tools").join(&name)))
        .unwrap_or_else(|| PathBuf::from(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;
    use tempfile::tempdir;

    async fn supervisor(dir: &std::path::Path) -> Arc<AppSupervisor> {
        let config = ConfigStore::load(&dir.join("vibeshine.conf")).await.unwrap();
        let apps = AppsStore::load(&dir.join("apps.json")).await.unwrap();
        AppSupervisor::new(config, apps)
    }

    #[tokio::test]
    async fn unknown_uuid_fails_without_spawning() {
        let dir = tempdir().unwrap();
        let sup = supervisor(dir.path()).await;
        let err = sup
            .execute("nonexistent", &LaunchSession::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Cannot find requested application"));
        assert_eq!(sup.tick().await, RunState::Idle);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn empty_cmd_runs_as_placebo() {
        let dir = tempdir().unwrap();
        let sup = supervisor(dir.path()).await;
        let desktop = sup.apps().snapshot().await.apps[0].clone();

        sup.execute(&desktop.uuid, &LaunchSession::default())
            .await
            .unwrap();
        assert_eq!(sup.tick().await, RunState::Placebo);
        sup.terminate().await.unwrap();
        assert_eq!(sup.tick().await, RunState::Idle);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn prep_failure_aborts_and_unwinds() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("undone");
        let sup = supervisor(dir.path()).await;

        let mut app = AppDef {
            name: "Broken".to_string(),
            cmd: "sleep 30".to_string(),
            ..Default::default()
        };
        app.prep_cmd = vec![
            PrepCmd {
                r#do: "true".to_string(),
                undo: format!("touch {}", marker.display()),
                elevated: false,
            },
            PrepCmd {
                r#do: "false".to_string(),
                undo: String::new(),
                elevated: false,
            },
        ];
        let app = sup.apps().upsert(app).await.unwrap();

        assert!(sup
            .execute(&app.uuid, &LaunchSession::default())
            .await
            .is_err());
        // The first prep's undo ran during unwind
        assert!(marker.exists());
        assert_eq!(sup.tick().await, RunState::Idle);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launch_track_and_terminate() {
        let dir = tempdir().unwrap();
        let sup = supervisor(dir.path()).await;

        let app = sup
            .apps()
            .upsert(AppDef {
                name: "Sleeper".to_string(),
                cmd: "sleep 30".to_string(),
                exit_timeout: Some(3),
                ..Default::default()
            })
            .await
            .unwrap();

        sup.execute(&app.uuid, &LaunchSession::default())
            .await
            .unwrap();
        assert_eq!(sup.tick().await, RunState::Running);

        sup.terminate().await.unwrap();
        assert_eq!(sup.tick().await, RunState::Idle);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn clean_fast_exit_with_auto_detach_becomes_placebo() {
        let dir = tempdir().unwrap();
        let sup = supervisor(dir.path()).await;

        let app = sup
            .apps()
            .upsert(AppDef {
                name: "Launcher".to_string(),
                cmd: "true".to_string(),
                auto_detach: true,
                ..Default::default()
            })
            .await
            .unwrap();

        sup.execute(&app.uuid, &LaunchSession::default())
            .await
            .unwrap();
        // Give the child a moment to exit
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sup.tick().await, RunState::Placebo);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn env_reaches_the_child() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("envdump");
        let sup = supervisor(dir.path()).await;

        let app = sup
            .apps()
            .upsert(AppDef {
                name: "EnvCheck".to_string(),
                cmd: format!("sh -c 'echo $SUNSHINE_APP_NAME > {}'", out.display()),
                ..Default::default()
            })
            .await
            .unwrap();

        sup.execute(&app.uuid, &LaunchSession::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let dumped = std::fs::read_to_string(&out).unwrap();
        assert_eq!(dumped.trim(), "EnvCheck");
        sup.terminate().await.unwrap();
    }
}
