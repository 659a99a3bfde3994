use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::Mutex;

use super::parser::DisplayConfig;
use crate::error::{AppError, Result};
use crate::utils::ipc::{write_frame, IpcStream};

/// Pipe the display-settings helper listens on.
pub const DISPLAY_HELPER_PIPE: &str = "sunshine_display_helper";

/// Write deadline for helper requests. Apply/Revert are fire-and-forget at
/// the transport level; the helper applies synchronously on the OS side.
const WRITE_DEADLINE: Duration = Duration::from_secs(5);

/// How long to wait for a freshly spawned helper to come up.
const SPAWN_CONNECT_DEADLINE: Duration = Duration::from_secs(5);

/// Requests understood by the helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperMessage {
    Apply(String),
    Revert,
    /// Clear helper persistence/state
    Reset,
    /// Write the current OS display topology as the golden restore snapshot
    ExportGolden,
    /// Health check; expects a response
    Ping,
    /// Ask the helper process to exit gracefully
    Stop,
}

impl HelperMessage {
    pub fn kind(&self) -> u8 {
        match self {
            HelperMessage::Apply(_) => 1,
            HelperMessage::Revert => 2,
            HelperMessage::Reset => 3,
            HelperMessage::ExportGolden => 4,
            HelperMessage::Ping => 0xFE,
            HelperMessage::Stop => 0xFF,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            HelperMessage::Apply(json) => json.as_bytes(),
            _ => &[],
        }
    }
}

/// Client side of the display helper. The helper owns the OS display APIs
/// and is the only writer of display state; everyone funnels through here.
pub struct DisplayHelperClient {
    pipe_name: String,
    helper_path: Option<PathBuf>,
    conn: Mutex<Option<IpcStream>>,
    child: Mutex<Option<tokio::process::Child>>,
}

impl DisplayHelperClient {
    pub fn new() -> Self {
        Self {
            pipe_name: DISPLAY_HELPER_PIPE.to_string(),
            helper_path: default_helper_path(),
            conn: Mutex::new(None),
            child: Mutex::new(None),
        }
    }

    /// Test/diagnostic constructor: custom pipe, no child spawning.
    pub fn with_pipe_name(pipe_name: &str) -> Self {
        Self {
            pipe_name: pipe_name.to_string(),
            helper_path: None,
            conn: Mutex::new(None),
            child: Mutex::new(None),
        }
    }

    /// Send an Apply for the given configuration.
    pub async fn apply(&self, config: &DisplayConfig) -> Result<()> {
        let json = serde_json::to_string(config)?;
        self.send(HelperMessage::Apply(json)).await
    }

    pub async fn revert(&self) -> Result<()> {
        self.send(HelperMessage::Revert).await
    }

    pub async fn reset_persistence(&self) -> Result<()> {
        self.send(HelperMessage::Reset).await
    }

    /// Ask the helper to snapshot the current display topology as the
    /// golden restore target.
    pub async fn export_golden(&self) -> Result<()> {
        self.send(HelperMessage::ExportGolden).await
    }

    pub async fn send(&self, msg: HelperMessage) -> Result<()> {
        let mut conn = self.conn.lock().await;
        if conn.is_none() {
            *conn = Some(self.connect().await?);
        }

        let stream = conn.as_mut().unwrap();
        let write = write_frame(stream, msg.kind(), msg.payload());
        match tokio::time::timeout(WRITE_DEADLINE, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                // Broken pipe: drop the connection so the next call redials
                *conn = None;
                Err(AppError::Ipc(format!("display helper write failed: {e}")))
            }
            Err(_) => {
                *conn = None;
                Err(AppError::Ipc("display helper write timed out".to_string()))
            }
        }
    }

    async fn connect(&self) -> Result<IpcStream> {
        if let Ok(stream) = IpcStream::connect(&self.pipe_name).await {
            return Ok(stream);
        }

        // Helper not running yet; start it and poll for the pipe
        self.spawn_helper().await?;
        let deadline = tokio::time::Instant::now() + SPAWN_CONNECT_DEADLINE;
        loop {
            match IpcStream::connect(&self.pipe_name).await {
                Ok(stream) => return Ok(stream),
                Err(e) if tokio::time::Instant::now() >= deadline => {
                    return Err(AppError::Ipc(format!(
                        "display helper did not come up: {e}"
                    )));
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
            }
        }
    }

    async fn spawn_helper(&self) -> Result<()> {
        let Some(path) = &self.helper_path else {
            return Err(AppError::Ipc("display helper is not running".to_string()));
        };

        let mut child_slot = self.child.lock().await;
        if let Some(child) = child_slot.as_mut() {
            if child.try_wait()?.is_none() {
                // Still alive, just not accepting yet
                return Ok(());
            }
        }

        tracing::info!("Starting display helper: {}", path.display());
        let child = tokio::process::Command::new(path)
            .spawn()
            .map_err(|e| AppError::Ipc(format!("failed to start display helper: {e}")))?;
        *child_slot = Some(child);
        Ok(())
    }
}

impl Default for DisplayHelperClient {
    fn default() -> Self {
        Self::new()
    }
}

fn default_helper_path() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let dir = exe.parent()?;
    let name = format!("display-settings-helper{}", std::env::consts::EXE_SUFFIX);
    Some(dir.join("tools").join(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ipc::{read_frame, IpcListener};

    #[test]
    fn message_kinds_are_stable() {
        assert_eq!(HelperMessage::Apply(String::new()).kind(), 1);
        assert_eq!(HelperMessage::Revert.kind(), 2);
        assert_eq!(HelperMessage::Reset.kind(), 3);
        assert_eq!(HelperMessage::ExportGolden.kind(), 4);
        assert_eq!(HelperMessage::Ping.kind(), 0xFE);
        assert_eq!(HelperMessage::Stop.kind(), 0xFF);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn apply_sends_framed_json() {
        let pipe = format!("display-helper-test-{}", std::process::id());
        let mut listener = IpcListener::bind(&pipe).unwrap();

        let client = DisplayHelperClient::with_pipe_name(&pipe);
        let send = tokio::spawn(async move {
            let config = DisplayConfig {
                device_id: "dev-1".to_string(),
                device_prep: "ensure_active".to_string(),
                resolution: Some((1920, 1080)),
                ..Default::default()
            };
            client.apply(&config).await.unwrap();
            client.revert().await.unwrap();
            client.export_golden().await.unwrap();
        });

        let mut stream = listener.accept().await.unwrap();
        let apply = read_frame(&mut stream).await.unwrap();
        assert_eq!(apply.kind, 1);
        let json: serde_json::Value = serde_json::from_slice(&apply.payload).unwrap();
        assert_eq!(json["device_id"], "dev-1");
        assert_eq!(json["resolution"][0], 1920);

        let revert = read_frame(&mut stream).await.unwrap();
        assert_eq!(revert.kind, 2);
        assert!(revert.payload.is_empty());

        let export = read_frame(&mut stream).await.unwrap();
        assert_eq!(export.kind, 4);
        assert!(export.payload.is_empty());

        send.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn send_fails_cleanly_when_helper_missing() {
        let client = DisplayHelperClient::with_pipe_name("no-such-helper-pipe");
        assert!(client.send(HelperMessage::Ping).await.is_err());
    }
}
