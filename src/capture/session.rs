use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use super::protocol::{ConfigData, FrameReady, SharedHandleData, SECURE_DESKTOP_MSG};
use crate::error::{AppError, Result};
use crate::utils::ipc::{read_frame, write_frame, IpcListener, IpcStream};

/// How long the helper gets to connect both pipes.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// How long the handle handshake may take once connected.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
/// Keyed-mutex acquire budget.
const ACQUIRE_SYNC_TIMEOUT: Duration = Duration::from_secs(3);
/// Quiescent window after a helper stop before re-init may run.
const REINIT_BACKOFF: Duration = Duration::from_millis(200);

/// Result of a keyed-mutex acquire on the shared texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncResult {
    Acquired,
    /// The owning process died holding the mutex
    Abandoned,
    TimedOut,
}

/// The cross-process texture, behind the OS seam. On Windows the real
/// implementation opens the duplicated handle as a D3D11 texture and
/// arbitrates with an `IDXGIKeyedMutex` on key 0.
pub trait SharedTexture: Send + Sync {
    fn acquire_sync(&self, key: u64, timeout: Duration) -> SyncResult;
    fn release_sync(&self, key: u64);
    fn dimensions(&self) -> (u32, u32);
}

/// Opens a helper-provided shared handle in this process.
pub trait TextureOpener: Send + Sync {
    fn open(&self, data: &SharedHandleData) -> Result<Arc<dyn SharedTexture>>;
}

/// Outcome of [`CaptureSession::acquire`].
pub enum Acquire {
    /// A new frame is readable in the shared texture
    Frame {
        texture: Arc<dyn SharedTexture>,
        frame_qpc: u64,
    },
    /// Helper died or state is stale; caller must re-init
    Reinit,
    Timeout,
}

struct Inner {
    initialized: bool,
    helper: Option<tokio::process::Child>,
    helper_pid: Option<u32>,
    frame_ready: Option<IpcStream>,
    texture: Option<Arc<dyn SharedTexture>>,
    last_frame_qpc: u64,
    last_helper_stop: Option<Instant>,
}

/// One capture session against the out-of-process WGC helper.
///
/// Init is single-flight: concurrent callers bounce off the `initializing`
/// CAS and retry after the quiescent window.
pub struct CaptureSession {
    opener: Arc<dyn TextureOpener>,
    /// None skips child spawning (an external helper owns the pipes)
    helper_path: Option<PathBuf>,
    initializing: AtomicBool,
    force_reinit: AtomicBool,
    should_swap_to_dxgi: AtomicBool,
    inner: Mutex<Inner>,
}

impl CaptureSession {
    pub fn new(opener: Arc<dyn TextureOpener>, helper_path: Option<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            opener,
            helper_path,
            initializing: AtomicBool::new(false),
            force_reinit: AtomicBool::new(false),
            should_swap_to_dxgi: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                initialized: false,
                helper: None,
                helper_pid: None,
                frame_ready: None,
                texture: None,
                last_frame_qpc: 0,
                last_helper_stop: None,
            }),
        })
    }

    /// Default helper binary: `tools/wgc-capture` next to the host exe.
    pub fn default_helper_path() -> Option<PathBuf> {
        let exe = std::env::current_exe().ok()?;
        let name = format!("wgc-capture{}", std::env::consts::EXE_SUFFIX);
        Some(exe.parent()?.join("tools").join(name))
    }

    /// WGC failed on the Secure Desktop; the outer capture loop must fall
    /// back to desktop duplication.
    pub fn should_swap_to_dxgi(&self) -> bool {
        self.should_swap_to_dxgi.load(Ordering::SeqCst)
    }

    pub fn needs_reinit(&self) -> bool {
        self.force_reinit.load(Ordering::SeqCst)
    }

    /// Bring up the helper and complete the shared-texture handshake.
    pub async fn init(self: &Arc<Self>, config: &ConfigData) -> Result<()> {
        if self
            .initializing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AppError::Capture("capture init already running".to_string()));
        }

        let result = self.init_inner(config).await;
        self.initializing.store(false, Ordering::SeqCst);

        if result.is_err() {
            self.teardown().await;
        }
        result
    }

    async fn init_inner(self: &Arc<Self>, config: &ConfigData) -> Result<()> {
        {
            let inner = self.inner.lock().await;
            if let Some(stopped) = inner.last_helper_stop {
                if stopped.elapsed() < REINIT_BACKOFF {
                    return Err(AppError::Capture(
                        "capture helper restarting, retry shortly".to_string(),
                    ));
                }
            }
        }

        let control_pipe = format!("wgc-capture-ctl-{}", Uuid::new_v4().simple());
        let frame_pipe = format!("wgc-capture-frm-{}", Uuid::new_v4().simple());
        let mut control_listener = IpcListener::bind(&control_pipe)
            .map_err(|e| AppError::Capture(format!("control pipe bind: {e}")))?;
        let mut frame_listener = IpcListener::bind(&frame_pipe)
            .map_err(|e| AppError::Capture(format!("frame pipe bind: {e}")))?;

        let helper = match &self.helper_path {
            Some(path) => {
                tracing::info!("Starting capture helper: {}", path.display());
                let child = tokio::process::Command::new(path)
                    .arg(&control_pipe)
                    .arg(&frame_pipe)
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| AppError::Capture(format!("capture helper spawn: {e}")))?;
                Some(child)
            }
            None => None,
        };

        let accept_both = async {
            let control = control_listener.accept().await?;
            let frame = frame_listener.accept().await?;
            std::io::Result::Ok((control, frame))
        };
        let (mut control, frame_ready) = tokio::time::timeout(CONNECT_TIMEOUT, accept_both)
            .await
            .map_err(|_| AppError::Capture("capture helper did not connect".to_string()))?
            .map_err(|e| AppError::Capture(format!("capture helper accept: {e}")))?;

        write_frame(&mut control, 0, &config.encode())
            .await
            .map_err(|e| AppError::Capture(format!("config send: {e}")))?;

        // Wait for the shared handle; tolerate secure-desktop notices and
        // ignore anything else
        let handle_data = {
            let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(AppError::Capture(
                        "timed out waiting for shared texture handle".to_string(),
                    ));
                }
                let frame = tokio::time::timeout(remaining, read_frame(&mut control))
                    .await
                    .map_err(|_| {
                        AppError::Capture("timed out waiting for shared texture handle".to_string())
                    })?
                    .map_err(|e| AppError::Capture(format!("control read: {e}")))?;

                match frame.payload.len() {
                    1 if frame.payload[0] == SECURE_DESKTOP_MSG => {
                        self.should_swap_to_dxgi.store(true, Ordering::SeqCst);
                    }
                    super::protocol::SHARED_HANDLE_LEN => {
                        break SharedHandleData::decode(&frame.payload)?;
                    }
                    _ => {}
                }
            }
        };

        let texture = self.opener.open(&handle_data)?;

        {
            let mut inner = self.inner.lock().await;
            inner.helper_pid = helper.as_ref().and_then(|c| c.id());
            inner.helper = helper;
            inner.frame_ready = Some(frame_ready);
            inner.texture = Some(texture);
            inner.initialized = true;
        }
        self.force_reinit.store(false, Ordering::SeqCst);

        // Keep watching the control pipe for secure-desktop transitions
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let mut control = control;
            while let Ok(frame) = read_frame(&mut control).await {
                if frame.payload.len() == 1 && frame.payload[0] == SECURE_DESKTOP_MSG {
                    tracing::info!("Secure Desktop transition, swapping to desktop duplication");
                    session.should_swap_to_dxgi.store(true, Ordering::SeqCst);
                }
            }
        });

        tracing::info!(
            width = handle_data.width,
            height = handle_data.height,
            "Capture session initialized"
        );
        Ok(())
    }

    /// Wait for the next frame and lock the shared texture for reading.
    pub async fn acquire(&self, timeout: Duration) -> Result<Acquire> {
        if self.force_reinit.load(Ordering::SeqCst) {
            return Ok(Acquire::Reinit);
        }

        let mut inner = self.inner.lock().await;
        if !inner.initialized {
            return Ok(Acquire::Reinit);
        }

        let stream = inner
            .frame_ready
            .as_mut()
            .ok_or_else(|| AppError::Capture("frame pipe missing".to_string()))?;

        // Block for one notification, then drain anything newer so we
        // always encode the latest frame
        let mut latest = match tokio::time::timeout(timeout, read_frame(stream)).await {
            Ok(Ok(frame)) => FrameReady::decode(&frame.payload)?,
            Ok(Err(_)) => {
                self.force_reinit.store(true, Ordering::SeqCst);
                return Ok(Acquire::Reinit);
            }
            Err(_) => return Ok(Acquire::Timeout),
        };
        loop {
            match tokio::time::timeout(Duration::from_millis(1), read_frame(stream)).await {
                Ok(Ok(frame)) => latest = FrameReady::decode(&frame.payload)?,
                _ => break,
            }
        }

        let texture = inner.texture.as_ref().unwrap().clone();
        match texture.acquire_sync(0, ACQUIRE_SYNC_TIMEOUT) {
            SyncResult::Acquired => {
                inner.last_frame_qpc = latest.frame_qpc;
                Ok(Acquire::Frame {
                    texture,
                    frame_qpc: latest.frame_qpc,
                })
            }
            SyncResult::Abandoned => {
                // Helper crashed while holding the mutex
                self.force_reinit.store(true, Ordering::SeqCst);
                Ok(Acquire::Reinit)
            }
            SyncResult::TimedOut => Ok(Acquire::Timeout),
        }
    }

    /// Tear the helper down and clear all session state. The next init may
    /// run after the quiescent window.
    pub async fn teardown(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(mut helper) = inner.helper.take() {
            tracing::info!(pid = ?inner.helper_pid, "Stopping capture helper");
            let _ = helper.start_kill();
        }
        inner.helper_pid = None;
        inner.frame_ready = None;
        inner.texture = None;
        inner.initialized = false;
        inner.last_helper_stop = Some(Instant::now());
    }

    pub async fn is_initialized(&self) -> bool {
        self.inner.lock().await.initialized
    }

    pub async fn last_frame_qpc(&self) -> u64 {
        self.inner.lock().await.last_frame_qpc
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    struct FakeTexture {
        results: PlMutex<Vec<SyncResult>>,
        dims: (u32, u32),
    }

    impl SharedTexture for FakeTexture {
        fn acquire_sync(&self, _key: u64, _timeout: Duration) -> SyncResult {
            self.results.lock().pop().unwrap_or(SyncResult::Acquired)
        }
        fn release_sync(&self, _key: u64) {}
        fn dimensions(&self) -> (u32, u32) {
            self.dims
        }
    }

    struct FakeOpener {
        acquire_results: Vec<SyncResult>,
    }

    impl TextureOpener for FakeOpener {
        fn open(&self, data: &SharedHandleData) -> Result<Arc<dyn SharedTexture>> {
            Ok(Arc::new(FakeTexture {
                results: PlMutex::new(self.acquire_results.clone()),
                dims: (data.width, data.height),
            }))
        }
    }

    /// Play the helper role over the session's pipes. Returns the pipe
    /// names to pass to the fake helper task.
    async fn run_fake_helper(control_pipe: String, frame_pipe: String, frames: Vec<FrameReady>) {
        let mut control = IpcStream::connect(&control_pipe).await.unwrap();
        let mut frame_stream = IpcStream::connect(&frame_pipe).await.unwrap();

        // Receive the host config
        let config_frame = read_frame(&mut control).await.unwrap();
        let config = ConfigData::decode(&config_frame.payload).unwrap();
        assert_eq!(config.display_name, "TESTDISP");

        // Reply with the shared handle
        let handle = SharedHandleData {
            handle: 42,
            width: 1920,
            height: 1080,
        };
        write_frame(&mut control, 0, &handle.encode()).await.unwrap();

        for frame in frames {
            write_frame(&mut frame_stream, 0, &frame.encode())
                .await
                .unwrap();
        }
        // Keep pipes open while the host test drains and acquires
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    fn test_config() -> ConfigData {
        ConfigData {
            dynamic_range: 0,
            log_level: 2,
            display_name: "TESTDISP".to_string(),
            adapter_luid: 7,
        }
    }

    /// Init against an in-process fake helper by pre-binding the pipes the
    /// session will generate is impossible (names are random), so the fake
    /// polls the session's listeners via a patched helper path of None and
    /// a wrapper that scrapes the names. Instead we accept on the session
    /// side and drive the fake from the names the session logs; to keep
    /// this deterministic the fake connects by retrying both pipe prefixes.
    /// Tests share the runtime dir, so pipe discovery must not cross over
    /// between concurrently running tests.
    static SERIAL: std::sync::OnceLock<tokio::sync::Mutex<()>> = std::sync::OnceLock::new();

    async fn init_with_fake(
        session: &Arc<CaptureSession>,
        frames: Vec<FrameReady>,
    ) -> Result<()> {
        let _guard = SERIAL
            .get_or_init(|| tokio::sync::Mutex::new(()))
            .lock()
            .await;
        // The session binds pipes with random suffixes; discover them by
        // scanning the runtime dir for our prefixes.
        let spawn_fake = tokio::spawn({
            let frames = frames.clone();
            async move {
                let dir = std::env::var_os("XDG_RUNTIME_DIR")
                    .map(std::path::PathBuf::from)
                    .unwrap_or_else(std::env::temp_dir);
                for _ in 0..100 {
                    let mut ctl = None;
                    let mut frm = None;
                    if let Ok(entries) = std::fs::read_dir(&dir) {
                        for entry in entries.flatten() {
                            let name = entry.file_name().to_string_lossy().into_owned();
                            if name.starts_with("wgc-capture-ctl-") {
                                ctl = Some(name.trim_end_matches(".sock").to_string());
                            } else if name.starts_with("wgc-capture-frm-") {
                                frm = Some(name.trim_end_matches(".sock").to_string());
                            }
                        }
                    }
                    if let (Some(ctl), Some(frm)) = (ctl, frm) {
                        run_fake_helper(ctl, frm, frames).await;
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                panic!("fake helper never found the pipes");
            }
        });

        // The fake keeps the pipes open in the background; init returning
        // means the handshake is complete.
        let result = session.init(&test_config()).await;
        if result.is_err() {
            spawn_fake.abort();
        }
        result
    }

    #[tokio::test]
    async fn handshake_and_frame_acquire() {
        let opener = Arc::new(FakeOpener {
            acquire_results: vec![],
        });
        let session = CaptureSession::new(opener, None);

        init_with_fake(
            &session,
            vec![
                FrameReady { kind: 0, frame_qpc: 100 },
                FrameReady { kind: 0, frame_qpc: 200 },
            ],
        )
        .await
        .unwrap();
        assert!(session.is_initialized().await);

        // Both notifications were queued; acquire drains to the latest
        match session.acquire(Duration::from_secs(1)).await.unwrap() {
            Acquire::Frame { frame_qpc, texture } => {
                assert_eq!(frame_qpc, 200);
                assert_eq!(texture.dimensions(), (1920, 1080));
            }
            _ => panic!("expected a frame"),
        }
        assert_eq!(session.last_frame_qpc().await, 200);

        session.teardown().await;
        assert!(!session.is_initialized().await);
    }

    #[tokio::test]
    async fn abandoned_mutex_requests_reinit() {
        let opener = Arc::new(FakeOpener {
            acquire_results: vec![SyncResult::Abandoned],
        });
        let session = CaptureSession::new(opener, None);
        init_with_fake(&session, vec![FrameReady { kind: 0, frame_qpc: 1 }])
            .await
            .unwrap();

        match session.acquire(Duration::from_secs(1)).await.unwrap() {
            Acquire::Reinit => {}
            _ => panic!("expected reinit"),
        }
        assert!(session.needs_reinit());
    }

    #[tokio::test]
    async fn acquire_times_out_without_frames() {
        let opener = Arc::new(FakeOpener {
            acquire_results: vec![],
        });
        let session = CaptureSession::new(opener, None);
        init_with_fake(&session, vec![]).await.unwrap();

        match session.acquire(Duration::from_millis(100)).await.unwrap() {
            Acquire::Timeout => {}
            _ => panic!("expected timeout"),
        }
    }

    #[tokio::test]
    async fn reinit_respects_quiescent_window() {
        let opener = Arc::new(FakeOpener {
            acquire_results: vec![],
        });
        let session = CaptureSession::new(opener, None);
        session.teardown().await;

        // Immediately after a stop the init is refused
        let err = session.init(&test_config()).await.unwrap_err();
        assert!(err.to_string().contains("retry shortly"));
    }
}
