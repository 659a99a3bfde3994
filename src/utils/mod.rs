//! Utility modules shared across the codebase.

pub mod fs;
pub mod ipc;

pub use fs::atomic_replace;
pub use ipc::{FrameCodec, IpcFrame, IpcListener, IpcStream};
