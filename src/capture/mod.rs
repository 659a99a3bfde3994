//! Per-session capture → encode pipeline: the out-of-process capture
//! helper, the shared-texture handoff, encoder selection, and the packet
//! path that feeds both the stream transport and the WebRTC fan-out.

pub mod encoder;
pub mod protocol;
pub mod session;

pub use encoder::{
    select_encoder, AudioPacket, ByteReplacement, Encoder, EncoderKind, VideoPacket,
};
pub use protocol::{ConfigData, FrameReady, SharedHandleData, SECURE_DESKTOP_MSG};
pub use session::{Acquire, CaptureSession, SharedTexture, SyncResult, TextureOpener};
