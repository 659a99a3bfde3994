//! WebRTC session registry: per-session signaling state, bounded
//! encoded-frame rings fed by the capture pipeline, and the SSE ICE
//! stream. The WebRTC engine itself is an external collaborator; whatever
//! drives it calls [`WebRtcRegistry::set_local_answer`].

pub mod registry;
pub mod sse;

pub use registry::{
    IceCandidate, SessionOptions, SessionSnapshot, WebRtcRegistry, MAX_AUDIO_FRAMES,
    MAX_ICE_CANDIDATES_PER_REQUEST, MAX_VIDEO_FRAMES,
};
pub use sse::ice_event_stream;
