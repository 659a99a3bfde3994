use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::capture::{AudioPacket, VideoPacket};
use crate::error::{AppError, Result};

/// Bounded ring sizes; oldest dropped on overflow.
pub const MAX_VIDEO_FRAMES: usize = 2;
pub const MAX_AUDIO_FRAMES: usize = 8;
/// Cap on ICE candidates accepted per request.
pub const MAX_ICE_CANDIDATES_PER_REQUEST: usize = 256;

/// ICE servers handed to clients on session creation.
pub const ICE_SERVERS_ENV: &str = "SUNSHINE_WEBRTC_ICE_SERVERS";

/// Client-supplied session options, validated before a session is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    pub audio: bool,
    pub video: bool,
    pub encoded: bool,
    pub codec: String,
    pub audio_codec: String,
    pub audio_channels: u32,
    pub video_pacing_mode: String,
    pub video_pacing_slack_ms: u32,
    pub video_max_frame_age_ms: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            encoded: true,
            codec: "h264".to_string(),
            audio_codec: "opus".to_string(),
            audio_channels: 2,
            video_pacing_mode: "latency".to_string(),
            video_pacing_slack_ms: 0,
            video_max_frame_age_ms: 50,
        }
    }
}

impl SessionOptions {
    /// Normalize aliases and enforce the option ranges.
    pub fn validate(mut self) -> Result<Self> {
        if !matches!(self.codec.as_str(), "h264" | "hevc" | "av1") {
            return Err(AppError::BadRequest(format!(
                "invalid codec \"{}\"",
                self.codec
            )));
        }
        if !matches!(self.audio_codec.as_str(), "opus" | "aac") {
            return Err(AppError::BadRequest(format!(
                "invalid audio codec \"{}\"",
                self.audio_codec
            )));
        }
        if !matches!(self.audio_channels, 2 | 6 | 8) {
            return Err(AppError::BadRequest(format!(
                "invalid audio channel count {}",
                self.audio_channels
            )));
        }
        if self.video_pacing_mode == "smooth" {
            self.video_pacing_mode = "smoothness".to_string();
        }
        if !matches!(
            self.video_pacing_mode.as_str(),
            "latency" | "balanced" | "smoothness"
        ) {
            return Err(AppError::BadRequest(format!(
                "invalid video pacing mode \"{}\"",
                self.video_pacing_mode
            )));
        }
        if self.video_pacing_slack_ms > 10 {
            return Err(AppError::BadRequest(
                "video pacing slack must be 0..=10 ms".to_string(),
            ));
        }
        if !(5..=250).contains(&self.video_max_frame_age_ms) {
            return Err(AppError::BadRequest(
                "video max frame age must be 5..=250 ms".to_string(),
            ));
        }
        Ok(self)
    }
}

/// One local ICE candidate with its monotonic per-session index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidate {
    pub index: u64,
    pub mid: String,
    pub mline_index: u32,
    pub candidate: String,
}

/// Serializable view of a session for the API.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub audio: bool,
    pub video: bool,
    pub encoded: bool,
    pub audio_packets: u64,
    pub video_packets: u64,
    pub audio_dropped: u64,
    pub video_dropped: u64,
    pub has_remote_offer: bool,
    pub candidate_count: usize,
}

struct Session {
    options: SessionOptions,
    video_ring: VecDeque<Bytes>,
    audio_ring: VecDeque<Bytes>,
    video_packets: u64,
    audio_packets: u64,
    video_dropped: u64,
    audio_dropped: u64,
    remote_offer: Option<(String, String)>,
    local_answer_tx: watch::Sender<Option<String>>,
    candidates: Vec<IceCandidate>,
    next_candidate_index: u64,
}

impl Session {
    fn new(options: SessionOptions) -> Self {
        let (local_answer_tx, _) = watch::channel(None);
        Self {
            options,
            video_ring: VecDeque::with_capacity(MAX_VIDEO_FRAMES),
            audio_ring: VecDeque::with_capacity(MAX_AUDIO_FRAMES),
            video_packets: 0,
            audio_packets: 0,
            video_dropped: 0,
            audio_dropped: 0,
            remote_offer: None,
            local_answer_tx,
            candidates: Vec::new(),
            next_candidate_index: 0,
        }
    }

    fn snapshot(&self, id: &str) -> SessionSnapshot {
        SessionSnapshot {
            id: id.to_string(),
            audio: self.options.audio,
            video: self.options.video,
            encoded: self.options.encoded,
            audio_packets: self.audio_packets,
            video_packets: self.video_packets,
            audio_dropped: self.audio_dropped,
            video_dropped: self.video_dropped,
            has_remote_offer: self.remote_offer.is_some(),
            candidate_count: self.candidates.len(),
        }
    }
}

/// The session map. A single mutex guards it; the hot encode path
/// double-checks the atomic session count before touching the lock.
pub struct WebRtcRegistry {
    sessions: Mutex<HashMap<String, Session>>,
    active_sessions: AtomicUsize,
}

impl WebRtcRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            active_sessions: AtomicUsize::new(0),
        })
    }

    pub fn create_session(&self, options: SessionOptions) -> Result<SessionSnapshot> {
        let options = options.validate()?;
        let id = Uuid::new_v4().to_string();
        let session = Session::new(options);
        let snapshot = session.snapshot(&id);

        self.sessions.lock().insert(id, session);
        self.active_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(snapshot)
    }

    pub fn close_session(&self, id: &str) -> bool {
        let removed = self.sessions.lock().remove(id).is_some();
        if removed {
            self.active_sessions.fetch_sub(1, Ordering::SeqCst);
        }
        removed
    }

    pub fn list_sessions(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .lock()
            .iter()
            .map(|(id, s)| s.snapshot(id))
            .collect()
    }

    pub fn session(&self, id: &str) -> Option<SessionSnapshot> {
        self.sessions.lock().get(id).map(|s| s.snapshot(id))
    }

    pub fn set_remote_offer(&self, id: &str, sdp: String, sdp_type: String) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("session {id}")))?;
        session.remote_offer = Some((sdp, sdp_type));
        Ok(())
    }

    pub fn remote_offer(&self, id: &str) -> Option<(String, String)> {
        self.sessions.lock().get(id).and_then(|s| s.remote_offer.clone())
    }

    /// Entry point for the engine glue once it has produced an answer SDP.
    pub fn set_local_answer(&self, id: &str, sdp: String) -> Result<()> {
        let sessions = self.sessions.lock();
        let session = sessions
            .get(id)
            .ok_or_else(|| AppError::NotFound(format!("session {id}")))?;
        let _ = session.local_answer_tx.send(Some(sdp));
        Ok(())
    }

    /// Block until the local answer SDP appears or the timeout elapses.
    pub async fn wait_for_local_answer(&self, id: &str, timeout: Duration) -> Result<String> {
        let mut rx = {
            let sessions = self.sessions.lock();
            let session = sessions
                .get(id)
                .ok_or_else(|| AppError::NotFound(format!("session {id}")))?;
            session.local_answer_tx.subscribe()
        };

        let wait = async {
            loop {
                if let Some(sdp) = rx.borrow().clone() {
                    return Ok(sdp);
                }
                if rx.changed().await.is_err() {
                    return Err(AppError::WebRtc("session closed".to_string()));
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| AppError::WebRtc("timed out waiting for local answer".to_string()))?
    }

    /// Append locally gathered candidates, assigning monotonic indices.
    pub fn add_ice_candidates(
        &self,
        id: &str,
        candidates: Vec<(String, u32, String)>,
    ) -> Result<usize> {
        if candidates.len() > MAX_ICE_CANDIDATES_PER_REQUEST {
            return Err(AppError::BadRequest(format!(
                "too many candidates in one request (cap {MAX_ICE_CANDIDATES_PER_REQUEST})"
            )));
        }

        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("session {id}")))?;

        for (mid, mline_index, candidate) in candidates {
            session.next_candidate_index += 1;
            session.candidates.push(IceCandidate {
                index: session.next_candidate_index,
                mid,
                mline_index,
                candidate,
            });
        }
        Ok(session.candidates.len())
    }

    /// Candidates with `index > since`, in index order.
    pub fn local_candidates_since(&self, id: &str, since: u64) -> Result<Vec<IceCandidate>> {
        let sessions = self.sessions.lock();
        let session = sessions
            .get(id)
            .ok_or_else(|| AppError::NotFound(format!("session {id}")))?;
        Ok(session
            .candidates
            .iter()
            .filter(|c| c.index > since)
            .cloned()
            .collect())
    }

    /// Fan one encoded video packet out to every video-enabled session.
    /// Called from the encode loop; must stay cheap when idle.
    pub fn submit_video_packet(&self, packet: &VideoPacket) {
        if self.active_sessions.load(Ordering::SeqCst) == 0 {
            return;
        }
        let bytes = packet.delivery_bytes();

        let mut sessions = self.sessions.lock();
        for session in sessions.values_mut() {
            if !session.options.video {
                continue;
            }
            if session.video_ring.len() >= MAX_VIDEO_FRAMES {
                session.video_ring.pop_front();
                session.video_dropped += 1;
            }
            session.video_ring.push_back(bytes.clone());
            session.video_packets += 1;
        }
    }

    pub fn submit_audio_packet(&self, packet: &AudioPacket) {
        if self.active_sessions.load(Ordering::SeqCst) == 0 {
            return;
        }

        let mut sessions = self.sessions.lock();
        for session in sessions.values_mut() {
            if !session.options.audio {
                continue;
            }
            if session.audio_ring.len() >= MAX_AUDIO_FRAMES {
                session.audio_ring.pop_front();
                session.audio_dropped += 1;
            }
            session.audio_ring.push_back(packet.data.clone());
            session.audio_packets += 1;
        }
    }

    /// Drain the buffered video frames for one session, oldest first.
    pub fn drain_video(&self, id: &str) -> Vec<Bytes> {
        let mut sessions = self.sessions.lock();
        sessions
            .get_mut(id)
            .map(|s| s.video_ring.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn drain_audio(&self, id: &str) -> Vec<Bytes> {
        let mut sessions = self.sessions.lock();
        sessions
            .get_mut(id)
            .map(|s| s.audio_ring.drain(..).collect())
            .unwrap_or_default()
    }

    /// ICE servers advertised to clients, from the environment.
    pub fn ice_servers(&self) -> serde_json::Value {
        std::env::var(ICE_SERVERS_ENV)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_else(|| serde_json::json!([]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_packet(byte: u8) -> VideoPacket {
        VideoPacket {
            data: Bytes::from(vec![byte]),
            frame_index: byte as u64,
            is_idr: false,
            after_ref_invalidation: false,
            timestamp_qpc: 0,
            replacements: Vec::new(),
        }
    }

    #[test]
    fn create_list_close() {
        let registry = WebRtcRegistry::new();
        let snapshot = registry.create_session(SessionOptions::default()).unwrap();
        assert!(snapshot.audio && snapshot.video && snapshot.encoded);
        assert_eq!(snapshot.video_packets, 0);

        let listed = registry.list_sessions();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, snapshot.id);

        assert!(registry.close_session(&snapshot.id));
        assert!(!registry.close_session(&snapshot.id));
        assert!(registry.list_sessions().is_empty());
    }

    #[test]
    fn options_validation_and_alias() {
        let opts = SessionOptions {
            video_pacing_mode: "smooth".to_string(),
            ..Default::default()
        };
        assert_eq!(opts.validate().unwrap().video_pacing_mode, "smoothness");

        for bad in [
            SessionOptions {
                codec: "mpeg2".to_string(),
                ..Default::default()
            },
            SessionOptions {
                audio_channels: 4,
                ..Default::default()
            },
            SessionOptions {
                video_pacing_slack_ms: 11,
                ..Default::default()
            },
            SessionOptions {
                video_max_frame_age_ms: 4,
                ..Default::default()
            },
        ] {
            assert!(bad.validate().is_err());
        }
    }

    #[test]
    fn video_ring_keeps_last_two_and_counts_drops() {
        let registry = WebRtcRegistry::new();
        let session = registry.create_session(SessionOptions::default()).unwrap();

        let n = 7u8;
        for i in 0..n {
            registry.submit_video_packet(&video_packet(i));
        }

        let snapshot = registry.session(&session.id).unwrap();
        assert_eq!(snapshot.video_packets, n as u64);
        assert_eq!(snapshot.video_dropped, (n as u64) - 2);

        let frames = registry.drain_video(&session.id);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0][0], n - 2);
        assert_eq!(frames[1][0], n - 1);
    }

    #[test]
    fn fanout_skips_video_disabled_sessions() {
        let registry = WebRtcRegistry::new();
        let muted = registry
            .create_session(SessionOptions {
                video: false,
                ..Default::default()
            })
            .unwrap();

        registry.submit_video_packet(&video_packet(1));
        assert_eq!(registry.session(&muted.id).unwrap().video_packets, 0);
    }

    #[test]
    fn ice_indices_are_monotonic_and_filterable() {
        let registry = WebRtcRegistry::new();
        let session = registry.create_session(SessionOptions::default()).unwrap();

        registry
            .add_ice_candidates(
                &session.id,
                vec![
                    ("0".to_string(), 0, "cand-a".to_string()),
                    ("0".to_string(), 0, "cand-b".to_string()),
                    ("1".to_string(), 1, "cand-c".to_string()),
                ],
            )
            .unwrap();

        let all = registry.local_candidates_since(&session.id, 0).unwrap();
        assert_eq!(
            all.iter().map(|c| c.index).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        let tail = registry.local_candidates_since(&session.id, 2).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].candidate, "cand-c");
    }

    #[test]
    fn candidate_cap_is_enforced() {
        let registry = WebRtcRegistry::new();
        let session = registry.create_session(SessionOptions::default()).unwrap();
        let too_many = (0..=MAX_ICE_CANDIDATES_PER_REQUEST)
            .map(|i| ("0".to_string(), 0, format!("cand-{i}")))
            .collect();
        assert!(registry.add_ice_candidates(&session.id, too_many).is_err());
    }

    #[tokio::test]
    async fn wait_for_local_answer_blocks_until_set() {
        let registry = WebRtcRegistry::new();
        let session = registry.create_session(SessionOptions::default()).unwrap();

        let registry2 = registry.clone();
        let id = session.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            registry2.set_local_answer(&id, "v=0 answer".to_string()).unwrap();
        });

        let sdp = registry
            .wait_for_local_answer(&session.id, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(sdp, "v=0 answer");
    }

    #[tokio::test]
    async fn wait_for_local_answer_times_out() {
        let registry = WebRtcRegistry::new();
        let session = registry.create_session(SessionOptions::default()).unwrap();
        assert!(registry
            .wait_for_local_answer(&session.id, Duration::from_millis(50))
            .await
            .is_err());
    }
}
