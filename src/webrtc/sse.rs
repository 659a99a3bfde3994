//! Server-sent ICE candidate stream.
//!
//! `GET /api/webrtc/sessions/{id}/ice/stream?since=N` long-polls the
//! registry every 200 ms, emitting `candidate` events with strictly
//! increasing ids and a `keepalive` at least every 2 seconds. The
//! connection ends when the session disappears or a send fails.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::Event;
use futures::Stream;

use super::registry::WebRtcRegistry;

/// Poll cadence against the candidate list.
const POLL_INTERVAL: Duration = Duration::from_millis(200);
/// Maximum quiet period before a keepalive goes out.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(2);

/// Build the SSE event stream for one session's ICE candidates.
pub fn ice_event_stream(
    registry: Arc<WebRtcRegistry>,
    session_id: String,
    since: u64,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        let mut last_emitted = since;
        let mut last_activity = tokio::time::Instant::now();

        loop {
            let candidates = match registry.local_candidates_since(&session_id, last_emitted) {
                Ok(candidates) => candidates,
                // Session closed: end the stream
                Err(_) => break,
            };

            for candidate in candidates {
                // Indices only move forward on one connection
                debug_assert!(candidate.index > last_emitted);
                last_emitted = candidate.index;
                last_activity = tokio::time::Instant::now();

                let data = serde_json::json!({
                    "candidate": candidate.candidate,
                    "mid": candidate.mid,
                    "mline_index": candidate.mline_index,
                });
                yield Ok(Event::default()
                    .event("candidate")
                    .id(candidate.index.to_string())
                    .data(data.to_string()));
            }

            if last_activity.elapsed() >= KEEPALIVE_INTERVAL {
                last_activity = tokio::time::Instant::now();
                yield Ok(Event::default().event("keepalive").data("{}"));
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::registry::SessionOptions;
    use futures::StreamExt;

    #[tokio::test]
    async fn stream_emits_new_candidates_in_order() {
        let registry = WebRtcRegistry::new();
        let session = registry.create_session(SessionOptions::default()).unwrap();
        registry
            .add_ice_candidates(
                &session.id,
                vec![
                    ("0".to_string(), 0, "a".to_string()),
                    ("0".to_string(), 0, "b".to_string()),
                ],
            )
            .unwrap();

        let stream = ice_event_stream(registry.clone(), session.id.clone(), 0);
        let events: Vec<_> = stream.take(2).collect().await;
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn since_skips_already_delivered() {
        let registry = WebRtcRegistry::new();
        let session = registry.create_session(SessionOptions::default()).unwrap();
        registry
            .add_ice_candidates(
                &session.id,
                vec![
                    ("0".to_string(), 0, "a".to_string()),
                    ("0".to_string(), 0, "b".to_string()),
                ],
            )
            .unwrap();

        // since=2 means both existing candidates are already known; close
        // the session so the stream ends instead of idling
        registry.close_session(&session.id);
        let stream = ice_event_stream(registry, session.id, 2);
        let events: Vec<_> = stream.collect().await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn stream_ends_when_session_closes() {
        let registry = WebRtcRegistry::new();
        let session = registry.create_session(SessionOptions::default()).unwrap();

        let registry2 = registry.clone();
        let id = session.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            registry2.close_session(&id);
        });

        let stream = ice_event_stream(registry, session.id, 0);
        // Collect to completion; without the close this would idle forever
        let _events: Vec<_> =
            tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
                .await
                .expect("stream should end after close");
    }
}
