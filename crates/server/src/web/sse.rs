//! Server-sent events bridge from a hub subscription to an HTTP body.

use axum::{
    body::Body,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval};

use crate::stream::{StreamEvent, Subscription};

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

const KEEPALIVE_FRAME: &[u8] = b": keepalive\n\n";

/// One `event:`/`data:` frame.
pub fn format_event(event: &StreamEvent) -> String {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    format!("event: {}\ndata: {}\n\n", event.kind.as_str(), data)
}

struct SseState {
    subscription: Subscription,
    keepalive: Interval,
    finished: bool,
}

/// Streams the subscription as `text/event-stream`, with a keepalive comment
/// every `keepalive`. The body ends after the `complete` event.
pub fn event_stream(subscription: Subscription, keepalive: Duration) -> Response {
    let state = SseState {
        subscription,
        keepalive: interval_at(Instant::now() + keepalive, keepalive),
        finished: false,
    };
    let frames = stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        tokio::select! {
            event = state.subscription.recv() => {
                let event = event?;
                state.finished = event.is_complete();
                Some((Ok::<Bytes, Infallible>(Bytes::from(format_event(&event))), state))
            }
            _ = state.keepalive.tick() => Some((Ok(Bytes::from_static(KEEPALIVE_FRAME)), state)),
        }
    });

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(frames),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamHub;

    #[test]
    fn frame_carries_kind_and_json() {
        let frame = format_event(&StreamEvent::output("h1", "web-1", "hello"));
        assert!(frame.starts_with("event: output\ndata: {"));
        assert!(frame.ends_with("}\n\n"));
        let json: serde_json::Value =
            serde_json::from_str(frame.lines().nth(1).unwrap().trim_start_matches("data: ")).unwrap();
        assert_eq!(json["type"], "output");
        assert_eq!(json["machine_id"], "h1");
        assert_eq!(json["machine"], "web-1");
        assert_eq!(json["data"], "hello");
    }

    #[tokio::test]
    async fn body_ends_after_complete() {
        let hub = StreamHub::new();
        let sub = hub.subscribe("e1");
        hub.broadcast("e1", StreamEvent::output("h1", "one", "line"));
        hub.broadcast("e1", StreamEvent::complete("completed"));

        let response = event_stream(sub, KEEPALIVE_INTERVAL);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert_eq!(text.matches("event: output").count(), 1);
        assert!(text.trim_end().ends_with('}'));
        assert_eq!(text.matches("event: complete").count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_stream_sends_keepalive() {
        let hub = StreamHub::new();
        let sub = hub.subscribe("e2");
        let response = event_stream(sub, Duration::from_secs(30));
        let mut body = response.into_body().into_data_stream();
        use futures::StreamExt;
        let first = body.next().await.unwrap().unwrap();
        assert_eq!(&first[..], KEEPALIVE_FRAME);
    }
}
