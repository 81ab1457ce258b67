use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::error::Error;
use std::time::Duration;
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tracing::{debug, info, warn};

use crate::agent_modules::metrics::MetricsCollector;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(5 * 60);

/// Doubles the delay up to [`MAX_RECONNECT_DELAY`].
pub fn next_reconnect_delay(current: Duration) -> Duration {
    (current * 2).min(MAX_RECONNECT_DELAY)
}

/// Up to one second of jitter so a fleet restarting together does not
/// reconnect in lockstep.
pub fn with_jitter(delay: Duration) -> Duration {
    delay + Duration::from_millis(rand::rng().random_range(0..=1000))
}

/// Connects to the ingress and pushes a snapshot every `every` until the
/// server closes the socket. An `Err` means the connection failed or broke.
pub async fn push_session(
    url: &str,
    every: Duration,
    collector: &mut MetricsCollector,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let (ws_stream, _) = connect_async(url).await?;
    info!(url = %url, "Connected to agent ingress.");
    let (mut write, mut read) = ws_stream.split();
    let mut ticker = interval(every);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let frame = serde_json::to_string(&collector.collect())?;
                write.send(WsMessage::Text(frame.into())).await?;
                debug!("Metrics pushed.");
            }
            msg = read.next() => match msg {
                Some(Ok(WsMessage::Close(frame))) => {
                    info!(reason = ?frame, "Server closed the connection.");
                    return Ok(());
                }
                None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Agent socket read failed.");
                    return Err(e.into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetwarden_common::HostMetrics;
    use tokio::net::TcpListener;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(next_reconnect_delay(Duration::from_secs(5)), Duration::from_secs(10));
        assert_eq!(next_reconnect_delay(Duration::from_secs(200)), MAX_RECONNECT_DELAY);
        let jittered = with_jitter(Duration::from_secs(5));
        assert!(jittered >= Duration::from_secs(5) && jittered <= Duration::from_secs(6));
    }

    #[tokio::test]
    async fn pushes_frames_until_server_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let frame = loop {
                match ws.next().await.unwrap().unwrap() {
                    WsMessage::Text(text) => break text.as_str().to_string(),
                    _ => continue,
                }
            };
            ws.close(None).await.unwrap();
            // Drain until the client acknowledges the close.
            while let Some(Ok(_)) = ws.next().await {}
            frame
        });

        let mut collector = MetricsCollector::new();
        let url = format!("ws://{addr}/ws/agent?id=h1");
        push_session(&url, Duration::from_millis(50), &mut collector)
            .await
            .unwrap();

        let frame = server.await.unwrap();
        let metrics = HostMetrics::from_frame(&frame).unwrap();
        assert!(metrics.cpu_cores.is_some());
    }

    #[tokio::test]
    async fn unreachable_server_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let mut collector = MetricsCollector::new();
        let result = push_session(&format!("ws://{addr}/ws/agent?id=h1"), Duration::from_secs(1), &mut collector).await;
        assert!(result.is_err());
    }
}
