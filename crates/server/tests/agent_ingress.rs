mod common;

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

use common::engine_with_hosts;
use fleetwarden_server::health::HealthSource;
use fleetwarden_server::web::create_axum_router;

async fn serve(app: axum::Router) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn push_updates_health_and_disconnect_marks_offline() {
    let t = engine_with_hosts(&["h1"], None).await;
    let addr = serve(create_axum_router(t.engine.clone())).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/agent?id=h1"))
        .await
        .unwrap();
    ws.send(Message::Text(
        r#"{"hostname": "web-1", "cpu_usage": 12.5, "mem_usage": "40", "unknown": true}"#.into(),
    ))
    .await
    .unwrap();

    let health = t.engine.health.clone();
    assert!(eventually(|| health.get("h1").is_some_and(|r| r.online)).await);
    let record = health.get("h1").unwrap();
    assert_eq!(record.source, HealthSource::Agent);
    assert_eq!(record.metrics.hostname.as_deref(), Some("web-1"));
    assert_eq!(record.metrics.cpu_usage.as_deref(), Some("12.5"));
    assert!(t.engine.agents.is_connected("h1"));

    ws.close(None).await.unwrap();
    assert!(eventually(|| health.get("h1").is_some_and(|r| !r.online)).await);
    assert!(!t.engine.agents.is_connected("h1"));
}

#[tokio::test]
async fn reconnect_replaces_previous_connection() {
    let t = engine_with_hosts(&["h1"], None).await;
    let addr = serve(create_axum_router(t.engine.clone())).await;
    let url = format!("ws://{addr}/ws/agent?id=h1");

    let (mut first, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    first.send(Message::Text(r#"{"hostname": "first"}"#.into())).await.unwrap();
    let health = t.engine.health.clone();
    assert!(eventually(|| health
        .get("h1")
        .is_some_and(|r| r.metrics.hostname.as_deref() == Some("first")))
    .await);

    let (mut second, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    second.send(Message::Text(r#"{"hostname": "again"}"#.into())).await.unwrap();

    // The first socket is told to close.
    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(msg) = first.next().await {
            if matches!(msg, Ok(Message::Close(_)) | Err(_)) {
                return true;
            }
        }
        true
    })
    .await
    .unwrap();
    assert!(closed);

    assert!(eventually(|| health
        .get("h1")
        .is_some_and(|r| r.online && r.metrics.hostname.as_deref() == Some("again")))
    .await);
    assert!(t.engine.agents.is_connected("h1"));
}

#[tokio::test]
async fn unknown_host_is_rejected() {
    let t = engine_with_hosts(&["h1"], None).await;
    let addr = serve(create_axum_router(t.engine.clone())).await;
    let result = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/agent?id=ghost")).await;
    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 404);
        }
        other => panic!("expected HTTP 404, got {other:?}"),
    }
}
