//! HTTP façade tests against a live engine

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use bully_cluster::{ElectionConfig, ElectionEngine, IdentityStrategy, NodeId, NoopObserver};
use bully_node::{router, AppState};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower::ServiceExt;

async fn engine(id: u128, candidates: Vec<String>) -> Arc<ElectionEngine> {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = ElectionConfig {
        identity: IdentityStrategy::Fixed {
            id: NodeId::from(id),
        },
        answer_timeout: Duration::from_millis(200),
        ..Default::default()
    };
    Arc::new(
        ElectionEngine::new(listener, candidates, Arc::new(NoopObserver), config)
            .await
            .unwrap(),
    )
}

async fn get(state: AppState, uri: &str) -> (StatusCode, String) {
    let response = router(state)
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

#[tokio::test]
async fn test_leader_endpoint_reports_local_leader() {
    let engine = engine(7, Vec::new()).await;
    for _ in 0..100 {
        if engine.leader().await.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let record = engine.leader().await.unwrap();

    let state = AppState {
        engine: engine.clone(),
        show_port: true,
        unix_time: true,
    };
    let (status, body) = get(state, "/leader").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        format!(
            "local\t{}\r\n{}\r\n",
            engine.my_addr(),
            record.elected_at.timestamp()
        )
    );

    engine.finalize().await;
}

#[tokio::test]
async fn test_leader_endpoint_before_election() {
    // A peer that never answers the handshake keeps the first election back
    let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let engine = engine(7, vec![silent.local_addr().unwrap().to_string()]).await;

    let state = AppState {
        engine: engine.clone(),
        show_port: false,
        unix_time: true,
    };
    let (status, body) = get(state, "/leader").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body, "Error: No leader elected yet\r\n");

    engine.finalize().await;
}

#[tokio::test]
async fn test_join_is_not_implemented() {
    let engine = engine(3, Vec::new()).await;
    let state = AppState {
        engine: engine.clone(),
        show_port: false,
        unix_time: true,
    };

    let (status, body) = get(state, "/join").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Not implemented\r\n");

    engine.finalize().await;
}
