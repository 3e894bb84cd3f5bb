//! Plain-text HTTP façade over the election engine

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use bully_cluster::{ElectionEngine, LeaderRecord, NodeId};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ElectionEngine>,
    pub show_port: bool,
    pub unix_time: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/leader", get(leader))
        .route("/join", get(join).post(join))
        .with_state(state)
}

async fn leader(State(state): State<AppState>) -> impl IntoResponse {
    match state.engine.leader().await {
        Ok(record) => (
            StatusCode::OK,
            render_leader(
                &record,
                state.engine.my_id(),
                state.engine.my_addr(),
                state.show_port,
                state.unix_time,
            ),
        ),
        Err(e) => {
            tracing::debug!("Leader query failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, format!("Error: {}\r\n", e))
        }
    }
}

async fn join() -> &'static str {
    "Not implemented\r\n"
}

/// Render `{local|remote}\t{address}\r\n{timestamp}\r\n`.
pub fn render_leader(
    record: &LeaderRecord,
    my_id: NodeId,
    my_addr: &str,
    show_port: bool,
    unix_time: bool,
) -> String {
    let local = record.leader.id == my_id;
    let address = if local && record.leader.address.is_empty() {
        my_addr
    } else {
        record.leader.address.as_str()
    };
    let address = if show_port {
        address
    } else {
        strip_port(address)
    };

    let timestamp = if unix_time {
        record.elected_at.timestamp().to_string()
    } else {
        record.elected_at.to_string()
    };

    format!(
        "{}\t{}\r\n{}\r\n",
        if local { "local" } else { "remote" },
        address,
        timestamp
    )
}

fn strip_port(address: &str) -> &str {
    address
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(address)
}
