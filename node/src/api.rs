//! # HTTP Status Surface
//!
//! Builds the axum routers for the node's two HTTP ports. All handlers
//! share [`AppState`] through axum's `State` extractor.
//!
//! ## Endpoints
//!
//! | Port    | Method | Path       | Description                           |
//! |---------|--------|------------|---------------------------------------|
//! | status  | GET    | `/health`  | Liveness check                        |
//! | status  | GET    | `/status`  | Router status report (JSON)           |
//! | status  | GET    | `/peers`   | Linked peers with their debt balances |
//! | metrics | GET    | `/metrics` | Prometheus text exposition            |

use std::sync::Arc;

use axum::{
    extract::State,
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use autoroute::Node;

use crate::metrics::{metrics_handler, NodeMetrics};

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared state for every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    /// Reported version string.
    pub version: String,
    pub node: Arc<Node>,
    pub metrics: Arc<NodeMetrics>,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Router for the status port.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/peers", get(peers_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Router for the metrics port.
pub fn metrics_router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Response Types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub id: String,
}

/// One entry of `GET /peers`.
#[derive(Debug, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Hex node address.
    pub address: String,
    /// Where the peer wants to be paid.
    pub payment_address: String,
    /// What the peer owes us.
    pub incoming_debt: i64,
    /// What we owe the peer.
    pub outgoing_debt: i64,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health`. 200 while the node runs, 503 once it is shutting down.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (code, status) = if state.node.is_closed() {
        (StatusCode::SERVICE_UNAVAILABLE, "closing")
    } else {
        (StatusCode::OK, "ok")
    };
    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            version: state.version.clone(),
            id: state.node.address().to_hex(),
        }),
    )
}

/// `GET /status`: the router's status report.
async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.node.status())
}

/// `GET /peers`
async fn peers_handler(State(state): State<AppState>) -> impl IntoResponse {
    let router = state.node.router();
    let ledger = state.node.ledger();
    let peers: Vec<PeerInfo> = router
        .peers()
        .into_iter()
        .filter_map(|peer| {
            let conn = router.connection(&peer)?;
            Some(PeerInfo {
                address: peer.to_hex(),
                payment_address: conn.remote_metadata().payment_address.clone(),
                incoming_debt: ledger.incoming_debt(&peer),
                outgoing_debt: ledger.outgoing_debt(&peer),
            })
        })
        .collect();
    Json(peers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use autoroute::{MemoryMoney, NodeConfig, PrivateKey, StatusReport};

    fn test_app_state() -> AppState {
        let node = Node::new(
            PrivateKey::generate(),
            Arc::new(MemoryMoney::new()),
            NodeConfig::default(),
        )
        .unwrap();
        AppState {
            version: "0.1.0-test".into(),
            node,
            metrics: Arc::new(NodeMetrics::new().unwrap()),
        }
    }

    /// Sends a GET request and returns the (status, body_bytes).
    async fn get(router: &Router, path: &str) -> (StatusCode, Vec<u8>) {
        let req = Request::builder().uri(path).body(Body::empty()).unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec();
        (status, body)
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let state = test_app_state();
        let id = state.node.address().to_hex();
        let router = create_router(state);
        let (status, body) = get(&router, "/health").await;

        assert_eq!(status, StatusCode::OK);
        let json: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(json.status, "ok");
        assert_eq!(json.id, id);
    }

    #[tokio::test]
    async fn health_endpoint_reports_shutdown() {
        let state = test_app_state();
        state.node.close();
        let router = create_router(state);
        let (status, _) = get(&router, "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn status_endpoint_uses_report_field_names() {
        let state = test_app_state();
        let id = state.node.address().to_hex();
        let router = create_router(state);
        let (status, body) = get(&router, "/status").await;

        assert_eq!(status, StatusCode::OK);
        let raw: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(raw["Id"], id);
        assert_eq!(raw["Packets_dropped"], 0);

        let report: StatusReport = serde_json::from_slice(&body).unwrap();
        assert!(report.connections.is_empty());
    }

    #[tokio::test]
    async fn peers_endpoint_is_empty_when_alone() {
        let router = create_router(test_app_state());
        let (status, body) = get(&router, "/peers").await;
        assert_eq!(status, StatusCode::OK);
        let peers: Vec<PeerInfo> = serde_json::from_slice(&body).unwrap();
        assert!(peers.is_empty());
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_prometheus_text() {
        let router = metrics_router(test_app_state());
        let (status, body) = get(&router, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("autoroute_packets_sent"));
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let router = create_router(test_app_state());
        let (status, _) = get(&router, "/blocks/1").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
