//! # Prometheus Metrics
//!
//! Mirrors the engine's [`RouterMetrics`](autoroute::RouterMetrics) into a
//! dedicated [`prometheus::Registry`], scraped at `/metrics` on the metrics
//! port. The engine keeps the authoritative counts; every scrape refreshes
//! the gauges from a fresh status snapshot and the ledger.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use autoroute::Node;

use crate::api::AppState;

/// Prometheus handles for one node.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Number of live peer links.
    pub connected_peers: IntGauge,
    /// Packets forwarded to any peer.
    pub packets_sent: IntGauge,
    /// Packets received from peers or sent locally.
    pub packets_received: IntGauge,
    /// Packets dropped for want of a route or a working link.
    pub packets_dropped: IntGauge,
    /// What we owe each peer.
    pub outgoing_debt: IntGaugeVec,
    /// What each peer owes us.
    pub incoming_debt: IntGaugeVec,
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("autoroute".into()), None)?;

        let connected_peers = IntGauge::new("connected_peers", "Number of live peer links")?;
        registry.register(Box::new(connected_peers.clone()))?;

        let packets_sent = IntGauge::new("packets_sent", "Packets forwarded to peers")?;
        registry.register(Box::new(packets_sent.clone()))?;

        let packets_received = IntGauge::new(
            "packets_received",
            "Packets received from peers or injected locally",
        )?;
        registry.register(Box::new(packets_received.clone()))?;

        let packets_dropped = IntGauge::new("packets_dropped", "Packets dropped by the router")?;
        registry.register(Box::new(packets_dropped.clone()))?;

        let outgoing_debt = IntGaugeVec::new(
            Opts::new("outgoing_debt", "Amount owed to each connected peer"),
            &["peer"],
        )?;
        registry.register(Box::new(outgoing_debt.clone()))?;

        let incoming_debt = IntGaugeVec::new(
            Opts::new("incoming_debt", "Amount each connected peer owes us"),
            &["peer"],
        )?;
        registry.register(Box::new(incoming_debt.clone()))?;

        Ok(Self {
            registry,
            connected_peers,
            packets_sent,
            packets_received,
            packets_dropped,
            outgoing_debt,
            incoming_debt,
        })
    }

    /// Copy the node's current counters and balances into the gauges.
    pub fn refresh(&self, node: &Node) {
        let metrics = node.router().metrics();
        self.connected_peers.set(metrics.connection_count() as i64);
        self.packets_sent.set(metrics.total_sent() as i64);
        self.packets_received.set(metrics.total_received() as i64);
        self.packets_dropped.set(metrics.packets_dropped() as i64);

        self.outgoing_debt.reset();
        self.incoming_debt.reset();
        let ledger = node.ledger();
        for peer in node.router().peers() {
            let label = peer.to_hex();
            self.outgoing_debt
                .with_label_values(&[label.as_str()])
                .set(ledger.outgoing_debt(&peer));
            self.incoming_debt
                .with_label_values(&[label.as_str()])
                .set(ledger.incoming_debt(&peer));
        }
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Axum handler that renders `/metrics` in Prometheus text format.
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.refresh(&state.node);
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use autoroute::{MemoryMoney, NodeConfig, PrivateKey};

    #[tokio::test]
    async fn quiet_node_exports_zeroes() {
        let node = Node::new(
            PrivateKey::generate(),
            Arc::new(MemoryMoney::new()),
            NodeConfig::default(),
        )
        .unwrap();
        let metrics = NodeMetrics::new().unwrap();
        metrics.refresh(&node);

        let text = metrics.encode().unwrap();
        assert!(text.contains("autoroute_connected_peers 0"));
        assert!(text.contains("autoroute_packets_dropped 0"));
        node.close();
    }
}
