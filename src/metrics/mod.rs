//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain liveness and listener progress
//! - Submitted transactions and their outcomes
//! - Relay outcomes, wait timeouts and escalations
//! - Custody balances

use crate::chain::ChainKind;
use crate::error::{DeputyError, DeputyResult};
use crate::store::TxIntent;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, CounterVec, Encoder, GaugeVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "deputy_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain"]
    ).unwrap();

    pub static ref CHAIN_SCAN_HEIGHT: GaugeVec = register_gauge_vec!(
        "deputy_chain_scan_height",
        "Next height the swap listener scans per chain",
        &["chain"]
    ).unwrap();

    pub static ref SWAPS_OBSERVED: CounterVec = register_counter_vec!(
        "deputy_swaps_observed_total",
        "Open swaps to the deputy discovered by the listener",
        &["chain"]
    ).unwrap();

    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "deputy_transactions_submitted_total",
        "Transactions broadcast by the deputy",
        &["chain", "intent"]
    ).unwrap();

    pub static ref TX_RESOLVED: CounterVec = register_counter_vec!(
        "deputy_transactions_resolved_total",
        "Transactions that reached a final status",
        &["chain", "intent", "status"]
    ).unwrap();

    pub static ref RELAY_OUTCOMES: CounterVec = register_counter_vec!(
        "deputy_relay_outcomes_total",
        "Relay attempts by outcome",
        &["origin", "destination", "outcome"]
    ).unwrap();

    pub static ref WAIT_TIMEOUTS: CounterVec = register_counter_vec!(
        "deputy_wait_timeouts_total",
        "Bounded waits that timed out",
        &["wait"]
    ).unwrap();

    pub static ref ESCALATIONS: CounterVec = register_counter_vec!(
        "deputy_escalations_total",
        "Conditions that need operator attention",
        &["kind"]
    ).unwrap();

    pub static ref CUSTODY_BALANCE: GaugeVec = register_gauge_vec!(
        "deputy_custody_balance",
        "Deputy hot wallet balance in base units",
        &["chain"]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> DeputyResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| DeputyError::Internal(format!("bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| DeputyError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_chain_health(chain: ChainKind, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[chain.as_str()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_scan_height(chain: ChainKind, next_height: u64) {
    CHAIN_SCAN_HEIGHT
        .with_label_values(&[chain.as_str()])
        .set(next_height as f64);
}

pub fn record_swaps_observed(chain: ChainKind, count: usize) {
    SWAPS_OBSERVED
        .with_label_values(&[chain.as_str()])
        .inc_by(count as f64);
}

pub fn record_tx_submitted(chain: ChainKind, intent: TxIntent) {
    TX_SUBMITTED
        .with_label_values(&[chain.as_str(), intent.as_str()])
        .inc();
}

pub fn record_tx_resolved(chain: ChainKind, intent: TxIntent, status: &str) {
    TX_RESOLVED
        .with_label_values(&[chain.as_str(), intent.as_str(), status])
        .inc();
}

pub fn record_relay_outcome(origin: ChainKind, destination: ChainKind, outcome: &str) {
    RELAY_OUTCOMES
        .with_label_values(&[origin.as_str(), destination.as_str(), outcome])
        .inc();
}

pub fn record_wait_timeout(wait: &str) {
    WAIT_TIMEOUTS.with_label_values(&[wait]).inc();
}

pub fn record_escalation(kind: &str) {
    ESCALATIONS.with_label_values(&[kind]).inc();
}

pub fn record_custody_balance(chain: ChainKind, balance: u128) {
    CUSTODY_BALANCE
        .with_label_values(&[chain.as_str()])
        .set(balance as f64);
}
