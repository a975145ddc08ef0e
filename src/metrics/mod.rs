//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain health and finalized positions
//! - Observed and skipped events
//! - Action transitions and submission attempts
//! - Cursor progress and mint confirmation latency

use crate::error::{RelayerError, RelayerResult};
use crate::events::{ChainEvent, ChainId, Position};
use crate::relay::ActionState;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_HEALTHY: GaugeVec = register_gauge_vec!(
        "tokenbridge_chain_healthy",
        "Chain RPC health (1=healthy, 0=unhealthy)",
        &["chain"]
    ).expect("register tokenbridge_chain_healthy");

    pub static ref CURSOR_POSITION: GaugeVec = register_gauge_vec!(
        "tokenbridge_cursor_position",
        "Last block or slot whose events are fully settled",
        &["chain"]
    ).expect("register tokenbridge_cursor_position");

    pub static ref SUBSCRIPTION_ERRORS: CounterVec = register_counter_vec!(
        "tokenbridge_subscription_errors_total",
        "Event subscription failures, each followed by a resume",
        &["chain"]
    ).expect("register tokenbridge_subscription_errors_total");

    // Event metrics
    pub static ref EVENTS_OBSERVED: CounterVec = register_counter_vec!(
        "tokenbridge_events_observed_total",
        "Bridge events delivered by the subscriptions",
        &["chain", "kind"]
    ).expect("register tokenbridge_events_observed_total");

    pub static ref EVENTS_SKIPPED: CounterVec = register_counter_vec!(
        "tokenbridge_events_skipped_total",
        "Events classified as not actionable",
        &["chain", "reason"]
    ).expect("register tokenbridge_events_skipped_total");

    // Action metrics
    pub static ref ACTION_TRANSITIONS: CounterVec = register_counter_vec!(
        "tokenbridge_action_transitions_total",
        "Action state changes by source chain and new state",
        &["source_chain", "state"]
    ).expect("register tokenbridge_action_transitions_total");

    pub static ref SUBMISSIONS: CounterVec = register_counter_vec!(
        "tokenbridge_submissions_total",
        "Mint transactions signed and broadcast",
        &["chain"]
    ).expect("register tokenbridge_submissions_total");

    pub static ref MINT_LATENCY: HistogramVec = register_histogram_vec!(
        "tokenbridge_mint_latency_seconds",
        "Time from burn discovery to confirmed mint",
        &["chain"],
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 900.0]
    ).expect("register tokenbridge_mint_latency_seconds");

    // Health metrics
    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "tokenbridge_health_check_failure_total",
        "Failed dependency health checks",
        &["component"]
    ).expect("register tokenbridge_health_check_failure_total");
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> RelayerResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| RelayerError::Config(format!("Cannot bind metrics port {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| RelayerError::Internal(format!("Metrics server failed: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Current metrics in the Prometheus text format
pub fn render() -> RelayerResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| RelayerError::Internal(format!("Encoding metrics: {}", e)))?;
    String::from_utf8(buffer).map_err(|e| RelayerError::Internal(e.to_string()))
}

// Helper functions to record metrics

pub fn record_chain_health(chain: ChainId, healthy: bool) {
    CHAIN_HEALTHY
        .with_label_values(&[chain.as_str()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_cursor(chain: ChainId, position: Position) {
    CURSOR_POSITION
        .with_label_values(&[chain.as_str()])
        .set(position as f64);
}

pub fn record_subscription_error(chain: ChainId) {
    SUBSCRIPTION_ERRORS.with_label_values(&[chain.as_str()]).inc();
}

pub fn record_event(event: &ChainEvent) {
    EVENTS_OBSERVED
        .with_label_values(&[event.chain.as_str(), event.kind.as_str()])
        .inc();
}

pub fn record_skipped(chain: ChainId, reason: &str) {
    EVENTS_SKIPPED
        .with_label_values(&[chain.as_str(), reason])
        .inc();
}

pub fn record_action_transition(source: ChainId, state: ActionState) {
    ACTION_TRANSITIONS
        .with_label_values(&[source.as_str(), state.as_str()])
        .inc();
}

pub fn record_submission_attempt(chain: ChainId) {
    SUBMISSIONS.with_label_values(&[chain.as_str()]).inc();
}

pub fn record_confirmation_latency(chain: ChainId, latency_secs: f64) {
    MINT_LATENCY
        .with_label_values(&[chain.as_str()])
        .observe(latency_secs);
}

pub fn record_health_check_failure(component: &str) {
    HEALTH_CHECK_FAILURE.with_label_values(&[component]).inc();
}
