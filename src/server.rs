//! HTTP server: health, metrics and the collector's signature endpoint

use std::net::SocketAddr;
use std::sync::Arc;

use alloy::primitives::{Address, U256};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use eyre::eyre;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::BridgeContract;
use crate::codec::recover_signer;
use crate::collector::SignatureStore;
use crate::finality::FinalityChecker;
use crate::metrics::Metrics;
use crate::queue::WithdrawalQueue;
use crate::relay::{parse_hex, SubmitSignatureRequest, SubmitSignatureResponse};
use crate::types::SIGNATURE_LENGTH;

/// State needed by `/submit-signature`
#[derive(Clone)]
pub struct CollectorState {
    pub store: Arc<dyn SignatureStore>,
    /// Resolves recovered signers to bridge validator IDs
    pub bridge: Arc<dyn BridgeContract>,
    /// Chain ID the signatures must be bound to
    pub chain_id: u64,
    /// Wakes the batch submitter for a sequence number
    pub notify: mpsc::Sender<U256>,
}

/// Combined app state
#[derive(Clone)]
pub struct AppState {
    pub validator: Address,
    pub queue: Arc<WithdrawalQueue>,
    pub finality: Arc<FinalityChecker>,
    pub metrics: Arc<Metrics>,
    pub collector: Option<CollectorState>,
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub validator: String,
    pub queue_depth: usize,
    pub finality_tracked: usize,
    pub last_finalized_block: u64,
    pub collector_enabled: bool,
}

/// Health check endpoint handler
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        validator: state.validator.to_string(),
        queue_depth: state.queue.len().await,
        finality_tracked: state.finality.tracked_count().await,
        last_finalized_block: state.finality.last_finalized_block(),
        collector_enabled: state.collector.is_some(),
    })
}

/// Liveness check (always returns OK if server is running)
async fn liveness() -> &'static str {
    "OK"
}

/// Readiness check: ready once a finalized block has been processed
async fn readiness(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.finality.last_finalized_block() > 0 {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT_READY")
    }
}

/// Prometheus metrics endpoint
async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    state
        .metrics
        .queue_depth
        .set(state.queue.len().await as i64);

    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry.gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        )
            .into_response();
    }

    match Response::builder()
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}

type SubmitResult = (StatusCode, Json<SubmitSignatureResponse>);

fn reject(metrics: &Metrics, reason: &'static str, error: String) -> SubmitResult {
    metrics
        .signatures_rejected_total
        .with_label_values(&[reason])
        .inc();
    debug!(reason, error = %error, "Rejected signature submission");
    (
        StatusCode::BAD_REQUEST,
        Json(SubmitSignatureResponse {
            success: false,
            error: Some(error),
        }),
    )
}

fn internal_failure(metrics: &Metrics, kind: &'static str, error: String) -> SubmitResult {
    metrics.record_error("collector", kind);
    warn!(kind, error = %error, "Failed to handle signature submission");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(SubmitSignatureResponse {
            success: false,
            error: Some(format!("{} failure", kind)),
        }),
    )
}

/// `POST /submit-signature`
///
/// Validates the entry and signature, checks the recovered signer is a
/// registered bridge validator, stores both keyed by that address, and wakes
/// the batch submitter.
pub async fn submit_signature(
    State(state): State<AppState>,
    payload: Result<Json<SubmitSignatureRequest>, JsonRejection>,
) -> SubmitResult {
    let metrics = state.metrics.as_ref();
    let Some(collector) = state.collector.as_ref() else {
        return (
            StatusCode::NOT_FOUND,
            Json(SubmitSignatureResponse {
                success: false,
                error: Some("collector disabled".to_string()),
            }),
        );
    };

    let Json(request) = match payload {
        Ok(request) => request,
        Err(e) => return reject(metrics, "body", format!("invalid request body: {}", e)),
    };

    let Some(entry) = request.entry.as_ref() else {
        return reject(metrics, "entry", "missing entry".to_string());
    };

    let Some(signature) = parse_hex(&request.signature) else {
        return reject(
            metrics,
            "signature_format",
            "signature must be 0x-prefixed hex".to_string(),
        );
    };
    if signature.len() != SIGNATURE_LENGTH {
        return reject(
            metrics,
            "signature_length",
            format!(
                "signature must be {} bytes, got {}",
                SIGNATURE_LENGTH,
                signature.len()
            ),
        );
    }

    let event = match entry.to_event() {
        Ok(event) => event,
        Err(e) => return reject(metrics, "entry_field", e),
    };

    let validator = match recover_signer(&event, collector.chain_id, &signature) {
        Ok(validator) => validator,
        Err(e) => return reject(metrics, "recovery", e.to_string()),
    };

    match collector.bridge.validator_id(validator).await {
        Ok(0) => {
            return reject(
                metrics,
                "signer",
                format!("signer {} is not a bridge validator", validator),
            )
        }
        Ok(_) => {}
        Err(e) => return internal_failure(metrics, "bridge_read", e.to_string()),
    }

    if let Err(e) = collector.store.save_entry(&event).await {
        return internal_failure(metrics, "storage", e.to_string());
    }
    let inserted = match collector
        .store
        .save_signature(event.sequence_number, validator, &signature)
        .await
    {
        Ok(inserted) => inserted,
        Err(e) => return internal_failure(metrics, "storage", e.to_string()),
    };

    metrics.signatures_received_total.inc();
    info!(
        sequence_number = %event.sequence_number,
        validator = %validator,
        new = inserted,
        "Signature accepted"
    );

    if let Err(e) = collector.notify.try_send(event.sequence_number) {
        warn!(
            sequence_number = %event.sequence_number,
            error = %e,
            "Batch submitter not notified"
        );
    }

    (
        StatusCode::ACCEPTED,
        Json(SubmitSignatureResponse {
            success: true,
            error: None,
        }),
    )
}

pub fn router(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/health", get(health_check))
        .route("/healthz", get(liveness))
        .route("/readyz", get(readiness))
        .route("/metrics", get(prometheus_metrics));

    if state.collector.is_some() {
        app = app.route("/submit-signature", post(submit_signature));
    }

    app.with_state(state)
}

/// Serve until `cancel` fires
pub async fn start_server(
    bind_address: &str,
    port: u16,
    state: AppState,
    cancel: CancellationToken,
) -> eyre::Result<()> {
    let collector_enabled = state.collector.is_some();
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", bind_address, port)
        .parse()
        .map_err(|e| eyre!("Invalid bind address {}:{}: {}", bind_address, port, e))?;
    info!("HTTP server listening on {}", addr);
    info!("  /health  - Full health status (JSON)");
    info!("  /metrics - Prometheus metrics");
    if collector_enabled {
        info!("  /submit-signature - Validator signature collection");
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    Ok(())
}
