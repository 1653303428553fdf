use std::time::Instant;

use axum::{
    extract::State,
    http::HeaderMap,
    Json,
};
use metrics::{counter, histogram};
use payrelay_core::{ReconcileOutcome, VerifyError};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::body::RawBody;
use crate::problem::ProblemResponse;
use crate::router::AppState;

const HEADER_SIGNATURE: &str = "Webhook-Signature";

pub async fn handle(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawBody(raw): RawBody,
) -> Result<Json<Value>, ProblemResponse> {
    let start = Instant::now();
    let delivery_id = Uuid::new_v4();

    let result = process(&state, &headers, &raw, delivery_id).await;
    let outcome = match &result {
        Ok(outcome) => outcome.metric_label(),
        Err(problem) if problem.status().is_server_error() => "error",
        Err(_) => "rejected",
    };
    histogram!("webhook_ack_latency_seconds", "outcome" => outcome)
        .record(start.elapsed().as_secs_f64());

    result.map(|_| Json(json!({ "received": true })))
}

async fn process(
    state: &AppState,
    headers: &HeaderMap,
    raw: &[u8],
    delivery_id: Uuid,
) -> Result<ReconcileOutcome, ProblemResponse> {
    let body_len = raw.len();
    if raw.is_empty() {
        warn!(stage = "ingress", %delivery_id, "webhook delivered without a body");
        counter!("webhook_invalid_signature_total", "reason" => "empty_body").increment(1);
        return Err(ProblemResponse::bad_request(
            "raw_body_required",
            "raw body required",
        ));
    }

    let signature = headers
        .get(HEADER_SIGNATURE)
        .and_then(|value| value.to_str().ok());
    let now = state.now();

    let event = state
        .verifier()
        .verify(raw, signature, now)
        .map_err(|err| match err {
            VerifyError::Signature(err) => {
                let reason = err.metric_reason();
                warn!(stage = "verify", %delivery_id, body_len, reason, "signature verification failed");
                counter!("webhook_invalid_signature_total", "reason" => reason).increment(1);
                ProblemResponse::bad_request("invalid_signature", err.to_string())
            }
            VerifyError::Payload(err) => {
                warn!(stage = "verify", %delivery_id, body_len, error = %err, "signed payload did not decode");
                ProblemResponse::bad_request("invalid_payload", err.to_string())
            }
        })?;

    let event_type = event.kind.event_type().to_string();
    counter!("webhook_ingress_total", "type" => event.kind.metric_label()).increment(1);
    info!(
        stage = "ingress",
        %delivery_id,
        event_id = event.id.as_deref().unwrap_or_default(),
        event_type = %event_type,
        body_len,
        "webhook verified"
    );

    let outcome = state
        .reconciler()
        .reconcile(&event, now)
        .await
        .map_err(|err| {
            error!(stage = "reconcile", %delivery_id, event_type = %event_type, error = %err, "failed to apply payment confirmation");
            ProblemResponse::internal("store_error", "failed to apply payment confirmation")
        })?;

    match &outcome {
        ReconcileOutcome::Paid { invoice_id } => {
            counter!("invoice_paid_total", "source" => "webhook").increment(1);
            info!(stage = "reconcile", %delivery_id, %invoice_id, event_type = %event_type, "invoice marked paid");
        }
        ReconcileOutcome::AlreadyPaid { invoice_id } => {
            info!(stage = "reconcile", %delivery_id, %invoice_id, event_type = %event_type, "invoice already paid");
        }
        ReconcileOutcome::Unresolved {
            provider_ref,
            invoice_id,
        } => {
            counter!("webhook_resolution_miss_total").increment(1);
            warn!(
                stage = "reconcile",
                %delivery_id,
                %provider_ref,
                invoice_id = invoice_id.as_deref().unwrap_or_default(),
                event_type = %event_type,
                "no invoice matched payment confirmation"
            );
        }
        ReconcileOutcome::Ignored { event_type } => {
            info!(stage = "reconcile", %delivery_id, %event_type, "event type ignored");
        }
    }

    Ok(outcome)
}
