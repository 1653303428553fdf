use std::str::FromStr;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use metrics::counter;
use payrelay_core::{
    invoice::{to_minor_units, Invoice},
    CheckoutRequest, InvoiceError, LineItem, MarkPaidOutcome, PaidUpdate, PaymentIntentRequest,
    StoreError,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::body::JsonBody;
use crate::problem::ProblemResponse;
use crate::router::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutPayload {
    #[serde(default)]
    invoice_id: Option<String>,
    #[serde(default)]
    description: Option<String>,
    /// Number or decimal string in major units.
    #[serde(default)]
    amount: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIntentPayload {
    #[serde(default)]
    invoice_id: Option<String>,
}

pub async fn create_checkout_session(
    State(state): State<AppState>,
    JsonBody(payload): JsonBody<CheckoutPayload>,
) -> Result<Json<Value>, ProblemResponse> {
    let (kind, result) = match non_blank(payload.invoice_id.as_deref()) {
        Some(invoice_id) => ("invoice", invoice_checkout(&state, invoice_id).await),
        None => ("ad_hoc", ad_hoc_checkout(&state, &payload).await),
    };
    let label = match &result {
        Ok(_) => "created",
        Err(problem) => problem.problem_type(),
    };
    counter!("checkout_requests_total", "kind" => kind, "result" => label).increment(1);
    result
}

async fn invoice_checkout(state: &AppState, invoice_id: &str) -> Result<Json<Value>, ProblemResponse> {
    let invoice = load_unpaid(state, invoice_id).await?;
    let settings = state.checkout();
    let currency = invoice.currency_or(&settings.default_currency);
    let line_items = line_items_for(&invoice, &currency).map_err(invalid_amount)?;

    let request = CheckoutRequest {
        line_items,
        currency,
        success_url: settings.success_url.clone(),
        cancel_url: settings.cancel_url.clone(),
        invoice_id: Some(invoice.id.clone()),
    };
    let session = state
        .gateway()
        .create_checkout_session(&request)
        .await
        .map_err(|err| {
            error!(stage = "checkout", invoice_id, error = %err, "failed to create checkout session");
            provider_error()
        })?;

    state
        .store()
        .record_checkout(&invoice.id, &session, state.now())
        .await
        .map_err(|err| store_problem(invoice_id, err))?;
    info!(stage = "checkout", invoice_id, session_id = %session.id, "checkout session created");

    Ok(Json(json!({ "url": session.url, "sessionId": session.id })))
}

async fn ad_hoc_checkout(
    state: &AppState,
    payload: &CheckoutPayload,
) -> Result<Json<Value>, ProblemResponse> {
    let description = non_blank(payload.description.as_deref());
    let (Some(description), Some(amount)) = (description, payload.amount.as_ref()) else {
        return Err(ProblemResponse::bad_request(
            "missing_field",
            "invoiceId, or description and amount, is required",
        ));
    };

    let settings = state.checkout();
    let amount = parse_amount(amount)
        .ok_or_else(|| ProblemResponse::bad_request("invalid_amount", "amount must be a number"))?;
    let unit_amount =
        to_minor_units(amount, &settings.default_currency).map_err(invalid_amount)?;

    let request = CheckoutRequest {
        line_items: vec![LineItem {
            name: description.to_string(),
            unit_amount,
            quantity: 1,
        }],
        currency: settings.default_currency.clone(),
        success_url: settings.success_url.clone(),
        cancel_url: settings.cancel_url.clone(),
        invoice_id: None,
    };
    let session = state
        .gateway()
        .create_checkout_session(&request)
        .await
        .map_err(|err| {
            error!(stage = "checkout", error = %err, "failed to create ad-hoc checkout session");
            provider_error()
        })?;
    info!(stage = "checkout", session_id = %session.id, unit_amount, "ad-hoc checkout session created");

    Ok(Json(json!({ "url": session.url, "sessionId": session.id })))
}

pub async fn create_payment_intent(
    State(state): State<AppState>,
    JsonBody(payload): JsonBody<PaymentIntentPayload>,
) -> Result<Json<Value>, ProblemResponse> {
    let result = payment_intent(&state, &payload).await;
    let label = match &result {
        Ok(_) => "created",
        Err(problem) => problem.problem_type(),
    };
    counter!("checkout_requests_total", "kind" => "payment_intent", "result" => label)
        .increment(1);
    result
}

async fn payment_intent(
    state: &AppState,
    payload: &PaymentIntentPayload,
) -> Result<Json<Value>, ProblemResponse> {
    let invoice_id = non_blank(payload.invoice_id.as_deref())
        .ok_or_else(|| ProblemResponse::bad_request("missing_field", "invoiceId is required"))?;
    let invoice = load_unpaid(state, invoice_id).await?;

    let currency = invoice.currency_or(&state.checkout().default_currency);
    let amount = invoice
        .amount_due()
        .and_then(|amount| to_minor_units(amount, &currency))
        .map_err(invalid_amount)?;

    let intent = state
        .gateway()
        .create_payment_intent(&PaymentIntentRequest {
            amount,
            currency,
            invoice_id: invoice.id.clone(),
        })
        .await
        .map_err(|err| {
            error!(stage = "checkout", invoice_id, error = %err, "failed to create payment intent");
            provider_error()
        })?;

    state
        .store()
        .record_payment_intent(&invoice.id, &intent.id, state.now())
        .await
        .map_err(|err| store_problem(invoice_id, err))?;
    info!(stage = "checkout", invoice_id, intent_id = %intent.id, amount, "payment intent created");

    Ok(Json(json!({ "clientSecret": intent.client_secret })))
}

/// Marks an invoice paid without a processor round trip. Only routed in development.
pub async fn debug_mark_paid(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ProblemResponse> {
    let outcome = state
        .store()
        .mark_paid(&id, &PaidUpdate::at(state.now()))
        .await
        .map_err(|err| store_problem(&id, err))?;

    match outcome {
        MarkPaidOutcome::NotFound => Err(not_found(&id)),
        MarkPaidOutcome::Applied | MarkPaidOutcome::AlreadyPaid => {
            if outcome == MarkPaidOutcome::Applied {
                counter!("invoice_paid_total", "source" => "debug").increment(1);
            }
            warn!(stage = "checkout", invoice_id = %id, ?outcome, "invoice marked paid via debug route");
            Ok(Json(json!({ "id": id, "status": "paid" })))
        }
    }
}

async fn load_unpaid(state: &AppState, invoice_id: &str) -> Result<Invoice, ProblemResponse> {
    let invoice = state
        .store()
        .get(invoice_id)
        .await
        .map_err(|err| store_problem(invoice_id, err))?
        .ok_or_else(|| not_found(invoice_id))?;
    if invoice.status.is_paid() {
        return Err(ProblemResponse::new(
            StatusCode::CONFLICT,
            "invoice_already_paid",
            format!("invoice {invoice_id} is already paid"),
        ));
    }
    Ok(invoice)
}

/// Itemized lines when the invoice has items and no explicit total, otherwise
/// one line for the amount due.
fn line_items_for(invoice: &Invoice, currency: &str) -> Result<Vec<LineItem>, InvoiceError> {
    if invoice.total.is_none() && !invoice.items.is_empty() {
        return invoice
            .items
            .iter()
            .enumerate()
            .map(|(index, item)| -> Result<LineItem, InvoiceError> {
                let name = match item.description.trim() {
                    "" => format!("Item {}", index + 1),
                    name => name.to_string(),
                };
                Ok(LineItem {
                    name,
                    unit_amount: to_minor_units(item.unit_price, currency)?,
                    quantity: 1,
                })
            })
            .collect();
    }

    let amount = invoice.amount_due()?;
    Ok(vec![LineItem {
        name: format!("Invoice {}", invoice.id),
        unit_amount: to_minor_units(amount, currency)?,
        quantity: 1,
    }])
}

fn parse_amount(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(number) => Decimal::from_str(&number.to_string())
            .or_else(|_| Decimal::from_scientific(&number.to_string()))
            .ok(),
        Value::String(text) => Decimal::from_str(text.trim()).ok(),
        _ => None,
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn invalid_amount(err: InvoiceError) -> ProblemResponse {
    ProblemResponse::bad_request("invalid_amount", err.to_string())
}

fn not_found(invoice_id: &str) -> ProblemResponse {
    ProblemResponse::new(
        StatusCode::NOT_FOUND,
        "invoice_not_found",
        format!("invoice {invoice_id} not found"),
    )
}

fn provider_error() -> ProblemResponse {
    ProblemResponse::internal("provider_error", "payment processor request failed")
}

fn store_problem(invoice_id: &str, err: StoreError) -> ProblemResponse {
    match err {
        StoreError::NotFound(_) => not_found(invoice_id),
        other => {
            error!(stage = "checkout", invoice_id, error = %other, "invoice store failure");
            ProblemResponse::internal("store_error", "invoice store unavailable")
        }
    }
}
