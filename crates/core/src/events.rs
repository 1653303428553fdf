use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::invoice::PaymentInfo;

/// Metadata key carrying the invoice key on sessions and intents we create.
pub const INVOICE_METADATA_KEY: &str = "invoiceId";

/// Errors that can occur while decoding a verified webhook payload.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("failed to parse payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing data block in payload")]
    MissingData,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

/// A verified webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub id: Option<String>,
    pub kind: EventKind,
}

/// Event types this service reacts to. Everything else lands in `Other`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    CheckoutCompleted(CheckoutCompleted),
    PaymentSucceeded(PaymentSucceeded),
    Other { event_type: String },
}

/// Payload of a completed hosted checkout session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutCompleted {
    pub session_id: String,
    pub amount_total: Option<i64>,
    pub currency: Option<String>,
    pub payer_email: Option<String>,
    pub payment_intent_id: Option<String>,
    pub invoice_id: Option<String>,
}

/// Payload of a succeeded payment intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentSucceeded {
    pub intent_id: String,
    pub amount: Option<i64>,
    pub currency: Option<String>,
    pub payer_email: Option<String>,
    pub invoice_id: Option<String>,
}

/// Common view over the recognized confirmation payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentConfirmation {
    /// Session or intent id, matched against the invoice's provider ids.
    pub provider_ref: String,
    pub invoice_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub payment_info: PaymentInfo,
}

impl InboundEvent {
    /// Decodes a webhook body. Only call this on bytes that passed signature verification.
    pub fn from_slice(raw: &[u8]) -> Result<Self, EventError> {
        let envelope: Envelope = serde_json::from_slice(raw)?;
        let kind = match envelope.event_type.as_str() {
            "checkout.session.completed" | "checkout.completed" => {
                let object = payload_object(envelope.data)?;
                EventKind::CheckoutCompleted(CheckoutCompleted::from_object(object)?)
            }
            "payment_intent.succeeded" | "payment.succeeded" => {
                let object = payload_object(envelope.data)?;
                EventKind::PaymentSucceeded(PaymentSucceeded::from_object(object)?)
            }
            _ => EventKind::Other {
                event_type: envelope.event_type,
            },
        };

        Ok(Self {
            id: envelope.id,
            kind,
        })
    }
}

impl EventKind {
    /// Returns the canonical event type string used across telemetry.
    pub fn event_type(&self) -> &str {
        match self {
            Self::CheckoutCompleted(_) => "checkout.completed",
            Self::PaymentSucceeded(_) => "payment.succeeded",
            Self::Other { event_type } => event_type,
        }
    }

    /// Bounded label for metrics; unknown types collapse into `other`.
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::CheckoutCompleted(_) => "checkout_completed",
            Self::PaymentSucceeded(_) => "payment_succeeded",
            Self::Other { .. } => "other",
        }
    }
}

impl CheckoutCompleted {
    fn from_object(object: Value) -> Result<Self, EventError> {
        let session: SessionObject = serde_json::from_value(object)?;
        let session_id = session
            .id
            .filter(|id| !id.is_empty())
            .ok_or(EventError::MissingField("id"))?;
        let payer_email = session
            .customer_details
            .and_then(|details| details.email)
            .or(session.customer_email);

        Ok(Self {
            session_id,
            amount_total: session.amount_total,
            currency: session.currency,
            payer_email,
            payment_intent_id: session.payment_intent,
            invoice_id: invoice_id_from(session.metadata.as_ref()),
        })
    }

    pub fn confirmation(&self) -> PaymentConfirmation {
        PaymentConfirmation {
            provider_ref: self.session_id.clone(),
            invoice_id: self.invoice_id.clone(),
            payment_intent_id: self.payment_intent_id.clone(),
            payment_info: PaymentInfo {
                provider_session_id: Some(self.session_id.clone()),
                amount_total: self.amount_total,
                currency: self.currency.clone(),
                payer_email: self.payer_email.clone(),
            },
        }
    }
}

impl PaymentSucceeded {
    fn from_object(object: Value) -> Result<Self, EventError> {
        let intent: IntentObject = serde_json::from_value(object)?;
        let intent_id = intent
            .id
            .filter(|id| !id.is_empty())
            .ok_or(EventError::MissingField("id"))?;

        Ok(Self {
            intent_id,
            amount: intent.amount_received.or(intent.amount),
            currency: intent.currency,
            payer_email: intent.receipt_email,
            invoice_id: invoice_id_from(intent.metadata.as_ref()),
        })
    }

    pub fn confirmation(&self) -> PaymentConfirmation {
        PaymentConfirmation {
            provider_ref: self.intent_id.clone(),
            invoice_id: self.invoice_id.clone(),
            payment_intent_id: Some(self.intent_id.clone()),
            payment_info: PaymentInfo {
                provider_session_id: None,
                amount_total: self.amount,
                currency: self.currency.clone(),
                payer_email: self.payer_email.clone(),
            },
        }
    }
}

fn payload_object(data: Option<Value>) -> Result<Value, EventError> {
    let mut data = data.ok_or(EventError::MissingData)?;
    match data.get_mut("object") {
        Some(object) => Ok(object.take()),
        None => Ok(data),
    }
}

fn invoice_id_from(metadata: Option<&Value>) -> Option<String> {
    metadata?
        .get(INVOICE_METADATA_KEY)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SessionObject {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    amount_total: Option<i64>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    customer_email: Option<String>,
    #[serde(default)]
    customer_details: Option<CustomerDetails>,
    #[serde(default)]
    payment_intent: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CustomerDetails {
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IntentObject {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    amount: Option<i64>,
    #[serde(default)]
    amount_received: Option<i64>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    receipt_email: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(value: Value) -> Result<InboundEvent, EventError> {
        InboundEvent::from_slice(value.to_string().as_bytes())
    }

    #[test]
    fn decodes_checkout_session_completed() {
        let event = decode(json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "data": {
                "object": {
                    "id": "cs_test_1",
                    "amount_total": 1000,
                    "currency": "usd",
                    "customer_details": { "email": "ada@example.com" },
                    "payment_intent": "pi_1",
                    "metadata": { "invoiceId": "INV-1" }
                }
            }
        }))
        .expect("decode");

        assert_eq!(event.id.as_deref(), Some("evt_1"));
        let EventKind::CheckoutCompleted(session) = event.kind else {
            panic!("expected checkout completion");
        };
        assert_eq!(session.session_id, "cs_test_1");
        assert_eq!(session.amount_total, Some(1000));
        assert_eq!(session.payer_email.as_deref(), Some("ada@example.com"));
        assert_eq!(session.invoice_id.as_deref(), Some("INV-1"));

        let confirmation = session.confirmation();
        assert_eq!(confirmation.provider_ref, "cs_test_1");
        assert_eq!(confirmation.payment_intent_id.as_deref(), Some("pi_1"));
        assert_eq!(
            confirmation.payment_info.provider_session_id.as_deref(),
            Some("cs_test_1")
        );
    }

    #[test]
    fn accepts_abstract_type_names_and_flat_data() {
        let event = decode(json!({
            "type": "payment.succeeded",
            "data": {
                "id": "pi_9",
                "amount": 2500,
                "currency": "eur",
                "metadata": {}
            }
        }))
        .expect("decode");

        let EventKind::PaymentSucceeded(intent) = event.kind else {
            panic!("expected payment success");
        };
        assert_eq!(intent.intent_id, "pi_9");
        assert_eq!(intent.amount, Some(2500));
        assert_eq!(intent.invoice_id, None);
        assert_eq!(
            intent.confirmation().payment_intent_id.as_deref(),
            Some("pi_9")
        );
    }

    #[test]
    fn amount_received_wins_over_amount() {
        let event = decode(json!({
            "type": "payment_intent.succeeded",
            "data": { "object": { "id": "pi_2", "amount": 3000, "amount_received": 2900 } }
        }))
        .expect("decode");
        let EventKind::PaymentSucceeded(intent) = event.kind else {
            panic!("expected payment success");
        };
        assert_eq!(intent.amount, Some(2900));
    }

    #[test]
    fn unknown_types_decode_without_payload() {
        let event = decode(json!({ "type": "foo.bar" })).expect("decode");
        assert_eq!(
            event.kind,
            EventKind::Other {
                event_type: "foo.bar".to_string()
            }
        );
        assert_eq!(event.kind.metric_label(), "other");
        assert_eq!(event.kind.event_type(), "foo.bar");
    }

    #[test]
    fn recognized_type_requires_payload_id() {
        let err = decode(json!({
            "type": "checkout.completed",
            "data": { "object": { "amount_total": 1000 } }
        }))
        .expect_err("missing id should fail");
        assert!(matches!(err, EventError::MissingField("id")));

        let err = decode(json!({ "type": "checkout.completed" })).expect_err("no data");
        assert!(matches!(err, EventError::MissingData));
    }

    #[test]
    fn blank_invoice_metadata_is_ignored() {
        let event = decode(json!({
            "type": "checkout.completed",
            "data": { "object": { "id": "cs_3", "metadata": { "invoiceId": "  " } } }
        }))
        .expect("decode");
        let EventKind::CheckoutCompleted(session) = event.kind else {
            panic!("expected checkout completion");
        };
        assert_eq!(session.invoice_id, None);
    }

    #[test]
    fn rejects_non_json_payload() {
        let err = InboundEvent::from_slice(b"not json").expect_err("invalid json");
        assert!(matches!(err, EventError::Json(_)));
    }
}
