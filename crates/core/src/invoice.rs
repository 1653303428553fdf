use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Currencies the processor charges without a fractional minor unit.
const ZERO_DECIMAL_CURRENCIES: &[&str] = &[
    "bif", "clp", "djf", "gnf", "jpy", "kmf", "krw", "mga", "pyg", "rwf", "ugx", "vnd", "vuv",
    "xaf", "xof", "xpf",
];

/// Invoice document as persisted in the document store.
///
/// The document is owned by another system, so fields this service does not
/// know about are kept in `extra` and written back untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default)]
    pub items: Vec<InvoiceItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<Decimal>,
    #[serde(default)]
    pub status: InvoiceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkout_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_payment_intent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_intent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_info: Option<PaymentInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A single billable line on an invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceItem {
    #[serde(alias = "desc")]
    pub description: String,
    #[serde(alias = "price", alias = "unit_price")]
    pub unit_price: Decimal,
}

/// Lifecycle status of an invoice.
///
/// Values other than `pending` and `paid` belong to other systems and are
/// carried through as-is.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum InvoiceStatus {
    #[default]
    Pending,
    Paid,
    Other(String),
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Other(value) => value,
        }
    }

    pub fn is_paid(&self) -> bool {
        matches!(self, Self::Paid)
    }
}

impl From<String> for InvoiceStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "pending" => Self::Pending,
            "paid" => Self::Paid,
            _ => Self::Other(value),
        }
    }
}

impl From<InvoiceStatus> for String {
    fn from(value: InvoiceStatus) -> Self {
        match value {
            InvoiceStatus::Other(raw) => raw,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payment details attached when the processor confirms a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_total: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer_email: Option<String>,
}

/// Mutation applied to an invoice once a payment is confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaidUpdate {
    pub paid_at: DateTime<Utc>,
    pub payment_info: Option<PaymentInfo>,
    pub payment_intent_id: Option<String>,
}

impl PaidUpdate {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            paid_at: now,
            payment_info: None,
            payment_intent_id: None,
        }
    }
}

/// Errors raised while deriving amounts from an invoice.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvoiceError {
    #[error("invoice has neither a total nor any items")]
    NoAmount,
    #[error("amount must be positive (got {0})")]
    NonPositive(Decimal),
    #[error("amount {amount} has more precision than {currency} allows")]
    Precision { amount: Decimal, currency: String },
    #[error("amount {0} is out of range")]
    OutOfRange(Decimal),
}

impl Invoice {
    /// Creates an empty pending invoice with the provided key.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            currency: None,
            items: Vec::new(),
            total: None,
            status: InvoiceStatus::Pending,
            checkout_url: None,
            provider_session_id: None,
            provider_payment_intent_id: None,
            payment_intent_id: None,
            payment_info: None,
            paid_at: None,
            updated_at: None,
            extra: Map::new(),
        }
    }

    /// Returns the invoice currency in lowercase, or `default` when unset.
    pub fn currency_or(&self, default: &str) -> String {
        self.currency
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(default)
            .to_ascii_lowercase()
    }

    /// Returns the amount due in major units.
    ///
    /// An explicit `total` wins; otherwise the item prices are summed.
    pub fn amount_due(&self) -> Result<Decimal, InvoiceError> {
        if let Some(total) = self.total {
            return Ok(total);
        }
        if self.items.is_empty() {
            return Err(InvoiceError::NoAmount);
        }
        Ok(self.items.iter().map(|item| item.unit_price).sum())
    }

    /// Applies a confirmed payment. Returns `false` without touching the
    /// document when the invoice is already paid.
    pub fn apply_paid(&mut self, update: &PaidUpdate) -> bool {
        if self.status.is_paid() {
            return false;
        }
        self.status = InvoiceStatus::Paid;
        self.paid_at = Some(update.paid_at);
        self.updated_at = Some(update.paid_at);
        if let Some(info) = &update.payment_info {
            self.payment_info = Some(info.clone());
        }
        if let Some(intent_id) = &update.payment_intent_id {
            self.payment_intent_id = Some(intent_id.clone());
        }
        true
    }
}

/// Number of fractional digits the processor expects for `currency`.
pub fn minor_unit_exponent(currency: &str) -> u32 {
    if ZERO_DECIMAL_CURRENCIES.contains(&currency.to_ascii_lowercase().as_str()) {
        0
    } else {
        2
    }
}

/// Converts a major-unit amount into the processor's integer minor units.
pub fn to_minor_units(amount: Decimal, currency: &str) -> Result<i64, InvoiceError> {
    if amount <= Decimal::ZERO {
        return Err(InvoiceError::NonPositive(amount));
    }
    let exponent = minor_unit_exponent(currency);
    if amount.round_dp(exponent) != amount {
        return Err(InvoiceError::Precision {
            amount,
            currency: currency.to_string(),
        });
    }
    let scaled = amount
        .checked_mul(Decimal::from(10_i64.pow(exponent)))
        .ok_or(InvoiceError::OutOfRange(amount))?;
    scaled.to_i64().ok_or(InvoiceError::OutOfRange(amount))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wash_invoice() -> Invoice {
        serde_json::from_value(json!({
            "id": "INV-1",
            "currency": "usd",
            "items": [{ "desc": "Wash", "price": 10.00 }],
            "status": "pending",
            "customer": { "name": "Ada" }
        }))
        .expect("invoice should decode")
    }

    #[test]
    fn decodes_item_aliases_and_preserves_unknown_fields() {
        let invoice = wash_invoice();
        assert_eq!(invoice.items[0].description, "Wash");
        assert_eq!(invoice.items[0].unit_price, Decimal::new(1000, 2));
        assert_eq!(invoice.status, InvoiceStatus::Pending);

        let encoded = serde_json::to_value(&invoice).expect("encode");
        assert_eq!(encoded["customer"]["name"], "Ada");
        assert_eq!(encoded["items"][0]["description"], "Wash");
    }

    #[test]
    fn missing_status_defaults_to_pending() {
        let invoice: Invoice = serde_json::from_value(json!({ "id": "INV-2" })).expect("decode");
        assert_eq!(invoice.status, InvoiceStatus::Pending);
        assert_eq!(invoice.currency_or("usd"), "usd");
    }

    #[test]
    fn unknown_status_round_trips_verbatim() {
        let invoice: Invoice =
            serde_json::from_value(json!({ "id": "INV-3", "status": "void" })).expect("decode");
        assert_eq!(invoice.status, InvoiceStatus::Other("void".to_string()));
        let encoded = serde_json::to_value(&invoice).expect("encode");
        assert_eq!(encoded["status"], "void");
    }

    #[test]
    fn amount_due_prefers_total_then_items() {
        let mut invoice = wash_invoice();
        invoice.items.push(InvoiceItem {
            description: "Dry".to_string(),
            unit_price: Decimal::new(550, 2),
        });
        assert_eq!(invoice.amount_due(), Ok(Decimal::new(1550, 2)));

        invoice.total = Some(Decimal::new(2000, 2));
        assert_eq!(invoice.amount_due(), Ok(Decimal::new(2000, 2)));

        assert_eq!(Invoice::new("empty").amount_due(), Err(InvoiceError::NoAmount));
    }

    #[test]
    fn converts_to_minor_units() {
        assert_eq!(to_minor_units(Decimal::new(1000, 2), "usd"), Ok(1000));
        assert_eq!(to_minor_units(Decimal::new(1999, 2), "EUR"), Ok(1999));
        assert_eq!(to_minor_units(Decimal::new(500, 0), "jpy"), Ok(500));
        assert!(matches!(
            to_minor_units(Decimal::new(5005, 1), "jpy"),
            Err(InvoiceError::Precision { .. })
        ));
        assert!(matches!(
            to_minor_units(Decimal::new(1001, 3), "usd"),
            Err(InvoiceError::Precision { .. })
        ));
        assert!(matches!(
            to_minor_units(Decimal::ZERO, "usd"),
            Err(InvoiceError::NonPositive(_))
        ));
    }

    #[test]
    fn apply_paid_is_monotonic() {
        let mut invoice = wash_invoice();
        let first_at = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .expect("time")
            .with_timezone(&Utc);
        let update = PaidUpdate {
            paid_at: first_at,
            payment_info: Some(PaymentInfo {
                provider_session_id: Some("cs_1".to_string()),
                amount_total: Some(1000),
                currency: Some("usd".to_string()),
                payer_email: None,
            }),
            payment_intent_id: Some("pi_1".to_string()),
        };

        assert!(invoice.apply_paid(&update));
        let after_first = invoice.clone();

        let later = PaidUpdate::at(first_at + chrono::Duration::minutes(5));
        assert!(!invoice.apply_paid(&later));
        assert_eq!(invoice, after_first);
        assert_eq!(invoice.paid_at, Some(first_at));
        assert_eq!(invoice.payment_intent_id.as_deref(), Some("pi_1"));
    }
}
