//! Capability interfaces for the external collaborators.
//!
//! The webhook path and the checkout handlers only see these traits; the
//! binary wires in the SQLite store, the HTTP gateway and the HMAC verifier.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::events::InboundEvent;
use crate::invoice::{Invoice, PaidUpdate};
use crate::signature::VerifyError;

/// Verifies a webhook delivery and decodes it once it is trusted.
pub trait PaymentVerifier: Send + Sync {
    fn verify(
        &self,
        raw_body: &[u8],
        signature_header: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<InboundEvent, VerifyError>;
}

/// Keyed access to invoice documents.
#[async_trait]
pub trait InvoiceStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Invoice>, StoreError>;

    /// Looks up the invoice whose provider session or intent id equals
    /// `provider_ref`. Returns at most one invoice.
    async fn find_by_provider_ref(&self, provider_ref: &str)
        -> Result<Option<Invoice>, StoreError>;

    async fn record_checkout(
        &self,
        id: &str,
        session: &CheckoutSession,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn record_payment_intent(
        &self,
        id: &str,
        intent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Marks the invoice paid unless it already is. Must be safe to call
    /// concurrently for the same invoice.
    async fn mark_paid(&self, id: &str, update: &PaidUpdate) -> Result<MarkPaidOutcome, StoreError>;
}

/// Result of [`InvoiceStore::mark_paid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkPaidOutcome {
    Applied,
    AlreadyPaid,
    NotFound,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invoice {0} not found")]
    NotFound(String),
    #[error("invoice document {id} is corrupt: {reason}")]
    Corrupt { id: String, reason: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Creates hosted checkout sessions and payment intents.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, GatewayError>;

    async fn create_payment_intent(
        &self,
        request: &PaymentIntentRequest,
    ) -> Result<PaymentIntent, GatewayError>;
}

/// One line of a hosted checkout page. `unit_amount` is in minor units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineItem {
    pub name: String,
    pub unit_amount: i64,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRequest {
    pub line_items: Vec<LineItem>,
    pub currency: String,
    pub success_url: String,
    pub cancel_url: String,
    pub invoice_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntentRequest {
    pub amount: i64,
    pub currency: String,
    pub invoice_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntent {
    pub id: String,
    pub client_secret: String,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("processor rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("processor unreachable: {0}")]
    Transport(String),
    #[error("unexpected processor response: {0}")]
    InvalidResponse(String),
}
