//! Domain layer for the payment relay.
//!
//! Holds the invoice document model, the webhook event model, signature
//! verification and the reconciliation of payment confirmations into invoices.
//! External services are reached only through the traits in [`ports`].

pub mod events;
pub mod invoice;
pub mod ports;
pub mod reconcile;
pub mod signature;

pub use events::{EventError, EventKind, InboundEvent};
pub use invoice::{Invoice, InvoiceError, InvoiceStatus, PaidUpdate, PaymentInfo};
pub use ports::{
    CheckoutRequest, CheckoutSession, GatewayError, InvoiceStore, LineItem, MarkPaidOutcome,
    PaymentGateway, PaymentIntent, PaymentIntentRequest, PaymentVerifier, StoreError,
};
pub use reconcile::{ReconcileOutcome, Reconciler};
pub use signature::{HmacVerifier, SignatureError, VerifyError};
