use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::events::{EventKind, InboundEvent, PaymentConfirmation};
use crate::invoice::{Invoice, PaidUpdate};
use crate::ports::{InvoiceStore, MarkPaidOutcome, StoreError};

/// What happened to a verified event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Paid { invoice_id: String },
    AlreadyPaid { invoice_id: String },
    /// No invoice matched. Acknowledged so the processor does not redeliver.
    Unresolved {
        provider_ref: String,
        invoice_id: Option<String>,
    },
    Ignored { event_type: String },
}

impl ReconcileOutcome {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::Paid { .. } => "paid",
            Self::AlreadyPaid { .. } => "already_paid",
            Self::Unresolved { .. } => "unresolved",
            Self::Ignored { .. } => "ignored",
        }
    }
}

/// Applies payment confirmations to invoice documents.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn InvoiceStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn InvoiceStore>) -> Self {
        Self { store }
    }

    /// Dispatches on the event type and applies the paid transition.
    ///
    /// Store failures are returned so the caller can answer with a retryable
    /// status. Everything else resolves to an outcome.
    pub async fn reconcile(
        &self,
        event: &InboundEvent,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, StoreError> {
        let confirmation = match &event.kind {
            EventKind::CheckoutCompleted(session) => session.confirmation(),
            EventKind::PaymentSucceeded(intent) => intent.confirmation(),
            EventKind::Other { event_type } => {
                return Ok(ReconcileOutcome::Ignored {
                    event_type: event_type.clone(),
                })
            }
        };

        let Some(invoice) = self.resolve(&confirmation).await? else {
            return Ok(unresolved(confirmation));
        };
        if invoice.status.is_paid() {
            return Ok(ReconcileOutcome::AlreadyPaid {
                invoice_id: invoice.id,
            });
        }

        let update = PaidUpdate {
            paid_at: now,
            payment_info: Some(confirmation.payment_info.clone()),
            payment_intent_id: confirmation.payment_intent_id.clone(),
        };
        match self.store.mark_paid(&invoice.id, &update).await? {
            MarkPaidOutcome::Applied => Ok(ReconcileOutcome::Paid {
                invoice_id: invoice.id,
            }),
            MarkPaidOutcome::AlreadyPaid => Ok(ReconcileOutcome::AlreadyPaid {
                invoice_id: invoice.id,
            }),
            MarkPaidOutcome::NotFound => Ok(unresolved(confirmation)),
        }
    }

    /// Metadata key first, then the provider id index.
    async fn resolve(
        &self,
        confirmation: &PaymentConfirmation,
    ) -> Result<Option<Invoice>, StoreError> {
        match confirmation.invoice_id.as_deref() {
            Some(invoice_id) => self.store.get(invoice_id).await,
            None => {
                self.store
                    .find_by_provider_ref(&confirmation.provider_ref)
                    .await
            }
        }
    }
}

fn unresolved(confirmation: PaymentConfirmation) -> ReconcileOutcome {
    ReconcileOutcome::Unresolved {
        provider_ref: confirmation.provider_ref,
        invoice_id: confirmation.invoice_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::CheckoutSession;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::invoice::InvoiceItem;

    #[derive(Default)]
    struct MemoryStore {
        invoices: Mutex<HashMap<String, Invoice>>,
        writes: AtomicUsize,
        fail_writes: bool,
    }

    impl MemoryStore {
        fn with(invoices: Vec<Invoice>) -> Self {
            Self {
                invoices: Mutex::new(
                    invoices
                        .into_iter()
                        .map(|invoice| (invoice.id.clone(), invoice))
                        .collect(),
                ),
                ..Self::default()
            }
        }

        fn snapshot(&self, id: &str) -> Invoice {
            self.invoices
                .lock()
                .expect("lock")
                .get(id)
                .cloned()
                .expect("invoice present")
        }

        fn writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl InvoiceStore for MemoryStore {
        async fn get(&self, id: &str) -> Result<Option<Invoice>, StoreError> {
            Ok(self.invoices.lock().expect("lock").get(id).cloned())
        }

        async fn find_by_provider_ref(
            &self,
            provider_ref: &str,
        ) -> Result<Option<Invoice>, StoreError> {
            let invoices = self.invoices.lock().expect("lock");
            Ok(invoices
                .values()
                .find(|invoice| {
                    invoice.provider_session_id.as_deref() == Some(provider_ref)
                        || invoice.provider_payment_intent_id.as_deref() == Some(provider_ref)
                })
                .cloned())
        }

        async fn record_checkout(
            &self,
            _id: &str,
            _session: &CheckoutSession,
            _now: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            unimplemented!("not used by the reconciler")
        }

        async fn record_payment_intent(
            &self,
            _id: &str,
            _intent_id: &str,
            _now: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            unimplemented!("not used by the reconciler")
        }

        async fn mark_paid(
            &self,
            id: &str,
            update: &PaidUpdate,
        ) -> Result<MarkPaidOutcome, StoreError> {
            if self.fail_writes {
                return Err(StoreError::Unavailable("connection reset".to_string()));
            }
            let mut invoices = self.invoices.lock().expect("lock");
            let Some(invoice) = invoices.get_mut(id) else {
                return Ok(MarkPaidOutcome::NotFound);
            };
            if invoice.apply_paid(update) {
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(MarkPaidOutcome::Applied)
            } else {
                Ok(MarkPaidOutcome::AlreadyPaid)
            }
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .expect("fixed time")
            .with_timezone(&Utc)
    }

    fn invoice(id: &str, session: Option<&str>) -> Invoice {
        let mut invoice = Invoice::new(id);
        invoice.currency = Some("usd".to_string());
        invoice.items.push(InvoiceItem {
            description: "Wash".to_string(),
            unit_price: Decimal::new(1000, 2),
        });
        invoice.provider_session_id = session.map(str::to_string);
        invoice
    }

    fn checkout_event(session_id: &str, invoice_id: Option<&str>) -> InboundEvent {
        let metadata = match invoice_id {
            Some(id) => serde_json::json!({ "invoiceId": id }),
            None => serde_json::json!({}),
        };
        let body = serde_json::json!({
            "id": "evt_1",
            "type": "checkout.completed",
            "data": { "object": {
                "id": session_id,
                "amount_total": 1000,
                "currency": "usd",
                "customer_email": "ada@example.com",
                "metadata": metadata
            }}
        });
        InboundEvent::from_slice(body.to_string().as_bytes()).expect("event")
    }

    #[tokio::test]
    async fn marks_invoice_paid_via_metadata() {
        let store = Arc::new(MemoryStore::with(vec![invoice("INV-1", None)]));
        let reconciler = Reconciler::new(store.clone());

        let outcome = reconciler
            .reconcile(&checkout_event("cs_1", Some("INV-1")), now())
            .await
            .expect("reconcile");

        assert_eq!(
            outcome,
            ReconcileOutcome::Paid {
                invoice_id: "INV-1".to_string()
            }
        );
        let stored = store.snapshot("INV-1");
        assert!(stored.status.is_paid());
        assert_eq!(stored.paid_at, Some(now()));
        let info = stored.payment_info.expect("payment info");
        assert_eq!(info.amount_total, Some(1000));
        assert_eq!(info.provider_session_id.as_deref(), Some("cs_1"));
        assert_eq!(info.payer_email.as_deref(), Some("ada@example.com"));
    }

    #[tokio::test]
    async fn redelivery_leaves_state_identical() {
        let store = Arc::new(MemoryStore::with(vec![invoice("INV-1", None)]));
        let reconciler = Reconciler::new(store.clone());
        let event = checkout_event("cs_1", Some("INV-1"));

        reconciler.reconcile(&event, now()).await.expect("first");
        let after_first = store.snapshot("INV-1");

        let later = now() + chrono::Duration::minutes(3);
        let outcome = reconciler.reconcile(&event, later).await.expect("second");

        assert_eq!(
            outcome,
            ReconcileOutcome::AlreadyPaid {
                invoice_id: "INV-1".to_string()
            }
        );
        assert_eq!(store.snapshot("INV-1"), after_first);
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn metadata_wins_over_provider_index() {
        let store = Arc::new(MemoryStore::with(vec![
            invoice("A", None),
            invoice("B", Some("cs_shared")),
        ]));
        let reconciler = Reconciler::new(store.clone());

        reconciler
            .reconcile(&checkout_event("cs_shared", Some("A")), now())
            .await
            .expect("reconcile");

        assert!(store.snapshot("A").status.is_paid());
        assert!(!store.snapshot("B").status.is_paid());
    }

    #[tokio::test]
    async fn falls_back_to_provider_index() {
        let store = Arc::new(MemoryStore::with(vec![invoice("B", Some("cs_b"))]));
        let reconciler = Reconciler::new(store.clone());

        let outcome = reconciler
            .reconcile(&checkout_event("cs_b", None), now())
            .await
            .expect("reconcile");

        assert_eq!(
            outcome,
            ReconcileOutcome::Paid {
                invoice_id: "B".to_string()
            }
        );
    }

    #[tokio::test]
    async fn unresolved_events_are_not_errors() {
        let store = Arc::new(MemoryStore::with(vec![invoice("INV-1", None)]));
        let reconciler = Reconciler::new(store.clone());

        let by_metadata = reconciler
            .reconcile(&checkout_event("cs_x", Some("INV-404")), now())
            .await
            .expect("reconcile");
        assert_eq!(
            by_metadata,
            ReconcileOutcome::Unresolved {
                provider_ref: "cs_x".to_string(),
                invoice_id: Some("INV-404".to_string())
            }
        );

        let by_index = reconciler
            .reconcile(&checkout_event("cs_unknown", None), now())
            .await
            .expect("reconcile");
        assert_eq!(by_index.metric_label(), "unresolved");
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn unknown_event_types_touch_nothing() {
        let store = Arc::new(MemoryStore::with(vec![invoice("INV-1", Some("cs_1"))]));
        let reconciler = Reconciler::new(store.clone());
        let event = InboundEvent::from_slice(
            br#"{"type":"foo.bar","data":{"object":{"id":"cs_1","metadata":{"invoiceId":"INV-1"}}}}"#,
        )
        .expect("event");

        let outcome = reconciler.reconcile(&event, now()).await.expect("reconcile");

        assert_eq!(
            outcome,
            ReconcileOutcome::Ignored {
                event_type: "foo.bar".to_string()
            }
        );
        assert_eq!(store.writes(), 0);
        assert!(!store.snapshot("INV-1").status.is_paid());
    }

    #[tokio::test]
    async fn payment_intent_attaches_intent_id() {
        let mut pending = invoice("INV-7", None);
        pending.provider_payment_intent_id = Some("pi_7".to_string());
        let store = Arc::new(MemoryStore::with(vec![pending]));
        let reconciler = Reconciler::new(store.clone());
        let event = InboundEvent::from_slice(
            br#"{"type":"payment_intent.succeeded","data":{"object":{"id":"pi_7","amount_received":1000,"currency":"usd"}}}"#,
        )
        .expect("event");

        reconciler.reconcile(&event, now()).await.expect("reconcile");

        let stored = store.snapshot("INV-7");
        assert!(stored.status.is_paid());
        assert_eq!(stored.payment_intent_id.as_deref(), Some("pi_7"));
        assert_eq!(
            stored.payment_info.and_then(|info| info.amount_total),
            Some(1000)
        );
    }

    #[tokio::test]
    async fn store_failures_propagate() {
        let store = Arc::new(MemoryStore {
            fail_writes: true,
            ..MemoryStore::with(vec![invoice("INV-1", None)])
        });
        let reconciler = Reconciler::new(store.clone());

        let err = reconciler
            .reconcile(&checkout_event("cs_1", Some("INV-1")), now())
            .await
            .expect_err("store failure should surface");
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
