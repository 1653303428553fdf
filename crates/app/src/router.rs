use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use payrelay_core::{InvoiceStore, PaymentGateway, PaymentVerifier, Reconciler};

use crate::{body, checkout, telemetry, webhook};

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Settings the checkout handlers pass through to the processor.
#[derive(Debug, Clone)]
pub struct CheckoutSettings {
    pub success_url: String,
    pub cancel_url: String,
    pub default_currency: String,
}

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    store: Arc<dyn InvoiceStore>,
    gateway: Arc<dyn PaymentGateway>,
    verifier: Arc<dyn PaymentVerifier>,
    reconciler: Reconciler,
    checkout: Arc<CheckoutSettings>,
    clock: Clock,
    max_body_bytes: usize,
    debug_routes: bool,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        store: Arc<dyn InvoiceStore>,
        gateway: Arc<dyn PaymentGateway>,
        verifier: Arc<dyn PaymentVerifier>,
        checkout: CheckoutSettings,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            metrics,
            reconciler: Reconciler::new(store.clone()),
            store,
            gateway,
            verifier,
            checkout: Arc::new(checkout),
            clock: Arc::new(Utc::now),
            max_body_bytes,
            debug_routes: false,
        }
    }

    /// Enables the `/debug` routes.
    pub fn with_debug_routes(mut self, enabled: bool) -> Self {
        self.debug_routes = enabled;
        self
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn store(&self) -> &Arc<dyn InvoiceStore> {
        &self.store
    }

    pub fn gateway(&self) -> &Arc<dyn PaymentGateway> {
        &self.gateway
    }

    pub fn verifier(&self) -> &Arc<dyn PaymentVerifier> {
        &self.verifier
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn checkout(&self) -> &CheckoutSettings {
        &self.checkout
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

pub fn app_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/webhook", post(webhook::handle))
        .route("/checkout-sessions", post(checkout::create_checkout_session))
        .route("/payment-intents", post(checkout::create_payment_intent));
    if state.debug_routes {
        router = router.route("/debug/invoices/:id/mark-paid", post(checkout::debug_mark_paid));
    }

    router
        .layer(middleware::from_fn_with_state(
            state.clone(),
            body::capture_body,
        ))
        .with_state(state)
}

async fn root() -> &'static str {
    "payrelay is running"
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}
