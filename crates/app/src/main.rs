mod body;
mod checkout;
mod problem;
mod router;
mod telemetry;
mod webhook;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use payrelay_core::HmacVerifier;
use payrelay_provider::ProcessorClient;
use payrelay_storage::Database;
use payrelay_util::{load_env_file, AppConfig};
use tokio::signal;
use tracing::{info, warn};
use url::Url;

use crate::router::CheckoutSettings;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;
    info!(stage = "storage", "database ready");

    let payment = &config.payment;
    if payment.webhook_secret.is_none() {
        warn!(stage = "app", "PAYMENT_WEBHOOK_SECRET is not set; every webhook delivery will be rejected");
    }
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;
    let gateway = ProcessorClient::new(
        payment.secret_key.clone(),
        Url::parse(&payment.api_base)?,
        http,
    );
    let verifier = HmacVerifier::new(
        payment.webhook_secret.as_deref(),
        payment.webhook_tolerance_secs,
    );

    let state = router::AppState::new(
        metrics,
        Arc::new(database.invoices()),
        Arc::new(gateway),
        Arc::new(verifier),
        CheckoutSettings {
            success_url: payment.success_url.clone(),
            cancel_url: payment.cancel_url.clone(),
            default_currency: payment.default_currency.clone(),
        },
        config.max_body_bytes,
    )
    .with_debug_routes(config.environment.is_development());

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    database.pool().close().await;
    info!(stage = "app", "server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(stage = "app", error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(stage = "app", error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!(stage = "app", "shutdown signal received");
}
