use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;
use tracing::warn;
use url::Url;

use payrelay_core::{
    events::INVOICE_METADATA_KEY, CheckoutRequest, CheckoutSession, GatewayError, PaymentGateway,
    PaymentIntent, PaymentIntentRequest,
};

/// Client for creating checkout sessions and payment intents.
#[derive(Clone)]
pub struct ProcessorClient {
    http: Client,
    base_url: Url,
    secret_key: String,
}

impl ProcessorClient {
    /// Creates a new client. `base_url` should end with a slash so relative
    /// paths join beneath it.
    pub fn new(secret_key: impl Into<String>, base_url: Url, http: Client) -> Self {
        Self {
            http,
            base_url,
            secret_key: secret_key.into(),
        }
    }

    /// Creates a hosted checkout session in payment mode.
    pub async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, ProviderError> {
        let url = self.base_url.join("checkout/sessions")?;
        let response = self.post_form(url, &checkout_form(request)).await?;
        let session: SessionResponse = parse_json(response).await?;
        let url = session
            .url
            .filter(|url| !url.is_empty())
            .ok_or(ProviderError::MissingField("url"))?;
        Ok(CheckoutSession {
            id: session.id,
            url,
        })
    }

    /// Creates a payment intent for a client-side payment form.
    pub async fn create_payment_intent(
        &self,
        request: &PaymentIntentRequest,
    ) -> Result<PaymentIntent, ProviderError> {
        let url = self.base_url.join("payment_intents")?;
        let response = self.post_form(url, &payment_intent_form(request)).await?;
        let intent: IntentResponse = parse_json(response).await?;
        let client_secret = intent
            .client_secret
            .filter(|secret| !secret.is_empty())
            .ok_or(ProviderError::MissingField("client_secret"))?;
        Ok(PaymentIntent {
            id: intent.id,
            client_secret,
        })
    }

    async fn post_form(
        &self,
        url: Url,
        form: &[(String, String)],
    ) -> Result<Response, ProviderError> {
        Ok(self
            .http
            .post(url)
            .bearer_auth(&self.secret_key)
            .form(form)
            .send()
            .await?)
    }
}

#[async_trait]
impl PaymentGateway for ProcessorClient {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, GatewayError> {
        ProcessorClient::create_checkout_session(self, request)
            .await
            .map_err(GatewayError::from)
    }

    async fn create_payment_intent(
        &self,
        request: &PaymentIntentRequest,
    ) -> Result<PaymentIntent, GatewayError> {
        ProcessorClient::create_payment_intent(self, request)
            .await
            .map_err(GatewayError::from)
    }
}

/// Errors produced by the processor client.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("response missing field: {0}")]
    MissingField(&'static str),
}

impl From<ProviderError> for GatewayError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Status { status, body } => GatewayError::Rejected {
                status: status.as_u16(),
                message: error_message(&body).unwrap_or(body),
            },
            ProviderError::Http(err) if err.is_decode() => {
                GatewayError::InvalidResponse(err.to_string())
            }
            ProviderError::Http(err) => GatewayError::Transport(err.to_string()),
            ProviderError::Url(err) => GatewayError::Transport(err.to_string()),
            ProviderError::MissingField(field) => {
                GatewayError::InvalidResponse(format!("missing {field}"))
            }
        }
    }
}

fn checkout_form(request: &CheckoutRequest) -> Vec<(String, String)> {
    let mut form = vec![("mode".to_string(), "payment".to_string())];
    for (index, item) in request.line_items.iter().enumerate() {
        let prefix = format!("line_items[{index}]");
        form.push((
            format!("{prefix}[price_data][currency]"),
            request.currency.clone(),
        ));
        form.push((
            format!("{prefix}[price_data][product_data][name]"),
            item.name.clone(),
        ));
        form.push((
            format!("{prefix}[price_data][unit_amount]"),
            item.unit_amount.to_string(),
        ));
        form.push((format!("{prefix}[quantity]"), item.quantity.to_string()));
    }
    form.push(("success_url".to_string(), request.success_url.clone()));
    form.push(("cancel_url".to_string(), request.cancel_url.clone()));

    if let Some(invoice_id) = &request.invoice_id {
        form.push((format!("metadata[{INVOICE_METADATA_KEY}]"), invoice_id.clone()));
        form.push((
            format!("payment_intent_data[metadata][{INVOICE_METADATA_KEY}]"),
            invoice_id.clone(),
        ));
        form.push(("client_reference_id".to_string(), invoice_id.clone()));
    }
    form
}

fn payment_intent_form(request: &PaymentIntentRequest) -> Vec<(String, String)> {
    vec![
        ("amount".to_string(), request.amount.to_string()),
        ("currency".to_string(), request.currency.clone()),
        (
            format!("metadata[{INVOICE_METADATA_KEY}]"),
            request.invoice_id.clone(),
        ),
        (
            "automatic_payment_methods[enabled]".to_string(),
            "true".to_string(),
        ),
    ]
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    id: String,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IntentResponse {
    id: String,
    #[serde(default)]
    client_secret: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

fn error_message(body: &str) -> Option<String> {
    serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .and_then(|envelope| envelope.error.message)
}

async fn parse_json<T>(response: Response) -> Result<T, ProviderError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        warn!(stage = "provider", status = status.as_u16(), "processor returned an error status");
        return Err(ProviderError::Status { status, body });
    }

    Ok(response.json().await?)
}
