//! Webhook signature verification.
//!
//! The processor signs `"<unix timestamp>." ++ body` with HMAC-SHA256 using the
//! endpoint's shared secret and sends `t=<timestamp>,v1=<hex>` in the signature
//! header. Several `v1` entries may be present while a secret is being rolled.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::events::{EventError, InboundEvent};
use crate::ports::PaymentVerifier;

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_TOLERANCE_SECS: u64 = 300;

/// Reasons a delivery fails verification. None of them carry secret material.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("webhook secret is not configured")]
    MissingSecret,
    #[error("signature header is missing")]
    MissingHeader,
    #[error("raw body is empty")]
    EmptyBody,
    #[error("malformed signature header: {0}")]
    MalformedHeader(&'static str),
    #[error("signature header carries no v1 signatures")]
    NoSignatures,
    #[error("timestamp is {skew_secs}s away from now")]
    TimestampOutOfTolerance { skew_secs: i64 },
    #[error("signature mismatch")]
    Mismatch,
    #[error("failed to initialize signature verifier")]
    KeyInit,
}

impl SignatureError {
    /// Bounded label for metrics.
    pub fn metric_reason(&self) -> &'static str {
        match self {
            Self::MissingSecret => "missing_secret",
            Self::MissingHeader => "missing_header",
            Self::EmptyBody => "empty_body",
            Self::MalformedHeader(_) | Self::NoSignatures => "malformed_header",
            Self::TimestampOutOfTolerance { .. } => "timestamp",
            Self::Mismatch => "mismatch",
            Self::KeyInit => "key_init",
        }
    }
}

/// Failure of [`PaymentVerifier::verify`].
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error("signed payload could not be decoded: {0}")]
    Payload(#[from] EventError),
}

/// Parsed `t=...,v1=...` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    pub timestamp: i64,
    pub signatures: Vec<Vec<u8>>,
}

impl SignatureHeader {
    pub fn parse(header: &str) -> Result<Self, SignatureError> {
        let mut timestamp = None;
        let mut signatures = Vec::new();

        for part in header.split(',') {
            let (key, value) = part
                .trim()
                .split_once('=')
                .ok_or(SignatureError::MalformedHeader("expected key=value pairs"))?;
            match key {
                "t" => {
                    if timestamp.is_some() {
                        return Err(SignatureError::MalformedHeader("duplicate timestamp"));
                    }
                    let parsed = value
                        .parse::<i64>()
                        .map_err(|_| SignatureError::MalformedHeader("timestamp is not an integer"))?;
                    timestamp = Some(parsed);
                }
                "v1" => {
                    let bytes = hex::decode(value)
                        .map_err(|_| SignatureError::MalformedHeader("v1 signature is not hex"))?;
                    signatures.push(bytes);
                }
                // v0 and future schemes are not trusted.
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(SignatureError::MalformedHeader("missing timestamp"))?;
        if signatures.is_empty() {
            return Err(SignatureError::NoSignatures);
        }

        Ok(Self {
            timestamp,
            signatures,
        })
    }
}

/// HMAC-SHA256 verifier for processor webhooks.
#[derive(Clone)]
pub struct HmacVerifier {
    secret: Option<Arc<[u8]>>,
    tolerance_secs: i64,
}

impl HmacVerifier {
    /// Creates a verifier. A `None` or empty secret rejects every delivery.
    pub fn new(secret: Option<&str>, tolerance_secs: u64) -> Self {
        let secret = secret
            .filter(|value| !value.is_empty())
            .map(|value| Arc::<[u8]>::from(value.as_bytes()));
        Self {
            secret,
            tolerance_secs: i64::try_from(tolerance_secs).unwrap_or(i64::MAX),
        }
    }

    /// Checks `header` against `raw_body` without decoding the payload.
    pub fn check(
        &self,
        raw_body: &[u8],
        header: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), SignatureError> {
        let secret = self.secret.as_ref().ok_or(SignatureError::MissingSecret)?;
        let header = header
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(SignatureError::MissingHeader)?;
        if raw_body.is_empty() {
            return Err(SignatureError::EmptyBody);
        }

        let parsed = SignatureHeader::parse(header)?;
        let skew_secs = now.timestamp().saturating_sub(parsed.timestamp);
        if skew_secs.saturating_abs() > self.tolerance_secs {
            return Err(SignatureError::TimestampOutOfTolerance { skew_secs });
        }

        let expected = compute_signature(secret, parsed.timestamp, raw_body)?;
        let matched = parsed
            .signatures
            .iter()
            .any(|candidate| bool::from(expected.as_slice().ct_eq(candidate.as_slice())));
        if matched {
            Ok(())
        } else {
            Err(SignatureError::Mismatch)
        }
    }
}

impl PaymentVerifier for HmacVerifier {
    fn verify(
        &self,
        raw_body: &[u8],
        signature_header: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<InboundEvent, VerifyError> {
        self.check(raw_body, signature_header, now)?;
        Ok(InboundEvent::from_slice(raw_body)?)
    }
}

fn compute_signature(secret: &[u8], timestamp: i64, body: &[u8]) -> Result<Vec<u8>, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| SignatureError::KeyInit)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Builds a `t=...,v1=...` header the way the processor does.
pub fn signature_header(secret: &str, timestamp: i64, body: &[u8]) -> Result<String, SignatureError> {
    let signature = compute_signature(secret.as_bytes(), timestamp, body)?;
    Ok(format!("t={timestamp},v1={}", hex::encode(signature)))
}
