//! Request body capture.
//!
//! [`capture_body`] runs in front of every route and is the only code that
//! reads the body stream. It buffers the bytes once, decodes JSON from that
//! same buffer when the content type asks for it, and leaves a
//! [`CapturedBody`] in the request extensions. Handlers read it back through
//! the [`RawBody`] and [`JsonBody`] extractors.

use axum::{
    body::{Body, Bytes},
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::problem::ProblemResponse;
use crate::router::AppState;

/// Buffered body of the current request.
#[derive(Debug, Clone)]
pub struct CapturedBody {
    pub raw: Bytes,
    pub parsed: Arc<ParsedBody>,
}

/// Outcome of the JSON decode attempt made by the capture layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedBody {
    /// Content type was not JSON, so no decode was attempted.
    NotJson,
    Json(Value),
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum BodyError {
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },
    #[error("malformed content type")]
    MalformedContentType,
    #[error("failed to read request body: {0}")]
    Unreadable(String),
    #[error("request body was not captured")]
    BodyUnavailable,
    #[error("expected a JSON content type")]
    NotJson,
    #[error("request body is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("request body has an unexpected shape: {0}")]
    InvalidShape(String),
}

impl From<BodyError> for ProblemResponse {
    fn from(err: BodyError) -> Self {
        let (status, problem_type) = match &err {
            BodyError::PayloadTooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large"),
            BodyError::MalformedContentType => (StatusCode::BAD_REQUEST, "malformed_content_type"),
            BodyError::Unreadable(_) => (StatusCode::BAD_REQUEST, "body_unreadable"),
            BodyError::BodyUnavailable => (StatusCode::INTERNAL_SERVER_ERROR, "body_unavailable"),
            BodyError::NotJson => (StatusCode::UNSUPPORTED_MEDIA_TYPE, "unsupported_media_type"),
            BodyError::InvalidJson(_) => (StatusCode::BAD_REQUEST, "invalid_json"),
            BodyError::InvalidShape(_) => (StatusCode::BAD_REQUEST, "invalid_body"),
        };
        ProblemResponse::new(status, problem_type, err.to_string())
    }
}

impl IntoResponse for BodyError {
    fn into_response(self) -> Response {
        ProblemResponse::from(self).into_response()
    }
}

/// Middleware that buffers the body and attaches a [`CapturedBody`].
pub async fn capture_body(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, BodyError> {
    let limit = state.max_body_bytes();
    let (mut parts, body) = request.into_parts();

    if let Some(declared) = declared_length(&parts.headers) {
        if declared > limit as u64 {
            warn!(stage = "ingress", declared, limit, "declared body length over limit");
            return Err(BodyError::PayloadTooLarge { limit });
        }
    }
    let json = is_json_content_type(&parts.headers)?;

    let raw = match Limited::new(body, limit).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) if err.downcast_ref::<LengthLimitError>().is_some() => {
            warn!(stage = "ingress", limit, "body exceeded limit while reading");
            return Err(BodyError::PayloadTooLarge { limit });
        }
        Err(err) => return Err(BodyError::Unreadable(err.to_string())),
    };

    let parsed = if json {
        match serde_json::from_slice::<Value>(&raw) {
            Ok(value) => ParsedBody::Json(value),
            Err(err) => {
                debug!(stage = "ingress", body_len = raw.len(), "json body did not decode");
                ParsedBody::Invalid(err.to_string())
            }
        }
    } else {
        ParsedBody::NotJson
    };

    parts.extensions.insert(CapturedBody {
        raw,
        parsed: Arc::new(parsed),
    });
    Ok(next.run(Request::from_parts(parts, Body::empty())).await)
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

/// Returns whether the request declares a JSON media type. A missing header
/// is not JSON; a present header must look like `type/subtype`.
fn is_json_content_type(headers: &HeaderMap) -> Result<bool, BodyError> {
    let Some(value) = headers.get(header::CONTENT_TYPE) else {
        return Ok(false);
    };
    let value = value.to_str().map_err(|_| BodyError::MalformedContentType)?;
    let essence = value.split(';').next().unwrap_or_default().trim();
    let (kind, subtype) = essence
        .split_once('/')
        .ok_or(BodyError::MalformedContentType)?;
    let valid_token = |token: &str| {
        !token.is_empty()
            && token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "!#$&-^_.+*".contains(c))
    };
    if !valid_token(kind) || !valid_token(subtype) {
        return Err(BodyError::MalformedContentType);
    }

    let kind = kind.to_ascii_lowercase();
    let subtype = subtype.to_ascii_lowercase();
    Ok(kind == "application" && (subtype == "json" || subtype.ends_with("+json")))
}

fn captured(parts: &Parts) -> Result<&CapturedBody, BodyError> {
    parts
        .extensions
        .get::<CapturedBody>()
        .ok_or(BodyError::BodyUnavailable)
}

/// Exact bytes received on the wire.
#[derive(Debug, Clone)]
pub struct RawBody(pub Bytes);

#[axum::async_trait]
impl<S> FromRequestParts<S> for RawBody
where
    S: Send + Sync,
{
    type Rejection = BodyError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(captured(parts)?.raw.clone()))
    }
}

/// JSON body decoded by the capture layer, deserialized into `T`.
#[derive(Debug, Clone)]
pub struct JsonBody<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequestParts<S> for JsonBody<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = BodyError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        match captured(parts)?.parsed.as_ref() {
            ParsedBody::Json(value) => T::deserialize(value)
                .map(JsonBody)
                .map_err(|err| BodyError::InvalidShape(err.to_string())),
            ParsedBody::Invalid(reason) => Err(BodyError::InvalidJson(reason.clone())),
            ParsedBody::NotJson => Err(BodyError::NotJson),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(content_type: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        headers
    }

    #[test]
    fn recognizes_json_media_types() {
        assert!(is_json_content_type(&headers_with("application/json")).expect("valid"));
        assert!(
            is_json_content_type(&headers_with("Application/JSON; charset=utf-8")).expect("valid")
        );
        assert!(is_json_content_type(&headers_with("application/problem+json")).expect("valid"));
        assert!(!is_json_content_type(&headers_with("text/plain")).expect("valid"));
        assert!(!is_json_content_type(&HeaderMap::new()).expect("missing header"));
    }

    #[test]
    fn rejects_malformed_media_types() {
        for value in ["json", "application/", "/json", "application/json/x", "a b/json"] {
            let err = is_json_content_type(&headers_with(value)).expect_err(value);
            assert!(matches!(err, BodyError::MalformedContentType), "{value}");
        }
    }

    #[test]
    fn non_ascii_content_type_is_malformed() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_bytes(b"application/j\xf6son").expect("opaque header"),
        );
        assert!(matches!(
            is_json_content_type(&headers),
            Err(BodyError::MalformedContentType)
        ));
    }

    #[test]
    fn body_errors_map_to_problem_statuses() {
        let cases = [
            (BodyError::PayloadTooLarge { limit: 1 }, StatusCode::PAYLOAD_TOO_LARGE),
            (BodyError::MalformedContentType, StatusCode::BAD_REQUEST),
            (BodyError::Unreadable("reset".into()), StatusCode::BAD_REQUEST),
            (BodyError::BodyUnavailable, StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ProblemResponse::from(err).status(), status);
        }
    }
}
