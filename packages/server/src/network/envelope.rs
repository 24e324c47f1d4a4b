//! Response envelope applied to API responses.
//!
//! Successful JSON responses under the API prefix become
//! `{status, message: "success", timestamp, data}`. Middleware errors (bodies
//! flagged `is_middleware_error`) become `{status, message, timestamp}` with
//! HTTP 200. Invocation failures are already in their final shape and pass
//! through, as do streams, raw-output routes and the API description.

use axum::body::{to_bytes, Body};
use axum::extract::Request;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use framex_core::consts::{API_PREFIX, OPENAPI_PATH};
use serde_json::{json, Value};
use tracing::warn;

/// Set by routes whose responses must not be wrapped.
pub const RAW_OUTPUT_HEADER: &str = "x-raw-output";

/// Marks a response produced by [`error_payload`].
pub const ERROR_PAYLOAD_HEADER: &str = "x-framex-error";

/// Largest response body the envelope will buffer.
const MAX_WRAPPED_BYTES: usize = 16 * 1024 * 1024;

/// Local wall-clock time in the envelope's format.
#[must_use]
pub fn timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// A `{status, message, is_middleware_error}` response with `status` as
/// the HTTP status.
pub fn middleware_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({
            "status": status.as_u16(),
            "message": message.into(),
            "is_middleware_error": true,
        })),
    )
        .into_response()
}

/// A failed invocation: `{status, message, timestamp}` with HTTP 200.
pub fn error_payload(status: u16, message: impl Into<String>) -> Response {
    (
        [(ERROR_PAYLOAD_HEADER, "true")],
        Json(json!({
            "status": status,
            "message": message.into(),
            "timestamp": timestamp(),
        })),
    )
        .into_response()
}

fn header_is(response: &Response, name: &str, predicate: impl Fn(&str) -> bool) -> bool {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .is_some_and(predicate)
}

fn skips_envelope(path: &str) -> bool {
    !path.starts_with(API_PREFIX) || path == OPENAPI_PATH || path.starts_with("/docs")
}

/// `axum::middleware::from_fn` body that applies the envelope.
pub async fn wrap_response(request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    let mut response = next.run(request).await;

    let failed = response.headers_mut().remove(ERROR_PAYLOAD_HEADER).is_some();
    if failed || skips_envelope(&path) {
        return response;
    }
    if header_is(&response, RAW_OUTPUT_HEADER, |v| v.eq_ignore_ascii_case("true")) {
        response.headers_mut().remove(RAW_OUTPUT_HEADER);
        return response;
    }
    if !header_is(&response, CONTENT_TYPE.as_str(), |v| v.starts_with("application/json")) {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match to_bytes(body, MAX_WRAPPED_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(path = %path, error = %err, "could not buffer response for wrapping");
            let mut failed = error_payload(500, "response body could not be read");
            failed.headers_mut().remove(ERROR_PAYLOAD_HEADER);
            return failed;
        }
    };
    let Ok(payload) = serde_json::from_slice::<Value>(&bytes) else {
        return Response::from_parts(parts, Body::from(bytes));
    };

    let wrapped = if payload.get("is_middleware_error") == Some(&Value::Bool(true)) {
        json!({
            "status": payload.get("status").cloned().unwrap_or(Value::Null),
            "message": payload.get("message").cloned().unwrap_or(Value::Null),
            "timestamp": timestamp(),
        })
    } else if parts.status.is_success() {
        json!({
            "status": parts.status.as_u16(),
            "message": "success",
            "timestamp": timestamp(),
            "data": payload,
        })
    } else {
        return Response::from_parts(parts, Body::from(bytes));
    };

    let body = match serde_json::to_vec(&wrapped) {
        Ok(body) => body,
        Err(err) => {
            let mut failed = error_payload(500, err.to_string());
            failed.headers_mut().remove(ERROR_PAYLOAD_HEADER);
            return failed;
        }
    };
    parts.status = StatusCode::OK;
    parts.headers.remove(CONTENT_LENGTH);
    parts
        .headers
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Response::from_parts(parts, Body::from(body))
}
