//! Fallback handler serving every dynamically registered route.
//!
//! Request flow: route lookup, authorization, argument collection (query,
//! path captures, JSON body), validation against the route's model, then the
//! invocation pipeline. Streaming results are relayed as server-sent events.

use std::collections::HashMap;
use std::convert::Infallible;
use std::str::FromStr;

use axum::body::{to_bytes, Body, Bytes};
use axum::extract::{Query, Request, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use framex_core::event::frame_chunk;
use framex_core::{make_stream_event, HttpMethod, Kwargs, StreamEventType};
use futures_util::StreamExt;
use serde_json::Value;
use tower::ServiceExt;
use tracing::warn;

use super::AppState;
use crate::adapter::ChunkStream;
use crate::error::InvokeError;
use crate::network::auth::authorize;
use crate::network::envelope::{error_payload, middleware_error, RAW_OUTPUT_HEADER};
use crate::network::routes::{RouteEntry, RouteMatch};
use crate::network::InvocationGuard;
use crate::service::{Invocation, InvocationOutput};

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Resolves the request against the live route table and invokes the
/// matched operation.
pub async fn dispatch_handler(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();
    let method = HttpMethod::from_str(parts.method.as_str()).ok();

    let (entry, captures) = match state.routes.find(method, &path) {
        RouteMatch::Found { entry, captures } => (entry, captures),
        RouteMatch::MethodNotAllowed => {
            return middleware_error(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed")
        }
        RouteMatch::NotFound => return middleware_error(StatusCode::NOT_FOUND, "Not Found"),
    };

    if let Some(keys) = &entry.auth_keys {
        if let Err(rejection) = authorize(&parts.headers, keys, state.oauth.as_deref(), &path) {
            return middleware_error(rejection.status, rejection.message);
        }
    }

    let arguments = match collect_arguments(&entry, &parts.uri, captures, body).await {
        Ok(arguments) => arguments,
        Err(response) => return response,
    };
    let kwargs = match entry.model.validate(&arguments) {
        Ok(kwargs) => kwargs,
        Err(err) => return middleware_error(StatusCode::UNPROCESSABLE_ENTITY, err.to_string()),
    };

    let guard = state.lifecycle.invocation_guard();
    let invocation = Invocation {
        api: entry.api.clone(),
        kwargs,
        timeout: state.invocation_timeout,
    };
    match state.pipeline.clone().oneshot(invocation).await {
        Ok(InvocationOutput::Value(value)) => json_response(value, entry.direct_output),
        Ok(InvocationOutput::Stream(chunks)) => sse_response(chunks, guard),
        Err(err) => {
            warn!(path = %path, error = %err, "invocation failed");
            invocation_error(&err)
        }
    }
}

fn insert_query_value(kwargs: &mut Kwargs, key: String, value: String) {
    match kwargs.get_mut(&key) {
        Some(Value::Array(values)) => values.push(Value::String(value)),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, Value::String(value)]);
        }
        None => {
            kwargs.insert(key, Value::String(value));
        }
    }
}

async fn collect_arguments(
    entry: &RouteEntry,
    uri: &Uri,
    captures: HashMap<String, String>,
    body: Body,
) -> Result<Kwargs, Response> {
    let mut kwargs = Kwargs::new();

    if let Ok(Query(pairs)) = Query::<Vec<(String, String)>>::try_from_uri(uri) {
        for (key, value) in pairs {
            insert_query_value(&mut kwargs, key, value);
        }
    }
    for (name, value) in captures {
        kwargs.insert(name, Value::String(value));
    }

    let bytes = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|err| middleware_error(StatusCode::PAYLOAD_TOO_LARGE, err.to_string()))?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(kwargs);
    }
    let payload: Value = serde_json::from_slice(&bytes).map_err(|err| {
        middleware_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("invalid JSON body: {err}"),
        )
    })?;
    match (entry.model.structured_field(), payload) {
        (Some(field), payload) => {
            kwargs.insert(field.name.clone(), payload);
        }
        (None, Value::Object(fields)) => kwargs.extend(fields),
        (None, _) => {
            return Err(middleware_error(
                StatusCode::UNPROCESSABLE_ENTITY,
                "request body must be a JSON object",
            ))
        }
    }
    Ok(kwargs)
}

fn json_response(value: Value, direct_output: bool) -> Response {
    let mut response = Json(value).into_response();
    if direct_output {
        response
            .headers_mut()
            .insert(RAW_OUTPUT_HEADER, HeaderValue::from_static("true"));
    }
    response
}

fn sse_response(chunks: ChunkStream, guard: InvocationGuard) -> Response {
    let frames = async_stream::stream! {
        let _guard = guard;
        let mut chunks = chunks;
        while let Some(item) = chunks.next().await {
            match item {
                Ok(chunk) => yield Ok::<Bytes, Infallible>(Bytes::from(frame_chunk(&chunk))),
                Err(err) => {
                    warn!(error = %err, "stream aborted");
                    yield Ok(Bytes::from(make_stream_event(StreamEventType::Error, err.to_string())));
                    break;
                }
            }
        }
    };
    (
        [
            (CONTENT_TYPE, "text/event-stream; charset=utf-8"),
            (CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(frames),
    )
        .into_response()
}

fn invocation_error(err: &InvokeError) -> Response {
    match err {
        InvokeError::InvalidArguments(invalid) => {
            middleware_error(StatusCode::UNPROCESSABLE_ENTITY, invalid.to_string())
        }
        InvokeError::Overloaded => error_payload(503, err.to_string()),
        InvokeError::Timeout { .. } => error_payload(504, err.to_string()),
        _ => error_payload(500, err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::routing::get;
    use axum::Router;
    use framex_core::{Param, ParamType};
    use serde_json::json;

    use super::*;
    use crate::adapter::testing::StubHandle;
    use crate::config::AuthConfig;
    use crate::network::handlers::testing::{harness, Harness};
    use crate::network::routes::RouteSpec;

    fn route(path: &str, function: &str, methods: &[HttpMethod], params: Vec<Param>) -> RouteSpec {
        RouteSpec {
            path: path.to_string(),
            methods: methods.to_vec(),
            function_name: function.to_string(),
            params,
            target: "echo.EchoPlugin".to_string(),
            stream: false,
            direct_output: false,
            tags: Vec::new(),
            auth_keys: None,
        }
    }

    fn stub() -> StubHandle {
        StubHandle::new("echo.EchoPlugin")
            .returning("__call__", json!("hi"))
            .streaming("echo_stream", &["a", "b", "finish"])
    }

    fn router(harness: &Harness) -> Router {
        Router::new()
            .route("/health", get(|| async { "ok" }))
            .fallback(dispatch_handler)
            .with_state(harness.state.clone())
    }

    async fn send(harness: &Harness, request: Request) -> (StatusCode, Value) {
        let response = router(harness).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn get_request(uri: &str) -> Request {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn query_arguments_are_validated_and_forwarded() {
        let harness = harness(stub(), AuthConfig::default()).await;
        harness
            .registrar
            .add_route(&route(
                "/api/v1/echo",
                "__call__",
                &[HttpMethod::Get],
                vec![Param::new("message", ParamType::String)],
            ))
            .unwrap();

        let (status, body) = send(&harness, get_request("/api/v1/echo?message=hi")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!("hi"));

        let (status, body) = send(&harness, get_request("/api/v1/echo")).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["is_middleware_error"], true);
    }

    #[tokio::test]
    async fn unknown_paths_and_methods_are_middleware_errors() {
        let harness = harness(stub(), AuthConfig::default()).await;
        harness
            .registrar
            .add_route(&route("/api/v1/echo", "__call__", &[HttpMethod::Get], Vec::new()))
            .unwrap();

        let (status, _) = send(&harness, get_request("/api/v1/missing")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let post = Request::builder()
            .method("POST")
            .uri("/api/v1/echo")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&harness, post).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(body["status"], 405);
    }

    #[tokio::test]
    async fn protected_routes_check_keys() {
        let auth = AuthConfig {
            general_auth_keys: vec!["secret".into()],
            auth_urls: vec!["/api/v1/echo".into()],
            special_auth_keys: HashMap::new(),
            oauth: None,
        };
        let harness = harness(stub(), auth).await;
        harness
            .registrar
            .add_route(&route("/api/v1/echo", "__call__", &[HttpMethod::Get], Vec::new()))
            .unwrap();

        let (status, body) = send(&harness, get_request("/api/v1/echo")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["message"], "Not authenticated");

        let wrong = Request::builder()
            .uri("/api/v1/echo")
            .header("Authorization", "error_key")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&harness, wrong).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["message"], "Invalid API Key(error_key) for API(/api/v1/echo)");

        let right = Request::builder()
            .uri("/api/v1/echo")
            .header("Authorization", "secret")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&harness, right).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!("hi"));
    }

    #[tokio::test]
    async fn json_body_fills_the_structured_parameter() {
        let model = framex_core::ModelSchema::new(
            "Item",
            vec![framex_core::FieldDef {
                name: "id".into(),
                ty: ParamType::Integer,
                required: true,
                default: None,
            }],
        );
        let harness = harness(
            StubHandle::new("echo.EchoPlugin").returning("save", json!("saved")),
            AuthConfig::default(),
        )
        .await;
        harness
            .registrar
            .add_route(&route(
                "/api/v1/items/{group}",
                "save",
                &[HttpMethod::Post],
                vec![
                    Param::new("group", ParamType::String),
                    Param::new("item", ParamType::Model(model)),
                ],
            ))
            .unwrap();

        let post = Request::builder()
            .method("POST")
            .uri("/api/v1/items/tools")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"id": "3"}"#))
            .unwrap();
        let (status, body) = send(&harness, post).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!("saved"));

        let call = &harness.stub.calls_to("save")[0];
        assert_eq!(call["group"], "tools");
        assert_eq!(call["item"], json!({"id": 3}));
    }

    #[tokio::test]
    async fn streaming_routes_emit_sse_frames() {
        let harness = harness(stub(), AuthConfig::default()).await;
        let mut spec = route("/api/v1/echo_stream", "echo_stream", &[HttpMethod::Get], Vec::new());
        spec.stream = true;
        harness.registrar.add_route(&spec).unwrap();

        let response = router(&harness)
            .oneshot(get_request("/api/v1/echo_stream"))
            .await
            .unwrap();
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            "text/event-stream; charset=utf-8"
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let events: Vec<&str> = text
            .lines()
            .filter_map(|line| line.strip_prefix("event: "))
            .collect();
        assert_eq!(events, vec!["message_chunk", "message_chunk", "finish"]);
        assert_eq!(harness.state.lifecycle.in_flight(), 0);
    }

    #[tokio::test]
    async fn callee_failures_become_error_payloads() {
        let harness = harness(stub(), AuthConfig::default()).await;
        harness
            .registrar
            .add_route(&route("/api/v1/broken", "missing", &[HttpMethod::Get], Vec::new()))
            .unwrap();
        let (status, body) = send(&harness, get_request("/api/v1/broken")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], 500);
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn raw_output_routes_are_flagged() {
        let harness = harness(stub(), AuthConfig::default()).await;
        let mut spec = route("/api/v1/raw", "__call__", &[HttpMethod::Get], Vec::new());
        spec.direct_output = true;
        harness.registrar.add_route(&spec).unwrap();
        let response = router(&harness).oneshot(get_request("/api/v1/raw")).await.unwrap();
        assert_eq!(response.headers()[RAW_OUTPUT_HEADER], "true");
    }
}
