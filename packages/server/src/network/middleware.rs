//! HTTP middleware stack for the plugin host.
//!
//! Builds the Tower middleware pipeline applied to all HTTP requests.
//! Middleware ordering follows the outer-to-inner convention: the first
//! layer listed is the outermost (processes the request first on the way
//! in, and the response last on the way out).

use axum::http::header::HeaderName;
use axum::http::{Method, StatusCode};
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::limit::{RequestBodyLimitLayer, ResponseBody as LimitResponseBody};
use tower_http::map_response_body::MapResponseBodyLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use super::handlers::dispatch::MAX_BODY_BYTES;
use crate::config::ServerSettings;

/// The composed Tower layer type produced by [`build_http_layers`].
///
/// Each layer wraps the next in a `Stack`, from outermost (first applied)
/// to innermost (last applied).
type HttpLayers = tower::layer::util::Stack<
    PropagateRequestIdLayer,
    tower::layer::util::Stack<
        TimeoutLayer,
        tower::layer::util::Stack<
            RequestBodyLimitLayer,
            tower::layer::util::Stack<
                MapResponseBodyLayer<fn(LimitResponseBody<axum::body::Body>) -> axum::body::Body>,
                tower::layer::util::Stack<
                    CorsLayer,
                    tower::layer::util::Stack<
                        CompressionLayer,
                        tower::layer::util::Stack<
                            TraceLayer<
                                tower_http::classify::SharedClassifier<
                                    tower_http::classify::ServerErrorsAsFailures,
                                >,
                            >,
                            tower::layer::util::Stack<
                                SetRequestIdLayer<MakeRequestUuid>,
                                tower::layer::util::Identity,
                            >,
                        >,
                    >,
                >,
            >,
        >,
    >,
>;

/// Builds the HTTP-level Tower middleware stack from the server settings.
///
/// **Middleware ordering (outermost to innermost):**
/// 1. `SetRequestId` -- assigns a UUID v4 `X-Request-Id` to every incoming request
/// 2. `Tracing` -- logs request/response with structured trace spans
/// 3. `Compression` -- gzip response compression (event streams are exempt)
/// 4. `CORS` -- Cross-Origin Resource Sharing based on configured origins
/// 5. `RequestBodyLimit` -- rejects oversized request bodies
/// 6. `Timeout` -- bounds the time until response headers are produced
/// 7. `PropagateRequestId` -- copies `X-Request-Id` from the request to the response
///
/// Invocation-level middleware (load shedding, per-invocation timeout, span
/// metrics) lives in the service pipeline.
#[must_use]
pub fn build_http_layers(settings: &ServerSettings) -> HttpLayers {
    let x_request_id = HeaderName::from_static("x-request-id");

    let cors = build_cors_layer(&settings.cors_origins);

    ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(
            x_request_id.clone(),
            MakeRequestUuid,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        // CORS requires a `Default` response body; the body-limit body is not.
        .layer(MapResponseBodyLayer::new(
            axum::body::Body::new as fn(LimitResponseBody<axum::body::Body>) -> axum::body::Body,
        ))
        // Outside the timeout: the timeout needs a `Default` response body.
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            settings.request_timeout(),
        ))
        .layer(PropagateRequestIdLayer::new(x_request_id))
        .into_inner()
}

/// Builds the CORS layer from the configured list of allowed origins.
///
/// A wildcard `"*"` in the origins list allows any origin. Otherwise,
/// each origin string is parsed and added to an explicit allowlist.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let parsed: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        AllowOrigin::list(parsed)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers(Any)
}
