//! Network module with deferred startup lifecycle.
//!
//! Implements the deferred startup pattern: `new()` takes the prepared
//! application state, `start()` binds the TCP listener, and `serve()` starts
//! accepting connections. Routes registered between `start()` and `serve()`
//! (or at any time later) become visible through the live route table.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::middleware::from_fn;
use axum::routing::get;
use axum::Router;
use framex_core::consts::OPENAPI_PATH;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::envelope::wrap_response;
use super::handlers::{
    detail_handler, dispatch_handler, health_handler, liveness_handler, openapi_handler,
    readiness_handler, AppState,
};
use super::middleware::build_http_layers;
use super::lifecycle::HostLifecycle;
use crate::config::ServerSettings;

/// How long `serve()` waits for in-flight invocations after the shutdown
/// signal.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Assembles the axum router with all routes and middleware.
///
/// Routes:
/// - `GET /health` -- plain `"ok"`
/// - `GET /health/live` -- Kubernetes liveness probe
/// - `GET /health/ready` -- Kubernetes readiness probe
/// - `GET /health/detail` -- state, plugins, route count, uptime
/// - `GET /api/v1/openapi.json` -- API description of the live routes
/// - everything else -- the dynamic route dispatcher
pub fn build_router(state: AppState, settings: &ServerSettings) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .route("/health/detail", get(detail_handler))
        .route(OPENAPI_PATH, get(openapi_handler))
        .fallback(dispatch_handler)
        .layer(from_fn(wrap_response))
        .layer(build_http_layers(settings))
        .with_state(state)
}

/// Manages the HTTP server lifecycle.
pub struct NetworkModule {
    settings: ServerSettings,
    state: AppState,
    listener: Option<TcpListener>,
}

impl NetworkModule {
    /// Creates a new network module without binding any port.
    #[must_use]
    pub fn new(settings: ServerSettings, state: AppState) -> Self {
        Self {
            settings,
            state,
            listener: None,
        }
    }

    #[must_use]
    pub fn lifecycle(&self) -> Arc<HostLifecycle> {
        Arc::clone(&self.state.lifecycle)
    }

    #[must_use]
    pub fn build_router(&self) -> Router {
        build_router(self.state.clone(), &self.settings)
    }

    /// Binds the TCP listener to the configured host and port.
    ///
    /// Returns the actual bound port, which may differ from the configured
    /// port when port 0 is used (OS-assigned ephemeral port).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g., port in use).
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.settings.host, self.settings.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!("TCP listener bound to {}:{}", self.settings.host, port);

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves connections until the shutdown signal fires, then drains.
    ///
    /// After the shutdown signal:
    /// 1. Health state transitions to Draining
    /// 2. Waits up to [`DRAIN_TIMEOUT`] for in-flight invocations to complete
    /// 3. Health state transitions to Stopped
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called first, or if the server
    /// encounters a fatal I/O error.
    pub async fn serve(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let router = self.build_router();
        let listener = self
            .listener
            .ok_or_else(|| anyhow::anyhow!("start() must be called before serve()"))?;
        let lifecycle = self.state.lifecycle;

        // Ready once every start hook has also returned.
        lifecycle.mark_serving();
        info!("Serving HTTP connections");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        lifecycle.begin_drain();
        if lifecycle.drain(DRAIN_TIMEOUT).await {
            info!("All in-flight invocations drained");
        } else {
            warn!("Drain timeout expired with in-flight invocations remaining");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::extract::Request;
    use framex_core::{HttpMethod, Param, ParamType};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::adapter::testing::StubHandle;
    use crate::config::AuthConfig;
    use crate::network::handlers::dispatch::MAX_BODY_BYTES;
    use crate::network::handlers::testing::harness;
    use crate::network::routes::RouteSpec;
    use crate::network::HealthState;

    fn echo_route() -> RouteSpec {
        RouteSpec {
            path: "/api/v1/echo".into(),
            methods: vec![HttpMethod::Get],
            function_name: "__call__".into(),
            params: vec![Param::new("message", ParamType::String)],
            target: "echo.EchoPlugin".into(),
            stream: false,
            direct_output: false,
            tags: Vec::new(),
            auth_keys: None,
        }
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn router_wraps_dynamic_routes_in_the_envelope() {
        let harness = harness(
            StubHandle::new("echo.EchoPlugin").returning("__call__", json!("hi")),
            AuthConfig::default(),
        )
        .await;
        let router = build_router(harness.state.clone(), &ServerSettings::default());
        harness.registrar.add_route(&echo_route()).unwrap();

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/echo?message=hi")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["status"], 200);
        assert_eq!(body["message"], "success");
        assert_eq!(body["data"], "hi");

        let missing = router
            .oneshot(Request::builder().uri("/api/v1/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(missing).await;
        assert_eq!(body["status"], 404);
        assert!(body.get("data").is_none());
    }

    #[tokio::test]
    async fn invocation_failures_reach_clients_as_error_payloads() {
        let harness = harness(StubHandle::new("echo.EchoPlugin"), AuthConfig::default()).await;
        let mut broken = echo_route();
        broken.path = "/api/v1/broken".into();
        broken.function_name = "missing".into();
        broken.params = Vec::new();
        harness.registrar.add_route(&broken).unwrap();
        let router = build_router(harness.state.clone(), &ServerSettings::default());

        let response = router
            .oneshot(Request::builder().uri("/api/v1/broken").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], 500);
        assert_ne!(body["message"], "success");
        assert!(body["timestamp"].is_string());
        assert!(body.get("data").is_none());
    }

    #[tokio::test]
    async fn oversized_bodies_are_rejected_before_dispatch() {
        let harness = harness(StubHandle::new("echo.EchoPlugin"), AuthConfig::default()).await;
        harness.registrar.add_route(&echo_route()).unwrap();
        let router = build_router(harness.state.clone(), &ServerSettings::default());

        let oversized = MAX_BODY_BYTES + 1;
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/v1/echo?message=hi")
                    .header(axum::http::header::CONTENT_LENGTH, oversized)
                    .body(Body::from(vec![b' '; oversized]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn health_and_openapi_bypass_the_envelope() {
        let harness = harness(StubHandle::new("echo.EchoPlugin"), AuthConfig::default()).await;
        harness.registrar.add_route(&echo_route()).unwrap();
        let router = build_router(harness.state.clone(), &ServerSettings::default());

        let health = router
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(health).await, json!("ok"));

        let doc = router
            .oneshot(Request::builder().uri(OPENAPI_PATH).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let doc = body_json(doc).await;
        assert!(doc["paths"].get("/api/v1/echo").is_some());
    }

    #[tokio::test]
    async fn start_binds_to_os_assigned_port() {
        let harness = harness(StubHandle::new("echo.EchoPlugin"), AuthConfig::default()).await;
        let settings = ServerSettings {
            host: "127.0.0.1".into(),
            port: 0,
            ..ServerSettings::default()
        };
        let mut module = NetworkModule::new(settings, harness.state.clone());
        let port = module.start().await.expect("start should succeed");
        assert!(port > 0, "OS-assigned port should be > 0");
        assert!(module.listener.is_some());
    }

    #[tokio::test]
    async fn serve_without_start_is_an_error() {
        let harness = harness(StubHandle::new("echo.EchoPlugin"), AuthConfig::default()).await;
        let module = NetworkModule::new(ServerSettings::default(), harness.state.clone());
        assert!(module.serve(std::future::ready(())).await.is_err());
    }

    #[tokio::test]
    async fn serve_drains_and_stops_on_shutdown() {
        let harness = harness(StubHandle::new("echo.EchoPlugin"), AuthConfig::default()).await;
        let settings = ServerSettings {
            host: "127.0.0.1".into(),
            port: 0,
            ..ServerSettings::default()
        };
        let mut module = NetworkModule::new(settings, harness.state.clone());
        let lifecycle = module.lifecycle();
        module.start().await.unwrap();
        module.serve(std::future::ready(())).await.unwrap();
        assert_eq!(lifecycle.health_state(), HealthState::Stopped);
    }
}
