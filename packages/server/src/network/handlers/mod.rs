//! HTTP handler definitions for the plugin host.
//!
//! This module defines `AppState` (the shared state carried through axum
//! extractors) and re-exports all handler functions for convenient access
//! when building the router.

pub mod dispatch;
pub mod health;
pub mod openapi;

pub use dispatch::dispatch_handler;
pub use health::{detail_handler, health_handler, liveness_handler, readiness_handler};
pub use openapi::openapi_handler;

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::routes::RouteTable;
use super::HostLifecycle;
use crate::config::OAuthConfig;
use crate::service::InvocationPipeline;

/// Shared application state passed to all axum handlers via `State` extraction.
///
/// Holds `Arc` references to shared resources so cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    /// Live routes consulted by the dispatch fallback.
    pub routes: Arc<RouteTable>,
    /// Invocation middleware stack; cloned per request.
    pub pipeline: InvocationPipeline,
    /// Session-token scheme, when configured.
    pub oauth: Option<Arc<OAuthConfig>>,
    /// Readiness and in-flight invocation tracking.
    pub lifecycle: Arc<HostLifecycle>,
    /// Identifiers of the loaded plugins, for the health detail.
    pub plugins: Arc<[String]>,
    pub invocation_timeout: Duration,
    /// Server process start time, used for uptime calculation.
    pub start_time: Instant,
}

#[cfg(test)]
pub(crate) mod testing {
    //! State over a local adapter with scripted deployments.

    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use super::AppState;
    use crate::adapter::testing::StubHandle;
    use crate::adapter::{ExecutionAdapter, LocalAdapter, SharedAdapter};
    use crate::config::{AuthConfig, ServerSettings};
    use crate::network::routes::{RouteRegistrar, RouteTable};
    use crate::network::HostLifecycle;
    use crate::service::build_invocation_pipeline;

    /// Keeps the registrar alive; the local adapter only holds it weakly.
    pub struct Harness {
        pub state: AppState,
        pub registrar: Arc<RouteRegistrar>,
        pub stub: Arc<StubHandle>,
    }

    pub async fn harness(stub: StubHandle, auth: AuthConfig) -> Harness {
        let stub = Arc::new(stub);
        let adapter = Arc::new(LocalAdapter::new());
        adapter.insert_handle(stub.clone());
        let shared: SharedAdapter = adapter.clone();
        let routes = Arc::new(RouteTable::new());
        let oauth = auth.oauth.clone().map(Arc::new);
        let registrar = Arc::new(RouteRegistrar::new(
            Arc::clone(&routes),
            Arc::clone(&shared),
            auth,
        ));
        adapter
            .install_backend(registrar.clone())
            .await
            .expect("backend installs");

        let state = AppState {
            routes,
            pipeline: build_invocation_pipeline(shared, &ServerSettings::default()),
            oauth,
            lifecycle: Arc::new(HostLifecycle::new()),
            plugins: Arc::from(vec!["echo".to_string()]),
            invocation_timeout: Duration::from_secs(5),
            start_time: Instant::now(),
        };
        Harness {
            state,
            registrar,
            stub,
        }
    }
}
