//! HTTP surface: server lifecycle, transport middleware, the response
//! envelope, authorization, the dynamic route registrar and the host lifecycle.

pub mod auth;
pub mod envelope;
pub mod handlers;
pub mod lifecycle;
pub mod middleware;
pub mod module;
pub mod routes;

pub use handlers::AppState;
pub use module::{build_router, NetworkModule};
pub use routes::{RouteEntry, RouteRegistrar, RouteSpec, RouteTable};
pub use lifecycle::{HealthState, HostLifecycle, InvocationGuard, StartState};
