//! Pipeline composition: combines all middleware layers into a single service stack.

use tower::ServiceBuilder;

use super::load_shed::{LoadShedLayer, LoadShedService};
use super::metrics::{MetricsLayer, MetricsService};
use super::timeout::{TimeoutLayer, TimeoutService};
use crate::adapter::SharedAdapter;
use crate::config::ServerSettings;
use crate::service::invocation::InvokeService;

/// The composed invocation stack.
pub type InvocationPipeline = LoadShedService<TimeoutService<MetricsService<InvokeService>>>;

/// Build the invocation pipeline by wrapping adapter dispatch with middleware layers.
///
/// Layer order (outermost to innermost):
/// 1. `LoadShedLayer` -- reject when overloaded (fail fast before doing any work)
/// 2. `TimeoutLayer` -- enforce per-invocation timeouts
/// 3. `MetricsLayer` -- record timing and outcome (closest to the actual call)
#[must_use]
pub fn build_invocation_pipeline(
    adapter: SharedAdapter,
    settings: &ServerSettings,
) -> InvocationPipeline {
    ServiceBuilder::new()
        .layer(LoadShedLayer::new(settings.max_concurrent_invocations))
        .layer(TimeoutLayer)
        .layer(MetricsLayer)
        .service(InvokeService::new(adapter))
}
