//! Timeout middleware for invocations.
//!
//! Rejects invocations that exceed their `timeout` with `InvokeError::Timeout`.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tower::{Layer, Service};

use crate::error::InvokeError;
use crate::service::invocation::{Invocation, InvocationOutput};

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

/// Tower layer that wraps services with per-invocation timeout enforcement.
///
/// The timeout is read from each invocation, so routes may carry different
/// limits.
#[derive(Debug, Clone)]
pub struct TimeoutLayer;

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService { inner }
    }
}

// ---------------------------------------------------------------------------
// TimeoutService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
}

impl<S> Service<Invocation> for TimeoutService<S>
where
    S: Service<Invocation, Response = InvocationOutput, Error = InvokeError> + Send,
    S::Future: Send + 'static,
{
    type Response = InvocationOutput;
    type Error = InvokeError;
    type Future = Pin<Box<dyn Future<Output = Result<InvocationOutput, InvokeError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, invocation: Invocation) -> Self::Future {
        let duration = invocation.timeout;
        let fut = self.inner.call(invocation);
        Box::pin(async move {
            match tokio::time::timeout(duration, fut).await {
                Ok(result) => result,
                #[allow(clippy::cast_possible_truncation)]
                Err(_elapsed) => Err(InvokeError::Timeout {
                    timeout_ms: duration.as_millis() as u64,
                }),
            }
        })
    }
}
