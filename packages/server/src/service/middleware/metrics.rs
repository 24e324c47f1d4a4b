//! Metrics middleware for invocations.
//!
//! Records invocation duration and outcome on `tracing` spans; there is no
//! metrics exporter.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::error::InvokeError;
use crate::service::invocation::{Invocation, InvocationOutput};

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Service wrapper that records invocation duration and outcome in tracing spans.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

fn outcome(result: &Result<InvocationOutput, InvokeError>) -> &'static str {
    match result {
        Ok(InvocationOutput::Value(_)) => "ok",
        Ok(InvocationOutput::Stream(_)) => "streaming",
        Err(InvokeError::Timeout { .. }) => "timeout",
        Err(InvokeError::Overloaded) => "overloaded",
        Err(err) if err.is_retrieval() => "not_found",
        Err(_) => "error",
    }
}

impl<S> Service<Invocation> for MetricsService<S>
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
        let target = invocation.api.target.clone();
        let function = invocation.api.function.clone();

        let span = info_span!(
            "invocation",
            deployment = %target,
            function = %function,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(invocation);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = start.elapsed().as_millis() as u64;
                let outcome = outcome(&result);

                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);

                match &result {
                    Err(err) => tracing::warn!(
                        deployment = %target,
                        function = %function,
                        duration_ms,
                        outcome,
                        error = %err,
                        "invocation failed"
                    ),
                    Ok(_) => tracing::info!(
                        deployment = %target,
                        function = %function,
                        duration_ms,
                        outcome,
                        "invocation complete"
                    ),
                }

                result
            }
            .instrument(span),
        )
    }
}
