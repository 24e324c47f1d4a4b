//! The innermost service of the pipeline: dispatch through the adapter.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use framex_core::{Kwargs, OperationDescriptor};
use serde_json::Value;
use tower::Service;

use crate::adapter::{ChunkStream, SharedAdapter};
use crate::error::InvokeError;

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// One call of an operation with validated arguments.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub api: OperationDescriptor,
    pub kwargs: Kwargs,
    /// Upper bound on producing the result (or, for streams, the first
    /// chunk-ready stream).
    pub timeout: Duration,
}

/// Result of an invocation: a single value or a lazy chunk stream.
pub enum InvocationOutput {
    Value(Value),
    Stream(ChunkStream),
}

impl fmt::Debug for InvocationOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

// ---------------------------------------------------------------------------
// InvokeService
// ---------------------------------------------------------------------------

/// Dispatches invocations to the execution adapter. Streaming operations are
/// returned lazily so the HTTP layer can relay chunks as they arrive.
#[derive(Clone)]
pub struct InvokeService {
    adapter: SharedAdapter,
}

impl InvokeService {
    #[must_use]
    pub fn new(adapter: SharedAdapter) -> Self {
        Self { adapter }
    }
}

impl Service<Invocation> for InvokeService {
    type Response = InvocationOutput;
    type Error = InvokeError;
    type Future = Pin<Box<dyn Future<Output = Result<InvocationOutput, InvokeError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, invocation: Invocation) -> Self::Future {
        let adapter = self.adapter.clone();
        Box::pin(async move {
            let Invocation { api, kwargs, .. } = invocation;
            if api.stream {
                adapter
                    .invoke_stream(&api, kwargs)
                    .await
                    .map(InvocationOutput::Stream)
            } else {
                adapter.invoke(&api, kwargs).await.map(InvocationOutput::Value)
            }
        })
    }
}
