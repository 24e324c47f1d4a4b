//! Execution adapters.
//!
//! An [`ExecutionAdapter`] hides whether a deployment runs in-process or as an
//! independently scheduled worker. Every call site depends only on the trait;
//! the concrete variant is chosen once at startup.
//!
//! - [`local`]: deployments are constructed in-process and called directly.
//! - [`distributed`]: deployments are spawned on a [`Substrate`] and reached
//!   only through message-passing handles.
//! - [`worker`]: the bundled task-based substrate.

pub mod distributed;
pub mod local;
pub mod worker;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use framex_core::consts::{
    BACKEND_NAME, LEGAL_PROXY_CODES, PROXY_CHECK_STREAM_FUNC, PROXY_PATH_ARG, REGISTER_ROUTE_FUNC,
};
use framex_core::{CallKind, Kwargs, OperationDescriptor};
use futures_util::stream::BoxStream;
use futures_util::TryStreamExt;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::AdapterMode;
use crate::error::InvokeError;
use crate::plugin::DeploymentInit;

pub use distributed::{DistributedAdapter, Substrate, WorkerOptions};
pub use local::LocalAdapter;
pub use worker::TaskSubstrate;

/// Lazily produced text chunks of a streaming operation.
pub type ChunkStream = BoxStream<'static, Result<String, InvokeError>>;

// ---------------------------------------------------------------------------
// ExecutionHandle
// ---------------------------------------------------------------------------

/// Opaque reference to one deployment instance.
#[async_trait]
pub trait ExecutionHandle: Send + Sync {
    /// Deployment name this handle reaches.
    fn target(&self) -> &str;

    /// Calls `function` and awaits its single result.
    async fn call(&self, function: &str, kwargs: Kwargs) -> Result<Value, InvokeError>;

    /// Calls `function` in streaming mode.
    async fn call_stream(&self, function: &str, kwargs: Kwargs)
        -> Result<ChunkStream, InvokeError>;

    /// Runs `function` to completion on the caller's thread. `None` when the
    /// handle cannot execute synchronously.
    fn call_blocking(
        &self,
        _function: &str,
        _kwargs: Kwargs,
    ) -> Option<Result<Value, InvokeError>> {
        None
    }

    /// Lifecycle hook, run once after the deployment is instantiated.
    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

pub type SharedHandle = Arc<dyn ExecutionHandle>;

// ---------------------------------------------------------------------------
// DeploymentUnit / Deployable
// ---------------------------------------------------------------------------

/// A type-erased constructor for one deployment.
#[async_trait]
pub trait DeploymentUnit: Send + Sync {
    /// Stable deployment name, `plugin.Type`.
    fn name(&self) -> &str;

    /// Constructs an instance and returns a handle to it.
    async fn create(&self, init: DeploymentInit) -> anyhow::Result<SharedHandle>;
}

/// Where a deployment will run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    InProcess,
    Worker(WorkerOptions),
}

/// A deployment prepared by an adapter, ready to be instantiated.
#[derive(Clone)]
pub struct Deployable {
    pub name: String,
    pub unit: Arc<dyn DeploymentUnit>,
    pub placement: Placement,
}

impl std::fmt::Debug for Deployable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deployable")
            .field("name", &self.name)
            .field("placement", &self.placement)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// StreamCache
// ---------------------------------------------------------------------------

/// Process-lifetime memo of which proxied paths are streaming endpoints.
///
/// Concurrent first lookups may both compute the flag; the later insert
/// simply overwrites an identical value.
#[derive(Debug, Default)]
pub struct StreamCache {
    flags: DashMap<String, bool>,
}

impl StreamCache {
    #[must_use]
    pub fn get(&self, path: &str) -> Option<bool> {
        self.flags.get(path).map(|flag| *flag)
    }

    pub fn insert(&self, path: String, stream: bool) {
        self.flags.insert(path, stream);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.flags.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }
}

// ---------------------------------------------------------------------------
// ExecutionAdapter
// ---------------------------------------------------------------------------

/// Uniform contract for preparing, instantiating and invoking deployments.
#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    fn mode(&self) -> AdapterMode;

    /// Wraps a deployment unit for this adapter's placement strategy.
    fn prepare_for_deployment(&self, unit: Arc<dyn DeploymentUnit>) -> Deployable;

    /// Constructs the deployment and records its handle under its name.
    ///
    /// # Errors
    ///
    /// Returns the constructor's error, or a substrate failure.
    async fn instantiate(
        &self,
        deployable: &Deployable,
        init: DeploymentInit,
    ) -> anyhow::Result<SharedHandle>;

    /// Looks up the handle of a deployment. The `backend` pseudo-target
    /// resolves to the route registrar.
    ///
    /// # Errors
    ///
    /// Returns [`InvokeError::MissingHandle`] for unknown targets.
    fn resolve_handle(&self, target: &str) -> Result<SharedHandle, InvokeError>;

    /// Installs the route registrar as the `backend` target.
    ///
    /// # Errors
    ///
    /// Returns an error if the registrar cannot be placed.
    async fn install_backend(&self, backend: SharedHandle) -> anyhow::Result<()>;

    fn stream_cache(&self) -> &StreamCache;

    /// Releases every deployment this adapter placed.
    async fn shutdown(&self) {}

    /// Invokes an operation and returns its full result.
    ///
    /// Streaming operations yield the realized list of chunks. PROXY-kind
    /// operations are routed through the gateway's catch-all entrypoint and
    /// have their `{status, data}` envelope unwrapped.
    ///
    /// # Errors
    ///
    /// Retrieval errors for unknown targets or functions; callee failures
    /// are propagated unchanged.
    async fn invoke(
        &self,
        api: &OperationDescriptor,
        mut kwargs: Kwargs,
    ) -> Result<Value, InvokeError> {
        let stream = self.resolve_stream_flag(api, &mut kwargs).await?;
        let handle = self.resolve_handle(&api.target)?;

        if stream {
            let chunks: Vec<String> = handle
                .call_stream(&api.function, kwargs)
                .await?
                .try_collect()
                .await?;
            return Ok(Value::Array(chunks.into_iter().map(Value::String).collect()));
        }

        let result = if self.mode() == AdapterMode::Local && is_route_registration(api) {
            handle
                .call_blocking(&api.function, kwargs)
                .unwrap_or_else(|| {
                    Err(InvokeError::MissingFunction {
                        target: api.target.clone(),
                        function: api.function.clone(),
                    })
                })?
        } else {
            handle.call(&api.function, kwargs).await?
        };

        if api.kind == CallKind::Proxy {
            unwrap_proxy_response(result)
        } else {
            Ok(result)
        }
    }

    /// Invokes a streaming operation and returns its chunks lazily.
    ///
    /// # Errors
    ///
    /// As [`ExecutionAdapter::invoke`].
    async fn invoke_stream(
        &self,
        api: &OperationDescriptor,
        mut kwargs: Kwargs,
    ) -> Result<ChunkStream, InvokeError> {
        self.resolve_stream_flag(api, &mut kwargs).await?;
        let handle = self.resolve_handle(&api.target)?;
        handle.call_stream(&api.function, kwargs).await
    }

    /// Streaming flag of an invocation. For proxied paths the flag comes
    /// from the gateway, asked once per path, and the path is added to the
    /// arguments.
    ///
    /// # Errors
    ///
    /// Propagates failures of the gateway's streaming check.
    async fn resolve_stream_flag(
        &self,
        api: &OperationDescriptor,
        kwargs: &mut Kwargs,
    ) -> Result<bool, InvokeError> {
        let (CallKind::Proxy, Some(path)) = (api.kind, &api.path) else {
            return Ok(api.stream);
        };
        kwargs.insert(PROXY_PATH_ARG.to_string(), Value::String(path.clone()));

        if let Some(stream) = self.stream_cache().get(path) {
            return Ok(stream);
        }
        let handle = self.resolve_handle(&api.target)?;
        let mut args = Kwargs::new();
        args.insert("path".to_string(), Value::String(path.clone()));
        let stream = handle
            .call(PROXY_CHECK_STREAM_FUNC, args)
            .await?
            .as_bool()
            .unwrap_or(false);
        debug!(path = %path, stream, "resolved proxied api stream flag");
        self.stream_cache().insert(path.clone(), stream);
        Ok(stream)
    }
}

pub type SharedAdapter = Arc<dyn ExecutionAdapter>;

fn is_route_registration(api: &OperationDescriptor) -> bool {
    api.target == BACKEND_NAME && api.function == REGISTER_ROUTE_FUNC
}

/// Extracts `data` from a gateway `{status, data}` envelope.
///
/// # Errors
///
/// [`InvokeError::ProxyProtocol`] when the envelope is not an object or lacks
/// a numeric `status`; [`InvokeError::ProxyStatus`] for a status outside the
/// legal set.
pub fn unwrap_proxy_response(value: Value) -> Result<Value, InvokeError> {
    let Value::Object(mut envelope) = value else {
        return Err(InvokeError::ProxyProtocol {
            reason: format!("expected a {{status, data}} object, got {value}"),
        });
    };
    let status = envelope
        .get("status")
        .and_then(Value::as_i64)
        .ok_or_else(|| InvokeError::ProxyProtocol {
            reason: "response carries no `status`".to_string(),
        })?;
    if !LEGAL_PROXY_CODES
        .iter()
        .any(|code| i64::from(*code) == status)
    {
        let message = envelope
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Err(InvokeError::ProxyStatus { status, message });
    }
    if let Some(data) = envelope.remove("data") {
        Ok(data)
    } else {
        warn!(status, "proxy response carries no `data`");
        Ok(Value::Null)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted handles for adapter and registrar tests.

    use std::collections::HashMap;

    use futures_util::stream;
    use parking_lot::Mutex;

    use super::*;

    /// Returns canned values per function and records every call.
    pub struct StubHandle {
        pub name: String,
        pub values: HashMap<String, Value>,
        pub chunks: HashMap<String, Vec<String>>,
        pub calls: Mutex<Vec<(String, Kwargs)>>,
    }

    impl StubHandle {
        pub fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                values: HashMap::new(),
                chunks: HashMap::new(),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn returning(mut self, function: &str, value: Value) -> Self {
            self.values.insert(function.to_string(), value);
            self
        }

        pub fn streaming(mut self, function: &str, chunks: &[&str]) -> Self {
            self.chunks.insert(
                function.to_string(),
                chunks.iter().map(|c| (*c).to_string()).collect(),
            );
            self
        }

        pub fn calls_to(&self, function: &str) -> Vec<Kwargs> {
            self.calls
                .lock()
                .iter()
                .filter(|(f, _)| f == function)
                .map(|(_, k)| k.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ExecutionHandle for StubHandle {
        fn target(&self) -> &str {
            &self.name
        }

        async fn call(&self, function: &str, kwargs: Kwargs) -> Result<Value, InvokeError> {
            self.calls.lock().push((function.to_string(), kwargs));
            self.values
                .get(function)
                .cloned()
                .ok_or_else(|| InvokeError::MissingFunction {
                    target: self.name.clone(),
                    function: function.to_string(),
                })
        }

        async fn call_stream(
            &self,
            function: &str,
            kwargs: Kwargs,
        ) -> Result<ChunkStream, InvokeError> {
            self.calls.lock().push((function.to_string(), kwargs));
            let chunks = self
                .chunks
                .get(function)
                .cloned()
                .ok_or_else(|| InvokeError::MissingFunction {
                    target: self.name.clone(),
                    function: function.to_string(),
                })?;
            Ok(Box::pin(stream::iter(chunks.into_iter().map(Ok))))
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn legal_envelope_yields_data() {
        let data = unwrap_proxy_response(json!({"status": 200, "data": {"x": 1}})).unwrap();
        assert_eq!(data, json!({"x": 1}));
    }

    #[test]
    fn illegal_status_is_a_remote_failure() {
        let err = unwrap_proxy_response(json!({"status": 500, "message": "boom"})).unwrap_err();
        assert!(matches!(err, InvokeError::ProxyStatus { status: 500, .. }));
        assert!(err.is_remote_failure());
    }

    #[test]
    fn missing_status_is_a_protocol_error() {
        let err = unwrap_proxy_response(json!({"data": 1})).unwrap_err();
        assert!(matches!(err, InvokeError::ProxyProtocol { .. }));
        let err = unwrap_proxy_response(json!("text")).unwrap_err();
        assert!(matches!(err, InvokeError::ProxyProtocol { .. }));
    }

    #[test]
    fn missing_data_is_null() {
        assert_eq!(
            unwrap_proxy_response(json!({"status": 200})).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn stream_cache_memoizes() {
        let cache = StreamCache::default();
        assert!(cache.is_empty());
        cache.insert("/a".into(), true);
        cache.insert("/a".into(), true);
        assert_eq!(cache.get("/a"), Some(true));
        assert_eq!(cache.get("/b"), None);
        assert_eq!(cache.len(), 1);
    }
}
