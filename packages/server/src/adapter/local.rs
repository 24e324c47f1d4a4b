//! Co-located execution: every deployment is an in-process object.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use framex_core::consts::BACKEND_NAME;
use parking_lot::RwLock;
use tracing::info;

use super::{
    Deployable, DeploymentUnit, ExecutionAdapter, ExecutionHandle, Placement, SharedHandle,
    StreamCache,
};
use crate::config::AdapterMode;
use crate::error::InvokeError;
use crate::plugin::DeploymentInit;

/// Adapter that constructs deployments in-process and calls them directly.
///
/// The route registrar is held weakly: it owns a reference back to this
/// adapter.
#[derive(Default)]
pub struct LocalAdapter {
    instances: DashMap<String, SharedHandle>,
    backend: RwLock<Option<Weak<dyn ExecutionHandle>>>,
    stream_cache: StreamCache,
}

impl LocalAdapter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the instantiated deployments.
    #[must_use]
    pub fn deployment_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Registers an already-constructed handle under its target name.
    pub fn insert_handle(&self, handle: SharedHandle) {
        self.instances.insert(handle.target().to_string(), handle);
    }
}

#[async_trait]
impl ExecutionAdapter for LocalAdapter {
    fn mode(&self) -> AdapterMode {
        AdapterMode::Local
    }

    fn prepare_for_deployment(&self, unit: Arc<dyn DeploymentUnit>) -> Deployable {
        Deployable {
            name: unit.name().to_string(),
            unit,
            placement: Placement::InProcess,
        }
    }

    async fn instantiate(
        &self,
        deployable: &Deployable,
        init: DeploymentInit,
    ) -> anyhow::Result<SharedHandle> {
        let handle = deployable.unit.create(init).await?;
        self.instances
            .insert(deployable.name.clone(), Arc::clone(&handle));
        info!(deployment = %deployable.name, "deployment instantiated in-process");
        Ok(handle)
    }

    fn resolve_handle(&self, target: &str) -> Result<SharedHandle, InvokeError> {
        let missing = || InvokeError::MissingHandle {
            target: target.to_string(),
        };
        if target == BACKEND_NAME {
            return self
                .backend
                .read()
                .as_ref()
                .and_then(Weak::upgrade)
                .ok_or_else(missing);
        }
        self.instances
            .get(target)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(missing)
    }

    async fn install_backend(&self, backend: SharedHandle) -> anyhow::Result<()> {
        *self.backend.write() = Some(Arc::downgrade(&backend));
        Ok(())
    }

    fn stream_cache(&self) -> &StreamCache {
        &self.stream_cache
    }
}

#[cfg(test)]
mod tests {
    use framex_core::consts::{PROXY_CHECK_STREAM_FUNC, PROXY_PLUGIN_NAME, REGISTER_ROUTE_FUNC};
    use framex_core::{Kwargs, OperationDescriptor};
    use serde_json::{json, Value};

    use super::*;
    use crate::adapter::testing::StubHandle;
    use crate::adapter::ChunkStream;

    fn kwargs(pairs: &[(&str, Value)]) -> Kwargs {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn unknown_target_is_a_retrieval_error() {
        let adapter = LocalAdapter::new();
        let err = adapter
            .invoke(&OperationDescriptor::function("nope.Nope", "f"), Kwargs::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::MissingHandle { .. }));
        assert!(err.is_retrieval());
    }

    #[tokio::test]
    async fn plain_call_returns_value_unwrapped() {
        let adapter = LocalAdapter::new();
        let stub = Arc::new(StubHandle::new("echo.EchoPlugin").returning("confess", json!("hi")));
        adapter.insert_handle(stub.clone());

        let api = OperationDescriptor::function("echo.EchoPlugin", "confess");
        let out = adapter
            .invoke(&api, kwargs(&[("message", json!("hi"))]))
            .await
            .unwrap();
        assert_eq!(out, json!("hi"));
        assert_eq!(stub.calls_to("confess")[0]["message"], "hi");
    }

    #[tokio::test]
    async fn streaming_call_returns_ordered_chunks() {
        let adapter = LocalAdapter::new();
        adapter.insert_handle(Arc::new(
            StubHandle::new("echo.EchoPlugin").streaming("echo_stream", &["a", "b", "finish"]),
        ));
        let api = OperationDescriptor {
            stream: true,
            ..OperationDescriptor::function("echo.EchoPlugin", "echo_stream")
        };
        let out = adapter.invoke(&api, Kwargs::new()).await.unwrap();
        assert_eq!(out, json!(["a", "b", "finish"]));
    }

    #[tokio::test]
    async fn proxy_call_adds_path_and_unwraps_envelope() {
        let adapter = LocalAdapter::new();
        let proxy = Arc::new(
            StubHandle::new(PROXY_PLUGIN_NAME)
                .returning(PROXY_CHECK_STREAM_FUNC, json!(false))
                .returning("__call__", json!({"status": 200, "data": {"x": 1}})),
        );
        adapter.insert_handle(proxy.clone());

        let api = OperationDescriptor::proxy_fallback("/api/v1/remote/echo");
        for _ in 0..3 {
            let out = adapter.invoke(&api, Kwargs::new()).await.unwrap();
            assert_eq!(out, json!({"x": 1}));
        }

        let call = &proxy.calls_to("__call__")[0];
        assert_eq!(call["proxy_path"], "/api/v1/remote/echo");
        // The generator check runs once per path.
        assert_eq!(proxy.calls_to(PROXY_CHECK_STREAM_FUNC).len(), 1);
        assert_eq!(adapter.stream_cache().get("/api/v1/remote/echo"), Some(false));
    }

    #[tokio::test]
    async fn proxy_streaming_path_is_collected_not_unwrapped() {
        let adapter = LocalAdapter::new();
        adapter.insert_handle(Arc::new(
            StubHandle::new(PROXY_PLUGIN_NAME)
                .returning(PROXY_CHECK_STREAM_FUNC, json!(true))
                .streaming("__call__", &["x", "y"]),
        ));
        let api = OperationDescriptor::proxy_fallback("/api/v1/remote/stream");
        let out = adapter.invoke(&api, Kwargs::new()).await.unwrap();
        assert_eq!(out, json!(["x", "y"]));
    }

    #[tokio::test]
    async fn proxy_failure_status_is_raised() {
        let adapter = LocalAdapter::new();
        adapter.insert_handle(Arc::new(
            StubHandle::new(PROXY_PLUGIN_NAME)
                .returning(PROXY_CHECK_STREAM_FUNC, json!(false))
                .returning("__call__", json!({"status": 500, "message": "down"})),
        ));
        let err = adapter
            .invoke(&OperationDescriptor::proxy_fallback("/x"), Kwargs::new())
            .await
            .unwrap_err();
        assert!(err.is_remote_failure());
    }

    struct BlockingBackend;

    #[async_trait]
    impl ExecutionHandle for BlockingBackend {
        fn target(&self) -> &str {
            BACKEND_NAME
        }

        async fn call(&self, _function: &str, _kwargs: Kwargs) -> Result<Value, InvokeError> {
            Ok(json!("async"))
        }

        async fn call_stream(
            &self,
            function: &str,
            _kwargs: Kwargs,
        ) -> Result<ChunkStream, InvokeError> {
            Err(InvokeError::MissingFunction {
                target: BACKEND_NAME.into(),
                function: function.into(),
            })
        }

        fn call_blocking(
            &self,
            _function: &str,
            _kwargs: Kwargs,
        ) -> Option<Result<Value, InvokeError>> {
            Some(Ok(json!("blocking")))
        }
    }

    #[tokio::test]
    async fn route_registration_runs_synchronously() {
        let adapter = LocalAdapter::new();
        let backend: SharedHandle = Arc::new(BlockingBackend);
        adapter.install_backend(Arc::clone(&backend)).await.unwrap();

        let register = OperationDescriptor::function(BACKEND_NAME, REGISTER_ROUTE_FUNC);
        assert_eq!(
            adapter.invoke(&register, Kwargs::new()).await.unwrap(),
            json!("blocking")
        );
        let other = OperationDescriptor::function(BACKEND_NAME, "ping");
        assert_eq!(
            adapter.invoke(&other, Kwargs::new()).await.unwrap(),
            json!("async")
        );
    }

    #[tokio::test]
    async fn backend_is_held_weakly() {
        let adapter = LocalAdapter::new();
        let backend: SharedHandle = Arc::new(BlockingBackend);
        adapter.install_backend(Arc::clone(&backend)).await.unwrap();
        assert!(adapter.resolve_handle(BACKEND_NAME).is_ok());
        drop(backend);
        assert!(adapter.resolve_handle(BACKEND_NAME).is_err());
    }
}
