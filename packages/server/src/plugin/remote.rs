//! What a deployment receives at construction: its resolved remote APIs, its
//! configuration and the process-wide function catalog.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use framex_core::codec::{decode_value, encode};
use framex_core::consts::{
    BACKEND_NAME, PROXY_INVOKE_FUNC, PROXY_PLUGIN_NAME, PROXY_REGISTER_FUNC, REGISTER_ROUTE_FUNC,
};
use framex_core::{Kwargs, OperationDescriptor};
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::adapter::{ChunkStream, SharedAdapter};
use crate::error::InvokeError;
use crate::network::routes::RouteSpec;

// ---------------------------------------------------------------------------
// FunctionCatalog
// ---------------------------------------------------------------------------

/// A function that can be invoked by name across a process boundary. It
/// captures no per-call state: everything it needs arrives as arguments.
pub type ProxyFn = Arc<dyn Fn(Kwargs) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Process-wide registry of functions forwardable by name.
#[derive(Default)]
pub struct FunctionCatalog {
    functions: DashMap<String, ProxyFn>,
}

impl FunctionCatalog {
    /// Files `function` under `name`. Returns `false`, keeping the first
    /// registration, when the name is taken.
    pub fn register(&self, name: &str, function: ProxyFn) -> bool {
        if self.functions.contains_key(name) {
            warn!(function = name, "function already registered, skipping");
            return false;
        }
        self.functions.insert(name.to_string(), function);
        debug!(function = name, "registered forwardable function");
        true
    }

    /// Convenience wrapper over [`FunctionCatalog::register`] for async closures.
    pub fn register_fn<F, Fut>(&self, name: &str, function: F) -> bool
    where
        F: Fn(Kwargs) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register(name, Arc::new(move |kwargs| Box::pin(function(kwargs))))
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<ProxyFn> {
        self.functions.get(name).map(|f| Arc::clone(f.value()))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.iter().map(|f| f.key().clone()).collect();
        names.sort();
        names
    }
}

// ---------------------------------------------------------------------------
// RemoteApis
// ---------------------------------------------------------------------------

/// Rewrites the result of every successful remote call.
pub type PostCallHook = Arc<dyn Fn(&str, Value) -> Value + Send + Sync>;

/// The remote operations a deployment declared, resolved to descriptors, and
/// the means to call them.
#[derive(Clone)]
pub struct RemoteApis {
    apis: Arc<HashMap<String, OperationDescriptor>>,
    adapter: SharedAdapter,
    functions: Arc<FunctionCatalog>,
    registered: Arc<DashSet<String>>,
    hook: Option<PostCallHook>,
}

impl RemoteApis {
    #[must_use]
    pub fn new(
        apis: HashMap<String, OperationDescriptor>,
        adapter: SharedAdapter,
        functions: Arc<FunctionCatalog>,
    ) -> Self {
        Self {
            apis: Arc::new(apis),
            adapter,
            functions,
            registered: Arc::new(DashSet::new()),
            hook: None,
        }
    }

    /// Installs a hook applied to every successful [`RemoteApis::call`] result.
    #[must_use]
    pub fn with_post_call_hook(mut self, hook: PostCallHook) -> Self {
        self.hook = Some(hook);
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&OperationDescriptor> {
        self.apis.get(name)
    }

    #[must_use]
    pub fn adapter(&self) -> &SharedAdapter {
        &self.adapter
    }

    /// Invokes the required remote API `name`.
    ///
    /// # Errors
    ///
    /// [`InvokeError::UnknownApi`] when `name` was not declared; otherwise
    /// whatever the adapter raises.
    pub async fn call(&self, name: &str, kwargs: Kwargs) -> Result<Value, InvokeError> {
        let api = self.resolve(name)?;
        let value = self.adapter.invoke(api, kwargs).await?;
        Ok(match &self.hook {
            Some(hook) => hook(name, value),
            None => value,
        })
    }

    /// Invokes the required remote API `name` and returns its chunks lazily.
    ///
    /// # Errors
    ///
    /// As [`RemoteApis::call`].
    pub async fn call_stream(&self, name: &str, kwargs: Kwargs) -> Result<ChunkStream, InvokeError> {
        let api = self.resolve(name)?;
        self.adapter.invoke_stream(api, kwargs).await
    }

    fn resolve(&self, name: &str) -> Result<&OperationDescriptor, InvokeError> {
        self.apis.get(name).ok_or_else(|| InvokeError::UnknownApi {
            name: name.to_string(),
        })
    }

    /// Asks the route registrar to expose `spec` as an HTTP route.
    ///
    /// # Errors
    ///
    /// Fails when the registrar cannot be reached.
    pub async fn register_route(&self, spec: &RouteSpec) -> Result<bool, InvokeError> {
        let Value::Object(kwargs) = serde_json::to_value(spec).map_err(InvokeError::remote)? else {
            return Err(InvokeError::remote(anyhow::anyhow!(
                "route spec did not serialize to an object"
            )));
        };
        let api = OperationDescriptor::function(BACKEND_NAME, REGISTER_ROUTE_FUNC);
        let registered = self.adapter.invoke(&api, kwargs).await?;
        Ok(registered.as_bool().unwrap_or(false))
    }

    /// Calls a function filed in the [`FunctionCatalog`] by name.
    ///
    /// With the gateway deployed, the call goes through it: the name is
    /// registered once, then name and arguments travel encoded and the
    /// encoded result is decoded. Without it, the function runs in place.
    ///
    /// # Errors
    ///
    /// [`InvokeError::UnknownApi`] for a name nobody registered; otherwise
    /// the callee's or gateway's failure.
    pub async fn call_proxy_function(
        &self,
        name: &str,
        kwargs: Kwargs,
    ) -> Result<Value, InvokeError> {
        if self.adapter.resolve_handle(PROXY_PLUGIN_NAME).is_err() {
            let function = self.functions.get(name).ok_or_else(|| InvokeError::UnknownApi {
                name: name.to_string(),
            })?;
            return function(kwargs).await.map_err(InvokeError::remote);
        }

        if self.registered.insert(name.to_string()) {
            let mut args = Kwargs::new();
            args.insert("func_name".to_string(), Value::String(name.to_string()));
            let register = OperationDescriptor::proxy_function(PROXY_REGISTER_FUNC);
            if let Err(err) = self.adapter.invoke(&register, args).await {
                self.registered.remove(name);
                return Err(err);
            }
        }

        let mut args = Kwargs::new();
        args.insert(
            "func_name".to_string(),
            Value::String(encode(name).map_err(InvokeError::remote)?),
        );
        args.insert(
            "data".to_string(),
            Value::String(encode(&kwargs).map_err(InvokeError::remote)?),
        );
        let invoke = OperationDescriptor::proxy_function(PROXY_INVOKE_FUNC);
        let result = self.adapter.invoke(&invoke, args).await?;
        Ok(decode_value(result))
    }
}

// ---------------------------------------------------------------------------
// DeploymentInit
// ---------------------------------------------------------------------------

/// Construction arguments of one deployment instance.
#[derive(Clone)]
pub struct DeploymentInit {
    pub target: String,
    pub plugin_id: String,
    pub remote_apis: RemoteApis,
    /// The plugin's configuration table, `Null` when none is configured.
    pub config: Value,
    pub functions: Arc<FunctionCatalog>,
}

impl DeploymentInit {
    /// Deserializes the plugin configuration, defaulting when absent.
    ///
    /// # Errors
    ///
    /// Returns an error when a configured table does not match `C`.
    pub fn config<C: DeserializeOwned + Default>(&self) -> anyhow::Result<C> {
        if self.config.is_null() {
            return Ok(C::default());
        }
        serde_json::from_value(self.config.clone()).map_err(|err| {
            anyhow::anyhow!("invalid configuration for plugin `{}`: {err}", self.plugin_id)
        })
    }
}
