//! Deployment declarations.
//!
//! A deployment type implements [`PluginService`] and lists its operations as
//! a static table of [`Operation`] builders. [`PluginScope::register`] turns
//! that table into descriptors, validating each operation before any instance
//! exists, and hands the type to the adapter for placement.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use framex_core::path::normalize_api_path;
use framex_core::types::deployment_name;
use framex_core::{CallKind, HttpMethod, Kwargs, OperationDescriptor, Param};
use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream};
use futures_util::{Stream, StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use super::{Deployment, DeploymentInit, Plugin};
use crate::adapter::{ChunkStream, DeploymentUnit, ExecutionAdapter, ExecutionHandle, SharedHandle};
use crate::error::{ConfigError, InvokeError};

/// Deserializes an argument bag into a typed argument struct.
///
/// # Errors
///
/// Returns an error when the arguments do not match `A`.
pub fn parse_args<A: DeserializeOwned>(kwargs: Kwargs) -> anyhow::Result<A> {
    Ok(serde_json::from_value(Value::Object(kwargs))?)
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

type UnaryFn<T> =
    Arc<dyn Fn(Arc<T>, Kwargs) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;
type StreamFn<T> =
    Arc<dyn Fn(Arc<T>, Kwargs) -> BoxStream<'static, anyhow::Result<String>> + Send + Sync>;

enum Body<T> {
    Unary(UnaryFn<T>),
    Stream(StreamFn<T>),
    /// Separate bodies for single-value and streaming calls.
    Dual(UnaryFn<T>, StreamFn<T>),
}

impl<T> Clone for Body<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Unary(f) => Self::Unary(Arc::clone(f)),
            Self::Stream(f) => Self::Stream(Arc::clone(f)),
            Self::Dual(u, s) => Self::Dual(Arc::clone(u), Arc::clone(s)),
        }
    }
}

/// One operation of a deployment type: its invocation surface and its body.
pub struct Operation<T> {
    function: String,
    path: Option<String>,
    methods: Vec<HttpMethod>,
    params: Vec<Param>,
    kind: Option<CallKind>,
    body: Body<T>,
}

impl<T: Send + Sync + 'static> Operation<T> {
    fn with_body(function: &str, body: Body<T>) -> Self {
        Self {
            function: function.to_string(),
            path: None,
            methods: vec![HttpMethod::Get],
            params: Vec::new(),
            kind: None,
            body,
        }
    }

    /// An operation resolving to a single value.
    pub fn unary<F, Fut>(function: &str, body: F) -> Self
    where
        F: Fn(Arc<T>, Kwargs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::with_body(
            function,
            Body::Unary(Arc::new(move |this, kwargs| Box::pin(body(this, kwargs)))),
        )
    }

    /// An operation yielding a sequence of text chunks.
    pub fn stream<F, S>(function: &str, body: F) -> Self
    where
        F: Fn(Arc<T>, Kwargs) -> S + Send + Sync + 'static,
        S: Stream<Item = anyhow::Result<String>> + Send + 'static,
    {
        Self::with_body(
            function,
            Body::Stream(Arc::new(move |this, kwargs| Box::pin(body(this, kwargs)))),
        )
    }

    /// An operation whose result shape is decided by the caller: `call`
    /// runs `unary`, `call_stream` runs `stream`.
    pub fn dual<U, Fut, F, S>(function: &str, unary: U, stream: F) -> Self
    where
        U: Fn(Arc<T>, Kwargs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
        F: Fn(Arc<T>, Kwargs) -> S + Send + Sync + 'static,
        S: Stream<Item = anyhow::Result<String>> + Send + 'static,
    {
        Self::with_body(
            function,
            Body::Dual(
                Arc::new(move |this, kwargs| Box::pin(unary(this, kwargs))),
                Arc::new(move |this, kwargs| Box::pin(stream(this, kwargs))),
            ),
        )
    }

    /// Route path; mounted under the API prefix.
    #[must_use]
    pub fn path(mut self, path: &str) -> Self {
        self.path = Some(path.to_string());
        self
    }

    /// Accepted HTTP methods. Defaults to `GET`.
    #[must_use]
    pub fn methods(mut self, methods: &[HttpMethod]) -> Self {
        self.methods = methods.to_vec();
        self
    }

    #[must_use]
    pub fn param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    /// Invocation surfaces. Defaults to HTTP when a path is given, otherwise
    /// function-only.
    #[must_use]
    pub fn kind(mut self, kind: CallKind) -> Self {
        self.kind = Some(kind);
        self
    }

    #[must_use]
    pub fn function_name(&self) -> &str {
        &self.function
    }

    #[must_use]
    pub fn is_stream(&self) -> bool {
        matches!(self.body, Body::Stream(_))
    }

    /// Builds the descriptor of this operation on `target`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidOperation`] when the operation declares the
    /// gateway-only PROXY kind, an HTTP kind without a path, or more than one
    /// structured parameter.
    pub fn describe(
        &self,
        target: &str,
        tags: &[String],
    ) -> Result<OperationDescriptor, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidOperation {
            target: target.to_string(),
            function: self.function.clone(),
            reason: reason.to_string(),
        };

        if self.params.iter().filter(|p| p.ty.is_structured()).count() > 1 {
            return Err(invalid("at most one structured parameter is allowed"));
        }
        let path = match &self.path {
            Some(path) => Some(normalize_api_path(path).ok_or_else(|| invalid("empty path"))?),
            None => None,
        };
        let kind = match (self.kind, &path) {
            (Some(CallKind::Proxy), _) => {
                return Err(invalid("proxy operations cannot be declared by plugins"))
            }
            (Some(kind), None) if kind.exposes_http() => {
                return Err(invalid("an HTTP operation requires a path"))
            }
            (Some(kind), _) => kind,
            (None, Some(_)) => CallKind::Http,
            (None, None) => CallKind::Function,
        };

        Ok(OperationDescriptor {
            path,
            target: target.to_string(),
            function: self.function.clone(),
            methods: self.methods.clone(),
            params: self.params.clone(),
            kind,
            tags: tags.to_vec(),
            stream: self.is_stream(),
        })
    }
}

// ---------------------------------------------------------------------------
// PluginService
// ---------------------------------------------------------------------------

/// A deployable plugin type.
#[async_trait]
pub trait PluginService: Send + Sync + Sized + 'static {
    /// Type name; the deployment is named `plugin.TYPE_NAME`.
    const TYPE_NAME: &'static str;

    /// Static operation table.
    fn operations() -> Vec<Operation<Self>>;

    /// Constructs an instance.
    ///
    /// # Errors
    ///
    /// Returns an error when the instance cannot be built.
    async fn create(init: DeploymentInit) -> anyhow::Result<Self>;

    /// Runs once after instantiation, in the background.
    ///
    /// # Errors
    ///
    /// Failures are logged by the host and are not fatal.
    async fn on_start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Operation added at runtime, looked up when `function` is not in the
    /// static table.
    fn dynamic_operation(&self, _function: &str) -> Option<Operation<Self>> {
        None
    }
}

// ---------------------------------------------------------------------------
// Instance / ServiceUnit
// ---------------------------------------------------------------------------

/// In-process handle to a constructed deployment.
struct Instance<T> {
    target: String,
    inner: Arc<T>,
    bodies: HashMap<String, Body<T>>,
}

impl<T: PluginService> Instance<T> {
    fn lookup(&self, function: &str) -> Result<Body<T>, InvokeError> {
        if let Some(body) = self.bodies.get(function) {
            return Ok(body.clone());
        }
        self.inner
            .dynamic_operation(function)
            .map(|op| op.body)
            .ok_or_else(|| InvokeError::MissingFunction {
                target: self.target.clone(),
                function: function.to_string(),
            })
    }
}

fn chunk_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

#[async_trait]
impl<T: PluginService> ExecutionHandle for Instance<T> {
    fn target(&self) -> &str {
        &self.target
    }

    async fn call(&self, function: &str, kwargs: Kwargs) -> Result<Value, InvokeError> {
        match self.lookup(function)? {
            Body::Unary(f) | Body::Dual(f, _) => f(Arc::clone(&self.inner), kwargs)
                .await
                .map_err(InvokeError::remote),
            Body::Stream(f) => {
                let chunks: Vec<String> = f(Arc::clone(&self.inner), kwargs)
                    .map_err(InvokeError::remote)
                    .try_collect()
                    .await?;
                Ok(Value::Array(chunks.into_iter().map(Value::String).collect()))
            }
        }
    }

    async fn call_stream(
        &self,
        function: &str,
        kwargs: Kwargs,
    ) -> Result<ChunkStream, InvokeError> {
        match self.lookup(function)? {
            Body::Stream(f) | Body::Dual(_, f) => Ok(f(Arc::clone(&self.inner), kwargs)
                .map_err(InvokeError::remote)
                .boxed()),
            Body::Unary(f) => {
                let value = f(Arc::clone(&self.inner), kwargs)
                    .await
                    .map_err(InvokeError::remote)?;
                Ok(stream::once(async move { Ok(chunk_text(value)) }).boxed())
            }
        }
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.inner.on_start().await
    }
}

/// Type-erased constructor of a [`PluginService`].
pub struct ServiceUnit<T> {
    name: String,
    _service: PhantomData<fn() -> T>,
}

impl<T> ServiceUnit<T> {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _service: PhantomData,
        }
    }
}

#[async_trait]
impl<T: PluginService> DeploymentUnit for ServiceUnit<T> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(&self, init: DeploymentInit) -> anyhow::Result<SharedHandle> {
        let inner = Arc::new(T::create(init).await?);
        let bodies = T::operations()
            .into_iter()
            .map(|op| (op.function, op.body))
            .collect();
        Ok(Arc::new(Instance {
            target: self.name.clone(),
            inner,
            bodies,
        }))
    }
}

// ---------------------------------------------------------------------------
// PluginScope
// ---------------------------------------------------------------------------

/// The plugin being loaded, handed explicitly to its module's registration
/// function.
pub struct PluginScope<'a> {
    plugin: &'a mut Plugin,
    adapter: &'a dyn ExecutionAdapter,
}

impl<'a> PluginScope<'a> {
    pub fn new(plugin: &'a mut Plugin, adapter: &'a dyn ExecutionAdapter) -> Self {
        Self { plugin, adapter }
    }

    #[must_use]
    pub fn plugin_id(&self) -> &str {
        &self.plugin.id
    }

    /// Declares `T` as a deployment of the plugin.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidOperation`] for the first malformed
    /// operation; nothing is attached to the plugin in that case.
    pub fn register<T: PluginService>(&mut self) -> Result<(), ConfigError> {
        let target = deployment_name(&self.plugin.id, T::TYPE_NAME);
        let tags = vec![format!("{}(v{})", self.plugin.id, self.plugin.version())];
        let operations = T::operations()
            .iter()
            .map(|op| op.describe(&target, &tags))
            .collect::<Result<Vec<_>, _>>()?;

        let deployable = self
            .adapter
            .prepare_for_deployment(Arc::new(ServiceUnit::<T>::new(target.clone())));
        debug!(
            plugin = %self.plugin.id,
            deployment = %target,
            operations = operations.len(),
            "registered deployment"
        );
        self.plugin.deployments.push(Deployment {
            target,
            operations,
            deployable,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use framex_core::{ModelSchema, ParamType, PluginMetadata};
    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::adapter::LocalAdapter;
    use crate::plugin::{FunctionCatalog, RemoteApis};

    struct Greeter {
        greeting: String,
    }

    #[derive(Deserialize)]
    struct GreetArgs {
        name: String,
    }

    impl Greeter {
        async fn greet(&self, kwargs: Kwargs) -> anyhow::Result<Value> {
            let args: GreetArgs = parse_args(kwargs)?;
            Ok(json!(format!("{}, {}", self.greeting, args.name)))
        }
    }

    #[async_trait]
    impl PluginService for Greeter {
        const TYPE_NAME: &'static str = "Greeter";

        fn operations() -> Vec<Operation<Self>> {
            vec![
                Operation::unary("greet", |this: Arc<Self>, kwargs| async move {
                    this.greet(kwargs).await
                })
                .path("/greet")
                .param(Param::new("name", ParamType::String)),
                Operation::stream("count", |_this: Arc<Self>, _kwargs| {
                    stream::iter(["1", "2", "finish"].map(|c| Ok(c.to_string())))
                })
                .path("greet/count"),
                Operation::unary("secret", |_this: Arc<Self>, _kwargs| async move {
                    Ok(json!("s"))
                }),
            ]
        }

        async fn create(init: DeploymentInit) -> anyhow::Result<Self> {
            Ok(Self {
                greeting: init.config["greeting"].as_str().unwrap_or("hello").to_string(),
            })
        }

        fn dynamic_operation(&self, function: &str) -> Option<Operation<Self>> {
            (function == "late").then(|| {
                Operation::unary("late", |_this: Arc<Self>, _kwargs| async move {
                    Ok(json!("added at runtime"))
                })
            })
        }
    }

    fn plugin(id: &str) -> Plugin {
        Plugin {
            id: id.to_string(),
            module_name: format!("tests.{id}"),
            metadata: PluginMetadata::new(id, "1.2.0"),
            config: Value::Null,
            deployments: Vec::new(),
        }
    }

    fn init(adapter: Arc<LocalAdapter>, config: Value) -> DeploymentInit {
        let functions = Arc::new(FunctionCatalog::default());
        DeploymentInit {
            target: "greeter.Greeter".into(),
            plugin_id: "greeter".into(),
            remote_apis: RemoteApis::new(Default::default(), adapter, Arc::clone(&functions)),
            config,
            functions,
        }
    }

    #[test]
    fn descriptors_are_normalised_and_tagged() {
        let adapter = LocalAdapter::new();
        let mut plugin = plugin("greeter");
        PluginScope::new(&mut plugin, &adapter)
            .register::<Greeter>()
            .unwrap();

        let deployment = &plugin.deployments[0];
        assert_eq!(deployment.target, "greeter.Greeter");
        let ops = &deployment.operations;
        assert_eq!(ops[0].path.as_deref(), Some("/api/v1/greet"));
        assert_eq!(ops[0].kind, CallKind::Http);
        assert_eq!(ops[0].methods, vec![HttpMethod::Get]);
        assert_eq!(ops[0].tags, vec!["greeter(v1.2.0)".to_string()]);
        assert_eq!(ops[1].path.as_deref(), Some("/api/v1/greet/count"));
        assert!(ops[1].stream);
        // No path: downgraded to a function-only operation.
        assert_eq!(ops[2].kind, CallKind::Function);
        assert_eq!(ops[2].path, None);
    }

    #[test]
    fn invalid_operations_fail_before_instantiation() {
        type Op = Operation<Greeter>;
        let noop =
            |_this: Arc<Greeter>, _kwargs: Kwargs| async move { Ok::<_, anyhow::Error>(Value::Null) };

        let http_without_path = Op::unary("f", noop).kind(CallKind::Http);
        assert!(http_without_path.describe("t", &[]).is_err());

        let proxy = Op::unary("f", noop).path("/f").kind(CallKind::Proxy);
        assert!(proxy.describe("t", &[]).is_err());

        let model = ParamType::Model(ModelSchema::new("M", Vec::new()));
        let two_models = Op::unary("f", noop)
            .path("/f")
            .param(Param::new("a", model.clone()))
            .param(Param::new("b", model));
        let err = two_models.describe("t", &[]).unwrap_err();
        assert!(err.to_string().contains("structured"));
    }

    #[tokio::test]
    async fn instances_dispatch_by_function_name() {
        let adapter = Arc::new(LocalAdapter::new());
        let unit = ServiceUnit::<Greeter>::new("greeter.Greeter");
        let handle = unit
            .create(init(Arc::clone(&adapter), json!({"greeting": "hi"})))
            .await
            .unwrap();

        let mut kwargs = Kwargs::new();
        kwargs.insert("name".into(), json!("bob"));
        assert_eq!(handle.call("greet", kwargs).await.unwrap(), json!("hi, bob"));
        assert_eq!(
            handle.call("count", Kwargs::new()).await.unwrap(),
            json!(["1", "2", "finish"])
        );
        assert_eq!(
            handle.call("late", Kwargs::new()).await.unwrap(),
            json!("added at runtime")
        );

        let chunks: Vec<_> = handle
            .call_stream("count", Kwargs::new())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(chunks.len(), 3);

        let err = handle.call("missing", Kwargs::new()).await.unwrap_err();
        assert!(matches!(err, InvokeError::MissingFunction { .. }));

        // Bad arguments surface as a callee failure.
        let err = handle.call("greet", Kwargs::new()).await.unwrap_err();
        assert!(err.is_remote_failure());
    }
}
