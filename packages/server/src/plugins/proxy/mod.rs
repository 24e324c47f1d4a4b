//! Reverse-proxy gateway.
//!
//! On start the gateway reads the API description of every configured remote
//! service and mirrors each whitelisted operation as a local HTTP route whose
//! body forwards the call. Mirrored operations are also reachable through the
//! catch-all `__call__(proxy_path, ..)` entrypoint, which serves required
//! remote APIs no local plugin provides. A service whose description cannot
//! be fetched is retried on later lookups, at most once per retry interval.
//!
//! The gateway also forwards functions by name: functions are filed under a
//! name (local, or served by a remote host), and a single generic route,
//! registered on first use, accepts an encoded name and argument bag.

pub mod config;
pub mod forward;
pub mod openapi;

use std::sync::Arc;
use std::time::Instant;

use async_stream::stream;
use async_trait::async_trait;
use dashmap::DashMap;
use framex_core::codec::{decode, encode};
use framex_core::consts::{
    PROXY_CALL_FUNC, PROXY_CHECK_STREAM_FUNC, PROXY_FUNC_HTTP_PATH, PROXY_INVOKE_FUNC,
    PROXY_PATH_ARG, PROXY_PLUGIN_NAME, PROXY_REGISTER_FUNC, VERSION,
};
use framex_core::{FieldDef, HttpMethod, Kwargs, ModelSchema, Param, ParamType, PluginMetadata};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, error, info, warn};

use self::config::ProxyConfig;
use self::forward::{Forwarder, RemoteTarget};
use self::openapi::{parse_document, BODY_PARAM};
use crate::network::routes::RouteSpec;
use crate::plugin::{
    DeploymentInit, FunctionCatalog, Operation, PluginModule, PluginScope, PluginService,
    RemoteApis,
};

pub const MODULE: PluginModule = PluginModule {
    module_name: "framex.plugins.proxy",
    metadata,
    register,
};

fn metadata() -> PluginMetadata {
    PluginMetadata::new("proxy", VERSION)
        .description(
            "Transparent proxy: mirrors the operations of remote services and forwards calls to them.",
        )
        .author("framex")
        .url("https://github.com/touale/FrameX-kit")
}

fn register(scope: &mut PluginScope<'_>) -> anyhow::Result<()> {
    scope.register::<ProxyPlugin>()?;
    Ok(())
}

/// Progress of mirroring one remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    NotParsed,
    Parsing,
    Parsed,
}

/// Where a forwardable function runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxiedFunction {
    /// In this process, looked up in the function catalog.
    Local,
    /// On the host at this base URL.
    Remote(String),
}

fn not_found(message: String) -> Value {
    json!({"status": 404, "message": message})
}

fn string_arg(args: &Kwargs, name: &str) -> anyhow::Result<String> {
    args.get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("missing string argument `{name}`"))
}

/// Model of the generic function route's body.
fn function_body_model() -> ModelSchema {
    let field = |name: &str| FieldDef {
        name: name.into(),
        ty: ParamType::String,
        required: true,
        default: None,
    };
    ModelSchema::new("ProxyFuncHttpBody", vec![field("func_name"), field("data")])
}

pub struct ProxyPlugin {
    config: ProxyConfig,
    forwarder: Forwarder,
    remote_apis: RemoteApis,
    functions: Arc<FunctionCatalog>,
    states: DashMap<String, ParseState>,
    /// Serializes parsing per service.
    parse_locks: DashMap<String, Arc<Mutex<()>>>,
    /// When each service last failed to parse.
    failed_at: DashMap<String, Instant>,
    /// Mirrored operations by operation id.
    operations: DashMap<String, Arc<RemoteTarget>>,
    /// Mirrored operations by remote path, for the catch-all entrypoint.
    paths: DashMap<String, Arc<RemoteTarget>>,
    proxied: DashMap<String, ProxiedFunction>,
    function_route: OnceCell<()>,
}

impl ProxyPlugin {
    #[must_use]
    pub fn parse_state(&self, base_url: &str) -> ParseState {
        self.states
            .get(base_url)
            .map_or(ParseState::NotParsed, |state| *state)
    }

    /// Whether `base_url` failed to parse less than the retry interval ago.
    fn backing_off(&self, base_url: &str) -> bool {
        self.failed_at
            .get(base_url)
            .is_some_and(|at| at.elapsed() < self.config.retry_interval())
    }

    /// Mirrors the service at `base_url` unless it is parsed or recently
    /// failed. Concurrent callers wait for a parse in progress.
    async fn ensure_parsed(&self, base_url: &str) {
        let lock = Arc::clone(
            self.parse_locks
                .entry(base_url.to_string())
                .or_default()
                .value(),
        );
        let _parsing = lock.lock().await;
        if self.parse_state(base_url) == ParseState::Parsed || self.backing_off(base_url) {
            return;
        }

        self.states.insert(base_url.to_string(), ParseState::Parsing);
        let next = match self.mirror(base_url).await {
            Ok(count) => {
                info!(url = %base_url, routes = count, "parsed remote api description");
                self.failed_at.remove(base_url);
                ParseState::Parsed
            }
            Err(err) => {
                error!(
                    url = %base_url,
                    error = %format!("{err:#}"),
                    retry_in = ?self.config.retry_interval(),
                    "failed to parse remote api description"
                );
                self.failed_at.insert(base_url.to_string(), Instant::now());
                ParseState::NotParsed
            }
        };
        self.states.insert(base_url.to_string(), next);
    }

    async fn ensure_all_parsed(&self) {
        for url in &self.config.proxy_urls {
            self.ensure_parsed(url).await;
        }
    }

    /// Registers every whitelisted operation of `base_url` as a route.
    async fn mirror(&self, base_url: &str) -> anyhow::Result<usize> {
        let document = self.forwarder.fetch_description(base_url).await?;
        let mut registered = 0;
        for mut op in parse_document(&document) {
            if !self.config.is_whitelisted(&op.path) {
                debug!(path = %op.path, "proxy api not whitelisted, skipping");
                continue;
            }
            op.stream |= self.config.is_forced_stream(&op.path);
            debug!(
                path = %op.path,
                method = %op.method,
                params = op.params.len(),
                "found proxy api"
            );

            let target = Arc::new(RemoteTarget::new(base_url, op));
            let spec = RouteSpec {
                path: target.op.path.clone(),
                methods: vec![target.op.method],
                function_name: target.op.operation_id.clone(),
                params: target.op.params.clone(),
                target: PROXY_PLUGIN_NAME.to_string(),
                stream: target.op.stream,
                direct_output: true,
                tags: vec![format!("proxy({base_url})")],
                auth_keys: None,
            };
            self.operations
                .insert(target.op.operation_id.clone(), Arc::clone(&target));
            self.paths
                .entry(target.op.path.clone())
                .or_insert_with(|| Arc::clone(&target));

            if self.remote_apis.register_route(&spec).await? {
                registered += 1;
            }
        }
        Ok(registered)
    }

    /// The mirrored operation at `path`, parsing pending services first.
    async fn lookup_path(&self, path: &str) -> Option<Arc<RemoteTarget>> {
        if let Some(target) = self.paths.get(path) {
            return Some(Arc::clone(target.value()));
        }
        self.ensure_all_parsed().await;
        self.paths.get(path).map(|target| Arc::clone(target.value()))
    }

    async fn proxy_call(&self, mut kwargs: Kwargs) -> anyhow::Result<Value> {
        let path = string_arg(&kwargs, PROXY_PATH_ARG)?;
        kwargs.remove(PROXY_PATH_ARG);
        match self.lookup_path(&path).await {
            Some(target) => self.forwarder.call(&target, kwargs).await,
            None => Ok(not_found(format!("no proxy api for `{path}`"))),
        }
    }

    fn proxy_call_stream(
        self: Arc<Self>,
        mut kwargs: Kwargs,
    ) -> BoxStream<'static, anyhow::Result<String>> {
        stream! {
            let path = match string_arg(&kwargs, PROXY_PATH_ARG) {
                Ok(path) => path,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };
            kwargs.remove(PROXY_PATH_ARG);
            let Some(target) = self.lookup_path(&path).await else {
                yield Err(anyhow::anyhow!("no proxy api for `{path}`"));
                return;
            };
            let mut frames = self.forwarder.call_stream(target, kwargs);
            while let Some(frame) = frames.next().await {
                yield frame;
            }
        }
        .boxed()
    }

    async fn check_is_gen_api(&self, kwargs: Kwargs) -> anyhow::Result<Value> {
        let path = string_arg(&kwargs, "path")?;
        let declared = self
            .lookup_path(&path)
            .await
            .is_some_and(|target| target.op.stream);
        Ok(Value::Bool(declared || self.config.is_forced_stream(&path)))
    }

    /// Exposes the generic function route, once.
    async fn ensure_function_route(&self) -> anyhow::Result<()> {
        self.function_route
            .get_or_try_init(|| async {
                let spec = RouteSpec {
                    path: PROXY_FUNC_HTTP_PATH.to_string(),
                    methods: vec![HttpMethod::Post],
                    function_name: PROXY_INVOKE_FUNC.to_string(),
                    params: vec![Param::new(BODY_PARAM, ParamType::Model(function_body_model()))],
                    target: PROXY_PLUGIN_NAME.to_string(),
                    stream: false,
                    direct_output: true,
                    tags: vec!["proxy".to_string()],
                    auth_keys: None,
                };
                self.remote_apis.register_route(&spec).await?;
                info!(path = PROXY_FUNC_HTTP_PATH, "registered proxy function route");
                Ok::<(), anyhow::Error>(())
            })
            .await?;
        Ok(())
    }

    /// Files `name`. Returns `false`, keeping the first entry, when the name
    /// is already filed.
    ///
    /// # Errors
    ///
    /// Fails when the generic function route cannot be registered.
    pub async fn register_function(
        &self,
        name: &str,
        function: ProxiedFunction,
    ) -> anyhow::Result<bool> {
        if self.proxied.contains_key(name) {
            warn!(function = name, "proxy function already registered, skipping");
            return Ok(false);
        }
        self.ensure_function_route().await?;
        debug!(function = name, location = ?function, "registered proxy function");
        self.proxied.insert(name.to_string(), function);
        Ok(true)
    }

    async fn register_proxy_function(&self, kwargs: Kwargs) -> anyhow::Result<Value> {
        let name = string_arg(&kwargs, "func_name")?;
        let registered = self.register_function(&name, ProxiedFunction::Local).await?;
        Ok(json!({"status": 200, "data": registered}))
    }

    /// Runs a function call arriving as an encoded name and argument bag,
    /// either directly or nested under the body parameter.
    async fn call_proxy_function(&self, kwargs: Kwargs) -> anyhow::Result<Value> {
        let body = match kwargs.get(BODY_PARAM) {
            Some(Value::Object(body)) => body.clone(),
            _ => kwargs,
        };
        let encoded_name = string_arg(&body, "func_name")?;
        let encoded_data = string_arg(&body, "data")?;
        let name: String = decode(&encoded_name)?;

        let location = self.proxied.get(&name).map(|entry| entry.value().clone());
        match location {
            Some(ProxiedFunction::Remote(base_url)) => {
                debug!(function = %name, url = %base_url, "forwarding proxy function");
                let request = json!({"func_name": encoded_name, "data": encoded_data});
                self.forwarder.post_function(&base_url, &request).await
            }
            _ => {
                let Some(function) = self.functions.get(&name) else {
                    return Ok(not_found(format!("proxy function `{name}` is not registered")));
                };
                let args: Kwargs = decode(&encoded_data)?;
                let result = function(args).await?;
                Ok(json!({"status": 200, "data": encode(&result)?}))
            }
        }
    }
}

#[async_trait]
impl PluginService for ProxyPlugin {
    const TYPE_NAME: &'static str = "ProxyPlugin";

    fn operations() -> Vec<Operation<Self>> {
        vec![
            Operation::dual(
                PROXY_CALL_FUNC,
                |this: Arc<Self>, kwargs| async move { this.proxy_call(kwargs).await },
                |this: Arc<Self>, kwargs| this.proxy_call_stream(kwargs),
            ),
            Operation::unary(PROXY_CHECK_STREAM_FUNC, |this: Arc<Self>, kwargs| async move {
                this.check_is_gen_api(kwargs).await
            }),
            Operation::unary(PROXY_REGISTER_FUNC, |this: Arc<Self>, kwargs| async move {
                this.register_proxy_function(kwargs).await
            }),
            Operation::unary(PROXY_INVOKE_FUNC, |this: Arc<Self>, kwargs| async move {
                this.call_proxy_function(kwargs).await
            }),
        ]
    }

    async fn create(init: DeploymentInit) -> anyhow::Result<Self> {
        let config: ProxyConfig = init.config()?;
        let forwarder = Forwarder::new(config.timeout(), config.auth.clone())?;
        Ok(Self {
            config,
            forwarder,
            remote_apis: init.remote_apis,
            functions: init.functions,
            states: DashMap::new(),
            parse_locks: DashMap::new(),
            failed_at: DashMap::new(),
            operations: DashMap::new(),
            paths: DashMap::new(),
            proxied: DashMap::new(),
            function_route: OnceCell::new(),
        })
    }

    async fn on_start(&self) -> anyhow::Result<()> {
        let mut remote: Vec<(&String, &Vec<String>)> =
            self.config.proxy_functions.iter().collect();
        remote.sort();
        for (base_url, names) in remote {
            for name in names {
                self.register_function(name, ProxiedFunction::Remote(base_url.clone()))
                    .await?;
            }
        }
        for name in self.functions.names() {
            if !self.proxied.contains_key(&name) {
                self.register_function(&name, ProxiedFunction::Local).await?;
            }
        }
        self.ensure_all_parsed().await;
        Ok(())
    }

    fn dynamic_operation(&self, function: &str) -> Option<Operation<Self>> {
        let target = self.operations.get(function).map(|t| Arc::clone(t.value()))?;
        let stream_target = Arc::clone(&target);
        Some(Operation::dual(
            function,
            move |this: Arc<Self>, kwargs| {
                let target = Arc::clone(&target);
                async move { this.forwarder.call(&target, kwargs).await }
            },
            move |this: Arc<Self>, kwargs| {
                this.forwarder.call_stream(Arc::clone(&stream_target), kwargs)
            },
        ))
    }
}
