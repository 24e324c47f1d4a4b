//! Process runtime: the [`RuntimeContext`] and the startup sequence.
//!
//! The context is built once by [`bootstrap`] and read-only afterwards:
//!
//! 1. pick the execution adapter for the configured mode
//! 2. load the requested plugins
//! 3. install the route registrar as the `backend` target
//! 4. instantiate every deployment with its resolved remote APIs
//! 5. expose every HTTP operation as a route
//! 6. run each deployment's start hook in the background; the host reports
//!    ready once all of them have returned

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use framex_core::OperationDescriptor;
use tracing::{error, info, warn};

use crate::adapter::{
    DistributedAdapter, LocalAdapter, SharedAdapter, SharedHandle, TaskSubstrate, WorkerOptions,
};
use crate::config::{AdapterMode, ServerSettings, Settings};
use crate::error::ConfigError;
use crate::network::{
    AppState, HostLifecycle, NetworkModule, RouteRegistrar, RouteSpec, RouteTable,
};
use crate::plugin::{
    ApiRegistry, DeploymentInit, FunctionCatalog, ModuleCatalog, Plugin, PluginManager,
    RemoteApis,
};
use crate::service::build_invocation_pipeline;

/// Everything the running host shares between its components.
pub struct RuntimeContext {
    pub settings: Arc<Settings>,
    pub adapter: SharedAdapter,
    pub plugins: Arc<PluginManager>,
    pub apis: Arc<ApiRegistry>,
    pub functions: Arc<FunctionCatalog>,
    /// Held here: the local adapter only keeps a weak reference to it.
    pub registrar: Arc<RouteRegistrar>,
    pub routes: Arc<RouteTable>,
    pub lifecycle: Arc<HostLifecycle>,
}

impl RuntimeContext {
    /// HTTP state over this context.
    #[must_use]
    pub fn app_state(&self) -> AppState {
        let server = &self.settings.server;
        let plugins: Vec<String> = self
            .plugins
            .loaded_plugins()
            .iter()
            .map(|p| p.id.clone())
            .collect();
        AppState {
            routes: Arc::clone(&self.routes),
            pipeline: build_invocation_pipeline(Arc::clone(&self.adapter), server),
            oauth: self.settings.auth.oauth.clone().map(Arc::new),
            lifecycle: Arc::clone(&self.lifecycle),
            plugins: Arc::from(plugins),
            invocation_timeout: server.invocation_timeout(),
            start_time: Instant::now(),
        }
    }
}

fn build_adapter(server: &ServerSettings) -> SharedAdapter {
    match server.mode {
        AdapterMode::Local => Arc::new(LocalAdapter::new()),
        AdapterMode::Distributed => {
            let options = WorkerOptions {
                mailbox_capacity: server.worker_mailbox_capacity,
                ..WorkerOptions::default()
            };
            Arc::new(DistributedAdapter::new(
                Arc::new(TaskSubstrate::new()),
                options,
            ))
        }
    }
}

/// Descriptors of the remote APIs `plugin` requires, by the name it uses.
///
/// # Errors
///
/// [`ConfigError::UnresolvedRemoteApi`] for a name no loaded plugin provides
/// while proxy forwarding is disabled.
fn resolve_remote_apis(
    plugin: &Plugin,
    apis: &ApiRegistry,
    enable_proxy: bool,
) -> Result<HashMap<String, OperationDescriptor>, ConfigError> {
    let mut resolved = HashMap::new();
    for name in plugin.required_remote_apis() {
        let api = match apis.get(name) {
            Some(api) => api,
            None if enable_proxy => {
                warn!(
                    plugin = %plugin.id,
                    api = %name,
                    "remote api not found, forwarding through proxy"
                );
                OperationDescriptor::proxy_fallback(name)
            }
            None => {
                return Err(ConfigError::UnresolvedRemoteApi {
                    plugin: plugin.id.clone(),
                    api: name.clone(),
                })
            }
        };
        resolved.insert(name.clone(), api);
    }
    Ok(resolved)
}

/// Builds the runtime from `settings` with the built-in module catalog.
///
/// # Errors
///
/// Any [`ConfigError`] raised while loading plugins, instantiating
/// deployments or registering their routes. All of them are fatal.
pub async fn bootstrap(settings: Settings) -> anyhow::Result<RuntimeContext> {
    bootstrap_with(settings, ModuleCatalog::with_builtins()).await
}

/// As [`bootstrap`], loading plugins from `catalog`.
///
/// # Errors
///
/// As [`bootstrap`].
pub async fn bootstrap_with(
    settings: Settings,
    catalog: ModuleCatalog,
) -> anyhow::Result<RuntimeContext> {
    let settings = Arc::new(settings);
    let adapter = build_adapter(&settings.server);
    info!(mode = settings.server.mode.as_str(), "execution adapter selected");

    let plugins = Arc::new(PluginManager::new(
        catalog,
        Arc::clone(&settings),
        Arc::clone(&adapter),
    ));
    plugins.auto_load(
        &settings.load_builtin_plugins,
        &settings.load_plugins,
        settings.enable_proxy,
    )?;

    let routes = Arc::new(RouteTable::new());
    let registrar = Arc::new(RouteRegistrar::new(
        Arc::clone(&routes),
        Arc::clone(&adapter),
        settings.auth.clone(),
    ));
    adapter.install_backend(registrar.clone()).await?;

    let apis = Arc::new(ApiRegistry::new(Arc::clone(&plugins)));
    let functions = Arc::new(FunctionCatalog::default());

    let mut handles: Vec<SharedHandle> = Vec::new();
    for plugin in plugins.loaded_plugins() {
        let remote = resolve_remote_apis(&plugin, &apis, settings.enable_proxy)?;
        for deployment in &plugin.deployments {
            let init = DeploymentInit {
                target: deployment.target.clone(),
                plugin_id: plugin.id.clone(),
                remote_apis: RemoteApis::new(
                    remote.clone(),
                    Arc::clone(&adapter),
                    Arc::clone(&functions),
                ),
                config: plugin.config.clone(),
                functions: Arc::clone(&functions),
            };
            let handle = adapter
                .instantiate(&deployment.deployable, init)
                .await
                .map_err(|source| ConfigError::LoadFailed {
                    plugin: plugin.id.clone(),
                    source,
                })?;
            handles.push(handle);
        }
    }

    for api in apis.http_apis() {
        if let Some(spec) = RouteSpec::from_descriptor(&api) {
            registrar.add_route(&spec)?;
        }
    }
    info!(
        plugins = plugins.loaded_plugins().len(),
        deployments = handles.len(),
        routes = routes.len(),
        "runtime ready"
    );

    let lifecycle = Arc::new(HostLifecycle::new());
    for handle in handles {
        let target = handle.target().to_string();
        lifecycle.expect_start(&target);
        let lifecycle = Arc::clone(&lifecycle);
        tokio::spawn(async move {
            let started = handle.start().await;
            if let Err(err) = &started {
                error!(
                    deployment = %target,
                    error = %format!("{err:#}"),
                    "deployment start hook failed"
                );
            }
            lifecycle.start_finished(&target, started.is_ok());
        });
    }

    Ok(RuntimeContext {
        settings,
        adapter,
        plugins,
        apis,
        functions,
        registrar,
        routes,
        lifecycle,
    })
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for the shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

/// Boots the host and serves HTTP until interrupted.
///
/// # Errors
///
/// Startup failures and fatal server I/O errors.
pub async fn run(settings: Settings) -> anyhow::Result<()> {
    let server = settings.server.clone();
    let context = bootstrap(settings).await?;

    let mut network = NetworkModule::new(server, context.app_state());
    let port = network.start().await?;
    info!(port, "framex listening");
    network.serve(shutdown_signal()).await?;

    context.adapter.shutdown().await;
    info!("framex stopped");
    Ok(())
}
