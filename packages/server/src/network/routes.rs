//! Dynamic route registration and the live route table.
//!
//! Routes are added at runtime, after the HTTP server is already up, so the
//! table is not an axum `Router`: it is an immutable snapshot published
//! through `ArcSwap` and consulted by the dispatch fallback on every request.
//! Registration replaces the snapshot wholesale; readers never observe a
//! partially updated table.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use framex_core::consts::{BACKEND_NAME, REGISTER_ROUTE_FUNC};
use framex_core::path::{match_path, paths_collide, wildcard_path};
use framex_core::{CallKind, HttpMethod, Kwargs, ModelSchema, OperationDescriptor, Param};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::adapter::{ChunkStream, ExecutionHandle, SharedAdapter};
use crate::config::AuthConfig;
use crate::error::{InvokeError, RouteError};

// ---------------------------------------------------------------------------
// RouteSpec
// ---------------------------------------------------------------------------

fn default_methods() -> Vec<HttpMethod> {
    vec![HttpMethod::Get]
}

/// A request to expose one operation as an HTTP route.
///
/// This is also the argument bag of the backend's `register_route` function,
/// so it travels as keyword arguments between deployments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSpec {
    pub path: String,
    #[serde(default = "default_methods")]
    pub methods: Vec<HttpMethod>,
    pub function_name: String,
    #[serde(default)]
    pub params: Vec<Param>,
    /// Deployment that serves the route.
    pub target: String,
    #[serde(default)]
    pub stream: bool,
    /// Skip the response envelope.
    #[serde(default)]
    pub direct_output: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Accepted keys. `None` resolves the keys from the auth settings.
    #[serde(default)]
    pub auth_keys: Option<Vec<String>>,
}

impl RouteSpec {
    /// Route of an HTTP-exposed operation, or `None` when it has no path.
    #[must_use]
    pub fn from_descriptor(api: &OperationDescriptor) -> Option<Self> {
        let path = api.path.clone()?;
        Some(Self {
            path,
            methods: api.methods.clone(),
            function_name: api.function.clone(),
            params: api.params.clone(),
            target: api.target.clone(),
            stream: api.stream,
            direct_output: false,
            tags: api.tags.clone(),
            auth_keys: None,
        })
    }
}

// ---------------------------------------------------------------------------
// RouteTable
// ---------------------------------------------------------------------------

/// A registered route.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    /// Operation invoked by the route; `path` is always set.
    pub api: OperationDescriptor,
    /// The path with every parameter segment reduced to a wildcard.
    pub wildcard: String,
    /// Request model synthesized from the parameter list.
    pub model: ModelSchema,
    pub auth_keys: Option<Vec<String>>,
    pub direct_output: bool,
}

impl RouteEntry {
    #[must_use]
    pub fn path(&self) -> &str {
        self.api.path.as_deref().unwrap_or_default()
    }

    fn accepts(&self, method: HttpMethod) -> bool {
        self.api.methods.contains(&method)
    }
}

/// Outcome of looking a request up in the table.
#[derive(Debug)]
pub enum RouteMatch {
    Found {
        entry: Arc<RouteEntry>,
        captures: HashMap<String, String>,
    },
    /// The path exists but not for this method.
    MethodNotAllowed,
    NotFound,
}

/// Snapshot-published list of live routes.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: ArcSwap<Vec<Arc<RouteEntry>>>,
}

impl RouteTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current routes in registration order.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<Arc<RouteEntry>>> {
        self.routes.load_full()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.load().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.load().is_empty()
    }

    /// Resolves `method path` to a route, capturing path parameters.
    #[must_use]
    pub fn find(&self, method: Option<HttpMethod>, path: &str) -> RouteMatch {
        let routes = self.routes.load();
        let mut path_matched = false;
        for entry in routes.iter() {
            let Some(captures) = match_path(entry.path(), path) else {
                continue;
            };
            if method.is_some_and(|m| entry.accepts(m)) {
                return RouteMatch::Found {
                    entry: Arc::clone(entry),
                    captures,
                };
            }
            path_matched = true;
        }
        if path_matched {
            RouteMatch::MethodNotAllowed
        } else {
            RouteMatch::NotFound
        }
    }

    fn push(&self, entry: RouteEntry) {
        let entry = Arc::new(entry);
        self.routes.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(Arc::clone(&entry));
            next
        });
    }
}

// ---------------------------------------------------------------------------
// RouteRegistrar
// ---------------------------------------------------------------------------

/// Adds routes to the live table. Reachable by other deployments as the
/// `backend` pseudo-target, whose only function is `register_route`.
///
/// Registration is not safe against itself: callers serialize it. In
/// distributed mode the registrar runs as a worker with concurrency 1.
pub struct RouteRegistrar {
    table: Arc<RouteTable>,
    adapter: SharedAdapter,
    auth: AuthConfig,
}

impl RouteRegistrar {
    #[must_use]
    pub fn new(table: Arc<RouteTable>, adapter: SharedAdapter, auth: AuthConfig) -> Self {
        Self {
            table,
            adapter,
            auth,
        }
    }

    #[must_use]
    pub fn table(&self) -> &Arc<RouteTable> {
        &self.table
    }

    /// Adds a route to the table.
    ///
    /// Returns `Ok(false)` without touching the table when an identical
    /// route (same path, methods and parameters) is already present.
    ///
    /// # Errors
    ///
    /// - [`RouteError::Empty`] for an empty path or method list.
    /// - [`RouteError::Duplicate`] when the path collides with an existing
    ///   route on a shared method.
    /// - [`RouteError::UnknownTarget`] when the serving deployment is not
    ///   running.
    pub fn add_route(&self, spec: &RouteSpec) -> Result<bool, RouteError> {
        let path = spec.path.trim();
        if path.is_empty() || spec.methods.is_empty() {
            return Err(RouteError::Empty {
                path: spec.path.clone(),
                methods: spec.methods.clone(),
            });
        }

        let methods: BTreeSet<HttpMethod> = spec.methods.iter().copied().collect();
        let existing = self.table.snapshot();
        for entry in existing.iter() {
            let entry_methods: BTreeSet<HttpMethod> = entry.api.methods.iter().copied().collect();
            if entry.path() == path && entry_methods == methods && entry.api.params == spec.params
            {
                warn!(
                    path,
                    tags = ?spec.tags,
                    "api is already registered, skipping duplicate registration"
                );
                return Ok(false);
            }
            if paths_collide(entry.path(), path) && !entry_methods.is_disjoint(&methods) {
                return Err(RouteError::Duplicate {
                    path: path.to_string(),
                    methods: spec.methods.clone(),
                    existing: entry.path().to_string(),
                });
            }
        }

        if self.adapter.resolve_handle(&spec.target).is_err() {
            return Err(RouteError::UnknownTarget {
                path: path.to_string(),
                target: spec.target.clone(),
            });
        }

        let tags = if spec.tags.is_empty() {
            vec!["default".to_string()]
        } else {
            spec.tags.clone()
        };
        let auth_keys = spec
            .auth_keys
            .clone()
            .or_else(|| self.auth.get_auth_keys(path));
        if auth_keys.is_some() {
            debug!(path, ?tags, "api requires auth");
        }

        let api = OperationDescriptor {
            path: Some(path.to_string()),
            target: spec.target.clone(),
            function: spec.function_name.clone(),
            methods: methods.into_iter().collect(),
            params: spec.params.clone(),
            kind: CallKind::Http,
            tags,
            stream: spec.stream,
        };
        let model = ModelSchema::from_params(
            format!("{}_InputModel", spec.function_name),
            &spec.params,
        );
        self.table.push(RouteEntry {
            wildcard: wildcard_path(path),
            api,
            model,
            auth_keys,
            direct_output: spec.direct_output,
        });
        info!(
            path,
            methods = ?spec.methods,
            deployment = %spec.target,
            function = %spec.function_name,
            stream = spec.stream,
            "registered api route"
        );
        Ok(true)
    }

    /// Adds a route, reporting failures in the log rather than to the caller.
    pub fn register(&self, spec: &RouteSpec) -> bool {
        match self.add_route(spec) {
            Ok(added) => added,
            Err(err) => {
                error!(path = %spec.path, deployment = %spec.target, error = %err, "failed to register api");
                false
            }
        }
    }

    fn dispatch(&self, function: &str, kwargs: Kwargs) -> Result<Value, InvokeError> {
        if function != REGISTER_ROUTE_FUNC {
            return Err(InvokeError::MissingFunction {
                target: BACKEND_NAME.to_string(),
                function: function.to_string(),
            });
        }
        let spec: RouteSpec =
            serde_json::from_value(Value::Object(kwargs)).map_err(InvokeError::remote)?;
        Ok(Value::Bool(self.register(&spec)))
    }
}

#[async_trait]
impl ExecutionHandle for RouteRegistrar {
    fn target(&self) -> &str {
        BACKEND_NAME
    }

    async fn call(&self, function: &str, kwargs: Kwargs) -> Result<Value, InvokeError> {
        self.dispatch(function, kwargs)
    }

    async fn call_stream(
        &self,
        function: &str,
        _kwargs: Kwargs,
    ) -> Result<ChunkStream, InvokeError> {
        Err(InvokeError::MissingFunction {
            target: BACKEND_NAME.to_string(),
            function: function.to_string(),
        })
    }

    fn call_blocking(&self, function: &str, kwargs: Kwargs) -> Option<Result<Value, InvokeError>> {
        Some(self.dispatch(function, kwargs))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use framex_core::ParamType;
    use serde_json::json;

    use super::*;
    use crate::adapter::testing::StubHandle;
    use crate::adapter::{ExecutionAdapter, LocalAdapter};

    fn registrar_with(auth: AuthConfig) -> RouteRegistrar {
        let adapter = LocalAdapter::new();
        adapter.insert_handle(Arc::new(StubHandle::new("echo.EchoPlugin")));
        RouteRegistrar::new(Arc::new(RouteTable::new()), Arc::new(adapter), auth)
    }

    fn registrar() -> RouteRegistrar {
        registrar_with(AuthConfig::default())
    }

    fn spec(path: &str, methods: &[HttpMethod], params: Vec<Param>) -> RouteSpec {
        RouteSpec {
            path: path.to_string(),
            methods: methods.to_vec(),
            function_name: "__call__".to_string(),
            params,
            target: "echo.EchoPlugin".to_string(),
            stream: false,
            direct_output: false,
            tags: Vec::new(),
            auth_keys: None,
        }
    }

    #[test]
    fn registered_route_is_found_with_captures() {
        let registrar = registrar();
        let added = registrar
            .add_route(&spec(
                "/api/v1/users/{id}",
                &[HttpMethod::Get],
                vec![Param::new("id", ParamType::Integer)],
            ))
            .unwrap();
        assert!(added);

        match registrar.table().find(Some(HttpMethod::Get), "/api/v1/users/7") {
            RouteMatch::Found { entry, captures } => {
                assert_eq!(entry.path(), "/api/v1/users/{id}");
                assert_eq!(entry.wildcard, "/api/v1/users/{}");
                assert_eq!(entry.api.tags, vec!["default".to_string()]);
                assert_eq!(entry.model.name, "__call___InputModel");
                assert_eq!(captures.get("id").map(String::as_str), Some("7"));
            }
            other => panic!("expected a match, got {other:?}"),
        }
        assert!(matches!(
            registrar.table().find(Some(HttpMethod::Post), "/api/v1/users/7"),
            RouteMatch::MethodNotAllowed
        ));
        assert!(matches!(
            registrar.table().find(Some(HttpMethod::Get), "/api/v1/nope"),
            RouteMatch::NotFound
        ));
    }

    #[test]
    fn identical_registration_is_skipped() {
        let registrar = registrar();
        let route = spec("/api/v1/echo", &[HttpMethod::Get], Vec::new());
        assert!(registrar.add_route(&route).unwrap());
        assert!(!registrar.add_route(&route).unwrap());
        assert_eq!(registrar.table().len(), 1);
    }

    #[test]
    fn colliding_parameter_paths_are_rejected() {
        let registrar = registrar();
        registrar
            .add_route(&spec(
                "/api/v1/users/{id}",
                &[HttpMethod::Get],
                vec![Param::new("id", ParamType::Integer)],
            ))
            .unwrap();
        let err = registrar
            .add_route(&spec(
                "/api/v1/users/{user_id}",
                &[HttpMethod::Get, HttpMethod::Post],
                vec![Param::new("user_id", ParamType::Integer)],
            ))
            .unwrap_err();
        assert!(matches!(err, RouteError::Duplicate { .. }));

        // Same shape on a disjoint method set is fine.
        assert!(registrar
            .add_route(&spec(
                "/api/v1/users/{user_id}",
                &[HttpMethod::Delete],
                vec![Param::new("user_id", ParamType::Integer)],
            ))
            .unwrap());
    }

    #[test]
    fn same_path_with_different_params_is_rejected() {
        let registrar = registrar();
        registrar
            .add_route(&spec("/api/v1/echo", &[HttpMethod::Get], Vec::new()))
            .unwrap();
        let err = registrar
            .add_route(&spec(
                "/api/v1/echo",
                &[HttpMethod::Get],
                vec![Param::new("message", ParamType::String)],
            ))
            .unwrap_err();
        assert!(matches!(err, RouteError::Duplicate { .. }));
    }

    #[test]
    fn empty_and_unknown_target_routes_fail() {
        let registrar = registrar();
        assert!(matches!(
            registrar.add_route(&spec("/api/v1/echo", &[], Vec::new())),
            Err(RouteError::Empty { .. })
        ));
        let mut orphan = spec("/api/v1/orphan", &[HttpMethod::Get], Vec::new());
        orphan.target = "ghost.Ghost".to_string();
        assert!(matches!(
            registrar.add_route(&orphan),
            Err(RouteError::UnknownTarget { .. })
        ));
        assert!(!registrar.register(&orphan));
        assert!(registrar.table().is_empty());
    }

    #[test]
    fn auth_keys_default_from_settings() {
        let auth = AuthConfig {
            general_auth_keys: vec!["general".into()],
            auth_urls: vec!["/api/v1/*".into()],
            special_auth_keys: HashMap::from([("/api/v1/open".to_string(), vec!["k".into()])]),
            oauth: None,
        };
        let registrar = registrar_with(auth);
        registrar
            .add_route(&spec("/api/v1/echo", &[HttpMethod::Get], Vec::new()))
            .unwrap();
        let mut explicit = spec("/api/v1/explicit", &[HttpMethod::Get], Vec::new());
        explicit.auth_keys = Some(vec!["mine".into()]);
        registrar.add_route(&explicit).unwrap();

        let routes = registrar.table().snapshot();
        assert_eq!(routes[0].auth_keys, Some(vec!["general".to_string()]));
        assert_eq!(routes[1].auth_keys, Some(vec!["mine".to_string()]));
    }

    #[tokio::test]
    async fn backend_registers_routes_through_the_adapter() {
        let adapter = Arc::new(LocalAdapter::new());
        adapter.insert_handle(Arc::new(StubHandle::new("echo.EchoPlugin")));
        let shared: SharedAdapter = adapter.clone();
        let registrar = Arc::new(RouteRegistrar::new(
            Arc::new(RouteTable::new()),
            shared,
            AuthConfig::default(),
        ));
        adapter.install_backend(registrar.clone()).await.unwrap();

        let route = spec("/api/v1/dynamic", &[HttpMethod::Post], Vec::new());
        let Value::Object(kwargs) = serde_json::to_value(&route).unwrap() else {
            panic!("route spec is an object");
        };
        let api = OperationDescriptor::function(BACKEND_NAME, REGISTER_ROUTE_FUNC);
        let first = adapter.invoke(&api, kwargs.clone()).await.unwrap();
        let second = adapter.invoke(&api, kwargs).await.unwrap();
        assert_eq!(first, json!(true));
        assert_eq!(second, json!(false));
        assert_eq!(registrar.table().len(), 1);
    }

    #[tokio::test]
    async fn backend_exposes_only_register_route() {
        let registrar = registrar();
        let err = registrar.call("unregister", Kwargs::new()).await.unwrap_err();
        assert!(matches!(err, InvokeError::MissingFunction { .. }));
    }
}
