//! Process-wide names and paths shared by the host and its plugins.

/// Human-readable product name.
pub const PROJECT_NAME: &str = "FrameX";

/// Version reported by the host and the built-in plugins.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Versioned prefix under which every operation route is mounted.
pub const API_PREFIX: &str = "/api/v1";

/// Path of the published API description.
pub const OPENAPI_PATH: &str = "/api/v1/openapi.json";

/// Pseudo-target that resolves to the route registrar.
pub const BACKEND_NAME: &str = "backend";

/// Function on the backend target that registers an HTTP route.
pub const REGISTER_ROUTE_FUNC: &str = "register_route";

/// Target name of the reverse-proxy gateway deployment.
pub const PROXY_PLUGIN_NAME: &str = "proxy.ProxyPlugin";

/// Module identifier of the built-in proxy plugin.
pub const PROXY_PLUGIN_ID: &str = "proxy";

/// Catch-all function on the gateway, called with a `proxy_path` argument.
pub const PROXY_CALL_FUNC: &str = "__call__";

/// Gateway function answering whether a proxied path streams.
pub const PROXY_CHECK_STREAM_FUNC: &str = "check_is_gen_api";

/// Gateway function that files a function under a name.
pub const PROXY_REGISTER_FUNC: &str = "register_proxy_function";

/// Gateway function that invokes a previously filed function.
pub const PROXY_INVOKE_FUNC: &str = "call_proxy_function";

/// Generic route accepting `(encoded function name, encoded argument bag)`.
pub const PROXY_FUNC_HTTP_PATH: &str = "/api/v1/proxy/remote";

/// Status codes accepted in a proxied `{status, data}` envelope.
pub const LEGAL_PROXY_CODES: &[u16] = &[200];

/// Keyword argument carrying the literal forwarding path of a PROXY call.
pub const PROXY_PATH_ARG: &str = "proxy_path";

/// Default function name of an operation that did not name one.
pub const DEFAULT_FUNC_NAME: &str = "__call__";
