use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::consts::{DEFAULT_FUNC_NAME, PROXY_CALL_FUNC, PROXY_PLUGIN_NAME};
use crate::schema::Param;

/// Keyword arguments of an invocation, keyed by parameter name.
pub type Kwargs = serde_json::Map<String, serde_json::Value>;

/// Derives the stable target name of a deployment from its plugin and type.
#[must_use]
pub fn deployment_name(plugin_id: &str, type_name: &str) -> String {
    format!("{plugin_id}.{type_name}")
}

// ---------------------------------------------------------------------------
// CallKind
// ---------------------------------------------------------------------------

/// Invocation surfaces an operation is exposed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    /// Callable by `target.function` name only.
    Function,
    /// Exposed as an HTTP route.
    #[default]
    Http,
    /// Both an HTTP route and a named function.
    #[serde(alias = "all")]
    Both,
    /// Forwarded through the reverse-proxy gateway. Only synthesized by the
    /// host, never declared by a plugin.
    Proxy,
}

impl CallKind {
    /// Whether this kind requires an HTTP path.
    #[must_use]
    pub fn exposes_http(self) -> bool {
        matches!(self, Self::Http | Self::Both)
    }

    /// Whether this kind is reachable by function name.
    #[must_use]
    pub fn exposes_function(self) -> bool {
        matches!(self, Self::Function | Self::Both)
    }
}

// ---------------------------------------------------------------------------
// HttpMethod
// ---------------------------------------------------------------------------

/// HTTP verb an operation route accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    /// Upper-case wire name of the method.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    /// Whether requests with this method carry a body.
    #[must_use]
    pub fn has_body(self) -> bool {
        !matches!(self, Self::Get)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string is not a supported HTTP method.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported HTTP method: {0}")]
pub struct UnknownMethod(pub String);

impl FromStr for HttpMethod {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            _ => Err(UnknownMethod(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// OperationDescriptor
// ---------------------------------------------------------------------------

/// Invocation metadata of one operation exposed by a deployment.
///
/// A descriptor is resolvable through the HTTP index (keyed by `path`) when its
/// kind exposes HTTP, and through the function index (keyed by
/// `target.function`) when its kind exposes a function name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationDescriptor {
    /// Route path under the API prefix. Absent for function-only operations.
    pub path: Option<String>,
    /// Stable identity of the deployment hosting the operation.
    pub target: String,
    /// Function to call on the deployment.
    pub function: String,
    /// Accepted HTTP methods.
    pub methods: Vec<HttpMethod>,
    /// Ordered parameter list.
    pub params: Vec<Param>,
    /// Surfaces the operation is exposed on.
    pub kind: CallKind,
    /// Display tags, e.g. the owning plugin and its version.
    pub tags: Vec<String>,
    /// Whether the operation yields a sequence of text events.
    pub stream: bool,
}

impl OperationDescriptor {
    /// Creates a function-only descriptor with no parameters.
    #[must_use]
    pub fn function(target: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            path: None,
            target: target.into(),
            function: function.into(),
            methods: vec![HttpMethod::Post],
            params: Vec::new(),
            kind: CallKind::Function,
            tags: Vec::new(),
            stream: false,
        }
    }

    /// Descriptor that forwards `name` through the gateway's catch-all entrypoint.
    #[must_use]
    pub fn proxy_fallback(name: &str) -> Self {
        Self {
            path: Some(name.to_string()),
            kind: CallKind::Proxy,
            ..Self::function(PROXY_PLUGIN_NAME, PROXY_CALL_FUNC)
        }
    }

    /// Descriptor of a gateway function reached with PROXY semantics but no path.
    #[must_use]
    pub fn proxy_function(function: &str) -> Self {
        Self {
            kind: CallKind::Proxy,
            ..Self::function(PROXY_PLUGIN_NAME, function)
        }
    }

    /// Key of this operation in the function index.
    #[must_use]
    pub fn function_key(&self) -> String {
        format!("{}.{}", self.target, self.function)
    }

    /// Whether the descriptor belongs in the HTTP index.
    #[must_use]
    pub fn is_http(&self) -> bool {
        self.kind.exposes_http() && self.path.is_some()
    }

    /// Whether the descriptor belongs in the function index.
    #[must_use]
    pub fn is_function(&self) -> bool {
        self.kind.exposes_function()
    }
}

impl Default for OperationDescriptor {
    fn default() -> Self {
        Self::function(String::new(), DEFAULT_FUNC_NAME)
    }
}

// ---------------------------------------------------------------------------
// PluginMetadata
// ---------------------------------------------------------------------------

/// Metadata a plugin module declares about itself.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginMetadata {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    pub url: String,
    /// Operations (by path or `target.function`) the plugin calls at runtime.
    pub required_remote_apis: Vec<String>,
    pub priority: i32,
    pub tags: Vec<String>,
}

impl PluginMetadata {
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Declares the remote operations this plugin needs.
    #[must_use]
    pub fn requires<I, S>(mut self, apis: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_remote_apis = apis.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}
