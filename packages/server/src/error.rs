//! Error taxonomy of the plugin host.
//!
//! - [`ConfigError`]: fatal startup misconfiguration, never swallowed.
//! - [`RouteError`]: conflicting HTTP route registration.
//! - [`InvokeError`]: anything that goes wrong reaching or running an operation.

use std::path::PathBuf;

use framex_core::{HttpMethod, ValidationError};

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Fatal configuration errors raised while the host starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("plugin already exists: {id}. Check for duplicate plugin names")]
    DuplicatePlugin { id: String },

    #[error("plugin not found: {name}. Check your plugin name")]
    PluginNotFound { name: String },

    #[error("plugin `{plugin}` failed to load: {source:#}")]
    LoadFailed {
        plugin: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("required remote api `{api}` of plugin `{plugin}` is unresolved and proxy forwarding is disabled")]
    UnresolvedRemoteApi { plugin: String, api: String },

    #[error("`enable_proxy` is set but `proxy` is not in `load_builtin_plugins`")]
    ProxyPluginMissing,

    #[error("invalid operation `{function}` on `{target}`: {reason}")]
    InvalidOperation {
        target: String,
        function: String,
        reason: String,
    },

    #[error("special auth rule `{pattern}` is not covered by any entry of `auth_urls`")]
    UncoveredAuthRule { pattern: String },

    #[error("failed to read settings from {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings: {0}")]
    Parse(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// RouteError
// ---------------------------------------------------------------------------

/// A route could not be added to the live route table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("Duplicate API route: {path} {methods:?} conflicts with existing route {existing}")]
    Duplicate {
        path: String,
        methods: Vec<HttpMethod>,
        existing: String,
    },

    #[error("api path ({path:?}) or methods ({methods:?}) is empty")]
    Empty {
        path: String,
        methods: Vec<HttpMethod>,
    },

    #[error("no handle found for api {path}: deployment `{target}` is not running")]
    UnknownTarget { path: String, target: String },
}

// ---------------------------------------------------------------------------
// InvokeError
// ---------------------------------------------------------------------------

/// Failure to reach or run an operation.
///
/// Retrieval errors (`MissingHandle`, `MissingFunction`, `UnknownApi`) are
/// never retried by the adapter. Callee failures are propagated unchanged.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("no execution handle found for deployment `{target}`")]
    MissingHandle { target: String },

    #[error("no function `{function}` found on deployment `{target}`")]
    MissingFunction { target: String, function: String },

    #[error("unknown api `{name}`")]
    UnknownApi { name: String },

    #[error(transparent)]
    InvalidArguments(#[from] ValidationError),

    #[error("{0:#}")]
    Remote(anyhow::Error),

    #[error("proxy call failed with status {status}: {message}")]
    ProxyStatus { status: i64, message: String },

    #[error("malformed proxy response: {reason}")]
    ProxyProtocol { reason: String },

    #[error("server overloaded, try again later")]
    Overloaded,

    #[error("invocation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("worker `{target}` is no longer running")]
    WorkerClosed { target: String },
}

impl InvokeError {
    /// Whether the failure originated in the callee rather than in locating it.
    #[must_use]
    pub fn is_remote_failure(&self) -> bool {
        matches!(
            self,
            Self::Remote(_) | Self::ProxyStatus { .. } | Self::ProxyProtocol { .. }
        )
    }

    /// Whether the failure is a retrieval error.
    #[must_use]
    pub fn is_retrieval(&self) -> bool {
        matches!(
            self,
            Self::MissingHandle { .. } | Self::MissingFunction { .. } | Self::UnknownApi { .. }
        )
    }

    pub(crate) fn remote(err: impl Into<anyhow::Error>) -> Self {
        Self::Remote(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_failures_are_classified() {
        assert!(InvokeError::remote(anyhow::anyhow!("boom")).is_remote_failure());
        assert!(InvokeError::ProxyStatus {
            status: 500,
            message: "x".into()
        }
        .is_remote_failure());
        assert!(InvokeError::ProxyProtocol {
            reason: "missing status".into()
        }
        .is_remote_failure());
        assert!(!InvokeError::Overloaded.is_remote_failure());
    }

    #[test]
    fn retrieval_errors_are_classified() {
        let err = InvokeError::MissingFunction {
            target: "echo.EchoPlugin".into(),
            function: "nope".into(),
        };
        assert!(err.is_retrieval());
        assert!(!err.is_remote_failure());
        assert_eq!(
            err.to_string(),
            "no function `nope` found on deployment `echo.EchoPlugin`"
        );
    }

    #[test]
    fn duplicate_route_message_names_the_conflict() {
        let err = RouteError::Duplicate {
            path: "/api/v1/users/{user_id}".into(),
            methods: vec![HttpMethod::Get],
            existing: "/api/v1/users/{id}".into(),
        };
        assert!(err.to_string().starts_with("Duplicate API route"));
    }
}
