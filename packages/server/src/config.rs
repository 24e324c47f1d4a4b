//! Host settings, loaded from a TOML file and overridden from the command line.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use framex_core::path::{pattern_matches, wildcard_prefix_len};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// AdapterMode
// ---------------------------------------------------------------------------

/// Execution strategy, fixed for the lifetime of the process.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum AdapterMode {
    /// Deployments run in-process and are called directly.
    #[default]
    Local,
    /// Deployments run as independently scheduled workers reached by message passing.
    Distributed,
}

impl AdapterMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Distributed => "distributed",
        }
    }
}

// ---------------------------------------------------------------------------
// ServerSettings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub mode: AdapterMode,
    pub cors_origins: Vec<String>,
    /// Transport-level cap on one HTTP request, streaming included.
    pub request_timeout_secs: u64,
    /// Cap on one operation invocation.
    pub invocation_timeout_secs: u64,
    /// Invocations beyond this many in flight are shed.
    pub max_concurrent_invocations: u32,
    /// Mailbox capacity of each distributed worker.
    pub worker_mailbox_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            mode: AdapterMode::Local,
            cors_origins: vec!["*".to_string()],
            request_timeout_secs: 600,
            invocation_timeout_secs: 300,
            max_concurrent_invocations: 1000,
            worker_mailbox_capacity: 256,
        }
    }
}

impl ServerSettings {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_secs(self.invocation_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// AuthConfig
// ---------------------------------------------------------------------------

/// Signing parameters of the session-token cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthConfig {
    pub jwt_secret: String,
    #[serde(default = "default_jwt_algorithm")]
    pub jwt_algorithm: String,
}

fn default_jwt_algorithm() -> String {
    "HS256".to_string()
}

/// Key-based authorization rules.
///
/// `auth_urls` lists the protected patterns (exact, or `prefix/*`); those
/// accept `general_auth_keys`. `special_auth_keys` overrides the keys for
/// specific patterns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub general_auth_keys: Vec<String>,
    pub auth_urls: Vec<String>,
    pub special_auth_keys: HashMap<String, Vec<String>>,
    pub oauth: Option<OAuthConfig>,
}

impl AuthConfig {
    /// Keys accepted for `path`, or `None` when the path is unprotected.
    ///
    /// An exact special rule wins over any wildcard; among wildcard special
    /// rules the longest prefix wins; otherwise a matching `auth_urls` entry
    /// selects the general keys.
    #[must_use]
    pub fn get_auth_keys(&self, path: &str) -> Option<Vec<String>> {
        if let Some(keys) = self.special_auth_keys.get(path) {
            return Some(keys.clone());
        }

        let special = self
            .special_auth_keys
            .iter()
            .filter_map(|(pattern, keys)| {
                wildcard_prefix_len(pattern)
                    .filter(|_| pattern_matches(pattern, path))
                    .map(|len| (len, keys))
            })
            .max_by_key(|(len, _)| *len);
        if let Some((_, keys)) = special {
            return Some(keys.clone());
        }

        self.auth_urls
            .iter()
            .any(|pattern| pattern_matches(pattern, path))
            .then(|| self.general_auth_keys.clone())
    }

    /// Rejects special rules that no `auth_urls` entry covers.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UncoveredAuthRule`] naming the first such rule.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut patterns: Vec<&String> = self.special_auth_keys.keys().collect();
        patterns.sort();
        for pattern in patterns {
            // A wildcard rule is covered when any path below its prefix is.
            let probe = match pattern.strip_suffix("/*") {
                Some(prefix) => format!("{prefix}/_"),
                None => pattern.clone(),
            };
            let covered = self
                .auth_urls
                .iter()
                .any(|url| url == pattern || pattern_matches(url, &probe));
            if !covered {
                return Err(ConfigError::UncoveredAuthRule {
                    pattern: pattern.clone(),
                });
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// LogConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directives; `RUST_LOG` takes precedence.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Include file and line of each event.
    pub include_location: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
            include_location: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Top-level host settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    /// Forward unresolved remote APIs through the proxy plugin.
    pub enable_proxy: bool,
    /// External plugin identifiers or search packages.
    pub load_plugins: Vec<String>,
    /// Names of built-in plugins to load.
    pub load_builtin_plugins: Vec<String>,
    /// Per-plugin configuration tables, keyed by plugin identifier or name.
    pub plugins: HashMap<String, Value>,
    pub auth: AuthConfig,
    pub log: LogConfig,
}

impl Settings {
    /// Parses settings from TOML text and validates them.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed TOML or
    /// [`ConfigError::UncoveredAuthRule`] on inconsistent auth rules.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let settings: Self = toml::from_str(text)?;
        settings.auth.validate()?;
        Ok(settings)
    }

    /// Loads settings from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise as
    /// [`Settings::from_toml_str`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Configuration table of a plugin, looked up by identifier and then by
    /// metadata name. `Null` when neither is configured.
    #[must_use]
    pub fn plugin_config(&self, id: &str, name: &str) -> Value {
        self.plugins
            .get(id)
            .or_else(|| self.plugins.get(name))
            .cloned()
            .unwrap_or(Value::Null)
    }
}
