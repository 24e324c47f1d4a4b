use std::collections::HashMap;
use std::time::Duration;

use framex_core::path::pattern_matches;
use serde::Deserialize;

use crate::config::AuthConfig;

/// Configuration of the reverse-proxy gateway, read from `[plugins.proxy]`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Base URLs of the remote services whose API descriptions are mirrored.
    pub proxy_urls: Vec<String>,
    /// Paths always treated as streaming endpoints.
    pub force_stream_apis: Vec<String>,
    /// Path patterns (exact or `prefix/*`) to mirror. Empty mirrors all.
    pub white_list: Vec<String>,
    /// Remote base URL to the names of functions it serves.
    pub proxy_functions: HashMap<String, Vec<String>>,
    /// Selects the outbound `Authorization` header per remote path.
    pub auth: AuthConfig,
    pub timeout_secs: u64,
    /// Minimum wait before a service whose description failed to load is
    /// fetched again.
    pub retry_interval_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            proxy_urls: Vec::new(),
            force_stream_apis: Vec::new(),
            white_list: Vec::new(),
            proxy_functions: HashMap::new(),
            auth: AuthConfig::default(),
            timeout_secs: 600,
            retry_interval_secs: 30,
        }
    }
}

impl ProxyConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    #[must_use]
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    /// Whether the remote operation at `path` is mirrored.
    #[must_use]
    pub fn is_whitelisted(&self, path: &str) -> bool {
        self.white_list.is_empty()
            || self
                .white_list
                .iter()
                .any(|pattern| pattern_matches(pattern, path))
    }

    #[must_use]
    pub fn is_forced_stream(&self, path: &str) -> bool {
        self.force_stream_apis.iter().any(|p| p == path)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn defaults_mirror_everything() {
        let config = ProxyConfig::default();
        assert!(config.is_whitelisted("/api/v1/anything"));
        assert_eq!(config.timeout(), Duration::from_secs(600));
        assert_eq!(config.retry_interval(), Duration::from_secs(30));
    }

    #[test]
    fn white_list_accepts_exact_and_prefix_patterns() {
        let config: ProxyConfig = serde_json::from_value(json!({
            "proxy_urls": ["http://127.0.0.1:9000"],
            "white_list": ["/api/v1/mock/*", "/api/v1/info"],
            "force_stream_apis": ["/api/v1/mock/stream"],
        }))
        .unwrap();

        assert!(config.is_whitelisted("/api/v1/mock/get"));
        assert!(config.is_whitelisted("/api/v1/info"));
        assert!(!config.is_whitelisted("/api/v1/black_get"));
        assert!(config.is_forced_stream("/api/v1/mock/stream"));
        assert!(!config.is_forced_stream("/api/v1/mock/get"));
        assert_eq!(config.timeout_secs, 600);
    }
}
