//! Process-wide index of operation descriptors.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use framex_core::OperationDescriptor;
use tracing::{debug, warn};

use super::{Plugin, PluginManager};

/// Descriptors partitioned by invocation surface.
#[derive(Debug, Default)]
struct ApiIndex {
    http: HashMap<String, OperationDescriptor>,
    functions: HashMap<String, OperationDescriptor>,
}

impl ApiIndex {
    fn build(plugins: &[Arc<Plugin>]) -> Self {
        let mut index = Self::default();
        for api in plugins
            .iter()
            .flat_map(|p| &p.deployments)
            .flat_map(|d| &d.operations)
        {
            if let (true, Some(path)) = (api.is_http(), &api.path) {
                if let Some(previous) = index.http.insert(path.clone(), api.clone()) {
                    warn!(
                        path = %path,
                        replaced = %previous.function_key(),
                        "http api declared twice, keeping the later one"
                    );
                }
            }
            if api.is_function() {
                index.functions.insert(api.function_key(), api.clone());
            }
        }
        debug!(
            http = index.http.len(),
            functions = index.functions.len(),
            "built api index"
        );
        index
    }
}

/// Lookup of operations by HTTP path or by `target.function` name.
///
/// The index is built from the loaded plugins on first access and never
/// rebuilt.
pub struct ApiRegistry {
    manager: Arc<PluginManager>,
    index: OnceLock<ApiIndex>,
}

impl ApiRegistry {
    #[must_use]
    pub fn new(manager: Arc<PluginManager>) -> Self {
        Self {
            manager,
            index: OnceLock::new(),
        }
    }

    fn index(&self) -> &ApiIndex {
        self.index
            .get_or_init(|| ApiIndex::build(&self.manager.loaded_plugins()))
    }

    /// Resolves `name`: names starting with `/` are HTTP paths, all others
    /// `target.function` names.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<OperationDescriptor> {
        let index = self.index();
        if name.starts_with('/') {
            index.http.get(name).cloned()
        } else {
            index.functions.get(name).cloned()
        }
    }

    /// Every HTTP-exposed operation, ordered by path.
    #[must_use]
    pub fn http_apis(&self) -> Vec<OperationDescriptor> {
        let mut apis: Vec<_> = self.index().http.values().cloned().collect();
        apis.sort_by(|a, b| a.path.cmp(&b.path));
        apis
    }

    /// Every function-exposed operation, ordered by name.
    #[must_use]
    pub fn function_apis(&self) -> Vec<OperationDescriptor> {
        let mut apis: Vec<_> = self.index().functions.values().cloned().collect();
        apis.sort_by_key(OperationDescriptor::function_key);
        apis
    }
}
