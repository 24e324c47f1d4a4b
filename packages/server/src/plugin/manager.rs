use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use framex_core::consts::PROXY_PLUGIN_ID;
use parking_lot::RwLock;
use tracing::{error, info};

use super::catalog::{builtin_module_name, BUILTIN_PACKAGE};
use super::{ModuleCatalog, Plugin, PluginModule, PluginScope};
use crate::adapter::SharedAdapter;
use crate::config::Settings;
use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// PluginManager
// ---------------------------------------------------------------------------

/// Registry of loaded plugins.
///
/// Each module is loaded at most once; plugins are kept in load order. A
/// module whose registration fails leaves no trace in the registry.
pub struct PluginManager {
    catalog: ModuleCatalog,
    settings: Arc<Settings>,
    adapter: SharedAdapter,
    plugins: DashMap<String, Arc<Plugin>>,
    load_order: RwLock<Vec<String>>,
}

impl PluginManager {
    #[must_use]
    pub fn new(catalog: ModuleCatalog, settings: Arc<Settings>, adapter: SharedAdapter) -> Self {
        Self {
            catalog,
            settings,
            adapter,
            plugins: DashMap::new(),
            load_order: RwLock::new(Vec::new()),
        }
    }

    /// Loads one module.
    ///
    /// Returns the already-loaded plugin when the module was loaded before,
    /// and `None` when its registration failed.
    ///
    /// # Errors
    ///
    /// [`ConfigError::DuplicatePlugin`] when a different module already
    /// claimed the plugin identifier.
    pub fn load_plugin(&self, module: &PluginModule) -> Result<Option<Arc<Plugin>>, ConfigError> {
        let id = module.plugin_id();
        if let Some(existing) = self.plugins.get(id) {
            if existing.module_name == module.module_name {
                return Ok(Some(Arc::clone(existing.value())));
            }
            return Err(ConfigError::DuplicatePlugin { id: id.to_string() });
        }

        let metadata = (module.metadata)();
        let mut plugin = Plugin {
            id: id.to_string(),
            module_name: module.module_name.to_string(),
            config: self.settings.plugin_config(id, &metadata.name),
            metadata,
            deployments: Vec::new(),
        };
        let mut scope = PluginScope::new(&mut plugin, self.adapter.as_ref());
        if let Err(err) = (module.register)(&mut scope) {
            error!(plugin = id, error = %format!("{err:#}"), "failed to load plugin");
            return Ok(None);
        }

        let plugin = Arc::new(plugin);
        self.plugins.insert(id.to_string(), Arc::clone(&plugin));
        self.load_order.write().push(id.to_string());
        info!(
            plugin = id,
            version = %plugin.version(),
            deployments = plugin.deployments.len(),
            "loaded plugin"
        );
        Ok(Some(plugin))
    }

    /// Loads every module named by `identifiers` (module ids or packages).
    ///
    /// # Errors
    ///
    /// Unknown module identifiers and duplicate plugin identifiers.
    pub fn load_plugins<S: AsRef<str>>(
        &self,
        identifiers: &[S],
    ) -> Result<Vec<Arc<Plugin>>, ConfigError> {
        let mut loaded = Vec::new();
        for identifier in identifiers {
            for module in self.catalog.resolve(identifier.as_ref())? {
                if let Some(plugin) = self.load_plugin(&module)? {
                    loaded.push(plugin);
                }
            }
        }
        Ok(loaded)
    }

    /// Loads built-in plugins by short name.
    ///
    /// # Errors
    ///
    /// As [`PluginManager::load_plugins`].
    pub fn load_builtin_plugins<S: AsRef<str>>(
        &self,
        names: &[S],
    ) -> Result<Vec<Arc<Plugin>>, ConfigError> {
        let modules: Vec<String> = names
            .iter()
            .map(|n| builtin_module_name(n.as_ref()))
            .collect();
        self.load_plugins(&modules)
    }

    /// Loads the requested built-in and external plugins in one batch.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ProxyPluginMissing`] when `enable_proxy` is set but the
    /// proxy plugin is neither loaded nor requested, by built-in name or
    /// through an external identifier; otherwise as
    /// [`PluginManager::load_plugins`].
    pub fn auto_load<S: AsRef<str>>(
        &self,
        builtin: &[S],
        external: &[S],
        enable_proxy: bool,
    ) -> Result<Vec<Arc<Plugin>>, ConfigError> {
        let builtin_prefix = format!("{BUILTIN_PACKAGE}.");
        let loaded_builtin: HashSet<String> = self
            .plugins
            .iter()
            .filter(|p| p.module_name.starts_with(&builtin_prefix))
            .map(|p| p.id.clone())
            .collect();

        let mut candidates: Vec<&str> = Vec::new();
        for name in builtin.iter().map(AsRef::as_ref) {
            if !loaded_builtin.contains(name) && !candidates.contains(&name) {
                candidates.push(name);
            }
        }
        let mut external_modules: Vec<PluginModule> = Vec::new();
        for identifier in external {
            external_modules.extend(self.catalog.resolve(identifier.as_ref())?);
        }
        let proxy_requested = self.plugins.contains_key(PROXY_PLUGIN_ID)
            || candidates.contains(&PROXY_PLUGIN_ID)
            || external_modules
                .iter()
                .any(|module| module.plugin_id() == PROXY_PLUGIN_ID);
        if enable_proxy && !proxy_requested {
            return Err(ConfigError::ProxyPluginMissing);
        }

        let mut loaded = self.load_builtin_plugins(&candidates)?;
        for module in &external_modules {
            if let Some(plugin) = self.load_plugin(module)? {
                loaded.push(plugin);
            }
        }
        Ok(loaded)
    }

    #[must_use]
    pub fn get_plugin(&self, id: &str) -> Option<Arc<Plugin>> {
        self.plugins.get(id).map(|p| Arc::clone(p.value()))
    }

    /// Loaded plugins in load order.
    #[must_use]
    pub fn loaded_plugins(&self) -> Vec<Arc<Plugin>> {
        self.load_order
            .read()
            .iter()
            .filter_map(|id| self.get_plugin(id))
            .collect()
    }

    /// Every module the catalog can load.
    #[must_use]
    pub fn available_plugins(&self) -> Vec<&'static str> {
        self.catalog.module_names()
    }

    #[must_use]
    pub fn adapter(&self) -> &SharedAdapter {
        &self.adapter
    }

    #[must_use]
    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }
}
