//! Compiled-in plugin modules, addressed by dotted module identifiers.

use std::collections::BTreeMap;
use std::fmt;

use framex_core::PluginMetadata;
use tracing::warn;

use super::PluginScope;
use crate::error::ConfigError;

/// Package the built-in plugins live under.
pub const BUILTIN_PACKAGE: &str = "framex.plugins";

/// Registration function of a module: declares the plugin's deployments.
pub type RegisterFn = fn(&mut PluginScope<'_>) -> anyhow::Result<()>;

/// A loadable plugin module.
#[derive(Clone, Copy)]
pub struct PluginModule {
    /// Dotted identifier, e.g. `framex.plugins.echo`.
    pub module_name: &'static str,
    pub metadata: fn() -> PluginMetadata,
    pub register: RegisterFn,
}

impl PluginModule {
    /// The plugin identifier: the last segment of the module name.
    #[must_use]
    pub fn plugin_id(&self) -> &'static str {
        self.module_name
            .rsplit('.')
            .next()
            .unwrap_or(self.module_name)
    }
}

impl fmt::Debug for PluginModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginModule")
            .field("module_name", &self.module_name)
            .finish_non_exhaustive()
    }
}

/// Index of every module the host can load.
#[derive(Debug, Clone, Default)]
pub struct ModuleCatalog {
    modules: BTreeMap<&'static str, PluginModule>,
}

impl ModuleCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A catalog holding the built-in plugins.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut catalog = Self::new();
        for module in crate::plugins::builtin_modules() {
            catalog.add(module);
        }
        catalog
    }

    /// Adds a module; a later module with the same name replaces the earlier.
    pub fn add(&mut self, module: PluginModule) {
        self.modules.insert(module.module_name, module);
    }

    #[must_use]
    pub fn get(&self, module_name: &str) -> Option<PluginModule> {
        self.modules.get(module_name).copied()
    }

    /// Names of every known module.
    #[must_use]
    pub fn module_names(&self) -> Vec<&'static str> {
        self.modules.keys().copied().collect()
    }

    /// Modules directly below `package`, skipping private (`_`-prefixed) ones.
    #[must_use]
    pub fn children(&self, package: &str) -> Vec<PluginModule> {
        let prefix = format!("{package}.");
        self.modules
            .values()
            .filter(|m| {
                m.module_name
                    .strip_prefix(&prefix)
                    .is_some_and(|rest| !rest.contains('.') && !rest.starts_with('_'))
            })
            .copied()
            .collect()
    }

    /// Resolves a search path or module identifier to the modules it names.
    ///
    /// Identifiers containing `/`, or ending in `.plugins`, denote a package
    /// whose direct children are enumerated; anything else names one module.
    ///
    /// # Errors
    ///
    /// [`ConfigError::PluginNotFound`] for an unknown module identifier.
    pub fn resolve(&self, identifier: &str) -> Result<Vec<PluginModule>, ConfigError> {
        if identifier.contains('/') || identifier.ends_with(".plugins") {
            let package = identifier.trim_matches('/').replace('/', ".");
            let modules = self.children(&package);
            if modules.is_empty() {
                warn!(package = %package, "no plugins found in package");
            }
            return Ok(modules);
        }
        self.get(identifier)
            .map(|module| vec![module])
            .ok_or_else(|| ConfigError::PluginNotFound {
                name: identifier.to_string(),
            })
    }
}

/// Module identifier of the built-in plugin `name`.
#[must_use]
pub fn builtin_module_name(name: &str) -> String {
    format!("{BUILTIN_PACKAGE}.{name}")
}
