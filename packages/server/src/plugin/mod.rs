//! Plugin registry.
//!
//! Loading a plugin is explicit and two-phase: the [`PluginManager`] builds
//! the [`Plugin`] record, then runs the module's registration function with a
//! [`PluginScope`] over that record. Registration declares deployment types
//! (see [`PluginService`]) whose operation tables become descriptors. The
//! [`ApiRegistry`] indexes those descriptors once every plugin is loaded.

pub mod api;
pub mod catalog;
pub mod declare;
pub mod manager;
pub mod remote;

use framex_core::{OperationDescriptor, PluginMetadata};
use serde_json::Value;

use crate::adapter::Deployable;

pub use api::ApiRegistry;
pub use catalog::{ModuleCatalog, PluginModule};
pub use declare::{parse_args, Operation, PluginScope, PluginService, ServiceUnit};
pub use manager::PluginManager;
pub use remote::{DeploymentInit, FunctionCatalog, ProxyFn, RemoteApis};

/// One instantiable unit of a plugin.
#[derive(Debug, Clone)]
pub struct Deployment {
    /// Stable deployment name, `plugin.Type`.
    pub target: String,
    pub operations: Vec<OperationDescriptor>,
    pub deployable: Deployable,
}

/// A loaded plugin.
#[derive(Debug, Clone)]
pub struct Plugin {
    /// Unique identifier: the last segment of the module name.
    pub id: String,
    pub module_name: String,
    pub metadata: PluginMetadata,
    /// Configuration table from the host settings, `Null` when absent.
    pub config: Value,
    pub deployments: Vec<Deployment>,
}

impl Plugin {
    #[must_use]
    pub fn version(&self) -> &str {
        if self.metadata.version.is_empty() {
            "unknown"
        } else {
            &self.metadata.version
        }
    }

    #[must_use]
    pub fn required_remote_apis(&self) -> &[String] {
        &self.metadata.required_remote_apis
    }
}
