//! Built-in plugins, compiled into the host and addressed under
//! `framex.plugins`.
//!
//! - [`echo`]: repeats what it is told; the reference HTTP, model and
//!   streaming operations.
//! - [`invoker`]: calls other plugins' operations through remote APIs.
//! - [`proxy`]: the reverse-proxy gateway.

pub mod echo;
pub mod invoker;
pub mod proxy;

use crate::plugin::PluginModule;

/// Every built-in module, ready to be added to a catalog.
#[must_use]
pub fn builtin_modules() -> Vec<PluginModule> {
    vec![echo::MODULE, invoker::MODULE, proxy::MODULE]
}
