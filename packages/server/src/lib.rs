//! `FrameX` server: a plugin host that exposes plugin operations over HTTP,
//! runs them in-process or as distributed workers, and forwards to remote
//! hosts through a reverse-proxy gateway.

pub mod adapter;
pub mod config;
pub mod error;
pub mod logging;
pub mod network;
pub mod plugin;
pub mod plugins;
pub mod runtime;
pub mod service;

pub use config::Settings;
pub use error::{ConfigError, InvokeError, RouteError};
pub use runtime::{bootstrap, run, RuntimeContext};
