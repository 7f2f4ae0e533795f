//! Core types shared across the crate.
//!
//! - **Keys**: `SessionKey` identifying a (user, plugin) session
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Registry, invocation, observability and plugin configuration

mod config;
mod errors;
mod ids;

pub use config::{
    Config, InvocationConfig, ObservabilityConfig, PluginConfig, RegistryConfig, TransportKind,
    QUALIFIED_NAME_SEPARATOR,
};
pub use errors::{Error, ErrorKind, Result};
pub use ids::SessionKey;
