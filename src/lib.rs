//! # Toolrelay Core - Plugin Sessions & Resilient Tool Invocation
//!
//! Rust implementation of the tool relay providing:
//! - Per-(user, plugin) session registry with LRU capacity and idle expiry
//! - Health tracking from sliding error rates (Active / Degraded / Error)
//! - Background idle and health sweeps with cooperative shutdown
//! - Tool listing with a short-TTL cache and plugin-qualified names
//! - Batched tool execution with bounded concurrency, timeouts and retry
//!
//! ## Architecture
//!
//! ```text
//!                    ┌─────────────────────────────────┐
//!   callers      →   │       InvocationService         │
//!                    │  ┌─────────┐ ┌─────────┐        │
//!                    │  │  Tool   │ │  Call   │        │
//!                    │  │  Cache  │ │ Metrics │        │
//!                    │  └─────────┘ └─────────┘        │
//!                    └───────────────┬─────────────────┘
//!                                    │
//!                    ┌───────────────▼─────────────────┐
//!                    │        SessionRegistry          │
//!                    │  sessions · user locks · sweeps │
//!                    └───────────────┬─────────────────┘
//!                                    │ TransportClient
//!                               plugin servers
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

// Re-export public API
pub mod invocation;
pub mod registry;
pub mod transport;
pub mod types;

// Internal utilities
pub mod observability;

#[cfg(test)]
mod testing;

pub use invocation::{InvocationService, ToolCallOutcome, ToolCallRequest};
pub use registry::{SessionHandle, SessionInfo, SessionRegistry, SessionStatus};
pub use transport::{ToolDefinition, TransportClient, TransportFactory};
pub use types::{Config, Error, ErrorKind, PluginConfig, Result, SessionKey};
