//! Conduit - host application for the batched call bridge
//!
//! This crate wires the bridge core to a runnable host:
//! - `config`: `conduit.toml` loading
//! - `loader`: bundle loading from disk
//! - `interceptor`: pattern-based call vetoes
//! - `builtin`: the native modules every host registers
//! - `host`: assembly of a configured bridge

// Re-export core crates
pub use conduit_bridge;
pub use conduit_js_runtime;

pub mod builtin;
pub mod config;
pub mod host;
pub mod interceptor;
pub mod loader;

pub use config::{BridgeConfig, ConfigError};
pub use host::Host;
