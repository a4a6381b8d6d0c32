//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the core runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Shared primitives for the ems-link workspace.
//! This crate exposes client configuration loading and the tracing
//! bootstrap consumed by the CLI and long-running embeddings.

pub mod config;
pub mod logging;

pub use config::{
    ClientConfig, ConnectionMode, EndpointConfig, LoadedClientConfig, LoggingConfig,
    ReconnectConfig, SubscriptionConfig, TimeoutConfig,
};
pub use logging::{init_tracing, LogFormat};
