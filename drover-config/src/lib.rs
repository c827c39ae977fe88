//! Shared configuration loading for drover binaries.
//!
//! Resolves a [`DroverConfig`](drover_core::DroverConfig) from files, inline
//! JSON and the environment, and installs the tracing subscriber every
//! binary uses.

pub mod error;
pub mod loader;
pub mod telemetry;

pub use error::ConfigLoadError;
pub use loader::{ConfigLoad, ConfigLoader, ConfigLoaderOptions, ConfigSource, EnvConfig};
pub use telemetry::init_tracing;
