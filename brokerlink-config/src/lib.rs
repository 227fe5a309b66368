//! Configuration for brokerlink: where state lives, which environment
//! variable carries the master secret, and the orchestrator policy.

pub mod loader;
pub mod models;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions, EnvConfig};
pub use models::{Config, ConfigSource};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
