//! Errors raised while locating, reading or validating configuration.

use std::path::PathBuf;

use thiserror::Error;

use crate::validation::ConfigGuardRailError;

/// Why configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    /// An explicitly named file is absent.
    #[error("config file {path} does not exist")]
    MissingConfig {
        /// Path that was asked for.
        path: PathBuf,
    },
    /// The file exists but could not be read.
    #[error("failed to read config file {path}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Neither TOML nor JSON accepted the contents.
    #[error("failed to parse config {origin}: {reason}")]
    Parse {
        /// File path or variable the text came from.
        origin: String,
        /// Parser message.
        reason: String,
    },
    /// An override variable holds an unusable value.
    #[error("invalid value for {var}: {reason}")]
    InvalidEnv {
        /// Offending variable.
        var: &'static str,
        /// Why the value was refused.
        reason: String,
    },
    /// The parsed settings fail a guard rail.
    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
    /// The `.env` file is malformed.
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}
