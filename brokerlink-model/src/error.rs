//! Errors raised while parsing model values.

use std::fmt::{self, Display};

/// Errors produced by model constructors and parsing routines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// A broker key that names no supported broker.
    UnknownBroker(String),
    /// A session status string that is not one of the known statuses.
    InvalidStatus(String),
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::UnknownBroker(raw) => {
                write!(f, "unknown broker '{raw}' (expected merrill_edge, chase or etrade)")
            }
            ModelError::InvalidStatus(raw) => write!(f, "invalid session status '{raw}'"),
        }
    }
}

impl std::error::Error for ModelError {}

/// Result alias for model parsing.
pub type Result<T> = std::result::Result<T, ModelError>;
