//! Supported brokerages.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Identity of a supported brokerage. Used as the key for every piece of
/// per-broker state (credentials, sessions, locks, adapters).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum BrokerIdentity {
    /// Merrill Edge (Bank of America).
    MerrillEdge,
    /// J.P. Morgan Self-Directed Investing, through chase.com.
    Chase,
    /// E*TRADE from Morgan Stanley.
    #[serde(rename = "etrade")]
    ETrade,
}

impl BrokerIdentity {
    /// Every supported broker, in report order.
    pub const ALL: [BrokerIdentity; 3] = [
        BrokerIdentity::MerrillEdge,
        BrokerIdentity::Chase,
        BrokerIdentity::ETrade,
    ];

    /// Stable key used for persistence namespaces and CLI arguments.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MerrillEdge => "merrill_edge",
            Self::Chase => "chase",
            Self::ETrade => "etrade",
        }
    }

    /// Human readable name for reports.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::MerrillEdge => "Merrill Edge",
            Self::Chase => "Chase",
            Self::ETrade => "E*TRADE",
        }
    }
}

impl fmt::Display for BrokerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BrokerIdentity {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "merrill_edge" | "merrill" | "merrilledge" => Ok(Self::MerrillEdge),
            "chase" => Ok(Self::Chase),
            "etrade" | "e*trade" | "e_trade" => Ok(Self::ETrade),
            _ => Err(ModelError::UnknownBroker(s.to_string())),
        }
    }
}
