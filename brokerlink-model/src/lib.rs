//! Core data model definitions shared across brokerlink crates.

pub mod broker;
pub mod challenge;
pub mod error;
pub mod portfolio;
pub mod session;

pub use broker::BrokerIdentity;
pub use challenge::{ChallengeKind, TwoFactorChallenge};
pub use error::{ModelError, Result as ModelResult};
pub use portfolio::{Holding, Portfolio, PortfolioSnapshot};
pub use session::{SealedBlob, SessionRecord, SessionStatus};
