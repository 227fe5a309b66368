use std::path::PathBuf;

use brokerlink_core::model::BrokerIdentity;
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "brokerlinkctl",
    version,
    about = "Manage brokerlink credentials, stored sessions and configuration"
)]
pub struct Cli {
    /// Config file (TOML or JSON). Overrides BROKERLINK_CONFIG_PATH.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Env file loaded before the configuration is resolved.
    #[arg(long, global = true)]
    pub env_file: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Store, list or revoke broker credentials
    Credentials {
        #[command(subcommand)]
        action: CredentialsAction,
    },
    /// Inspect and reset persisted browser sessions
    Sessions {
        #[command(subcommand)]
        action: SessionsAction,
    },
    /// Show the effective configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Args)]
pub struct BrokerArg {
    /// merrill_edge, chase or etrade
    #[arg(long, short)]
    pub broker: BrokerIdentity,
}

#[derive(Debug, Subcommand)]
pub enum CredentialsAction {
    /// Encrypt and store the login for a broker, replacing any existing one
    Add {
        #[command(flatten)]
        broker: BrokerArg,
        #[arg(long, short)]
        username: String,
        /// Read the password from the first line of stdin instead of prompting
        #[arg(long)]
        password_stdin: bool,
    },
    /// List configured brokers and usernames (never passwords)
    List {
        #[arg(long)]
        json: bool,
    },
    /// Delete the stored login and any saved session for a broker
    Revoke {
        #[command(flatten)]
        broker: BrokerArg,
    },
}

#[derive(Debug, Subcommand)]
pub enum SessionsAction {
    /// Show status, age and expiry hint of stored sessions
    List {
        #[arg(long)]
        json: bool,
    },
    /// Mark a stored session invalid so the next run logs in again
    Invalidate {
        #[command(flatten)]
        broker: BrokerArg,
    },
    /// Delete a stored session
    Clear {
        #[command(flatten)]
        broker: BrokerArg,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Print the resolved policy and where it came from
    Show {
        #[arg(long)]
        json: bool,
    },
}
