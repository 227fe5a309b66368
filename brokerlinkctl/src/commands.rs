use std::io::{self, BufRead};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use brokerlink_config::{Config, ConfigLoad, ConfigLoader};
use brokerlink_core::model::BrokerIdentity;
use brokerlink_core::persistence::load_or_create_salt;
use brokerlink_core::{
    Credential, CredentialVault, FileKeyValueStore, KeyMaterial, SecretBytes, SessionStore,
};
use chrono::{DateTime, Utc};
use dialoguer::Password;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::cli::{Cli, Command, ConfigAction, CredentialsAction, SessionsAction};

/// Resolved configuration plus the file store it points at.
struct Workspace {
    load: ConfigLoad,
    store: Arc<FileKeyValueStore>,
}

impl Workspace {
    fn open(cli: &Cli) -> Result<Self> {
        let mut loader = ConfigLoader::new();
        if let Some(path) = &cli.config {
            loader = loader.with_config_path(path);
        }
        if let Some(path) = &cli.env_file {
            loader = loader.with_env_file(path);
        }
        let load = loader.load().context("failed to load configuration")?;
        for warning in &load.warnings.items {
            match &warning.hint {
                Some(hint) => warn!(hint = %hint, "{}", warning.message),
                None => warn!("{}", warning.message),
            }
        }

        let store = Arc::new(FileKeyValueStore::new(load.config.data_dir.clone()));
        Ok(Self { load, store })
    }

    fn config(&self) -> &Config {
        &self.load.config
    }

    fn sessions(&self) -> SessionStore {
        SessionStore::new(self.store.clone())
    }

    /// Derive key material from the master secret. Argon2 runs on the
    /// blocking pool.
    async fn vault(&self) -> Result<CredentialVault> {
        let var = &self.config().master_secret_env;
        let secret = std::env::var(var)
            .ok()
            .filter(|value| !value.is_empty())
            .map(SecretBytes::from)
            .with_context(|| format!("master secret not set; export {var}"))?;

        let salt = load_or_create_salt(self.store.as_ref())
            .await
            .context("failed to load key-derivation salt")?;
        let settings = self.config().key_derivation;
        let keys = tokio::task::spawn_blocking(move || {
            KeyMaterial::derive(secret.expose(), &salt, &settings)
        })
        .await
        .context("key derivation task failed")??;

        Ok(CredentialVault::new(self.store.clone(), Arc::new(keys)))
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    let workspace = Workspace::open(&cli)?;
    match cli.command {
        Command::Credentials { action } => credentials(&workspace, action).await,
        Command::Sessions { action } => sessions(&workspace, action).await,
        Command::Config { action } => config(&workspace, action),
    }
}

async fn credentials(workspace: &Workspace, action: CredentialsAction) -> Result<()> {
    let vault = workspace.vault().await?;
    match action {
        CredentialsAction::Add {
            broker,
            username,
            password_stdin,
        } => {
            let broker = broker.broker;
            let password = if password_stdin {
                read_password_line(io::stdin().lock())?
            } else {
                Password::new()
                    .with_prompt(format!("{} password for {username}", broker.display_name()))
                    .interact()
                    .map(Zeroizing::new)
                    .context("failed to read password")?
            };
            if password.is_empty() {
                bail!("password must not be empty");
            }

            vault
                .put(&Credential::new(broker, username, password.as_str()))
                .await
                .with_context(|| format!("failed to store credential for {broker}"))?;
            info!(broker = %broker, "credential stored");
            println!("Stored credential for {}", broker.display_name());
        }
        CredentialsAction::List { json } => {
            let summaries = vault.list().await.context("failed to list credentials")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summaries)?);
            } else if summaries.is_empty() {
                println!("No credentials stored");
            } else {
                println!("{:<14} {:<28} UPDATED", "BROKER", "USERNAME");
                for summary in summaries {
                    println!(
                        "{:<14} {:<28} {}",
                        summary.broker.as_str(),
                        summary.username,
                        timestamp(summary.updated_at)
                    );
                }
            }
        }
        CredentialsAction::Revoke { broker } => {
            let broker = broker.broker;
            let removed = vault
                .revoke(broker)
                .await
                .with_context(|| format!("failed to revoke credential for {broker}"))?;
            // A session opened with the revoked login must not outlive it.
            let cleared = workspace
                .sessions()
                .remove(broker)
                .await
                .with_context(|| format!("failed to clear session for {broker}"))?;
            info!(broker = %broker, removed, cleared, "credential revoked");
            match (removed, cleared) {
                (false, false) => println!("Nothing stored for {}", broker.display_name()),
                (_, true) => println!(
                    "Revoked credential and cleared session for {}",
                    broker.display_name()
                ),
                (true, false) => println!("Revoked credential for {}", broker.display_name()),
            }
        }
    }
    Ok(())
}

async fn sessions(workspace: &Workspace, action: SessionsAction) -> Result<()> {
    let store = workspace.sessions();
    match action {
        SessionsAction::List { json } => {
            let records = store.list().await.context("failed to list sessions")?;
            if json {
                // Envelopes stay on disk; only metadata is printed.
                let rows: Vec<_> = records
                    .iter()
                    .map(|record| {
                        serde_json::json!({
                            "broker": record.broker,
                            "status": record.status,
                            "created_at": record.created_at,
                            "last_validated_at": record.last_validated_at,
                            "expires_at_hint": record.expires_at_hint,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if records.is_empty() {
                println!("No sessions stored");
            } else {
                let now = Utc::now();
                println!(
                    "{:<14} {:<8} {:<17} {:<17} EXPIRES",
                    "BROKER", "STATUS", "CREATED", "VALIDATED"
                );
                for record in records {
                    let expiry = match record.expires_at_hint {
                        Some(hint) if record.is_past_expiry_hint(now) => {
                            format!("{} (passed)", timestamp(hint))
                        }
                        Some(hint) => timestamp(hint),
                        None => "-".to_string(),
                    };
                    println!(
                        "{:<14} {:<8} {:<17} {:<17} {expiry}",
                        record.broker.as_str(),
                        record.status.as_str(),
                        timestamp(record.created_at),
                        timestamp(record.last_validated_at),
                    );
                }
            }
        }
        SessionsAction::Invalidate { broker } => {
            let broker = broker.broker;
            if store.invalidate(broker).await? {
                println!("Invalidated session for {}", broker.display_name());
            } else {
                println!("No session stored for {}", broker.display_name());
            }
        }
        SessionsAction::Clear { broker } => {
            let broker = broker.broker;
            if store.remove(broker).await? {
                println!("Cleared session for {}", broker.display_name());
            } else {
                println!("No session stored for {}", broker.display_name());
            }
        }
    }
    Ok(())
}

fn config(workspace: &Workspace, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(workspace.config())?);
                return Ok(());
            }
            println!("source = {}", workspace.load.source);
            for (key, value) in workspace.config().summary() {
                println!("{key} = {value}");
            }
            let brokers: Vec<_> = BrokerIdentity::ALL.iter().map(|b| b.as_str()).collect();
            println!("brokers = {}", brokers.join(", "));
        }
    }
    Ok(())
}

/// First line of `reader` without its line ending, trimmed in place.
fn read_password_line(mut reader: impl BufRead) -> Result<Zeroizing<String>> {
    let mut line = Zeroizing::new(String::with_capacity(256));
    reader
        .read_line(&mut line)
        .context("failed to read password from stdin")?;
    let len = line.trim_end_matches(['\r', '\n']).len();
    line.truncate(len);
    Ok(line)
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M").to_string()
}
