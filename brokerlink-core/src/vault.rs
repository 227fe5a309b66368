//! Credential vault: per-broker login secrets, sealed at rest.

use std::fmt;
use std::sync::Arc;

use brokerlink_model::BrokerIdentity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::{CryptoError, KeyMaterial, KeyPurpose};
use crate::persistence::{KeyValueStore, Namespace, PersistenceError, StorageKey};
use brokerlink_model::SealedBlob;

/// Secret bytes that are wiped on drop and never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop, PartialEq, Eq)]
pub struct SecretBytes {
    data: Vec<u8>,
}

impl SecretBytes {
    /// Take ownership of `data` without copying it.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }

    /// Borrow the raw secret. Keep the borrow as short as possible.
    pub fn expose(&self) -> &[u8] {
        &self.data
    }

    /// The secret as text, for form fields.
    pub fn expose_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// No bytes at all.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<&str> for SecretBytes {
    fn from(value: &str) -> Self {
        Self::new(value.as_bytes())
    }
}

impl From<String> for SecretBytes {
    fn from(value: String) -> Self {
        Self::new(value.into_bytes())
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretBytes")
            .field("len", &self.len())
            .field("data", &"[REDACTED]")
            .finish()
    }
}

impl fmt::Display for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[secret: {} bytes]", self.len())
    }
}

/// Login secret for one broker.
#[derive(Clone)]
pub struct Credential {
    /// Broker the login is for.
    pub broker: BrokerIdentity,
    /// Login name as typed into the broker form.
    pub username: String,
    /// Password.
    pub secret: SecretBytes,
    /// When the credential was last stored.
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    /// Credential stamped with the current time.
    pub fn new(
        broker: BrokerIdentity,
        username: impl Into<String>,
        secret: impl Into<SecretBytes>,
    ) -> Self {
        Self {
            broker,
            username: username.into(),
            secret: secret.into(),
            updated_at: Utc::now(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("broker", &self.broker)
            .field("username", &self.username)
            .field("secret", &self.secret)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// What `list` reports; never carries the secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialSummary {
    /// Broker the login is for.
    pub broker: BrokerIdentity,
    /// Login name.
    pub username: String,
    /// When the credential was last stored.
    pub updated_at: DateTime<Utc>,
}

/// Sealed payload. The whole entry is encrypted, username included.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct CredentialPayload {
    username: String,
    secret: Vec<u8>,
    #[zeroize(skip)]
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredCredential {
    broker: BrokerIdentity,
    sealed: SealedBlob,
}

/// Credential vault failures.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Nothing stored for the broker.
    #[error("no credential configured for {0}")]
    NotConfigured(BrokerIdentity),
    /// The entry exists but cannot be decoded.
    #[error("credential entry for {broker} is corrupt: {reason}")]
    Corrupt {
        /// Broker whose entry is unusable.
        broker: BrokerIdentity,
        /// What is wrong with it.
        reason: String,
    },
    /// Sealing or opening failed, usually a wrong master secret.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    /// The backend failed.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Encrypted-at-rest store of per-broker credentials.
pub struct CredentialVault {
    store: Arc<dyn KeyValueStore>,
    keys: Arc<KeyMaterial>,
}

impl fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialVault")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl CredentialVault {
    /// Vault over `store`, sealing with the vault subkey of `keys`.
    pub fn new(store: Arc<dyn KeyValueStore>, keys: Arc<KeyMaterial>) -> Self {
        Self { store, keys }
    }

    /// Fetch and decrypt the credential for `broker`.
    pub async fn get(&self, broker: BrokerIdentity) -> Result<Credential, VaultError> {
        let bytes = self
            .store
            .get(&StorageKey::credential(broker))
            .await?
            .ok_or(VaultError::NotConfigured(broker))?;

        let credential = self.decode(broker, &bytes)?;
        debug!(broker = %broker, "credential loaded from vault");
        Ok(credential)
    }

    /// Create or replace the credential for `credential.broker`.
    pub async fn put(&self, credential: &Credential) -> Result<(), VaultError> {
        let broker = credential.broker;
        let payload = CredentialPayload {
            username: credential.username.clone(),
            secret: credential.secret.expose().to_vec(),
            updated_at: credential.updated_at,
        };
        let sealed = self
            .keys
            .seal_json(KeyPurpose::Vault, broker.as_str(), &payload)?;

        let stored = StoredCredential { broker, sealed };
        let bytes = serde_json::to_vec_pretty(&stored).map_err(|err| VaultError::Corrupt {
            broker,
            reason: err.to_string(),
        })?;
        self.store.put(&StorageKey::credential(broker), &bytes).await?;

        info!(broker = %broker, username = %credential.username, "credential stored");
        Ok(())
    }

    /// Remove the credential. Returns whether one existed.
    pub async fn revoke(&self, broker: BrokerIdentity) -> Result<bool, VaultError> {
        let removed = self.store.delete(&StorageKey::credential(broker)).await?;
        if removed {
            info!(broker = %broker, "credential revoked");
        }
        Ok(removed)
    }

    /// Configured brokers with their usernames. Entries that fail to decrypt
    /// are skipped with a warning.
    pub async fn list(&self) -> Result<Vec<CredentialSummary>, VaultError> {
        let mut summaries = Vec::new();
        for name in self.store.list(Namespace::Credentials).await? {
            let Ok(broker) = name.parse::<BrokerIdentity>() else {
                warn!(entry = %name, "ignoring credential entry for unknown broker");
                continue;
            };
            match self.get(broker).await {
                Ok(credential) => summaries.push(CredentialSummary {
                    broker,
                    username: credential.username.clone(),
                    updated_at: credential.updated_at,
                }),
                Err(VaultError::NotConfigured(_)) => {}
                Err(err) => {
                    warn!(broker = %broker, error = %err, "unreadable credential entry");
                }
            }
        }
        Ok(summaries)
    }

    fn decode(&self, broker: BrokerIdentity, bytes: &[u8]) -> Result<Credential, VaultError> {
        let stored: StoredCredential =
            serde_json::from_slice(bytes).map_err(|err| VaultError::Corrupt {
                broker,
                reason: err.to_string(),
            })?;
        if stored.broker != broker {
            return Err(VaultError::Corrupt {
                broker,
                reason: format!("entry belongs to {}", stored.broker),
            });
        }

        let plaintext: Zeroizing<Vec<u8>> =
            self.keys
                .open(KeyPurpose::Vault, broker.as_str(), &stored.sealed)?;
        let payload: CredentialPayload =
            serde_json::from_slice(&plaintext).map_err(|err| VaultError::Corrupt {
                broker,
                reason: err.to_string(),
            })?;

        Ok(Credential {
            broker,
            username: payload.username.clone(),
            secret: SecretBytes::new(payload.secret.as_slice()),
            updated_at: payload.updated_at,
        })
    }
}
