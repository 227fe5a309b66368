//! Key-value persistence capability backing the vault and the session store.
//!
//! Keys live in a small set of namespaces (`credentials/<broker>`,
//! `sessions/<broker>`, `keys/salt`). Values are opaque bytes; callers store
//! JSON documents and seal anything secret before it reaches this layer.

mod file;
mod memory;

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use brokerlink_model::BrokerIdentity;
use thiserror::Error;
use tracing::info;

use crate::crypto::{SALT_LEN, generate_salt};

pub use file::FileKeyValueStore;
pub use memory::MemoryKeyValueStore;

/// Top-level grouping of stored keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Namespace {
    /// Sealed broker credentials.
    Credentials,
    /// Session records.
    Sessions,
    /// Key-derivation material.
    Keys,
}

impl Namespace {
    /// Directory name on disk.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Credentials => "credentials",
            Self::Sessions => "sessions",
            Self::Keys => "keys",
        }
    }
}

/// Location of one stored value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorageKey {
    /// Namespace the key lives in.
    pub namespace: Namespace,
    /// Name within the namespace. See [`StorageKey::is_valid_name`].
    pub name: String,
}

impl StorageKey {
    /// Key for `name` in `namespace`. Not validated until it reaches a store.
    pub fn new(namespace: Namespace, name: impl Into<String>) -> Self {
        Self {
            namespace,
            name: name.into(),
        }
    }

    /// `credentials/<broker>`.
    pub fn credential(broker: BrokerIdentity) -> Self {
        Self::new(Namespace::Credentials, broker.as_str())
    }

    /// `sessions/<broker>`.
    pub fn session(broker: BrokerIdentity) -> Self {
        Self::new(Namespace::Sessions, broker.as_str())
    }

    /// `keys/salt`.
    pub fn salt() -> Self {
        Self::new(Namespace::Keys, "salt")
    }

    /// Names are restricted so a key can never escape its namespace on disk.
    pub fn is_valid_name(name: &str) -> bool {
        !name.is_empty()
            && name.len() <= 64
            && name
                .bytes()
                .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-'))
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace.as_str(), self.name)
    }
}

/// Storage backend failures.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// The key name is not allowed.
    #[error("invalid storage key {0}")]
    InvalidKey(String),
    /// Filesystem error.
    #[error("i/o error on {path:?}: {source}")]
    Io {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The backend refused the operation.
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    /// A stored value is unusable.
    #[error("stored value at {key} is corrupt: {reason}")]
    Corrupt {
        /// Storage key of the value.
        key: String,
        /// What is wrong with it.
        reason: String,
    },
}

impl PersistenceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Byte-oriented key-value storage. `put` must replace a value atomically:
/// readers observe either the previous value or the new one, never a mix.
#[async_trait]
pub trait KeyValueStore: Send + Sync + fmt::Debug {
    /// Value at `key`, or `None` if nothing is stored.
    async fn get(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, PersistenceError>;

    /// Store `value` at `key`, replacing any previous value.
    async fn put(&self, key: &StorageKey, value: &[u8]) -> Result<(), PersistenceError>;

    /// Returns whether a value was present.
    async fn delete(&self, key: &StorageKey) -> Result<bool, PersistenceError>;

    /// Names stored under `namespace`, sorted.
    async fn list(&self, namespace: Namespace) -> Result<Vec<String>, PersistenceError>;
}

/// Load the key-derivation salt, generating and persisting one on first use.
pub async fn load_or_create_salt(
    store: &dyn KeyValueStore,
) -> Result<Vec<u8>, PersistenceError> {
    let key = StorageKey::salt();
    if let Some(salt) = store.get(&key).await? {
        if salt.len() < SALT_LEN {
            return Err(PersistenceError::Corrupt {
                key: key.to_string(),
                reason: format!("salt is {} bytes, expected {SALT_LEN}", salt.len()),
            });
        }
        return Ok(salt);
    }

    let salt = generate_salt().to_vec();
    store.put(&key, &salt).await?;
    info!("generated new key-derivation salt");
    Ok(salt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_keys_render_as_paths() {
        assert_eq!(
            StorageKey::credential(BrokerIdentity::MerrillEdge).to_string(),
            "credentials/merrill_edge"
        );
        assert_eq!(StorageKey::session(BrokerIdentity::ETrade).to_string(), "sessions/etrade");
        assert_eq!(StorageKey::salt().to_string(), "keys/salt");
    }

    #[test]
    fn rejects_path_like_names() {
        assert!(StorageKey::is_valid_name("chase"));
        assert!(!StorageKey::is_valid_name("../chase"));
        assert!(!StorageKey::is_valid_name("a/b"));
        assert!(!StorageKey::is_valid_name(""));
        assert!(!StorageKey::is_valid_name(".tmp-123"));
    }

    #[tokio::test]
    async fn salt_is_created_once() {
        let store = MemoryKeyValueStore::new();
        let first = load_or_create_salt(&store).await.unwrap();
        let second = load_or_create_salt(&store).await.unwrap();

        assert_eq!(first.len(), SALT_LEN);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn truncated_salt_is_reported_as_corrupt() {
        let store = MemoryKeyValueStore::new();
        store.put(&StorageKey::salt(), b"short").await.unwrap();

        assert!(matches!(
            load_or_create_salt(&store).await,
            Err(PersistenceError::Corrupt { .. })
        ));
    }
}
