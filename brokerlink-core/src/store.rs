//! Session store: one `SessionRecord` per broker.
//!
//! The store only ever handles sealed blobs. Sealing and opening happen in
//! the orchestrator, which owns the key material.

use std::fmt;
use std::sync::Arc;

use brokerlink_model::{BrokerIdentity, SessionRecord, SessionStatus};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use crate::persistence::{KeyValueStore, Namespace, PersistenceError, StorageKey};

/// Session store failures.
#[derive(Debug, Error)]
pub enum SessionStoreError {
    /// The stored record is not valid JSON for a [`SessionRecord`].
    #[error("session record for {broker} is corrupt: {source}")]
    Corrupt {
        /// Broker the record belongs to.
        broker: BrokerIdentity,
        /// Serde error.
        #[source]
        source: serde_json::Error,
    },
    /// The record could not be serialized.
    #[error("failed to encode session record for {broker}: {source}")]
    Encode {
        /// Broker the record belongs to.
        broker: BrokerIdentity,
        /// Serde error.
        #[source]
        source: serde_json::Error,
    },
    /// The backend failed.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Typed access to the session records in a [`KeyValueStore`].
pub struct SessionStore {
    store: Arc<dyn KeyValueStore>,
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("store", &self.store)
            .finish()
    }
}

impl SessionStore {
    /// Store over `store`.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Record for `broker`, if one is stored.
    pub async fn get(
        &self,
        broker: BrokerIdentity,
    ) -> Result<Option<SessionRecord>, SessionStoreError> {
        let Some(bytes) = self.store.get(&StorageKey::session(broker)).await? else {
            return Ok(None);
        };
        let record = serde_json::from_slice(&bytes)
            .map_err(|source| SessionStoreError::Corrupt { broker, source })?;
        Ok(Some(record))
    }

    /// Replace the record for `record.broker` in one atomic write.
    pub async fn put(&self, record: &SessionRecord) -> Result<(), SessionStoreError> {
        let broker = record.broker;
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|source| SessionStoreError::Encode { broker, source })?;
        self.store.put(&StorageKey::session(broker), &bytes).await?;
        debug!(broker = %broker, status = %record.status, "session record written");
        Ok(())
    }

    /// Mark the record `Invalid` without deleting it. Returns whether a
    /// record existed.
    pub async fn invalidate(&self, broker: BrokerIdentity) -> Result<bool, SessionStoreError> {
        self.set_status(broker, SessionStatus::Invalid).await
    }

    /// Mark the record `Expired`. Returns whether a record existed.
    pub async fn mark_expired(&self, broker: BrokerIdentity) -> Result<bool, SessionStoreError> {
        self.set_status(broker, SessionStatus::Expired).await
    }

    /// Refresh `last_validated_at` after a successful probe.
    pub async fn touch(
        &self,
        broker: BrokerIdentity,
        at: DateTime<Utc>,
    ) -> Result<bool, SessionStoreError> {
        let Some(mut record) = self.get(broker).await? else {
            return Ok(false);
        };
        record.last_validated_at = at;
        record.status = SessionStatus::Valid;
        self.put(&record).await?;
        Ok(true)
    }

    /// Delete the record entirely. Returns whether one existed.
    pub async fn remove(&self, broker: BrokerIdentity) -> Result<bool, SessionStoreError> {
        Ok(self.store.delete(&StorageKey::session(broker)).await?)
    }

    /// Every readable record, ordered by broker key.
    pub async fn list(&self) -> Result<Vec<SessionRecord>, SessionStoreError> {
        let mut records = Vec::new();
        for name in self.store.list(Namespace::Sessions).await? {
            let Ok(broker) = name.parse::<BrokerIdentity>() else {
                warn!(entry = %name, "ignoring session entry for unknown broker");
                continue;
            };
            match self.get(broker).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(SessionStoreError::Corrupt { source, .. }) => {
                    warn!(broker = %broker, error = %source, "skipping corrupt session record");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(records)
    }

    async fn set_status(
        &self,
        broker: BrokerIdentity,
        status: SessionStatus,
    ) -> Result<bool, SessionStoreError> {
        let Some(mut record) = self.get(broker).await? else {
            return Ok(false);
        };
        if record.status == status {
            return Ok(true);
        }
        record.status = status;
        self.put(&record).await?;
        Ok(true)
    }
}
