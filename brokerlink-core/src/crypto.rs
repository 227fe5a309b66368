//! Key material and the AEAD boundary for everything brokerlink persists.
//!
//! A single root key is derived from the operator's master secret with
//! Argon2id and a persisted random salt. Purpose-specific subkeys are then
//! expanded with HKDF-SHA256 so the credential vault and the session store
//! never share an encryption key.

use std::fmt;

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use argon2::{Algorithm, Argon2, Params, ParamsBuilder, Version};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use brokerlink_model::SealedBlob;
use chrono::Utc;
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;
/// Length of salts from [`generate_salt`].
pub const SALT_LEN: usize = 16;
const NONCE_SIZE: usize = 12;
const MIN_SALT_LEN: usize = 8;
const ENVELOPE_VERSION: u32 = 1;

/// Argon2id cost parameters used to stretch the master secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyDerivationSettings {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    /// Time cost.
    pub iterations: u32,
    /// Lanes.
    pub parallelism: u32,
}

impl Default for KeyDerivationSettings {
    fn default() -> Self {
        Self {
            memory_kib: 64 * 1024, // 64 MiB
            iterations: 3,
            parallelism: 4,
        }
    }
}

impl KeyDerivationSettings {
    fn params(&self) -> Result<Params, CryptoError> {
        ParamsBuilder::new()
            .m_cost(self.memory_kib)
            .t_cost(self.iterations)
            .p_cost(self.parallelism)
            .output_len(KEY_LEN)
            .build()
            .map_err(|err| CryptoError::InvalidArgon2Params(err.to_string()))
    }
}

/// What a subkey is used for. Each purpose gets its own HKDF label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyPurpose {
    /// Credential vault entries.
    Vault,
    /// Persisted browser sessions.
    Session,
}

impl KeyPurpose {
    fn label(&self) -> &'static [u8] {
        match self {
            Self::Vault => b"brokerlink-vault-v1",
            Self::Session => b"brokerlink-session-v1",
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Vault => "vault",
            Self::Session => "session",
        }
    }
}

/// Key derivation and envelope failures.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The master secret is empty.
    #[error("master secret must not be empty")]
    EmptyMasterSecret,
    /// The persisted salt is shorter than the minimum.
    #[error("key derivation salt must be at least {min} bytes, got {actual}")]
    SaltTooShort {
        /// Required length in bytes.
        min: usize,
        /// Length found.
        actual: usize,
    },
    /// Argon2 rejected the cost parameters.
    #[error("invalid Argon2 parameters: {0}")]
    InvalidArgon2Params(String),
    /// Argon2 or HKDF failed.
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
    /// AES-GCM refused to seal.
    #[error("encryption failed")]
    Encryption,
    /// Wrong key, wrong purpose or context, or a tampered envelope.
    #[error("decryption failed: envelope does not authenticate")]
    Decryption,
    /// Envelope written by a newer format.
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u32),
    /// Nonce or ciphertext is not valid base64, or has the wrong length.
    #[error("malformed envelope: {0}")]
    Malformed(String),
    /// Sealed value could not be (de)serialized.
    #[error("payload serialization failed: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Fresh random salt for [`KeyMaterial::derive`].
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::rng().fill_bytes(&mut salt);
    salt
}

/// Process-wide key material. Constructed once at startup and shared by
/// reference; the subkeys are wiped when it is dropped.
pub struct KeyMaterial {
    vault_key: Zeroizing<[u8; KEY_LEN]>,
    session_key: Zeroizing<[u8; KEY_LEN]>,
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial").finish_non_exhaustive()
    }
}

impl KeyMaterial {
    /// Stretch `master_secret` with Argon2id and expand the purpose subkeys.
    pub fn derive(
        master_secret: &[u8],
        salt: &[u8],
        settings: &KeyDerivationSettings,
    ) -> Result<Self, CryptoError> {
        if master_secret.is_empty() {
            return Err(CryptoError::EmptyMasterSecret);
        }
        if salt.len() < MIN_SALT_LEN {
            return Err(CryptoError::SaltTooShort {
                min: MIN_SALT_LEN,
                actual: salt.len(),
            });
        }

        let argon2 =
            Argon2::new(Algorithm::Argon2id, Version::V0x13, settings.params()?);
        let mut root = Zeroizing::new([0u8; KEY_LEN]);
        argon2
            .hash_password_into(master_secret, salt, &mut root[..])
            .map_err(|err| CryptoError::KeyDerivation(err.to_string()))?;

        Self::from_root_key(&root[..])
    }

    /// Expand subkeys from an already-stretched root key.
    pub fn from_root_key(root: &[u8]) -> Result<Self, CryptoError> {
        let hk = Hkdf::<Sha256>::new(None, root);
        let expand = |purpose: KeyPurpose| {
            let mut okm = Zeroizing::new([0u8; KEY_LEN]);
            hk.expand(purpose.label(), &mut okm[..])
                .map_err(|_| CryptoError::KeyDerivation("HKDF expand failed".into()))?;
            Ok::<_, CryptoError>(okm)
        };

        Ok(Self {
            vault_key: expand(KeyPurpose::Vault)?,
            session_key: expand(KeyPurpose::Session)?,
        })
    }

    fn cipher(&self, purpose: KeyPurpose) -> Aes256Gcm {
        let key = match purpose {
            KeyPurpose::Vault => &self.vault_key,
            KeyPurpose::Session => &self.session_key,
        };
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..]))
    }

    /// Encrypt `plaintext`, binding the purpose and `context` (usually the
    /// broker key) as associated data.
    pub fn seal(
        &self,
        purpose: KeyPurpose,
        context: &str,
        plaintext: &[u8],
    ) -> Result<SealedBlob, CryptoError> {
        let aad = associated_data(purpose, context);
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher(purpose)
            .encrypt(&nonce, Payload { msg: plaintext, aad: aad.as_bytes() })
            .map_err(|_| CryptoError::Encryption)?;

        Ok(SealedBlob {
            version: ENVELOPE_VERSION,
            nonce: BASE64.encode(nonce),
            ciphertext: BASE64.encode(ciphertext),
            sealed_at: Utc::now(),
        })
    }

    /// Decrypt an envelope produced by [`KeyMaterial::seal`].
    pub fn open(
        &self,
        purpose: KeyPurpose,
        context: &str,
        blob: &SealedBlob,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        if blob.version != ENVELOPE_VERSION {
            return Err(CryptoError::UnsupportedVersion(blob.version));
        }

        let nonce_bytes = BASE64
            .decode(&blob.nonce)
            .map_err(|err| CryptoError::Malformed(format!("nonce: {err}")))?;
        if nonce_bytes.len() != NONCE_SIZE {
            return Err(CryptoError::Malformed(format!(
                "nonce must be {NONCE_SIZE} bytes, got {}",
                nonce_bytes.len()
            )));
        }
        let ciphertext = BASE64
            .decode(&blob.ciphertext)
            .map_err(|err| CryptoError::Malformed(format!("ciphertext: {err}")))?;

        let aad = associated_data(purpose, context);
        let plaintext = self
            .cipher(purpose)
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload { msg: ciphertext.as_ref(), aad: aad.as_bytes() },
            )
            .map_err(|_| CryptoError::Decryption)?;

        Ok(Zeroizing::new(plaintext))
    }

    /// [`KeyMaterial::seal`] for any serializable value.
    pub fn seal_json<T: Serialize>(
        &self,
        purpose: KeyPurpose,
        context: &str,
        value: &T,
    ) -> Result<SealedBlob, CryptoError> {
        let plaintext = Zeroizing::new(serde_json::to_vec(value)?);
        self.seal(purpose, context, &plaintext)
    }

    /// [`KeyMaterial::open`] followed by JSON decoding.
    pub fn open_json<T: DeserializeOwned>(
        &self,
        purpose: KeyPurpose,
        context: &str,
        blob: &SealedBlob,
    ) -> Result<T, CryptoError> {
        let plaintext = self.open(purpose, context, blob)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

fn associated_data(purpose: KeyPurpose, context: &str) -> String {
    format!("brokerlink:{}:{}", purpose.as_str(), context)
}
