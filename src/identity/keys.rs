//! Ed25519 feed owner identity
//!
//! The owner address is the raw 32-byte verifying key, so anyone holding a
//! feed id can check who signed an update without a key directory.

use std::path::Path;

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use super::{FeedSigner, IdentityError};
use crate::error::FeedError;
use crate::feed::OwnerAddress;

/// Serializable form of a FeedIdentity. Zeroized on drop.
#[derive(Serialize, Deserialize)]
struct FeedIdentityStore {
    signing_key_bytes: [u8; 32],
}

impl Drop for FeedIdentityStore {
    fn drop(&mut self) {
        self.signing_key_bytes.zeroize();
    }
}

/// A feed owner's signing key.
pub struct FeedIdentity {
    signing_key: SigningKey,
}

impl FeedIdentity {
    /// Generate a fresh identity.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn address(&self) -> OwnerAddress {
        OwnerAddress(self.verifying_key().to_bytes())
    }

    /// Load from a JSON keystore file.
    pub fn load(path: &Path) -> Result<Self, IdentityError> {
        let data = std::fs::read(path).map_err(|e| IdentityError::IoError(e.to_string()))?;
        let store: FeedIdentityStore = serde_json::from_slice(&data)
            .map_err(|e| IdentityError::DeserializationError(e.to_string()))?;
        Ok(Self::from_secret_bytes(&store.signing_key_bytes))
    }

    /// Persist to a JSON keystore file.
    pub fn save(&self, path: &Path) -> Result<(), IdentityError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| IdentityError::IoError(e.to_string()))?;
        }

        let store = FeedIdentityStore {
            signing_key_bytes: self.signing_key.to_bytes(),
        };
        let json = serde_json::to_string_pretty(&store)
            .map_err(|e| IdentityError::SerializationError(e.to_string()))?;

        std::fs::write(path, json).map_err(|e| IdentityError::IoError(e.to_string()))
    }

    /// Load from path if it exists, otherwise generate and save.
    pub fn load_or_generate(path: &Path) -> Result<Self, IdentityError> {
        if path.exists() {
            Self::load(path)
        } else {
            let identity = Self::generate();
            identity.save(path)?;
            Ok(identity)
        }
    }
}

impl FeedSigner for FeedIdentity {
    fn owner(&self) -> OwnerAddress {
        self.address()
    }

    fn sign(&self, digest: &[u8; 32]) -> Result<Vec<u8>, FeedError> {
        Ok(self.signing_key.sign(digest).to_bytes().to_vec())
    }
}
