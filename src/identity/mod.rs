//! Signing identities for feed owners
//!
//! Feed updates and chapters are authorized by an Ed25519 signature from the
//! feed owner. The core only ever sees the [`FeedSigner`] trait; key material
//! stays inside the signer.

pub mod keys;

pub use keys::FeedIdentity;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use thiserror::Error;

use crate::error::FeedError;
use crate::feed::OwnerAddress;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),
}

/// Signs digests on behalf of a feed owner.
pub trait FeedSigner: Send + Sync {
    /// Address of the owner whose feeds this signer may write.
    fn owner(&self) -> OwnerAddress;

    /// Sign a 32-byte digest.
    fn sign(&self, digest: &[u8; 32]) -> Result<Vec<u8>, FeedError>;
}

/// Check that `signature` is `owner`'s signature over `digest`.
pub fn verify_signature(
    owner: &OwnerAddress,
    digest: &[u8; 32],
    signature: &[u8],
) -> Result<(), FeedError> {
    let key = VerifyingKey::from_bytes(owner.as_bytes())
        .map_err(|e| FeedError::Signature(format!("invalid owner key {}: {}", owner, e)))?;
    let sig_bytes: [u8; 64] = signature.try_into().map_err(|_| {
        FeedError::Signature(format!("signature must be 64 bytes, got {}", signature.len()))
    })?;
    key.verify(digest, &Signature::from_bytes(&sig_bytes))
        .map_err(|_| FeedError::Signature(format!("signature does not match owner {}", owner)))
}
