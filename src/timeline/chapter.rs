//! Chapters: the immutable, hash-linked records of a timeline

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::FeedError;
use crate::feed::{ContentHash, OwnerAddress};
use crate::identity::verify_signature;

/// A chapter is addressed by the hash of its encoded bytes.
pub type ChapterId = ContentHash;

/// Anything that can be carried as chapter content.
pub trait ChapterContent: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> ChapterContent for T where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static
{
}

/// One record in a timeline.
///
/// `id` is never encoded. A reader sets it to the hash the chapter was
/// fetched by; a writer learns it from the content store on upload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chapter<T> {
    #[serde(skip)]
    pub id: ChapterId,
    pub protocol: String,
    pub version: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub author: OwnerAddress,
    #[serde(rename = "type")]
    pub media_type: String,
    pub content: T,
    pub previous: Option<ChapterId>,
    #[serde(default)]
    pub references: Vec<ChapterId>,
    /// Hex Ed25519 signature by `author` over [`Chapter::signing_digest`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl<T: Serialize + Clone> Chapter<T> {
    /// SHA-256 of the chapter's JSON form without its signature.
    pub fn signing_digest(&self) -> Result<[u8; 32], FeedError> {
        let unsigned = Chapter {
            signature: None,
            ..self.clone()
        };
        let bytes = serde_json::to_vec(&unsigned)?;
        Ok(Sha256::digest(&bytes).into())
    }

    /// Check the signature against the chapter's author.
    pub fn verify_signature(&self) -> Result<(), FeedError> {
        let signature = self.signature.as_deref().ok_or_else(|| {
            FeedError::Signature(format!("chapter {} is not signed", self.id))
        })?;
        let bytes = hex::decode(signature)
            .map_err(|e| FeedError::Signature(format!("malformed chapter signature: {}", e)))?;
        verify_signature(&self.author, &self.signing_digest()?, &bytes)
    }
}

/// The caller-supplied part of a chapter. Everything else is filled in when
/// it is published.
#[derive(Clone, Debug)]
pub struct PartialChapter<T> {
    pub content: T,
    pub previous: Option<ChapterId>,
    pub references: Vec<ChapterId>,
    pub media_type: Option<String>,
    pub timestamp: Option<u64>,
}

impl<T> PartialChapter<T> {
    pub fn new(content: T) -> Self {
        Self {
            content,
            previous: None,
            references: Vec::new(),
            media_type: None,
            timestamp: None,
        }
    }

    pub fn with_previous(mut self, previous: ChapterId) -> Self {
        self.previous = Some(previous);
        self
    }

    pub fn with_references(mut self, references: Vec<ChapterId>) -> Self {
        self.references = references;
        self
    }

    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Defaults applied by a [`super::ChapterAppender`] to every chapter it adds.
#[derive(Clone, Debug, Default)]
pub struct ChapterDefaults {
    pub media_type: Option<String>,
    pub references: Vec<ChapterId>,
}

impl ChapterDefaults {
    pub(crate) fn apply<T>(&self, content: T) -> PartialChapter<T> {
        PartialChapter {
            content,
            previous: None,
            references: self.references.clone(),
            media_type: self.media_type.clone(),
            timestamp: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{FeedIdentity, FeedSigner};

    fn chapter(author: OwnerAddress) -> Chapter<serde_json::Value> {
        Chapter {
            id: ChapterId::default(),
            protocol: "timeline".into(),
            version: "1.0.0".into(),
            timestamp: 1_700_000_000_000,
            author,
            media_type: "application/json".into(),
            content: serde_json::json!({"x": 1}),
            previous: None,
            references: Vec::new(),
            signature: None,
        }
    }

    #[test]
    fn test_json_shape() {
        let value = serde_json::to_value(chapter(OwnerAddress([1; 32]))).unwrap();
        assert_eq!(value["type"], "application/json");
        assert_eq!(value["previous"], serde_json::Value::Null);
        assert!(value.get("id").is_none());
        assert!(value.get("signature").is_none());
    }

    #[test]
    fn test_signature_covers_content() {
        let identity = FeedIdentity::generate();
        let mut signed = chapter(identity.owner());
        let digest = signed.signing_digest().unwrap();
        signed.signature = Some(hex::encode(identity.sign(&digest).unwrap()));
        assert!(signed.verify_signature().is_ok());

        // The signature itself is excluded from the digest
        assert_eq!(signed.signing_digest().unwrap(), digest);

        let mut tampered = signed.clone();
        tampered.content = serde_json::json!({"x": 2});
        assert!(matches!(tampered.verify_signature(), Err(FeedError::Signature(_))));

        let unsigned = chapter(identity.owner());
        assert!(unsigned.verify_signature().is_err());
    }
}
