//! Chapter encodings
//!
//! JSON is the default wire form. CBOR is available for compact payloads.
//! A decode failure means the blob is not a chapter we understand, so it is
//! reported as a validation error rather than a transport one.

use super::chapter::{Chapter, ChapterContent};
use crate::error::FeedError;

/// Encode/decode pair for chapters carrying `T`.
pub trait ChapterCodec<T>: Send + Sync {
    fn encode(&self, chapter: &Chapter<T>) -> Result<Vec<u8>, FeedError>;

    /// Decode a chapter. The returned chapter's `id` is unset.
    fn decode(&self, bytes: &[u8]) -> Result<Chapter<T>, FeedError>;
}

/// UTF-8 JSON chapters.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonChapterCodec;

impl<T: ChapterContent> ChapterCodec<T> for JsonChapterCodec {
    fn encode(&self, chapter: &Chapter<T>) -> Result<Vec<u8>, FeedError> {
        Ok(serde_json::to_vec(chapter)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Chapter<T>, FeedError> {
        serde_json::from_slice(bytes)
            .map_err(|e| FeedError::Validation(format!("malformed chapter: {}", e)))
    }
}

/// CBOR chapters.
#[derive(Clone, Copy, Debug, Default)]
pub struct CborChapterCodec;

impl<T: ChapterContent> ChapterCodec<T> for CborChapterCodec {
    fn encode(&self, chapter: &Chapter<T>) -> Result<Vec<u8>, FeedError> {
        let mut buf = Vec::new();
        ciborium::into_writer(chapter, &mut buf)
            .map_err(|e| FeedError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Chapter<T>, FeedError> {
        ciborium::from_reader(bytes)
            .map_err(|e| FeedError::Validation(format!("malformed chapter: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::OwnerAddress;
    use crate::timeline::ChapterId;

    #[test]
    fn test_missing_protocol_is_validation_error() {
        let bytes = serde_json::to_vec(&serde_json::json!({
            "version": "1.0.0",
            "timestamp": 1,
            "author": "00",
            "type": "t",
            "content": "x",
            "previous": null,
        }))
        .unwrap();
        let err = ChapterCodec::<String>::decode(&JsonChapterCodec, &bytes).unwrap_err();
        assert!(matches!(err, FeedError::Validation(_)));
    }

    #[test]
    fn test_cbor_is_more_compact_than_json() {
        let chapter = Chapter {
            id: ChapterId::default(),
            protocol: "timeline".to_string(),
            version: "1.0.0".to_string(),
            timestamp: 42,
            author: OwnerAddress([9; 32]),
            media_type: "application/octet-stream".to_string(),
            content: vec![1u64, 2, 3],
            previous: Some(ChapterId::of(b"parent")),
            references: vec![],
            signature: None,
        };
        let json = ChapterCodec::encode(&JsonChapterCodec, &chapter).unwrap();
        let cbor = ChapterCodec::encode(&CborChapterCodec, &chapter).unwrap();
        assert!(cbor.len() < json.len());

        let decoded: Chapter<Vec<u64>> = CborChapterCodec.decode(&cbor).unwrap();
        assert_eq!(decoded.content, vec![1, 2, 3]);
        assert_eq!(decoded.previous, chapter.previous);
    }
}
