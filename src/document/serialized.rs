use std::path::Path;

use serde::{Deserialize, Serialize};

use super::reader::DocState;
use crate::convergent::CrdtDocument;
use crate::error::FeedError;
use crate::feed::FeedId;
use crate::timeline::ChapterId;

/// A document session saved to resume later without replaying the chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocSerialized {
    /// Hex of the engine's saved document.
    pub doc_string: String,
    pub data_feed: FeedId,
    pub meta_feed: Option<FeedId>,
    #[serde(rename = "lastChapterID")]
    pub last_chapter_id: Option<ChapterId>,
    /// Hex of the last published snapshot, for writers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_doc_string: Option<String>,
}

fn decode_doc<D: CrdtDocument>(hex_doc: &str) -> Result<D, FeedError> {
    let bytes = hex::decode(hex_doc)
        .map_err(|e| FeedError::Serialization(format!("invalid document encoding: {}", e)))?;
    D::load(&bytes)
}

impl DocSerialized {
    pub(crate) fn capture<D: CrdtDocument>(
        state: &DocState<D>,
        data_feed: FeedId,
        meta_feed: Option<FeedId>,
    ) -> Result<Self, FeedError> {
        let published_doc_string = match &state.last_published {
            Some(published) => Some(hex::encode(published.save()?)),
            None => None,
        };
        Ok(Self {
            doc_string: hex::encode(state.doc.save()?),
            data_feed,
            meta_feed,
            last_chapter_id: state.last_seen,
            published_doc_string,
        })
    }

    pub(crate) fn restore_state<D: CrdtDocument>(&self) -> Result<DocState<D>, FeedError> {
        let last_published = match &self.published_doc_string {
            Some(published) => Some(decode_doc(published)?),
            None => None,
        };
        Ok(DocState {
            doc: decode_doc(&self.doc_string)?,
            last_seen: self.last_chapter_id,
            last_published,
        })
    }

    pub fn to_json(&self) -> Result<String, FeedError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, FeedError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn write_to(&self, path: &Path) -> Result<(), FeedError> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json).map_err(|e| {
            FeedError::Persistence(format!("Failed to write document {}: {}", path.display(), e))
        })
    }

    pub fn read_from(path: &Path) -> Result<Self, FeedError> {
        let data = std::fs::read(path).map_err(|e| {
            FeedError::Persistence(format!("Failed to read document {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_slice(&data)?)
    }
}
