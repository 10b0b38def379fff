use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::TimelineConfig;
use crate::error::FeedError;
use crate::feed::{ContentStore, FeedId, FeedRegister, OwnerAddress, Topic};
use crate::identity::FeedSigner;
use crate::timeline::{PartialChapter, TimelineReader, TimelineWriter};

/// Media type of meta feed chapters.
pub const META_MEDIA_TYPE: &str = "application/vnd.feeddoc.meta+json";

/// Announcement published on a document's meta feed: where its changes live.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMeta {
    pub data_feed: FeedId,
}

impl DocumentMeta {
    /// The data feed topic belonging to a meta feed topic.
    pub fn data_topic(meta_topic: &Topic) -> Topic {
        meta_topic.sub_topic("data")
    }

    /// Latest announcement on a meta feed.
    pub async fn read(
        store: &Arc<dyn ContentStore>,
        register: &Arc<dyn FeedRegister>,
        owner: OwnerAddress,
        meta_topic: Topic,
        config: &TimelineConfig,
    ) -> Result<Self, FeedError> {
        let reader: TimelineReader<DocumentMeta> = TimelineReader::with_config(
            store.clone(),
            register.clone(),
            owner,
            meta_topic,
            config.clone(),
        );
        match reader.get_latest_chapter().await? {
            Some(chapter) => Ok(chapter.content),
            None => Err(FeedError::NotFound(format!(
                "no document announced on meta feed {}",
                meta_topic
            ))),
        }
    }

    /// Publish this announcement unless the meta feed already carries it.
    pub async fn announce(
        &self,
        store: &Arc<dyn ContentStore>,
        register: &Arc<dyn FeedRegister>,
        signer: &Arc<dyn FeedSigner>,
        meta_topic: Topic,
        config: &TimelineConfig,
    ) -> Result<(), FeedError> {
        let writer: TimelineWriter<DocumentMeta> = TimelineWriter::with_config(
            store.clone(),
            register.clone(),
            signer.clone(),
            meta_topic,
            config.clone(),
        );
        let current = writer.reader().get_latest_chapter().await?;
        if current.map(|chapter| chapter.content).as_ref() == Some(self) {
            return Ok(());
        }
        let partial = PartialChapter::new(self.clone()).with_media_type(META_MEDIA_TYPE);
        let chapter = writer.add_chapter(partial).await?;
        log::info!("announced data feed {} on meta feed {}", self.data_feed.topic, meta_topic);
        log::debug!("meta chapter {}", chapter.id);
        Ok(())
    }
}
