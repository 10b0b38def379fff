use std::ops::Deref;
use std::sync::Arc;

use tokio::sync::Mutex;

use super::meta::DocumentMeta;
use super::reader::DocumentReader;
use super::serialized::DocSerialized;
use crate::config::TimelineConfig;
use crate::convergent::CrdtDocument;
use crate::error::FeedError;
use crate::feed::{ContentStore, FeedId, FeedRegister, Topic};
use crate::identity::FeedSigner;
use crate::timeline::{ChapterId, PartialChapter, TimelineWriter};

/// A document replica that publishes its local edits as chapters.
///
/// Derefs to [`DocumentReader`] for `pull`, `change`, `merge` and `save`.
pub struct DocumentWriter<D: CrdtDocument> {
    reader: DocumentReader<D>,
    timeline: TimelineWriter<D::Changes>,
    /// At most one publish in flight; a second `push` waits and then diffs
    /// against what the first published.
    push_lock: Mutex<()>,
}

impl<D: CrdtDocument> DocumentWriter<D> {
    pub fn new(timeline: TimelineWriter<D::Changes>, doc: D) -> Self {
        let reader = DocumentReader::new(timeline.reader().clone(), doc);
        Self {
            reader,
            timeline,
            push_lock: Mutex::new(()),
        }
    }

    /// Start a document under `meta_topic`: announce a data feed derived
    /// from it, then write changes there.
    pub async fn create(
        store: Arc<dyn ContentStore>,
        register: Arc<dyn FeedRegister>,
        signer: Arc<dyn FeedSigner>,
        meta_topic: Topic,
        doc: D,
        config: TimelineConfig,
    ) -> Result<Self, FeedError> {
        let data_topic = DocumentMeta::data_topic(&meta_topic);
        let meta = DocumentMeta {
            data_feed: FeedId::new(signer.owner(), data_topic),
        };
        meta.announce(&store, &register, &signer, meta_topic, &config).await?;

        let meta_feed = FeedId::new(signer.owner(), meta_topic);
        let timeline = TimelineWriter::with_config(store, register, signer, data_topic, config);
        let mut writer = Self::new(timeline, doc);
        writer.reader = writer.reader.with_meta_feed(meta_feed);
        Ok(writer)
    }

    /// Resume a saved writer session. The signer must own the data feed.
    pub fn load(
        serialized: &DocSerialized,
        store: Arc<dyn ContentStore>,
        register: Arc<dyn FeedRegister>,
        signer: Arc<dyn FeedSigner>,
        config: TimelineConfig,
    ) -> Result<Self, FeedError> {
        if serialized.data_feed.owner != signer.owner() {
            return Err(FeedError::Validation(format!(
                "signer {} does not own data feed of {}",
                signer.owner(),
                serialized.data_feed.owner
            )));
        }
        let reader =
            DocumentReader::load(serialized, store.clone(), register.clone(), config.clone())?;
        let timeline = TimelineWriter::with_config(
            store,
            register,
            signer,
            serialized.data_feed.topic,
            config,
        );
        Ok(Self {
            reader,
            timeline,
            push_lock: Mutex::new(()),
        })
    }

    pub fn reader(&self) -> &DocumentReader<D> {
        &self.reader
    }

    pub fn timeline(&self) -> &TimelineWriter<D::Changes> {
        &self.timeline
    }

    /// Publish local edits made since the last push.
    ///
    /// Returns `None` without touching the network when there is nothing to
    /// publish. The published snapshot only advances once the chapter is
    /// committed, so a failed push is retried in full by the next one.
    pub async fn push(&self) -> Result<Option<ChapterId>, FeedError> {
        let _publishing = self.push_lock.lock().await;

        let (snapshot, changes) = {
            let state = self.reader.state.lock().await;
            let changes = state.doc.diff(state.last_published.as_ref());
            if D::changes_are_empty(&changes) {
                return Ok(None);
            }
            (state.doc.clone(), changes)
        };

        let chapter = self.timeline.add_chapter(PartialChapter::new(changes)).await?;

        let mut state = self.reader.state.lock().await;
        let mut published = snapshot;
        if let Some(previous) = state.last_published.as_ref() {
            // Keeps chapters pulled while this one was in flight
            published.merge(previous)?;
        }
        state.last_published = Some(published);
        // Only skip ahead if nothing unseen sits between us and the new chapter
        if state.last_seen == chapter.previous {
            state.last_seen = Some(chapter.id);
        }
        log::debug!("pushed chapter {} on {}", chapter.id, self.timeline.reader().topic());
        Ok(Some(chapter.id))
    }
}

impl<D: CrdtDocument> Deref for DocumentWriter<D> {
    type Target = DocumentReader<D>;

    fn deref(&self) -> &Self::Target {
        &self.reader
    }
}
