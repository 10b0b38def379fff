use std::sync::Arc;

use tokio::sync::Mutex;

use super::meta::DocumentMeta;
use super::serialized::DocSerialized;
use crate::config::TimelineConfig;
use crate::convergent::CrdtDocument;
use crate::error::FeedError;
use crate::feed::{ContentStore, FeedId, FeedRegister, OwnerAddress, Topic};
use crate::timeline::{ChapterId, TimelineReader};

/// Everything `change`, `merge`, `pull` and `push` touch. One lock guards it
/// all, so those four never interleave on a document.
pub(crate) struct DocState<D> {
    pub(crate) doc: D,
    pub(crate) last_seen: Option<ChapterId>,
    /// Snapshot the next push diffs against. Only writers set it.
    pub(crate) last_published: Option<D>,
}

/// A local replica of a document whose changes are published on a timeline.
pub struct DocumentReader<D: CrdtDocument> {
    pub(crate) state: Arc<Mutex<DocState<D>>>,
    pull_lock: Arc<Mutex<()>>,
    timeline: TimelineReader<D::Changes>,
    meta_feed: Option<FeedId>,
}

impl<D: CrdtDocument> Clone for DocumentReader<D> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            pull_lock: self.pull_lock.clone(),
            timeline: self.timeline.clone(),
            meta_feed: self.meta_feed.clone(),
        }
    }
}

impl<D: CrdtDocument> DocumentReader<D> {
    pub fn new(timeline: TimelineReader<D::Changes>, doc: D) -> Self {
        Self::with_state(
            timeline,
            DocState {
                doc,
                last_seen: None,
                last_published: None,
            },
        )
    }

    pub(crate) fn with_state(timeline: TimelineReader<D::Changes>, state: DocState<D>) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            pull_lock: Arc::new(Mutex::new(())),
            timeline,
            meta_feed: None,
        }
    }

    /// Record the meta feed this document was discovered through.
    pub fn with_meta_feed(mut self, meta_feed: FeedId) -> Self {
        self.meta_feed = Some(meta_feed);
        self
    }

    /// Open the document announced on `owner`'s meta feed `meta_topic`.
    pub async fn from_meta_feed(
        store: Arc<dyn ContentStore>,
        register: Arc<dyn FeedRegister>,
        owner: OwnerAddress,
        meta_topic: Topic,
        doc: D,
        config: TimelineConfig,
    ) -> Result<Self, FeedError> {
        let meta = DocumentMeta::read(&store, &register, owner, meta_topic, &config).await?;
        let timeline = TimelineReader::with_config(
            store,
            register,
            meta.data_feed.owner,
            meta.data_feed.topic,
            config,
        );
        Ok(Self::new(timeline, doc).with_meta_feed(FeedId::new(owner, meta_topic)))
    }

    /// Resume from a saved session.
    pub fn load(
        serialized: &DocSerialized,
        store: Arc<dyn ContentStore>,
        register: Arc<dyn FeedRegister>,
        config: TimelineConfig,
    ) -> Result<Self, FeedError> {
        let state = serialized.restore_state::<D>()?;
        let feed = &serialized.data_feed;
        let timeline = TimelineReader::with_config(store, register, feed.owner, feed.topic, config);
        let mut reader = Self::with_state(timeline, state);
        reader.meta_feed = serialized.meta_feed.clone();
        Ok(reader)
    }

    /// Snapshot the session for [`DocumentReader::load`].
    pub async fn save(&self) -> Result<DocSerialized, FeedError> {
        let state = self.state.lock().await;
        DocSerialized::capture(&state, self.data_feed(), self.meta_feed.clone())
    }

    pub fn timeline(&self) -> &TimelineReader<D::Changes> {
        &self.timeline
    }

    pub fn data_feed(&self) -> FeedId {
        self.timeline.feed()
    }

    pub fn meta_feed(&self) -> Option<&FeedId> {
        self.meta_feed.as_ref()
    }

    /// A copy of the current document.
    pub async fn doc(&self) -> D {
        self.state.lock().await.doc.clone()
    }

    /// Read the current document without copying it.
    pub async fn read<R>(&self, f: impl FnOnce(&D) -> R) -> R {
        f(&self.state.lock().await.doc)
    }

    pub async fn last_seen(&self) -> Option<ChapterId> {
        self.state.lock().await.last_seen
    }

    /// Edit the document locally. Returns whether anything changed.
    pub async fn change(&self, updater: impl FnOnce(&mut D)) -> bool {
        let mut state = self.state.lock().await;
        let before = state.doc.heads();
        updater(&mut state.doc);
        state.doc.heads() != before
    }

    /// Merge another replica in. Returns whether anything changed.
    pub async fn merge(&self, other: &D) -> Result<bool, FeedError> {
        let mut state = self.state.lock().await;
        let before = state.doc.heads();
        state.doc.merge(other)?;
        Ok(state.doc.heads() != before)
    }

    /// Apply every chapter published since the last pull, oldest first.
    /// Returns whether the document changed.
    pub async fn pull(&self) -> Result<bool, FeedError> {
        let _pulling = self.pull_lock.lock().await;
        let last_seen = self.state.lock().await.last_seen;

        let Some(latest) = self.timeline.get_latest_chapter_id().await? else {
            return Ok(false);
        };
        if Some(latest) == last_seen {
            return Ok(false);
        }

        let mut chapters = self.timeline.get_chapters(&latest, last_seen.as_ref()).await?;
        chapters.reverse();

        let mut state = self.state.lock().await;
        let before = state.doc.heads();
        for chapter in chapters {
            // Chapters on our own feed are published by definition
            if let Some(published) = state.last_published.as_mut() {
                published.apply_changes(chapter.content.clone())?;
            }
            state.doc.apply_changes(chapter.content)?;
        }
        // A push that landed meanwhile may already have moved the cursor on
        if state.last_seen == last_seen {
            state.last_seen = Some(latest);
        }
        let changed = state.doc.heads() != before;
        log::debug!(
            "pulled feed {} up to {} (changed: {})",
            self.timeline.topic(),
            latest,
            changed
        );
        Ok(changed)
    }
}
