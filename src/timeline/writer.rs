use std::sync::Arc;

use tokio::sync::Mutex;

use super::chapter::{Chapter, ChapterContent, ChapterDefaults, ChapterId, PartialChapter};
use super::codec::ChapterCodec;
use super::reader::TimelineReader;
use crate::config::TimelineConfig;
use crate::error::FeedError;
use crate::feed::{with_timeout, ContentStore, Epoch, FeedRegister, Topic};
use crate::identity::FeedSigner;

/// What the writer remembers between publishes.
#[derive(Debug, Default)]
struct PublishState {
    /// Epoch of the last pointer this writer committed.
    last_epoch: Option<Epoch>,
    /// Timestamp of the last chapter this writer sealed.
    last_timestamp: u64,
    /// Last chapter this writer published, whose timestamp is already in
    /// `last_timestamp`.
    last_chapter: Option<ChapterId>,
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Publishes chapters and advances the feed pointer.
///
/// Every method that touches the pointer holds one publish lock, so calls on
/// the same writer never race for an epoch or build on a stale `previous`.
/// Separate processes writing the same feed are caught, not prevented: with
/// `check_conflicts` the pointer is re-read right before the commit and a
/// mismatch fails with `PublishConflict`.
pub struct TimelineWriter<T> {
    reader: TimelineReader<T>,
    signer: Arc<dyn FeedSigner>,
    publish: Mutex<PublishState>,
}

impl<T: ChapterContent> TimelineWriter<T> {
    pub fn new(
        store: Arc<dyn ContentStore>,
        register: Arc<dyn FeedRegister>,
        signer: Arc<dyn FeedSigner>,
        topic: Topic,
    ) -> Self {
        Self::with_config(store, register, signer, topic, TimelineConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn ContentStore>,
        register: Arc<dyn FeedRegister>,
        signer: Arc<dyn FeedSigner>,
        topic: Topic,
        config: TimelineConfig,
    ) -> Self {
        let reader = TimelineReader::with_config(store, register, signer.owner(), topic, config);
        Self {
            reader,
            signer,
            publish: Mutex::new(PublishState::default()),
        }
    }

    pub fn with_codec(self, codec: Arc<dyn ChapterCodec<T>>) -> Self {
        Self {
            reader: self.reader.with_codec(codec),
            ..self
        }
    }

    /// The read side of this timeline.
    pub fn reader(&self) -> &TimelineReader<T> {
        &self.reader
    }

    pub fn signer(&self) -> &Arc<dyn FeedSigner> {
        &self.signer
    }

    /// Upload a chapter without moving the feed pointer.
    pub async fn post_chapter(&self, partial: PartialChapter<T>) -> Result<ChapterId, FeedError> {
        let mut chapter = {
            let mut state = self.publish.lock().await;
            self.floor_timestamp(&mut state, partial.previous.as_ref()).await?;
            self.seal(&mut state, partial)?
        };
        self.upload(&mut chapter).await
    }

    /// Point the feed at `id`.
    pub async fn set_latest_chapter_id(&self, id: &ChapterId) -> Result<(), FeedError> {
        let mut state = self.publish.lock().await;
        self.commit(&mut state, id, None).await?;
        state.last_chapter = None;
        Ok(())
    }

    /// Upload a chapter and point the feed at it. The pointer write is the
    /// commit point; a chapter uploaded without it is simply unreferenced.
    pub async fn set_latest_chapter(
        &self,
        partial: PartialChapter<T>,
    ) -> Result<ChapterId, FeedError> {
        let mut state = self.publish.lock().await;
        let expected = partial.previous;
        self.floor_timestamp(&mut state, expected.as_ref()).await?;
        let mut chapter = self.seal(&mut state, partial)?;
        let id = self.upload(&mut chapter).await?;
        let check = self.reader.config().check_conflicts.then_some(expected);
        self.commit(&mut state, &id, check).await?;
        state.last_chapter = Some(id);
        Ok(id)
    }

    /// Publish a chapter after the current latest one. An explicit
    /// `previous` is kept as given.
    pub async fn add_chapter(&self, partial: PartialChapter<T>) -> Result<Chapter<T>, FeedError> {
        let resolve = partial.previous.is_none();
        self.publish_after(partial, resolve).await
    }

    /// A publisher that keeps its own `previous` cursor, so only its first
    /// call has to look up the latest chapter.
    pub fn create_add_chapter(&self, defaults: ChapterDefaults) -> ChapterAppender<'_, T> {
        ChapterAppender {
            writer: self,
            defaults,
            cursor: Mutex::new(None),
        }
    }

    async fn publish_after(
        &self,
        mut partial: PartialChapter<T>,
        resolve_previous: bool,
    ) -> Result<Chapter<T>, FeedError> {
        let mut state = self.publish.lock().await;
        if resolve_previous {
            let latest = self.reader.latest_pointer().await?;
            partial.previous = latest.map(|(_, id)| id);
            state.last_epoch = state.last_epoch.max(latest.map(|(epoch, _)| epoch));
        }

        let expected = partial.previous;
        self.floor_timestamp(&mut state, expected.as_ref()).await?;
        let mut chapter = self.seal(&mut state, partial)?;
        let id = self.upload(&mut chapter).await?;
        let check = self.reader.config().check_conflicts.then_some(expected);
        self.commit(&mut state, &id, check).await?;
        state.last_chapter = Some(id);
        Ok(chapter)
    }

    /// Raise `last_timestamp` to that of `previous` when another session or
    /// device wrote it, so timestamps never decrease along the chain.
    async fn floor_timestamp(
        &self,
        state: &mut PublishState,
        previous: Option<&ChapterId>,
    ) -> Result<(), FeedError> {
        let Some(previous) = previous else {
            return Ok(());
        };
        if state.last_chapter.as_ref() == Some(previous) {
            return Ok(());
        }
        let parent = self.reader.get_chapter(previous).await?;
        if parent.timestamp > state.last_timestamp {
            log::debug!(
                "chapter {} is ahead of this writer's clock, using its timestamp {}",
                previous,
                parent.timestamp
            );
            state.last_timestamp = parent.timestamp;
        }
        Ok(())
    }

    /// Fill in the writer-owned fields and sign.
    fn seal(
        &self,
        state: &mut PublishState,
        partial: PartialChapter<T>,
    ) -> Result<Chapter<T>, FeedError> {
        let config = self.reader.config();
        // Keep timestamps non-decreasing along this writer's chain
        let timestamp = partial.timestamp.unwrap_or_else(now_ms).max(state.last_timestamp);
        let mut chapter = Chapter {
            id: ChapterId::default(),
            protocol: config.protocol.clone(),
            version: config.version.clone(),
            timestamp,
            author: self.signer.owner(),
            media_type: partial.media_type.unwrap_or_else(|| config.media_type.clone()),
            content: partial.content,
            previous: partial.previous,
            references: partial.references,
            signature: None,
        };
        let digest = chapter.signing_digest()?;
        chapter.signature = Some(hex::encode(self.signer.sign(&digest)?));
        state.last_timestamp = timestamp;
        Ok(chapter)
    }

    async fn upload(&self, chapter: &mut Chapter<T>) -> Result<ChapterId, FeedError> {
        let bytes = self.reader.codec().encode(chapter)?;
        let store = self.reader.store();
        let id = with_timeout(self.reader.config().request_timeout(), store.upload(&bytes)).await?;
        chapter.id = id;
        Ok(id)
    }

    /// Write the pointer at the next free epoch.
    ///
    /// `expected` is the pointer value the caller built on; when given, a
    /// different current value aborts the commit.
    async fn commit(
        &self,
        state: &mut PublishState,
        id: &ChapterId,
        expected: Option<Option<ChapterId>>,
    ) -> Result<(), FeedError> {
        let mut floor = state.last_epoch;
        if floor.is_none() || expected.is_some() {
            let latest = self.reader.latest_pointer().await?;
            if let Some(expected) = expected {
                let actual = latest.map(|(_, current)| current);
                if actual != expected {
                    log::warn!(
                        "feed {} moved to {:?} while publishing after {:?}",
                        self.reader.topic(),
                        actual,
                        expected
                    );
                    return Err(FeedError::PublishConflict {
                        expected: expected.map(|id| id.to_hex()),
                        actual: actual.map(|id| id.to_hex()),
                    });
                }
            }
            floor = floor.max(latest.map(|(epoch, _)| epoch));
        }

        let epoch = Epoch::next_after(floor, now_secs());
        let feed = self.reader.feed().at(epoch);
        let signature = self.signer.sign(&feed.update_digest(id.as_bytes()))?;
        let register = self.reader.register();
        with_timeout(
            self.reader.config().request_timeout(),
            register.set_current_hash(&feed, id, &signature),
        )
        .await?;

        state.last_epoch = Some(epoch);
        log::debug!("feed {} now at {} (epoch {}/{})", feed.topic, id, epoch.time, epoch.level);
        Ok(())
    }
}

/// Publisher returned by [`TimelineWriter::create_add_chapter`].
pub struct ChapterAppender<'a, T> {
    writer: &'a TimelineWriter<T>,
    defaults: ChapterDefaults,
    /// `None` until the latest chapter is known; then the id to build on.
    cursor: Mutex<Option<Option<ChapterId>>>,
}

impl<'a, T: ChapterContent> ChapterAppender<'a, T> {
    pub async fn add(&self, content: T) -> Result<Chapter<T>, FeedError> {
        let mut cursor = self.cursor.lock().await;
        let mut partial = self.defaults.apply(content);
        partial.previous = cursor.flatten();

        match self.writer.publish_after(partial, cursor.is_none()).await {
            Ok(chapter) => {
                *cursor = Some(Some(chapter.id));
                Ok(chapter)
            }
            Err(e) => {
                // Look the pointer up again next time
                *cursor = None;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{MemoryContentStore, MemoryFeedRegister};
    use crate::identity::FeedIdentity;
    use futures_util::TryStreamExt;

    fn writer() -> (TimelineWriter<String>, Arc<MemoryFeedRegister>, Arc<MemoryContentStore>) {
        let store = Arc::new(MemoryContentStore::new());
        let register = Arc::new(MemoryFeedRegister::new());
        let writer = TimelineWriter::new(
            store.clone(),
            register.clone(),
            Arc::new(FeedIdentity::generate()),
            Topic::from_name("timeline"),
        );
        (writer, register, store)
    }

    #[tokio::test]
    async fn test_add_chapter_links_to_latest() {
        let (writer, _, _) = writer();
        let first = writer.add_chapter(PartialChapter::new("one".to_string())).await.unwrap();
        let second = writer.add_chapter(PartialChapter::new("two".to_string())).await.unwrap();

        assert_eq!(first.previous, None);
        assert_eq!(second.previous, Some(first.id));
        assert!(second.timestamp >= first.timestamp);
        assert_eq!(writer.reader().get_latest_chapter_id().await.unwrap(), Some(second.id));

        let loaded = writer.reader().get_chapter(&second.id).await.unwrap();
        assert_eq!(loaded, second);
        assert!(loaded.verify_signature().is_ok());
    }

    #[tokio::test]
    async fn test_post_chapter_leaves_pointer() {
        let (writer, register, _) = writer();
        let id = writer.post_chapter(PartialChapter::new("orphan".to_string())).await.unwrap();
        assert_eq!(register.write_count(), 0);
        assert_eq!(writer.reader().get_latest_chapter_id().await.unwrap(), None);

        writer.set_latest_chapter_id(&id).await.unwrap();
        assert_eq!(writer.reader().get_latest_chapter_id().await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn test_set_latest_chapter_detects_stale_previous() {
        let (writer, _, _) = writer();
        let first = writer.set_latest_chapter(PartialChapter::new("a".to_string())).await.unwrap();
        writer
            .set_latest_chapter(PartialChapter::new("b".to_string()).with_previous(first))
            .await
            .unwrap();

        // Builds on `first` although the feed already moved past it
        let err = writer
            .set_latest_chapter(PartialChapter::new("c".to_string()).with_previous(first))
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::PublishConflict { .. }));
    }

    #[tokio::test]
    async fn test_appender_reuses_cursor() {
        let (writer, register, _) = writer();
        let appender = writer.create_add_chapter(ChapterDefaults {
            media_type: Some("text/plain".into()),
            references: Vec::new(),
        });

        let a = appender.add("a".to_string()).await.unwrap();
        let b = appender.add("b".to_string()).await.unwrap();
        let c = appender.add("c".to_string()).await.unwrap();
        assert_eq!(b.previous, Some(a.id));
        assert_eq!(c.previous, Some(b.id));
        assert_eq!(c.media_type, "text/plain");
        assert_eq!(register.write_count(), 3);

        let history: Vec<String> = writer
            .reader()
            .iter(None)
            .map_ok(|chapter| chapter.content)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(history, vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn test_new_session_never_predates_previous() {
        let store = Arc::new(MemoryContentStore::new());
        let register = Arc::new(MemoryFeedRegister::new());
        let identity = Arc::new(FeedIdentity::generate());
        let topic = Topic::from_name("skewed");

        // An earlier session whose clock ran an hour ahead
        let ahead = now_ms() + 3_600_000;
        let first: TimelineWriter<String> =
            TimelineWriter::new(store.clone(), register.clone(), identity.clone(), topic);
        let c1 = first
            .add_chapter(PartialChapter::new("ahead".into()).with_timestamp(ahead))
            .await
            .unwrap();

        let second: TimelineWriter<String> =
            TimelineWriter::new(store, register, identity, topic);
        let c2 = second.add_chapter(PartialChapter::new("now".into())).await.unwrap();
        assert_eq!(c2.previous, Some(c1.id));
        assert!(c2.timestamp >= c1.timestamp);

        let chain = second.reader().get_chapters(&c2.id, None).await.unwrap();
        assert_eq!(chain.len(), 2);

        let c3 = second
            .set_latest_chapter(PartialChapter::new("explicit".into()).with_previous(c2.id))
            .await
            .unwrap();
        let c3 = second.reader().get_chapter(&c3).await.unwrap();
        assert!(c3.timestamp >= c1.timestamp);
    }

    #[tokio::test]
    async fn test_external_writer_conflict() {
        let store = Arc::new(MemoryContentStore::new());
        let register = Arc::new(MemoryFeedRegister::new());
        let identity = Arc::new(FeedIdentity::generate());
        let topic = Topic::from_name("shared");
        let a: TimelineWriter<String> =
            TimelineWriter::new(store.clone(), register.clone(), identity.clone(), topic);
        let b: TimelineWriter<String> = TimelineWriter::new(store, register, identity, topic);

        let base = a.add_chapter(PartialChapter::new("base".into())).await.unwrap();
        b.add_chapter(PartialChapter::new("from b".into())).await.unwrap();

        let err = a
            .add_chapter(PartialChapter::new("stale".into()).with_previous(base.id))
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        // Re-resolving `previous` succeeds
        let retried = a.add_chapter(PartialChapter::new("retry".into())).await.unwrap();
        assert_ne!(retried.previous, Some(base.id));
    }
}
