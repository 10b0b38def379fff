use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};

use super::chapter::{Chapter, ChapterContent, ChapterId};
use super::codec::{ChapterCodec, JsonChapterCodec};
use super::subscription::{StopFlag, Subscription, Tick};
use crate::config::{LiveOptions, PollOptions, TimelineConfig};
use crate::error::FeedError;
use crate::feed::{
    with_timeout, ContentHash, ContentStore, ContentStoreSource, Epoch, FeedId, FeedRegister,
    FeedRegisterSource, OwnerAddress, Topic,
};

/// Reads a timeline: a backward-linked chain of chapters whose newest id is
/// the current value of a feed.
pub struct TimelineReader<T> {
    store: Arc<dyn ContentStore>,
    register: Arc<dyn FeedRegister>,
    owner: OwnerAddress,
    topic: Topic,
    codec: Arc<dyn ChapterCodec<T>>,
    config: TimelineConfig,
}

impl<T> Clone for TimelineReader<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            register: self.register.clone(),
            owner: self.owner,
            topic: self.topic,
            codec: self.codec.clone(),
            config: self.config.clone(),
        }
    }
}

impl<T: ChapterContent> TimelineReader<T> {
    pub fn new(
        store: Arc<dyn ContentStore>,
        register: Arc<dyn FeedRegister>,
        owner: OwnerAddress,
        topic: Topic,
    ) -> Self {
        Self::with_config(store, register, owner, topic, TimelineConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn ContentStore>,
        register: Arc<dyn FeedRegister>,
        owner: OwnerAddress,
        topic: Topic,
        config: TimelineConfig,
    ) -> Self {
        Self {
            store,
            register,
            owner,
            topic,
            codec: Arc::new(JsonChapterCodec),
            config,
        }
    }

    /// Build a reader from collaborator descriptions rather than instances.
    pub fn from_sources(
        store: ContentStoreSource,
        register: FeedRegisterSource,
        owner: OwnerAddress,
        topic: Topic,
    ) -> Result<Self, FeedError> {
        Ok(Self::new(store.resolve()?, register.resolve()?, owner, topic))
    }
}

impl<T> TimelineReader<T> {
    /// Replace the chapter encoding.
    pub fn with_codec(mut self, codec: Arc<dyn ChapterCodec<T>>) -> Self {
        self.codec = codec;
        self
    }

    pub fn owner(&self) -> OwnerAddress {
        self.owner
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn feed(&self) -> FeedId {
        FeedId::new(self.owner, self.topic)
    }

    pub fn config(&self) -> &TimelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    pub fn register(&self) -> &Arc<dyn FeedRegister> {
        &self.register
    }

    pub(crate) fn codec(&self) -> &dyn ChapterCodec<T> {
        self.codec.as_ref()
    }
}

impl<T: ChapterContent> TimelineReader<T> {
    /// Fetch and validate one chapter.
    pub async fn get_chapter(&self, id: &ChapterId) -> Result<Chapter<T>, FeedError> {
        let bytes = with_timeout(self.config.request_timeout(), self.store.download(id)).await?;
        if ContentHash::of(&bytes) != *id {
            return Err(FeedError::Validation(format!(
                "content for chapter {} does not match its hash",
                id
            )));
        }

        let mut chapter = self.codec.decode(&bytes)?;
        self.config.validate(&chapter.protocol, &chapter.version)?;
        chapter.id = *id;
        if self.config.verify_signatures {
            chapter.verify_signature()?;
        }
        Ok(chapter)
    }

    /// The feed's current pointer and the epoch it was written at.
    pub async fn latest_pointer(&self) -> Result<Option<(Epoch, ChapterId)>, FeedError> {
        let lookup = self.register.get_current_hash(&self.owner, &self.topic);
        match with_timeout(self.config.request_timeout(), lookup).await {
            Ok(pointer) => Ok(pointer),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Id of the newest chapter, or `None` if nothing was published yet.
    pub async fn get_latest_chapter_id(&self) -> Result<Option<ChapterId>, FeedError> {
        Ok(self.latest_pointer().await?.map(|(_, id)| id))
    }

    pub async fn get_latest_chapter(&self) -> Result<Option<Chapter<T>>, FeedError> {
        match self.get_latest_chapter_id().await? {
            Some(id) => Ok(Some(self.get_chapter(&id).await?)),
            None => Ok(None),
        }
    }

    /// Walk the chain backwards from `start`, or from the latest chapter.
    ///
    /// Each call returns a fresh stream. The stream ends after the first
    /// chapter with no `previous`, or after the first error.
    pub fn iter(&self, start: Option<ChapterId>) -> BoxStream<'_, Result<Chapter<T>, FeedError>> {
        enum Cursor {
            Start(Option<ChapterId>),
            At(ChapterId),
            Done,
        }

        stream::unfold(Cursor::Start(start), move |cursor| async move {
            let id = match cursor {
                Cursor::Start(Some(id)) | Cursor::At(id) => id,
                Cursor::Start(None) => match self.get_latest_chapter_id().await {
                    Ok(Some(id)) => id,
                    Ok(None) => return None,
                    Err(e) => return Some((Err(e), Cursor::Done)),
                },
                Cursor::Done => return None,
            };
            match self.get_chapter(&id).await {
                Ok(chapter) => {
                    let next = chapter.previous.map_or(Cursor::Done, Cursor::At);
                    Some((Ok(chapter), next))
                }
                Err(e) => Some((Err(e), Cursor::Done)),
            }
        })
        .boxed()
    }

    /// Chapters from `newest` back to, but excluding, `oldest`, newest first.
    ///
    /// With `oldest` set, reaching the start of the chain without meeting it
    /// means the two ids are not on one chain, and fails with `ChainBroken`.
    pub async fn get_chapters(
        &self,
        newest: &ChapterId,
        oldest: Option<&ChapterId>,
    ) -> Result<Vec<Chapter<T>>, FeedError> {
        let mut chapters: Vec<Chapter<T>> = Vec::new();
        let mut next = Some(*newest);

        while let Some(id) = next {
            if Some(&id) == oldest {
                return Ok(chapters);
            }
            let chapter = self.get_chapter(&id).await?;
            if let Some(newer) = chapters.last() {
                if chapter.timestamp > newer.timestamp {
                    return Err(FeedError::ChainBroken(format!(
                        "chapter {} is newer than its successor {}",
                        chapter.id, newer.id
                    )));
                }
            }
            next = chapter.previous;
            chapters.push(chapter);
        }

        match oldest {
            Some(oldest) => Err(FeedError::ChainBroken(format!(
                "chapter {} is not an ancestor of {}",
                oldest, newest
            ))),
            None => Ok(chapters),
        }
    }

    /// Poll the feed and call `on_chapter` whenever the latest chapter
    /// changes, or on every tick with `always_emit`.
    pub fn poll_latest_chapter<F>(&self, options: PollOptions, on_chapter: F) -> Subscription
    where
        F: FnMut(Chapter<T>) + Send + 'static,
    {
        let interval = options.interval();
        let immediate = options.immediate;
        let worker = PollWorker {
            reader: self.clone(),
            last_id: None,
            options,
            on_chapter,
        };
        Subscription::spawn(worker, interval, immediate)
    }

    /// Poll the feed and deliver every new chapter exactly once, in
    /// chronological order, however many were published between ticks.
    pub fn live<F>(&self, options: LiveOptions, on_batch: F) -> Subscription
    where
        F: FnMut(Vec<Chapter<T>>) + Send + 'static,
    {
        let interval = options.poll.interval();
        let immediate = options.poll.immediate;
        let worker = LiveWorker {
            reader: self.clone(),
            last_id: options.previous_id,
            backfill: options.backfill,
            options: options.poll,
            on_batch,
        };
        Subscription::spawn(worker, interval, immediate)
    }
}

struct PollWorker<T, F> {
    reader: TimelineReader<T>,
    last_id: Option<ChapterId>,
    options: PollOptions,
    on_chapter: F,
}

#[async_trait]
impl<T, F> Tick for PollWorker<T, F>
where
    T: ChapterContent,
    F: FnMut(Chapter<T>) + Send + 'static,
{
    async fn tick(&mut self, stop: &StopFlag) -> Result<(), FeedError> {
        let timeout = self.options.timeout_ms.map(std::time::Duration::from_millis);
        let Some(id) = with_timeout(timeout, self.reader.get_latest_chapter_id()).await? else {
            return Ok(());
        };
        if !self.options.always_emit && self.last_id == Some(id) {
            return Ok(());
        }

        let chapter = with_timeout(timeout, self.reader.get_chapter(&id)).await?;
        if stop.is_stopped() {
            return Ok(());
        }
        (self.on_chapter)(chapter);
        self.last_id = Some(id);
        Ok(())
    }

    fn name(&self) -> &str {
        "chapter poll"
    }
}

struct LiveWorker<T, F> {
    reader: TimelineReader<T>,
    last_id: Option<ChapterId>,
    backfill: bool,
    options: PollOptions,
    on_batch: F,
}

/// Everything between the last delivered chapter and `chapter`, oldest
/// first, ending with `chapter`.
async fn gap_batch<T: ChapterContent>(
    reader: &TimelineReader<T>,
    last_id: Option<ChapterId>,
    backfill: bool,
    chapter: Chapter<T>,
) -> Result<Vec<Chapter<T>>, FeedError> {
    let mut batch = match (last_id, chapter.previous) {
        (None, Some(previous)) if backfill => reader.get_chapters(&previous, None).await?,
        (None, _) | (_, None) => Vec::new(),
        (Some(last), Some(previous)) if previous == last => Vec::new(),
        (Some(last), Some(previous)) => {
            log::debug!("filling gap between {} and {}", last, chapter.id);
            reader.get_chapters(&previous, Some(&last)).await?
        }
    };
    batch.reverse();
    batch.push(chapter);
    Ok(batch)
}

#[async_trait]
impl<T, F> Tick for LiveWorker<T, F>
where
    T: ChapterContent,
    F: FnMut(Vec<Chapter<T>>) + Send + 'static,
{
    async fn tick(&mut self, stop: &StopFlag) -> Result<(), FeedError> {
        let timeout = self.options.timeout_ms.map(std::time::Duration::from_millis);
        let Some(id) = with_timeout(timeout, self.reader.get_latest_chapter_id()).await? else {
            return Ok(());
        };
        if self.last_id == Some(id) {
            return Ok(());
        }

        let chapter = with_timeout(timeout, self.reader.get_chapter(&id)).await?;
        let fill = gap_batch(&self.reader, self.last_id, self.backfill, chapter);
        let batch = with_timeout(timeout, fill).await?;
        if stop.is_stopped() {
            return Ok(());
        }
        (self.on_batch)(batch);
        self.last_id = Some(id);
        Ok(())
    }

    fn name(&self) -> &str {
        "live timeline"
    }
}
