//! Numbered chunk lists over a feed
//!
//! A chunk list uses a feed's epoch time as a sequence number: chunk `n`
//! lives at epoch `(n, 0)`. [`ChunkListWriter`] stores raw bytes straight in
//! the feed; [`DataListWriter`] uploads the payload to a content store and
//! stores only its hash, so entries can be larger than a feed update.

use std::sync::Arc;

use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::Mutex;

use crate::config::ChunkListConfig;
use crate::error::FeedError;
use crate::feed::{
    with_timeout, ContentHash, ContentStore, Epoch, FeedId, FeedRegister, OwnerAddress, Topic,
};
use crate::identity::FeedSigner;

/// One entry of a chunk list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub index: u64,
    pub data: Vec<u8>,
}

/// Reads chunks by index.
#[derive(Clone)]
pub struct ChunkListReader {
    register: Arc<dyn FeedRegister>,
    feed: FeedId,
    config: ChunkListConfig,
}

impl ChunkListReader {
    pub fn new(register: Arc<dyn FeedRegister>, owner: OwnerAddress, topic: Topic) -> Self {
        Self::with_config(register, owner, topic, ChunkListConfig::default())
    }

    pub fn with_config(
        register: Arc<dyn FeedRegister>,
        owner: OwnerAddress,
        topic: Topic,
        config: ChunkListConfig,
    ) -> Self {
        Self {
            register,
            feed: FeedId::new(owner, topic),
            config,
        }
    }

    pub fn feed_at(&self, index: u64) -> FeedId {
        self.feed.at(Epoch::new(index, 0))
    }

    /// Chunk at `index`, or `None` if nothing was written there.
    pub async fn load(&self, index: u64) -> Result<Option<Chunk>, FeedError> {
        let feed = self.feed_at(index);
        let lookup = self.register.get_update(&feed);
        let data = with_timeout(self.config.request_timeout(), lookup).await?;
        Ok(data.map(|data| Chunk { index, data }))
    }

    /// Chunks from `min` upward.
    ///
    /// Without `max` the stream ends at the first missing index, which is how
    /// a writer finds its next free slot. With `max` the stream ends after
    /// `max`, and a missing chunk inside the range is yielded as
    /// `FeedError::NotFound` instead of ending the list.
    pub fn forwards(&self, min: u64, max: Option<u64>) -> BoxStream<'_, Result<Chunk, FeedError>> {
        stream::unfold(Some(min), move |next| async move {
            let index = next?;
            if max.map_or(false, |max| index > max) {
                return None;
            }
            match self.load(index).await {
                Ok(Some(chunk)) => Some((Ok(chunk), index.checked_add(1))),
                Ok(None) if max.is_none() => None,
                Ok(None) => Some((Err(FeedError::NotFound(format!("chunk {}", index))), None)),
                Err(e) => Some((Err(e), None)),
            }
        })
        .boxed()
    }

    /// Chunks from `max` down to `min`, both inclusive.
    ///
    /// A missing chunk inside the range is not the end of the list: the
    /// stream yields `FeedError::NotFound` for it and stops.
    pub fn backwards(&self, max: u64, min: u64) -> BoxStream<'_, Result<Chunk, FeedError>> {
        let start = if max >= min { Some(max) } else { None };
        stream::unfold(start, move |next| async move {
            let index = next?;
            let following = if index > min { Some(index - 1) } else { None };
            match self.load(index).await {
                Ok(Some(chunk)) => Some((Ok(chunk), following)),
                Ok(None) => Some((Err(FeedError::NotFound(format!("chunk {}", index))), None)),
                Err(e) => Some((Err(e), None)),
            }
        })
        .boxed()
    }

    /// Index of the last chunk in an unbroken run starting at `from`.
    pub async fn last_index_from(&self, from: u64) -> Result<Option<u64>, FeedError> {
        let mut last = None;
        let mut chunks = self.forwards(from, None);
        while let Some(chunk) = chunks.next().await {
            last = Some(chunk?.index);
        }
        Ok(last)
    }
}

/// Appends raw chunks.
///
/// `push` calls on one writer are serialized, so two concurrent pushes never
/// claim the same index.
pub struct ChunkListWriter {
    reader: ChunkListReader,
    signer: Arc<dyn FeedSigner>,
    current_index: Mutex<Option<u64>>,
}

impl ChunkListWriter {
    /// A writer for a new list; the first push lands at index 0.
    pub fn new(register: Arc<dyn FeedRegister>, signer: Arc<dyn FeedSigner>, topic: Topic) -> Self {
        Self::with_config(register, signer, topic, ChunkListConfig::default())
    }

    pub fn with_config(
        register: Arc<dyn FeedRegister>,
        signer: Arc<dyn FeedSigner>,
        topic: Topic,
        config: ChunkListConfig,
    ) -> Self {
        let reader = ChunkListReader::with_config(register, signer.owner(), topic, config);
        Self {
            reader,
            signer,
            current_index: Mutex::new(None),
        }
    }

    /// Resume after a known last index.
    pub fn starting_after(self, index: u64) -> Self {
        Self {
            current_index: Mutex::new(Some(index)),
            ..self
        }
    }

    pub fn reader(&self) -> &ChunkListReader {
        &self.reader
    }

    pub async fn current_index(&self) -> Option<u64> {
        *self.current_index.lock().await
    }

    /// Scan forward from the current index to find chunks written by an
    /// earlier session, and continue after the last one.
    pub async fn discover(&self) -> Result<Option<u64>, FeedError> {
        let mut current = self.current_index.lock().await;
        let from = current.map_or(0, |i| i + 1);
        if let Some(last) = self.reader.last_index_from(from).await? {
            log::debug!("chunk list {} resumes after index {}", self.reader.feed.topic, last);
            *current = Some(last);
        }
        Ok(*current)
    }

    /// Write `data` at the next index and return that index.
    pub async fn push(&self, data: &[u8]) -> Result<u64, FeedError> {
        let max = self.reader.config.max_chunk_size;
        if data.len() > max {
            return Err(FeedError::PayloadTooLarge {
                size: data.len(),
                max,
            });
        }

        let mut current = self.current_index.lock().await;
        let index = match *current {
            Some(i) => i
                .checked_add(1)
                .ok_or_else(|| FeedError::Validation("chunk list index exhausted".into()))?,
            None => 0,
        };
        let feed = self.reader.feed_at(index);
        let signature = self.signer.sign(&feed.update_digest(data))?;
        with_timeout(
            self.reader.config.request_timeout(),
            self.reader.register.set_update(&feed, data, &signature),
        )
        .await?;

        // Only advance once the register acknowledged the write
        *current = Some(index);
        Ok(index)
    }
}

/// Reads entries whose payload lives in a content store.
#[derive(Clone)]
pub struct DataListReader {
    chunks: ChunkListReader,
    store: Arc<dyn ContentStore>,
}

impl DataListReader {
    pub fn new(chunks: ChunkListReader, store: Arc<dyn ContentStore>) -> Self {
        Self { chunks, store }
    }

    async fn resolve(&self, chunk: Chunk) -> Result<Chunk, FeedError> {
        let hash = ContentHash::from_slice(&chunk.data)?;
        let fetch = self.store.download(&hash);
        let data = with_timeout(self.chunks.config.request_timeout(), fetch).await?;
        Ok(Chunk {
            index: chunk.index,
            data,
        })
    }

    pub async fn load(&self, index: u64) -> Result<Option<Chunk>, FeedError> {
        match self.chunks.load(index).await? {
            Some(chunk) => Ok(Some(self.resolve(chunk).await?)),
            None => Ok(None),
        }
    }

    pub fn forwards(&self, min: u64, max: Option<u64>) -> BoxStream<'_, Result<Chunk, FeedError>> {
        self.chunks
            .forwards(min, max)
            .then(move |chunk| async move { self.resolve(chunk?).await })
            .boxed()
    }

    pub fn backwards(&self, max: u64, min: u64) -> BoxStream<'_, Result<Chunk, FeedError>> {
        self.chunks
            .backwards(max, min)
            .then(move |chunk| async move { self.resolve(chunk?).await })
            .boxed()
    }
}

/// Appends arbitrary payloads by uploading them and listing their hashes.
pub struct DataListWriter {
    chunks: ChunkListWriter,
    store: Arc<dyn ContentStore>,
}

impl DataListWriter {
    pub fn new(chunks: ChunkListWriter, store: Arc<dyn ContentStore>) -> Self {
        Self { chunks, store }
    }

    pub fn reader(&self) -> DataListReader {
        DataListReader::new(self.chunks.reader().clone(), self.store.clone())
    }

    pub async fn discover(&self) -> Result<Option<u64>, FeedError> {
        self.chunks.discover().await
    }

    pub async fn push(&self, data: &[u8]) -> Result<u64, FeedError> {
        let config = &self.chunks.reader.config;
        if data.len() > config.max_data_size {
            return Err(FeedError::PayloadTooLarge {
                size: data.len(),
                max: config.max_data_size,
            });
        }
        let hash = with_timeout(config.request_timeout(), self.store.upload(data)).await?;
        self.chunks.push(hash.as_bytes()).await
    }
}
