//! In-process content store and feed register
//!
//! Used for tests and for embedding several readers and writers in one
//! process. Both count the requests they serve so callers can assert that an
//! operation stayed local.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use super::{
    ContentHash, ContentStore, Epoch, FeedId, FeedRegister, FeedUpdate, OwnerAddress, Topic,
};
use crate::error::FeedError;
use crate::identity::verify_signature;

/// Blob store backed by a `HashMap`.
#[derive(Default)]
pub struct MemoryContentStore {
    blobs: RwLock<HashMap<ContentHash, Vec<u8>>>,
    uploads: AtomicUsize,
    downloads: AtomicUsize,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn upload(&self, data: &[u8]) -> Result<ContentHash, FeedError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        let hash = ContentHash::of(data);
        self.blobs
            .write()
            .map_err(|e| FeedError::Persistence(format!("blob map lock poisoned: {e}")))?
            .entry(hash)
            .or_insert_with(|| data.to_vec());
        Ok(hash)
    }

    async fn download(&self, hash: &ContentHash) -> Result<Vec<u8>, FeedError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.blobs
            .read()
            .map_err(|e| FeedError::Persistence(format!("blob map lock poisoned: {e}")))?
            .get(hash)
            .cloned()
            .ok_or_else(|| FeedError::NotFound(format!("blob {}", hash)))
    }
}

type FeedKey = (OwnerAddress, Topic);

/// Feed register backed by a map of epoch-ordered updates per feed.
///
/// Writes must be signed by the feed owner, and an epoch can be written only
/// once.
#[derive(Default)]
pub struct MemoryFeedRegister {
    feeds: RwLock<HashMap<FeedKey, BTreeMap<Epoch, Vec<u8>>>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryFeedRegister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Total requests served.
    pub fn request_count(&self) -> usize {
        self.read_count() + self.write_count()
    }
}

#[async_trait]
impl FeedRegister for MemoryFeedRegister {
    async fn get_update(&self, feed: &FeedId) -> Result<Option<Vec<u8>>, FeedError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let feeds = self
            .feeds
            .read()
            .map_err(|e| FeedError::Persistence(format!("feed map lock poisoned: {e}")))?;
        Ok(feeds
            .get(&(feed.owner, feed.topic))
            .and_then(|updates| updates.get(&feed.epoch()))
            .cloned())
    }

    async fn get_latest(
        &self,
        owner: &OwnerAddress,
        topic: &Topic,
    ) -> Result<Option<FeedUpdate>, FeedError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let feeds = self
            .feeds
            .read()
            .map_err(|e| FeedError::Persistence(format!("feed map lock poisoned: {e}")))?;
        Ok(feeds
            .get(&(*owner, *topic))
            .and_then(|updates| updates.iter().next_back())
            .map(|(epoch, data)| FeedUpdate {
                epoch: *epoch,
                data: data.clone(),
            }))
    }

    async fn set_update(
        &self,
        feed: &FeedId,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), FeedError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if data.len() > super::MAX_FEED_PAYLOAD {
            return Err(FeedError::PayloadTooLarge {
                size: data.len(),
                max: super::MAX_FEED_PAYLOAD,
            });
        }
        verify_signature(&feed.owner, &feed.update_digest(data), signature)?;

        let mut feeds = self
            .feeds
            .write()
            .map_err(|e| FeedError::Persistence(format!("feed map lock poisoned: {e}")))?;
        let updates = feeds.entry((feed.owner, feed.topic)).or_default();
        if updates.contains_key(&feed.epoch()) {
            return Err(FeedError::Transport {
                status: Some(409),
                message: format!(
                    "epoch {}/{} of feed {} already written",
                    feed.epoch_time, feed.epoch_level, feed.topic
                ),
            });
        }
        updates.insert(feed.epoch(), data.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{FeedIdentity, FeedSigner};

    fn signed_write(identity: &FeedIdentity, feed: &FeedId, data: &[u8]) -> Vec<u8> {
        identity.sign(&feed.update_digest(data)).unwrap()
    }

    #[tokio::test]
    async fn test_upload_is_deterministic() {
        let store = MemoryContentStore::new();
        let a = store.upload(b"chapter bytes").await.unwrap();
        let b = store.upload(b"chapter bytes").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
        assert_eq!(store.download(&a).await.unwrap(), b"chapter bytes");
    }

    #[tokio::test]
    async fn test_download_unknown_is_not_found() {
        let store = MemoryContentStore::new();
        let err = store.download(&ContentHash::of(b"missing")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_latest_follows_highest_epoch() {
        let identity = FeedIdentity::generate();
        let register = MemoryFeedRegister::new();
        let feed = FeedId::new(identity.owner(), Topic::from_name("t"));

        assert!(register.get_latest(&feed.owner, &feed.topic).await.unwrap().is_none());

        let writes = [
            (Epoch::new(5, 0), b"a"),
            (Epoch::new(5, 1), b"b"),
            (Epoch::new(3, 0), b"c"),
        ];
        for (epoch, data) in writes {
            let slot = feed.at(epoch);
            let sig = signed_write(&identity, &slot, data);
            register.set_update(&slot, data, &sig).await.unwrap();
        }

        let latest = register.get_latest(&feed.owner, &feed.topic).await.unwrap().unwrap();
        assert_eq!(latest.epoch, Epoch::new(5, 1));
        assert_eq!(latest.data, b"b");
        assert_eq!(
            register.get_update(&feed.at(Epoch::new(3, 0))).await.unwrap(),
            Some(b"c".to_vec())
        );
    }

    #[tokio::test]
    async fn test_rejects_bad_signature_and_reused_epoch() {
        let owner = FeedIdentity::generate();
        let intruder = FeedIdentity::generate();
        let register = MemoryFeedRegister::new();
        let slot = FeedId::new(owner.owner(), Topic::from_name("t")).at(Epoch::new(1, 0));

        let forged = signed_write(&intruder, &slot, b"x");
        assert!(matches!(
            register.set_update(&slot, b"x", &forged).await,
            Err(FeedError::Signature(_))
        ));

        let sig = signed_write(&owner, &slot, b"x");
        register.set_update(&slot, b"x", &sig).await.unwrap();
        let sig = signed_write(&owner, &slot, b"y");
        assert!(matches!(
            register.set_update(&slot, b"y", &sig).await,
            Err(FeedError::Transport { status: Some(409), .. })
        ));
    }
}
