use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{
    ContentHash, ContentStore, Epoch, FeedId, FeedRegister, FeedUpdate, OwnerAddress, Topic,
};
use crate::error::FeedError;
use crate::identity::verify_signature;

fn ensure_dir(path: &Path) -> Result<(), FeedError> {
    if !path.exists() {
        fs::create_dir_all(path).map_err(|e| {
            FeedError::Persistence(format!("Failed to create directory {}: {}", path.display(), e))
        })?;
    }
    Ok(())
}

/// A content store that keeps each blob in `<base_dir>/<hash>`.
pub struct LocalFileContentStore {
    base_dir: PathBuf,
}

impl LocalFileContentStore {
    /// Create a store rooted at `base_dir`, creating the directory if needed
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Result<Self, FeedError> {
        let path = PathBuf::from(base_dir.as_ref());
        ensure_dir(&path)?;
        Ok(Self { base_dir: path })
    }

    fn blob_path(&self, hash: &ContentHash) -> PathBuf {
        self.base_dir.join(hash.to_hex())
    }
}

#[async_trait]
impl ContentStore for LocalFileContentStore {
    async fn upload(&self, data: &[u8]) -> Result<ContentHash, FeedError> {
        let hash = ContentHash::of(data);
        let path = self.blob_path(&hash);
        if path.exists() {
            return Ok(hash);
        }

        // Write then rename so a reader never sees a partial blob
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| FeedError::Persistence(format!("Failed to write blob: {}", e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| FeedError::Persistence(format!("Failed to store blob: {}", e)))?;
        Ok(hash)
    }

    async fn download(&self, hash: &ContentHash) -> Result<Vec<u8>, FeedError> {
        match tokio::fs::read(self.blob_path(hash)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(FeedError::NotFound(format!("blob {}", hash)))
            }
            Err(e) => Err(FeedError::Persistence(format!("Failed to read blob: {}", e))),
        }
    }
}

/// A feed register laid out as `<base_dir>/<owner>/<topic>/<time>-<level>`.
pub struct LocalFileFeedRegister {
    base_dir: PathBuf,
}

impl LocalFileFeedRegister {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Result<Self, FeedError> {
        let path = PathBuf::from(base_dir.as_ref());
        ensure_dir(&path)?;
        Ok(Self { base_dir: path })
    }

    fn feed_dir(&self, owner: &OwnerAddress, topic: &Topic) -> PathBuf {
        self.base_dir.join(owner.to_hex()).join(topic.to_hex())
    }

    fn update_path(&self, feed: &FeedId) -> PathBuf {
        self.feed_dir(&feed.owner, &feed.topic)
            .join(format!("{}-{}", feed.epoch_time, feed.epoch_level))
    }

    fn parse_epoch(name: &str) -> Option<Epoch> {
        let (time, level) = name.split_once('-')?;
        Some(Epoch::new(time.parse().ok()?, level.parse().ok()?))
    }
}

#[async_trait]
impl FeedRegister for LocalFileFeedRegister {
    async fn get_update(&self, feed: &FeedId) -> Result<Option<Vec<u8>>, FeedError> {
        match tokio::fs::read(self.update_path(feed)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FeedError::Persistence(format!("Failed to read feed update: {}", e))),
        }
    }

    async fn get_latest(
        &self,
        owner: &OwnerAddress,
        topic: &Topic,
    ) -> Result<Option<FeedUpdate>, FeedError> {
        let dir = self.feed_dir(owner, topic);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(FeedError::Persistence(format!("Failed to list feed: {}", e)));
            }
        };

        let mut latest: Option<(Epoch, PathBuf)> = None;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| FeedError::Persistence(format!("Failed to list feed: {}", e)))?
        {
            let name = entry.file_name();
            let Some(epoch) = name.to_str().and_then(Self::parse_epoch) else {
                continue;
            };
            if latest.as_ref().map_or(true, |(best, _)| epoch > *best) {
                latest = Some((epoch, entry.path()));
            }
        }

        match latest {
            Some((epoch, path)) => {
                let data = tokio::fs::read(&path).await.map_err(|e| {
                    FeedError::Persistence(format!("Failed to read feed update: {}", e))
                })?;
                Ok(Some(FeedUpdate { epoch, data }))
            }
            None => Ok(None),
        }
    }

    async fn set_update(
        &self,
        feed: &FeedId,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), FeedError> {
        if data.len() > super::MAX_FEED_PAYLOAD {
            return Err(FeedError::PayloadTooLarge {
                size: data.len(),
                max: super::MAX_FEED_PAYLOAD,
            });
        }
        verify_signature(&feed.owner, &feed.update_digest(data), signature)?;

        ensure_dir(&self.feed_dir(&feed.owner, &feed.topic))?;
        let path = self.update_path(feed);
        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(FeedError::Transport {
                    status: Some(409),
                    message: format!(
                        "epoch {}/{} of feed {} already written",
                        feed.epoch_time, feed.epoch_level, feed.topic
                    ),
                });
            }
            Err(e) => {
                return Err(FeedError::Persistence(format!("Failed to create feed update: {}", e)));
            }
        };

        use tokio::io::AsyncWriteExt;
        file.write_all(data)
            .await
            .map_err(|e| FeedError::Persistence(format!("Failed to write feed update: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| FeedError::Persistence(format!("Failed to write feed update: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{FeedIdentity, FeedSigner};

    #[tokio::test]
    async fn test_blob_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileContentStore::new(dir.path().join("blobs")).unwrap();

        let hash = store.upload(b"persisted").await.unwrap();
        assert_eq!(hash, store.upload(b"persisted").await.unwrap());
        assert_eq!(store.download(&hash).await.unwrap(), b"persisted");

        let missing = store.download(&ContentHash::of(b"nope")).await.unwrap_err();
        assert!(missing.is_not_found());
    }

    #[tokio::test]
    async fn test_register_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let identity = FeedIdentity::generate();
        let feed = FeedId::new(identity.owner(), Topic::from_name("disk"));

        {
            let register = LocalFileFeedRegister::new(dir.path()).unwrap();
            for (epoch, data) in [(Epoch::new(9, 0), b"old"), (Epoch::new(10, 2), b"new")] {
                let slot = feed.at(epoch);
                let sig = identity.sign(&slot.update_digest(data)).unwrap();
                register.set_update(&slot, data, &sig).await.unwrap();
            }
        }

        let register = LocalFileFeedRegister::new(dir.path()).unwrap();
        let latest = register.get_latest(&feed.owner, &feed.topic).await.unwrap().unwrap();
        assert_eq!(latest.epoch, Epoch::new(10, 2));
        assert_eq!(latest.data, b"new");
        assert!(register.get_update(&feed.at(Epoch::new(11, 0))).await.unwrap().is_none());
        assert!(register
            .get_latest(&feed.owner, &Topic::from_name("other"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_epoch_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let identity = FeedIdentity::generate();
        let register = LocalFileFeedRegister::new(dir.path()).unwrap();
        let slot = FeedId::new(identity.owner(), Topic::from_name("t")).at(Epoch::new(1, 0));

        let sig = identity.sign(&slot.update_digest(b"a")).unwrap();
        register.set_update(&slot, b"a", &sig).await.unwrap();
        let sig = identity.sign(&slot.update_digest(b"b")).unwrap();
        assert!(register.set_update(&slot, b"b", &sig).await.is_err());
        assert_eq!(register.get_update(&slot).await.unwrap(), Some(b"a".to_vec()));
    }
}
