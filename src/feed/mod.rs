//! Feeds and content-addressed storage
//!
//! The two external collaborators everything else is built on:
//!
//! - [`ContentStore`]: immutable blobs addressed by the SHA-256 of their bytes.
//! - [`FeedRegister`]: a mutable, single-writer register per `(owner, topic)`,
//!   holding one small signed payload per [`Epoch`].
//!
//! Both are injected as trait objects. In-memory, local-file and HTTP
//! implementations live in the submodules.

pub mod http;
pub mod local_file;
pub mod memory;

pub use http::HttpContentStore;
pub use local_file::{LocalFileContentStore, LocalFileFeedRegister};
pub use memory::{MemoryContentStore, MemoryFeedRegister};

use std::cmp::Ordering;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::FeedError;

/// Largest payload a single feed update can hold.
pub const MAX_FEED_PAYLOAD: usize = 4096;

macro_rules! hex_bytes32 {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn from_slice(bytes: &[u8]) -> Result<Self, FeedError> {
                let arr: [u8; 32] = bytes.try_into().map_err(|_| {
                    FeedError::Validation(format!(
                        "{} must be 32 bytes, got {}",
                        stringify!($name),
                        bytes.len()
                    ))
                })?;
                Ok(Self(arr))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = FeedError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let s = s.strip_prefix("0x").unwrap_or(s);
                let bytes = hex::decode(s).map_err(|e| {
                    FeedError::Validation(format!("invalid {} {:?}: {}", stringify!($name), s, e))
                })?;
                Self::from_slice(&bytes)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_bytes32!(
    /// Address of a feed owner: the owner's Ed25519 verifying key.
    OwnerAddress
);

hex_bytes32!(
    /// 32-byte feed topic.
    Topic
);

hex_bytes32!(
    /// SHA-256 of a blob's bytes.
    ContentHash
);

impl Topic {
    /// Derive a topic from a human-readable name.
    pub fn from_name(name: &str) -> Self {
        Self(Sha256::digest(name.as_bytes()).into())
    }

    /// Derive a related topic, e.g. the data feed belonging to a meta feed.
    pub fn sub_topic(&self, name: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(self.0);
        hasher.update(name.as_bytes());
        Self(hasher.finalize().into())
    }
}

impl ContentHash {
    /// Hash of `data`; this is the address a content store assigns it.
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }
}

/// An update slot of a feed.
///
/// Epochs order by `time`, then `level`. A writer that publishes twice within
/// one second stays on the same `time` and bumps `level`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Epoch {
    pub time: u64,
    pub level: u8,
}

impl Epoch {
    pub fn new(time: u64, level: u8) -> Self {
        Self { time, level }
    }

    /// The slot a writer should claim after `previous`, given the current
    /// time in seconds.
    pub fn next_after(previous: Option<Epoch>, now: u64) -> Epoch {
        match previous {
            None => Epoch::new(now, 0),
            Some(prev) if now > prev.time => Epoch::new(now, 0),
            Some(prev) => match prev.level.checked_add(1) {
                Some(level) => Epoch::new(prev.time, level),
                None => Epoch::new(prev.time + 1, 0),
            },
        }
    }
}

impl Ord for Epoch {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.time, self.level).cmp(&(other.time, other.level))
    }
}

impl PartialOrd for Epoch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Identifies one slot of a mutable register.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedId {
    pub owner: OwnerAddress,
    pub topic: Topic,
    pub epoch_time: u64,
    pub epoch_level: u8,
}

impl FeedId {
    pub fn new(owner: OwnerAddress, topic: Topic) -> Self {
        Self {
            owner,
            topic,
            epoch_time: 0,
            epoch_level: 0,
        }
    }

    pub fn epoch(&self) -> Epoch {
        Epoch::new(self.epoch_time, self.epoch_level)
    }

    /// The same feed at another epoch.
    pub fn at(&self, epoch: Epoch) -> Self {
        Self {
            owner: self.owner,
            topic: self.topic,
            epoch_time: epoch.time,
            epoch_level: epoch.level,
        }
    }

    /// Digest an owner signs to authorize writing `data` at this epoch.
    pub fn update_digest(&self, data: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.topic.0);
        hasher.update(self.owner.0);
        hasher.update(self.epoch_time.to_be_bytes());
        hasher.update([self.epoch_level]);
        hasher.update(data);
        hasher.finalize().into()
    }
}

/// The payload stored at one epoch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeedUpdate {
    pub epoch: Epoch,
    pub data: Vec<u8>,
}

impl FeedUpdate {
    /// Interpret the payload as a content hash pointer.
    pub fn content_hash(&self) -> Result<ContentHash, FeedError> {
        ContentHash::from_slice(&self.data)
    }
}

/// Content-addressed blob storage.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store `data`, returning its content hash. Identical bytes yield the
    /// same hash.
    async fn upload(&self, data: &[u8]) -> Result<ContentHash, FeedError>;

    /// Fetch a blob; an unknown hash is `FeedError::NotFound`.
    async fn download(&self, hash: &ContentHash) -> Result<Vec<u8>, FeedError>;
}

/// Mutable single-writer register keyed by owner, topic and epoch.
#[async_trait]
pub trait FeedRegister: Send + Sync {
    /// Payload at exactly `feed`'s epoch, or `None` if never written.
    async fn get_update(&self, feed: &FeedId) -> Result<Option<Vec<u8>>, FeedError>;

    /// Payload at the highest epoch written for `(owner, topic)`.
    async fn get_latest(
        &self,
        owner: &OwnerAddress,
        topic: &Topic,
    ) -> Result<Option<FeedUpdate>, FeedError>;

    /// Write `data` at `feed`'s epoch. `signature` must be the owner's
    /// signature over [`FeedId::update_digest`].
    async fn set_update(&self, feed: &FeedId, data: &[u8], signature: &[u8])
        -> Result<(), FeedError>;

    /// Latest payload read as a content hash pointer.
    async fn get_current_hash(
        &self,
        owner: &OwnerAddress,
        topic: &Topic,
    ) -> Result<Option<(Epoch, ContentHash)>, FeedError> {
        match self.get_latest(owner, topic).await? {
            Some(update) => Ok(Some((update.epoch, update.content_hash()?))),
            None => Ok(None),
        }
    }

    async fn set_current_hash(
        &self,
        feed: &FeedId,
        hash: &ContentHash,
        signature: &[u8],
    ) -> Result<(), FeedError> {
        self.set_update(feed, hash.as_bytes(), signature).await
    }
}

/// Where to get a content store from, resolved once at construction.
pub enum ContentStoreSource {
    Client(Arc<dyn ContentStore>),
    Http { url: String },
    LocalDir { path: PathBuf },
    Memory,
}

impl ContentStoreSource {
    pub fn resolve(self) -> Result<Arc<dyn ContentStore>, FeedError> {
        Ok(match self {
            ContentStoreSource::Client(store) => store,
            ContentStoreSource::Http { url } => Arc::new(HttpContentStore::new(&url)?),
            ContentStoreSource::LocalDir { path } => Arc::new(LocalFileContentStore::new(path)?),
            ContentStoreSource::Memory => Arc::new(MemoryContentStore::new()),
        })
    }
}

impl From<Arc<dyn ContentStore>> for ContentStoreSource {
    fn from(store: Arc<dyn ContentStore>) -> Self {
        ContentStoreSource::Client(store)
    }
}

/// Where to get a feed register from, resolved once at construction.
pub enum FeedRegisterSource {
    Client(Arc<dyn FeedRegister>),
    LocalDir { path: PathBuf },
    Memory,
}

impl FeedRegisterSource {
    pub fn resolve(self) -> Result<Arc<dyn FeedRegister>, FeedError> {
        Ok(match self {
            FeedRegisterSource::Client(register) => register,
            FeedRegisterSource::LocalDir { path } => Arc::new(LocalFileFeedRegister::new(path)?),
            FeedRegisterSource::Memory => Arc::new(MemoryFeedRegister::new()),
        })
    }
}

impl From<Arc<dyn FeedRegister>> for FeedRegisterSource {
    fn from(register: Arc<dyn FeedRegister>) -> Self {
        FeedRegisterSource::Client(register)
    }
}

/// Run `fut`, failing with `FeedError::Timeout` if it outlives `timeout`.
pub(crate) async fn with_timeout<T, F>(timeout: Option<Duration>, fut: F) -> Result<T, FeedError>
where
    F: Future<Output = Result<T, FeedError>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| FeedError::Timeout(limit.as_millis() as u64))?,
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::FeedSigner;

    #[test]
    fn test_epoch_next_after() {
        assert_eq!(Epoch::next_after(None, 100), Epoch::new(100, 0));
        assert_eq!(Epoch::next_after(Some(Epoch::new(90, 3)), 100), Epoch::new(100, 0));
        assert_eq!(Epoch::next_after(Some(Epoch::new(100, 0)), 100), Epoch::new(100, 1));
        // Clock went backwards: keep moving forward
        assert_eq!(Epoch::next_after(Some(Epoch::new(100, 4)), 99), Epoch::new(100, 5));
        assert_eq!(Epoch::next_after(Some(Epoch::new(100, 255)), 100), Epoch::new(101, 0));
    }

    #[test]
    fn test_epoch_ordering() {
        assert!(Epoch::new(5, 0) < Epoch::new(5, 1));
        assert!(Epoch::new(5, 9) < Epoch::new(6, 0));
    }

    #[test]
    fn test_hex_round_trip() {
        let hash = ContentHash::of(b"hello");
        let parsed: ContentHash = hash.to_hex().parse().unwrap();
        assert_eq!(hash, parsed);
        let prefixed: ContentHash = format!("0x{}", hash).parse().unwrap();
        assert_eq!(hash, prefixed);

        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash.to_hex()));

        assert!("abcd".parse::<ContentHash>().is_err());
        assert!("zz".parse::<Topic>().is_err());
    }

    #[test]
    fn test_update_digest_binds_epoch_and_data() {
        let feed = FeedId::new(OwnerAddress([1; 32]), Topic::from_name("notes"));
        let a = feed.at(Epoch::new(10, 0)).update_digest(b"data");
        let b = feed.at(Epoch::new(10, 1)).update_digest(b"data");
        let c = feed.at(Epoch::new(10, 0)).update_digest(b"other");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_feed_id_json_shape() {
        let feed = FeedId::new(OwnerAddress([2; 32]), Topic::from_name("doc")).at(Epoch::new(7, 1));
        let value = serde_json::to_value(&feed).unwrap();
        assert_eq!(value["epochTime"], 7);
        assert_eq!(value["epochLevel"], 1);
        let back: FeedId = serde_json::from_value(value).unwrap();
        assert_eq!(back, feed);
    }

    #[tokio::test]
    async fn test_sources_resolve_to_working_backends() {
        let dir = tempfile::tempdir().unwrap();
        let identity = crate::identity::FeedIdentity::generate();
        let slot = FeedId::new(identity.owner(), Topic::from_name("src")).at(Epoch::new(1, 0));
        let signature = crate::identity::FeedSigner::sign(&identity, &slot.update_digest(b"p"))
            .unwrap();

        let registers = [
            FeedRegisterSource::Memory,
            FeedRegisterSource::LocalDir {
                path: dir.path().join("feeds"),
            },
        ];
        for source in registers {
            let register = source.resolve().unwrap();
            register.set_update(&slot, b"p", &signature).await.unwrap();
            let latest = register.get_latest(&slot.owner, &slot.topic).await.unwrap();
            assert_eq!(latest.map(|update| update.data), Some(b"p".to_vec()));
        }

        let stores = [
            ContentStoreSource::Memory,
            ContentStoreSource::LocalDir {
                path: dir.path().join("blobs"),
            },
        ];
        for source in stores {
            let store = source.resolve().unwrap();
            let hash = store.upload(b"blob").await.unwrap();
            assert_eq!(hash, ContentHash::of(b"blob"));
            assert_eq!(store.download(&hash).await.unwrap(), b"blob");
        }
    }

    #[test]
    fn test_sub_topic_is_distinct() {
        let meta = Topic::from_name("doc");
        assert_ne!(meta.sub_topic("data"), meta);
        assert_eq!(meta.sub_topic("data"), meta.sub_topic("data"));
    }
}
