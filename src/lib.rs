// Feeddoc - Versioned documents on content-addressed storage and signed feeds

pub mod chunk;
pub mod config;
pub mod convergent;
pub mod document;
pub mod error;
pub mod feed;
pub mod identity;
pub mod timeline;

pub use chunk::{Chunk, ChunkListReader, ChunkListWriter, DataListReader, DataListWriter};
pub use config::FeedDocConfig;
pub use convergent::{ConvergentDocument, CrdtDocument};
pub use document::{DocSerialized, DocumentReader, DocumentSynchronizer, DocumentWriter};
pub use error::FeedError;
pub use feed::{ContentStore, FeedId, FeedRegister, OwnerAddress, Topic};
pub use identity::{FeedIdentity, FeedSigner};
pub use timeline::{
    Chapter, ChapterId, PartialChapter, Subscription, TimelineReader, TimelineWriter,
};
