//! Documents replicated over timelines
//!
//! A document's changes are published as chapters on its data feed. Readers
//! pull unseen chapters and apply them in order; writers diff their local
//! replica against what they last published and push the difference. A
//! meta feed can announce which data feed a document lives on.

mod meta;
mod reader;
mod serialized;
mod synchronizer;
mod writer;

pub use meta::{DocumentMeta, META_MEDIA_TYPE};
pub use reader::DocumentReader;
pub use serialized::DocSerialized;
pub use synchronizer::{DocumentSubscriber, DocumentSynchronizer};
pub use writer::DocumentWriter;
