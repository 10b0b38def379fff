//! Timelines: append-only chains of chapters over a feed
//!
//! Each chapter is an immutable blob in the content store that names its
//! predecessor. The feed register holds the id of the newest chapter, so a
//! reader finds the head with one register lookup and walks back from there.

pub mod chapter;
pub mod codec;
pub mod reader;
pub mod subscription;
pub mod writer;

pub use chapter::{Chapter, ChapterContent, ChapterDefaults, ChapterId, PartialChapter};
pub use codec::{CborChapterCodec, ChapterCodec, JsonChapterCodec};
pub use reader::TimelineReader;
pub use subscription::{StopFlag, Subscription};
pub use writer::{ChapterAppender, TimelineWriter};
