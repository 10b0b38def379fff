//! Convergent documents
//!
//! [`CrdtDocument`] is the seam between the document layer and whatever CRDT
//! engine backs it. The document layer only moves opaque change sets
//! around; [`ConvergentDocument`] is the engine shipped with this crate.

mod document;
mod horizon;
mod operation;

pub use document::{ConvergentDocument, DocumentState, ItemState};
pub use horizon::{DeviceId, Horizon, SeqNum};
pub use operation::{Change, ChangeId, ItemId, Operation, Value};

use crate::error::FeedError;
use crate::timeline::ChapterContent;

/// Operations the document layer needs from a CRDT engine.
pub trait CrdtDocument: Clone + Send + Sync + 'static {
    /// A batch of changes, published as one chapter.
    type Changes: ChapterContent;

    /// Summary of which changes a document holds. Equal heads mean equal
    /// documents.
    type Heads: PartialEq + Clone + Send + Sync;

    fn heads(&self) -> Self::Heads;

    /// Changes in `self` that `since` does not have. `None` means all of
    /// them.
    fn diff(&self, since: Option<&Self>) -> Self::Changes;

    fn changes_are_empty(changes: &Self::Changes) -> bool;

    /// Apply changes from another replica. Applying changes already held
    /// is a no-op.
    fn apply_changes(&mut self, changes: Self::Changes) -> Result<(), FeedError>;

    fn merge(&mut self, other: &Self) -> Result<(), FeedError>;

    fn save(&self) -> Result<Vec<u8>, FeedError>;

    fn load(bytes: &[u8]) -> Result<Self, FeedError>;
}
