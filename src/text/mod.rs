//! Line-level text engine: patience matching, annotation and merging.
//!
//! # Architecture
//!
//! ```text
//! VersionedFileStore --records--> Annotator --(annotations, lines)--> caller
//!                                    |
//!                           patience::matching_blocks
//!                                    |
//!                  reannotate / Merge3 (stateless transforms)
//! ```
//!
//! Nothing here does I/O beyond what the supplied store does.

pub mod annotator;
pub mod graph;
pub mod merge3;
pub mod patience;
pub mod progress;
pub mod reannotate;
pub mod store;

use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

pub use annotator::{annotation_of, Annotator};
pub use graph::{history_change, iter_lefthand_ancestry, KnownGraph};
pub use merge3::{ConflictStyle, Merge3, MergeOptions, MergeRegion, MergedText, SyncRegion};
pub use patience::{matching_blocks, opcodes, unified_diff, MatchingBlock, OpCode, OpTag};
pub use progress::{IndicatifProgress, ProgressReporter};
pub use reannotate::{reannotate, Reannotated};
pub use store::{
    chunks_to_lines, split_lines, MemoryStore, Record, RecordContent, RecordStream, StreamOrder,
    VersionedFileStore,
};

/// One line of text including its terminator. Content is never interpreted.
pub type Line = Bytes;

/// Per-line provenance: a sorted, non-empty set of keys.
pub type Annotation = Arc<[Key]>;

/// Parent lists keyed by text. An empty list marks a root.
pub type ParentMap = std::collections::HashMap<Key, Vec<Key>>;

/// Identifies one versioned text, conventionally `(file_id, revision_id)`.
///
/// Ordering and equality are tuple comparison over the components.
/// Serializes as the list of components.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Key(Arc<[String]>);

impl Key {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Key(parts.into_iter().map(Into::into).collect())
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }

    /// Last component, usually the revision id.
    pub fn revision(&self) -> &str {
        self.0.last().map(String::as_str).unwrap_or("")
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::new([s])
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::new([s])
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(":"))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Key").field(&&*self.0).finish()
    }
}

/// Build a single-origin annotation.
pub fn single_annotation(key: &Key) -> Annotation {
    Arc::from(vec![key.clone()])
}
