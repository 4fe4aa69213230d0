//! Versioned-file store interface consumed by the annotator.

use super::graph::KnownGraph;
use super::{Key, Line, ParentMap};
use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};
use std::cell::Cell;
use std::collections::HashMap;

/// Requested ordering of a record stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOrder {
    /// Parents before children.
    Topological,
    Unordered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordContent {
    Present(Vec<Line>),
    /// Requested but not stored.
    Absent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Key,
    pub content: RecordContent,
}

impl Record {
    pub fn is_absent(&self) -> bool {
        matches!(self.content, RecordContent::Absent)
    }
}

pub type RecordStream<'a> = Box<dyn Iterator<Item = Record> + 'a>;

pub trait VersionedFileStore {
    /// Parents for each known key. Unknown keys are simply left out.
    fn get_parent_map(&self, keys: &[Key]) -> Result<ParentMap>;

    /// Texts for `keys`. With `allow_absent`, missing keys come back as
    /// `RecordContent::Absent` instead of failing the call.
    fn get_record_stream(
        &self,
        keys: &[Key],
        order: StreamOrder,
        allow_absent: bool,
    ) -> Result<RecordStream<'_>>;
}

/// Split text into lines, each keeping its `\n`. A trailing fragment without
/// a terminator is kept as the last line.
pub fn split_lines(text: &Bytes) -> Vec<Line> {
    let mut lines = Vec::new();
    let mut start = 0;
    for (i, byte) in text.iter().enumerate() {
        if *byte == b'\n' {
            lines.push(text.slice(start..=i));
            start = i + 1;
        }
    }
    if start < text.len() {
        lines.push(text.slice(start..));
    }
    lines
}

/// Re-chunk arbitrary byte chunks into lines.
pub fn chunks_to_lines(chunks: &[Bytes]) -> Vec<Line> {
    // already line-shaped chunks are passed through untouched
    let line_shaped = chunks.iter().enumerate().all(|(i, chunk)| {
        let newlines = chunk.iter().filter(|b| **b == b'\n').count();
        let is_last = i + 1 == chunks.len();
        !chunk.is_empty()
            && (newlines == 1 && chunk.ends_with(b"\n") || is_last && newlines == 0)
    });
    if line_shaped {
        return chunks.to_vec();
    }
    let mut joined = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
    for chunk in chunks {
        joined.extend_from_slice(chunk);
    }
    split_lines(&joined.freeze())
}

/// Store kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    texts: HashMap<Key, (Vec<Key>, Vec<Line>)>,
    parent_map_calls: Cell<usize>,
    record_stream_calls: Cell<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_lines(&mut self, key: Key, parents: Vec<Key>, lines: Vec<Line>) {
        self.texts.insert(key, (parents, lines));
    }

    pub fn add_text(&mut self, key: Key, parents: Vec<Key>, text: impl Into<Bytes>) {
        let lines = split_lines(&text.into());
        self.add_lines(key, parents, lines);
    }

    pub fn len(&self) -> usize {
        self.texts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }

    /// Number of `get_parent_map` calls served so far.
    pub fn parent_map_calls(&self) -> usize {
        self.parent_map_calls.get()
    }

    pub fn record_stream_calls(&self) -> usize {
        self.record_stream_calls.get()
    }
}

impl VersionedFileStore for MemoryStore {
    fn get_parent_map(&self, keys: &[Key]) -> Result<ParentMap> {
        self.parent_map_calls.set(self.parent_map_calls.get() + 1);
        Ok(keys
            .iter()
            .filter_map(|key| {
                self.texts
                    .get(key)
                    .map(|(parents, _)| (key.clone(), parents.clone()))
            })
            .collect())
    }

    fn get_record_stream(
        &self,
        keys: &[Key],
        order: StreamOrder,
        allow_absent: bool,
    ) -> Result<RecordStream<'_>> {
        self.record_stream_calls
            .set(self.record_stream_calls.get() + 1);

        let mut absent = Vec::new();
        let mut present: ParentMap = HashMap::new();
        for key in keys {
            match self.texts.get(key) {
                Some((parents, _)) => {
                    present.insert(key.clone(), parents.clone());
                }
                None if allow_absent => absent.push(key.clone()),
                None => return Err(Error::NotFound { key: key.clone() }),
            }
        }

        let ordered: Vec<Key> = match order {
            StreamOrder::Topological => KnownGraph::new(&present)
                .topo_sort()?
                .into_iter()
                .filter(|key| present.contains_key(key))
                .collect(),
            StreamOrder::Unordered => keys
                .iter()
                .filter(|key| present.contains_key(*key))
                .cloned()
                .collect(),
        };

        let absent = absent.into_iter().map(|key| Record {
            key,
            content: RecordContent::Absent,
        });
        let present = ordered.into_iter().map(move |key| {
            let lines = self
                .texts
                .get(&key)
                .map(|(_, lines)| lines.clone())
                .unwrap_or_default();
            Record {
                key,
                content: RecordContent::Present(lines),
            }
        });
        Ok(Box::new(absent.chain(present)))
    }
}
