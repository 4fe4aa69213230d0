//! Per-line provenance over a revision graph.
//!
//! An [`Annotator`] walks the ancestry of the requested text, fetches every
//! text it still needs in one topological record stream, and annotates each
//! one against its parents as it arrives. Texts and annotations are
//! refcounted by the number of children still waiting on them and dropped
//! the moment that count reaches zero, so memory stays bounded by the width
//! of the graph rather than its length.

use super::graph::KnownGraph;
use super::patience::matching_blocks;
use super::progress::ProgressReporter;
use super::store::{split_lines, RecordContent, StreamOrder, VersionedFileStore};
use super::{single_annotation, Annotation, Key, Line, ParentMap};
use crate::error::{Error, Result};
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

pub struct Annotator<'a> {
    store: &'a dyn VersionedFileStore,
    parent_map: ParentMap,
    text_cache: HashMap<Key, Vec<Line>>,
    annotations_cache: HashMap<Key, Vec<Annotation>>,
    num_needed_children: HashMap<Key, usize>,
    special_texts: HashMap<Key, Vec<Line>>,
    heads_provider: Option<KnownGraph>,
    /// The last key annotated. It holds one reference of its own, released
    /// when the next annotation succeeds.
    resident: Option<Key>,
}

impl<'a> Annotator<'a> {
    pub fn new(store: &'a dyn VersionedFileStore) -> Self {
        Self {
            store,
            parent_map: ParentMap::new(),
            text_cache: HashMap::new(),
            annotations_cache: HashMap::new(),
            num_needed_children: HashMap::new(),
            special_texts: HashMap::new(),
            heads_provider: None,
            resident: None,
        }
    }

    /// Make `text` annotatable as `key` without it being in the store, e.g.
    /// uncommitted working-tree content.
    pub fn add_special_text(&mut self, key: Key, parent_keys: Vec<Key>, text: impl Into<Bytes>) {
        let lines = split_lines(&text.into());
        self.parent_map.insert(key.clone(), parent_keys);
        self.text_cache.insert(key.clone(), lines.clone());
        self.annotations_cache.remove(&key);
        self.special_texts.insert(key, lines);
        self.heads_provider = None;
    }

    pub fn annotate(&mut self, key: &Key) -> Result<(Vec<Annotation>, Vec<Line>)> {
        self.annotate_with_progress(key, None)
    }

    /// Annotations and lines of `key`, one annotation per line.
    pub fn annotate_with_progress(
        &mut self,
        key: &Key,
        progress: Option<&mut dyn ProgressReporter>,
    ) -> Result<(Vec<Annotation>, Vec<Line>)> {
        if let Some(result) = self.cached(key) {
            return Ok(result);
        }

        let counts_before = self.num_needed_children.clone();
        let result = self.annotate_uncached(key, progress);
        match &result {
            Ok(_) => {
                if let Some(previous) = self.resident.replace(key.clone()) {
                    self.release(&previous);
                }
            }
            Err(e) => {
                // forget the references taken for the failed walk
                debug!(key = %key, error = %e, "annotation failed");
                self.num_needed_children = counts_before;
                let tracked = &self.num_needed_children;
                self.text_cache.retain(|k, _| tracked.contains_key(k));
                self.annotations_cache.retain(|k, _| tracked.contains_key(k));
            }
        }
        result
    }

    fn annotate_uncached(
        &mut self,
        key: &Key,
        mut progress: Option<&mut dyn ProgressReporter>,
    ) -> Result<(Vec<Annotation>, Vec<Line>)> {
        let (vf_keys, special_keys) = self.get_needed_keys(key)?;
        debug!(
            key = %key,
            fetch = vf_keys.len(),
            special = special_keys.len(),
            "annotating"
        );

        let total = vf_keys.len() as u64;
        if let Some(p) = progress.as_deref_mut() {
            p.update("getting stream", 0, total);
        }
        if !vf_keys.is_empty() {
            let store = self.store;
            let stream = store.get_record_stream(&vf_keys, StreamOrder::Topological, true)?;
            for (idx, record) in stream.enumerate() {
                if let Some(p) = progress.as_deref_mut() {
                    p.update("extracting", idx as u64 + 1, total);
                }
                let lines = match record.content {
                    RecordContent::Present(lines) => lines,
                    RecordContent::Absent => return Err(Error::NotFound { key: record.key }),
                };
                self.text_cache.insert(record.key.clone(), lines);
                self.annotate_one(&record.key)?;
            }
        }
        for special in special_keys {
            self.annotate_one(&special)?;
        }
        if let Some(p) = progress {
            p.finished();
        }

        self.cached(key)
            .ok_or_else(|| Error::NotFound { key: key.clone() })
    }

    /// Like [`annotate`](Self::annotate) but with a single origin per line.
    ///
    /// Ambiguous lines resolve to the head of their origins, or to the
    /// smallest head when the origins are concurrent.
    pub fn annotate_flat(&mut self, key: &Key) -> Result<Vec<(Key, Line)>> {
        let (annotations, lines) = self.annotate(key)?;
        let graph = self
            .heads_provider
            .get_or_insert_with(|| KnownGraph::new(&self.parent_map));
        let mut out = Vec::with_capacity(lines.len());
        for (annotation, line) in annotations.iter().zip(lines) {
            let head = if annotation.len() == 1 {
                annotation[0].clone()
            } else {
                let heads = graph.heads(annotation.iter())?;
                // concurrent heads: the smallest key wins
                heads
                    .into_iter()
                    .next()
                    .unwrap_or_else(|| annotation[0].clone())
            };
            out.push((head, line));
        }
        Ok(out)
    }

    fn cached(&self, key: &Key) -> Option<(Vec<Annotation>, Vec<Line>)> {
        let annotations = self.annotations_cache.get(key)?;
        let lines = self.text_cache.get(key)?;
        Some((annotations.clone(), lines.clone()))
    }

    /// Breadth-first ancestry walk from `key`, one parent lookup per
    /// frontier. Returns (texts to fetch from the store, special texts to
    /// annotate afterwards in topological order).
    fn get_needed_keys(&mut self, key: &Key) -> Result<(Vec<Key>, Vec<Key>)> {
        *self.num_needed_children.entry(key.clone()).or_insert(0) += 1;

        let mut seen: HashSet<Key> = HashSet::from([key.clone()]);
        let mut frontier = vec![key.clone()];
        let mut vf_keys = Vec::new();
        let mut special_keys = Vec::new();

        while !frontier.is_empty() {
            let unknown: Vec<Key> = frontier
                .iter()
                .filter(|k| !self.parent_map.contains_key(*k))
                .cloned()
                .collect();
            if !unknown.is_empty() {
                let found = self.store.get_parent_map(&unknown)?;
                if !found.is_empty() {
                    self.heads_provider = None;
                }
                self.parent_map.extend(found);
            }

            let mut next = Vec::new();
            for k in frontier {
                if self.annotations_cache.contains_key(&k) && self.text_cache.contains_key(&k) {
                    continue;
                }
                if let Some(lines) = self.special_texts.get(&k) {
                    self.text_cache
                        .entry(k.clone())
                        .or_insert_with(|| lines.clone());
                    special_keys.push(k.clone());
                } else {
                    // absent keys are reported by the record stream
                    vf_keys.push(k.clone());
                }
                let Some(parents) = self.parent_map.get(&k) else {
                    continue;
                };
                for parent in parents {
                    *self.num_needed_children.entry(parent.clone()).or_insert(0) += 1;
                    if seen.insert(parent.clone()) {
                        next.push(parent.clone());
                    }
                }
            }
            frontier = next;
        }

        if special_keys.len() > 1 {
            let subset: ParentMap = special_keys
                .iter()
                .map(|k| (k.clone(), self.parent_map.get(k).cloned().unwrap_or_default()))
                .collect();
            let wanted: HashSet<Key> = special_keys.into_iter().collect();
            special_keys = KnownGraph::new(&subset)
                .topo_sort()?
                .into_iter()
                .filter(|k| wanted.contains(k))
                .collect();
        }
        Ok((vf_keys, special_keys))
    }

    fn annotate_one(&mut self, key: &Key) -> Result<()> {
        let parents = self.parent_map.get(key).cloned().unwrap_or_default();
        let annotations = {
            let lines = self
                .text_cache
                .get(key)
                .ok_or_else(|| Error::NotFound { key: key.clone() })?;
            let this = single_annotation(key);
            let mut annotations = vec![this.clone(); lines.len()];

            for (idx, parent) in parents.iter().enumerate() {
                let (Some(parent_lines), Some(parent_annotations)) = (
                    self.text_cache.get(parent),
                    self.annotations_cache.get(parent),
                ) else {
                    return Err(Error::NotFound {
                        key: parent.clone(),
                    });
                };
                let blocks = matching_blocks(parent_lines, lines);
                if idx == 0 {
                    for block in &blocks {
                        annotations[block.b..block.b + block.len]
                            .clone_from_slice(&parent_annotations[block.a..block.a + block.len]);
                    }
                } else {
                    update_from_other_parent(&mut annotations, parent_annotations, &blocks, &this);
                }
            }
            annotations
        };
        self.record_annotation(key, &parents, annotations);
        Ok(())
    }

    fn record_annotation(&mut self, key: &Key, parents: &[Key], annotations: Vec<Annotation>) {
        self.annotations_cache.insert(key.clone(), annotations);
        for parent in parents {
            self.release(parent);
        }
    }

    /// Drop one reference to `key`, evicting it at zero.
    fn release(&mut self, key: &Key) {
        let Some(count) = self.num_needed_children.get_mut(key) else {
            return;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.num_needed_children.remove(key);
            self.text_cache.remove(key);
            self.annotations_cache.remove(key);
        }
    }

    /// Keys currently holding a cached text.
    pub fn cached_text_keys(&self) -> BTreeSet<Key> {
        self.text_cache.keys().cloned().collect()
    }

    /// Outstanding child references on `key`, if it is tracked at all.
    pub fn needed_children(&self, key: &Key) -> Option<usize> {
        self.num_needed_children.get(key).copied()
    }
}

fn update_from_other_parent(
    annotations: &mut [Annotation],
    parent_annotations: &[Annotation],
    blocks: &[super::MatchingBlock],
    this: &Annotation,
) {
    let mut last: Option<(Annotation, Annotation, Annotation)> = None;
    for block in blocks {
        let theirs = &parent_annotations[block.a..block.a + block.len];
        if annotations[block.b..block.b + block.len] == *theirs {
            continue;
        }
        for (offset, par_ann) in theirs.iter().enumerate() {
            let idx = block.b + offset;
            let ann = &annotations[idx];
            if ann == par_ann {
                continue;
            }
            if ann == this {
                annotations[idx] = par_ann.clone();
                continue;
            }
            if let Some((last_ann, last_parent, last_res)) = &last {
                if ann == last_ann && par_ann == last_parent {
                    annotations[idx] = last_res.clone();
                    continue;
                }
            }
            let union: BTreeSet<Key> = ann.iter().chain(par_ann.iter()).cloned().collect();
            let union: Annotation = union.into_iter().collect::<Vec<_>>().into();
            last = Some((ann.clone(), par_ann.clone(), union.clone()));
            annotations[idx] = union;
        }
    }
}

/// Build an annotation from several keys.
pub fn annotation_of<I: IntoIterator<Item = Key>>(keys: I) -> Annotation {
    let set: BTreeSet<Key> = keys.into_iter().collect();
    Arc::from(set.into_iter().collect::<Vec<_>>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::MemoryStore;

    fn k(rev: &str) -> Key {
        Key::new(["f-id", rev])
    }

    fn lines_of(anns: &[Annotation]) -> Vec<Vec<String>> {
        anns.iter()
            .map(|a| a.iter().map(|k| k.revision().to_string()).collect())
            .collect()
    }

    fn text(lines: &[Line]) -> String {
        lines
            .iter()
            .map(|l| String::from_utf8_lossy(l).into_owned())
            .collect()
    }

    /// rev-1 -> rev-2 -> rev-3 linear history
    fn linear_store() -> MemoryStore {
        let mut store = MemoryStore::new();
        store.add_text(k("rev-1"), vec![], "first\nsecond\n");
        store.add_text(k("rev-2"), vec![k("rev-1")], "first\nsecond\nthird\n");
        store.add_text(k("rev-3"), vec![k("rev-2")], "zero\nfirst\nsecond\nthird\n");
        store
    }

    #[test]
    fn test_annotate_linear() {
        let store = linear_store();
        let mut ann = Annotator::new(&store);
        let (annotations, lines) = ann.annotate(&k("rev-3")).unwrap();
        assert_eq!(text(&lines), "zero\nfirst\nsecond\nthird\n");
        assert_eq!(
            lines_of(&annotations),
            vec![vec!["rev-3"], vec!["rev-1"], vec!["rev-1"], vec!["rev-2"]]
        );
    }

    #[test]
    fn test_annotate_is_idempotent() {
        let store = linear_store();
        let mut ann = Annotator::new(&store);
        let first = ann.annotate(&k("rev-3")).unwrap();
        let second = ann.annotate(&k("rev-3")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_annotate_walks_ancestry_by_frontier() {
        let store = linear_store();
        let mut ann = Annotator::new(&store);
        ann.annotate(&k("rev-3")).unwrap();
        // one lookup per generation, one stream for all texts
        assert_eq!(store.parent_map_calls(), 3);
        assert_eq!(store.record_stream_calls(), 1);
    }

    #[test]
    fn test_parents_are_evicted_once_children_are_done() {
        let store = linear_store();
        let mut ann = Annotator::new(&store);
        ann.annotate(&k("rev-3")).unwrap();
        let cached: Vec<Key> = ann.cached_text_keys().into_iter().collect();
        assert_eq!(cached, vec![k("rev-3")]);
        assert_eq!(ann.needed_children(&k("rev-1")), None);
        assert_eq!(ann.needed_children(&k("rev-3")), Some(1));
    }

    #[test]
    fn test_evicted_ancestor_is_refetched() {
        let store = linear_store();
        let mut ann = Annotator::new(&store);
        ann.annotate(&k("rev-3")).unwrap();
        let (annotations, _) = ann.annotate(&k("rev-2")).unwrap();
        assert_eq!(
            lines_of(&annotations),
            vec![vec!["rev-1"], vec!["rev-1"], vec!["rev-2"]]
        );
    }

    #[test]
    fn test_previous_target_is_released() {
        let store = linear_store();
        let mut ann = Annotator::new(&store);
        ann.annotate(&k("rev-3")).unwrap();
        ann.annotate(&k("rev-2")).unwrap();
        let cached: Vec<Key> = ann.cached_text_keys().into_iter().collect();
        assert_eq!(cached, vec![k("rev-2")]);
        assert_eq!(ann.needed_children(&k("rev-3")), None);
        assert_eq!(ann.needed_children(&k("rev-2")), Some(1));

        // the resident target is still a cache hit
        ann.annotate(&k("rev-2")).unwrap();
        assert_eq!(store.record_stream_calls(), 2);
        assert_eq!(ann.needed_children(&k("rev-2")), Some(1));
    }

    #[test]
    fn test_failed_annotation_takes_no_references() {
        let mut store = linear_store();
        store.add_text(k("orphan"), vec![k("rev-3"), k("ghost")], "zero\n");
        let mut ann = Annotator::new(&store);

        assert!(ann.annotate(&k("nope")).is_err());
        assert!(ann.cached_text_keys().is_empty());
        assert_eq!(ann.needed_children(&k("nope")), None);

        let err = ann.annotate(&k("orphan")).unwrap_err();
        assert!(matches!(err, Error::NotFound { key } if key == k("ghost")));
        assert!(ann.cached_text_keys().is_empty());
        for rev in ["rev-1", "rev-2", "rev-3", "orphan", "ghost"] {
            assert_eq!(ann.needed_children(&k(rev)), None, "{}", rev);
        }

        ann.annotate(&k("rev-3")).unwrap();
        let cached: Vec<Key> = ann.cached_text_keys().into_iter().collect();
        assert_eq!(cached, vec![k("rev-3")]);
        assert_eq!(ann.needed_children(&k("rev-2")), None);
        assert_eq!(ann.needed_children(&k("rev-3")), Some(1));
    }

    #[test]
    fn test_failure_keeps_previous_target() {
        let store = linear_store();
        let mut ann = Annotator::new(&store);
        let first = ann.annotate(&k("rev-2")).unwrap();
        assert!(ann.annotate(&k("nope")).is_err());
        assert_eq!(ann.needed_children(&k("rev-2")), Some(1));
        assert_eq!(store.record_stream_calls(), 2);
        assert_eq!(ann.annotate(&k("rev-2")).unwrap(), first);
        assert_eq!(store.record_stream_calls(), 2);
    }

    #[test]
    fn test_missing_key() {
        let store = linear_store();
        let mut ann = Annotator::new(&store);
        let err = ann.annotate(&k("nope")).unwrap_err();
        assert!(matches!(err, Error::NotFound { key } if key == k("nope")));
    }

    #[test]
    fn test_ghost_parent_is_not_found() {
        let mut store = MemoryStore::new();
        store.add_text(k("child"), vec![k("ghost")], "a\n");
        let mut ann = Annotator::new(&store);
        let err = ann.annotate(&k("child")).unwrap_err();
        assert!(matches!(err, Error::NotFound { key } if key == k("ghost")));
    }

    #[test]
    fn test_special_text() {
        let store = linear_store();
        let mut ann = Annotator::new(&store);
        let current = k("current:");
        ann.add_special_text(current.clone(), vec![k("rev-3")], "zero\nfirst\nextra\n");
        let (annotations, lines) = ann.annotate(&current).unwrap();
        assert_eq!(text(&lines), "zero\nfirst\nextra\n");
        assert_eq!(
            lines_of(&annotations),
            vec![vec!["rev-3"], vec!["rev-1"], vec!["current:"]]
        );
    }

    #[test]
    fn test_merge_takes_union_of_parents() {
        let mut store = MemoryStore::new();
        store.add_text(k("base"), vec![], "a\nb\nc\n");
        store.add_text(k("left"), vec![k("base")], "a\nb\nc\nd\n");
        store.add_text(k("right"), vec![k("base")], "a\nb\nc\nd\n");
        store.add_text(
            k("merge"),
            vec![k("left"), k("right")],
            "a\nb\nc\nd\n",
        );
        let mut ann = Annotator::new(&store);
        let (annotations, _) = ann.annotate(&k("merge")).unwrap();
        assert_eq!(
            lines_of(&annotations),
            vec![
                vec!["base"],
                vec!["base"],
                vec!["base"],
                vec!["left", "right"],
            ]
        );
    }

    #[test]
    fn test_identical_child_inherits_every_line() {
        let mut store = linear_store();
        store.add_text(k("rev-4"), vec![k("rev-3")], "zero\nfirst\nsecond\nthird\n");
        let mut ann = Annotator::new(&store);
        let (annotations, _) = ann.annotate(&k("rev-4")).unwrap();
        assert_eq!(
            lines_of(&annotations),
            vec![vec!["rev-3"], vec!["rev-1"], vec!["rev-1"], vec!["rev-2"]]
        );
    }

    /// root, then A and B each rewrite line 3; the merge keeps A's line.
    fn line_three_store(b_line: &str) -> MemoryStore {
        let mut store = MemoryStore::new();
        store.add_text(k("root"), vec![], "one\ntwo\nthree\nfour\n");
        store.add_text(k("A"), vec![k("root")], "one\ntwo\nTHREE\nfour\n");
        store.add_text(k("B"), vec![k("root")], format!("one\ntwo\n{}\nfour\n", b_line));
        store.add_text(k("M"), vec![k("A"), k("B")], "one\ntwo\nTHREE\nfour\n");
        store
    }

    #[test]
    fn test_same_change_on_both_sides_keeps_both_origins() {
        let store = line_three_store("THREE");
        let mut ann = Annotator::new(&store);
        let (annotations, _) = ann.annotate(&k("M")).unwrap();
        assert_eq!(&*annotations[2], &[k("A"), k("B")]);
        assert_eq!(lines_of(&annotations)[0], vec!["root"]);
        assert_eq!(lines_of(&annotations)[3], vec!["root"]);
    }

    #[test]
    fn test_line_from_one_side_keeps_that_origin() {
        let store = line_three_store("tres");
        let mut ann = Annotator::new(&store);
        let (annotations, _) = ann.annotate(&k("M")).unwrap();
        assert_eq!(&*annotations[2], &[k("A")]);
    }

    #[test]
    fn test_annotate_flat_prefers_head() {
        let mut store = MemoryStore::new();
        store.add_text(k("base"), vec![], "a\n");
        store.add_text(k("left"), vec![k("base")], "a\nb\n");
        store.add_text(k("right"), vec![k("left")], "a\nb\n");
        store.add_text(k("other"), vec![k("base")], "a\nb\n");
        store.add_text(k("merge"), vec![k("other"), k("right")], "a\nb\n");
        let mut ann = Annotator::new(&store);
        let flat = ann.annotate_flat(&k("merge")).unwrap();
        // {left, other} are concurrent, so the smaller key wins
        assert_eq!(flat[1].0, k("left"));
        assert_eq!(flat[0].0, k("base"));
    }

    #[test]
    fn test_progress_is_reported() {
        #[derive(Default)]
        struct Recorder {
            updates: Vec<(String, u64, u64)>,
            finished: bool,
        }
        impl ProgressReporter for Recorder {
            fn update(&mut self, msg: &str, current: u64, total: u64) {
                self.updates.push((msg.to_string(), current, total));
            }
            fn finished(&mut self) {
                self.finished = true;
            }
        }

        let store = linear_store();
        let mut ann = Annotator::new(&store);
        let mut recorder = Recorder::default();
        ann.annotate_with_progress(&k("rev-3"), Some(&mut recorder))
            .unwrap();
        assert_eq!(recorder.updates[0], ("getting stream".to_string(), 0, 3));
        assert_eq!(recorder.updates.last().unwrap(), &("extracting".to_string(), 3, 3));
        assert!(recorder.finished);
    }

    #[test]
    fn test_annotation_of_sorts_and_dedups() {
        let ann = annotation_of([k("b"), k("a"), k("b")]);
        assert_eq!(&*ann, &[k("a"), k("b")]);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn joined(lines: &[String]) -> String {
            lines.iter().map(|l| format!("{}\n", l)).collect()
        }

        proptest! {
            #[test]
            fn identical_child_has_no_lines_of_its_own(
                base in prop::collection::vec("[a-c]{0,2}", 0..12),
                edited in prop::collection::vec("[a-c]{0,2}", 0..12),
            ) {
                let mut store = MemoryStore::new();
                store.add_text(k("root"), vec![], joined(&base));
                store.add_text(k("parent"), vec![k("root")], joined(&edited));
                store.add_text(k("child"), vec![k("parent")], joined(&edited));

                let (expected, _) = Annotator::new(&store).annotate(&k("parent")).unwrap();
                let (annotations, lines) = Annotator::new(&store).annotate(&k("child")).unwrap();
                prop_assert_eq!(lines.len(), edited.len());
                prop_assert!(annotations.iter().all(|a| !a.contains(&k("child"))));
                prop_assert_eq!(annotations, expected);
            }

            #[test]
            fn annotate_flat_picks_smaller_concurrent_origin(
                x in "[a-z]{1,6}",
                y in "[a-z]{1,6}",
                x_first in any::<bool>(),
            ) {
                prop_assume!(x != y);
                prop_assume!(![&x, &y].iter().any(|n| *n == "base" || *n == "merge"));
                let mut store = MemoryStore::new();
                store.add_text(k("base"), vec![], "a\n");
                store.add_text(k(&x), vec![k("base")], "a\nshared\n");
                store.add_text(k(&y), vec![k("base")], "a\nshared\n");
                let parents = if x_first { vec![k(&x), k(&y)] } else { vec![k(&y), k(&x)] };
                store.add_text(k("merge"), parents, "a\nshared\n");

                let expected = k(std::cmp::min(&x, &y));
                let mut ann = Annotator::new(&store);
                for _ in 0..3 {
                    let flat = ann.annotate_flat(&k("merge")).unwrap();
                    prop_assert_eq!(&flat[1].0, &expected);
                    prop_assert_eq!(&flat[0].0, &k("base"));
                }
                let fresh = Annotator::new(&store).annotate_flat(&k("merge")).unwrap();
                prop_assert_eq!(&fresh[1].0, &expected);
            }
        }
    }
}
