//! Revision graph queries over a fully known parent map.

use super::{Key, ParentMap};
use crate::error::{Error, Result};
use std::collections::{BTreeSet, HashMap, HashSet};

#[derive(Debug, Clone)]
struct Node {
    /// `None` for ghosts: referenced as a parent but never described.
    parent_keys: Option<Vec<Key>>,
    child_keys: Vec<Key>,
    /// Greatest distance from origin. Stays `None` for nodes on a cycle.
    gdfo: Option<u64>,
}

/// In-memory graph with per-node gdfo, used to answer `heads` queries.
#[derive(Debug, Clone, Default)]
pub struct KnownGraph {
    nodes: HashMap<Key, Node>,
    known_heads: HashMap<BTreeSet<Key>, BTreeSet<Key>>,
}

impl KnownGraph {
    pub fn new(parent_map: &ParentMap) -> Self {
        let mut nodes: HashMap<Key, Node> = HashMap::with_capacity(parent_map.len());
        for (key, parents) in parent_map {
            let node = nodes.entry(key.clone()).or_insert_with(|| Node {
                parent_keys: None,
                child_keys: Vec::new(),
                gdfo: None,
            });
            node.parent_keys = Some(parents.clone());
            for parent in parents {
                nodes
                    .entry(parent.clone())
                    .or_insert_with(|| Node {
                        parent_keys: None,
                        child_keys: Vec::new(),
                        gdfo: None,
                    })
                    .child_keys
                    .push(key.clone());
            }
        }
        let mut graph = Self {
            nodes,
            known_heads: HashMap::new(),
        };
        graph.find_gdfo();
        graph
    }

    fn tails(&self) -> Vec<Key> {
        let mut tails: Vec<Key> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.parent_keys.as_ref().map_or(true, Vec::is_empty))
            .map(|(key, _)| key.clone())
            .collect();
        tails.sort();
        tails
    }

    fn find_gdfo(&mut self) {
        let mut known_parent_gdfos: HashMap<Key, usize> = HashMap::new();
        let mut pending = self.tails();
        for key in &pending {
            if let Some(node) = self.nodes.get_mut(key) {
                node.gdfo = Some(1);
            }
        }
        while let Some(key) = pending.pop() {
            let (gdfo, children) = match self.nodes.get(&key) {
                Some(node) => (node.gdfo.unwrap_or(1), node.child_keys.clone()),
                None => continue,
            };
            for child_key in children {
                let Some(child) = self.nodes.get_mut(&child_key) else {
                    continue;
                };
                let seen = known_parent_gdfos.entry(child_key.clone()).or_insert(0);
                *seen += 1;
                if child.gdfo.map_or(true, |g| gdfo + 1 > g) {
                    child.gdfo = Some(gdfo + 1);
                }
                let num_parents = child.parent_keys.as_ref().map_or(0, Vec::len);
                if *seen == num_parents {
                    // all parents processed, so the gdfo is final
                    pending.push(child_key);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn gdfo(&self, key: &Key) -> Option<u64> {
        self.nodes.get(key).and_then(|node| node.gdfo)
    }

    /// Parents of `key`; `None` for ghosts and unknown keys.
    pub fn parents(&self, key: &Key) -> Option<&[Key]> {
        self.nodes
            .get(key)
            .and_then(|node| node.parent_keys.as_deref())
    }

    /// The members of `keys` that are not ancestors of any other member.
    ///
    /// Results are memoised per key set for the lifetime of the graph.
    pub fn heads<'a, I>(&mut self, keys: I) -> Result<BTreeSet<Key>>
    where
        I: IntoIterator<Item = &'a Key>,
    {
        let candidates: BTreeSet<Key> = keys.into_iter().cloned().collect();
        for key in &candidates {
            if !self.nodes.contains_key(key) {
                return Err(Error::NotFound { key: key.clone() });
            }
        }
        if candidates.len() < 2 {
            return Ok(candidates);
        }
        if let Some(heads) = self.known_heads.get(&candidates) {
            return Ok(heads.clone());
        }

        let mut pending: Vec<Key> = Vec::new();
        let mut min_gdfo = u64::MAX;
        for key in &candidates {
            let node = &self.nodes[key];
            if let Some(parents) = &node.parent_keys {
                pending.extend(parents.iter().cloned());
            }
            min_gdfo = min_gdfo.min(node.gdfo.unwrap_or(0));
        }

        let mut seen: HashSet<Key> = HashSet::new();
        while let Some(key) = pending.pop() {
            if !seen.insert(key.clone()) {
                continue;
            }
            let Some(node) = self.nodes.get(&key) else {
                continue;
            };
            // anything this shallow cannot have a candidate as an ancestor
            if node.gdfo.unwrap_or(0) <= min_gdfo {
                continue;
            }
            if let Some(parents) = &node.parent_keys {
                pending.extend(parents.iter().cloned());
            }
        }

        let heads: BTreeSet<Key> = candidates
            .iter()
            .filter(|key| !seen.contains(*key))
            .cloned()
            .collect();
        self.known_heads.insert(candidates, heads.clone());
        Ok(heads)
    }

    /// Every node, parents before children. Ghosts are emitted as roots.
    pub fn topo_sort(&self) -> Result<Vec<Key>> {
        let mut order: Vec<(u64, &Key)> = Vec::with_capacity(self.nodes.len());
        for (key, node) in &self.nodes {
            match node.gdfo {
                Some(gdfo) => order.push((gdfo, key)),
                None => return Err(Error::GraphCycle),
            }
        }
        // a child's gdfo is always greater than each parent's
        order.sort();
        Ok(order.into_iter().map(|(_, key)| key.clone()).collect())
    }
}

// =============================================================================
// Lefthand ancestry
// =============================================================================

/// Walks first parents from a tip. Keys missing from the map end the walk
/// after being yielded.
#[derive(Debug, Clone)]
pub struct LefthandAncestry<'a> {
    parent_map: &'a ParentMap,
    next: Option<Key>,
}

impl Iterator for LefthandAncestry<'_> {
    type Item = Key;

    fn next(&mut self) -> Option<Key> {
        let current = self.next.take()?;
        self.next = self
            .parent_map
            .get(&current)
            .and_then(|parents| parents.first())
            .cloned();
        Some(current)
    }
}

/// Mainline history from `tip` back to its root, newest first. A `None` tip
/// is the empty (null) revision and yields nothing.
pub fn iter_lefthand_ancestry<'a>(parent_map: &'a ParentMap, tip: Option<&Key>) -> LefthandAncestry<'a> {
    LefthandAncestry {
        parent_map,
        next: tip.cloned(),
    }
}

/// Which mainline revisions were removed and added moving a branch tip from
/// `old_tip` to `new_tip`. Both lists are oldest first.
///
/// The two ancestries are walked in lockstep and the walk stops as soon as
/// either side reaches a revision the other side has already visited.
pub fn history_change(
    parent_map: &ParentMap,
    old_tip: Option<&Key>,
    new_tip: Option<&Key>,
) -> (Vec<Key>, Vec<Key>) {
    let mut old_iter = iter_lefthand_ancestry(parent_map, old_tip).fuse();
    let mut new_iter = iter_lefthand_ancestry(parent_map, new_tip).fuse();
    let (mut old_history, mut new_history) = (Vec::new(), Vec::new());
    let (mut old_seen, mut new_seen) = (HashSet::new(), HashSet::new());
    let mut stop: Option<Key> = None;
    let (mut do_old, mut do_new) = (true, true);

    while do_old || do_new {
        if do_new {
            match new_iter.next() {
                Some(rev) => {
                    new_history.push(rev.clone());
                    new_seen.insert(rev.clone());
                    if old_seen.contains(&rev) {
                        stop = Some(rev);
                        break;
                    }
                }
                None => do_new = false,
            }
        }
        if do_old {
            match old_iter.next() {
                Some(rev) => {
                    old_history.push(rev.clone());
                    old_seen.insert(rev.clone());
                    if new_seen.contains(&rev) {
                        stop = Some(rev);
                        break;
                    }
                }
                None => do_old = false,
            }
        }
    }

    old_history.reverse();
    new_history.reverse();
    if let Some(stop) = stop {
        for history in [&mut old_history, &mut new_history] {
            if let Some(pos) = history.iter().position(|rev| *rev == stop) {
                history.drain(..=pos);
            }
        }
    }
    (old_history, new_history)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k(s: &str) -> Key {
        Key::from(s)
    }

    fn graph(edges: &[(&str, &[&str])]) -> ParentMap {
        edges
            .iter()
            .map(|(key, parents)| (k(key), parents.iter().map(|p| k(p)).collect()))
            .collect()
    }

    fn keys(names: &[&str]) -> Vec<Key> {
        names.iter().map(|n| k(n)).collect()
    }

    fn set(names: &[&str]) -> BTreeSet<Key> {
        names.iter().map(|n| k(n)).collect()
    }

    // rev1 -> rev2a, rev2b -> rev3 (merge) -> rev4
    fn diamond() -> ParentMap {
        graph(&[
            ("rev1", &[]),
            ("rev2a", &["rev1"]),
            ("rev2b", &["rev1"]),
            ("rev3", &["rev2a", "rev2b"]),
            ("rev4", &["rev3"]),
        ])
    }

    #[test]
    fn test_gdfo() {
        let g = KnownGraph::new(&diamond());
        assert_eq!(g.gdfo(&k("rev1")), Some(1));
        assert_eq!(g.gdfo(&k("rev2a")), Some(2));
        assert_eq!(g.gdfo(&k("rev3")), Some(3));
        assert_eq!(g.gdfo(&k("rev4")), Some(4));
    }

    #[test]
    fn test_gdfo_uses_longest_path() {
        let pm = graph(&[("a", &[]), ("b", &["a"]), ("c", &["b"]), ("d", &["a", "c"])]);
        let g = KnownGraph::new(&pm);
        assert_eq!(g.gdfo(&k("d")), Some(4));
    }

    #[test]
    fn test_ghost_parent_is_a_tail() {
        let pm = graph(&[("a", &["ghost"]), ("b", &["a"])]);
        let g = KnownGraph::new(&pm);
        assert!(g.contains(&k("ghost")));
        assert_eq!(g.parents(&k("ghost")), None);
        assert_eq!(g.gdfo(&k("ghost")), Some(1));
        assert_eq!(g.gdfo(&k("b")), Some(3));
    }

    #[test]
    fn test_heads() {
        let mut g = KnownGraph::new(&diamond());
        assert_eq!(g.heads(&keys(&["rev1"])).unwrap(), set(&["rev1"]));
        assert_eq!(g.heads(&keys(&["rev1", "rev2a"])).unwrap(), set(&["rev2a"]));
        assert_eq!(
            g.heads(&keys(&["rev2a", "rev2b"])).unwrap(),
            set(&["rev2a", "rev2b"])
        );
        assert_eq!(g.heads(&keys(&["rev2a", "rev4"])).unwrap(), set(&["rev4"]));
        assert_eq!(
            g.heads(&keys(&["rev1", "rev2b", "rev3"])).unwrap(),
            set(&["rev3"])
        );
    }

    #[test]
    fn test_heads_memoised_result_is_stable() {
        let mut g = KnownGraph::new(&diamond());
        let first = g.heads(&keys(&["rev2a", "rev2b"])).unwrap();
        let second = g.heads(&keys(&["rev2b", "rev2a"])).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_heads_unknown_key() {
        let mut g = KnownGraph::new(&diamond());
        let err = g.heads(&keys(&["rev1", "nope"])).unwrap_err();
        assert!(matches!(err, Error::NotFound { key } if key == k("nope")));
    }

    #[test]
    fn test_topo_sort() {
        let g = KnownGraph::new(&diamond());
        let order = g.topo_sort().unwrap();
        let pos = |name: &str| order.iter().position(|key| *key == k(name)).unwrap();
        assert_eq!(order.len(), 5);
        assert!(pos("rev1") < pos("rev2a"));
        assert!(pos("rev1") < pos("rev2b"));
        assert!(pos("rev2a") < pos("rev3"));
        assert!(pos("rev2b") < pos("rev3"));
        assert!(pos("rev3") < pos("rev4"));
    }

    #[test]
    fn test_topo_sort_cycle() {
        let pm = graph(&[("root", &[]), ("a", &["root", "b"]), ("b", &["a"])]);
        let g = KnownGraph::new(&pm);
        assert!(matches!(g.topo_sort(), Err(Error::GraphCycle)));
    }

    #[test]
    fn test_lefthand_ancestry() {
        let pm = diamond();
        let walked: Vec<_> = iter_lefthand_ancestry(&pm, Some(&k("rev4"))).collect();
        assert_eq!(walked, keys(&["rev4", "rev3", "rev2a", "rev1"]));
        assert_eq!(iter_lefthand_ancestry(&pm, None).count(), 0);
    }

    // 1a - 2a - 3a, with 2b - 3b branching from 1a and 1c - 2c - 3c unrelated
    fn histories() -> ParentMap {
        graph(&[
            ("1a", &[]),
            ("2a", &["1a"]),
            ("3a", &["2a"]),
            ("2b", &["1a"]),
            ("3b", &["2b"]),
            ("1c", &[]),
            ("2c", &["1c"]),
            ("3c", &["2c"]),
        ])
    }

    #[test]
    fn test_history_change_all_new() {
        let pm = histories();
        let (old, new) = history_change(&pm, Some(&k("1a")), Some(&k("3a")));
        assert!(old.is_empty());
        assert_eq!(new, keys(&["2a", "3a"]));
    }

    #[test]
    fn test_history_change_all_old() {
        let pm = histories();
        let (old, new) = history_change(&pm, Some(&k("3a")), Some(&k("1a")));
        assert_eq!(old, keys(&["2a", "3a"]));
        assert!(new.is_empty());
    }

    #[test]
    fn test_history_change_from_and_to_null() {
        let pm = histories();
        let (old, new) = history_change(&pm, None, Some(&k("3a")));
        assert!(old.is_empty());
        assert_eq!(new, keys(&["1a", "2a", "3a"]));

        let (old, new) = history_change(&pm, Some(&k("3a")), None);
        assert_eq!(old, keys(&["1a", "2a", "3a"]));
        assert!(new.is_empty());
    }

    #[test]
    fn test_history_change_diverged() {
        let pm = histories();
        let (old, new) = history_change(&pm, Some(&k("3a")), Some(&k("3b")));
        assert_eq!(old, keys(&["2a", "3a"]));
        assert_eq!(new, keys(&["2b", "3b"]));
    }

    #[test]
    fn test_history_change_unrelated() {
        let pm = histories();
        let (old, new) = history_change(&pm, Some(&k("3a")), Some(&k("3c")));
        assert_eq!(old, keys(&["1a", "2a", "3a"]));
        assert_eq!(new, keys(&["1c", "2c", "3c"]));
    }
}
