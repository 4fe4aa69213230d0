//! Carry annotations forward onto a new text without walking the graph.

use super::patience::{matching_blocks, MatchingBlock};
use super::{Key, Line};

/// Result of [`reannotate`]. Iterating is cheap and can be repeated.
#[derive(Debug, Clone)]
pub struct Reannotated {
    new_key: Key,
    lines: Vec<Line>,
    /// One origin per new line for every parent.
    proposals: Vec<Vec<Key>>,
}

impl Reannotated {
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Key, Line)> + '_ {
        (0..self.lines.len()).map(move |idx| (self.origin_at(idx), self.lines[idx].clone()))
    }

    pub fn into_vec(self) -> Vec<(Key, Line)> {
        self.iter().collect()
    }

    fn origin_at(&self, idx: usize) -> Key {
        let mut origins: Vec<&Key> = Vec::with_capacity(self.proposals.len());
        for proposal in &self.proposals {
            if !origins.contains(&&proposal[idx]) {
                origins.push(&proposal[idx]);
            }
        }
        match origins.as_slice() {
            [] => self.new_key.clone(),
            [only] => (*only).clone(),
            [a, b] if **a == self.new_key => (*b).clone(),
            [a, b] if **b == self.new_key => (*a).clone(),
            // parents genuinely disagree
            _ => self.new_key.clone(),
        }
    }
}

/// Annotate `new_lines` from the annotated texts of its parents.
///
/// Lines matched against a parent inherit that parent's origin; anything
/// else belongs to `new_key`. With several parents, an origin wins when
/// every parent proposes it, or when the only other proposal is `new_key`.
///
/// `left_blocks`, when given, is used instead of matching the first parent
/// and must be valid for that parent against `new_lines`.
pub fn reannotate(
    parents: &[Vec<(Key, Line)>],
    new_lines: &[Line],
    new_key: &Key,
    left_blocks: Option<&[MatchingBlock]>,
) -> Reannotated {
    let proposals = parents
        .iter()
        .enumerate()
        .map(|(idx, parent)| {
            let blocks = if idx == 0 { left_blocks } else { None };
            reannotate_one(parent, new_lines, new_key, blocks)
        })
        .collect();
    Reannotated {
        new_key: new_key.clone(),
        lines: new_lines.to_vec(),
        proposals,
    }
}

fn reannotate_one(
    parent: &[(Key, Line)],
    new_lines: &[Line],
    new_key: &Key,
    blocks: Option<&[MatchingBlock]>,
) -> Vec<Key> {
    let computed;
    let blocks = match blocks {
        Some(blocks) => blocks,
        None => {
            let plain: Vec<&Line> = parent.iter().map(|(_, line)| line).collect();
            let new: Vec<&Line> = new_lines.iter().collect();
            computed = matching_blocks(&plain, &new);
            &computed
        }
    };

    let mut origins = Vec::with_capacity(new_lines.len());
    let mut new_cur = 0;
    for block in blocks {
        while new_cur < block.b.min(new_lines.len()) {
            origins.push(new_key.clone());
            new_cur += 1;
        }
        for (origin, _) in &parent[block.a..block.a + block.len] {
            origins.push(origin.clone());
        }
        new_cur = block.b + block.len;
    }
    origins.truncate(new_lines.len());
    while origins.len() < new_lines.len() {
        origins.push(new_key.clone());
    }
    origins
}
