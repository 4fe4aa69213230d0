//! Patience-diff sequence matching.
//!
//! Lines that occur exactly once on both sides are used as anchors: the
//! longest increasing run of them (found with patience sorting) splits the
//! inputs into gaps, which are matched recursively. Gaps with no unique
//! anchors and no common prefix/suffix fall back to a plain longest-match
//! recursion.

use bytes::Bytes;
use std::collections::HashMap;
use std::hash::Hash;

/// Anchor recursion is bounded so hostile inputs cannot blow the stack.
const MAX_RECURSION: i32 = 10;

/// `a[a..a+len] == b[b..b+len]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MatchingBlock {
    pub a: usize,
    pub b: usize,
    pub len: usize,
}

impl MatchingBlock {
    pub fn new(a: usize, b: usize, len: usize) -> Self {
        Self { a, b, len }
    }
}

impl From<(usize, usize, usize)> for MatchingBlock {
    fn from((a, b, len): (usize, usize, usize)) -> Self {
        Self { a, b, len }
    }
}

/// Compute matching blocks between `a` and `b`.
///
/// Blocks are strictly increasing in both sequences and never overlap. The
/// last block is always the sentinel `(a.len(), b.len(), 0)`.
pub fn matching_blocks<T: Hash + Eq>(a: &[T], b: &[T]) -> Vec<MatchingBlock> {
    let mut matches = Vec::new();
    recurse_matches(a, b, 0, 0, a.len(), b.len(), &mut matches, MAX_RECURSION);
    let mut blocks = collapse_sequences(&matches);
    blocks.push(MatchingBlock::new(a.len(), b.len(), 0));
    blocks
}

/// Longest common subsequence of the lines that are unique on both sides.
///
/// Returns `(index_in_a, index_in_b)` pairs in increasing order.
pub fn unique_lcs<T: Hash + Eq>(a: &[T], b: &[T]) -> Vec<(usize, usize)> {
    // line -> position in a, or None once the line is seen twice
    let mut index: HashMap<&T, Option<usize>> = HashMap::with_capacity(a.len());
    for (i, line) in a.iter().enumerate() {
        index
            .entry(line)
            .and_modify(|pos| *pos = None)
            .or_insert(Some(i));
    }

    let mut btoa: Vec<Option<usize>> = vec![None; b.len()];
    let mut index2: HashMap<&T, usize> = HashMap::new();
    for (pos, line) in b.iter().enumerate() {
        let next = match index.get(line) {
            Some(Some(next)) => *next,
            _ => continue,
        };
        if let Some(&prev) = index2.get(line) {
            // not unique in b after all
            btoa[prev] = None;
            index.remove(line);
        } else {
            index2.insert(line, pos);
            btoa[pos] = Some(next);
        }
    }

    // Patience sorting over the a-positions in b order.
    let mut backpointers: Vec<Option<usize>> = vec![None; b.len()];
    let mut stacks: Vec<usize> = Vec::new();
    let mut lasts: Vec<usize> = Vec::new();
    let mut k = 0usize;
    for (bpos, apos) in btoa.iter().enumerate() {
        let Some(apos) = *apos else { continue };
        if stacks.last().is_some_and(|&top| top < apos) {
            // usually the next line extends the longest run
            k = stacks.len();
        } else if !stacks.is_empty()
            && stacks[k] < apos
            && (k == stacks.len() - 1 || stacks[k + 1] > apos)
        {
            // or sits right after the previous one
            k += 1;
        } else {
            k = stacks.partition_point(|&s| s <= apos);
        }
        if k > 0 {
            backpointers[bpos] = Some(lasts[k - 1]);
        }
        if k < stacks.len() {
            stacks[k] = apos;
            lasts[k] = bpos;
        } else {
            stacks.push(apos);
            lasts.push(bpos);
        }
    }

    let mut result = Vec::with_capacity(lasts.len());
    let mut cursor = lasts.last().copied();
    while let Some(bpos) = cursor {
        if let Some(apos) = btoa[bpos] {
            result.push((apos, bpos));
        }
        cursor = backpointers[bpos];
    }
    result.reverse();
    result
}

#[allow(clippy::too_many_arguments)]
fn recurse_matches<T: Hash + Eq>(
    a: &[T],
    b: &[T],
    alo: usize,
    blo: usize,
    ahi: usize,
    bhi: usize,
    answer: &mut Vec<(usize, usize)>,
    max_recursion: i32,
) {
    if max_recursion < 0 {
        return;
    }
    if alo == ahi || blo == bhi {
        return;
    }
    let old_len = answer.len();
    let (mut next_a, mut next_b) = (alo, blo);
    for (apos, bpos) in unique_lcs(&a[alo..ahi], &b[blo..bhi]) {
        let (apos, bpos) = (apos + alo, bpos + blo);
        if next_a != apos || next_b != bpos {
            recurse_matches(a, b, next_a, next_b, apos, bpos, answer, max_recursion - 1);
        }
        next_a = apos + 1;
        next_b = bpos + 1;
        answer.push((apos, bpos));
    }

    if answer.len() > old_len {
        // the tail after the last anchor
        recurse_matches(a, b, next_a, next_b, ahi, bhi, answer, max_recursion - 1);
    } else if a[alo] == b[blo] {
        let (mut alo, mut blo) = (alo, blo);
        while alo < ahi && blo < bhi && a[alo] == b[blo] {
            answer.push((alo, blo));
            alo += 1;
            blo += 1;
        }
        recurse_matches(a, b, alo, blo, ahi, bhi, answer, max_recursion - 1);
    } else if a[ahi - 1] == b[bhi - 1] {
        let (mut nahi, mut nbhi) = (ahi - 1, bhi - 1);
        while nahi > alo && nbhi > blo && a[nahi - 1] == b[nbhi - 1] {
            nahi -= 1;
            nbhi -= 1;
        }
        recurse_matches(a, b, alo, blo, nahi, nbhi, answer, max_recursion - 1);
        for i in 0..(ahi - nahi) {
            answer.push((nahi + i, nbhi + i));
        }
    } else {
        longest_match_fallback(a, b, alo, blo, ahi, bhi, answer);
    }
}

/// Plain recursive longest-match over a region without unique anchors.
fn longest_match_fallback<T: Hash + Eq>(
    a: &[T],
    b: &[T],
    alo: usize,
    blo: usize,
    ahi: usize,
    bhi: usize,
    answer: &mut Vec<(usize, usize)>,
) {
    let mut b2j: HashMap<&T, Vec<usize>> = HashMap::new();
    for (j, line) in b.iter().enumerate().take(bhi).skip(blo) {
        b2j.entry(line).or_default().push(j);
    }

    let mut found = Vec::new();
    let mut queue = vec![(alo, ahi, blo, bhi)];
    while let Some((alo, ahi, blo, bhi)) = queue.pop() {
        let (i, j, k) = find_longest_match(a, &b2j, alo, ahi, blo, bhi);
        if k == 0 {
            continue;
        }
        found.push((i, j, k));
        if alo < i && blo < j {
            queue.push((alo, i, blo, j));
        }
        if i + k < ahi && j + k < bhi {
            queue.push((i + k, ahi, j + k, bhi));
        }
    }
    found.sort_unstable();
    for (i, j, k) in found {
        answer.extend((0..k).map(|n| (i + n, j + n)));
    }
}

/// Earliest longest run of equal lines inside `a[alo..ahi]` x `b[blo..bhi]`.
fn find_longest_match<T: Hash + Eq>(
    a: &[T],
    b2j: &HashMap<&T, Vec<usize>>,
    alo: usize,
    ahi: usize,
    blo: usize,
    bhi: usize,
) -> (usize, usize, usize) {
    let (mut best_i, mut best_j, mut best_len) = (alo, blo, 0);
    let mut j2len: HashMap<usize, usize> = HashMap::new();
    for (i, line) in a.iter().enumerate().take(ahi).skip(alo) {
        let mut new_j2len = HashMap::new();
        if let Some(js) = b2j.get(line) {
            for &j in js {
                if j < blo {
                    continue;
                }
                if j >= bhi {
                    break;
                }
                let k = j
                    .checked_sub(1)
                    .and_then(|prev| j2len.get(&prev))
                    .copied()
                    .unwrap_or(0)
                    + 1;
                new_j2len.insert(j, k);
                if k > best_len {
                    best_i = i + 1 - k;
                    best_j = j + 1 - k;
                    best_len = k;
                }
            }
        }
        j2len = new_j2len;
    }
    (best_i, best_j, best_len)
}

/// Fold consecutive line pairs into blocks.
fn collapse_sequences(matches: &[(usize, usize)]) -> Vec<MatchingBlock> {
    let mut blocks = Vec::new();
    let mut start: Option<(usize, usize)> = None;
    let mut length = 0;
    for &(ia, ib) in matches {
        match start {
            Some((sa, sb)) if ia == sa + length && ib == sb + length => length += 1,
            _ => {
                if let Some((sa, sb)) = start {
                    blocks.push(MatchingBlock::new(sa, sb, length));
                }
                start = Some((ia, ib));
                length = 1;
            }
        }
    }
    if let Some((sa, sb)) = start {
        blocks.push(MatchingBlock::new(sa, sb, length));
    }
    blocks
}

// =============================================================================
// Opcodes and unified diff
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpTag {
    Equal,
    Replace,
    Delete,
    Insert,
}

/// Turns `a[a_start..a_end]` into `b[b_start..b_end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpCode {
    pub tag: OpTag,
    pub a_start: usize,
    pub a_end: usize,
    pub b_start: usize,
    pub b_end: usize,
}

impl OpCode {
    fn new(tag: OpTag, a_start: usize, a_end: usize, b_start: usize, b_end: usize) -> Self {
        Self {
            tag,
            a_start,
            a_end,
            b_start,
            b_end,
        }
    }
}

/// Edit script derived from matching blocks.
pub fn opcodes(blocks: &[MatchingBlock]) -> Vec<OpCode> {
    let (mut i, mut j) = (0, 0);
    let mut codes = Vec::new();
    for block in blocks {
        let tag = match (i < block.a, j < block.b) {
            (true, true) => Some(OpTag::Replace),
            (true, false) => Some(OpTag::Delete),
            (false, true) => Some(OpTag::Insert),
            (false, false) => None,
        };
        if let Some(tag) = tag {
            codes.push(OpCode::new(tag, i, block.a, j, block.b));
        }
        i = block.a + block.len;
        j = block.b + block.len;
        if block.len > 0 {
            codes.push(OpCode::new(OpTag::Equal, block.a, i, block.b, j));
        }
    }
    codes
}

fn grouped_opcodes(mut codes: Vec<OpCode>, context: usize) -> Vec<Vec<OpCode>> {
    if codes.is_empty() {
        codes.push(OpCode::new(OpTag::Equal, 0, 1, 0, 1));
    }
    if let Some(first) = codes.first_mut() {
        if first.tag == OpTag::Equal {
            first.a_start = first.a_start.max(first.a_end.saturating_sub(context));
            first.b_start = first.b_start.max(first.b_end.saturating_sub(context));
        }
    }
    if let Some(last) = codes.last_mut() {
        if last.tag == OpTag::Equal {
            last.a_end = last.a_end.min(last.a_start + context);
            last.b_end = last.b_end.min(last.b_start + context);
        }
    }

    let mut groups = Vec::new();
    let mut group = Vec::new();
    for mut code in codes {
        if code.tag == OpTag::Equal && code.a_end - code.a_start > 2 * context {
            group.push(OpCode::new(
                OpTag::Equal,
                code.a_start,
                code.a_end.min(code.a_start + context),
                code.b_start,
                code.b_end.min(code.b_start + context),
            ));
            groups.push(std::mem::take(&mut group));
            code.a_start = code.a_start.max(code.a_end.saturating_sub(context));
            code.b_start = code.b_start.max(code.b_end.saturating_sub(context));
        }
        group.push(code);
    }
    if !group.is_empty() && !(group.len() == 1 && group[0].tag == OpTag::Equal) {
        groups.push(group);
    }
    groups
}

fn format_range(start: usize, stop: usize) -> String {
    let mut beginning = start + 1;
    let length = stop - start;
    if length == 1 {
        return beginning.to_string();
    }
    if length == 0 {
        beginning -= 1;
    }
    format!("{},{}", beginning, length)
}

fn push_line(out: &mut Vec<Vec<u8>>, prefix: u8, line: &Bytes) {
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.push(prefix);
    buf.extend_from_slice(line);
    if !line.ends_with(b"\n") {
        buf.extend_from_slice(b"\n\\ No newline at end of file\n");
    }
    out.push(buf);
}

/// Unified diff of `a` against `b`, patience-matched, with `context` lines
/// around each hunk. Returns one entry per output line.
pub fn unified_diff(
    a: &[Bytes],
    b: &[Bytes],
    from_file: &str,
    to_file: &str,
    context: usize,
) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let codes = opcodes(&matching_blocks(a, b));
    for group in grouped_opcodes(codes, context) {
        if out.is_empty() {
            out.push(format!("--- {}\n", from_file).into_bytes());
            out.push(format!("+++ {}\n", to_file).into_bytes());
        }
        let (first, last) = (group[0], group[group.len() - 1]);
        out.push(
            format!(
                "@@ -{} +{} @@\n",
                format_range(first.a_start, last.a_end),
                format_range(first.b_start, last.b_end)
            )
            .into_bytes(),
        );
        for code in group {
            if code.tag == OpTag::Equal {
                for line in &a[code.a_start..code.a_end] {
                    push_line(&mut out, b' ', line);
                }
                continue;
            }
            if matches!(code.tag, OpTag::Replace | OpTag::Delete) {
                for line in &a[code.a_start..code.a_end] {
                    push_line(&mut out, b'-', line);
                }
            }
            if matches!(code.tag, OpTag::Replace | OpTag::Insert) {
                for line in &b[code.b_start..code.b_end] {
                    push_line(&mut out, b'+', line);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chars(s: &str) -> Vec<char> {
        s.chars().collect()
    }

    fn blocks(a: &str, b: &str) -> Vec<(usize, usize, usize)> {
        matching_blocks(&chars(a), &chars(b))
            .into_iter()
            .map(|m| (m.a, m.b, m.len))
            .collect()
    }

    fn lines(text: &str) -> Vec<Bytes> {
        text.split_inclusive('\n')
            .map(|l| Bytes::copy_from_slice(l.as_bytes()))
            .collect()
    }

    #[test]
    fn test_unique_lcs() {
        assert_eq!(unique_lcs(&chars(""), &chars("")), vec![]);
        assert_eq!(unique_lcs(&chars("a"), &chars("a")), vec![(0, 0)]);
        assert_eq!(unique_lcs(&chars("a"), &chars("b")), vec![]);
        assert_eq!(unique_lcs(&chars("ab"), &chars("ab")), vec![(0, 0), (1, 1)]);
        assert_eq!(
            unique_lcs(&chars("abcde"), &chars("cdeab")),
            vec![(2, 0), (3, 1), (4, 2)]
        );
        assert_eq!(
            unique_lcs(&chars("cdeab"), &chars("abcde")),
            vec![(0, 2), (1, 3), (2, 4)]
        );
        assert_eq!(unique_lcs(&chars("abXde"), &chars("abYde")), vec![(0, 0), (1, 1), (3, 3), (4, 4)]);
        // duplicated on one side: not an anchor
        assert_eq!(unique_lcs(&chars("acbac"), &chars("abc")), vec![(2, 1)]);
    }

    #[test]
    fn test_matching_blocks_basic() {
        assert_eq!(blocks("", ""), vec![(0, 0, 0)]);
        assert_eq!(blocks("", "a"), vec![(0, 1, 0)]);
        assert_eq!(blocks("a", "a"), vec![(0, 0, 1), (1, 1, 0)]);
        assert_eq!(blocks("abxcd", "abcd"), vec![(0, 0, 2), (3, 2, 2), (5, 4, 0)]);
        assert_eq!(blocks("abcd", "abcd"), vec![(0, 0, 4), (4, 4, 0)]);
        assert_eq!(blocks("abcd", "xyz"), vec![(4, 3, 0)]);
    }

    #[test]
    fn test_matching_blocks_shared_prefix_and_suffix() {
        // 'a' is not unique in the first input, so it is matched by prefix scan
        assert_eq!(blocks("aab", "ab"), vec![(0, 0, 1), (2, 1, 1), (3, 2, 0)]);
        // suffix scan when nothing is unique and the heads differ
        assert_eq!(blocks("xyy", "zyy"), vec![(1, 1, 2), (3, 3, 0)]);
    }

    #[test]
    fn test_matching_blocks_falls_back_without_anchors() {
        // no unique lines, no common head or tail
        assert_eq!(blocks("xxyy", "yyxx"), vec![(0, 2, 2), (4, 4, 0)]);
    }

    #[test]
    fn test_matching_blocks_on_lines() {
        let a = lines("hello there\nworld\nhow are you\n");
        let b = lines("hello there\nhow are you\n");
        let got: Vec<_> = matching_blocks(&a, &b)
            .into_iter()
            .map(|m| (m.a, m.b, m.len))
            .collect();
        assert_eq!(got, vec![(0, 0, 1), (2, 1, 1), (3, 2, 0)]);
    }

    #[test]
    fn test_opcodes() {
        let codes = opcodes(&matching_blocks(&chars("abcd"), &chars("abxd")));
        let tags: Vec<_> = codes.iter().map(|c| (c.tag, c.a_start, c.a_end, c.b_start, c.b_end)).collect();
        assert_eq!(
            tags,
            vec![
                (OpTag::Equal, 0, 2, 0, 2),
                (OpTag::Replace, 2, 3, 2, 3),
                (OpTag::Equal, 3, 4, 3, 4),
            ]
        );

        let codes = opcodes(&matching_blocks(&chars("ab"), &chars("")));
        assert_eq!(codes, vec![OpCode::new(OpTag::Delete, 0, 2, 0, 0)]);
    }

    #[test]
    fn test_unified_diff() {
        let a = lines("a\nb\nc\n");
        let b = lines("a\nB\nc\n");
        let out: Vec<String> = unified_diff(&a, &b, "old", "new", 3)
            .into_iter()
            .map(|l| String::from_utf8(l).unwrap())
            .collect();
        assert_eq!(
            out,
            vec!["--- old\n", "+++ new\n", "@@ -1,3 +1,3 @@\n", " a\n", "-b\n", "+B\n", " c\n"]
        );
    }

    #[test]
    fn test_unified_diff_identical_is_empty() {
        let a = lines("a\nb\n");
        assert!(unified_diff(&a, &a, "old", "new", 3).is_empty());
    }

    #[test]
    fn test_unified_diff_missing_newline() {
        let a = lines("a\n");
        let b = lines("a\nb");
        let out: Vec<String> = unified_diff(&a, &b, "old", "new", 3)
            .into_iter()
            .map(|l| String::from_utf8(l).unwrap())
            .collect();
        assert_eq!(out[2], "@@ -1 +1,2 @@\n");
        assert_eq!(out[4], "+b\n\\ No newline at end of file\n");
    }

    #[test]
    fn test_format_range() {
        assert_eq!(format_range(0, 0), "0,0");
        assert_eq!(format_range(0, 1), "1");
        assert_eq!(format_range(3, 7), "4,4");
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn blocks_are_valid_matches(
                a in prop::collection::vec(0u8..6, 0..40),
                b in prop::collection::vec(0u8..6, 0..40),
            ) {
                let blocks = matching_blocks(&a, &b);
                let last = *blocks.last().unwrap();
                prop_assert_eq!(last, MatchingBlock::new(a.len(), b.len(), 0));

                let (mut next_a, mut next_b) = (0, 0);
                for block in &blocks[..blocks.len() - 1] {
                    prop_assert!(block.len > 0);
                    prop_assert!(block.a >= next_a);
                    prop_assert!(block.b >= next_b);
                    prop_assert_eq!(&a[block.a..block.a + block.len], &b[block.b..block.b + block.len]);
                    next_a = block.a + block.len;
                    next_b = block.b + block.len;
                }
            }

            #[test]
            fn identical_inputs_match_fully(a in prop::collection::vec(0u8..4, 1..40)) {
                let blocks = matching_blocks(&a, &a);
                prop_assert_eq!(blocks, vec![
                    MatchingBlock::new(0, 0, a.len()),
                    MatchingBlock::new(a.len(), a.len(), 0),
                ]);
            }

            #[test]
            fn deterministic(
                a in prop::collection::vec(0u8..5, 0..30),
                b in prop::collection::vec(0u8..5, 0..30),
            ) {
                prop_assert_eq!(matching_blocks(&a, &b), matching_blocks(&a, &b));
            }
        }
    }
}
