//! Three-way line merge.

use super::patience::matching_blocks;
use super::Line;
use bytes::{Bytes, BytesMut};
use std::ops::Range;

/// One stretch of merge output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeRegion {
    /// Identical in all three; range into base.
    Unchanged(Range<usize>),
    /// Both sides made the same change; range into a.
    Same(Range<usize>),
    /// Only a changed; range into a.
    A(Range<usize>),
    /// Only b changed; range into b.
    B(Range<usize>),
    /// Both changed differently. `base` is `None` for conflicts narrowed by
    /// reprocessing.
    Conflict {
        base: Option<Range<usize>>,
        a: Range<usize>,
        b: Range<usize>,
    },
}

/// Regions where base, a and b all agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncRegion {
    pub base_start: usize,
    pub base_end: usize,
    pub a_start: usize,
    pub a_end: usize,
    pub b_start: usize,
    pub b_end: usize,
}

/// How conflicting regions are rendered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConflictStyle {
    #[default]
    Plain,
    /// Include the base text between `|||||||` and `=======`.
    ShowBase,
    /// Shrink conflicts to the lines a and b actually disagree on.
    Reprocess,
}

#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    pub name_a: Option<String>,
    pub name_b: Option<String>,
    pub name_base: Option<String>,
    pub style: ConflictStyle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedText {
    pub lines: Vec<Line>,
    pub conflicts: bool,
}

pub struct Merge3<'a> {
    base: &'a [Line],
    a: &'a [Line],
    b: &'a [Line],
}

impl<'a> Merge3<'a> {
    pub fn new(base: &'a [Line], a: &'a [Line], b: &'a [Line]) -> Self {
        Self { base, a, b }
    }

    /// Stretches common to all three texts, ending with an empty sentinel
    /// region at the end of each.
    pub fn sync_regions(&self) -> Vec<SyncRegion> {
        let amatches = matching_blocks(self.base, self.a);
        let bmatches = matching_blocks(self.base, self.b);
        let (mut ia, mut ib) = (0, 0);
        let mut regions = Vec::new();
        while ia < amatches.len() && ib < bmatches.len() {
            let am = amatches[ia];
            let bm = bmatches[ib];
            if let Some((start, end)) = intersect(am.a..am.a + am.len, bm.a..bm.a + bm.len) {
                let len = end - start;
                let a_start = am.b + (start - am.a);
                let b_start = bm.b + (start - bm.a);
                regions.push(SyncRegion {
                    base_start: start,
                    base_end: end,
                    a_start,
                    a_end: a_start + len,
                    b_start,
                    b_end: b_start + len,
                });
            }
            if am.a + am.len < bm.a + bm.len {
                ia += 1;
            } else {
                ib += 1;
            }
        }
        let (zl, al, bl) = (self.base.len(), self.a.len(), self.b.len());
        regions.push(SyncRegion {
            base_start: zl,
            base_end: zl,
            a_start: al,
            a_end: al,
            b_start: bl,
            b_end: bl,
        });
        regions
    }

    pub fn merge_regions(&self) -> Vec<MergeRegion> {
        let (mut iz, mut ia, mut ib) = (0, 0, 0);
        let mut regions = Vec::new();
        for sync in self.sync_regions() {
            let changed_a = sync.a_start > ia;
            let changed_b = sync.b_start > ib;
            if changed_a || changed_b {
                let a = ia..sync.a_start;
                let b = ib..sync.b_start;
                let base = iz..sync.base_start;
                let equal_a = self.a[a.clone()] == self.base[base.clone()];
                let equal_b = self.b[b.clone()] == self.base[base.clone()];
                if self.a[a.clone()] == self.b[b.clone()] {
                    regions.push(MergeRegion::Same(a));
                } else if equal_a {
                    regions.push(MergeRegion::B(b));
                } else if equal_b {
                    regions.push(MergeRegion::A(a));
                } else {
                    regions.push(MergeRegion::Conflict {
                        base: Some(base),
                        a,
                        b,
                    });
                }
                ia = sync.a_start;
                ib = sync.b_start;
            }
            iz = sync.base_start;
            if sync.base_end > sync.base_start {
                regions.push(MergeRegion::Unchanged(sync.base_start..sync.base_end));
                iz = sync.base_end;
                ia = sync.a_end;
                ib = sync.b_end;
            }
        }
        regions
    }

    /// Split each conflict into the parts where a and b agree and smaller
    /// conflicts around them.
    pub fn reprocess(&self, regions: Vec<MergeRegion>) -> Vec<MergeRegion> {
        let mut out = Vec::with_capacity(regions.len());
        for region in regions {
            if !matches!(region, MergeRegion::Conflict { .. }) {
                out.push(region);
                continue;
            }
            let MergeRegion::Conflict { a, b, .. } = region else {
                continue;
            };
            let matches = matching_blocks(&self.a[a.clone()], &self.b[b.clone()]);
            let (mut next_a, mut next_b) = (a.start, b.start);
            for m in &matches[..matches.len() - 1] {
                let (region_a, region_b) = (m.a + a.start, m.b + b.start);
                out.extend(mismatch_region(next_a..region_a, next_b..region_b));
                out.push(MergeRegion::Same(region_a..region_a + m.len));
                next_a = region_a + m.len;
                next_b = region_b + m.len;
            }
            out.extend(mismatch_region(next_a..a.end, next_b..b.end));
        }
        out
    }

    /// Merged text with conflict markers.
    pub fn merge_lines(&self, opts: &MergeOptions) -> MergedText {
        let newline: &[u8] = match self.a.first() {
            Some(first) if first.ends_with(b"\r\n") => b"\r\n",
            Some(first) if first.ends_with(b"\r") => b"\r",
            _ => b"\n",
        };
        let marker = |base: &str, name: Option<&String>| -> Line {
            let mut buf = BytesMut::from(base.as_bytes());
            if let Some(name) = name {
                buf.extend_from_slice(b" ");
                buf.extend_from_slice(name.as_bytes());
            }
            buf.extend_from_slice(newline);
            buf.freeze()
        };
        let start_marker = marker("<<<<<<<", opts.name_a.as_ref());
        let mid_marker = marker("=======", None);
        let end_marker = marker(">>>>>>>", opts.name_b.as_ref());
        let base_marker = marker("|||||||", opts.name_base.as_ref());

        let mut regions = self.merge_regions();
        if opts.style == ConflictStyle::Reprocess {
            regions = self.reprocess(regions);
        }

        let mut lines: Vec<Bytes> = Vec::new();
        let mut conflicts = false;
        for region in regions {
            match region {
                MergeRegion::Unchanged(r) => lines.extend_from_slice(&self.base[r]),
                MergeRegion::Same(r) | MergeRegion::A(r) => lines.extend_from_slice(&self.a[r]),
                MergeRegion::B(r) => lines.extend_from_slice(&self.b[r]),
                MergeRegion::Conflict { base, a, b } => {
                    conflicts = true;
                    lines.push(start_marker.clone());
                    lines.extend_from_slice(&self.a[a]);
                    if opts.style == ConflictStyle::ShowBase {
                        lines.push(base_marker.clone());
                        if let Some(base) = base {
                            lines.extend_from_slice(&self.base[base]);
                        }
                    }
                    lines.push(mid_marker.clone());
                    lines.extend_from_slice(&self.b[b]);
                    lines.push(end_marker.clone());
                }
            }
        }
        MergedText { lines, conflicts }
    }
}

fn intersect(ra: Range<usize>, rb: Range<usize>) -> Option<(usize, usize)> {
    let start = ra.start.max(rb.start);
    let end = ra.end.min(rb.end);
    (start < end).then_some((start, end))
}

fn mismatch_region(a: Range<usize>, b: Range<usize>) -> Option<MergeRegion> {
    (!a.is_empty() || !b.is_empty()).then_some(MergeRegion::Conflict { base: None, a, b })
}
