/// Free space accounting: an ordered list of free regions.
///
/// Invariants kept after every mutation: regions are sorted by LCN, never
/// overlap, never touch (adjacent regions are coalesced) and never have
/// zero length. Queries are linear scans, which is fast enough for the
/// region counts real volumes produce.
use serde::{Deserialize, Serialize};

/// A contiguous span of unallocated clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FreeRegion {
    pub lcn: u64,
    pub length: u64,
}

impl FreeRegion {
    pub fn new(lcn: u64, length: u64) -> Self {
        Self { lcn, length }
    }

    #[inline]
    pub fn end(&self) -> u64 {
        self.lcn + self.length
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreeSpaceIndex {
    regions: Vec<FreeRegion>,
}

impl FreeSpaceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index from arbitrary regions, normalising them.
    pub fn from_regions(regions: impl IntoIterator<Item = FreeRegion>) -> Self {
        let mut index = Self::new();
        index.replace_all(regions);
        index
    }

    /// Replace the whole list.
    pub fn replace_all(&mut self, regions: impl IntoIterator<Item = FreeRegion>) {
        let mut incoming: Vec<FreeRegion> = regions.into_iter().filter(|r| r.length > 0).collect();
        incoming.sort_by_key(|r| r.lcn);
        self.regions.clear();
        for r in incoming {
            match self.regions.last_mut() {
                Some(last) if r.lcn <= last.end() => {
                    let end = last.end().max(r.end());
                    last.length = end - last.lcn;
                }
                _ => self.regions.push(r),
            }
        }
    }

    pub fn clear(&mut self) {
        self.regions.clear();
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &FreeRegion> {
        self.regions.iter()
    }

    pub fn as_slice(&self) -> &[FreeRegion] {
        &self.regions
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Mark `[lcn, lcn + length)` free, coalescing with neighbours.
    pub fn add(&mut self, lcn: u64, length: u64) {
        if length == 0 {
            return;
        }
        let mut start = lcn;
        let mut end = lcn + length;

        // First region that ends at or after `start` may touch the new one.
        let first = self.regions.partition_point(|r| r.end() < start);
        let mut last = first;
        while last < self.regions.len() && self.regions[last].lcn <= end {
            start = start.min(self.regions[last].lcn);
            end = end.max(self.regions[last].end());
            last += 1;
        }
        self.regions
            .splice(first..last, std::iter::once(FreeRegion::new(start, end - start)));
    }

    /// Mark `[lcn, lcn + length)` allocated.
    pub fn subtract(&mut self, lcn: u64, length: u64) {
        if length == 0 {
            return;
        }
        let end = lcn + length;
        let first = self.regions.partition_point(|r| r.end() <= lcn);
        let mut replacement = Vec::with_capacity(2);
        let mut last = first;
        while last < self.regions.len() && self.regions[last].lcn < end {
            let r = self.regions[last];
            match (r.lcn < lcn, r.end() > end) {
                // range strictly inside the region: split
                (true, true) => {
                    replacement.push(FreeRegion::new(r.lcn, lcn - r.lcn));
                    replacement.push(FreeRegion::new(end, r.end() - end));
                }
                // range covers the right part: truncate
                (true, false) => replacement.push(FreeRegion::new(r.lcn, lcn - r.lcn)),
                // range covers the left part: move start right
                (false, true) => replacement.push(FreeRegion::new(end, r.end() - end)),
                // region fully inside range: drop
                (false, false) => {}
            }
            last += 1;
        }
        self.regions.splice(first..last, replacement);
    }

    /// First region at or after `min_lcn` holding at least `min_length` clusters.
    pub fn find_first(&self, min_lcn: u64, min_length: u64) -> Option<FreeRegion> {
        self.regions
            .iter()
            .find(|r| r.lcn >= min_lcn && r.length >= min_length)
            .copied()
    }

    /// Last region at or after `min_lcn` holding at least `min_length` clusters.
    pub fn find_last(&self, min_lcn: u64, min_length: u64) -> Option<FreeRegion> {
        for r in self.regions.iter().rev() {
            if r.lcn < min_lcn {
                break;
            }
            if r.length >= min_length {
                return Some(*r);
            }
        }
        None
    }

    /// The largest region; the lowest one wins a tie.
    pub fn find_largest(&self) -> Option<FreeRegion> {
        let mut best: Option<FreeRegion> = None;
        for r in &self.regions {
            if best.map_or(true, |b| r.length > b.length) {
                best = Some(*r);
            }
        }
        best
    }

    pub fn total_clusters(&self) -> u64 {
        self.regions.iter().map(|r| r.length).sum()
    }

    /// Free clusters located at or after `lcn`, counting partial overlaps.
    pub fn free_clusters_after(&self, lcn: u64) -> u64 {
        self.regions
            .iter()
            .filter(|r| r.end() > lcn)
            .map(|r| r.end() - r.lcn.max(lcn))
            .sum()
    }

    /// Check the ordering invariants. Used by tests and debug assertions.
    pub fn is_normalized(&self) -> bool {
        self.regions.iter().all(|r| r.length > 0)
            && self.regions.windows(2).all(|w| w[0].end() < w[1].lcn)
    }
}
