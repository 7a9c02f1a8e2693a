/// Per-file extent maps and status flags.
///
/// A file is described by its **Disposition**: the VCN-ordered list of
/// blocks the file system reports, plus cached cluster and fragment counts.
/// A fragment is a maximal run of blocks whose LCNs (and VCNs) follow each
/// other without a gap, so the fragment count never exceeds the block count.
use bitflags::bitflags;
use compact_str::CompactString;
use serde::{Deserialize, Serialize};

/// Lightweight index into the catalog's `Vec<FileRecord>`.
///
/// Uses `u32` to keep block index entries small.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub u32);

impl FileId {
    /// Create a new `FileId` from a `usize`, panicking in debug builds if it
    /// exceeds `u32::MAX`.
    #[inline]
    pub fn new(index: usize) -> Self {
        debug_assert!(index <= u32::MAX as usize, "FileId overflow");
        Self(index as u32)
    }

    /// Return the index as a `usize` for Vec indexing.
    #[inline]
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

/// One contiguous run of clusters reported for a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Block {
    pub vcn: u64,
    pub lcn: u64,
    pub length: u64,
}

impl Block {
    pub fn new(vcn: u64, lcn: u64, length: u64) -> Self {
        Self { vcn, lcn, length }
    }

    #[inline]
    pub fn end_vcn(&self) -> u64 {
        self.vcn + self.length
    }

    #[inline]
    pub fn end_lcn(&self) -> u64 {
        self.lcn + self.length
    }

    #[inline]
    fn continues(&self, prev: &Block) -> bool {
        self.lcn == prev.end_lcn() && self.vcn == prev.end_vcn()
    }
}

/// Extent map of a file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Disposition {
    pub blocks: Vec<Block>,
    pub clusters: u64,
    pub fragments: u64,
}

impl Disposition {
    /// Build a disposition and compute its cached counts.
    pub fn new(blocks: Vec<Block>) -> Self {
        let mut disp = Self {
            blocks,
            clusters: 0,
            fragments: 0,
        };
        disp.recount();
        disp
    }

    /// Recompute `clusters` and `fragments` from the block list.
    pub fn recount(&mut self) {
        self.clusters = self.blocks.iter().map(|b| b.length).sum();
        let mut fragments = 0;
        let mut prev: Option<&Block> = None;
        for block in self.blocks.iter().filter(|b| b.length > 0) {
            match prev {
                Some(p) if block.continues(p) => {}
                _ => fragments += 1,
            }
            prev = Some(block);
        }
        self.fragments = fragments;
    }

    /// Collapse LCN-contiguous blocks into fragments.
    ///
    /// Applying this to its own output yields the same list.
    pub fn to_fragments(&self) -> Vec<Block> {
        let mut out: Vec<Block> = Vec::with_capacity(self.blocks.len());
        for block in self.blocks.iter().filter(|b| b.length > 0) {
            match out.last_mut() {
                Some(last) if block.continues(last) => last.length += block.length,
                _ => out.push(*block),
            }
        }
        out
    }

    /// Replace the block list with its collapsed form.
    pub fn collapse(&mut self) {
        self.blocks = self.to_fragments();
        self.recount();
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    #[inline]
    pub fn first(&self) -> Option<&Block> {
        self.blocks.first()
    }

    #[inline]
    pub fn last(&self) -> Option<&Block> {
        self.blocks.last()
    }

    /// Index of the block holding `vcn`.
    pub fn block_containing(&self, vcn: u64) -> Option<usize> {
        self.blocks
            .iter()
            .position(|b| vcn >= b.vcn && vcn < b.end_vcn())
    }

    /// One past the last VCN of the file, or zero for an empty map.
    pub fn end_vcn(&self) -> u64 {
        self.blocks.last().map(Block::end_vcn).unwrap_or(0)
    }
}

bitflags! {
    /// Attributes reported by the file system.
    #[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Hash)]
    pub struct FileAttributes: u8 {
        const DIRECTORY     = 0b0000_0001;
        const COMPRESSED    = 0b0000_0010;
        const SPARSE        = 0b0000_0100;
        const REPARSE_POINT = 0b0000_1000;
        const TEMPORARY     = 0b0001_0000;
    }
}

bitflags! {
    /// Engine bookkeeping attached to each file.
    #[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Hash)]
    pub struct FileFlags: u16 {
        /// Excluded from processing by any filter.
        const EXCLUDED               = 1 << 0;
        /// Larger than the size limit.
        const OVER_LIMIT             = 1 << 1;
        /// Excluded by the include / exclude / cut path lists.
        const EXCLUDED_BY_PATH       = 1 << 2;
        /// The open attempt failed.
        const LOCKED                 = 1 << 3;
        /// The open attempt succeeded.
        const NOT_LOCKED             = 1 << 4;
        /// Already handled in the current pass.
        const CURRENTLY_EXCLUDED     = 1 << 5;
        const MOVED_TO_FRONT         = 1 << 6;
        const MOVING_FAILED          = 1 << 7;
        const IMPROPER_STATE         = 1 << 8;
        /// Fragmented by the MFT / directory optimizer while clearing space.
        const FRAGMENTED_BY_FILE_OPT = 1 << 9;
        const REGION_NOT_FOUND       = 1 << 10;
    }
}

/// A single file or directory known to the engine.
#[derive(Debug, Clone)]
pub struct FileRecord {
    /// Full native path, e.g. `\??\C:\dir\file`.
    pub path: CompactString,
    /// Name component only.
    pub name: CompactString,
    pub attributes: FileAttributes,
    pub flags: FileFlags,
    pub disposition: Disposition,
}

impl FileRecord {
    pub fn new(
        path: impl Into<CompactString>,
        name: impl Into<CompactString>,
        attributes: FileAttributes,
        blocks: Vec<Block>,
    ) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            attributes,
            flags: FileFlags::empty(),
            disposition: Disposition::new(blocks),
        }
    }

    #[inline]
    pub fn is_dir(&self) -> bool {
        self.attributes.contains(FileAttributes::DIRECTORY)
    }

    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.attributes.contains(FileAttributes::COMPRESSED)
    }

    #[inline]
    pub fn is_temporary(&self) -> bool {
        self.attributes.contains(FileAttributes::TEMPORARY)
    }

    #[inline]
    pub fn is_fragmented(&self) -> bool {
        self.disposition.fragments > 1
    }

    #[inline]
    pub fn is_excluded(&self) -> bool {
        self.flags.contains(FileFlags::EXCLUDED)
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.flags.contains(FileFlags::LOCKED)
    }

    #[inline]
    pub fn is_over_limit(&self) -> bool {
        self.flags.contains(FileFlags::OVER_LIMIT)
    }

    /// Allocated size in bytes.
    #[inline]
    pub fn size_bytes(&self, bytes_per_cluster: u64) -> u64 {
        self.disposition.clusters * bytes_per_cluster
    }

    /// Path without the `\??\` native prefix.
    pub fn display_path(&self) -> &str {
        self.path.strip_prefix(r"\??\").unwrap_or(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_count() {
        let disp = Disposition::new(vec![
            Block::new(0, 100, 4),
            Block::new(4, 104, 4),
            Block::new(8, 50, 2),
        ]);
        assert_eq!(disp.clusters, 10);
        assert_eq!(disp.fragments, 2);
        assert_eq!(
            disp.to_fragments(),
            vec![Block::new(0, 100, 8), Block::new(8, 50, 2)]
        );
    }

    #[test]
    fn test_fragments_are_idempotent() {
        let disp = Disposition::new(vec![
            Block::new(0, 10, 5),
            Block::new(5, 15, 5),
            Block::new(10, 40, 1),
            Block::new(11, 41, 3),
            Block::new(14, 7, 2),
        ]);
        let once = Disposition::new(disp.to_fragments());
        let twice = Disposition::new(once.to_fragments());
        assert_eq!(once, twice);
        assert_eq!(once.fragments, disp.fragments);
        assert_eq!(once.clusters, disp.clusters);
        assert!(disp.fragments <= disp.blocks.len() as u64);
    }

    #[test]
    fn test_zero_length_blocks_are_ignored() {
        let disp = Disposition::new(vec![Block::new(0, 10, 0)]);
        assert_eq!(disp.fragments, 0);
        assert!(disp.to_fragments().is_empty());
    }

    #[test]
    fn test_block_containing() {
        let disp = Disposition::new(vec![Block::new(0, 10, 5), Block::new(5, 30, 5)]);
        assert_eq!(disp.block_containing(0), Some(0));
        assert_eq!(disp.block_containing(7), Some(1));
        assert_eq!(disp.block_containing(10), None);
        assert_eq!(disp.end_vcn(), 10);
    }

    #[test]
    fn test_display_path() {
        let f = FileRecord::new(r"\??\C:\dir\a.txt", "a.txt", FileAttributes::empty(), vec![]);
        assert_eq!(f.display_path(), r"C:\dir\a.txt");
    }
}
