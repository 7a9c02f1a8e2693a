/// Ordered lookup of file blocks by LCN.
///
/// The optimizer repeatedly asks "which movable block starts at or after
/// this LCN?". [`TreeIndex`] answers from a `BTreeMap` kept in sync by the
/// mover; [`LinearScan`] answers by walking the whole catalog and needs no
/// memory. Both return identical results, so a context that fails to
/// maintain the tree simply switches to the linear scan.
pub mod linear;
pub mod tree;

pub use linear::LinearScan;
pub use tree::TreeIndex;

use crate::model::{Disposition, FileCatalog, FileId, FileRecord};
use thiserror::Error;

/// Which files a block search may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchPolicy {
    /// Any file that can be moved at least partially.
    All,
    /// Only files that can be moved entirely.
    SkipPartiallyMovable,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    #[error("block index capacity exhausted")]
    Full,
    #[error("block index out of sync at lcn {0}")]
    Inconsistent(u64),
}

/// Candidate filter: `(file id, file, block position) -> accept`.
pub type BlockFilter<'a> = dyn Fn(FileId, &FileRecord, usize) -> bool + 'a;

pub trait FileBlockIndex: Send {
    /// Short name for logging.
    fn name(&self) -> &'static str;

    /// Drop all entries and index every block of `catalog`.
    fn rebuild(&mut self, catalog: &FileCatalog) -> Result<(), IndexError>;

    /// Index the blocks of one file.
    fn insert(&mut self, id: FileId, disposition: &Disposition) -> Result<(), IndexError>;

    /// Forget the blocks of one file.
    fn remove(&mut self, id: FileId, disposition: &Disposition) -> Result<(), IndexError>;

    /// The accepted non-empty block with the smallest LCN at or after
    /// `min_lcn`, as `(file, block position)`.
    fn first_at_or_after(
        &self,
        catalog: &FileCatalog,
        min_lcn: u64,
        accept: &BlockFilter<'_>,
    ) -> Option<(FileId, usize)>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Block, FileAttributes, FileRecord};

    fn catalog(seed: u64) -> FileCatalog {
        let mut cat = FileCatalog::default();
        let mut s = seed;
        let mut next_lcn = 0u64;
        let mut layouts: Vec<Vec<Block>> = vec![Vec::new(); 20];
        for i in 0..120u64 {
            s ^= s << 13;
            s ^= s >> 7;
            s ^= s << 17;
            let len = 1 + s % 6;
            let file = (s >> 8) as usize % layouts.len();
            let vcn = layouts[file].last().map(Block::end_vcn).unwrap_or(0);
            layouts[file].push(Block::new(vcn, next_lcn, len));
            next_lcn += len + (i % 3);
        }
        for (i, blocks) in layouts.into_iter().enumerate() {
            cat.push(FileRecord::new(
                format!(r"\??\C:\f{i}"),
                format!("f{i}"),
                FileAttributes::empty(),
                blocks,
            ));
        }
        cat
    }

    #[test]
    fn test_tree_and_linear_agree() {
        for seed in [1u64, 7, 99, 12_345] {
            let cat = catalog(seed);
            let mut tree = TreeIndex::new();
            tree.rebuild(&cat).unwrap();
            let linear = LinearScan;
            let odd_only = |id: FileId, _: &FileRecord, _: usize| id.0 % 2 == 1;
            let all = |_: FileId, _: &FileRecord, _: usize| true;
            for min_lcn in 0..700 {
                assert_eq!(
                    tree.first_at_or_after(&cat, min_lcn, &all),
                    linear.first_at_or_after(&cat, min_lcn, &all),
                    "seed {seed} lcn {min_lcn}"
                );
                assert_eq!(
                    tree.first_at_or_after(&cat, min_lcn, &odd_only),
                    linear.first_at_or_after(&cat, min_lcn, &odd_only),
                );
            }
        }
    }
}
