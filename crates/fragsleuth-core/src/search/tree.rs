/// `BTreeSet`-backed block index.
///
/// Entries are ordered by `(lcn, file, position)`, so blocks of different
/// files sharing an LCN are all kept and visited in catalog order.
use super::{BlockFilter, FileBlockIndex, IndexError};
use crate::model::{Disposition, FileCatalog, FileId};
use std::collections::BTreeSet;

#[derive(Debug, Default)]
pub struct TreeIndex {
    blocks: BTreeSet<(u64, FileId, u32)>,
    /// Upper bound on entries; exceeding it fails like an allocation failure.
    limit: Option<usize>,
}

impl TreeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// A tree that refuses to hold more than `limit` entries.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            blocks: BTreeSet::new(),
            limit: Some(limit),
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl FileBlockIndex for TreeIndex {
    fn name(&self) -> &'static str {
        "tree"
    }

    fn rebuild(&mut self, catalog: &FileCatalog) -> Result<(), IndexError> {
        self.blocks.clear();
        for (id, file) in catalog.iter() {
            self.insert(id, &file.disposition)?;
        }
        Ok(())
    }

    fn insert(&mut self, id: FileId, disposition: &Disposition) -> Result<(), IndexError> {
        for (pos, block) in disposition.blocks.iter().enumerate() {
            if block.length == 0 {
                continue;
            }
            let key = (block.lcn, id, pos as u32);
            if let Some(limit) = self.limit {
                if self.blocks.len() >= limit && !self.blocks.contains(&key) {
                    return Err(IndexError::Full);
                }
            }
            self.blocks.insert(key);
        }
        Ok(())
    }

    fn remove(&mut self, id: FileId, disposition: &Disposition) -> Result<(), IndexError> {
        for (pos, block) in disposition.blocks.iter().enumerate() {
            if block.length == 0 {
                continue;
            }
            if !self.blocks.remove(&(block.lcn, id, pos as u32)) {
                return Err(IndexError::Inconsistent(block.lcn));
            }
        }
        Ok(())
    }

    fn first_at_or_after(
        &self,
        catalog: &FileCatalog,
        min_lcn: u64,
        accept: &BlockFilter<'_>,
    ) -> Option<(FileId, usize)> {
        self.blocks
            .range((min_lcn, FileId(0), 0)..)
            .map(|&(_, id, pos)| (id, pos as usize))
            .find(|&(id, pos)| accept(id, catalog.get(id), pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Block, FileAttributes, FileRecord};
    use crate::search::LinearScan;

    #[test]
    fn test_limit_reports_full() {
        let mut tree = TreeIndex::with_limit(1);
        let disp = Disposition::new(vec![Block::new(0, 10, 1), Block::new(1, 20, 1)]);
        assert_eq!(tree.insert(FileId(0), &disp), Err(IndexError::Full));
    }

    #[test]
    fn test_remove_of_unknown_block_is_inconsistent() {
        let mut tree = TreeIndex::new();
        let disp = Disposition::new(vec![Block::new(0, 10, 1)]);
        assert_eq!(tree.remove(FileId(0), &disp), Err(IndexError::Inconsistent(10)));
    }

    #[test]
    fn test_insert_remove_roundtrip() {
        let mut cat = FileCatalog::default();
        let id = cat.push(FileRecord::new(
            r"\??\C:\a",
            "a",
            FileAttributes::empty(),
            vec![Block::new(0, 30, 2), Block::new(2, 10, 2), Block::new(4, 50, 0)],
        ));
        let mut tree = TreeIndex::new();
        tree.rebuild(&cat).unwrap();
        assert_eq!(tree.len(), 2);
        let all = |_: FileId, _: &FileRecord, _: usize| true;
        assert_eq!(tree.first_at_or_after(&cat, 0, &all), Some((id, 1)));
        assert_eq!(tree.first_at_or_after(&cat, 11, &all), Some((id, 0)));
        tree.remove(id, &cat.get(id).disposition).unwrap();
        assert!(tree.is_empty());
    }

    #[test]
    fn test_shared_lcn_matches_linear_scan() {
        let mut cat = FileCatalog::default();
        let first = cat.push(FileRecord::new(
            r"\??\C:\first",
            "first",
            FileAttributes::empty(),
            vec![Block::new(0, 40, 4)],
        ));
        let second = cat.push(FileRecord::new(
            r"\??\C:\second",
            "second",
            FileAttributes::empty(),
            vec![Block::new(0, 40, 4), Block::new(4, 90, 4)],
        ));
        let mut tree = TreeIndex::new();
        tree.rebuild(&cat).unwrap();
        assert_eq!(tree.len(), 3);

        let not_first = |id: FileId, _: &FileRecord, _: usize| id != first;
        let expected = LinearScan.first_at_or_after(&cat, 0, &not_first);
        assert_eq!(expected, Some((second, 0)));
        assert_eq!(tree.first_at_or_after(&cat, 0, &not_first), expected);

        let all = |_: FileId, _: &FileRecord, _: usize| true;
        assert_eq!(
            tree.first_at_or_after(&cat, 0, &all),
            LinearScan.first_at_or_after(&cat, 0, &all)
        );

        tree.remove(first, &cat.get(first).disposition).unwrap();
        assert_eq!(tree.first_at_or_after(&cat, 0, &all), Some((second, 0)));
        assert_eq!(
            tree.remove(first, &cat.get(first).disposition),
            Err(IndexError::Inconsistent(40))
        );
    }
}
