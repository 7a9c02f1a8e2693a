/// Stateless block search over the whole catalog.
use super::{BlockFilter, FileBlockIndex, IndexError};
use crate::model::{Disposition, FileCatalog, FileId};

#[derive(Debug, Default, Clone, Copy)]
pub struct LinearScan;

impl FileBlockIndex for LinearScan {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn rebuild(&mut self, _catalog: &FileCatalog) -> Result<(), IndexError> {
        Ok(())
    }

    fn insert(&mut self, _id: FileId, _disposition: &Disposition) -> Result<(), IndexError> {
        Ok(())
    }

    fn remove(&mut self, _id: FileId, _disposition: &Disposition) -> Result<(), IndexError> {
        Ok(())
    }

    fn first_at_or_after(
        &self,
        catalog: &FileCatalog,
        min_lcn: u64,
        accept: &BlockFilter<'_>,
    ) -> Option<(FileId, usize)> {
        let mut best: Option<(u64, FileId, usize)> = None;
        for (id, file) in catalog.iter() {
            for (pos, block) in file.disposition.blocks.iter().enumerate() {
                if block.length == 0 || block.lcn < min_lcn {
                    continue;
                }
                if best.map_or(false, |(lcn, _, _)| block.lcn >= lcn) {
                    continue;
                }
                if accept(id, file, pos) {
                    best = Some((block.lcn, id, pos));
                }
            }
        }
        best.map(|(_, id, pos)| (id, pos))
    }
}
