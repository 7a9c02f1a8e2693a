/// Arena-backed file catalog with the fragmented-files list.
///
/// All records live in a single `Vec<FileRecord>` and are addressed by
/// `FileId`. The fragmented list holds ids ordered by descending fragment
/// count; ties keep the most recently inserted file first.
use super::file_record::{FileId, FileRecord};

#[derive(Debug, Clone, Default)]
pub struct FileCatalog {
    files: Vec<FileRecord>,
    fragmented: Vec<FileId>,
}

impl FileCatalog {
    pub fn with_capacity(estimated_files: usize) -> Self {
        Self {
            files: Vec::with_capacity(estimated_files),
            fragmented: Vec::new(),
        }
    }

    /// Allocate a new record in the arena and return its id.
    pub fn push(&mut self, record: FileRecord) -> FileId {
        let id = FileId::new(self.files.len());
        self.files.push(record);
        id
    }

    #[inline]
    pub fn get(&self, id: FileId) -> &FileRecord {
        &self.files[id.idx()]
    }

    #[inline]
    pub fn get_mut(&mut self, id: FileId) -> &mut FileRecord {
        &mut self.files[id.idx()]
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn clear(&mut self) {
        self.files.clear();
        self.fragmented.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (FileId, &FileRecord)> {
        self.files
            .iter()
            .enumerate()
            .map(|(i, f)| (FileId::new(i), f))
    }

    pub fn ids(&self) -> impl Iterator<Item = FileId> {
        (0..self.files.len()).map(FileId::new)
    }

    pub fn records(&self) -> &[FileRecord] {
        &self.files
    }

    pub fn records_mut(&mut self) -> &mut [FileRecord] {
        &mut self.files
    }

    /// Find a file by its full native path (case-insensitive).
    pub fn find_by_path(&self, path: &str) -> Option<FileId> {
        self.iter()
            .find(|(_, f)| f.path.eq_ignore_ascii_case(path))
            .map(|(id, _)| id)
    }

    // ── Fragmented files list ──────────────────────────────────────────────

    /// Ids of fragmented, non-excluded files, most fragmented first.
    pub fn fragmented(&self) -> &[FileId] {
        &self.fragmented
    }

    /// Insert `id` into the fragmented list before the first entry whose
    /// fragment count is less than or equal to its own.
    ///
    /// Files that are not fragmented, are excluded, or are already listed
    /// are ignored.
    pub fn expand_fragmented(&mut self, id: FileId) {
        let file = &self.files[id.idx()];
        if !file.is_fragmented() || file.is_excluded() || self.fragmented.contains(&id) {
            return;
        }
        let fragments = file.disposition.fragments;
        let pos = self
            .fragmented
            .iter()
            .position(|other| self.files[other.idx()].disposition.fragments <= fragments)
            .unwrap_or(self.fragmented.len());
        self.fragmented.insert(pos, id);
    }

    /// Remove `id` from the fragmented list if present.
    pub fn truncate_fragmented(&mut self, id: FileId) {
        self.fragmented.retain(|&other| other != id);
    }

    /// Rebuild the fragmented list from scratch in arena order.
    pub fn rebuild_fragmented(&mut self) {
        self.fragmented.clear();
        for i in 0..self.files.len() {
            self.expand_fragmented(FileId::new(i));
        }
    }
}
