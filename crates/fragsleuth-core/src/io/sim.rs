/// In-memory simulated volume.
///
/// A `SimVolume` is described by a serde-loadable [`SimVolumeSpec`]: volume
/// geometry plus every file's extents. The free-space bitmap is derived
/// from the extents, so moves issued by the engine show up in the next
/// bitmap read exactly as they would on a real disk. Individual files can
/// be locked, can ignore or half-apply move requests, can refuse them, or
/// can report the target as already committed once, which is how the
/// engine's tolerance for an unreliable move primitive is exercised. Moves
/// are accepted only while a move session is open.
use super::{BitmapScan, MoveError, MoveHandle, ScanCallbacks, ScanScope, VolumeIo};
use crate::error::{DefragError, Result};
use crate::model::{Block, Disposition, FileAttributes, FileRecord, NtfsLayout, VolumeGeometry};
use crate::regions::FreeRegion;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// How a simulated file reacts to `move_clusters`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveBehavior {
    #[default]
    Normal,
    /// Accept the call but leave the clusters where they were.
    Ignore,
    /// Move only the first half of each request.
    Partial,
    /// Refuse every call.
    Reject,
    /// Report `AlreadyCommitted` for the first call, then behave normally.
    CommitOnce,
    /// Behave normally after a short delay, like a busy disk.
    Slow,
}

/// Delay applied by [`MoveBehavior::Slow`].
pub const SLOW_MOVE_DELAY: std::time::Duration = std::time::Duration::from_millis(20);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimFile {
    /// Path relative to the volume root, e.g. `dir\file.txt`.
    pub path: String,
    pub directory: bool,
    pub compressed: bool,
    pub sparse: bool,
    pub reparse: bool,
    pub temporary: bool,
    /// Opening for move fails.
    pub locked: bool,
    /// Extent re-query is unavailable.
    pub unreadable_extents: bool,
    pub behavior: MoveBehavior,
    pub blocks: Vec<Block>,
}

impl SimFile {
    pub fn new(path: impl Into<String>, blocks: Vec<Block>) -> Self {
        Self {
            path: path.into().replace('/', "\\"),
            blocks,
            ..Default::default()
        }
    }

    /// A file laid out as consecutive fragments `(lcn, length)`.
    pub fn with_fragments(path: impl Into<String>, fragments: &[(u64, u64)]) -> Self {
        let mut vcn = 0;
        let blocks = fragments
            .iter()
            .map(|&(lcn, length)| {
                let block = Block::new(vcn, lcn, length);
                vcn += length;
                block
            })
            .collect();
        Self::new(path, blocks)
    }

    pub fn directory(mut self) -> Self {
        self.directory = true;
        self
    }

    pub fn compressed(mut self) -> Self {
        self.compressed = true;
        self
    }

    pub fn locked(mut self) -> Self {
        self.locked = true;
        self
    }

    pub fn behavior(mut self, behavior: MoveBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    fn attributes(&self) -> FileAttributes {
        let mut attributes = FileAttributes::empty();
        attributes.set(FileAttributes::DIRECTORY, self.directory);
        attributes.set(FileAttributes::COMPRESSED, self.compressed);
        attributes.set(FileAttributes::SPARSE, self.sparse);
        attributes.set(FileAttributes::REPARSE_POINT, self.reparse);
        attributes.set(FileAttributes::TEMPORARY, self.temporary);
        attributes
    }

    fn name(&self) -> &str {
        self.path.rsplit('\\').next().unwrap_or(&self.path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimVolumeSpec {
    pub letter: char,
    pub fs_name: String,
    pub total_clusters: u64,
    pub bytes_per_cluster: u64,
    /// Zero means `total_clusters * bytes_per_cluster`.
    pub device_capacity: u64,
    pub dirty: bool,
    /// Report every bitmap read as partial.
    pub partial_bitmap: bool,
    pub ntfs: Option<NtfsLayout>,
    /// Allocated clusters owned by no listed file.
    pub reserved: Vec<FreeRegion>,
    pub files: Vec<SimFile>,
}

impl Default for SimVolumeSpec {
    fn default() -> Self {
        Self {
            letter: 'C',
            fs_name: "NTFS".into(),
            total_clusters: 0,
            bytes_per_cluster: 4096,
            device_capacity: 0,
            dirty: false,
            partial_bitmap: false,
            ntfs: None,
            reserved: Vec::new(),
            files: Vec::new(),
        }
    }
}

impl SimVolumeSpec {
    pub fn new(fs_name: &str, total_clusters: u64, bytes_per_cluster: u64) -> Self {
        Self {
            fs_name: fs_name.into(),
            total_clusters,
            bytes_per_cluster,
            ..Default::default()
        }
    }

    pub fn with_file(mut self, file: SimFile) -> Self {
        self.files.push(file);
        self
    }

    pub fn with_reserved(mut self, lcn: u64, length: u64) -> Self {
        self.reserved.push(FreeRegion::new(lcn, length));
        self
    }

    fn native_path(&self, file: &SimFile) -> String {
        format!(r"\??\{}:\{}", self.letter.to_ascii_uppercase(), file.path)
    }
}

/// A move accepted by the simulated volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimMove {
    pub path: String,
    pub vcn: u64,
    pub lcn: u64,
    pub count: u64,
}

#[derive(Debug)]
struct SimState {
    spec: SimVolumeSpec,
    handles: HashMap<usize, usize>,
    next_handle: usize,
    committed: HashSet<usize>,
    moves: Vec<SimMove>,
    bitmap_reads: usize,
    flushes: usize,
    /// Nesting depth of open move sessions.
    session_depth: usize,
    sessions_opened: usize,
    /// File scans started while a move session was open.
    scans_in_session: usize,
}

pub struct SimVolume {
    state: Mutex<SimState>,
}

impl SimVolume {
    pub fn new(spec: SimVolumeSpec) -> Self {
        Self {
            state: Mutex::new(SimState {
                spec,
                handles: HashMap::new(),
                next_handle: 1,
                committed: HashSet::new(),
                moves: Vec::new(),
                bitmap_reads: 0,
                flushes: 0,
                session_depth: 0,
                sessions_opened: 0,
                scans_in_session: 0,
            }),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let spec: SimVolumeSpec = serde_json::from_str(json)
            .map_err(|e| DefragError::Volume(format!("invalid volume description: {e}")))?;
        Ok(Self::new(spec))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| DefragError::Volume(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    /// Copy of the current volume description, including moved extents.
    pub fn snapshot(&self) -> SimVolumeSpec {
        self.state.lock().spec.clone()
    }

    /// Current blocks of the file at `path` (relative to the root).
    pub fn file_blocks(&self, path: &str) -> Option<Vec<Block>> {
        let state = self.state.lock();
        state
            .spec
            .files
            .iter()
            .find(|f| f.path.eq_ignore_ascii_case(path))
            .map(|f| f.blocks.clone())
    }

    pub fn moves(&self) -> Vec<SimMove> {
        self.state.lock().moves.clone()
    }

    pub fn bitmap_reads(&self) -> usize {
        self.state.lock().bitmap_reads
    }

    pub fn open_handles(&self) -> usize {
        self.state.lock().handles.len()
    }

    pub fn session_open(&self) -> bool {
        self.state.lock().session_depth > 0
    }

    /// Outermost move sessions opened so far.
    pub fn sessions_opened(&self) -> usize {
        self.state.lock().sessions_opened
    }

    pub fn scans_in_session(&self) -> usize {
        self.state.lock().scans_in_session
    }

    /// `true` if no cluster is owned twice and everything lies inside the volume.
    pub fn is_consistent(&self) -> bool {
        let state = self.state.lock();
        let mut ranges = allocated_ranges(&state.spec);
        ranges.sort_unstable();
        ranges
            .windows(2)
            .all(|w| w[0].0 + w[0].1 <= w[1].0)
            && ranges
                .iter()
                .all(|&(lcn, len)| lcn + len <= state.spec.total_clusters)
    }
}

/// `(lcn, length)` of every allocated run.
fn allocated_ranges(spec: &SimVolumeSpec) -> Vec<(u64, u64)> {
    spec.files
        .iter()
        .flat_map(|f| f.blocks.iter().map(|b| (b.lcn, b.length)))
        .chain(spec.reserved.iter().map(|r| (r.lcn, r.length)))
        .filter(|&(_, len)| len > 0)
        .collect()
}

fn overlaps(a_start: u64, a_len: u64, b_start: u64, b_len: u64) -> bool {
    a_start < b_start + b_len && b_start < a_start + a_len
}

/// Blocks of a file after `[vcn, vcn + count)` has been placed at `lcn`.
fn remap(blocks: &[Block], vcn: u64, count: u64, lcn: u64) -> Vec<Block> {
    let end = vcn + count;
    let moved = Block::new(vcn, lcn, count);
    let mut out = Vec::with_capacity(blocks.len() + 2);
    let mut inserted = false;
    for b in blocks {
        if b.end_vcn() <= vcn || b.vcn >= end {
            if b.vcn >= end && !inserted {
                out.push(moved);
                inserted = true;
            }
            out.push(*b);
            continue;
        }
        if b.vcn < vcn {
            out.push(Block::new(b.vcn, b.lcn, vcn - b.vcn));
        }
        if !inserted {
            out.push(moved);
            inserted = true;
        }
        if b.end_vcn() > end {
            let skip = end - b.vcn;
            out.push(Block::new(end, b.lcn + skip, b.end_vcn() - end));
        }
    }
    if !inserted {
        out.push(moved);
    }
    Disposition::new(out).to_fragments()
}

/// `true` if every VCN of `[vcn, vcn + count)` is mapped by `blocks`.
fn covers(blocks: &[Block], vcn: u64, count: u64) -> bool {
    let mut cursor = vcn;
    let end = vcn + count;
    for b in blocks {
        if b.vcn <= cursor && b.end_vcn() > cursor {
            cursor = b.end_vcn();
            if cursor >= end {
                return true;
            }
        }
    }
    cursor >= end
}

impl VolumeIo for SimVolume {
    fn geometry(&self) -> Result<VolumeGeometry> {
        let state = self.state.lock();
        let spec = &state.spec;
        let used: u64 = allocated_ranges(spec).iter().map(|&(_, len)| len).sum();
        let total_bytes = spec.total_clusters * spec.bytes_per_cluster;
        Ok(VolumeGeometry {
            total_clusters: spec.total_clusters,
            bytes_per_cluster: spec.bytes_per_cluster,
            device_capacity: if spec.device_capacity == 0 {
                total_bytes
            } else {
                spec.device_capacity
            },
            total_bytes,
            free_bytes: spec.total_clusters.saturating_sub(used) * spec.bytes_per_cluster,
            fs_name: spec.fs_name.clone(),
            is_dirty: spec.dirty,
            ntfs: spec.ntfs,
        })
    }

    fn free_regions(&self, allow_partial: bool) -> Result<BitmapScan> {
        let mut state = self.state.lock();
        state.bitmap_reads += 1;
        if state.spec.partial_bitmap && !allow_partial {
            return Err(DefragError::Volume("volume bitmap is unreadable".into()));
        }

        let mut ranges = allocated_ranges(&state.spec);
        ranges.sort_unstable();
        let mut regions = Vec::new();
        let mut cursor = 0u64;
        for (lcn, len) in ranges {
            if lcn > cursor {
                regions.push(FreeRegion::new(cursor, lcn - cursor));
            }
            cursor = cursor.max(lcn + len);
        }
        if cursor < state.spec.total_clusters {
            regions.push(FreeRegion::new(cursor, state.spec.total_clusters - cursor));
        }
        Ok(BitmapScan {
            regions,
            partial: state.spec.partial_bitmap,
        })
    }

    fn scan_files(
        &self,
        scope: &ScanScope,
        callbacks: &mut dyn ScanCallbacks,
    ) -> Result<Vec<FileRecord>> {
        let spec = {
            let mut state = self.state.lock();
            if state.session_depth > 0 {
                state.scans_in_session += 1;
            }
            state.spec.clone()
        };
        let mut out = Vec::with_capacity(spec.files.len());
        let mut skipped: Vec<String> = Vec::new();

        for file in &spec.files {
            if callbacks.terminate() {
                break;
            }
            let path = spec.native_path(file);
            let lower = path.to_ascii_lowercase();

            if let ScanScope::Directory { path: root, recursive } = scope {
                let prefix = format!("{}\\", root.trim_end_matches('\\').to_ascii_lowercase());
                match lower.strip_prefix(&prefix) {
                    Some(rest) if *recursive || !rest.contains('\\') => {}
                    _ => continue,
                }
            }
            if skipped.iter().any(|dir| lower.starts_with(dir.as_str())) {
                continue;
            }

            let mut record =
                FileRecord::new(path, file.name(), file.attributes(), file.blocks.clone());
            if callbacks.filter(&mut record) && record.is_dir() {
                skipped.push(format!("{lower}\\"));
            }
            if record.disposition.is_empty() {
                continue;
            }
            callbacks.progress(&record);
            out.push(record);
        }
        Ok(out)
    }

    fn begin_moves(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.session_depth == 0 {
            state.sessions_opened += 1;
        }
        state.session_depth += 1;
        Ok(())
    }

    fn end_moves(&self) {
        let mut state = self.state.lock();
        state.session_depth = state.session_depth.saturating_sub(1);
    }

    fn open_for_move(&self, path: &str) -> Result<MoveHandle> {
        let mut state = self.state.lock();
        let index = state
            .spec
            .files
            .iter()
            .position(|f| state.spec.native_path(f).eq_ignore_ascii_case(path))
            .ok_or_else(|| DefragError::Unmovable(format!("{path}: not found")))?;
        if state.spec.files[index].locked {
            return Err(DefragError::Unmovable(format!("{path}: sharing violation")));
        }
        let handle = state.next_handle;
        state.next_handle += 1;
        state.handles.insert(handle, index);
        Ok(MoveHandle(handle))
    }

    fn close(&self, handle: MoveHandle) {
        self.state.lock().handles.remove(&handle.0);
    }

    fn move_clusters(
        &self,
        handle: MoveHandle,
        vcn: u64,
        lcn: u64,
        count: u64,
    ) -> std::result::Result<(), MoveError> {
        let delay = {
            let state = self.state.lock();
            if state.session_depth == 0 {
                return Err(MoveError::Rejected("volume is not open for moves".into()));
            }
            state
                .handles
                .get(&handle.0)
                .is_some_and(|&i| state.spec.files[i].behavior == MoveBehavior::Slow)
        };
        if delay {
            std::thread::sleep(SLOW_MOVE_DELAY);
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let index = *state
            .handles
            .get(&handle.0)
            .ok_or_else(|| MoveError::Rejected("invalid handle".into()))?;
        let file = &state.spec.files[index];

        match file.behavior {
            MoveBehavior::Reject => {
                return Err(MoveError::Rejected("access denied".into()));
            }
            MoveBehavior::CommitOnce if !state.committed.contains(&index) => {
                state.committed.insert(index);
                return Err(MoveError::AlreadyCommitted);
            }
            _ => {}
        }

        if count == 0 || !covers(&file.blocks, vcn, count) {
            return Err(MoveError::Rejected(format!(
                "vcn range {vcn}+{count} is not mapped"
            )));
        }
        if lcn + count > state.spec.total_clusters {
            return Err(MoveError::Rejected(format!(
                "target {lcn}+{count} is beyond the end of the volume"
            )));
        }

        // The target may only overlap the clusters being moved.
        let source = remap(&file.blocks, vcn, count, u64::MAX / 2);
        let busy = state
            .spec
            .files
            .iter()
            .enumerate()
            .flat_map(|(i, f)| {
                let blocks = if i == index { source.clone() } else { f.blocks.clone() };
                blocks.into_iter().map(|b| (b.lcn, b.length))
            })
            .chain(state.spec.reserved.iter().map(|r| (r.lcn, r.length)))
            .any(|(start, len)| len > 0 && overlaps(lcn, count, start, len));
        if busy {
            return Err(MoveError::Rejected(format!("target {lcn}+{count} is in use")));
        }

        let applied = match file.behavior {
            MoveBehavior::Ignore => 0,
            MoveBehavior::Partial => count / 2,
            _ => count,
        };
        let path = state.spec.native_path(file);
        if applied > 0 {
            let blocks = remap(&state.spec.files[index].blocks, vcn, applied, lcn);
            state.spec.files[index].blocks = blocks;
        }
        state.moves.push(SimMove {
            path,
            vcn,
            lcn,
            count,
        });
        Ok(())
    }

    fn query_extents(&self, path: &str) -> Option<Vec<Block>> {
        let state = self.state.lock();
        let file = state
            .spec
            .files
            .iter()
            .find(|f| state.spec.native_path(f).eq_ignore_ascii_case(path))?;
        if file.unreadable_extents {
            return None;
        }
        Some(Disposition::new(file.blocks.clone()).to_fragments())
    }

    fn flush(&self) -> Result<()> {
        self.state.lock().flushes += 1;
        Ok(())
    }
}
