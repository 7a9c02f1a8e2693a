/// Volume optimization.
///
/// Sorts small files by path at the beginning of the volume. On FAT the
/// directories are compacted behind their first cluster; on NTFS the same
/// is done for the MFT. Every optimization ends with a defragmentation
/// pass that cleans up what the moves left fragmented.
use super::analyze::analyze;
use super::context::JobContext;
use super::defrag::defragment;
use super::mover::move_file;
use super::select::{can_move, can_move_entirely, find_first_block};
use crate::error::{DefragError, Result};
use crate::io::MoveError;
use crate::job::options::{OPTIMIZER_GROUP_FILE_COUNT, OPTIMIZER_MAGIC_CONSTANT};
use crate::job::progress::{JobKind, Phase};
use crate::map::is_mft;
use crate::model::size::format_size;
use crate::model::{Block, Disposition, FileFlags, FileId, FileRecord};
use crate::regions::FreeRegion;
use crate::search::SearchPolicy;
use std::time::Instant;
use tracing::{debug, info, warn};

// ── Helpers ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cleanup {
    Done,
    /// No free region outside the reserved range is left.
    NoSpace,
    MoveFailed,
}

/// Move `clusters` clusters of file `id` starting at `vcn` into the last
/// free regions lying outside `[reserved_start, reserved_end]`.
fn cleanup_space(
    ctx: &mut JobContext,
    id: FileId,
    mut vcn: u64,
    mut clusters: u64,
    reserved_start: u64,
    reserved_end: u64,
) -> Cleanup {
    while clusters > 0 {
        let region = ctx
            .free
            .iter()
            .rev()
            .find(|r| r.length > 0 && (r.lcn > reserved_end || r.end() <= reserved_start))
            .copied();
        let Some(region) = region else {
            return Cleanup::NoSpace;
        };
        let n = region.length.min(clusters);
        if move_file(ctx, id, vcn, n, region.end() - n).is_err() {
            return Cleanup::MoveFailed;
        }
        vcn += n;
        clusters -= n;
    }
    Cleanup::Done
}

/// The VCN `n` clusters after `vcn`, skipping gaps between blocks.
/// `None` if the file ends before that.
fn advance_vcn(disp: &Disposition, vcn: u64, n: u64) -> Option<u64> {
    if n == 0 {
        return Some(vcn);
    }
    let blocks = &disp.blocks;
    let mut n = n;
    let mut current = vcn;
    for (i, block) in blocks.iter().enumerate() {
        if block.end_vcn() <= vcn {
            continue;
        }
        current = current.max(block.vcn);
        let left = block.end_vcn() - current;
        if n > left {
            n -= left;
            current = blocks.get(i + 1)?.vcn;
        } else if n == left {
            return Some(blocks.get(i + 1).map_or(block.end_vcn(), |b| b.vcn));
        } else {
            return Some(current + n);
        }
    }
    None
}

fn first_lcn(file: &FileRecord) -> u64 {
    file.disposition.first().map_or(0, |b| b.lcn)
}

fn clear_currently_excluded(ctx: &mut JobContext) {
    for file in ctx.catalog.records_mut() {
        file.flags.remove(FileFlags::CURRENTLY_EXCLUDED);
    }
}

fn log_moved(ctx: &JobContext, what: &str, started: Instant) {
    let moved = ctx.stats.moved_clusters;
    info!(
        "{what}: {moved} clusters moved ({}) in {:.2?}",
        format_size(moved * ctx.volume.bytes_per_cluster),
        started.elapsed()
    );
}

/// Allocated clusters between `start_lcn` and the end of the volume.
fn count_clusters(ctx: &mut JobContext, start_lcn: u64) -> u64 {
    ctx.release_temp_space();
    let started = Instant::now();
    let free = ctx.free.free_clusters_after(start_lcn);
    ctx.counters.searching += started.elapsed();
    ctx.volume
        .total_clusters
        .saturating_sub(start_lcn)
        .saturating_sub(free)
}

// ── File compaction ──────────────────────────────────────────────────────────

/// Result of [`optimize_file`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOptimization {
    /// Not fragmented or not movable.
    Skipped,
    Optimized,
    /// Some clusters could not be placed behind the leading block.
    Incomplete,
}

/// Place every fragment of the file right after its leading block,
/// evicting other files' data to the end of the volume where needed.
/// Evicted files are flagged `FRAGMENTED_BY_FILE_OPT`.
pub fn optimize_file(ctx: &mut JobContext, id: FileId) -> FileOptimization {
    let file = ctx.catalog.get(id);
    if !can_move(file) || !file.is_fragmented() {
        return FileOptimization::Skipped;
    }
    let disp = &file.disposition;
    let (Some(head), Some(second)) = (disp.blocks.first().copied(), disp.blocks.get(1).copied())
    else {
        return FileOptimization::Skipped;
    };
    let mut to_process = disp.clusters - head.length;
    if to_process == 0 {
        return FileOptimization::Skipped;
    }
    if ctx.is_file_locked(id) {
        return FileOptimization::Incomplete;
    }

    let first_cluster = head.lcn;
    let mut start_lcn = head.end_lcn();
    let mut start_vcn = second.vcn;

    'pass: while to_process > 0 {
        if ctx.terminated() {
            break;
        }
        ctx.release_temp_space();
        if ctx.free.is_empty() {
            break;
        }

        let started = Instant::now();
        let mut target = ctx.free.find_first(start_lcn, 1);
        ctx.counters.searching += started.elapsed();

        // evict whatever lies between start_lcn and the target region
        let end_lcn = target.map_or(ctx.volume.total_clusters, |r| r.lcn);
        let mut to_cleanup = to_process;
        let mut cleaned: Option<FreeRegion> = None;
        while to_cleanup > 0 {
            if ctx.terminated() {
                break 'pass;
            }
            let mut min_lcn = start_lcn;
            let Some((owner, pos)) = find_first_block(ctx, &mut min_lcn, SearchPolicy::All) else {
                break;
            };
            let block = ctx.catalog.get(owner).disposition.blocks[pos];
            if block.lcn >= end_lcn {
                break;
            }
            if let Some(region) = cleaned {
                if block.lcn != region.end() || owner == id {
                    break;
                }
            }

            // already in place
            if owner == id && block.vcn == start_vcn {
                let next = ctx.catalog.get(id).disposition.blocks.get(pos + 1).map(|b| b.vcn);
                match next {
                    Some(next_vcn) if to_process > block.length => {
                        to_process -= block.length;
                        to_cleanup = to_cleanup.saturating_sub(block.length);
                        start_vcn = next_vcn;
                        start_lcn = block.end_lcn();
                        continue;
                    }
                    _ => {
                        to_process = 0;
                        break 'pass;
                    }
                }
            }

            let n = to_cleanup.min(block.length);
            let result = cleanup_space(ctx, owner, block.vcn, n, first_cluster, block.end_lcn() - 1);
            if result == Cleanup::NoSpace {
                break 'pass;
            }
            if owner != id {
                ctx.catalog
                    .get_mut(owner)
                    .flags
                    .insert(FileFlags::FRAGMENTED_BY_FILE_OPT);
            }
            if result == Cleanup::MoveFailed {
                if cleaned.is_none() {
                    start_lcn = block.lcn + n;
                    continue 'pass;
                }
                break;
            }

            let region = cleaned.get_or_insert(FreeRegion::new(block.lcn, 0));
            region.length += n;
            target = Some(*region);
            start_lcn = region.end();
            to_cleanup -= n;
        }

        let Some(target) = target else {
            break;
        };
        let n = to_process.min(target.length);
        let next_vcn = advance_vcn(&ctx.catalog.get(id).disposition, start_vcn, n);
        if move_file(ctx, id, start_vcn, n, target.lcn).is_err() {
            if ctx.last_move_status != Some(MoveError::AlreadyCommitted) {
                break;
            }
            // the target is taken; try the space behind it
            ctx.catalog.get_mut(id).flags.remove(FileFlags::MOVING_FAILED);
            start_lcn = target.lcn + n;
            continue;
        }
        to_process -= n;
        start_lcn = target.lcn + n;
        match next_vcn {
            Some(vcn) => start_vcn = vcn,
            None => {
                debug!("vcn calculation failed for {}", ctx.catalog.get(id).display_path());
                break;
            }
        }
    }

    if ctx.terminated() || to_process == 0 {
        FileOptimization::Optimized
    } else {
        FileOptimization::Incomplete
    }
}

fn optimize_directories_cc(ctx: &JobContext) -> u64 {
    ctx.catalog
        .fragmented()
        .iter()
        .map(|&id| ctx.catalog.get(id))
        .filter(|f| f.is_dir() && can_move(f))
        .map(|f| f.disposition.clusters * 2)
        .sum()
}

/// Compact fragmented directories on FAT volumes.
fn optimize_directories(ctx: &mut JobContext) -> Result<()> {
    let _session = ctx.begin_moves()?;
    ctx.stats.phase = Phase::Optimization;
    ctx.stats.moved_clusters = 0;
    let is_fat = ctx.volume.is_fat;
    for file in ctx.catalog.records_mut() {
        file.flags.remove(FileFlags::CURRENTLY_EXCLUDED);
        if is_fat && file.is_dir() && !file.is_fragmented() {
            file.flags.insert(FileFlags::CURRENTLY_EXCLUDED);
        }
    }

    let started = Instant::now();
    let mut optimized = 0u64;
    for id in ctx.catalog.fragmented().to_vec() {
        if ctx.terminated() {
            break;
        }
        let file = ctx.catalog.get(id);
        if file.is_dir() && can_move(file) && optimize_file(ctx, id) == FileOptimization::Optimized
        {
            optimized += 1;
        }
        ctx.catalog
            .get_mut(id)
            .flags
            .insert(FileFlags::CURRENTLY_EXCLUDED);
    }
    info!("{optimized} directories optimized");
    log_moved(ctx, "directories optimization", started);
    Ok(())
}

fn find_mft(ctx: &JobContext) -> Option<FileId> {
    ctx.catalog
        .iter()
        .find(|(_, f)| is_mft(&ctx.volume, f))
        .map(|(id, _)| id)
}

fn optimize_mft_cc(ctx: &JobContext) -> u64 {
    find_mft(ctx).map_or(0, |id| ctx.catalog.get(id).disposition.clusters * 2)
}

fn list_mft_blocks(ctx: &JobContext, id: FileId, when: &str) {
    debug!("{when} $mft map:");
    for (i, block) in ctx.catalog.get(id).disposition.blocks.iter().enumerate() {
        debug!("mft part #{i} start: {}, length: {}", block.lcn, block.length);
    }
}

fn optimize_mft_routine(ctx: &mut JobContext) -> Result<()> {
    ctx.stats.phase = Phase::Optimization;
    ctx.stats.moved_clusters = 0;
    clear_currently_excluded(ctx);

    let started = Instant::now();
    let Some(mft) = find_mft(ctx) else {
        warn!("cannot find $mft file");
        return Err(DefragError::Volume("cannot find $mft file".into()));
    };
    let _session = ctx.begin_moves()?;
    list_mft_blocks(ctx, mft, "initial");
    let result = optimize_file(ctx, mft);
    debug!("mft optimization result: {result:?}");
    list_mft_blocks(ctx, mft, "final");
    log_moved(ctx, "mft optimization", started);
    Ok(())
}

// ── Whole-volume sort ────────────────────────────────────────────────────────

/// Whether `move_files_to_back` should evict the block.
fn is_block_quite_small(ctx: &JobContext, file: &FileRecord, block: &Block) -> bool {
    let bpc = ctx.volume.bytes_per_cluster;
    if file.disposition.clusters * bpc < ctx.options.effective_optimizer_size_limit() {
        return true;
    }
    if !file.is_fragmented() {
        return false;
    }
    let threshold = ctx.fragment_size_threshold;
    if threshold == 0 {
        return true;
    }
    if block.length * bpc >= threshold {
        return false;
    }
    !file
        .disposition
        .to_fragments()
        .iter()
        .find(|f| block.lcn >= f.lcn && block.lcn < f.end_lcn())
        .is_some_and(|f| f.length * bpc >= threshold)
}

/// Evict small files and fragments from `*start_lcn` onwards to the end of
/// the volume. When space runs out, `*start_lcn` is left at the first
/// block that could not be moved; otherwise it is set past the volume end.
fn move_files_to_back(ctx: &mut JobContext, start_lcn: &mut u64) {
    let started = Instant::now();
    ctx.stats.moved_clusters = 0;
    ctx.release_temp_space();

    let mut min_lcn = *start_lcn;
    let mut exhausted = false;
    while !ctx.terminated() {
        let Some((id, pos)) = find_first_block(ctx, &mut min_lcn, SearchPolicy::SkipPartiallyMovable)
        else {
            break;
        };
        let file = ctx.catalog.get(id);
        let block = file.disposition.blocks[pos];
        if !is_block_quite_small(ctx, file, &block) {
            continue;
        }
        if cleanup_space(ctx, id, block.vcn, block.length, 0, block.end_lcn() - 1) == Cleanup::NoSpace
        {
            *start_lcn = block.lcn;
            exhausted = true;
            break;
        }
    }
    if !exhausted {
        *start_lcn = ctx.volume.total_clusters;
    }
    log_moved(ctx, "file moving to end", started);
}

/// Place files from `order[*cursor..]` at the lowest region at or after
/// `*start_lcn` that begins before `end_lcn`. Stops at the first file
/// that does not fit, leaving `*cursor` on it.
fn move_files_to_front(
    ctx: &mut JobContext,
    start_lcn: &mut u64,
    end_lcn: u64,
    order: &[FileId],
    cursor: &mut usize,
) {
    let started = Instant::now();
    ctx.stats.moved_clusters = 0;
    ctx.release_temp_space();
    let bpc = ctx.volume.bytes_per_cluster;
    let mut skipped = 0u64;

    while let Some(&id) = order.get(*cursor) {
        if ctx.terminated() {
            break;
        }
        let file = ctx.catalog.get(id);
        if can_move_entirely(&ctx.volume, file) {
            let clusters = file.disposition.clusters;
            let vcn = file.disposition.first().map_or(0, |b| b.vcn);
            let region = ctx
                .free
                .find_first(*start_lcn, clusters)
                .filter(|r| r.lcn < end_lcn);
            let Some(region) = region else {
                // a file missing its region twice is skipped, as are the
                // big ones following it when nothing has moved yet
                if file.flags.contains(FileFlags::REGION_NOT_FOUND)
                    || (skipped > 0 && ctx.stats.moved_clusters == 0)
                {
                    skipped += 1;
                    *cursor += 1;
                    continue;
                }
                ctx.catalog
                    .get_mut(id)
                    .flags
                    .insert(FileFlags::REGION_NOT_FOUND);
                break;
            };
            if move_file(ctx, id, vcn, clusters, region.lcn).is_ok()
                && clusters * bpc < OPTIMIZER_MAGIC_CONSTANT
            {
                *start_lcn = region.lcn + 1;
            }
            ctx.catalog
                .get_mut(id)
                .flags
                .insert(FileFlags::MOVED_TO_FRONT);
        }
        *cursor += 1;
    }
    if skipped > 0 {
        debug!("{skipped} files skipped");
    }
    log_moved(ctx, "file moving to front", started);
}

/// A run of path-ordered files that already sit close together.
struct Group {
    start: usize,
    files: u64,
    clusters: u64,
    /// First LCN of the file before the previous one.
    pplcn: Option<u64>,
    /// First LCN of the previous file.
    plcn: u64,
    prev_clusters: u64,
}

impl Group {
    fn starting_at(start: usize, file: &FileRecord) -> Self {
        Self {
            start,
            files: 1,
            clusters: file.disposition.clusters,
            pplcn: None,
            plcn: first_lcn(file),
            prev_clusters: file.disposition.clusters,
        }
    }

    fn admits(&self, file: &FileRecord, bpc: u64) -> bool {
        if file.is_fragmented() {
            return false;
        }
        let lcn = first_lcn(file);
        if self.pplcn.is_some_and(|pplcn| lcn < pplcn && lcn < self.plcn) {
            return false;
        }
        let (distance, length) = if lcn < self.plcn {
            (self.plcn - lcn, file.disposition.clusters)
        } else {
            (lcn - self.plcn, self.prev_clusters)
        };
        distance * bpc <= OPTIMIZER_MAGIC_CONSTANT.max(length * bpc)
    }

    fn push(&mut self, file: &FileRecord) {
        self.files += 1;
        self.clusters += file.disposition.clusters;
        self.pplcn = Some(self.plcn);
        self.plcn = first_lcn(file);
        self.prev_clusters = file.disposition.clusters;
    }
}

/// Mark the group as already optimized if it is large enough.
fn cut_off_group(ctx: &mut JobContext, order: &[FileId], group: &Group) {
    if group.files < 2 {
        return;
    }
    if group.clusters * ctx.volume.bytes_per_cluster < OPTIMIZER_MAGIC_CONSTANT
        && group.files < OPTIMIZER_GROUP_FILE_COUNT
    {
        return;
    }
    let end = group.start + group.files as usize;
    for &id in &order[group.start..end] {
        let file = ctx.catalog.get_mut(id);
        file.flags.insert(FileFlags::MOVED_TO_FRONT);
        ctx.already_optimized_clusters += file.disposition.clusters;
    }
}

/// Mark groups of files that are already sorted out so the quick
/// optimization leaves them alone.
fn cut_off_sorted_out_files(ctx: &mut JobContext, order: &[FileId]) {
    let started = Instant::now();
    ctx.already_optimized_clusters = 0;
    let bpc = ctx.volume.bytes_per_cluster;
    let next_unfragmented =
        |ctx: &JobContext, from: usize| (from..order.len()).find(|&i| !ctx.catalog.get(order[i]).is_fragmented());

    if let Some(first) = next_unfragmented(ctx, 0) {
        let mut group = Group::starting_at(first, ctx.catalog.get(order[first]));
        let mut i = first + 1;
        while i < order.len() {
            let file = ctx.catalog.get(order[i]);
            if group.admits(file, bpc) {
                group.push(file);
                i += 1;
                continue;
            }
            cut_off_group(ctx, order, &group);
            let Some(next) = next_unfragmented(ctx, i) else {
                group.files = 0;
                break;
            };
            group = Group::starting_at(next, ctx.catalog.get(order[next]));
            i = next + 1;
        }
        cut_off_group(ctx, order, &group);
    }

    let skipped = ctx.already_optimized_clusters;
    info!(
        "{skipped} clusters skipped ({}) in {:.2?}",
        format_size(skipped * bpc),
        started.elapsed()
    );
}

fn optimize_routine(ctx: &mut JobContext, extra_clusters: u64) -> Result<()> {
    let _session = ctx.begin_moves()?;
    ctx.stats.phase = Phase::Optimization;
    ctx.stats.processed_clusters = extra_clusters;
    // everything may move to the end and back again
    ctx.stats.clusters_to_process = count_clusters(ctx, 0) * 2 + extra_clusters;
    clear_currently_excluded(ctx);

    let started = Instant::now();
    let bpc = ctx.volume.bytes_per_cluster;
    let limit = ctx.options.effective_optimizer_size_limit();
    let mut order: Vec<FileId> = ctx
        .catalog
        .iter()
        .filter(|(_, f)| f.disposition.clusters * bpc < limit && can_move_entirely(&ctx.volume, f))
        .map(|(id, _)| id)
        .collect();
    order.sort_by_cached_key(|&id| ctx.catalog.get(id).path.to_lowercase());
    debug!("{} files to sort out", order.len());

    if ctx.kind == JobKind::QuickOptimize {
        cut_off_sorted_out_files(ctx, &order);
    }

    let (mut start_lcn, mut end_lcn, mut cursor) = (0, 0, 0);
    ctx.stats.pass_number = 0;
    while cursor < order.len() && !ctx.terminated() {
        info!("volume optimization pass #{}", ctx.stats.pass_number);
        ctx.stats.processed_clusters = ctx
            .stats
            .clusters_to_process
            .saturating_sub(count_clusters(ctx, start_lcn) * 2);

        move_files_to_back(ctx, &mut end_lcn);
        if ctx.terminated() {
            break;
        }
        move_files_to_front(ctx, &mut start_lcn, end_lcn, &order, &mut cursor);
        if cursor >= order.len() {
            break;
        }
        ctx.stats.pass_number += 1;
    }
    info!("optimization completed in {:.2?}", started.elapsed());
    Ok(())
}

// ── Entry points ─────────────────────────────────────────────────────────────

/// Full or quick optimization of the volume.
pub fn optimize(ctx: &mut JobContext) -> Result<()> {
    // only path filters apply to optimization
    ctx.options.size_limit = 0;
    ctx.options.fragments_limit = 0;
    analyze(ctx)?;

    ctx.stats.processed_clusters = 0;
    let mut extra_clusters = 0;
    if ctx.volume.is_fat {
        extra_clusters += optimize_directories_cc(ctx);
    }
    if ctx.volume.is_ntfs() {
        extra_clusters += optimize_mft_cc(ctx);
    }
    ctx.stats.clusters_to_process = count_clusters(ctx, 0) * 2 + extra_clusters;

    if ctx.volume.is_fat {
        optimize_directories(ctx)?;
    }
    if ctx.volume.is_ntfs() {
        if let Err(e) = optimize_mft_routine(ctx) {
            warn!("mft optimization failed: {e}");
        }
    }
    optimize_routine(ctx, extra_clusters)?;

    defragment(ctx)
}

/// Compact the MFT, then defragment the files that got in its way.
pub fn optimize_mft(ctx: &mut JobContext) -> Result<()> {
    analyze(ctx)?;

    if !ctx.volume.is_ntfs() {
        info!("mft optimization is not applicable to {}", ctx.volume.fs_name);
        ctx.stats.processed_clusters = 0;
        ctx.stats.clusters_to_process = 1;
        ctx.stats.phase = Phase::Optimization;
        return Ok(());
    }

    ctx.stats.processed_clusters = 0;
    ctx.stats.clusters_to_process = optimize_mft_cc(ctx);
    let result = optimize_mft_routine(ctx);
    defragment(ctx)?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::{analyzed, context, context_with};
    use crate::io::sim::{SimFile, SimVolumeSpec};
    use crate::job::options::JobOptions;
    use crate::model::FileAttributes;

    fn disp(runs: &[(u64, u64, u64)]) -> Disposition {
        Disposition::new(runs.iter().map(|&(v, l, n)| Block::new(v, l, n)).collect())
    }

    fn fragments(blocks: Vec<Block>) -> Vec<Block> {
        Disposition::new(blocks).to_fragments()
    }

    #[test]
    fn test_advance_vcn() {
        let d = disp(&[(0, 100, 10), (10, 300, 5), (20, 500, 5)]);
        assert_eq!(advance_vcn(&d, 10, 0), Some(10));
        assert_eq!(advance_vcn(&d, 10, 3), Some(13));
        assert_eq!(advance_vcn(&d, 10, 5), Some(20));
        assert_eq!(advance_vcn(&d, 10, 7), Some(22));
        assert_eq!(advance_vcn(&d, 20, 5), Some(25));
        assert_eq!(advance_vcn(&d, 20, 6), None);
    }

    #[test]
    fn test_count_clusters() {
        let spec = SimVolumeSpec::new("FAT32", 100, 4096)
            .with_file(SimFile::with_fragments("a", &[(10, 5)]))
            .with_file(SimFile::with_fragments("b", &[(60, 5)]));
        let (_sim, mut ctx) = analyzed(spec, JobKind::FullOptimize, JobOptions::default());
        assert_eq!(count_clusters(&mut ctx, 0), 10);
        assert_eq!(count_clusters(&mut ctx, 50), 5);
        assert_eq!(count_clusters(&mut ctx, 100), 0);
    }

    #[test]
    fn test_is_block_quite_small() {
        let mut ctx = context(SimVolumeSpec::new("NTFS", 100_000, 4096), JobKind::FullOptimize);
        ctx.volume.bytes_per_cluster = 4096;
        ctx.options.optimizer_size_limit = 64 * 1024;

        let small = FileRecord::new(r"\??\C:\s", "s", FileAttributes::empty(), vec![Block::new(0, 10, 4)]);
        assert!(is_block_quite_small(&ctx, &small, &small.disposition.blocks[0]));

        let big = FileRecord::new(r"\??\C:\b", "b", FileAttributes::empty(), vec![Block::new(0, 100, 64)]);
        assert!(!is_block_quite_small(&ctx, &big, &big.disposition.blocks[0]));

        let split = FileRecord::new(
            r"\??\C:\f",
            "f",
            FileAttributes::empty(),
            vec![Block::new(0, 200, 64), Block::new(64, 400, 2)],
        );
        assert!(is_block_quite_small(&ctx, &split, &split.disposition.blocks[0]));
        ctx.fragment_size_threshold = 32 * 1024;
        assert!(!is_block_quite_small(&ctx, &split, &split.disposition.blocks[0]));
        assert!(is_block_quite_small(&ctx, &split, &split.disposition.blocks[1]));
    }

    fn mft_volume(total: u64) -> SimVolumeSpec {
        SimVolumeSpec::new("NTFS", total, 4096)
    }

    #[test]
    fn test_mft_moves_next_to_its_leading_block() {
        let spec = mft_volume(5050)
            .with_reserved(200, 4800)
            .with_file(SimFile::with_fragments("$Mft", &[(0, 100), (5000, 50)]));
        let (sim, mut ctx) = context_with(spec, JobKind::OptimizeMft, JobOptions::default());
        optimize_mft(&mut ctx).unwrap();
        assert_eq!(
            fragments(sim.file_blocks("$Mft").unwrap()),
            vec![Block::new(0, 0, 150)]
        );
        let mft = find_mft(&ctx).unwrap();
        assert!(!ctx.catalog.get(mft).is_fragmented());
        assert!(sim.is_consistent());
    }

    #[test]
    fn test_mft_optimization_evicts_blocking_file() {
        let spec = mft_volume(400)
            .with_file(SimFile::with_fragments("$Mft", &[(0, 100), (300, 50)]))
            .with_file(SimFile::with_fragments("x", &[(100, 20)]));
        let (sim, mut ctx) = analyzed(spec, JobKind::OptimizeMft, JobOptions::default());
        let mft = find_mft(&ctx).unwrap();
        let _moves = ctx.begin_moves().unwrap();
        assert_eq!(optimize_file(&mut ctx, mft), FileOptimization::Optimized);

        assert_eq!(fragments(sim.file_blocks("$Mft").unwrap()), vec![Block::new(0, 0, 150)]);
        assert_eq!(fragments(sim.file_blocks("x").unwrap()), vec![Block::new(0, 380, 20)]);
        let x = ctx.catalog.find_by_path(r"\??\C:\x").unwrap();
        assert!(ctx.catalog.get(x).flags.contains(FileFlags::FRAGMENTED_BY_FILE_OPT));
        assert!(sim.is_consistent());
    }

    #[test]
    fn test_optimize_mft_is_noop_off_ntfs() {
        let spec = SimVolumeSpec::new("FAT32", 100, 4096)
            .with_file(SimFile::with_fragments("a", &[(10, 5), (50, 5)]));
        let (sim, mut ctx) = context_with(spec, JobKind::OptimizeMft, JobOptions::default());
        optimize_mft(&mut ctx).unwrap();
        assert!(sim.moves().is_empty());
        assert_eq!(ctx.stats.clusters_to_process, 1);
        assert_eq!(ctx.stats.phase, Phase::Optimization);
    }

    #[test]
    fn test_full_optimization_sorts_by_path() {
        let spec = SimVolumeSpec::new("FAT32", 100, 4096)
            .with_file(SimFile::with_fragments("b", &[(10, 5)]))
            .with_file(SimFile::with_fragments("a", &[(30, 5)]))
            .with_file(SimFile::with_fragments("c", &[(50, 5)]));
        let (sim, mut ctx) = context_with(spec, JobKind::FullOptimize, JobOptions::default());
        optimize(&mut ctx).unwrap();

        assert_eq!(sim.file_blocks("a").unwrap(), vec![Block::new(0, 0, 5)]);
        assert_eq!(sim.file_blocks("b").unwrap(), vec![Block::new(0, 5, 5)]);
        assert_eq!(sim.file_blocks("c").unwrap(), vec![Block::new(0, 10, 5)]);
        assert!(sim.is_consistent());
        assert!(ctx.free.is_normalized());
        // directories, sort, then the three defragmentation rounds
        assert_eq!(sim.sessions_opened(), 5);
        assert!(!sim.session_open());
        assert_eq!(sim.scans_in_session(), 0);
    }

    fn record_at(path: &str, lcn: u64, len: u64) -> FileRecord {
        FileRecord::new(
            format!(r"\??\C:\{path}"),
            path,
            FileAttributes::empty(),
            vec![Block::new(0, lcn, len)],
        )
    }

    #[test]
    fn test_cut_off_sorted_out_files() {
        let mut ctx = context(SimVolumeSpec::new("FAT32", 1000, 4096), JobKind::QuickOptimize);
        ctx.volume.bytes_per_cluster = 4096;
        // ten sorted neighbours, then a short sorted run of three
        for i in 0..10u64 {
            ctx.catalog.push(record_at(&format!("a{i}"), 100 + i, 1));
        }
        for (i, lcn) in [900u64, 901, 902].into_iter().enumerate() {
            ctx.catalog.push(record_at(&format!("b{i}"), lcn, 1));
        }
        let order: Vec<FileId> = ctx.catalog.ids().collect();
        cut_off_sorted_out_files(&mut ctx, &order);

        let marked: Vec<bool> = ctx
            .catalog
            .records()
            .iter()
            .map(|f| f.flags.contains(FileFlags::MOVED_TO_FRONT))
            .collect();
        assert!(marked[..10].iter().all(|&m| m));
        assert!(marked[10..].iter().all(|&m| !m));
        assert_eq!(ctx.already_optimized_clusters, 10);
    }

    #[test]
    fn test_group_rejects_far_and_backward_files() {
        let first = record_at("a", 100, 1);
        let mut group = Group::starting_at(0, &first);
        assert!(group.admits(&record_at("b", 101, 1), 4096));
        group.push(&record_at("b", 101, 1));
        // behind both predecessors
        assert!(!group.admits(&record_at("c", 50, 1), 4096));
        // farther than 20 MiB
        assert!(!group.admits(&record_at("d", 101 + 6000, 1), 4096));
    }

    #[test]
    fn test_quick_optimization_leaves_sorted_volume_alone() {
        let mut spec = SimVolumeSpec::new("FAT32", 100, 4096);
        for i in 0..10u64 {
            spec = spec.with_file(SimFile::with_fragments(format!("p{i}"), &[(i, 1)]));
        }
        let (sim, mut ctx) = context_with(spec, JobKind::QuickOptimize, JobOptions::default());
        optimize(&mut ctx).unwrap();
        assert!(sim.moves().is_empty());
        assert_eq!(ctx.already_optimized_clusters, 10);
    }

    #[test]
    fn test_fat_directory_is_compacted() {
        let spec = SimVolumeSpec::new("FAT32", 200, 4096)
            .with_file(SimFile::with_fragments("dir", &[(10, 2), (100, 3)]).directory())
            .with_file(SimFile::with_fragments("f", &[(12, 3)]));
        let (sim, mut ctx) = analyzed(spec, JobKind::FullOptimize, JobOptions::default());
        optimize_directories(&mut ctx).unwrap();
        assert_eq!(
            fragments(sim.file_blocks("dir").unwrap()),
            vec![Block::new(0, 10, 5)]
        );
        assert!(sim.is_consistent());
    }
}
