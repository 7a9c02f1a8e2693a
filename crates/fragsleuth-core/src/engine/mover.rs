/// The single primitive that changes a file's placement.
///
/// `move_file` issues the cluster moves, re-reads the file's extents to
/// learn what actually happened, and then brings every piece of derived
/// state in line with the result: filters, cluster map, free space,
/// statistics, block index and the fragmented-files list.
use super::context::JobContext;
use super::filter::{exclude_by_fragment_size, exclude_by_fragments, exclude_by_size};
use super::select::is_fat_dir;
use crate::error::{DefragError, Result};
use crate::io::MoveHandle;
use crate::map::{file_color, is_mft, SpaceColor};
use crate::model::{Block, Disposition, FileFlags, FileId};
use std::time::Instant;
use tracing::{debug, trace};

/// How a successful move was verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    /// Nothing to move.
    Skipped,
    /// Extents could not be re-read (or dry run); the computed layout is
    /// assumed.
    Calculated,
    /// Re-read extents match the computed layout.
    Confirmed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Calculated,
    Confirmed,
    Failure,
    Partial,
}

/// Move `length` clusters of file `id` starting at `vcn` to `target`.
///
/// Per-file failures are returned as errors for the caller to skip past;
/// they never leave the context inconsistent.
pub fn move_file(
    ctx: &mut JobContext,
    id: FileId,
    vcn: u64,
    length: u64,
    target: u64,
) -> Result<MoveOutcome> {
    let started = Instant::now();
    ctx.last_move_status = None;
    let result = move_file_inner(ctx, id, vcn, length, target);
    ctx.counters.moving += started.elapsed();
    result
}

fn move_file_inner(
    ctx: &mut JobContext,
    id: FileId,
    vcn: u64,
    length: u64,
    target: u64,
) -> Result<MoveOutcome> {
    let file = ctx.catalog.get(id);
    trace!("{}: vcn {vcn}, length {length}, target {target}", file.display_path());
    let empty = length == 0 || file.disposition.is_empty() || file.disposition.clusters == 0;
    let beyond_end = vcn
        .checked_add(length)
        .map_or(true, |end| end > file.disposition.end_vcn());
    let first = file.disposition.block_containing(vcn);
    let pinned = is_mft(&ctx.volume, file) || is_fat_dir(&ctx.volume, file);
    let total = ctx.volume.total_clusters;

    if empty {
        debug!("{}: nothing to move", file.display_path());
        ctx.catalog.get_mut(id).flags.insert(FileFlags::IMPROPER_STATE);
        return Ok(MoveOutcome::Skipped);
    }
    if beyond_end {
        return Err(improper(ctx, id, "data move behind the end of the file requested"));
    }
    let Some(first) = first else {
        return Err(improper(ctx, id, "data move out of file bounds requested"));
    };
    if target >= total || target.checked_add(length).map_or(true, |end| end > total) {
        return Err(improper(ctx, id, "target range is outside the volume"));
    }
    if first == 0 && pinned {
        return Err(DefragError::Unmovable(format!(
            "{}: leading block cannot be moved",
            ctx.catalog.get(id).display_path()
        )));
    }

    let file = ctx.catalog.get(id);
    let old_color = file_color(&ctx.volume, file);
    let was_fragmented = file.is_fragmented();
    let was_excluded = file.is_excluded();
    let old_fragments = file.disposition.fragments;

    let handle = match ctx.io.open_for_move(&file.path) {
        Ok(handle) => handle,
        Err(e) => {
            debug!("cannot open {}: {e}", file.display_path());
            ctx.catalog.get_mut(id).flags.insert(FileFlags::LOCKED);
            ctx.colorize_file(id, old_color);
            ctx.publish();
            return Err(DefragError::Unmovable(e.to_string()));
        }
    };

    let blocks = ctx.catalog.get(id).disposition.blocks.clone();
    move_in_chunks(ctx, handle, &blocks, first, vcn, length, target);
    ctx.io.close(handle);
    ctx.stats.total_moves += 1;

    let original = ctx.catalog.get(id).disposition.clone();
    let desired = calculate_disposition(&original, vcn, length, target);
    let (new_disposition, verdict) = if ctx.options.dry_run {
        (desired, Verdict::Calculated)
    } else {
        match ctx.io.query_extents(&ctx.catalog.get(id).path) {
            None => {
                debug!("cannot re-read extents of {}", ctx.catalog.get(id).display_path());
                (desired, Verdict::Calculated)
            }
            Some(extents) => {
                let actual = Disposition::new(extents).to_fragments();
                if actual == desired.blocks {
                    (desired, Verdict::Confirmed)
                } else if actual == original.to_fragments() {
                    (desired, Verdict::Failure)
                } else {
                    debug!(
                        "{}: new layout differs from the desired one: {actual:?}",
                        ctx.catalog.get(id).display_path()
                    );
                    (Disposition::new(actual), Verdict::Partial)
                }
            }
        }
    };

    if verdict == Verdict::Failure {
        debug!("{}: nothing has been moved", ctx.catalog.get(id).display_path());
        ctx.catalog.get_mut(id).flags.insert(FileFlags::MOVING_FAILED);
        ctx.free.subtract(target, length);
        return Err(DefragError::MoveFailed(ctx.catalog.get(id).display_path().to_string()));
    }
    if verdict == Verdict::Partial {
        ctx.catalog.get_mut(id).flags.insert(FileFlags::MOVING_FAILED);
    }

    // reapply filters against the new layout
    let bpc = ctx.volume.bytes_per_cluster;
    let size_limit = ctx.options.effective_size_limit();
    let fragments_limit = ctx.options.fragments_limit;
    let fragment_size = ctx.fragment_size_filter();
    let file = ctx.catalog.get_mut(id);
    file.disposition = new_disposition;
    file.flags.remove(FileFlags::EXCLUDED);
    let by_fragment_size = exclude_by_fragment_size(&file.disposition, fragment_size, bpc);
    let by_fragments = exclude_by_fragments(&file.disposition, fragments_limit);
    let by_size = exclude_by_size(file, size_limit, bpc);
    if by_fragment_size
        || by_fragments
        || by_size
        || file.is_temporary()
        || file.flags.contains(FileFlags::EXCLUDED_BY_PATH)
    {
        file.flags.insert(FileFlags::EXCLUDED);
    }
    let new_fragments = file.disposition.fragments;
    let became_fragmented = file.is_fragmented();
    let excluded_now = file.is_excluded();
    let new_color = file_color(&ctx.volume, ctx.catalog.get(id));

    ctx.map.colorize(target, length, new_color, SpaceColor::Free);
    ctx.publish();
    ctx.free.subtract(target, length);

    if new_color != old_color {
        for block in &original.blocks {
            ctx.map.colorize(block.lcn, block.length, new_color, old_color);
        }
    }

    if verdict != Verdict::Partial {
        let release_now = !ctx.volume.is_ntfs() || ctx.options.dry_run;
        for (lcn, n) in source_ranges(&original.blocks, first, vcn, length) {
            ctx.map.colorize(lcn, n, SpaceColor::Free, new_color);
            // NTFS keeps freed clusters allocated until the next bitmap refresh
            if release_now {
                ctx.free.add(lcn, n);
            }
        }
    }

    let stats = &mut ctx.stats;
    if became_fragmented && !excluded_now {
        if !was_fragmented || was_excluded {
            stats.fragmented += 1;
            stats.fragments += new_fragments - 1;
        } else {
            stats.fragments = (stats.fragments + new_fragments).saturating_sub(old_fragments);
        }
    }
    if (!became_fragmented || excluded_now) && was_fragmented && !was_excluded {
        stats.fragmented = stats.fragmented.saturating_sub(1);
        stats.fragments = stats.fragments.saturating_sub(old_fragments - 1);
    }
    ctx.publish();

    ctx.reindex_file(id, &original);
    ctx.catalog.truncate_fragmented(id);
    ctx.catalog.expand_fragmented(id);

    match verdict {
        Verdict::Partial => Err(DefragError::PartialMove(
            ctx.catalog.get(id).display_path().to_string(),
        )),
        Verdict::Confirmed => Ok(MoveOutcome::Confirmed),
        _ => Ok(MoveOutcome::Calculated),
    }
}

fn improper(ctx: &mut JobContext, id: FileId, reason: &str) -> DefragError {
    let file = ctx.catalog.get_mut(id);
    file.flags.insert(FileFlags::IMPROPER_STATE);
    debug!("{}: {reason}", file.display_path());
    DefragError::ImproperState(format!("{}: {reason}", file.display_path()))
}

/// Issue the cluster moves block by block, at most `clusters_at_once` per
/// call. Unprocessed clusters still count as processed when the loop stops
/// early.
fn move_in_chunks(
    ctx: &mut JobContext,
    handle: MoveHandle,
    blocks: &[Block],
    first: usize,
    vcn: u64,
    length: u64,
    target: u64,
) {
    let at_once = ctx.volume.clusters_at_once.max(1);
    let mut remaining = length;
    let mut curr_vcn = vcn;
    let mut curr_target = target;

    'blocks: for block in &blocks[first..] {
        if remaining == 0 {
            break;
        }
        curr_vcn = curr_vcn.max(block.vcn);
        let mut to_move = (block.end_vcn() - curr_vcn).min(remaining);
        while to_move > 0 {
            let n = to_move.min(at_once);
            if !move_chunk(ctx, handle, curr_vcn, curr_target, n) {
                break 'blocks;
            }
            ctx.stats.processed_clusters += n;
            remaining -= n;
            to_move -= n;
            curr_vcn += n;
            curr_target += n;
        }
    }
    ctx.stats.processed_clusters += remaining;
}

fn move_chunk(ctx: &mut JobContext, handle: MoveHandle, vcn: u64, lcn: u64, n: u64) -> bool {
    if ctx.terminated() {
        return false;
    }
    if ctx.options.dry_run {
        ctx.stats.moved_clusters += n;
        return true;
    }
    trace!("vcn {vcn}, target {lcn}, count {n}");
    match ctx.io.move_clusters(handle, vcn, lcn, n) {
        Ok(()) => {
            ctx.stats.moved_clusters += n;
            true
        }
        Err(e) => {
            debug!("cannot move file clusters: {e}");
            ctx.last_move_status = Some(e);
            false
        }
    }
}

/// `(lcn, length)` runs occupied by `[vcn, vcn + length)` in `blocks`.
fn source_ranges(blocks: &[Block], first: usize, vcn: u64, length: u64) -> Vec<(u64, u64)> {
    let mut out = Vec::new();
    let mut remaining = length;
    let mut curr_vcn = vcn;
    for block in &blocks[first..] {
        if remaining == 0 {
            break;
        }
        curr_vcn = curr_vcn.max(block.vcn);
        let offset = curr_vcn - block.vcn;
        let n = (block.length - offset).min(remaining);
        if n > 0 {
            out.push((block.lcn + offset, n));
        }
        remaining -= n;
    }
    out
}

/// Layout of the file after `[vcn, vcn + length)` lands at `target`,
/// collapsed to fragments.
pub fn calculate_disposition(disp: &Disposition, vcn: u64, length: u64, target: u64) -> Disposition {
    let Some(first) = disp.block_containing(vcn) else {
        return Disposition::default();
    };
    let mut blocks = Vec::with_capacity(disp.blocks.len() + 2);
    blocks.extend_from_slice(&disp.blocks[..first]);

    let mut remaining = length;
    let mut curr_vcn = vcn;
    let mut curr_target = target;
    for block in &disp.blocks[first..] {
        if remaining == 0 {
            blocks.push(*block);
            continue;
        }
        curr_vcn = curr_vcn.max(block.vcn);
        let offset = curr_vcn - block.vcn;
        let n = (block.length - offset).min(remaining);
        if offset > 0 {
            blocks.push(Block::new(block.vcn, block.lcn, offset));
        }
        blocks.push(Block::new(curr_vcn, curr_target, n));
        if offset + n < block.length {
            blocks.push(Block::new(
                curr_vcn + n,
                block.lcn + offset + n,
                block.length - offset - n,
            ));
        }
        curr_target += n;
        remaining -= n;
    }

    let mut result = Disposition::new(blocks);
    result.collapse();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::analyzed;
    use crate::io::sim::{MoveBehavior, SimFile, SimVolumeSpec};
    use crate::io::VolumeIo;
    use crate::job::options::JobOptions;
    use crate::job::progress::JobKind;
    use crate::regions::FreeRegion;

    fn fat_volume(file: SimFile) -> SimVolumeSpec {
        SimVolumeSpec::new("FAT32", 2000, 4096).with_file(file)
    }

    #[test]
    fn test_calculate_disposition() {
        let disp = Disposition::new(vec![Block::new(0, 10, 5), Block::new(5, 20, 5)]);
        let whole = calculate_disposition(&disp, 0, 10, 1000);
        assert_eq!(whole.blocks, vec![Block::new(0, 1000, 10)]);
        assert_eq!(whole.fragments, 1);

        let head = calculate_disposition(&disp, 0, 3, 1000);
        assert_eq!(
            head.blocks,
            vec![Block::new(0, 1000, 3), Block::new(3, 13, 2), Block::new(5, 20, 5)]
        );

        let tail = calculate_disposition(&disp, 3, 2, 18);
        assert_eq!(tail.blocks, vec![Block::new(0, 10, 3), Block::new(3, 18, 7)]);

        assert!(calculate_disposition(&disp, 10, 1, 0).is_empty());
    }

    #[test]
    fn test_whole_file_move_is_confirmed() {
        let (sim, mut ctx) = analyzed(
            fat_volume(SimFile::with_fragments("a", &[(10, 5), (20, 5)])),
            JobKind::Defragment,
            JobOptions::default(),
        );
        assert_eq!((ctx.stats.fragmented, ctx.stats.fragments), (1, 2));
        let id = ctx.catalog.find_by_path(r"\??\C:\a").unwrap();
        let _moves = ctx.begin_moves().unwrap();

        assert_eq!(move_file(&mut ctx, id, 0, 10, 1000).unwrap(), MoveOutcome::Confirmed);
        let file = ctx.catalog.get(id);
        assert_eq!(file.disposition.blocks, vec![Block::new(0, 1000, 10)]);
        assert!(!file.is_fragmented());
        assert_eq!((ctx.stats.fragmented, ctx.stats.fragments), (0, 1));
        assert!(ctx.catalog.fragmented().is_empty());
        assert_eq!(ctx.stats.moved_clusters, 10);
        assert_eq!(ctx.stats.total_moves, 1);
        assert_eq!(
            ctx.free.as_slice(),
            &[FreeRegion::new(0, 1000), FreeRegion::new(1010, 990)]
        );
        assert_eq!(sim.file_blocks("a").unwrap(), vec![Block::new(0, 1000, 10)]);
        assert!(sim.is_consistent());
        assert_eq!(sim.open_handles(), 0);
    }

    #[test]
    fn test_ntfs_keeps_freed_space_until_release() {
        let spec = SimVolumeSpec::new("NTFS", 2000, 4096)
            .with_file(SimFile::with_fragments("a", &[(10, 5), (20, 5)]));
        let (_sim, mut ctx) = analyzed(spec, JobKind::Defragment, JobOptions::default());
        let id = ctx.catalog.find_by_path(r"\??\C:\a").unwrap();
        let _moves = ctx.begin_moves().unwrap();
        move_file(&mut ctx, id, 0, 10, 1000).unwrap();
        assert!(ctx.free.find_first(0, 1).is_some_and(|r| r.lcn == 0 && r.length == 10));
        assert!(!ctx.free.iter().any(|r| r.lcn <= 10 && r.end() > 10));
        ctx.release_temp_space();
        assert_eq!(ctx.free.as_slice()[0], FreeRegion::new(0, 1000));
    }

    #[test]
    fn test_move_outside_a_session_fails() {
        let (sim, mut ctx) = analyzed(
            fat_volume(SimFile::with_fragments("a", &[(10, 5), (20, 5)])),
            JobKind::Defragment,
            JobOptions::default(),
        );
        let id = ctx.catalog.find_by_path(r"\??\C:\a").unwrap();
        assert!(matches!(
            move_file(&mut ctx, id, 0, 10, 1000),
            Err(DefragError::MoveFailed(_))
        ));
        assert!(ctx.last_move_status.is_some());
        assert!(sim.moves().is_empty());
        assert_eq!(sim.file_blocks("a").unwrap().len(), 2);
    }

    #[test]
    fn test_dry_run_only_counts() {
        let options = JobOptions {
            dry_run: true,
            ..Default::default()
        };
        let (sim, mut ctx) = analyzed(
            fat_volume(SimFile::with_fragments("a", &[(10, 5), (20, 5)])),
            JobKind::Defragment,
            options,
        );
        let id = ctx.catalog.find_by_path(r"\??\C:\a").unwrap();
        assert_eq!(move_file(&mut ctx, id, 0, 10, 1000).unwrap(), MoveOutcome::Calculated);
        assert_eq!(ctx.stats.moved_clusters, 10);
        assert!(sim.moves().is_empty());
        assert_eq!(ctx.catalog.get(id).disposition.fragments, 1);
        assert_eq!(sim.file_blocks("a").unwrap().len(), 2);
    }

    #[test]
    fn test_locked_file_is_left_alone() {
        let (sim, mut ctx) = analyzed(
            fat_volume(SimFile::with_fragments("busy", &[(10, 5), (20, 5)]).locked()),
            JobKind::Defragment,
            JobOptions::default(),
        );
        let id = ctx.catalog.find_by_path(r"\??\C:\busy").unwrap();
        let before = ctx.catalog.get(id).disposition.clone();
        assert!(matches!(
            move_file(&mut ctx, id, 0, 10, 1000),
            Err(DefragError::Unmovable(_))
        ));
        let file = ctx.catalog.get(id);
        assert!(file.is_locked());
        assert_eq!(file.disposition, before);
        assert_eq!(file_color(&ctx.volume, file), SpaceColor::System);
        assert!(sim.moves().is_empty());
    }

    #[test]
    fn test_ignored_move_is_a_failure() {
        let (_sim, mut ctx) = analyzed(
            fat_volume(
                SimFile::with_fragments("a", &[(10, 5), (20, 5)]).behavior(MoveBehavior::Ignore),
            ),
            JobKind::Defragment,
            JobOptions::default(),
        );
        let id = ctx.catalog.find_by_path(r"\??\C:\a").unwrap();
        let _moves = ctx.begin_moves().unwrap();
        assert!(matches!(
            move_file(&mut ctx, id, 0, 10, 1000),
            Err(DefragError::MoveFailed(_))
        ));
        let file = ctx.catalog.get(id);
        assert!(file.flags.contains(FileFlags::MOVING_FAILED));
        assert_eq!(file.disposition.fragments, 2);
        assert!(ctx.free.iter().all(|r| r.end() <= 1000 || r.lcn >= 1010));
    }

    #[test]
    fn test_partial_move_installs_actual_layout() {
        let (sim, mut ctx) = analyzed(
            fat_volume(SimFile::with_fragments("p", &[(10, 4)]).behavior(MoveBehavior::Partial)),
            JobKind::Defragment,
            JobOptions::default(),
        );
        let id = ctx.catalog.find_by_path(r"\??\C:\p").unwrap();
        let _moves = ctx.begin_moves().unwrap();
        assert!(matches!(
            move_file(&mut ctx, id, 0, 4, 500),
            Err(DefragError::PartialMove(_))
        ));
        let file = ctx.catalog.get(id);
        assert!(file.flags.contains(FileFlags::MOVING_FAILED));
        assert_eq!(file.disposition.blocks, sim.file_blocks("p").unwrap());
        assert_eq!((ctx.stats.fragmented, ctx.stats.fragments), (1, 2));
        assert_eq!(ctx.catalog.fragmented(), &[id]);
    }

    #[test]
    fn test_unreadable_extents_fall_back_to_calculation() {
        let mut file = SimFile::with_fragments("a", &[(10, 5), (20, 5)]);
        file.unreadable_extents = true;
        let (_sim, mut ctx) = analyzed(fat_volume(file), JobKind::Defragment, JobOptions::default());
        let id = ctx.catalog.find_by_path(r"\??\C:\a").unwrap();
        let _moves = ctx.begin_moves().unwrap();
        assert_eq!(move_file(&mut ctx, id, 0, 10, 1000).unwrap(), MoveOutcome::Calculated);
        assert_eq!(ctx.catalog.get(id).disposition.blocks, vec![Block::new(0, 1000, 10)]);
    }

    #[test]
    fn test_improper_requests() {
        let (sim, mut ctx) = analyzed(
            fat_volume(SimFile::with_fragments("a", &[(10, 5), (20, 5)])),
            JobKind::Defragment,
            JobOptions::default(),
        );
        let id = ctx.catalog.find_by_path(r"\??\C:\a").unwrap();
        assert_eq!(move_file(&mut ctx, id, 0, 0, 1000).unwrap(), MoveOutcome::Skipped);
        assert!(ctx.catalog.get(id).flags.contains(FileFlags::IMPROPER_STATE));

        ctx.catalog.get_mut(id).flags = FileFlags::empty();
        assert!(matches!(
            move_file(&mut ctx, id, 8, 5, 1000),
            Err(DefragError::ImproperState(_))
        ));
        ctx.catalog.get_mut(id).flags = FileFlags::empty();
        assert!(matches!(
            move_file(&mut ctx, id, 0, 10, 1995),
            Err(DefragError::ImproperState(_))
        ));
        assert!(sim.moves().is_empty());
        assert!(sim.free_regions(false).is_ok());
    }

    #[test]
    fn test_overflowing_ranges_are_improper() {
        let (sim, mut ctx) = analyzed(
            fat_volume(SimFile::with_fragments("a", &[(10, 5), (20, 5)])),
            JobKind::Defragment,
            JobOptions::default(),
        );
        let id = ctx.catalog.find_by_path(r"\??\C:\a").unwrap();
        assert!(matches!(
            move_file(&mut ctx, id, u64::MAX - 2, 5, 1000),
            Err(DefragError::ImproperState(_))
        ));
        ctx.catalog.get_mut(id).flags = FileFlags::empty();
        assert!(matches!(
            move_file(&mut ctx, id, 0, 5, u64::MAX - 2),
            Err(DefragError::ImproperState(_))
        ));
        ctx.catalog.get_mut(id).flags = FileFlags::empty();
        assert!(matches!(
            move_file(&mut ctx, id, 2, u64::MAX, 1000),
            Err(DefragError::ImproperState(_))
        ));
        assert!(ctx.catalog.get(id).flags.contains(FileFlags::IMPROPER_STATE));
        assert!(sim.moves().is_empty());
    }

    #[test]
    fn test_fat_directory_keeps_leading_block() {
        let (_sim, mut ctx) = analyzed(
            fat_volume(SimFile::with_fragments("dir", &[(10, 5), (20, 5)]).directory()),
            JobKind::Defragment,
            JobOptions::default(),
        );
        let id = ctx.catalog.find_by_path(r"\??\C:\dir").unwrap();
        let _moves = ctx.begin_moves().unwrap();
        assert!(matches!(
            move_file(&mut ctx, id, 0, 10, 1000),
            Err(DefragError::Unmovable(_))
        ));
        assert_eq!(move_file(&mut ctx, id, 5, 5, 15).unwrap(), MoveOutcome::Confirmed);
        assert_eq!(ctx.catalog.get(id).disposition.blocks, vec![Block::new(0, 10, 10)]);
    }
}
