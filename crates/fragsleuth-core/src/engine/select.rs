/// Movability predicates and the block search built on them.
use super::context::JobContext;
use crate::map::is_mft;
use crate::model::{FileFlags, FileId, FileRecord, Volume};
use crate::search::SearchPolicy;
use std::time::Instant;

/// Flags that take a file out of the current pass.
const NOT_MOVABLE: FileFlags = FileFlags::MOVED_TO_FRONT
    .union(FileFlags::CURRENTLY_EXCLUDED)
    .union(FileFlags::LOCKED)
    .union(FileFlags::IMPROPER_STATE)
    .union(FileFlags::MOVING_FAILED);

/// `true` for a directory on a FAT volume; its first cluster cannot move.
#[inline]
pub fn is_fat_dir(volume: &Volume, file: &FileRecord) -> bool {
    volume.is_fat && file.is_dir()
}

/// Whether at least part of the file may be moved right now.
pub fn can_move(file: &FileRecord) -> bool {
    !file.path.is_empty()
        && !file.flags.intersects(NOT_MOVABLE)
        && !file.disposition.is_empty()
        && file.disposition.clusters > 0
}

/// Whether the whole file may be moved. The MFT and FAT directories keep
/// their first cluster in place.
pub fn can_move_entirely(volume: &Volume, file: &FileRecord) -> bool {
    can_move(file) && !is_mft(volume, file) && !is_fat_dir(volume, file)
}

/// Find the movable block with the lowest LCN at or after `*min_lcn`.
///
/// Candidates are tried with an open call; locked ones are flagged and
/// skipped. On success `*min_lcn` is advanced past the returned block so
/// that repeated calls walk the volume from left to right.
pub fn find_first_block(
    ctx: &mut JobContext,
    min_lcn: &mut u64,
    policy: SearchPolicy,
) -> Option<(FileId, usize)> {
    let started = Instant::now();
    let found = loop {
        if ctx.terminated() {
            break None;
        }
        let volume = &ctx.volume;
        let accept = |_: FileId, file: &FileRecord, pos: usize| {
            if !can_move(file) {
                return false;
            }
            if policy == SearchPolicy::SkipPartiallyMovable && !can_move_entirely(volume, file) {
                return false;
            }
            pos != 0 || !(is_mft(volume, file) || is_fat_dir(volume, file))
        };
        let Some((id, pos)) = ctx.index().first_at_or_after(&ctx.catalog, *min_lcn, &accept)
        else {
            break None;
        };
        if ctx.is_file_locked(id) {
            continue;
        }
        *min_lcn = ctx.catalog.get(id).disposition.blocks[pos].lcn + 1;
        break Some((id, pos));
    };
    ctx.counters.searching += started.elapsed();
    found
}
