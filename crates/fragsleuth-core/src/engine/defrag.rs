/// Defragmentation passes.
///
/// The rough routine moves whole files into free regions large enough to
/// hold them. The fine routine is used when a fragment size threshold is
/// set: it only gathers runs of undersized fragments, leaving large
/// fragments where they are.
use super::analyze::{analyze, check_fragmentation_level};
use super::context::JobContext;
use super::mover::move_file;
use super::select::{can_move, is_fat_dir};
use crate::error::Result;
use crate::job::options::PART_DEFRAG_MAGIC_CONSTANT;
use crate::job::progress::{JobFlags, JobKind, Phase};
use crate::map::is_mft;
use crate::model::size::format_size;
use crate::model::{Block, FileFlags, FileId, FileRecord};
use std::time::Instant;
use tracing::{debug, info};

/// Whether the file should be handled by a defragmentation pass.
pub fn can_defragment(ctx: &JobContext, file: &FileRecord) -> bool {
    if !can_move(file) {
        return false;
    }
    let disp = &file.disposition;
    if disp.blocks.len() < 2 || disp.fragments < 2 || !file.is_fragmented() {
        return false;
    }
    if is_mft(&ctx.volume, file) || is_fat_dir(&ctx.volume, file) {
        return false;
    }
    // the MFT job only finishes what the MFT optimizer fragmented
    ctx.kind != JobKind::OptimizeMft || file.flags.contains(FileFlags::FRAGMENTED_BY_FILE_OPT)
}

/// Clusters of every file the next pass may touch.
fn defrag_cc(ctx: &JobContext) -> u64 {
    let mut total = 0;
    for &id in ctx.catalog.fragmented() {
        if ctx.terminated() {
            break;
        }
        let file = ctx.catalog.get(id);
        if can_defragment(ctx, file) {
            total += file.disposition.clusters;
        }
    }
    total
}

/// Defragment the volume. A `Defragment` job analyzes first and stops
/// early when fragmentation is below the configured threshold.
pub fn defragment(ctx: &mut JobContext) -> Result<()> {
    if ctx.kind == JobKind::Defragment {
        analyze(ctx)?;
        if !check_fragmentation_level(ctx) {
            info!("defragmentation skipped");
            return Ok(());
        }
    }

    let fine = ctx.fragment_size_threshold != 0;
    if fine {
        debug!("fine routines will be used");
    } else {
        debug!("rough routines will be used: fragment size threshold filter not set");
    }

    ctx.stats.processed_clusters = 0;
    ctx.stats.clusters_to_process = defrag_cc(ctx);
    ctx.stats.pass_number = 0;

    while !ctx.terminated() {
        run_pass(ctx, fine)?;
        if ctx.stats.moved_clusters == 0 || !ctx.flags.contains(JobFlags::REPEAT) {
            break;
        }
        ctx.stats.pass_number += 1;
    }

    // gather what is left of the remaining files
    if !fine && !ctx.terminated() {
        ctx.fragment_size_threshold = PART_DEFRAG_MAGIC_CONSTANT;
        ctx.algorithm_defined_fst = true;
        debug!(
            "partial defragmentation: fragment size threshold = {}",
            format_size(PART_DEFRAG_MAGIC_CONSTANT)
        );
        let session = ctx.begin_moves()?;
        fine_routine(ctx);
        drop(session);
        ctx.fragment_size_threshold = 0;
        ctx.algorithm_defined_fst = false;
    }

    if !ctx.terminated() {
        for file in ctx.catalog.records_mut() {
            file.flags.remove(FileFlags::MOVING_FAILED);
        }
        debug!("retrying files that could not be moved");
        run_pass(ctx, fine)?;
    }
    Ok(())
}

/// One pass, with the volume open for its duration only.
fn run_pass(ctx: &mut JobContext, fine: bool) -> Result<()> {
    let _session = ctx.begin_moves()?;
    if fine {
        fine_routine(ctx);
    } else {
        rough_routine(ctx);
    }
    Ok(())
}

/// Common pass prologue. Returns the fragmented files to walk.
fn begin_pass(ctx: &mut JobContext) -> Vec<FileId> {
    ctx.stats.phase = Phase::Defragmentation;
    ctx.stats.moved_clusters = 0;
    ctx.release_temp_space();
    let files = ctx.catalog.fragmented().to_vec();
    for &id in &files {
        ctx.catalog
            .get_mut(id)
            .flags
            .remove(FileFlags::CURRENTLY_EXCLUDED);
    }
    files
}

/// Move a whole file to the first region that can hold it.
fn move_entire_file(ctx: &mut JobContext, id: FileId) -> bool {
    let file = ctx.catalog.get(id);
    let clusters = file.disposition.clusters;
    let Some(vcn) = file.disposition.first().map(|b| b.vcn) else {
        return false;
    };
    let Some(region) = ctx.free.find_first(0, clusters) else {
        return false;
    };
    match move_file(ctx, id, vcn, clusters, region.lcn) {
        Ok(_) => {
            debug!("defrag success for {}", ctx.catalog.get(id).display_path());
            true
        }
        Err(e) => {
            debug!("defrag failure for {}: {e}", ctx.catalog.get(id).display_path());
            false
        }
    }
}

fn rough_routine(ctx: &mut JobContext) {
    let files = begin_pass(ctx);
    let started = Instant::now();
    let mut defragmented = 0u64;

    for id in files {
        if ctx.terminated() {
            break;
        }
        if can_defragment(ctx, ctx.catalog.get(id)) && move_entire_file(ctx, id) {
            defragmented += 1;
        }
        ctx.catalog
            .get_mut(id)
            .flags
            .insert(FileFlags::CURRENTLY_EXCLUDED);
    }

    let bpc = ctx.volume.bytes_per_cluster;
    info!("{defragmented} files defragmented");
    info!(
        "{} clusters moved ({})",
        ctx.stats.moved_clusters,
        format_size(ctx.stats.moved_clusters * bpc)
    );
    info!("defragmentation pass completed in {:.2?}", started.elapsed());
}

/// A run of undersized fragments selected for gathering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LittleRun {
    vcn: u64,
    length: u64,
    /// Fragments (or parts of them) the run touches.
    count: usize,
    /// Where the next search starts once the run is handled.
    next_min_vcn: u64,
}

/// Find the first run of fragments below `threshold` bytes, topped up to
/// the threshold from the following fragment (or, at the end of the file,
/// from the preceding one).
fn find_little_run(fragments: &[Block], threshold: u64, bpc: u64) -> Option<LittleRun> {
    let small = |b: &Block| b.length * bpc < threshold;
    let first = fragments.iter().position(small)?;
    let head = fragments[first];
    let mut run = LittleRun {
        vcn: head.vcn,
        length: head.length,
        count: 1,
        next_min_vcn: head.end_vcn(),
    };

    let mut next = first + 1;
    while let Some(fragment) = fragments.get(next).filter(|f| small(f)) {
        run.length += fragment.length;
        run.count += 1;
        run.next_min_vcn = fragment.end_vcn();
        next += 1;
    }

    if run.length * bpc < threshold {
        let cut = threshold.div_ceil(bpc).saturating_sub(run.length);
        if let Some(following) = fragments.get(next) {
            if following.length.saturating_sub(cut) * bpc < threshold {
                run.length += following.length;
                run.next_min_vcn = following.end_vcn();
            } else {
                run.length += cut;
                run.next_min_vcn = following.vcn + cut;
            }
            run.count += 1;
        } else if first > 0 {
            let preceding = fragments[first - 1];
            if preceding.length.saturating_sub(cut) * bpc < threshold {
                run.vcn = preceding.vcn;
                run.length += preceding.length;
            } else {
                run.vcn = preceding.vcn + preceding.length - cut;
                run.length += cut;
            }
            run.count += 1;
        }
    }
    Some(run)
}

fn fine_routine(ctx: &mut JobContext) {
    let files = begin_pass(ctx);
    let started = Instant::now();
    let bpc = ctx.volume.bytes_per_cluster;
    let threshold = ctx.fragment_size_threshold;
    let (mut entirely, mut partially) = (0u64, 0u64);
    let (mut moved_entirely, mut moved_partially) = (0u64, 0u64);

    for id in files {
        if ctx.terminated() {
            break;
        }
        if !can_defragment(ctx, ctx.catalog.get(id)) {
            ctx.catalog
                .get_mut(id)
                .flags
                .insert(FileFlags::CURRENTLY_EXCLUDED);
            continue;
        }

        let before = ctx.stats.moved_clusters;
        let disp = &ctx.catalog.get(id).disposition;
        if disp.clusters * bpc < 2 * threshold {
            if move_entire_file(ctx, id) {
                entirely += 1;
                moved_entirely += ctx.stats.moved_clusters - before;
            }
        } else if gather_little_fragments(ctx, id, threshold, bpc) {
            partially += 1;
            moved_partially += ctx.stats.moved_clusters - before;
        }
        ctx.catalog
            .get_mut(id)
            .flags
            .insert(FileFlags::CURRENTLY_EXCLUDED);
    }

    info!("{} files defragmented", entirely + partially);
    info!(
        "  {} clusters moved ({})",
        ctx.stats.moved_clusters,
        format_size(ctx.stats.moved_clusters * bpc)
    );
    info!("{entirely} files defragmented entirely");
    info!("  {moved_entirely} clusters moved ({})", format_size(moved_entirely * bpc));
    info!("{partially} files defragmented partially");
    info!("  {moved_partially} clusters moved ({})", format_size(moved_partially * bpc));
    info!("defragmentation pass completed in {:.2?}", started.elapsed());
}

/// Walk the file from its first to its last VCN gathering undersized
/// fragments. Returns `true` if at least one move succeeded.
fn gather_little_fragments(ctx: &mut JobContext, id: FileId, threshold: u64, bpc: u64) -> bool {
    let disp = &ctx.catalog.get(id).disposition;
    let Some(mut min_vcn) = disp.first().map(|b| b.vcn) else {
        return false;
    };
    let max_vcn = disp.end_vcn();
    let mut succeeded = false;

    while min_vcn < max_vcn && !ctx.terminated() {
        let fragments: Vec<Block> = ctx
            .catalog
            .get(id)
            .disposition
            .to_fragments()
            .into_iter()
            .filter(|f| f.vcn >= min_vcn && f.end_vcn() <= max_vcn)
            .collect();
        if fragments.is_empty() {
            break;
        }

        let Some(mut run) = find_little_run(&fragments, threshold, bpc)
            .filter(|run| run.length > 0 && run.count >= 2)
        else {
            min_vcn = max_vcn;
            continue;
        };

        let largest = ctx.free.find_largest().map_or(0, |r| r.length);
        if run.length > largest {
            run.length = largest;
            run.next_min_vcn = run.vcn + largest;
        }
        if run.length == 0 {
            min_vcn = max_vcn;
            continue;
        }

        if let Some(region) = ctx.free.find_first(0, run.length) {
            match move_file(ctx, id, run.vcn, run.length, region.lcn) {
                Ok(_) => {
                    debug!("defrag success for {}", ctx.catalog.get(id).display_path());
                    succeeded = true;
                }
                Err(e) => debug!("defrag failure for {}: {e}", ctx.catalog.get(id).display_path()),
            }
        }
        min_vcn = run.next_min_vcn;
    }
    succeeded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::{analyzed, context_with};
    use crate::io::sim::{MoveBehavior, SimFile, SimVolumeSpec};
    use crate::job::options::JobOptions;

    fn blocks(runs: &[(u64, u64)]) -> Vec<Block> {
        let mut vcn = 0;
        runs.iter()
            .map(|&(lcn, len)| {
                let b = Block::new(vcn, lcn, len);
                vcn += len;
                b
            })
            .collect()
    }

    #[test]
    fn test_little_run_tops_up_from_next_fragment() {
        let frags = blocks(&[(100, 10), (200, 1), (300, 1), (400, 10)]);
        let run = find_little_run(&frags, 4 * 4096, 4096).unwrap();
        assert_eq!(
            run,
            LittleRun {
                vcn: 10,
                length: 4,
                count: 3,
                next_min_vcn: 14
            }
        );
    }

    #[test]
    fn test_little_run_takes_short_neighbours_whole() {
        let frags = blocks(&[(100, 10), (200, 1), (300, 4)]);
        let run = find_little_run(&frags, 4 * 4096, 4096).unwrap();
        assert_eq!((run.vcn, run.length, run.count, run.next_min_vcn), (10, 5, 2, 15));
    }

    #[test]
    fn test_little_run_cuts_from_previous_fragment() {
        let frags = blocks(&[(100, 10), (200, 1)]);
        let run = find_little_run(&frags, 4 * 4096, 4096).unwrap();
        assert_eq!((run.vcn, run.length, run.count, run.next_min_vcn), (7, 4, 2, 11));

        let single = blocks(&[(200, 1)]);
        let run = find_little_run(&single, 4 * 4096, 4096).unwrap();
        assert_eq!(run.count, 1);
        assert!(find_little_run(&blocks(&[(0, 8)]), 4 * 4096, 4096).is_none());
    }

    fn two_fragmented_files() -> SimVolumeSpec {
        SimVolumeSpec::new("FAT32", 1000, 4096)
            .with_reserved(0, 5)
            .with_file(SimFile::with_fragments("a", &[(10, 5), (20, 5)]))
            .with_file(SimFile::with_fragments("b", &[(30, 3), (40, 3), (50, 3)]))
            .with_file(SimFile::with_fragments("c", &[(60, 8)]))
    }

    #[test]
    fn test_rough_defragmentation() {
        let (sim, mut ctx) = context_with(two_fragmented_files(), JobKind::Defragment, JobOptions::default());
        defragment(&mut ctx).unwrap();
        assert_eq!(ctx.stats.fragmented, 0);
        assert!(ctx.catalog.fragmented().is_empty());
        for path in ["a", "b", "c"] {
            assert_eq!(sim.file_blocks(path).unwrap().len(), 1, "{path}");
        }
        assert_eq!(ctx.stats.clusters_to_process, 19);
        assert_eq!(ctx.stats.phase, Phase::Defragmentation);
        assert!(sim.is_consistent());
    }

    #[test]
    fn test_each_pass_opens_and_closes_the_volume() {
        let (sim, mut ctx) = context_with(two_fragmented_files(), JobKind::Defragment, JobOptions::default());
        defragment(&mut ctx).unwrap();
        // rough pass, partial round and retry pass
        assert_eq!(sim.sessions_opened(), 3);
        assert!(!sim.session_open());
        assert_eq!(sim.scans_in_session(), 0);
        assert!(!sim.moves().is_empty());
    }

    #[test]
    fn test_dry_run_never_opens_the_volume() {
        let options = JobOptions {
            dry_run: true,
            ..Default::default()
        };
        let (sim, mut ctx) = context_with(two_fragmented_files(), JobKind::Defragment, options);
        defragment(&mut ctx).unwrap();
        assert_eq!(sim.sessions_opened(), 0);
        assert!(sim.moves().is_empty());
    }

    #[test]
    fn test_below_threshold_skips_moves() {
        let options = JobOptions {
            fragmentation_threshold: 99.0,
            ..Default::default()
        };
        let (sim, mut ctx) = context_with(two_fragmented_files(), JobKind::Defragment, options);
        defragment(&mut ctx).unwrap();
        assert!(sim.moves().is_empty());
        assert_eq!(ctx.stats.fragmented, 2);
    }

    #[test]
    fn test_failed_file_is_retried_once() {
        let spec = SimVolumeSpec::new("FAT32", 1000, 4096).with_file(
            SimFile::with_fragments("a", &[(10, 5), (20, 5)]).behavior(MoveBehavior::CommitOnce),
        );
        let (sim, mut ctx) = context_with(spec, JobKind::Defragment, JobOptions::default());
        defragment(&mut ctx).unwrap();
        assert_eq!(sim.file_blocks("a").unwrap().len(), 1);
        assert!(!ctx.catalog.get(FileId::new(0)).flags.contains(FileFlags::MOVING_FAILED));
        assert_eq!(sim.moves().len(), 1);
    }

    #[test]
    fn test_fine_defragmentation_gathers_little_fragments() {
        let spec = SimVolumeSpec::new("FAT32", 1000, 4096)
            .with_reserved(0, 50)
            .with_file(SimFile::with_fragments("big", &[(100, 10), (200, 1), (300, 1), (400, 10)]));
        let options = JobOptions {
            fragment_size_threshold: 4 * 4096,
            ..Default::default()
        };
        let (sim, mut ctx) = context_with(spec, JobKind::Defragment, options);
        defragment(&mut ctx).unwrap();
        assert_eq!(
            sim.file_blocks("big").unwrap(),
            vec![
                Block::new(0, 100, 10),
                Block::new(10, 50, 4),
                Block::new(14, 402, 8)
            ]
        );
        let big = ctx.catalog.get(FileId::new(0));
        assert!(big.is_excluded());
        assert_eq!(ctx.stats.fragmented, 0);
    }

    #[test]
    fn test_repeat_flag_runs_more_passes() {
        let (_sim, mut ctx) = analyzed(two_fragmented_files(), JobKind::FullOptimize, JobOptions::default());
        ctx.flags = JobFlags::REPEAT;
        defragment(&mut ctx).unwrap();
        assert!(ctx.stats.pass_number >= 1);
        assert_eq!(ctx.stats.fragmented, 0);
    }
}
