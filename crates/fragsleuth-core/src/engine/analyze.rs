/// Volume analysis: geometry, free space, file scan and statistics.
///
/// Every processing job starts here. The analyzer resets the context,
/// fills the catalog through [`VolumeIo::scan_files`], paints the cluster
/// map and builds the fragmented-files list and the block index the later
/// phases rely on.
use super::context::{JobContext, Terminator};
use super::filter::{
    exclude_by_fragment_size, exclude_by_fragments, exclude_by_size, PathFilters,
};
use crate::error::{DefragError, Result};
use crate::io::{ScanCallbacks, ScanScope};
use crate::job::progress::{JobFlags, Phase, ProgressSnapshot};
use crate::map::{ClusterMap, SpaceColor};
use crate::model::size::{format_count, format_size};
use crate::model::{FileAttributes, FileCatalog, FileFlags, FileId, FileRecord, FsKind, Volume};
use crate::regions::FreeRegion;
use rayon::prelude::*;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// NTFS metadata files that are normally held open by the system.
const WELL_KNOWN_LOCKED: [&str; 6] = [
    "$bitmap",
    r"$extend\$objid",
    r"$extend\$usnjrnl",
    "$logfile",
    "$mft::$bitmap",
    "$secure",
];

/// Run a full analysis of the context's volume.
pub fn analyze(ctx: &mut JobContext) -> Result<()> {
    let started = Instant::now();
    info!("analysis of {}: started", ctx.letter);
    ctx.stats.phase = Phase::Analysis;

    get_volume_information(ctx)?;
    get_free_space_layout(ctx);
    get_mft_zones_layout(ctx);
    find_files(ctx)?;
    redraw_well_known_locked_files(ctx);
    produce_list_of_fragmented_files(ctx);
    check_fragmentation_level(ctx);
    check_requested_action(ctx)?;

    let elapsed = started.elapsed();
    ctx.counters.analysis += elapsed;
    info!("analysis of {}: completed in {elapsed:.2?}", ctx.letter);
    ctx.publish();
    Ok(())
}

/// `true` when fragmentation reaches the configured threshold.
pub fn check_fragmentation_level(ctx: &JobContext) -> bool {
    let fragments = ctx.stats.fragments;
    let fragmentation = if fragments == 0 {
        0.0
    } else {
        ctx.stats.bad_fragments as f64 / fragments as f64 * 100.0
    };
    let threshold = ctx.options.fragmentation_threshold;
    if fragmentation < threshold {
        info!("fragmentation is below the threshold: {fragmentation:.2}% < {threshold:.2}%");
        false
    } else {
        info!("fragmentation is above the threshold: {fragmentation:.2}% >= {threshold:.2}%");
        true
    }
}

// ── Volume ──────────────────────────────────────────────────────────────────

fn get_volume_information(ctx: &mut JobContext) -> Result<()> {
    ctx.mft_zone = None;
    let stats = &mut ctx.stats;
    stats.files = 0;
    stats.directories = 0;
    stats.compressed = 0;
    stats.fragmented = 0;
    stats.fragments = 0;
    stats.bad_fragments = 0;
    stats.total_space = 0;
    stats.free_space = 0;
    stats.mft_size = 0;
    stats.clusters_to_process = 0;
    stats.processed_clusters = 0;
    stats.size_counters = Default::default();
    ctx.catalog.clear();
    ctx.free.clear();
    ctx.volume = Volume::default();

    let geometry = ctx.io.geometry()?;
    if geometry.is_dirty {
        warn!("volume {} is dirty, run a disk check first", ctx.letter);
        return Err(DefragError::DirtyVolume);
    }
    ctx.stats.total_space = geometry.total_bytes;
    ctx.stats.free_space = geometry.free_bytes;
    info!("total clusters: {}", geometry.total_clusters);
    info!("cluster size: {}", geometry.bytes_per_cluster);
    if geometry.total_clusters == 0 || geometry.bytes_per_cluster == 0 {
        warn!("wrong volume geometry detected");
        return Err(DefragError::BadGeometry);
    }

    ctx.volume = Volume::from_geometry(ctx.letter, geometry);
    let volume = &ctx.volume;
    info!(
        "moving {} ({} clusters) at once",
        format_size(volume.clusters_at_once * volume.bytes_per_cluster),
        volume.clusters_at_once
    );
    info!("{} partition detected", volume.fs_name);
    if volume.fs == FsKind::Unknown {
        warn!("file system type is not recognized, type independent routines will be used");
    }

    ctx.stats.clusters_to_process = volume.total_clusters;
    ctx.stats.processed_clusters = 0;

    if ctx.fragment_size_threshold != 0 && ctx.fragment_size_threshold <= volume.bytes_per_cluster
    {
        info!("fragment size threshold is below the cluster size, so it will be ignored");
        ctx.fragment_size_threshold = 0;
    }

    ctx.map = ClusterMap::new(ctx.map_size(), ctx.volume.total_clusters);
    Ok(())
}

fn get_free_space_layout(ctx: &mut JobContext) {
    match ctx.io.free_regions(true) {
        Ok(scan) => {
            if scan.partial {
                warn!("volume bitmap has been read only partially");
            }
            for region in &scan.regions {
                ctx.map
                    .colorize(region.lcn, region.length, SpaceColor::Free, SpaceColor::System);
                ctx.stats.processed_clusters += region.length;
            }
            ctx.free.replace_all(scan.regions);
        }
        Err(e) => warn!("cannot read volume bitmap: {e}"),
    }

    info!("free space amount : {}", format_size(ctx.volume.free_bytes));
    info!("free regions count: {}", ctx.free.len());
    if ctx.free.is_empty() {
        warn!("disk is full or some error has been encountered");
    }
}

/// Paint the MFT zone. The zone overlaps already counted free space, so
/// progress is left alone.
fn get_mft_zones_layout(ctx: &mut JobContext) {
    if !ctx.volume.is_ntfs() {
        return;
    }
    let Some(ntfs) = ctx.volume.ntfs else {
        return;
    };
    let bpc = ctx.volume.bytes_per_cluster;

    let mft_clusters = ntfs.mft_valid_data_length / bpc;
    ctx.stats.mft_size = mft_clusters * bpc;
    debug!("mft         : {:>20}: {:>20}", ntfs.mft_start_lcn, mft_clusters);
    info!("mft size = {}", format_size(ctx.stats.mft_size));

    if ntfs.mft_zone_end >= ntfs.mft_zone_start {
        let zone = FreeRegion::new(ntfs.mft_zone_start, ntfs.mft_zone_end - ntfs.mft_zone_start + 1);
        debug!("mft zone    : {:>20}: {:>20}", zone.lcn, zone.length);
        if zone.end() <= ctx.volume.total_clusters {
            ctx.map
                .colorize(zone.lcn, zone.length, SpaceColor::MftZone, SpaceColor::Unused);
            ctx.mft_zone = Some(zone);
        }
    }

    let mirror_bytes = ntfs.bytes_per_file_record_segment * 4;
    let mirror_length = if mirror_bytes > bpc {
        mirror_bytes.div_ceil(bpc)
    } else {
        1
    };
    debug!("mft mirror  : {:>20}: {:>20}", ntfs.mft_mirror_lcn, mirror_length);
}

// ── File scan ───────────────────────────────────────────────────────────────

/// Filter chain and counters handed to the volume scanner.
struct ScanFilter<'a> {
    stats: &'a mut ProgressSnapshot,
    filters: &'a PathFilters,
    terminator: Terminator,
    bytes_per_cluster: u64,
    size_limit: u64,
    fragments_limit: u64,
    fragment_size: Option<u64>,
    context_menu: bool,
}

impl ScanCallbacks for ScanFilter<'_> {
    fn filter(&mut self, file: &mut FileRecord) -> bool {
        if file.path.is_empty() {
            file.flags.insert(FileFlags::EXCLUDED);
            return true;
        }
        if file.disposition.fragments == 0 && !self.context_menu {
            return false;
        }
        if file.path.ends_with(r"\.") {
            debug!("root directory detected, its trailing dot will be removed");
            let len = file.path.len();
            file.path.truncate(len - 1);
        }
        if file.disposition.fragments == 0 {
            if !self.filters.excludes(file) {
                count_file(self.stats, file, self.bytes_per_cluster);
            }
            return false;
        }

        if file.attributes.contains(FileAttributes::SPARSE) {
            debug!("sparse file found: {}", file.path);
        }
        if file.attributes.contains(FileAttributes::REPARSE_POINT) {
            debug!("reparse point found: {}", file.path);
        }

        let skip = file.disposition.is_empty()
            || file.is_temporary()
            || exclude_by_size(file, self.size_limit, self.bytes_per_cluster)
            || exclude_by_fragments(&file.disposition, self.fragments_limit)
            || exclude_by_fragment_size(&file.disposition, self.fragment_size, self.bytes_per_cluster);
        if skip {
            file.flags.insert(FileFlags::EXCLUDED);
            return false;
        }

        // children are still scanned: their paths may match
        if self.filters.excludes(file) {
            file.flags
                .insert(FileFlags::EXCLUDED | FileFlags::EXCLUDED_BY_PATH);
        }
        false
    }

    fn progress(&mut self, file: &FileRecord) {
        if !self.context_menu {
            count_file(self.stats, file, self.bytes_per_cluster);
        }
    }

    fn terminate(&self) -> bool {
        self.terminator.is_set()
    }
}

fn count_file(stats: &mut ProgressSnapshot, file: &FileRecord, bytes_per_cluster: u64) {
    stats.files += 1;
    if file.is_dir() {
        stats.directories += 1;
    }
    if file.is_compressed() {
        stats.compressed += 1;
    }
    stats.processed_clusters += file.disposition.clusters;
    stats
        .size_counters
        .record(file.disposition.clusters * bytes_per_cluster);
}

/// Which part of the volume to scan. A context-menu job on a non-NTFS
/// volume only needs the selected sub-tree.
fn scan_scope(ctx: &JobContext) -> ScanScope {
    if !ctx.flags.contains(JobFlags::CONTEXT_MENU) || ctx.volume.is_ntfs() {
        return ScanScope::Volume;
    }
    let Some(selection) = ctx.filters.cut.get(0) else {
        return ScanScope::Volume;
    };
    if selection.chars().count() < 3 {
        return ScanScope::Volume;
    }
    // c:\ and c:\* mean the whole disk
    if matches!(selection.chars().nth(3), None | Some('*')) {
        return ScanScope::Volume;
    }
    let recursive = ctx.filters.cut.len() > 1;
    let mut parent = format!(r"\??\{selection}");
    if let Some(pos) = parent.rfind('\\') {
        parent.truncate(pos);
    }
    if parent.len() <= r"\??\C:\".len() {
        return ScanScope::Volume;
    }
    ScanScope::Directory {
        path: parent,
        recursive,
    }
}

fn find_files(ctx: &mut JobContext) -> Result<()> {
    let scope = scan_scope(ctx);
    if let ScanScope::Directory { path, recursive } = &scope {
        info!("scanning {path} only (recursive: {recursive})");
    }
    let context_menu = ctx.flags.contains(JobFlags::CONTEXT_MENU);
    let io = Arc::clone(&ctx.io);
    let terminator = ctx.terminator();
    let fragment_size = ctx.fragment_size_filter();
    let mut callbacks = ScanFilter {
        stats: &mut ctx.stats,
        filters: &ctx.filters,
        terminator,
        bytes_per_cluster: ctx.volume.bytes_per_cluster,
        size_limit: ctx.options.effective_size_limit(),
        fragments_limit: ctx.options.fragments_limit,
        fragment_size,
        context_menu,
    };
    let files = match io.scan_files(&scope, &mut callbacks) {
        Ok(files) => files,
        Err(_) if ctx.terminated() => Vec::new(),
        Err(e) => return Err(e),
    };

    ctx.catalog = FileCatalog::with_capacity(files.len());
    for file in files {
        ctx.catalog.push(file);
    }

    let (fragmented, fragments) = ctx
        .catalog
        .records()
        .par_iter()
        .map(|f| {
            if !f.is_fragmented() || f.is_excluded() {
                (0u64, 1u64)
            } else {
                (1, f.disposition.fragments)
            }
        })
        .reduce(|| (0, 0), |a, b| (a.0 + b.0, a.1 + b.1));
    ctx.stats.fragmented += fragmented;
    ctx.stats.fragments += fragments;

    if context_menu {
        let bpc = ctx.volume.bytes_per_cluster;
        for file in ctx.catalog.records() {
            if !file.flags.contains(FileFlags::EXCLUDED_BY_PATH) {
                count_file(&mut ctx.stats, file, bpc);
            }
        }
    }

    for i in 0..ctx.catalog.len() {
        ctx.colorize_file(FileId::new(i), SpaceColor::System);
    }
    ctx.rebuild_index();

    let s = &ctx.stats;
    info!("folders total:    {}", format_count(s.directories));
    info!("files total:      {}", format_count(s.files));
    info!("fragmented files: {}", format_count(s.fragmented));
    info!("compressed files: {}", format_count(s.compressed));
    let c = &s.size_counters;
    debug!("tiny ...... <  10 KB: {}", c.tiny);
    debug!("small ..... < 100 KB: {}", c.small);
    debug!("average ... <   1 MB: {}", c.average);
    debug!("big ....... <  16 MB: {}", c.big);
    debug!("huge ...... < 128 MB: {}", c.huge);
    debug!("giant ..............: {}", c.giant);
    Ok(())
}

// ── Post-scan ───────────────────────────────────────────────────────────────

fn is_well_known_locked_file(file: &FileRecord) -> bool {
    // \??\X:\$x at least
    if file.path.len() >= 9 && file.path.as_bytes().get(7) == Some(&b'$') {
        let path = file.path.to_lowercase();
        if WELL_KNOWN_LOCKED.iter().any(|name| path.contains(name)) {
            return true;
        }
    }
    let name = file.name.to_lowercase();
    name.contains("pagefile.sys") || name.contains("hiberfil.sys")
}

fn redraw_well_known_locked_files(ctx: &mut JobContext) {
    let started = Instant::now();
    let mut found = 0u64;
    for i in 0..ctx.catalog.len() {
        let id = FileId::new(i);
        let file = ctx.catalog.get(id);
        if file.disposition.is_empty() || !is_well_known_locked_file(file) {
            continue;
        }
        if ctx.is_file_locked(id) {
            debug!("true detection:  {}", ctx.catalog.get(id).path);
            found += 1;
        } else {
            debug!("false detection: {}", ctx.catalog.get(id).path);
        }
    }
    info!(
        "{found} locked files found in {:.2?}",
        started.elapsed()
    );
}

fn produce_list_of_fragmented_files(ctx: &mut JobContext) {
    ctx.catalog.rebuild_fragmented();
    let catalog = &ctx.catalog;
    ctx.stats.bad_fragments = catalog
        .fragmented()
        .iter()
        .map(|&id| catalog.get(id).disposition.fragments)
        .sum();
}

fn check_requested_action(ctx: &JobContext) -> Result<()> {
    if !ctx.kind.is_analysis() && ctx.volume.fs == FsKind::Udf {
        warn!("cannot defragment or optimize UDF volumes: the driver cannot move clusters");
        return Err(DefragError::UdfDefrag);
    }
    if ctx.volume.is_fat {
        info!("FAT directories cannot be moved entirely");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::{analyzed, context};
    use crate::io::sim::{SimFile, SimVolumeSpec};
    use crate::job::options::JobOptions;
    use crate::job::progress::JobKind;
    use crate::model::{Block, NtfsLayout};

    fn sample() -> SimVolumeSpec {
        SimVolumeSpec::new("FAT32", 1000, 4096)
            .with_reserved(0, 10)
            .with_file(SimFile::with_fragments("one", &[(10, 5)]))
            .with_file(SimFile::with_fragments("two", &[(20, 5), (40, 5)]))
            .with_file(SimFile::with_fragments("three", &[(50, 2), (60, 2), (70, 2)]))
            .with_file(SimFile::with_fragments(r"dir", &[(80, 1)]).directory())
            .with_file(SimFile::with_fragments(r"dir\packed", &[(90, 4)]).compressed())
            .with_file(SimFile::new("resident", vec![]))
    }

    #[test]
    fn test_statistics() {
        let (_sim, ctx) = analyzed(sample(), JobKind::Analyze, JobOptions::default());
        let s = &ctx.stats;
        assert_eq!(s.files, 5);
        assert_eq!(s.directories, 1);
        assert_eq!(s.compressed, 1);
        assert_eq!(s.fragmented, 2);
        assert_eq!(s.fragments, 3 + 2 + 3);
        assert_eq!(s.bad_fragments, 5);
        assert_eq!(s.phase, Phase::Analysis);
        // free space plus file clusters
        assert_eq!(s.processed_clusters, ctx.free.total_clusters() + 5 + 10 + 6 + 1 + 4);
        assert_eq!(s.clusters_to_process, 1000);
        assert_eq!(s.size_counters.tiny, 1);
        assert_eq!(s.size_counters.small, 4);
        let three = ctx.catalog.find_by_path(r"\??\C:\three").unwrap();
        let two = ctx.catalog.find_by_path(r"\??\C:\two").unwrap();
        assert_eq!(ctx.catalog.fragmented(), &[three, two]);
        assert!(ctx.volume.is_fat);
        assert!(check_fragmentation_level(&ctx));
    }

    #[test]
    fn test_analysis_is_repeatable() {
        let (_sim, mut ctx) = analyzed(sample(), JobKind::Analyze, JobOptions::default());
        let first = ctx.stats.clone();
        let free = ctx.free.clone();
        analyze(&mut ctx).unwrap();
        assert_eq!(ctx.stats, first);
        assert_eq!(ctx.free, free);
    }

    #[test]
    fn test_filters_exclude_files() {
        let options = JobOptions {
            ex_filter: "*three".into(),
            size_limit: 4 * 4096,
            ..Default::default()
        };
        let (_sim, ctx) = analyzed(sample(), JobKind::Analyze, options);
        let three = ctx.catalog.get(ctx.catalog.find_by_path(r"\??\C:\three").unwrap());
        assert!(three.is_excluded());
        assert!(three.flags.contains(FileFlags::EXCLUDED_BY_PATH));
        let two = ctx.catalog.get(ctx.catalog.find_by_path(r"\??\C:\two").unwrap());
        assert!(two.is_excluded());
        assert!(two.is_over_limit());
        assert_eq!(ctx.stats.fragmented, 0);
        assert!(ctx.catalog.fragmented().is_empty());
        assert_eq!(ctx.stats.files, 5);
    }

    #[test]
    fn test_fragments_threshold() {
        let options = JobOptions {
            fragments_limit: 3,
            ..Default::default()
        };
        let (_sim, ctx) = analyzed(sample(), JobKind::Analyze, options);
        assert_eq!(ctx.stats.fragmented, 1);
        assert_eq!(ctx.stats.bad_fragments, 3);
    }

    #[test]
    fn test_tiny_fragment_size_threshold_is_ignored() {
        let options = JobOptions {
            fragment_size_threshold: 1024,
            ..Default::default()
        };
        let (_sim, ctx) = analyzed(sample(), JobKind::Analyze, options);
        assert_eq!(ctx.fragment_size_threshold, 0);
        assert_eq!(ctx.stats.fragmented, 2);
    }

    #[test]
    fn test_dirty_and_broken_volumes() {
        let mut spec = sample();
        spec.dirty = true;
        let mut ctx = context(spec, JobKind::Analyze);
        assert!(matches!(analyze(&mut ctx), Err(DefragError::DirtyVolume)));

        let mut ctx = context(SimVolumeSpec::new("NTFS", 0, 4096), JobKind::Analyze);
        assert!(matches!(analyze(&mut ctx), Err(DefragError::BadGeometry)));
    }

    #[test]
    fn test_udf_cannot_be_defragmented() {
        let spec = SimVolumeSpec::new("UDF", 100, 2048);
        let mut ctx = context(spec.clone(), JobKind::Defragment);
        assert!(matches!(analyze(&mut ctx), Err(DefragError::UdfDefrag)));
        let mut ctx = context(spec, JobKind::Analyze);
        assert!(analyze(&mut ctx).is_ok());
    }

    #[test]
    fn test_well_known_locked_files() {
        let mut spec = SimVolumeSpec::new("NTFS", 1000, 4096)
            .with_file(SimFile::with_fragments("$LogFile", &[(100, 10)]).locked())
            .with_file(SimFile::with_fragments("pagefile.sys", &[(200, 10)]))
            .with_file(SimFile::with_fragments("$Mft", &[(0, 16)]));
        spec.ntfs = Some(NtfsLayout {
            mft_start_lcn: 0,
            mft_valid_data_length: 16 * 4096,
            mft_zone_start: 16,
            mft_zone_end: 99,
            mft_mirror_lcn: 500,
            bytes_per_file_record_segment: 1024,
        });
        let (_sim, ctx) = analyzed(spec, JobKind::Analyze, JobOptions::default());
        let log = ctx.catalog.get(ctx.catalog.find_by_path(r"\??\C:\$LogFile").unwrap());
        assert!(log.is_locked());
        let page = ctx.catalog.get(ctx.catalog.find_by_path(r"\??\C:\pagefile.sys").unwrap());
        assert!(page.flags.contains(FileFlags::NOT_LOCKED));
        let mft = ctx.catalog.get(ctx.catalog.find_by_path(r"\??\C:\$Mft").unwrap());
        assert!(mft.flags.is_empty());
        assert_eq!(ctx.stats.mft_size, 16 * 4096);
        assert_eq!(ctx.mft_zone, Some(FreeRegion::new(16, 84)));
    }

    #[test]
    fn test_context_menu_scope() {
        let spec = SimVolumeSpec::new("FAT32", 1000, 4096)
            .with_file(SimFile::with_fragments("dir", &[(10, 1)]).directory())
            .with_file(SimFile::with_fragments(r"dir\a", &[(20, 2), (30, 2)]))
            .with_file(SimFile::with_fragments(r"dir\b", &[(40, 2)]))
            .with_file(SimFile::new(r"dir\small", vec![]))
            .with_file(SimFile::with_fragments("other", &[(50, 2), (60, 2)]));
        let options = JobOptions {
            cut_filter: r"C:\dir\a".into(),
            ..Default::default()
        };
        let mut ctx = context(spec, JobKind::Analyze);
        ctx.flags = JobFlags::CONTEXT_MENU;
        ctx.filters = PathFilters::new(&options.in_filter, &options.ex_filter, &options.cut_filter);
        ctx.options = options;
        assert_eq!(
            scan_scope(&ctx),
            ScanScope::Directory {
                path: r"\??\C:\dir".into(),
                recursive: false
            }
        );

        analyze(&mut ctx).unwrap();
        assert_eq!(ctx.catalog.len(), 2);
        assert_eq!(ctx.stats.files, 1);
        assert_eq!(ctx.stats.fragmented, 1);
        let a = ctx.catalog.get(ctx.catalog.find_by_path(r"\??\C:\dir\a").unwrap());
        assert_eq!(a.disposition.blocks[1], Block::new(2, 30, 2));
    }
}
