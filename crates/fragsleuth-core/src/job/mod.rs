/// Job controller: runs one analysis, defragmentation or optimization
/// job on a worker thread and reports progress to the caller.
///
/// Two entry points share the same machinery:
/// - [`run_job`] blocks the calling thread, polling the job every refresh
///   interval and handing snapshots to a callback.
/// - [`start_job`] runs [`run_job`] on its own thread and delivers
///   [`JobProgress`] messages over a bounded crossbeam channel.
pub mod options;
pub mod progress;

use crate::engine::{analyze, defragment, optimize, optimize_mft, IndexMode, JobContext, Terminator};
use crate::error::{DefragError, Result};
use crate::io::VolumeIo;
use crate::report::{fragmented_rows, ReportRow};
use options::JobOptions;
use progress::{JobFlags, JobKind, JobProgress, ProgressSnapshot};

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Maximum number of progress messages that may queue up in the channel.
///
/// Snapshots go out once per refresh interval, so a consumer that stops
/// draining only stalls the poller thread, never the job itself.
pub const PROGRESS_CHANNEL_CAPACITY: usize = 1_024;

/// Everything needed to start a job.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub letter: char,
    pub kind: JobKind,
    pub flags: JobFlags,
    /// Number of cells in the cluster map; zero disables the map.
    pub map_size: usize,
    pub options: JobOptions,
    pub index: IndexMode,
}

impl JobRequest {
    pub fn new(letter: char, kind: JobKind) -> Self {
        Self {
            letter,
            kind,
            flags: JobFlags::empty(),
            map_size: 0,
            options: JobOptions::default(),
            index: IndexMode::Auto,
        }
    }
}

/// Final state of a finished job.
#[derive(Debug)]
pub struct JobOutcome {
    pub snapshot: ProgressSnapshot,
    pub result: Result<()>,
    /// Fragmented files left on the volume; empty if reports are disabled.
    pub report: Vec<ReportRow>,
    pub duration: Duration,
    /// The caller asked the job to stop. An expired time limit does not
    /// count as cancellation.
    pub cancelled: bool,
}

impl JobOutcome {
    fn into_message(self) -> JobProgress {
        let snapshot = Box::new(self.snapshot);
        match self.result {
            Err(error) => JobProgress::Failed { snapshot, error },
            Ok(()) if self.cancelled => JobProgress::Cancelled { snapshot },
            Ok(()) => JobProgress::Complete {
                snapshot,
                duration: self.duration,
            },
        }
    }
}

/// Body of the worker thread.
fn execute(
    io: Arc<dyn VolumeIo>,
    request: JobRequest,
    terminator: Terminator,
    shared: Arc<Mutex<ProgressSnapshot>>,
) -> JobOutcome {
    let started = Instant::now();
    let kind = request.kind;
    let disable_reports = request.options.disable_reports;
    let mut ctx = JobContext::new(
        io,
        request.letter,
        kind,
        request.flags,
        request.map_size,
        request.options,
        request.index,
        terminator.clone(),
    )
    .with_shared_progress(shared);

    info!("{} job started on {}:", kind.name(), ctx.letter);
    let mut result = match kind {
        JobKind::Analyze => analyze(&mut ctx),
        JobKind::Defragment => defragment(&mut ctx),
        JobKind::FullOptimize | JobKind::QuickOptimize => optimize(&mut ctx),
        JobKind::OptimizeMft => optimize_mft(&mut ctx),
    };
    if result.is_ok() && !kind.is_analysis() && !ctx.options.dry_run {
        if let Err(e) = ctx.io.flush() {
            warn!("cannot flush volume {}: {e}", ctx.letter);
        }
    }
    if let Err(e) = &result {
        error!("{} job on {}: failed: {e}", kind.name(), ctx.letter);
    }

    let cancelled = terminator.cancelled();
    if cancelled {
        info!("{} job on {}: cancelled", kind.name(), ctx.letter);
    } else if terminator.is_set() {
        info!("{} job on {}: time limit exceeded", kind.name(), ctx.letter);
    }
    // a cancelled job reports success with whatever it managed to do
    if matches!(result, Err(DefragError::Cancelled)) {
        result = Ok(());
    }
    ctx.stats.completion_status = match &result {
        Ok(()) => 1,
        Err(e) => e.code(),
    };

    let report = if disable_reports {
        Vec::new()
    } else {
        fragmented_rows(&ctx)
    };
    let duration = started.elapsed();
    ctx.counters.log(duration);
    ctx.force_publish();
    let snapshot = ctx.snapshot();
    info!("{} job on {}: finished in {duration:.2?}", kind.name(), ctx.letter);

    JobOutcome {
        snapshot,
        result,
        report,
        duration,
        cancelled,
    }
}

/// Run a job to completion.
///
/// The job itself runs on a `fragsleuth-job` thread; the calling thread
/// polls it every refresh interval, passing the latest snapshot to
/// `on_progress` and stopping the job once `should_stop` returns `true`.
/// When the configured time limit elapses the job is stopped as well,
/// regardless of the repeat flag.
pub fn run_job<P, S>(
    io: Arc<dyn VolumeIo>,
    request: JobRequest,
    mut on_progress: P,
    should_stop: S,
) -> JobOutcome
where
    P: FnMut(&ProgressSnapshot),
    S: Fn() -> bool,
{
    let cancel = Arc::new(AtomicBool::new(false));
    let kill = Arc::new(AtomicBool::new(false));
    let terminator = Terminator::new(cancel.clone(), kill.clone());
    let shared = Arc::new(Mutex::new(ProgressSnapshot::default()));
    let refresh = request.options.refresh();
    let time_limit = request.options.time_limit();
    let started = Instant::now();

    let worker = {
        let shared = shared.clone();
        thread::Builder::new()
            .name("fragsleuth-job".into())
            .spawn(move || execute(io, request, terminator, shared))
            .expect("failed to spawn job thread")
    };

    while !worker.is_finished() {
        thread::sleep(refresh);
        if should_stop() {
            cancel.store(true, Ordering::Relaxed);
        }
        if time_limit.is_some_and(|limit| started.elapsed() >= limit)
            && !kill.swap(true, Ordering::Relaxed)
        {
            info!("time limit exceeded, stopping the job");
        }
        let snapshot = shared.lock().clone();
        on_progress(&snapshot);
    }

    let outcome = match worker.join() {
        Ok(outcome) => outcome,
        Err(_) => {
            error!("job thread panicked");
            JobOutcome {
                snapshot: shared.lock().clone(),
                result: Err(DefragError::Unknown),
                report: Vec::new(),
                duration: started.elapsed(),
                cancelled: cancel.load(Ordering::Relaxed),
            }
        }
    };
    on_progress(&outcome.snapshot);
    outcome
}

/// Handle to a job running in the background.
pub struct JobHandle {
    /// Receiver for progress updates; the last message is always one of
    /// `Complete`, `Failed` or `Cancelled`.
    pub progress_rx: Receiver<JobProgress>,
    /// Flag to request cancellation.
    cancel_flag: Arc<AtomicBool>,
    /// Poller thread; yields the final outcome.
    thread: Option<thread::JoinHandle<Option<JobOutcome>>>,
}

impl JobHandle {
    /// Request the job to stop as soon as possible.
    pub fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_flag.load(Ordering::Relaxed)
    }

    /// Wait for the job to finish and take its outcome. The terminal
    /// message stays in `progress_rx`; the outcome keeps the report rows.
    pub fn wait(mut self) -> Option<JobOutcome> {
        self.thread.take()?.join().ok().flatten()
    }
}

/// Start a job in the background.
pub fn start_job(io: Arc<dyn VolumeIo>, request: JobRequest) -> JobHandle {
    let (progress_tx, progress_rx) =
        crossbeam_channel::bounded::<JobProgress>(PROGRESS_CHANNEL_CAPACITY);
    let cancel_flag = Arc::new(AtomicBool::new(false));
    let cancel_clone = cancel_flag.clone();

    let thread = thread::Builder::new()
        .name("fragsleuth-progress".into())
        .spawn(move || {
            let updates = progress_tx.clone();
            let outcome = run_job(
                io,
                request,
                |snapshot| {
                    let _ = updates.try_send(JobProgress::Update(Box::new(snapshot.clone())));
                },
                || cancel_clone.load(Ordering::Relaxed),
            );
            let message = JobOutcome {
                snapshot: outcome.snapshot.clone(),
                result: outcome.result.clone(),
                report: Vec::new(),
                duration: outcome.duration,
                cancelled: outcome.cancelled,
            }
            .into_message();
            let _ = progress_tx.send(message);
            Some(outcome)
        })
        .expect("failed to spawn progress thread");

    JobHandle {
        progress_rx,
        cancel_flag,
        thread: Some(thread),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::sim::{MoveBehavior, SimFile, SimVolume, SimVolumeSpec};

    fn volume() -> Arc<SimVolume> {
        Arc::new(SimVolume::new(
            SimVolumeSpec::new("FAT32", 1000, 4096)
                .with_file(SimFile::with_fragments("a", &[(10, 5), (20, 5)]))
                .with_file(SimFile::with_fragments("b", &[(30, 3)])),
        ))
    }

    fn fast(kind: JobKind) -> JobRequest {
        let mut request = JobRequest::new('c', kind);
        request.options.refresh_interval = 5;
        request
    }

    #[test]
    fn test_run_job_reports_progress() {
        let mut updates = 0;
        let outcome = run_job(volume(), fast(JobKind::Analyze), |_| updates += 1, || false);
        assert!(outcome.result.is_ok());
        assert!(!outcome.cancelled);
        assert!(updates >= 1);
        assert_eq!(outcome.snapshot.files, 2);
        assert_eq!(outcome.snapshot.fragmented, 1);
        assert_eq!(outcome.snapshot.completion_status, 1);
        assert_eq!(outcome.report.len(), 1);
    }

    #[test]
    fn test_disabled_reports() {
        let mut request = fast(JobKind::Analyze);
        request.options.disable_reports = true;
        let outcome = run_job(volume(), request, |_| {}, || false);
        assert!(outcome.report.is_empty());
    }

    #[test]
    fn test_cancelled_job_moves_nothing() {
        let sim = volume();
        let terminator = Terminator::new(
            Arc::new(AtomicBool::new(true)),
            Arc::new(AtomicBool::new(false)),
        );
        let shared = Arc::new(Mutex::new(ProgressSnapshot::default()));
        let outcome = execute(sim.clone(), fast(JobKind::Defragment), terminator, shared);
        assert!(outcome.result.is_ok());
        assert!(outcome.cancelled);
        assert!(sim.moves().is_empty());
        assert_eq!(sim.sessions_opened(), 0);
        assert_eq!(sim.file_blocks("a").unwrap().len(), 2);
    }

    #[test]
    fn test_time_limit_stops_repeated_passes() {
        // three slow moves per file keep the job busy for several seconds
        let mut spec = SimVolumeSpec::new("FAT32", 100_000, 4096);
        for i in 0..100u64 {
            let base = 1000 + i * 30;
            spec = spec.with_file(
                SimFile::with_fragments(format!("f{i}"), &[(base, 2), (base + 10, 2), (base + 20, 2)])
                    .behavior(MoveBehavior::Slow),
            );
        }
        let sim = Arc::new(SimVolume::new(spec));
        let mut request = fast(JobKind::Defragment);
        request.flags = JobFlags::REPEAT;
        request.options.time_limit = 1;

        let outcome = run_job(sim.clone(), request, |_| {}, || false);
        assert!(outcome.result.is_ok());
        assert!(!outcome.cancelled);
        assert!(outcome.duration >= Duration::from_millis(900));
        assert!(outcome.duration < Duration::from_secs(5));
        assert!(outcome.snapshot.fragmented > 0);
        assert!(!sim.moves().is_empty());
        assert!(!sim.session_open());
        assert!(sim.is_consistent());
    }

    #[test]
    fn test_failed_job_carries_error_code() {
        let mut spec = SimVolumeSpec::new("NTFS", 1000, 4096);
        spec.dirty = true;
        let outcome = run_job(
            Arc::new(SimVolume::new(spec)),
            fast(JobKind::Defragment),
            |_| {},
            || false,
        );
        assert_eq!(outcome.result, Err(DefragError::DirtyVolume));
        assert_eq!(outcome.snapshot.completion_status, DefragError::DirtyVolume.code());
    }

    #[test]
    fn test_start_job_delivers_terminal_message() {
        let handle = start_job(volume(), fast(JobKind::Defragment));
        let mut last = None;
        for message in handle.progress_rx.iter() {
            let terminal = !matches!(message, JobProgress::Update(_));
            last = Some(message);
            if terminal {
                break;
            }
        }
        match last {
            Some(JobProgress::Complete { snapshot, .. }) => assert_eq!(snapshot.fragmented, 0),
            other => panic!("unexpected final message: {other:?}"),
        }
        let outcome = handle.wait().unwrap();
        assert!(outcome.report.is_empty());
    }
}
