/// The volume processing engine.
///
/// All routines operate on a single [`JobContext`] owned by the job's
/// worker thread: the analyzer fills it, the defragmenter and optimizer
/// decide what to move, and the mover is the only place that changes a
/// file's placement.
pub mod analyze;
pub mod context;
pub mod defrag;
pub mod filter;
pub mod mover;
pub mod optimize;
pub mod select;

pub use analyze::analyze;
pub use context::{IndexMode, JobContext, MoveSession, PerfCounters, Terminator};
pub use defrag::defragment;
pub use mover::{move_file, MoveOutcome};
pub use optimize::{optimize, optimize_mft};

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::io::sim::{SimVolume, SimVolumeSpec};
    use crate::job::options::JobOptions;
    use crate::job::progress::{JobFlags, JobKind};
    use std::sync::Arc;

    pub fn context_with(
        spec: SimVolumeSpec,
        kind: JobKind,
        options: JobOptions,
    ) -> (Arc<SimVolume>, JobContext) {
        let sim = Arc::new(SimVolume::new(spec));
        let ctx = JobContext::new(
            sim.clone(),
            'C',
            kind,
            JobFlags::empty(),
            0,
            options,
            IndexMode::Auto,
            Terminator::default(),
        );
        (sim, ctx)
    }

    /// A fresh context; the volume is not analyzed yet.
    pub fn context(spec: SimVolumeSpec, kind: JobKind) -> JobContext {
        context_with(spec, kind, JobOptions::default()).1
    }

    pub fn analyzed(
        spec: SimVolumeSpec,
        kind: JobKind,
        options: JobOptions,
    ) -> (Arc<SimVolume>, JobContext) {
        let (sim, mut ctx) = context_with(spec, kind, options);
        analyze(&mut ctx).unwrap();
        (sim, ctx)
    }
}
