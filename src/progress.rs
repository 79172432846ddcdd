//! Progress-callback trait for batch events.
//!
//! Inject an [`Arc<dyn JobProgressCallback>`] into
//! [`crate::orchestrator::Orchestrator::run`] to receive real-time events as
//! the batch advances through files and stages.
//!
//! # Why callbacks instead of channels?
//!
//! The callback approach is the least-invasive integration point: hosts can
//! forward events to a Tokio channel, a GUI event loop, a log file, or a
//! terminal progress bar — without the library knowing anything about how the
//! host communicates. The trait is `Send + Sync` because pooled transforms
//! report completions from concurrent tasks.

use crate::error::{FileError, Stage};
use crate::job::CounterSnapshot;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Terminal outcome for one input file.
#[derive(Debug, Clone)]
pub enum FileOutcome {
    /// All stages completed; `outputs` lists every container or folder written.
    Succeeded {
        outputs: Vec<PathBuf>,
        elapsed: Duration,
    },
    /// A stage failed; the batch continued with the next file.
    Errored { error: FileError },
    /// The collision policy was `Skip` and the output already existed.
    Skipped { existing: PathBuf },
    /// Cancellation was observed at a checkpoint before this file finished.
    Cancelled,
}

/// Final summary reported exactly once per job, whether it ran to
/// completion, errored per-file along the way, or was cancelled.
#[derive(Debug, Clone)]
pub struct JobSummary {
    pub was_cancelled: bool,
    pub counters: CounterSnapshot,
    /// Offending path and human-readable cause for every errored file.
    pub failed_files: Vec<(PathBuf, String)>,
    pub elapsed: Duration,
}

impl JobSummary {
    /// One-line human-readable summary, suitable for a status bar or log.
    pub fn headline(&self) -> String {
        let c = &self.counters;
        let mut line = format!(
            "{} of {} file(s) processed, {} succeeded, {} failed",
            c.attempted, c.total, c.succeeded, c.errors
        );
        if c.skipped > 0 {
            line.push_str(&format!(", {} skipped", c.skipped));
        }
        if self.was_cancelled {
            line.push_str(" — cancelled");
        }
        line
    }
}

/// Called by the orchestrator as the batch advances.
///
/// All methods have default no-op implementations so hosts only override
/// what they care about.
///
/// # Thread safety
///
/// With pooled transforms, `on_page_progress` may be called concurrently
/// from different tasks. Implementations must protect shared mutable state.
pub trait JobProgressCallback: Send + Sync {
    /// Called once after input validation, before the first file.
    fn on_job_start(&self, total_files: usize) {
        let _ = total_files;
    }

    /// Called when a file's pipeline pass begins.
    fn on_file_start(&self, index: usize, total_files: usize, path: &PathBuf) {
        let _ = (index, total_files, path);
    }

    /// Called when a stage begins for the current file.
    fn on_stage_start(&self, index: usize, stage: Stage) {
        let _ = (index, stage);
    }

    /// Incremental progress within a stage: extracted pages or completed
    /// transforms. With pooled transforms `current` counts completions, not
    /// dispatch order.
    fn on_page_progress(&self, index: usize, stage: Stage, current: usize, total: usize) {
        let _ = (index, stage, current, total);
    }

    /// A log line from a worker or stage, already human-readable.
    fn on_log(&self, index: usize, line: &str) {
        let _ = (index, line);
    }

    /// Called exactly once per file with its terminal outcome.
    fn on_file_complete(&self, index: usize, outcome: &FileOutcome) {
        let _ = (index, outcome);
    }

    /// Called exactly once per job, last.
    fn on_job_complete(&self, summary: &JobSummary) {
        let _ = summary;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl JobProgressCallback for NoopProgressCallback {}

/// Convenience alias for the shared callback handle.
pub type ProgressCallback = Arc<dyn JobProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TrackingCallback {
        files: AtomicUsize,
        stages: AtomicUsize,
        completes: AtomicUsize,
    }

    impl JobProgressCallback for TrackingCallback {
        fn on_file_start(&self, _index: usize, _total: usize, _path: &PathBuf) {
            self.files.fetch_add(1, Ordering::SeqCst);
        }
        fn on_stage_start(&self, _index: usize, _stage: Stage) {
            self.stages.fetch_add(1, Ordering::SeqCst);
        }
        fn on_file_complete(&self, _index: usize, _outcome: &FileOutcome) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn tracking_callback_receives_events() {
        let cb = TrackingCallback {
            files: AtomicUsize::new(0),
            stages: AtomicUsize::new(0),
            completes: AtomicUsize::new(0),
        };
        cb.on_file_start(0, 2, &PathBuf::from("a.cbz"));
        cb.on_stage_start(0, Stage::Extract);
        cb.on_stage_start(0, Stage::Package);
        cb.on_file_complete(
            0,
            &FileOutcome::Succeeded {
                outputs: vec![],
                elapsed: Duration::ZERO,
            },
        );
        assert_eq!(cb.files.load(Ordering::SeqCst), 1);
        assert_eq!(cb.stages.load(Ordering::SeqCst), 2);
        assert_eq!(cb.completes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn headline_mentions_cancellation_and_skips() {
        let summary = JobSummary {
            was_cancelled: true,
            counters: CounterSnapshot {
                total: 5,
                attempted: 2,
                succeeded: 1,
                errors: 1,
                skipped: 1,
            },
            failed_files: vec![],
            elapsed: Duration::from_secs(3),
        };
        let line = summary.headline();
        assert!(line.contains("cancelled"));
        assert!(line.contains("1 skipped"));
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_job_start(3);
        cb.on_file_start(0, 3, &PathBuf::from("x"));
        cb.on_page_progress(0, Stage::Extract, 1, 10);
        cb.on_log(0, "extracting page 1");
    }
}
