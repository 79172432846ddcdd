//! The job value: inputs, counters, and the cooperative cancel flag.
//!
//! One [`Job`] is owned by the orchestrator for the duration of a batch and
//! passed by reference into stage functions — there is no ambient shared
//! state. The only cross-thread pieces are the cancel flag (host-settable at
//! any time, polled at stage boundaries) and the counters, which only ever
//! move forward.

use crate::detect::ContainerKind;
use crate::options::JobOptions;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// One unit of work: a validated input with a resolved container kind.
#[derive(Debug, Clone)]
pub struct InputFile {
    pub path: PathBuf,
    pub kind: ContainerKind,
    /// Set when the input came from expanding a directory and output should
    /// preserve the subfolder structure relative to that directory.
    pub output_subdir: Option<PathBuf>,
}

impl InputFile {
    pub fn new(path: impl Into<PathBuf>, kind: ContainerKind) -> Self {
        Self {
            path: path.into(),
            kind,
            output_subdir: None,
        }
    }

    /// Output file stem derived from the input name.
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "untitled".to_string())
    }
}

/// Cooperative cancellation handle.
///
/// Cloneable and settable from any thread; the orchestrator polls it at
/// stage and iteration boundaries, and forwards it to live workers as a
/// cancel message. Setting it never preempts an in-flight decode — the
/// result is discarded instead.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Monotonic per-job counters. Never decremented.
///
/// `attempted == errors + succeeded` holds at job end; skipped inputs are
/// counted separately and are not attempts.
#[derive(Debug, Default)]
pub struct JobCounters {
    pub total: AtomicUsize,
    pub attempted: AtomicUsize,
    pub succeeded: AtomicUsize,
    pub errors: AtomicUsize,
    pub skipped: AtomicUsize,
}

impl JobCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            total: self.total.load(Ordering::SeqCst),
            attempted: self.attempted.load(Ordering::SeqCst),
            succeeded: self.succeeded.load(Ordering::SeqCst),
            errors: self.errors.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
        }
    }
}

/// A point-in-time copy of [`JobCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CounterSnapshot {
    pub total: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub errors: usize,
    pub skipped: usize,
}

/// One batch run: validated inputs plus the immutable options snapshot.
#[derive(Debug)]
pub struct Job {
    pub inputs: Vec<InputFile>,
    pub options: JobOptions,
    pub cancel: CancelFlag,
    pub counters: JobCounters,
}

impl Job {
    pub fn new(inputs: Vec<InputFile>, options: JobOptions, cancel: CancelFlag) -> Self {
        let counters = JobCounters::default();
        counters.total.store(inputs.len(), Ordering::SeqCst);
        Self {
            inputs,
            options,
            cancel,
            counters,
        }
    }
}
