//! Error types for the comicmill library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`ComicError`] — **Job-fatal**: the batch cannot proceed at all (no
//!   scratch space, no valid inputs, invalid configuration). Returned as
//!   `Err(ComicError)` from the top-level `run*` functions.
//!
//! * [`FileError`] — **Per-file**: one input failed (corrupt archive, broken
//!   page image, packaging error) but the rest of the batch is fine. Recorded
//!   in the file's [`crate::progress::FileOutcome`] and in the final
//!   [`crate::progress::JobSummary`], never propagated past the batch loop.
//!
//! The separation lets the orchestrator continue over a damaged input while
//! still refusing to "process" a batch it could never stage.

use std::path::PathBuf;
use thiserror::Error;

/// All job-fatal errors returned by the comicmill library.
///
/// Per-file failures use [`FileError`] and are aggregated in the job summary
/// rather than propagated here.
#[derive(Debug, Error)]
pub enum ComicError {
    /// No scratch directory could be created at all. Continuing would mean
    /// "processing" files that cannot be staged, so the batch ends here.
    #[error("Cannot create a temp workspace under '{path}': {source}\nCheck free space and permissions.")]
    WorkspaceUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The output directory does not exist and could not be created.
    #[error("Cannot prepare output location '{path}': {source}")]
    OutputLocation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Every supplied input was dropped during type detection.
    #[error("No convertible inputs: none of the {rejected} supplied paths resolved to a supported container, image, or folder")]
    NoValidInputs { rejected: usize },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Which pipeline stage a failure belongs to.
///
/// Worker crashes are mapped onto the stage that was active when the worker
/// died, so a crash and an ordinary stage failure look the same downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extract,
    Transform,
    Package,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Extract => write!(f, "extract"),
            Stage::Transform => write!(f, "transform"),
            Stage::Package => write!(f, "package"),
        }
    }
}

/// A non-fatal error for a single input file.
///
/// The batch loop converts every stage failure into one of these, logs it
/// with the offending path, bumps the error counter, and moves on.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum FileError {
    /// Content sniffing produced no supported container kind.
    #[error("'{path}': unsupported input ({detail})")]
    UnsupportedInput { path: PathBuf, detail: String },

    /// The extraction stage failed for this file.
    ///
    /// `low_disk` is set when the underlying cause was recognisably
    /// out-of-disk-space, so the host can show a clearer message than a
    /// generic extraction failure.
    #[error("'{path}': extraction failed: {detail}{}", if *.low_disk { " (disk full)" } else { "" })]
    Extraction {
        path: PathBuf,
        detail: String,
        low_disk: bool,
    },

    /// A page image could not be transformed. Fatal to the whole file: a
    /// malformed page cannot be silently dropped from a comic.
    #[error("'{image}': page transform failed: {detail}")]
    Transform { image: PathBuf, detail: String },

    /// The packaging stage failed for this file.
    #[error("'{output}': packaging failed: {detail}")]
    Packaging { output: PathBuf, detail: String },
}

impl FileError {
    /// Synthesize a stage failure from a worker process that exited without
    /// reporting a terminal result.
    pub fn worker_crash(stage: Stage, path: PathBuf, exit_code: Option<i32>) -> Self {
        let detail = match exit_code {
            Some(code) => format!("worker exited with status {code} before reporting a result"),
            None => "worker terminated by signal before reporting a result".to_string(),
        };
        match stage {
            Stage::Extract => FileError::Extraction {
                path,
                detail,
                low_disk: false,
            },
            Stage::Transform => FileError::Transform {
                image: path,
                detail,
            },
            Stage::Package => FileError::Packaging {
                output: path,
                detail,
            },
        }
    }

    /// The stage this error belongs to.
    pub fn stage(&self) -> Stage {
        match self {
            FileError::UnsupportedInput { .. } | FileError::Extraction { .. } => Stage::Extract,
            FileError::Transform { .. } => Stage::Transform,
            FileError::Packaging { .. } => Stage::Package,
        }
    }

    /// True when the root cause was recognisably a full disk.
    pub fn is_low_disk(&self) -> bool {
        matches!(self, FileError::Extraction { low_disk: true, .. })
    }
}

/// Classify an I/O error as out-of-disk-space.
///
/// `ErrorKind::StorageFull` covers the portable case; the raw `ENOSPC` check
/// catches platforms where the kind is reported as `Other`.
pub fn is_disk_full(err: &std::io::Error) -> bool {
    if err.kind() == std::io::ErrorKind::StorageFull {
        return true;
    }
    matches!(err.raw_os_error(), Some(28))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extraction_display_tags_low_disk() {
        let e = FileError::Extraction {
            path: PathBuf::from("a.cbz"),
            detail: "write failed".into(),
            low_disk: true,
        };
        let msg = e.to_string();
        assert!(msg.contains("disk full"), "got: {msg}");

        let e = FileError::Extraction {
            path: PathBuf::from("a.cbz"),
            detail: "bad entry".into(),
            low_disk: false,
        };
        assert!(!e.to_string().contains("disk full"));
    }

    #[test]
    fn worker_crash_maps_to_active_stage() {
        let e = FileError::worker_crash(Stage::Transform, PathBuf::from("p01.png"), Some(137));
        assert_eq!(e.stage(), Stage::Transform);
        assert!(e.to_string().contains("137"), "got: {e}");

        let e = FileError::worker_crash(Stage::Extract, PathBuf::from("x.pdf"), None);
        assert_eq!(e.stage(), Stage::Extract);
        assert!(e.to_string().contains("signal"));
    }

    #[test]
    fn no_valid_inputs_display() {
        let e = ComicError::NoValidInputs { rejected: 3 };
        assert!(e.to_string().contains("3"));
    }
}
