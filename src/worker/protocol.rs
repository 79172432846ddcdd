//! Wire protocol between the supervisor and worker processes.
//!
//! Messages travel as newline-delimited JSON: tasks down the worker's stdin,
//! events up its stdout. Every message carries the `file_index` of the input
//! it belongs to, so the supervisor can correlate events even when a pool
//! worker switches between files.
//!
//! The protocol invariant is *exactly one terminal event per task*
//! ([`WorkerEvent::Done`], [`WorkerEvent::Failed`], or
//! [`WorkerEvent::Cancelled`]). A worker that exits without one crashed, and
//! the supervisor synthesizes the failure from its exit status.

use crate::error::{FileError, Stage};
use crate::pipeline::{ExtractRequest, PackageRequest, TransformPlan};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A task sent to a worker over stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerTask {
    Extract {
        file_index: usize,
        request: ExtractRequest,
    },
    Package {
        file_index: usize,
        request: PackageRequest,
    },
    TransformImage {
        file_index: usize,
        image: PathBuf,
        plan: TransformPlan,
    },
    /// Cooperative cancel for the in-flight task. The worker checks for this
    /// between pages and answers with a `Cancelled` terminal.
    Cancel,
    /// Clean end of the session; the worker exits with status zero.
    Shutdown,
}

impl WorkerTask {
    /// The pipeline stage a task runs, for crash attribution.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            WorkerTask::Extract { .. } => Some(Stage::Extract),
            WorkerTask::TransformImage { .. } => Some(Stage::Transform),
            WorkerTask::Package { .. } => Some(Stage::Package),
            WorkerTask::Cancel | WorkerTask::Shutdown => None,
        }
    }

    /// The file this task belongs to; session messages carry none.
    pub fn file_index(&self) -> Option<usize> {
        match self {
            WorkerTask::Extract { file_index, .. }
            | WorkerTask::Package { file_index, .. }
            | WorkerTask::TransformImage { file_index, .. } => Some(*file_index),
            WorkerTask::Cancel | WorkerTask::Shutdown => None,
        }
    }
}

/// An event reported by a worker over stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    Log {
        file_index: usize,
        line: String,
    },
    Progress {
        file_index: usize,
        stage: Stage,
        current: usize,
        total: usize,
    },
    /// Terminal: the task completed.
    Done {
        file_index: usize,
        output: TaskOutput,
    },
    /// Terminal: the task failed; the worker itself is still healthy.
    Failed {
        file_index: usize,
        error: FileError,
    },
    /// Terminal: a `Cancel` was observed mid-task.
    Cancelled {
        file_index: usize,
    },
}

impl WorkerEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerEvent::Done { .. } | WorkerEvent::Failed { .. } | WorkerEvent::Cancelled { .. }
        )
    }

    pub fn file_index(&self) -> usize {
        match self {
            WorkerEvent::Log { file_index, .. }
            | WorkerEvent::Progress { file_index, .. }
            | WorkerEvent::Done { file_index, .. }
            | WorkerEvent::Failed { file_index, .. }
            | WorkerEvent::Cancelled { file_index } => *file_index,
        }
    }
}

/// Payload of a successful task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum TaskOutput {
    Extracted { pages: usize },
    Transformed { image: PathBuf },
    Packaged { outputs: Vec<PathBuf> },
    /// Collision policy `Skip` found the output set already present.
    PackageSkipped { existing: PathBuf },
}

/// Encode one protocol message as a wire line (no trailing newline).
pub fn encode_line<T: Serialize>(message: &T) -> serde_json::Result<String> {
    serde_json::to_string(message)
}

/// Decode one wire line into a protocol message.
pub fn decode_line<'a, T: Deserialize<'a>>(line: &'a str) -> serde_json::Result<T> {
    serde_json::from_str(line.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_round_trips_over_the_wire() {
        let task = WorkerTask::TransformImage {
            file_index: 3,
            image: PathBuf::from("/ws/page_0001.png"),
            plan: TransformPlan::from_options(
                &crate::options::JobOptions::builder(crate::options::JobMode::Convert, "/out")
                    .build()
                    .unwrap(),
            ),
        };
        let line = encode_line(&task).unwrap();
        assert!(line.contains("\"type\":\"transform_image\""), "got: {line}");
        let back: WorkerTask = decode_line(&line).unwrap();
        assert_eq!(back.stage(), Some(Stage::Transform));
    }

    #[test]
    fn terminal_classification() {
        let done = WorkerEvent::Done {
            file_index: 0,
            output: TaskOutput::Extracted { pages: 12 },
        };
        let progress = WorkerEvent::Progress {
            file_index: 0,
            stage: Stage::Extract,
            current: 1,
            total: 12,
        };
        assert!(done.is_terminal());
        assert!(!progress.is_terminal());
    }

    #[test]
    fn failed_event_carries_a_typed_error() {
        let event = WorkerEvent::Failed {
            file_index: 7,
            error: FileError::Transform {
                image: PathBuf::from("p.png"),
                detail: "decode failed".into(),
            },
        };
        let line = encode_line(&event).unwrap();
        let back: WorkerEvent = decode_line(&line).unwrap();
        assert_eq!(back.file_index(), 7);
        let WorkerEvent::Failed { error, .. } = back else {
            panic!("expected failed event");
        };
        assert_eq!(error.stage(), Stage::Transform);
    }
}
