//! Worker processes: protocol, supervision, pooling, and the worker loop.
//!
//! The host re-invokes its own executable with [`WORKER_ARG`] to get a
//! worker; everything the worker needs arrives over stdin as protocol
//! messages, so workers carry no configuration of their own.

pub mod pool;
pub mod protocol;
pub mod runtime;
pub mod supervisor;

/// Hidden argv marker that switches the binary into worker mode. Checked
/// before any CLI parsing so it never collides with user-facing flags.
pub const WORKER_ARG: &str = "__worker";

pub use pool::{run_transform_stage, TransformStage, TransformStageOutcome};
pub use protocol::{TaskOutput, WorkerEvent, WorkerTask};
pub use runtime::worker_main;
pub use supervisor::{run_one_shot, TaskTerminal, WorkerChannel, WorkerSpawner};
