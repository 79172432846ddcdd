//! # comicmill
//!
//! Batch conversion, creation, and extraction of comic archives.
//!
//! ## Why this crate?
//!
//! Comic collections are messy: cbz files that are really RARs, EPUBs full of
//! markup around the page scans, PDFs that wrap one raster image per page,
//! bare folders of loose scans. This crate normalises all of them through one
//! pipeline and writes clean cbz, PDF, or folder output — resized, cropped,
//! re-encoded, and split into volumes on the way when asked.
//!
//! ## Pipeline Overview
//!
//! ```text
//! input (cbz / zip / epub / pdf / image / folder)
//!  │
//!  ├─ 1. Detect    content sniffing, never extension trust
//!  ├─ 2. Extract   unpack pages into a temp workspace (worker process)
//!  ├─ 3. Transform crop → resize → brightness/saturation → extend → encode
//!  ├─ 4. Package   cbz / pdf / folder, split into (i of n) chunks
//!  └─ 5. Summary   per-file outcomes + monotonic batch counters
//! ```
//!
//! Decoding runs in separate worker processes by default, so a segfaulting
//! codec or a decompression bomb costs one file, not the batch. Set
//! `isolate_workers(false)` to run everything in-process instead.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use comicmill::{JobMode, JobOptions, Orchestrator, OutputFormat, ResizeMode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), comicmill::ComicError> {
//!     let options = JobOptions::builder(JobMode::Convert, "out/")
//!         .output_format(OutputFormat::Cbz)
//!         .resize(ResizeMode::FitHeight(1920))
//!         .split_count(2)
//!         .build()?;
//!     let summary = Orchestrator::new(options)
//!         .run(vec!["issue-01.cbz".into(), "issue-02.pdf".into()])
//!         .await?;
//!     println!("{}", summary.headline());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `comicmill` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when embedding only the library:
//! ```toml
//! comicmill = { version = "0.4", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod detect;
pub mod error;
pub mod job;
pub mod options;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod worker;
pub mod workspace;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use detect::{detect_path, ContainerKind};
pub use error::{ComicError, FileError, Stage};
pub use job::{CancelFlag, CounterSnapshot, InputFile, Job, JobCounters};
pub use options::{
    CollisionPolicy, CropSpec, EmbeddedResolution, ExtendSpec, FolderContents, JobMode,
    JobOptions, JobOptionsBuilder, OutputFormat, PageFormat, ResizeMode, TransformExecution,
};
pub use orchestrator::{JobHandle, Orchestrator};
pub use progress::{
    FileOutcome, JobProgressCallback, JobSummary, NoopProgressCallback, ProgressCallback,
};
