//! The three-stage page pipeline.
//!
//! ```text
//! input container ──▶ extract ──▶ workspace of page images
//!                                      │
//!                                      ▼ (optional)
//!                                  transform (crop → resize → adjust → extend → encode)
//!                                      │
//!                                      ▼
//!                                  package ──▶ cbz / pdf / folder chunks
//! ```
//!
//! Each stage is a blocking primitive over plain paths, deliberately free of
//! async and of orchestration concerns: the same functions run inside worker
//! processes and, via `spawn_blocking`, in-process. Cancellation enters
//! through the stages' progress traits and surfaces as a `Cancelled` outcome
//! rather than an error.

pub mod extract;
pub mod package;
pub mod transform;

pub use extract::{run_extract, ExtractOutcome, ExtractProgress, ExtractRequest, NoExtractProgress};
pub use package::{
    existing_collision, partition_pages, run_package, NoPackageProgress, PackageOutcome,
    PackageProgress, PackageRequest,
};
pub use transform::{probe_dimensions, transform_image, TransformPlan};
