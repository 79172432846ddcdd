//! Configuration types for a conversion job.
//!
//! All batch behaviour is controlled through [`JobOptions`], built via its
//! [`JobOptionsBuilder`]. The options value is an immutable snapshot: the
//! orchestrator takes it at job start and never re-reads host state, so UI
//! changes made while a job runs cannot retroactively alter it.
//!
//! # Design choice: builder over constructor
//! A twenty-field constructor is unreadable and breaks on every new field.
//! The builder lets callers set only what they care about and rely on
//! well-documented defaults for the rest.

use crate::error::ComicError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// What kind of batch run this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobMode {
    /// Each input container becomes one (or more, when splitting) output
    /// containers.
    Convert,
    /// All inputs are aggregated into a single output container.
    Create,
    /// Each input container is unpacked into a folder of page images;
    /// no packaging runs.
    Extract,
}

/// Output container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputFormat {
    /// Zip archive of page images (`.cbz`).
    Cbz,
    /// One PDF page per image.
    Pdf,
    /// Plain folder of page images, relative structure preserved.
    Folder,
}

impl OutputFormat {
    /// File extension for container outputs; `None` for folder output.
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            OutputFormat::Cbz => Some("cbz"),
            OutputFormat::Pdf => Some("pdf"),
            OutputFormat::Folder => None,
        }
    }
}

/// Encoded format of a page image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageFormat {
    Jpeg,
    Png,
    Webp,
}

impl PageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            PageFormat::Jpeg => "jpg",
            PageFormat::Png => "png",
            PageFormat::Webp => "webp",
        }
    }

    /// Recognise a page format from a file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(PageFormat::Jpeg),
            "png" => Some(PageFormat::Png),
            "webp" => Some(PageFormat::Webp),
            _ => None,
        }
    }
}

/// How to resize page images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResizeMode {
    /// Scale so the height matches, preserving aspect ratio.
    FitHeight(u32),
    /// Scale so the width matches, preserving aspect ratio.
    FitWidth(u32),
    /// Scale to a percentage of the original dimensions. Requires probing the
    /// original size first.
    Percent(u32),
}

/// Pixels to trim from each edge before any other operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropSpec {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl CropSpec {
    pub fn is_noop(&self) -> bool {
        self.left == 0 && self.top == 0 && self.right == 0 && self.bottom == 0
    }
}

/// Pixels of border to add on each edge, after resizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendSpec {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    /// Border fill colour (RGB).
    pub color: [u8; 3],
}

impl ExtendSpec {
    pub fn is_noop(&self) -> bool {
        self.left == 0 && self.top == 0 && self.right == 0 && self.bottom == 0
    }
}

/// What to do when an output path already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CollisionPolicy {
    /// Replace the existing file.
    Overwrite,
    /// Append " (2)", " (3)", … until the name is free. (default)
    #[default]
    Rename,
    /// Leave the existing file alone and record a skip for the input.
    Skip,
}

/// How to interpret a directory passed as an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FolderContents {
    /// The directory holds comic files; expand it into its contained
    /// containers (recursively), preserving subfolder structure. (default)
    #[default]
    Comics,
    /// The directory IS the comic: treat it as one image-folder unit.
    Images,
}

/// Policy for page-image documents (PDF) whose pages embed a single raster
/// image each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EmbeddedResolution {
    /// Probe the embedded image's native pixel size and extract it directly;
    /// fall back to a fixed-DPI render for pages where probing fails. (default)
    #[default]
    PreferEmbedded,
    /// Always render at the configured DPI.
    FixedDpi,
    /// Probe failures abort extraction for the whole file, keeping output
    /// resolution consistent across pages.
    RequireEmbedded,
}

/// How page transforms are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransformExecution {
    /// One image after another on the calling task, with a cancellation
    /// check before each image.
    #[default]
    Sequential,
    /// Dispatched through the transform worker pool; images complete out of
    /// order, the progress counter still reports completed/total.
    Pooled,
}

/// Immutable configuration snapshot for one batch job.
///
/// Built via [`JobOptions::builder()`] or [`JobOptions::default()`].
///
/// # Example
/// ```rust
/// use comicmill::{JobOptions, JobMode, OutputFormat, ResizeMode};
///
/// let options = JobOptions::builder(JobMode::Convert, "/tmp/out")
///     .output_format(OutputFormat::Cbz)
///     .resize(ResizeMode::FitHeight(1920))
///     .split_count(2)
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOptions {
    /// Batch mode. Selects which stages run and how outputs are named.
    pub mode: JobMode,

    /// Directory that receives output containers (or extraction folders).
    pub output_dir: PathBuf,

    /// Output container format. Ignored in `Extract` mode.
    pub output_format: OutputFormat,

    /// Output base name for `Create` mode. Falls back to the first input's
    /// stem when unset.
    pub output_name: Option<String>,

    /// Force every page image into this format. `None` keeps each page's
    /// current format unless the target container cannot carry it, in which
    /// case the page is silently downgraded to a safe default.
    pub page_format: Option<PageFormat>,

    /// JPEG re-encode quality, 1–100. Default: 90.
    pub jpeg_quality: u8,

    /// Resize step, or `None` to keep original dimensions.
    pub resize: Option<ResizeMode>,

    /// Crop step. Runs first so it operates on original pixel data.
    pub crop: Option<CropSpec>,

    /// Brightness delta, -255..=255. 0 is a no-op.
    pub brightness: i32,

    /// Saturation multiplier. 1.0 is a no-op, 0.0 is grayscale.
    pub saturation: f32,

    /// Border extension, applied after resize so the padding is never scaled.
    pub extend: Option<ExtendSpec>,

    /// Number of output containers to split each input into. 1 = no split.
    /// The page set is partitioned into contiguous, near-equal chunks with
    /// the remainder assigned to the earliest chunks.
    pub split_count: u32,

    /// What to do when an output name already exists.
    pub on_collision: CollisionPolicy,

    /// How directories passed as inputs are interpreted.
    pub input_folders_contain: FolderContents,

    /// Embedded-image policy for PDF extraction.
    pub embedded_resolution: EmbeddedResolution,

    /// Render DPI used when PDF pages are rasterised (72–400). Default: 150.
    pub dpi: u32,

    /// Password for encrypted PDF inputs.
    pub password: Option<String>,

    /// Sequential or pooled page transforms.
    pub transform_execution: TransformExecution,

    /// Transform pool size. Default: half of available hardware concurrency,
    /// minimum 1.
    pub max_workers: usize,

    /// Run decoders and encoders in separate worker processes (default).
    /// When disabled, the same stage primitives run in-process on the
    /// blocking thread pool — useful for tests and embedders that cannot
    /// re-enter their own executable.
    pub isolate_workers: bool,

    /// Address-space cap for document-extraction workers, in MiB. Exceeding
    /// it crashes the worker, which the supervisor reports as a stage
    /// failure. `None` = unlimited.
    pub worker_memory_limit_mb: Option<u64>,

    /// Carry a ComicInfo.xml sidecar through to archive outputs, with its
    /// page-count and per-page dimension fields regenerated.
    pub keep_comic_info: bool,

    /// Parent directory for temp workspaces. `None` = system temp dir.
    pub scratch_dir: Option<PathBuf>,
}

/// Default pool size: half the hardware threads, at least one.
fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() / 2)
        .unwrap_or(1)
        .max(1)
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            mode: JobMode::Convert,
            output_dir: PathBuf::from("."),
            output_format: OutputFormat::Cbz,
            output_name: None,
            page_format: None,
            jpeg_quality: 90,
            resize: None,
            crop: None,
            brightness: 0,
            saturation: 1.0,
            extend: None,
            split_count: 1,
            on_collision: CollisionPolicy::default(),
            input_folders_contain: FolderContents::default(),
            embedded_resolution: EmbeddedResolution::default(),
            dpi: 150,
            password: None,
            transform_execution: TransformExecution::default(),
            max_workers: default_max_workers(),
            isolate_workers: true,
            worker_memory_limit_mb: Some(2048),
            keep_comic_info: true,
            scratch_dir: None,
        }
    }
}

impl JobOptions {
    /// Create a builder for the given mode and output directory.
    pub fn builder(mode: JobMode, output_dir: impl Into<PathBuf>) -> JobOptionsBuilder {
        let mut config = Self::default();
        config.mode = mode;
        config.output_dir = output_dir.into();
        JobOptionsBuilder { config }
    }

    /// Whether any per-page transform work is configured.
    ///
    /// Format compatibility with the target container is decided per page at
    /// transform time, so a `false` here only means the configured knobs are
    /// all at their no-op values.
    pub fn wants_transform(&self) -> bool {
        self.resize.is_some()
            || self.crop.map(|c| !c.is_noop()).unwrap_or(false)
            || self.brightness != 0
            || (self.saturation - 1.0).abs() > f32::EPSILON
            || self.extend.map(|e| !e.is_noop()).unwrap_or(false)
            || self.page_format.is_some()
    }
}

/// Builder for [`JobOptions`].
#[derive(Debug)]
pub struct JobOptionsBuilder {
    config: JobOptions,
}

impl JobOptionsBuilder {
    pub fn output_format(mut self, f: OutputFormat) -> Self {
        self.config.output_format = f;
        self
    }

    pub fn output_name(mut self, name: impl Into<String>) -> Self {
        self.config.output_name = Some(name.into());
        self
    }

    pub fn page_format(mut self, f: PageFormat) -> Self {
        self.config.page_format = Some(f);
        self
    }

    pub fn jpeg_quality(mut self, q: u8) -> Self {
        self.config.jpeg_quality = q.clamp(1, 100);
        self
    }

    pub fn resize(mut self, mode: ResizeMode) -> Self {
        self.config.resize = Some(mode);
        self
    }

    pub fn crop(mut self, spec: CropSpec) -> Self {
        self.config.crop = Some(spec);
        self
    }

    pub fn brightness(mut self, delta: i32) -> Self {
        self.config.brightness = delta.clamp(-255, 255);
        self
    }

    pub fn saturation(mut self, factor: f32) -> Self {
        self.config.saturation = factor.clamp(0.0, 4.0);
        self
    }

    pub fn extend(mut self, spec: ExtendSpec) -> Self {
        self.config.extend = Some(spec);
        self
    }

    pub fn split_count(mut self, n: u32) -> Self {
        self.config.split_count = n.max(1);
        self
    }

    pub fn on_collision(mut self, policy: CollisionPolicy) -> Self {
        self.config.on_collision = policy;
        self
    }

    pub fn input_folders_contain(mut self, contents: FolderContents) -> Self {
        self.config.input_folders_contain = contents;
        self
    }

    pub fn embedded_resolution(mut self, policy: EmbeddedResolution) -> Self {
        self.config.embedded_resolution = policy;
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn transform_execution(mut self, exec: TransformExecution) -> Self {
        self.config.transform_execution = exec;
        self
    }

    pub fn max_workers(mut self, n: usize) -> Self {
        self.config.max_workers = n.max(1);
        self
    }

    pub fn isolate_workers(mut self, v: bool) -> Self {
        self.config.isolate_workers = v;
        self
    }

    pub fn worker_memory_limit_mb(mut self, limit: Option<u64>) -> Self {
        self.config.worker_memory_limit_mb = limit;
        self
    }

    pub fn keep_comic_info(mut self, v: bool) -> Self {
        self.config.keep_comic_info = v;
        self
    }

    pub fn scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.scratch_dir = Some(dir.into());
        self
    }

    /// Build the options, validating cross-field constraints.
    pub fn build(self) -> Result<JobOptions, ComicError> {
        let c = &self.config;
        if let Some(ResizeMode::Percent(p)) = c.resize {
            if p == 0 || p > 800 {
                return Err(ComicError::InvalidConfig(format!(
                    "resize percentage must be 1–800, got {p}"
                )));
            }
        }
        if let Some(ResizeMode::FitHeight(0) | ResizeMode::FitWidth(0)) = c.resize {
            return Err(ComicError::InvalidConfig(
                "resize target dimension must be ≥ 1".into(),
            ));
        }
        if c.mode == JobMode::Extract && c.split_count > 1 {
            return Err(ComicError::InvalidConfig(
                "splitting applies to container output, not extraction".into(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_clamps_out_of_range_values() {
        let o = JobOptions::builder(JobMode::Convert, "/tmp")
            .jpeg_quality(250)
            .brightness(-999)
            .dpi(9000)
            .split_count(0)
            .max_workers(0)
            .build()
            .unwrap();
        assert_eq!(o.jpeg_quality, 100);
        assert_eq!(o.brightness, -255);
        assert_eq!(o.dpi, 400);
        assert_eq!(o.split_count, 1);
        assert_eq!(o.max_workers, 1);
    }

    #[test]
    fn zero_percent_resize_rejected() {
        let err = JobOptions::builder(JobMode::Convert, "/tmp")
            .resize(ResizeMode::Percent(0))
            .build();
        assert!(matches!(err, Err(ComicError::InvalidConfig(_))));
    }

    #[test]
    fn split_in_extract_mode_rejected() {
        let err = JobOptions::builder(JobMode::Extract, "/tmp")
            .split_count(3)
            .build();
        assert!(matches!(err, Err(ComicError::InvalidConfig(_))));
    }

    #[test]
    fn wants_transform_reflects_configured_ops() {
        let o = JobOptions::builder(JobMode::Convert, "/tmp").build().unwrap();
        assert!(!o.wants_transform());

        let o = JobOptions::builder(JobMode::Convert, "/tmp")
            .resize(ResizeMode::FitWidth(1080))
            .build()
            .unwrap();
        assert!(o.wants_transform());

        let o = JobOptions::builder(JobMode::Convert, "/tmp")
            .saturation(0.0)
            .build()
            .unwrap();
        assert!(o.wants_transform());
    }

    #[test]
    fn default_pool_size_is_at_least_one() {
        assert!(JobOptions::default().max_workers >= 1);
    }
}
