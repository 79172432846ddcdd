//! Stage three: assemble page images into output containers.
//!
//! Packaging is split-aware: one workspace of pages becomes `split_count`
//! contiguous chunks, each written as its own container. The whole output
//! set is treated atomically — collision policy is decided once for the
//! entire set, and a failure or cancellation mid-set removes the chunks
//! already written rather than leaving a partial split behind.

use crate::error::FileError;
use crate::options::{CollisionPolicy, OutputFormat, PageFormat};
use once_cell::sync::Lazy;
use pdfium_render::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::ops::Range;
use std::path::{Path, PathBuf};
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::CompressionMethod;

/// One packaging assignment. Serialisable for the worker protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageRequest {
    /// Workspace directory holding the transformed page images.
    pub workspace: PathBuf,
    /// Output base name, without extension.
    pub stem: String,
    pub output_dir: PathBuf,
    pub format: OutputFormat,
    pub split_count: u32,
    pub on_collision: CollisionPolicy,
    pub keep_comic_info: bool,
}

/// How a packaging pass ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageOutcome {
    /// Every chunk was written; paths are in chunk order.
    Written(Vec<PathBuf>),
    /// The collision policy was `Skip` and (part of) the output set existed.
    Skipped(PathBuf),
    /// A cancellation check fired between chunks; partial chunks were removed.
    Cancelled,
}

/// Progress sink with a cooperative cancellation probe, checked between
/// chunks.
pub trait PackageProgress {
    fn on_chunk(&mut self, current: usize, total: usize) {
        let _ = (current, total);
    }
    fn should_cancel(&self) -> bool {
        false
    }
}

pub struct NoPackageProgress;

impl PackageProgress for NoPackageProgress {}

/// Package the workspace into one or more containers. Blocking.
pub fn run_package(
    request: &PackageRequest,
    progress: &mut dyn PackageProgress,
) -> Result<PackageOutcome, FileError> {
    let pages = list_pages(&request.workspace)
        .map_err(|e| packaging_error(&request.output_dir, format!("cannot list pages: {e}")))?;
    if pages.is_empty() {
        return Err(packaging_error(
            &request.output_dir,
            "workspace contains no pages to package".to_string(),
        ));
    }

    let split = (request.split_count as usize).min(pages.len());
    let outputs = match resolve_outputs(request, split) {
        Resolution::Write(paths) => paths,
        Resolution::Skip(existing) => return Ok(PackageOutcome::Skipped(existing)),
    };

    let comic_info = request
        .keep_comic_info
        .then(|| std::fs::read_to_string(request.workspace.join("ComicInfo.xml")).ok())
        .flatten();

    let chunks = partition_pages(pages.len(), split);
    let mut written: Vec<PathBuf> = Vec::with_capacity(split);
    for (i, range) in chunks.iter().enumerate() {
        if progress.should_cancel() {
            remove_outputs(&written);
            return Ok(PackageOutcome::Cancelled);
        }
        let chunk = &pages[range.clone()];
        let out = &outputs[i];
        let result = match request.format {
            OutputFormat::Cbz => package_cbz(request, chunk, comic_info.as_deref(), out),
            OutputFormat::Pdf => package_pdf(chunk, out),
            OutputFormat::Folder => package_folder(request, chunk, comic_info.as_deref(), out),
        };
        if let Err(e) = result {
            // Half a split set is worse than none.
            remove_outputs(&written);
            let _ = std::fs::remove_file(out);
            return Err(e);
        }
        written.push(out.clone());
        progress.on_chunk(i + 1, chunks.len());
    }
    debug!("packaged {} chunk(s) for '{}'", written.len(), request.stem);
    Ok(PackageOutcome::Written(written))
}

fn packaging_error(output: &Path, detail: String) -> FileError {
    FileError::Packaging {
        output: output.to_path_buf(),
        detail,
    }
}

/// Contiguous near-equal chunks, remainder assigned to the earliest chunks.
///
/// Ten pages over three chunks come out as 4, 3, 3.
pub fn partition_pages(page_count: usize, split_count: usize) -> Vec<Range<usize>> {
    let split = split_count.clamp(1, page_count.max(1));
    let base = page_count / split;
    let remainder = page_count % split;
    let mut ranges = Vec::with_capacity(split);
    let mut start = 0;
    for i in 0..split {
        let len = base + usize::from(i < remainder);
        ranges.push(start..start + len);
        start += len;
    }
    ranges
}

enum Resolution {
    Write(Vec<PathBuf>),
    Skip(PathBuf),
}

/// The output path set for one stem: `stem.ext`, or
/// `stem (i of n).ext` per chunk when splitting.
fn output_candidates(
    output_dir: &Path,
    stem: &str,
    format: OutputFormat,
    split: usize,
) -> Vec<PathBuf> {
    (1..=split)
        .map(|i| {
            let name = if split > 1 {
                format!("{stem} ({i} of {split})")
            } else {
                stem.to_string()
            };
            match format.extension() {
                Some(ext) => output_dir.join(format!("{name}.{ext}")),
                None => output_dir.join(name),
            }
        })
        .collect()
}

/// Pre-flight collision probe: the first already-existing path of the
/// requested output set.
///
/// Used to honour `CollisionPolicy::Skip` before extraction starts instead
/// of after all the decode work is done. The packaging stage re-resolves at
/// write time, so a near-simultaneous writer still cannot be clobbered.
pub fn existing_collision(
    output_dir: &Path,
    stem: &str,
    format: OutputFormat,
    split_count: u32,
) -> Option<PathBuf> {
    output_candidates(output_dir, stem, format, split_count.max(1) as usize)
        .into_iter()
        .find(|p| p.exists())
}

/// Decide the full output path set for a (possibly renamed) stem.
///
/// Collision policy applies to the set as a whole: a rename bumps the stem
/// until every chunk name is free, and a skip triggers if any chunk exists.
/// Deciding per chunk instead could interleave two different runs' outputs.
fn resolve_outputs(request: &PackageRequest, split: usize) -> Resolution {
    let candidate =
        |stem: &str| output_candidates(&request.output_dir, stem, request.format, split);

    let first_choice = candidate(&request.stem);
    let collision = first_choice.iter().find(|p| p.exists()).cloned();
    match (collision, request.on_collision) {
        (None, _) | (Some(_), CollisionPolicy::Overwrite) => Resolution::Write(first_choice),
        (Some(existing), CollisionPolicy::Skip) => Resolution::Skip(existing),
        (Some(_), CollisionPolicy::Rename) => {
            for k in 2.. {
                let paths = candidate(&format!("{} ({k})", request.stem));
                if paths.iter().all(|p| !p.exists()) {
                    return Resolution::Write(paths);
                }
            }
            unreachable!()
        }
    }
}

fn remove_outputs(paths: &[PathBuf]) {
    for p in paths {
        if p.is_dir() {
            let _ = std::fs::remove_dir_all(p);
        } else {
            let _ = std::fs::remove_file(p);
        }
    }
}

/// Page images under `dir`, recursively, in path order.
fn list_pages(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                walk(&path, out)?;
            } else if path
                .extension()
                .and_then(|e| e.to_str())
                .and_then(PageFormat::from_extension)
                .is_some()
            {
                out.push(path);
            }
        }
        Ok(())
    }
    let mut pages = Vec::new();
    walk(dir, &mut pages)?;
    pages.sort();
    Ok(pages)
}

fn entry_name(request: &PackageRequest, page: &Path) -> String {
    page.strip_prefix(&request.workspace)
        .unwrap_or(page)
        .to_string_lossy()
        .replace('\\', "/")
}

/// Write one chunk as a cbz.
///
/// Page images are stored uncompressed — they are already compressed formats
/// and deflating them again wastes time for nothing. The ComicInfo sidecar
/// is small and textual, so it does get deflated.
fn package_cbz(
    request: &PackageRequest,
    pages: &[PathBuf],
    comic_info: Option<&str>,
    out: &Path,
) -> Result<(), FileError> {
    let file = std::fs::File::create(out)
        .map_err(|e| packaging_error(out, format!("cannot create archive: {e}")))?;
    let mut writer = zip::ZipWriter::new(file);
    let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

    for page in pages {
        let bytes = std::fs::read(page)
            .map_err(|e| packaging_error(out, format!("cannot read '{}': {e}", page.display())))?;
        writer
            .start_file(entry_name(request, page), stored)
            .and_then(|()| writer.write_all(&bytes).map_err(zip::result::ZipError::Io))
            .map_err(|e| packaging_error(out, format!("cannot add page: {e}")))?;
    }

    if let Some(xml) = comic_info {
        let xml = regenerate_comic_info(xml, &page_dimensions(pages, out)?);
        writer
            .start_file(
                "ComicInfo.xml",
                SimpleFileOptions::default().compression_method(CompressionMethod::Deflated),
            )
            .and_then(|()| writer.write_all(xml.as_bytes()).map_err(zip::result::ZipError::Io))
            .map_err(|e| packaging_error(out, format!("cannot add ComicInfo.xml: {e}")))?;
    }

    writer
        .finish()
        .map_err(|e| packaging_error(out, format!("cannot finalise archive: {e}")))?;
    Ok(())
}

/// Write one chunk as a PDF, one full-bleed image per page.
///
/// Pages are sized one point per pixel, so the PDF preserves each image's
/// aspect ratio exactly and viewers pick the display scale.
fn package_pdf(pages: &[PathBuf], out: &Path) -> Result<(), FileError> {
    let bindings = Pdfium::bind_to_system_library()
        .map_err(|e| packaging_error(out, format!("pdfium library unavailable: {e}")))?;
    let pdfium = Pdfium::new(bindings);
    let mut document = pdfium.create_new_pdf()
        .map_err(|e| packaging_error(out, format!("cannot create pdf: {e}")))?;

    for page_path in pages {
        let image = image::open(page_path).map_err(|e| {
            packaging_error(out, format!("cannot decode '{}': {e}", page_path.display()))
        })?;
        let (w, h) = (image.width() as f32, image.height() as f32);
        let mut page = document
            .pages_mut()
            .create_page_at_end(PdfPagePaperSize::Custom(
                PdfPoints::new(w),
                PdfPoints::new(h),
            ))
            .map_err(|e| packaging_error(out, format!("cannot add pdf page: {e}")))?;
        page.objects_mut()
            .create_image_object(
                PdfPoints::ZERO,
                PdfPoints::ZERO,
                &image,
                Some(PdfPoints::new(w)),
                Some(PdfPoints::new(h)),
            )
            .map_err(|e| packaging_error(out, format!("cannot embed page image: {e}")))?;
    }

    document
        .save_to_file(out)
        .map_err(|e| packaging_error(out, format!("cannot write pdf: {e}")))?;
    Ok(())
}

/// Write one chunk as a plain folder, preserving relative page paths.
fn package_folder(
    request: &PackageRequest,
    pages: &[PathBuf],
    comic_info: Option<&str>,
    out: &Path,
) -> Result<(), FileError> {
    std::fs::create_dir_all(out)
        .map_err(|e| packaging_error(out, format!("cannot create folder: {e}")))?;
    for page in pages {
        let dest = out.join(entry_name(request, page));
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| packaging_error(out, format!("cannot create subfolder: {e}")))?;
        }
        std::fs::copy(page, &dest).map_err(|e| {
            packaging_error(out, format!("cannot copy '{}': {e}", page.display()))
        })?;
    }
    if let Some(xml) = comic_info {
        let xml = regenerate_comic_info(xml, &page_dimensions(pages, out)?);
        std::fs::write(out.join("ComicInfo.xml"), xml)
            .map_err(|e| packaging_error(out, format!("cannot write ComicInfo.xml: {e}")))?;
    }
    Ok(())
}

fn page_dimensions(pages: &[PathBuf], out: &Path) -> Result<Vec<(u32, u32)>, FileError> {
    pages
        .iter()
        .map(|p| {
            image::image_dimensions(p).map_err(|e| {
                packaging_error(out, format!("cannot probe '{}': {e}", p.display()))
            })
        })
        .collect()
}

static PAGE_COUNT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<PageCount>\s*\d+\s*</PageCount>").unwrap());
static PAGES_BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<Pages>.*?</Pages>|<Pages\s*/>").unwrap());

/// Rewrite a ComicInfo.xml's page bookkeeping to match the packaged chunk.
///
/// After splitting or transforming, the sidecar's `<PageCount>` and per-page
/// `<Pages>` entries describe a container that no longer exists; everything
/// else (series, writer, summary) is carried through untouched.
pub fn regenerate_comic_info(xml: &str, dimensions: &[(u32, u32)]) -> String {
    let count = dimensions.len();
    let mut pages_block = String::from("<Pages>");
    for (i, (w, h)) in dimensions.iter().enumerate() {
        pages_block.push_str(&format!(
            "<Page Image=\"{i}\" ImageWidth=\"{w}\" ImageHeight=\"{h}\" />"
        ));
    }
    pages_block.push_str("</Pages>");

    let mut out = PAGE_COUNT_RE
        .replace(xml, format!("<PageCount>{count}</PageCount>").as_str())
        .into_owned();
    if PAGES_BLOCK_RE.is_match(&out) {
        out = PAGES_BLOCK_RE.replace(&out, pages_block.as_str()).into_owned();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage_pages(dir: &Path, count: usize) {
        let img = image::RgbaImage::from_pixel(8, 12, image::Rgba([9, 9, 9, 255]));
        for i in 1..=count {
            img.save(dir.join(format!("page_{i:04}.png"))).unwrap();
        }
    }

    fn request(workspace: &Path, output_dir: &Path) -> PackageRequest {
        PackageRequest {
            workspace: workspace.to_path_buf(),
            stem: "comic".to_string(),
            output_dir: output_dir.to_path_buf(),
            format: OutputFormat::Cbz,
            split_count: 1,
            on_collision: CollisionPolicy::Rename,
            keep_comic_info: true,
        }
    }

    #[test]
    fn partition_assigns_remainder_to_earliest_chunks() {
        let ranges = partition_pages(10, 3);
        let lens: Vec<usize> = ranges.iter().map(|r| r.len()).collect();
        assert_eq!(lens, vec![4, 3, 3]);
        assert_eq!(ranges[0], 0..4);
        assert_eq!(ranges[2], 7..10);

        assert_eq!(partition_pages(3, 1), vec![0..3]);
        // More chunks than pages degrades to one page per chunk.
        assert_eq!(partition_pages(2, 5).len(), 2);
    }

    #[test]
    fn single_cbz_round_trip() {
        let ws = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        stage_pages(ws.path(), 3);
        let req = request(ws.path(), out.path());
        let outcome = run_package(&req, &mut NoPackageProgress).unwrap();
        let PackageOutcome::Written(paths) = outcome else {
            panic!("expected written outcome");
        };
        assert_eq!(paths, vec![out.path().join("comic.cbz")]);

        let archive =
            zip::ZipArchive::new(std::fs::File::open(&paths[0]).unwrap()).unwrap();
        assert_eq!(archive.len(), 3);
    }

    #[test]
    fn split_names_and_chunk_sizes() {
        let ws = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        stage_pages(ws.path(), 10);
        let mut req = request(ws.path(), out.path());
        req.split_count = 3;
        let PackageOutcome::Written(paths) = run_package(&req, &mut NoPackageProgress).unwrap()
        else {
            panic!("expected written outcome");
        };
        assert_eq!(paths[0], out.path().join("comic (1 of 3).cbz"));
        assert_eq!(paths[2], out.path().join("comic (3 of 3).cbz"));

        let sizes: Vec<usize> = paths
            .iter()
            .map(|p| zip::ZipArchive::new(std::fs::File::open(p).unwrap()).unwrap().len())
            .collect();
        assert_eq!(sizes, vec![4, 3, 3]);
    }

    #[test]
    fn rename_bumps_the_whole_set() {
        let ws = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        stage_pages(ws.path(), 4);
        // Only the second chunk name collides, but the whole set must move.
        std::fs::write(out.path().join("comic (2 of 2).cbz"), b"old").unwrap();
        let mut req = request(ws.path(), out.path());
        req.split_count = 2;
        let PackageOutcome::Written(paths) = run_package(&req, &mut NoPackageProgress).unwrap()
        else {
            panic!("expected written outcome");
        };
        assert_eq!(paths[0], out.path().join("comic (2) (1 of 2).cbz"));
        assert_eq!(paths[1], out.path().join("comic (2) (2 of 2).cbz"));
    }

    #[test]
    fn skip_policy_reports_existing_path() {
        let ws = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        stage_pages(ws.path(), 2);
        std::fs::write(out.path().join("comic.cbz"), b"old").unwrap();
        let mut req = request(ws.path(), out.path());
        req.on_collision = CollisionPolicy::Skip;
        let outcome = run_package(&req, &mut NoPackageProgress).unwrap();
        assert_eq!(
            outcome,
            PackageOutcome::Skipped(out.path().join("comic.cbz"))
        );
        // The existing file was left alone.
        assert_eq!(std::fs::read(out.path().join("comic.cbz")).unwrap(), b"old");
    }

    #[test]
    fn cancellation_removes_partial_chunks() {
        struct CancelAfterFirstChunk {
            chunks: usize,
        }
        impl PackageProgress for CancelAfterFirstChunk {
            fn on_chunk(&mut self, _c: usize, _t: usize) {
                self.chunks += 1;
            }
            fn should_cancel(&self) -> bool {
                self.chunks >= 1
            }
        }

        let ws = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        stage_pages(ws.path(), 6);
        let mut req = request(ws.path(), out.path());
        req.split_count = 3;
        let outcome =
            run_package(&req, &mut CancelAfterFirstChunk { chunks: 0 }).unwrap();
        assert_eq!(outcome, PackageOutcome::Cancelled);
        assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
    }

    #[test]
    fn folder_output_preserves_structure_and_sidecar() {
        let ws = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        std::fs::create_dir(ws.path().join("ch1")).unwrap();
        let img = image::RgbaImage::from_pixel(8, 12, image::Rgba([1, 1, 1, 255]));
        img.save(ws.path().join("ch1/p01.png")).unwrap();
        std::fs::write(
            ws.path().join("ComicInfo.xml"),
            "<ComicInfo><PageCount>99</PageCount></ComicInfo>",
        )
        .unwrap();
        let mut req = request(ws.path(), out.path());
        req.format = OutputFormat::Folder;
        let PackageOutcome::Written(paths) = run_package(&req, &mut NoPackageProgress).unwrap()
        else {
            panic!("expected written outcome");
        };
        assert_eq!(paths, vec![out.path().join("comic")]);
        assert!(out.path().join("comic/ch1/p01.png").is_file());
        let xml = std::fs::read_to_string(out.path().join("comic/ComicInfo.xml")).unwrap();
        assert!(xml.contains("<PageCount>1</PageCount>"), "got: {xml}");
    }

    #[test]
    fn comic_info_page_bookkeeping_regenerated() {
        let xml = "<ComicInfo><Series>X</Series><PageCount>10</PageCount>\
                   <Pages><Page Image=\"0\" ImageWidth=\"5\" ImageHeight=\"5\" /></Pages></ComicInfo>";
        let out = regenerate_comic_info(xml, &[(100, 200), (100, 200)]);
        assert!(out.contains("<Series>X</Series>"));
        assert!(out.contains("<PageCount>2</PageCount>"));
        assert!(out.contains("ImageHeight=\"200\""));
        assert!(!out.contains("ImageWidth=\"5\""));
    }
}
