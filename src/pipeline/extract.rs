//! Stage one: unpack an input container into a workspace of page images.
//!
//! Every supported container kind funnels through [`run_extract`], which
//! writes page images into the destination workspace and reports per-page
//! progress. Page order is encoded in file names: archive entries keep their
//! own names (the cbz ordering contract), while EPUB images, loose images and
//! rendered PDF pages get positional `page_NNNN` names.
//!
//! Extraction is where disk exhaustion usually strikes, so every write path
//! maps `ENOSPC`-class failures through [`is_disk_full`] into the `low_disk`
//! tag on [`FileError::Extraction`].

use crate::detect::ContainerKind;
use crate::error::{is_disk_full, FileError};
use crate::options::{EmbeddedResolution, PageFormat};
use image::DynamicImage;
use pdfium_render::prelude::*;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One extraction assignment. Serialisable because it crosses the worker
/// process boundary verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractRequest {
    pub input: PathBuf,
    pub kind: ContainerKind,
    /// Workspace directory receiving the page images.
    pub dest: PathBuf,
    pub embedded_resolution: EmbeddedResolution,
    /// Render DPI for rasterised PDF pages.
    pub dpi: u32,
    pub password: Option<String>,
    pub keep_comic_info: bool,
}

/// How an extraction pass ended (errors are the `Err` channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractOutcome {
    Completed { pages: usize },
    /// A cancellation check between pages fired; the workspace holds a
    /// partial extraction the caller is expected to discard.
    Cancelled,
}

/// Per-page progress sink, with a cooperative cancellation probe.
///
/// In-process callers adapt this onto the job's progress callback and cancel
/// flag; worker processes adapt it onto protocol messages.
pub trait ExtractProgress {
    fn on_page(&mut self, current: usize, total: usize) {
        let _ = (current, total);
    }
    fn on_log(&mut self, line: &str) {
        let _ = line;
    }
    fn should_cancel(&self) -> bool {
        false
    }
}

/// Sink for callers that need neither progress nor cancellation.
pub struct NoExtractProgress;

impl ExtractProgress for NoExtractProgress {}

/// Extract `request.input` into `request.dest`. Blocking.
pub fn run_extract(
    request: &ExtractRequest,
    progress: &mut dyn ExtractProgress,
) -> Result<ExtractOutcome, FileError> {
    match request.kind {
        ContainerKind::Zip => extract_zip(request, progress),
        ContainerKind::Epub => extract_epub(request, progress),
        ContainerKind::Pdf => extract_pdf(request, progress),
        ContainerKind::Image => stage_single_image(request),
        ContainerKind::ImageFolder => stage_image_folder(request, progress),
    }
}

fn extraction_error(request: &ExtractRequest, detail: String) -> FileError {
    FileError::Extraction {
        path: request.input.clone(),
        detail,
        low_disk: false,
    }
}

fn write_error(request: &ExtractRequest, detail: String, err: &std::io::Error) -> FileError {
    FileError::Extraction {
        path: request.input.clone(),
        detail,
        low_disk: is_disk_full(err),
    }
}

fn is_comic_info(name: &str) -> bool {
    name.rsplit('/')
        .next()
        .map(|n| n.eq_ignore_ascii_case("ComicInfo.xml"))
        .unwrap_or(false)
}

fn page_file_name(index: usize, format: PageFormat) -> String {
    format!("page_{:04}.{}", index, format.extension())
}

/// Copy page entries out of a cbz/zip, preserving entry names.
///
/// Entry names are the reading-order contract of the cbz format, so they are
/// kept as-is (subfolders included). Entries that are not page images are
/// skipped with a log line; the ComicInfo.xml sidecar is carried to the
/// workspace root when requested.
fn extract_zip(
    request: &ExtractRequest,
    progress: &mut dyn ExtractProgress,
) -> Result<ExtractOutcome, FileError> {
    let file = std::fs::File::open(&request.input)
        .map_err(|e| extraction_error(request, format!("cannot open archive: {e}")))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| extraction_error(request, format!("not a readable zip archive: {e}")))?;

    let page_indices: Vec<usize> = (0..archive.len())
        .filter(|&i| {
            archive
                .name_for_index(i)
                .map(|n| page_format_of(n).is_some())
                .unwrap_or(false)
        })
        .collect();
    let total = page_indices.len();
    let mut extracted = 0usize;

    for i in 0..archive.len() {
        if progress.should_cancel() {
            return Ok(ExtractOutcome::Cancelled);
        }
        let mut entry = archive
            .by_index(i)
            .map_err(|e| extraction_error(request, format!("bad archive entry: {e}")))?;
        if entry.is_dir() {
            continue;
        }
        let Some(rel) = entry.enclosed_name() else {
            warn!("skipping archive entry with unsafe path: {}", entry.name());
            continue;
        };

        if is_comic_info(entry.name()) {
            if request.keep_comic_info {
                copy_entry(request, &mut entry, &request.dest.join("ComicInfo.xml"))?;
            }
            continue;
        }
        if page_format_of(entry.name()).is_none() {
            progress.on_log(&format!("skipping non-page entry {}", entry.name()));
            continue;
        }

        copy_entry(request, &mut entry, &request.dest.join(rel))?;
        extracted += 1;
        progress.on_page(extracted, total);
    }

    if extracted == 0 {
        return Err(extraction_error(
            request,
            "archive contains no page images".to_string(),
        ));
    }
    debug!("extracted {extracted} pages from {}", request.input.display());
    Ok(ExtractOutcome::Completed { pages: extracted })
}

fn copy_entry(
    request: &ExtractRequest,
    entry: &mut impl Read,
    dest: &Path,
) -> Result<(), FileError> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| write_error(request, format!("cannot create '{}': {e}", parent.display()), &e))?;
    }
    let mut out = std::fs::File::create(dest)
        .map_err(|e| write_error(request, format!("cannot create '{}': {e}", dest.display()), &e))?;
    std::io::copy(entry, &mut out)
        .map_err(|e| write_error(request, format!("cannot write '{}': {e}", dest.display()), &e))?;
    Ok(())
}

/// Pull the page images out of an EPUB.
///
/// EPUBs interleave images with markup and metadata; the reading order of the
/// images themselves follows their archive paths, so entries are sorted by
/// path and renamed positionally.
fn extract_epub(
    request: &ExtractRequest,
    progress: &mut dyn ExtractProgress,
) -> Result<ExtractOutcome, FileError> {
    let file = std::fs::File::open(&request.input)
        .map_err(|e| extraction_error(request, format!("cannot open epub: {e}")))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| extraction_error(request, format!("not a readable epub: {e}")))?;

    let mut image_entries: Vec<(String, PageFormat)> = archive
        .file_names()
        .filter_map(|n| page_format_of(n).map(|f| (n.to_string(), f)))
        .collect();
    image_entries.sort_by(|a, b| a.0.cmp(&b.0));
    let total = image_entries.len();
    if total == 0 {
        return Err(extraction_error(
            request,
            "epub contains no page images".to_string(),
        ));
    }

    for (page, (name, format)) in image_entries.into_iter().enumerate() {
        if progress.should_cancel() {
            return Ok(ExtractOutcome::Cancelled);
        }
        let mut entry = archive
            .by_name(&name)
            .map_err(|e| extraction_error(request, format!("bad epub entry '{name}': {e}")))?;
        let dest = request.dest.join(page_file_name(page + 1, format));
        copy_entry(request, &mut entry, &dest)?;
        progress.on_page(page + 1, total);
    }
    Ok(ExtractOutcome::Completed { pages: total })
}

/// Turn each PDF page into a page image.
///
/// Comic PDFs usually wrap one full-page raster image per page; pulling that
/// image out verbatim preserves the source resolution exactly, so the probe
/// path is preferred. Pages that are genuinely composited (text layers,
/// multiple images) fall back to rasterising at the configured DPI — or fail
/// the file, under [`EmbeddedResolution::RequireEmbedded`].
fn extract_pdf(
    request: &ExtractRequest,
    progress: &mut dyn ExtractProgress,
) -> Result<ExtractOutcome, FileError> {
    let bindings = Pdfium::bind_to_system_library()
        .map_err(|e| extraction_error(request, format!("pdfium library unavailable: {e}")))?;
    let pdfium = Pdfium::new(bindings);
    let document = pdfium
        .load_pdf_from_file(&request.input, request.password.as_deref())
        .map_err(|e| match e {
            PdfiumError::PdfiumLibraryInternalError(PdfiumInternalError::PasswordError) => {
                extraction_error(request, "pdf is password-protected".to_string())
            }
            other => extraction_error(request, format!("cannot open pdf: {other}")),
        })?;

    let total = document.pages().len() as usize;
    if total == 0 {
        return Err(extraction_error(request, "pdf has no pages".to_string()));
    }

    for (index, page) in document.pages().iter().enumerate() {
        if progress.should_cancel() {
            return Ok(ExtractOutcome::Cancelled);
        }
        let image = match request.embedded_resolution {
            EmbeddedResolution::FixedDpi => render_page(request, &page)?,
            EmbeddedResolution::PreferEmbedded => match embedded_page_image(&page) {
                Some(img) => img,
                None => {
                    progress.on_log(&format!(
                        "page {}: no single embedded image, rendering at {} dpi",
                        index + 1,
                        request.dpi
                    ));
                    render_page(request, &page)?
                }
            },
            EmbeddedResolution::RequireEmbedded => {
                embedded_page_image(&page).ok_or_else(|| {
                    extraction_error(
                        request,
                        format!(
                            "page {} has no single embedded image and fixed-dpi fallback is disabled",
                            index + 1
                        ),
                    )
                })?
            }
        };
        let dest = request.dest.join(page_file_name(index + 1, PageFormat::Png));
        save_page(request, &image, &dest)?;
        progress.on_page(index + 1, total);
    }
    Ok(ExtractOutcome::Completed { pages: total })
}

/// The page's single full-page raster image, if the page is built that way.
///
/// Returns `None` for pages with zero or multiple image objects (probing a
/// composited page would drop the other content) and for images pdfium
/// cannot hand back decoded.
fn embedded_page_image(page: &PdfPage<'_>) -> Option<DynamicImage> {
    let mut found = None;
    for object in page.objects().iter() {
        if let Some(image_object) = object.as_image_object() {
            if found.is_some() {
                return None;
            }
            found = Some(image_object.get_raw_image().ok()?);
        }
    }
    found
}

fn render_page(request: &ExtractRequest, page: &PdfPage<'_>) -> Result<DynamicImage, FileError> {
    let width_px = (page.width().value * request.dpi as f32 / 72.0).round().max(1.0) as i32;
    let height_px = (page.height().value * request.dpi as f32 / 72.0).round().max(1.0) as i32;
    let bitmap = page
        .render_with_config(&PdfRenderConfig::new().set_target_size(width_px, height_px))
        .map_err(|e| extraction_error(request, format!("page render failed: {e}")))?;
    Ok(bitmap.as_image())
}

fn save_page(request: &ExtractRequest, image: &DynamicImage, dest: &Path) -> Result<(), FileError> {
    image.save(dest).map_err(|e| match e {
        image::ImageError::IoError(io) => {
            let detail = format!("cannot write '{}': {io}", dest.display());
            write_error(request, detail, &io)
        }
        other => extraction_error(request, format!("cannot encode page: {other}")),
    })
}

/// Stage one loose image as a single-page workspace.
fn stage_single_image(request: &ExtractRequest) -> Result<ExtractOutcome, FileError> {
    let format = request
        .input
        .extension()
        .and_then(|e| e.to_str())
        .and_then(PageFormat::from_extension)
        .ok_or_else(|| {
            extraction_error(
                request,
                "unsupported page image format (expected jpeg, png, or webp)".to_string(),
            )
        })?;
    copy_image(request, &request.input, &request.dest.join(page_file_name(1, format)))?;
    Ok(ExtractOutcome::Completed { pages: 1 })
}

/// Stage a folder of loose images, renamed positionally.
///
/// Name order inside the folder is the reading order; the positional rename
/// pins that order down so later stages never re-derive it from arbitrary
/// user file names.
fn stage_image_folder(
    request: &ExtractRequest,
    progress: &mut dyn ExtractProgress,
) -> Result<ExtractOutcome, FileError> {
    let mut images = Vec::new();
    collect_folder_images(&request.input, &mut images)
        .map_err(|e| extraction_error(request, format!("cannot list folder: {e}")))?;
    images.sort();
    if images.is_empty() {
        return Err(extraction_error(
            request,
            "folder contains no page images".to_string(),
        ));
    }

    let total = images.len();
    for (page, src) in images.iter().enumerate() {
        if progress.should_cancel() {
            return Ok(ExtractOutcome::Cancelled);
        }
        // collect_folder_images only keeps recognised extensions.
        let format = page_format_of(&src.to_string_lossy())
            .ok_or_else(|| extraction_error(request, "unreadable page name".to_string()))?;
        copy_image(request, src, &request.dest.join(page_file_name(page + 1, format)))?;
        progress.on_page(page + 1, total);
    }

    if request.keep_comic_info {
        let sidecar = request.input.join("ComicInfo.xml");
        if sidecar.is_file() {
            copy_image(request, &sidecar, &request.dest.join("ComicInfo.xml"))?;
        }
    }
    Ok(ExtractOutcome::Completed { pages: total })
}

fn collect_folder_images(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_folder_images(&path, out)?;
        } else if page_format_of(&path.to_string_lossy()).is_some() {
            out.push(path);
        }
    }
    Ok(())
}

fn copy_image(request: &ExtractRequest, src: &Path, dest: &Path) -> Result<(), FileError> {
    std::fs::copy(src, dest)
        .map(|_| ())
        .map_err(|e| write_error(request, format!("cannot stage '{}': {e}", src.display()), &e))
}

fn page_format_of(name: &str) -> Option<PageFormat> {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .and_then(PageFormat::from_extension)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use zip::write::SimpleFileOptions;

    fn request(input: &Path, kind: ContainerKind, dest: &Path) -> ExtractRequest {
        ExtractRequest {
            input: input.to_path_buf(),
            kind,
            dest: dest.to_path_buf(),
            embedded_resolution: EmbeddedResolution::default(),
            dpi: 150,
            password: None,
            keep_comic_info: true,
        }
    }

    fn png_bytes() -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(4, 4, image::Rgba([1, 2, 3, 255]));
        let mut buf = std::io::Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn build_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, bytes) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(bytes).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn zip_extraction_keeps_entry_names_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let png = png_bytes();
        let cbz = dir.path().join("comic.cbz");
        build_zip(
            &cbz,
            &[
                ("ch1/p01.png", png.as_slice()),
                ("ch1/p02.png", png.as_slice()),
                ("ComicInfo.xml", b"<ComicInfo/>"),
                ("notes.txt", b"ignored"),
            ],
        );
        let dest = tempfile::tempdir().unwrap();
        let req = request(&cbz, ContainerKind::Zip, dest.path());
        let outcome = run_extract(&req, &mut NoExtractProgress).unwrap();
        assert_eq!(outcome, ExtractOutcome::Completed { pages: 2 });
        assert!(dest.path().join("ch1/p01.png").is_file());
        assert!(dest.path().join("ComicInfo.xml").is_file());
        assert!(!dest.path().join("notes.txt").exists());
    }

    #[test]
    fn zip_with_no_pages_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cbz = dir.path().join("empty.cbz");
        build_zip(&cbz, &[("readme.txt", b"x")]);
        let dest = tempfile::tempdir().unwrap();
        let req = request(&cbz, ContainerKind::Zip, dest.path());
        let err = run_extract(&req, &mut NoExtractProgress).unwrap_err();
        assert!(err.to_string().contains("no page images"), "got: {err}");
    }

    #[test]
    fn epub_images_renamed_in_path_order() {
        let dir = tempfile::tempdir().unwrap();
        let png = png_bytes();
        let epub = dir.path().join("book.epub");
        build_zip(
            &epub,
            &[
                ("mimetype", b"application/epub+zip"),
                ("OEBPS/img/b.png", png.as_slice()),
                ("OEBPS/img/a.png", png.as_slice()),
                ("OEBPS/ch1.xhtml", b"<html/>"),
            ],
        );
        let dest = tempfile::tempdir().unwrap();
        let req = request(&epub, ContainerKind::Epub, dest.path());
        let outcome = run_extract(&req, &mut NoExtractProgress).unwrap();
        assert_eq!(outcome, ExtractOutcome::Completed { pages: 2 });
        // a.png sorts first, so it becomes page one.
        assert!(dest.path().join("page_0001.png").is_file());
        assert!(dest.path().join("page_0002.png").is_file());
    }

    #[test]
    fn image_folder_staged_positionally() {
        let src = tempfile::tempdir().unwrap();
        let png = png_bytes();
        for name in ["z_last.png", "a_first.png"] {
            std::fs::write(src.path().join(name), &png).unwrap();
        }
        std::fs::write(src.path().join("ComicInfo.xml"), b"<ComicInfo/>").unwrap();
        let dest = tempfile::tempdir().unwrap();
        let req = request(src.path(), ContainerKind::ImageFolder, dest.path());
        let outcome = run_extract(&req, &mut NoExtractProgress).unwrap();
        assert_eq!(outcome, ExtractOutcome::Completed { pages: 2 });
        assert!(dest.path().join("page_0001.png").is_file());
        assert!(dest.path().join("ComicInfo.xml").is_file());
    }

    #[test]
    fn cancellation_between_pages_stops_early() {
        struct CancelAfterFirst {
            pages: usize,
        }
        impl ExtractProgress for CancelAfterFirst {
            fn on_page(&mut self, _c: usize, _t: usize) {
                self.pages += 1;
            }
            fn should_cancel(&self) -> bool {
                self.pages >= 1
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let png = png_bytes();
        let cbz = dir.path().join("comic.cbz");
        build_zip(
            &cbz,
            &[
                ("p01.png", png.as_slice()),
                ("p02.png", png.as_slice()),
                ("p03.png", png.as_slice()),
            ],
        );
        let dest = tempfile::tempdir().unwrap();
        let req = request(&cbz, ContainerKind::Zip, dest.path());
        let mut sink = CancelAfterFirst { pages: 0 };
        let outcome = run_extract(&req, &mut sink).unwrap();
        assert_eq!(outcome, ExtractOutcome::Cancelled);
        assert_eq!(sink.pages, 1);
    }

    #[test]
    fn single_image_becomes_page_one() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("cover.png");
        std::fs::write(&img, png_bytes()).unwrap();
        let dest = tempfile::tempdir().unwrap();
        let req = request(&img, ContainerKind::Image, dest.path());
        run_extract(&req, &mut NoExtractProgress).unwrap();
        assert!(dest.path().join("page_0001.png").is_file());
    }
}
