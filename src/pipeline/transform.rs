//! Per-page image transforms.
//!
//! The operation order is fixed and not configurable:
//! crop → resize → brightness/saturation → border extension → re-encode.
//! Crop and resize must see original pixel data, so they run before any
//! padding is added or any lossy recompression happens.
//!
//! The primitive here is blocking; callers run it on the blocking thread
//! pool ([`transform_image`]) or inside a transform worker process. Any
//! single page's failure is fatal to its file: a malformed page cannot be
//! silently dropped from a comic.

use crate::error::FileError;
use crate::options::{
    CropSpec, ExtendSpec, JobOptions, OutputFormat, PageFormat, ResizeMode,
};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Everything one page transform needs, precomputed once per file.
///
/// The plan is part of the worker wire protocol, so it is serde-serialisable
/// and carries no handles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformPlan {
    pub crop: Option<CropSpec>,
    pub resize: Option<ResizeMode>,
    pub brightness: i32,
    pub saturation: f32,
    pub extend: Option<ExtendSpec>,
    /// Explicit format request; `None` keeps the page's current format
    /// unless the target container cannot carry it.
    pub page_format: Option<PageFormat>,
    /// Target container, for format-compatibility downgrades.
    pub target: OutputFormat,
    pub jpeg_quality: u8,
}

impl TransformPlan {
    pub fn from_options(options: &JobOptions) -> Self {
        Self {
            crop: options.crop,
            resize: options.resize,
            brightness: options.brightness,
            saturation: options.saturation,
            extend: options.extend,
            page_format: options.page_format,
            target: options.output_format,
            jpeg_quality: options.jpeg_quality,
        }
    }

    fn wants_pixel_ops(&self) -> bool {
        self.resize.is_some()
            || self.crop.map(|c| !c.is_noop()).unwrap_or(false)
            || self.brightness != 0
            || (self.saturation - 1.0).abs() > f32::EPSILON
            || self.extend.map(|e| !e.is_noop()).unwrap_or(false)
    }

    /// The format the page must end up in, or `None` to keep `current`.
    ///
    /// A page only changes format when the user asked for one, or when the
    /// target container cannot carry the current encoding — PDF page streams
    /// take JPEG and PNG-style images but not WebP, so a WebP page headed
    /// into a PDF is silently downgraded to JPEG when the user left the
    /// format unset.
    pub fn required_format(&self, current: PageFormat) -> Option<PageFormat> {
        if let Some(requested) = self.page_format {
            return (requested != current).then_some(requested);
        }
        match (self.target, current) {
            (OutputFormat::Pdf, PageFormat::Webp) => Some(PageFormat::Jpeg),
            _ => None,
        }
    }

    /// Whether [`transform_image`] would touch this page at all.
    pub fn is_noop_for(&self, current: PageFormat) -> bool {
        !self.wants_pixel_ops() && self.required_format(current).is_none()
    }
}

/// Transform one page image in place, returning its (possibly renamed) path.
///
/// Blocking; callers wrap in `spawn_blocking` or run inside a worker.
pub fn transform_image(path: &Path, plan: &TransformPlan) -> Result<PathBuf, FileError> {
    let current = current_format(path)?;
    let encode_to = plan.required_format(current);

    if !plan.wants_pixel_ops() && encode_to.is_none() {
        return Ok(path.to_path_buf());
    }

    let mut img = image::open(path).map_err(|e| FileError::Transform {
        image: path.to_path_buf(),
        detail: format!("decode failed: {e}"),
    })?;

    if let Some(crop) = plan.crop.filter(|c| !c.is_noop()) {
        img = apply_crop(img, crop, path)?;
    }
    if let Some(resize) = plan.resize {
        img = apply_resize(img, resize);
    }
    if plan.brightness != 0 {
        img = img.brighten(plan.brightness);
    }
    if (plan.saturation - 1.0).abs() > f32::EPSILON {
        img = DynamicImage::ImageRgba8(apply_saturation(img.to_rgba8(), plan.saturation));
    }
    if let Some(extend) = plan.extend.filter(|e| !e.is_noop()) {
        img = apply_extend(img, extend);
    }

    let out_format = encode_to.unwrap_or(current);
    let out_path = path.with_extension(out_format.extension());
    encode(&img, &out_path, out_format, plan.jpeg_quality)?;
    if out_path != path {
        // The old encoding must not linger next to the new one, or packaging
        // would pick up both.
        std::fs::remove_file(path).map_err(|e| FileError::Transform {
            image: path.to_path_buf(),
            detail: format!("cannot remove superseded page: {e}"),
        })?;
    }
    debug!("transformed {} → {}", path.display(), out_path.display());
    Ok(out_path)
}

/// Probe a page's pixel dimensions without decoding the full image.
pub fn probe_dimensions(path: &Path) -> Result<(u32, u32), FileError> {
    image::image_dimensions(path).map_err(|e| FileError::Transform {
        image: path.to_path_buf(),
        detail: format!("cannot probe dimensions: {e}"),
    })
}

fn current_format(path: &Path) -> Result<PageFormat, FileError> {
    path.extension()
        .and_then(|e| e.to_str())
        .and_then(PageFormat::from_extension)
        .ok_or_else(|| FileError::Transform {
            image: path.to_path_buf(),
            detail: "unrecognised page image extension".to_string(),
        })
}

fn apply_crop(img: DynamicImage, crop: CropSpec, path: &Path) -> Result<DynamicImage, FileError> {
    let (w, h) = img.dimensions();
    if crop.left + crop.right >= w || crop.top + crop.bottom >= h {
        return Err(FileError::Transform {
            image: path.to_path_buf(),
            detail: format!(
                "crop margins ({},{},{},{}) consume the whole {w}x{h} page",
                crop.left, crop.top, crop.right, crop.bottom
            ),
        });
    }
    Ok(img.crop_imm(
        crop.left,
        crop.top,
        w - crop.left - crop.right,
        h - crop.top - crop.bottom,
    ))
}

fn apply_resize(img: DynamicImage, mode: ResizeMode) -> DynamicImage {
    let (w, h) = img.dimensions();
    let (tw, th) = match mode {
        // `resize` preserves aspect ratio against a bounding box, so pin the
        // free axis wide open.
        ResizeMode::FitHeight(target) => (u32::MAX, target),
        ResizeMode::FitWidth(target) => (target, u32::MAX),
        ResizeMode::Percent(p) => (
            (w as u64 * p as u64 / 100).max(1) as u32,
            (h as u64 * p as u64 / 100).max(1) as u32,
        ),
    };
    match mode {
        ResizeMode::Percent(_) => img.resize_exact(tw, th, FilterType::Lanczos3),
        _ => img.resize(tw, th, FilterType::Lanczos3),
    }
}

/// Scale chroma around per-pixel luma: 0.0 = grayscale, 1.0 = unchanged.
fn apply_saturation(mut img: RgbaImage, factor: f32) -> RgbaImage {
    for px in img.pixels_mut() {
        let [r, g, b, a] = px.0;
        let gray = 0.2126 * r as f32 + 0.7152 * g as f32 + 0.0722 * b as f32;
        let sat = |c: u8| -> u8 { (gray + (c as f32 - gray) * factor).clamp(0.0, 255.0) as u8 };
        *px = Rgba([sat(r), sat(g), sat(b), a]);
    }
    img
}

fn apply_extend(img: DynamicImage, extend: ExtendSpec) -> DynamicImage {
    let (w, h) = img.dimensions();
    let [r, g, b] = extend.color;
    let mut canvas = RgbaImage::from_pixel(
        w + extend.left + extend.right,
        h + extend.top + extend.bottom,
        Rgba([r, g, b, 255]),
    );
    image::imageops::overlay(
        &mut canvas,
        &img.to_rgba8(),
        extend.left as i64,
        extend.top as i64,
    );
    DynamicImage::ImageRgba8(canvas)
}

fn encode(
    img: &DynamicImage,
    out: &Path,
    format: PageFormat,
    jpeg_quality: u8,
) -> Result<(), FileError> {
    let map_err = |e: String| FileError::Transform {
        image: out.to_path_buf(),
        detail: format!("encode failed: {e}"),
    };
    let file = std::fs::File::create(out).map_err(|e| map_err(e.to_string()))?;
    let mut writer = BufWriter::new(file);
    match format {
        PageFormat::Jpeg => {
            // JPEG has no alpha channel.
            let encoder =
                image::codecs::jpeg::JpegEncoder::new_with_quality(&mut writer, jpeg_quality);
            img.to_rgb8()
                .write_with_encoder(encoder)
                .map_err(|e| map_err(e.to_string()))?;
        }
        PageFormat::Png => {
            img.write_with_encoder(image::codecs::png::PngEncoder::new(&mut writer))
                .map_err(|e| map_err(e.to_string()))?;
        }
        PageFormat::Webp => {
            img.to_rgba8()
                .write_with_encoder(image::codecs::webp::WebPEncoder::new_lossless(&mut writer))
                .map_err(|e| map_err(e.to_string()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{JobMode, JobOptions};

    fn plan() -> TransformPlan {
        TransformPlan::from_options(
            &JobOptions::builder(JobMode::Convert, "/tmp").build().unwrap(),
        )
    }

    fn write_png(dir: &Path, name: &str, w: u32, h: u32) -> PathBuf {
        let p = dir.join(name);
        let img = RgbaImage::from_pixel(w, h, Rgba([200, 60, 60, 255]));
        img.save(&p).unwrap();
        p
    }

    #[test]
    fn noop_plan_leaves_page_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let p = write_png(dir.path(), "p001.png", 20, 30);
        let before = std::fs::metadata(&p).unwrap().modified().unwrap();
        let out = transform_image(&p, &plan()).unwrap();
        assert_eq!(out, p);
        assert_eq!(std::fs::metadata(&p).unwrap().modified().unwrap(), before);
    }

    #[test]
    fn crop_runs_before_resize() {
        // 100x100, trim 10 from each side → 80x80, then fit-height 40 → 40x40.
        let dir = tempfile::tempdir().unwrap();
        let p = write_png(dir.path(), "p001.png", 100, 100);
        let mut plan = plan();
        plan.crop = Some(CropSpec {
            left: 10,
            top: 10,
            right: 10,
            bottom: 10,
        });
        plan.resize = Some(ResizeMode::FitHeight(40));
        let out = transform_image(&p, &plan).unwrap();
        assert_eq!(probe_dimensions(&out).unwrap(), (40, 40));
    }

    #[test]
    fn percent_resize_scales_both_axes() {
        let dir = tempfile::tempdir().unwrap();
        let p = write_png(dir.path(), "p001.png", 200, 100);
        let mut plan = plan();
        plan.resize = Some(ResizeMode::Percent(50));
        let out = transform_image(&p, &plan).unwrap();
        assert_eq!(probe_dimensions(&out).unwrap(), (100, 50));
    }

    #[test]
    fn extend_pads_after_resize() {
        let dir = tempfile::tempdir().unwrap();
        let p = write_png(dir.path(), "p001.png", 100, 100);
        let mut plan = plan();
        plan.resize = Some(ResizeMode::FitWidth(50));
        plan.extend = Some(ExtendSpec {
            left: 5,
            top: 0,
            right: 5,
            bottom: 10,
            color: [0, 0, 0],
        });
        let out = transform_image(&p, &plan).unwrap();
        assert_eq!(probe_dimensions(&out).unwrap(), (60, 60));
    }

    #[test]
    fn format_change_renames_and_removes_original() {
        let dir = tempfile::tempdir().unwrap();
        let p = write_png(dir.path(), "p001.png", 10, 10);
        let mut plan = plan();
        plan.page_format = Some(PageFormat::Jpeg);
        let out = transform_image(&p, &plan).unwrap();
        assert_eq!(out.extension().unwrap(), "jpg");
        assert!(!p.exists());
        assert!(out.exists());
    }

    #[test]
    fn webp_into_pdf_downgrades_to_jpeg_when_format_unset() {
        let p = plan();
        let mut p = p;
        p.target = OutputFormat::Pdf;
        assert_eq!(p.required_format(PageFormat::Webp), Some(PageFormat::Jpeg));
        assert_eq!(p.required_format(PageFormat::Png), None);

        p.target = OutputFormat::Cbz;
        assert_eq!(p.required_format(PageFormat::Webp), None);
    }

    #[test]
    fn zero_saturation_produces_grayscale() {
        let img = RgbaImage::from_pixel(2, 2, Rgba([200, 60, 60, 255]));
        let out = apply_saturation(img, 0.0);
        let px = out.get_pixel(0, 0);
        assert_eq!(px.0[0], px.0[1]);
        assert_eq!(px.0[1], px.0[2]);
    }

    #[test]
    fn impossible_crop_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let p = write_png(dir.path(), "p001.png", 20, 20);
        let mut plan = plan();
        plan.crop = Some(CropSpec {
            left: 10,
            top: 0,
            right: 10,
            bottom: 0,
        });
        let err = transform_image(&p, &plan).unwrap_err();
        assert!(matches!(err, FileError::Transform { .. }));
    }
}
