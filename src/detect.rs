//! Input-type detection by content sniffing.
//!
//! Container kinds are resolved from magic bytes, never from the extension
//! alone: renamed files are common in comic collections (`.cbz` holding a
//! RAR, `.zip` holding an EPUB). Extension is only consulted to break the
//! zip/epub tie cheaply before falling back to reading the archive's
//! `mimetype` entry.

use crate::error::FileError;
use std::io::Read;
use std::path::Path;

/// The supported input kinds, as resolved by sniffing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerKind {
    /// Zip archive of page images (`.cbz`, `.zip`).
    Zip,
    /// EPUB: a zip with an `application/epub+zip` mimetype entry.
    Epub,
    /// PDF document.
    Pdf,
    /// A single raster image.
    Image,
    /// A directory treated as one comic's worth of loose page images.
    ImageFolder,
}

impl ContainerKind {
    /// Whether this kind is already a set of loose images (no decoder run).
    pub fn is_plain_images(&self) -> bool {
        matches!(self, ContainerKind::Image | ContainerKind::ImageFolder)
    }
}

impl std::fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerKind::Zip => write!(f, "zip archive"),
            ContainerKind::Epub => write!(f, "epub"),
            ContainerKind::Pdf => write!(f, "pdf"),
            ContainerKind::Image => write!(f, "image"),
            ContainerKind::ImageFolder => write!(f, "image folder"),
        }
    }
}

/// Sniff a path into a [`ContainerKind`].
///
/// Directories resolve to [`ContainerKind::ImageFolder`]; the caller decides
/// whether that folder is one unit or should have been expanded beforehand.
pub fn detect_path(path: &Path) -> Result<ContainerKind, FileError> {
    if path.is_dir() {
        return Ok(ContainerKind::ImageFolder);
    }

    let mut magic = [0u8; 12];
    let read = std::fs::File::open(path)
        .and_then(|mut f| {
            let n = f.read(&mut magic)?;
            Ok(n)
        })
        .map_err(|e| FileError::UnsupportedInput {
            path: path.to_path_buf(),
            detail: format!("cannot read: {e}"),
        })?;
    let magic = &magic[..read];

    detect_magic(magic, path).ok_or_else(|| {
        let detail = if magic.starts_with(b"Rar!") {
            "RAR archives are not supported; repack as cbz/zip".to_string()
        } else if magic.starts_with(&[0x37, 0x7A, 0xBC, 0xAF]) {
            "7z archives are not supported; repack as cbz/zip".to_string()
        } else if magic.starts_with(b"GIF8") {
            "GIF images are not supported; convert to png, jpeg, or webp".to_string()
        } else if magic.starts_with(b"BM") {
            "BMP images are not supported; convert to png, jpeg, or webp".to_string()
        } else {
            "unrecognised file type".to_string()
        };
        FileError::UnsupportedInput {
            path: path.to_path_buf(),
            detail,
        }
    })
}

fn detect_magic(magic: &[u8], path: &Path) -> Option<ContainerKind> {
    if magic.starts_with(b"%PDF") {
        return Some(ContainerKind::Pdf);
    }
    if magic.starts_with(b"PK\x03\x04") || magic.starts_with(b"PK\x05\x06") {
        return Some(classify_zip(path));
    }
    if is_image_magic(magic) {
        return Some(ContainerKind::Image);
    }
    None
}

/// Recognise the raster formats the pipeline accepts as page images.
/// GIF and BMP sniff as images but are rejected by [`detect_path`] with a
/// named cause, since no stage can carry them.
pub fn is_image_magic(magic: &[u8]) -> bool {
    magic.starts_with(&[0x89, b'P', b'N', b'G'])
        || magic.starts_with(&[0xFF, 0xD8, 0xFF])
        || (magic.len() >= 12 && &magic[..4] == b"RIFF" && &magic[8..12] == b"WEBP")
}

/// Distinguish an EPUB from a plain comic zip.
///
/// The extension settles the common cases; otherwise the archive's
/// `mimetype` entry decides. Any zip that cannot be opened here is still
/// reported as [`ContainerKind::Zip`] — the extraction stage produces the
/// real per-file error with more context.
fn classify_zip(path: &Path) -> ContainerKind {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("cbz" | "zip") => return ContainerKind::Zip,
        Some("epub") => return ContainerKind::Epub,
        _ => {}
    }

    let Ok(file) = std::fs::File::open(path) else {
        return ContainerKind::Zip;
    };
    let Ok(mut archive) = zip::ZipArchive::new(file) else {
        return ContainerKind::Zip;
    };
    if let Ok(mut entry) = archive.by_name("mimetype") {
        let mut mime = String::new();
        if entry.read_to_string(&mut mime).is_ok() && mime.trim() == "application/epub+zip" {
            return ContainerKind::Epub;
        }
    }
    ContainerKind::Zip
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let p = dir.join(name);
        std::fs::File::create(&p).unwrap().write_all(bytes).unwrap();
        p
    }

    #[test]
    fn sniffs_by_content_not_extension() {
        let dir = tempfile::tempdir().unwrap();
        // A "cbz" that is actually a PDF must resolve as PDF.
        let p = write_file(dir.path(), "sneaky.cbz", b"%PDF-1.7\n");
        assert_eq!(detect_path(&p).unwrap(), ContainerKind::Pdf);

        let p = write_file(dir.path(), "page.bin", &[0x89, b'P', b'N', b'G', 0x0D, 0x0A]);
        assert_eq!(detect_path(&p).unwrap(), ContainerKind::Image);
    }

    #[test]
    fn rar_is_rejected_with_a_named_cause() {
        let dir = tempfile::tempdir().unwrap();
        let p = write_file(dir.path(), "old.cbr", b"Rar!\x1A\x07\x00");
        let err = detect_path(&p).unwrap_err();
        assert!(err.to_string().contains("RAR"), "got: {err}");
    }

    #[test]
    fn gif_and_bmp_are_rejected_with_named_causes() {
        let dir = tempfile::tempdir().unwrap();
        let p = write_file(dir.path(), "anim.gif", b"GIF89a\x00\x00");
        let err = detect_path(&p).unwrap_err();
        assert!(err.to_string().contains("GIF"), "got: {err}");

        let p = write_file(dir.path(), "scan.bmp", b"BM\x36\x00\x00\x00");
        let err = detect_path(&p).unwrap_err();
        assert!(err.to_string().contains("BMP"), "got: {err}");
    }

    #[test]
    fn directories_are_image_folders() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(detect_path(dir.path()).unwrap(), ContainerKind::ImageFolder);
    }

    #[test]
    fn epub_extension_classifies_zip_magic() {
        let dir = tempfile::tempdir().unwrap();
        let p = write_file(dir.path(), "book.epub", b"PK\x03\x04rest-is-ignored");
        assert_eq!(detect_path(&p).unwrap(), ContainerKind::Epub);
        let p = write_file(dir.path(), "comic.cbz", b"PK\x03\x04rest-is-ignored");
        assert_eq!(detect_path(&p).unwrap(), ContainerKind::Zip);
    }

    #[test]
    fn webp_magic_recognised() {
        assert!(is_image_magic(b"RIFF\x00\x00\x00\x00WEBPVP8 "));
        assert!(!is_image_magic(b"RIFF\x00\x00\x00\x00WAVEfmt "));
    }
}
