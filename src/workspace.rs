//! Ephemeral scratch directories for in-flight files.
//!
//! Every file's pipeline pass owns exactly one [`Workspace`]: extraction
//! target, then transform target, then packaging source. Cleanup must happen
//! on success, error, and cancellation alike, so the workspace rides on
//! [`tempfile::TempDir`] — dropping it removes the tree even on a panic.
//! `close()` exists for the paths where we want deletion errors surfaced
//! instead of swallowed.
//!
//! Only CREATE mode ever holds two live workspaces at once: the job-level
//! aggregate plus one per-input staging dir.

use crate::error::ComicError;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Creates workspaces under one parent directory.
///
/// The parent defaults to the system temp dir; tests pin it to an owned
/// directory so leftover-workspace assertions are possible.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: Option<PathBuf>,
}

impl WorkspaceManager {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }

    /// Create a fresh scratch directory.
    ///
    /// Failure here is job-fatal: if no workspace can be staged, continuing
    /// the batch would process nothing.
    pub fn create(&self) -> Result<Workspace, ComicError> {
        let builder_result = match &self.root {
            Some(root) => {
                std::fs::create_dir_all(root).map_err(|e| ComicError::WorkspaceUnavailable {
                    path: root.clone(),
                    source: e,
                })?;
                TempDir::with_prefix_in("comicmill-", root)
            }
            None => TempDir::with_prefix("comicmill-"),
        };
        let dir = builder_result.map_err(|e| ComicError::WorkspaceUnavailable {
            path: self
                .root
                .clone()
                .unwrap_or_else(std::env::temp_dir),
            source: e,
        })?;
        Ok(Workspace { dir })
    }
}

/// One scratch directory, deleted on drop or explicit [`Workspace::close`].
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// All page images in the workspace, recursively, in path order.
    ///
    /// Path order is the page order contract: extraction writes positional
    /// names, so lexicographic traversal yields reading order.
    pub fn page_images(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut images = Vec::new();
        collect_images(self.dir.path(), &mut images)?;
        images.sort();
        Ok(images)
    }

    /// The ComicInfo.xml sidecar, if extraction produced one.
    pub fn comic_info(&self) -> Option<PathBuf> {
        let p = self.dir.path().join("ComicInfo.xml");
        p.is_file().then_some(p)
    }

    /// Delete the directory now, surfacing I/O errors.
    pub fn close(self) -> std::io::Result<()> {
        self.dir.close()
    }
}

fn collect_images(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_images(&path, out)?;
        } else if path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| crate::options::PageFormat::from_extension(e).is_some())
            .unwrap_or(false)
        {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_removed_on_drop() {
        let parent = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(Some(parent.path().to_path_buf()));
        let ws_path = {
            let ws = manager.create().unwrap();
            assert!(ws.path().exists());
            ws.path().to_path_buf()
        };
        assert!(!ws_path.exists());
    }

    #[test]
    fn page_images_sorted_and_recursive() {
        let manager = WorkspaceManager::new(None);
        let ws = manager.create().unwrap();
        std::fs::create_dir(ws.path().join("ch2")).unwrap();
        for name in ["ch2/p002.png", "p001.jpg", "notes.txt"] {
            std::fs::write(ws.path().join(name), b"x").unwrap();
        }
        let images = ws.page_images().unwrap();
        assert_eq!(images.len(), 2);
        assert!(images[0].ends_with("ch2/p002.png"));
        assert!(images[1].ends_with("p001.jpg"));
        ws.close().unwrap();
    }

    #[test]
    fn comic_info_found_only_at_root() {
        let manager = WorkspaceManager::new(None);
        let ws = manager.create().unwrap();
        assert!(ws.comic_info().is_none());
        std::fs::write(ws.path().join("ComicInfo.xml"), b"<ComicInfo/>").unwrap();
        assert!(ws.comic_info().is_some());
    }
}
