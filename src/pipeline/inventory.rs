//! Image inventory: the image files a parse produced, with page/index hints.
//!
//! Figure files follow the `…_<page>_<index>.<ext>` naming convention. When a
//! file name carries that suffix the page and index are recovered from it;
//! hashed names from the remote parser simply have neither.

use crate::error::PapersError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::debug;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp", "tif", "tiff"];

static RE_PAGE_INDEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"_(\d+)_(\d+)\.[A-Za-z0-9]+$").unwrap());

/// One image file available to the figure engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFile {
    pub file_name: String,
    pub path: PathBuf,
    pub page: Option<u32>,
    pub index: Option<u32>,
    pub size: u64,
}

impl ImageFile {
    /// Build an entry for `path`, reading its size from disk (0 if absent).
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (page, index) = match parse_page_index(&file_name) {
            Some((p, i)) => (Some(p), Some(i)),
            None => (None, None),
        };
        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Self {
            file_name,
            path,
            page,
            index,
            size,
        }
    }
}

/// Recover `(page, index)` from a `…_<page>_<index>.<ext>` file name.
pub fn parse_page_index(file_name: &str) -> Option<(u32, u32)> {
    let caps = RE_PAGE_INDEX.captures(file_name)?;
    let page = caps[1].parse().ok()?;
    let index = caps[2].parse().ok()?;
    Some((page, index))
}

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// List the image files directly inside `dir`, sorted by file name.
pub fn scan_images_dir(dir: &Path) -> Result<Vec<ImageFile>, PapersError> {
    let entries = std::fs::read_dir(dir).map_err(|e| PapersError::io(dir, e))?;
    let mut images = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| PapersError::io(dir, e))?;
        let path = entry.path();
        if path.is_file() && is_image_file(&path) {
            images.push(ImageFile::from_path(path));
        }
    }
    images.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    debug!("Found {} images in {}", images.len(), dir.display());
    Ok(images)
}
