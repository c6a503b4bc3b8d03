//! Result bundles: unpack the parser's ZIP and find what the figure engine needs.
//!
//! The archive layout is not fixed, so files are located by a recursive walk:
//!
//! - **markdown**: the first `.md` file whose name does not contain `_middle`
//! - **images**: the first directory named `images`
//! - **content list**: a `*_content_list.json`, else any other `.json` that
//!   parses as a list of items
//!
//! Each piece is optional; a missing one degrades to an empty default.
//! Unpacking is CPU/disk bound and runs on the blocking pool.

use super::figures::ContentItem;
use super::inventory::{scan_images_dir, ImageFile};
use crate::error::PapersError;
use bytes::Bytes;
use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};
use zip::ZipArchive;

/// Refuse single entries larger than this when unpacking.
const MAX_ENTRY_BYTES: u64 = 512 * 1024 * 1024;

/// Where the interesting files of an unpacked bundle live.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleLayout {
    pub markdown: Option<PathBuf>,
    pub images_dir: Option<PathBuf>,
    pub content_list: Option<PathBuf>,
}

/// Everything the figure engine consumes, plus the directory backing it.
///
/// Image paths point into `_workdir`, which is deleted when this value is
/// dropped, so copy figure files before letting it go.
#[derive(Debug)]
pub struct ParsedDocument {
    pub markdown: String,
    pub content_list: Option<Vec<ContentItem>>,
    pub images: Vec<ImageFile>,
    _workdir: TempDir,
}

impl ParsedDocument {
    pub fn workdir(&self) -> &Path {
        self._workdir.path()
    }
}

/// Unpack `archive` into a fresh temp dir and load its contents.
pub async fn open_bundle(archive: Bytes) -> Result<ParsedDocument, PapersError> {
    tokio::task::spawn_blocking(move || open_bundle_blocking(&archive))
        .await
        .map_err(|e| PapersError::Internal(format!("Bundle task panicked: {e}")))?
}

fn open_bundle_blocking(archive: &[u8]) -> Result<ParsedDocument, PapersError> {
    let workdir = TempDir::new().map_err(|e| PapersError::Internal(format!("tempdir: {e}")))?;
    let count = unpack_zip(archive, workdir.path())?;
    info!("Unpacked {} files from result bundle", count);

    let layout = locate(workdir.path());
    debug!("Bundle layout: {:?}", layout);

    let markdown = match &layout.markdown {
        Some(path) => std::fs::read_to_string(path).map_err(|e| PapersError::io(path, e))?,
        None => {
            warn!("Result bundle has no markdown file");
            String::new()
        }
    };

    let content_list = layout.content_list.as_deref().and_then(read_content_list);

    let images = match &layout.images_dir {
        Some(dir) => scan_images_dir(dir)?,
        None => {
            warn!("Result bundle has no images directory");
            Vec::new()
        }
    };

    Ok(ParsedDocument {
        markdown,
        content_list,
        images,
        _workdir: workdir,
    })
}

/// Extract every file of a ZIP archive below `dest`. Returns the file count.
///
/// Entry names are reduced to their normal components so nothing escapes
/// `dest` (`../` and absolute paths are dropped).
pub fn unpack_zip(archive: &[u8], dest: &Path) -> Result<usize, PapersError> {
    unpack_zip_limited(archive, dest, MAX_ENTRY_BYTES)
}

/// [`unpack_zip`] with an explicit per-entry cap. The cap applies both to
/// the size the entry header declares and to the bytes actually read.
fn unpack_zip_limited(archive: &[u8], dest: &Path, max_entry: u64) -> Result<usize, PapersError> {
    let mut zip = ZipArchive::new(Cursor::new(archive))
        .map_err(|e| PapersError::InvalidBundle(e.to_string()))?;

    let mut written = 0usize;
    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| PapersError::InvalidBundle(e.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        let Some(relative) = sanitize_entry_name(entry.name()) else {
            warn!("Skipping unsafe bundle entry '{}'", entry.name());
            continue;
        };
        if entry.size() > max_entry {
            warn!("Skipping oversized bundle entry '{}' ({} bytes)", entry.name(), entry.size());
            continue;
        }

        let target = dest.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PapersError::io(parent, e))?;
        }
        let name = entry.name().to_string();
        let mut buf = Vec::new();
        entry
            .by_ref()
            .take(max_entry + 1)
            .read_to_end(&mut buf)
            .map_err(|e| PapersError::InvalidBundle(format!("{name}: {e}")))?;
        if buf.len() as u64 > max_entry {
            warn!("Skipping bundle entry '{}': larger than its header claims", name);
            continue;
        }
        std::fs::write(&target, &buf).map_err(|e| PapersError::io(&target, e))?;
        written += 1;
    }
    Ok(written)
}

fn sanitize_entry_name(name: &str) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in Path::new(name).components() {
        if let Component::Normal(part) = component {
            clean.push(part);
        }
    }
    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}

/// Walk `root` and pick the markdown file, images dir and content list.
pub fn locate(root: &Path) -> BundleLayout {
    let mut files = Vec::new();
    let mut dirs = Vec::new();
    walk(root, &mut files, &mut dirs);
    files.sort();
    dirs.sort();

    let name_of = |p: &Path| {
        p.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    };

    let markdown = files
        .iter()
        .find(|p| {
            let name = name_of(p);
            name.to_ascii_lowercase().ends_with(".md") && !name.contains("_middle")
        })
        .cloned();

    let images_dir = dirs.iter().find(|d| name_of(d) == "images").cloned();

    let json_files: Vec<&PathBuf> = files
        .iter()
        .filter(|p| name_of(p).to_ascii_lowercase().ends_with(".json"))
        .collect();
    let content_list = json_files
        .iter()
        .find(|p| name_of(p).ends_with("_content_list.json"))
        .or_else(|| {
            json_files
                .iter()
                .find(|p| read_content_list(p).is_some())
        })
        .map(|p| (*p).clone());

    BundleLayout {
        markdown,
        images_dir,
        content_list,
    }
}

fn walk(dir: &Path, files: &mut Vec<PathBuf>, dirs: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            dirs.push(path.clone());
            walk(&path, files, dirs);
        } else {
            files.push(path);
        }
    }
}

fn read_content_list(path: &Path) -> Option<Vec<ContentItem>> {
    let text = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str::<Vec<ContentItem>>(&text) {
        Ok(items) => Some(items),
        Err(e) => {
            debug!("{} is not a content list: {}", path.display(), e);
            None
        }
    }
}
