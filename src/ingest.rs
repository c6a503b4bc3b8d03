//! Image-aware parse of a stored document.
//!
//! Runs the remote orchestrator, the figure engine and canonicalisation,
//! then commits the result all-or-nothing:
//!
//! 1. figure files are copied into a staging directory
//! 2. the staging directory is swapped in for `<figures>/<owner>/<document>`
//! 3. markdown, parse mode and the figure set are written in one store call
//!
//! If step 3 fails the previous figure directory is restored, so a failed
//! re-parse leaves the earlier figures exactly as they were.

use crate::error::PapersError;
use crate::model::{Document, Figure, ParseMode};
use crate::pipeline::bundle::ParsedDocument;
use crate::pipeline::canonical::{canonicalize, CanonicalFigure};
use crate::pipeline::figures::extract_figures;
use crate::pipeline::normalize::normalize_markdown;
use crate::pipeline::remote::RemoteParser;
use crate::progress::ParseProgressCallback;
use crate::store::Store;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

/// Response of a successful image-aware parse.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub document_id: Uuid,
    pub parse_mode: ParseMode,
    pub markdown_length: usize,
    pub figure_count: usize,
    pub figures: Vec<Figure>,
}

/// Normalised markdown plus canonical figures of one parse result.
#[derive(Debug, Clone)]
pub struct ExtractedFigures {
    pub markdown: String,
    pub figures: Vec<CanonicalFigure>,
}

/// Run the figure engine over an unpacked bundle.
pub fn build_figures(parsed: &ParsedDocument, stem: &str) -> ExtractedFigures {
    let markdown = normalize_markdown(&parsed.markdown);
    let candidates = extract_figures(&markdown, &parsed.images, parsed.content_list.as_deref());
    let figures = canonicalize(&candidates, stem);
    ExtractedFigures { markdown, figures }
}

/// File-system safe stem for figure names, derived from the upload name.
pub fn file_stem(file_name: &str) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let clean = safe_segment(&stem);
    if clean.is_empty() {
        "figure".to_string()
    } else {
        clean
    }
}

fn safe_segment(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_matches('_')
        .to_string()
}

/// Per-user partition below `root`.
pub fn user_dir(root: &Path, owner_id: &str) -> PathBuf {
    root.join(safe_segment(owner_id))
}

/// Directory holding a document's figure files.
pub fn figure_dir(figures_root: &Path, owner_id: &str, document_id: Uuid) -> PathBuf {
    user_dir(figures_root, owner_id).join(document_id.to_string())
}

/// Copy each figure's source image into `dir` under its canonical file name.
///
/// Returns the stored sizes in order; a figure whose source is missing gets
/// no file and size 0.
pub async fn write_figure_files(
    figures: &[CanonicalFigure],
    dir: &Path,
) -> Result<Vec<u64>, PapersError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| PapersError::io(dir, e))?;

    let mut sizes = Vec::with_capacity(figures.len());
    for figure in figures {
        let target = dir.join(&figure.file_name);
        let size = match &figure.source_path {
            Some(source) if tokio::fs::try_exists(source).await.unwrap_or(false) => {
                tokio::fs::copy(source, &target)
                    .await
                    .map_err(|e| PapersError::io(source, e))?
            }
            _ => {
                warn!("{} has no image file; stored as placeholder", figure.label);
                0
            }
        };
        sizes.push(size);
    }
    Ok(sizes)
}

/// Parse `document` remotely and replace its figures.
pub async fn parse_images(
    parser: &RemoteParser,
    store: &dyn Store,
    figures_root: &Path,
    document: &Document,
    progress: &dyn ParseProgressCallback,
) -> Result<IngestReport, PapersError> {
    info!(document = %document.id, "Starting image-aware parse");

    let parsed = parser.parse_document(&document.storage_path, progress).await?;
    let extracted = build_figures(&parsed, &file_stem(&document.file_name));

    let owner_dir = user_dir(figures_root, &document.owner_id);
    let final_dir = figure_dir(figures_root, &document.owner_id, document.id);
    let staging = owner_dir.join(format!(".staging-{}", Uuid::new_v4().simple()));

    let sizes = match write_figure_files(&extracted.figures, &staging).await {
        Ok(sizes) => sizes,
        Err(e) => {
            remove_dir_quietly(&staging).await;
            return Err(e);
        }
    };
    // Bundle files are no longer needed once copied.
    drop(parsed);

    let figures: Vec<Figure> = extracted
        .figures
        .iter()
        .zip(sizes)
        .map(|(f, file_size)| Figure {
            id: Uuid::new_v4(),
            document_id: document.id,
            label: f.label.clone(),
            caption: f.caption.clone(),
            page_number: f.page_number,
            image_index: f.image_index,
            file_name: f.file_name.clone(),
            file_path: final_dir.join(&f.file_name),
            file_size,
        })
        .collect();

    let backup = swap_in(&staging, &final_dir).await?;

    let markdown_length = extracted.markdown.chars().count();
    let updated = match store
        .apply_image_parse(document.id, extracted.markdown, figures.clone())
        .await
    {
        Ok(doc) => doc,
        Err(e) => {
            warn!(document = %document.id, "Store update failed, restoring previous figures");
            remove_dir_quietly(&final_dir).await;
            if let Some(backup) = &backup {
                if let Err(restore) = tokio::fs::rename(backup, &final_dir).await {
                    warn!("Could not restore {}: {}", final_dir.display(), restore);
                }
            }
            return Err(e);
        }
    };
    if let Some(backup) = backup {
        remove_dir_quietly(&backup).await;
    }

    progress.on_parse_complete(figures.len());
    info!(
        document = %document.id,
        figures = figures.len(),
        markdown_length,
        "Image-aware parse committed"
    );

    Ok(IngestReport {
        document_id: updated.id,
        parse_mode: updated.parse_mode,
        markdown_length,
        figure_count: figures.len(),
        figures,
    })
}

/// Move `staging` to `target`, returning where the old `target` went.
async fn swap_in(staging: &Path, target: &Path) -> Result<Option<PathBuf>, PapersError> {
    let backup = if tokio::fs::try_exists(target).await.unwrap_or(false) {
        let name = format!(".old-{}", Uuid::new_v4().simple());
        let backup = target.with_file_name(name);
        tokio::fs::rename(target, &backup)
            .await
            .map_err(|e| PapersError::io(target, e))?;
        Some(backup)
    } else {
        None
    };

    if let Err(e) = tokio::fs::rename(staging, target).await {
        if let Some(backup) = &backup {
            let _ = tokio::fs::rename(backup, target).await;
        }
        remove_dir_quietly(staging).await;
        return Err(PapersError::io(target, e));
    }
    Ok(backup)
}

async fn remove_dir_quietly(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Could not remove {}: {}", dir.display(), e);
        }
    }
}
