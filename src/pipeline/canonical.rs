//! Canonical figure labels.
//!
//! Candidates arrive in markdown order and are renumbered `F1..FN`. The
//! provisional label survives only as a caption fallback, and only when it
//! was read from the document; a sequential `Figure <n>` fallback never
//! becomes a caption, the canonical label does.
//!
//! Lookup by label ([`match_label`]) accepts the canonical form, a bare
//! number, caption text and the legacy `Figure <n>` form.

use super::figures::{find_label, LabelSource, RawFigureCandidate};
use crate::model::Figure;
use std::path::PathBuf;

/// A renumbered figure, ready to be written to disk.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalFigure {
    pub label: String,
    pub image_index: u32,
    pub caption: String,
    /// 1-based page, 0 when unknown.
    pub page_number: u32,
    pub source_path: Option<PathBuf>,
    /// Stored file name following `…_<page>_<index>.<ext>`.
    pub file_name: String,
}

pub fn canonical_label(index: u32) -> String {
    format!("F{index}")
}

/// Persisted figure file name: `<stem>_<page>_<index>.<ext>`.
pub fn figure_file_name(stem: &str, page: u32, index: u32, extension: &str) -> String {
    format!("{stem}_{page}_{index}.{extension}")
}

fn extension_of(name: &str) -> String {
    std::path::Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_else(|| "png".to_string())
}

/// Assign `F1..FN` in the given order.
pub fn canonicalize(candidates: &[RawFigureCandidate], stem: &str) -> Vec<CanonicalFigure> {
    candidates
        .iter()
        .zip(1u32..)
        .map(|(candidate, index)| {
            let label = canonical_label(index);
            let caption = if !candidate.caption.trim().is_empty() {
                candidate.caption.trim().to_string()
            } else if candidate.label_source != LabelSource::Sequential {
                candidate.label.clone()
            } else {
                label.clone()
            };
            let page_number = candidate.page.unwrap_or(0);
            CanonicalFigure {
                file_name: figure_file_name(
                    stem,
                    page_number,
                    index,
                    &extension_of(&candidate.file_name),
                ),
                label,
                image_index: index,
                caption,
                page_number,
                source_path: candidate.image_path.clone(),
            }
        })
        .collect()
}

/// Parse a canonical label query (`F3`, `f3`, `3`) into its index.
fn canonical_index(query: &str) -> Option<u32> {
    let q = query.trim();
    let digits = q
        .strip_prefix('F')
        .or_else(|| q.strip_prefix('f'))
        .unwrap_or(q);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Find the figure a label query refers to.
///
/// Order: canonical label (with `F` prepended when missing), caption
/// substring, then the legacy `Figure <n>` form mapped onto `F<n>`.
pub fn match_label<'a>(figures: &'a [Figure], query: &str) -> Option<&'a Figure> {
    let q = query.trim();
    if q.is_empty() {
        return None;
    }

    if let Some(index) = canonical_index(q) {
        let wanted = canonical_label(index);
        if let Some(f) = figures.iter().find(|f| f.label.eq_ignore_ascii_case(&wanted)) {
            return Some(f);
        }
    }

    let needle = q.to_lowercase();
    if let Some(f) = figures
        .iter()
        .find(|f| f.caption.to_lowercase().contains(&needle))
    {
        return Some(f);
    }

    let legacy = find_label(q)?;
    let index: u32 = legacy
        .trim_start_matches("Figure ")
        .trim_end_matches(|c: char| c.is_ascii_alphabetic())
        .parse()
        .ok()?;
    let wanted = canonical_label(index);
    figures.iter().find(|f| f.label == wanted)
}
