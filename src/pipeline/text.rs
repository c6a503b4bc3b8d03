//! Local text extraction for freshly uploaded PDFs (`text_only` mode).
//!
//! pdfium is blocking and keeps thread-local state, so every call runs on
//! the blocking pool via `spawn_blocking`.
//!
//! The library is bound from `PDFIUM_LIB_PATH` when set, otherwise from the
//! system library search path.

use crate::error::PapersError;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Text and page count of one PDF.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedText {
    pub text: String,
    pub page_count: usize,
}

/// Reject anything that does not start with the `%PDF` magic.
pub fn check_pdf_magic(bytes: &[u8]) -> Result<(), PapersError> {
    if bytes.len() >= 4 && &bytes[..4] == b"%PDF" {
        return Ok(());
    }
    let mut magic = [0u8; 4];
    let n = bytes.len().min(4);
    magic[..n].copy_from_slice(&bytes[..n]);
    Err(PapersError::NotAPdf { magic })
}

/// Extract all page text from `path`, pages separated by a blank line.
pub async fn extract_text(path: &Path) -> Result<ExtractedText, PapersError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || extract_text_blocking(&path))
        .await
        .map_err(|e| PapersError::Internal(format!("Text extraction task panicked: {e}")))?
}

fn bind_pdfium() -> Result<Pdfium, PapersError> {
    if let Ok(lib) = std::env::var("PDFIUM_LIB_PATH") {
        let lib = PathBuf::from(lib);
        match Pdfium::bind_to_library(&lib) {
            Ok(bindings) => return Ok(Pdfium::new(bindings)),
            Err(e) => warn!(
                "PDFIUM_LIB_PATH '{}' could not be loaded ({:?}); trying system library",
                lib.display(),
                e
            ),
        }
    }
    Pdfium::bind_to_system_library()
        .map(Pdfium::new)
        .map_err(|e| PapersError::Internal(format!("pdfium library not available: {e:?}")))
}

fn extract_text_blocking(path: &Path) -> Result<ExtractedText, PapersError> {
    let pdfium = bind_pdfium()?;
    let document = pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| PapersError::CorruptPdf {
            path: path.to_path_buf(),
            detail: format!("{e:?}"),
        })?;

    let pages = document.pages();
    let page_count = pages.len() as usize;
    let mut parts = Vec::with_capacity(page_count);
    for (i, page) in pages.iter().enumerate() {
        match page.text() {
            Ok(text) => parts.push(text.all().trim().to_string()),
            Err(e) => {
                debug!("Page {} of {} has no text layer: {:?}", i + 1, path.display(), e);
                parts.push(String::new());
            }
        }
    }

    let text = parts
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");
    info!(
        "Extracted {} chars from {} page(s) of {}",
        text.len(),
        page_count,
        path.display()
    );
    Ok(ExtractedText { text, page_count })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_pdf_magic() {
        assert!(check_pdf_magic(b"%PDF-1.7\n...").is_ok());
    }

    #[test]
    fn rejects_other_files() {
        match check_pdf_magic(b"PK\x03\x04rest") {
            Err(PapersError::NotAPdf { magic }) => assert_eq!(&magic, b"PK\x03\x04"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(check_pdf_magic(b"%P"), Err(PapersError::NotAPdf { .. })));
        assert!(matches!(check_pdf_magic(b""), Err(PapersError::NotAPdf { .. })));
    }
}
