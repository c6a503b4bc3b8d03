//! Figure image → base64 PNG data URL for multimodal chat requests.
//!
//! Images larger than `max_pixels` on the long edge are downscaled first so
//! a single poster-sized figure cannot blow the request size.

use crate::error::PapersError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::imageops::FilterType;
use image::DynamicImage;
use std::io::Cursor;
use std::path::Path;
use tracing::debug;

/// Encode an image as `data:image/png;base64,…`, downscaling if needed.
pub fn encode_image(img: &DynamicImage, max_pixels: u32) -> Result<String, PapersError> {
    let longest = img.width().max(img.height());
    let resized;
    let img = if max_pixels > 0 && longest > max_pixels {
        resized = img.resize(max_pixels, max_pixels, FilterType::Lanczos3);
        debug!(
            "Downscaled {}x{} → {}x{}",
            img.width(),
            img.height(),
            resized.width(),
            resized.height()
        );
        &resized
    } else {
        img
    };

    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .map_err(|e| PapersError::Internal(format!("PNG encode: {e}")))?;
    Ok(format!("data:image/png;base64,{}", STANDARD.encode(&buf)))
}

/// Load a figure from disk and encode it. Runs on the blocking pool.
pub async fn figure_data_url(path: &Path, max_pixels: u32) -> Result<String, PapersError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let img = image::open(&path).map_err(|e| match e {
            image::ImageError::IoError(io) => PapersError::io(&path, io),
            other => PapersError::Internal(format!("{}: {other}", path.display())),
        })?;
        encode_image(&img, max_pixels)
    })
    .await
    .map_err(|e| PapersError::Internal(format!("Encode task panicked: {e}")))?
}
