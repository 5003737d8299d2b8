//! Image encoding: `DynamicImage` → base64 PNG [`PageImage`].
//!
//! PNG over JPEG: slide decks are dense with small print, trial tables and
//! chemical names, and compression artefacts on rendered text cost accuracy
//! far more than the extra bytes cost bandwidth.

use crate::output::PageImage;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode a rasterised page as a base64 PNG.
pub fn encode_page(img: &DynamicImage) -> Result<PageImage, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let b64 = STANDARD.encode(&buf);
    debug!("Encoded image → {} bytes base64", b64.len());

    Ok(PageImage::png(b64))
}
