//! Slide rasterisation via pdfium.
//!
//! pdfium keeps thread-local state and is CPU bound, so all of it runs in
//! `tokio::task::spawn_blocking`. Pages are encoded to base64 PNG on the same
//! blocking thread and only [`Page`]s cross back into async code.
//!
//! Each slide is rendered at `dpi` (page points × dpi / 72), then scaled down
//! so the longest edge fits `max_rendered_pixels`. A 10-inch widescreen slide
//! at the default 150 DPI comes out at 1500 px wide.

use super::encode::encode_page;
use crate::config::PipelineConfig;
use crate::error::PharmDeckError;
use crate::output::{DocumentMetadata, Page};
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Render every page of the deck, in document order.
pub async fn render_pages(pdf_path: &Path, config: &PipelineConfig) -> Result<Vec<Page>, PharmDeckError> {
    let path = pdf_path.to_path_buf();
    let dpi = config.dpi;
    let max_pixels = config.max_rendered_pixels;
    let password = config.password.clone();

    tokio::task::spawn_blocking(move || {
        render_pages_blocking(&path, dpi, max_pixels, password.as_deref())
    })
        .await
        .map_err(|e| PharmDeckError::Internal(format!("Render task panicked: {}", e)))?
}

/// Bind to pdfium: `PDFIUM_LIB_PATH` (a file or its directory) first, then
/// next to the executable, then the system library.
fn bind_pdfium() -> Result<Pdfium, PharmDeckError> {
    let bindings = match std::env::var("PDFIUM_LIB_PATH") {
        Ok(p) if !p.trim().is_empty() => {
            let path = PathBuf::from(p.trim());
            let path = if path.is_dir() {
                Pdfium::pdfium_platform_library_name_at_path(&path)
            } else {
                path
            };
            Pdfium::bind_to_library(&path)
                .map_err(|e| PharmDeckError::PdfiumBindingFailed(format!("{}: {:?}", path.display(), e)))?
        }
        _ => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
            .or_else(|_| Pdfium::bind_to_system_library())
            .map_err(|e| PharmDeckError::PdfiumBindingFailed(format!("{:?}", e)))?,
    };
    Ok(Pdfium::new(bindings))
}

fn open_error(pdf_path: &Path, password: Option<&str>, e: PdfiumError) -> PharmDeckError {
    let detail = format!("{:?}", e);
    if detail.to_lowercase().contains("password") {
        if password.is_some() {
            PharmDeckError::WrongPassword {
                path: pdf_path.to_path_buf(),
            }
        } else {
            PharmDeckError::PasswordRequired {
                path: pdf_path.to_path_buf(),
            }
        }
    } else {
        PharmDeckError::CorruptPdf {
            path: pdf_path.to_path_buf(),
            detail,
        }
    }
}

fn render_pages_blocking(
    pdf_path: &Path,
    dpi: u32,
    max_pixels: u32,
    password: Option<&str>,
) -> Result<Vec<Page>, PharmDeckError> {
    let pdfium = bind_pdfium()?;
    let document = pdfium
        .load_pdf_from_file(pdf_path, password)
        .map_err(|e| open_error(pdf_path, password, e))?;

    let pages = document.pages();
    let total = pages.len() as usize;
    info!("Deck loaded: {} slides at {} DPI", total, dpi);

    let mut out = Vec::with_capacity(total);
    for (idx, page) in pages.iter().enumerate() {
        let page_number = idx + 1;
        let width = target_width(page.width().value, page.height().value, dpi, max_pixels);
        let render_config = PdfRenderConfig::new()
            .set_target_width(width)
            .set_maximum_height(max_pixels as i32);
        let bitmap = page.render_with_config(&render_config).map_err(|e| {
            PharmDeckError::RasterisationFailed {
                page: page_number,
                detail: format!("{:?}", e),
            }
        })?;
        let image = bitmap.as_image();
        debug!(
            "Rendered slide {} → {}x{} px",
            page_number,
            image.width(),
            image.height()
        );

        match encode_page(&image) {
            Ok(encoded) => out.push(Page {
                page_number,
                image: encoded,
            }),
            // The slide is dropped; traversal works on whatever pages exist.
            Err(e) => warn!("Failed to encode slide {}: {}", page_number, e),
        }
    }
    Ok(out)
}

/// Pixel width for a page of the given size in points: `dpi` scaling, with
/// the longest edge capped at `max_pixels`.
fn target_width(width_pts: f32, height_pts: f32, dpi: u32, max_pixels: u32) -> i32 {
    let scale = dpi as f32 / 72.0;
    let (width, height) = (width_pts * scale, height_pts * scale);
    let longest = width.max(height);
    let fit = if longest > max_pixels as f32 {
        max_pixels as f32 / longest
    } else {
        1.0
    };
    ((width * fit).round() as i32).max(1)
}

/// Read document metadata without rendering any page.
///
/// The title falls back to the file stem. Company, event, date and
/// `document_id` are left empty for the caller to fill in.
pub async fn extract_metadata(
    pdf_path: &Path,
    password: Option<&str>,
) -> Result<DocumentMetadata, PharmDeckError> {
    let path = pdf_path.to_path_buf();
    let pwd = password.map(|s| s.to_string());

    tokio::task::spawn_blocking(move || extract_metadata_blocking(&path, pwd.as_deref()))
        .await
        .map_err(|e| PharmDeckError::Internal(format!("Metadata task panicked: {}", e)))?
}

fn extract_metadata_blocking(
    pdf_path: &Path,
    password: Option<&str>,
) -> Result<DocumentMetadata, PharmDeckError> {
    let pdfium = bind_pdfium()?;
    let document = pdfium
        .load_pdf_from_file(pdf_path, password)
        .map_err(|e| open_error(pdf_path, password, e))?;

    let metadata = document.metadata();
    let get_meta = |tag: PdfDocumentMetadataTagType| -> Option<String> {
        metadata
            .get(tag)
            .map(|t| t.value().trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let title = get_meta(PdfDocumentMetadataTagType::Title).unwrap_or_else(|| {
        pdf_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default()
    });

    Ok(DocumentMetadata {
        title,
        author: get_meta(PdfDocumentMetadataTagType::Author),
        subject: get_meta(PdfDocumentMetadataTagType::Subject),
        company: String::new(),
        event: String::new(),
        date: String::new(),
        document_id: String::new(),
        page_count: document.pages().len() as usize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dpi_sets_the_rendered_width() {
        // 10 x 5.625 inch widescreen slide.
        assert_eq!(target_width(720.0, 405.0, 150, 2000), 1500);
        assert_eq!(target_width(720.0, 405.0, 72, 2000), 720);
        assert_eq!(target_width(720.0, 405.0, 100, 2000), 1000);
    }

    #[test]
    fn longest_edge_is_capped() {
        assert_eq!(target_width(720.0, 405.0, 300, 2000), 2000);
        // US Letter portrait: height is the longest edge.
        assert_eq!(target_width(612.0, 792.0, 150, 2000), 1275);
        assert_eq!(target_width(612.0, 792.0, 400, 2000), 1545);
    }
}
