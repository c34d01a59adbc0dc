//! Render stage: rasterise every page of the downloaded PDF.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which keeps thread-local
//! state and is not safe to drive from async tasks. [`render`] moves the
//! [`PageRenderer`] call onto the blocking pool so Tokio workers keep
//! serving other jobs while a long scan is rasterised.
//!
//! ## Why cap pixels as well as DPI?
//!
//! Page sizes vary wildly: an A0 plan at 150 DPI is 7,000 × 9,900 px.
//! `max_rendered_pixels` bounds the longest edge regardless of physical size,
//! which keeps memory bounded and matches what vision models actually read.

use crate::config::IngestConfig;
use crate::error::StageError;
use crate::pipeline::encode;
use crate::temp::TempScope;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Turns a PDF file into PNG page images, in page order.
///
/// Blocking: callers run it on the blocking pool.
pub trait PageRenderer: Send + Sync {
    fn render(&self, pdf_path: &Path) -> Result<Vec<Vec<u8>>, StageError>;
}

/// [`PageRenderer`] backed by the system pdfium library.
#[derive(Debug, Clone, Copy)]
pub struct PdfiumRenderer {
    dpi: u32,
    max_pixels: u32,
}

impl PdfiumRenderer {
    pub fn new(config: &IngestConfig) -> Self {
        Self {
            dpi: config.dpi,
            max_pixels: config.max_rendered_pixels,
        }
    }
}

impl PageRenderer for PdfiumRenderer {
    fn render(&self, pdf_path: &Path) -> Result<Vec<Vec<u8>>, StageError> {
        let pdfium = Pdfium::default();

        let document = pdfium
            .load_pdf_from_file(pdf_path, None)
            .map_err(|e| StageError::CorruptPdf {
                detail: format!("{:?}", e),
            })?;

        let pages = document.pages();
        let total_pages = pages.len() as usize;
        info!("PDF loaded: {} pages", total_pages);
        if total_pages == 0 {
            return Err(StageError::EmptyDocument);
        }

        // PDF user space is 72 units per inch.
        let render_config = PdfRenderConfig::new()
            .scale_page_by_factor(self.dpi as f32 / 72.0)
            .set_maximum_width(self.max_pixels as i32)
            .set_maximum_height(self.max_pixels as i32);

        let mut results = Vec::with_capacity(total_pages);
        for idx in 0..total_pages {
            let failed = |e: PdfiumError| StageError::RasterisationFailed {
                page: idx + 1,
                detail: format!("{:?}", e),
            };

            let page = pages.get(idx as u16).map_err(failed)?;
            let bitmap = page.render_with_config(&render_config).map_err(failed)?;
            let image = bitmap.as_image();
            debug!(
                "Rendered page {} → {}x{} px",
                idx + 1,
                image.width(),
                image.height()
            );

            let png = encode::png_bytes(&image).map_err(|e| StageError::RasterisationFailed {
                page: idx + 1,
                detail: e.to_string(),
            })?;
            results.push(png);
        }

        Ok(results)
    }
}

/// Run the Render stage. Returns page image paths in page order.
///
/// Pages written before a failure are discarded immediately so a retried
/// render does not leave a second set behind.
pub async fn render(
    pdf_path: &Path,
    renderer: Arc<dyn PageRenderer>,
    scope: &TempScope,
) -> Result<Vec<PathBuf>, StageError> {
    let path = pdf_path.to_path_buf();
    let pages = tokio::task::spawn_blocking(move || renderer.render(&path))
        .await
        .map_err(|e| StageError::Internal(format!("Render task panicked: {}", e)))??;

    if pages.is_empty() {
        return Err(StageError::EmptyDocument);
    }

    let mut written = Vec::with_capacity(pages.len());
    for png in &pages {
        match scope.write(png, "png").await {
            Ok(p) => written.push(p),
            Err(e) => {
                scope.discard(&written).await;
                return Err(e);
            }
        }
    }
    debug!(pages = written.len(), "Page images stored");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temp::DiskTempStorage;
    use uuid::Uuid;

    struct FixedPages(Result<Vec<Vec<u8>>, StageError>);

    impl PageRenderer for FixedPages {
        fn render(&self, _: &Path) -> Result<Vec<Vec<u8>>, StageError> {
            self.0.clone()
        }
    }

    fn scope() -> TempScope {
        TempScope::new(Arc::new(DiskTempStorage::new().unwrap()), Uuid::new_v4())
    }

    #[tokio::test]
    async fn pages_are_stored_in_order() {
        let scope = scope();
        let renderer = Arc::new(FixedPages(Ok(vec![b"p1".to_vec(), b"p2".to_vec()])));
        let paths = render(Path::new("/x.pdf"), renderer, &scope).await.unwrap();
        assert_eq!(paths.len(), 2);
        assert_eq!(scope.read(&paths[0]).await.unwrap(), b"p1");
        assert_eq!(scope.read(&paths[1]).await.unwrap(), b"p2");
        scope.release().await;
    }

    #[tokio::test]
    async fn zero_pages_is_permanent() {
        let scope = scope();
        let renderer = Arc::new(FixedPages(Ok(vec![])));
        let err = render(Path::new("/x.pdf"), renderer, &scope).await.unwrap_err();
        assert_eq!(err, StageError::EmptyDocument);
        assert!(!err.kind().is_retryable());
    }

    #[tokio::test]
    async fn corrupt_pdf_is_permanent() {
        let scope = scope();
        let renderer = Arc::new(FixedPages(Err(StageError::CorruptPdf {
            detail: "bad xref".into(),
        })));
        let err = render(Path::new("/x.pdf"), renderer, &scope).await.unwrap_err();
        assert!(!err.kind().is_retryable());
        assert!(scope.is_empty().await);
    }
}
