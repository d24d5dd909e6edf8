//! Text extraction from downloaded PDFs.
//!
//! [`TextExtractor`] is the seam the pipeline calls after a successful
//! download. [`PdfTextExtractor`] reads the text layer with `pdf-extract` on a
//! blocking thread so parsing never stalls the async workers.

mod text;

use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, instrument};

use paperpipe_shared::{PaperPipeError, Result};

pub use text::{clean_text, tokenize};

/// Turns a local PDF into plain text.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, pdf_path: &Path) -> Result<String>;
}

/// [`TextExtractor`] backed by the `pdf-extract` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct PdfTextExtractor;

#[async_trait]
impl TextExtractor for PdfTextExtractor {
    #[instrument(skip(self), fields(pdf = %pdf_path.display()))]
    async fn extract(&self, pdf_path: &Path) -> Result<String> {
        let bytes = tokio::fs::read(pdf_path)
            .await
            .map_err(|e| PaperPipeError::io(pdf_path, e))?;

        // A panic inside the parser surfaces as a JoinError.
        let text = tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
            .await
            .map_err(|e| PaperPipeError::Extraction(format!("extractor task failed: {e}")))?
            .map_err(|e| {
                PaperPipeError::Extraction(format!("{}: {e}", pdf_path.display()))
            })?;

        debug!(chars = text.len(), "text extracted");
        Ok(text)
    }
}
