//! Multi-format decoding of source documents into a normalized form.
//!
//! The pipeline hands this module raw bytes plus the file extension taken from
//! the object key; it returns either concatenated plain text (PDF, DOCX, PPTX,
//! TXT) or one serialized string per spreadsheet row (XLS, XLSX). Decoding is
//! pure: no I/O beyond the input buffer.

mod ooxml;
mod tabular;

use thiserror::Error;

pub use tabular::serialize_rows;

/// Extensions accepted by the decoder.
pub const SUPPORTED_EXTENSIONS: [&str; 6] = ["pdf", "docx", "pptx", "txt", "xls", "xlsx"];

/// A decoded document, normalized for downstream chunking.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedDocument {
    /// Concatenated page/paragraph/slide text separated by newlines.
    Text(String),
    /// One serialized string per meaningful spreadsheet row.
    Tabular(Vec<String>),
}

impl NormalizedDocument {
    /// Whether this document carries spreadsheet rows.
    pub fn is_tabular(&self) -> bool {
        matches!(self, NormalizedDocument::Tabular(_))
    }
}

/// Decoding error. Unsupported extensions never produce partial output.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The file extension is not one of the supported formats.
    #[error("File format not supported: {0}")]
    UnsupportedFormat(String),
    /// PDF text extraction failed.
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    /// OOXML container or XML parsing failed.
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
}

/// Decode raw bytes into a [`NormalizedDocument`] based on the extension.
pub fn decode(bytes: &[u8], extension: &str) -> Result<NormalizedDocument, DecodeError> {
    match extension.to_lowercase().as_str() {
        "pdf" => decode_pdf(bytes).map(NormalizedDocument::Text),
        "docx" => ooxml::extract_docx(bytes).map(NormalizedDocument::Text),
        "pptx" => ooxml::extract_pptx(bytes).map(NormalizedDocument::Text),
        "txt" => Ok(NormalizedDocument::Text(
            String::from_utf8_lossy(bytes).into_owned(),
        )),
        "xls" | "xlsx" => {
            let grid = ooxml::extract_xlsx_grid(bytes)?;
            Ok(NormalizedDocument::Tabular(tabular::serialize_rows(grid)))
        }
        other => Err(DecodeError::UnsupportedFormat(other.to_string())),
    }
}

/// Extension of an object key, lowercased; empty when the key has none.
pub fn extension_of(key: &str) -> String {
    key.rsplit('.')
        .next()
        .filter(|ext| !ext.contains('/') && ext.len() < key.len())
        .unwrap_or("")
        .to_lowercase()
}

fn decode_pdf(bytes: &[u8]) -> Result<String, DecodeError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|err| DecodeError::Pdf(err.to_string()))
}
