//! Error types for the drugwatch library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`PipelineError`]: **Fatal.** The call cannot proceed at all (bad
//!   configuration, unreadable catalog, model or pdfium not loadable, output
//!   directory not writable). Returned as `Err(PipelineError)`.
//!
//! * [`StageError`]: **Non-fatal.** One year, page or file failed (missing
//!   report, broken PDF page, download refused) while the rest of the stage
//!   is fine. Recorded in [`crate::output::StageReport::errors`] so a batch
//!   run over twenty report years is not lost to one bad file.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the drugwatch library.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// A required input file was not found.
    #[error("File not found: '{path}'")]
    FileNotFound { path: PathBuf },

    /// The file exists, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    /// A page catalog or settings file could not be parsed.
    #[error("Invalid JSON in '{path}': {source}")]
    InvalidJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A page-selection string could not be parsed.
    #[error("Invalid page selection '{input}': {reason}")]
    InvalidPageSelection { input: String, reason: String },

    // ── Network errors ────────────────────────────────────────────────────
    /// The index page or a report could not be fetched.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// The HTML page could not be interpreted.
    #[error("Failed to parse HTML from '{url}': {reason}")]
    HtmlParse { url: String, reason: String },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// pdfium could not open the document.
    #[error("PDF '{path}' could not be opened: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// pdfium-render returned an error for a specific page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: u32, detail: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium or install pdfium system-wide.\n\
Pre-built libraries: https://github.com/bblanchon/pdfium-binaries/releases\n"
    )]
    PdfiumBindingFailed(String),

    // ── Model errors ──────────────────────────────────────────────────────
    /// The ONNX table-detection model could not be loaded or optimised.
    #[error("Failed to load table-detection model '{path}': {detail}")]
    ModelLoad { path: PathBuf, detail: String },

    /// The model ran but produced unusable output.
    #[error("Table detection failed: {0}")]
    Inference(String),

    // ── Table errors ──────────────────────────────────────────────────────
    /// A column referenced by a cleaning step is absent.
    #[error("Column '{column}' not found in '{table}'")]
    MissingColumn { table: String, column: String },

    /// A row or cell position is out of range.
    #[error("Cell ({row}, {col}) out of range in '{table}'")]
    CellOutOfRange {
        table: String,
        row: usize,
        col: usize,
    },

    /// CSV reading or writing failed.
    #[error("CSV error in '{path}': {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an output file or directory.
    #[error("Failed to write '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Could not read an input file or directory.
    #[error("Failed to read '{path}': {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for one unit of work inside a stage.
///
/// The stage logs it, records it in its report and moves on to the next
/// year or file.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum StageError {
    /// The source report for a year is not on disk.
    #[error("{year}: source report missing: {path}")]
    MissingReport { year: u16, path: PathBuf },

    /// The catalog has no pages for the year.
    #[error("{year}: no pages catalogued")]
    NoPages { year: u16 },

    /// The input directory produced by the previous stage is absent.
    #[error("{year}: input directory missing: {path}")]
    MissingInput { year: u16, path: PathBuf },

    /// A single PDF download failed.
    #[error("download of {url} failed: {detail}")]
    DownloadFailed { url: String, detail: String },

    /// A page could not be rendered, detected or extracted.
    #[error("{year} page {page}: {detail}")]
    PageFailed { year: u16, page: u32, detail: String },

    /// A downloaded file was not renamed because its target name is taken.
    #[error("{file} not renamed: {target} already exists")]
    NameTaken { file: String, target: String },

    /// Anything else that failed for a whole year.
    #[error("{year}: {detail}")]
    YearFailed { year: u16, detail: String },
}

impl StageError {
    /// Wrap a fatal error raised while processing `year` as a non-fatal one.
    pub fn for_year(year: u16, err: &PipelineError) -> Self {
        StageError::YearFailed {
            year,
            detail: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_report_display() {
        let e = StageError::MissingReport {
            year: 2004,
            path: PathBuf::from("data/source/national_drug_monitor/NDM-2004.pdf"),
        };
        let msg = e.to_string();
        assert!(msg.starts_with("2004"), "got: {msg}");
        assert!(msg.contains("NDM-2004.pdf"));
    }

    #[test]
    fn page_failed_display() {
        let e = StageError::PageFailed {
            year: 2023,
            page: 225,
            detail: "bitmap allocation failed".into(),
        };
        assert_eq!(e.to_string(), "2023 page 225: bitmap allocation failed");
    }

    #[test]
    fn for_year_keeps_fatal_message() {
        let fatal = PipelineError::MissingColumn {
            table: "225_0.csv".into(),
            column: "mdma".into(),
        };
        let e = StageError::for_year(2023, &fatal);
        assert!(e.to_string().contains("mdma"));
        assert!(e.to_string().contains("225_0.csv"));
    }

    #[test]
    fn stage_error_serialises() {
        let e = StageError::NoPages { year: 1999 };
        let json = serde_json::to_string(&e).unwrap();
        let back: StageError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.to_string(), "1999: no pages catalogued");
    }

    #[test]
    fn pdfium_binding_hint() {
        let e = PipelineError::PdfiumBindingFailed("dlopen failed".into());
        assert!(e.to_string().contains("PDFIUM_LIB_PATH"));
    }
}
