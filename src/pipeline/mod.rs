//! Pipeline stages for report table extraction.
//!
//! Each submodule implements exactly one transformation step and talks to
//! the next one only through files under the [`crate::catalog::DataLayout`],
//! so any stage can be re-run on its own.
//!
//! ## Data Flow
//!
//! ```text
//! download ──▶ render ──▶ detect ──▶ extract ──▶ clean
//! (HTML+PDF)   (pdfium)   (ONNX)     (pdfium text → CSV)
//! ```
//!
//! 1. [`download`]: fetch the publications page and the PDFs it links
//! 2. [`render`]: rasterise catalogued pages; runs in `spawn_blocking`
//!    because pdfium is not async-safe
//! 3. [`detect`]: locate tables on each page image with a DETR model
//! 4. [`extract`]: map boxes back to PDF points and rebuild the tables
//!    from the page text

pub mod detect;
pub mod download;
pub mod extract;
pub mod pdfium;
pub mod render;

use crate::error::{PipelineError, StageError};
use crate::output::{Stage, StageReport};
use crate::progress::ProgressCallback;
use std::io::Write;
use std::path::{Path, PathBuf};

/// What a stage did for one report year.
#[derive(Debug)]
pub enum YearOutcome {
    /// The year was processed. Some pages may have failed.
    Done {
        files: Vec<PathBuf>,
        errors: Vec<StageError>,
    },
    /// Nothing was done for the year.
    Skipped(StageError),
}

impl YearOutcome {
    /// Fold the outcome into the stage report and notify the observer.
    pub(crate) fn record(
        self,
        year: u16,
        report: &mut StageReport,
        callback: Option<&ProgressCallback>,
    ) {
        match self {
            YearOutcome::Done { files, errors } => {
                if let Some(cb) = callback {
                    cb.on_year_complete(report.stage, year, files.len());
                }
                report.years_processed.push(year);
                report.files_written.extend(files);
                for e in errors {
                    report.fail(e);
                }
            }
            YearOutcome::Skipped(reason) => {
                if let Some(cb) = callback {
                    cb.on_year_skipped(report.stage, year, &reason.to_string());
                }
                report.skip(year, reason);
            }
        }
    }
}

/// Directory creation shared by every stage that writes files.
pub(crate) fn ensure_dir(dir: &Path) -> Result<(), PipelineError> {
    std::fs::create_dir_all(dir).map_err(|e| PipelineError::OutputWriteFailed {
        path: dir.to_path_buf(),
        source: e,
    })
}

/// Write `bytes` to a temporary file next to `dest` and rename it into place.
pub(crate) fn write_atomic(dest: &Path, bytes: &[u8]) -> Result<(), PipelineError> {
    let write_err = |source| PipelineError::OutputWriteFailed {
        path: dest.to_path_buf(),
        source,
    };
    let dir = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    tmp.write_all(bytes).map_err(write_err)?;
    tmp.flush().map_err(write_err)?;
    tmp.persist(dest).map_err(|e| write_err(e.error))?;
    Ok(())
}

/// Files in `dir` with the given extension, ordered by their numeric stem
/// (`9.png` before `10.png`), then by name.
pub(crate) fn list_numbered(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, PipelineError> {
    let entries = std::fs::read_dir(dir).map_err(|e| PipelineError::ReadFailed {
        path: dir.to_path_buf(),
        source: e,
    })?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().and_then(|x| x.to_str()) == Some(extension))
        .collect();
    files.sort_by_key(|p| {
        let stem = p
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        (stem.parse::<u32>().unwrap_or(u32::MAX), stem)
    });
    Ok(files)
}

/// Page number encoded in a `{page}.ext` file name.
pub(crate) fn page_of(path: &Path) -> Option<u32> {
    path.file_stem()?.to_str()?.parse().ok()
}

/// Start-of-stage bookkeeping shared by the per-kind stage drivers.
pub(crate) fn start_stage(
    stage: Stage,
    kind: crate::catalog::ReportKind,
    total_years: usize,
    callback: Option<&ProgressCallback>,
) -> StageReport {
    if let Some(cb) = callback {
        cb.on_stage_start(stage, kind, total_years);
    }
    tracing::info!("{} {}: {} years", stage, kind, total_years);
    StageReport::new(stage, Some(kind))
}

/// End-of-stage bookkeeping.
pub(crate) fn finish_stage(
    mut report: StageReport,
    started: std::time::Instant,
    callback: Option<&ProgressCallback>,
) -> StageReport {
    report.duration_ms = started.elapsed().as_millis() as u64;
    tracing::info!(
        "{} done: {} years, {} skipped, {} files, {} errors in {}ms",
        report.stage,
        report.years_processed.len(),
        report.years_skipped.len(),
        report.files_written.len(),
        report.errors.len(),
        report.duration_ms
    );
    if let Some(cb) = callback {
        cb.on_stage_complete(&report);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ReportKind;

    #[test]
    fn numbered_files_sort_numerically() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["10.png", "9.png", "200.png", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let files = list_numbered(dir.path(), "png").unwrap();
        let pages: Vec<u32> = files.iter().filter_map(|p| page_of(p)).collect();
        assert_eq!(pages, vec![9, 10, 200]);
    }

    #[test]
    fn outcome_records_into_report() {
        let mut report = StageReport::new(Stage::Detect, Some(ReportKind::Antenne));
        YearOutcome::Done {
            files: vec!["a.json".into()],
            errors: vec![StageError::PageFailed {
                year: 2003,
                page: 4,
                detail: "x".into(),
            }],
        }
        .record(2003, &mut report, None);
        YearOutcome::Skipped(StageError::NoPages { year: 2004 }).record(2004, &mut report, None);

        assert_eq!(report.years_processed, vec![2003]);
        assert_eq!(report.years_skipped, vec![2004]);
        assert_eq!(report.files_written.len(), 1);
        assert_eq!(report.errors.len(), 2);
    }
}
