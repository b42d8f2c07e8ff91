//! PDF rasterisation: render catalogued pages to PNG files via pdfium.
//!
//! ## Why spawn_blocking?
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which uses
//! thread-local state internally and is not safe to call from async contexts.
//! `tokio::task::spawn_blocking` moves the work onto a dedicated thread pool
//! thread designed for blocking operations, preventing the Tokio worker
//! threads from stalling during CPU-heavy rendering.
//!
//! ## Why a fixed DPI?
//!
//! Detected boxes are stored in render pixels and converted back to PDF
//! points with `72 / dpi`. Scaling every page by exactly `dpi / 72` keeps
//! that conversion exact regardless of the physical page size.

use crate::catalog::{DataLayout, PageCatalog, ReportKind};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, StageError};
use crate::output::{Stage, StageReport};
use crate::pipeline::{ensure_dir, finish_stage, pdfium, start_stage, write_atomic, YearOutcome};
use image::ImageFormat;
use pdfium_render::prelude::*;
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// File next to the page images recording how they were rendered.
pub const RENDER_INFO_FILE: &str = "render.json";

/// How the page images of one report were produced. Detection stamps this
/// DPI on its boxes so extraction scales them back with the right factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderInfo {
    pub dpi: u32,
}

impl RenderInfo {
    /// Read the render info of an image directory, `None` when absent.
    pub fn load(images_dir: &Path) -> Result<Option<Self>, PipelineError> {
        crate::clean::load_json_opt(&images_dir.join(RENDER_INFO_FILE))
    }

    pub fn save(&self, images_dir: &Path) -> Result<(), PipelineError> {
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| PipelineError::Internal(format!("serialising render info: {e}")))?;
        write_atomic(&images_dir.join(RENDER_INFO_FILE), &bytes)
    }
}

/// Check the `%PDF` signature of a file without loading pdfium.
pub(crate) fn check_pdf_header(path: &Path) -> Result<(), PipelineError> {
    let mut magic = [0u8; 4];
    let mut file = std::fs::File::open(path).map_err(|e| PipelineError::ReadFailed {
        path: path.to_path_buf(),
        source: e,
    })?;
    let n = file.read(&mut magic).map_err(|e| PipelineError::ReadFailed {
        path: path.to_path_buf(),
        source: e,
    })?;
    pdfium::check_signature(&magic[..n], path)
}

/// Render `pages` (1-based) of one year's report into its image directory.
///
/// A missing report or an empty page list skips the year. Pages beyond the
/// end of the document are skipped with a warning.
pub async fn render_report(
    layout: &DataLayout,
    kind: ReportKind,
    year: u16,
    pages: &[u32],
    dpi: u32,
    pdfium_path: Option<&Path>,
) -> Result<YearOutcome, PipelineError> {
    let pdf = layout.report_pdf(kind, year);
    if !pdf.exists() {
        return Ok(YearOutcome::Skipped(StageError::MissingReport { year, path: pdf }));
    }
    if pages.is_empty() {
        return Ok(YearOutcome::Skipped(StageError::NoPages { year }));
    }
    if let Err(e) = check_pdf_header(&pdf) {
        return Ok(YearOutcome::Skipped(StageError::for_year(year, &e)));
    }

    let out_dir = layout.images_dir(kind, year);

    let pages = pages.to_vec();
    let lib = pdfium_path.map(Path::to_path_buf);
    tokio::task::spawn_blocking(move || {
        render_pages_blocking(&pdf, year, &pages, dpi, &out_dir, lib.as_deref())
    })
    .await
    .map_err(|e| PipelineError::Internal(format!("Render task panicked: {}", e)))?
}

/// Blocking implementation of page rendering.
fn render_pages_blocking(
    pdf_path: &Path,
    year: u16,
    pages: &[u32],
    dpi: u32,
    out_dir: &Path,
    pdfium_path: Option<&Path>,
) -> Result<YearOutcome, PipelineError> {
    let pdfium = pdfium::bind(pdfium_path)?;
    let document = match pdfium::open(&pdfium, pdf_path) {
        Ok(doc) => doc,
        Err(e) => return Ok(YearOutcome::Skipped(StageError::for_year(year, &e))),
    };
    ensure_dir(out_dir)?;
    RenderInfo { dpi }.save(out_dir)?;

    let doc_pages = document.pages();
    let total_pages = doc_pages.len() as u32;
    info!("{}: {} pages, rendering {}", pdf_path.display(), total_pages, pages.len());

    let render_config = PdfRenderConfig::new().scale_page_by_factor(dpi as f32 / 72.0);

    let mut files = Vec::with_capacity(pages.len());
    let mut errors = Vec::new();

    for &page_no in pages {
        if page_no == 0 || page_no > total_pages {
            warn!("Skipping page {} (out of range, total={})", page_no, total_pages);
            errors.push(StageError::PageFailed {
                year,
                page: page_no,
                detail: format!("out of range, document has {total_pages} pages"),
            });
            continue;
        }

        match render_one(&doc_pages, page_no, &render_config, out_dir) {
            Ok(path) => files.push(path),
            Err(e) => {
                warn!("{}", e);
                errors.push(StageError::PageFailed {
                    year,
                    page: page_no,
                    detail: e.to_string(),
                });
            }
        }
    }

    Ok(YearOutcome::Done { files, errors })
}

fn render_one(
    doc_pages: &PdfPages,
    page_no: u32,
    render_config: &PdfRenderConfig,
    out_dir: &Path,
) -> Result<PathBuf, PipelineError> {
    let page = doc_pages
        .get((page_no - 1) as u16)
        .map_err(|e| PipelineError::RasterisationFailed {
            page: page_no,
            detail: format!("{:?}", e),
        })?;

    let bitmap = page
        .render_with_config(render_config)
        .map_err(|e| PipelineError::RasterisationFailed {
            page: page_no,
            detail: format!("{:?}", e),
        })?;

    let image = bitmap.as_image();
    debug!("Rendered page {} → {}x{} px", page_no, image.width(), image.height());

    let mut png = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|e| PipelineError::RasterisationFailed {
            page: page_no,
            detail: format!("PNG encoding: {e}"),
        })?;

    let path = out_dir.join(format!("{page_no}.png"));
    write_atomic(&path, &png)?;
    Ok(path)
}

/// Render every configured year of `kind`.
pub async fn render_stage(
    config: &PipelineConfig,
    kind: ReportKind,
) -> Result<StageReport, PipelineError> {
    let started = Instant::now();
    let catalog = PageCatalog::for_kind(&config.layout, kind)?;
    let years = config.years_for(kind);
    let cb = config.progress_callback.as_ref();
    let mut report = start_stage(Stage::Render, kind, years.len(), cb);

    for year in years {
        let outcome = match catalog.pages(year) {
            Some(pages) => {
                render_report(
                    &config.layout,
                    kind,
                    year,
                    &pages,
                    config.dpi,
                    config.pdfium_path.as_deref(),
                )
                .await?
            }
            None => YearOutcome::Skipped(StageError::NoPages { year }),
        };
        outcome.record(year, &mut report, cb);
    }

    Ok(finish_stage(report, started, cb))
}
