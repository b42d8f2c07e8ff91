//! Table materialisation: detected boxes → text grids → CSV.
//!
//! Boxes are stored in render pixels. They are scaled back to PDF points by
//! the resolution constant (`72 / dpi`) and used to cut the page text that
//! pdfium reports. The text inside a box is clustered into rows by vertical
//! alignment and into columns by horizontal gaps, which is how stream-mode
//! extraction works on tables without ruling lines.

use crate::catalog::{DataLayout, ReportKind};
use crate::config::{ExtractOptions, PipelineConfig};
use crate::error::{PipelineError, StageError};
use crate::output::{Stage, StageReport};
use crate::pipeline::detect::{PixelBox, TableBoxes};
use crate::pipeline::{ensure_dir, finish_stage, list_numbered, pdfium, start_stage, YearOutcome};
use crate::table::Table;
use pdfium_render::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, warn};

/// A rectangle in PDF points with the origin at the top-left of the page.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointRect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl PointRect {
    fn contains(&self, x: f32, y: f32) -> bool {
        x >= self.left && x <= self.right && y >= self.top && y <= self.bottom
    }
}

impl PixelBox {
    /// Rescale from render pixels at `dpi` to PDF points.
    pub fn to_points(&self, dpi: u32) -> PointRect {
        let k = 72.0 / dpi as f32;
        PointRect {
            left: self.xmin * k,
            top: self.ymin * k,
            right: self.xmax * k,
            bottom: self.ymax * k,
        }
    }
}

/// A run of text on the page, in top-left point coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct TextCell {
    pub text: String,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl TextCell {
    fn center_x(&self) -> f32 {
        self.x + self.width / 2.0
    }

    fn center_y(&self) -> f32 {
        self.y + self.height / 2.0
    }

    fn right(&self) -> f32 {
        self.x + self.width
    }
}

fn by_f32(a: f32, b: f32) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

// ── Grid building ────────────────────────────────────────────────────────

/// Group cells into rows whose centres lie within `tolerance` of the row's
/// first cell. Rows come out top to bottom, cells left to right.
pub fn cluster_rows(mut cells: Vec<TextCell>, tolerance: f32) -> Vec<Vec<TextCell>> {
    cells.sort_by(|a, b| by_f32(a.center_y(), b.center_y()).then(by_f32(a.x, b.x)));

    let mut rows: Vec<Vec<TextCell>> = Vec::new();
    for cell in cells {
        let anchor = rows
            .last()
            .and_then(|row| row.first())
            .map(TextCell::center_y);
        match anchor {
            Some(y) if (cell.center_y() - y).abs() <= tolerance => {
                if let Some(row) = rows.last_mut() {
                    row.push(cell);
                }
            }
            _ => rows.push(vec![cell]),
        }
    }
    for row in &mut rows {
        row.sort_by(|a, b| by_f32(a.x, b.x));
    }
    rows
}

/// Column spans `(left, right)` derived from the horizontal extent of the
/// text in the most populated rows. Extents closer than `gap` merge.
pub fn column_spans(rows: &[Vec<TextCell>], gap: f32) -> Vec<(f32, f32)> {
    let widest = rows.iter().map(Vec::len).max().unwrap_or(0);
    if widest == 0 {
        return Vec::new();
    }
    let mut extents: Vec<(f32, f32)> = rows
        .iter()
        .filter(|r| r.len() == widest)
        .flat_map(|r| r.iter().map(|c| (c.x, c.right())))
        .collect();
    extents.sort_by(|a, b| by_f32(a.0, b.0));

    let mut spans: Vec<(f32, f32)> = Vec::new();
    for (left, right) in extents {
        match spans.last_mut() {
            Some(last) if left - last.1 < gap => last.1 = last.1.max(right),
            _ => spans.push((left, right)),
        }
    }
    spans
}

fn column_for(cell: &TextCell, spans: &[(f32, f32)]) -> usize {
    let cx = cell.center_x();
    if let Some(i) = spans.iter().position(|&(l, r)| cx >= l && cx <= r) {
        return i;
    }
    spans
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            let da = (cx - a.0).abs().min((cx - a.1).abs());
            let db = (cx - b.0).abs().min((cx - b.1).abs());
            by_f32(da, db)
        })
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Assemble text cells into a grid of strings. Cells sharing a grid slot
/// are joined with a space.
pub fn build_grid(cells: Vec<TextCell>, opts: &ExtractOptions) -> Vec<Vec<String>> {
    let rows = cluster_rows(cells, opts.row_tolerance);
    let spans = column_spans(&rows, opts.col_tolerance);
    if spans.is_empty() {
        return Vec::new();
    }
    rows.into_iter()
        .map(|row| {
            let mut out = vec![String::new(); spans.len()];
            for cell in row {
                let slot = &mut out[column_for(&cell, &spans)];
                if !slot.is_empty() {
                    slot.push(' ');
                }
                slot.push_str(&cell.text);
            }
            out
        })
        .collect()
}

// ── pdfium access ────────────────────────────────────────────────────────

/// Text segments of a page whose centre lies inside `rect`.
pub fn text_in_region(page: &PdfPage, rect: &PointRect) -> Result<Vec<TextCell>, PipelineError> {
    let page_height = page.height().value;
    let text = page
        .text()
        .map_err(|e| PipelineError::Internal(format!("Failed to get page text: {e:?}")))?;

    let mut cells = Vec::new();
    for segment in text.segments().iter() {
        let content = segment.text();
        let content = content.trim();
        if content.is_empty() {
            continue;
        }
        let bounds = segment.bounds();
        // PDF space has its origin bottom-left.
        let cell = TextCell {
            text: content.to_string(),
            x: bounds.left().value,
            y: page_height - bounds.top().value,
            width: bounds.right().value - bounds.left().value,
            height: bounds.top().value - bounds.bottom().value,
        };
        if rect.contains(cell.center_x(), cell.center_y()) {
            cells.push(cell);
        }
    }
    Ok(cells)
}

/// Extract the table inside `rect` from a page.
pub fn extract_region(
    page: &PdfPage,
    rect: &PointRect,
    opts: &ExtractOptions,
) -> Result<Vec<Vec<String>>, PipelineError> {
    Ok(build_grid(text_in_region(page, rect)?, opts))
}

// ── Stage ────────────────────────────────────────────────────────────────

/// Extract every detected table of one year into `{page}_{index}.csv`.
pub async fn materialize_report(
    layout: &DataLayout,
    kind: ReportKind,
    year: u16,
    opts: ExtractOptions,
    pdfium_path: Option<&Path>,
) -> Result<YearOutcome, PipelineError> {
    let boxes_dir = layout.boxes_dir(kind, year);
    if !boxes_dir.is_dir() {
        return Ok(YearOutcome::Skipped(StageError::MissingInput {
            year,
            path: boxes_dir,
        }));
    }
    let pdf = layout.report_pdf(kind, year);
    if !pdf.exists() {
        return Ok(YearOutcome::Skipped(StageError::MissingReport { year, path: pdf }));
    }
    let out_dir = layout.raw_csv_dir(kind, year);
    ensure_dir(&out_dir)?;

    let lib = pdfium_path.map(Path::to_path_buf);
    tokio::task::spawn_blocking(move || {
        materialize_blocking(&pdf, &boxes_dir, &out_dir, year, &opts, lib.as_deref())
    })
    .await
    .map_err(|e| PipelineError::Internal(format!("Extract task panicked: {}", e)))?
}

fn materialize_blocking(
    pdf: &Path,
    boxes_dir: &Path,
    out_dir: &Path,
    year: u16,
    opts: &ExtractOptions,
    pdfium_path: Option<&Path>,
) -> Result<YearOutcome, PipelineError> {
    let pdfium = pdfium::bind(pdfium_path)?;
    let document = match pdfium::open(&pdfium, pdf) {
        Ok(doc) => doc,
        Err(e) => return Ok(YearOutcome::Skipped(StageError::for_year(year, &e))),
    };
    let pages = document.pages();

    let mut files = Vec::new();
    let mut errors = Vec::new();
    for box_file in list_numbered(boxes_dir, "json")? {
        let boxes = match TableBoxes::load(&box_file) {
            Ok(b) => b,
            Err(e) => {
                warn!("{}", e);
                errors.push(StageError::YearFailed {
                    year,
                    detail: e.to_string(),
                });
                continue;
            }
        };
        match materialize_page(&pages, &boxes, out_dir, opts) {
            Ok(written) => files.extend(written),
            Err(e) => {
                warn!("{} page {}: {}", year, boxes.page, e);
                errors.push(StageError::PageFailed {
                    year,
                    page: boxes.page,
                    detail: e.to_string(),
                });
            }
        }
    }
    Ok(YearOutcome::Done { files, errors })
}

fn materialize_page(
    pages: &PdfPages,
    boxes: &TableBoxes,
    out_dir: &Path,
    opts: &ExtractOptions,
) -> Result<Vec<PathBuf>, PipelineError> {
    if boxes.page == 0 || boxes.page > pages.len() as u32 {
        return Err(PipelineError::RasterisationFailed {
            page: boxes.page,
            detail: format!("page out of range, document has {} pages", pages.len()),
        });
    }
    let page = pages
        .get((boxes.page - 1) as u16)
        .map_err(|e| PipelineError::RasterisationFailed {
            page: boxes.page,
            detail: format!("{:?}", e),
        })?;

    let mut written = Vec::new();
    for (index, detection) in boxes.detections.iter().enumerate() {
        let rect = detection.bbox.to_points(boxes.dpi);
        let grid = extract_region(&page, &rect, opts)?;
        if grid.is_empty() {
            debug!("Page {} box {}: no text", boxes.page, index);
            continue;
        }
        let name = format!("{}_{}.csv", boxes.page, index);
        let path = out_dir.join(&name);
        Table::from_records(name, grid).write_csv(&path)?;
        written.push(path);
    }
    Ok(written)
}

/// Materialise every configured year of `kind`.
pub async fn extract_stage(
    config: &PipelineConfig,
    kind: ReportKind,
) -> Result<StageReport, PipelineError> {
    let started = Instant::now();
    let years = config.years_for(kind);
    let cb = config.progress_callback.as_ref();
    let mut report = start_stage(Stage::Extract, kind, years.len(), cb);

    for year in years {
        materialize_report(
            &config.layout,
            kind,
            year,
            config.extract_options(),
            config.pdfium_path.as_deref(),
        )
        .await?
        .record(year, &mut report, cb);
    }

    Ok(finish_stage(report, started, cb))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(text: &str, x: f32, y: f32, width: f32) -> TextCell {
        TextCell {
            text: text.into(),
            x,
            y,
            width,
            height: 8.0,
        }
    }

    #[test]
    fn to_points_uses_resolution_constant() {
        let b = PixelBox {
            xmin: 200.0,
            ymin: 400.0,
            xmax: 1000.0,
            ymax: 1200.0,
        };
        let r = b.to_points(200);
        assert!((r.left - 72.0).abs() < 1e-4);
        assert!((r.top - 144.0).abs() < 1e-4);
        assert!((r.right - 360.0).abs() < 1e-4);
        assert!((r.bottom - 432.0).abs() < 1e-4);
        assert_eq!(b.to_points(72).right, 1000.0);
    }

    #[test]
    fn rows_cluster_by_vertical_centre() {
        let rows = cluster_rows(
            vec![
                cell("b", 50.0, 101.0, 10.0),
                cell("c", 10.0, 120.0, 10.0),
                cell("a", 10.0, 100.0, 10.0),
            ],
            3.0,
        );
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].iter().map(|c| c.text.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(rows[1][0].text, "c");
    }

    #[test]
    fn grid_aligns_right_aligned_numbers() {
        let opts = ExtractOptions::default();
        let grid = build_grid(
            vec![
                cell("jaar", 10.0, 100.0, 20.0),
                cell("mdma", 80.0, 100.0, 25.0),
                cell("2019", 10.0, 112.0, 18.0),
                cell("1.234", 85.0, 112.0, 20.0),
                cell("2020", 10.0, 124.0, 18.0),
                cell("35", 95.0, 124.0, 10.0),
                cell("2021", 10.0, 136.0, 18.0),
            ],
            &opts,
        );
        assert_eq!(
            grid,
            vec![
                vec!["jaar", "mdma"],
                vec!["2019", "1.234"],
                vec!["2020", "35"],
                vec!["2021", ""],
            ]
        );
    }

    #[test]
    fn header_cells_spanning_columns_join() {
        let opts = ExtractOptions::default();
        let grid = build_grid(
            vec![
                cell("aantal", 40.0, 100.0, 10.0),
                cell("monsters", 52.0, 100.0, 30.0),
                cell("2019", 10.0, 112.0, 18.0),
                cell("12", 45.0, 112.0, 10.0),
                cell("34", 75.0, 112.0, 10.0),
            ],
            &opts,
        );
        assert_eq!(grid[0], vec!["", "aantal", "monsters"]);
        assert_eq!(grid[1], vec!["2019", "12", "34"]);
    }

    #[test]
    fn empty_region_gives_empty_grid() {
        assert!(build_grid(Vec::new(), &ExtractOptions::default()).is_empty());
    }

    #[test]
    fn rect_contains_centres() {
        let r = PointRect {
            left: 10.0,
            top: 10.0,
            right: 100.0,
            bottom: 50.0,
        };
        assert!(r.contains(50.0, 30.0));
        assert!(!r.contains(5.0, 30.0));
        assert!(!r.contains(50.0, 60.0));
    }

    #[tokio::test]
    async fn missing_boxes_skip_the_year() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DataLayout::new(dir.path());
        let outcome = materialize_report(
            &layout,
            ReportKind::Antenne,
            2023,
            ExtractOptions::default(),
            None,
        )
        .await
        .unwrap();
        assert!(matches!(
            outcome,
            YearOutcome::Skipped(StageError::MissingInput { year: 2023, .. })
        ));
    }

    #[tokio::test]
    async fn missing_pdf_skips_the_year() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DataLayout::new(dir.path());
        std::fs::create_dir_all(layout.boxes_dir(ReportKind::National, 2012)).unwrap();
        let outcome = materialize_report(
            &layout,
            ReportKind::National,
            2012,
            ExtractOptions::default(),
            None,
        )
        .await
        .unwrap();
        assert!(matches!(
            outcome,
            YearOutcome::Skipped(StageError::MissingReport { year: 2012, .. })
        ));
    }
}
