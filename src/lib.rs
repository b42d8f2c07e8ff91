//! # drugwatch
//!
//! Turn the statistics tables of Dutch drug-monitoring reports into clean
//! CSV time series.
//!
//! The Antenne Amsterdam monitor and the National Drug Monitor publish their
//! yearly numbers only as tables inside long PDF reports. This crate fetches
//! the reports, finds the tables on the catalogued pages with a
//! Table-Transformer detection model, rebuilds them from the PDF text layer
//! and cleans each report layout into tidy tables.
//!
//! ## Pipeline Overview
//!
//! ```text
//! publications page
//!  │
//!  ├─ 1. Download  every linked PDF (National reports renamed NDM-{year}.pdf)
//!  ├─ 2. Render    catalogued pages → PNG via pdfium (spawn_blocking)
//!  ├─ 3. Detect    table boxes per page with an ONNX DETR model (tract)
//!  ├─ 4. Extract   boxes → PDF points → text grid → raw CSV
//!  └─ 5. Clean     per-report cleaners → processed CSV
//! ```
//!
//! Stages communicate only through files under a [`DataLayout`], so any of
//! them can be re-run alone. Supplementary EUDA tables are scraped
//! separately with [`scrape::tables_to_csv`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use drugwatch::{run_pipeline, PipelineConfig, ReportKind};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::builder()
//!         .data_root("./data")
//!         .kinds(vec![ReportKind::Antenne])
//!         .years(ReportKind::Antenne, 2020..2024)
//!         .build()?;
//!     let summary = run_pipeline(&config).await?;
//!     eprintln!("{} files, {} errors", summary.files_written(), summary.error_count());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `drugwatch` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! ## Runtime requirements
//!
//! Rendering and extraction need a pdfium shared library (`PDFIUM_LIB_PATH`,
//! the working directory, or the system library). Detection needs the
//! Table-Transformer detection model exported to ONNX.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod catalog;
pub mod clean;
pub mod config;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod run;
pub mod scrape;
pub mod table;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use catalog::{DataLayout, PageCatalog, PageSelection, ReportKind};
pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use error::{PipelineError, StageError};
pub use output::{RunSummary, Stage, StageReport};
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
pub use run::run_pipeline;
pub use table::Table;
