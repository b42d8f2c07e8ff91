//! Progress-callback trait for per-year pipeline events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as each stage walks through the report years. The CLI uses it to
//! drive a progress bar; library callers can forward events anywhere.
//!
//! # Example
//!
//! ```rust
//! use drugwatch::{PipelineConfig, PipelineProgressCallback, Stage};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     years: AtomicUsize,
//! }
//!
//! impl PipelineProgressCallback for CountingCallback {
//!     fn on_year_complete(&self, _stage: Stage, year: u16, files_written: usize) {
//!         self.years.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{year}: {files_written} files");
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback { years: AtomicUsize::new(0) });
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(counter as Arc<dyn PipelineProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use crate::catalog::ReportKind;
use crate::output::{Stage, StageReport};
use std::sync::Arc;

/// Called by the pipeline as it processes each report year.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
pub trait PipelineProgressCallback: Send + Sync {
    /// Called once before a stage starts.
    ///
    /// # Arguments
    /// * `stage`: the stage about to run
    /// * `kind`: the report series
    /// * `total_years`: number of years the stage will visit
    fn on_stage_start(&self, stage: Stage, kind: ReportKind, total_years: usize) {
        let _ = (stage, kind, total_years);
    }

    /// Called when a year finished, even if some pages in it failed.
    fn on_year_complete(&self, stage: Stage, year: u16, files_written: usize) {
        let _ = (stage, year, files_written);
    }

    /// Called when a year is skipped as a whole (missing input, no pages).
    fn on_year_skipped(&self, stage: Stage, year: u16, reason: &str) {
        let _ = (stage, year, reason);
    }

    /// Called once after the stage has visited every year.
    fn on_stage_complete(&self, report: &StageReport) {
        let _ = report;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TrackingCallback {
        stages: AtomicUsize,
        completes: AtomicUsize,
        skips: AtomicUsize,
        files: AtomicUsize,
    }

    impl PipelineProgressCallback for TrackingCallback {
        fn on_stage_start(&self, _stage: Stage, _kind: ReportKind, _total: usize) {
            self.stages.fetch_add(1, Ordering::SeqCst);
        }

        fn on_year_complete(&self, _stage: Stage, _year: u16, files_written: usize) {
            self.completes.fetch_add(1, Ordering::SeqCst);
            self.files.fetch_add(files_written, Ordering::SeqCst);
        }

        fn on_year_skipped(&self, _stage: Stage, _year: u16, _reason: &str) {
            self.skips.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_stage_start(Stage::Render, ReportKind::Antenne, 21);
        cb.on_year_complete(Stage::Render, 2003, 41);
        cb.on_year_skipped(Stage::Render, 2004, "missing");
        cb.on_stage_complete(&StageReport::new(Stage::Render, Some(ReportKind::Antenne)));
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();
        tracker.on_stage_start(Stage::Detect, ReportKind::National, 3);
        tracker.on_year_complete(Stage::Detect, 2010, 4);
        tracker.on_year_complete(Stage::Detect, 2011, 6);
        tracker.on_year_skipped(Stage::Detect, 2012, "no images");

        assert_eq!(tracker.stages.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.skips.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.files.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: Arc<dyn PipelineProgressCallback> = Arc::new(NoopProgressCallback);
        cb.on_stage_start(Stage::Extract, ReportKind::Antenne, 1);
        cb.on_year_complete(Stage::Extract, 2023, 12);
    }
}
