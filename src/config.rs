//! Configuration for a pipeline run.
//!
//! All run behaviour is controlled through [`PipelineConfig`], built via
//! [`PipelineConfigBuilder`]. Report-specific cleaning values live in
//! [`crate::clean`] settings files instead; this struct only carries what
//! every stage shares.

use crate::catalog::{DataLayout, ReportKind};
use crate::error::PipelineError;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::path::PathBuf;

/// Rendering resolution in dots per inch shared by rendering and extraction.
pub const DEFAULT_DPI: u32 = 200;

/// Minimum class probability for a detection to count as a table.
pub const DEFAULT_THRESHOLD: f32 = 0.9;

/// Configuration for a pipeline run.
///
/// # Example
/// ```rust
/// use drugwatch::{PipelineConfig, ReportKind};
///
/// let config = PipelineConfig::builder()
///     .data_root("./data")
///     .kinds(vec![ReportKind::Antenne])
///     .years(ReportKind::Antenne, 2020..2024)
///     .dpi(200)
///     .build()
///     .unwrap();
/// assert_eq!(config.resolution_constant(), 72.0 / 200.0);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Root of the `data/` tree. Default: `./data`.
    pub layout: DataLayout,

    /// Report series to process, in order. Default: Antenne then National.
    pub kinds: Vec<ReportKind>,

    /// Report years per kind (end exclusive). Default: [`ReportKind::default_years`].
    pub years: BTreeMap<ReportKind, Range<u16>>,

    /// Rendering DPI. Range: 72–600. Default: 200.
    ///
    /// Boxes are detected in render pixels and converted back to PDF points
    /// with `72 / dpi`, so the same value must be used for rendering and
    /// materialisation. Box files record the DPI they were detected at.
    pub dpi: u32,

    /// Detection score threshold. Range: (0, 1). Default: 0.9.
    pub threshold: f32,

    /// Path to the Table-Transformer detection model in ONNX format.
    /// Default: `models/table-transformer-detection.onnx`.
    pub model_path: PathBuf,

    /// Explicit pdfium library path. If None, `PDFIUM_LIB_PATH`, the current
    /// directory and the system library are tried in that order.
    pub pdfium_path: Option<PathBuf>,

    /// HTTP timeout for index pages and report downloads in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Vertical tolerance (points) for grouping text into one table row. Default: 3.0.
    pub row_tolerance: f32,

    /// Horizontal gap (points) that starts a new table column. Default: 8.0.
    pub col_tolerance: f32,

    /// Skip the download stage (reports already on disk). Default: false.
    pub skip_download: bool,

    /// Optional progress observer.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            layout: DataLayout::default(),
            kinds: ReportKind::ALL.to_vec(),
            years: ReportKind::ALL
                .iter()
                .map(|k| (*k, k.default_years()))
                .collect(),
            dpi: DEFAULT_DPI,
            threshold: DEFAULT_THRESHOLD,
            model_path: PathBuf::from("models/table-transformer-detection.onnx"),
            pdfium_path: None,
            download_timeout_secs: 120,
            row_tolerance: 3.0,
            col_tolerance: 8.0,
            skip_download: false,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("layout", &self.layout)
            .field("kinds", &self.kinds)
            .field("years", &self.years)
            .field("dpi", &self.dpi)
            .field("threshold", &self.threshold)
            .field("model_path", &self.model_path)
            .field("pdfium_path", &self.pdfium_path)
            .field("download_timeout_secs", &self.download_timeout_secs)
            .field("row_tolerance", &self.row_tolerance)
            .field("col_tolerance", &self.col_tolerance)
            .field("skip_download", &self.skip_download)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn PipelineProgressCallback>"),
            )
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Factor converting render pixels to PDF points (`72 / dpi`).
    pub fn resolution_constant(&self) -> f32 {
        72.0 / self.dpi as f32
    }

    /// Years to process for `kind`.
    pub fn years_for(&self, kind: ReportKind) -> Range<u16> {
        self.years
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| kind.default_years())
    }

    /// Options handed to the materialisation stage.
    pub fn extract_options(&self) -> ExtractOptions {
        ExtractOptions {
            row_tolerance: self.row_tolerance,
            col_tolerance: self.col_tolerance,
        }
    }
}

/// Geometry tolerances for turning text positions into a grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExtractOptions {
    pub row_tolerance: f32,
    pub col_tolerance: f32,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        PipelineConfig::default().extract_options()
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn data_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.layout = DataLayout::new(root);
        self
    }

    pub fn kinds(mut self, kinds: Vec<ReportKind>) -> Self {
        self.config.kinds = kinds;
        self
    }

    pub fn years(mut self, kind: ReportKind, years: Range<u16>) -> Self {
        self.config.years.insert(kind, years);
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi;
        self
    }

    pub fn threshold(mut self, threshold: f32) -> Self {
        self.config.threshold = threshold;
        self
    }

    pub fn model_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.model_path = path.into();
        self
    }

    pub fn pdfium_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdfium_path = Some(path.into());
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn row_tolerance(mut self, points: f32) -> Self {
        self.config.row_tolerance = points.max(0.1);
        self
    }

    pub fn col_tolerance(mut self, points: f32) -> Self {
        self.config.col_tolerance = points.max(0.1);
        self
    }

    pub fn skip_download(mut self, v: bool) -> Self {
        self.config.skip_download = v;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if !(72..=600).contains(&c.dpi) {
            return Err(PipelineError::InvalidConfig(format!(
                "DPI must be 72–600, got {}",
                c.dpi
            )));
        }
        if !(c.threshold > 0.0 && c.threshold < 1.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "Detection threshold must be in (0, 1), got {}",
                c.threshold
            )));
        }
        if c.kinds.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "At least one report kind is required".into(),
            ));
        }
        for (kind, years) in &c.years {
            if years.is_empty() {
                return Err(PipelineError::InvalidConfig(format!(
                    "Year range for {kind} is empty ({}..{})",
                    years.start, years.end
                )));
            }
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_report_conventions() {
        let c = PipelineConfig::default();
        assert_eq!(c.dpi, 200);
        assert!((c.resolution_constant() - 0.36).abs() < 1e-6);
        assert_eq!(c.years_for(ReportKind::Antenne), 2003..2024);
        assert_eq!(c.years_for(ReportKind::National), 1999..2024);
        assert_eq!(c.kinds, vec![ReportKind::Antenne, ReportKind::National]);
    }

    #[test]
    fn builder_rejects_bad_dpi() {
        let err = PipelineConfig::builder().dpi(30).build().unwrap_err();
        assert!(err.to_string().contains("DPI"));
    }

    #[test]
    fn builder_rejects_bad_threshold() {
        assert!(PipelineConfig::builder().threshold(1.0).build().is_err());
        assert!(PipelineConfig::builder().threshold(0.0).build().is_err());
        assert!(PipelineConfig::builder().threshold(0.7).build().is_ok());
    }

    #[test]
    fn builder_rejects_empty_years() {
        let err = PipelineConfig::builder()
            .years(ReportKind::National, 2010..2010)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("national"));
    }

    #[test]
    fn builder_sets_layout() {
        let c = PipelineConfig::builder().data_root("/tmp/x").build().unwrap();
        assert_eq!(c.layout.root(), std::path::Path::new("/tmp/x"));
    }
}
