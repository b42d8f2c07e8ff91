//! Stage and run reports.
//!
//! Every stage returns a [`StageReport`] instead of printing as it goes, so
//! the CLI can render a summary or emit JSON and tests can assert on what a
//! stage did.

use crate::catalog::ReportKind;
use crate::error::StageError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// The pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Download,
    Rename,
    Render,
    Detect,
    Extract,
    Clean,
    Scrape,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Download => "download",
            Stage::Rename => "rename",
            Stage::Render => "render",
            Stage::Detect => "detect",
            Stage::Extract => "extract",
            Stage::Clean => "clean",
            Stage::Scrape => "scrape",
        };
        f.write_str(name)
    }
}

/// What one stage did for one report series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: Stage,
    pub kind: Option<ReportKind>,
    /// Years that produced at least a visit (possibly with page errors).
    pub years_processed: Vec<u16>,
    /// Years skipped as a whole.
    pub years_skipped: Vec<u16>,
    /// Every file the stage wrote.
    pub files_written: Vec<PathBuf>,
    /// Non-fatal failures, in the order they happened.
    pub errors: Vec<StageError>,
    pub duration_ms: u64,
}

impl StageReport {
    pub fn new(stage: Stage, kind: Option<ReportKind>) -> Self {
        Self {
            stage,
            kind,
            years_processed: Vec::new(),
            years_skipped: Vec::new(),
            files_written: Vec::new(),
            errors: Vec::new(),
            duration_ms: 0,
        }
    }

    /// Record a skipped year together with its reason.
    pub fn skip(&mut self, year: u16, reason: StageError) {
        tracing::warn!("{}: skipping {}", self.stage, reason);
        self.years_skipped.push(year);
        self.errors.push(reason);
    }

    /// Record a non-fatal failure that does not skip the whole year.
    pub fn fail(&mut self, error: StageError) {
        tracing::warn!("{}: {}", self.stage, error);
        self.errors.push(error);
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Reports of every stage in a [`crate::run::run_pipeline`] call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub stages: Vec<StageReport>,
    pub total_duration_ms: u64,
}

impl RunSummary {
    pub fn files_written(&self) -> usize {
        self.stages.iter().map(|s| s.files_written.len()).sum()
    }

    pub fn error_count(&self) -> usize {
        self.stages.iter().map(|s| s.errors.len()).sum()
    }

    /// The report for `stage` and `kind`, if that stage ran.
    pub fn stage(&self, stage: Stage, kind: ReportKind) -> Option<&StageReport> {
        self.stages
            .iter()
            .find(|s| s.stage == stage && s.kind == Some(kind))
    }
}
