//! End-to-end orchestration of the extraction stages.

use crate::catalog::ReportKind;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::output::{RunSummary, Stage, StageReport};
use crate::pipeline::download::{download_reports, read_link, rename_national_reports};
use crate::pipeline::{detect, extract, render};
use std::time::Instant;
use tracing::info;

/// Download the reports of `kind` from the page named in its link file.
pub async fn download_stage(
    config: &PipelineConfig,
    kind: ReportKind,
) -> Result<StageReport, PipelineError> {
    let url = read_link(&config.layout.link_file(kind))?;
    let folder = config.layout.source_dir(kind);
    let mut report = download_reports(&url, &folder, config.download_timeout_secs).await?;
    report.kind = Some(kind);
    Ok(report)
}

/// Rename the downloaded National reports to `NDM-{year}.pdf`.
pub fn rename_stage(config: &PipelineConfig) -> Result<StageReport, PipelineError> {
    let started = Instant::now();
    let folder = config.layout.source_dir(ReportKind::National);
    let mut report = StageReport::new(Stage::Rename, Some(ReportKind::National));
    let outcome = rename_national_reports(&folder)?;
    for (_, new) in outcome.renamed {
        report.files_written.push(folder.join(new));
    }
    for conflict in outcome.conflicts {
        report.fail(conflict);
    }
    report.duration_ms = started.elapsed().as_millis() as u64;
    Ok(report)
}

/// Run download, rename, render, detect and extract for every configured
/// report kind, one after the other.
///
/// Per-year and per-file problems end up in the returned summary; only
/// errors that make a whole stage impossible are returned as `Err`.
pub async fn run_pipeline(config: &PipelineConfig) -> Result<RunSummary, PipelineError> {
    let started = Instant::now();
    let mut summary = RunSummary::default();

    for &kind in &config.kinds {
        info!("Processing {} reports", kind);
        if !config.skip_download {
            summary.stages.push(download_stage(config, kind).await?);
            if kind == ReportKind::National {
                summary.stages.push(rename_stage(config)?);
            }
        }
        summary.stages.push(render::render_stage(config, kind).await?);
        summary.stages.push(detect::detect_stage(config, kind).await?);
        summary.stages.push(extract::extract_stage(config, kind).await?);
    }

    summary.total_duration_ms = started.elapsed().as_millis() as u64;
    info!(
        "Pipeline finished: {} files, {} errors in {}ms",
        summary.files_written(),
        summary.error_count(),
        summary.total_duration_ms
    );
    Ok(summary)
}
