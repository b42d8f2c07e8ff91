//! CLI binary for drugwatch.
//!
//! A thin shim over the library crate: every subcommand maps its flags to a
//! `PipelineConfig` or a cleaning plan, runs one stage (or all of them) and
//! prints the resulting stage reports.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use drugwatch::clean::antenne::{clean_antenne_reports, AntenneCleaningPlan};
use drugwatch::clean::national::{build_joint_incidents, NationalCleaningPlan};
use drugwatch::pipeline::{detect, extract, render};
use drugwatch::run::{download_stage, rename_stage};
use drugwatch::scrape::{tables_to_csv, DEFAULT_EUDA_URL, DEFAULT_STEM};
use drugwatch::{
    run_pipeline, PipelineConfig, PipelineProgressCallback, ProgressCallback, ReportKind,
    RunSummary, Stage, StageReport,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// One bar per stage, advanced once per report year.
struct CliProgressCallback {
    bar: ProgressBar,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_stage_start(&self, stage: Stage, kind: ReportKind, total_years: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}/{len} years  \
             ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);
        self.bar.set_style(style);
        self.bar.set_length(total_years as u64);
        self.bar.set_position(0);
        self.bar.set_prefix(format!("{stage} {kind}"));
        self.bar.reset_elapsed();
    }

    fn on_year_complete(&self, _stage: Stage, year: u16, files_written: usize) {
        self.bar.println(format!(
            "  {} {}  {}",
            green("✓"),
            year,
            dim(&format!("{files_written} files"))
        ));
        self.bar.inc(1);
    }

    fn on_year_skipped(&self, _stage: Stage, year: u16, reason: &str) {
        self.bar
            .println(format!("  {} {}  {}", dim("–"), year, dim(reason)));
        self.bar.inc(1);
    }

    fn on_stage_complete(&self, report: &StageReport) {
        self.bar.println(format!(
            "{} {}  {} years, {} files, {} errors",
            if report.errors.is_empty() {
                green("✔")
            } else {
                cyan("⚠")
            },
            bold(&report.stage.to_string()),
            report.years_processed.len(),
            report.files_written.len(),
            report.errors.len(),
        ));
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Everything for the Antenne reports, PDFs already downloaded
  drugwatch run --kind antenne --skip-download

  # Only render and detect a few National report years
  drugwatch render --kind national --years 2015-2019
  drugwatch detect --kind national --years 2015-2019 --model models/tatr.onnx

  # Clean the extracted tables
  drugwatch clean-antenne
  drugwatch clean-national --settings-dir data/source/national_drug_monitor

  # Supplementary EUDA tables
  drugwatch euda

DATA LAYOUT (under --data-root, default ./data):
  source/<kind>/                         PDFs, original_link.txt, page catalog
  intermediate/<kind>_to_images/         rendered pages  {page}.png
  intermediate/<kind>_table_tensors/     detected boxes  {page}.json
  intermediate/<kind>_raw_csvs/          raw tables      {page}_{index}.csv
  processed/                             cleaned tables

ENVIRONMENT VARIABLES:
  PDFIUM_LIB_PATH   Path to libpdfium (file or directory)
  RUST_LOG          Log filter, overrides --verbose / --quiet
"#;

/// Extract and clean the tables of Dutch drug-monitoring reports.
#[derive(Parser, Debug)]
#[command(
    name = "drugwatch",
    version,
    about = "Extract and clean the tables of Dutch drug-monitoring reports",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Root of the data tree.
    #[arg(long, global = true, env = "DRUGWATCH_DATA_ROOT", default_value = "data")]
    data_root: PathBuf,

    /// Print the stage reports as JSON on stdout.
    #[arg(long, global = true, env = "DRUGWATCH_JSON")]
    json: bool,

    /// Disable the progress bar.
    #[arg(long, global = true, env = "DRUGWATCH_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "DRUGWATCH_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "DRUGWATCH_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download every PDF linked from the publications page of a report kind.
    Download(StageArgs),
    /// Rename downloaded National reports to NDM-{year}.pdf.
    Rename,
    /// Render catalogued pages to PNG.
    Render(StageArgs),
    /// Detect table boxes on the rendered pages.
    Detect(StageArgs),
    /// Rebuild the detected tables from the PDF text and write raw CSVs.
    Extract(StageArgs),
    /// Clean the Antenne testservice tables.
    CleanAntenne(CleanAntenneArgs),
    /// Build joint_incidents.csv from the National report tables.
    CleanNational(CleanNationalArgs),
    /// Scrape the supplementary EUDA tables.
    Euda(EudaArgs),
    /// Download, render, detect and extract for the selected kinds.
    Run(RunArgs),
}

#[derive(Args, Debug, Clone)]
struct StageArgs {
    /// Report series.
    #[arg(long, env = "DRUGWATCH_KIND", default_value = "antenne", value_parser = parse_kind)]
    kind: ReportKind,

    /// Years to process: `2019` or `2015-2019` (inclusive).
    #[arg(long, env = "DRUGWATCH_YEARS", value_parser = parse_years)]
    years: Option<Range<u16>>,

    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Args, Debug, Clone)]
struct EngineArgs {
    /// Rendering DPI (72–600). Use the same value for render, detect and extract.
    #[arg(long, env = "DRUGWATCH_DPI", default_value_t = 200,
          value_parser = clap::value_parser!(u32).range(72..=600))]
    dpi: u32,

    /// Detection score threshold (0–1).
    #[arg(long, env = "DRUGWATCH_THRESHOLD", default_value_t = 0.9)]
    threshold: f32,

    /// Table-Transformer detection model in ONNX format.
    #[arg(long, env = "DRUGWATCH_MODEL", default_value = "models/table-transformer-detection.onnx")]
    model: PathBuf,

    /// Path to libpdfium; falls back to PDFIUM_LIB_PATH, ./ and the system library.
    #[arg(long, env = "DRUGWATCH_PDFIUM")]
    pdfium: Option<PathBuf>,

    /// HTTP timeout in seconds.
    #[arg(long, env = "DRUGWATCH_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Vertical tolerance in points for grouping text into rows.
    #[arg(long, env = "DRUGWATCH_ROW_TOLERANCE", default_value_t = 3.0)]
    row_tolerance: f32,

    /// Horizontal gap in points that separates columns.
    #[arg(long, env = "DRUGWATCH_COL_TOLERANCE", default_value_t = 8.0)]
    col_tolerance: f32,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Report series; repeat for several. Default: all.
    #[arg(long, value_parser = parse_kind)]
    kind: Vec<ReportKind>,

    /// Years to process for every selected kind.
    #[arg(long, env = "DRUGWATCH_YEARS", value_parser = parse_years)]
    years: Option<Range<u16>>,

    /// Reports are already on disk.
    #[arg(long, env = "DRUGWATCH_SKIP_DOWNLOAD")]
    skip_download: bool,

    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Args, Debug)]
struct CleanAntenneArgs {
    /// JSON cleaning plan; the built-in 2023 plan when absent.
    #[arg(long, env = "DRUGWATCH_ANTENNE_PLAN")]
    plan: Option<PathBuf>,

    /// Write the built-in plan as JSON to stdout and exit.
    #[arg(long)]
    print_plan: bool,
}

#[derive(Args, Debug)]
struct CleanNationalArgs {
    /// Directory holding incidents_datasets.json and incidents_columns_mapping.json.
    #[arg(long, env = "DRUGWATCH_NATIONAL_SETTINGS")]
    settings_dir: Option<PathBuf>,

    /// JSON cleaning plan; the built-in quirks when absent.
    #[arg(long, env = "DRUGWATCH_NATIONAL_PLAN")]
    plan: Option<PathBuf>,

    /// Write the built-in plan as JSON to stdout and exit.
    #[arg(long)]
    print_plan: bool,
}

#[derive(Args, Debug)]
struct EudaArgs {
    /// Page to scrape.
    #[arg(long, env = "DRUGWATCH_EUDA_URL", default_value = DEFAULT_EUDA_URL)]
    url: String,

    /// File name stem of the written tables.
    #[arg(long, default_value = DEFAULT_STEM)]
    stem: String,

    /// HTTP timeout in seconds.
    #[arg(long, env = "DRUGWATCH_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,
}

fn parse_kind(s: &str) -> Result<ReportKind, String> {
    s.parse().map_err(|e: drugwatch::PipelineError| e.to_string())
}

/// `2019` → `2019..2020`, `2015-2019` → `2015..2020`.
fn parse_years(s: &str) -> Result<Range<u16>, String> {
    let year = |v: &str| {
        v.trim()
            .parse::<u16>()
            .map_err(|_| format!("invalid year '{v}'"))
    };
    let (start, end) = match s.split_once('-') {
        Some((a, b)) => (year(a)?, year(b)?),
        None => {
            let y = year(s)?;
            (y, y)
        }
    };
    if end < start {
        return Err(format!("year range {start}-{end} is reversed"));
    }
    let stop = end
        .checked_add(1)
        .ok_or_else(|| format!("year {end} is out of range"))?;
    Ok(start..stop)
}

fn build_config(
    cli: &Cli,
    kinds: Vec<ReportKind>,
    years: Option<Range<u16>>,
    engine: &EngineArgs,
    skip_download: bool,
    progress: Option<ProgressCallback>,
) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .data_root(&cli.data_root)
        .dpi(engine.dpi)
        .threshold(engine.threshold)
        .model_path(&engine.model)
        .download_timeout_secs(engine.download_timeout)
        .row_tolerance(engine.row_tolerance)
        .col_tolerance(engine.col_tolerance)
        .skip_download(skip_download);
    if let Some(years) = years {
        for &kind in &kinds {
            builder = builder.years(kind, years.clone());
        }
    }
    builder = builder.kinds(kinds);
    if let Some(ref path) = engine.pdfium {
        builder = builder.pdfium_path(path);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }
    builder.build().context("Invalid configuration")
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialise output")?
    );
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    for report in &summary.stages {
        let kind = report.kind.map(|k| k.to_string()).unwrap_or_default();
        eprintln!(
            "{} {:<8} {:<9} {:>3} years  {:>3} skipped  {:>4} files  {}",
            if report.errors.is_empty() {
                green("✔")
            } else {
                cyan("⚠")
            },
            report.stage.to_string(),
            kind,
            report.years_processed.len(),
            report.years_skipped.len(),
            report.files_written.len(),
            dim(&format!("{}ms", report.duration_ms)),
        );
        for e in &report.errors {
            eprintln!("    {} {}", red("✗"), e);
        }
    }
    eprintln!(
        "{} files, {} errors in {}ms",
        bold(&summary.files_written().to_string()),
        summary.error_count(),
        summary.total_duration_ms
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "warn"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let progress: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn PipelineProgressCallback>)
    } else {
        None
    };

    let mut summary = RunSummary::default();
    match &cli.command {
        Command::Download(args) => {
            let config = build_config(&cli, vec![args.kind], args.years.clone(), &args.engine, false, None)?;
            let report = download_stage(&config, args.kind)
                .await
                .with_context(|| format!("Download of {} reports failed", args.kind))?;
            summary.stages.push(report);
        }
        Command::Rename => {
            let config = PipelineConfig::builder()
                .data_root(&cli.data_root)
                .build()
                .context("Invalid configuration")?;
            summary
                .stages
                .push(rename_stage(&config).context("Renaming National reports failed")?);
        }
        Command::Render(args) | Command::Detect(args) | Command::Extract(args) => {
            let config = build_config(
                &cli,
                vec![args.kind],
                args.years.clone(),
                &args.engine,
                false,
                progress.clone(),
            )?;
            let report = match &cli.command {
                Command::Render(_) => render::render_stage(&config, args.kind).await,
                Command::Detect(_) => detect::detect_stage(&config, args.kind).await,
                _ => extract::extract_stage(&config, args.kind).await,
            }
            .with_context(|| format!("{} stage failed", args.kind))?;
            summary.stages.push(report);
        }
        Command::CleanAntenne(args) => {
            if args.print_plan {
                return print_json(&AntenneCleaningPlan::builtin_2023());
            }
            let plan = match &args.plan {
                Some(path) => AntenneCleaningPlan::load(path)
                    .with_context(|| format!("Failed to read plan {}", path.display()))?,
                None => AntenneCleaningPlan::builtin_2023(),
            };
            let layout = drugwatch::DataLayout::new(&cli.data_root);
            summary
                .stages
                .push(clean_antenne_reports(&layout, &plan).context("Antenne cleaning failed")?);
        }
        Command::CleanNational(args) => {
            if args.print_plan {
                return print_json(&NationalCleaningPlan::builtin());
            }
            let plan = match &args.plan {
                Some(path) => NationalCleaningPlan::load(path)
                    .with_context(|| format!("Failed to read plan {}", path.display()))?,
                None => NationalCleaningPlan::builtin(),
            };
            let layout = drugwatch::DataLayout::new(&cli.data_root);
            let settings_dir = args
                .settings_dir
                .clone()
                .unwrap_or_else(|| layout.source_dir(ReportKind::National));
            summary.stages.push(
                build_joint_incidents(&layout, &settings_dir, &plan)
                    .context("National cleaning failed")?,
            );
        }
        Command::Euda(args) => {
            let layout = drugwatch::DataLayout::new(&cli.data_root);
            let report = tables_to_csv(&args.url, &layout.euda_dir(), &args.stem, args.download_timeout)
                .await
                .with_context(|| format!("Scraping {} failed", args.url))?;
            summary.stages.push(report);
        }
        Command::Run(args) => {
            let kinds = if args.kind.is_empty() {
                ReportKind::ALL.to_vec()
            } else {
                args.kind.clone()
            };
            let config = build_config(
                &cli,
                kinds,
                args.years.clone(),
                &args.engine,
                args.skip_download,
                progress.clone(),
            )?;
            summary = run_pipeline(&config).await.context("Pipeline run failed")?;
        }
    }

    if summary.total_duration_ms == 0 {
        summary.total_duration_ms = summary.stages.iter().map(|s| s.duration_ms).sum();
    }

    if cli.json {
        print_json(&summary)?;
    } else if !cli.quiet {
        print_summary(&summary);
    }

    if summary.stages.iter().all(|s| s.files_written.is_empty()) && summary.error_count() > 0 {
        bail!("Nothing was written ({} errors)", summary.error_count());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn years_parse_inclusive() {
        assert_eq!(parse_years("2019"), Ok(2019..2020));
        assert_eq!(parse_years("2015-2019"), Ok(2015..2020));
        assert_eq!(parse_years(" 2003 - 2004 "), Ok(2003..2005));
    }

    #[test]
    fn bad_years_are_rejected() {
        assert!(parse_years("2019-2015").is_err());
        assert!(parse_years("twenty").is_err());
        assert!(parse_years("65535").is_err());
        assert!(parse_years("2020-65535").is_err());
        assert_eq!(parse_years("65534"), Ok(65534..65535));
    }
}
