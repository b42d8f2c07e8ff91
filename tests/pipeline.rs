//! Integration tests for drugwatch.
//!
//! The offline tests run every stage that needs neither pdfium, the
//! detection model nor the network. The rest are gated behind the
//! `E2E_ENABLED` environment variable.
//!
//! Run the gated tests with:
//!   E2E_ENABLED=1 DRUGWATCH_TEST_PDF=report.pdf DRUGWATCH_MODEL=tatr.onnx \
//!     cargo test --test pipeline -- --nocapture

use drugwatch::clean::antenne::{clean_antenne_reports, AntenneCleaningPlan};
use drugwatch::clean::national::{build_joint_incidents, NationalCleaningPlan};
use drugwatch::pipeline::detect::{
    detect_stage, detect_stage_with, Detection, PixelBox, TableBoxes, TableLocator,
};
use drugwatch::pipeline::{extract, render};
use drugwatch::{
    DataLayout, PipelineConfig, PipelineError, PipelineProgressCallback, ReportKind, RunSummary,
    Stage, StageError, StageReport, Table,
};
use image::{DynamicImage, Rgb, RgbImage};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// ── Test helpers ─────────────────────────────────────────────────────────────

/// Skip this test unless E2E_ENABLED is set and `$var` names an existing file.
macro_rules! e2e_skip_unless_ready {
    ($var:expr) => {{
        if std::env::var("E2E_ENABLED").is_err() {
            println!("SKIP: set E2E_ENABLED=1 to run e2e tests");
            return;
        }
        let Ok(p) = std::env::var($var) else {
            println!("SKIP: {} is not set", $var);
            return;
        };
        let p = PathBuf::from(p);
        if !p.exists() {
            println!("SKIP: file not found: {}", p.display());
            return;
        }
        p
    }};
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn s(v: &[&str]) -> Vec<String> {
    v.iter().map(|x| x.to_string()).collect()
}

fn write_page_image(layout: &DataLayout, kind: ReportKind, year: u16, page: u32) {
    let dir = layout.images_dir(kind, year);
    std::fs::create_dir_all(&dir).unwrap();
    let image = RgbImage::from_pixel(300, 400, Rgb([255, 255, 255]));
    image.save(dir.join(format!("{page}.png"))).unwrap();
}

/// One table in the upper half of the page and one weak candidate.
struct HalfPageLocator;

impl TableLocator for HalfPageLocator {
    fn locate(&mut self, image: &DynamicImage) -> Result<Vec<Detection>, PipelineError> {
        let (w, h) = (image.width() as f32, image.height() as f32);
        Ok(vec![
            Detection {
                bbox: PixelBox {
                    xmin: 0.1 * w,
                    ymin: 0.1 * h,
                    xmax: 0.9 * w,
                    ymax: 0.5 * h,
                },
                score: 0.97,
                label: "table".into(),
            },
            Detection {
                bbox: PixelBox {
                    xmin: 0.0,
                    ymin: 0.6 * h,
                    xmax: w,
                    ymax: 0.7 * h,
                },
                score: 0.4,
                label: "table".into(),
            },
        ])
    }
}

#[derive(Default)]
struct CountingCallback {
    completed: AtomicUsize,
    skipped: AtomicUsize,
}

impl PipelineProgressCallback for CountingCallback {
    fn on_year_complete(&self, _stage: Stage, _year: u16, _files: usize) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_year_skipped(&self, _stage: Stage, _year: u16, _reason: &str) {
        self.skipped.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Offline stages ───────────────────────────────────────────────────────────

#[tokio::test]
async fn detection_writes_thresholded_boxes() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let counter = Arc::new(CountingCallback::default());
    let config = PipelineConfig::builder()
        .data_root(dir.path())
        .kinds(vec![ReportKind::Antenne])
        .years(ReportKind::Antenne, 2021..2023)
        .progress_callback(counter.clone() as Arc<dyn PipelineProgressCallback>)
        .build()
        .unwrap();
    write_page_image(&config.layout, ReportKind::Antenne, 2021, 205);
    write_page_image(&config.layout, ReportKind::Antenne, 2021, 206);

    let report = detect_stage_with(&config, ReportKind::Antenne, Box::new(HalfPageLocator))
        .await
        .unwrap();

    assert_eq!(report.stage, Stage::Detect);
    assert_eq!(report.years_processed, vec![2021]);
    assert_eq!(report.years_skipped, vec![2022]);
    assert_eq!(report.files_written.len(), 2);
    assert_eq!(counter.completed.load(Ordering::SeqCst), 1);
    assert_eq!(counter.skipped.load(Ordering::SeqCst), 1);

    let boxes = TableBoxes::load(
        &config
            .layout
            .boxes_dir(ReportKind::Antenne, 2021)
            .join("205.json"),
    )
    .unwrap();
    assert_eq!(boxes.page, 205);
    assert_eq!(boxes.dpi, 200);
    assert_eq!(boxes.detections.len(), 1);

    // 300 px at 200 dpi is 108 pt wide.
    let rect = boxes.detections[0].bbox.to_points(boxes.dpi);
    assert!((rect.left - 10.8).abs() < 1e-3);
    assert!((rect.right - 97.2).abs() < 1e-3);
}

#[tokio::test]
async fn stages_skip_years_without_input() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::builder()
        .data_root(dir.path())
        .kinds(vec![ReportKind::Antenne])
        .years(ReportKind::Antenne, 2019..2021)
        .build()
        .unwrap();

    let rendered = render::render_stage(&config, ReportKind::Antenne)
        .await
        .unwrap();
    assert_eq!(rendered.years_skipped, vec![2019, 2020]);
    assert!(matches!(
        rendered.errors[0],
        StageError::MissingReport { year: 2019, .. }
    ));

    let extracted = extract::extract_stage(&config, ReportKind::Antenne)
        .await
        .unwrap();
    assert_eq!(extracted.years_skipped, vec![2019, 2020]);
    assert!(extracted.files_written.is_empty());
}

#[tokio::test]
async fn national_render_needs_a_catalog() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::builder()
        .data_root(dir.path())
        .kinds(vec![ReportKind::National])
        .build()
        .unwrap();
    let err = render::render_stage(&config, ReportKind::National)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::FileNotFound { .. }));
}

// ── Cleaning ─────────────────────────────────────────────────────────────────

#[test]
fn antenne_purity_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    let raw = layout.raw_csv_dir(ReportKind::Antenne, 2023);
    Table::from_records(
        "227_0.csv",
        vec![
            s(&["", "uitsluitend", "voornamelijk", "ander", "overige", "geen"]),
            s(&["", "n %", "n %", "n %", "n %", "n"]),
            s(&["2021", "700 90%", "50 6%", "10 1%", "20 3%", "5"]),
            s(&["2022", "650 88%", "", "", "", "3"]),
        ],
    )
    .write_csv(&raw.join("227_0.csv"))
    .unwrap();

    let report = clean_antenne_reports(&layout, &AntenneCleaningPlan::builtin_2023()).unwrap();
    let out = layout
        .processed_dir(ReportKind::Antenne)
        .join("mdma_purity_2023.csv");
    assert_eq!(report.files_written, vec![out.clone()]);

    let cleaned = Table::read_csv(&out).unwrap();
    assert_eq!(cleaned.len(), 3);
    assert_eq!(cleaned.column("year").unwrap(), vec!["2021", "2022", "2023"]);
    assert_eq!(cleaned.column("no_analysis").unwrap(), vec!["5", "3", "35"]);
    assert_eq!(cleaned.column("N_exclusively_mdma").unwrap(), vec!["700", "650", "791"]);
    assert_eq!(cleaned.column("exclusively_mdma_pct").unwrap()[2], "97");
    assert_eq!(cleaned.column("primarily_mdma_pct").unwrap(), vec!["6", "0", "0"]);
}

#[test]
fn plans_load_from_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plan.json");

    let mut plan = NationalCleaningPlan::builtin();
    plan.drop_years.clear();
    std::fs::write(&path, serde_json::to_string(&plan).unwrap()).unwrap();
    assert_eq!(NationalCleaningPlan::load(&path).unwrap(), plan);

    let mut antenne = AntenneCleaningPlan::builtin_2023();
    antenne.year = 2024;
    std::fs::write(&path, serde_json::to_string(&antenne).unwrap()).unwrap();
    assert_eq!(AntenneCleaningPlan::load(&path).unwrap().year, 2024);
}

#[test]
fn national_without_listing_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    let err =
        build_joint_incidents(&layout, dir.path(), &NationalCleaningPlan::builtin()).unwrap_err();
    assert!(matches!(err, PipelineError::FileNotFound { .. }));
}

#[test]
fn summary_serialises_for_the_cli() {
    let mut report = StageReport::new(Stage::Render, Some(ReportKind::Antenne));
    report.skip(2003, StageError::NoPages { year: 2003 });
    let summary = RunSummary {
        stages: vec![report],
        total_duration_ms: 12,
    };
    let json = serde_json::to_value(&summary).unwrap();
    assert_eq!(json["stages"][0]["stage"], "render");
    assert_eq!(json["stages"][0]["kind"], "antenne");
    assert_eq!(json["stages"][0]["years_skipped"][0], 2003);
}

// ── E2E (pdfium, model) ──────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_render_detect_extract() {
    let pdf = e2e_skip_unless_ready!("DRUGWATCH_TEST_PDF");
    init_tracing();
    let model = std::env::var("DRUGWATCH_MODEL").ok().map(PathBuf::from);

    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    let target = layout.report_pdf(ReportKind::National, 2019);
    std::fs::create_dir_all(target.parent().unwrap()).unwrap();
    std::fs::copy(&pdf, &target).unwrap();
    std::fs::write(
        layout.catalog_file(ReportKind::National),
        r#"{"2019": [1, 2]}"#,
    )
    .unwrap();

    let mut builder = PipelineConfig::builder()
        .data_root(dir.path())
        .kinds(vec![ReportKind::National])
        .years(ReportKind::National, 2019..2020);
    if let Some(ref m) = model {
        builder = builder.model_path(m);
    }
    let config = builder.build().unwrap();

    let rendered = render::render_stage(&config, ReportKind::National)
        .await
        .unwrap();
    assert_eq!(rendered.files_written.len(), 2, "{:?}", rendered.errors);

    if model.is_none() {
        println!("SKIP detection: DRUGWATCH_MODEL is not set");
        return;
    }
    let detected = detect_stage(&config, ReportKind::National).await.unwrap();
    assert_eq!(detected.files_written.len(), 2);

    let extracted = extract::extract_stage(&config, ReportKind::National)
        .await
        .unwrap();
    println!("{} tables extracted", extracted.files_written.len());
    assert!(extracted.errors.is_empty(), "{:?}", extracted.errors);
}
