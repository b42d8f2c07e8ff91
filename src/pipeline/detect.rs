//! Table localisation on rendered pages.
//!
//! A Table-Transformer (DETR) detection model, exported to ONNX, is run on
//! the CPU through `tract-onnx`. The model sits behind [`TableLocator`] so
//! the stage logic can be exercised without it.
//!
//! The output of this stage is one [`TableBoxes`] JSON file per page image,
//! holding the boxes in render pixels together with the DPI they were
//! rendered at.

use crate::catalog::{DataLayout, ReportKind};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, StageError};
use crate::output::{Stage, StageReport};
use crate::pipeline::render::RenderInfo;
use crate::pipeline::{
    ensure_dir, finish_stage, list_numbered, page_of, start_stage, write_atomic, YearOutcome,
};
use image::imageops::FilterType;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};
use tract_onnx::prelude::*;

type TractPlan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

const SHORTEST_EDGE: f32 = 800.0;
const LONGEST_EDGE: f32 = 1333.0;
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Class names of the table detection model, in logit order.
pub const TABLE_LABELS: &[&str] = &["table", "table rotated"];

// ── Types ────────────────────────────────────────────────────────────────

/// A box in render pixels with the origin at the top-left of the page image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelBox {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

impl PixelBox {
    pub fn width(&self) -> f32 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> f32 {
        self.ymax - self.ymin
    }

    /// Build a corner box from a normalised `(cx, cy, w, h)` box.
    pub fn from_center(cxcywh: [f32; 4], image_width: f32, image_height: f32) -> Self {
        let [cx, cy, w, h] = cxcywh;
        Self {
            xmin: (cx - 0.5 * w) * image_width,
            ymin: (cy - 0.5 * h) * image_height,
            xmax: (cx + 0.5 * w) * image_width,
            ymax: (cy + 0.5 * h) * image_height,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: PixelBox,
    pub score: f32,
    pub label: String,
}

/// The persisted detections of one page image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableBoxes {
    /// 1-based page number.
    pub page: u32,
    /// DPI the page was rendered at.
    pub dpi: u32,
    pub detections: Vec<Detection>,
}

impl TableBoxes {
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let bytes = std::fs::read(path).map_err(|e| PipelineError::ReadFailed {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| PipelineError::InvalidJson {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), PipelineError> {
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| PipelineError::Internal(format!("serialising boxes: {e}")))?;
        write_atomic(path, &bytes)
    }
}

/// Anything that can find tables on a page image.
pub trait TableLocator {
    /// Every candidate table on the page with its score. Thresholding is
    /// left to the caller.
    fn locate(&mut self, image: &DynamicImage) -> Result<Vec<Detection>, PipelineError>;
}

// ── Pre- and post-processing ─────────────────────────────────────────────

/// Target size for the model: shortest edge 800 px, longest at most 1333 px.
pub fn resized_dimensions(width: u32, height: u32) -> (u32, u32) {
    let (w, h) = (width.max(1) as f32, height.max(1) as f32);
    let mut scale = SHORTEST_EDGE / w.min(h);
    if w.max(h) * scale > LONGEST_EDGE {
        scale = LONGEST_EDGE / w.max(h);
    }
    (
        ((w * scale).round() as u32).max(1),
        ((h * scale).round() as u32).max(1),
    )
}

/// Resize and normalise an image into a `1×3×H×W` tensor.
pub fn preprocess(image: &DynamicImage) -> Result<Tensor, PipelineError> {
    let (w, h) = resized_dimensions(image.width(), image.height());
    let rgb = image.resize_exact(w, h, FilterType::Triangle).to_rgb8();
    let (w, h) = (w as usize, h as usize);

    let mut data = vec![0f32; 3 * h * w];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            let v = pixel.0[c] as f32 / 255.0;
            data[c * h * w + y * w + x] = (v - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }

    tract_ndarray::Array4::from_shape_vec((1, 3, h, w), data)
        .map(Tensor::from)
        .map_err(|e| PipelineError::Inference(format!("input tensor: {e}")))
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Turn per-query logits and normalised boxes into detections.
///
/// The last logit of each query is the "no object" class and is dropped
/// after the softmax. Queries whose best score is not above `threshold`
/// are discarded.
pub fn post_process_detections(
    logits: &[Vec<f32>],
    boxes: &[[f32; 4]],
    image_width: u32,
    image_height: u32,
    threshold: f32,
    labels: &[&str],
) -> Vec<Detection> {
    logits
        .iter()
        .zip(boxes)
        .filter_map(|(query, bbox)| {
            if query.len() < 2 {
                return None;
            }
            let probs = softmax(query);
            let (class, score) = probs[..probs.len() - 1]
                .iter()
                .copied()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (i, p)| if p > best.1 { (i, p) } else { best });
            if score <= threshold {
                return None;
            }
            let label = labels
                .get(class)
                .map(|l| l.to_string())
                .unwrap_or_else(|| format!("class {class}"));
            Some(Detection {
                bbox: PixelBox::from_center(*bbox, image_width as f32, image_height as f32),
                score,
                label,
            })
        })
        .collect()
}

// ── DETR locator ─────────────────────────────────────────────────────────

/// Table-Transformer detection model run with tract.
///
/// tract optimises for a fixed input shape, so a runnable plan is built
/// per distinct input size and cached. Pages of one report usually share
/// a single size.
pub struct DetrLocator {
    model: InferenceModel,
    model_path: PathBuf,
    plans: HashMap<(usize, usize), TractPlan>,
}

impl DetrLocator {
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        if !path.exists() {
            return Err(PipelineError::ModelLoad {
                path: path.to_path_buf(),
                detail: "file not found; export microsoft/table-transformer-detection to ONNX"
                    .into(),
            });
        }
        let model = tract_onnx::onnx()
            .model_for_path(path)
            .map_err(|e| PipelineError::ModelLoad {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;
        info!("Loaded table detection model {}", path.display());
        Ok(Self {
            model,
            model_path: path.to_path_buf(),
            plans: HashMap::new(),
        })
    }

    fn plan_for(&mut self, h: usize, w: usize) -> Result<&TractPlan, PipelineError> {
        if !self.plans.contains_key(&(h, w)) {
            debug!("Optimising model for input {}x{}", w, h);
            let plan = self
                .model
                .clone()
                .with_input_fact(0, f32::fact([1, 3, h, w]).into())
                .and_then(|m| m.into_optimized())
                .and_then(|m| m.into_runnable())
                .map_err(|e| PipelineError::ModelLoad {
                    path: self.model_path.clone(),
                    detail: e.to_string(),
                })?;
            self.plans.insert((h, w), plan);
        }
        self.plans
            .get(&(h, w))
            .ok_or_else(|| PipelineError::Internal("plan cache".into()))
    }
}

impl TableLocator for DetrLocator {
    fn locate(&mut self, image: &DynamicImage) -> Result<Vec<Detection>, PipelineError> {
        let input = preprocess(image)?;
        let (h, w) = (input.shape()[2], input.shape()[3]);
        let plan = self.plan_for(h, w)?;

        let outputs = plan
            .run(tvec!(input.into()))
            .map_err(|e| PipelineError::Inference(e.to_string()))?;
        if outputs.len() < 2 {
            return Err(PipelineError::Inference(format!(
                "expected logits and boxes, model returned {} outputs",
                outputs.len()
            )));
        }

        let (mut logits, mut boxes) = (f32_view(&outputs[0])?, f32_view(&outputs[1])?);
        if logits.shape().last() == Some(&4) && boxes.shape().last() != Some(&4) {
            std::mem::swap(&mut logits, &mut boxes);
        }
        let (ls, bs) = (logits.shape(), boxes.shape());
        if ls.len() != 3 || bs.len() != 3 || bs[2] != 4 || ls[1] != bs[1] {
            return Err(PipelineError::Inference(format!(
                "unexpected output shapes {ls:?} and {bs:?}"
            )));
        }

        let queries = ls[1];
        let logits: Vec<Vec<f32>> = (0..queries)
            .map(|q| (0..ls[2]).map(|c| logits[[0, q, c]]).collect())
            .collect();
        let boxes: Vec<[f32; 4]> = (0..queries)
            .map(|q| [boxes[[0, q, 0]], boxes[[0, q, 1]], boxes[[0, q, 2]], boxes[[0, q, 3]]])
            .collect();

        Ok(post_process_detections(
            &logits,
            &boxes,
            image.width(),
            image.height(),
            0.0,
            TABLE_LABELS,
        ))
    }
}

fn f32_view(value: &TValue) -> Result<tract_ndarray::ArrayViewD<'_, f32>, PipelineError> {
    value
        .to_array_view::<f32>()
        .map_err(|e| PipelineError::Inference(e.to_string()))
}

// ── Stage ────────────────────────────────────────────────────────────────

/// Detect tables on every page image of one year and write `{page}.json`.
///
/// Boxes carry the DPI recorded by the render stage; `dpi` is only used for
/// image directories that have no render info.
pub fn detect_report(
    layout: &DataLayout,
    kind: ReportKind,
    year: u16,
    locator: &mut dyn TableLocator,
    threshold: f32,
    dpi: u32,
) -> Result<YearOutcome, PipelineError> {
    let images_dir = layout.images_dir(kind, year);
    if !images_dir.is_dir() {
        return Ok(YearOutcome::Skipped(StageError::MissingInput {
            year,
            path: images_dir,
        }));
    }
    let images = list_numbered(&images_dir, "png")?;
    let dpi = match RenderInfo::load(&images_dir)? {
        Some(info) => {
            if info.dpi != dpi {
                info!("{} images were rendered at {} dpi, not {}", year, info.dpi, dpi);
            }
            info.dpi
        }
        None => {
            debug!("No render info in {}, assuming {} dpi", images_dir.display(), dpi);
            dpi
        }
    };
    let out_dir = layout.boxes_dir(kind, year);
    ensure_dir(&out_dir)?;

    let mut files = Vec::new();
    let mut errors = Vec::new();
    for image_path in images {
        let Some(page) = page_of(&image_path) else {
            debug!("Ignoring {}", image_path.display());
            continue;
        };
        match detect_page(&image_path, page, locator, threshold, dpi) {
            Ok(boxes) => {
                debug!("{} page {}: {} tables", year, page, boxes.detections.len());
                let path = out_dir.join(format!("{page}.json"));
                boxes.save(&path)?;
                files.push(path);
            }
            Err(e) => {
                warn!("{} page {}: {}", year, page, e);
                errors.push(StageError::PageFailed {
                    year,
                    page,
                    detail: e.to_string(),
                });
            }
        }
    }
    Ok(YearOutcome::Done { files, errors })
}

fn detect_page(
    image_path: &Path,
    page: u32,
    locator: &mut dyn TableLocator,
    threshold: f32,
    dpi: u32,
) -> Result<TableBoxes, PipelineError> {
    let image = image::open(image_path).map_err(|e| PipelineError::ReadFailed {
        path: image_path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
    })?;
    let mut detections = locator.locate(&image)?;
    detections.retain(|d| d.score > threshold);
    Ok(TableBoxes {
        page,
        dpi,
        detections,
    })
}

/// Detect tables for every configured year of `kind` with the model from
/// the config.
pub async fn detect_stage(
    config: &PipelineConfig,
    kind: ReportKind,
) -> Result<StageReport, PipelineError> {
    let path = config.model_path.clone();
    let locator = tokio::task::spawn_blocking(move || DetrLocator::load(&path))
        .await
        .map_err(|e| PipelineError::Internal(format!("Model load task panicked: {e}")))??;
    detect_stage_with(config, kind, Box::new(locator)).await
}

/// Like [`detect_stage`] with a caller-supplied locator.
pub async fn detect_stage_with(
    config: &PipelineConfig,
    kind: ReportKind,
    mut locator: Box<dyn TableLocator + Send>,
) -> Result<StageReport, PipelineError> {
    let started = Instant::now();
    let years = config.years_for(kind);
    let cb = config.progress_callback.clone();
    let report = start_stage(Stage::Detect, kind, years.len(), cb.as_ref());

    let layout = config.layout.clone();
    let (threshold, dpi) = (config.threshold, config.dpi);
    let report = tokio::task::spawn_blocking(move || -> Result<StageReport, PipelineError> {
        let mut report = report;
        for year in years {
            detect_report(&layout, kind, year, locator.as_mut(), threshold, dpi)?
                .record(year, &mut report, cb.as_ref());
        }
        Ok(report)
    })
    .await
    .map_err(|e| PipelineError::Internal(format!("Detect task panicked: {e}")))??;

    Ok(finish_stage(report, started, config.progress_callback.as_ref()))
}
