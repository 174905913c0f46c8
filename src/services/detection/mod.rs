// Product detector: YOLO-style ONNX model over the whole shelf photo
//
// Output tensor layout is [1, 4 + classes, anchors]: cx, cy, w, h in model
// input pixels, then one score row per class.

use async_trait::async_trait;
use image::DynamicImage;
use ndarray::Array4;
use ort::value::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument, trace};

use crate::core::config::Config;
use crate::core::errors::{DetectionError, DetectionResult};
use crate::core::types::{Detection, DetectionParams};
use crate::services::onnx_builder::OnnxSessionPool;

/// Object detection seam used by the orchestrator
#[async_trait]
pub trait ObjectDetector: Send + Sync {
    async fn detect(
        &self,
        image: Arc<DynamicImage>,
        params: &DetectionParams,
    ) -> DetectionResult<Vec<Detection>>;
}

/// Box candidate in source-image pixels, corner form
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub xyxy: [f32; 4],
    pub confidence: f32,
    pub class_id: u32,
}

impl Candidate {
    fn area(&self) -> f32 {
        (self.xyxy[2] - self.xyxy[0]).max(0.0) * (self.xyxy[3] - self.xyxy[1]).max(0.0)
    }

    fn into_detection(self, class_names: &[String]) -> Detection {
        let [x1, y1, x2, y2] = self.xyxy;
        Detection {
            bbox: [
                x1.round() as i32,
                y1.round() as i32,
                (x2 - x1).round() as i32,
                (y2 - y1).round() as i32,
            ],
            confidence: self.confidence,
            class_id: self.class_id,
            class_name: class_names
                .get(self.class_id as usize)
                .cloned()
                .unwrap_or_else(|| format!("class_{}", self.class_id)),
        }
    }
}

pub fn calculate_iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = a[2].min(b[2]);
    let y2 = a[3].min(b[3]);

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let intersection = (x2 - x1) * (y2 - y1);
    let area_a = (a[2] - a[0]) * (a[3] - a[1]);
    let area_b = (b[2] - b[0]) * (b[3] - b[1]);
    let union = area_a + area_b - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Greedy non-maximum suppression, highest confidence first
///
/// With `agnostic` set, overlapping boxes suppress each other regardless of class.
pub fn nms(mut candidates: Vec<Candidate>, iou_threshold: f32, agnostic: bool) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<Candidate> = Vec::new();
    let mut suppressed = vec![false; candidates.len()];

    for i in 0..candidates.len() {
        if suppressed[i] {
            continue;
        }
        for j in (i + 1)..candidates.len() {
            if suppressed[j] {
                continue;
            }
            if !agnostic && candidates[i].class_id != candidates[j].class_id {
                continue;
            }
            let iou = calculate_iou(&candidates[i].xyxy, &candidates[j].xyxy);
            if iou > iou_threshold {
                suppressed[j] = true;
                trace!("NMS: suppressed {} (IoU={:.3} with {})", j, iou, i);
            }
        }
        keep.push(candidates[i].clone());
    }

    debug!("NMS: kept {}/{} boxes", keep.len(), candidates.len());
    keep
}

/// Turn raw detector output into final detections
///
/// `scale` maps model input pixels back to source pixels per axis.
pub fn decode_output(
    shape: &[i64],
    data: &[f32],
    scale: (f32, f32),
    params: &DetectionParams,
    class_names: &[String],
) -> DetectionResult<Vec<Detection>> {
    let (rows, anchors) = match shape {
        [1, rows, anchors] if *rows > 4 && *anchors >= 0 => (*rows as usize, *anchors as usize),
        _ => {
            return Err(DetectionError::UnexpectedOutput {
                shape: shape.to_vec(),
            })
        }
    };
    if data.len() < rows * anchors {
        return Err(DetectionError::UnexpectedOutput {
            shape: shape.to_vec(),
        });
    }

    let value = |row: usize, anchor: usize| data[row * anchors + anchor];
    let (scale_x, scale_y) = scale;

    let mut candidates = Vec::new();
    for anchor in 0..anchors {
        let (class_id, confidence) = (4..rows)
            .map(|row| (row - 4, value(row, anchor)))
            .fold((0, f32::MIN), |best, (class, score)| {
                if score > best.1 {
                    (class, score)
                } else {
                    best
                }
            });

        if confidence < params.confidence_threshold {
            continue;
        }

        let (cx, cy, w, h) = (
            value(0, anchor),
            value(1, anchor),
            value(2, anchor),
            value(3, anchor),
        );
        let candidate = Candidate {
            xyxy: [
                (cx - w / 2.0) * scale_x,
                (cy - h / 2.0) * scale_y,
                (cx + w / 2.0) * scale_x,
                (cy + h / 2.0) * scale_y,
            ],
            confidence,
            class_id: class_id as u32,
        };
        if candidate.area() > 0.0 {
            candidates.push(candidate);
        }
    }

    trace!(
        "{} anchors above confidence {:.2}",
        candidates.len(),
        params.confidence_threshold
    );

    let mut kept = nms(candidates, params.iou_threshold, params.agnostic_nms);
    kept.truncate(params.max_detections);

    Ok(kept
        .into_iter()
        .map(|c| c.into_detection(class_names))
        .collect())
}

/// Resize to the square model input and lay out as NCHW in [0, 1]
fn preprocess(img: &DynamicImage, input_size: u32) -> Array4<f32> {
    let resized = img.resize_exact(
        input_size,
        input_size,
        image::imageops::FilterType::Triangle,
    );
    let rgb = resized.to_rgb8();

    let target = input_size as usize;
    let mut array = Array4::<f32>::zeros((1, 3, target, target));
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        array[[0, 0, y, x]] = pixel[0] as f32 / 255.0;
        array[[0, 1, y, x]] = pixel[1] as f32 / 255.0;
        array[[0, 2, y, x]] = pixel[2] as f32 / 255.0;
    }
    array
}

pub struct YoloDetector {
    pool: Arc<OnnxSessionPool>,
    input_size: u32,
    class_names: Arc<Vec<String>>,
}

impl YoloDetector {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let pool = OnnxSessionPool::load(
            Path::new(&config.detection.model_path),
            "Detection",
            config.onnx_pool_size(),
            config.detection.inference_backend.as_deref(),
        )?;

        Ok(Self {
            pool: Arc::new(pool),
            input_size: config.detection.input_size,
            class_names: Arc::new(config.detection.class_names.clone()),
        })
    }

    pub fn device_type(&self) -> &str {
        self.pool.backend()
    }

    fn detect_blocking(
        pool: &OnnxSessionPool,
        img: &DynamicImage,
        input_size: u32,
        params: &DetectionParams,
        class_names: &[String],
    ) -> DetectionResult<Vec<Detection>> {
        let tensor = Value::from_array(preprocess(img, input_size))?;

        let (shape, data) = {
            let mut session = pool.acquire();
            let outputs = session.run(ort::inputs![pool.input_name() => tensor])?;
            let (shape, data) = outputs[pool.output_name()].try_extract_tensor::<f32>()?;
            (shape.to_vec(), data.to_vec())
        };

        let scale = (
            img.width() as f32 / input_size as f32,
            img.height() as f32 / input_size as f32,
        );
        decode_output(&shape, &data, scale, params, class_names)
    }
}

#[async_trait]
impl ObjectDetector for YoloDetector {
    #[instrument(skip(self, image), fields(width = image.width(), height = image.height()))]
    async fn detect(
        &self,
        image: Arc<DynamicImage>,
        params: &DetectionParams,
    ) -> DetectionResult<Vec<Detection>> {
        if image.width() == 0 || image.height() == 0 {
            return Err(DetectionError::InvalidImageSize {
                width: image.width(),
                height: image.height(),
            });
        }

        let start = Instant::now();
        let pool = Arc::clone(&self.pool);
        let class_names = Arc::clone(&self.class_names);
        let input_size = self.input_size;
        let params = *params;

        let detections = tokio::task::spawn_blocking(move || {
            Self::detect_blocking(&pool, &image, input_size, &params, &class_names)
        })
        .await
        .map_err(|e| DetectionError::TaskFailed(e.to_string()))??;

        debug!(
            "✓ Detected {} products in {:.2}ms",
            detections.len(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(detections)
    }
}
