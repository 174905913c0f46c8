// Local fresh/rotten classifier for perishable crops
//
// Input is a square ImageNet-normalized RGB tensor. A single output logit is
// read through a sigmoid; two logits through a softmax with index 1 = rotten.

use async_trait::async_trait;
use image::DynamicImage;
use ndarray::Array4;
use ort::value::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::core::config::Config;
use crate::core::errors::{ClassificationError, ClassificationResult};
use crate::core::types::FreshnessLabel;
use crate::services::onnx_builder::OnnxSessionPool;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Freshness classification seam
///
/// Returns the label and the probability that the item is rotten.
#[async_trait]
pub trait FreshnessClassifier: Send + Sync {
    async fn classify(
        &self,
        image: DynamicImage,
        threshold: f32,
    ) -> ClassificationResult<(FreshnessLabel, f32)>;
}

/// Map raw logits to (label, rotten probability)
///
/// The item is fresh only when its fresh probability reaches `threshold`.
pub fn interpret_logits(logits: &[f32], threshold: f32) -> ClassificationResult<(FreshnessLabel, f32)> {
    let rotten = match logits {
        [logit] => 1.0 / (1.0 + (-logit).exp()),
        [fresh, rotten] => {
            let max = fresh.max(*rotten);
            let (ef, er) = ((fresh - max).exp(), (rotten - max).exp());
            er / (ef + er)
        }
        other => return Err(ClassificationError::UnexpectedOutput(other.len())),
    };

    let label = if 1.0 - rotten >= threshold {
        FreshnessLabel::Fresh
    } else {
        FreshnessLabel::Rotten
    };
    Ok((label, rotten))
}

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
        for c in 0..3 {
            array[[0, c, y as usize, x as usize]] =
                (pixel[c] as f32 / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }
    array
}

pub struct OnnxFreshnessClassifier {
    pool: Arc<OnnxSessionPool>,
    input_size: u32,
}

impl OnnxFreshnessClassifier {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let pool = OnnxSessionPool::load(
            Path::new(&config.classifier.model_path),
            "Freshness",
            config.onnx_pool_size(),
            config.detection.inference_backend.as_deref(),
        )?;

        Ok(Self {
            pool: Arc::new(pool),
            input_size: config.classifier.input_size,
        })
    }

    pub fn device_type(&self) -> &str {
        self.pool.backend()
    }

    fn classify_blocking(
        pool: &OnnxSessionPool,
        img: &DynamicImage,
        input_size: u32,
        threshold: f32,
    ) -> ClassificationResult<(FreshnessLabel, f32)> {
        let tensor = Value::from_array(preprocess(img, input_size))?;

        let logits = {
            let mut session = pool.acquire();
            let outputs = session.run(ort::inputs![pool.input_name() => tensor])?;
            let (_shape, data) = outputs[pool.output_name()].try_extract_tensor::<f32>()?;
            data.to_vec()
        };

        interpret_logits(&logits, threshold)
    }
}

#[async_trait]
impl FreshnessClassifier for OnnxFreshnessClassifier {
    #[instrument(skip(self, image))]
    async fn classify(
        &self,
        image: DynamicImage,
        threshold: f32,
    ) -> ClassificationResult<(FreshnessLabel, f32)> {
        if image.width() == 0 || image.height() == 0 {
            return Err(ClassificationError::EmptyImage);
        }

        let pool = Arc::clone(&self.pool);
        let input_size = self.input_size;
        let (label, probability) = tokio::task::spawn_blocking(move || {
            Self::classify_blocking(&pool, &image, input_size, threshold)
        })
        .await
        .map_err(|e| ClassificationError::TaskFailed(e.to_string()))??;

        debug!("Freshness verdict: {} (p_rotten={:.3})", label, probability);
        Ok((label, probability))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_logit_uses_sigmoid() {
        let (label, p) = interpret_logits(&[0.0], 0.9).unwrap();
        assert!((p - 0.5).abs() < 1e-6);
        assert_eq!(label, FreshnessLabel::Rotten);

        let (label, p) = interpret_logits(&[-5.0], 0.9).unwrap();
        assert!(p < 0.01);
        assert_eq!(label, FreshnessLabel::Fresh);
    }

    #[test]
    fn test_two_logits_use_softmax() {
        let (label, p) = interpret_logits(&[4.0, 0.0], 0.9).unwrap();
        assert!((p - 1.0 / (1.0 + 4f32.exp())).abs() < 1e-6);
        assert_eq!(label, FreshnessLabel::Fresh);

        let (label, _) = interpret_logits(&[0.0, 4.0], 0.9).unwrap();
        assert_eq!(label, FreshnessLabel::Rotten);
    }

    #[test]
    fn test_threshold_decides_label() {
        // p_rotten ~ 0.119 -> fresh probability ~ 0.881
        let (strict, _) = interpret_logits(&[-2.0], 0.9).unwrap();
        let (lenient, _) = interpret_logits(&[-2.0], 0.5).unwrap();
        assert_eq!(strict, FreshnessLabel::Rotten);
        assert_eq!(lenient, FreshnessLabel::Fresh);
    }

    #[test]
    fn test_unexpected_logit_count() {
        assert!(matches!(
            interpret_logits(&[0.1, 0.2, 0.3], 0.9),
            Err(ClassificationError::UnexpectedOutput(3))
        ));
        assert!(interpret_logits(&[], 0.9).is_err());
    }

    #[test]
    fn test_preprocess_normalizes() {
        let img = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(4, 4, image::Rgb([0, 0, 0])));
        let array = preprocess(&img, 2);
        assert_eq!(array.shape(), &[1, 3, 2, 2]);
        assert!((array[[0, 0, 0, 0]] + 0.485 / 0.229).abs() < 1e-5);
    }
}
