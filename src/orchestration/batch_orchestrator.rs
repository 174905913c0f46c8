// Request orchestrator: detect, dispatch, aggregate

use anyhow::{Context, Result};
use image::DynamicImage;
use rayon::prelude::*;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument};

use crate::core::config::Config;
use crate::core::errors::{RequestError, RequestResult};
use crate::core::types::{AggregateItem, Detection};
use crate::middleware::circuit_breaker::CircuitBreakerStats;
use crate::middleware::CredentialPool;
use crate::orchestration::aggregate::whole_image_item;
use crate::orchestration::dispatch::DispatchEngine;
use crate::orchestration::router::AnalysisRouter;
use crate::services::{
    FreshnessClassifier, ObjectDetector, OnnxFreshnessClassifier, OpenAiExtractor,
    VisionExtractor, YoloDetector,
};
use crate::utils::{
    data_url_for, decode_data_url, encode_jpeg, load_image_from_memory_async, today_at_offset,
    Metrics,
};

/// Main request orchestrator
pub struct BatchOrchestrator {
    config: Arc<Config>,
    detector: Arc<dyn ObjectDetector>,
    extractor: Arc<dyn VisionExtractor>,
    engine: DispatchEngine,
    credentials: CredentialPool,
    metrics: Metrics,
    backend_type: String,
    remote: Option<Arc<OpenAiExtractor>>,
}

impl BatchOrchestrator {
    /// Load both ONNX models and connect the remote extractor
    #[instrument(skip(config))]
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        info!("Initializing services...");

        let detector_config = Arc::clone(&config);
        let detector = tokio::task::spawn_blocking(move || YoloDetector::new(&detector_config))
            .await
            .context("Detector loading task failed")??;

        let classifier_config = Arc::clone(&config);
        let classifier =
            tokio::task::spawn_blocking(move || OnnxFreshnessClassifier::new(&classifier_config))
                .await
                .context("Classifier loading task failed")??;

        let backend_type = detector.device_type().to_string();
        let metrics = Metrics::new();
        let credentials = CredentialPool::new(config.api_keys(), config.credential_pool_size());
        let remote = Arc::new(OpenAiExtractor::new(
            &config,
            credentials.clone(),
            Some(metrics.clone()),
        )?);

        info!(
            "✓ Ready (backend: {}, classifier: {}, credentials: {} over {} keys, ONNX pool: {} sessions)",
            backend_type,
            classifier.device_type(),
            credentials.size(),
            config.api_keys().len(),
            config.onnx_pool_size()
        );

        let mut orchestrator = Self::from_parts(
            config,
            Arc::new(detector),
            remote.clone(),
            Arc::new(classifier),
            credentials,
            metrics,
        );
        orchestrator.backend_type = backend_type;
        orchestrator.remote = Some(remote);
        Ok(orchestrator)
    }

    /// Wire an orchestrator from already-built collaborators
    pub fn from_parts(
        config: Arc<Config>,
        detector: Arc<dyn ObjectDetector>,
        extractor: Arc<dyn VisionExtractor>,
        classifier: Arc<dyn FreshnessClassifier>,
        credentials: CredentialPool,
        metrics: Metrics,
    ) -> Self {
        let router = AnalysisRouter::new(
            config.pipeline.class_strategies.clone(),
            Arc::clone(&extractor),
            classifier,
            config.freshness_threshold(),
        )
        .with_metrics(metrics.clone());

        let engine = DispatchEngine::new(credentials.clone(), Arc::new(router))
            .with_archive_dir(config.pipeline.crop_archive_dir.clone())
            .with_expiry_offset(config.pipeline.expiry_utc_offset_minutes)
            .with_metrics(metrics.clone());

        Self {
            config,
            detector,
            extractor,
            engine,
            credentials,
            metrics,
            backend_type: "CPU".to_string(),
            remote: None,
        }
    }

    /// Backend of the detector session (e.g. "CUDA", "CoreML", "CPU")
    pub fn backend_type(&self) -> &str {
        &self.backend_type
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn credentials(&self) -> &CredentialPool {
        &self.credentials
    }

    pub fn circuit_breaker_stats(&self) -> Option<CircuitBreakerStats> {
        self.remote
            .as_ref()
            .map(|remote| remote.circuit_breaker().stats())
    }

    /// Analyse a shelf photo sent as a `data:` URL
    pub async fn analyze_group(&self, data_url: &str) -> RequestResult<Vec<AggregateItem>> {
        let bytes = decode_data_url(data_url)?;
        self.analyze_upload(bytes).await
    }

    /// Analyse a shelf photo sent as raw file bytes
    pub async fn analyze_upload(&self, bytes: Vec<u8>) -> RequestResult<Vec<AggregateItem>> {
        let image = load_image_from_memory_async(bytes)
            .await
            .map_err(|e| RequestError::Decode(format!("{:#}", e)))?;
        self.analyze_image(image).await
    }

    /// Detect products in a decoded image and analyse every detection
    #[instrument(skip_all, fields(width = image.width(), height = image.height()))]
    pub async fn analyze_image(&self, image: DynamicImage) -> RequestResult<Vec<AggregateItem>> {
        let image = Arc::new(image);
        let detections = self.detect(&image).await?;
        Ok(self.engine.analyze_batch(image, detections).await)
    }

    async fn detect(&self, image: &Arc<DynamicImage>) -> RequestResult<Vec<Detection>> {
        let start = Instant::now();
        let detections = self
            .detector
            .detect(Arc::clone(image), &self.config.detection_params())
            .await?;
        self.metrics.record_detection(detections.len(), start.elapsed());

        info!(
            "Detected {} objects in {:.2}ms",
            detections.len(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(detections)
    }

    /// Merge several photos of one product into a single record
    pub async fn analyze_multi(&self, images: &[String]) -> RequestResult<AggregateItem> {
        if images.is_empty() {
            return Err(RequestError::NoImages);
        }

        let images = images.to_vec();
        let data_urls = tokio::task::spawn_blocking(move || {
            images
                .par_iter()
                .enumerate()
                .map(|(i, raw)| normalize_upload(raw).map_err(|e| match e {
                    RequestError::Decode(msg) => RequestError::Decode(format!("image {}: {}", i + 1, msg)),
                    other => other,
                }))
                .collect::<RequestResult<Vec<String>>>()
        })
        .await
        .map_err(|e| RequestError::Decode(format!("decode task failed: {}", e)))??;

        info!("Extracting one product from {} images", data_urls.len());

        let lease = self.credentials.checkout().await;
        let record = self
            .extractor
            .extract_product_multi(&lease, &data_urls)
            .await
            .map_err(|e| RequestError::Remote(e.to_string()))?;
        drop(lease);

        let today = today_at_offset(self.config.pipeline.expiry_utc_offset_minutes);
        Ok(whole_image_item(record, today))
    }
}

/// Decode one uploaded photo and re-encode it as a JPEG data URL
fn normalize_upload(raw: &str) -> RequestResult<String> {
    let bytes = decode_data_url(raw)?;
    let image = image::load_from_memory(&bytes)
        .map_err(|e| RequestError::Decode(e.to_string()))?;
    let jpeg = encode_jpeg(&image).map_err(|e| RequestError::Decode(format!("{:#}", e)))?;
    data_url_for(&jpeg, "image.jpg").map_err(|e| RequestError::Decode(e.to_string()))
}
