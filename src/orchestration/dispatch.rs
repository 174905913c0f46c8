// Dispatch engine: one analysis task per detection, bounded by the credential pool
//
// Every task is spawned before any is awaited. A task blocks on `checkout` until a
// credential is free, so at most `pool.size()` analyses are in flight at once.
// The lease is a scope guard, so the credential goes back even if the task panics.

use chrono::NaiveDate;
use futures::future::join_all;
use image::DynamicImage;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::core::errors::AnalysisError;
use crate::core::types::{AggregateItem, Detection, ItemOutcome};
use crate::middleware::CredentialPool;
use crate::orchestration::aggregate::{failure_item, success_item};
use crate::orchestration::router::AnalysisRouter;
use crate::utils::{crop_and_encode_jpeg_async, save_crop_async, today_at_offset, Metrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Pending,
    AwaitingCredential,
    Running,
    Succeeded,
    Failed,
}

pub struct DispatchEngine {
    pool: CredentialPool,
    router: Arc<AnalysisRouter>,
    archive_dir: Option<Arc<PathBuf>>,
    expiry_offset_minutes: i32,
    metrics: Option<Metrics>,
}

impl DispatchEngine {
    pub fn new(pool: CredentialPool, router: Arc<AnalysisRouter>) -> Self {
        Self {
            pool,
            router,
            archive_dir: None,
            expiry_offset_minutes: 0,
            metrics: None,
        }
    }

    /// Write every crop as `{index}.jpg` under `dir`
    pub fn with_archive_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.archive_dir = dir.map(Arc::new);
        self
    }

    /// UTC offset used to compute "today" for expiry countdowns
    pub fn with_expiry_offset(mut self, minutes: i32) -> Self {
        self.expiry_offset_minutes = minutes;
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn pool(&self) -> &CredentialPool {
        &self.pool
    }

    /// Analyse every detection concurrently and return one item per detection,
    /// in detection order
    pub async fn analyze_batch(
        &self,
        image: Arc<DynamicImage>,
        detections: Vec<Detection>,
    ) -> Vec<AggregateItem> {
        if detections.is_empty() {
            debug!("No detections, nothing to dispatch");
            return Vec::new();
        }

        let start = Instant::now();
        let total = detections.len();
        let today = today_at_offset(self.expiry_offset_minutes);

        info!(
            "Dispatching {} detections over {} credentials",
            total,
            self.pool.size()
        );

        let tasks: Vec<_> = detections
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, detection)| {
                let index = i + 1;
                trace!(index, state = ?TaskState::Pending, "task created");
                tokio::spawn(analyze_item(
                    self.pool.clone(),
                    Arc::clone(&self.router),
                    self.archive_dir.clone(),
                    Arc::clone(&image),
                    index,
                    detection,
                    today,
                ))
            })
            .collect();

        let results = join_all(tasks).await;

        let items: Vec<AggregateItem> = results
            .into_iter()
            .zip(detections)
            .enumerate()
            .map(|(i, (result, detection))| match result {
                Ok(item) => item,
                Err(e) => {
                    warn!("Analysis task {} aborted: {}", i + 1, e);
                    let error = AnalysisError::TaskFailed(e.to_string());
                    failure_item(i + 1, detection, None, &error, None)
                }
            })
            .collect();

        let failed = items.iter().filter(|item| item.is_error()).count();
        if let Some(ref m) = self.metrics {
            for item in &items {
                match item.outcome {
                    ItemOutcome::Error(ref record) => {
                        m.record_item_failure(record.error_kind.as_str())
                    }
                    _ => m.record_item_success(),
                }
            }
            m.record_batch(start.elapsed());
        }

        info!(
            "✓ Batch complete: {} items ({} failed) in {:.2}ms",
            total,
            failed,
            start.elapsed().as_secs_f64() * 1000.0
        );

        items
    }
}

async fn analyze_item(
    pool: CredentialPool,
    router: Arc<AnalysisRouter>,
    archive_dir: Option<Arc<PathBuf>>,
    image: Arc<DynamicImage>,
    index: usize,
    detection: Detection,
    today: NaiveDate,
) -> AggregateItem {
    trace!(index, state = ?TaskState::AwaitingCredential, "waiting for credential");
    let lease = pool.checkout().await;
    trace!(index, credential = lease.index, state = ?TaskState::Running, "analysing");

    let payload = match crop_and_encode_jpeg_async(image, detection.bbox).await {
        Ok(payload) => payload,
        Err(e) => {
            drop(lease);
            trace!(index, state = ?TaskState::Failed, "crop failed: {}", e);
            return failure_item(index, detection, None, &e, None);
        }
    };

    let saved_filename = match archive_dir {
        Some(ref dir) => match save_crop_async(dir, index, &payload.encoded_bytes).await {
            Ok(_) => Some(format!("{}.jpg", index)),
            Err(e) => {
                warn!("Failed to archive crop {}: {:#}", index, e);
                None
            }
        },
        None => None,
    };

    let result = router.analyze(&detection, &payload, &lease).await;
    drop(lease);

    match result {
        Ok(result) => {
            trace!(index, state = ?TaskState::Succeeded, kind = result.kind(), "done");
            success_item(index, detection, &payload, result, today)
        }
        Err(e) => {
            debug!("Item {} failed: {}", index, e);
            trace!(index, state = ?TaskState::Failed, "done");
            failure_item(
                index,
                detection,
                Some(payload.data_url),
                &e,
                saved_filename,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::default_class_strategies;
    use crate::core::errors::ErrorKind;
    use crate::core::types::{CLASS_PACKAGED, CLASS_PERISHABLE};
    use crate::services::OpenAiExtractor;
    use crate::testing::*;
    use crate::utils::extract_crop;
    use axum::http::StatusCode;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn engine(
        pool_size: usize,
        extractor: Arc<StubExtractor>,
        classifier: Arc<StubClassifier>,
    ) -> DispatchEngine {
        let router = AnalysisRouter::new(default_class_strategies(), extractor, classifier, 0.9);
        DispatchEngine::new(
            CredentialPool::new(&["sk-test-0001".to_string()], pool_size),
            Arc::new(router),
        )
    }

    fn kinds(items: &[AggregateItem]) -> Vec<&'static str> {
        items
            .iter()
            .map(|item| match item.outcome {
                ItemOutcome::Product(_) => "product",
                ItemOutcome::Freshness(_) => "freshness",
                ItemOutcome::Error(_) => "error",
            })
            .collect()
    }

    #[tokio::test]
    async fn test_zero_detections_never_touch_the_pool() {
        let extractor = Arc::new(StubExtractor::new());
        let engine = engine(2, extractor.clone(), Arc::new(StubClassifier::fresh()));

        let items = engine.analyze_batch(shelf_image(100, 100), Vec::new()).await;

        assert!(items.is_empty());
        assert_eq!(extractor.product_calls.load(Ordering::SeqCst), 0);
        assert_eq!(engine.pool().available(), 2);
    }

    #[tokio::test]
    async fn test_single_packaged_detection() {
        let engine = engine(1, Arc::new(StubExtractor::new()), Arc::new(StubClassifier::fresh()));
        let det = detection([10, 10, 50, 50], CLASS_PACKAGED);

        let items = engine.analyze_batch(shelf_image(100, 100), vec![det.clone()]).await;

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].index, 1);
        assert_eq!(items[0].source_detection, Some(det));
        assert!(items[0]
            .base64_image
            .as_deref()
            .unwrap()
            .starts_with("data:image/jpeg;base64,"));
        match items[0].outcome {
            ItemOutcome::Product(ref record) => {
                assert_eq!(record.brand_name.as_deref(), Some("Amul"));
                assert_eq!(record.expiry_normalized.as_deref(), Some("2025-08-12"));
            }
            ref other => panic!("expected product, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mixed_batch_keeps_detection_order() {
        let metrics = Metrics::new();
        let engine = engine(2, Arc::new(StubExtractor::new()), Arc::new(StubClassifier::fresh()))
            .with_metrics(metrics.clone());
        let detections = vec![
            detection([0, 0, 40, 40], CLASS_PACKAGED),
            detection([10, 10, 20, 20], 7),
            detection([50, 50, 40, 40], CLASS_PERISHABLE),
        ];

        let items = engine.analyze_batch(shelf_image(100, 100), detections.clone()).await;

        assert_eq!(kinds(&items), vec!["product", "error", "freshness"]);
        for (i, item) in items.iter().enumerate() {
            assert_eq!(item.index, i + 1);
            assert_eq!(item.source_detection.as_ref(), Some(&detections[i]));
        }
        match items[1].outcome {
            ItemOutcome::Error(ref record) => {
                assert_eq!(record.error_kind, ErrorKind::UnsupportedClass);
                assert_eq!(record.detection, detections[1]);
            }
            _ => unreachable!(),
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.items_succeeded, 2);
        assert_eq!(snapshot.items_failed, 1);
        assert_eq!(snapshot.item_errors_by_kind.get("unsupported_class"), Some(&1));
    }

    #[tokio::test]
    async fn test_order_holds_when_completion_is_reversed() {
        let extractor = Arc::new(
            StubExtractor::new().with_staggered_delays(Duration::from_millis(50), 4),
        );
        let engine = engine(4, extractor.clone(), Arc::new(StubClassifier::fresh()));
        let image = shelf_image(100, 100);
        // Distinct widths give every crop a distinct data URL
        let detections: Vec<Detection> = (0..4)
            .map(|i| detection([0, i * 20, 10 + i * 10, 20], CLASS_PACKAGED))
            .collect();

        let items = engine.analyze_batch(Arc::clone(&image), detections.clone()).await;

        assert_eq!(*extractor.completions.lock(), vec![3, 2, 1, 0]);
        assert_eq!(items.len(), 4);
        for (i, item) in items.iter().enumerate() {
            assert_eq!(item.index, i + 1);
            assert_eq!(item.source_detection.as_ref(), Some(&detections[i]));
            let crop = extract_crop(&image, detections[i].bbox).unwrap();
            assert_eq!(item.base64_image.as_deref(), Some(crop.data_url.as_str()));
        }
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded_by_pool_size() {
        let extractor = Arc::new(StubExtractor::new().with_delay(Duration::from_millis(20)));
        let engine = engine(2, extractor.clone(), Arc::new(StubClassifier::fresh()));
        let detections = (0..6)
            .map(|i| detection([i * 10, 0, 10, 10], CLASS_PACKAGED))
            .collect();

        let items = engine.analyze_batch(shelf_image(100, 100), detections).await;

        assert_eq!(items.len(), 6);
        assert!(items.iter().all(|item| !item.is_error()));
        assert_eq!(extractor.product_calls.load(Ordering::SeqCst), 6);
        let peak = extractor.max_in_flight.load(Ordering::SeqCst);
        assert!(peak >= 1 && peak <= 2, "peak in-flight was {}", peak);
        assert_eq!(engine.pool().available(), 2);
    }

    #[tokio::test]
    async fn test_pool_is_refilled_after_panicking_tasks() {
        let engine = engine(
            2,
            Arc::new(StubExtractor::new()),
            Arc::new(StubClassifier::new(ClassifierBehavior::Panic)),
        );
        let detections = vec![
            detection([0, 0, 30, 30], CLASS_PERISHABLE),
            detection([30, 30, 30, 30], CLASS_PACKAGED),
            detection([60, 60, 30, 30], CLASS_PERISHABLE),
        ];

        let items = engine.analyze_batch(shelf_image(100, 100), detections.clone()).await;

        assert_eq!(kinds(&items), vec!["error", "product", "error"]);
        match items[0].outcome {
            ItemOutcome::Error(ref record) => {
                assert_eq!(record.error_kind, ErrorKind::TaskFailed);
                assert_eq!(record.detection, detections[0]);
            }
            _ => unreachable!(),
        }
        assert_eq!(engine.pool().available(), 2);
        assert_eq!(engine.pool().in_use(), 0);
    }

    #[tokio::test]
    async fn test_remote_failure_is_isolated() {
        let extractor = Arc::new(
            StubExtractor::new().with_product(Err("API request failed: 429 - slow down".to_string())),
        );
        let engine = engine(3, extractor, Arc::new(StubClassifier::fresh()));
        let detections = vec![
            detection([0, 0, 30, 30], CLASS_PACKAGED),
            detection([30, 30, 30, 30], CLASS_PERISHABLE),
        ];

        let items = engine.analyze_batch(shelf_image(100, 100), detections).await;

        assert_eq!(kinds(&items), vec!["error", "freshness"]);
        match items[0].outcome {
            ItemOutcome::Error(ref record) => {
                assert_eq!(record.error, "API request failed: 429 - slow down");
                assert_eq!(record.error_kind, ErrorKind::RemoteAnalysis);
            }
            _ => unreachable!(),
        }
        assert!(items[0].base64_image.is_some());
    }

    #[tokio::test]
    async fn test_rejected_items_do_not_fail_their_siblings() {
        let base_url = vision_api_answering(StatusCode::BAD_REQUEST, r#"{"error":"image too small"}"#).await;
        let keys = vec!["sk-test-0001".to_string()];
        let pool = CredentialPool::new(&keys, 2);
        let extractor = OpenAiExtractor::new(
            &test_config(&[("OPENAI_BASE_URL", base_url.as_str()), ("API_TIMEOUT_SECONDS", "2")]),
            pool.clone(),
            None,
        )
        .unwrap();
        let router = AnalysisRouter::new(
            default_class_strategies(),
            Arc::new(extractor),
            Arc::new(StubClassifier::fresh()),
            0.9,
        );
        let engine = DispatchEngine::new(pool, Arc::new(router));
        let detections = (0..8)
            .map(|i| detection([i * 10, 0, 10, 10], CLASS_PACKAGED))
            .collect();

        let items = engine.analyze_batch(shelf_image(100, 100), detections).await;

        assert_eq!(items.len(), 8);
        for item in &items {
            match item.outcome {
                ItemOutcome::Error(ref record) => {
                    assert_eq!(record.error_kind, ErrorKind::RemoteAnalysis);
                    assert_eq!(
                        record.error,
                        r#"API request failed: 400 Bad Request - {"error":"image too small"}"#
                    );
                }
                ref other => panic!("expected error, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_box_outside_image_is_empty_crop() {
        let extractor = Arc::new(StubExtractor::new());
        let engine = engine(1, extractor.clone(), Arc::new(StubClassifier::fresh()));

        let items = engine
            .analyze_batch(shelf_image(100, 100), vec![detection([150, 150, 20, 20], CLASS_PACKAGED)])
            .await;

        match items[0].outcome {
            ItemOutcome::Error(ref record) => assert_eq!(record.error_kind, ErrorKind::EmptyCrop),
            ref other => panic!("expected error, got {:?}", other),
        }
        assert!(items[0].base64_image.is_none());
        assert_eq!(extractor.product_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_crops_are_archived_by_index() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(2, Arc::new(StubExtractor::new()), Arc::new(StubClassifier::fresh()))
            .with_archive_dir(Some(dir.path().to_path_buf()));
        let detections = vec![
            detection([0, 0, 30, 30], CLASS_PACKAGED),
            detection([30, 30, 30, 30], 9),
        ];

        let items = engine.analyze_batch(shelf_image(100, 100), detections).await;

        assert!(dir.path().join("1.jpg").exists());
        assert!(dir.path().join("2.jpg").exists());
        match items[1].outcome {
            ItemOutcome::Error(ref record) => {
                assert_eq!(record.saved_filename.as_deref(), Some("2.jpg"))
            }
            _ => unreachable!(),
        }
    }
}
