// Per-detection strategy selection
//
// Perishable items run the local classifier and the remote shelf-life call side
// by side. If either cannot describe the item, the crop is analysed as a
// packaged product instead and the perishable fields are dropped.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::core::errors::{AnalysisError, ItemResult};
use crate::core::types::{AnalysisResult, CroppedPayload, Detection, FreshnessRecord, Strategy};
use crate::middleware::Credential;
use crate::services::{FreshnessClassifier, VisionExtractor};
use crate::utils::Metrics;

pub struct AnalysisRouter {
    strategies: HashMap<u32, Strategy>,
    extractor: Arc<dyn VisionExtractor>,
    classifier: Arc<dyn FreshnessClassifier>,
    freshness_threshold: f32,
    metrics: Option<Metrics>,
}

impl AnalysisRouter {
    pub fn new(
        strategies: HashMap<u32, Strategy>,
        extractor: Arc<dyn VisionExtractor>,
        classifier: Arc<dyn FreshnessClassifier>,
        freshness_threshold: f32,
    ) -> Self {
        Self {
            strategies,
            extractor,
            classifier,
            freshness_threshold,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn strategy_for(&self, class_id: u32) -> Option<Strategy> {
        self.strategies.get(&class_id).copied()
    }

    #[instrument(skip_all, fields(class_id = detection.class_id, credential = credential.index))]
    pub async fn analyze(
        &self,
        detection: &Detection,
        payload: &CroppedPayload,
        credential: &Credential,
    ) -> ItemResult<AnalysisResult> {
        match self.strategy_for(detection.class_id) {
            Some(Strategy::Packaged) => self.analyze_packaged(payload, credential).await,
            Some(Strategy::Perishable) => self.analyze_perishable(payload, credential).await,
            None => Err(AnalysisError::UnsupportedClass(detection.class_id)),
        }
    }

    async fn analyze_packaged(
        &self,
        payload: &CroppedPayload,
        credential: &Credential,
    ) -> ItemResult<AnalysisResult> {
        let record = self
            .extractor
            .extract_product(credential, &payload.data_url)
            .await?;
        Ok(AnalysisResult::Product(record))
    }

    async fn analyze_perishable(
        &self,
        payload: &CroppedPayload,
        credential: &Credential,
    ) -> ItemResult<AnalysisResult> {
        let (classified, remote) = tokio::join!(
            self.classifier
                .classify(payload.image.clone(), self.freshness_threshold),
            self.extractor.extract_freshness(credential, &payload.data_url),
        );

        let (state, probability) = match classified {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!("Freshness classifier failed, analysing as packaged: {}", e);
                return self.fall_back(payload, credential).await;
            }
        };

        let remote = remote?;
        if !remote.has_product_name() {
            debug!("No product name in shelf-life response, analysing as packaged");
            return self.fall_back(payload, credential).await;
        }

        Ok(AnalysisResult::Freshness(FreshnessRecord {
            product_name: remote.product_name,
            count: remote.item_count,
            category: remote.category,
            estimated_shelf_life_days: remote.estimated_shelf_life_days,
            state,
            freshness: 1.0 - probability,
        }))
    }

    async fn fall_back(
        &self,
        payload: &CroppedPayload,
        credential: &Credential,
    ) -> ItemResult<AnalysisResult> {
        if let Some(ref m) = self.metrics {
            m.record_fallback();
        }
        self.analyze_packaged(payload, credential).await
    }
}
