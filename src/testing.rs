// Stub collaborators shared by the router, engine and orchestrator tests

use async_trait::async_trait;
use axum::http::StatusCode;
use image::{DynamicImage, Rgb, RgbImage};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::config::Config;
use crate::core::errors::{AnalysisError, ClassificationError, DetectionError, DetectionResult, ItemResult};
use crate::core::types::{
    Detection, DetectionParams, FreshnessLabel, ProductRecord, RemoteFreshness, CLASS_PACKAGED,
    CLASS_PERISHABLE,
};
use crate::middleware::Credential;
use crate::services::{FreshnessClassifier, ObjectDetector, VisionExtractor};

pub fn shelf_image(width: u32, height: u32) -> Arc<DynamicImage> {
    Arc::new(DynamicImage::ImageRgb8(RgbImage::from_pixel(
        width,
        height,
        Rgb([120, 200, 80]),
    )))
}

pub fn detection(bbox: [i32; 4], class_id: u32) -> Detection {
    Detection {
        bbox,
        confidence: 0.8,
        class_id,
        class_name: match class_id {
            CLASS_PERISHABLE => "perishable".to_string(),
            CLASS_PACKAGED => "packaged".to_string(),
            other => format!("class_{}", other),
        },
    }
}

pub fn test_config(vars: &[(&str, &str)]) -> Config {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Config::from_lookup(|name| vars.get(name).cloned()).unwrap()
}

/// Local chat-completions endpoint that answers every request with `status` and `body`
///
/// Returns the base URL to use as `OPENAI_BASE_URL`.
pub async fn vision_api_answering(status: StatusCode, body: &'static str) -> String {
    let app = axum::Router::new().route(
        "/chat/completions",
        axum::routing::post(move || async move { (status, body) }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

pub fn amul_butter() -> ProductRecord {
    ProductRecord {
        brand_name: Some("Amul".to_string()),
        product_name: Some("Butter".to_string()),
        pack_size: Some("100 g".to_string()),
        mrp: Some("₹56".to_string()),
        expiry_date: Some("12/08/2025".to_string()),
        item_count: Some(1),
        category: Some("dairy".to_string()),
        ..Default::default()
    }
}

pub fn banana() -> RemoteFreshness {
    RemoteFreshness {
        product_name: Some("banana".to_string()),
        item_count: Some(3),
        category: Some("fruit".to_string()),
        estimated_shelf_life_days: Some(4),
    }
}

/// Scripted remote extractor that counts calls and concurrent callers
pub struct StubExtractor {
    pub product: Result<ProductRecord, String>,
    pub freshness: Result<RemoteFreshness, String>,
    pub delay: Duration,
    stagger: Option<(Duration, usize)>,
    started: AtomicUsize,
    /// Arrival numbers of finished calls, in completion order
    pub completions: Mutex<Vec<usize>>,
    pub product_calls: AtomicUsize,
    pub freshness_calls: AtomicUsize,
    pub multi_calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl StubExtractor {
    pub fn new() -> Self {
        Self {
            product: Ok(amul_butter()),
            freshness: Ok(banana()),
            delay: Duration::from_millis(0),
            stagger: None,
            started: AtomicUsize::new(0),
            completions: Mutex::new(Vec::new()),
            product_calls: AtomicUsize::new(0),
            freshness_calls: AtomicUsize::new(0),
            multi_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_freshness(mut self, freshness: Result<RemoteFreshness, String>) -> Self {
        self.freshness = freshness;
        self
    }

    pub fn with_product(mut self, product: Result<ProductRecord, String>) -> Self {
        self.product = product;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Of `calls` calls, the k-th to arrive sleeps `(calls - k) * step`,
    /// so calls finish in the reverse of their arrival order
    pub fn with_staggered_delays(mut self, step: Duration, calls: usize) -> Self {
        self.stagger = Some((step, calls));
        self
    }

    async fn call<T: Clone>(&self, outcome: &Result<T, String>) -> ItemResult<T> {
        let arrival = self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = match self.stagger {
            Some((step, calls)) => step * calls.saturating_sub(arrival) as u32,
            None => self.delay,
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.completions.lock().push(arrival);
        outcome.clone().map_err(|e| AnalysisError::remote(e))
    }
}

#[async_trait]
impl VisionExtractor for StubExtractor {
    async fn extract_product(&self, _credential: &Credential, _data_url: &str) -> ItemResult<ProductRecord> {
        self.product_calls.fetch_add(1, Ordering::SeqCst);
        self.call(&self.product).await
    }

    async fn extract_freshness(&self, _credential: &Credential, _data_url: &str) -> ItemResult<RemoteFreshness> {
        self.freshness_calls.fetch_add(1, Ordering::SeqCst);
        self.call(&self.freshness).await
    }

    async fn extract_product_multi(
        &self,
        _credential: &Credential,
        _data_urls: &[String],
    ) -> ItemResult<ProductRecord> {
        self.multi_calls.fetch_add(1, Ordering::SeqCst);
        self.call(&self.product).await
    }
}

pub enum ClassifierBehavior {
    Verdict(FreshnessLabel, f32),
    Fail,
    Panic,
}

pub struct StubClassifier {
    pub behavior: ClassifierBehavior,
    pub calls: AtomicUsize,
}

impl StubClassifier {
    pub fn new(behavior: ClassifierBehavior) -> Self {
        Self {
            behavior,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn fresh() -> Self {
        Self::new(ClassifierBehavior::Verdict(FreshnessLabel::Fresh, 0.05))
    }
}

#[async_trait]
impl FreshnessClassifier for StubClassifier {
    async fn classify(
        &self,
        _image: DynamicImage,
        _threshold: f32,
    ) -> Result<(FreshnessLabel, f32), ClassificationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            ClassifierBehavior::Verdict(label, probability) => Ok((label, probability)),
            ClassifierBehavior::Fail => Err(ClassificationError::UnexpectedOutput(0)),
            ClassifierBehavior::Panic => panic!("classifier crashed"),
        }
    }
}

/// Detector returning a fixed list, or failing
pub struct StubDetector {
    pub detections: Option<Vec<Detection>>,
}

#[async_trait]
impl ObjectDetector for StubDetector {
    async fn detect(
        &self,
        _image: Arc<DynamicImage>,
        _params: &DetectionParams,
    ) -> DetectionResult<Vec<Detection>> {
        self.detections
            .clone()
            .ok_or_else(|| DetectionError::TaskFailed("detector offline".to_string()))
    }
}
