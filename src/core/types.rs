// Data model for detections, analysis records and the per-item aggregate

use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::core::errors::ErrorKind;

/// Detector class for loose produce (fruit, vegetables, bread)
pub const CLASS_PERISHABLE: u32 = 0;
/// Detector class for labelled, packaged goods
pub const CLASS_PACKAGED: u32 = 1;

/// Analysis strategy selected per detector class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Local freshness classifier + remote shelf-life extraction
    Perishable,
    /// Remote brand/label extraction
    Packaged,
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "perishable" => Ok(Strategy::Perishable),
            "packaged" => Ok(Strategy::Packaged),
            other => Err(other.to_string()),
        }
    }
}

/// Detector thresholds applied per request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionParams {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
    /// Suppress overlapping boxes regardless of class
    pub agnostic_nms: bool,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.25,
            iou_threshold: 0.5,
            max_detections: 20,
            agnostic_nms: true,
        }
    }
}

/// One object found by the detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// [x, y, width, height] in source image pixels; may exceed the image bounds
    pub bbox: [i32; 4],
    pub confidence: f32,
    pub class_id: u32,
    pub class_name: String,
}

/// Encoded crop of one detection, ready to be sent to a remote model
#[derive(Debug, Clone)]
pub struct CroppedPayload {
    /// Decoded crop, kept for local classification
    pub image: DynamicImage,
    pub encoded_bytes: Vec<u8>,
    pub mime_type: &'static str,
    pub data_url: String,
    /// Clamped crop region as (x, y, width, height)
    pub region: (u32, u32, u32, u32),
}

/// Label and price metadata extracted from a packaged product
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub brand_name: Option<String>,
    pub brand_details: Option<String>,
    pub pack_size: Option<String>,
    pub expiry_date: Option<String>,
    pub mrp: Option<String>,
    pub product_name: Option<String>,
    pub item_count: Option<i64>,
    pub category: Option<String>,
    /// ISO date derived from `expiry_date`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_normalized: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_until_expiry: Option<i64>,
}

/// Raw shelf-life extraction returned by the remote model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteFreshness {
    pub product_name: Option<String>,
    pub item_count: Option<i64>,
    pub category: Option<String>,
    pub estimated_shelf_life_days: Option<i64>,
}

impl RemoteFreshness {
    /// True when the remote model named the product
    pub fn has_product_name(&self) -> bool {
        self.product_name
            .as_deref()
            .map(|name| !name.trim().is_empty())
            .unwrap_or(false)
    }
}

/// Output of the local fresh/rotten classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FreshnessLabel {
    Fresh,
    Rotten,
}

impl std::fmt::Display for FreshnessLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FreshnessLabel::Fresh => write!(f, "fresh"),
            FreshnessLabel::Rotten => write!(f, "rotten"),
        }
    }
}

/// Perishable item record: remote shelf-life fields plus the local classifier verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreshnessRecord {
    pub product_name: Option<String>,
    pub count: Option<i64>,
    pub category: Option<String>,
    pub estimated_shelf_life_days: Option<i64>,
    pub state: FreshnessLabel,
    /// 1 - rotten probability
    pub freshness: f32,
}

/// Result of one analysis strategy; exactly one shape is populated
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisResult {
    Product(ProductRecord),
    Freshness(FreshnessRecord),
}

impl AnalysisResult {
    pub fn kind(&self) -> &'static str {
        match self {
            AnalysisResult::Product(_) => "product",
            AnalysisResult::Freshness(_) => "freshness",
        }
    }
}

/// Failure record for one detection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub detection: Detection,
    pub error: String,
    pub error_kind: ErrorKind,
    pub saved_filename: Option<String>,
}

/// Tagged outcome of one item
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemOutcome {
    Product(ProductRecord),
    Freshness(FreshnessRecord),
    Error(ErrorRecord),
}

impl From<AnalysisResult> for ItemOutcome {
    fn from(result: AnalysisResult) -> Self {
        match result {
            AnalysisResult::Product(record) => ItemOutcome::Product(record),
            AnalysisResult::Freshness(record) => ItemOutcome::Freshness(record),
        }
    }
}

/// One entry of the response list
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateItem {
    /// 1-based position of the detection in the detector output
    pub index: usize,
    /// Omitted when the item describes the whole image
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_detection: Option<Detection>,
    /// Data URL of the analysed crop; null when the crop could not be produced
    pub base64_image: Option<String>,
    #[serde(flatten)]
    pub outcome: ItemOutcome,
}

impl AggregateItem {
    pub fn is_error(&self) -> bool {
        matches!(self.outcome, ItemOutcome::Error(_))
    }
}

/// Body of `POST /analyze_group/`
#[derive(Debug, Clone, Deserialize)]
pub struct GroupImageRequest {
    /// `data:image/...;base64,...` URL of the shelf photo
    pub image: String,
}

/// Body of `POST /multi_image_ocr/`
#[derive(Debug, Clone, Deserialize)]
pub struct MultiImageRequest {
    /// Several photos of one product, raw base64 or data URLs
    pub images: Vec<String>,
}
