// Error taxonomy for the shelf analysis pipeline
//
// Request-level errors abort the whole request before any dispatch happens.
// Per-item errors are captured into error records and never cross the task boundary.

use serde::Serialize;
use thiserror::Error;

/// Object detector failures (fatal to the request)
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("ONNX inference failed: {0}")]
    InferenceFailed(#[from] ort::Error),

    #[error("Unexpected detector output shape {shape:?} (expected [1, 4 + classes, anchors])")]
    UnexpectedOutput { shape: Vec<i64> },

    #[error("Invalid image dimensions: {width}x{height}")]
    InvalidImageSize { width: u32, height: u32 },

    #[error("Detection task failed: {0}")]
    TaskFailed(String),
}

/// Local freshness classifier failures
///
/// Never fatal: the perishable path falls back to packaged extraction.
#[derive(Debug, Error)]
pub enum ClassificationError {
    #[error("ONNX inference failed: {0}")]
    InferenceFailed(#[from] ort::Error),

    #[error("Classifier returned {0} logits, expected 1 or 2")]
    UnexpectedOutput(usize),

    #[error("Empty crop cannot be classified")]
    EmptyImage,

    #[error("Classification task failed: {0}")]
    TaskFailed(String),
}

/// Per-item analysis failures
///
/// Every variant is recoverable at the batch level: the dispatch engine turns it
/// into an error record next to the detection that produced it.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Unsupported class_id: {0}")]
    UnsupportedClass(u32),

    #[error("{0}")]
    RemoteAnalysis(String),

    #[error("Unsupported file extension: {0}")]
    UnsupportedFormat(String),

    #[error("Bounding box {bbox:?} is empty after clamping to {width}x{height}")]
    EmptyCrop {
        bbox: [i32; 4],
        width: u32,
        height: u32,
    },

    #[error("Failed to encode crop: {0}")]
    Encode(String),

    #[error("Analysis task failed: {0}")]
    TaskFailed(String),
}

/// Stable machine-readable tag for an item failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnsupportedClass,
    RemoteAnalysis,
    UnsupportedFormat,
    EmptyCrop,
    Encode,
    TaskFailed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnsupportedClass => "unsupported_class",
            ErrorKind::RemoteAnalysis => "remote_analysis",
            ErrorKind::UnsupportedFormat => "unsupported_format",
            ErrorKind::EmptyCrop => "empty_crop",
            ErrorKind::Encode => "encode",
            ErrorKind::TaskFailed => "task_failed",
        }
    }
}

impl AnalysisError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AnalysisError::UnsupportedClass(_) => ErrorKind::UnsupportedClass,
            AnalysisError::RemoteAnalysis(_) => ErrorKind::RemoteAnalysis,
            AnalysisError::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            AnalysisError::EmptyCrop { .. } => ErrorKind::EmptyCrop,
            AnalysisError::Encode(_) => ErrorKind::Encode,
            AnalysisError::TaskFailed(_) => ErrorKind::TaskFailed,
        }
    }

    pub fn remote(err: impl std::fmt::Display) -> Self {
        AnalysisError::RemoteAnalysis(err.to_string())
    }
}

/// Request-level failures surfaced to the client
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Object detection failed: {0}")]
    Detection(#[from] DetectionError),

    #[error("No images provided")]
    NoImages,

    #[error("Remote analysis failed: {0}")]
    Remote(String),
}

impl RequestError {
    /// HTTP status code for this failure
    pub fn status_code(&self) -> u16 {
        match self {
            RequestError::Decode(_) | RequestError::NoImages => 400,
            RequestError::Detection(_) => 500,
            RequestError::Remote(_) => 502,
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Confidence threshold must be in [0.0, 1.0], got {0}")]
    InvalidConfidenceThreshold(f32),

    #[error("IoU threshold must be in [0.0, 1.0], got {0}")]
    InvalidIoUThreshold(f32),

    #[error("Freshness threshold must be in [0.0, 1.0], got {0}")]
    InvalidFreshnessThreshold(f32),

    #[error("Invalid detection config: {0}")]
    InvalidDetectionConfig(String),

    #[error("Credential pool size must be > 0, got {0}")]
    InvalidPoolSize(usize),

    #[error("Invalid class strategy entry '{0}' (expected <class_id>:<perishable|packaged>)")]
    InvalidStrategy(String),

    #[error("Environment variable {name} has invalid value '{value}'")]
    EnvVarError { name: String, value: String },
}

pub type DetectionResult<T> = Result<T, DetectionError>;
pub type ClassificationResult<T> = Result<T, ClassificationError>;
pub type ItemResult<T> = Result<T, AnalysisError>;
pub type RequestResult<T> = Result<T, RequestError>;
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_are_stable() {
        assert_eq!(AnalysisError::UnsupportedClass(7).kind(), ErrorKind::UnsupportedClass);
        assert_eq!(
            AnalysisError::remote("HTTP 500").kind(),
            ErrorKind::RemoteAnalysis
        );
        let json = serde_json::to_string(&ErrorKind::UnsupportedClass).unwrap();
        assert_eq!(json, "\"unsupported_class\"");
        assert_eq!(ErrorKind::TaskFailed.as_str(), "task_failed");
    }

    #[test]
    fn test_remote_message_is_verbatim() {
        let err = AnalysisError::remote("API request failed: 429 - quota");
        assert_eq!(err.to_string(), "API request failed: 429 - quota");
    }

    #[test]
    fn test_request_error_status_codes() {
        assert_eq!(RequestError::Decode("bad".into()).status_code(), 400);
        assert_eq!(RequestError::NoImages.status_code(), 400);
        assert_eq!(
            RequestError::Detection(DetectionError::TaskFailed("x".into())).status_code(),
            500
        );
        assert_eq!(RequestError::Remote("down".into()).status_code(), 502);
    }
}
