// Library exports for the shelf product analysis service
//
// Detects products on a shelf photo, crops each detection and analyses the
// crops concurrently against a bounded pool of remote API credentials

// Core modules
pub mod core;
pub mod middleware;
pub mod orchestration;
pub mod services;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types and functions
pub use crate::core::{
    config::Config,
    errors::{AnalysisError, ConfigError, DetectionError, ErrorKind, RequestError},
    types::{AggregateItem, Detection, DetectionParams, ItemOutcome, ProductRecord, Strategy},
};

pub use middleware::{CircuitBreaker, CircuitBreakerConfig, CircuitState, CredentialPool};

pub use orchestration::{AnalysisRouter, BatchOrchestrator, DispatchEngine};

pub use services::{OnnxFreshnessClassifier, OpenAiExtractor, YoloDetector};

pub use utils::{Metrics, crop_and_encode_jpeg_async, load_image_from_memory_async};
