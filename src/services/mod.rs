pub mod detection;
pub mod extraction;
pub mod freshness;
pub mod onnx_builder; // Shared ONNX session builder for the detector and classifier

// Re-export commonly used services
pub use detection::{ObjectDetector, YoloDetector};
pub use extraction::{OpenAiExtractor, VisionExtractor};
pub use freshness::{FreshnessClassifier, OnnxFreshnessClassifier};
