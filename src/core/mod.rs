pub mod config;
pub mod errors;
pub mod types;

// Re-export commonly used items for convenience
pub use config::Config;
pub use errors::{
    AnalysisError, ClassificationError, ConfigError, DetectionError, ErrorKind, RequestError,
};
pub use types::{
    AggregateItem, AnalysisResult, Detection, DetectionParams, FreshnessLabel, FreshnessRecord,
    ItemOutcome, ProductRecord, Strategy,
};
