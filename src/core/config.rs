use crate::core::errors::ConfigError;
use crate::core::types::{DetectionParams, Strategy, CLASS_PACKAGED, CLASS_PERISHABLE};
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::Level;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub log_level: Level,
}

/// Object detector configuration
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    pub model_path: String,
    pub input_size: u32,
    pub inference_backend: Option<String>,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
    pub agnostic_nms: bool,
    /// Label names indexed by class_id
    pub class_names: Vec<String>,
}

/// Local freshness classifier configuration
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub model_path: String,
    pub input_size: u32,
    /// Minimum fresh probability for a `fresh` verdict
    pub threshold: f32,
}

/// Remote vision API configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub api_keys: Vec<String>,
    /// N: credentials in the pool, the cap on concurrent remote calls
    pub pool_size: usize,
    pub base_url: String,
    pub model: String,
    pub timeout_seconds: u64,
    pub max_retries: u32,
}

/// Dispatch pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub class_strategies: HashMap<u32, Strategy>,
    /// When set, every crop is written here as `{index}.jpg`
    pub crop_archive_dir: Option<PathBuf>,
    /// Offset used to compute the local date for days-until-expiry
    pub expiry_utc_offset_minutes: i32,
    /// Number of ONNX sessions per model
    pub onnx_pool_size: usize,
}

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub detection: DetectionConfig,
    pub classifier: ClassifierConfig,
    pub api: ApiConfig,
    pub pipeline: PipelineConfig,
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T {
    lookup(name)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn string_or(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    lookup(name)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse `0:perishable,1:packaged` into a class -> strategy table
pub fn parse_class_strategies(raw: &str) -> Result<HashMap<u32, Strategy>, ConfigError> {
    let mut table = HashMap::new();
    for entry in split_list(raw) {
        let (class_id, strategy) = entry
            .split_once(':')
            .ok_or_else(|| ConfigError::InvalidStrategy(entry.clone()))?;
        let class_id: u32 = class_id
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidStrategy(entry.clone()))?;
        let strategy: Strategy = strategy
            .parse()
            .map_err(|_| ConfigError::InvalidStrategy(entry.clone()))?;
        table.insert(class_id, strategy);
    }
    Ok(table)
}

pub fn default_class_strategies() -> HashMap<u32, Strategy> {
    HashMap::from([
        (CLASS_PERISHABLE, Strategy::Perishable),
        (CLASS_PACKAGED, Strategy::Packaged),
    ])
}

impl Config {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let config = Self::from_lookup(|name| env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let log_level = lookup("LOG_LEVEL")
            .and_then(|s| match s.to_lowercase().as_str() {
                "trace" => Some(Level::TRACE),
                "debug" => Some(Level::DEBUG),
                "info" => Some(Level::INFO),
                "warn" | "warning" => Some(Level::WARN),
                "error" => Some(Level::ERROR),
                _ => None,
            })
            .unwrap_or(Level::INFO);

        // OPENAI_API_KEYS takes precedence over the single-key variable
        let api_keys = lookup("OPENAI_API_KEYS")
            .map(|keys| split_list(&keys))
            .filter(|keys| !keys.is_empty())
            .or_else(|| lookup("OPENAI_API_KEY").map(|key| split_list(&key)))
            .unwrap_or_default();

        let pool_size = match lookup("CREDENTIAL_POOL_SIZE") {
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::EnvVarError {
                name: "CREDENTIAL_POOL_SIZE".to_string(),
                value: raw.clone(),
            })?,
            None => api_keys.len().max(1),
        };

        let class_strategies = match lookup("CLASS_STRATEGIES") {
            Some(raw) if !raw.trim().is_empty() => parse_class_strategies(&raw)?,
            _ => default_class_strategies(),
        };

        let class_names = lookup("CLASS_NAMES")
            .map(|raw| split_list(&raw))
            .filter(|names| !names.is_empty())
            .unwrap_or_else(|| vec!["perishable".to_string(), "packaged".to_string()]);

        Ok(Self {
            server: ServerConfig {
                port: parse_or(&lookup, "SERVER_PORT", 8000),
                host: string_or(&lookup, "SERVER_HOST", "0.0.0.0"),
                log_level,
            },
            detection: DetectionConfig {
                model_path: string_or(&lookup, "DETECTOR_MODEL_PATH", "ml_models/detector.onnx"),
                input_size: parse_or(&lookup, "DETECTOR_INPUT_SIZE", 640),
                inference_backend: lookup("INFERENCE_BACKEND")
                    .map(|s| s.trim().to_uppercase())
                    .filter(|s| !s.is_empty()),
                confidence_threshold: parse_or(&lookup, "CONFIDENCE_THRESHOLD", 0.25),
                iou_threshold: parse_or(&lookup, "IOU_THRESHOLD", 0.5),
                max_detections: parse_or(&lookup, "MAX_DETECTIONS", 20),
                agnostic_nms: parse_or(&lookup, "AGNOSTIC_NMS", true),
                class_names,
            },
            classifier: ClassifierConfig {
                model_path: string_or(&lookup, "CLASSIFIER_MODEL_PATH", "ml_models/freshness.onnx"),
                input_size: parse_or(&lookup, "CLASSIFIER_INPUT_SIZE", 224),
                threshold: parse_or(&lookup, "FRESHNESS_THRESHOLD", 0.9),
            },
            api: ApiConfig {
                api_keys,
                pool_size,
                base_url: string_or(&lookup, "OPENAI_BASE_URL", "https://api.openai.com/v1"),
                model: string_or(&lookup, "OPENAI_MODEL", "gpt-4o-2024-08-06"),
                timeout_seconds: parse_or(&lookup, "API_TIMEOUT_SECONDS", 60),
                max_retries: parse_or(&lookup, "MAX_RETRIES", 0),
            },
            pipeline: PipelineConfig {
                class_strategies,
                crop_archive_dir: lookup("CROP_ARCHIVE_DIR")
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from),
                expiry_utc_offset_minutes: parse_or(&lookup, "EXPIRY_UTC_OFFSET_MINUTES", 330),
                onnx_pool_size: lookup("ONNX_POOL_SIZE")
                    .and_then(|s| s.trim().parse().ok())
                    .unwrap_or_else(|| std::cmp::max(num_cpus::get() / 2, 2)),
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        // Missing API keys are tolerated at startup; remote calls fail per item instead

        if !(0.0..=1.0).contains(&self.detection.confidence_threshold) {
            return Err(ConfigError::InvalidConfidenceThreshold(
                self.detection.confidence_threshold,
            ));
        }

        if !(0.0..=1.0).contains(&self.detection.iou_threshold) {
            return Err(ConfigError::InvalidIoUThreshold(self.detection.iou_threshold));
        }

        if !(0.0..=1.0).contains(&self.classifier.threshold) {
            return Err(ConfigError::InvalidFreshnessThreshold(self.classifier.threshold));
        }

        if self.detection.max_detections == 0 {
            return Err(ConfigError::InvalidDetectionConfig(
                "max_detections must be > 0".to_string(),
            ));
        }

        if !(32..=4096).contains(&self.detection.input_size) {
            return Err(ConfigError::InvalidDetectionConfig(format!(
                "detector input_size must be between 32 and 4096, got {}",
                self.detection.input_size
            )));
        }

        if !(16..=1024).contains(&self.classifier.input_size) {
            return Err(ConfigError::InvalidDetectionConfig(format!(
                "classifier input_size must be between 16 and 1024, got {}",
                self.classifier.input_size
            )));
        }

        if self.api.pool_size == 0 {
            return Err(ConfigError::InvalidPoolSize(self.api.pool_size));
        }

        if self.pipeline.onnx_pool_size == 0 {
            return Err(ConfigError::InvalidDetectionConfig(
                "onnx_pool_size must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn server_port(&self) -> u16 {
        self.server.port
    }

    pub fn server_host(&self) -> &str {
        &self.server.host
    }

    pub fn log_level(&self) -> Level {
        self.server.log_level
    }

    pub fn api_keys(&self) -> &[String] {
        &self.api.api_keys
    }

    pub fn credential_pool_size(&self) -> usize {
        self.api.pool_size
    }

    pub fn freshness_threshold(&self) -> f32 {
        self.classifier.threshold
    }

    pub fn onnx_pool_size(&self) -> usize {
        self.pipeline.onnx_pool_size
    }

    pub fn detection_params(&self) -> DetectionParams {
        DetectionParams {
            confidence_threshold: self.detection.confidence_threshold,
            iou_threshold: self.detection.iou_threshold,
            max_detections: self.detection.max_detections,
            agnostic_nms: self.detection.agnostic_nms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults_match_service_behavior() {
        let config = config_from(&[]).unwrap();
        config.validate().unwrap();

        let params = config.detection_params();
        assert_eq!(params.confidence_threshold, 0.25);
        assert_eq!(params.iou_threshold, 0.5);
        assert_eq!(params.max_detections, 20);
        assert!(params.agnostic_nms);
        assert_eq!(config.freshness_threshold(), 0.9);
        assert_eq!(config.credential_pool_size(), 1);
        assert_eq!(config.api.max_retries, 0);
        assert_eq!(
            config.pipeline.class_strategies.get(&CLASS_PERISHABLE),
            Some(&Strategy::Perishable)
        );
        assert_eq!(
            config.pipeline.class_strategies.get(&CLASS_PACKAGED),
            Some(&Strategy::Packaged)
        );
        assert!(config.pipeline.crop_archive_dir.is_none());
    }

    #[test]
    fn test_pool_size_follows_key_count() {
        let config = config_from(&[("OPENAI_API_KEYS", "k1, k2,,k3")]).unwrap();
        assert_eq!(config.api_keys(), &["k1", "k2", "k3"]);
        assert_eq!(config.credential_pool_size(), 3);

        let config = config_from(&[("OPENAI_API_KEY", "single"), ("CREDENTIAL_POOL_SIZE", "8")])
            .unwrap();
        assert_eq!(config.api_keys(), &["single"]);
        assert_eq!(config.credential_pool_size(), 8);
    }

    #[test]
    fn test_invalid_pool_size_is_rejected() {
        assert!(matches!(
            config_from(&[("CREDENTIAL_POOL_SIZE", "lots")]),
            Err(ConfigError::EnvVarError { .. })
        ));

        let config = config_from(&[("CREDENTIAL_POOL_SIZE", "0")]).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidPoolSize(0))));
    }

    #[test]
    fn test_threshold_validation() {
        let config = config_from(&[("CONFIDENCE_THRESHOLD", "1.5")]).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfidenceThreshold(_))
        ));

        let config = config_from(&[("FRESHNESS_THRESHOLD", "-0.1")]).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidFreshnessThreshold(_))
        ));
    }

    #[test]
    fn test_class_strategy_table_parsing() {
        let table = parse_class_strategies("0:perishable, 1:packaged, 4:Packaged").unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table[&4], Strategy::Packaged);

        assert!(matches!(
            parse_class_strategies("0-perishable"),
            Err(ConfigError::InvalidStrategy(_))
        ));
        assert!(matches!(
            parse_class_strategies("x:packaged"),
            Err(ConfigError::InvalidStrategy(_))
        ));
        assert!(matches!(
            parse_class_strategies("2:frozen"),
            Err(ConfigError::InvalidStrategy(_))
        ));
    }

    #[test]
    fn test_class_names_override() {
        let config = config_from(&[("CLASS_NAMES", "produce,box")]).unwrap();
        assert_eq!(config.detection.class_names, vec!["produce".to_string(), "box".to_string()]);
    }

    #[test]
    fn test_crop_archive_dir() {
        let config = config_from(&[("CROP_ARCHIVE_DIR", "Data")]).unwrap();
        assert_eq!(config.pipeline.crop_archive_dir, Some(PathBuf::from("Data")));
    }
}
