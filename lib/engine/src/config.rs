use crate::extractor::BackendKind;
use dedupx_core::fingerprint::MAX_FINGERPRINT_SIZE;
use dedupx_core::{Error, FeatureMetric, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine settings. Every field has a default, so a config file only needs
/// the values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    /// Fingerprint grid edge; a fingerprint has `size * size` bits.
    pub fingerprint_size: u32,
    /// Stage-1 threshold (Hamming distance, inclusive).
    pub fingerprint_threshold: u32,
    /// Stage-2 threshold (feature distance, inclusive).
    pub feature_threshold: f64,
    pub feature_metric: FeatureMetric,
    pub workers: usize,
    /// Upper bound on extractions running at once.
    pub extraction_concurrency: usize,
    pub backend_preference: Vec<BackendKind>,
    pub memory_cache_capacity: usize,
    /// Extra attempts after a transient extraction failure.
    pub extraction_retries: u32,
    pub retry_backoff_ms: u64,
    pub extraction_timeout_ms: Option<u64>,
    /// Decimal places feature distances are rounded to.
    pub distance_precision: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            fingerprint_size: 10,
            fingerprint_threshold: 16,
            feature_threshold: 0.02,
            feature_metric: FeatureMetric::Cosine,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            extraction_concurrency: 4,
            backend_preference: vec![BackendKind::Accelerated, BackendKind::Cpu],
            memory_cache_capacity: 1024,
            extraction_retries: 3,
            retry_backoff_ms: 50,
            extraction_timeout_ms: None,
            distance_precision: 6,
        }
    }
}

impl EngineConfig {
    /// Loads a JSON config file and validates it.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: EngineConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(2..=MAX_FINGERPRINT_SIZE).contains(&self.fingerprint_size) {
            return Err(Error::InvalidConfig(format!(
                "fingerprint_size must be in 2..={}",
                MAX_FINGERPRINT_SIZE
            )));
        }
        self.thresholds().validate()?;
        if self.workers == 0 {
            return Err(Error::InvalidConfig("workers must be at least 1".to_string()));
        }
        if self.extraction_concurrency == 0 {
            return Err(Error::InvalidConfig(
                "extraction_concurrency must be at least 1".to_string(),
            ));
        }
        if self.memory_cache_capacity == 0 {
            return Err(Error::InvalidConfig(
                "memory_cache_capacity must be at least 1".to_string(),
            ));
        }
        if self.backend_preference.is_empty() {
            return Err(Error::InvalidConfig("backend_preference is empty".to_string()));
        }
        Ok(())
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn extraction_timeout(&self) -> Option<Duration> {
        self.extraction_timeout_ms.map(Duration::from_millis)
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            fingerprint: self.fingerprint_threshold,
            feature: self.feature_threshold,
        }
    }
}

/// Stage thresholds for one detection run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub fingerprint: u32,
    pub feature: f64,
}

impl Thresholds {
    pub fn validate(&self) -> Result<()> {
        if !self.feature.is_finite() || self.feature < 0.0 {
            return Err(Error::InvalidConfig(
                "feature_threshold must be a non-negative number".to_string(),
            ));
        }
        Ok(())
    }
}
