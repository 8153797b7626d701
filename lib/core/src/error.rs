use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Incompatible fingerprints: size {left} vs size {right}")]
    IncompatibleFingerprint { left: u32, right: u32 },

    #[error("Incompatible feature vectors: {left} vs {right}")]
    IncompatibleFeatures { left: String, right: String },

    #[error("Invalid fingerprint: {0}")]
    InvalidFingerprint(String),

    #[error("Feature extraction failed after {attempts} attempt(s): {reason}")]
    ExtractionFailed { attempts: u32, reason: String },

    #[error("No feature extraction backend available: {0}")]
    ExtractionUnavailable(String),

    #[error("Store write failed: {0}")]
    StoreWriteFailed(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Cache write failed: {0}")]
    CacheWriteFailed(String),

    /// A concurrent computation for the same cache key failed; waiters observe this.
    #[error("Computation for {key} failed in another worker: {reason}")]
    ComputationAbandoned { key: String, reason: String },

    #[error("Skipped legacy entry {identity}: {reason}")]
    MigrationEntrySkipped { identity: String, reason: String },

    #[error("Failed to load image {identity}: {reason}")]
    ImageLoad { identity: String, reason: String },

    #[error("Detection run cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Errors that abort a detection run rather than excluding a single image.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ExtractionUnavailable(_)
                | Error::StoreWriteFailed(_)
                | Error::CacheWriteFailed(_)
                | Error::Storage(_)
                | Error::Cancelled
                | Error::IncompatibleFingerprint { .. }
                | Error::InvalidConfig(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
