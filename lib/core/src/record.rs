use crate::{Fingerprint, ImageIdentity, SourceKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A stored fingerprint together with what was known about its source when
/// it was computed. Unique per `(identity, size)`; replaced whole, never
/// patched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub identity: ImageIdentity,
    pub fingerprint: Fingerprint,
    pub computed_at: Option<DateTime<Utc>>,
    pub file_size: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub metadata: Option<serde_json::Value>,
    pub source_kind: SourceKind,
}

impl FingerprintRecord {
    #[must_use]
    pub fn new(identity: ImageIdentity, fingerprint: Fingerprint) -> Self {
        let source_kind = identity.source_kind();
        Self {
            identity,
            fingerprint,
            computed_at: None,
            file_size: None,
            width: None,
            height: None,
            metadata: None,
            source_kind,
        }
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> u32 {
        self.fingerprint.size()
    }

    #[must_use]
    pub fn computed_at(mut self, at: DateTime<Utc>) -> Self {
        self.computed_at = Some(at);
        self
    }

    #[must_use]
    pub fn with_file_size(mut self, bytes: u64) -> Self {
        self.file_size = Some(bytes);
        self
    }

    #[must_use]
    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Pixel area, when both dimensions are known.
    #[must_use]
    pub fn pixel_count(&self) -> Option<u64> {
        Some(u64::from(self.width?) * u64::from(self.height?))
    }
}
