// Record filters applied while scanning the fingerprint store
use crate::{FingerprintRecord, SourceKind};

pub trait RecordFilter {
    fn matches(&self, record: &FingerprintRecord) -> bool;
}

/// Conjunction of optional conditions; the default matches everything.
#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    pub size: Option<u32>,
    pub source_kind: Option<SourceKind>,
    pub identity_prefix: Option<String>,
    pub extension: Option<String>,
}

impl ScanFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_size(mut self, size: u32) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_source_kind(mut self, kind: SourceKind) -> Self {
        self.source_kind = Some(kind);
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.identity_prefix = Some(prefix.into());
        self
    }

    pub fn with_extension(mut self, ext: impl Into<String>) -> Self {
        self.extension = Some(ext.into().to_ascii_lowercase());
        self
    }
}

impl RecordFilter for ScanFilter {
    fn matches(&self, record: &FingerprintRecord) -> bool {
        if let Some(size) = self.size {
            if record.size() != size {
                return false;
            }
        }
        if let Some(kind) = self.source_kind {
            if record.source_kind != kind {
                return false;
            }
        }
        if let Some(prefix) = &self.identity_prefix {
            if !record.identity.as_str().starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(ext) = &self.extension {
            if record.identity.extension().as_deref() != Some(ext.as_str()) {
                return false;
            }
        }
        true
    }
}

impl<F> RecordFilter for F
where
    F: Fn(&FingerprintRecord) -> bool,
{
    fn matches(&self, record: &FingerprintRecord) -> bool {
        self(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Fingerprint, ImageIdentity};

    fn record(identity: &str, size: u32) -> FingerprintRecord {
        let bits = vec![false; (size * size) as usize];
        FingerprintRecord::new(
            ImageIdentity::new(identity),
            Fingerprint::from_bits(size, &bits).unwrap(),
        )
    }

    #[test]
    fn test_scan_filter_conditions() {
        let filter = ScanFilter::all()
            .with_size(8)
            .with_source_kind(SourceKind::File)
            .with_prefix("/photos/")
            .with_extension("JPG");

        assert!(filter.matches(&record("/photos/a.jpg", 8)));
        assert!(!filter.matches(&record("/photos/a.jpg", 10)));
        assert!(!filter.matches(&record("/music/a.jpg", 8)));
        assert!(!filter.matches(&record("/photos/a.png", 8)));
        assert!(!filter.matches(&record("https://x.org/photos/a.jpg", 8)));
    }

    #[test]
    fn test_closure_filter() {
        let only_archives = |r: &FingerprintRecord| r.source_kind == SourceKind::Archive;
        assert!(only_archives.matches(&record("a.zip!/1.png", 4)));
        assert!(!only_archives.matches(&record("/1.png", 4)));
    }
}
