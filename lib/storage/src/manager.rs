use crate::feature_cache::{CacheStatistics, FeatureCache};
use crate::fingerprint_store::{FingerprintStore, StoreStatistics};
use crate::legacy::{self, ImportReport, LegacyShape};
use crate::lmdb_storage::LmdbStorage;
use dedupx_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Store and cache statistics reported together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatistics {
    pub store: StoreStatistics,
    pub cache: CacheStatistics,
}

/// Owns everything persisted under one data directory:
/// `<data_dir>/lmdb` for fingerprints, `<data_dir>/features` for cached vectors.
pub struct StorageManager {
    data_dir: PathBuf,
    store: Arc<FingerprintStore>,
    cache: Arc<FeatureCache>,
}

impl StorageManager {
    pub fn new<P: AsRef<Path>>(data_dir: P, memory_cache_capacity: usize) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;

        let lmdb = Arc::new(LmdbStorage::new(data_dir.join("lmdb")).map_err(|e| Error::Storage(e.to_string()))?);
        let store = Arc::new(FingerprintStore::from_lmdb(lmdb));
        let cache = Arc::new(FeatureCache::open(data_dir.join("features"), memory_cache_capacity)?);

        info!(
            "Opened storage at {} ({} fingerprint records)",
            data_dir.display(),
            store.len()?
        );
        Ok(Self {
            data_dir,
            store,
            cache,
        })
    }

    #[inline]
    pub fn store(&self) -> &Arc<FingerprintStore> {
        &self.store
    }

    #[inline]
    pub fn cache(&self) -> &Arc<FeatureCache> {
        &self.cache
    }

    #[inline]
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn import_legacy<P: AsRef<Path>>(&self, path: P) -> Result<ImportReport> {
        legacy::import_legacy(&self.store, path)
    }

    pub fn export_legacy<P: AsRef<Path>>(&self, path: P, shape: LegacyShape, size: Option<u32>) -> Result<u64> {
        legacy::export_legacy(&self.store, path, shape, size)
    }

    pub fn statistics(&self) -> Result<EngineStatistics> {
        Ok(EngineStatistics {
            store: self.store.statistics()?,
            cache: self.cache.statistics(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dedupx_core::{FeatureVector, Fingerprint, FingerprintRecord, ImageIdentity};
    use crate::feature_cache::FeatureKey;
    use tempfile::TempDir;

    #[test]
    fn test_layout_and_statistics() {
        let dir = TempDir::new().unwrap();
        let manager = StorageManager::new(dir.path(), 8).unwrap();
        assert!(dir.path().join("lmdb").is_dir());
        assert!(dir.path().join("features").is_dir());

        let fp = Fingerprint::from_bits(2, &[true, false, false, true]).unwrap();
        manager
            .store()
            .put(&FingerprintRecord::new(ImageIdentity::new("/a.png"), fp))
            .unwrap();
        manager
            .cache()
            .put(
                &FeatureKey::new(ImageIdentity::new("/a.png"), "m1"),
                &FeatureVector::new(vec![1.0, 2.0], "m1"),
            )
            .unwrap();

        let stats = manager.statistics().unwrap();
        assert_eq!(stats.store.record_count, 1);
        assert_eq!(stats.cache.disk_entries, 1);
        assert_eq!(stats.cache.memory_capacity, 8);
    }
}
