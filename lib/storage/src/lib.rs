pub mod feature_cache;
pub mod fingerprint_store;
pub mod legacy;
pub mod lmdb_storage;
pub mod manager;

pub use feature_cache::{CacheStatistics, CacheTier, DiskTier, FeatureCache, FeatureKey, MemoryTier};
pub use fingerprint_store::{FingerprintStore, MigrationLogEntry, ScanCursor, ScanIter, StoreStatistics};
pub use legacy::{export_legacy, import_legacy, ImportReport, LegacyShape, SkippedEntry};
pub use lmdb_storage::LmdbStorage;
pub use manager::{EngineStatistics, StorageManager};
