//! # dedupx
//!
//! Near-duplicate image detection.
//!
//! Every image gets a cheap perceptual fingerprint, kept in an LMDB store so
//! it is computed once. Images whose fingerprints are within a Hamming
//! threshold form candidate groups; in refined mode those groups are split
//! again by the distance between model-derived feature vectors, which are
//! cached in memory and on disk. Each final group comes with a keep/delete
//! ordering. Nothing is ever deleted by the engine itself.
//!
//! ## Quick Start
//!
//! ### As a CLI
//!
//! ```bash
//! dedupx detect ~/Pictures --mode refined > report.json
//! dedupx import old_hashes.json.gz
//! dedupx stats
//! ```
//!
//! ### As a Library
//!
//! ```rust,no_run
//! use dedupx::prelude::*;
//!
//! let config = EngineConfig::default();
//! let detector = Detector::open(config.clone()).unwrap();
//!
//! let images = vec![ImageIdentity::new("/pics/a.jpg"), ImageIdentity::new("/pics/a_copy.png")];
//! let report = detector
//!     .detect(&images, DetectionMode::Refined, config.thresholds(), &Chain::quality())
//!     .unwrap();
//! for result in &report.results {
//!     println!("keep {} delete {:?}", result.decision.keep, result.decision.delete);
//! }
//! ```
//!
//! ## Crate Structure
//!
//! - `dedupx-core` - fingerprints, feature vectors, distances, clustering, ranking
//! - `dedupx-storage` - LMDB fingerprint store, legacy import/export, feature cache
//! - `dedupx-engine` - feature extraction service and the detection orchestrator

pub use dedupx_core::{
    Candidate, Chain, DetectionMode, DistanceEngine, Error, FeatureMetric, FeatureVector, Fingerprint,
    FingerprintRecord, GroupEdge, ImageIdentity, RankedDecision, RankingPolicy, Result, ScanFilter,
    SimilarityGroup, SourceKind,
};

pub use dedupx_storage::{
    EngineStatistics, FeatureCache, FeatureKey, FingerprintStore, ImportReport, LegacyShape, StorageManager,
};

pub use dedupx_engine::{
    BackendKind, BackendProvider, CancelToken, DetectionReport, DetectionResult, Detector, EngineConfig,
    FeatureExtractor, FsPixelSource, InferenceBackend, PixelSource, ReferenceMatch, RunFailure, Stage,
    Thresholds,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        CancelToken, Chain, DetectionMode, DetectionReport, Detector, EngineConfig, Error, FeatureVector,
        Fingerprint, FingerprintRecord, ImageIdentity, RankingPolicy, Result, StorageManager, Thresholds,
    };
}

/// Ranking policies
pub mod ranking {
    pub use dedupx_core::ranking::{policy_by_name, rank_group, LargestDimensions, LargestFile, Newest, ValueScore};
}
