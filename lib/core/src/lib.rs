//! # dedupx Core
//!
//! Core library for the dedupx near-duplicate image engine.
//!
//! This crate provides the pure, storage-free building blocks:
//!
//! - [`Fingerprint`] - DCT perceptual hash with Hamming distance
//! - [`FeatureVector`] - model-tagged embedding with cosine/L2 distance
//! - [`DistanceEngine`] - pairwise distances over a bounded worker pool
//! - [`cluster`] - two-stage union-find clustering
//! - [`ranking`] - keep/delete ordering policies
//!
//! ## Example
//!
//! ```rust
//! use dedupx_core::{cluster, DistanceEngine, Fingerprint, HammingMetric};
//!
//! let a = Fingerprint::from_bits(2, &[true, true, false, false]).unwrap();
//! let b = Fingerprint::from_bits(2, &[true, true, false, true]).unwrap();
//! let c = Fingerprint::from_bits(2, &[false, false, true, true]).unwrap();
//!
//! let engine = DistanceEngine::new(2, 6).unwrap();
//! let groups = cluster::prefilter(&engine, &[a, b, c], &HammingMetric, 1.0).unwrap();
//! assert_eq!(groups.len(), 1);
//! assert_eq!(groups[0].members, vec![0, 1]);
//! ```

pub mod cluster;
pub mod distance;
pub mod error;
pub mod filter;
pub mod fingerprint;
pub mod identity;
pub mod ranking;
pub mod record;
pub mod vector;

/// Distance kernels:
/// - popcount Hamming over fingerprint words
/// - AVX2/FMA dot product and squared L2 on x86_64, scalar elsewhere
pub mod simd;

pub use cluster::{Component, DetectionMode, GroupEdge, SimilarityGroup, UnionFind};
pub use distance::{DistanceEngine, DistanceMatrix, Edge, FeatureMetric, HammingMetric, Metric};
pub use error::{Error, Result};
pub use filter::{RecordFilter, ScanFilter};
pub use fingerprint::Fingerprint;
pub use identity::{ImageIdentity, SourceKind};
pub use ranking::{Candidate, Chain, RankedDecision, RankingPolicy};
pub use record::FingerprintRecord;
pub use vector::FeatureVector;
