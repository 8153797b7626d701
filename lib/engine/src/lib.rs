//! Detection engine for dedupx.
//!
//! Wires the fingerprint store and feature cache from `dedupx-storage` to the
//! clustering in `dedupx-core`, and owns the feature extraction service.

pub mod config;
pub mod extractor;
pub mod orchestrator;
pub mod pixels;

pub use config::{EngineConfig, Thresholds};
pub use extractor::{
    BackendError, BackendKind, BackendProvider, CpuProvider, FeatureExtractor, InferenceBackend,
    PixelEmbeddingBackend,
};
pub use orchestrator::{
    CancelToken, DetectionReport, DetectionResult, Detector, ReferenceMatch, RunFailure, SkippedImage, Stage,
};
pub use pixels::{FsPixelSource, LoadedImage, MemoryPixelSource, PixelSource};
