//! Detection runs.
//!
//! A run fingerprints every input (fetching from the store when possible),
//! groups them by fingerprint distance, and for refined runs extracts feature
//! vectors for the members of stage-1 components only, then splits those
//! components by feature distance. Each final group is ordered by a ranking
//! policy. Source files are never touched; callers act on the decisions.

use crate::config::{EngineConfig, Thresholds};
use crate::extractor::FeatureExtractor;
use crate::pixels::{FsPixelSource, PixelSource};
use chrono::Utc;
use dedupx_core::cluster::{self, Component};
use dedupx_core::ranking::{rank_group, Candidate, RankedDecision, RankingPolicy};
use dedupx_core::{
    fingerprint, DetectionMode, DistanceEngine, Error, FeatureVector, FingerprintRecord, GroupEdge,
    HammingMetric, ImageIdentity, Result, SimilarityGroup,
};
use dedupx_storage::{EngineStatistics, FeatureKey, StorageManager};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fingerprint,
    Prefilter,
    Features,
    Refinement,
    Ranking,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Fingerprint => "fingerprint",
            Stage::Prefilter => "prefilter",
            Stage::Features => "features",
            Stage::Refinement => "refinement",
            Stage::Ranking => "ranking",
        };
        f.write_str(name)
    }
}

/// An aborted run. Store and cache writes made before the failure stay.
#[derive(Debug, thiserror::Error)]
#[error("detection run {run_id} failed in {stage} stage after {processed} identities: {source}")]
pub struct RunFailure {
    pub run_id: Uuid,
    pub stage: Stage,
    pub processed: usize,
    #[source]
    pub source: Error,
}

/// An input left out of the run because of a per-image error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedImage {
    pub identity: ImageIdentity,
    pub stage: Stage,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub group: SimilarityGroup,
    pub decision: RankedDecision,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionReport {
    pub run_id: Uuid,
    pub mode: DetectionMode,
    pub thresholds: Thresholds,
    pub results: Vec<DetectionResult>,
    /// Inputs that were fingerprinted.
    pub processed: usize,
    pub skipped: Vec<SkippedImage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

/// An input whose fingerprint is near a stored record outside the input set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceMatch {
    pub identity: ImageIdentity,
    pub reference: ImageIdentity,
    pub distance: u32,
}

/// Shared flag checked between stages.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct Detector {
    config: EngineConfig,
    storage: Arc<StorageManager>,
    extractor: Arc<FeatureExtractor>,
    pixels: Arc<dyn PixelSource>,
    engine: DistanceEngine,
}

struct RunContext {
    run_id: Uuid,
    skipped: Vec<SkippedImage>,
}

impl RunContext {
    fn fail(&self, stage: Stage, processed: usize, source: Error) -> RunFailure {
        RunFailure {
            run_id: self.run_id,
            stage,
            processed,
            source,
        }
    }

    fn skip(&mut self, identity: &ImageIdentity, stage: Stage, error: &Error) {
        warn!("Skipping {} in {} stage: {}", identity, stage, error);
        self.skipped.push(SkippedImage {
            identity: identity.clone(),
            stage,
            reason: error.to_string(),
        });
    }
}

impl Detector {
    pub fn new(
        config: EngineConfig,
        storage: Arc<StorageManager>,
        extractor: Arc<FeatureExtractor>,
        pixels: Arc<dyn PixelSource>,
    ) -> Result<Self> {
        config.validate()?;
        let engine = DistanceEngine::new(config.workers, config.distance_precision)?;
        Ok(Self {
            config,
            storage,
            extractor,
            pixels,
            engine,
        })
    }

    /// Opens storage under `config.data_dir` and decodes inputs from the filesystem.
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let storage = Arc::new(StorageManager::new(
            &config.data_dir,
            config.memory_cache_capacity,
        )?);
        let extractor = Arc::new(FeatureExtractor::from_config(&config));
        Self::new(config, storage, extractor, Arc::new(FsPixelSource::new()))
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[inline]
    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.storage
    }

    #[inline]
    pub fn extractor(&self) -> &Arc<FeatureExtractor> {
        &self.extractor
    }

    pub fn statistics(&self) -> Result<EngineStatistics> {
        self.storage.statistics()
    }

    pub fn detect(
        &self,
        identities: &[ImageIdentity],
        mode: DetectionMode,
        thresholds: Thresholds,
        policy: &dyn RankingPolicy,
    ) -> std::result::Result<DetectionReport, RunFailure> {
        self.detect_with_cancel(identities, mode, thresholds, policy, &CancelToken::new())
    }

    pub fn detect_with_cancel(
        &self,
        identities: &[ImageIdentity],
        mode: DetectionMode,
        thresholds: Thresholds,
        policy: &dyn RankingPolicy,
        cancel: &CancelToken,
    ) -> std::result::Result<DetectionReport, RunFailure> {
        let mut ctx = RunContext {
            run_id: Uuid::new_v4(),
            skipped: Vec::new(),
        };
        let _span = tracing::info_span!("detect", run_id = %ctx.run_id, ?mode).entered();
        thresholds
            .validate()
            .map_err(|e| ctx.fail(Stage::Fingerprint, 0, e))?;
        if mode == DetectionMode::Refined {
            self.extractor.begin_run();
        }

        let inputs: Vec<ImageIdentity> = identities
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        info!(
            "Detection run over {} identities (T1={}, T2={})",
            inputs.len(),
            thresholds.fingerprint,
            thresholds.feature
        );

        let records = self.ensure_fingerprints(&inputs, &mut ctx)?;
        let processed = records.len();

        let fingerprints: Vec<_> = records.iter().map(|r| r.fingerprint.clone()).collect();
        let components = cluster::prefilter(
            &self.engine,
            &fingerprints,
            &HammingMetric,
            f64::from(thresholds.fingerprint),
        )
        .map_err(|e| ctx.fail(Stage::Prefilter, processed, e))?;
        info!(
            "Stage 1: {} candidate groups from {} fingerprints",
            components.len(),
            processed
        );

        if cancel.is_cancelled() {
            info!("Run cancelled after stage 1");
            return Err(ctx.fail(Stage::Prefilter, processed, Error::Cancelled));
        }

        let (finals, model_version) = match mode {
            DetectionMode::FingerprintOnly => (components, None),
            DetectionMode::Refined if components.is_empty() => (components, None),
            DetectionMode::Refined => {
                let (vectors, model) = self.ensure_features(&records, &components, &mut ctx)?;
                if cancel.is_cancelled() {
                    info!("Run cancelled after feature extraction");
                    return Err(ctx.fail(Stage::Features, processed, Error::Cancelled));
                }
                let refined = self
                    .refine_all(&components, &vectors, thresholds.feature)
                    .map_err(|e| ctx.fail(Stage::Refinement, processed, e))?;
                info!(
                    "Stage 2: {} candidate groups refined into {}",
                    components.len(),
                    refined.len()
                );
                (refined, Some(model))
            }
        };

        let mut results = Vec::with_capacity(finals.len());
        for component in &finals {
            let group = self
                .build_group(&records, component, mode)
                .map_err(|e| ctx.fail(Stage::Ranking, processed, e))?;
            let candidates = component.members.iter().map(|&i| Candidate::from(&records[i])).collect();
            if let Some(decision) = rank_group(candidates, policy) {
                debug!("Group of {}: keep {}", group.len(), decision.keep);
                results.push(DetectionResult { group, decision });
            }
        }

        info!(
            "Run finished: {} groups, {} skipped (policy {})",
            results.len(),
            ctx.skipped.len(),
            policy.name()
        );
        Ok(DetectionReport {
            run_id: ctx.run_id,
            mode,
            thresholds,
            results,
            processed,
            skipped: ctx.skipped,
            model_version,
        })
    }

    /// Fingerprints for `inputs`, in input order, minus the ones that could
    /// not be produced.
    fn ensure_fingerprints(
        &self,
        inputs: &[ImageIdentity],
        ctx: &mut RunContext,
    ) -> std::result::Result<Vec<FingerprintRecord>, RunFailure> {
        let outcomes: Vec<Result<FingerprintRecord>> = self
            .engine
            .install(|| inputs.par_iter().map(|id| self.fingerprint_record(id)).collect());

        let mut records = Vec::with_capacity(inputs.len());
        let mut fatal = None;
        for (id, outcome) in inputs.iter().zip(outcomes) {
            match outcome {
                Ok(record) => records.push(record),
                Err(e) if e.is_fatal() => {
                    fatal.get_or_insert(e);
                }
                Err(e) => ctx.skip(id, Stage::Fingerprint, &e),
            }
        }
        if let Some(e) = fatal {
            return Err(ctx.fail(Stage::Fingerprint, records.len(), e));
        }
        Ok(records)
    }

    /// Stored record for `identity`, or a freshly computed and stored one.
    pub fn fingerprint_record(&self, identity: &ImageIdentity) -> Result<FingerprintRecord> {
        let size = self.config.fingerprint_size;
        let store = self.storage.store();
        if let Some(record) = store.get(identity, size)? {
            return Ok(record);
        }

        let loaded = self.pixels.load(identity)?;
        let fp = fingerprint::compute(&loaded.pixels, size)?;
        let mut record = FingerprintRecord::new(identity.clone(), fp)
            .computed_at(Utc::now())
            .with_dimensions(loaded.pixels.width(), loaded.pixels.height());
        if let Some(bytes) = loaded.file_size {
            record = record.with_file_size(bytes);
        }
        store.put(&record)?;
        debug!("Fingerprinted {}", identity);
        Ok(record)
    }

    /// Feature vectors for every member of a stage-1 component, keyed by
    /// record index. All returned vectors share one model version.
    fn ensure_features(
        &self,
        records: &[FingerprintRecord],
        components: &[Component],
        ctx: &mut RunContext,
    ) -> std::result::Result<(HashMap<usize, FeatureVector>, String), RunFailure> {
        let processed = records.len();
        let wanted: Vec<usize> = components.iter().flat_map(|c| c.members.iter().copied()).collect();
        let mut vectors: HashMap<usize, FeatureVector> = HashMap::with_capacity(wanted.len());
        let mut failed: HashSet<usize> = HashSet::new();

        // A backend downgrade mid-run changes the model; vectors from the old
        // one are recomputed once so every group compares like with like.
        let mut model = String::new();
        for pass in 0..2 {
            model = self
                .extractor
                .model_version()
                .map_err(|e| ctx.fail(Stage::Features, processed, e))?;
            let pending: Vec<usize> = wanted
                .iter()
                .copied()
                .filter(|i| !failed.contains(i))
                .filter(|i| vectors.get(i).map_or(true, |v| v.model_version() != model))
                .collect();
            if pending.is_empty() {
                break;
            }
            if pass > 0 {
                info!("Model changed to {}; recomputing {} vectors", model, pending.len());
            }

            let outcomes: Vec<(usize, Result<FeatureVector>)> = self.engine.install(|| {
                pending
                    .par_iter()
                    .map(|&i| (i, self.feature_vector(&records[i].identity, &model)))
                    .collect()
            });
            let mut fatal = None;
            for (i, outcome) in outcomes {
                match outcome {
                    Ok(v) => {
                        vectors.insert(i, v);
                    }
                    Err(e) if e.is_fatal() => {
                        fatal.get_or_insert(e);
                    }
                    Err(e) => {
                        failed.insert(i);
                        ctx.skip(&records[i].identity, Stage::Features, &e);
                    }
                }
            }
            if let Some(e) = fatal {
                return Err(ctx.fail(Stage::Features, processed, e));
            }
        }

        let stale: Vec<usize> = vectors
            .iter()
            .filter(|(_, v)| v.model_version() != model)
            .map(|(&i, _)| i)
            .collect();
        for i in stale {
            if let Some(v) = vectors.remove(&i) {
                let e = Error::IncompatibleFeatures {
                    left: v.model_version().to_string(),
                    right: model.clone(),
                };
                ctx.skip(&records[i].identity, Stage::Features, &e);
            }
        }
        Ok((vectors, model))
    }

    fn feature_vector(&self, identity: &ImageIdentity, model: &str) -> Result<FeatureVector> {
        let key = FeatureKey::new(identity.clone(), model);
        self.storage.cache().get_or_compute(&key, || {
            let loaded = self.pixels.load(identity)?;
            self.extractor.extract(&loaded.pixels)
        })
    }

    fn refine_all(
        &self,
        components: &[Component],
        vectors: &HashMap<usize, FeatureVector>,
        t2: f64,
    ) -> Result<Vec<Component>> {
        let mut refined = Vec::new();
        for component in components {
            let members: Vec<usize> = component
                .members
                .iter()
                .copied()
                .filter(|i| vectors.contains_key(i))
                .collect();
            let features: Vec<FeatureVector> = members
                .iter()
                .filter_map(|i| vectors.get(i).cloned())
                .collect();
            refined.extend(cluster::refine(
                &self.engine,
                &members,
                &features,
                &self.config.feature_metric,
                t2,
            )?);
        }
        Ok(refined)
    }

    fn build_group(
        &self,
        records: &[FingerprintRecord],
        component: &Component,
        mode: DetectionMode,
    ) -> Result<SimilarityGroup> {
        let mut edges = Vec::with_capacity(component.edges.len());
        for e in &component.edges {
            let (a, b) = (&records[e.a], &records[e.b]);
            let fingerprint_distance = a.fingerprint.distance(&b.fingerprint)?;
            edges.push(GroupEdge {
                a: a.identity.clone(),
                b: b.identity.clone(),
                fingerprint_distance,
                feature_distance: match mode {
                    DetectionMode::FingerprintOnly => None,
                    DetectionMode::Refined => Some(e.distance),
                },
            });
        }
        Ok(SimilarityGroup {
            members: component.members.iter().map(|&i| records[i].identity.clone()).collect(),
            edges,
        })
    }

    /// For each input, the closest stored record outside the input set whose
    /// fingerprint is within `threshold`. Inputs with no such record are omitted.
    pub fn match_reference(
        &self,
        identities: &[ImageIdentity],
        threshold: u32,
    ) -> std::result::Result<Vec<ReferenceMatch>, RunFailure> {
        let mut ctx = RunContext {
            run_id: Uuid::new_v4(),
            skipped: Vec::new(),
        };
        let _span = tracing::info_span!("match_reference", run_id = %ctx.run_id).entered();

        let input_set: BTreeSet<ImageIdentity> = identities.iter().cloned().collect();
        let inputs: Vec<ImageIdentity> = input_set.iter().cloned().collect();
        let records = self.ensure_fingerprints(&inputs, &mut ctx)?;
        let processed = records.len();

        let size = self.config.fingerprint_size;
        let references = self
            .storage
            .store()
            .scan(|r: &FingerprintRecord| r.size() == size && !input_set.contains(&r.identity))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| ctx.fail(Stage::Prefilter, processed, e))?;
        info!(
            "Matching {} inputs against {} stored references",
            processed,
            references.len()
        );

        let matches: Vec<Option<ReferenceMatch>> = self.engine.install(|| {
            records
                .par_iter()
                .map(|record| {
                    references
                        .iter()
                        .filter_map(|r| {
                            let d = record.fingerprint.distance(&r.fingerprint).ok()?;
                            (d <= threshold).then_some((d, &r.identity))
                        })
                        .min()
                        .map(|(distance, reference)| ReferenceMatch {
                            identity: record.identity.clone(),
                            reference: reference.clone(),
                            distance,
                        })
                })
                .collect()
        });
        Ok(matches.into_iter().flatten().collect())
    }
}
