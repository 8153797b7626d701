//! Pairwise distance evaluation over a bounded rayon pool.
//!
//! Workers read the shared item slice and each computes whole rows of the
//! upper triangle, so no item data is copied per worker.

use crate::{Error, FeatureVector, Fingerprint, Result};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};

/// Distance between two items of the same kind. Must be symmetric.
pub trait Metric<T>: Sync {
    fn distance(&self, a: &T, b: &T) -> Result<f64>;
}

/// Hamming distance between fingerprints.
#[derive(Debug, Clone, Copy, Default)]
pub struct HammingMetric;

impl Metric<Fingerprint> for HammingMetric {
    #[inline]
    fn distance(&self, a: &Fingerprint, b: &Fingerprint) -> Result<f64> {
        Ok(f64::from(a.distance(b)?))
    }
}

/// Continuous metric over feature vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureMetric {
    /// `1 - cos(a, b)`
    #[default]
    Cosine,
    Euclidean,
}

impl Metric<FeatureVector> for FeatureMetric {
    #[inline]
    fn distance(&self, a: &FeatureVector, b: &FeatureVector) -> Result<f64> {
        let d = match self {
            FeatureMetric::Cosine => a.cosine_distance(b)?,
            FeatureMetric::Euclidean => a.l2_distance(b)?,
        };
        Ok(f64::from(d))
    }
}

impl std::str::FromStr for FeatureMetric {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cosine" => Ok(FeatureMetric::Cosine),
            "euclidean" | "l2" => Ok(FeatureMetric::Euclidean),
            other => Err(Error::InvalidConfig(format!("unknown feature metric '{}'", other))),
        }
    }
}

/// An undirected edge between two item indices, `a < b`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Edge {
    pub a: usize,
    pub b: usize,
    pub distance: f64,
}

/// Condensed upper triangle of a symmetric distance matrix. The diagonal is
/// implicit (always 0) and never stored.
#[derive(Debug, Clone)]
pub struct DistanceMatrix {
    n: usize,
    data: Vec<f64>,
}

impl DistanceMatrix {
    #[inline]
    pub fn len(&self) -> usize {
        self.n
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    #[inline]
    fn offset(&self, i: usize, j: usize) -> usize {
        i * self.n - i * (i + 1) / 2 + (j - i - 1)
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        match i.cmp(&j) {
            std::cmp::Ordering::Equal => 0.0,
            std::cmp::Ordering::Less => self.data[self.offset(i, j)],
            std::cmp::Ordering::Greater => self.data[self.offset(j, i)],
        }
    }
}

pub struct DistanceEngine {
    pool: ThreadPool,
    precision: u32,
}

impl DistanceEngine {
    /// `workers` bounds the pool; `precision` is the number of decimal places
    /// floating distances are rounded to before any threshold comparison.
    pub fn new(workers: usize, precision: u32) -> Result<Self> {
        if workers == 0 {
            return Err(Error::InvalidConfig("workers must be at least 1".to_string()));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("dedupx-worker-{}", i))
            .build()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        Ok(Self { pool, precision })
    }

    #[inline]
    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Runs `op` inside the engine's pool, so nested rayon work is bounded by it.
    pub fn install<R, OP>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }

    #[inline]
    pub fn round(&self, distance: f64) -> f64 {
        let scale = 10f64.powi(self.precision as i32);
        (distance * scale).round() / scale
    }

    fn rows<T, M, R, F>(&self, items: &[T], indices: &[usize], metric: &M, per_pair: F) -> Result<Vec<R>>
    where
        T: Sync,
        M: Metric<T>,
        R: Send,
        F: Fn(usize, usize, f64) -> Option<R> + Sync,
    {
        let rows: Vec<Vec<R>> = self.pool.install(|| {
            (0..indices.len())
                .into_par_iter()
                .map(|row| {
                    let i = indices[row];
                    let mut out = Vec::new();
                    for &j in &indices[row + 1..] {
                        let d = self.round(metric.distance(&items[i], &items[j])?);
                        if let Some(r) = per_pair(i, j, d) {
                            out.push(r);
                        }
                    }
                    Ok(out)
                })
                .collect::<Result<Vec<_>>>()
        })?;
        Ok(rows.into_iter().flatten().collect())
    }

    /// Full condensed distance matrix over `items`.
    pub fn pairwise<T, M>(&self, items: &[T], metric: &M) -> Result<DistanceMatrix>
    where
        T: Sync,
        M: Metric<T>,
    {
        let indices: Vec<usize> = (0..items.len()).collect();
        let data = self.rows(items, &indices, metric, |_, _, d| Some(d))?;
        Ok(DistanceMatrix { n: items.len(), data })
    }

    /// Every pair of `items` whose rounded distance is `<= threshold`.
    pub fn edges_within<T, M>(&self, items: &[T], metric: &M, threshold: f64) -> Result<Vec<Edge>>
    where
        T: Sync,
        M: Metric<T>,
    {
        let indices: Vec<usize> = (0..items.len()).collect();
        self.edges_among(items, &indices, metric, threshold)
    }

    /// Like [`DistanceEngine::edges_within`] but restricted to pairs drawn
    /// from `indices` (ascending). Edge endpoints are indices into `items`.
    pub fn edges_among<T, M>(
        &self,
        items: &[T],
        indices: &[usize],
        metric: &M,
        threshold: f64,
    ) -> Result<Vec<Edge>>
    where
        T: Sync,
        M: Metric<T>,
    {
        let threshold = self.round(threshold);
        self.rows(items, indices, metric, |a, b, distance| {
            (distance <= threshold).then_some(Edge { a, b, distance })
        })
    }
}
