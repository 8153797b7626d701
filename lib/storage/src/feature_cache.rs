//! Tiered get-or-compute cache for feature vectors.
//!
//! Tiers are consulted in order (memory, then disk). A hit in a lower tier is
//! copied into the tiers above it; a computed vector is written to every tier,
//! most durable first. Concurrent misses on one key share a single
//! computation: the first caller computes, the rest wait for its result.

use atomicwrites::{AllowOverwrite, AtomicFile};
use dedupx_core::{Error, FeatureVector, ImageIdentity, Result};
use lru::LruCache;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeatureKey {
    pub identity: ImageIdentity,
    pub model_version: String,
}

impl FeatureKey {
    pub fn new(identity: ImageIdentity, model_version: impl Into<String>) -> Self {
        Self {
            identity,
            model_version: model_version.into(),
        }
    }
}

impl std::fmt::Display for FeatureKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.identity, self.model_version)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TierStats {
    pub entries: u64,
    pub bytes: u64,
}

/// One level of the cache. Implementations serialise access per key.
pub trait CacheTier: Send + Sync {
    fn name(&self) -> &'static str;

    fn get(&self, key: &FeatureKey) -> Result<Option<FeatureVector>>;

    fn put(&self, key: &FeatureKey, vector: &FeatureVector) -> Result<()>;

    /// Returns whether an entry was removed.
    fn invalidate(&self, key: &FeatureKey) -> Result<bool>;

    fn stats(&self) -> TierStats;
}

/// Bounded in-process tier with least-recently-used eviction.
pub struct MemoryTier {
    entries: Mutex<LruCache<FeatureKey, FeatureVector>>,
    capacity: usize,
}

impl MemoryTier {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            capacity: cap.get(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheTier for MemoryTier {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get(&self, key: &FeatureKey) -> Result<Option<FeatureVector>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn put(&self, key: &FeatureKey, vector: &FeatureVector) -> Result<()> {
        self.entries.lock().put(key.clone(), vector.clone());
        Ok(())
    }

    fn invalidate(&self, key: &FeatureKey) -> Result<bool> {
        Ok(self.entries.lock().pop(key).is_some())
    }

    fn stats(&self) -> TierStats {
        let entries = self.entries.lock();
        let bytes = entries
            .iter()
            .map(|(_, v)| (v.dim() * std::mem::size_of::<f32>()) as u64)
            .sum();
        TierStats {
            entries: entries.len() as u64,
            bytes,
        }
    }
}

/// What a disk entry holds; identity and model version are stored so a read
/// can verify it got the entry it asked for.
#[derive(Debug, Serialize, Deserialize)]
struct DiskEntry {
    identity: String,
    model_version: String,
    dim: u32,
    data: Vec<f32>,
}

/// Durable tier: one bincode file per key under `root/<xx>/<sha256>.bin`.
/// Never evicts on its own.
pub struct DiskTier {
    root: PathBuf,
}

impl DiskTier {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn entry_path(&self, key: &FeatureKey) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.identity.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(key.model_version.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        self.root.join(&digest[..2]).join(format!("{}.bin", digest))
    }

    fn discard(&self, path: &Path, key: &FeatureKey, reason: &str) {
        warn!("Discarding disk cache entry for {}: {}", key, reason);
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
    }
}

impl CacheTier for DiskTier {
    fn name(&self) -> &'static str {
        "disk"
    }

    fn get(&self, key: &FeatureKey) -> Result<Option<FeatureVector>> {
        let path = self.entry_path(key);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let entry: DiskEntry = match bincode::deserialize(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                self.discard(&path, key, &e.to_string());
                return Ok(None);
            }
        };
        if entry.identity != key.identity.as_str()
            || entry.model_version != key.model_version
            || entry.dim as usize != entry.data.len()
        {
            self.discard(&path, key, "identity, model version or dimension mismatch");
            return Ok(None);
        }
        Ok(Some(FeatureVector::new(entry.data, entry.model_version)))
    }

    fn put(&self, key: &FeatureKey, vector: &FeatureVector) -> Result<()> {
        let path = self.entry_path(key);
        let entry = DiskEntry {
            identity: key.identity.as_str().to_string(),
            model_version: vector.model_version().to_string(),
            dim: vector.dim() as u32,
            data: vector.as_slice().to_vec(),
        };
        let bytes = bincode::serialize(&entry).map_err(|e| Error::CacheWriteFailed(e.to_string()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::CacheWriteFailed(e.to_string()))?;
        }
        AtomicFile::new(&path, AllowOverwrite)
            .write(|f| f.write_all(&bytes))
            .map_err(|e| Error::CacheWriteFailed(format!("{}: {}", path.display(), e)))
    }

    fn invalidate(&self, key: &FeatureKey) -> Result<bool> {
        match fs::remove_file(self.entry_path(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn stats(&self) -> TierStats {
        let mut stats = TierStats::default();
        let Ok(shards) = fs::read_dir(&self.root) else {
            return stats;
        };
        for shard in shards.flatten() {
            let Ok(files) = fs::read_dir(shard.path()) else {
                continue;
            };
            for file in files.flatten() {
                if let Ok(meta) = file.metadata() {
                    if meta.is_file() {
                        stats.entries += 1;
                        stats.bytes += meta.len();
                    }
                }
            }
        }
        stats
    }
}

enum FlightState {
    Running,
    Done(std::result::Result<FeatureVector, String>),
}

struct Flight {
    state: Mutex<FlightState>,
    done: Condvar,
}

impl Flight {
    fn new() -> Self {
        Self {
            state: Mutex::new(FlightState::Running),
            done: Condvar::new(),
        }
    }

    fn finish(&self, outcome: std::result::Result<FeatureVector, String>) {
        *self.state.lock() = FlightState::Done(outcome);
        self.done.notify_all();
    }

    fn wait(&self) -> std::result::Result<FeatureVector, String> {
        let mut state = self.state.lock();
        loop {
            if let FlightState::Done(outcome) = &*state {
                return outcome.clone();
            }
            self.done.wait(&mut state);
        }
    }
}

/// Removes the in-flight slot when the leader returns or unwinds, so waiters
/// are never left blocked.
struct LeaderGuard<'a> {
    cache: &'a FeatureCache,
    key: &'a FeatureKey,
    flight: Arc<Flight>,
    finished: bool,
}

impl LeaderGuard<'_> {
    fn complete(mut self, outcome: std::result::Result<FeatureVector, String>) {
        self.cache.in_flight.lock().remove(self.key);
        self.flight.finish(outcome);
        self.finished = true;
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.cache.in_flight.lock().remove(self.key);
            self.flight.finish(Err("computation panicked".to_string()));
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStatistics {
    pub memory_entries: u64,
    pub memory_capacity: u64,
    pub disk_entries: u64,
    pub disk_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub computations: u64,
}

pub struct FeatureCache {
    tiers: Vec<Box<dyn CacheTier>>,
    memory_capacity: usize,
    in_flight: Mutex<HashMap<FeatureKey, Arc<Flight>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    computations: AtomicU64,
}

impl FeatureCache {
    /// Tiers are consulted front to back.
    pub fn new(tiers: Vec<Box<dyn CacheTier>>) -> Self {
        Self {
            tiers,
            memory_capacity: 0,
            in_flight: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            computations: AtomicU64::new(0),
        }
    }

    /// Memory tier of `capacity` entries over a disk tier rooted at `dir`.
    pub fn open<P: AsRef<Path>>(dir: P, capacity: usize) -> Result<Self> {
        let memory = MemoryTier::new(capacity);
        let memory_capacity = memory.capacity();
        let disk = DiskTier::new(dir)?;
        let mut cache = Self::new(vec![Box::new(memory), Box::new(disk)]);
        cache.memory_capacity = memory_capacity;
        Ok(cache)
    }

    /// Looks through the tiers without computing anything.
    pub fn get(&self, key: &FeatureKey) -> Result<Option<FeatureVector>> {
        for (level, tier) in self.tiers.iter().enumerate() {
            let found = match tier.get(key) {
                Ok(found) => found,
                Err(e) => {
                    warn!("{} tier read failed for {}: {}", tier.name(), key, e);
                    None
                }
            };
            if let Some(vector) = found {
                for upper in &self.tiers[..level] {
                    if let Err(e) = upper.put(key, &vector) {
                        warn!("Backfill into {} tier failed for {}: {}", upper.name(), key, e);
                    }
                }
                return Ok(Some(vector));
            }
        }
        Ok(None)
    }

    /// Returns the cached vector for `key`, or runs `compute` once and writes
    /// its result through every tier. Callers racing on the same key block on
    /// the first caller's computation.
    ///
    /// A computed vector is filed under its own model version, which may differ
    /// from `key.model_version` if the producer changed models.
    pub fn get_or_compute<F>(&self, key: &FeatureKey, compute: F) -> Result<FeatureVector>
    where
        F: FnOnce() -> Result<FeatureVector>,
    {
        if let Some(v) = self.get(key)? {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(v);
        }

        let leader = {
            let mut flights = self.in_flight.lock();
            match flights.get(key) {
                Some(flight) => Err(flight.clone()),
                None => {
                    let flight = Arc::new(Flight::new());
                    flights.insert(key.clone(), flight.clone());
                    Ok(flight)
                }
            }
        };

        let flight = match leader {
            Ok(flight) => flight,
            Err(other) => {
                debug!("Waiting on in-flight computation for {}", key);
                self.hits.fetch_add(1, Ordering::Relaxed);
                return other.wait().map_err(|reason| Error::ComputationAbandoned {
                    key: key.to_string(),
                    reason,
                });
            }
        };
        let guard = LeaderGuard {
            cache: self,
            key,
            flight,
            finished: false,
        };

        // Another leader may have finished between the first lookup and registration.
        if let Some(v) = self.get(key)? {
            self.hits.fetch_add(1, Ordering::Relaxed);
            guard.complete(Ok(v.clone()));
            return Ok(v);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        self.computations.fetch_add(1, Ordering::Relaxed);
        let outcome = compute().and_then(|v| {
            self.write_through(&FeatureKey::new(key.identity.clone(), v.model_version()), &v)?;
            Ok(v)
        });
        match outcome {
            Ok(v) => {
                guard.complete(Ok(v.clone()));
                Ok(v)
            }
            Err(e) => {
                guard.complete(Err(e.to_string()));
                Err(e)
            }
        }
    }

    fn write_through(&self, key: &FeatureKey, vector: &FeatureVector) -> Result<()> {
        for tier in self.tiers.iter().rev() {
            tier.put(key, vector)?;
        }
        Ok(())
    }

    /// Stores a vector directly, bypassing computation. The vector must come
    /// from the model named in `key`.
    pub fn put(&self, key: &FeatureKey, vector: &FeatureVector) -> Result<()> {
        if key.model_version != vector.model_version() {
            return Err(Error::IncompatibleFeatures {
                left: key.model_version.clone(),
                right: vector.model_version().to_string(),
            });
        }
        self.write_through(key, vector)
    }

    /// Drops `key` from every tier.
    pub fn invalidate(&self, key: &FeatureKey) -> Result<bool> {
        let mut removed = false;
        for tier in &self.tiers {
            removed |= tier.invalidate(key)?;
        }
        if removed {
            debug!("Invalidated cached features for {}", key);
        }
        Ok(removed)
    }

    pub fn statistics(&self) -> CacheStatistics {
        let mut stats = CacheStatistics {
            memory_capacity: self.memory_capacity as u64,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            computations: self.computations.load(Ordering::Relaxed),
            ..Default::default()
        };
        for tier in &self.tiers {
            let t = tier.stats();
            match tier.name() {
                "memory" => stats.memory_entries += t.entries,
                _ => {
                    stats.disk_entries += t.entries;
                    stats.disk_bytes += t.bytes;
                }
            }
        }
        stats
    }
}
