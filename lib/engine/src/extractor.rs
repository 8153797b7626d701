//! Feature extraction service.
//!
//! One `FeatureExtractor` is built per process and shared by handle. It picks
//! a backend from an ordered preference list on first use, falls back to the
//! next entry when the active one fails, and retries transient failures with
//! exponential backoff. Backend calls run concurrently up to a fixed limit;
//! a call that outlives its timeout keeps its slot until it really returns.

use crate::config::EngineConfig;
use dedupx_core::simd::norm_simd;
use dedupx_core::{Error, FeatureVector, Result};
use image::imageops::FilterType;
use image::DynamicImage;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Accelerated,
    Cpu,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Accelerated => write!(f, "accelerated"),
            BackendKind::Cpu => write!(f, "cpu"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "accelerated" | "gpu" => Ok(BackendKind::Accelerated),
            "cpu" => Ok(BackendKind::Cpu),
            other => Err(Error::InvalidConfig(format!("unknown backend '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// Worth retrying on the same backend.
    #[error("transient backend failure: {0}")]
    Transient(String),
    /// The backend is unusable; move to the next one.
    #[error("fatal backend failure: {0}")]
    Fatal(String),
    /// This image cannot be embedded. The backend stays in service.
    #[error("rejected input: {0}")]
    InvalidInput(String),
}

/// A loaded model. Shared read-only across extraction calls.
pub trait InferenceBackend: Send + Sync {
    fn model_version(&self) -> &str;

    fn extract(&self, pixels: &DynamicImage) -> std::result::Result<Vec<f32>, BackendError>;
}

/// Knows how to load one kind of backend.
pub trait BackendProvider: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn load(&self) -> std::result::Result<Arc<dyn InferenceBackend>, BackendError>;
}

const EMBED_EDGE: u32 = 16;

/// Deterministic embedding from a downsampled RGB thumbnail: mean-centred
/// and scaled to unit length, so cosine distance tracks visual layout.
#[derive(Debug, Default, Clone, Copy)]
pub struct PixelEmbeddingBackend;

impl PixelEmbeddingBackend {
    pub const MODEL_VERSION: &'static str = "pixel-embed-v1";
}

impl InferenceBackend for PixelEmbeddingBackend {
    fn model_version(&self) -> &str {
        Self::MODEL_VERSION
    }

    fn extract(&self, pixels: &DynamicImage) -> std::result::Result<Vec<f32>, BackendError> {
        if pixels.width() == 0 || pixels.height() == 0 {
            return Err(BackendError::InvalidInput("empty image".to_string()));
        }
        let thumb = pixels
            .resize_exact(EMBED_EDGE, EMBED_EDGE, FilterType::Lanczos3)
            .to_rgb8();
        let mut data: Vec<f32> = thumb.as_raw().iter().map(|&c| f32::from(c) / 255.0).collect();

        let mean = data.iter().sum::<f32>() / data.len() as f32;
        for x in data.iter_mut() {
            *x -= mean;
        }
        let norm = norm_simd(&data);
        if norm <= f32::EPSILON {
            // Flat images all map to the same direction.
            let v = 1.0 / (data.len() as f32).sqrt();
            data.iter_mut().for_each(|x| *x = v);
        } else {
            data.iter_mut().for_each(|x| *x /= norm);
        }
        Ok(data)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CpuProvider;

impl BackendProvider for CpuProvider {
    fn kind(&self) -> BackendKind {
        BackendKind::Cpu
    }

    fn load(&self) -> std::result::Result<Arc<dyn InferenceBackend>, BackendError> {
        Ok(Arc::new(PixelEmbeddingBackend))
    }
}

struct ActiveBackend {
    kind: BackendKind,
    backend: Arc<dyn InferenceBackend>,
    /// Bumped on every activation so stale downgrade requests are ignored.
    generation: u64,
}

#[derive(Default)]
struct ServiceState {
    active: Option<ActiveBackend>,
    /// Index into the preference list of the next backend to try.
    next_candidate: usize,
    generation: u64,
    shut_down: bool,
}

/// Counting semaphore bounding concurrent backend calls.
struct Permits {
    available: Mutex<usize>,
    released: Condvar,
}

/// Owned so it can travel into a worker thread that outlives its caller.
struct PermitGuard(Arc<Permits>);

impl Permits {
    fn new(count: usize) -> Arc<Self> {
        Arc::new(Self {
            available: Mutex::new(count),
            released: Condvar::new(),
        })
    }

    fn acquire(self: &Arc<Self>) -> PermitGuard {
        let mut available = self.available.lock();
        while *available == 0 {
            self.released.wait(&mut available);
        }
        *available -= 1;
        PermitGuard(self.clone())
    }
}

impl Drop for PermitGuard {
    fn drop(&mut self) {
        *self.0.available.lock() += 1;
        self.0.released.notify_one();
    }
}

enum Failure {
    /// Transient failures outlasted the retry budget.
    Exhausted { attempts: u32, reason: String },
    /// The backend should be replaced.
    Downgrade(String),
    /// The image itself was refused.
    Rejected(String),
}

pub struct FeatureExtractor {
    providers: HashMap<BackendKind, Arc<dyn BackendProvider>>,
    preference: Vec<BackendKind>,
    state: Mutex<ServiceState>,
    permits: Arc<Permits>,
    retries: u32,
    backoff: Duration,
    timeout: Option<Duration>,
}

impl FeatureExtractor {
    /// An extractor with no providers registered.
    pub fn new(preference: Vec<BackendKind>, concurrency: usize) -> Self {
        Self {
            providers: HashMap::new(),
            preference,
            state: Mutex::new(ServiceState::default()),
            permits: Permits::new(concurrency.max(1)),
            retries: 3,
            backoff: Duration::from_millis(50),
            timeout: None,
        }
    }

    /// An extractor with the built-in CPU backend registered and the retry,
    /// timeout and concurrency settings of `config`.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.backend_preference.clone(), config.extraction_concurrency)
            .with_provider(CpuProvider)
            .with_retries(config.extraction_retries, config.retry_backoff())
            .with_timeout(config.extraction_timeout())
    }

    pub fn with_provider(mut self, provider: impl BackendProvider + 'static) -> Self {
        self.providers.insert(provider.kind(), Arc::new(provider));
        self
    }

    pub fn with_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.retries = retries;
        self.backoff = backoff;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Loads the first usable backend. Later calls return the already active
    /// one; concurrent first callers wait on the same load.
    pub fn initialize(&self) -> Result<BackendKind> {
        let mut state = self.state.lock();
        if let Some(active) = &state.active {
            return Ok(active.kind);
        }
        self.activate_next(&mut state)
    }

    /// Model version of the active backend, initializing if needed.
    pub fn model_version(&self) -> Result<String> {
        let (_, backend, _) = self.active()?;
        Ok(backend.model_version().to_string())
    }

    pub fn active_kind(&self) -> Option<BackendKind> {
        self.state.lock().active.as_ref().map(|a| a.kind)
    }

    /// Starts a fresh detection run. If an earlier run exhausted every
    /// backend, candidate selection restarts from the top of the preference
    /// list; an active backend is kept as is.
    pub fn begin_run(&self) {
        let mut state = self.state.lock();
        if state.active.is_none() && !state.shut_down && state.next_candidate > 0 {
            debug!("Re-arming feature backend selection");
            state.next_candidate = 0;
        }
    }

    /// Releases the active backend. Later calls fail with `ExtractionUnavailable`.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if let Some(active) = state.active.take() {
            info!("Releasing {} feature backend", active.kind);
        }
        state.shut_down = true;
    }

    pub fn extract(&self, pixels: &DynamicImage) -> Result<FeatureVector> {
        loop {
            let (kind, backend, generation) = self.active()?;
            match self.extract_with_retries(kind, &backend, pixels) {
                Ok(data) => return Ok(FeatureVector::new(data, backend.model_version())),
                Err(Failure::Exhausted { attempts, reason }) => {
                    return Err(Error::ExtractionFailed { attempts, reason })
                }
                Err(Failure::Rejected(reason)) => {
                    return Err(Error::ExtractionFailed { attempts: 1, reason })
                }
                Err(Failure::Downgrade(reason)) => self.downgrade(generation, &reason)?,
            }
        }
    }

    fn active(&self) -> Result<(BackendKind, Arc<dyn InferenceBackend>, u64)> {
        let mut state = self.state.lock();
        if state.active.is_none() {
            self.activate_next(&mut state)?;
        }
        match &state.active {
            Some(a) => Ok((a.kind, a.backend.clone(), a.generation)),
            None => Err(Error::ExtractionUnavailable("no active backend".to_string())),
        }
    }

    fn activate_next(&self, state: &mut ServiceState) -> Result<BackendKind> {
        if state.shut_down {
            return Err(Error::ExtractionUnavailable("extractor has been shut down".to_string()));
        }
        while state.next_candidate < self.preference.len() {
            let kind = self.preference[state.next_candidate];
            state.next_candidate += 1;

            let Some(provider) = self.providers.get(&kind) else {
                warn!("No {} feature backend registered, falling back", kind);
                continue;
            };
            match provider.load() {
                Ok(backend) => {
                    state.generation += 1;
                    info!(
                        "Loaded {} feature backend (model {})",
                        kind,
                        backend.model_version()
                    );
                    state.active = Some(ActiveBackend {
                        kind,
                        backend,
                        generation: state.generation,
                    });
                    return Ok(kind);
                }
                Err(e) => warn!("Failed to load {} feature backend, falling back: {}", kind, e),
            }
        }
        Err(Error::ExtractionUnavailable(format!(
            "all backends exhausted ({:?})",
            self.preference
        )))
    }

    fn downgrade(&self, generation: u64, reason: &str) -> Result<()> {
        let mut state = self.state.lock();
        let current = state.active.as_ref().map(|a| (a.kind, a.generation));
        match current {
            Some((kind, g)) if g == generation => {
                warn!("Dropping {} feature backend: {}", kind, reason);
                state.active = None;
                self.activate_next(&mut state).map(|_| ())
            }
            // Someone else already replaced it.
            Some(_) => Ok(()),
            None => self.activate_next(&mut state).map(|_| ()),
        }
    }

    fn extract_with_retries(
        &self,
        kind: BackendKind,
        backend: &Arc<dyn InferenceBackend>,
        pixels: &DynamicImage,
    ) -> std::result::Result<Vec<f32>, Failure> {
        let attempts = self.retries + 1;
        let mut timeouts = 0;
        let mut last = String::new();
        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = backoff_delay(self.backoff, attempt - 2);
                debug!("Retrying {} extraction in {:?} ({})", kind, delay, last);
                thread::sleep(delay);
            }
            match self.run_once(backend, pixels) {
                Ok(data) => return Ok(data),
                Err(Attempt::Backend(BackendError::Fatal(reason))) => {
                    return Err(Failure::Downgrade(reason))
                }
                Err(Attempt::Backend(BackendError::InvalidInput(reason))) => {
                    return Err(Failure::Rejected(reason))
                }
                Err(Attempt::Backend(BackendError::Transient(reason))) => last = reason,
                Err(Attempt::TimedOut(after)) => {
                    timeouts += 1;
                    last = format!("timed out after {:?}", after);
                }
            }
        }
        if timeouts == attempts {
            return Err(Failure::Downgrade(last));
        }
        Err(Failure::Exhausted {
            attempts,
            reason: last,
        })
    }

    fn run_once(
        &self,
        backend: &Arc<dyn InferenceBackend>,
        pixels: &DynamicImage,
    ) -> std::result::Result<Vec<f32>, Attempt> {
        let permit = self.permits.acquire();
        let Some(timeout) = self.timeout else {
            let outcome = backend.extract(pixels).map_err(Attempt::Backend);
            drop(permit);
            return outcome;
        };

        let (tx, rx) = mpsc::channel();
        let backend = backend.clone();
        let pixels = pixels.clone();
        thread::Builder::new()
            .name("dedupx-extract".to_string())
            .spawn(move || {
                let _permit = permit;
                let _ = tx.send(backend.extract(&pixels));
            })
            .map_err(|e| Attempt::Backend(BackendError::Transient(e.to_string())))?;

        match rx.recv_timeout(timeout) {
            Ok(outcome) => outcome.map_err(Attempt::Backend),
            // The worker finishes on its own and releases its permit then.
            Err(RecvTimeoutError::Timeout) => Err(Attempt::TimedOut(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(Attempt::Backend(BackendError::Fatal(
                "extraction thread panicked".to_string(),
            ))),
        }
    }
}

enum Attempt {
    Backend(BackendError),
    TimedOut(Duration),
}

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// `base * 2^step`, capped at `MAX_BACKOFF`.
fn backoff_delay(base: Duration, step: u32) -> Duration {
    base.checked_mul(2u32.saturating_pow(step))
        .map_or(MAX_BACKOFF, |d| d.min(MAX_BACKOFF))
}
