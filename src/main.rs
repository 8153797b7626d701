use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use dedupx_core::ranking::policy_by_name;
use dedupx_core::{DetectionMode, FeatureMetric, ImageIdentity};
use dedupx_engine::{BackendKind, Detector, EngineConfig};
use dedupx_storage::LegacyShape;
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use walkdir::WalkDir;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "webp", "tif", "tiff"];

/// Near-duplicate image detection
#[derive(Parser, Debug)]
#[command(name = "dedupx", version)]
#[command(about = "Find near-duplicate images", long_about = None)]
struct Args {
    /// JSON engine config; flags below override its fields
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Path to the data directory
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Group near-duplicates and print a JSON report
    Detect {
        /// Image files or directories (searched recursively)
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// fingerprint-only or refined
        #[arg(short, long, default_value = "refined")]
        mode: DetectionMode,

        /// Fingerprint Hamming threshold
        #[arg(long)]
        t1: Option<u32>,

        /// Feature distance threshold
        #[arg(long)]
        t2: Option<f64>,

        /// cosine or euclidean
        #[arg(long)]
        metric: Option<FeatureMetric>,

        /// quality, newest, largest_file or largest_dimensions
        #[arg(short, long, default_value = "quality")]
        policy: String,

        #[arg(short, long)]
        workers: Option<usize>,

        /// Backend preference, e.g. accelerated,cpu
        #[arg(long, value_delimiter = ',')]
        backend: Option<Vec<BackendKind>>,

        /// Write the report here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Import a legacy fingerprint file (.json or .json.gz)
    Import { file: PathBuf },
    /// Export stored fingerprints in the legacy format
    Export {
        file: PathBuf,

        /// nested or flat
        #[arg(long, default_value = "nested")]
        shape: LegacyShape,

        /// Only export fingerprints of this size
        #[arg(long)]
        size: Option<u32>,
    },
    /// Print store and cache statistics
    Stats,
    /// Report inputs that match a stored fingerprint outside the inputs
    Match {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        #[arg(long)]
        threshold: Option<u32>,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Reports go to stdout, so logs go to stderr.
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }

    match args.command {
        Command::Detect {
            paths,
            mode,
            t1,
            t2,
            metric,
            policy,
            workers,
            backend,
            output,
        } => {
            if let Some(t1) = t1 {
                config.fingerprint_threshold = t1;
            }
            if let Some(t2) = t2 {
                config.feature_threshold = t2;
            }
            if let Some(metric) = metric {
                config.feature_metric = metric;
            }
            if let Some(workers) = workers {
                config.workers = workers;
            }
            if let Some(backend) = backend {
                config.backend_preference = backend;
            }
            let Some(policy) = policy_by_name(&policy) else {
                bail!("Unknown ranking policy '{}'", policy);
            };

            let identities = collect_images(&paths)?;
            info!("Found {} images", identities.len());
            let detector = Detector::open(config.clone())?;
            let report = detector.detect(&identities, mode, config.thresholds(), policy.as_ref())?;
            detector.extractor().shutdown();

            let json = serde_json::to_string_pretty(&report)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)?;
                    info!("Report written to {}", path.display());
                }
                None => println!("{}", json),
            }
        }
        Command::Import { file } => {
            let detector = Detector::open(config)?;
            let report = detector.storage().import_legacy(&file)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Export { file, shape, size } => {
            let detector = Detector::open(config)?;
            let written = detector.storage().export_legacy(&file, shape, size)?;
            info!("Exported {} fingerprints to {}", written, file.display());
        }
        Command::Stats => {
            let detector = Detector::open(config)?;
            let stats = detector.statistics()?;
            let log = detector.storage().store().migration_log()?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "statistics": stats,
                    "migrations": log,
                }))?
            );
        }
        Command::Match { paths, threshold } => {
            let threshold = threshold.unwrap_or(config.fingerprint_threshold);
            let identities = collect_images(&paths)?;
            let detector = Detector::open(config)?;
            let matches = detector.match_reference(&identities, threshold)?;
            println!("{}", serde_json::to_string_pretty(&matches)?);
        }
    }

    Ok(())
}

/// Expands directories into the image files beneath them.
fn collect_images(paths: &[PathBuf]) -> anyhow::Result<Vec<ImageIdentity>> {
    let mut images = Vec::new();
    for path in paths {
        if path.is_dir() {
            for entry in WalkDir::new(path).into_iter().filter_map(Result::ok) {
                if entry.file_type().is_file() && is_image(entry.path()) {
                    images.push(identity_for(entry.path()));
                }
            }
        } else if path.is_file() {
            images.push(identity_for(path));
        } else {
            bail!("No such file or directory: {}", path.display());
        }
    }
    images.sort();
    images.dedup();
    Ok(images)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn identity_for(path: &Path) -> ImageIdentity {
    let absolute = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    ImageIdentity::new(absolute.to_string_lossy())
}
