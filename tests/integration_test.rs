// Integration tests for dedupx
use dedupx::prelude::*;
use dedupx::{BackendKind, FeatureCache, FeatureKey, FingerprintStore, LegacyShape};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn scene(seed: u32, w: u32, h: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(w, h, |x, y| {
        let fx = x as f32 / w as f32;
        let fy = y as f32 / h as f32;
        let s = seed as f32;
        let r = ((fx * 3.0 + s).sin() * 0.5 + 0.5) * 255.0;
        let g = ((fy * 2.0 + s * 1.7).cos() * 0.5 + 0.5) * 255.0;
        let b = (((fx + fy) * 4.0 + s * 0.3).sin() * 0.5 + 0.5) * 255.0;
        Rgb([r as u8, g as u8, b as u8])
    }))
}

fn save(dir: &Path, name: &str, image: &DynamicImage) -> ImageIdentity {
    let path = dir.join(name);
    image.save_with_format(&path, ImageFormat::Png).unwrap();
    ImageIdentity::new(path.to_string_lossy())
}

fn fingerprint(seed: u64) -> Fingerprint {
    let bits: Vec<bool> = (0..100).map(|i| (seed >> (i % 64)) & 1 == 1 || i % 7 == 0).collect();
    Fingerprint::from_bits(10, &bits).unwrap()
}

fn cpu_config(data_dir: &Path) -> EngineConfig {
    EngineConfig {
        data_dir: data_dir.to_path_buf(),
        workers: 4,
        backend_preference: vec![BackendKind::Cpu],
        ..Default::default()
    }
}

#[test]
fn test_store_put_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = FingerprintStore::open(dir.path()).unwrap();
    let record = FingerprintRecord::new(ImageIdentity::new("/photos/x.jpg"), fingerprint(0xdead_beef))
        .with_file_size(1234)
        .with_dimensions(640, 480);

    store.put(&record).unwrap();
    assert_eq!(store.get(&record.identity, 10).unwrap(), Some(record.clone()));
    store.put(&record).unwrap();
    assert_eq!(store.len().unwrap(), 1);
    assert_eq!(store.get(&record.identity, 10).unwrap(), Some(record));
}

#[test]
fn test_legacy_import_counts_valid_and_malformed() {
    let dir = TempDir::new().unwrap();
    let storage = StorageManager::new(dir.path().join("data"), 16).unwrap();

    let valid = 5;
    let mut hashes = serde_json::Map::new();
    for i in 0..valid {
        hashes.insert(
            format!("/legacy/{}.png", i),
            serde_json::json!({
                "hash": fingerprint(i as u64 * 977 + 1).to_hex(),
                "size": 10,
                "timestamp": 1_600_000_000.5 + i as f64,
                "file_size": 1000 + i,
                "dimensions": [100, 80],
            }),
        );
    }
    hashes.insert("/legacy/bad_hex.png".into(), serde_json::json!({"hash": "zz-not-hex"}));
    hashes.insert("/legacy/no_hash.png".into(), serde_json::json!({"size": 10}));
    hashes.insert("/legacy/number.png".into(), serde_json::json!(42));
    let doc = serde_json::json!({"_hash_params": "hash_size=10;hash_version=1", "hashes": hashes});
    let path = dir.path().join("hashes.json");
    std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

    let report = storage.import_legacy(&path).unwrap();
    assert_eq!(report.imported, valid);
    assert_eq!(report.skipped_count(), 3);
    assert_eq!(report.shape, LegacyShape::Nested);
    assert_eq!(storage.store().len().unwrap(), valid);

    let log = storage.store().migration_log().unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!((log[0].imported, log[0].skipped), (valid, 3));
}

#[test]
fn test_export_reimports_into_fresh_store() {
    let dir = TempDir::new().unwrap();
    let source = StorageManager::new(dir.path().join("a"), 4).unwrap();
    for i in 0..4u64 {
        let record = FingerprintRecord::new(ImageIdentity::new(format!("/e/{}.jpg", i)), fingerprint(i + 11))
            .with_file_size(10 * i)
            .with_dimensions(32, 24);
        source.store().put(&record).unwrap();
    }
    let file = dir.path().join("export.json.gz");
    assert_eq!(source.export_legacy(&file, LegacyShape::Nested, None).unwrap(), 4);

    let target = StorageManager::new(dir.path().join("b"), 4).unwrap();
    let report = target.import_legacy(&file).unwrap();
    assert_eq!(report.imported, 4);
    for i in 0..4u64 {
        let id = ImageIdentity::new(format!("/e/{}.jpg", i));
        let got = target.store().get(&id, 10).unwrap().unwrap();
        assert_eq!(got.fingerprint, fingerprint(i + 11));
        assert_eq!(got.file_size, Some(10 * i));
        assert_eq!((got.width, got.height), (Some(32), Some(24)));
    }
}

#[test]
fn test_cache_computes_once_for_concurrent_callers() {
    let dir = TempDir::new().unwrap();
    let cache = Arc::new(FeatureCache::open(dir.path(), 8).unwrap());
    let calls = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(6));
    let key = FeatureKey::new(ImageIdentity::new("/shared.png"), "m1");

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let (cache, calls, barrier, key) = (cache.clone(), calls.clone(), barrier.clone(), key.clone());
            thread::spawn(move || {
                barrier.wait();
                cache
                    .get_or_compute(&key, || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(50));
                        Ok(FeatureVector::new(vec![0.25, 0.5, 0.75], "m1"))
                    })
                    .unwrap()
            })
        })
        .collect();
    let results: Vec<FeatureVector> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(results.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn test_detect_end_to_end() {
    let pics = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();

    let beach = scene(3, 320, 240);
    let beach_id = save(pics.path(), "beach.png", &beach);
    let beach_small_id = save(pics.path(), "beach_small.png", &beach.resize_exact(160, 120, FilterType::Lanczos3));
    let city_id = save(pics.path(), "city.png", &scene(57, 320, 240));
    let missing = ImageIdentity::new(pics.path().join("gone.png").to_string_lossy());

    let config = cpu_config(data.path());
    let detector = Detector::open(config.clone()).unwrap();
    let inputs = vec![city_id.clone(), beach_small_id.clone(), beach_id.clone(), missing.clone()];

    for mode in [DetectionMode::FingerprintOnly, DetectionMode::Refined] {
        let report = detector
            .detect(&inputs, mode, config.thresholds(), &Chain::quality())
            .unwrap();
        assert_eq!(report.processed, 3);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].identity, missing);
        assert_eq!(report.results.len(), 1, "mode {:?}", mode);

        let result = &report.results[0];
        assert_eq!(result.group.members.len(), 2);
        assert!(!result.group.members.contains(&city_id));
        // Larger dimensions win.
        assert_eq!(result.decision.keep, beach_id);
        assert_eq!(result.decision.delete, vec![beach_small_id.clone()]);
        for edge in &result.group.edges {
            assert!(edge.fingerprint_distance <= config.fingerprint_threshold);
        }
    }

    // Source files are untouched.
    assert!(Path::new(beach_small_id.as_str()).exists());

    let stats = detector.statistics().unwrap();
    assert_eq!(stats.store.record_count, 3);
    assert_eq!(stats.cache.disk_entries, 2);
    assert!(stats.store.source_bytes > 0);
}

#[test]
fn test_detect_cancel_keeps_cached_work() {
    let pics = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    let a = save(pics.path(), "a.png", &scene(9, 200, 150));
    let b = save(pics.path(), "b.png", &scene(9, 200, 150).resize_exact(100, 75, FilterType::Lanczos3));

    let config = cpu_config(data.path());
    let detector = Detector::open(config.clone()).unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();
    let err = detector
        .detect_with_cancel(&[a.clone(), b.clone()], DetectionMode::Refined, config.thresholds(), &Chain::quality(), &cancel)
        .unwrap_err();
    assert!(matches!(err.source, Error::Cancelled));

    // The next run picks up the stored fingerprints and completes.
    let report = detector
        .detect(&[a, b], DetectionMode::Refined, config.thresholds(), &Chain::quality())
        .unwrap();
    assert_eq!(report.results.len(), 1);
}
