//! Legacy JSON fingerprint files.
//!
//! Two historical layouts exist. The nested one keeps entries under a
//! container key (`hashes`, or the older `files`/`results`):
//!
//! ```json
//! {"_hash_params": "hash_size=10;hash_version=1",
//!  "hashes": {"/a/1.jpg": {"hash": "…", "size": 10, "timestamp": 1700000000.5}}}
//! ```
//!
//! The flat one puts identity-keyed entries at the top level next to a few
//! reserved keys. An entry is either a bare hex string or an object. Files
//! ending in `.gz` are gzip-compressed.

use crate::fingerprint_store::{FingerprintStore, MigrationLogEntry};
use chrono::{DateTime, Utc};
use dedupx_core::{Error, Fingerprint, FingerprintRecord, ImageIdentity, Result, ScanFilter};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::{info, warn};

const NESTED_KEYS: [&str; 3] = ["hashes", "files", "results"];
const RESERVED_KEYS: [&str; 3] = ["_hash_params", "dry_run", "input_paths"];
const ENTRY_FIELDS: [&str; 7] = ["hash", "size", "timestamp", "file_size", "dimensions", "width", "height"];
const DEFAULT_LEGACY_SIZE: u32 = 10;
const HASH_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegacyShape {
    Nested,
    Flat,
}

impl LegacyShape {
    pub fn as_str(&self) -> &'static str {
        match self {
            LegacyShape::Nested => "nested",
            LegacyShape::Flat => "flat",
        }
    }
}

impl std::str::FromStr for LegacyShape {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "nested" | "new" => Ok(LegacyShape::Nested),
            "flat" | "old" => Ok(LegacyShape::Flat),
            other => Err(Error::InvalidConfig(format!("unknown legacy shape '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedEntry {
    pub identity: String,
    pub reason: String,
}

impl From<SkippedEntry> for Error {
    fn from(s: SkippedEntry) -> Self {
        Error::MigrationEntrySkipped {
            identity: s.identity,
            reason: s.reason,
        }
    }
}

/// Normalised content of one legacy document.
#[derive(Debug, Clone)]
pub struct ParsedLegacy {
    pub shape: LegacyShape,
    pub records: Vec<FingerprintRecord>,
    pub skipped: Vec<SkippedEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportReport {
    pub source: String,
    pub shape: LegacyShape,
    pub imported: u64,
    pub skipped: Vec<SkippedEntry>,
}

impl ImportReport {
    pub fn skipped_count(&self) -> u64 {
        self.skipped.len() as u64
    }
}

/// `hash_size=N;hash_version=V` -> N
fn params_size(doc: &Map<String, Value>) -> u32 {
    doc.get("_hash_params")
        .and_then(Value::as_str)
        .and_then(|params| {
            params.split(';').find_map(|pair| {
                let (k, v) = pair.split_once('=')?;
                (k.trim() == "hash_size").then(|| v.trim().parse().ok()).flatten()
            })
        })
        .unwrap_or(DEFAULT_LEGACY_SIZE)
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let secs = n.as_f64()?;
            let whole = secs.floor();
            let nanos = ((secs - whole) * 1e9).round().min(999_999_999.0) as u32;
            DateTime::from_timestamp(whole as i64, nanos)
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|d| d.with_timezone(&Utc)),
        _ => None,
    }
}

fn as_u32(value: Option<&Value>) -> Option<u32> {
    value.and_then(Value::as_u64).and_then(|v| u32::try_from(v).ok())
}

fn parse_entry(identity: &str, entry: &Value, default_size: u32) -> std::result::Result<FingerprintRecord, String> {
    if identity.is_empty() {
        return Err("empty identity".to_string());
    }
    let identity = ImageIdentity::new(identity);
    match entry {
        Value::String(hex) => {
            let fingerprint = Fingerprint::from_hex(hex, default_size).map_err(|e| e.to_string())?;
            Ok(FingerprintRecord::new(identity, fingerprint))
        }
        Value::Object(fields) => {
            let hex = fields
                .get("hash")
                .and_then(Value::as_str)
                .ok_or_else(|| "missing hash".to_string())?;
            let size = match fields.get("size") {
                None | Some(Value::Null) => default_size,
                Some(v) => as_u32(Some(v)).ok_or_else(|| format!("invalid size {}", v))?,
            };
            let fingerprint = Fingerprint::from_hex(hex, size).map_err(|e| e.to_string())?;
            let mut record = FingerprintRecord::new(identity, fingerprint);

            record.computed_at = fields.get("timestamp").and_then(parse_timestamp);
            record.file_size = fields.get("file_size").and_then(Value::as_u64);
            match fields.get("dimensions").and_then(Value::as_array) {
                Some(dims) if dims.len() == 2 => {
                    record.width = as_u32(dims.first());
                    record.height = as_u32(dims.get(1));
                }
                _ => {
                    record.width = as_u32(fields.get("width"));
                    record.height = as_u32(fields.get("height"));
                }
            }
            let extra: Map<String, Value> = fields
                .iter()
                .filter(|(k, _)| !ENTRY_FIELDS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            if !extra.is_empty() {
                record.metadata = Some(Value::Object(extra));
            }
            Ok(record)
        }
        other => Err(format!("unsupported entry type: {}", other)),
    }
}

/// Detects the shape and converts every entry it can. Only a document that
/// is not a JSON object fails; bad entries are collected in `skipped`.
pub fn parse_legacy(doc: &Value) -> Result<ParsedLegacy> {
    let root = doc
        .as_object()
        .ok_or_else(|| Error::Serialization("legacy document must be a JSON object".to_string()))?;
    let default_size = params_size(root);

    let nested = NESTED_KEYS
        .iter()
        .find_map(|key| root.get(*key).and_then(Value::as_object));
    let (shape, entries): (LegacyShape, Vec<(&String, &Value)>) = match nested {
        Some(container) => (LegacyShape::Nested, container.iter().collect()),
        None => (
            LegacyShape::Flat,
            root.iter()
                .filter(|(k, _)| !RESERVED_KEYS.contains(&k.as_str()))
                .collect(),
        ),
    };

    let mut records = Vec::with_capacity(entries.len());
    let mut skipped = Vec::new();
    for (identity, entry) in entries {
        match parse_entry(identity, entry, default_size) {
            Ok(record) => records.push(record),
            Err(reason) => skipped.push(SkippedEntry {
                identity: identity.clone(),
                reason,
            }),
        }
    }
    Ok(ParsedLegacy {
        shape,
        records,
        skipped,
    })
}

fn is_gzip(path: &Path) -> bool {
    path.extension().map(|e| e.eq_ignore_ascii_case("gz")).unwrap_or(false)
}

fn read_document(path: &Path) -> Result<Value> {
    let file = File::open(path)?;
    let mut raw = Vec::new();
    if is_gzip(path) {
        GzDecoder::new(BufReader::new(file)).read_to_end(&mut raw)?;
    } else {
        BufReader::new(file).read_to_end(&mut raw)?;
    }
    Ok(serde_json::from_slice(&raw)?)
}

/// Imports a legacy file into `store` in one batch and appends a migration
/// log entry. Malformed entries are skipped and reported, never fatal.
pub fn import_legacy<P: AsRef<Path>>(store: &FingerprintStore, path: P) -> Result<ImportReport> {
    let path = path.as_ref();
    let source = path.display().to_string();
    let parsed = parse_legacy(&read_document(path)?)?;

    for entry in &parsed.skipped {
        warn!("{}", Error::from(entry.clone()));
    }
    store.batch_put(&parsed.records)?;

    let report = ImportReport {
        source: source.clone(),
        shape: parsed.shape,
        imported: parsed.records.len() as u64,
        skipped: parsed.skipped,
    };
    store.record_migration(&MigrationLogEntry {
        source,
        shape: report.shape.as_str().to_string(),
        imported: report.imported,
        skipped: report.skipped_count(),
        at: Utc::now(),
    })?;
    info!(
        "Imported {} records from {} ({} shape, {} skipped)",
        report.imported,
        report.source,
        report.shape.as_str(),
        report.skipped_count()
    );
    Ok(report)
}

fn entry_value(record: &FingerprintRecord) -> Value {
    let mut fields = Map::new();
    if let Some(Value::Object(extra)) = &record.metadata {
        for (k, v) in extra {
            fields.insert(k.clone(), v.clone());
        }
    }
    fields.insert("hash".to_string(), Value::from(record.fingerprint.to_hex()));
    fields.insert("size".to_string(), Value::from(record.size()));
    if let Some(at) = record.computed_at {
        let secs = at.timestamp() as f64 + f64::from(at.timestamp_subsec_micros()) / 1e6;
        fields.insert("timestamp".to_string(), Value::from(secs));
    }
    if let Some(bytes) = record.file_size {
        fields.insert("file_size".to_string(), Value::from(bytes));
    }
    if let (Some(w), Some(h)) = (record.width, record.height) {
        fields.insert("dimensions".to_string(), Value::from(vec![w, h]));
    }
    Value::Object(fields)
}

/// Writes the store (or only records of `size`) as a legacy document. An
/// identity stored under several sizes is exported once, at its smallest size.
/// Returns the number of entries written.
pub fn export_legacy<P: AsRef<Path>>(
    store: &FingerprintStore,
    path: P,
    shape: LegacyShape,
    size: Option<u32>,
) -> Result<u64> {
    let path = path.as_ref();
    let filter = match size {
        Some(s) => ScanFilter::all().with_size(s),
        None => ScanFilter::all(),
    };

    let mut entries = Map::new();
    let mut params_size = size;
    for record in store.scan(filter) {
        let record = record?;
        params_size.get_or_insert(record.size());
        if !entries.contains_key(record.identity.as_str()) {
            entries.insert(record.identity.as_str().to_string(), entry_value(&record));
        }
    }
    let count = entries.len() as u64;
    let params = format!(
        "hash_size={};hash_version={}",
        params_size.unwrap_or(DEFAULT_LEGACY_SIZE),
        HASH_VERSION
    );

    let mut doc = Map::new();
    doc.insert("_hash_params".to_string(), Value::from(params));
    match shape {
        LegacyShape::Nested => {
            doc.insert("hashes".to_string(), Value::Object(entries));
        }
        LegacyShape::Flat => doc.extend(entries),
    }
    let bytes = serde_json::to_vec_pretty(&Value::Object(doc))?;

    let file = atomicwrites::AtomicFile::new(path, atomicwrites::AllowOverwrite);
    let gzip = is_gzip(path);
    file.write(|f| {
        if gzip {
            let mut encoder = GzEncoder::new(BufWriter::new(f), Compression::default());
            encoder.write_all(&bytes)?;
            encoder.finish()?.flush()
        } else {
            f.write_all(&bytes)
        }
    })
    .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;

    info!("Exported {} records to {} ({} shape)", count, path.display(), shape.as_str());
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    const HEX_100: &str = "8000000000000000000000001";

    #[test]
    fn test_nested_shape_with_malformed_entries() {
        let doc = json!({
            "_hash_params": "hash_size=10;hash_version=1",
            "hashes": {
                "/a/1.jpg": {"hash": HEX_100, "size": 10, "timestamp": 1700000000.0,
                             "file_size": 2048, "dimensions": [800, 600], "camera": "x"},
                "/a/2.jpg": HEX_100,
                "/a/3.jpg": {"size": 10},
                "/a/4.jpg": {"hash": "nothex", "size": 10},
                "/a/5.jpg": 42
            }
        });
        let parsed = parse_legacy(&doc).unwrap();
        assert_eq!(parsed.shape, LegacyShape::Nested);
        assert_eq!(parsed.records.len(), 2);
        assert_eq!(parsed.skipped.len(), 3);

        let first = parsed.records.iter().find(|r| r.identity.as_str() == "/a/1.jpg").unwrap();
        assert_eq!(first.file_size, Some(2048));
        assert_eq!((first.width, first.height), (Some(800), Some(600)));
        assert_eq!(first.computed_at.unwrap().timestamp(), 1_700_000_000);
        assert_eq!(first.metadata, Some(json!({"camera": "x"})));
    }

    #[test]
    fn test_flat_shape_ignores_reserved_keys() {
        let doc = json!({
            "_hash_params": "hash_size=2;hash_version=1",
            "dry_run": false,
            "input_paths": ["/a"],
            "/a/1.png": "9",
            "/a/2.png": {"hash": "6", "width": 3, "height": 4}
        });
        let parsed = parse_legacy(&doc).unwrap();
        assert_eq!(parsed.shape, LegacyShape::Flat);
        assert_eq!(parsed.records.len(), 2);
        assert!(parsed.skipped.is_empty());
        assert!(parsed.records.iter().all(|r| r.size() == 2));
        let second = parsed.records.iter().find(|r| r.identity.as_str() == "/a/2.png").unwrap();
        assert_eq!((second.width, second.height), (Some(3), Some(4)));
        assert!(second.computed_at.is_none());
    }

    #[test]
    fn test_older_container_keys() {
        let doc = json!({"files": {"/x.png": HEX_100}});
        let parsed = parse_legacy(&doc).unwrap();
        assert_eq!(parsed.shape, LegacyShape::Nested);
        assert_eq!(parsed.records.len(), 1);

        let doc = json!({"results": {"/y.png": {"hash": HEX_100}}});
        assert_eq!(parse_legacy(&doc).unwrap().records.len(), 1);
    }

    #[test]
    fn test_non_object_document_fails() {
        assert!(parse_legacy(&json!([1, 2, 3])).is_err());
    }

    #[test]
    fn test_import_counts_and_logs() {
        let dir = TempDir::new().unwrap();
        let store = FingerprintStore::open(dir.path().join("lmdb")).unwrap();
        let path = dir.path().join("legacy.json");
        std::fs::write(
            &path,
            serde_json::to_vec(&json!({
                "hashes": {"/a.jpg": HEX_100, "/b.jpg": HEX_100, "/c.jpg": "short"}
            }))
            .unwrap(),
        )
        .unwrap();

        let report = import_legacy(&store, &path).unwrap();
        assert_eq!(report.imported, 2);
        assert_eq!(report.skipped_count(), 1);
        assert_eq!(report.skipped[0].identity, "/c.jpg");
        assert_eq!(store.len().unwrap(), 2);

        let log = store.migration_log().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!((log[0].imported, log[0].skipped), (2, 1));
    }

    #[test]
    fn test_export_reimports_losslessly() {
        let dir = TempDir::new().unwrap();
        let store = FingerprintStore::open(dir.path().join("src")).unwrap();
        let bits: Vec<bool> = (0..100).map(|i| i % 7 == 0).collect();
        let record = FingerprintRecord::new(
            ImageIdentity::new("archive:///v.zip!/01.png"),
            Fingerprint::from_bits(10, &bits).unwrap(),
        )
        .computed_at(DateTime::from_timestamp(1_650_000_000, 0).unwrap())
        .with_file_size(4096)
        .with_dimensions(1200, 1800)
        .with_metadata(json!({"source": "scan"}));
        store.put(&record).unwrap();

        for (shape, name) in [(LegacyShape::Nested, "out.json.gz"), (LegacyShape::Flat, "out.json")] {
            let path = dir.path().join(name);
            assert_eq!(export_legacy(&store, &path, shape, None).unwrap(), 1);

            let target = FingerprintStore::open(dir.path().join(format!("dst-{}", name))).unwrap();
            let report = import_legacy(&target, &path).unwrap();
            assert_eq!(report.shape, shape);
            assert_eq!(report.imported, 1);
            assert_eq!(target.get(&record.identity, 10).unwrap().unwrap(), record);
        }
    }
}
