//! Durable `(identity, size) -> FingerprintRecord` map.
//!
//! Keys are `"{identity}\0{size:05}"`, so LMDB's byte order is identity order
//! and every size of one identity sits next to the others. Identities too long
//! for an LMDB key are stored under a truncated prefix plus the sha256 of the
//! full identity; the record itself always carries the full identity. Each
//! write is its own transaction; readers see either the old record or the new
//! one.

use crate::lmdb_storage::LmdbStorage;
use chrono::{DateTime, Utc};
use dedupx_core::{Error, FingerprintRecord, ImageIdentity, RecordFilter, Result, ScanFilter, SourceKind};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

const KEY_SEPARATOR: char = '\0';
const DIGEST_SEPARATOR: char = '\u{1}';
const SCAN_PAGE: usize = 256;
const TOP_N: usize = 10;

/// LMDB's default key limit is 511 bytes. Identities up to this length are
/// stored verbatim; longer ones are truncated to `KEY_PREFIX_BYTES` and
/// disambiguated by digest.
const MAX_INLINE_IDENTITY: usize = 440;
const KEY_PREFIX_BYTES: usize = 400;

/// Longest prefix of `s` within `max` bytes that ends on a char boundary.
fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn identity_key(identity: &str) -> String {
    if identity.len() <= MAX_INLINE_IDENTITY {
        return identity.to_string();
    }
    let digest = Sha256::digest(identity.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}{}{}", truncate_utf8(identity, KEY_PREFIX_BYTES), DIGEST_SEPARATOR, hex)
}

fn record_key(identity: &ImageIdentity, size: u32) -> String {
    format!("{}{}{:05}", identity_key(identity.as_str()), KEY_SEPARATOR, size)
}

fn decode_row(key: &str, data: &[u8]) -> Option<FingerprintRecord> {
    match serde_json::from_slice(data) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!("Skipping corrupt fingerprint record {:?}: {}", key, e);
            None
        }
    }
}

fn read_err(e: impl std::fmt::Display) -> Error {
    Error::Storage(e.to_string())
}

fn write_err(e: impl std::fmt::Display) -> Error {
    Error::StoreWriteFailed(e.to_string())
}

/// Aggregate counts over the whole store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStatistics {
    pub record_count: u64,
    /// Size of the LMDB data file.
    pub total_size_bytes: u64,
    /// Sum of the recorded source file sizes.
    pub source_bytes: u64,
    pub by_source_kind: BTreeMap<SourceKind, u64>,
    pub by_size: BTreeMap<u32, u64>,
    pub by_extension: Vec<(String, u64)>,
    pub by_archive: Vec<(String, u64)>,
}

/// One legacy import, as recorded in the migration log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationLogEntry {
    pub source: String,
    pub shape: String,
    pub imported: u64,
    pub skipped: u64,
    pub at: DateTime<Utc>,
}

/// Position after the last record a scan yielded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCursor(String);

pub struct FingerprintStore {
    lmdb: Arc<LmdbStorage>,
}

impl FingerprintStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let lmdb = LmdbStorage::new(path).map_err(read_err)?;
        Ok(Self::from_lmdb(Arc::new(lmdb)))
    }

    pub fn from_lmdb(lmdb: Arc<LmdbStorage>) -> Self {
        Self { lmdb }
    }

    pub fn get(&self, identity: &ImageIdentity, size: u32) -> Result<Option<FingerprintRecord>> {
        match self.lmdb.get(&record_key(identity, size)).map_err(read_err)? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// Upsert. Durable once this returns `Ok`.
    pub fn put(&self, record: &FingerprintRecord) -> Result<()> {
        let data = serde_json::to_vec(record)?;
        self.lmdb
            .put(&record_key(&record.identity, record.size()), &data)
            .map_err(write_err)
    }

    /// All-or-nothing upsert of many records.
    pub fn batch_put(&self, records: &[FingerprintRecord]) -> Result<()> {
        let entries = records
            .iter()
            .map(|r| Ok((record_key(&r.identity, r.size()), serde_json::to_vec(r)?)))
            .collect::<Result<Vec<_>>>()?;
        self.lmdb.put_many(&entries).map_err(write_err)?;
        debug!("Stored batch of {} fingerprint records", entries.len());
        Ok(())
    }

    pub fn delete(&self, identity: &ImageIdentity, size: u32) -> Result<bool> {
        self.lmdb.delete(&record_key(identity, size)).map_err(write_err)
    }

    pub fn len(&self) -> Result<u64> {
        self.lmdb.count().map_err(read_err)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Lazily iterates records matching `filter` in identity order.
    pub fn scan<F: RecordFilter>(&self, filter: F) -> ScanIter<F> {
        self.scan_after(filter, None)
    }

    /// Resumes a scan after `cursor` (see [`ScanIter::cursor`]).
    pub fn scan_after<F: RecordFilter>(&self, filter: F, cursor: Option<ScanCursor>) -> ScanIter<F> {
        ScanIter {
            lmdb: self.lmdb.clone(),
            filter,
            buffer: VecDeque::new(),
            fetched_up_to: cursor.as_ref().map(|c| c.0.clone()),
            yielded: cursor,
            exhausted: false,
        }
    }

    /// Exact lookup, falling back to the newest record of the same image
    /// stored under another extension (`a/01.png` for `a/01.webp`).
    pub fn lookup_any_format(&self, identity: &ImageIdentity, size: u32) -> Result<Option<FingerprintRecord>> {
        if let Some(record) = self.get(identity, size)? {
            return Ok(Some(record));
        }
        let base = identity.base();
        let mut best: Option<FingerprintRecord> = None;
        let rows = self
            .lmdb
            .with_prefix(truncate_utf8(base, KEY_PREFIX_BYTES))
            .map_err(read_err)?;
        for (key, data) in rows {
            let Some(record) = decode_row(&key, &data) else {
                continue;
            };
            if record.size() != size || record.identity == *identity || record.identity.base() != base {
                continue;
            }
            let newer = match &best {
                None => true,
                Some(current) => record.computed_at > current.computed_at,
            };
            if newer {
                best = Some(record);
            }
        }
        if let Some(found) = &best {
            debug!("{} resolved via alternate format {}", identity, found.identity);
        }
        Ok(best)
    }

    pub fn statistics(&self) -> Result<StoreStatistics> {
        let mut stats = StoreStatistics {
            total_size_bytes: self.lmdb.disk_size().map_err(read_err)?,
            ..Default::default()
        };
        let mut extensions: HashMap<String, u64> = HashMap::new();
        let mut archives: HashMap<String, u64> = HashMap::new();

        for record in self.scan(ScanFilter::all()) {
            let record = record?;
            stats.record_count += 1;
            stats.source_bytes += record.file_size.unwrap_or(0);
            *stats.by_source_kind.entry(record.source_kind).or_default() += 1;
            *stats.by_size.entry(record.size()).or_default() += 1;
            if let Some(ext) = record.identity.extension() {
                *extensions.entry(ext).or_default() += 1;
            }
            if let Some(archive) = record.identity.archive_name() {
                *archives.entry(archive.to_string()).or_default() += 1;
            }
        }
        stats.by_extension = top_n(extensions);
        stats.by_archive = top_n(archives);
        Ok(stats)
    }

    pub fn record_migration(&self, entry: &MigrationLogEntry) -> Result<()> {
        let data = serde_json::to_vec(entry)?;
        self.lmdb.append_migration(&data).map_err(write_err)?;
        Ok(())
    }

    /// Migration log, oldest first.
    pub fn migration_log(&self) -> Result<Vec<MigrationLogEntry>> {
        self.lmdb
            .migrations()
            .map_err(read_err)?
            .into_iter()
            .map(|(_, data)| Ok(serde_json::from_slice(&data)?))
            .collect()
    }

    pub fn disk_size(&self) -> Result<u64> {
        self.lmdb.disk_size().map_err(read_err)
    }
}

fn top_n(counts: HashMap<String, u64>) -> Vec<(String, u64)> {
    let mut sorted: Vec<(String, u64)> = counts.into_iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    sorted.truncate(TOP_N);
    sorted
}

/// Paged, restartable iterator over stored records. Every page is read in a
/// fresh transaction, so no read transaction outlives a `next` call.
pub struct ScanIter<F> {
    lmdb: Arc<LmdbStorage>,
    filter: F,
    buffer: VecDeque<(String, Vec<u8>)>,
    fetched_up_to: Option<String>,
    yielded: Option<ScanCursor>,
    exhausted: bool,
}

impl<F> ScanIter<F> {
    /// Where to resume with [`FingerprintStore::scan_after`] to continue
    /// after the last record this iterator returned.
    pub fn cursor(&self) -> Option<ScanCursor> {
        self.yielded.clone()
    }

    fn fill(&mut self) -> Result<()> {
        let page = self
            .lmdb
            .page_after(self.fetched_up_to.as_deref(), SCAN_PAGE)
            .map_err(read_err)?;
        if page.len() < SCAN_PAGE {
            self.exhausted = true;
        }
        if let Some((last, _)) = page.last() {
            self.fetched_up_to = Some(last.clone());
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl<F: RecordFilter> Iterator for ScanIter<F> {
    type Item = Result<FingerprintRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.buffer.is_empty() {
                if self.exhausted {
                    return None;
                }
                if let Err(e) = self.fill() {
                    self.exhausted = true;
                    return Some(Err(e));
                }
                continue;
            }
            let (key, data) = self.buffer.pop_front()?;
            let record = decode_row(&key, &data);
            self.yielded = Some(ScanCursor(key));
            let Some(record) = record else {
                continue;
            };
            if self.filter.matches(&record) {
                return Some(Ok(record));
            }
        }
    }
}
