// LMDB environment holding fingerprint records and the migration log
use anyhow::Result;
use heed::types::{Bytes, Str, U64};
use heed::byteorder::BE;
use heed::{Database, Env, EnvOpenOptions};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DB_FINGERPRINTS: &str = "fingerprints";
const DB_MIGRATION_LOG: &str = "migration_log";

/// Default map size; LMDB only reserves address space, not disk.
pub const DEFAULT_MAP_SIZE: usize = 16 * 1024 * 1024 * 1024;

pub struct LmdbStorage {
    env: Arc<Env>,
    path: PathBuf,
    fingerprints_db: Database<Str, Bytes>,
    migration_db: Database<U64<BE>, Bytes>,
}

impl LmdbStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::with_map_size(path, DEFAULT_MAP_SIZE)
    }

    pub fn with_map_size<P: AsRef<Path>>(path: P, map_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;

        let env = Arc::new(unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(4)
                .open(&path)?
        });

        let mut wtxn = env.write_txn()?;
        let fingerprints_db = env.create_database(&mut wtxn, Some(DB_FINGERPRINTS))?;
        let migration_db = env.create_database(&mut wtxn, Some(DB_MIGRATION_LOG))?;
        wtxn.commit()?;

        Ok(Self {
            env,
            path,
            fingerprints_db,
            migration_db,
        })
    }

    pub fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.fingerprints_db.put(&mut wtxn, key, data)?;
        wtxn.commit()?;
        Ok(())
    }

    /// Writes every entry in one transaction; nothing is visible unless all succeed.
    pub fn put_many(&self, entries: &[(String, Vec<u8>)]) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        for (key, data) in entries {
            self.fingerprints_db.put(&mut wtxn, key, data)?;
        }
        wtxn.commit()?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let rtxn = self.env.read_txn()?;
        match self.fingerprints_db.get(&rtxn, key)? {
            Some(data) => Ok(Some(data.to_vec())),
            None => Ok(None),
        }
    }

    pub fn delete(&self, key: &str) -> Result<bool> {
        let mut wtxn = self.env.write_txn()?;
        let existed = self.fingerprints_db.delete(&mut wtxn, key)?;
        wtxn.commit()?;
        Ok(existed)
    }

    /// Up to `limit` entries with keys strictly after `after`, in key order.
    /// Each call uses its own read transaction.
    pub fn page_after(&self, after: Option<&str>, limit: usize) -> Result<Vec<(String, Vec<u8>)>> {
        let rtxn = self.env.read_txn()?;
        let lower = match after {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        let range: (Bound<&str>, Bound<&str>) = (lower, Bound::Unbounded);
        let mut page = Vec::with_capacity(limit.min(1024));
        for result in self.fingerprints_db.range(&rtxn, &range)?.take(limit) {
            let (key, data) = result?;
            page.push((key.to_string(), data.to_vec()));
        }
        Ok(page)
    }

    /// All entries whose key starts with `prefix`.
    pub fn with_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let rtxn = self.env.read_txn()?;
        let range: (Bound<&str>, Bound<&str>) = (Bound::Included(prefix), Bound::Unbounded);
        let mut out = Vec::new();
        for result in self.fingerprints_db.range(&rtxn, &range)? {
            let (key, data) = result?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_string(), data.to_vec()));
        }
        Ok(out)
    }

    pub fn count(&self) -> Result<u64> {
        let rtxn = self.env.read_txn()?;
        Ok(self.fingerprints_db.len(&rtxn)?)
    }

    pub fn append_migration(&self, data: &[u8]) -> Result<u64> {
        let mut wtxn = self.env.write_txn()?;
        let next = match self.migration_db.last(&wtxn)? {
            Some((id, _)) => id + 1,
            None => 1,
        };
        self.migration_db.put(&mut wtxn, &next, data)?;
        wtxn.commit()?;
        Ok(next)
    }

    pub fn migrations(&self) -> Result<Vec<(u64, Vec<u8>)>> {
        let rtxn = self.env.read_txn()?;
        let mut entries = Vec::new();
        for result in self.migration_db.iter(&rtxn)? {
            let (id, data) = result?;
            entries.push((id, data.to_vec()));
        }
        Ok(entries)
    }

    /// Bytes used by the environment's data file.
    pub fn disk_size(&self) -> Result<u64> {
        Ok(std::fs::metadata(self.path.join("data.mdb"))?.len())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
