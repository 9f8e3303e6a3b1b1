//! Persistent content cache for extracted bytes and decoded geometry.
//!
//! Uses LMDB (via heed) for key-value storage with ACID guarantees. The store
//! is split into a fixed, closed set of namespaces: the archive file map, raw
//! extracted bytes, decoded geometry and bounds (vanilla and modded), and a
//! metadata record. Readers snapshot beside the single serialized writer, so
//! lookups never block an in-flight batch write.

use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvFlags, EnvOpenOptions, RoTxn};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Documented upper bound for the store size.
pub const MAX_CACHE_SIZE: usize = 64 * 1024 * 1024 * 1024;
/// Floor below which LMDB map resizing churn is not worth it.
pub const MIN_CACHE_SIZE: usize = 16 * 1024 * 1024;
pub const DEFAULT_CACHE_SIZE: usize = 4 * 1024 * 1024 * 1024;

const MAX_DBS: u32 = 16;

type BytesDb = Database<Str, Bytes>;

/// Closed set of logical databases inside the one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    FileMap,
    ExtractedRaw,
    VanillaGeometry,
    ModdedGeometry,
    VanillaBounds,
    ModdedBounds,
    Metadata,
}

impl Namespace {
    pub const ALL: [Namespace; 7] = [
        Namespace::FileMap,
        Namespace::ExtractedRaw,
        Namespace::VanillaGeometry,
        Namespace::ModdedGeometry,
        Namespace::VanillaBounds,
        Namespace::ModdedBounds,
        Namespace::Metadata,
    ];

    pub fn db_name(self) -> &'static str {
        match self {
            Namespace::FileMap => "file_map",
            Namespace::ExtractedRaw => "extracted_raw",
            Namespace::VanillaGeometry => "vanilla_geometry",
            Namespace::ModdedGeometry => "modded_geometry",
            Namespace::VanillaBounds => "vanilla_bounds",
            Namespace::ModdedBounds => "modded_bounds",
            Namespace::Metadata => "metadata",
        }
    }
}

/// Keys are stored with control characters stripped; archive entry listings
/// occasionally carry stray carriage returns or embedded NULs.
pub fn normalize_key(raw: &str) -> String {
    raw.chars().filter(|c| !c.is_control()).collect()
}

#[derive(Debug)]
pub struct ContentCache {
    env: Env,
    db_path: PathBuf,
    map_size: usize,
    dbs: HashMap<Namespace, BytesDb>,
}

impl ContentCache {
    /// Open (or create) the store at `db_path` with at most `max_size` bytes
    /// of capacity. The size is clamped to `[MIN_CACHE_SIZE, MAX_CACHE_SIZE]`.
    pub fn open(db_path: &Path, max_size: usize) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let map_size = max_size.clamp(MIN_CACHE_SIZE, MAX_CACHE_SIZE);
        let env = open_env(db_path, map_size)?;

        let mut dbs = HashMap::with_capacity(Namespace::ALL.len());
        let mut wtxn = env.write_txn()?;
        for ns in Namespace::ALL {
            let db = env.create_database::<Str, Bytes>(&mut wtxn, Some(ns.db_name()))?;
            dbs.insert(ns, db);
        }
        wtxn.commit()?;

        Ok(Self {
            env,
            db_path: db_path.to_path_buf(),
            map_size,
            dbs,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn map_size(&self) -> usize {
        self.map_size
    }

    fn db(&self, ns: Namespace) -> BytesDb {
        // All namespaces are created in open(); the map is total.
        self.dbs[&ns]
    }

    /// Store one entry. Empty keys (after normalization) and empty payloads
    /// are rejected without touching the store.
    pub fn put(&self, ns: Namespace, key: &str, bytes: &[u8]) -> Result<()> {
        let key = validate_key(key)?;
        if bytes.is_empty() {
            return Err(Error::invalid(format!("empty payload for key: {key}")));
        }

        let mut wtxn = self.env.write_txn()?;
        self.db(ns).put(&mut wtxn, &key, bytes)?;
        wtxn.commit()?;
        Ok(())
    }

    /// Store many entries in one transaction. Any invalid entry or storage
    /// failure aborts the whole batch; no entry becomes visible.
    pub fn batch_put(&self, ns: Namespace, entries: &[(String, Vec<u8>)]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }

        let db = self.db(ns);
        let mut wtxn = self.env.write_txn()?;
        for (raw_key, bytes) in entries {
            let key = validate_key(raw_key)?;
            if bytes.is_empty() {
                return Err(Error::invalid(format!("empty payload for key: {key}")));
            }
            db.put(&mut wtxn, &key, bytes)?;
        }
        wtxn.commit()?;
        Ok(entries.len())
    }

    pub fn get(&self, ns: Namespace, key: &str) -> Result<Option<Vec<u8>>> {
        let key = normalize_key(key);
        let rtxn = self.env.read_txn()?;
        Ok(self.db(ns).get(&rtxn, &key)?.map(<[u8]>::to_vec))
    }

    /// Order-preserving multi-get under a single read snapshot.
    pub fn get_many(&self, ns: Namespace, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        let db = self.db(ns);
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let key = normalize_key(key);
            out.push(db.get(&rtxn, &key)?.map(<[u8]>::to_vec));
        }
        Ok(out)
    }

    pub fn entry_count(&self, ns: Namespace) -> Result<u64> {
        let rtxn = self.env.read_txn()?;
        Ok(self.db(ns).len(&rtxn)?)
    }

    /// Remove every entry in the namespace. Succeeds even when nothing was
    /// ever written to it.
    pub fn drop_namespace(&self, ns: Namespace) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.db(ns).clear(&mut wtxn)?;
        wtxn.commit()?;
        Ok(())
    }

    /// Close and reopen the store with a new capacity. Consumes the handle:
    /// resizing requires exclusive access, and giving up the old handle is
    /// what guarantees it in-process.
    pub fn resize(self, new_max: usize) -> Result<Self> {
        let path = self.db_path.clone();
        let Self { env, dbs, .. } = self;
        drop(dbs);
        env.prepare_for_closing().wait();
        Self::open(&path, new_max)
    }

    /// Relocate the store. The old copy is discarded only after the new one
    /// has been opened and verified; a failure at any earlier point leaves
    /// the old store untouched on disk.
    pub fn move_to(self, new_path: &Path) -> Result<Self> {
        let old_path = self.db_path.clone();
        let map_size = self.map_size;
        let Self { env, dbs, .. } = self;
        drop(dbs);
        env.prepare_for_closing().wait();

        if let Some(parent) = new_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&old_path, new_path)?;

        let moved = match Self::open(new_path, map_size) {
            Ok(cache) => cache,
            Err(e) => {
                // Verification failed: remove the partial copy, keep the old
                // store as the source of truth.
                let _ = std::fs::remove_file(new_path);
                let _ = std::fs::remove_file(lock_path(new_path));
                return Err(e);
            }
        };

        let _ = std::fs::remove_file(&old_path);
        let _ = std::fs::remove_file(lock_path(&old_path));
        Ok(moved)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let rtxn = self.env.read_txn()?;
        let mut namespaces = Vec::with_capacity(Namespace::ALL.len());
        for ns in Namespace::ALL {
            let (entries, bytes) = table_usage(&self.db(ns), &rtxn)?;
            namespaces.push(NamespaceStats {
                name: ns.db_name().to_string(),
                entries,
                bytes,
            });
        }

        let file_bytes = std::fs::metadata(&self.db_path).map(|m| m.len()).unwrap_or(0);
        Ok(CacheStats {
            db_path: self.db_path.to_string_lossy().to_string(),
            map_size: self.map_size as u64,
            file_bytes,
            namespaces,
        })
    }
}

fn validate_key(raw: &str) -> Result<String> {
    let key = normalize_key(raw);
    if key.is_empty() {
        return Err(Error::invalid("empty key"));
    }
    Ok(key)
}

fn open_env(db_path: &Path, map_size: usize) -> Result<Env> {
    let mut options = EnvOpenOptions::new();
    options.map_size(map_size);
    options.max_dbs(MAX_DBS);
    // SAFETY: We do not use NO_LOCK and keep default LMDB locking guarantees.
    // NO_SUB_DIR keeps the store as a single data file next to its lock file.
    unsafe {
        options.flags(EnvFlags::NO_SUB_DIR);
        options.open(db_path).map_err(Error::from)
    }
}

pub(crate) fn lock_path(db_path: &Path) -> PathBuf {
    let mut os = db_path.as_os_str().to_os_string();
    os.push("-lock");
    PathBuf::from(os)
}

fn table_usage(db: &BytesDb, rtxn: &RoTxn<'_>) -> Result<(u64, u64)> {
    let mut entries = 0u64;
    let mut bytes = 0u64;
    for item in db.iter(rtxn)? {
        let (k, v) = item?;
        entries += 1;
        bytes += (k.len() + v.len()) as u64;
    }
    Ok((entries, bytes))
}

#[derive(Debug, Serialize)]
pub struct NamespaceStats {
    pub name: String,
    pub entries: u64,
    pub bytes: u64,
}

#[derive(Debug, Serialize)]
pub struct CacheStats {
    pub db_path: String,
    pub map_size: u64,
    pub file_bytes: u64,
    pub namespaces: Vec<NamespaceStats>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_db_path(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!(
            "redcache_test_{}_{}_{}.lmdb",
            std::process::id(),
            nanos,
            name
        ))
    }

    fn cleanup(path: &Path) {
        let _ = std::fs::remove_file(path);
        let _ = std::fs::remove_file(lock_path(path));
    }

    #[test]
    fn put_then_get_roundtrips() -> Result<()> {
        let path = temp_db_path("roundtrip");
        let cache = ContentCache::open(&path, MIN_CACHE_SIZE)?;

        cache.put(Namespace::ExtractedRaw, "base\\test.mesh", b"payload")?;
        assert_eq!(
            cache.get(Namespace::ExtractedRaw, "base\\test.mesh")?.as_deref(),
            Some(&b"payload"[..])
        );
        assert_eq!(cache.get(Namespace::ExtractedRaw, "missing")?, None);

        drop(cache);
        cleanup(&path);
        Ok(())
    }

    #[test]
    fn empty_key_or_payload_is_rejected_without_writing() -> Result<()> {
        let path = temp_db_path("empty_args");
        let cache = ContentCache::open(&path, MIN_CACHE_SIZE)?;

        assert!(matches!(
            cache.put(Namespace::ExtractedRaw, "", b"x"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            cache.put(Namespace::ExtractedRaw, "key", b""),
            Err(Error::InvalidArgument(_))
        ));
        // A key that is nothing but control characters normalizes to empty.
        assert!(matches!(
            cache.put(Namespace::ExtractedRaw, "\u{1}\u{2}", b"x"),
            Err(Error::InvalidArgument(_))
        ));

        let stats = cache.stats()?;
        let raw = stats
            .namespaces
            .iter()
            .find(|n| n.name == "extracted_raw")
            .unwrap();
        assert_eq!(raw.entries, 0);

        drop(cache);
        cleanup(&path);
        Ok(())
    }

    #[test]
    fn keys_are_normalized_on_store_and_lookup() -> Result<()> {
        let path = temp_db_path("normalize");
        let cache = ContentCache::open(&path, MIN_CACHE_SIZE)?;

        cache.put(Namespace::ExtractedRaw, "base\\a.mesh\r\n", b"x")?;
        assert_eq!(
            cache.get(Namespace::ExtractedRaw, "base\\a.mesh")?.as_deref(),
            Some(&b"x"[..])
        );

        drop(cache);
        cleanup(&path);
        Ok(())
    }

    #[test]
    fn batch_put_is_atomic() -> Result<()> {
        let path = temp_db_path("batch_atomic");
        let cache = ContentCache::open(&path, MIN_CACHE_SIZE)?;

        let entries = vec![
            ("a".to_string(), b"1".to_vec()),
            ("b".to_string(), b"2".to_vec()),
            // malformed entry aborts everything before and after it
            (String::new(), b"3".to_vec()),
            ("d".to_string(), b"4".to_vec()),
        ];
        assert!(matches!(
            cache.batch_put(Namespace::FileMap, &entries),
            Err(Error::InvalidArgument(_))
        ));

        assert_eq!(cache.get(Namespace::FileMap, "a")?, None);
        assert_eq!(cache.get(Namespace::FileMap, "b")?, None);
        assert_eq!(cache.get(Namespace::FileMap, "d")?, None);

        let ok = vec![
            ("a".to_string(), b"1".to_vec()),
            ("b".to_string(), b"2".to_vec()),
        ];
        assert_eq!(cache.batch_put(Namespace::FileMap, &ok)?, 2);
        assert_eq!(cache.get(Namespace::FileMap, "a")?.as_deref(), Some(&b"1"[..]));

        drop(cache);
        cleanup(&path);
        Ok(())
    }

    #[test]
    fn get_many_preserves_order() -> Result<()> {
        let path = temp_db_path("get_many");
        let cache = ContentCache::open(&path, MIN_CACHE_SIZE)?;

        cache.put(Namespace::ExtractedRaw, "one", b"1")?;
        cache.put(Namespace::ExtractedRaw, "three", b"3")?;

        let keys = vec!["one".to_string(), "two".to_string(), "three".to_string()];
        let got = cache.get_many(Namespace::ExtractedRaw, &keys)?;
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].as_deref(), Some(&b"1"[..]));
        assert_eq!(got[1], None);
        assert_eq!(got[2].as_deref(), Some(&b"3"[..]));

        drop(cache);
        cleanup(&path);
        Ok(())
    }

    #[test]
    fn drop_namespace_is_idempotent() -> Result<()> {
        let path = temp_db_path("drop_ns");
        let cache = ContentCache::open(&path, MIN_CACHE_SIZE)?;

        // never written to
        cache.drop_namespace(Namespace::ModdedBounds)?;
        cache.drop_namespace(Namespace::ModdedBounds)?;

        cache.put(Namespace::FileMap, "k", b"v")?;
        cache.drop_namespace(Namespace::FileMap)?;
        assert_eq!(cache.get(Namespace::FileMap, "k")?, None);

        drop(cache);
        cleanup(&path);
        Ok(())
    }

    #[test]
    fn resize_reopens_and_keeps_data() -> Result<()> {
        let path = temp_db_path("resize");
        let cache = ContentCache::open(&path, MIN_CACHE_SIZE)?;
        cache.put(Namespace::ExtractedRaw, "k", b"v")?;

        let cache = cache.resize(MIN_CACHE_SIZE * 2)?;
        assert_eq!(cache.map_size(), MIN_CACHE_SIZE * 2);
        assert_eq!(cache.get(Namespace::ExtractedRaw, "k")?.as_deref(), Some(&b"v"[..]));

        drop(cache);
        cleanup(&path);
        Ok(())
    }

    #[test]
    fn move_to_relocates_and_discards_old_copy() -> Result<()> {
        let path = temp_db_path("move_src");
        let dest = temp_db_path("move_dst");
        let cache = ContentCache::open(&path, MIN_CACHE_SIZE)?;
        cache.put(Namespace::ExtractedRaw, "k", b"v")?;

        let cache = cache.move_to(&dest)?;
        assert_eq!(cache.get(Namespace::ExtractedRaw, "k")?.as_deref(), Some(&b"v"[..]));
        assert!(!path.exists());
        assert!(dest.exists());

        drop(cache);
        cleanup(&dest);
        cleanup(&path);
        Ok(())
    }

    #[test]
    fn size_is_clamped_to_documented_bounds() -> Result<()> {
        let path = temp_db_path("clamp");
        let cache = ContentCache::open(&path, 1)?;
        assert_eq!(cache.map_size(), MIN_CACHE_SIZE);
        drop(cache);
        cleanup(&path);
        Ok(())
    }
}
