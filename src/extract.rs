//! Extraction orchestrator.
//!
//! Bridges cache misses to the external archive tool: resolves logical paths
//! through the file map, materializes raw bytes or uncooked JSON under a
//! scratch directory, feeds decoders, and writes results back into the
//! cache. Scratch files are removed on every exit path, success or failure.
//! Concurrent misses on the same key share one extraction through a per-key
//! pending registry.

use memmap2::Mmap;
use rayon::prelude::*;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

use crate::cache::{ContentCache, Namespace};
use crate::error::{Error, Result};
use crate::index::id_key;
use crate::mesh::{CompiledMesh, decode_mesh};
use crate::model::AbbrMesh;
use crate::sector::{SectorDecode, decode_sector_json};
use crate::tool::ArchiveTool;

/// Which namespace pair decoded results land in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Vanilla,
    Modded,
}

impl Source {
    pub fn geometry_ns(self) -> Namespace {
        match self {
            Source::Vanilla => Namespace::VanillaGeometry,
            Source::Modded => Namespace::ModdedGeometry,
        }
    }

    pub fn bounds_ns(self) -> Namespace {
        match self {
            Source::Vanilla => Namespace::VanillaBounds,
            Source::Modded => Namespace::ModdedBounds,
        }
    }
}

pub struct Extractor<'a> {
    cache: &'a ContentCache,
    tool: &'a ArchiveTool,
    game_dir: &'a Path,
    scratch_root: PathBuf,
    pending: PendingKeys,
}

impl<'a> Extractor<'a> {
    pub fn new(
        cache: &'a ContentCache,
        tool: &'a ArchiveTool,
        game_dir: &'a Path,
        scratch_root: PathBuf,
    ) -> Self {
        Self {
            cache,
            tool,
            game_dir,
            scratch_root,
            pending: PendingKeys::default(),
        }
    }

    /// Resolve a logical path to its container's game-relative path through
    /// the two-level file map.
    pub fn resolve(&self, path: &str) -> Result<String> {
        let id_bytes = self
            .cache
            .get(Namespace::FileMap, path)?
            .ok_or_else(|| Error::NotIndexed(path.to_string()))?;
        let archive_id: u32 = std::str::from_utf8(&id_bytes)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::NotIndexed(format!("malformed archive id for {path}")))?;

        let container = self
            .cache
            .get(Namespace::FileMap, &id_key(archive_id))?
            .ok_or_else(|| Error::NotIndexed(format!("archive id {archive_id} for {path}")))?;
        String::from_utf8(container)
            .map_err(|_| Error::NotIndexed(format!("malformed container path for {path}")))
    }

    /// Raw bytes of one asset: cached when available, otherwise extracted
    /// through the tool and cached for next time.
    pub fn extract_one(&self, path: &str) -> Result<Vec<u8>> {
        if let Some(bytes) = self.cache.get(Namespace::ExtractedRaw, path)? {
            return Ok(bytes);
        }

        let _guard = self.pending.acquire(path);
        // another thread may have finished this key while we waited
        if let Some(bytes) = self.cache.get(Namespace::ExtractedRaw, path)? {
            return Ok(bytes);
        }

        let container_rel = self.resolve(path)?;
        let scratch = ScratchDir::create(&self.scratch_root)?;
        self.tool.extract(
            &self.game_dir.join(&container_rel),
            &exact_pattern(path),
            scratch.path(),
        )?;

        let bytes = read_scratch_file(scratch.path(), path, "")?;
        self.cache.put(Namespace::ExtractedRaw, path, &bytes)?;
        debug!("extracted {path} ({} bytes)", bytes.len());
        Ok(bytes)
    }

    /// Raw bytes of many assets. One tool call per owning container, covering
    /// that container's misses with an OR-combined pattern. The result always
    /// has `paths.len()` elements in input order; per-path failures do not
    /// disturb their siblings. Storage failures abort the whole call.
    pub fn extract_bulk(&self, paths: &[String]) -> Result<Vec<Result<Vec<u8>>>> {
        let cached = self.cache.get_many(Namespace::ExtractedRaw, paths)?;
        let mut results: Vec<Option<Result<Vec<u8>>>> =
            cached.into_iter().map(|hit| hit.map(Ok)).collect();

        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, path) in paths.iter().enumerate() {
            if results[i].is_some() {
                continue;
            }
            match self.resolve(path) {
                Ok(container) => groups.entry(container).or_default().push(i),
                Err(e) => results[i] = Some(Err(e)),
            }
        }

        let miss_count: usize = groups.values().map(Vec::len).sum();
        if miss_count > 0 {
            info!(
                "bulk extraction: {miss_count} misses across {} containers",
                groups.len()
            );
        }

        for (container_rel, indices) in groups {
            let outcomes = self.extract_group(&container_rel, &indices, paths, false)?;
            for (i, outcome) in indices.into_iter().zip(outcomes) {
                results[i] = Some(outcome);
            }
        }

        Ok(results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(Error::tool("extraction produced no result"))))
            .collect())
    }

    /// Decoded streaming sector, cached under the source's geometry
    /// namespace. Cached sectors come back without warnings; the degradation
    /// already happened (and was logged) when they were first decoded.
    pub fn sector(&self, path: &str, source: Source) -> Result<SectorDecode> {
        if let Some(bytes) = self.cache.get(source.geometry_ns(), path)? {
            return Ok(SectorDecode {
                sector: serde_json::from_slice(&bytes)?,
                warnings: Vec::new(),
            });
        }

        let _guard = self.pending.acquire(path);
        if let Some(bytes) = self.cache.get(source.geometry_ns(), path)? {
            return Ok(SectorDecode {
                sector: serde_json::from_slice(&bytes)?,
                warnings: Vec::new(),
            });
        }

        let container_rel = self.resolve(path)?;
        let scratch = ScratchDir::create(&self.scratch_root)?;
        self.tool.uncook(
            &self.game_dir.join(&container_rel),
            &exact_pattern(path),
            scratch.path(),
        )?;

        let value = read_scratch_json(scratch.path(), path)?;
        let decoded = decode_sector_json(&value)?;

        self.cache.put(
            source.geometry_ns(),
            path,
            &serde_json::to_vec(&decoded.sector)?,
        )?;
        let bounds = decoded.sector.aabb();
        if !bounds.is_empty() {
            self.cache
                .put(source.bounds_ns(), path, &serde_json::to_vec(&bounds)?)?;
        }

        Ok(decoded)
    }

    /// Decoded compiled mesh, cached under the source's geometry namespace.
    pub fn mesh(&self, path: &str, source: Source) -> Result<AbbrMesh> {
        if let Some(bytes) = self.cache.get(source.geometry_ns(), path)? {
            return Ok(serde_json::from_slice(&bytes)?);
        }

        let _guard = self.pending.acquire(path);
        if let Some(bytes) = self.cache.get(source.geometry_ns(), path)? {
            return Ok(serde_json::from_slice(&bytes)?);
        }

        let container_rel = self.resolve(path)?;
        let scratch = ScratchDir::create(&self.scratch_root)?;
        self.tool.uncook(
            &self.game_dir.join(&container_rel),
            &exact_pattern(path),
            scratch.path(),
        )?;

        let value = read_scratch_json(scratch.path(), path)?;
        let compiled: CompiledMesh = serde_json::from_value(value)?;
        let decoded = decode_mesh(&compiled)?;

        self.cache
            .put(source.geometry_ns(), path, &serde_json::to_vec(&decoded)?)?;
        let bounds = decoded.aabb();
        if !bounds.is_empty() {
            self.cache
                .put(source.bounds_ns(), path, &serde_json::to_vec(&bounds)?)?;
        }

        Ok(decoded)
    }

    /// Decoded sectors in bulk: cache misses grouped by owning container, one
    /// uncook call per container, decode failures isolated per sector.
    pub fn sectors_bulk(
        &self,
        paths: &[String],
        source: Source,
    ) -> Result<Vec<Result<SectorDecode>>> {
        let cached = self.cache.get_many(source.geometry_ns(), paths)?;
        let mut results: Vec<Option<Result<SectorDecode>>> = cached
            .into_iter()
            .map(|hit| {
                hit.map(|bytes| {
                    Ok(SectorDecode {
                        sector: serde_json::from_slice(&bytes)?,
                        warnings: Vec::new(),
                    })
                })
            })
            .collect();

        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, path) in paths.iter().enumerate() {
            if results[i].is_some() {
                continue;
            }
            match self.resolve(path) {
                Ok(container) => groups.entry(container).or_default().push(i),
                Err(e) => results[i] = Some(Err(e)),
            }
        }

        for (container_rel, indices) in groups {
            let raw = self.extract_group(&container_rel, &indices, paths, true)?;

            let mut geometry = Vec::new();
            let mut bounds = Vec::new();
            let mut outcomes = Vec::with_capacity(indices.len());
            for (&i, bytes) in indices.iter().zip(raw) {
                let outcome = bytes.and_then(|bytes| {
                    let value: Value = serde_json::from_slice(&bytes)?;
                    decode_sector_json(&value)
                });
                if let Ok(decoded) = &outcome {
                    geometry.push((paths[i].clone(), serde_json::to_vec(&decoded.sector)?));
                    let aabb = decoded.sector.aabb();
                    if !aabb.is_empty() {
                        bounds.push((paths[i].clone(), serde_json::to_vec(&aabb)?));
                    }
                }
                outcomes.push(outcome);
            }

            self.cache.batch_put(source.geometry_ns(), &geometry)?;
            self.cache.batch_put(source.bounds_ns(), &bounds)?;

            for (i, outcome) in indices.into_iter().zip(outcomes) {
                results[i] = Some(outcome);
            }
        }

        Ok(results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(Error::tool("extraction produced no result"))))
            .collect())
    }

    /// One tool call for one container's worth of misses. The outer `Result`
    /// carries storage/scratch failures only; tool and read failures are
    /// per-path outcomes. `uncook` materializes `.json` sidecars instead of
    /// raw bytes.
    fn extract_group(
        &self,
        container_rel: &str,
        indices: &[usize],
        paths: &[String],
        uncook: bool,
    ) -> Result<Vec<Result<Vec<u8>>>> {
        let group: Vec<&String> = indices.iter().map(|&i| &paths[i]).collect();
        let container_abs = self.game_dir.join(container_rel);
        let scratch = ScratchDir::create(&self.scratch_root)?;
        let pattern = or_pattern(&group);

        let invoked = if uncook {
            self.tool.uncook(&container_abs, &pattern, scratch.path())
        } else {
            self.tool.extract(&container_abs, &pattern, scratch.path())
        };
        if let Err(e) = invoked {
            let msg = e.to_string();
            return Ok(group.iter().map(|_| Err(Error::tool(msg.clone()))).collect());
        }

        let suffix = if uncook { ".json" } else { "" };
        let reads: Vec<Result<Vec<u8>>> = group
            .par_iter()
            .map(|path| read_scratch_file(scratch.path(), path.as_str(), suffix))
            .collect();

        if !uncook {
            let mut entries = Vec::new();
            for (path, read) in group.iter().zip(&reads) {
                if let Ok(bytes) = read {
                    entries.push(((*path).clone(), bytes.clone()));
                }
            }
            self.cache.batch_put(Namespace::ExtractedRaw, &entries)?;
        }

        Ok(reads)
        // scratch dir removed here, failed extractions included
    }
}

/// Sha256 content hash, hex-encoded, for extraction reports.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Anchored regex matching exactly one archive entry path.
pub fn exact_pattern(path: &str) -> String {
    format!("^{}$", escape_regex(path))
}

/// Anchored regex matching any of the given entry paths.
pub fn or_pattern(paths: &[&String]) -> String {
    let alternatives: Vec<String> = paths.iter().map(|p| escape_regex(p.as_str())).collect();
    format!("^(?:{})$", alternatives.join("|"))
}

fn escape_regex(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() * 2);
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
        } else {
            out.push('\\');
            out.push(c);
        }
    }
    out
}

/// Materialized entry paths keep the archive layout; backslash separators
/// become real directories under the scratch dir.
fn scratch_file_path(scratch: &Path, entry_path: &str, suffix: &str) -> PathBuf {
    let mut rel = entry_path.replace('\\', "/");
    rel.push_str(suffix);
    scratch.join(rel)
}

fn read_scratch_file(scratch: &Path, entry_path: &str, suffix: &str) -> Result<Vec<u8>> {
    let file_path = scratch_file_path(scratch, entry_path, suffix);
    if !file_path.is_file() {
        return Err(Error::tool(format!(
            "tool produced no output for {entry_path}"
        )));
    }

    let file = File::open(&file_path)?;
    if file.metadata()?.len() == 0 {
        return Err(Error::tool(format!("tool produced empty output for {entry_path}")));
    }
    // SAFETY: The file is opened read-only, lives in our private scratch dir,
    // and the mapping is dropped before the file.
    let mmap = unsafe { Mmap::map(&file)? };
    Ok(mmap.to_vec())
}

fn read_scratch_json(scratch: &Path, entry_path: &str) -> Result<Value> {
    let bytes = read_scratch_file(scratch, entry_path, ".json")?;
    Ok(serde_json::from_slice(&bytes)?)
}

// ---------------------------------------------------------------------------
// Scratch directory guard

static SCRATCH_SEQ: AtomicU64 = AtomicU64::new(0);

/// Unique scratch directory removed on drop, whatever the exit path.
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub fn create(root: &Path) -> Result<Self> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let seq = SCRATCH_SEQ.fetch_add(1, Ordering::Relaxed);
        let path = root.join(format!(
            "redcache-scratch-{}-{}-{}",
            std::process::id(),
            nanos,
            seq
        ));
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

// ---------------------------------------------------------------------------
// In-flight request registry

/// Keys with an extraction in flight. `acquire` blocks while someone else
/// holds the key, so a second miss re-checks the cache instead of spawning a
/// redundant tool invocation.
#[derive(Default)]
struct PendingKeys {
    keys: Mutex<HashSet<String>>,
    cv: Condvar,
}

impl PendingKeys {
    fn acquire(&self, key: &str) -> PendingGuard<'_> {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        while keys.contains(key) {
            keys = self.cv.wait(keys).unwrap_or_else(|e| e.into_inner());
        }
        keys.insert(key.to_string());
        PendingGuard {
            registry: self,
            key: key.to_string(),
        }
    }
}

struct PendingGuard<'a> {
    registry: &'a PendingKeys,
    key: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut keys = self
            .registry
            .keys
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        keys.remove(&self.key);
        self.registry.cv.notify_all();
    }
}
