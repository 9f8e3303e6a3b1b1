//! Path and size resolution, the startup context, and the cache
//! compatibility record.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::cache::{self, ContentCache, Namespace};
use crate::cli::Cli;
use crate::error::{Error, Result};
use crate::tool::ArchiveTool;

/// Bump when the persisted record layout changes; a mismatch invalidates
/// every decoded namespace on startup.
pub const CACHE_FORMAT_VERSION: u32 = 1;

const VERSIONS_KEY: &str = "versions";

/// Everything the pipeline needs, constructed once at startup and passed
/// around by reference instead of living in lazy globals.
pub struct Context {
    pub cache: ContentCache,
    pub tool: ArchiveTool,
    pub game_dir: PathBuf,
    pub scratch_root: PathBuf,
}

pub fn resolve_db_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(p) = cli.db.clone() {
        return Ok(p);
    }
    Ok(redcache_home()?.join("cache.lmdb"))
}

pub fn resolve_game_dir(cli: &Cli) -> Result<PathBuf> {
    if let Some(p) = cli.game.clone() {
        return Ok(p);
    }
    if let Ok(p) = env::var("REDCACHE_GAME") {
        return Ok(PathBuf::from(p));
    }
    Err(Error::invalid(
        "game directory not set (use --game or REDCACHE_GAME)",
    ))
}

pub fn resolve_tool_path(cli: &Cli) -> PathBuf {
    if let Some(p) = cli.tool.clone() {
        return p;
    }
    if let Ok(p) = env::var("REDCACHE_TOOL") {
        return PathBuf::from(p);
    }
    PathBuf::from("cp77-tools")
}

pub fn resolve_cache_size(cli: &Cli) -> usize {
    match cli.size_gb {
        Some(gb) => (gb as usize).saturating_mul(1024 * 1024 * 1024),
        None => cache::DEFAULT_CACHE_SIZE,
    }
}

pub fn scratch_root() -> PathBuf {
    env::temp_dir()
}

/// Remove the store and its lock file.
pub fn clear_store(db_path: &Path) -> Result<()> {
    remove_file_if_exists(db_path)?;
    remove_file_if_exists(&cache::lock_path(db_path))?;
    Ok(())
}

fn redcache_home() -> Result<PathBuf> {
    let base = dirs::data_local_dir()
        .or_else(dirs::cache_dir)
        .or_else(dirs::home_dir)
        .ok_or_else(|| Error::invalid("failed to resolve a data directory"))?;
    Ok(base.join("redcache"))
}

fn remove_file_if_exists(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct VersionRecord {
    cache_format: u32,
    tool_version: String,
}

/// Check the persisted compatibility record against the running tool and
/// cache format. On mismatch every namespace except metadata is dropped;
/// a stale cache is invalidated, never silently reused. Returns whether the
/// cached content survived.
pub fn ensure_compat(cache: &ContentCache, tool_version: &str) -> Result<bool> {
    let current = VersionRecord {
        cache_format: CACHE_FORMAT_VERSION,
        tool_version: tool_version.to_string(),
    };

    let stored = cache
        .get(Namespace::Metadata, VERSIONS_KEY)?
        .and_then(|bytes| serde_json::from_slice::<VersionRecord>(&bytes).ok());

    if stored.as_ref() == Some(&current) {
        return Ok(true);
    }

    if let Some(ref stored) = stored {
        warn!(
            "cache was built with tool {} (format {}), invalidating for tool {} (format {})",
            stored.tool_version, stored.cache_format, current.tool_version, current.cache_format
        );
        for ns in Namespace::ALL {
            if ns != Namespace::Metadata {
                cache.drop_namespace(ns)?;
            }
        }
    }

    cache.put(
        Namespace::Metadata,
        VERSIONS_KEY,
        &serde_json::to_vec(&current)?,
    )?;
    // fresh record on an empty cache is not an invalidation
    Ok(stored.is_none())
}
