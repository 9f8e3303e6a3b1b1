//! Archive index builder.
//!
//! Persists a two-level map in the `file_map` namespace: every logical asset
//! path maps to a dense archive id, and every `id:{n}` key maps to that
//! archive's game-relative container path. The map is rebuilt wholesale,
//! trading rebuild cost for a simple consistency guarantee. A sentinel key
//! records completion; anything other than a true sentinel means the next
//! build drops the namespace and starts over.

use ignore::WalkBuilder;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Instant;
use tracing::{debug, info};

use crate::cache::{ContentCache, Namespace};
use crate::error::Result;
use crate::tool::ArchiveTool;

/// Archive roots relative to the game directory. The second root ships with
/// the expansion and may be absent.
pub const ARCHIVE_ROOTS: [&str; 2] = ["archive/pc/content", "archive/pc/ep1"];

/// Containers that hold world geometry worth indexing. Everything else
/// (audio, video, localization) is skipped outright.
pub const RELEVANT_ARCHIVES: &[&str] = &[
    "basegame_1_engine.archive",
    "basegame_3_nightcity.archive",
    "basegame_3_nightcity_gi.archive",
    "basegame_3_nightcity_terrain.archive",
    "basegame_4_appearance.archive",
    "basegame_4_gamedata.archive",
    "ep1_1_gamedata.archive",
    "ep1_2_gamedata.archive",
];

/// Entry extensions worth indexing.
pub const ASSET_EXT_REGEX: &str = r"\.(mesh|streamingsector)$";

pub const DEFAULT_BATCH_SIZE: usize = 4096;

const COMPLETED_KEY: &str = "__completed";
const ID_KEY_PREFIX: &str = "id:";

/// Key of the `archive id -> container path` record.
pub fn id_key(archive_id: u32) -> String {
    format!("{ID_KEY_PREFIX}{archive_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    NotBuilt,
    /// A build has started and not finished. A build that died mid-way also
    /// reads as `Building` until the next run replaces it.
    Building,
    Completed,
    Incomplete,
}

#[derive(Debug, Serialize)]
pub struct IndexReport {
    pub state: IndexState,
    pub containers: usize,
    pub entries: usize,
    pub skipped: bool,
    pub duration_ms: u64,
}

pub struct IndexBuilder<'a> {
    cache: &'a ContentCache,
    tool: &'a ArchiveTool,
    game_dir: &'a Path,
    batch_size: usize,
}

impl<'a> IndexBuilder<'a> {
    pub fn new(cache: &'a ContentCache, tool: &'a ArchiveTool, game_dir: &'a Path) -> Self {
        Self {
            cache,
            tool,
            game_dir,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn state(&self) -> Result<IndexState> {
        match self.cache.get(Namespace::FileMap, COMPLETED_KEY)? {
            Some(v) if v == b"true" => Ok(IndexState::Completed),
            Some(v) if v == b"building" => Ok(IndexState::Building),
            Some(_) => Ok(IndexState::Incomplete),
            None => {
                if self.cache.entry_count(Namespace::FileMap)? == 0 {
                    Ok(IndexState::NotBuilt)
                } else {
                    Ok(IndexState::Incomplete)
                }
            }
        }
    }

    /// Build the file map. A completed index short-circuits; anything else is
    /// dropped and rebuilt from scratch. The sentinel is written only after
    /// every container in both roots has been indexed, so a failure anywhere
    /// leaves the index marked for a full rebuild on the next run.
    pub fn build(&self) -> Result<IndexReport> {
        let start = Instant::now();

        if self.state()? == IndexState::Completed {
            debug!("file map already complete, skipping build");
            return Ok(IndexReport {
                state: IndexState::Completed,
                containers: 0,
                entries: 0,
                skipped: true,
                duration_ms: start.elapsed().as_millis() as u64,
            });
        }

        info!("rebuilding archive file map");
        self.cache.drop_namespace(Namespace::FileMap)?;
        self.cache
            .put(Namespace::FileMap, COMPLETED_KEY, b"building")?;

        let mut archive_id = 0u32;
        let mut containers = 0usize;
        let mut entries = 0usize;

        for root in ARCHIVE_ROOTS {
            let root = self.game_dir.join(root);
            if !root.is_dir() {
                debug!("archive root missing, skipping: {}", root.display());
                continue;
            }

            for container in discover_containers(&root)? {
                let listed = self.tool.list(&container, ASSET_EXT_REGEX)?;
                for chunk in listed.chunks(self.batch_size) {
                    let batch: Vec<(String, Vec<u8>)> = chunk
                        .iter()
                        .map(|path| (path.clone(), archive_id.to_string().into_bytes()))
                        .collect();
                    self.cache.batch_put(Namespace::FileMap, &batch)?;
                }

                let rel = relative_container_path(self.game_dir, &container);
                self.cache
                    .put(Namespace::FileMap, &id_key(archive_id), rel.as_bytes())?;

                debug!(
                    "indexed {} entries from {rel} as archive {archive_id}",
                    listed.len()
                );
                entries += listed.len();
                containers += 1;
                archive_id += 1;
            }
        }

        self.cache.put(Namespace::FileMap, COMPLETED_KEY, b"true")?;
        info!("file map complete: {containers} containers, {entries} entries");

        Ok(IndexReport {
            state: IndexState::Completed,
            containers,
            entries,
            skipped: false,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// Find relevant containers under one archive root. Sorted so archive ids
/// are assigned deterministically across rebuilds.
fn discover_containers(root: &Path) -> Result<Vec<PathBuf>> {
    let (tx, rx) = mpsc::channel();

    let walker = WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .build_parallel();

    walker.run(|| {
        let tx = tx.clone();
        Box::new(move |entry| {
            if let Ok(entry) = entry {
                let path = entry.path();
                let relevant = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| RELEVANT_ARCHIVES.contains(&n));
                if relevant && path.is_file() {
                    let _ = tx.send(path.to_path_buf());
                }
            }
            ignore::WalkState::Continue
        })
    });

    drop(tx);
    let mut containers: Vec<PathBuf> = rx.iter().collect();
    containers.sort();
    Ok(containers)
}

/// Container path relative to the game dir, forward slashes.
fn relative_container_path(game_dir: &Path, container: &Path) -> String {
    let rel = container.strip_prefix(game_dir).unwrap_or(container);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::cache::MIN_CACHE_SIZE;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!(
            "redcache_index_test_{}_{}_{}",
            std::process::id(),
            nanos,
            name
        ))
    }

    fn write_script(path: &Path, content: &str) {
        use std::os::unix::fs::PermissionsExt;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
        let mut perms = fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).unwrap();
    }

    fn game_dir_with_containers(base: &Path, names: &[&str]) -> PathBuf {
        let game = base.join("game");
        let content = game.join("archive/pc/content");
        fs::create_dir_all(&content).unwrap();
        for name in names {
            fs::write(content.join(name), b"archive").unwrap();
        }
        game
    }

    #[test]
    fn build_maps_paths_and_containers() {
        let base = temp_dir("build_ok");
        let game = game_dir_with_containers(
            &base,
            &["basegame_1_engine.archive", "basegame_4_gamedata.archive"],
        );
        // also drop an irrelevant container that must not be indexed
        fs::write(
            game.join("archive/pc/content/lang_en_voice.archive"),
            b"archive",
        )
        .unwrap();

        let fake = base.join("tool");
        write_script(
            &fake,
            "#!/bin/sh\nprintf 'base\\\\one.mesh\\nbase\\\\two.streamingsector\\n'\n",
        );

        let db = base.join("db.lmdb");
        let cache = ContentCache::open(&db, MIN_CACHE_SIZE).unwrap();
        let tool = ArchiveTool::new(fake);
        let builder = IndexBuilder::new(&cache, &tool, &game);

        assert_eq!(builder.state().unwrap(), IndexState::NotBuilt);
        let report = builder.build().unwrap();
        assert!(!report.skipped);
        assert_eq!(report.containers, 2);
        assert_eq!(report.entries, 4);
        assert_eq!(builder.state().unwrap(), IndexState::Completed);

        // both containers list the same entries; last writer wins on the path
        // keys, ids stay per container
        assert_eq!(
            cache.get(Namespace::FileMap, &id_key(0)).unwrap().as_deref(),
            Some(&b"archive/pc/content/basegame_1_engine.archive"[..])
        );
        assert_eq!(
            cache.get(Namespace::FileMap, &id_key(1)).unwrap().as_deref(),
            Some(&b"archive/pc/content/basegame_4_gamedata.archive"[..])
        );
        assert!(cache.get(Namespace::FileMap, "base\\one.mesh").unwrap().is_some());

        // second build short-circuits
        let report = builder.build().unwrap();
        assert!(report.skipped);

        drop(cache);
        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn interrupted_build_rebuilds_from_scratch() {
        let base = temp_dir("interrupted");
        let game = game_dir_with_containers(&base, &["basegame_1_engine.archive"]);

        // First listing carries an entry that normalizes to an empty key and
        // poisons its batch after the first batch has already committed.
        let poisoned = base.join("tool_poisoned");
        write_script(
            &poisoned,
            "#!/bin/sh\nprintf 'base\\\\stale.mesh\\n\\001\\002\\n'\n",
        );
        let healthy = base.join("tool_healthy");
        write_script(&healthy, "#!/bin/sh\nprintf 'base\\\\fresh.mesh\\n'\n");

        let db = base.join("db.lmdb");
        let cache = ContentCache::open(&db, MIN_CACHE_SIZE).unwrap();

        let bad_tool = ArchiveTool::new(poisoned);
        let failing = IndexBuilder::new(&cache, &bad_tool, &game).with_batch_size(1);
        assert!(failing.build().is_err());

        // sentinel never reached "true"; the stale key from the committed
        // first batch is still visible
        assert_eq!(failing.state().unwrap(), IndexState::Building);
        assert!(cache.get(Namespace::FileMap, "base\\stale.mesh").unwrap().is_some());

        let good_tool = ArchiveTool::new(healthy);
        let retry = IndexBuilder::new(&cache, &good_tool, &game).with_batch_size(1);
        let report = retry.build().unwrap();
        assert!(!report.skipped);
        assert_eq!(retry.state().unwrap(), IndexState::Completed);

        // full rebuild: stale key dropped, fresh key present
        assert!(cache.get(Namespace::FileMap, "base\\stale.mesh").unwrap().is_none());
        assert!(cache.get(Namespace::FileMap, "base\\fresh.mesh").unwrap().is_some());

        drop(cache);
        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn missing_expansion_root_is_skipped() {
        let base = temp_dir("no_ep1");
        let game = game_dir_with_containers(&base, &["basegame_1_engine.archive"]);

        let fake = base.join("tool");
        write_script(&fake, "#!/bin/sh\nprintf 'base\\\\a.mesh\\n'\n");

        let db = base.join("db.lmdb");
        let cache = ContentCache::open(&db, MIN_CACHE_SIZE).unwrap();
        let tool = ArchiveTool::new(fake);
        let builder = IndexBuilder::new(&cache, &tool, &game);

        let report = builder.build().unwrap();
        assert_eq!(report.containers, 1);
        assert_eq!(builder.state().unwrap(), IndexState::Completed);

        drop(cache);
        let _ = fs::remove_dir_all(base);
    }
}
