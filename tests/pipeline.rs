//! End-to-end pipeline tests against a fake archive tool.
#![cfg(unix)]

use redcache::cache::{ContentCache, MIN_CACHE_SIZE, Namespace};
use redcache::config::{Context, ensure_compat};
use redcache::extract::{Extractor, Source};
use redcache::index::{IndexBuilder, IndexState};
use redcache::model::NodeKind;
use redcache::tool::ArchiveTool;
use redcache::worker::PipelineWorker;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!(
        "redcache_it_{}_{}_{}",
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

fn game_dir(base: &Path) -> PathBuf {
    let game = base.join("game");
    let content = game.join("archive/pc/content");
    fs::create_dir_all(&content).unwrap();
    fs::write(content.join("basegame_1_engine.archive"), b"archive").unwrap();
    game
}

const SECTOR_JSON: &str = r#"{
  "rootChunk": {
    "nodes": [
      {"$type": "worldMeshNode", "mesh": {"path": "base\\props\\crate.mesh"}}
    ],
    "nodeData": [
      {
        "nodeIndex": 0,
        "position": {"x": 1.0, "y": 2.0, "z": 3.0},
        "orientation": {"i": 0.0, "j": 0.0, "k": 0.0, "r": 1.0},
        "scale": {"x": 1.0, "y": 1.0, "z": 1.0}
      }
    ]
  }
}"#;

/// Fake archive tool covering list, extract, uncook, and --version.
/// Invocations are counted per subcommand so cache hits are observable.
fn fake_tool(base: &Path) -> PathBuf {
    let tool = base.join("bin/cp77-tools");
    let counts = base.join("counts");
    fs::create_dir_all(&counts).unwrap();

    let script = format!(
        r#"#!/bin/sh
set -e
case "$1" in
  --version)
    echo "1.6.2"
    ;;
  list)
    echo list >> {counts}/list
    printf 'base\\test.mesh\nbase\\sec.streamingsector\nbase\\ghost.streamingsector\n'
    ;;
  extract)
    echo extract >> {counts}/extract
    out="$6"
    mkdir -p "$out/base"
    printf 'RAWMESH' > "$out/base/test.mesh"
    ;;
  uncook)
    echo uncook >> {counts}/uncook
    out="$6"
    mkdir -p "$out/base"
    cat > "$out/base/sec.streamingsector.json" <<'EOF'
{sector_json}
EOF
    ;;
esac
"#,
        counts = counts.display(),
        sector_json = SECTOR_JSON,
    );
    write_script(&tool, &script);
    tool
}

fn count(base: &Path, name: &str) -> usize {
    fs::read_to_string(base.join("counts").join(name))
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

#[test]
fn index_resolve_extract_and_cache_hit() {
    let base = temp_dir("end_to_end");
    let game = game_dir(&base);
    let tool_bin = fake_tool(&base);

    let cache = ContentCache::open(&base.join("db.lmdb"), MIN_CACHE_SIZE).unwrap();
    let tool = ArchiveTool::new(tool_bin);

    let tool_version = tool.version().unwrap();
    assert_eq!(tool_version, "1.6.2");
    assert!(ensure_compat(&cache, &tool_version).unwrap());

    let builder = IndexBuilder::new(&cache, &tool, &game);
    let report = builder.build().unwrap();
    assert_eq!(report.containers, 1);
    assert_eq!(report.entries, 3);
    assert_eq!(builder.state().unwrap(), IndexState::Completed);

    let extractor = Extractor::new(&cache, &tool, &game, base.join("scratch"));
    assert_eq!(
        extractor.resolve("base\\test.mesh").unwrap(),
        "archive/pc/content/basegame_1_engine.archive"
    );

    // first call goes through the tool, second is served from the cache
    let bytes = extractor.extract_one("base\\test.mesh").unwrap();
    assert_eq!(bytes, b"RAWMESH");
    assert_eq!(count(&base, "extract"), 1);

    let bytes = extractor.extract_one("base\\test.mesh").unwrap();
    assert_eq!(bytes, b"RAWMESH");
    assert_eq!(count(&base, "extract"), 1);

    drop(extractor);
    drop(cache);
    let _ = fs::remove_dir_all(base);
}

#[test]
fn sector_decodes_and_caches_through_uncook() {
    let base = temp_dir("sector");
    let game = game_dir(&base);
    let tool_bin = fake_tool(&base);

    let cache = ContentCache::open(&base.join("db.lmdb"), MIN_CACHE_SIZE).unwrap();
    let tool = ArchiveTool::new(tool_bin);
    IndexBuilder::new(&cache, &tool, &game).build().unwrap();

    let extractor = Extractor::new(&cache, &tool, &game, base.join("scratch"));

    let decoded = extractor
        .sector("base\\sec.streamingsector", Source::Vanilla)
        .unwrap();
    assert_eq!(decoded.sector.nodes.len(), 1);
    assert_eq!(decoded.sector.nodes[0].kind, NodeKind::Mesh);
    assert_eq!(
        decoded.sector.nodes[0].mesh_path.as_deref(),
        Some("base\\props\\crate.mesh")
    );
    assert_eq!(decoded.sector.node_data[0].transforms[0].position.x, 1.0);
    assert_eq!(count(&base, "uncook"), 1);

    // cached: no further tool invocation, identical sector
    let again = extractor
        .sector("base\\sec.streamingsector", Source::Vanilla)
        .unwrap();
    assert_eq!(again.sector, decoded.sector);
    assert_eq!(count(&base, "uncook"), 1);

    // decoded geometry landed in the vanilla namespace only
    assert!(
        cache
            .get(Namespace::VanillaGeometry, "base\\sec.streamingsector")
            .unwrap()
            .is_some()
    );
    assert!(
        cache
            .get(Namespace::ModdedGeometry, "base\\sec.streamingsector")
            .unwrap()
            .is_none()
    );

    drop(extractor);
    drop(cache);
    let _ = fs::remove_dir_all(base);
}

#[test]
fn worker_runs_build_and_bulk_jobs() {
    let base = temp_dir("worker");
    let game = game_dir(&base);
    let tool_bin = fake_tool(&base);
    let db_path = base.join("db.lmdb");

    let ctx = Context {
        cache: ContentCache::open(&db_path, MIN_CACHE_SIZE).unwrap(),
        tool: ArchiveTool::new(tool_bin),
        game_dir: game,
        scratch_root: base.join("scratch"),
    };

    let mut worker = PipelineWorker::spawn(ctx);

    let report = worker.build_index().unwrap();
    assert_eq!(report.containers, 1);

    let paths = vec![
        "base\\test.mesh".to_string(),
        "base\\not-indexed.mesh".to_string(),
    ];
    let results = worker.extract_bulk(paths).unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].as_deref().unwrap(), b"RAWMESH");
    assert!(results[1].is_err());

    // sector decode succeeds, missing sidecar fails that sector alone
    let sectors = worker
        .decode_sectors(
            vec![
                "base\\sec.streamingsector".to_string(),
                "base\\ghost.streamingsector".to_string(),
            ],
            Source::Vanilla,
        )
        .unwrap();
    assert_eq!(sectors.len(), 2);
    assert!(sectors[0].is_ok());
    assert!(sectors[1].is_err());

    worker.shutdown();

    // the worker released the store on shutdown; committed state survives
    let cache = ContentCache::open(&db_path, MIN_CACHE_SIZE).unwrap();
    assert!(
        cache
            .get(Namespace::ExtractedRaw, "base\\test.mesh")
            .unwrap()
            .is_some()
    );
    assert!(
        cache
            .get(Namespace::VanillaGeometry, "base\\sec.streamingsector")
            .unwrap()
            .is_some()
    );

    drop(cache);
    let _ = fs::remove_dir_all(base);
}
