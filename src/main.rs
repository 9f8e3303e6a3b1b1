use anyhow::{Context as _, Result};
use clap::Parser;
use redcache::cache::{ContentCache, Namespace};
use redcache::cli::{Cli, Commands};
use redcache::config::{self, Context};
use redcache::extract::{Extractor, Source, hash_bytes};
use redcache::model::{AbbrMesh, AbbrSector};
use redcache::tool::ArchiveTool;
use redcache::worker::PipelineWorker;
use serde::Serialize;
use std::path::Path;

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.clone() {
        Commands::Clear => {
            let db_path = config::resolve_db_path(&cli)?;
            config::clear_store(&db_path)?;
        }
        Commands::Stats => {
            let cache = open_cache(&cli)?;
            println!("{}", serde_json::to_string_pretty(&cache.stats()?)?);
        }
        Commands::Resize { size_gb } => {
            let cache = open_cache(&cli)?;
            let cache = cache.resize((size_gb as usize).saturating_mul(1024 * 1024 * 1024))?;
            println!("{}", serde_json::to_string_pretty(&cache.stats()?)?);
        }
        Commands::Move { dest } => {
            let cache = open_cache(&cli)?;
            let cache = cache.move_to(&dest)?;
            println!("{}", serde_json::to_string_pretty(&cache.stats()?)?);
        }
        Commands::Index => {
            let ctx = build_context(&cli)?;
            let worker = PipelineWorker::spawn(ctx);
            let report = worker.build_index()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Extract { path, output } => {
            let ctx = build_context(&cli)?;
            let extractor =
                Extractor::new(&ctx.cache, &ctx.tool, &ctx.game_dir, ctx.scratch_root.clone());

            let path = normalize_asset_path(&path);
            let cache_hit = ctx.cache.get(Namespace::ExtractedRaw, &path)?.is_some();
            let container = extractor.resolve(&path)?;
            let bytes = extractor.extract_one(&path)?;

            if let Some(out) = output.as_deref() {
                write_output(out, &bytes)?;
            }

            let report = ExtractReport {
                path,
                container,
                bytes: bytes.len(),
                content_hash: hash_bytes(&bytes),
                cache_hit,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Bulk { list, output_dir } => {
            let paths = read_path_list(&list)?;
            let requested = paths.len();

            let ctx = build_context(&cli)?;
            let worker = PipelineWorker::spawn(ctx);
            let results = worker.extract_bulk(paths.clone())?;

            let mut entries = Vec::with_capacity(requested);
            let mut extracted = 0usize;
            for (path, result) in paths.into_iter().zip(results) {
                match result {
                    Ok(bytes) => {
                        if let Some(dir) = output_dir.as_deref() {
                            write_output(&dir.join(path.replace('\\', "/")), &bytes)?;
                        }
                        extracted += 1;
                        entries.push(BulkEntry {
                            path,
                            bytes: Some(bytes.len()),
                            error: None,
                        });
                    }
                    Err(e) => entries.push(BulkEntry {
                        path,
                        bytes: None,
                        error: Some(e.to_string()),
                    }),
                }
            }

            let report = BulkReport {
                requested,
                extracted,
                failed: requested - extracted,
                entries,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Sector { path, modded } => {
            let ctx = build_context(&cli)?;
            let extractor =
                Extractor::new(&ctx.cache, &ctx.tool, &ctx.game_dir, ctx.scratch_root.clone());

            let path = normalize_asset_path(&path);
            let decoded = extractor.sector(&path, source_for(modded))?;
            let report = SectorReport {
                path,
                warnings: decoded.warnings,
                sector: decoded.sector,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Mesh { path, modded } => {
            let ctx = build_context(&cli)?;
            let extractor =
                Extractor::new(&ctx.cache, &ctx.tool, &ctx.game_dir, ctx.scratch_root.clone());

            let path = normalize_asset_path(&path);
            let mesh = extractor.mesh(&path, source_for(modded))?;
            let report = MeshReport {
                path,
                submeshes: mesh.submeshes.len(),
                mesh,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_cache(cli: &Cli) -> Result<ContentCache> {
    let db_path = config::resolve_db_path(cli)?;
    Ok(ContentCache::open(&db_path, config::resolve_cache_size(cli))?)
}

fn build_context(cli: &Cli) -> Result<Context> {
    let cache = open_cache(cli)?;
    let tool = ArchiveTool::new(config::resolve_tool_path(cli));
    let tool_version = tool.version().unwrap_or_else(|_| "unknown".to_string());
    config::ensure_compat(&cache, &tool_version)?;

    Ok(Context {
        cache,
        tool,
        game_dir: config::resolve_game_dir(cli)?,
        scratch_root: config::scratch_root(),
    })
}

fn source_for(modded: bool) -> Source {
    if modded { Source::Modded } else { Source::Vanilla }
}

/// Archive entries use backslash separators; accept forward slashes from the
/// shell and stray whitespace from copy-paste.
fn normalize_asset_path(raw: &str) -> String {
    raw.trim().replace('/', "\\")
}

fn read_path_list(list: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(list)
        .with_context(|| format!("failed to read path list: {}", list.display()))?;
    Ok(content
        .lines()
        .map(|l| normalize_asset_path(l))
        .filter(|l| !l.is_empty())
        .collect())
}

fn write_output(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, bytes)?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct ExtractReport {
    path: String,
    container: String,
    bytes: usize,
    content_hash: String,
    cache_hit: bool,
}

#[derive(Debug, Serialize)]
struct BulkEntry {
    path: String,
    bytes: Option<usize>,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct BulkReport {
    requested: usize,
    extracted: usize,
    failed: usize,
    entries: Vec<BulkEntry>,
}

#[derive(Debug, Serialize)]
struct SectorReport {
    path: String,
    warnings: Vec<String>,
    sector: AbbrSector,
}

#[derive(Debug, Serialize)]
struct MeshReport {
    path: String,
    submeshes: usize,
    mesh: AbbrMesh,
}
