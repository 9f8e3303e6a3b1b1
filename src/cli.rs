use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "redcache")]
#[command(about = "Index, extract, and decode game archive assets into a persistent content cache")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Cache store file.
    #[arg(long, value_name = "FILE")]
    pub db: Option<PathBuf>,

    /// Game installation directory (containing archive/pc/...).
    #[arg(long, value_name = "DIR")]
    pub game: Option<PathBuf>,

    /// Archive tool binary.
    #[arg(long, value_name = "FILE")]
    pub tool: Option<PathBuf>,

    /// Cache capacity in GiB.
    #[arg(long, value_name = "GB")]
    pub size_gb: Option<u64>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Build the archive file map (drops and rebuilds unless complete).
    Index,
    /// Extract one asset's raw bytes.
    Extract {
        path: String,

        /// Write the bytes here instead of only reporting.
        #[arg(short = 'o', long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// Extract many assets listed one per line in a file.
    Bulk {
        list: PathBuf,

        /// Materialize extracted files under this directory.
        #[arg(short = 'o', long, value_name = "DIR")]
        output_dir: Option<PathBuf>,
    },
    /// Decode a streaming sector.
    Sector {
        path: String,

        /// Cache under the modded namespaces.
        #[arg(long)]
        modded: bool,
    },
    /// Decode a compiled mesh.
    Mesh {
        path: String,

        /// Cache under the modded namespaces.
        #[arg(long)]
        modded: bool,
    },
    /// Print per-namespace cache statistics.
    Stats,
    /// Delete the cache store.
    Clear,
    /// Reopen the store with a new capacity.
    Resize {
        #[arg(value_name = "GB")]
        size_gb: u64,
    },
    /// Relocate the store; the old copy is kept until the new one verifies.
    Move {
        dest: PathBuf,
    },
}
