use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "extent-duper")]
#[command(about = "Share identical block ranges between files", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Scan files and merge identical block ranges
    Dedupe(DedupeArgs),
    /// Display the number of files in the fingerprint cache
    CountCache,
    /// Empty the fingerprint cache
    ClearCache,
    /// Print configuration values
    PrintConfig,
}

#[derive(Debug, Args)]
pub struct DedupeArgs {
    /// Files to deduplicate
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Block size in bytes (power of two)
    #[arg(long)]
    pub block_size: Option<u64>,

    /// Worker threads
    #[arg(long)]
    pub workers: Option<usize>,

    /// Resubmissions allowed per range
    #[arg(long)]
    pub retry_limit: Option<u32>,

    /// Bytes compared per verification read
    #[arg(long)]
    pub max_compare_bytes: Option<usize>,

    /// Open files read-write (some kernels require it for the destination)
    #[arg(long)]
    pub open_writable: bool,

    /// Fingerprint cache file
    #[arg(long)]
    pub cache_path: Option<PathBuf>,

    /// Compare ranges in userspace instead of sharing extents
    #[arg(long)]
    pub dry_run: bool,

    /// Write per-range results to this CSV file
    #[arg(long)]
    pub csv: Option<PathBuf>,
}
