use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "crepo",
    about = "crepo -- file system content repository",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Repository configuration (TOML)
    #[arg(short, long, global = true, default_value = "crepo.toml")]
    pub config: PathBuf,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create the container and section directories
    Init,
    /// Show capacity, free space and archived files per container
    Stats,
    /// Store a file as a new content claim
    Import(ImportArgs),
    /// Copy the bytes of a content claim to a file
    Export(ExportArgs),
    /// Archive or remove resource claim files nothing references
    Cleanup,
    /// Delete expired archived files in every container
    Expire,
    /// Delete every live and archived file
    Purge(PurgeArgs),
}

#[derive(Args)]
pub struct ImportArgs {
    pub file: PathBuf,
    /// Mark the new claim as loss tolerant
    #[arg(long)]
    pub loss_tolerant: bool,
}

#[derive(Args)]
pub struct ExportArgs {
    pub container: String,
    pub section: String,
    pub id: String,
    pub offset: u64,
    /// Claim length in bytes; -1 reads to the end of the file
    #[arg(allow_hyphen_values = true)]
    pub length: i64,
    pub dest: PathBuf,
    /// Append to `dest` instead of truncating it
    #[arg(long)]
    pub append: bool,
}

#[derive(Args)]
pub struct PurgeArgs {
    /// Required; purge cannot be undone
    #[arg(long)]
    pub yes: bool,
}
