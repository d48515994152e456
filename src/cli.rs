use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// More log output (-v debug, -vv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Stream a session export from a URL into the chapter store.
    Import(ImportArgs),
    /// Import a session export (or a scraper dump) from a local file.
    ImportFile(ImportFileArgs),
    /// List the chapters held in a store with their active translation.
    Chapters(ChaptersArgs),
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    /// Session URL (http/https). Repository and shared-drive view links are accepted.
    #[arg(long)]
    pub url: String,

    /// Download the whole body before importing instead of streaming it.
    #[arg(long)]
    pub buffered: bool,

    #[command(flatten)]
    pub options: ImportOptions,
}

#[derive(Debug, Args)]
pub struct ImportFileArgs {
    /// Path to the session JSON file.
    #[arg(long)]
    pub file: PathBuf,

    #[command(flatten)]
    pub options: ImportOptions,
}

#[derive(Debug, Args)]
pub struct ImportOptions {
    /// Chapter store directory (created if missing).
    #[arg(long)]
    pub store: PathBuf,

    /// Print each progress snapshot as a JSON line on stdout.
    #[arg(long)]
    pub progress_json: bool,

    /// Retries after a transient fetch failure (overrides LEXICONFORGE_IMPORT_MAX_RETRIES).
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// First retry delay in milliseconds; doubles on each retry.
    #[arg(long)]
    pub retry_delay_ms: Option<u64>,

    /// Request timeout in seconds (overrides LEXICONFORGE_IMPORT_TIMEOUT_SECS).
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Persisted chapters needed before reading can start.
    #[arg(long)]
    pub first_chapters: Option<usize>,
}

#[derive(Debug, Args)]
pub struct ChaptersArgs {
    /// Chapter store directory.
    #[arg(long)]
    pub store: PathBuf,

    /// Print one JSON object per chapter instead of a table.
    #[arg(long)]
    pub json: bool,
}
