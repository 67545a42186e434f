//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Run a cache node that serves content on behalf of an upstream coordinator.
#[derive(Parser, Debug)]
#[command(name = "cachenode")]
#[command(author, version, about)]
pub struct Args {
    /// Client ID issued by the coordinator. Overrides the config file.
    #[arg(long)]
    pub client_id: Option<i64>,

    /// Client key issued by the coordinator. Overrides the config file.
    #[arg(long)]
    pub client_key: Option<String>,

    /// Cache and database root directory.
    #[arg(long, default_value = "hath")]
    pub dir: PathBuf,

    /// TOML config file with `ClientID`/`Key`.
    #[arg(long)]
    pub cfg: Option<PathBuf>,

    /// Disable signature/timestamp verification (for local testing only).
    #[arg(long)]
    pub debug: bool,

    /// Force a startup reconciliation scan of the cache directory even if
    /// the metadata store is already populated.
    #[arg(long)]
    pub scan: bool,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}
