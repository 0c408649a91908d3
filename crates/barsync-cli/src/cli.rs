//! CLI argument definitions for barsync.
//!
//! | Command | Description |
//! |---------|-------------|
//! | `plan` | Show the fetch requests needed to cover a window |
//! | `coverage` | Inspect persisted bars and coverage per series |
//! | `simulate` | Run a full sync against the simulated feed |
//!
//! Series are addressed as `SYMBOL@granularity`, e.g. `AAPL@5m`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(
    name = "barsync",
    version,
    about = "Multi-granularity bar buffering and sync engine"
)]
pub struct Cli {
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Json)]
    pub format: OutputFormat,

    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    /// Treat warnings as failures (exit code 5).
    #[arg(long, global = true, default_value_t = false)]
    pub strict: bool,

    /// Warehouse home directory (defaults to $BARSYNC_HOME or ~/.barsync).
    #[arg(long, global = true)]
    pub home: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Plan(PlanArgs),
    Coverage(CoverageArgs),
    Simulate(SimulateArgs),
}

#[derive(Debug, Args)]
pub struct PlanArgs {
    /// Series key, e.g. `AAPL@1m`.
    pub key: String,

    /// Window start (RFC3339, UTC). Defaults to the granularity's lookback start.
    #[arg(long)]
    pub start: Option<String>,

    /// Window end (RFC3339, UTC). Defaults to now.
    #[arg(long)]
    pub end: Option<String>,

    /// Pretend the current time is this instant (RFC3339, UTC).
    #[arg(long)]
    pub now: Option<String>,

    #[arg(long, default_value_t = false)]
    pub full_refetch: bool,

    #[arg(long, default_value_t = false)]
    pub keep_alive: bool,

    /// Plan against the coverage stored in the warehouse.
    #[arg(long, default_value_t = false)]
    pub from_warehouse: bool,
}

#[derive(Debug, Args)]
pub struct CoverageArgs {
    /// Series keys to inspect. All stored series when omitted.
    pub keys: Vec<String>,
}

#[derive(Debug, Args)]
pub struct SimulateArgs {
    /// Series keys to sync.
    #[arg(required = true)]
    pub keys: Vec<String>,

    #[arg(long, default_value_t = false)]
    pub keep_alive: bool,

    /// Pretend the current time is this instant (RFC3339, UTC).
    #[arg(long)]
    pub now: Option<String>,

    #[arg(long)]
    pub max_concurrency: Option<usize>,

    /// Seed buffers from the warehouse before syncing.
    #[arg(long, default_value_t = false)]
    pub resume: bool,

    /// Save the resulting buffers to the warehouse.
    #[arg(long, default_value_t = false)]
    pub persist: bool,

    /// Give up waiting after this many seconds.
    #[arg(long, default_value_t = 30)]
    pub timeout_secs: u64,
}
