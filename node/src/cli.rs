//! # CLI Interface
//!
//! Command-line arguments for `guildvault-node`, built with `clap` derive.
//! Subcommands: `run`, `info`, `log` and `version`.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::logging::LogFormat;

/// Guild vault host.
///
/// Serves shared guild vaults over HTTP and WebSocket, persists slots and the
/// audit log in a sled database, and exposes Prometheus metrics.
#[derive(Parser, Debug)]
#[command(
    name = "guildvault-node",
    about = "Shared guild vault host",
    version,
    propagate_version = true
)]
pub struct GuildVaultCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start serving vaults.
    Run(RunArgs),
    /// Show the vault an owner holds.
    Info(InfoArgs),
    /// Show a page of an owner's vault history.
    Log(LogArgs),
    /// Print version information and exit.
    Version,
}

/// Where the vault database lives. Shared by every subcommand that opens it.
#[derive(Args, Debug, Clone)]
pub struct StorageArgs {
    /// Data directory holding the sled database.
    ///
    /// Created on first run if it does not exist.
    #[arg(long, short = 'd', env = "GUILDVAULT_DATA_DIR", default_value = "./guildvault-data")]
    pub data_dir: PathBuf,
}

/// Arguments for the `run` subcommand.
#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub storage: StorageArgs,

    /// Port for the REST and WebSocket API.
    #[arg(long, env = "GUILDVAULT_API_PORT", default_value_t = 7410)]
    pub api_port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "GUILDVAULT_METRICS_PORT", default_value_t = 7411)]
    pub metrics_port: u16,

    /// Seconds between periodic flushes of open vault views.
    #[arg(long, env = "GUILDVAULT_FLUSH_INTERVAL", default_value_t = 30)]
    pub flush_interval_secs: u64,

    /// Stack limit for materials without a specific override.
    #[arg(long, env = "GUILDVAULT_MAX_STACK", default_value_t = 64)]
    pub max_stack: u32,

    /// Slots per vault for newly formed vaults.
    #[arg(long, env = "GUILDVAULT_SLOT_COUNT", default_value_t = 54)]
    pub slot_count: usize,

    /// Log output format.
    #[arg(long, env = "GUILDVAULT_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

/// Arguments for the `info` subcommand.
#[derive(Args, Debug)]
pub struct InfoArgs {
    #[command(flatten)]
    pub storage: StorageArgs,

    /// Owning entity to look up.
    #[arg(long)]
    pub owner: String,
}

/// Arguments for the `log` subcommand.
#[derive(Args, Debug)]
pub struct LogArgs {
    #[command(flatten)]
    pub storage: StorageArgs,

    /// Owning entity whose vault history to show.
    #[arg(long)]
    pub owner: String,

    /// Page number, starting at 1.
    #[arg(long, default_value_t = 1)]
    pub page: usize,
}
