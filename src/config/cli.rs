use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the offsite binary.
#[derive(Debug, Parser)]
#[command(
    name = "offsite",
    version,
    about = "Resolve resource keys to identities and offload resources to remote storage"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "OFFSITE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the offload scheduler until interrupted.
    Serve(Box<ServeArgs>),
    /// Resolve one or more keys and print the identities found.
    Resolve(ResolveArgs),
    /// Queue a local file for upload.
    Enqueue(EnqueueArgs),
    /// Cancel the live offload task of an identity.
    Cancel(IdentityArgs),
    /// Signal that downstream processing of an identity finished.
    #[command(name = "processing-complete")]
    ProcessingComplete(IdentityArgs),
    /// Run a single offload tick.
    Tick(TickArgs),
    /// Run the full retention sweep once.
    Sweep(MaintenanceArgs),
    /// Trim sample logs and the watchlist once.
    Trim(MaintenanceArgs),
    /// Backfill key hashes, drop duplicates and install the unique index.
    #[command(name = "repair-index")]
    RepairIndex(MaintenanceArgs),
    /// Print a statistics snapshot as JSON.
    Stats(MaintenanceArgs),
    /// List index entries whose key starts with a prefix.
    #[command(name = "scan-index")]
    ScanIndex(ScanArgs),
    /// Show the latest offload task of an identity.
    Task(IdentityArgs),
    /// List offload tasks in one state.
    Tasks(TasksArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseOverride {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,

    /// Override the uploads directory.
    #[arg(long = "uploads-directory", value_name = "PATH")]
    pub uploads_directory: Option<PathBuf>,

    /// Override the sample log directory.
    #[arg(long = "log-directory", value_name = "PATH")]
    pub log_directory: Option<PathBuf>,

    /// Override the number of concurrent uploads.
    #[arg(long = "offload-max-concurrency", value_name = "COUNT")]
    pub offload_max_concurrency: Option<u32>,

    /// Override the offload tick cadence.
    #[arg(long = "scheduler-tick-seconds", value_name = "SECONDS")]
    pub scheduler_tick_seconds: Option<u64>,

    /// Override the remote storage endpoint.
    #[arg(long = "storage-endpoint", value_name = "URL")]
    pub storage_endpoint: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct ResolveArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Keys (paths or URLs) to resolve.
    #[arg(value_name = "KEY", required = true)]
    pub keys: Vec<String>,
}

#[derive(Debug, Args, Clone)]
pub struct EnqueueArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Identity that owns the resource.
    #[arg(long, value_name = "ID")]
    pub identity: i64,

    /// Path of the local copy relative to the uploads directory.
    #[arg(value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub local_path: String,

    /// Object name at the remote store; defaults to the local path.
    #[arg(long = "remote-name", value_name = "NAME")]
    pub remote_name: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct IdentityArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Identity to act on.
    #[arg(value_name = "ID")]
    pub identity: i64,
}

#[derive(Debug, Args, Clone)]
pub struct TickArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Override the maximum number of tasks taken in this tick.
    #[arg(long = "batch", value_name = "COUNT")]
    pub batch: Option<u32>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct MaintenanceArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,
}

#[derive(Debug, Args, Clone)]
pub struct ScanArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Normalized key prefix to match.
    #[arg(value_name = "PREFIX")]
    pub prefix: String,

    #[arg(long, value_name = "COUNT", default_value_t = 50)]
    pub limit: u32,
}

#[derive(Debug, Args, Clone)]
pub struct TasksArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Task state (pending|uploading|completed|abandoned).
    #[arg(value_name = "STATE")]
    pub state: String,

    #[arg(long, value_name = "COUNT", default_value_t = 50)]
    pub limit: u32,
}
