//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

mod cli;

pub use cli::{
    CliArgs, Command, DatabaseOverride, EnqueueArgs, IdentityArgs, MaintenanceArgs, ResolveArgs,
    ScanArgs, ServeArgs, ServeOverrides, TasksArgs, TickArgs,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "offsite";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_CACHE_CAPACITY: u64 = 10_000;
const DEFAULT_CACHE_POSITIVE_TTL_SECS: u64 = 300;
const DEFAULT_CACHE_NEGATIVE_TTL_SECS: u64 = 60;
const DEFAULT_CACHE_MAX_TTL_SECS: u64 = 48 * 60 * 60;
const DEFAULT_RESOLVER_TRANSIENT_RETRIES: u32 = 1;
const DEFAULT_WATCHDOG_SLOW_MS: u64 = 250;
const DEFAULT_WATCHDOG_CAPACITY: u64 = 1_000;
const DEFAULT_WATCHDOG_SAMPLE_CAPACITY: u64 = 100;
const DEFAULT_QUARANTINE_THRESHOLD: u64 = 3;
const DEFAULT_QUARANTINE_WINDOW_SECS: u64 = 60 * 60;
const DEFAULT_WATCHLIST_RETENTION_DAYS: u64 = 7;
const DEFAULT_OFFLOAD_MAX_CONCURRENCY: u64 = 3;
const DEFAULT_OFFLOAD_MAX_ATTEMPTS: u64 = 3;
const DEFAULT_OFFLOAD_BATCH_SIZE: u64 = 10;
const DEFAULT_OFFLOAD_BACKOFF_SECS: [u64; 4] = [0, 60, 120, 240];
const DEFAULT_DELETION_GRACE_SECS: u64 = 10 * 60;
const DEFAULT_STALE_UPLOAD_SECS: u64 = 15 * 60;
const DEFAULT_LOG_DIR: &str = "logs";
const DEFAULT_LOG_KEEP: u64 = 100;
const DEFAULT_TASK_RETENTION_DAYS: u64 = 30;
const DEFAULT_UPLOAD_DIR: &str = "uploads";
const DEFAULT_TICK_SECS: u64 = 30;
const DEFAULT_TRIM_SECS: u64 = 60 * 60;
const DEFAULT_SWEEP_SECS: u64 = 24 * 60 * 60;
const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub cache: CacheSettings,
    pub resolver: ResolverSettings,
    pub watchdog: WatchdogSettings,
    pub offload: OffloadSettings,
    pub janitor: JanitorSettings,
    pub storage: StorageSettings,
    pub uploads: UploadSettings,
    pub scheduler: SchedulerSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    /// Without a URL the process runs on the in-memory backend.
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub capacity: NonZeroUsize,
    pub positive_ttl: Duration,
    pub negative_ttl: Duration,
    pub max_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct ResolverSettings {
    /// Immediate retries of a transient store error.
    pub transient_retries: u32,
    pub fallback_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct WatchdogSettings {
    pub slow_threshold: Duration,
    pub capacity: NonZeroUsize,
    pub sample_capacity: NonZeroUsize,
    pub quarantine_threshold: NonZeroU32,
    pub quarantine_window: Duration,
    pub retention: Duration,
}

#[derive(Debug, Clone)]
pub struct OffloadSettings {
    pub max_concurrency: NonZeroU32,
    pub max_attempts: NonZeroU32,
    pub batch_size: NonZeroU32,
    /// Delay before attempt `n`, indexed by attempts already made.
    pub backoff: Vec<Duration>,
    pub remove_local_copy: bool,
    pub deletion_grace: Duration,
    pub stale_upload_after: Duration,
}

#[derive(Debug, Clone)]
pub struct JanitorSettings {
    pub log_directory: PathBuf,
    pub log_keep: NonZeroUsize,
    pub task_retention: Duration,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    /// Base URL objects are PUT under. Without it uploads fail as fatal.
    pub endpoint: Option<Url>,
    pub token: Option<String>,
    /// Public base URL recorded for uploaded objects; defaults to the endpoint.
    pub public_base_url: Option<Url>,
}

#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub directory: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub tick_interval: Duration,
    pub trim_interval: Duration,
    pub sweep_interval: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix("OFFSITE")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("offload.backoff_seconds"),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Resolve(args)) => raw.apply_database_override(&args.database),
        Some(Command::Enqueue(args)) => raw.apply_database_override(&args.database),
        Some(Command::Cancel(args))
        | Some(Command::ProcessingComplete(args))
        | Some(Command::Task(args)) => raw.apply_database_override(&args.database),
        Some(Command::ScanIndex(args)) => raw.apply_database_override(&args.database),
        Some(Command::Tasks(args)) => raw.apply_database_override(&args.database),
        Some(Command::Tick(args)) => {
            raw.apply_database_override(&args.database);
            if let Some(batch) = args.batch {
                raw.offload.batch_size = Some(batch.into());
            }
        }
        Some(Command::Sweep(args))
        | Some(Command::Trim(args))
        | Some(Command::RepairIndex(args))
        | Some(Command::Stats(args)) => raw.apply_database_override(&args.database),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    cache: RawCacheSettings,
    resolver: RawResolverSettings,
    watchdog: RawWatchdogSettings,
    offload: RawOffloadSettings,
    janitor: RawJanitorSettings,
    storage: RawStorageSettings,
    uploads: RawUploadSettings,
    scheduler: RawSchedulerSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(directory) = overrides.uploads_directory.as_ref() {
            self.uploads.directory = Some(directory.clone());
        }
        if let Some(directory) = overrides.log_directory.as_ref() {
            self.janitor.log_directory = Some(directory.clone());
        }
        if let Some(value) = overrides.offload_max_concurrency {
            self.offload.max_concurrency = Some(value.into());
        }
        if let Some(seconds) = overrides.scheduler_tick_seconds {
            self.scheduler.tick_seconds = Some(seconds);
        }
        if let Some(endpoint) = overrides.storage_endpoint.as_ref() {
            self.storage.endpoint = Some(endpoint.clone());
        }
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }
}

impl Settings {
    /// Built-in defaults only, ignoring files, environment and CLI.
    pub fn from_defaults() -> Result<Self, LoadError> {
        Self::from_raw(RawSettings::default())
    }

    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            database,
            cache,
            resolver,
            watchdog,
            offload,
            janitor,
            storage,
            uploads,
            scheduler,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            database: build_database_settings(database)?,
            cache: build_cache_settings(cache)?,
            resolver: build_resolver_settings(resolver),
            watchdog: build_watchdog_settings(watchdog)?,
            offload: build_offload_settings(offload)?,
            janitor: build_janitor_settings(janitor)?,
            storage: build_storage_settings(storage)?,
            uploads: build_upload_settings(uploads)?,
            scheduler: build_scheduler_settings(scheduler)?,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = database.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let max_value = database
        .max_connections
        .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS);
    let max_connections = non_zero_u32(max_value.into(), "database.max_connections")?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let capacity = non_zero_usize(
        cache.capacity.unwrap_or(DEFAULT_CACHE_CAPACITY),
        "cache.capacity",
    )?;
    let positive_ttl = positive_seconds(
        cache
            .positive_ttl_seconds
            .unwrap_or(DEFAULT_CACHE_POSITIVE_TTL_SECS),
        "cache.positive_ttl_seconds",
    )?;
    let negative_ttl = positive_seconds(
        cache
            .negative_ttl_seconds
            .unwrap_or(DEFAULT_CACHE_NEGATIVE_TTL_SECS),
        "cache.negative_ttl_seconds",
    )?;
    let max_ttl = positive_seconds(
        cache.max_ttl_seconds.unwrap_or(DEFAULT_CACHE_MAX_TTL_SECS),
        "cache.max_ttl_seconds",
    )?;
    if max_ttl > Duration::from_secs(DEFAULT_CACHE_MAX_TTL_SECS) {
        return Err(LoadError::invalid(
            "cache.max_ttl_seconds",
            "must not exceed 48 hours",
        ));
    }

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        capacity,
        positive_ttl,
        negative_ttl,
        max_ttl,
    })
}

fn build_resolver_settings(resolver: RawResolverSettings) -> ResolverSettings {
    ResolverSettings {
        transient_retries: resolver
            .transient_retries
            .unwrap_or(DEFAULT_RESOLVER_TRANSIENT_RETRIES),
        fallback_enabled: resolver.fallback_enabled.unwrap_or(true),
    }
}

fn build_watchdog_settings(watchdog: RawWatchdogSettings) -> Result<WatchdogSettings, LoadError> {
    let slow_ms = watchdog.slow_threshold_ms.unwrap_or(DEFAULT_WATCHDOG_SLOW_MS);
    if slow_ms == 0 {
        return Err(LoadError::invalid(
            "watchdog.slow_threshold_ms",
            "must be greater than zero",
        ));
    }

    Ok(WatchdogSettings {
        slow_threshold: Duration::from_millis(slow_ms),
        capacity: non_zero_usize(
            watchdog.capacity.unwrap_or(DEFAULT_WATCHDOG_CAPACITY),
            "watchdog.capacity",
        )?,
        sample_capacity: non_zero_usize(
            watchdog
                .sample_capacity
                .unwrap_or(DEFAULT_WATCHDOG_SAMPLE_CAPACITY),
            "watchdog.sample_capacity",
        )?,
        quarantine_threshold: non_zero_u32(
            watchdog
                .quarantine_threshold
                .unwrap_or(DEFAULT_QUARANTINE_THRESHOLD),
            "watchdog.quarantine_threshold",
        )?,
        quarantine_window: positive_seconds(
            watchdog
                .quarantine_window_seconds
                .unwrap_or(DEFAULT_QUARANTINE_WINDOW_SECS),
            "watchdog.quarantine_window_seconds",
        )?,
        retention: positive_days(
            watchdog
                .retention_days
                .unwrap_or(DEFAULT_WATCHLIST_RETENTION_DAYS),
            "watchdog.retention_days",
        )?,
    })
}

fn build_offload_settings(offload: RawOffloadSettings) -> Result<OffloadSettings, LoadError> {
    let backoff_seconds = offload
        .backoff_seconds
        .unwrap_or_else(|| DEFAULT_OFFLOAD_BACKOFF_SECS.to_vec());
    if backoff_seconds.is_empty() {
        return Err(LoadError::invalid(
            "offload.backoff_seconds",
            "schedule must contain at least one entry",
        ));
    }

    let max_attempts = non_zero_u32(
        offload.max_attempts.unwrap_or(DEFAULT_OFFLOAD_MAX_ATTEMPTS),
        "offload.max_attempts",
    )?;
    if i32::try_from(max_attempts.get()).is_err() {
        return Err(LoadError::invalid(
            "offload.max_attempts",
            "value exceeds supported range for i32",
        ));
    }

    Ok(OffloadSettings {
        max_concurrency: non_zero_u32(
            offload
                .max_concurrency
                .unwrap_or(DEFAULT_OFFLOAD_MAX_CONCURRENCY),
            "offload.max_concurrency",
        )?,
        max_attempts,
        batch_size: non_zero_u32(
            offload.batch_size.unwrap_or(DEFAULT_OFFLOAD_BATCH_SIZE),
            "offload.batch_size",
        )?,
        backoff: backoff_seconds
            .into_iter()
            .map(Duration::from_secs)
            .collect(),
        remove_local_copy: offload.remove_local_copy.unwrap_or(true),
        deletion_grace: Duration::from_secs(
            offload
                .deletion_grace_seconds
                .unwrap_or(DEFAULT_DELETION_GRACE_SECS),
        ),
        stale_upload_after: positive_seconds(
            offload
                .stale_upload_seconds
                .unwrap_or(DEFAULT_STALE_UPLOAD_SECS),
            "offload.stale_upload_seconds",
        )?,
    })
}

fn build_janitor_settings(janitor: RawJanitorSettings) -> Result<JanitorSettings, LoadError> {
    let log_directory = janitor
        .log_directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR));
    if log_directory.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "janitor.log_directory",
            "path must not be empty",
        ));
    }

    Ok(JanitorSettings {
        log_directory,
        log_keep: non_zero_usize(
            janitor.log_keep.unwrap_or(DEFAULT_LOG_KEEP),
            "janitor.log_keep",
        )?,
        task_retention: positive_days(
            janitor
                .task_retention_days
                .unwrap_or(DEFAULT_TASK_RETENTION_DAYS),
            "janitor.task_retention_days",
        )?,
    })
}

fn build_storage_settings(storage: RawStorageSettings) -> Result<StorageSettings, LoadError> {
    let endpoint = parse_optional_url(storage.endpoint, "storage.endpoint")?;
    let public_base_url = parse_optional_url(storage.public_base_url, "storage.public_base_url")?;
    let token = storage.token.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    Ok(StorageSettings {
        endpoint,
        token,
        public_base_url,
    })
}

fn build_upload_settings(uploads: RawUploadSettings) -> Result<UploadSettings, LoadError> {
    let directory = uploads
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOAD_DIR));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "uploads.directory",
            "path must not be empty",
        ));
    }

    Ok(UploadSettings { directory })
}

fn build_scheduler_settings(
    scheduler: RawSchedulerSettings,
) -> Result<SchedulerSettings, LoadError> {
    Ok(SchedulerSettings {
        tick_interval: positive_seconds(
            scheduler.tick_seconds.unwrap_or(DEFAULT_TICK_SECS),
            "scheduler.tick_seconds",
        )?,
        trim_interval: positive_seconds(
            scheduler.trim_seconds.unwrap_or(DEFAULT_TRIM_SECS),
            "scheduler.trim_seconds",
        )?,
        sweep_interval: positive_seconds(
            scheduler.sweep_seconds.unwrap_or(DEFAULT_SWEEP_SECS),
            "scheduler.sweep_seconds",
        )?,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    capacity: Option<u64>,
    positive_ttl_seconds: Option<u64>,
    negative_ttl_seconds: Option<u64>,
    max_ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawResolverSettings {
    transient_retries: Option<u32>,
    fallback_enabled: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawWatchdogSettings {
    slow_threshold_ms: Option<u64>,
    capacity: Option<u64>,
    sample_capacity: Option<u64>,
    quarantine_threshold: Option<u64>,
    quarantine_window_seconds: Option<u64>,
    retention_days: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawOffloadSettings {
    max_concurrency: Option<u64>,
    max_attempts: Option<u64>,
    batch_size: Option<u64>,
    backoff_seconds: Option<Vec<u64>>,
    remove_local_copy: Option<bool>,
    deletion_grace_seconds: Option<u64>,
    stale_upload_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawJanitorSettings {
    log_directory: Option<PathBuf>,
    log_keep: Option<u64>,
    task_retention_days: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStorageSettings {
    endpoint: Option<String>,
    token: Option<String>,
    public_base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawUploadSettings {
    directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSchedulerSettings {
    tick_seconds: Option<u64>,
    trim_seconds: Option<u64>,
    sweep_seconds: Option<u64>,
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value_usize: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value_usize).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn positive_seconds(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_secs(value))
}

fn positive_days(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    let seconds = value
        .checked_mul(SECONDS_PER_DAY)
        .ok_or_else(|| LoadError::invalid(key, "value exceeds supported range"))?;
    positive_seconds(seconds, key)
}

fn parse_optional_url(value: Option<String>, key: &'static str) -> Result<Option<Url>, LoadError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    Url::parse(trimmed)
        .map(Some)
        .map_err(|err| LoadError::invalid(key, format!("invalid url `{trimmed}`: {err}")))
}

#[cfg(test)]
mod tests;
