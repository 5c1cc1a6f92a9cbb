//! Periodic retention sweep over caches, sample logs, the watchlist and task history.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{error, info};

use crate::application::repos::OffloadRepo;
use crate::application::watchdog::WatchdogMonitor;
use crate::cache::FastCache;
use crate::infra::sample_log::SampleLog;

const SOURCE: &str = "application::janitor";

const METRIC_SWEEP_MS: &str = "offsite_janitor_sweep_ms";
const METRIC_ERRORS: &str = "offsite_janitor_errors_total";

#[derive(Debug, Clone)]
pub struct JanitorConfig {
    /// Entries kept per sample log.
    pub log_keep: usize,
    pub watchlist_retention: Duration,
    pub task_retention: Duration,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            log_keep: 100,
            watchlist_retention: Duration::from_secs(7 * 24 * 60 * 60),
            task_retention: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepError {
    pub task: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    pub cleaned_cache: usize,
    /// Sample log lines dropped across all logs.
    pub trimmed_logs: usize,
    pub cleaned_watchlist: usize,
    pub purged_tasks: u64,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub errors: Vec<SweepError>,
}

pub struct RetentionJanitor {
    config: JanitorConfig,
    cache: Arc<FastCache>,
    watchdog: Arc<WatchdogMonitor>,
    logs: Vec<Arc<SampleLog>>,
    tasks: Arc<dyn OffloadRepo>,
}

impl RetentionJanitor {
    pub fn new(
        config: JanitorConfig,
        cache: Arc<FastCache>,
        watchdog: Arc<WatchdogMonitor>,
        logs: Vec<Arc<SampleLog>>,
        tasks: Arc<dyn OffloadRepo>,
    ) -> Self {
        Self {
            config,
            cache,
            watchdog,
            logs,
            tasks,
        }
    }

    /// Full sweep. Each sub-task fails on its own; errors are collected, not propagated.
    pub async fn run_sweep(&self) -> SweepStats {
        let started = Instant::now();
        let now = OffsetDateTime::now_utc();
        let mut stats = SweepStats::default();

        stats.cleaned_cache = self.cache.purge_expired(now);
        self.trim_logs(&mut stats).await;
        stats.cleaned_watchlist = self
            .watchdog
            .purge_older_than(now - self.config.watchlist_retention);

        match self
            .tasks
            .purge_terminal_before(now - self.config.task_retention)
            .await
        {
            Ok(purged) => stats.purged_tasks = purged,
            Err(err) => stats.errors.push(SweepError {
                task: "purge_tasks".to_string(),
                message: err.to_string(),
            }),
        }

        stats.duration = started.elapsed();
        self.finish("sweep", &stats);
        stats
    }

    /// Hourly variant: sample logs and the watchlist only.
    pub async fn run_trim(&self) -> SweepStats {
        let started = Instant::now();
        let now = OffsetDateTime::now_utc();
        let mut stats = SweepStats::default();

        self.trim_logs(&mut stats).await;
        stats.cleaned_watchlist = self
            .watchdog
            .purge_older_than(now - self.config.watchlist_retention);

        stats.duration = started.elapsed();
        self.finish("trim", &stats);
        stats
    }

    async fn trim_logs(&self, stats: &mut SweepStats) {
        for log in &self.logs {
            match log.trim(self.config.log_keep).await {
                Ok(dropped) => stats.trimmed_logs += dropped,
                Err(err) => stats.errors.push(SweepError {
                    task: format!("trim_log:{}", log.name()),
                    message: err.to_string(),
                }),
            }
        }
    }

    fn finish(&self, kind: &'static str, stats: &SweepStats) {
        histogram!(METRIC_SWEEP_MS, "kind" => kind).record(stats.duration.as_secs_f64() * 1000.0);
        for failure in &stats.errors {
            counter!(METRIC_ERRORS, "kind" => kind).increment(1);
            error!(
                target = SOURCE,
                kind,
                task = %failure.task,
                error = %failure.message,
                "retention sub-task failed"
            );
        }
        info!(
            target = SOURCE,
            kind,
            cleaned_cache = stats.cleaned_cache,
            trimmed_logs = stats.trimmed_logs,
            cleaned_watchlist = stats.cleaned_watchlist,
            purged_tasks = stats.purged_tasks,
            errors = stats.errors.len(),
            duration_ms = stats.duration.as_millis() as u64,
            "retention pass finished"
        );
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }
}
