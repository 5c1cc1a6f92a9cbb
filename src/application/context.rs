//! Explicit wiring of every component, built once at startup.

use std::sync::Arc;

use crate::application::error::AppError;
use crate::application::fallback::FallbackResolver;
use crate::application::janitor::{JanitorConfig, RetentionJanitor};
use crate::application::lookup::LookupIndex;
use crate::application::offload::{OffloadConfig, OffloadQueue};
use crate::application::repos::{CatalogRepo, LookupRepo, OffloadRepo};
use crate::application::resolver::{Resolver, ResolverConfig};
use crate::application::stats::{QueueStats, StatsSnapshot};
use crate::application::storage::ObjectStorageClient;
use crate::application::watchdog::{WatchdogConfig, WatchdogMonitor};
use crate::cache::{FastCache, FastCacheConfig};
use crate::config::Settings;
use crate::infra::error::InfraError;
use crate::infra::sample_log::{OFFLOAD_FAILURE_LOG, SLOW_QUERY_LOG, SampleLog};
use crate::infra::uploads::LocalStore;

/// Persistence and storage adapters the context is built on.
#[derive(Clone)]
pub struct Backends {
    pub lookup: Arc<dyn LookupRepo>,
    pub catalog: Arc<dyn CatalogRepo>,
    pub offload: Arc<dyn OffloadRepo>,
    pub storage: Arc<dyn ObjectStorageClient>,
}

impl Backends {
    /// Use one repository value for every persistence trait.
    pub fn from_repositories<R>(repos: Arc<R>, storage: Arc<dyn ObjectStorageClient>) -> Self
    where
        R: LookupRepo + CatalogRepo + OffloadRepo + 'static,
    {
        Self {
            lookup: repos.clone(),
            catalog: repos.clone(),
            offload: repos,
            storage,
        }
    }
}

pub struct AppContext {
    pub cache: Arc<FastCache>,
    pub index: Arc<LookupIndex>,
    pub watchdog: Arc<WatchdogMonitor>,
    pub resolver: Arc<Resolver>,
    pub queue: Arc<OffloadQueue>,
    pub janitor: Arc<RetentionJanitor>,
    pub local: Arc<LocalStore>,
    pub slow_log: Arc<SampleLog>,
    pub failure_log: Arc<SampleLog>,
}

impl AppContext {
    pub fn build(settings: &Settings, backends: Backends) -> Result<Self, AppError> {
        let Backends {
            lookup,
            catalog,
            offload,
            storage,
        } = backends;

        let local = Arc::new(
            LocalStore::new(settings.uploads.directory.clone()).map_err(InfraError::from)?,
        );
        std::fs::create_dir_all(&settings.janitor.log_directory).map_err(InfraError::from)?;
        let slow_log = Arc::new(SampleLog::in_directory(
            &settings.janitor.log_directory,
            SLOW_QUERY_LOG,
        ));
        let failure_log = Arc::new(SampleLog::in_directory(
            &settings.janitor.log_directory,
            OFFLOAD_FAILURE_LOG,
        ));

        let cache = Arc::new(FastCache::new(FastCacheConfig::from(&settings.cache)));
        let index = Arc::new(LookupIndex::new(lookup, cache.clone()));
        let watchdog = Arc::new(WatchdogMonitor::new(WatchdogConfig::from(
            &settings.watchdog,
        )));

        let resolver = Resolver::new(
            ResolverConfig::from(&settings.resolver),
            cache.clone(),
            index.clone(),
            FallbackResolver::new(catalog, settings.resolver.fallback_enabled),
            watchdog.clone(),
        )
        .with_slow_log(slow_log.clone());

        let queue = OffloadQueue::new(
            OffloadConfig::from(&settings.offload),
            offload.clone(),
            index.clone(),
            storage,
            local.clone(),
        )
        .with_failure_log(failure_log.clone());

        let janitor = RetentionJanitor::new(
            JanitorConfig {
                log_keep: settings.janitor.log_keep.get(),
                watchlist_retention: settings.watchdog.retention,
                task_retention: settings.janitor.task_retention,
            },
            cache.clone(),
            watchdog.clone(),
            vec![slow_log.clone(), failure_log.clone()],
            offload,
        );

        Ok(Self {
            cache,
            index,
            watchdog,
            resolver: Arc::new(resolver),
            queue: Arc::new(queue),
            janitor: Arc::new(janitor),
            local,
            slow_log,
            failure_log,
        })
    }

    /// Reporting snapshot; reads only.
    pub async fn stats(&self) -> Result<StatsSnapshot, AppError> {
        let counts = self.queue.counts().await?;
        Ok(StatsSnapshot {
            watchdog: self.watchdog.stats(),
            cache: self.cache.stats(),
            queue: QueueStats::new(self.queue.active_uploads(), counts),
        })
    }
}
