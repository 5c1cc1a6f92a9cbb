//! Multi-tier key resolution: fast cache, then lookup index, then catalog fallback.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use serde::Serialize;
use serde_json::json;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::application::error::ResolveError;
use crate::application::fallback::FallbackResolver;
use crate::application::lookup::LookupIndex;
use crate::application::repos::RepoError;
use crate::application::watchdog::{Observation, Outcome, WatchdogMonitor};
use crate::cache::{CachedIdentity, FastCache};
use crate::domain::entities::Identity;
use crate::domain::keys::LookupKey;
use crate::domain::types::Tier;
use crate::infra::sample_log::{SampleEntry, SampleLog};

const SOURCE: &str = "application::resolver";

const METRIC_RESOLVE_TOTAL: &str = "offsite_resolve_total";
const METRIC_RESOLVE_MS: &str = "offsite_resolve_ms";

/// Answer for one key: the identity if any, and the tier that settled it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub key: LookupKey,
    pub identity: Option<Identity>,
    pub tier: Tier,
}

impl Resolution {
    pub fn found(&self) -> bool {
        self.identity.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Immediate retries of a transient store error.
    pub transient_retries: u32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            transient_retries: 1,
        }
    }
}

impl From<&crate::config::ResolverSettings> for ResolverConfig {
    fn from(settings: &crate::config::ResolverSettings) -> Self {
        Self {
            transient_retries: settings.transient_retries,
        }
    }
}

pub struct Resolver {
    config: ResolverConfig,
    cache: Arc<FastCache>,
    index: Arc<LookupIndex>,
    fallback: FallbackResolver,
    watchdog: Arc<WatchdogMonitor>,
    slow_log: Option<Arc<SampleLog>>,
}

impl Resolver {
    pub fn new(
        config: ResolverConfig,
        cache: Arc<FastCache>,
        index: Arc<LookupIndex>,
        fallback: FallbackResolver,
        watchdog: Arc<WatchdogMonitor>,
    ) -> Self {
        Self {
            config,
            cache,
            index,
            fallback,
            watchdog,
            slow_log: None,
        }
    }

    /// Record slow lookups into `log` in addition to the in-memory ring buffer.
    pub fn with_slow_log(mut self, log: Arc<SampleLog>) -> Self {
        self.slow_log = Some(log);
        self
    }

    pub async fn resolve(&self, raw: &str) -> Result<Resolution, ResolveError> {
        let started = Instant::now();
        let key = LookupKey::parse(raw)?;
        let result = self.resolve_key(key).await;

        let outcome = match &result {
            Ok(resolution) if resolution.found() => "found",
            Ok(_) => "not_found",
            Err(_) => "error",
        };
        let tier = result
            .as_ref()
            .map(|resolution| resolution.tier.as_str())
            .unwrap_or("none");
        counter!(METRIC_RESOLVE_TOTAL, "tier" => tier, "outcome" => outcome).increment(1);
        histogram!(METRIC_RESOLVE_MS).record(started.elapsed().as_secs_f64() * 1000.0);

        result
    }

    async fn resolve_key(&self, key: LookupKey) -> Result<Resolution, ResolveError> {
        let now = OffsetDateTime::now_utc();
        if self.watchdog.is_quarantined(key.as_str(), now) {
            debug!(target = SOURCE, key = %key, "quarantined key sent straight to fallback");
            return self.resolve_fallback(key, true).await;
        }

        let started = Instant::now();
        let cached = self.cache.get(&key);
        let outcome = if cached.is_some() {
            Outcome::Hit
        } else {
            Outcome::Miss
        };
        self.observe(&key, Tier::Cache, started.elapsed(), outcome)
            .await;

        match cached {
            Some(CachedIdentity::Found(identity)) => {
                return Ok(resolved(key, Some(identity), Tier::Cache));
            }
            Some(CachedIdentity::Missing) => return Ok(resolved(key, None, Tier::Cache)),
            None => {}
        }

        let started = Instant::now();
        let indexed = self.with_retry("index_get", || self.index.get(&key)).await;
        match indexed {
            Ok(Some(identity)) => {
                self.observe(&key, Tier::Index, started.elapsed(), Outcome::Hit)
                    .await;
                self.cache.put_found(key.clone(), identity);
                Ok(resolved(key, Some(identity), Tier::Index))
            }
            Ok(None) => {
                self.observe(&key, Tier::Index, started.elapsed(), Outcome::Miss)
                    .await;
                self.resolve_fallback(key, false).await
            }
            Err(err) => {
                self.observe(&key, Tier::Index, started.elapsed(), Outcome::Failed)
                    .await;
                Err(ResolveError::Store(err))
            }
        }
    }

    async fn resolve_fallback(
        &self,
        key: LookupKey,
        quarantined: bool,
    ) -> Result<Resolution, ResolveError> {
        let started = Instant::now();
        let found = self
            .with_retry("fallback_find", || self.fallback.find(&key))
            .await;

        match found {
            Ok(Some(identity)) => {
                self.observe(&key, Tier::Fallback, started.elapsed(), Outcome::Hit)
                    .await;
                if let Err(err) = self.index.upsert(&key, identity).await {
                    warn!(
                        target = SOURCE,
                        key = %key,
                        identity,
                        error = %err,
                        "failed to promote fallback result into the index"
                    );
                    self.cache.put_found(key.clone(), identity);
                }
                Ok(resolved(key, Some(identity), Tier::Fallback))
            }
            Ok(None) => {
                self.observe(&key, Tier::Fallback, started.elapsed(), Outcome::Miss)
                    .await;
                if quarantined {
                    return Ok(self.settle_quarantined_miss(key).await);
                }
                self.cache.put_missing(key.clone());
                Ok(resolved(key, None, Tier::Fallback))
            }
            Err(err) => {
                self.observe(&key, Tier::Fallback, started.elapsed(), Outcome::Failed)
                    .await;
                Err(ResolveError::Store(err))
            }
        }
    }

    /// A quarantined key skipped the cache and the index; its fallback miss only stands
    /// once neither of them knows the key.
    async fn settle_quarantined_miss(&self, key: LookupKey) -> Resolution {
        let started = Instant::now();
        if let Some(CachedIdentity::Found(identity)) = self.cache.get(&key) {
            self.observe(&key, Tier::Cache, started.elapsed(), Outcome::Hit)
                .await;
            return resolved(key, Some(identity), Tier::Cache);
        }

        let started = Instant::now();
        match self.index.get(&key).await {
            Ok(Some(identity)) => {
                self.observe(&key, Tier::Index, started.elapsed(), Outcome::Hit)
                    .await;
                self.cache.put_found(key.clone(), identity);
                resolved(key, Some(identity), Tier::Index)
            }
            Ok(None) => {
                self.observe(&key, Tier::Index, started.elapsed(), Outcome::Miss)
                    .await;
                self.cache.put_missing(key.clone());
                resolved(key, None, Tier::Fallback)
            }
            Err(err) => {
                self.observe(&key, Tier::Index, started.elapsed(), Outcome::Failed)
                    .await;
                debug!(
                    target = SOURCE,
                    key = %key,
                    error = %err,
                    "index still failing for quarantined key; miss not cached"
                );
                resolved(key, None, Tier::Fallback)
            }
        }
    }

    /// Resolve a batch of raw keys, returning identities keyed by the raw spelling.
    ///
    /// Invalid and unresolved keys are absent from the result. Keys not answered by the
    /// cache are looked up in the index with one query; the remaining misses go through
    /// the fallback one by one.
    pub async fn resolve_many<S: AsRef<str>>(
        &self,
        raws: &[S],
    ) -> Result<HashMap<String, Identity>, ResolveError> {
        let mut spellings: HashMap<LookupKey, Vec<String>> = HashMap::new();
        for raw in raws {
            let raw = raw.as_ref();
            match LookupKey::parse(raw) {
                Ok(key) => spellings.entry(key).or_default().push(raw.to_string()),
                Err(err) => debug!(target = SOURCE, raw, error = %err, "skipping invalid key"),
            }
        }

        let now = OffsetDateTime::now_utc();
        let mut answers: HashMap<LookupKey, Identity> = HashMap::new();
        let mut index_pending: Vec<LookupKey> = Vec::new();
        let mut fallback_pending: Vec<(LookupKey, bool)> = Vec::new();

        for key in spellings.keys() {
            if self.watchdog.is_quarantined(key.as_str(), now) {
                fallback_pending.push((key.clone(), true));
                continue;
            }

            let started = Instant::now();
            let cached = self.cache.get(key);
            let outcome = if cached.is_some() {
                Outcome::Hit
            } else {
                Outcome::Miss
            };
            self.observe(key, Tier::Cache, started.elapsed(), outcome)
                .await;
            match cached {
                Some(CachedIdentity::Found(identity)) => {
                    answers.insert(key.clone(), identity);
                }
                Some(CachedIdentity::Missing) => {}
                None => index_pending.push(key.clone()),
            }
        }

        if !index_pending.is_empty() {
            let started = Instant::now();
            let found = self
                .with_retry("index_get_many", || self.index.get_many(&index_pending))
                .await;
            let per_key = started.elapsed() / index_pending.len() as u32;

            let found = match found {
                Ok(found) => found,
                Err(err) => {
                    for key in &index_pending {
                        self.observe(key, Tier::Index, per_key, Outcome::Failed)
                            .await;
                    }
                    return Err(ResolveError::Store(err));
                }
            };

            for key in index_pending {
                match found.get(&key) {
                    Some(&identity) => {
                        self.observe(&key, Tier::Index, per_key, Outcome::Hit).await;
                        self.cache.put_found(key.clone(), identity);
                        answers.insert(key, identity);
                    }
                    None => {
                        self.observe(&key, Tier::Index, per_key, Outcome::Miss)
                            .await;
                        fallback_pending.push((key, false));
                    }
                }
            }
        }

        for (key, quarantined) in fallback_pending {
            let resolution = self.resolve_fallback(key, quarantined).await?;
            if let Some(identity) = resolution.identity {
                answers.insert(resolution.key, identity);
            }
        }

        let mut result = HashMap::with_capacity(raws.len());
        for (key, identity) in answers {
            if let Some(raws) = spellings.remove(&key) {
                for raw in raws {
                    result.insert(raw, identity);
                }
            }
        }
        Ok(result)
    }

    /// Remove every index entry owned by `identity` and drop cached answers.
    pub async fn forget_identity(&self, identity: Identity) -> Result<u64, ResolveError> {
        let removed = self
            .with_retry("delete_by_identity", || self.index.delete_by_identity(identity))
            .await?;
        Ok(removed)
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, RepoError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RepoError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Err(err) if err.is_transient() && attempt < self.config.transient_retries => {
                    attempt += 1;
                    warn!(
                        target = SOURCE,
                        op,
                        attempt,
                        error = %err,
                        "transient store error, retrying"
                    );
                }
                other => return other,
            }
        }
    }

    async fn observe(&self, key: &LookupKey, tier: Tier, duration: Duration, outcome: Outcome) {
        let verdict = self.watchdog.observe(Observation {
            key: key.as_str().to_string(),
            tier,
            duration,
            outcome,
        });

        if !verdict.slow {
            return;
        }
        let Some(log) = self.slow_log.as_ref() else {
            return;
        };

        let entry = SampleEntry::new(
            "slow_query",
            key.as_str(),
            json!({
                "tier": tier.as_str(),
                "duration_ms": duration.as_millis() as u64,
                "outcome": outcome.as_str(),
            }),
        );
        if let Err(err) = log.append(&entry).await {
            warn!(
                target = SOURCE,
                key = %key,
                error = %err,
                "failed to append slow query sample"
            );
        }
    }
}

fn resolved(key: LookupKey, identity: Option<Identity>, tier: Tier) -> Resolution {
    Resolution {
        key,
        identity,
        tier,
    }
}
