//! Observes every tier call and quarantines keys that keep failing or running slow.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use metrics::counter;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::cache::lock::mutex_lock;
use crate::domain::entities::FailureRecord;
use crate::domain::types::Tier;

const SOURCE: &str = "application::watchdog";

const METRIC_SLOW: &str = "offsite_watchdog_slow_total";
const METRIC_EVICT: &str = "offsite_watchdog_evict_total";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Hit,
    Miss,
    Failed,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Hit => "hit",
            Outcome::Miss => "miss",
            Outcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Observation {
    pub key: String,
    pub tier: Tier,
    pub duration: Duration,
    pub outcome: Outcome,
}

/// How the watchdog judged an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub slow: bool,
    pub failure: bool,
}

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub slow_threshold: Duration,
    pub capacity: usize,
    pub sample_capacity: usize,
    pub quarantine_threshold: u32,
    pub quarantine_window: Duration,
    pub retention: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            slow_threshold: Duration::from_millis(250),
            capacity: 1_000,
            sample_capacity: 100,
            quarantine_threshold: 3,
            quarantine_window: Duration::from_secs(60 * 60),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl From<&crate::config::WatchdogSettings> for WatchdogConfig {
    fn from(settings: &crate::config::WatchdogSettings) -> Self {
        Self {
            slow_threshold: settings.slow_threshold,
            capacity: settings.capacity.get(),
            sample_capacity: settings.sample_capacity.get(),
            quarantine_threshold: settings.quarantine_threshold.get(),
            quarantine_window: settings.quarantine_window,
            retention: settings.retention,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlowSample {
    pub key: String,
    pub tier: Tier,
    pub duration_ms: u64,
    pub outcome: Outcome,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierCounts {
    pub hits: u64,
    pub misses: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WatchdogStats {
    pub observations: u64,
    pub cache: TierCounts,
    pub index: TierCounts,
    pub fallback: TierCounts,
    pub slow: u64,
    pub watchlist_size: usize,
}

impl WatchdogStats {
    fn tier_mut(&mut self, tier: Tier) -> &mut TierCounts {
        match tier {
            Tier::Cache => &mut self.cache,
            Tier::Index => &mut self.index,
            Tier::Fallback => &mut self.fallback,
        }
    }
}

struct WatchEntry {
    record: FailureRecord,
    seq: u64,
}

#[derive(Default)]
struct WatchState {
    entries: HashMap<String, WatchEntry>,
    /// Eviction order: oldest `last_failure_at` first, then insertion sequence.
    order: BTreeMap<(OffsetDateTime, u64), String>,
    samples: VecDeque<SlowSample>,
    stats: WatchdogStats,
    next_seq: u64,
}

impl WatchState {
    fn record_failure(&mut self, key: &str, at: OffsetDateTime) {
        let seq = self.next_seq;
        self.next_seq += 1;

        match self.entries.get_mut(key) {
            Some(entry) => {
                self.order
                    .remove(&(entry.record.last_failure_at, entry.seq));
                entry.record.failure_count = entry.record.failure_count.saturating_add(1);
                entry.record.last_failure_at = entry.record.last_failure_at.max(at);
                entry.seq = seq;
                self.order
                    .insert((entry.record.last_failure_at, seq), key.to_string());
            }
            None => {
                let record = FailureRecord {
                    key: key.to_string(),
                    failure_count: 1,
                    first_failure_at: at,
                    last_failure_at: at,
                };
                self.order.insert((at, seq), key.to_string());
                self.entries.insert(key.to_string(), WatchEntry { record, seq });
            }
        }
    }

    fn clear(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.order
                    .remove(&(entry.record.last_failure_at, entry.seq));
                true
            }
            None => false,
        }
    }

    fn evict_to(&mut self, capacity: usize) -> usize {
        let mut evicted = 0;
        while self.entries.len() > capacity {
            let Some((_, key)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&key);
            evicted += 1;
        }
        evicted
    }
}

pub struct WatchdogMonitor {
    config: WatchdogConfig,
    state: Mutex<WatchState>,
}

impl WatchdogMonitor {
    pub fn new(config: WatchdogConfig) -> Self {
        Self {
            config,
            state: Mutex::new(WatchState::default()),
        }
    }

    pub fn observe(&self, observation: Observation) -> Verdict {
        self.observe_at(observation, OffsetDateTime::now_utc())
    }

    pub fn observe_at(&self, observation: Observation, now: OffsetDateTime) -> Verdict {
        let slow = observation.duration > self.config.slow_threshold;
        let failure = slow || observation.outcome == Outcome::Failed;

        let mut state = mutex_lock(&self.state, SOURCE, "observe");
        state.stats.observations += 1;
        let counts = state.stats.tier_mut(observation.tier);
        match observation.outcome {
            Outcome::Hit => counts.hits += 1,
            Outcome::Miss => counts.misses += 1,
            Outcome::Failed => counts.failures += 1,
        }

        if slow {
            state.stats.slow += 1;
            if state.samples.len() >= self.config.sample_capacity {
                state.samples.pop_front();
            }
            state.samples.push_back(SlowSample {
                key: observation.key.clone(),
                tier: observation.tier,
                duration_ms: observation.duration.as_millis().min(u64::MAX as u128) as u64,
                outcome: observation.outcome,
                recorded_at: now,
            });
        }

        // A cache miss only defers to the next tier; it is not evidence the key is healthy.
        let neutral = observation.tier == Tier::Cache && observation.outcome == Outcome::Miss;
        let mut evicted = 0;
        if failure {
            state.record_failure(&observation.key, now);
            evicted = state.evict_to(self.config.capacity);
        } else if !neutral {
            state.clear(&observation.key);
        }
        state.stats.watchlist_size = state.entries.len();
        drop(state);

        if slow {
            counter!(METRIC_SLOW, "tier" => observation.tier.as_str()).increment(1);
            debug!(
                target = SOURCE,
                key = %observation.key,
                tier = observation.tier.as_str(),
                duration_ms = observation.duration.as_millis() as u64,
                "slow lookup observed"
            );
        }
        if evicted > 0 {
            counter!(METRIC_EVICT).increment(evicted as u64);
        }

        Verdict { slow, failure }
    }

    /// Whether `key` failed often enough, recently enough, to skip the fast tiers.
    pub fn is_quarantined(&self, key: &str, now: OffsetDateTime) -> bool {
        let state = mutex_lock(&self.state, SOURCE, "is_quarantined");
        state.entries.get(key).is_some_and(|entry| {
            entry.record.failure_count >= self.config.quarantine_threshold
                && now - entry.record.last_failure_at <= self.config.quarantine_window
        })
    }

    /// Drop watchlist records whose last failure is older than `cutoff`.
    pub fn purge_older_than(&self, cutoff: OffsetDateTime) -> usize {
        let mut state = mutex_lock(&self.state, SOURCE, "purge_older_than");
        let stale: Vec<String> = state
            .order
            .range(..(cutoff, 0))
            .map(|(_, key)| key.clone())
            .collect();
        for key in &stale {
            state.clear(key);
        }
        state.stats.watchlist_size = state.entries.len();
        drop(state);

        if !stale.is_empty() {
            info!(
                target = SOURCE,
                removed = stale.len(),
                "expired watchlist records purged"
            );
        }
        stale.len()
    }

    pub fn get(&self, key: &str) -> Option<FailureRecord> {
        let state = mutex_lock(&self.state, SOURCE, "get");
        state.entries.get(key).map(|entry| entry.record.clone())
    }

    pub fn watchlist(&self) -> Vec<FailureRecord> {
        let state = mutex_lock(&self.state, SOURCE, "watchlist");
        state
            .order
            .values()
            .filter_map(|key| state.entries.get(key))
            .map(|entry| entry.record.clone())
            .collect()
    }

    pub fn recent_slow(&self) -> Vec<SlowSample> {
        let state = mutex_lock(&self.state, SOURCE, "recent_slow");
        state.samples.iter().cloned().collect()
    }

    pub fn stats(&self) -> WatchdogStats {
        mutex_lock(&self.state, SOURCE, "stats").stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(key: &str, tier: Tier, millis: u64, outcome: Outcome) -> Observation {
        Observation {
            key: key.to_string(),
            tier,
            duration: Duration::from_millis(millis),
            outcome,
        }
    }

    #[test]
    fn failures_accumulate_and_success_clears() {
        let monitor = WatchdogMonitor::new(WatchdogConfig::default());
        let now = OffsetDateTime::now_utc();

        monitor.observe_at(observation("a", Tier::Index, 5, Outcome::Failed), now);
        let verdict = monitor.observe_at(observation("a", Tier::Index, 400, Outcome::Hit), now);
        assert!(verdict.slow && verdict.failure);
        assert_eq!(monitor.get("a").map(|r| r.failure_count), Some(2));

        let verdict = monitor.observe_at(observation("a", Tier::Index, 3, Outcome::Hit), now);
        assert!(!verdict.failure);
        assert!(monitor.get("a").is_none());
        assert_eq!(monitor.stats().watchlist_size, 0);
    }

    #[test]
    fn cache_misses_leave_failure_records_alone() {
        let monitor = WatchdogMonitor::new(WatchdogConfig::default());
        let now = OffsetDateTime::now_utc();

        monitor.observe_at(observation("k", Tier::Index, 1, Outcome::Failed), now);
        monitor.observe_at(observation("k", Tier::Cache, 1, Outcome::Miss), now);
        assert_eq!(monitor.get("k").map(|r| r.failure_count), Some(1));

        monitor.observe_at(observation("k", Tier::Index, 1, Outcome::Miss), now);
        assert!(monitor.get("k").is_none());
    }

    #[test]
    fn quarantine_needs_threshold_and_recency() {
        let monitor = WatchdogMonitor::new(WatchdogConfig::default());
        let now = OffsetDateTime::now_utc();

        for _ in 0..2 {
            monitor.observe_at(observation("k", Tier::Index, 1, Outcome::Failed), now);
        }
        assert!(!monitor.is_quarantined("k", now));

        monitor.observe_at(observation("k", Tier::Index, 1, Outcome::Failed), now);
        assert!(monitor.is_quarantined("k", now));
        assert!(!monitor.is_quarantined("k", now + Duration::from_secs(3601)));
    }

    #[test]
    fn slow_samples_are_bounded() {
        let monitor = WatchdogMonitor::new(WatchdogConfig {
            sample_capacity: 3,
            ..Default::default()
        });
        for i in 0..5 {
            monitor.observe(observation(&format!("k{i}"), Tier::Fallback, 300, Outcome::Miss));
        }

        let samples = monitor.recent_slow();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].key, "k2");
        assert_eq!(monitor.stats().slow, 5);
        assert_eq!(monitor.stats().fallback.misses, 5);
    }

    #[test]
    fn eviction_breaks_timestamp_ties_by_insertion() {
        let monitor = WatchdogMonitor::new(WatchdogConfig {
            capacity: 2,
            ..Default::default()
        });
        let now = OffsetDateTime::now_utc();
        for key in ["first", "second", "third"] {
            monitor.observe_at(observation(key, Tier::Index, 1, Outcome::Failed), now);
        }

        assert!(monitor.get("first").is_none());
        assert!(monitor.get("second").is_some());
        assert!(monitor.get("third").is_some());
    }

    #[test]
    fn purge_removes_only_expired_records() {
        let monitor = WatchdogMonitor::new(WatchdogConfig::default());
        let now = OffsetDateTime::now_utc();
        let old = now - Duration::from_secs(8 * 24 * 3600);

        monitor.observe_at(observation("old", Tier::Index, 1, Outcome::Failed), old);
        monitor.observe_at(observation("new", Tier::Index, 1, Outcome::Failed), now);

        let removed = monitor.purge_older_than(now - Duration::from_secs(7 * 24 * 3600));
        assert_eq!(removed, 1);
        assert_eq!(monitor.watchlist().len(), 1);
        assert_eq!(monitor.watchlist()[0].key, "new");
    }
}
