mod common;

use std::sync::Arc;
use std::time::Duration;

use offsite::application::watchdog::{Observation, Outcome};
use offsite::domain::keys::LookupKey;
use offsite::domain::types::Tier;
use time::OffsetDateTime;

use common::{RecordingStorage, harness, harness_with, non_zero};

#[tokio::test]
async fn watchlist_keeps_the_most_recent_failures() {
    let h = harness(Arc::new(RecordingStorage::new()));
    let base = OffsetDateTime::now_utc() - Duration::from_secs(3600);

    for i in 0..1200u64 {
        h.ctx.watchdog.observe_at(
            Observation {
                key: format!("failing/{i}"),
                tier: Tier::Index,
                duration: Duration::from_millis(1),
                outcome: Outcome::Failed,
            },
            base + Duration::from_millis(i),
        );
    }

    let watchlist = h.ctx.watchdog.watchlist();
    assert_eq!(watchlist.len(), 1000);
    assert_eq!(h.ctx.watchdog.stats().watchlist_size, 1000);
    assert!(h.ctx.watchdog.get("failing/0").is_none());
    assert!(h.ctx.watchdog.get("failing/199").is_none());
    assert!(h.ctx.watchdog.get("failing/200").is_some());
    assert!(h.ctx.watchdog.get("failing/1199").is_some());
}

#[tokio::test]
async fn repeatedly_failing_key_goes_straight_to_fallback() {
    let h = harness_with(Arc::new(RecordingStorage::new()), |settings| {
        settings.resolver.transient_retries = 0;
        settings.watchdog.quarantine_threshold = non_zero(2);
    });
    h.repos.seed_catalog("q/key.png", 9);
    h.repos.fail_next_lookups(2);

    h.ctx.resolver.resolve("/q/key.png").await.expect_err("first failure");
    h.ctx.resolver.resolve("/q/key.png").await.expect_err("second failure");
    assert_eq!(
        h.ctx.watchdog.get("q/key.png").map(|record| record.failure_count),
        Some(2)
    );

    let resolved = h.ctx.resolver.resolve("/q/key.png").await.expect("fallback");
    assert_eq!(resolved.identity, Some(9));
    assert_eq!(resolved.tier, Tier::Fallback);
    assert_eq!(h.repos.calls().find_identity, 2);

    // The fallback success clears the record, so the key leaves quarantine.
    assert!(h.ctx.watchdog.get("q/key.png").is_none());
    let again = h.ctx.resolver.resolve("/q/key.png").await.expect("cached");
    assert_eq!(again.tier, Tier::Cache);
}

#[tokio::test]
async fn slow_lookups_are_sampled_to_the_slow_log() {
    let h = harness_with(Arc::new(RecordingStorage::new()), |settings| {
        settings.watchdog.slow_threshold = Duration::ZERO;
    });
    h.repos.seed_catalog("slow.png", 3);

    h.ctx.resolver.resolve("slow.png").await.expect("resolve");

    assert!(!h.ctx.watchdog.recent_slow().is_empty());
    let samples = h.ctx.slow_log.read_all().await.expect("slow log");
    assert!(!samples.is_empty());
    assert!(samples.iter().all(|sample| sample.kind == "slow_query"));
    assert!(samples.iter().all(|sample| sample.key == "slow.png"));
}

fn quarantine(h: &common::Harness, raw: &str) {
    for _ in 0..2 {
        h.ctx.watchdog.observe(Observation {
            key: raw.trim_start_matches('/').to_string(),
            tier: Tier::Index,
            duration: Duration::from_millis(1),
            outcome: Outcome::Failed,
        });
    }
    assert!(
        h.ctx
            .watchdog
            .is_quarantined(raw.trim_start_matches('/'), OffsetDateTime::now_utc())
    );
}

#[tokio::test]
async fn quarantined_key_still_sees_a_fresh_index_write() {
    let h = harness_with(Arc::new(RecordingStorage::new()), |settings| {
        settings.resolver.transient_retries = 0;
        settings.watchdog.quarantine_threshold = non_zero(2);
    });
    quarantine(&h, "/k/a.png");

    let key = LookupKey::parse("/k/a.png").expect("key");
    h.ctx.index.upsert(&key, 5).await.expect("upsert");

    let first = h.ctx.resolver.resolve("/k/a.png").await.expect("resolve");
    assert_eq!(first.identity, Some(5));
    let second = h.ctx.resolver.resolve("/k/a.png").await.expect("resolve again");
    assert_eq!(second.identity, Some(5));
    assert_eq!(second.tier, Tier::Cache);
}

#[tokio::test]
async fn quarantined_key_falls_back_to_the_index_when_the_cache_is_cold() {
    let h = harness_with(Arc::new(RecordingStorage::new()), |settings| {
        settings.resolver.transient_retries = 0;
        settings.watchdog.quarantine_threshold = non_zero(2);
    });
    let key = LookupKey::parse("/k/b.png").expect("key");
    h.ctx.index.upsert(&key, 6).await.expect("upsert");
    h.ctx.cache.clear();
    quarantine(&h, "/k/b.png");

    let resolved = h.ctx.resolver.resolve("/k/b.png").await.expect("resolve");
    assert_eq!(resolved.identity, Some(6));
    assert_eq!(resolved.tier, Tier::Index);
    assert_eq!(h.repos.calls().find_by_paths, 1);
}
