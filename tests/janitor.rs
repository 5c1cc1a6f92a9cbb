mod common;

use std::sync::Arc;
use std::time::Duration;

use offsite::application::repos::OffloadRepo;
use offsite::application::watchdog::{Observation, Outcome};
use offsite::cache::CachedIdentity;
use offsite::domain::keys::LookupKey;
use offsite::domain::types::Tier;
use offsite::infra::sample_log::SampleEntry;
use serde_json::json;
use time::OffsetDateTime;

use common::{RecordingStorage, harness, harness_with};

fn failed(key: &str) -> Observation {
    Observation {
        key: key.to_string(),
        tier: Tier::Index,
        duration: Duration::from_millis(2),
        outcome: Outcome::Failed,
    }
}

#[tokio::test]
async fn corrupted_log_does_not_stop_the_rest_of_the_sweep() {
    let h = harness(Arc::new(RecordingStorage::new()));
    let now = OffsetDateTime::now_utc();

    let slow_log = h.ctx.slow_log.path().to_path_buf();
    std::fs::create_dir_all(slow_log.parent().expect("log dir")).expect("create log dir");
    std::fs::write(&slow_log, "{not json}\n").expect("write corrupt log");

    h.ctx
        .watchdog
        .observe_at(failed("old"), now - Duration::from_secs(8 * 24 * 3600));
    h.ctx.watchdog.observe_at(failed("recent"), now);

    let stats = h.ctx.janitor.run_sweep().await;

    assert_eq!(stats.errors.len(), 1, "{:?}", stats.errors);
    assert_eq!(stats.errors[0].task, "trim_log:slow-queries.jsonl");
    assert_eq!(stats.cleaned_watchlist, 1);
    assert!(h.ctx.watchdog.get("old").is_none());
    assert!(h.ctx.watchdog.get("recent").is_some());

    let untouched = std::fs::read_to_string(&slow_log).expect("read log");
    assert_eq!(untouched, "{not json}\n");
}

#[tokio::test]
async fn sample_logs_are_trimmed_to_the_newest_entries() {
    let h = harness_with(Arc::new(RecordingStorage::new()), |settings| {
        settings.janitor.log_keep = std::num::NonZeroUsize::new(2).expect("non-zero");
    });
    for i in 0..5 {
        h.ctx
            .failure_log
            .append(&SampleEntry::new("offload_failure", format!("k{i}"), json!({})))
            .await
            .expect("append");
    }

    let stats = h.ctx.janitor.run_trim().await;
    assert_eq!(stats.trimmed_logs, 3);
    assert!(stats.errors.is_empty());

    let kept = h.ctx.failure_log.read_all().await.expect("read");
    let keys: Vec<_> = kept.iter().map(|entry| entry.key.as_str()).collect();
    assert_eq!(keys, ["k3", "k4"]);
}

#[tokio::test]
async fn sweep_drops_expired_cache_entries() {
    let h = harness(Arc::new(RecordingStorage::new()));
    let key = LookupKey::parse("short/lived.png").expect("key");
    h.ctx
        .cache
        .put(key.clone(), CachedIdentity::Found(1), Some(Duration::ZERO));
    h.ctx
        .cache
        .put_found(LookupKey::parse("long/lived.png").expect("key"), 2);
    tokio::time::sleep(Duration::from_millis(5)).await;

    let stats = h.ctx.janitor.run_sweep().await;
    assert_eq!(stats.cleaned_cache, 1);
    assert_eq!(h.ctx.cache.len(), 1);
    assert!(h.ctx.cache.get(&key).is_none());
}

#[tokio::test]
async fn sweep_purges_old_terminal_tasks_only() {
    let h = harness(Arc::new(RecordingStorage::new()));
    let old_path = h.write_upload("old.bin", b"x");
    let live_path = h.write_upload("live.bin", b"x");

    let old = h.ctx.queue.enqueue_local(1, &old_path, None).await.expect("enqueue");
    h.ctx.queue.cancel(1).await.expect("cancel");
    h.repos.backdate_task(old, time::Duration::days(31));

    let live = h.ctx.queue.enqueue_local(2, &live_path, None).await.expect("enqueue");
    h.repos.backdate_task(live, time::Duration::days(31));

    let stats = h.ctx.janitor.run_sweep().await;
    assert_eq!(stats.purged_tasks, 1);
    assert!(h.repos.task(old).is_none());
    assert!(h.repos.latest_task(2).await.expect("latest").is_some());
}
