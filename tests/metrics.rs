mod common;

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use metrics_util::debugging::DebuggingRecorder;
use offsite::application::watchdog::{Observation, Outcome};
use offsite::domain::types::{Tier, UploadErrorKind};

use common::{FailingStorage, RecordingStorage, harness_with, non_zero};

#[tokio::test]
async fn resolution_and_offload_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    // Resolver, cache and watchdog
    let h = harness_with(Arc::new(RecordingStorage::new()), |settings| {
        settings.cache.capacity = NonZeroUsize::new(1).expect("non-zero");
        settings.watchdog.capacity = NonZeroUsize::new(1).expect("non-zero");
        settings.watchdog.slow_threshold = Duration::ZERO;
        settings.offload.deletion_grace = Duration::ZERO;
    });
    h.repos.seed_catalog("one.png", 1);
    h.repos.seed_catalog("two.png", 2);
    for key in ["one.png", "one.png", "two.png"] {
        h.ctx.resolver.resolve(key).await.expect("resolve");
    }
    for key in ["bad/1", "bad/2"] {
        h.ctx.watchdog.observe(Observation {
            key: key.to_string(),
            tier: Tier::Index,
            duration: Duration::from_millis(1),
            outcome: Outcome::Failed,
        });
    }

    // Offload success, deferral and deletion
    let path = h.write_upload("ok.bin", b"ok");
    h.ctx.queue.enqueue_local(1, &path, None).await.expect("enqueue");
    h.ctx.queue.tick(10).await;
    h.ctx.queue.tick(10).await;

    let deferring = harness_with(
        Arc::new(RecordingStorage::slow(Duration::from_millis(5))),
        |settings| settings.offload.max_concurrency = non_zero(1),
    );
    for identity in 0..2 {
        let path = deferring.write_upload(&format!("{identity}.bin"), b"x");
        deferring
            .ctx
            .queue
            .enqueue_local(identity, &path, None)
            .await
            .expect("enqueue");
    }
    deferring.ctx.queue.tick(10).await;

    // Offload retry and abandonment
    let failing = harness_with(
        Arc::new(FailingStorage::new(UploadErrorKind::Transient)),
        |settings| settings.offload.max_attempts = non_zero(2),
    );
    let path = failing.write_upload("flaky.bin", b"x");
    failing
        .ctx
        .queue
        .enqueue_local(5, &path, None)
        .await
        .expect("enqueue");
    failing.ctx.queue.tick(10).await;
    failing.ctx.queue.tick(10).await;

    // Janitor with one failing sub-task
    let corrupt = h.ctx.slow_log.path().to_path_buf();
    std::fs::create_dir_all(corrupt.parent().expect("log dir")).expect("create log dir");
    std::fs::write(&corrupt, "garbage\n").expect("write corrupt log");
    let stats = h.ctx.janitor.run_sweep().await;
    assert_eq!(stats.errors.len(), 1);

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "offsite_cache_hit_total",
        "offsite_cache_miss_total",
        "offsite_cache_evict_total",
        "offsite_resolve_total",
        "offsite_resolve_ms",
        "offsite_watchdog_slow_total",
        "offsite_watchdog_evict_total",
        "offsite_offload_enqueued_total",
        "offsite_offload_uploaded_total",
        "offsite_offload_deferred_total",
        "offsite_offload_retried_total",
        "offsite_offload_abandoned_total",
        "offsite_offload_local_deleted_total",
        "offsite_offload_upload_ms",
        "offsite_offload_tick_ms",
        "offsite_janitor_sweep_ms",
        "offsite_janitor_errors_total",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
