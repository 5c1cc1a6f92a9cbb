use offsite::application::repos::{
    CancelOutcome, CatalogRepo, CompleteTaskParams, EnqueueOutcome, LookupRepo, NewOffloadTask,
    OffloadRepo,
};
use offsite::domain::entities::OffloadPayload;
use offsite::domain::keys::KeyHash;
use offsite::domain::types::{LocalState, TaskState};
use offsite::infra::db::PostgresRepositories;
use sqlx::PgPool;
use time::OffsetDateTime;

fn new_task(identity: i64, name: &str) -> NewOffloadTask {
    NewOffloadTask {
        identity,
        payload: OffloadPayload {
            local_path: name.to_string(),
            remote_name: name.to_string(),
            size_bytes: 10,
        },
        max_attempts: 3,
        next_attempt_at: OffsetDateTime::now_utc() - time::Duration::seconds(1),
    }
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL pointing at a disposable Postgres"]
async fn upsert_updates_in_place(pool: PgPool) {
    let repos = PostgresRepositories::new(pool.clone());
    let hash = KeyHash::of("uploads/a.jpg");

    repos.upsert_entry(&hash, "uploads/a.jpg", 1).await.expect("insert");
    repos.upsert_entry(&hash, "uploads/a.jpg", 2).await.expect("update");

    assert_eq!(repos.find_identity(&hash).await.expect("find"), Some(2));
    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM lookup_entries")
        .fetch_one(&pool)
        .await
        .expect("count");
    assert_eq!(rows, 1);

    let other = KeyHash::of("uploads/b.jpg");
    repos.upsert_entry(&other, "uploads/b.jpg", 2).await.expect("insert");
    let found = repos
        .find_identities(&[hash.clone(), other.clone(), KeyHash::of("absent")])
        .await
        .expect("batch");
    assert_eq!(found.len(), 2);

    let scanned = repos.scan_prefix("uploads/", 10).await.expect("scan");
    assert_eq!(scanned.len(), 2);

    assert_eq!(repos.delete_by_identity(2).await.expect("delete"), 2);
    assert_eq!(repos.find_identity(&hash).await.expect("find"), None);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL pointing at a disposable Postgres"]
async fn repair_hashes_legacy_rows_and_drops_collisions(pool: PgPool) {
    let repos = PostgresRepositories::new(pool.clone());
    let hash = KeyHash::of("legacy/photo.jpg");
    repos
        .upsert_entry(&hash, "legacy/photo.jpg", 10)
        .await
        .expect("insert");
    sqlx::query(
        "INSERT INTO lookup_entries (key_hash, key_prefix, identity) VALUES (NULL, $1, $2), (NULL, $3, $4)",
    )
    .bind("/Legacy/Photo.JPG")
    .bind(11_i64)
    .bind("legacy/other.jpg")
    .bind(12_i64)
    .execute(&pool)
    .await
    .expect("seed legacy rows");

    let report = repos.repair_uniqueness().await.expect("repair");
    assert_eq!(report.hashed, 1);
    assert_eq!(report.duplicates_removed, 1);
    assert!(!report.constraint_installed);

    assert_eq!(repos.find_identity(&hash).await.expect("find"), Some(10));
    assert_eq!(
        repos
            .find_identity(&KeyHash::of("legacy/other.jpg"))
            .await
            .expect("find"),
        Some(12)
    );
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL pointing at a disposable Postgres"]
async fn repair_keeps_an_older_legacy_row_over_a_newer_hashed_one(pool: PgPool) {
    let repos = PostgresRepositories::new(pool.clone());
    sqlx::query("INSERT INTO lookup_entries (key_hash, key_prefix, identity) VALUES (NULL, $1, $2)")
        .bind("/Legacy/Photo.JPG")
        .bind(11_i64)
        .execute(&pool)
        .await
        .expect("seed legacy row");
    let hash = KeyHash::of("legacy/photo.jpg");
    repos
        .upsert_entry(&hash, "legacy/photo.jpg", 10)
        .await
        .expect("insert");

    let report = repos.repair_uniqueness().await.expect("repair");
    assert_eq!(report.hashed, 1);
    assert_eq!(report.duplicates_removed, 1);

    let rows: Vec<(i64, i64)> = sqlx::query_as("SELECT id, identity FROM lookup_entries ORDER BY id")
        .fetch_all(&pool)
        .await
        .expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(repos.find_identity(&hash).await.expect("find"), Some(11));
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL pointing at a disposable Postgres"]
async fn catalog_matches_normalized_paths(pool: PgPool) {
    let repos = PostgresRepositories::new(pool.clone());
    sqlx::query("INSERT INTO catalog_resources (identity, path) VALUES ($1, $2)")
        .bind(7_i64)
        .bind("/Uploads/2024/A.jpg")
        .execute(&pool)
        .await
        .expect("seed catalog");

    let matches = repos
        .find_by_paths(&["uploads/2024/a.jpg".to_string(), "missing".to_string()])
        .await
        .expect("find");
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].identity, 7);
    assert_eq!(matches[0].path, "uploads/2024/a.jpg");
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL pointing at a disposable Postgres"]
async fn live_tasks_coalesce_and_claims_are_exclusive(pool: PgPool) {
    let repos = PostgresRepositories::new(pool);

    let first = repos
        .insert_task_if_absent(new_task(1, "a.bin"))
        .await
        .expect("insert");
    let second = repos
        .insert_task_if_absent(new_task(1, "a.bin"))
        .await
        .expect("insert again");
    assert!(matches!(first, EnqueueOutcome::Created(_)));
    assert!(matches!(second, EnqueueOutcome::Coalesced(id) if id == first.task_id()));

    let due = repos
        .due_tasks(OffsetDateTime::now_utc(), 10)
        .await
        .expect("due");
    assert_eq!(due.len(), 1);

    let claimed = repos.claim_task(first.task_id()).await.expect("claim");
    assert_eq!(claimed.map(|task| task.state), Some(TaskState::Uploading));
    assert!(repos.claim_task(first.task_id()).await.expect("reclaim").is_none());

    let completed = repos
        .complete_task(CompleteTaskParams {
            id: first.task_id(),
            remote_url: "https://cdn.example.com/a.bin".to_string(),
            remove_local_copy: true,
            completed_at: OffsetDateTime::now_utc(),
        })
        .await
        .expect("complete")
        .expect("not cancelled");
    assert_eq!(completed.state, TaskState::Completed);
    assert_eq!(completed.local_state, LocalState::PendingDeletion);
    assert_eq!(
        repos
            .find_remote_object(1)
            .await
            .expect("remote")
            .map(|object| object.remote_url),
        Some("https://cdn.example.com/a.bin".to_string())
    );

    let counts = repos.count_tasks().await.expect("counts");
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.pending_deletion, 1);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL pointing at a disposable Postgres"]
async fn cancelled_upload_result_is_discarded(pool: PgPool) {
    let repos = PostgresRepositories::new(pool);
    let id = repos
        .insert_task_if_absent(new_task(2, "b.bin"))
        .await
        .expect("insert")
        .task_id();
    repos.claim_task(id).await.expect("claim").expect("claimed");

    assert_eq!(
        repos.request_cancel(2).await.expect("cancel"),
        CancelOutcome::Requested(id)
    );
    let result = repos
        .complete_task(CompleteTaskParams {
            id,
            remote_url: "https://cdn.example.com/b.bin".to_string(),
            remove_local_copy: true,
            completed_at: OffsetDateTime::now_utc(),
        })
        .await
        .expect("complete");
    assert!(result.is_none());

    let task = repos.latest_task(2).await.expect("latest").expect("task");
    assert_eq!(task.state, TaskState::Abandoned);
    assert_eq!(task.last_error.as_deref(), Some("cancelled"));
    assert!(repos.find_remote_object(2).await.expect("remote").is_none());
}
