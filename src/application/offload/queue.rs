use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use metrics::{counter, histogram};
use serde::Serialize;
use serde_json::json;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::error::OffloadError;
use crate::application::lookup::LookupIndex;
use crate::application::repos::{
    CancelOutcome, CompleteTaskParams, EnqueueOutcome, FailTaskParams, NewOffloadTask,
    OffloadRepo, TaskCounts,
};
use crate::application::storage::{ObjectStorageClient, StorageError};
use crate::domain::entities::{Identity, OffloadPayload, OffloadTaskRecord};
use crate::domain::keys::LookupKey;
use crate::domain::types::{LocalState, TaskState, UploadErrorKind};
use crate::infra::sample_log::{SampleEntry, SampleLog};
use crate::infra::uploads::LocalStore;

use super::policy::{BackoffSchedule, RetryDecision, decide, upload_timeout};
use super::slots::{InFlightGuard, InFlightUploads, SlotGuard, UploadSlots};

pub(super) const SOURCE: &str = "application::offload";

const METRIC_ENQUEUED: &str = "offsite_offload_enqueued_total";
const METRIC_UPLOADED: &str = "offsite_offload_uploaded_total";
const METRIC_RETRIED: &str = "offsite_offload_retried_total";
const METRIC_ABANDONED: &str = "offsite_offload_abandoned_total";
const METRIC_DEFERRED: &str = "offsite_offload_deferred_total";
const METRIC_UPLOAD_MS: &str = "offsite_offload_upload_ms";
const METRIC_TICK_MS: &str = "offsite_offload_tick_ms";

#[derive(Debug, Clone)]
pub struct OffloadConfig {
    pub max_concurrency: usize,
    pub max_attempts: u32,
    pub backoff: BackoffSchedule,
    /// Delete the local copy once the upload is done and the consumer let go of it.
    pub remove_local_copy: bool,
    /// How long a completed upload waits for the processing signal before deleting anyway.
    pub deletion_grace: Duration,
    /// Uploading tasks untouched for this long are assumed orphaned and retried.
    pub stale_upload_after: Duration,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            max_attempts: 3,
            backoff: BackoffSchedule::default(),
            remove_local_copy: true,
            deletion_grace: Duration::from_secs(10 * 60),
            stale_upload_after: Duration::from_secs(15 * 60),
        }
    }
}

impl From<&crate::config::OffloadSettings> for OffloadConfig {
    fn from(settings: &crate::config::OffloadSettings) -> Self {
        Self {
            max_concurrency: settings.max_concurrency.get() as usize,
            max_attempts: settings.max_attempts.get(),
            backoff: BackoffSchedule::new(settings.backoff.clone()),
            remove_local_copy: settings.remove_local_copy,
            deletion_grace: settings.deletion_grace,
            stale_upload_after: settings.stale_upload_after,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AbandonedTask {
    pub task_id: Uuid,
    pub identity: Identity,
    pub error_kind: Option<UploadErrorKind>,
    pub reason: String,
}

/// Aggregate result of one tick. Per-task failures never escape as errors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickStats {
    /// Due tasks fetched for this tick.
    pub selected: usize,
    pub uploaded: usize,
    pub retried: usize,
    pub abandoned: Vec<AbandonedTask>,
    /// Left pending because every upload slot was busy.
    pub deferred: usize,
    /// Claimed elsewhere or already in flight in this process.
    pub skipped: usize,
    pub cancelled: usize,
    pub local_deleted: usize,
    pub stale_reset: u64,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingOutcome {
    /// The local copy was removed right away.
    Deleted,
    /// The upload has not completed yet; deletion follows completion.
    Remembered,
    NothingToDo,
}

enum TaskOutcome {
    Uploaded { local_deleted: bool },
    Retried,
    Abandoned(AbandonedTask),
    Cancelled,
    Skipped,
    Failed(String),
}

/// Durable upload queue with bounded concurrency, retries and deferred local deletion.
pub struct OffloadQueue {
    pub(super) config: OffloadConfig,
    pub(super) repo: Arc<dyn OffloadRepo>,
    pub(super) index: Arc<LookupIndex>,
    pub(super) storage: Arc<dyn ObjectStorageClient>,
    pub(super) local: Arc<LocalStore>,
    failure_log: Option<Arc<SampleLog>>,
    slots: UploadSlots,
    in_flight: InFlightUploads,
}

impl OffloadQueue {
    pub fn new(
        config: OffloadConfig,
        repo: Arc<dyn OffloadRepo>,
        index: Arc<LookupIndex>,
        storage: Arc<dyn ObjectStorageClient>,
        local: Arc<LocalStore>,
    ) -> Self {
        let slots = UploadSlots::new(config.max_concurrency.max(1));
        Self {
            config,
            repo,
            index,
            storage,
            local,
            failure_log: None,
            slots,
            in_flight: InFlightUploads::new(),
        }
    }

    pub fn with_failure_log(mut self, log: Arc<SampleLog>) -> Self {
        self.failure_log = Some(log);
        self
    }

    pub fn active_uploads(&self) -> usize {
        self.slots.in_use()
    }

    /// Queue `payload` for upload. While a live task exists for the identity its id is
    /// returned instead of creating another.
    pub async fn enqueue(
        &self,
        identity: Identity,
        payload: OffloadPayload,
    ) -> Result<Uuid, OffloadError> {
        if payload.remote_name.trim().is_empty() {
            return Err(OffloadError::invalid_payload("remote name must not be empty"));
        }
        self.local
            .absolute_path(&payload.local_path)
            .map_err(|err| OffloadError::invalid_payload(err.to_string()))?;

        let max_attempts = i32::try_from(self.config.max_attempts).unwrap_or(i32::MAX);
        let outcome = self
            .repo
            .insert_task_if_absent(NewOffloadTask {
                identity,
                payload,
                max_attempts,
                next_attempt_at: OffsetDateTime::now_utc() + self.config.backoff.delay_for(0),
            })
            .await?;

        match outcome {
            EnqueueOutcome::Created(id) => {
                counter!(METRIC_ENQUEUED).increment(1);
                info!(target = SOURCE, task_id = %id, identity, "offload task queued");
            }
            EnqueueOutcome::Coalesced(id) => {
                debug!(
                    target = SOURCE,
                    task_id = %id,
                    identity,
                    "offload already queued for identity"
                );
            }
        }
        Ok(outcome.task_id())
    }

    /// Queue a file from the uploads directory, reading its size from disk.
    pub async fn enqueue_local(
        &self,
        identity: Identity,
        local_path: &str,
        remote_name: Option<&str>,
    ) -> Result<Uuid, OffloadError> {
        let size_bytes = self
            .local
            .size(local_path)
            .await
            .map_err(|err| OffloadError::Local(err.into()))?;
        let payload = OffloadPayload {
            local_path: local_path.to_string(),
            remote_name: remote_name.unwrap_or(local_path).to_string(),
            size_bytes,
        };
        self.enqueue(identity, payload).await
    }

    pub async fn cancel(&self, identity: Identity) -> Result<CancelOutcome, OffloadError> {
        let outcome = self.repo.request_cancel(identity).await?;
        info!(target = SOURCE, identity, outcome = ?outcome, "offload cancellation processed");
        Ok(outcome)
    }

    /// Consumer signal that derivative processing of `identity` is finished.
    pub async fn processing_complete(
        &self,
        identity: Identity,
    ) -> Result<ProcessingOutcome, OffloadError> {
        let now = OffsetDateTime::now_utc();
        let Some(record) = self.repo.record_processing_signal(identity, now).await? else {
            return Ok(ProcessingOutcome::NothingToDo);
        };

        if record.state == TaskState::Completed && record.local_state == LocalState::PendingDeletion
        {
            self.delete_local_copy(&record).await?;
            return Ok(ProcessingOutcome::Deleted);
        }
        if record.state.is_terminal() {
            return Ok(ProcessingOutcome::NothingToDo);
        }

        debug!(
            target = SOURCE,
            identity,
            task_id = %record.id,
            "processing signal remembered until upload completes"
        );
        Ok(ProcessingOutcome::Remembered)
    }

    pub async fn remote_url(&self, identity: Identity) -> Result<Option<String>, OffloadError> {
        Ok(self
            .repo
            .find_remote_object(identity)
            .await?
            .map(|object| object.remote_url))
    }

    pub async fn task_for(
        &self,
        identity: Identity,
    ) -> Result<Option<OffloadTaskRecord>, OffloadError> {
        Ok(self.repo.latest_task(identity).await?)
    }

    pub async fn tasks_in_state(
        &self,
        state: TaskState,
        limit: u32,
    ) -> Result<Vec<OffloadTaskRecord>, OffloadError> {
        Ok(self.repo.list_tasks_by_state(state, limit).await?)
    }

    pub async fn counts(&self) -> Result<TaskCounts, OffloadError> {
        Ok(self.repo.count_tasks().await?)
    }

    /// Run one scheduling pass over due tasks, uploading up to the concurrency cap.
    pub async fn tick(&self, max_batch: u32) -> TickStats {
        let started = Instant::now();
        let now = OffsetDateTime::now_utc();
        let mut stats = TickStats::default();

        match self
            .repo
            .reset_stale_uploads(now - self.config.stale_upload_after)
            .await
        {
            Ok(0) => {}
            Ok(reset) => {
                warn!(target = SOURCE, reset, "stale uploads returned to pending");
                stats.stale_reset = reset;
            }
            Err(err) => {
                error!(target = SOURCE, error = %err, "failed to reset stale uploads");
                stats.errors.push(format!("reset_stale_uploads: {err}"));
            }
        }

        match self.repo.due_tasks(now, max_batch.max(1)).await {
            Ok(tasks) => {
                stats.selected = tasks.len();
                let mut work = Vec::with_capacity(tasks.len());
                for task in tasks {
                    let Some(slot) = self.slots.try_acquire() else {
                        stats.deferred += 1;
                        counter!(METRIC_DEFERRED).increment(1);
                        continue;
                    };
                    let guard = match self.in_flight.acquire(task.identity) {
                        Ok(guard) => guard,
                        Err(err) => {
                            debug!(target = SOURCE, task_id = %task.id, error = %err, "task skipped");
                            stats.skipped += 1;
                            continue;
                        }
                    };
                    work.push(self.process_task(task, slot, guard));
                }

                for outcome in join_all(work).await {
                    match outcome {
                        TaskOutcome::Uploaded { local_deleted } => {
                            stats.uploaded += 1;
                            if local_deleted {
                                stats.local_deleted += 1;
                            }
                        }
                        TaskOutcome::Retried => stats.retried += 1,
                        TaskOutcome::Abandoned(task) => stats.abandoned.push(task),
                        TaskOutcome::Cancelled => stats.cancelled += 1,
                        TaskOutcome::Skipped => stats.skipped += 1,
                        TaskOutcome::Failed(message) => stats.errors.push(message),
                    }
                }
            }
            Err(err) => {
                error!(target = SOURCE, error = %err, "failed to select due offload tasks");
                stats.errors.push(format!("due_tasks: {err}"));
            }
        }

        match self.run_due_deletions(now).await {
            Ok(deleted) => stats.local_deleted += deleted,
            Err(err) => {
                error!(target = SOURCE, error = %err, "deferred deletion pass failed");
                stats.errors.push(format!("deferred_deletion: {err}"));
            }
        }

        histogram!(METRIC_TICK_MS).record(started.elapsed().as_secs_f64() * 1000.0);
        if stats.selected > 0 || stats.local_deleted > 0 || !stats.errors.is_empty() {
            info!(
                target = SOURCE,
                selected = stats.selected,
                uploaded = stats.uploaded,
                retried = stats.retried,
                abandoned = stats.abandoned.len(),
                deferred = stats.deferred,
                local_deleted = stats.local_deleted,
                errors = stats.errors.len(),
                "offload tick finished"
            );
        }
        stats
    }

    async fn process_task(
        &self,
        task: OffloadTaskRecord,
        _slot: SlotGuard,
        _in_flight: InFlightGuard,
    ) -> TaskOutcome {
        let claimed = match self.repo.claim_task(task.id).await {
            Ok(Some(claimed)) => claimed,
            Ok(None) => return TaskOutcome::Skipped,
            Err(err) => {
                error!(target = SOURCE, task_id = %task.id, error = %err, "failed to claim task");
                return TaskOutcome::Failed(format!("claim {}: {err}", task.id));
            }
        };

        let timeout = upload_timeout(claimed.payload.size_bytes);
        let started = Instant::now();
        let result = self.upload(&claimed, timeout).await;
        histogram!(METRIC_UPLOAD_MS).record(started.elapsed().as_secs_f64() * 1000.0);

        match result {
            Ok(remote_url) => self.complete(claimed, remote_url).await,
            Err(err) => self.fail(claimed, err).await,
        }
    }

    async fn upload(
        &self,
        task: &OffloadTaskRecord,
        timeout: Duration,
    ) -> Result<String, StorageError> {
        let path = self
            .local
            .absolute_path(&task.payload.local_path)
            .map_err(|err| StorageError::fatal(err.to_string()))?;

        debug!(
            target = SOURCE,
            task_id = %task.id,
            identity = task.identity,
            timeout_secs = timeout.as_secs(),
            "uploading"
        );
        match tokio::time::timeout(
            timeout,
            self.storage
                .upload(&path, &task.payload.remote_name, timeout),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(StorageError::timeout(timeout)),
        }
    }

    async fn complete(&self, task: OffloadTaskRecord, remote_url: String) -> TaskOutcome {
        let params = CompleteTaskParams {
            id: task.id,
            remote_url: remote_url.clone(),
            remove_local_copy: self.config.remove_local_copy,
            completed_at: OffsetDateTime::now_utc(),
        };

        let record = match self.repo.complete_task(params).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                info!(
                    target = SOURCE,
                    task_id = %task.id,
                    identity = task.identity,
                    "upload finished after cancellation; result discarded"
                );
                return TaskOutcome::Cancelled;
            }
            Err(err) => {
                error!(
                    target = SOURCE,
                    task_id = %task.id,
                    error = %err,
                    "failed to record completed upload"
                );
                return TaskOutcome::Failed(format!("complete {}: {err}", task.id));
            }
        };

        counter!(METRIC_UPLOADED).increment(1);
        info!(
            target = SOURCE,
            task_id = %record.id,
            identity = record.identity,
            remote_url = %remote_url,
            "offload completed"
        );

        match LookupKey::parse(&remote_url) {
            Ok(key) => {
                if let Err(err) = self.index.upsert(&key, record.identity).await {
                    warn!(
                        target = SOURCE,
                        identity = record.identity,
                        error = %err,
                        "failed to index remote url"
                    );
                }
            }
            Err(err) => warn!(
                target = SOURCE,
                remote_url = %remote_url,
                error = %err,
                "remote url cannot be indexed"
            ),
        }

        let signalled = record.local_state == LocalState::PendingDeletion
            && record.processing_signalled_at.is_some();
        let local_deleted = if signalled {
            match self.delete_local_copy(&record).await {
                Ok(()) => true,
                Err(err) => {
                    warn!(
                        target = SOURCE,
                        identity = record.identity,
                        local_path = %record.payload.local_path,
                        error = %err,
                        "failed to delete signalled local copy; next tick retries"
                    );
                    false
                }
            }
        } else {
            false
        };
        TaskOutcome::Uploaded { local_deleted }
    }

    async fn fail(&self, task: OffloadTaskRecord, err: StorageError) -> TaskOutcome {
        let attempt_count = task.attempt_count.saturating_add(1);
        let kind = err.kind();
        let decision = decide(
            kind,
            u32::try_from(attempt_count).unwrap_or(0),
            u32::try_from(task.max_attempts).unwrap_or(0),
            &self.config.backoff,
        );
        let now = OffsetDateTime::now_utc();
        let (state, next_attempt_at) = match decision {
            RetryDecision::Retry { delay } => (TaskState::Pending, now + delay),
            RetryDecision::Abandon => (TaskState::Abandoned, now),
        };

        self.record_failure_sample(&task, &err, attempt_count, decision)
            .await;

        let params = FailTaskParams {
            id: task.id,
            state,
            attempt_count,
            next_attempt_at,
            last_error: err.to_string(),
            last_error_kind: Some(kind),
        };
        let record = match self.repo.fail_task(params).await {
            Ok(record) => record,
            Err(repo_err) => {
                error!(
                    target = SOURCE,
                    task_id = %task.id,
                    error = %repo_err,
                    "failed to record upload failure"
                );
                return TaskOutcome::Failed(format!("fail {}: {repo_err}", task.id));
            }
        };

        match record.state {
            TaskState::Abandoned if record.cancel_requested => TaskOutcome::Cancelled,
            TaskState::Abandoned => {
                counter!(METRIC_ABANDONED, "kind" => kind.as_str()).increment(1);
                error!(
                    target = SOURCE,
                    task_id = %record.id,
                    identity = record.identity,
                    attempts = record.attempt_count,
                    error_kind = kind.as_str(),
                    error = %err,
                    "offload abandoned"
                );
                TaskOutcome::Abandoned(AbandonedTask {
                    task_id: record.id,
                    identity: record.identity,
                    error_kind: Some(kind),
                    reason: err.to_string(),
                })
            }
            _ => {
                counter!(METRIC_RETRIED).increment(1);
                warn!(
                    target = SOURCE,
                    task_id = %record.id,
                    identity = record.identity,
                    attempts = record.attempt_count,
                    error_kind = kind.as_str(),
                    error = %err,
                    "offload attempt failed, retry scheduled"
                );
                TaskOutcome::Retried
            }
        }
    }

    async fn record_failure_sample(
        &self,
        task: &OffloadTaskRecord,
        err: &StorageError,
        attempt_count: i32,
        decision: RetryDecision,
    ) {
        let Some(log) = self.failure_log.as_ref() else {
            return;
        };

        let (decision_name, retry_in_secs) = match decision {
            RetryDecision::Retry { delay } => ("retry", Some(delay.as_secs())),
            RetryDecision::Abandon => ("abandon", None),
        };
        let entry = SampleEntry::new(
            "offload_failure",
            task.payload.remote_name.as_str(),
            json!({
                "task_id": task.id,
                "identity": task.identity,
                "attempt": attempt_count,
                "error_kind": err.kind().as_str(),
                "message": err.message(),
                "decision": decision_name,
                "retry_in_secs": retry_in_secs,
            }),
        );
        if let Err(log_err) = log.append(&entry).await {
            warn!(
                target = SOURCE,
                task_id = %task.id,
                error = %log_err,
                "failed to append offload failure sample"
            );
        }
    }
}
