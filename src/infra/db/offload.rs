use std::convert::TryFrom;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    application::repos::{
        CancelOutcome, CompleteTaskParams, EnqueueOutcome, FailTaskParams, NewOffloadTask,
        OffloadRepo, RepoError, TaskCounts,
    },
    domain::{
        entities::{Identity, OffloadPayload, OffloadTaskRecord, RemoteObjectRecord},
        types::{LocalState, TaskState, UploadErrorKind},
    },
};

use super::{PostgresRepositories, map_sqlx_error};

const TASK_COLUMNS: &str = "id, identity, local_path, remote_name, size_bytes, state, \
    attempt_count, max_attempts, next_attempt_at, created_at, updated_at, last_error, \
    last_error_kind, remote_url, cancel_requested, local_state, completed_at, \
    processing_signalled_at, local_deleted_at";

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    identity: i64,
    local_path: String,
    remote_name: String,
    size_bytes: i64,
    state: String,
    attempt_count: i32,
    max_attempts: i32,
    next_attempt_at: OffsetDateTime,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    last_error: Option<String>,
    last_error_kind: Option<String>,
    remote_url: Option<String>,
    cancel_requested: bool,
    local_state: String,
    completed_at: Option<OffsetDateTime>,
    processing_signalled_at: Option<OffsetDateTime>,
    local_deleted_at: Option<OffsetDateTime>,
}

impl TryFrom<TaskRow> for OffloadTaskRecord {
    type Error = RepoError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let state = TaskState::try_from(row.state.as_str()).map_err(|_| {
            RepoError::from_persistence(format!("unknown task state `{}`", row.state))
        })?;
        let local_state = LocalState::try_from(row.local_state.as_str()).map_err(|_| {
            RepoError::from_persistence(format!("unknown local state `{}`", row.local_state))
        })?;
        let last_error_kind = row
            .last_error_kind
            .as_deref()
            .map(|kind| {
                UploadErrorKind::try_from(kind).map_err(|_| {
                    RepoError::from_persistence(format!("unknown upload error kind `{kind}`"))
                })
            })
            .transpose()?;
        let size_bytes = u64::try_from(row.size_bytes)
            .map_err(|_| RepoError::from_persistence("negative payload size"))?;

        Ok(Self {
            id: row.id,
            identity: row.identity,
            payload: OffloadPayload {
                local_path: row.local_path,
                remote_name: row.remote_name,
                size_bytes,
            },
            state,
            attempt_count: row.attempt_count,
            max_attempts: row.max_attempts,
            next_attempt_at: row.next_attempt_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_error: row.last_error,
            last_error_kind,
            remote_url: row.remote_url,
            cancel_requested: row.cancel_requested,
            local_state,
            completed_at: row.completed_at,
            processing_signalled_at: row.processing_signalled_at,
            local_deleted_at: row.local_deleted_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RemoteObjectRow {
    identity: i64,
    remote_url: String,
    uploaded_at: OffsetDateTime,
}

impl From<RemoteObjectRow> for RemoteObjectRecord {
    fn from(row: RemoteObjectRow) -> Self {
        Self {
            identity: row.identity,
            remote_url: row.remote_url,
            uploaded_at: row.uploaded_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct CountsRow {
    pending: i64,
    uploading: i64,
    completed: i64,
    abandoned: i64,
    pending_deletion: i64,
}

fn into_records(rows: Vec<TaskRow>) -> Result<Vec<OffloadTaskRecord>, RepoError> {
    rows.into_iter().map(OffloadTaskRecord::try_from).collect()
}

#[async_trait]
impl OffloadRepo for PostgresRepositories {
    async fn insert_task_if_absent(
        &self,
        task: NewOffloadTask,
    ) -> Result<EnqueueOutcome, RepoError> {
        let size_bytes = i64::try_from(task.payload.size_bytes).map_err(|_| {
            RepoError::InvalidInput {
                message: "payload size exceeds supported range".to_string(),
            }
        })?;

        // The live task may finish between the insert and the select; one retry settles it.
        for _ in 0..2 {
            let inserted = sqlx::query_scalar::<_, Uuid>(
                r#"
                INSERT INTO offload_tasks (
                    id, identity, local_path, remote_name, size_bytes, state,
                    attempt_count, max_attempts, next_attempt_at, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6, $7, now(), now())
                ON CONFLICT (identity) WHERE state IN ('pending', 'uploading') DO NOTHING
                RETURNING id
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(task.identity)
            .bind(&task.payload.local_path)
            .bind(&task.payload.remote_name)
            .bind(size_bytes)
            .bind(task.max_attempts)
            .bind(task.next_attempt_at)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;

            if let Some(id) = inserted {
                return Ok(EnqueueOutcome::Created(id));
            }

            let existing = sqlx::query_scalar::<_, Uuid>(
                r#"
                SELECT id FROM offload_tasks
                WHERE identity = $1 AND state IN ('pending', 'uploading')
                ORDER BY created_at DESC
                LIMIT 1
                "#,
            )
            .bind(task.identity)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;

            if let Some(id) = existing {
                return Ok(EnqueueOutcome::Coalesced(id));
            }
        }

        Err(RepoError::Integrity {
            message: format!("could not settle a live task for identity {}", task.identity),
        })
    }

    async fn due_tasks(
        &self,
        now: OffsetDateTime,
        limit: u32,
    ) -> Result<Vec<OffloadTaskRecord>, RepoError> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM offload_tasks \
             WHERE state = 'pending' AND next_attempt_at <= $1 \
             ORDER BY next_attempt_at, created_at \
             LIMIT $2"
        ))
        .bind(now)
        .bind(Self::clamp_limit(limit, 1_000))
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        into_records(rows)
    }

    async fn claim_task(&self, id: Uuid) -> Result<Option<OffloadTaskRecord>, RepoError> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "UPDATE offload_tasks SET state = 'uploading', updated_at = now() \
             WHERE id = $1 AND state = 'pending' AND NOT cancel_requested \
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        row.map(OffloadTaskRecord::try_from).transpose()
    }

    async fn complete_task(
        &self,
        params: CompleteTaskParams,
    ) -> Result<Option<OffloadTaskRecord>, RepoError> {
        let mut tx = self.begin().await.map_err(map_sqlx_error)?;

        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "UPDATE offload_tasks SET \
                state = 'completed', \
                remote_url = $2, \
                completed_at = $3, \
                updated_at = $3, \
                last_error = NULL, \
                last_error_kind = NULL, \
                local_state = CASE WHEN $4 THEN 'pending_deletion' ELSE local_state END \
             WHERE id = $1 AND state = 'uploading' AND NOT cancel_requested \
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(params.id)
        .bind(&params.remote_url)
        .bind(params.completed_at)
        .bind(params.remove_local_copy)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        let Some(row) = row else {
            sqlx::query(
                r#"
                UPDATE offload_tasks
                SET state = 'abandoned', last_error = 'cancelled', last_error_kind = NULL,
                    updated_at = $2
                WHERE id = $1 AND state = 'uploading' AND cancel_requested
                "#,
            )
            .bind(params.id)
            .bind(params.completed_at)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
            tx.commit().await.map_err(map_sqlx_error)?;
            return Ok(None);
        };

        let record = OffloadTaskRecord::try_from(row)?;

        sqlx::query(
            r#"
            INSERT INTO remote_objects (identity, remote_url, uploaded_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (identity) DO UPDATE
            SET remote_url = EXCLUDED.remote_url,
                uploaded_at = EXCLUDED.uploaded_at
            "#,
        )
        .bind(record.identity)
        .bind(&params.remote_url)
        .bind(params.completed_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(Some(record))
    }

    async fn fail_task(&self, params: FailTaskParams) -> Result<OffloadTaskRecord, RepoError> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "UPDATE offload_tasks SET \
                state = CASE WHEN cancel_requested THEN 'abandoned' ELSE $2 END, \
                attempt_count = $3, \
                next_attempt_at = $4, \
                last_error = CASE WHEN cancel_requested THEN 'cancelled' ELSE $5 END, \
                last_error_kind = $6, \
                updated_at = now() \
             WHERE id = $1 AND state = 'uploading' \
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(params.id)
        .bind(params.state.as_str())
        .bind(params.attempt_count)
        .bind(params.next_attempt_at)
        .bind(&params.last_error)
        .bind(params.last_error_kind.map(UploadErrorKind::as_str))
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        row.map(OffloadTaskRecord::try_from)
            .transpose()?
            .ok_or(RepoError::NotFound)
    }

    async fn request_cancel(&self, identity: Identity) -> Result<CancelOutcome, RepoError> {
        let abandoned = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE offload_tasks
            SET state = 'abandoned', last_error = 'cancelled', last_error_kind = NULL,
                updated_at = now()
            WHERE identity = $1 AND state = 'pending'
            RETURNING id
            "#,
        )
        .bind(identity)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;
        if let Some(id) = abandoned {
            return Ok(CancelOutcome::Abandoned(id));
        }

        let requested = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE offload_tasks
            SET cancel_requested = TRUE, updated_at = now()
            WHERE identity = $1 AND state = 'uploading'
            RETURNING id
            "#,
        )
        .bind(identity)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(requested.map_or(CancelOutcome::NothingToCancel, CancelOutcome::Requested))
    }

    async fn latest_task(
        &self,
        identity: Identity,
    ) -> Result<Option<OffloadTaskRecord>, RepoError> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM offload_tasks \
             WHERE identity = $1 \
             ORDER BY created_at DESC \
             LIMIT 1"
        ))
        .bind(identity)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        row.map(OffloadTaskRecord::try_from).transpose()
    }

    async fn record_processing_signal(
        &self,
        identity: Identity,
        at: OffsetDateTime,
    ) -> Result<Option<OffloadTaskRecord>, RepoError> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "UPDATE offload_tasks SET \
                processing_signalled_at = COALESCE(processing_signalled_at, $2), \
                updated_at = now() \
             WHERE id = ( \
                SELECT id FROM offload_tasks WHERE identity = $1 \
                ORDER BY created_at DESC LIMIT 1 \
             ) AND local_state <> 'deleted' \
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(identity)
        .bind(at)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        row.map(OffloadTaskRecord::try_from).transpose()
    }

    async fn deletions_due(
        &self,
        cutoff: OffsetDateTime,
        limit: u32,
    ) -> Result<Vec<OffloadTaskRecord>, RepoError> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM offload_tasks \
             WHERE state = 'completed' AND local_state = 'pending_deletion' \
               AND (processing_signalled_at IS NOT NULL OR completed_at <= $1) \
             ORDER BY completed_at, id \
             LIMIT $2"
        ))
        .bind(cutoff)
        .bind(Self::clamp_limit(limit, 1_000))
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        into_records(rows)
    }

    async fn mark_local_deleted(&self, id: Uuid, at: OffsetDateTime) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            UPDATE offload_tasks
            SET local_state = 'deleted', local_deleted_at = $2, updated_at = $2
            WHERE id = $1 AND local_state = 'pending_deletion'
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn reset_stale_uploads(&self, cutoff: OffsetDateTime) -> Result<u64, RepoError> {
        let result = sqlx::query(
            r#"
            UPDATE offload_tasks
            SET state = CASE WHEN cancel_requested THEN 'abandoned' ELSE 'pending' END,
                last_error = CASE WHEN cancel_requested THEN 'cancelled' ELSE last_error END,
                next_attempt_at = now(),
                updated_at = now()
            WHERE state = 'uploading' AND updated_at <= $1
            "#,
        )
        .bind(cutoff)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn find_remote_object(
        &self,
        identity: Identity,
    ) -> Result<Option<RemoteObjectRecord>, RepoError> {
        let row = sqlx::query_as::<_, RemoteObjectRow>(
            "SELECT identity, remote_url, uploaded_at FROM remote_objects WHERE identity = $1",
        )
        .bind(identity)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(RemoteObjectRecord::from))
    }

    async fn list_tasks_by_state(
        &self,
        state: TaskState,
        limit: u32,
    ) -> Result<Vec<OffloadTaskRecord>, RepoError> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM offload_tasks \
             WHERE state = $1 \
             ORDER BY created_at, id \
             LIMIT $2"
        ))
        .bind(state.as_str())
        .bind(Self::clamp_limit(limit, 1_000))
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        into_records(rows)
    }

    async fn count_tasks(&self) -> Result<TaskCounts, RepoError> {
        let row = sqlx::query_as::<_, CountsRow>(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE state = 'pending') AS pending,
                COUNT(*) FILTER (WHERE state = 'uploading') AS uploading,
                COUNT(*) FILTER (WHERE state = 'completed') AS completed,
                COUNT(*) FILTER (WHERE state = 'abandoned') AS abandoned,
                COUNT(*) FILTER (WHERE local_state = 'pending_deletion') AS pending_deletion
            FROM offload_tasks
            "#,
        )
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(TaskCounts {
            pending: Self::convert_count(row.pending)?,
            uploading: Self::convert_count(row.uploading)?,
            completed: Self::convert_count(row.completed)?,
            abandoned: Self::convert_count(row.abandoned)?,
            pending_deletion: Self::convert_count(row.pending_deletion)?,
        })
    }

    async fn purge_terminal_before(&self, cutoff: OffsetDateTime) -> Result<u64, RepoError> {
        let result = sqlx::query(
            r#"
            DELETE FROM offload_tasks
            WHERE state IN ('completed', 'abandoned')
              AND local_state <> 'pending_deletion'
              AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }
}
