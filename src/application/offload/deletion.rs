//! Deferred deletion of local copies after a completed upload.

use metrics::counter;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::application::error::OffloadError;
use crate::domain::entities::OffloadTaskRecord;

use super::queue::{OffloadQueue, SOURCE};

const METRIC_LOCAL_DELETED: &str = "offsite_offload_local_deleted_total";
const DELETION_BATCH: u32 = 100;

impl OffloadQueue {
    /// Delete local copies that were signalled or whose grace period ran out.
    pub(super) async fn run_due_deletions(&self, now: OffsetDateTime) -> Result<usize, OffloadError> {
        let cutoff = now - self.config.deletion_grace;
        let due = self.repo.deletions_due(cutoff, DELETION_BATCH).await?;

        let mut deleted = 0;
        for record in due {
            if record.processing_signalled_at.is_none() {
                warn!(
                    target = SOURCE,
                    task_id = %record.id,
                    identity = record.identity,
                    grace_secs = self.config.deletion_grace.as_secs(),
                    "no processing signal within grace period; deleting local copy that a consumer may still read"
                );
            }
            match self.delete_local_copy(&record).await {
                Ok(()) => deleted += 1,
                Err(err) => warn!(
                    target = SOURCE,
                    task_id = %record.id,
                    error = %err,
                    "failed to delete local copy"
                ),
            }
        }
        Ok(deleted)
    }

    /// Remove the local file and mark the task's copy deleted. A missing file counts as deleted.
    pub(super) async fn delete_local_copy(
        &self,
        record: &OffloadTaskRecord,
    ) -> Result<(), OffloadError> {
        self.local
            .delete(&record.payload.local_path)
            .await
            .map_err(|err| OffloadError::Local(err.into()))?;

        let now = OffsetDateTime::now_utc();
        self.repo.mark_local_deleted(record.id, now).await?;

        counter!(METRIC_LOCAL_DELETED).increment(1);
        info!(
            target = SOURCE,
            task_id = %record.id,
            identity = record.identity,
            path = %record.payload.local_path,
            "local copy deleted"
        );
        Ok(())
    }
}
