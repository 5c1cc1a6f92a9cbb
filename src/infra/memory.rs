//! In-process repository implementations.
//!
//! Used when no database URL is configured and by the test suite. Every operation applies
//! its conditional transition under a single mutex, so the same races the Postgres adapter
//! settles with `WHERE state = ...` are settled here by holding the lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::application::repos::{
    CancelOutcome, CatalogMatch, CatalogRepo, CompleteTaskParams, EnqueueOutcome,
    FailTaskParams, LookupRepo, NewOffloadTask, OffloadRepo, RepairReport, RepoError, TaskCounts,
};
use crate::cache::lock::mutex_lock;
use crate::domain::entities::{
    Identity, LookupEntryRecord, OffloadTaskRecord, RemoteObjectRecord,
};
use crate::domain::keys::{KeyHash, normalize};
use crate::domain::types::{LocalState, TaskState};

const SOURCE: &str = "infra::memory";

#[derive(Debug, Clone)]
struct EntryRow {
    key_hash: Option<String>,
    key_prefix: String,
    identity: Identity,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

#[derive(Default)]
struct MemoryState {
    entries: BTreeMap<i64, EntryRow>,
    /// Hash → id of the row that answers for it (the lowest id holding the hash).
    by_hash: HashMap<String, i64>,
    next_entry_id: i64,
    /// False while legacy rows exist that predate the hash constraint.
    unique_enforced: bool,
    catalog: Vec<CatalogMatch>,
    tasks: HashMap<Uuid, OffloadTaskRecord>,
    task_order: Vec<Uuid>,
    history: HashMap<Uuid, Vec<TaskState>>,
    remote: HashMap<Identity, RemoteObjectRecord>,
}

impl MemoryState {
    fn entry_by_hash(&self, hash: &str) -> Option<(i64, &EntryRow)> {
        let id = *self.by_hash.get(hash)?;
        self.entries.get(&id).map(|row| (id, row))
    }

    fn insert_entry(&mut self, row: EntryRow) -> i64 {
        self.next_entry_id += 1;
        let id = self.next_entry_id;
        if let Some(hash) = row.key_hash.as_ref() {
            self.by_hash.entry(hash.clone()).or_insert(id);
        }
        self.entries.insert(id, row);
        id
    }

    fn remove_entry(&mut self, id: i64) {
        let Some(row) = self.entries.remove(&id) else {
            return;
        };
        if let Some(hash) = row.key_hash
            && self.by_hash.get(&hash) == Some(&id)
        {
            self.by_hash.remove(&hash);
        }
    }

    fn set_entry_hash(&mut self, id: i64, hash: &str, at: OffsetDateTime) {
        if let Some(row) = self.entries.get_mut(&id) {
            row.key_hash = Some(hash.to_string());
            row.updated_at = at;
            let holder = self.by_hash.entry(hash.to_string()).or_insert(id);
            *holder = (*holder).min(id);
        }
    }

    fn set_state(&mut self, id: Uuid, state: TaskState) {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.state = state;
        }
        self.history.entry(id).or_default().push(state);
    }

    fn live_task(&self, identity: Identity) -> Option<&OffloadTaskRecord> {
        self.task_order
            .iter()
            .rev()
            .filter_map(|id| self.tasks.get(id))
            .find(|task| task.identity == identity && !task.state.is_terminal())
    }

    fn latest_task(&self, identity: Identity) -> Option<&OffloadTaskRecord> {
        self.task_order
            .iter()
            .rev()
            .filter_map(|id| self.tasks.get(id))
            .find(|task| task.identity == identity)
    }

    fn tasks_in_order(&self) -> impl Iterator<Item = &OffloadTaskRecord> {
        self.task_order.iter().filter_map(|id| self.tasks.get(id))
    }
}

/// Backend call counters, for asserting how many round trips an operation took.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CallCounts {
    pub find_identity: usize,
    pub find_identities: usize,
    pub upsert_entry: usize,
    pub find_by_paths: usize,
}

#[derive(Default)]
struct CallCounters {
    find_identity: AtomicUsize,
    find_identities: AtomicUsize,
    upsert_entry: AtomicUsize,
    find_by_paths: AtomicUsize,
}

pub struct MemoryRepositories {
    state: Mutex<MemoryState>,
    calls: CallCounters,
    lookup_faults: AtomicU32,
}

impl Default for MemoryRepositories {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRepositories {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                unique_enforced: true,
                ..MemoryState::default()
            }),
            calls: CallCounters::default(),
            lookup_faults: AtomicU32::new(0),
        }
    }

    /// Register a catalog resource the fallback resolver can find.
    pub fn seed_catalog(&self, path: &str, identity: Identity) {
        let mut state = mutex_lock(&self.state, SOURCE, "seed_catalog");
        state.catalog.push(CatalogMatch {
            path: path.trim_start_matches('/').to_lowercase(),
            identity,
        });
    }

    /// Insert a row the way it was stored before keys were hashed: full key, no hash.
    pub fn seed_legacy_entry(&self, key: &str, identity: Identity) {
        let now = OffsetDateTime::now_utc();
        let mut state = mutex_lock(&self.state, SOURCE, "seed_legacy_entry");
        state.unique_enforced = false;
        state.insert_entry(EntryRow {
            key_hash: None,
            key_prefix: key.to_string(),
            identity,
            created_at: now,
            updated_at: now,
        });
    }

    /// Make the next `count` identity lookups fail as if the backend were unreachable.
    pub fn fail_next_lookups(&self, count: u32) {
        self.lookup_faults.store(count, Ordering::SeqCst);
    }

    pub fn calls(&self) -> CallCounts {
        CallCounts {
            find_identity: self.calls.find_identity.load(Ordering::SeqCst),
            find_identities: self.calls.find_identities.load(Ordering::SeqCst),
            upsert_entry: self.calls.upsert_entry.load(Ordering::SeqCst),
            find_by_paths: self.calls.find_by_paths.load(Ordering::SeqCst),
        }
    }

    pub fn reset_calls(&self) {
        self.calls.find_identity.store(0, Ordering::SeqCst);
        self.calls.find_identities.store(0, Ordering::SeqCst);
        self.calls.upsert_entry.store(0, Ordering::SeqCst);
        self.calls.find_by_paths.store(0, Ordering::SeqCst);
    }

    /// Every state a task has been in, in order, starting with `pending`.
    pub fn state_history(&self, task_id: Uuid) -> Vec<TaskState> {
        let state = mutex_lock(&self.state, SOURCE, "state_history");
        state.history.get(&task_id).cloned().unwrap_or_default()
    }

    pub fn task(&self, task_id: Uuid) -> Option<OffloadTaskRecord> {
        let state = mutex_lock(&self.state, SOURCE, "task");
        state.tasks.get(&task_id).cloned()
    }

    /// Total index rows, hashed or not.
    pub fn entry_count(&self) -> usize {
        let state = mutex_lock(&self.state, SOURCE, "entry_count");
        state.entries.len()
    }

    /// Move a task's `updated_at` back in time, as if its worker had vanished.
    pub fn backdate_task(&self, task_id: Uuid, by: time::Duration) {
        let mut state = mutex_lock(&self.state, SOURCE, "backdate_task");
        if let Some(task) = state.tasks.get_mut(&task_id) {
            task.updated_at -= by;
            if let Some(completed_at) = task.completed_at.as_mut() {
                *completed_at -= by;
            }
        }
    }

    fn take_lookup_fault(&self) -> Result<(), RepoError> {
        let injected = self
            .lookup_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if injected {
            return Err(RepoError::Unavailable("injected lookup failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LookupRepo for MemoryRepositories {
    async fn upsert_entry(
        &self,
        hash: &KeyHash,
        key_prefix: &str,
        identity: Identity,
    ) -> Result<(), RepoError> {
        self.calls.upsert_entry.fetch_add(1, Ordering::SeqCst);
        let now = OffsetDateTime::now_utc();
        let mut state = mutex_lock(&self.state, SOURCE, "upsert_entry");

        let existing = state.entry_by_hash(hash.as_str()).map(|(id, _)| id);
        match existing {
            Some(id) => {
                if let Some(row) = state.entries.get_mut(&id) {
                    row.key_prefix = key_prefix.to_string();
                    row.identity = identity;
                    row.updated_at = now;
                }
            }
            None => {
                state.insert_entry(EntryRow {
                    key_hash: Some(hash.as_str().to_string()),
                    key_prefix: key_prefix.to_string(),
                    identity,
                    created_at: now,
                    updated_at: now,
                });
            }
        }
        Ok(())
    }

    async fn find_identity(&self, hash: &KeyHash) -> Result<Option<Identity>, RepoError> {
        self.calls.find_identity.fetch_add(1, Ordering::SeqCst);
        self.take_lookup_fault()?;
        let state = mutex_lock(&self.state, SOURCE, "find_identity");
        Ok(state
            .entry_by_hash(hash.as_str())
            .map(|(_, row)| row.identity))
    }

    async fn find_identities(
        &self,
        hashes: &[KeyHash],
    ) -> Result<HashMap<KeyHash, Identity>, RepoError> {
        self.calls.find_identities.fetch_add(1, Ordering::SeqCst);
        self.take_lookup_fault()?;
        let state = mutex_lock(&self.state, SOURCE, "find_identities");
        Ok(hashes
            .iter()
            .filter_map(|hash| {
                state
                    .entry_by_hash(hash.as_str())
                    .map(|(_, row)| (hash.clone(), row.identity))
            })
            .collect())
    }

    async fn delete_by_identity(&self, identity: Identity) -> Result<u64, RepoError> {
        let mut state = mutex_lock(&self.state, SOURCE, "delete_by_identity");
        let owned: Vec<i64> = state
            .entries
            .iter()
            .filter(|(_, row)| row.identity == identity)
            .map(|(id, _)| *id)
            .collect();
        for id in &owned {
            state.remove_entry(*id);
        }
        Ok(owned.len() as u64)
    }

    async fn scan_prefix(
        &self,
        prefix: &str,
        limit: u32,
    ) -> Result<Vec<LookupEntryRecord>, RepoError> {
        let state = mutex_lock(&self.state, SOURCE, "scan_prefix");
        let mut rows: Vec<LookupEntryRecord> = state
            .entries
            .iter()
            .filter(|(_, row)| row.key_prefix.starts_with(prefix))
            .map(|(id, row)| LookupEntryRecord {
                id: *id,
                key_hash: row.key_hash.clone().unwrap_or_default(),
                key_prefix: row.key_prefix.clone(),
                identity: row.identity,
                created_at: row.created_at,
                updated_at: row.updated_at,
            })
            .collect();
        rows.sort_by(|a, b| a.key_prefix.cmp(&b.key_prefix).then(a.id.cmp(&b.id)));
        rows.truncate(limit.clamp(1, 1_000) as usize);
        Ok(rows)
    }

    async fn repair_uniqueness(&self) -> Result<RepairReport, RepoError> {
        let now = OffsetDateTime::now_utc();
        let mut state = mutex_lock(&self.state, SOURCE, "repair_uniqueness");
        let mut report = RepairReport::default();
        let before = state.entries.len();

        let legacy: Vec<i64> = state
            .entries
            .iter()
            .filter(|(_, row)| row.key_hash.is_none())
            .map(|(id, _)| *id)
            .collect();
        for id in legacy {
            let Some(prefix) = state.entries.get(&id).map(|row| row.key_prefix.clone()) else {
                continue;
            };
            let hash = match normalize(&prefix) {
                Ok(key) => key.hash(),
                Err(_) => KeyHash::of(&prefix),
            };
            if state.unique_enforced {
                // Only one row may hold a hash at a time; the lowest id keeps it.
                match state.by_hash.get(hash.as_str()).copied() {
                    Some(holder) if holder < id => {
                        state.remove_entry(id);
                        continue;
                    }
                    Some(holder) => state.remove_entry(holder),
                    None => {}
                }
            }
            state.set_entry_hash(id, hash.as_str(), now);
            report.hashed += 1;
        }

        // BTreeMap iterates by ascending id, so the first row per hash is the keeper.
        let mut seen: HashMap<String, i64> = HashMap::new();
        let mut duplicates = Vec::new();
        for (id, row) in &state.entries {
            if let Some(hash) = row.key_hash.as_ref() {
                if seen.contains_key(hash) {
                    duplicates.push(*id);
                } else {
                    seen.insert(hash.clone(), *id);
                }
            }
        }
        for id in duplicates {
            state.remove_entry(id);
        }

        report.duplicates_removed = (before - state.entries.len()) as u64;
        if !state.unique_enforced {
            state.unique_enforced = true;
            report.constraint_installed = true;
        }
        Ok(report)
    }
}

#[async_trait]
impl CatalogRepo for MemoryRepositories {
    async fn find_by_paths(&self, paths: &[String]) -> Result<Vec<CatalogMatch>, RepoError> {
        self.calls.find_by_paths.fetch_add(1, Ordering::SeqCst);
        let state = mutex_lock(&self.state, SOURCE, "find_by_paths");
        let wanted: Vec<String> = paths
            .iter()
            .map(|path| path.trim_start_matches('/').to_lowercase())
            .collect();
        let mut matches: Vec<CatalogMatch> = state
            .catalog
            .iter()
            .filter(|entry| wanted.contains(&entry.path))
            .cloned()
            .collect();
        matches.sort_by_key(|entry| entry.identity);
        Ok(matches)
    }
}

#[async_trait]
impl OffloadRepo for MemoryRepositories {
    async fn insert_task_if_absent(
        &self,
        task: NewOffloadTask,
    ) -> Result<EnqueueOutcome, RepoError> {
        let now = OffsetDateTime::now_utc();
        let mut state = mutex_lock(&self.state, SOURCE, "insert_task_if_absent");
        if let Some(existing) = state.live_task(task.identity) {
            return Ok(EnqueueOutcome::Coalesced(existing.id));
        }

        let id = Uuid::new_v4();
        state.tasks.insert(
            id,
            OffloadTaskRecord {
                id,
                identity: task.identity,
                payload: task.payload,
                state: TaskState::Pending,
                attempt_count: 0,
                max_attempts: task.max_attempts,
                next_attempt_at: task.next_attempt_at,
                created_at: now,
                updated_at: now,
                last_error: None,
                last_error_kind: None,
                remote_url: None,
                cancel_requested: false,
                local_state: LocalState::NotOffloaded,
                completed_at: None,
                processing_signalled_at: None,
                local_deleted_at: None,
            },
        );
        state.task_order.push(id);
        state.history.insert(id, vec![TaskState::Pending]);
        Ok(EnqueueOutcome::Created(id))
    }

    async fn due_tasks(
        &self,
        now: OffsetDateTime,
        limit: u32,
    ) -> Result<Vec<OffloadTaskRecord>, RepoError> {
        let state = mutex_lock(&self.state, SOURCE, "due_tasks");
        let mut due: Vec<OffloadTaskRecord> = state
            .tasks_in_order()
            .filter(|task| task.state == TaskState::Pending && task.next_attempt_at <= now)
            .cloned()
            .collect();
        // Stable sort keeps creation order among equal schedules.
        due.sort_by_key(|task| task.next_attempt_at);
        due.truncate(limit.clamp(1, 1_000) as usize);
        Ok(due)
    }

    async fn claim_task(&self, id: Uuid) -> Result<Option<OffloadTaskRecord>, RepoError> {
        let now = OffsetDateTime::now_utc();
        let mut state = mutex_lock(&self.state, SOURCE, "claim_task");
        let claimable = state
            .tasks
            .get(&id)
            .is_some_and(|task| task.state == TaskState::Pending && !task.cancel_requested);
        if !claimable {
            return Ok(None);
        }
        state.set_state(id, TaskState::Uploading);
        let task = state.tasks.get_mut(&id).ok_or(RepoError::NotFound)?;
        task.updated_at = now;
        Ok(Some(task.clone()))
    }

    async fn complete_task(
        &self,
        params: CompleteTaskParams,
    ) -> Result<Option<OffloadTaskRecord>, RepoError> {
        let mut state = mutex_lock(&self.state, SOURCE, "complete_task");
        let (uploading, cancelled) = match state.tasks.get(&params.id) {
            Some(task) => (task.state == TaskState::Uploading, task.cancel_requested),
            None => return Ok(None),
        };
        if !uploading {
            return Ok(None);
        }

        if cancelled {
            state.set_state(params.id, TaskState::Abandoned);
            if let Some(task) = state.tasks.get_mut(&params.id) {
                task.last_error = Some("cancelled".to_string());
                task.last_error_kind = None;
                task.updated_at = params.completed_at;
            }
            return Ok(None);
        }

        state.set_state(params.id, TaskState::Completed);
        let record = {
            let task = state.tasks.get_mut(&params.id).ok_or(RepoError::NotFound)?;
            task.remote_url = Some(params.remote_url.clone());
            task.completed_at = Some(params.completed_at);
            task.updated_at = params.completed_at;
            task.last_error = None;
            task.last_error_kind = None;
            if params.remove_local_copy {
                task.local_state = LocalState::PendingDeletion;
            }
            task.clone()
        };
        state.remote.insert(
            record.identity,
            RemoteObjectRecord {
                identity: record.identity,
                remote_url: params.remote_url,
                uploaded_at: params.completed_at,
            },
        );
        Ok(Some(record))
    }

    async fn fail_task(&self, params: FailTaskParams) -> Result<OffloadTaskRecord, RepoError> {
        let now = OffsetDateTime::now_utc();
        let mut state = mutex_lock(&self.state, SOURCE, "fail_task");
        let cancelled = match state.tasks.get(&params.id) {
            Some(task) if task.state == TaskState::Uploading => task.cancel_requested,
            _ => return Err(RepoError::NotFound),
        };

        let next_state = if cancelled {
            TaskState::Abandoned
        } else {
            params.state
        };
        state.set_state(params.id, next_state);
        let task = state.tasks.get_mut(&params.id).ok_or(RepoError::NotFound)?;
        task.attempt_count = params.attempt_count;
        task.next_attempt_at = params.next_attempt_at;
        task.last_error = Some(if cancelled {
            "cancelled".to_string()
        } else {
            params.last_error
        });
        task.last_error_kind = params.last_error_kind;
        task.updated_at = now;
        Ok(task.clone())
    }

    async fn request_cancel(&self, identity: Identity) -> Result<CancelOutcome, RepoError> {
        let now = OffsetDateTime::now_utc();
        let mut state = mutex_lock(&self.state, SOURCE, "request_cancel");
        let Some((id, current)) = state.live_task(identity).map(|task| (task.id, task.state))
        else {
            return Ok(CancelOutcome::NothingToCancel);
        };

        if current == TaskState::Pending {
            state.set_state(id, TaskState::Abandoned);
            let task = state.tasks.get_mut(&id).ok_or(RepoError::NotFound)?;
            task.last_error = Some("cancelled".to_string());
            task.last_error_kind = None;
            task.updated_at = now;
            return Ok(CancelOutcome::Abandoned(id));
        }

        let task = state.tasks.get_mut(&id).ok_or(RepoError::NotFound)?;
        task.cancel_requested = true;
        task.updated_at = now;
        Ok(CancelOutcome::Requested(id))
    }

    async fn latest_task(
        &self,
        identity: Identity,
    ) -> Result<Option<OffloadTaskRecord>, RepoError> {
        let state = mutex_lock(&self.state, SOURCE, "latest_task");
        Ok(state.latest_task(identity).cloned())
    }

    async fn record_processing_signal(
        &self,
        identity: Identity,
        at: OffsetDateTime,
    ) -> Result<Option<OffloadTaskRecord>, RepoError> {
        let mut state = mutex_lock(&self.state, SOURCE, "record_processing_signal");
        let Some(id) = state
            .latest_task(identity)
            .filter(|task| task.local_state != LocalState::Deleted)
            .map(|task| task.id)
        else {
            return Ok(None);
        };
        let task = state.tasks.get_mut(&id).ok_or(RepoError::NotFound)?;
        task.processing_signalled_at.get_or_insert(at);
        task.updated_at = OffsetDateTime::now_utc();
        Ok(Some(task.clone()))
    }

    async fn deletions_due(
        &self,
        cutoff: OffsetDateTime,
        limit: u32,
    ) -> Result<Vec<OffloadTaskRecord>, RepoError> {
        let state = mutex_lock(&self.state, SOURCE, "deletions_due");
        let mut due: Vec<OffloadTaskRecord> = state
            .tasks_in_order()
            .filter(|task| {
                task.state == TaskState::Completed
                    && task.local_state == LocalState::PendingDeletion
                    && (task.processing_signalled_at.is_some()
                        || task.completed_at.is_some_and(|at| at <= cutoff))
            })
            .cloned()
            .collect();
        due.sort_by_key(|task| task.completed_at);
        due.truncate(limit.clamp(1, 1_000) as usize);
        Ok(due)
    }

    async fn mark_local_deleted(&self, id: Uuid, at: OffsetDateTime) -> Result<(), RepoError> {
        let mut state = mutex_lock(&self.state, SOURCE, "mark_local_deleted");
        if let Some(task) = state.tasks.get_mut(&id) {
            if task.local_state == LocalState::PendingDeletion {
                task.local_state = LocalState::Deleted;
                task.local_deleted_at = Some(at);
                task.updated_at = at;
            }
        }
        Ok(())
    }

    async fn reset_stale_uploads(&self, cutoff: OffsetDateTime) -> Result<u64, RepoError> {
        let now = OffsetDateTime::now_utc();
        let mut state = mutex_lock(&self.state, SOURCE, "reset_stale_uploads");
        let stale: Vec<(Uuid, bool)> = state
            .tasks
            .values()
            .filter(|task| task.state == TaskState::Uploading && task.updated_at <= cutoff)
            .map(|task| (task.id, task.cancel_requested))
            .collect();

        for (id, cancelled) in &stale {
            let next = if *cancelled {
                TaskState::Abandoned
            } else {
                TaskState::Pending
            };
            state.set_state(*id, next);
            if let Some(task) = state.tasks.get_mut(id) {
                if *cancelled {
                    task.last_error = Some("cancelled".to_string());
                }
                task.next_attempt_at = now;
                task.updated_at = now;
            }
        }
        Ok(stale.len() as u64)
    }

    async fn find_remote_object(
        &self,
        identity: Identity,
    ) -> Result<Option<RemoteObjectRecord>, RepoError> {
        let state = mutex_lock(&self.state, SOURCE, "find_remote_object");
        Ok(state.remote.get(&identity).cloned())
    }

    async fn list_tasks_by_state(
        &self,
        state_filter: TaskState,
        limit: u32,
    ) -> Result<Vec<OffloadTaskRecord>, RepoError> {
        let state = mutex_lock(&self.state, SOURCE, "list_tasks_by_state");
        Ok(state
            .tasks_in_order()
            .filter(|task| task.state == state_filter)
            .take(limit.clamp(1, 1_000) as usize)
            .cloned()
            .collect())
    }

    async fn count_tasks(&self) -> Result<TaskCounts, RepoError> {
        let state = mutex_lock(&self.state, SOURCE, "count_tasks");
        let mut counts = TaskCounts::default();
        for task in state.tasks.values() {
            match task.state {
                TaskState::Pending => counts.pending += 1,
                TaskState::Uploading => counts.uploading += 1,
                TaskState::Completed => counts.completed += 1,
                TaskState::Abandoned => counts.abandoned += 1,
            }
            if task.local_state == LocalState::PendingDeletion {
                counts.pending_deletion += 1;
            }
        }
        Ok(counts)
    }

    async fn purge_terminal_before(&self, cutoff: OffsetDateTime) -> Result<u64, RepoError> {
        let mut guard = mutex_lock(&self.state, SOURCE, "purge_terminal_before");
        let state = &mut *guard;
        let purged: Vec<Uuid> = state
            .tasks
            .values()
            .filter(|task| {
                task.state.is_terminal()
                    && task.local_state != LocalState::PendingDeletion
                    && task.updated_at < cutoff
            })
            .map(|task| task.id)
            .collect();
        for id in &purged {
            state.tasks.remove(id);
            state.history.remove(id);
        }
        state.task_order.retain(|id| state.tasks.contains_key(id));
        Ok(purged.len() as u64)
    }
}
