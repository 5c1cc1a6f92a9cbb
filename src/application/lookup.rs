//! Authoritative key → identity index with cache write-through.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::application::repos::{LookupRepo, RepairReport, RepoError};
use crate::cache::FastCache;
use crate::domain::entities::{Identity, LookupEntryRecord};
use crate::domain::keys::{KeyHash, LookupKey};

const SOURCE: &str = "application::lookup";

pub struct LookupIndex {
    repo: Arc<dyn LookupRepo>,
    cache: Arc<FastCache>,
}

impl LookupIndex {
    pub fn new(repo: Arc<dyn LookupRepo>, cache: Arc<FastCache>) -> Self {
        Self { repo, cache }
    }

    /// Insert or update the entry for `key` and refresh the cache with the new value.
    pub async fn upsert(&self, key: &LookupKey, identity: Identity) -> Result<(), RepoError> {
        self.repo
            .upsert_entry(&key.hash(), &key.prefix(), identity)
            .await?;
        self.cache.put_found(key.clone(), identity);
        debug!(target = SOURCE, key = %key, identity, "lookup entry upserted");
        Ok(())
    }

    pub async fn get(&self, key: &LookupKey) -> Result<Option<Identity>, RepoError> {
        self.repo.find_identity(&key.hash()).await
    }

    /// Resolve many keys with a single backend query.
    pub async fn get_many(
        &self,
        keys: &[LookupKey],
    ) -> Result<HashMap<LookupKey, Identity>, RepoError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let mut by_hash: HashMap<KeyHash, Vec<&LookupKey>> = HashMap::with_capacity(keys.len());
        for key in keys {
            by_hash.entry(key.hash()).or_default().push(key);
        }
        let hashes: Vec<KeyHash> = by_hash.keys().cloned().collect();

        let found = self.repo.find_identities(&hashes).await?;

        let mut resolved = HashMap::with_capacity(found.len());
        for (hash, identity) in found {
            if let Some(owners) = by_hash.get(&hash) {
                for key in owners {
                    resolved.insert((*key).clone(), identity);
                }
            }
        }
        Ok(resolved)
    }

    /// Remove every entry owned by `identity`.
    ///
    /// The cache is not indexed by identity and may hold answers the index never stored,
    /// so it is always cleared.
    pub async fn delete_by_identity(&self, identity: Identity) -> Result<u64, RepoError> {
        let removed = self.repo.delete_by_identity(identity).await?;
        self.cache.clear();
        info!(target = SOURCE, identity, removed, "lookup entries removed for identity");
        Ok(removed)
    }

    pub async fn scan_prefix(
        &self,
        prefix: &str,
        limit: u32,
    ) -> Result<Vec<LookupEntryRecord>, RepoError> {
        self.repo.scan_prefix(prefix, limit.clamp(1, 1_000)).await
    }

    pub async fn repair_uniqueness(&self) -> Result<RepairReport, RepoError> {
        let report = self.repo.repair_uniqueness().await?;
        if report.hashed > 0 || report.duplicates_removed > 0 {
            self.cache.clear();
        }
        info!(
            target = SOURCE,
            hashed = report.hashed,
            duplicates_removed = report.duplicates_removed,
            constraint_installed = report.constraint_installed,
            "lookup index repaired"
        );
        Ok(report)
    }
}
