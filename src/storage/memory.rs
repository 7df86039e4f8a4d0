// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process backends for tests and dry runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::time::Instant;

use super::traits::{AccountStore, CacheBackend, KeyPage, LedgerStore, StorageError, TargetStore};
use crate::account::SyncAccount;
use crate::entity::EntityType;
use crate::ledger::{SyncConflict, SyncRun, SyncStatus};
use crate::record::MirroredRecord;

type RecordKey = (EntityType, String);

/// Target, ledger and account storage in one set of concurrent maps.
pub struct InMemoryStore {
    records: DashMap<RecordKey, MirroredRecord>,
    statuses: DashMap<RecordKey, SyncStatus>,
    conflicts: DashMap<String, SyncConflict>,
    runs: DashMap<String, SyncRun>,
    accounts: DashMap<String, SyncAccount>,
    /// Batches containing one of these keys fail as a backend error
    rejected: DashSet<RecordKey>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            statuses: DashMap::new(),
            conflicts: DashMap::new(),
            runs: DashMap::new(),
            accounts: DashMap::new(),
            rejected: DashSet::new(),
        }
    }

    /// Total mirrored rows across entity types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn status_count(&self) -> usize {
        self.statuses.len()
    }

    /// Make every batch that contains this record fail, to exercise
    /// partial-failure handling.
    pub fn reject_writes_for(&self, entity: EntityType, source_id: &str) {
        self.rejected.insert((entity, source_id.to_string()));
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TargetStore for InMemoryStore {
    async fn upsert_batch(&self, entity: EntityType, records: &[MirroredRecord]) -> Result<usize, StorageError> {
        if let Some(bad) = records
            .iter()
            .find(|r| self.rejected.contains(&(entity, r.source_id.clone())))
        {
            return Err(StorageError::Backend(format!("write rejected for {} {}", entity, bad.source_id)));
        }

        for record in records {
            match self.records.entry((entity, record.source_id.clone())) {
                Entry::Occupied(mut slot) => {
                    let modified_at = slot.get().modified_at;
                    let mut next = record.clone();
                    next.modified_at = modified_at;
                    slot.insert(next);
                }
                Entry::Vacant(slot) => {
                    slot.insert(record.clone());
                }
            }
        }
        Ok(records.len())
    }

    async fn get(&self, entity: EntityType, source_id: &str) -> Result<Option<MirroredRecord>, StorageError> {
        Ok(self
            .records
            .get(&(entity, source_id.to_string()))
            .map(|r| r.value().clone()))
    }

    async fn mark_inactive(&self, entity: EntityType, source_id: &str, at: DateTime<Utc>) -> Result<bool, StorageError> {
        match self.records.get_mut(&(entity, source_id.to_string())) {
            Some(mut record) => {
                record.active = false;
                record.synced_at = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn apply_local_edit(
        &self,
        entity: EntityType,
        source_id: &str,
        fields: Map<String, Value>,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        match self.records.get_mut(&(entity, source_id.to_string())) {
            Some(mut record) => {
                record.fields.extend(fields);
                record.modified_at = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn count(&self, entity: EntityType) -> Result<u64, StorageError> {
        Ok(self.records.iter().filter(|r| r.key().0 == entity).count() as u64)
    }
}

#[async_trait]
impl LedgerStore for InMemoryStore {
    async fn upsert_status(&self, status: &SyncStatus) -> Result<SyncStatus, StorageError> {
        let key = (status.entity_type, status.entity_id.clone());
        let stored = match self.statuses.entry(key) {
            Entry::Occupied(mut slot) => {
                let merged = status.clone().merged_over(Some(slot.get()));
                slot.insert(merged.clone());
                merged
            }
            Entry::Vacant(slot) => {
                slot.insert(status.clone());
                status.clone()
            }
        };
        Ok(stored)
    }

    async fn get_status(&self, entity: EntityType, entity_id: &str) -> Result<Option<SyncStatus>, StorageError> {
        Ok(self
            .statuses
            .get(&(entity, entity_id.to_string()))
            .map(|s| s.value().clone()))
    }

    async fn recent_statuses(&self, limit: usize) -> Result<Vec<SyncStatus>, StorageError> {
        let mut all: Vec<SyncStatus> = self.statuses.iter().map(|s| s.value().clone()).collect();
        all.sort_by(|a, b| b.last_synced_at.cmp(&a.last_synced_at).then_with(|| a.entity_id.cmp(&b.entity_id)));
        all.truncate(limit);
        Ok(all)
    }

    async fn save_conflict(&self, conflict: &SyncConflict) -> Result<(), StorageError> {
        self.conflicts.insert(conflict.id.clone(), conflict.clone());
        Ok(())
    }

    async fn get_conflict(&self, id: &str) -> Result<Option<SyncConflict>, StorageError> {
        Ok(self.conflicts.get(id).map(|c| c.value().clone()))
    }

    async fn latest_conflict(&self, entity: EntityType, entity_id: &str) -> Result<Option<SyncConflict>, StorageError> {
        Ok(self
            .conflicts
            .iter()
            .filter(|c| c.entity_type == entity && c.entity_id == entity_id)
            .max_by_key(|c| c.detected_at)
            .map(|c| c.value().clone()))
    }

    async fn pending_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>, StorageError> {
        let mut pending: Vec<SyncConflict> = self
            .conflicts
            .iter()
            .filter(|c| !c.is_resolved())
            .map(|c| c.value().clone())
            .collect();
        pending.sort_by_key(|c| c.detected_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn count_pending_conflicts(&self) -> Result<u64, StorageError> {
        Ok(self.conflicts.iter().filter(|c| !c.is_resolved()).count() as u64)
    }

    async fn save_run(&self, run: &SyncRun) -> Result<(), StorageError> {
        self.runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn recent_runs(&self, account_id: Option<&str>, limit: usize) -> Result<Vec<SyncRun>, StorageError> {
        let mut runs: Vec<SyncRun> = self
            .runs
            .iter()
            .filter(|r| account_id.map_or(true, |id| r.account_id == id))
            .map(|r| r.value().clone())
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }
}

#[async_trait]
impl AccountStore for InMemoryStore {
    async fn upsert_account(&self, account: &SyncAccount) -> Result<(), StorageError> {
        self.accounts.insert(account.id.clone(), account.clone());
        Ok(())
    }

    async fn get_account(&self, id: &str) -> Result<Option<SyncAccount>, StorageError> {
        Ok(self.accounts.get(id).map(|a| a.value().clone()))
    }

    async fn list_accounts(&self) -> Result<Vec<SyncAccount>, StorageError> {
        let mut accounts: Vec<SyncAccount> = self.accounts.iter().map(|a| a.value().clone()).collect();
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(accounts)
    }
}

/// Keys returned per `list_keys` call, mirroring a backend that caps
/// enumeration.
pub const LIST_PAGE: usize = 1000;

struct CacheSlot {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheSlot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
pub struct InMemoryCache {
    entries: DashMap<String, CacheSlot>,
}

impl InMemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheBackend for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(slot) if slot.is_live(now) => return Ok(Some(slot.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, slot| !slot.is_live(now));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError> {
        let slot = CacheSlot {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.entries.insert(key.to_string(), slot);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn list_keys(&self, prefix: &str, cursor: u64) -> Result<KeyPage, StorageError> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && e.is_live(now))
            .map(|e| e.key().clone())
            .collect();
        keys.sort_unstable();

        let start = usize::try_from(cursor).unwrap_or(usize::MAX).min(keys.len());
        let end = (start + LIST_PAGE).min(keys.len());
        let next = (end < keys.len()).then_some(end as u64);
        Ok(KeyPage { keys: keys[start..end].to_vec(), cursor: next })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{ConflictStatus, SyncDirection};
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn record(id: &str, email: &str, at: DateTime<Utc>) -> MirroredRecord {
        let mut fields = Map::new();
        fields.insert("email".into(), json!(email));
        MirroredRecord {
            entity_type: EntityType::Contact,
            source_id: id.into(),
            account_id: "acct".into(),
            fields,
            active: true,
            source_updated_at: None,
            schema_version: 1,
            synced_at: at,
            modified_at: at,
        }
    }

    fn status(id: &str, at: DateTime<Utc>) -> SyncStatus {
        SyncStatus {
            entity_type: EntityType::Contact,
            entity_id: id.into(),
            account_id: "acct".into(),
            last_synced_at: at,
            sync_direction: SyncDirection::SourceToTarget,
            conflict_status: ConflictStatus::None,
        }
    }

    #[tokio::test]
    async fn test_new_store_is_empty() {
        let store = InMemoryStore::new();
        assert!(store.is_empty());
        assert_eq!(store.count(EntityType::Contact).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let batch = vec![record("1", "a@x", now), record("2", "b@x", now)];

        store.upsert_batch(EntityType::Contact, &batch).await.unwrap();
        store.upsert_batch(EntityType::Contact, &batch).await.unwrap();

        assert_eq!(store.count(EntityType::Contact).await.unwrap(), 2);
        assert_eq!(store.count(EntityType::Order).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_source_upsert_keeps_modified_at() {
        let store = InMemoryStore::new();
        let t0 = Utc::now();
        store.upsert_batch(EntityType::Contact, &[record("1", "a@x", t0)]).await.unwrap();

        let later = t0 + ChronoDuration::minutes(5);
        store.upsert_batch(EntityType::Contact, &[record("1", "new@x", later)]).await.unwrap();

        let stored = store.get(EntityType::Contact, "1").await.unwrap().unwrap();
        assert_eq!(stored.fields["email"], json!("new@x"));
        assert_eq!(stored.modified_at, t0);
        assert_eq!(stored.synced_at, later);
    }

    #[tokio::test]
    async fn test_local_edit_and_mark_inactive() {
        let store = InMemoryStore::new();
        let t0 = Utc::now();
        store.upsert_batch(EntityType::Contact, &[record("1", "a@x", t0)]).await.unwrap();

        let edit_at = t0 + ChronoDuration::seconds(30);
        let mut edit = Map::new();
        edit.insert("email".into(), json!("edited@x"));
        assert!(store.apply_local_edit(EntityType::Contact, "1", edit, edit_at).await.unwrap());
        assert!(!store.apply_local_edit(EntityType::Contact, "nope", Map::new(), edit_at).await.unwrap());

        let stored = store.get(EntityType::Contact, "1").await.unwrap().unwrap();
        assert_eq!(stored.modified_at, edit_at);
        assert_eq!(stored.fields["email"], json!("edited@x"));

        assert!(store.mark_inactive(EntityType::Contact, "1", edit_at).await.unwrap());
        assert!(!store.get(EntityType::Contact, "1").await.unwrap().unwrap().active);
        assert_eq!(store.count(EntityType::Contact).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rejected_record_fails_whole_batch() {
        let store = InMemoryStore::new();
        store.reject_writes_for(EntityType::Contact, "2");
        let now = Utc::now();

        let err = store
            .upsert_batch(EntityType::Contact, &[record("1", "a", now), record("2", "b", now)])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Backend(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_status_timestamp_never_regresses() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        store.upsert_status(&status("1", now)).await.unwrap();

        let stored = store
            .upsert_status(&status("1", now - ChronoDuration::hours(1)))
            .await
            .unwrap();
        assert_eq!(stored.last_synced_at, now);
        assert_eq!(store.get_status(EntityType::Contact, "1").await.unwrap().unwrap().last_synced_at, now);
    }

    #[tokio::test]
    async fn test_recent_runs_newest_first() {
        let store = InMemoryStore::new();
        let mut first = SyncRun::start("a", "all");
        first.started_at = Utc::now() - ChronoDuration::minutes(10);
        let second = SyncRun::start("a", "contacts");
        let other = SyncRun::start("b", "all");
        for run in [&first, &second, &other] {
            store.save_run(run).await.unwrap();
        }

        let runs = store.recent_runs(Some("a"), 10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, second.id);
        assert_eq!(store.recent_runs(None, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_accounts_sorted() {
        let store = InMemoryStore::new();
        for id in ["zeta", "alpha"] {
            store
                .upsert_account(&SyncAccount::new(id, crate::account::Credentials::bearer("t")))
                .await
                .unwrap();
        }
        let ids: Vec<String> = store.list_accounts().await.unwrap().into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_ttl_expiry() {
        let cache = InMemoryCache::new();
        cache.set("k", "v", Some(Duration::from_secs(10))).await.unwrap();
        cache.set("forever", "v", None).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.get("k").await.unwrap().is_none());
        assert!(cache.get("forever").await.unwrap().is_some());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_cache_listing_is_paged() {
        let cache = InMemoryCache::new();
        for i in 0..(LIST_PAGE + 5) {
            cache.set(&format!("metrics:{i:05}"), "1", None).await.unwrap();
        }
        cache.set("dashboard:x", "1", None).await.unwrap();

        let first = cache.list_keys("metrics:", 0).await.unwrap();
        assert_eq!(first.keys.len(), LIST_PAGE);
        let cursor = first.cursor.unwrap();

        let second = cache.list_keys("metrics:", cursor).await.unwrap();
        assert_eq!(second.keys.len(), 5);
        assert!(second.cursor.is_none());
    }
}
