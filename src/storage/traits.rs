// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

use crate::account::SyncAccount;
use crate::entity::EntityType;
use crate::ledger::{SyncConflict, SyncRun, SyncStatus};
use crate::record::MirroredRecord;
use crate::resilience::retry::Transient;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// The request conflicts with stored state
    #[error("{0}")]
    Rejected(String),
}

impl Transient for StorageError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// The relational mirror of source records.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Insert-or-update keyed on `(entity, source_id)`.
    ///
    /// On update the mapped fields, `active`, `source_updated_at`,
    /// `schema_version` and `synced_at` are overwritten; `modified_at` keeps
    /// its stored value. Returns the number of records in `records`.
    async fn upsert_batch(&self, entity: EntityType, records: &[MirroredRecord]) -> Result<usize, StorageError>;

    async fn get(&self, entity: EntityType, source_id: &str) -> Result<Option<MirroredRecord>, StorageError>;

    /// Rows for whichever of `source_ids` exist.
    async fn get_many(&self, entity: EntityType, source_ids: &[String]) -> Result<Vec<MirroredRecord>, StorageError> {
        let mut found = Vec::with_capacity(source_ids.len());
        for id in source_ids {
            if let Some(record) = self.get(entity, id).await? {
                found.push(record);
            }
        }
        Ok(found)
    }

    /// Logical delete. Returns `false` when no such row exists.
    async fn mark_inactive(&self, entity: EntityType, source_id: &str, at: DateTime<Utc>) -> Result<bool, StorageError>;

    /// Record a change made on the target side: merges `fields` into the
    /// row and moves `modified_at` to `at`. Returns `false` when no such
    /// row exists.
    async fn apply_local_edit(
        &self,
        entity: EntityType,
        source_id: &str,
        fields: Map<String, Value>,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError>;

    /// Rows of `entity`, active or not.
    async fn count(&self, entity: EntityType) -> Result<u64, StorageError>;
}

/// Sync status, conflicts and the run log.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Upsert one status row. `last_synced_at` never moves backwards; the
    /// stored row is returned.
    async fn upsert_status(&self, status: &SyncStatus) -> Result<SyncStatus, StorageError>;

    async fn get_status(&self, entity: EntityType, entity_id: &str) -> Result<Option<SyncStatus>, StorageError>;

    async fn get_statuses(&self, entity: EntityType, entity_ids: &[String]) -> Result<Vec<SyncStatus>, StorageError> {
        let mut found = Vec::with_capacity(entity_ids.len());
        for id in entity_ids {
            if let Some(status) = self.get_status(entity, id).await? {
                found.push(status);
            }
        }
        Ok(found)
    }

    /// Most recently synced rows first.
    async fn recent_statuses(&self, limit: usize) -> Result<Vec<SyncStatus>, StorageError>;

    async fn save_conflict(&self, conflict: &SyncConflict) -> Result<(), StorageError>;

    async fn get_conflict(&self, id: &str) -> Result<Option<SyncConflict>, StorageError>;

    /// The most recently detected conflict for one record, any state.
    async fn latest_conflict(&self, entity: EntityType, entity_id: &str) -> Result<Option<SyncConflict>, StorageError>;

    /// Unresolved conflicts, oldest first.
    async fn pending_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>, StorageError>;

    async fn count_pending_conflicts(&self) -> Result<u64, StorageError>;

    /// Insert or replace a run by id.
    async fn save_run(&self, run: &SyncRun) -> Result<(), StorageError>;

    /// Newest first, optionally for one account.
    async fn recent_runs(&self, account_id: Option<&str>, limit: usize) -> Result<Vec<SyncRun>, StorageError>;
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn upsert_account(&self, account: &SyncAccount) -> Result<(), StorageError>;
    async fn get_account(&self, id: &str) -> Result<Option<SyncAccount>, StorageError>;
    /// Sorted by id.
    async fn list_accounts(&self) -> Result<Vec<SyncAccount>, StorageError>;
}

/// One page of a key listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyPage {
    pub keys: Vec<String>,
    /// Pass back to continue; `None` when the listing is complete
    pub cursor: Option<u64>,
}

/// Key-value store behind the cache layer.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError>;
    /// Returns whether a key was removed.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;
    /// Keys starting with `prefix`. Backends may return fewer keys than
    /// exist, in which case `cursor` is set.
    async fn list_keys(&self, prefix: &str, cursor: u64) -> Result<KeyPage, StorageError>;
}
