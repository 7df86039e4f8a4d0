// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync-state ledger.
//!
//! Tracks, per `(entity_type, entity_id)`, when a record was last synced,
//! in which direction, and whether it is in conflict. Also owns conflict
//! records and the run log. Storage lives behind [`LedgerStore`]; this type
//! adds the rules on top.
//!
//! # Conflict rule
//!
//! A record is in conflict when all of these hold:
//! - a status row exists (the record was synced before)
//! - the target copy was modified after `last_synced_at`
//! - the incoming source fields differ from the target fields
//!
//! Detection only runs for [`SyncDirection::Bidirectional`].

pub mod types;

pub use types::{
    ConflictStatus, InvalidTransition, ResolutionStrategy, RunStatus, SyncConflict, SyncDirection, SyncRun,
    SyncStatus,
};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{error, info};

use crate::entity::EntityType;
use crate::record::MirroredRecord;
use crate::storage::traits::{LedgerStore, StorageError};

pub struct SyncLedger {
    store: Arc<dyn LedgerStore>,
}

impl SyncLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Upsert one status row; `last_synced_at` only moves forward.
    pub async fn upsert_sync_status(&self, status: &SyncStatus) -> Result<SyncStatus, StorageError> {
        self.store.upsert_status(status).await
    }

    /// Stamp every id in `ids` as synced at `now`.
    pub async fn record_synced(
        &self,
        entity: EntityType,
        ids: &[String],
        account_id: &str,
        direction: SyncDirection,
        now: DateTime<Utc>,
        conflict_status: ConflictStatus,
    ) -> Result<usize, StorageError> {
        for id in ids {
            self.store
                .upsert_status(&SyncStatus {
                    entity_type: entity,
                    entity_id: id.clone(),
                    account_id: account_id.to_string(),
                    last_synced_at: now,
                    sync_direction: direction,
                    conflict_status,
                })
                .await?;
        }
        Ok(ids.len())
    }

    pub async fn status_for(&self, entity: EntityType, entity_id: &str) -> Result<Option<SyncStatus>, StorageError> {
        self.store.get_status(entity, entity_id).await
    }

    pub async fn statuses_for(&self, entity: EntityType, ids: &[String]) -> Result<Vec<SyncStatus>, StorageError> {
        self.store.get_statuses(entity, ids).await
    }

    /// Most recently synced statuses, newest first.
    pub async fn get_sync_status(&self, limit: usize) -> Result<Vec<SyncStatus>, StorageError> {
        self.store.recent_statuses(limit).await
    }

    pub async fn get_pending_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>, StorageError> {
        self.store.pending_conflicts(limit).await
    }

    pub async fn count_pending_conflicts(&self) -> Result<u64, StorageError> {
        self.store.count_pending_conflicts().await
    }

    pub async fn get_conflict(&self, id: &str) -> Result<Option<SyncConflict>, StorageError> {
        self.store.get_conflict(id).await
    }

    pub async fn latest_conflict(
        &self,
        entity: EntityType,
        entity_id: &str,
    ) -> Result<Option<SyncConflict>, StorageError> {
        self.store.latest_conflict(entity, entity_id).await
    }

    /// Apply the conflict rule. Returns the diverging columns, or `None`
    /// when the incoming fields can be written without loss.
    #[must_use]
    pub fn detect_conflict(
        status: Option<&SyncStatus>,
        target: Option<&MirroredRecord>,
        incoming: &Map<String, Value>,
    ) -> Option<Vec<String>> {
        let (status, target) = (status?, target?);
        if target.modified_at <= status.last_synced_at {
            return None;
        }
        let fields = target.diverging_fields(incoming);
        (!fields.is_empty()).then_some(fields)
    }

    /// Persist a newly detected conflict. Non-manual strategies are settled
    /// on the spot and saved already resolved.
    pub async fn record_conflict(
        &self,
        target: &MirroredRecord,
        incoming: &Map<String, Value>,
        fields: Vec<String>,
        strategy: ResolutionStrategy,
        now: DateTime<Utc>,
    ) -> Result<SyncConflict, StorageError> {
        let conflict = SyncConflict {
            id: uuid::Uuid::new_v4().to_string(),
            entity_type: target.entity_type,
            entity_id: target.source_id.clone(),
            account_id: target.account_id.clone(),
            source_version: incoming.clone(),
            target_version: target.fields.clone(),
            fields,
            strategy,
            detected_at: now,
            resolved_at: (strategy != ResolutionStrategy::Manual).then_some(now),
        };
        self.store.save_conflict(&conflict).await?;
        crate::metrics::record_conflict(conflict.entity_type.as_str());
        info!(
            entity = %conflict.entity_type,
            id = %conflict.entity_id,
            strategy = %strategy,
            fields = ?conflict.fields,
            "Sync conflict detected"
        );
        Ok(conflict)
    }

    /// Close a pending conflict. Resolving twice is an error.
    pub async fn mark_resolved(
        &self,
        conflict_id: &str,
        strategy: ResolutionStrategy,
        now: DateTime<Utc>,
    ) -> Result<SyncConflict, StorageError> {
        let mut conflict = self
            .store
            .get_conflict(conflict_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("conflict {}", conflict_id)))?;
        if conflict.is_resolved() {
            return Err(StorageError::Rejected(format!("conflict {} already resolved", conflict_id)));
        }
        conflict.strategy = strategy;
        conflict.resolved_at = Some(now);
        self.store.save_conflict(&conflict).await?;
        Ok(conflict)
    }

    pub async fn save_run(&self, run: &SyncRun) -> Result<(), StorageError> {
        self.store.save_run(run).await
    }

    /// Save a run, logging instead of failing. Used on error paths where
    /// the original error is what the caller must see.
    pub async fn persist_run_best_effort(&self, run: &SyncRun) {
        if let Err(e) = self.store.save_run(run).await {
            error!(run_id = %run.id, error = %e, "Failed to persist sync run");
        }
    }

    pub async fn recent_runs(&self, account_id: Option<&str>, limit: usize) -> Result<Vec<SyncRun>, StorageError> {
        self.store.recent_runs(account_id, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryStore;
    use chrono::Duration;
    use serde_json::json;

    fn fields(email: &str) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("email".into(), json!(email));
        map
    }

    fn target(email: &str, modified_at: DateTime<Utc>) -> MirroredRecord {
        MirroredRecord {
            entity_type: EntityType::Contact,
            source_id: "7".into(),
            account_id: "acct".into(),
            fields: fields(email),
            active: true,
            source_updated_at: None,
            schema_version: 2,
            synced_at: modified_at,
            modified_at,
        }
    }

    fn status(at: DateTime<Utc>) -> SyncStatus {
        SyncStatus {
            entity_type: EntityType::Contact,
            entity_id: "7".into(),
            account_id: "acct".into(),
            last_synced_at: at,
            sync_direction: SyncDirection::Bidirectional,
            conflict_status: ConflictStatus::None,
        }
    }

    #[test]
    fn test_conflict_needs_status_and_target() {
        let now = Utc::now();
        let incoming = fields("new@x");
        assert!(SyncLedger::detect_conflict(None, Some(&target("old@x", now)), &incoming).is_none());
        assert!(SyncLedger::detect_conflict(Some(&status(now)), None, &incoming).is_none());
    }

    #[test]
    fn test_conflict_only_after_local_edit() {
        let synced = Utc::now();
        let incoming = fields("new@x");

        // Untouched since last sync
        let clean = target("old@x", synced);
        assert!(SyncLedger::detect_conflict(Some(&status(synced)), Some(&clean), &incoming).is_none());

        // Edited locally, values differ
        let edited = target("local@x", synced + Duration::minutes(5));
        let fields = SyncLedger::detect_conflict(Some(&status(synced)), Some(&edited), &incoming).unwrap();
        assert_eq!(fields, vec!["email".to_string()]);

        // Edited locally but identical to incoming
        let same = target("new@x", synced + Duration::minutes(5));
        assert!(SyncLedger::detect_conflict(Some(&status(synced)), Some(&same), &incoming).is_none());
    }

    #[tokio::test]
    async fn test_record_synced_and_list() {
        let ledger = SyncLedger::new(Arc::new(InMemoryStore::new()));
        let ids: Vec<String> = (1..=3).map(|i| i.to_string()).collect();
        let now = Utc::now();

        let n = ledger
            .record_synced(EntityType::Tag, &ids, "acct", SyncDirection::SourceToTarget, now, ConflictStatus::None)
            .await
            .unwrap();
        assert_eq!(n, 3);
        assert_eq!(ledger.get_sync_status(10).await.unwrap().len(), 3);
        assert_eq!(ledger.get_sync_status(2).await.unwrap().len(), 2);
        assert!(ledger.status_for(EntityType::Tag, "2").await.unwrap().is_some());
        assert!(ledger.status_for(EntityType::Contact, "2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_manual_conflict_stays_pending_until_resolved() {
        let ledger = SyncLedger::new(Arc::new(InMemoryStore::new()));
        let now = Utc::now();
        let local = target("local@x", now);

        let conflict = ledger
            .record_conflict(&local, &fields("new@x"), vec!["email".into()], ResolutionStrategy::Manual, now)
            .await
            .unwrap();
        assert!(!conflict.is_resolved());
        assert_eq!(ledger.count_pending_conflicts().await.unwrap(), 1);

        let resolved = ledger.mark_resolved(&conflict.id, ResolutionStrategy::TargetWins, now).await.unwrap();
        assert_eq!(resolved.strategy, ResolutionStrategy::TargetWins);
        assert!(ledger.get_pending_conflicts(10).await.unwrap().is_empty());

        assert!(matches!(
            ledger.mark_resolved(&conflict.id, ResolutionStrategy::SourceWins, now).await,
            Err(StorageError::Rejected(_))
        ));
        assert!(matches!(
            ledger.mark_resolved("missing", ResolutionStrategy::SourceWins, now).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_automatic_strategy_saves_resolved() {
        let ledger = SyncLedger::new(Arc::new(InMemoryStore::new()));
        let now = Utc::now();
        let conflict = ledger
            .record_conflict(&target("a@x", now), &fields("b@x"), vec!["email".into()], ResolutionStrategy::SourceWins, now)
            .await
            .unwrap();
        assert_eq!(conflict.resolved_at, Some(now));
        assert_eq!(ledger.count_pending_conflicts().await.unwrap(), 0);
        let latest = ledger.latest_conflict(EntityType::Contact, "7").await.unwrap().unwrap();
        assert!(latest.same_versions(&fields("b@x"), &fields("a@x")));
    }
}
