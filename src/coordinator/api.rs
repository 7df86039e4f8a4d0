// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Record-level operations and read-only views.
//!
//! - `sync_single()` - webhook path, one record through writer and ledger
//! - `mark_deleted()` - logical delete of a mirrored row
//! - `resolve_conflict()` - settle a pending conflict
//! - `status()` / `statistics()` / `recent_runs()` / `pending_conflicts()`

use chrono::Utc;
use std::collections::BTreeMap;
use tracing::info;

use crate::cache::{CacheKeys, CacheTtl};
use crate::entity::EntityType;
use crate::error::SyncError;
use crate::ledger::{ConflictStatus, ResolutionStrategy, SyncConflict, SyncRun, SyncStatus};
use crate::record::MirroredRecord;
use crate::storage::traits::StorageError;
use crate::writer::mapping::mapping_for;

use super::types::{AccountSummary, Resolution, SingleSync, StatusReport, SyncStatistics};
use super::SyncOrchestrator;

impl SyncOrchestrator {
    /// Fetch one record and sync it as a batch of one. Used when the
    /// source notifies us of a change.
    pub async fn sync_single(
        &self,
        account_id: &str,
        entity: EntityType,
        source_id: &str,
    ) -> Result<SingleSync, SyncError> {
        let _turn = self.run_lock.lock().await;
        let mut account = self.account(account_id).await?;
        let token = self.resolve_token(&mut account).await?;

        let Some(record) = self.fetcher.fetch_one(&token, entity, source_id).await? else {
            info!(account = %account_id, entity = %entity, id = source_id, "Record gone from source");
            return Ok(SingleSync::NotFound);
        };

        let outcome = self.write_records(account_id, entity, &[record], Utc::now()).await?;
        if let Some(error) = outcome.errors.into_iter().next() {
            return Err(StorageError::Backend(error).into());
        }
        if outcome.written == 0 {
            self.refresh_conflict_gauge().await;
            return Ok(SingleSync::Conflicted);
        }
        self.invalidate(entity).await;
        Ok(SingleSync::Written)
    }

    /// Mark a mirrored row inactive after the source deleted it. Returns
    /// `false` when the row was never mirrored.
    pub async fn mark_deleted(&self, account_id: &str, entity: EntityType, source_id: &str) -> Result<bool, SyncError> {
        let now = Utc::now();
        if !self.target.mark_inactive(entity, source_id, now).await? {
            return Ok(false);
        }
        self.ledger
            .record_synced(
                entity,
                &[source_id.to_string()],
                account_id,
                self.config.sync_direction,
                now,
                ConflictStatus::None,
            )
            .await?;
        self.invalidate(entity).await;
        info!(entity = %entity, id = source_id, "Marked record inactive");
        Ok(true)
    }

    /// Settle a pending conflict.
    ///
    /// `source_wins` writes the stored source version over the target;
    /// `target_wins` leaves the target as it is. Either way the conflict is
    /// closed and the record's status becomes `resolved`.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        strategy: ResolutionStrategy,
    ) -> Result<Resolution, SyncError> {
        if strategy == ResolutionStrategy::Manual {
            return Err(SyncError::InvalidRequest(
                "resolve with source_wins or target_wins".into(),
            ));
        }
        let conflict = self
            .ledger
            .get_conflict(conflict_id)
            .await?
            .ok_or_else(|| SyncError::ConflictNotFound(conflict_id.to_string()))?;
        if conflict.is_resolved() {
            return Err(SyncError::InvalidRequest(format!("conflict '{}' is already resolved", conflict_id)));
        }

        let now = Utc::now();
        let entity = conflict.entity_type;
        let previous = self.ledger.status_for(entity, &conflict.entity_id).await?;

        if strategy == ResolutionStrategy::SourceWins {
            let row = self.source_version_row(&conflict, now).await?;
            self.target.upsert_batch(entity, &[row]).await?;
        }
        let conflict = self.ledger.mark_resolved(conflict_id, strategy, now).await?;

        // A kept target edit must not look synced, or the next run would
        // overwrite it
        let last_synced_at = match (strategy, &previous) {
            (ResolutionStrategy::TargetWins, Some(previous)) => previous.last_synced_at,
            _ => now,
        };
        let status = self
            .ledger
            .upsert_sync_status(&SyncStatus {
                entity_type: entity,
                entity_id: conflict.entity_id.clone(),
                account_id: conflict.account_id.clone(),
                last_synced_at,
                sync_direction: previous.map_or(self.config.sync_direction, |p| p.sync_direction),
                conflict_status: ConflictStatus::Resolved,
            })
            .await?;

        if strategy == ResolutionStrategy::SourceWins {
            self.invalidate(entity).await;
        }
        self.refresh_conflict_gauge().await;
        info!(conflict = conflict_id, entity = %entity, id = %conflict.entity_id, strategy = %strategy, "Conflict resolved");
        Ok(Resolution { conflict, status })
    }

    async fn source_version_row(
        &self,
        conflict: &SyncConflict,
        now: chrono::DateTime<Utc>,
    ) -> Result<MirroredRecord, SyncError> {
        let existing = self.target.get(conflict.entity_type, &conflict.entity_id).await?;
        Ok(match existing {
            Some(mut row) => {
                row.fields = conflict.source_version.clone();
                row.active = true;
                row.synced_at = now;
                row
            }
            None => MirroredRecord {
                entity_type: conflict.entity_type,
                source_id: conflict.entity_id.clone(),
                account_id: conflict.account_id.clone(),
                fields: conflict.source_version.clone(),
                active: true,
                source_updated_at: None,
                schema_version: mapping_for(conflict.entity_type).schema_version,
                synced_at: now,
                modified_at: now,
            },
        })
    }

    /// Most recent ledger rows and the pending-conflict count.
    pub async fn status(&self, limit: usize) -> Result<StatusReport, SyncError> {
        Ok(StatusReport {
            statuses: self.ledger.get_sync_status(limit).await?,
            pending_conflicts: self.ledger.count_pending_conflicts().await?,
        })
    }

    /// Row counts per entity type and last-sync times per account.
    ///
    /// Counts are cached under each entity's namespace, so writes of that
    /// entity clear them.
    pub async fn statistics(&self) -> Result<SyncStatistics, SyncError> {
        let mut records = BTreeMap::new();
        for entity in EntityType::ALL {
            let count = self
                .cache
                .remember(&CacheKeys::entity_stats(entity), CacheTtl::SHORT, || self.target.count(entity))
                .await?;
            records.insert(entity, count);
        }

        let accounts: Vec<AccountSummary> = self
            .accounts
            .list_accounts()
            .await?
            .into_iter()
            .map(|a| AccountSummary { id: a.id, name: a.name, last_sync_at: a.last_sync_at })
            .collect();
        let last_sync_at = accounts.iter().filter_map(|a| a.last_sync_at).max();

        Ok(SyncStatistics {
            records,
            accounts,
            last_sync_at,
            pending_conflicts: self.ledger.count_pending_conflicts().await?,
            gate: self.gate_stats(),
        })
    }

    pub async fn recent_runs(&self, account_id: Option<&str>, limit: usize) -> Result<Vec<SyncRun>, SyncError> {
        Ok(self.ledger.recent_runs(account_id, limit).await?)
    }

    pub async fn pending_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>, SyncError> {
        Ok(self.ledger.get_pending_conflicts(limit).await?)
    }
}
