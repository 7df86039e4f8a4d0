// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One sync run: fetch every page of each entity type, write it, record it.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use crate::account::SyncAccount;
use crate::entity::{EntityType, SyncType};
use crate::error::SyncError;
use crate::ledger::{ConflictStatus, ResolutionStrategy, RunStatus, SyncLedger, SyncRun, SyncStatus};
use crate::metrics::EntityTimer;
use crate::record::{MirroredRecord, SourceRecord};
use crate::resilience::gate::GateError;
use crate::source::AccessToken;
use crate::writer::BatchWriter;

use super::types::EntityWrite;
use super::SyncOrchestrator;

/// Records split by the conflict check.
#[derive(Default)]
struct Screened {
    write: Vec<MirroredRecord>,
    /// Conflicted ids written anyway because the source wins
    source_won: HashSet<String>,
    held: usize,
}

impl SyncOrchestrator {
    /// Sync one account for one or all entity types, waiting for the run to
    /// finish.
    ///
    /// The run is logged as it progresses. On failure the run is saved as
    /// `failed` with the error, then the error is returned.
    #[instrument(skip(self), fields(run_id))]
    pub async fn run_account(&self, account_id: &str, sync_type: SyncType) -> Result<SyncRun, SyncError> {
        let _turn = self.run_lock.lock().await;
        let mut account = self.account(account_id).await?;

        let mut run = SyncRun::start(account_id, sync_type.to_string());
        tracing::Span::current().record("run_id", run.id.as_str());
        self.ledger.save_run(&run).await?;
        info!(account = %account_id, sync_type = %sync_type, "Sync run started");
        let started = Instant::now();

        match self.execute(&mut account, &mut run, sync_type).await {
            Ok(()) => {
                run.transition(RunStatus::Completed)?;
                self.ledger.persist_run_best_effort(&run).await;
                self.finish_account(&mut account, run.completed_at.unwrap_or_else(Utc::now)).await;
                self.refresh_conflict_gauge().await;

                crate::metrics::record_run(RunStatus::Completed.as_str(), started.elapsed());
                info!(
                    account = %account_id,
                    records = run.records_processed,
                    errors = run.errors.len(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Sync run completed"
                );
                Ok(run)
            }
            Err(e) => {
                run.errors.push(e.to_string());
                if let Err(invalid) = run.transition(RunStatus::Failed) {
                    warn!(error = %invalid, "Run already terminal");
                }
                self.ledger.persist_run_best_effort(&run).await;
                // Keep the cursor so the next run resumes where this one stopped
                if let Err(save) = self.accounts.upsert_account(&account).await {
                    warn!(account = %account_id, error = %save, "Failed to save account cursors");
                }

                crate::metrics::record_run(RunStatus::Failed.as_str(), started.elapsed());
                tracing::error!(account = %account_id, error = %e, "Sync run failed");
                Err(e)
            }
        }
    }

    async fn execute(&self, account: &mut SyncAccount, run: &mut SyncRun, sync_type: SyncType) -> Result<(), SyncError> {
        let token = self.resolve_token(account).await?;
        run.transition(RunStatus::Fetching)?;

        for entity in sync_type.entities() {
            let _timer = EntityTimer::new(entity.as_str());
            self.sync_entity(account, run, entity, &token).await?;
        }
        Ok(())
    }

    /// Current bearer token, refreshing and saving the credentials first
    /// when they are about to expire.
    pub(super) async fn resolve_token(&self, account: &mut SyncAccount) -> Result<AccessToken, SyncError> {
        let resolved = self.credentials.resolve(account).await?;
        if let Some(credentials) = resolved.refreshed {
            account.credentials = credentials;
            self.accounts.upsert_account(account).await?;
            info!(account = %account.id, "Refreshed source credentials");
        }
        Ok(resolved.token)
    }

    async fn sync_entity(
        &self,
        account: &mut SyncAccount,
        run: &mut SyncRun,
        entity: EntityType,
        token: &AccessToken,
    ) -> Result<(), SyncError> {
        let start = account.cursor(entity);
        if start > 0 {
            info!(account = %account.id, entity = %entity, offset = start, "Resuming interrupted pass");
        }
        let mut pages = self
            .fetcher
            .paginate_from(token.clone(), entity, start, self.config.page_size);
        let mut written = 0;

        while let Some(page) = pages.next_page().await? {
            run.transition(RunStatus::Fetching)?;
            let records = if self.config.hydrate_details && entity.has_detail_endpoint() {
                self.hydrate(token, entity, page.records, run).await?
            } else {
                page.records
            };

            run.transition(RunStatus::Writing)?;
            let outcome = self.write_records(&account.id, entity, &records, Utc::now()).await?;
            run.add_written(entity, outcome.written);
            run.errors.extend(outcome.errors);
            written += outcome.written;

            if outcome.written > 0 {
                self.invalidate(entity).await;
            }

            account.cursors.insert(entity, pages.offset());
            self.accounts.upsert_account(account).await?;
            debug!(entity = %entity, offset = page.offset, written = outcome.written, held = outcome.held, "Page synced");
        }

        account.cursors.remove(&entity);
        self.accounts.upsert_account(account).await?;
        info!(account = %account.id, entity = %entity, written, "Entity pass finished");
        Ok(())
    }

    /// Replace listed records with their detail-endpoint versions. Records
    /// the source no longer has, or refuses to return, are logged in the
    /// run and dropped.
    async fn hydrate(
        &self,
        token: &AccessToken,
        entity: EntityType,
        records: Vec<SourceRecord>,
        run: &mut SyncRun,
    ) -> Result<Vec<SourceRecord>, SyncError> {
        let mut hydrated = Vec::with_capacity(records.len());
        for record in records {
            match self.fetcher.fetch_one(token, entity, &record.source_id).await {
                Ok(Some(detail)) => hydrated.push(detail),
                Ok(None) => {
                    warn!(entity = %entity, id = %record.source_id, "Detail lookup found nothing, skipping");
                    run.errors.push(format!("{} {}: not found on detail lookup", entity, record.source_id));
                }
                Err(GateError::Rejected(e)) => {
                    warn!(entity = %entity, id = %record.source_id, error = %e, "Detail lookup rejected, skipping");
                    run.errors.push(format!("{} {}: {}", entity, record.source_id, e));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(hydrated)
    }

    /// Map, screen for conflicts, write and record one set of records.
    pub(super) async fn write_records(
        &self,
        account_id: &str,
        entity: EntityType,
        records: &[SourceRecord],
        now: DateTime<Utc>,
    ) -> Result<EntityWrite, SyncError> {
        let direction = self.config.sync_direction;
        let prepared = BatchWriter::prepare(account_id, records, now);

        let screened = if direction.checks_conflicts() {
            self.screen_conflicts(entity, prepared, now).await?
        } else {
            Screened { write: prepared, ..Default::default() }
        };

        let result = self.writer.upsert_batch(entity, &screened.write).await;

        let (resolved, clean): (Vec<String>, Vec<String>) = result
            .written_ids
            .iter()
            .cloned()
            .partition(|id| screened.source_won.contains(id));
        self.ledger
            .record_synced(entity, &clean, account_id, direction, now, ConflictStatus::None)
            .await?;
        self.ledger
            .record_synced(entity, &resolved, account_id, direction, now, ConflictStatus::Resolved)
            .await?;

        Ok(EntityWrite {
            written: result.written,
            held: screened.held,
            errors: result.failures.iter().map(|f| f.describe()).collect(),
        })
    }

    /// Split prepared rows into those safe to write and those held back by
    /// a target-side edit since the last sync.
    async fn screen_conflicts(
        &self,
        entity: EntityType,
        prepared: Vec<MirroredRecord>,
        now: DateTime<Utc>,
    ) -> Result<Screened, SyncError> {
        let ids: Vec<String> = prepared.iter().map(|r| r.source_id.clone()).collect();
        let statuses: HashMap<String, SyncStatus> = self
            .ledger
            .statuses_for(entity, &ids)
            .await?
            .into_iter()
            .map(|s| (s.entity_id.clone(), s))
            .collect();
        let targets: HashMap<String, MirroredRecord> = self
            .target
            .get_many(entity, &ids)
            .await?
            .into_iter()
            .map(|r| (r.source_id.clone(), r))
            .collect();

        let strategy = self.config.conflict_strategy;
        let mut screened = Screened::default();

        for record in prepared {
            let status = statuses.get(&record.source_id);
            let target = targets.get(&record.source_id);
            let (Some(status), Some(target), Some(fields)) =
                (status, target, SyncLedger::detect_conflict(status, target, &record.fields))
            else {
                screened.write.push(record);
                continue;
            };

            // Already recorded for exactly these versions
            if let Some(previous) = self.ledger.latest_conflict(entity, &record.source_id).await? {
                if previous.same_versions(&record.fields, &target.fields) {
                    screened.held += 1;
                    continue;
                }
            }

            self.ledger
                .record_conflict(target, &record.fields, fields, strategy, now)
                .await?;

            match strategy {
                ResolutionStrategy::SourceWins => {
                    screened.source_won.insert(record.source_id.clone());
                    screened.write.push(record);
                }
                ResolutionStrategy::TargetWins | ResolutionStrategy::Manual => {
                    let conflict_status = if strategy == ResolutionStrategy::Manual {
                        ConflictStatus::Pending
                    } else {
                        ConflictStatus::Resolved
                    };
                    // last_synced_at stays put: the target copy was not overwritten
                    self.ledger
                        .upsert_sync_status(&SyncStatus { conflict_status, ..status.clone() })
                        .await?;
                    screened.held += 1;
                }
            }
        }

        if screened.held > 0 {
            info!(entity = %entity, held = screened.held, strategy = %strategy, "Records held back by conflicts");
        }
        Ok(screened)
    }

    /// Clear derived caches for `entity`. Failures are logged; a stale
    /// cache expires on its own.
    pub(super) async fn invalidate(&self, entity: EntityType) {
        if let Err(e) = self.cache.invalidate_data_type(entity).await {
            warn!(entity = %entity, error = %e, "Cache invalidation failed");
        }
    }

    /// Stamp the account and the last-sync marker after a completed run.
    async fn finish_account(&self, account: &mut SyncAccount, at: DateTime<Utc>) {
        account.last_sync_at = Some(at);
        if let Err(e) = self.accounts.upsert_account(account).await {
            warn!(account = %account.id, error = %e, "Failed to save last sync time");
        }
        let ttl = Duration::from_secs(self.config.last_sync_ttl_secs);
        if let Err(e) = self.cache.mark_last_sync(&account.id, at, ttl).await {
            warn!(account = %account.id, error = %e, "Failed to write last sync marker");
        }
    }

    pub(super) async fn refresh_conflict_gauge(&self) {
        match self.ledger.count_pending_conflicts().await {
            Ok(count) => crate::metrics::set_pending_conflicts(count),
            Err(e) => debug!(error = %e, "Could not count pending conflicts"),
        }
    }
}
