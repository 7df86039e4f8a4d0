// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entry points that start runs: manual triggers, the scheduled tick, and
//! the background scheduler loop.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::entity::SyncType;
use crate::error::SyncError;

use super::types::{ScheduledSummary, TriggerResponse};
use super::SyncOrchestrator;

impl SyncOrchestrator {
    /// Start a run for one account in the background and return at once.
    ///
    /// Only an unknown account is reported here; the run's own outcome is
    /// visible through the run log and status views.
    pub async fn trigger(self: &Arc<Self>, account_id: &str, sync_type: SyncType) -> Result<TriggerResponse, SyncError> {
        self.account(account_id).await?;

        let orchestrator = Arc::clone(self);
        let id = account_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = orchestrator.run_account(&id, sync_type).await {
                warn!(account = %id, error = %e, "Triggered sync failed");
            }
        });

        info!(account = %account_id, sync_type = %sync_type, "Sync triggered");
        Ok(TriggerResponse {
            success: true,
            message: format!("Sync started for account {} ({})", account_id, sync_type),
        })
    }

    /// Sync every known account, one after another. A failed account is
    /// recorded and the tick moves on to the next.
    pub async fn run_scheduled(&self) -> Result<ScheduledSummary, SyncError> {
        let accounts = self.accounts.list_accounts().await?;
        let mut summary = ScheduledSummary { accounts: accounts.len(), ..Default::default() };

        for account in accounts {
            match self.run_account(&account.id, SyncType::All).await {
                Ok(_) => summary.succeeded += 1,
                Err(e) => summary.failed.push((account.id, e.to_string())),
            }
        }

        info!(
            accounts = summary.accounts,
            succeeded = summary.succeeded,
            failed = summary.failed.len(),
            "Scheduled sync finished"
        );
        Ok(summary)
    }

    /// Run [`Self::run_scheduled`] every `period` until `shutdown` turns
    /// true. The first tick fires one full period after start.
    pub fn spawn_scheduler(self: &Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(period_secs = period.as_secs(), "Scheduler started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = orchestrator.run_scheduled().await {
                            error!(error = %e, "Scheduled sync could not start");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Scheduler stopped");
        })
    }
}
