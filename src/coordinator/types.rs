// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types returned by the sync orchestrator.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::entity::EntityType;
use crate::ledger::{SyncConflict, SyncStatus};
use crate::resilience::gate::GateStats;

/// Reply to a manual trigger. The run itself continues in the background.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerResponse {
    pub success: bool,
    pub message: String,
}

/// Recent ledger rows plus the size of the conflict queue.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub statuses: Vec<SyncStatus>,
    pub pending_conflicts: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSummary {
    pub id: String,
    pub name: String,
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// Per-entity counts and last-sync times.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatistics {
    /// Mirrored rows per entity type, active or not
    pub records: BTreeMap<EntityType, u64>,
    pub accounts: Vec<AccountSummary>,
    /// Latest `last_sync_at` across accounts
    pub last_sync_at: Option<DateTime<Utc>>,
    pub pending_conflicts: u64,
    pub gate: GateStats,
}

/// Outcome of one scheduled tick.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledSummary {
    pub accounts: usize,
    pub succeeded: usize,
    /// `(account_id, error)` per failed account
    pub failed: Vec<(String, String)>,
}

impl ScheduledSummary {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Outcome of a webhook-driven single-record sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SingleSync {
    Written,
    /// Held back by a conflict with a target-side edit
    Conflicted,
    /// The source no longer has the record
    NotFound,
}

/// What the writer and ledger did with one set of fetched records.
#[derive(Debug, Clone, Default)]
pub(crate) struct EntityWrite {
    pub written: usize,
    /// Records held back by a conflict
    pub held: usize,
    pub errors: Vec<String>,
}

/// A resolved conflict together with the record it settled.
#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    pub conflict: SyncConflict,
    pub status: SyncStatus,
}
