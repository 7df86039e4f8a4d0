// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Ledger row types: per-record sync status, conflicts, and run log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::entity::EntityType;

/// Which way data flows for an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// Source overwrites target, no conflict checks
    #[default]
    SourceToTarget,
    TargetToSource,
    Bidirectional,
}

impl SyncDirection {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SourceToTarget => "source_to_target",
            Self::TargetToSource => "target_to_source",
            Self::Bidirectional => "bidirectional",
        }
    }

    #[must_use]
    pub const fn checks_conflicts(self) -> bool {
        matches!(self, Self::Bidirectional)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    #[default]
    None,
    Pending,
    Resolved,
}

impl ConflictStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Resolved => "resolved",
        }
    }
}

/// How a detected conflict is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    SourceWins,
    TargetWins,
    /// Leave pending until an operator picks a side
    #[default]
    Manual,
}

impl ResolutionStrategy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SourceWins => "source_wins",
            Self::TargetWins => "target_wins",
            Self::Manual => "manual",
        }
    }
}

macro_rules! string_enum {
    ($ty:ident { $($text:literal => $variant:ident),+ $(,)? }) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown {} '{}'", stringify!($ty), other)),
                }
            }
        }
    };
}

string_enum!(SyncDirection {
    "source_to_target" => SourceToTarget,
    "target_to_source" => TargetToSource,
    "bidirectional" => Bidirectional,
});
string_enum!(ConflictStatus { "none" => None, "pending" => Pending, "resolved" => Resolved });
string_enum!(ResolutionStrategy {
    "source_wins" => SourceWins,
    "target_wins" => TargetWins,
    "manual" => Manual,
});
string_enum!(RunStatus {
    "pending" => Pending,
    "fetching" => Fetching,
    "writing" => Writing,
    "completed" => Completed,
    "failed" => Failed,
});

/// One row per `(entity_type, entity_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub entity_type: EntityType,
    /// The record's source id
    pub entity_id: String,
    pub account_id: String,
    /// Never moves backwards for a given key
    pub last_synced_at: DateTime<Utc>,
    pub sync_direction: SyncDirection,
    pub conflict_status: ConflictStatus,
}

impl SyncStatus {
    #[must_use]
    pub fn key(&self) -> (EntityType, &str) {
        (self.entity_type, self.entity_id.as_str())
    }

    /// Combine with the stored row for the same key, keeping the later
    /// `last_synced_at`.
    #[must_use]
    pub fn merged_over(mut self, existing: Option<&SyncStatus>) -> Self {
        if let Some(existing) = existing {
            if existing.last_synced_at > self.last_synced_at {
                self.last_synced_at = existing.last_synced_at;
            }
        }
        self
    }
}

/// Divergence between source and target versions of one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub account_id: String,
    pub source_version: Map<String, Value>,
    pub target_version: Map<String, Value>,
    /// Columns whose values differ
    pub fields: Vec<String>,
    pub strategy: ResolutionStrategy,
    pub detected_at: DateTime<Utc>,
    /// Set exactly once; the conflict is terminal afterwards
    pub resolved_at: Option<DateTime<Utc>>,
}

impl SyncConflict {
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    /// Same pair of versions as an earlier detection.
    #[must_use]
    pub fn same_versions(&self, source: &Map<String, Value>, target: &Map<String, Value>) -> bool {
        &self.source_version == source && &self.target_version == target
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Fetching,
    Writing,
    Completed,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fetching => "fetching",
            Self::Writing => "writing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Allowed moves:
    ///
    /// ```text
    /// pending → fetching ⇄ writing → completed
    ///    └─────────┴─────────┴──────→ failed
    /// ```
    ///
    /// A run with nothing to write completes straight from `fetching`.
    #[must_use]
    pub const fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Pending, Fetching)
                | (Fetching, Writing)
                | (Writing, Fetching)
                | (Fetching, Completed)
                | (Writing, Completed)
                | (Pending, Failed)
                | (Fetching, Failed)
                | (Writing, Failed)
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid run transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: RunStatus,
    pub to: RunStatus,
}

/// Log entry for one orchestration invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: String,
    pub account_id: String,
    /// `all` or an entity plural
    pub sync_type: String,
    pub status: RunStatus,
    pub records_processed: usize,
    /// Records written per entity type
    #[serde(default)]
    pub entity_counts: BTreeMap<EntityType, usize>,
    #[serde(default)]
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SyncRun {
    pub fn start(account_id: impl Into<String>, sync_type: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: account_id.into(),
            sync_type: sync_type.into(),
            status: RunStatus::Pending,
            records_processed: 0,
            entity_counts: BTreeMap::new(),
            errors: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Move to `next`, stamping `completed_at` on terminal states.
    pub fn transition(&mut self, next: RunStatus) -> Result<(), InvalidTransition> {
        if self.status == next && !next.is_terminal() {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition { from: self.status, to: next });
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn add_written(&mut self, entity: EntityType, count: usize) {
        self.records_processed += count;
        *self.entity_counts.entry(entity).or_default() += count;
    }

    #[must_use]
    pub fn duration_ms(&self) -> Option<i64> {
        self.completed_at.map(|end| (end - self.started_at).num_milliseconds())
    }
}
