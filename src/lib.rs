// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # CRM Sync
//!
//! Mirrors a source CRM's contacts, orders, tags and subscriptions into a
//! relational store without exceeding the source API's rate limit.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Sync Orchestrator                      │
//! │  • Per-account runs, manual or scheduled                   │
//! │  • Run log: pending → fetching ⇄ writing → completed/failed │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Rate-Limited Request Gate                │
//! │  • Sliding one-minute window + minimum spacing             │
//! │  • Jittered exponential backoff, Retry-After on 429        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                    (offset pages, one at a time)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Batch Upsert Writer                     │
//! │  • Per-entity column mapping with fallbacks                │
//! │  • Idempotent upserts keyed by source_id                   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Sync-State Ledger                      │
//! │  • Monotonic last_synced_at per record                     │
//! │  • Conflict detection for bidirectional syncs              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                    (invalidate derived caches)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Cache Layer                         │
//! │  • TTL entries, prefix deletes, entity → namespace table   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use crm_sync::{
//!     Credentials, KeapClient, StaticCredentials, Stores, SyncAccount, SyncConfig, SyncOrchestrator, SyncType,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncConfig::from_env()?;
//!     let api = Arc::new(KeapClient::new(&config.source_base_url, config.request_timeout())?);
//!     let orchestrator = SyncOrchestrator::new(config, Stores::in_memory(), api, Arc::new(StaticCredentials));
//!
//!     orchestrator
//!         .register_account(SyncAccount::new("acme", Credentials::bearer("token")))
//!         .await?;
//!     let run = orchestrator.run_account("acme", SyncType::All).await?;
//!     println!("synced {} records", run.records_processed);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: the [`SyncOrchestrator`]
//! - [`resilience`]: request gate and retry policy
//! - [`source`]: source API client, OAuth refresh, paginated fetchers
//! - [`writer`]: column mappings and the batch upsert writer
//! - [`ledger`]: sync status, conflicts and the run log
//! - [`cache`]: derived-aggregate cache and invalidation table
//! - [`storage`]: SQL, Redis and in-memory backends
//! - [`server`]: axum trigger surface

pub mod account;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod entity;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod record;
pub mod resilience;
pub mod server;
pub mod source;
pub mod storage;
pub mod writer;

pub use account::{Credentials, SyncAccount};
pub use cache::{CacheKeys, CacheLayer, CacheNamespace, CacheTtl};
pub use config::{ConfigError, SyncConfig};
pub use coordinator::{
    ScheduledSummary, SingleSync, StatusReport, Stores, SyncOrchestrator, SyncStatistics, TriggerResponse,
};
pub use entity::{EntityType, SyncType};
pub use error::SyncError;
pub use ledger::{
    ConflictStatus, ResolutionStrategy, RunStatus, SyncConflict, SyncDirection, SyncLedger, SyncRun, SyncStatus,
};
pub use record::{MirroredRecord, SourceRecord};
pub use resilience::gate::{GateConfig, GateError, GateStats, RequestGate};
pub use resilience::retry::RetryConfig;
pub use source::{ApiError, CredentialProvider, KeapClient, OAuthRefresher, PageFetcher, SourceApi, StaticCredentials};
pub use storage::traits::{AccountStore, CacheBackend, LedgerStore, StorageError, TargetStore};
pub use writer::{BatchFailure, BatchWriter, WriteResult};
