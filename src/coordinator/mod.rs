// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync orchestrator.
//!
//! The [`SyncOrchestrator`] ties the components together for one account
//! at a time:
//!
//! ```text
//! credentials → RequestGate → PageFetcher → BatchWriter → SyncLedger
//!                                                  └──→ CacheLayer (invalidate)
//! ```
//!
//! # Run lifecycle
//!
//! ```text
//! pending → fetching ⇄ writing → completed
//!              └─────────┴──────→ failed
//! ```
//!
//! Runs are serialized process-wide: the request gate is one shared quota,
//! so two runs in parallel would only contend for it.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use crm_sync::{SyncConfig, SyncOrchestrator, Stores, KeapClient, StaticCredentials, SyncType};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SyncConfig::default();
//! let api = Arc::new(KeapClient::new(&config.source_base_url, config.request_timeout())?);
//! let orchestrator = SyncOrchestrator::new(config, Stores::in_memory(), api, Arc::new(StaticCredentials));
//!
//! let run = orchestrator.run_account("acme", SyncType::All).await?;
//! println!("{} records in {:?} ms", run.records_processed, run.duration_ms());
//! # Ok(())
//! # }
//! ```

mod api;
mod run;
mod schedule;
mod types;

pub use types::{
    AccountSummary, Resolution, ScheduledSummary, SingleSync, StatusReport, SyncStatistics, TriggerResponse,
};

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::account::SyncAccount;
use crate::cache::CacheLayer;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::ledger::SyncLedger;
use crate::resilience::gate::{GateConfig, GateStats, RequestGate};
use crate::source::{CredentialProvider, PageFetcher, SourceApi};
use crate::storage::memory::{InMemoryCache, InMemoryStore};
use crate::storage::sql::SqlStore;
use crate::storage::traits::{AccountStore, CacheBackend, LedgerStore, TargetStore};
use crate::writer::BatchWriter;

/// The external stores a sync writes to.
#[derive(Clone)]
pub struct Stores {
    pub target: Arc<dyn TargetStore>,
    pub ledger: Arc<dyn LedgerStore>,
    pub accounts: Arc<dyn AccountStore>,
    pub cache: Arc<dyn CacheBackend>,
}

impl Stores {
    /// Everything in process memory.
    #[must_use]
    pub fn in_memory() -> Self {
        let store = Arc::new(InMemoryStore::new());
        Self {
            target: store.clone(),
            ledger: store.clone(),
            accounts: store,
            cache: Arc::new(InMemoryCache::new()),
        }
    }

    /// One SQL database for target, ledger and accounts.
    #[must_use]
    pub fn sql(store: Arc<SqlStore>, cache: Arc<dyn CacheBackend>) -> Self {
        Self {
            target: store.clone(),
            ledger: store.clone(),
            accounts: store,
            cache,
        }
    }
}

pub struct SyncOrchestrator {
    config: SyncConfig,
    fetcher: PageFetcher,
    writer: BatchWriter,
    ledger: SyncLedger,
    cache: CacheLayer,
    target: Arc<dyn TargetStore>,
    accounts: Arc<dyn AccountStore>,
    credentials: Arc<dyn CredentialProvider>,
    /// Held for the whole of a run
    run_lock: Mutex<()>,
}

impl SyncOrchestrator {
    pub fn new(
        config: SyncConfig,
        stores: Stores,
        api: Arc<dyn SourceApi>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        let gate_config = config.gate_config();
        Self::with_gate_config(config, gate_config, stores, api, credentials)
    }

    /// Like [`Self::new`] with explicit gate limits instead of the ones
    /// derived from `config`.
    pub fn with_gate_config(
        config: SyncConfig,
        gate: GateConfig,
        stores: Stores,
        api: Arc<dyn SourceApi>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        let gate = Arc::new(RequestGate::new(gate));
        Self {
            fetcher: PageFetcher::new(gate, api),
            writer: BatchWriter::new(stores.target.clone(), config.batch_size),
            ledger: SyncLedger::new(stores.ledger),
            cache: CacheLayer::new(stores.cache),
            target: stores.target,
            accounts: stores.accounts,
            credentials,
            run_lock: Mutex::new(()),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[must_use]
    pub fn ledger(&self) -> &SyncLedger {
        &self.ledger
    }

    #[must_use]
    pub fn cache(&self) -> &CacheLayer {
        &self.cache
    }

    #[must_use]
    pub fn gate_stats(&self) -> GateStats {
        self.fetcher.gate().stats()
    }

    /// Whether a run currently holds the run lock.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    /// Add or replace an account.
    pub async fn register_account(&self, account: SyncAccount) -> Result<(), SyncError> {
        self.accounts.upsert_account(&account).await?;
        info!(account = %account.id, "Registered sync account");
        Ok(())
    }

    pub async fn account(&self, id: &str) -> Result<SyncAccount, SyncError> {
        self.accounts
            .get_account(id)
            .await?
            .ok_or_else(|| SyncError::AccountNotFound(id.to_string()))
    }
}
