// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage backends.
//!
//! - [`sql::SqlStore`]: MySQL or SQLite target, ledger and account tables
//! - [`redis::RedisCache`]: cache backend
//! - [`memory`]: in-process versions of both for tests and dry runs

pub mod memory;
pub mod redis;
pub mod sql;
pub mod traits;

pub use memory::{InMemoryCache, InMemoryStore};
pub use traits::{AccountStore, CacheBackend, KeyPage, LedgerStore, StorageError, TargetStore};
