// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache layer for derived aggregates.
//!
//! Values are JSON-encoded on top of any [`CacheBackend`]. Writes of source
//! entities invalidate the namespaces listed for that entity type in
//! [`keys::INVALIDATION`].
//!
//! ```text
//! delete_pattern("metrics:")
//!   list_keys(prefix, 0) → page → page → ... (until cursor is None)
//!   delete(k) for every collected key, up to DELETE_CONCURRENCY at once
//! ```
//!
//! Keys are collected before any are deleted so that backends with
//! offset-style cursors don't skip entries.

pub mod keys;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::entity::EntityType;
use crate::storage::traits::{CacheBackend, StorageError};
pub use keys::{namespaces_for, CacheKeys, CacheNamespace, CacheTtl, INVALIDATION};

/// Deletes in flight during a pattern delete
const DELETE_CONCURRENCY: usize = 64;

#[derive(Clone)]
pub struct CacheLayer {
    backend: Arc<dyn CacheBackend>,
}

impl CacheLayer {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    /// Decode the value at `key`. A value that no longer decodes as `T` is
    /// dropped and reported as a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let Some(raw) = self.backend.get(key).await? else {
            crate::metrics::record_cache_lookup(false);
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => {
                crate::metrics::record_cache_lookup(true);
                Ok(Some(value))
            }
            Err(e) => {
                warn!(key, error = %e, "Dropping undecodable cache entry");
                self.backend.delete(key).await?;
                crate::metrics::record_cache_lookup(false);
                Ok(None)
            }
        }
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) -> Result<(), StorageError> {
        let raw = serde_json::to_string(value)?;
        self.backend.set(key, &raw, Some(ttl)).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        self.backend.delete(key).await
    }

    /// Delete every key starting with `prefix`. Returns how many were
    /// removed.
    pub async fn delete_pattern(&self, prefix: &str) -> Result<usize, StorageError> {
        let mut keys = Vec::new();
        let mut cursor = 0;
        loop {
            let page = self.backend.list_keys(prefix, cursor).await?;
            keys.extend(page.keys);
            match page.cursor {
                Some(next) => cursor = next,
                None => break,
            }
        }
        if keys.is_empty() {
            return Ok(0);
        }

        let matched = keys.len();
        let results: Vec<Result<bool, StorageError>> = stream::iter(keys)
            .map(|key| {
                let backend = self.backend.clone();
                async move { backend.delete(&key).await }
            })
            .buffer_unordered(DELETE_CONCURRENCY)
            .collect()
            .await;

        let mut removed = 0;
        let mut first_error = None;
        for result in results {
            match result {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        crate::metrics::record_cache_invalidation(removed);
        debug!(prefix, matched, removed, "Deleted cache pattern");
        match first_error {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }

    /// Clear every namespace derived from `entity`.
    pub async fn invalidate_data_type(&self, entity: EntityType) -> Result<usize, StorageError> {
        let namespaces = namespaces_for(entity);
        let results = futures::future::join_all(namespaces.iter().map(|ns| self.delete_pattern(ns.prefix()))).await;

        let mut removed = 0;
        for result in results {
            removed += result?;
        }
        info!(entity = %entity, namespaces = namespaces.len(), removed, "Invalidated derived caches");
        Ok(removed)
    }

    /// Return the cached value, or run `producer`, cache its output, and
    /// return it. Cache failures fall back to the producer and are logged.
    pub async fn remember<T, E, F, Fut>(&self, key: &str, ttl: Duration, producer: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.get::<T>(key).await {
            Ok(Some(hit)) => return Ok(hit),
            Ok(None) => {}
            Err(e) => warn!(key, error = %e, "Cache read failed, computing value"),
        }

        let fresh = producer().await?;
        if let Err(e) = self.set(key, &fresh, ttl).await {
            warn!(key, error = %e, "Cache write failed");
        }
        Ok(fresh)
    }

    /// Record when `account_id` last finished a sync.
    pub async fn mark_last_sync(&self, account_id: &str, at: DateTime<Utc>, ttl: Duration) -> Result<(), StorageError> {
        self.set(&CacheKeys::last_sync(account_id), &at, ttl).await
    }

    pub async fn last_sync(&self, account_id: &str) -> Result<Option<DateTime<Utc>>, StorageError> {
        self.get(&CacheKeys::last_sync(account_id)).await
    }
}
