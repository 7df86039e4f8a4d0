// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis backend for the cache layer.
//!
//! Values are plain strings (`SET key value EX ttl`). Prefix enumeration
//! uses `SCAN cursor MATCH prefix* COUNT n`, never `KEYS`, so a large
//! keyspace is walked in bounded steps. The SCAN cursor is handed straight
//! back to the caller as the [`KeyPage`] cursor.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, AsyncCommands, Client};
use std::time::Duration;

use super::traits::{CacheBackend, KeyPage, StorageError};
use crate::resilience::retry::{retry, RetryConfig, Transient};

/// Keys examined per SCAN step
const SCAN_COUNT: usize = 500;

impl Transient for redis::RedisError {
    fn is_transient(&self) -> bool {
        self.is_io_error() || self.is_timeout() || self.is_connection_dropped() || self.is_connection_refusal()
    }
}

pub struct RedisCache {
    connection: ConnectionManager,
    /// Optional namespace (e.g., "crm:" → "crm:metrics:orders")
    prefix: String,
}

impl RedisCache {
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_prefix(connection_string, None).await
    }

    /// Connect with all keys namespaced under `prefix`, for sharing a Redis
    /// instance with other applications.
    pub async fn with_prefix(connection_string: &str, prefix: Option<&str>) -> Result<Self, StorageError> {
        let client = Client::open(connection_string).map_err(|e| StorageError::Backend(e.to_string()))?;

        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;

        Ok(Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
        })
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    #[inline]
    fn strip_prefix(&self, key: String) -> String {
        match key.strip_prefix(&self.prefix) {
            Some(stripped) if !self.prefix.is_empty() => stripped.to_string(),
            _ => key,
        }
    }

    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }
}

/// Escape glob metacharacters so a literal prefix can be used in MATCH.
fn escape_glob(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len() + 2);
    for c in literal.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry("redis_get", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let value: Option<String> = conn.get(&key).await?;
                Ok(value)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);
        // EX 0 is rejected by Redis; round sub-second TTLs up
        let ttl_secs = ttl.map(|t| t.as_secs().max(1));

        retry("redis_set", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            let value = value.to_string();
            async move {
                let mut command = cmd("SET");
                command.arg(&key).arg(&value);
                if let Some(secs) = ttl_secs {
                    command.arg("EX").arg(secs);
                }
                let _: () = command.query_async(&mut conn).await?;
                Ok(())
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry("redis_delete", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let removed: u64 = conn.del(&key).await?;
                Ok(removed > 0)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn list_keys(&self, prefix: &str, cursor: u64) -> Result<KeyPage, StorageError> {
        let mut conn = self.connection.clone();
        let pattern = format!("{}*", escape_glob(&self.prefixed_key(prefix)));

        let (next, keys): (u64, Vec<String>) = cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(&pattern)
            .arg("COUNT")
            .arg(SCAN_COUNT)
            .query_async(&mut conn)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to scan cache keys: {}", e)))?;

        Ok(KeyPage {
            keys: keys.into_iter().map(|k| self.strip_prefix(k)).collect(),
            cursor: (next != 0).then_some(next),
        })
    }
}
