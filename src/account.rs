// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Source CRM tenants.
//!
//! A [`SyncAccount`] is created when a tenant is first configured and is
//! never deleted. Its credentials change only through a token refresh;
//! the cursor map and last-sync time are bookkeeping written by the
//! orchestrator after each run.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::entity::EntityType;

/// Tokens within this distance of expiry are refreshed before use.
pub const REFRESH_MARGIN_SECS: i64 = 5 * 60;

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self { access_token: access_token.into(), refresh_token: None, expires_at: None }
    }

    /// True when the token has expired or will within [`REFRESH_MARGIN_SECS`].
    /// Tokens without a known expiry are assumed valid.
    #[must_use]
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - now <= Duration::seconds(REFRESH_MARGIN_SECS),
            None => false,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncAccount {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub credentials: Credentials,
    /// Resume offset for an entity pass that did not finish; absent once
    /// a pass completes
    #[serde(default)]
    pub cursors: BTreeMap<EntityType, usize>,
    #[serde(default)]
    pub last_sync_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl SyncAccount {
    pub fn new(id: impl Into<String>, credentials: Credentials) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            credentials,
            cursors: BTreeMap::new(),
            last_sync_at: None,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn cursor(&self, entity: EntityType) -> usize {
        self.cursors.get(&entity).copied().unwrap_or(0)
    }
}
