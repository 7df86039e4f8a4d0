// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity types mirrored from the source CRM.
//!
//! The set is closed: every per-type decision (endpoint path, response
//! array field, target table, column mapping) is made by looking the
//! [`EntityType`] up in a table rather than branching on strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One of the record families kept in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Contact,
    Order,
    Tag,
    Subscription,
}

impl EntityType {
    /// Processing order for a full sync. Contacts first so that orders and
    /// subscriptions referencing them land after their owners.
    pub const ALL: [EntityType; 4] = [
        EntityType::Contact,
        EntityType::Order,
        EntityType::Tag,
        EntityType::Subscription,
    ];

    /// Singular label used in logs, ledger rows and cache invalidation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Contact => "contact",
            Self::Order => "order",
            Self::Tag => "tag",
            Self::Subscription => "subscription",
        }
    }

    /// Plural label, which is also the list endpoint path segment and the
    /// name of the array field in list responses.
    #[must_use]
    pub const fn plural(self) -> &'static str {
        match self {
            Self::Contact => "contacts",
            Self::Order => "orders",
            Self::Tag => "tags",
            Self::Subscription => "subscriptions",
        }
    }

    /// Whether the source exposes a per-record detail endpoint.
    #[must_use]
    pub const fn has_detail_endpoint(self) -> bool {
        !matches!(self, Self::Tag)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown entity type '{0}'")]
pub struct UnknownEntityType(pub String);

impl FromStr for EntityType {
    type Err = UnknownEntityType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "contact" | "contacts" => Ok(Self::Contact),
            "order" | "orders" => Ok(Self::Order),
            "tag" | "tags" => Ok(Self::Tag),
            "subscription" | "subscriptions" => Ok(Self::Subscription),
            other => Err(UnknownEntityType(other.to_string())),
        }
    }
}

/// Scope of one orchestration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncType {
    #[default]
    All,
    Only(EntityType),
}

impl SyncType {
    /// Entity types covered by this run, in processing order.
    #[must_use]
    pub fn entities(self) -> Vec<EntityType> {
        match self {
            Self::All => EntityType::ALL.to_vec(),
            Self::Only(entity) => vec![entity],
        }
    }
}

impl fmt::Display for SyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Only(entity) => f.write_str(entity.plural()),
        }
    }
}

impl FromStr for SyncType {
    type Err = UnknownEntityType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }
        s.parse().map(Self::Only)
    }
}
