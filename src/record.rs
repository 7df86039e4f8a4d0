// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Records as they move through a sync.
//!
//! - [`SourceRecord`]: raw attributes pulled from the CRM, alive only
//!   between fetch and write
//! - [`MirroredRecord`]: the durable target-store row, unique per
//!   `(entity_type, source_id)`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::entity::EntityType;

#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub entity_type: EntityType,
    /// Immutable identifier assigned by the source CRM
    pub source_id: String,
    pub attributes: Value,
}

impl SourceRecord {
    /// Wrap a raw API object. Returns `None` when it has no usable `id`.
    ///
    /// Ids arrive as numbers from most endpoints and as strings from a few;
    /// both normalize to the decimal string.
    #[must_use]
    pub fn from_value(entity_type: EntityType, attributes: Value) -> Option<Self> {
        let source_id = match attributes.get("id")? {
            Value::String(s) if !s.trim().is_empty() => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        Some(Self { entity_type, source_id, attributes })
    }
}

/// A row in the target store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirroredRecord {
    pub entity_type: EntityType,
    pub source_id: String,
    pub account_id: String,
    /// Mapped columns, keyed by target column name
    pub fields: Map<String, Value>,
    /// `false` once the source signalled deletion
    pub active: bool,
    /// Source-side last-modified time, when the payload carried one
    pub source_updated_at: Option<DateTime<Utc>>,
    /// Version of the column mapping that produced `fields`
    pub schema_version: u32,
    /// Last write that came from the source
    pub synced_at: DateTime<Utc>,
    /// Last change made on the target side. Source writes leave it alone
    /// except on first insert.
    pub modified_at: DateTime<Utc>,
}

impl MirroredRecord {
    #[must_use]
    pub fn key(&self) -> (EntityType, &str) {
        (self.entity_type, self.source_id.as_str())
    }

    /// Columns whose values differ between `self` and `other`, sorted.
    #[must_use]
    pub fn diverging_fields(&self, other: &Map<String, Value>) -> Vec<String> {
        let mut names: Vec<String> = self
            .fields
            .keys()
            .chain(other.keys())
            .filter(|name| self.fields.get(*name) != other.get(*name))
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }
}
