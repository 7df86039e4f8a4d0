// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batch upsert writer.
//!
//! Turns [`SourceRecord`]s into [`MirroredRecord`]s through the entity's
//! column mapping, then writes them in fixed-size batches. Each batch is an
//! upsert keyed by `source_id`, so replaying the same input leaves the
//! target unchanged apart from the overwritten fields.
//!
//! A failed batch is recorded with its row range and the remaining batches
//! still run.

pub mod mapping;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::entity::EntityType;
use crate::record::{MirroredRecord, SourceRecord};
use crate::storage::traits::TargetStore;
use mapping::mapping_for;

pub use mapping::{ColumnKind, EntityMapping};

/// One batch that did not make it into the target store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub entity: EntityType,
    /// Row range within the input, end-exclusive
    pub start: usize,
    pub end: usize,
    pub error: String,
}

impl BatchFailure {
    /// Line for a run's error list.
    #[must_use]
    pub fn describe(&self) -> String {
        format!("{} rows {}..{} failed: {}", self.entity.plural(), self.start, self.end, self.error)
    }
}

#[derive(Debug, Clone, Default)]
pub struct WriteResult {
    pub written: usize,
    /// Source ids of every row that was written
    pub written_ids: Vec<String>,
    pub failures: Vec<BatchFailure>,
    pub batches: usize,
}

impl WriteResult {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct BatchWriter {
    target: Arc<dyn TargetStore>,
    batch_size: usize,
}

impl BatchWriter {
    pub fn new(target: Arc<dyn TargetStore>, batch_size: usize) -> Self {
        Self { target, batch_size: batch_size.max(1) }
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Map source records to target rows stamped with `now`. Records of a
    /// different entity type than their mapping are never mixed: each row
    /// uses the mapping of its own `entity_type`.
    #[must_use]
    pub fn prepare(account_id: &str, records: &[SourceRecord], now: DateTime<Utc>) -> Vec<MirroredRecord> {
        records
            .iter()
            .map(|record| {
                let mapping = mapping_for(record.entity_type);
                MirroredRecord {
                    entity_type: record.entity_type,
                    source_id: record.source_id.clone(),
                    account_id: account_id.to_string(),
                    fields: mapping.map_fields(&record.attributes),
                    active: true,
                    source_updated_at: mapping.source_updated_at(&record.attributes),
                    schema_version: mapping.schema_version,
                    synced_at: now,
                    modified_at: now,
                }
            })
            .collect()
    }

    /// Write `records` in batches of `batch_size`.
    pub async fn upsert_batch(&self, entity: EntityType, records: &[MirroredRecord]) -> WriteResult {
        let mut result = WriteResult::default();

        for (index, chunk) in records.chunks(self.batch_size).enumerate() {
            let start = index * self.batch_size;
            let end = start + chunk.len();
            result.batches += 1;

            match self.target.upsert_batch(entity, chunk).await {
                Ok(_) => {
                    crate::metrics::record_batch(entity.as_str(), chunk.len());
                    debug!(entity = %entity, start, end, "Batch written");
                    result.written += chunk.len();
                    result.written_ids.extend(chunk.iter().map(|r| r.source_id.clone()));
                }
                Err(e) => {
                    crate::metrics::record_batch_failure(entity.as_str());
                    warn!(entity = %entity, start, end, error = %e, "Batch write failed, continuing");
                    result.failures.push(BatchFailure { entity, start, end, error: e.to_string() });
                }
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryStore;
    use serde_json::json;

    fn contacts(n: usize) -> Vec<SourceRecord> {
        (1..=n)
            .map(|i| {
                SourceRecord::from_value(
                    EntityType::Contact,
                    json!({"id": i, "given_name": format!("C{i}"), "email_addresses": [{"email": format!("c{i}@x")}]}),
                )
                .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_prepare_maps_fields() {
        let now = Utc::now();
        let rows = BatchWriter::prepare("acct", &contacts(2), now);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].source_id, "2");
        assert_eq!(rows[1].fields["email"], json!("c2@x"));
        assert_eq!(rows[0].account_id, "acct");
        assert_eq!(rows[0].schema_version, mapping_for(EntityType::Contact).schema_version);
        assert!(rows[0].active);
    }

    #[tokio::test]
    async fn test_batches_and_replay() {
        let store = Arc::new(InMemoryStore::new());
        let writer = BatchWriter::new(store.clone(), 100);
        let rows = BatchWriter::prepare("acct", &contacts(250), Utc::now());

        let first = writer.upsert_batch(EntityType::Contact, &rows).await;
        assert_eq!(first.batches, 3);
        assert_eq!(first.written, 250);
        assert!(first.is_clean());

        let replay = writer.upsert_batch(EntityType::Contact, &rows).await;
        assert_eq!(replay.written, 250);
        assert_eq!(store.len(), 250);
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_block_others() {
        let store = Arc::new(InMemoryStore::new());
        store.reject_writes_for(EntityType::Contact, "150");
        let writer = BatchWriter::new(store.clone(), 100);
        let rows = BatchWriter::prepare("acct", &contacts(250), Utc::now());

        let result = writer.upsert_batch(EntityType::Contact, &rows).await;
        assert_eq!(result.written, 150);
        assert_eq!(result.failures.len(), 1);
        let failure = &result.failures[0];
        assert_eq!((failure.start, failure.end), (100, 200));
        assert!(failure.describe().starts_with("contacts rows 100..200 failed"));
        assert!(!result.written_ids.contains(&"150".to_string()));
        assert_eq!(store.len(), 150);
    }
}
